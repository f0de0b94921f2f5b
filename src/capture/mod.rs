//! Multi-pass DOM + accessibility capture.
//!
//! One capture cycle produces a [`Snapshot`]: the merged, stably-addressed
//! view of the page spanning the main frame, same-origin iframes and OOPIFs.
//! The passes and their ordering are contract-level:
//!
//! 1. DOM walk of the main session (pierced) building the backend-id maps
//! 2. OOPIF discovery through the frame graph
//! 3. Sync of DOM-discovered iframes with event-discovered frames via the
//!    owning-iframe backend node id, then OOPIF document walks
//! 4. Accessibility trees, fetched per frame in parallel
//! 5. Scrollable-element probe per frame context
//! 6. Per-frame hierarchy build and cleaning
//! 7. Merge and text formatting
//!
//! plus an optional bounding-box/overlay pass in visual mode.

pub mod a11y;
pub mod dom;
pub mod scrollable;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;

use crate::cdp::{AxNodeData, Session, SessionKind, SessionPool};
use crate::driver::Driver;
use crate::encoded::EncodedId;
use crate::error::{Error, Result};
use crate::frames::FrameGraph;
use crate::resolver::ResolvedElement;
use crate::settle;
use crate::{EngineConfig, ObserveOptions};

/// An axis-aligned rectangle in main-viewport coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, serde::Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Rect {
        Rect {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// One iframe as assembled by the DOM walk and frame-graph sync
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IframeInfo {
    pub frame_index: u32,
    pub parent_frame_index: Option<u32>,
    /// Backend node id of the `<iframe>` element in the parent document;
    /// the bridge key to the frame graph
    pub iframe_backend_node_id: i64,
    /// Present for same-origin frames only
    pub content_document_backend_node_id: Option<i64>,
    /// XPath of the `<iframe>` element within its parent document
    pub xpath: String,
    pub src: Option<String>,
    pub name: Option<String>,
    pub sibling_position: u32,
    // Populated by the Pass-3 sync
    pub frame_id: Option<String>,
    pub execution_context_id: Option<i64>,
    pub cdp_session_id: Option<String>,
    pub absolute_bounding_box: Option<Rect>,
    pub frame_path: Option<String>,
    pub oopif: bool,
}

/// One element of the merged accessibility view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityNode {
    pub role: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub value: Option<String>,
    #[serde(rename = "backendDOMNodeId")]
    pub backend_dom_node_id: i64,
    pub children: Vec<EncodedId>,
}

/// An element layout could not provide a rectangle for
#[derive(Debug, Clone, Serialize)]
pub struct BoxFailure {
    pub encoded_id: EncodedId,
    pub reason: String,
}

/// Per-pass timings and counters for one capture cycle
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetrics {
    pub dom_walk_ms: u64,
    pub oopif_discovery_ms: u64,
    pub frame_sync_ms: u64,
    pub ax_fetch_ms: u64,
    pub scrollable_ms: u64,
    pub tree_build_ms: u64,
    pub box_collection_ms: u64,
    pub total_ms: u64,
    pub frames_captured: u32,
    pub frames_skipped: u32,
    pub retries: u32,
}

/// The output of one capture cycle.
///
/// Read-only after capture, except for `backend_node_map` (updated in place
/// by XPath recovery) and the per-snapshot resolved-element cache.
pub struct Snapshot {
    /// Formatted text tree, one listing per frame, for model consumption
    pub dom_state: String,
    pub elements: HashMap<EncodedId, AccessibilityNode>,
    pub xpath_map: HashMap<EncodedId, String>,
    backend_node_map: RwLock<HashMap<EncodedId, i64>>,
    pub frame_map: HashMap<u32, IframeInfo>,
    pub bounding_box_map: Option<HashMap<EncodedId, Rect>>,
    /// Composite overlay PNG, present in visual mode
    pub visual_overlay: Option<Vec<u8>>,
    pub box_failures: Vec<BoxFailure>,
    pub metrics: CaptureMetrics,
    pub(crate) resolved: StdMutex<HashMap<EncodedId, ResolvedElement>>,
    dirty: AtomicBool,
    taken_at: Instant,
    epoch: u64,
}

/// Everything a finished capture cycle hands to [`Snapshot::assemble`]
pub(crate) struct SnapshotParts {
    pub dom_state: String,
    pub elements: HashMap<EncodedId, AccessibilityNode>,
    pub xpath_map: HashMap<EncodedId, String>,
    pub backend_node_map: HashMap<EncodedId, i64>,
    pub frame_map: HashMap<u32, IframeInfo>,
    pub bounding_box_map: Option<HashMap<EncodedId, Rect>>,
    pub visual_overlay: Option<Vec<u8>>,
    pub box_failures: Vec<BoxFailure>,
    pub metrics: CaptureMetrics,
    pub epoch: u64,
}

impl Snapshot {
    pub(crate) fn assemble(parts: SnapshotParts) -> Snapshot {
        Snapshot {
            dom_state: parts.dom_state,
            elements: parts.elements,
            xpath_map: parts.xpath_map,
            backend_node_map: RwLock::new(parts.backend_node_map),
            frame_map: parts.frame_map,
            bounding_box_map: parts.bounding_box_map,
            visual_overlay: parts.visual_overlay,
            box_failures: parts.box_failures,
            metrics: parts.metrics,
            resolved: StdMutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            taken_at: Instant::now(),
            epoch: parts.epoch,
        }
    }

    pub fn backend_node_id(&self, id: &EncodedId) -> Option<i64> {
        self.backend_node_map.read().unwrap().get(id).copied()
    }

    /// XPath recovery rewrites the mapping once it learns the new id
    pub(crate) fn set_backend_node_id(&self, id: EncodedId, backend_node_id: i64) {
        self.backend_node_map
            .write()
            .unwrap()
            .insert(id, backend_node_id);
    }

    pub fn backend_node_map(&self) -> HashMap<EncodedId, i64> {
        self.backend_node_map.read().unwrap().clone()
    }

    pub fn xpath(&self, id: &EncodedId) -> Option<&String> {
        self.xpath_map.get(id)
    }

    pub fn contains(&self, id: &EncodedId) -> bool {
        self.elements.contains_key(id)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    /// Frame-graph invalidation epoch observed when the capture started
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("elements", &self.elements.len())
            .field("frames", &self.frame_map.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

fn ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Run a capture cycle. Transient failures (context destroyed, target
/// closed) retry up to the configured limit with a settle wait between
/// attempts; anything else fails immediately.
pub(crate) async fn capture_snapshot<D: Driver>(
    driver: &D,
    page: &str,
    graph: &FrameGraph,
    pool: &SessionPool,
    config: &EngineConfig,
    options: &ObserveOptions,
) -> Result<Snapshot> {
    let mut last_error = String::new();

    for attempt in 1..=config.capture_retries {
        match capture_once(driver, page, graph, pool, config, options).await {
            Ok(mut snapshot) => {
                snapshot.metrics.retries = attempt - 1;
                return Ok(snapshot);
            }
            Err(e) if e.is_transient() && attempt < config.capture_retries => {
                tracing::warn!("Capture attempt {} failed ({}); retrying", attempt, e);
                last_error = e.to_string();
                if let Ok(lifecycle) = pool.get(SessionKind::Lifecycle).await {
                    let _ = settle::wait_for_settled_dom(&lifecycle, config.settle_budget).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::RetryExhausted {
        attempts: config.capture_retries,
        last_error,
    })
}

async fn capture_once<D: Driver>(
    driver: &D,
    page: &str,
    graph: &FrameGraph,
    pool: &SessionPool,
    config: &EngineConfig,
    options: &ObserveOptions,
) -> Result<Snapshot> {
    let total_start = Instant::now();
    let mut metrics = CaptureMetrics::default();
    let epoch = graph.invalidation_epoch();

    graph.ensure_initialized().await?;
    let root = graph.root_session();
    if let Err(e) = root.accessibility_enable().await {
        tracing::debug!("Accessibility.enable failed: {}", e);
    }

    // Pass 1 — main-session DOM walk, pierced through same-origin iframes.
    let t = Instant::now();
    let document = root.get_document(-1, true).await?;
    let mut walk = dom::walk_document(&document, 0, 1);
    metrics.dom_walk_ms = ms(t);

    // Pass 2 — OOPIF discovery.
    let t = Instant::now();
    walk.next_frame_index = graph
        .capture_oopifs(driver, page, walk.next_frame_index)
        .await?;
    metrics.oopif_discovery_ms = ms(t);

    // Pass 3 — sync DOM-discovered iframes with the frame graph.
    let t = Instant::now();
    let mut dropped = Vec::new();
    let initial = walk.iframes.len();
    sync_range(graph, &mut walk, 0..initial, &mut dropped).await;
    propagate_drops(&walk.iframes, &mut dropped);
    metrics.frames_skipped += dropped.len() as u32;
    walk.strip_frames(&dropped);

    // OOPIF document walks run after sync so their elements carry the
    // authoritative DFS frame index.
    let oopifs: Vec<(u32, String)> = walk
        .iframes
        .iter()
        .filter(|info| info.oopif)
        .filter_map(|info| info.frame_id.clone().map(|id| (info.frame_index, id)))
        .collect();
    for (frame_index, frame_id) in oopifs {
        let mut failed = false;
        match graph.session_for(&frame_id).await {
            Ok(session) => match session.get_document(-1, false).await {
                Ok(doc) => {
                    let sub = dom::walk_document(&doc, frame_index, walk.next_frame_index);
                    let appended_from = walk.iframes.len();
                    walk.merge(sub);
                    let appended_to = walk.iframes.len();

                    let mut nested_dropped = Vec::new();
                    sync_range(graph, &mut walk, appended_from..appended_to, &mut nested_dropped)
                        .await;
                    propagate_drops(&walk.iframes, &mut nested_dropped);
                    metrics.frames_skipped += nested_dropped.len() as u32;
                    walk.strip_frames(&nested_dropped);
                }
                Err(e) => {
                    tracing::warn!("OOPIF {} document walk failed: {}", frame_id, e);
                    failed = true;
                }
            },
            Err(e) => {
                tracing::warn!("No session for OOPIF {}: {}", frame_id, e);
                failed = true;
            }
        }
        if failed {
            let mut doomed = vec![frame_index];
            propagate_drops(&walk.iframes, &mut doomed);
            metrics.frames_skipped += doomed.len() as u32;
            walk.strip_frames(&doomed);
        }
    }
    metrics.frame_sync_ms = ms(t);

    // Pass 4 — accessibility trees, fetched per frame in parallel.
    let t = Instant::now();
    let mut ax_jobs: Vec<(u32, AxJob)> = vec![(0, AxJob::Full(root.clone()))];
    let mut ax_dropped = Vec::new();
    for info in &walk.iframes {
        if info.oopif {
            let Some(frame_id) = info.frame_id.clone() else {
                ax_dropped.push(info.frame_index);
                continue;
            };
            match graph.session_for(&frame_id).await {
                Ok(session) => {
                    if let Err(e) = session.accessibility_enable().await {
                        tracing::debug!("Accessibility.enable on OOPIF failed: {}", e);
                    }
                    ax_jobs.push((info.frame_index, AxJob::Full(session)));
                }
                Err(_) => ax_dropped.push(info.frame_index),
            }
        } else {
            let Some(content_backend) = info.content_document_backend_node_id else {
                // Nested inside an OOPIF walked without pierce: no content
                // document to anchor a partial fetch on.
                ax_dropped.push(info.frame_index);
                continue;
            };
            let session = owning_session(graph, &walk.iframes, info.frame_index, root).await;
            ax_jobs.push((info.frame_index, AxJob::Partial(session, content_backend)));
        }
    }

    let ax_results = join_all(ax_jobs.into_iter().map(|(frame_index, job)| async move {
        let result = match job {
            AxJob::Full(session) => session.full_ax_tree().await,
            AxJob::Partial(session, backend) => session.partial_ax_tree(backend).await,
        };
        (frame_index, result)
    }))
    .await;

    let mut ax_trees: HashMap<u32, Vec<AxNodeData>> = HashMap::new();
    for (frame_index, result) in ax_results {
        match result {
            Ok(nodes) => {
                ax_trees.insert(frame_index, nodes);
            }
            Err(e) if frame_index == 0 => return Err(e),
            Err(e) => {
                tracing::warn!("AX fetch for frame {} failed: {}", frame_index, e);
                ax_dropped.push(frame_index);
            }
        }
    }
    propagate_drops(&walk.iframes, &mut ax_dropped);
    metrics.frames_skipped += ax_dropped.len() as u32;
    walk.strip_frames(&ax_dropped);
    metrics.ax_fetch_ms = ms(t);

    // Pass 5 — scrollable detection per frame context.
    let t = Instant::now();
    let mut probe_jobs: Vec<(Session, Option<i64>, u32)> = vec![(root.clone(), None, 0)];
    for info in &walk.iframes {
        if info.oopif {
            if let Some(frame_id) = &info.frame_id {
                if let Ok(session) = graph.session_for(frame_id).await {
                    probe_jobs.push((session, None, info.frame_index));
                }
            }
        } else if let Some(context) = info.execution_context_id {
            let session = owning_session(graph, &walk.iframes, info.frame_index, root).await;
            probe_jobs.push((session, Some(context), info.frame_index));
        } else {
            tracing::debug!(
                "Frame {} has no execution context; skipping scrollable probe",
                info.frame_index
            );
        }
    }

    let probe_results = join_all(
        probe_jobs
            .into_iter()
            .map(|(session, context, frame_index)| async move {
                scrollable::detect(&session, context, frame_index).await
            }),
    )
    .await;

    let mut scrollables: HashSet<EncodedId> = HashSet::new();
    for result in probe_results {
        match result {
            Ok(ids) => scrollables.extend(ids),
            Err(e) => tracing::debug!("Scrollable probe failed: {}", e),
        }
    }
    metrics.scrollable_ms = ms(t);

    // Passes 6 and 7 — per-frame tree build, then merge and format.
    let t = Instant::now();
    let mut frame_map: HashMap<u32, IframeInfo> = walk
        .iframes
        .iter()
        .map(|info| (info.frame_index, info.clone()))
        .collect();
    for index in frame_map.keys().copied().collect::<Vec<_>>() {
        let path = a11y::frame_path(index, &frame_map);
        if let Some(info) = frame_map.get_mut(&index) {
            info.frame_path = Some(path);
        }
    }

    let mut order: Vec<u32> = vec![0];
    let mut child_indices: Vec<u32> = frame_map.keys().copied().collect();
    child_indices.sort_unstable();
    order.extend(child_indices);

    let mut elements = HashMap::new();
    let mut listings = Vec::new();
    for frame_index in order {
        let Some(nodes) = ax_trees.get(&frame_index) else {
            continue;
        };

        // Same-origin partial fetches anchor at the frame's content
        // document; full fetches (main frame, OOPIFs) use their own root.
        let root_backend = frame_map.get(&frame_index).and_then(|info| {
            if info.oopif {
                None
            } else {
                info.content_document_backend_node_id
            }
        });
        let mut tree = a11y::build_frame_tree(
            nodes,
            frame_index,
            &walk.tag_name_map,
            &scrollables,
            root_backend,
        );
        if !a11y::has_interactive_roles(nodes) {
            tree.extend(a11y::synthesize_fallback(
                frame_index,
                &walk.tag_name_map,
                &walk.accessible_name_map,
            ));
        }

        a11y::flatten_elements(&tree, &mut elements);

        let listing = format!(
            "{}\n{}",
            a11y::frame_header(frame_index, &frame_map),
            a11y::format_frame_listing(&tree)
        );
        if options.streaming {
            tracing::debug!("Frame {} listing ready ({} bytes)", frame_index, listing.len());
        }
        listings.push(listing);
        metrics.frames_captured += 1;
    }
    let dom_state = listings.join("\n");
    metrics.tree_build_ms = ms(t);

    // Optional pass — bounding boxes and overlay (visual mode).
    let mut bounding_box_map = None;
    let mut visual_overlay = None;
    let mut box_failures = Vec::new();
    if options.visual_mode {
        #[cfg(feature = "overlay")]
        {
            let t = Instant::now();
            let (boxes, failures) =
                collect_bounding_boxes(graph, root, &mut frame_map, &walk, &elements).await;
            box_failures = failures;

            match pool.get(SessionKind::Screenshot).await {
                Ok(shot_session) => {
                    match shot_session.capture_screenshot(Some("png"), None).await {
                        Ok(png) => {
                            match crate::overlay::compose_overlay(&png, &boxes) {
                                Ok(overlay_png) => visual_overlay = Some(overlay_png),
                                Err(e) => tracing::warn!("Overlay composition failed: {}", e),
                            }
                        }
                        Err(e) => tracing::warn!("Screenshot for overlay failed: {}", e),
                    }
                }
                Err(e) => tracing::warn!("No screenshot session: {}", e),
            }
            bounding_box_map = Some(boxes);
            metrics.box_collection_ms = ms(t);
        }
        #[cfg(not(feature = "overlay"))]
        {
            tracing::warn!("visual_mode requested but the overlay feature is disabled");
        }
    }

    metrics.total_ms = ms(total_start);

    Ok(Snapshot::assemble(SnapshotParts {
        dom_state,
        elements,
        xpath_map: walk.xpath_map,
        backend_node_map: walk.backend_node_map,
        frame_map,
        bounding_box_map,
        visual_overlay,
        box_failures,
        metrics,
        epoch,
    }))
}

enum AxJob {
    Full(Session),
    Partial(Session, i64),
}

/// Pass-3 sync for a range of discovered iframes: match each against the
/// frame graph by owning backend node id, copy identifiers in, and impose
/// the DFS index on the graph. Unmatched frames are reported as dropped.
async fn sync_range(
    graph: &FrameGraph,
    walk: &mut dom::DomWalk,
    range: std::ops::Range<usize>,
    dropped: &mut Vec<u32>,
) {
    for i in range {
        let (backend, frame_index) = {
            let info = &walk.iframes[i];
            (info.iframe_backend_node_id, info.frame_index)
        };
        match graph.record_by_backend_node(backend).await {
            Some(record) => {
                graph
                    .assign_frame_index(&record.frame_id, frame_index)
                    .await;
                let info = &mut walk.iframes[i];
                info.frame_id = Some(record.frame_id);
                info.execution_context_id = record.execution_context_id;
                info.cdp_session_id = record.session_id;
                info.oopif = record.oopif;
            }
            None => {
                tracing::warn!(
                    "unmatched-frame: iframe backendNodeId {} (frame index {}) has no frame record; dropping",
                    backend,
                    frame_index
                );
                dropped.push(frame_index);
            }
        }
    }
}

/// Extend a drop set with every descendant of the dropped frames
fn propagate_drops(iframes: &[IframeInfo], dropped: &mut Vec<u32>) {
    loop {
        let mut grew = false;
        for info in iframes {
            if let Some(parent) = info.parent_frame_index {
                if dropped.contains(&parent) && !dropped.contains(&info.frame_index) {
                    dropped.push(info.frame_index);
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
    }
}

/// Session owning a frame's document: the nearest OOPIF ancestor's session,
/// or the root session when the chain reaches the main frame
async fn owning_session(
    graph: &FrameGraph,
    iframes: &[IframeInfo],
    frame_index: u32,
    root: &Session,
) -> Session {
    let by_index: HashMap<u32, &IframeInfo> =
        iframes.iter().map(|i| (i.frame_index, i)).collect();

    let mut current = frame_index;
    let mut hops = 0;
    while let Some(info) = by_index.get(&current) {
        if info.oopif {
            if let Some(frame_id) = &info.frame_id {
                if let Ok(session) = graph.session_for(frame_id).await {
                    return session;
                }
            }
            break;
        }
        match info.parent_frame_index {
            Some(parent) if parent != 0 && hops < 64 => {
                current = parent;
                hops += 1;
            }
            _ => break,
        }
    }
    root.clone()
}

/// JS helper installed once per (session, context): takes `{xpath:
/// backendNodeId}` and returns `{backendNodeId: rect}` for every xpath that
/// resolves to a laid-out element.
#[cfg(feature = "overlay")]
const COLLECT_BOXES_HELPER: &str = r#"
window.__vantageCollectBoxes || (window.__vantageCollectBoxes = function (map) {
    const out = {};
    for (const [xpath, backendId] of Object.entries(map)) {
        try {
            const el = document.evaluate(
                xpath, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null
            ).singleNodeValue;
            if (!el || !(el instanceof Element)) continue;
            const r = el.getBoundingClientRect();
            if (r.width === 0 && r.height === 0) continue;
            out[backendId] = {
                x: r.x, y: r.y, width: r.width, height: r.height,
                top: r.top, left: r.left, right: r.right, bottom: r.bottom
            };
        } catch (e) { /* element vanished mid-collection */ }
    }
    return out;
});
"#;

/// Collect viewport-absolute rectangles for every kept element, one batched
/// evaluate per frame, translating iframe-local coordinates by the ancestor
/// iframe offsets.
#[cfg(feature = "overlay")]
async fn collect_bounding_boxes(
    graph: &FrameGraph,
    root: &Session,
    frame_map: &mut HashMap<u32, IframeInfo>,
    walk: &dom::DomWalk,
    kept: &HashMap<EncodedId, AccessibilityNode>,
) -> (HashMap<EncodedId, Rect>, Vec<BoxFailure>) {
    let mut raw: HashMap<EncodedId, Rect> = HashMap::new();
    let mut failures = Vec::new();

    // Parents before children so iframe offsets exist when needed.
    let mut order: Vec<u32> = vec![0];
    let mut children: Vec<u32> = frame_map.keys().copied().collect();
    children.sort_unstable();
    order.extend(children);

    let iframes: Vec<IframeInfo> = frame_map.values().cloned().collect();

    for frame_index in order {
        let (session, context) = if frame_index == 0 {
            (root.clone(), None)
        } else {
            let Some(info) = frame_map.get(&frame_index) else {
                continue;
            };
            if info.oopif {
                let Some(frame_id) = &info.frame_id else { continue };
                let Ok(session) = graph.session_for(frame_id).await else {
                    continue;
                };
                (session, None)
            } else {
                match info.execution_context_id {
                    Some(ctx) => (
                        owning_session(graph, &iframes, frame_index, root).await,
                        Some(ctx),
                    ),
                    None => {
                        tracing::warn!(
                            "Frame {} has no execution context; skipping box collection",
                            frame_index
                        );
                        continue;
                    }
                }
            }
        };

        // Batch: every kept element of this frame, plus the iframe elements
        // hosted here (their rectangles anchor child-frame offsets).
        let mut batch: HashMap<&str, i64> = HashMap::new();
        let mut expected: Vec<EncodedId> = Vec::new();
        for id in kept.keys().filter(|id| id.frame_index == frame_index) {
            if let Some(xpath) = walk.xpath_map.get(id) {
                batch.insert(xpath.as_str(), id.backend_node_id);
                expected.push(*id);
            }
        }
        for info in &iframes {
            if info.parent_frame_index == Some(frame_index) {
                batch.insert(info.xpath.as_str(), info.iframe_backend_node_id);
            }
        }
        if batch.is_empty() {
            continue;
        }

        if let Err(e) = session
            .evaluate_in_context(COLLECT_BOXES_HELPER, context, true)
            .await
        {
            tracing::debug!("Box helper install failed for frame {}: {}", frame_index, e);
            continue;
        }

        let batch_json = match serde_json::to_string(&batch) {
            Ok(json) => json,
            Err(_) => continue,
        };
        let call = format!("window.__vantageCollectBoxes({})", batch_json);
        let rects: HashMap<String, Rect> = match session
            .evaluate_in_context(&call, context, true)
            .await
        {
            Ok(result) => result
                .result
                .value
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!("Box batch failed for frame {}: {}", frame_index, e);
                continue;
            }
        };

        // Offset of this frame's viewport within the main viewport.
        let offset = frame_offset(frame_index, frame_map);

        for (backend_str, rect) in &rects {
            let Ok(backend) = backend_str.parse::<i64>() else {
                continue;
            };
            let absolute = rect.translate(offset.0, offset.1);
            raw.insert(EncodedId::new(frame_index, backend), absolute);

            // Child iframe rectangles feed the next frames' offsets.
            for info in frame_map.values_mut() {
                if info.parent_frame_index == Some(frame_index)
                    && info.iframe_backend_node_id == backend
                {
                    info.absolute_bounding_box = Some(absolute);
                }
            }
        }

        for id in expected {
            if !raw.contains_key(&id) {
                failures.push(BoxFailure {
                    encoded_id: id,
                    reason: "no layout (hidden, detached, or zero-size)".to_string(),
                });
            }
        }
    }

    // Final map: only nodes that survived tree cleaning.
    let boxes: HashMap<EncodedId, Rect> = raw
        .into_iter()
        .filter(|(id, _)| kept.contains_key(id))
        .collect();
    (boxes, failures)
}

/// Cumulative offset of a frame's viewport, from the ancestor iframe chain
#[cfg(feature = "overlay")]
fn frame_offset(frame_index: u32, frame_map: &HashMap<u32, IframeInfo>) -> (f64, f64) {
    if frame_index == 0 {
        return (0.0, 0.0);
    }
    match frame_map
        .get(&frame_index)
        .and_then(|info| info.absolute_bounding_box)
    {
        Some(rect) => (rect.x, rect.y),
        None => (0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(frame_index: u32, parent: Option<u32>) -> IframeInfo {
        IframeInfo {
            frame_index,
            parent_frame_index: parent,
            iframe_backend_node_id: 0,
            content_document_backend_node_id: None,
            xpath: String::new(),
            src: None,
            name: None,
            sibling_position: 1,
            frame_id: None,
            execution_context_id: None,
            cdp_session_id: None,
            absolute_bounding_box: None,
            frame_path: None,
            oopif: false,
        }
    }

    #[test]
    fn drops_propagate_to_descendants() {
        let iframes = vec![info(1, Some(0)), info(2, Some(1)), info(3, Some(2)), info(4, Some(0))];
        let mut dropped = vec![1];
        propagate_drops(&iframes, &mut dropped);

        assert!(dropped.contains(&1));
        assert!(dropped.contains(&2));
        assert!(dropped.contains(&3));
        assert!(!dropped.contains(&4));
    }

    #[test]
    fn rect_center_and_translate() {
        let rect = Rect { x: 10.0, y: 20.0, width: 100.0, height: 50.0 };
        assert_eq!(rect.center(), (60.0, 45.0));

        let moved = rect.translate(5.0, -5.0);
        assert_eq!(moved.x, 15.0);
        assert_eq!(moved.y, 15.0);
        assert_eq!(moved.width, 100.0);
    }

    #[test]
    fn snapshot_dirty_flag_and_backend_updates() {
        let snapshot = Snapshot::assemble(SnapshotParts {
            dom_state: String::new(),
            elements: HashMap::new(),
            xpath_map: HashMap::new(),
            backend_node_map: HashMap::from([(EncodedId::new(0, 5), 5)]),
            frame_map: HashMap::new(),
            bounding_box_map: None,
            visual_overlay: None,
            box_failures: Vec::new(),
            metrics: CaptureMetrics::default(),
            epoch: 0,
        });

        assert!(!snapshot.is_dirty());
        snapshot.mark_dirty();
        assert!(snapshot.is_dirty());

        assert_eq!(snapshot.backend_node_id(&EncodedId::new(0, 5)), Some(5));
        snapshot.set_backend_node_id(EncodedId::new(0, 5), 99);
        assert_eq!(snapshot.backend_node_id(&EncodedId::new(0, 5)), Some(99));
    }
}
