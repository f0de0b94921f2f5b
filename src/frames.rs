//! Frame Graph & context manager.
//!
//! The authoritative, event-synchronized view of a page's frame tree: which
//! frames exist, which CDP session routes to each, which execution context
//! belongs to each, and which `<iframe>` element owns each child frame. Four
//! identifier spaces (frame ids, backend node ids, session ids, execution
//! context ids) arrive from independent CDP domains and events; the graph is
//! where they are reconciled.
//!
//! The only reliable bridge between an event-discovered frame and a
//! DOM-discovered `<iframe>` element is `DOM.getFrameOwner`; URL correlation
//! is never used for matching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::cdp::{
    CdpEvent, PageFrameAttachedEvent, PageFrameDetachedEvent, PageFrameNavigatedEvent,
    RuntimeExecutionContextCreatedEvent, RuntimeExecutionContextDestroyedEvent, Session,
};
use crate::driver::Driver;
use crate::error::{Error, Result};

/// One frame known to the graph
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRecord {
    pub frame_id: String,
    pub parent_frame_id: Option<String>,
    /// Preliminary until Pass-3 sync imposes DFS order; root is always 0
    pub frame_index: Option<u32>,
    pub loader_id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    /// Session routing to this frame; the root session for same-origin frames
    pub session_id: Option<String>,
    /// Default JS world for this frame
    pub execution_context_id: Option<i64>,
    /// Backend node id of the owning `<iframe>` element in the parent document
    pub backend_node_id: Option<i64>,
    /// Reached through its own target/session
    pub oopif: bool,
    #[serde(skip_serializing)]
    pub last_updated: Instant,
}

impl FrameRecord {
    fn new(frame_id: impl Into<String>) -> Self {
        Self {
            frame_id: frame_id.into(),
            parent_frame_id: None,
            frame_index: None,
            loader_id: None,
            name: None,
            url: None,
            session_id: None,
            execution_context_id: None,
            backend_node_id: None,
            oopif: false,
            last_updated: Instant::now(),
        }
    }
}

struct GraphState {
    initialized: bool,
    frames: HashMap<String, FrameRecord>,
    /// Dedicated sessions for OOPIF frames, keyed by frame id
    oopif_sessions: HashMap<String, Session>,
    /// Execution-context ids seen, for reverse lookup on destroy events
    context_frames: HashMap<i64, String>,
    /// Waiters parked in `wait_for_execution_context`
    context_waiters: HashMap<String, Vec<oneshot::Sender<i64>>>,
    next_preliminary_index: u32,
}

impl GraphState {
    fn record_context(&mut self, frame_id: &str, context_id: i64) {
        self.context_frames.insert(context_id, frame_id.to_string());
        if let Some(record) = self.frames.get_mut(frame_id) {
            record.execution_context_id = Some(context_id);
            record.last_updated = Instant::now();
        }
        if let Some(waiters) = self.context_waiters.remove(frame_id) {
            for waiter in waiters {
                let _ = waiter.send(context_id);
            }
        }
    }

    fn clear_context(&mut self, context_id: i64) {
        if let Some(frame_id) = self.context_frames.remove(&context_id) {
            if let Some(record) = self.frames.get_mut(&frame_id) {
                if record.execution_context_id == Some(context_id) {
                    record.execution_context_id = None;
                    record.last_updated = Instant::now();
                }
            }
        }
    }

    /// Remove a frame and all its descendants; returns the detached sessions
    fn remove_subtree(&mut self, frame_id: &str) -> Vec<Session> {
        let mut doomed = vec![frame_id.to_string()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            for (id, record) in &self.frames {
                if record.parent_frame_id.as_deref() == Some(parent.as_str())
                    && !doomed.contains(id)
                {
                    doomed.push(id.clone());
                }
            }
            i += 1;
        }

        let mut sessions = Vec::new();
        for id in doomed {
            if let Some(record) = self.frames.remove(&id) {
                if let Some(ctx) = record.execution_context_id {
                    self.context_frames.remove(&ctx);
                }
            }
            self.context_waiters.remove(&id);
            if let Some(session) = self.oopif_sessions.remove(&id) {
                sessions.push(session);
            }
        }
        sessions
    }
}

/// Live map of frames, sessions, and execution contexts for one page
pub struct FrameGraph {
    root: Session,
    state: Arc<Mutex<GraphState>>,
    /// Bumped on every frame attach/navigate/detach and page load; snapshot
    /// caches compare against it to detect invalidation
    invalidation: Arc<AtomicU64>,
    /// URL substrings recognizing ad/tracking frames to skip during OOPIF
    /// discovery
    deny_list: Vec<String>,
    pump: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FrameGraph {
    pub fn new(root: Session, deny_list: Vec<String>) -> Self {
        Self {
            root,
            state: Arc::new(Mutex::new(GraphState {
                initialized: false,
                frames: HashMap::new(),
                oopif_sessions: HashMap::new(),
                context_frames: HashMap::new(),
                context_waiters: HashMap::new(),
                next_preliminary_index: 0,
            })),
            invalidation: Arc::new(AtomicU64::new(0)),
            deny_list,
            pump: std::sync::Mutex::new(None),
        }
    }

    /// The page's root session
    pub fn root_session(&self) -> &Session {
        &self.root
    }

    /// Counter bumped on every event that invalidates cached snapshots
    pub fn invalidation_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.invalidation)
    }

    pub fn invalidation_epoch(&self) -> u64 {
        self.invalidation.load(Ordering::SeqCst)
    }

    /// Idempotent initialization: enumerate the current frame tree, look up
    /// frame owners, attach event subscriptions, enable `Page` and `Runtime`
    /// on the root session.
    pub async fn ensure_initialized(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.initialized {
                return Ok(());
            }
        }

        // Subscribe before enabling domains so no event is missed.
        let transport = self.root.transport();
        let frame_attached = transport.subscribe("Page.frameAttached").await;
        let frame_navigated = transport.subscribe("Page.frameNavigated").await;
        let frame_detached = transport.subscribe("Page.frameDetached").await;
        let ctx_created = transport.subscribe("Runtime.executionContextCreated").await;
        let ctx_destroyed = transport
            .subscribe("Runtime.executionContextDestroyed")
            .await;
        let ctx_cleared = transport.subscribe("Runtime.executionContextsCleared").await;
        let load_fired = transport.subscribe("Page.loadEventFired").await;

        self.root.page_enable().await?;
        self.root.runtime_enable().await?;

        let tree = self.root.get_frame_tree().await?;

        {
            let mut state = self.state.lock().await;
            if state.initialized {
                return Ok(());
            }

            // Breadth-first preliminary indices; root = 0
            let mut queue = vec![(tree.clone(), None::<String>)];
            while !queue.is_empty() {
                let (node, parent) = queue.remove(0);
                let index = state.next_preliminary_index;
                state.next_preliminary_index += 1;

                let mut record = FrameRecord::new(&node.frame.id);
                record.parent_frame_id = parent.clone().or(node.frame.parent_id.clone());
                record.frame_index = Some(index);
                record.loader_id = node.frame.loader_id.clone();
                record.name = node.frame.name.clone();
                record.url = Some(node.frame.url.clone());
                record.session_id = Some(self.root.session_id().to_string());
                state.frames.insert(node.frame.id.clone(), record);

                for child in node.child_frames {
                    queue.push((child, Some(node.frame.id.clone())));
                }
            }
            state.initialized = true;
        }

        // Owner lookup for every non-root frame. May fail for the main frame
        // and for frames detached mid-enumeration; failures are swallowed.
        let non_root: Vec<String> = {
            let state = self.state.lock().await;
            state
                .frames
                .values()
                .filter(|r| r.parent_frame_id.is_some())
                .map(|r| r.frame_id.clone())
                .collect()
        };
        for frame_id in non_root {
            match self.root.get_frame_owner(&frame_id).await {
                Ok(backend_node_id) => {
                    let mut state = self.state.lock().await;
                    if let Some(record) = state.frames.get_mut(&frame_id) {
                        record.backend_node_id = Some(backend_node_id);
                        record.last_updated = Instant::now();
                    }
                }
                Err(e) => {
                    tracing::debug!("DOM.getFrameOwner failed for {}: {}", frame_id, e);
                }
            }
        }

        // Event pump: drains the subscriptions and keeps the graph current.
        let handle = tokio::spawn(Self::pump_events(
            Arc::clone(&self.state),
            Arc::clone(&self.invalidation),
            self.root.clone(),
            PumpChannels {
                frame_attached,
                frame_navigated,
                frame_detached,
                ctx_created,
                ctx_destroyed,
                ctx_cleared,
                load_fired,
            },
        ));
        *self.pump.lock().unwrap() = Some(handle);

        tracing::debug!("Frame graph initialized for target {}", self.root.target_id());
        Ok(())
    }

    async fn pump_events(
        state: Arc<Mutex<GraphState>>,
        invalidation: Arc<AtomicU64>,
        root: Session,
        mut channels: PumpChannels,
    ) {
        loop {
            tokio::select! {
                event = channels.frame_attached.recv() => {
                    let Some(event) = event else { break };
                    Self::on_frame_attached(&state, &invalidation, &root, event).await;
                }
                event = channels.frame_navigated.recv() => {
                    let Some(event) = event else { break };
                    Self::on_frame_navigated(&state, &invalidation, event).await;
                }
                event = channels.frame_detached.recv() => {
                    let Some(event) = event else { break };
                    Self::on_frame_detached(&state, &invalidation, event).await;
                }
                event = channels.ctx_created.recv() => {
                    let Some(event) = event else { break };
                    Self::on_context_created(&state, event).await;
                }
                event = channels.ctx_destroyed.recv() => {
                    let Some(event) = event else { break };
                    Self::on_context_destroyed(&state, event).await;
                }
                event = channels.ctx_cleared.recv() => {
                    let Some(_) = event else { break };
                    let mut guard = state.lock().await;
                    let ids: Vec<i64> = guard.context_frames.keys().copied().collect();
                    for id in ids {
                        guard.clear_context(id);
                    }
                }
                event = channels.load_fired.recv() => {
                    let Some(_) = event else { break };
                    invalidation.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        tracing::debug!("Frame graph event pump ended");
    }

    async fn on_frame_attached(
        state: &Arc<Mutex<GraphState>>,
        invalidation: &Arc<AtomicU64>,
        root: &Session,
        event: CdpEvent,
    ) {
        let Ok(parsed) = serde_json::from_value::<PageFrameAttachedEvent>(event.params) else {
            return;
        };

        {
            let mut guard = state.lock().await;
            let index = guard.next_preliminary_index;
            guard.next_preliminary_index += 1;

            let record = guard
                .frames
                .entry(parsed.frame_id.clone())
                .or_insert_with(|| FrameRecord::new(&parsed.frame_id));
            record.parent_frame_id = parsed.parent_frame_id.clone();
            if record.frame_index.is_none() {
                record.frame_index = Some(index);
            }
            if record.session_id.is_none() {
                record.session_id = event.session_id.clone();
            }
            record.last_updated = Instant::now();
        }
        invalidation.fetch_add(1, Ordering::SeqCst);

        // Bridge to the owning <iframe> element in the parent document.
        match root.get_frame_owner(&parsed.frame_id).await {
            Ok(backend_node_id) => {
                let mut guard = state.lock().await;
                if let Some(record) = guard.frames.get_mut(&parsed.frame_id) {
                    record.backend_node_id = Some(backend_node_id);
                }
            }
            Err(e) => {
                tracing::debug!("DOM.getFrameOwner failed for {}: {}", parsed.frame_id, e);
            }
        }
    }

    async fn on_frame_navigated(
        state: &Arc<Mutex<GraphState>>,
        invalidation: &Arc<AtomicU64>,
        event: CdpEvent,
    ) {
        let Ok(parsed) = serde_json::from_value::<PageFrameNavigatedEvent>(event.params) else {
            return;
        };
        {
            let mut guard = state.lock().await;
            let record = guard
                .frames
                .entry(parsed.frame.id.clone())
                .or_insert_with(|| FrameRecord::new(&parsed.frame.id));
            record.url = Some(parsed.frame.url.clone());
            record.name = parsed.frame.name.clone();
            record.loader_id = parsed.frame.loader_id.clone();
            if record.parent_frame_id.is_none() {
                record.parent_frame_id = parsed.frame.parent_id.clone();
            }
            record.last_updated = Instant::now();
        }
        invalidation.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_frame_detached(
        state: &Arc<Mutex<GraphState>>,
        invalidation: &Arc<AtomicU64>,
        event: CdpEvent,
    ) {
        let Ok(parsed) = serde_json::from_value::<PageFrameDetachedEvent>(event.params) else {
            return;
        };
        let sessions = {
            let mut guard = state.lock().await;
            guard.remove_subtree(&parsed.frame_id)
        };
        invalidation.fetch_add(1, Ordering::SeqCst);

        for session in sessions {
            if let Err(e) = session.detach().await {
                tracing::debug!("Detach of OOPIF session failed: {}", e);
            }
        }
    }

    async fn on_context_created(state: &Arc<Mutex<GraphState>>, event: CdpEvent) {
        let Ok(parsed) =
            serde_json::from_value::<RuntimeExecutionContextCreatedEvent>(event.params)
        else {
            return;
        };
        let Some(aux) = parsed.context.aux_data else {
            return;
        };
        let is_default = aux.is_default || aux.r#type.as_deref() == Some("default");
        let Some(frame_id) = aux.frame_id else {
            return;
        };
        if !is_default {
            return;
        }

        let mut guard = state.lock().await;
        if guard.frames.contains_key(&frame_id) {
            guard.record_context(&frame_id, parsed.context.id);
        }
    }

    async fn on_context_destroyed(state: &Arc<Mutex<GraphState>>, event: CdpEvent) {
        let Ok(parsed) =
            serde_json::from_value::<RuntimeExecutionContextDestroyedEvent>(event.params)
        else {
            return;
        };
        let mut guard = state.lock().await;
        guard.clear_context(parsed.execution_context_id);
    }

    /// Discover out-of-process iframes: every driver-reported frame that is
    /// not the main frame and has no session yet gets a child-session attach
    /// attempt. Success classifies the frame as an OOPIF; failure means the
    /// frame is same-origin and already covered by the main-session DOM walk.
    ///
    /// Returns the next unassigned frame index.
    pub async fn capture_oopifs<D: Driver>(
        &self,
        driver: &D,
        page: &str,
        start_index: u32,
    ) -> Result<u32> {
        let descriptors = driver.frames(page).await?;

        let candidates: Vec<_> = {
            let state = self.state.lock().await;
            descriptors
                .into_iter()
                .filter(|d| !d.is_main())
                .filter(|d| {
                    if self.deny_list.iter().any(|pat| d.url.contains(pat)) {
                        tracing::debug!("Skipping ad/tracking frame: {}", d.url);
                        return false;
                    }
                    // Already routed: either registered as an OOPIF or
                    // covered by the root session's walk.
                    !state
                        .frames
                        .values()
                        .any(|r| r.session_id.is_some() && r.url.as_deref() == Some(d.url.as_str()))
                })
                .collect()
        };

        // Session creation is the costly step; attempts run in parallel.
        let attempts = futures::future::join_all(candidates.iter().map(|descriptor| async {
            let session = driver.frame_session(page, descriptor).await.ok()?;
            if session.page_enable().await.is_err() {
                return None;
            }
            let tree = session.get_frame_tree().await.ok()?;
            Some((descriptor.clone(), session, tree.frame))
        }))
        .await;

        let mut next_index = start_index;
        for (descriptor, session, frame) in attempts.into_iter().flatten() {
            tracing::debug!("OOPIF detected: {} ({})", frame.id, descriptor.url);

            {
                let mut state = self.state.lock().await;
                let record = state
                    .frames
                    .entry(frame.id.clone())
                    .or_insert_with(|| FrameRecord::new(&frame.id));
                let already_registered = record.oopif;
                record.url = Some(if frame.url.is_empty() {
                    descriptor.url.clone()
                } else {
                    frame.url.clone()
                });
                record.name = descriptor.name.clone();
                record.oopif = true;
                record.session_id = Some(session.session_id().to_string());
                if !already_registered {
                    // Any event-driven preliminary index is superseded here;
                    // Pass-3 sync may overwrite again with the DFS value.
                    record.frame_index = Some(next_index);
                    next_index += 1;
                }
                record.last_updated = Instant::now();
                state.oopif_sessions.insert(frame.id.clone(), session);
            }

            // The owning <iframe> element lives in the parent document, so
            // the lookup goes through the root session.
            match self.root.get_frame_owner(&frame.id).await {
                Ok(backend_node_id) => {
                    let mut state = self.state.lock().await;
                    if let Some(record) = state.frames.get_mut(&frame.id) {
                        record.backend_node_id = Some(backend_node_id);
                    }
                }
                Err(e) => {
                    tracing::debug!("DOM.getFrameOwner failed for OOPIF {}: {}", frame.id, e);
                }
            }
        }

        Ok(next_index)
    }

    /// Authoritative frame-index overwrite, imposed by the DFS-order DOM walk.
    /// Any other frame currently holding the index is moved to a fresh
    /// preliminary index so uniqueness is preserved.
    pub async fn assign_frame_index(&self, frame_id: &str, index: u32) {
        let mut state = self.state.lock().await;

        let colliding: Option<String> = state
            .frames
            .values()
            .find(|r| r.frame_index == Some(index) && r.frame_id != frame_id)
            .map(|r| r.frame_id.clone());
        if let Some(other) = colliding {
            let bumped = state.next_preliminary_index;
            state.next_preliminary_index += 1;
            if let Some(record) = state.frames.get_mut(&other) {
                record.frame_index = Some(bumped);
            }
        }

        if let Some(record) = state.frames.get_mut(frame_id) {
            record.frame_index = Some(index);
            record.last_updated = Instant::now();
        }
    }

    /// Wait until the frame's default execution context is registered, or
    /// return `None` after the timeout
    pub async fn wait_for_execution_context(
        &self,
        frame_id: &str,
        timeout: Duration,
    ) -> Option<i64> {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(record) = state.frames.get(frame_id) {
                if let Some(ctx) = record.execution_context_id {
                    return Some(ctx);
                }
            }
            let (tx, rx) = oneshot::channel();
            state
                .context_waiters
                .entry(frame_id.to_string())
                .or_default()
                .push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ctx)) => Some(ctx),
            _ => None,
        }
    }

    /// Look up a record by frame id
    pub async fn record(&self, frame_id: &str) -> Option<FrameRecord> {
        let state = self.state.lock().await;
        state.frames.get(frame_id).cloned()
    }

    /// Look up a record by the backend node id of its owning `<iframe>`
    pub async fn record_by_backend_node(&self, backend_node_id: i64) -> Option<FrameRecord> {
        let state = self.state.lock().await;
        state
            .frames
            .values()
            .find(|r| r.backend_node_id == Some(backend_node_id))
            .cloned()
    }

    /// Look up a record by frame index
    pub async fn record_by_index(&self, index: u32) -> Option<FrameRecord> {
        let state = self.state.lock().await;
        state
            .frames
            .values()
            .find(|r| r.frame_index == Some(index))
            .cloned()
    }

    /// Session routing to a frame: the OOPIF's own session when it has one,
    /// the root session otherwise
    pub async fn session_for(&self, frame_id: &str) -> Result<Session> {
        let state = self.state.lock().await;
        if let Some(session) = state.oopif_sessions.get(frame_id) {
            return Ok(session.clone());
        }
        if state.frames.contains_key(frame_id) {
            return Ok(self.root.clone());
        }
        Err(Error::FrameNotFound(frame_id.to_string()))
    }

    /// Snapshot of every record, for diagnostics and `frames.json`
    pub async fn dump(&self) -> Vec<FrameRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.frames.values().cloned().collect();
        records.sort_by_key(|r| (r.frame_index.unwrap_or(u32::MAX), r.frame_id.clone()));
        records
    }

    /// Detach owned sessions and stop the event pump. Idempotent.
    pub async fn close(&self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }

        let sessions: Vec<Session> = {
            let mut state = self.state.lock().await;
            state.context_waiters.clear();
            state.oopif_sessions.drain().map(|(_, s)| s).collect()
        };
        let results = futures::future::join_all(sessions.iter().map(|s| s.detach())).await;
        for result in results {
            if let Err(e) = result {
                tracing::debug!("Detach of OOPIF session failed on close: {}", e);
            }
        }
    }
}

struct PumpChannels {
    frame_attached: mpsc::Receiver<CdpEvent>,
    frame_navigated: mpsc::Receiver<CdpEvent>,
    frame_detached: mpsc::Receiver<CdpEvent>,
    ctx_created: mpsc::Receiver<CdpEvent>,
    ctx_destroyed: mpsc::Receiver<CdpEvent>,
    ctx_cleared: mpsc::Receiver<CdpEvent>,
    load_fired: mpsc::Receiver<CdpEvent>,
}
