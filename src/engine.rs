//! Engine public surface.
//!
//! One [`Engine`] serves many pages. Per page it owns a root session, the
//! frame graph, the pooled sessions, the snapshot cache and an action mutex
//! (the engine assumes a single in-flight action per page). `close(page)`
//! tears all of it down and is idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;
use tokio::sync::Mutex;

use crate::actions::{self, Action, ActionOutcome, METHODS};
use crate::capture::{self, Snapshot};
use crate::cdp::{Session, SessionKind, SessionPool};
use crate::driver::Driver;
use crate::encoded::EncodedId;
use crate::error::{Error, Result};
use crate::frames::FrameGraph;
use crate::llm::{self, ElementMatch, LlmClient};
use crate::resolver;
use crate::settle::{self, SettleOutcome};
use crate::{EngineConfig, ObserveOptions};

/// Future returned by a registered custom action
pub type CustomActionFuture = Pin<Box<dyn Future<Output = Result<ActionOutcome>> + Send>>;

/// A caller-registered action handler, invoked for method names outside the
/// closed CDP set
pub type CustomAction = Arc<dyn Fn(CustomActionInvocation) -> CustomActionFuture + Send + Sync>;

/// What a custom action handler receives
#[derive(Debug, Clone)]
pub struct CustomActionInvocation {
    pub page: String,
    pub encoded_id: Option<String>,
    pub arguments: Vec<String>,
}

struct CachedSnapshot {
    snapshot: Arc<Snapshot>,
}

struct PageHandle {
    page: String,
    graph: Arc<FrameGraph>,
    pool: SessionPool,
    cache: Mutex<Option<CachedSnapshot>>,
    /// Capture-and-act serialization; the engine is not reentrant per page
    action_lock: Mutex<()>,
    debug_dir: StdMutex<Option<PathBuf>>,
    step: AtomicU64,
}

impl PageHandle {
    fn new(page: &str, session: Session, config: &EngineConfig) -> Self {
        let pool = SessionPool::new(Arc::clone(session.transport()), session.target_id());
        let graph = Arc::new(FrameGraph::new(session, config.frame_deny_list.clone()));
        Self {
            page: page.to_string(),
            graph,
            pool,
            cache: Mutex::new(None),
            action_lock: Mutex::new(()),
            debug_dir: StdMutex::new(None),
            step: AtomicU64::new(0),
        }
    }

    fn debug_dir(&self) -> Option<PathBuf> {
        self.debug_dir.lock().unwrap().clone()
    }
}

/// Frame-aware observation and action dispatch over one browser driver
pub struct Engine<D: Driver> {
    driver: D,
    config: EngineConfig,
    pages: Mutex<HashMap<String, Arc<PageHandle>>>,
    custom_actions: StdMutex<HashMap<String, CustomAction>>,
}

impl<D: Driver> Engine<D> {
    pub fn new(driver: D, config: EngineConfig) -> Self {
        Self {
            driver,
            config,
            pages: Mutex::new(HashMap::new()),
            custom_actions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(driver: D) -> Self {
        Self::new(driver, EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an extra action name routed to a caller closure. The closed
    /// CDP method set cannot be shadowed.
    pub fn register_action(&self, name: impl Into<String>, action: CustomAction) -> Result<()> {
        let name = name.into();
        if METHODS.contains(&name.as_str()) {
            return Err(Error::BadRequest(format!(
                "cannot shadow built-in method {}",
                name
            )));
        }
        self.custom_actions.lock().unwrap().insert(name, action);
        Ok(())
    }

    /// Names of registered custom actions, for the agent envelope schema
    pub fn custom_action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom_actions.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    async fn handle(&self, page: &str) -> Result<Arc<PageHandle>> {
        {
            let pages = self.pages.lock().await;
            if let Some(handle) = pages.get(page) {
                return Ok(Arc::clone(handle));
            }
        }

        let session = self.driver.page_session(page).await?;
        let mut detached = session
            .transport()
            .subscribe("Target.detachedFromTarget")
            .await;
        let handle = Arc::new(PageHandle::new(page, session, &self.config));

        // Detached sessions invalidate pooled references; the pool
        // re-acquires lazily on the next use.
        let weak = Arc::downgrade(&handle);
        tokio::spawn(async move {
            while detached.recv().await.is_some() {
                let Some(handle) = weak.upgrade() else { break };
                handle.pool.invalidate().await;
            }
        });

        let mut pages = self.pages.lock().await;
        let entry = pages
            .entry(page.to_string())
            .or_insert_with(|| Arc::clone(&handle));
        Ok(Arc::clone(entry))
    }

    /// Produce (or serve from cache) the page's snapshot.
    ///
    /// A cached snapshot is served only when it is clean, younger than the
    /// configured ceiling, and no frame event has fired since its capture.
    pub async fn observe(&self, page: &str, options: &ObserveOptions) -> Result<Arc<Snapshot>> {
        let handle = self.handle(page).await?;
        *handle.debug_dir.lock().unwrap() = options.debug_dir.clone();

        if options.use_cache {
            let cache = handle.cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                let current_epoch = handle.graph.invalidation_epoch();
                let fresh = !cached.snapshot.is_dirty()
                    && cached.snapshot.age() <= self.config.cache_max_age
                    && cached.snapshot.epoch() == current_epoch;
                if fresh {
                    tracing::debug!("Serving cached snapshot for {}", page);
                    return Ok(Arc::clone(&cached.snapshot));
                }
                // Crossed an invalidation: never serve it again.
                cached.snapshot.mark_dirty();
            }
        }

        let snapshot = Arc::new(
            capture::capture_snapshot(
                &self.driver,
                page,
                &handle.graph,
                &handle.pool,
                &self.config,
                options,
            )
            .await?,
        );

        {
            let mut cache = handle.cache.lock().await;
            *cache = Some(CachedSnapshot {
                snapshot: Arc::clone(&snapshot),
            });
        }

        if let Some(dir) = &options.debug_dir {
            if let Err(e) = self.write_capture_artifacts(dir, &handle, &snapshot).await {
                tracing::warn!("Failed to write debug artifacts: {}", e);
            }
        }

        Ok(snapshot)
    }

    /// Ask the model to select an element and method for an instruction
    pub async fn find_element(
        &self,
        instruction: &str,
        snapshot: &Snapshot,
        llm: &dyn LlmClient,
    ) -> Result<Option<ElementMatch>> {
        llm::find_element(llm, instruction, snapshot).await
    }

    /// Execute one action against a snapshot element.
    ///
    /// Structural problems (bad id, unknown method, frame not in graph) are
    /// errors; execution failures come back as `{ok: false, message}`.
    /// The snapshot is marked dirty before control returns for every action
    /// that ran.
    pub async fn execute_action(
        &self,
        page: &str,
        snapshot: &Snapshot,
        encoded_id: &str,
        method: &str,
        arguments: &[String],
    ) -> Result<ActionOutcome> {
        self.execute_action_with_vars(page, snapshot, encoded_id, method, arguments, &HashMap::new())
            .await
    }

    /// Like [`execute_action`](Self::execute_action), with `%VAR%`
    /// placeholder substitution applied to the arguments first
    pub async fn execute_action_with_vars(
        &self,
        page: &str,
        snapshot: &Snapshot,
        encoded_id: &str,
        method: &str,
        arguments: &[String],
        variables: &HashMap<String, String>,
    ) -> Result<ActionOutcome> {
        let handle = self.handle(page).await?;
        let _serialized = handle.action_lock.lock().await;

        let arguments = if variables.is_empty() {
            arguments.to_vec()
        } else {
            actions::substitute_variables(arguments, variables)
        };

        // Custom actions are routed before the closed-set validation.
        if !METHODS.contains(&method) {
            let custom = self.custom_actions.lock().unwrap().get(method).cloned();
            if let Some(custom) = custom {
                let outcome = custom(CustomActionInvocation {
                    page: page.to_string(),
                    encoded_id: Some(encoded_id.to_string()),
                    arguments,
                })
                .await?;
                snapshot.mark_dirty();
                return Ok(outcome);
            }
        }

        let encoded: EncodedId = encoded_id.parse()?;
        let action = Action::parse(method, &arguments)?;

        let result = self.dispatch(&handle, snapshot, encoded, &action).await;

        match result {
            Ok(()) => {
                let settle_outcome = if action.is_mutating() {
                    self.settle(&handle).await
                } else {
                    None
                };
                snapshot.mark_dirty();

                let message = match &settle_outcome {
                    Some(outcome) => format!(
                        "{} performed on {} (settle: {:?} after {}ms)",
                        method, encoded, outcome.reason, outcome.waited_ms
                    ),
                    None => format!("{} performed on {}", method, encoded),
                };
                let outcome = ActionOutcome::ok(message);
                self.write_step_output(&handle, encoded_id, method, &arguments, &outcome, settle_outcome.as_ref());
                Ok(outcome)
            }
            Err(e) if is_structural(&e) => Err(e),
            Err(e) => {
                snapshot.mark_dirty();
                let outcome = ActionOutcome::failed(format!(
                    "{} failed on {}: {}",
                    method, encoded_id, e
                ));
                self.write_step_output(&handle, encoded_id, method, &arguments, &outcome, None);
                Ok(outcome)
            }
        }
    }

    async fn dispatch(
        &self,
        handle: &PageHandle,
        snapshot: &Snapshot,
        encoded: EncodedId,
        action: &Action,
    ) -> Result<()> {
        if self.config.cdp_actions && snapshot.backend_node_id(&encoded).is_some() {
            let element = resolver::resolve(
                &handle.graph,
                snapshot,
                encoded,
                self.config.context_wait,
            )
            .await?;
            let snapshot_box = snapshot
                .bounding_box_map
                .as_ref()
                .and_then(|map| map.get(&encoded));
            actions::dispatch(&element, action, snapshot_box).await
        } else {
            // Locator-style fallback: same method set, driven by XPath in
            // the frame's context.
            let xpath = snapshot
                .xpath(&encoded)
                .ok_or_else(|| Error::ElementNotFound(encoded.to_string()))?
                .clone();

            let (session, context) = if encoded.frame_index == 0 {
                (handle.graph.root_session().clone(), None)
            } else {
                let info = snapshot
                    .frame_map
                    .get(&encoded.frame_index)
                    .ok_or_else(|| {
                        Error::FrameNotFound(format!("frame index {}", encoded.frame_index))
                    })?;
                let frame_id = info.frame_id.clone().ok_or_else(|| {
                    Error::FrameNotFound(format!("frame index {}", encoded.frame_index))
                })?;
                let session = handle.graph.session_for(&frame_id).await?;
                let context = if info.oopif {
                    None
                } else {
                    info.execution_context_id
                };
                (session, context)
            };

            actions::dispatch_fallback(&session, context, &xpath, action).await
        }
    }

    async fn settle(&self, handle: &PageHandle) -> Option<SettleOutcome> {
        match handle.pool.get(SessionKind::Lifecycle).await {
            Ok(lifecycle) => {
                match settle::wait_for_settled_dom(&lifecycle, self.config.settle_budget).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        tracing::debug!("Settle wait failed: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                tracing::debug!("No lifecycle session for settle: {}", e);
                None
            }
        }
    }

    /// Drop the page's cached snapshot and mark it dirty
    pub async fn invalidate(&self, page: &str) {
        let pages = self.pages.lock().await;
        if let Some(handle) = pages.get(page) {
            let mut cache = handle.cache.lock().await;
            if let Some(cached) = cache.take() {
                cached.snapshot.mark_dirty();
            }
        }
    }

    /// Dispose the page's sessions and registry entries. Idempotent.
    pub async fn close(&self, page: &str) {
        let handle = {
            let mut pages = self.pages.lock().await;
            pages.remove(page)
        };
        let Some(handle) = handle else {
            return;
        };

        if let Some(cached) = handle.cache.lock().await.take() {
            cached.snapshot.mark_dirty();
        }
        handle.graph.close().await;
        handle.pool.close_all().await;
        tracing::debug!("Closed page {}", page);
    }

    async fn write_capture_artifacts(
        &self,
        dir: &PathBuf,
        handle: &PageHandle,
        snapshot: &Snapshot,
    ) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        std::fs::write(dir.join("elems.txt"), &snapshot.dom_state)?;

        let frames = handle.graph.dump().await;
        std::fs::write(
            dir.join("frames.json"),
            serde_json::to_vec_pretty(&frames)?,
        )?;

        let metrics = &snapshot.metrics;
        std::fs::write(
            dir.join("perf.json"),
            serde_json::to_vec_pretty(&json!({
                "totalMs": metrics.total_ms,
                "passes": {
                    "domWalk": metrics.dom_walk_ms,
                    "oopifDiscovery": metrics.oopif_discovery_ms,
                    "frameSync": metrics.frame_sync_ms,
                    "axFetch": metrics.ax_fetch_ms,
                    "scrollable": metrics.scrollable_ms,
                    "treeBuild": metrics.tree_build_ms,
                    "boxCollection": metrics.box_collection_ms,
                },
            }))?,
        )?;

        std::fs::write(
            dir.join("dom-capture-metrics.json"),
            serde_json::to_vec_pretty(&json!({
                "metrics": metrics,
                "boxFailures": snapshot.box_failures,
            }))?,
        )?;

        if let Some(overlay) = &snapshot.visual_overlay {
            std::fs::write(dir.join("screenshot.png"), overlay)?;
        }

        Ok(())
    }

    fn write_step_output(
        &self,
        handle: &PageHandle,
        encoded_id: &str,
        method: &str,
        arguments: &[String],
        outcome: &ActionOutcome,
        settle: Option<&SettleOutcome>,
    ) {
        let Some(dir) = handle.debug_dir() else {
            return;
        };
        let step = handle.step.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = json!({
            "step": step,
            "page": handle.page,
            "encodedId": encoded_id,
            "method": method,
            "arguments": arguments,
            "outcome": outcome,
            "settle": settle,
        });
        if let Ok(bytes) = serde_json::to_vec_pretty(&payload) {
            if let Err(e) = std::fs::write(dir.join("stepOutput.json"), bytes) {
                tracing::debug!("Failed to write stepOutput.json: {}", e);
            }
        }
    }
}

/// Structural errors surface as bad-request and are never converted into an
/// `{ok: false}` outcome
fn is_structural(error: &Error) -> bool {
    matches!(
        error,
        Error::BadEncodedId(_)
            | Error::BadRequest(_)
            | Error::FrameNotFound(_)
            | Error::ElementNotFound(_)
            | Error::PageClosed(_)
            | Error::Serialization(_)
            | Error::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_are_not_action_outcomes() {
        assert!(is_structural(&Error::BadEncodedId("x".into())));
        assert!(is_structural(&Error::BadRequest("nope".into())));
        assert!(is_structural(&Error::FrameNotFound("7".into())));
        assert!(!is_structural(&Error::Timeout("slow".into())));
        assert!(!is_structural(&Error::StaleElement {
            encoded_id: "2-9".into()
        }));
        assert!(!is_structural(&Error::cdp("Input.dispatchMouseEvent", -1, "boom")));
    }
}
