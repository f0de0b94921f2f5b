//! CDP Connection/Session Management
//!
//! `Connection` wraps the browser-level endpoint; `Session` is a flattened
//! CDP session attached to one target, with typed wrappers for the commands
//! the engine uses. `SessionPool` hands out purpose-scoped sessions (DOM
//! walking, screenshots, lifecycle watching) attached to the same page target
//! so heavyweight domains never collide on one session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use super::transport::Transport;
use super::types::*;
use crate::error::{Error, Result};

/// Object group used for remote objects held by the engine
const OBJECT_GROUP: &str = "vantage";

/// A CDP connection to a browser endpoint
pub struct Connection {
    transport: Arc<Transport>,
}

impl Connection {
    /// Connect to a DevTools WebSocket URL
    pub fn connect(ws_url: &str) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(Transport::connect(ws_url)?),
        })
    }

    /// Create a connection wrapping an existing transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Get a reference to the transport
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Get all targets (pages, iframes, workers)
    pub async fn targets(&self) -> Result<Vec<TargetInfo>> {
        let result: TargetGetTargetsResult = self
            .transport
            .send("Target.getTargets", &TargetGetTargets {})
            .await?;
        Ok(result.target_infos)
    }

    /// Attach to a target and get a flattened session
    pub async fn attach(&self, target_id: &str) -> Result<Session> {
        let result: TargetAttachToTargetResult = self
            .transport
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: target_id.to_string(),
                    flatten: Some(true),
                },
            )
            .await?;

        Ok(Session {
            transport: Arc::clone(&self.transport),
            session_id: result.session_id,
            target_id: target_id.to_string(),
        })
    }

    /// Close the underlying transport
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// A CDP session attached to a specific target
#[derive(Clone)]
pub struct Session {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("target_id", &self.target_id)
            .finish()
    }
}

impl Session {
    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Get the underlying transport
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Send a command to this session
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.transport
            .send_to_session(&self.session_id, method, params)
            .await
    }

    /// Send a command to this session with an explicit deadline
    pub async fn send_with_deadline<C, R>(
        &self,
        method: &str,
        params: &C,
        deadline: Duration,
    ) -> Result<R>
    where
        C: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.transport
            .send_with_deadline(Some(&self.session_id), method, params, deadline)
            .await
    }

    /// Detach this session from its target
    pub async fn detach(&self) -> Result<()> {
        self.transport
            .send::<_, serde_json::Value>(
                "Target.detachFromTarget",
                &TargetDetachFromTarget {
                    session_id: self.session_id.clone(),
                },
            )
            .await?;
        Ok(())
    }

    // === Domain enables ===

    pub async fn page_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>("Page.enable", &PageEnable {})
            .await?;
        Ok(())
    }

    pub async fn runtime_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>("Runtime.enable", &RuntimeEnable {})
            .await?;
        Ok(())
    }

    pub async fn accessibility_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>("Accessibility.enable", &AccessibilityEnable {})
            .await?;
        Ok(())
    }

    pub async fn network_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Network.enable",
            &NetworkEnable {
                max_post_data_size: None,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn network_disable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>("Network.disable", &NetworkDisable {})
            .await?;
        Ok(())
    }

    // === Page ===

    /// Get the frame tree
    pub async fn get_frame_tree(&self) -> Result<FrameTree> {
        let result: PageGetFrameTreeResult =
            self.send("Page.getFrameTree", &PageGetFrameTree {}).await?;
        Ok(result.frame_tree)
    }

    /// Capture a screenshot, decoded from base64
    pub async fn capture_screenshot(
        &self,
        format: Option<&str>,
        quality: Option<u8>,
    ) -> Result<Vec<u8>> {
        let result: PageCaptureScreenshotResult = self
            .send(
                "Page.captureScreenshot",
                &PageCaptureScreenshot {
                    format: format.map(String::from),
                    quality,
                },
            )
            .await?;

        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&result.data)
            .map_err(|e| Error::Decode(e.to_string()))?;
        Ok(bytes)
    }

    // === DOM ===

    /// Get the full document tree
    pub async fn get_document(&self, depth: i32, pierce: bool) -> Result<DomNode> {
        let result: DomGetDocumentResult = self
            .send(
                "DOM.getDocument",
                &DomGetDocument {
                    depth: Some(depth),
                    pierce: Some(pierce),
                },
            )
            .await?;
        Ok(result.root)
    }

    /// Describe a node by remote object id
    pub async fn describe_object(&self, object_id: &str) -> Result<DomNode> {
        let result: DomDescribeNodeResult = self
            .send(
                "DOM.describeNode",
                &DomDescribeNode {
                    backend_node_id: None,
                    object_id: Some(object_id.to_string()),
                    depth: None,
                },
            )
            .await?;
        Ok(result.node)
    }

    /// Resolve a backend node id to a Runtime remote object id
    pub async fn resolve_backend_node(&self, backend_node_id: i64) -> Result<String> {
        let result: DomResolveNodeResult = self
            .send(
                "DOM.resolveNode",
                &DomResolveNode {
                    backend_node_id: Some(backend_node_id),
                    object_group: Some(OBJECT_GROUP.to_string()),
                    execution_context_id: None,
                },
            )
            .await?;
        result.object.object_id.ok_or_else(|| Error::Cdp {
            method: "DOM.resolveNode".to_string(),
            code: -1,
            message: "No objectId returned".to_string(),
        })
    }

    /// Look up the `<iframe>` element owning a frame
    pub async fn get_frame_owner(&self, frame_id: &str) -> Result<i64> {
        let result: DomGetFrameOwnerResult = self
            .send(
                "DOM.getFrameOwner",
                &DomGetFrameOwner {
                    frame_id: frame_id.to_string(),
                },
            )
            .await?;
        Ok(result.backend_node_id)
    }

    /// Scroll an element into view if needed
    pub async fn scroll_into_view(&self, backend_node_id: i64) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "DOM.scrollIntoViewIfNeeded",
            &DomScrollIntoViewIfNeeded {
                backend_node_id: Some(backend_node_id),
            },
        )
        .await?;
        Ok(())
    }

    /// Get the box model for an element by backend node id
    pub async fn get_box_model(&self, backend_node_id: i64) -> Result<BoxModel> {
        let result: DomGetBoxModelResult = self
            .send(
                "DOM.getBoxModel",
                &DomGetBoxModel {
                    backend_node_id: Some(backend_node_id),
                },
            )
            .await?;
        Ok(result.model)
    }

    /// Focus an element by backend node id
    pub async fn focus(&self, backend_node_id: i64) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "DOM.focus",
            &DomFocus {
                backend_node_id: Some(backend_node_id),
            },
        )
        .await?;
        Ok(())
    }

    // === Accessibility ===

    /// Fetch the complete accessibility tree for this target
    pub async fn full_ax_tree(&self) -> Result<Vec<AxNodeData>> {
        let result: AccessibilityTreeResult = self
            .send(
                "Accessibility.getFullAXTree",
                &AccessibilityGetFullAxTree { depth: None },
            )
            .await?;
        Ok(result.nodes)
    }

    /// Fetch the accessibility subtree rooted at a backend node
    pub async fn partial_ax_tree(&self, backend_node_id: i64) -> Result<Vec<AxNodeData>> {
        let result: AccessibilityTreeResult = self
            .send(
                "Accessibility.getPartialAXTree",
                &AccessibilityGetPartialAxTree {
                    backend_node_id,
                    fetch_relatives: Some(true),
                },
            )
            .await?;
        Ok(result.nodes)
    }

    // === Runtime ===

    /// Evaluate an expression, optionally addressed to a specific context
    pub async fn evaluate_in_context(
        &self,
        expression: &str,
        context_id: Option<i64>,
        return_by_value: bool,
    ) -> Result<RuntimeEvaluateResult> {
        let result: RuntimeEvaluateResult = self
            .send(
                "Runtime.evaluate",
                &RuntimeEvaluate {
                    expression: expression.to_string(),
                    context_id,
                    object_group: if return_by_value {
                        None
                    } else {
                        Some(OBJECT_GROUP.to_string())
                    },
                    return_by_value: Some(return_by_value),
                    await_promise: Some(true),
                },
            )
            .await?;

        if let Some(exception) = &result.exception_details {
            return Err(Error::CdpSimple(format!(
                "JavaScript error: {} at {}:{}",
                exception.text, exception.line_number, exception.column_number
            )));
        }
        Ok(result)
    }

    /// Evaluate an expression in the default context and return its value
    pub async fn evaluate(&self, expression: &str) -> Result<RuntimeEvaluateResult> {
        self.evaluate_in_context(expression, None, true).await
    }

    /// Call a function with `this` bound to a remote object
    pub async fn call_function_on(
        &self,
        object_id: &str,
        function_declaration: &str,
        arguments: Vec<CallArgument>,
    ) -> Result<RuntimeCallFunctionOnResult> {
        let result: RuntimeCallFunctionOnResult = self
            .send(
                "Runtime.callFunctionOn",
                &RuntimeCallFunctionOn {
                    function_declaration: function_declaration.to_string(),
                    object_id: Some(object_id.to_string()),
                    execution_context_id: None,
                    arguments: if arguments.is_empty() {
                        None
                    } else {
                        Some(arguments)
                    },
                    silent: None,
                    return_by_value: Some(true),
                    await_promise: Some(true),
                },
            )
            .await?;

        if let Some(exception) = &result.exception_details {
            return Err(Error::CdpSimple(format!(
                "JavaScript error: {} at {}:{}",
                exception.text, exception.line_number, exception.column_number
            )));
        }
        Ok(result)
    }

    // === Input ===

    pub async fn dispatch_mouse_event(
        &self,
        event_type: MouseEventType,
        x: f64,
        y: f64,
        button: Option<MouseButton>,
        click_count: Option<i32>,
    ) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Input.dispatchMouseEvent",
            &InputDispatchMouseEvent {
                r#type: event_type,
                x,
                y,
                button,
                click_count,
                delta_x: None,
                delta_y: None,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn dispatch_key_event(&self, event: InputDispatchKeyEvent) -> Result<()> {
        self.send::<_, serde_json::Value>("Input.dispatchKeyEvent", &event)
            .await?;
        Ok(())
    }

    /// Insert text at the current cursor position
    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Input.insertText",
            &InputInsertText {
                text: text.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

/// Purpose of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// DOM/accessibility traversal
    Dom,
    /// Screenshot capture
    Screenshot,
    /// Network lifecycle watching (DOM settle)
    Lifecycle,
}

/// Pool of purpose-scoped sessions attached to one page target.
///
/// Sessions are created lazily and reused across calls. On detach the pooled
/// reference is invalidated and the next `get` re-attaches.
pub struct SessionPool {
    transport: Arc<Transport>,
    target_id: String,
    slots: Mutex<HashMap<SessionKind, Session>>,
}

impl SessionPool {
    pub fn new(transport: Arc<Transport>, target_id: impl Into<String>) -> Self {
        Self {
            transport,
            target_id: target_id.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or lazily create) the pooled session of the given kind
    pub async fn get(&self, kind: SessionKind) -> Result<Session> {
        let mut slots = self.slots.lock().await;
        if let Some(session) = slots.get(&kind) {
            return Ok(session.clone());
        }

        let result: TargetAttachToTargetResult = self
            .transport
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: self.target_id.clone(),
                    flatten: Some(true),
                },
            )
            .await?;

        let session = Session {
            transport: Arc::clone(&self.transport),
            session_id: result.session_id,
            target_id: self.target_id.clone(),
        };
        tracing::debug!(
            "Pooled {:?} session attached: {}",
            kind,
            session.session_id()
        );
        slots.insert(kind, session.clone());
        Ok(session)
    }

    /// Drop all pooled references; they are re-acquired lazily
    pub async fn invalidate(&self) {
        let mut slots = self.slots.lock().await;
        slots.clear();
    }

    /// Detach every pooled session in parallel. Failures are logged, not
    /// propagated: this runs on page close when sessions may already be gone.
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, s)| s).collect()
        };

        let results = join_all(sessions.iter().map(|s| s.detach())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!("Detach of pooled session {} failed: {}", session.session_id(), e);
            }
        }
    }
}
