//! Element resolution.
//!
//! Turns an [`EncodedId`] into a live `(session, frame, backendNode,
//! objectId)` tuple. A backend node id goes stale whenever the element is
//! recreated; the recovery path re-finds the element through its captured
//! XPath in the frame's execution context and rewrites the snapshot's
//! backend-node mapping in place. Exactly one recovery attempt is made.

use std::time::Duration;

use crate::capture::Snapshot;
use crate::cdp::Session;
use crate::encoded::EncodedId;
use crate::error::{Error, Result};
use crate::frames::FrameGraph;

/// A resolved, actionable element reference
#[derive(Debug, Clone)]
pub struct ResolvedElement {
    pub session: Session,
    pub frame_id: Option<String>,
    pub backend_node_id: i64,
    pub object_id: String,
}

/// Resolve an encoded id against a snapshot.
///
/// `context_wait` bounds the wait for the frame's execution context during
/// XPath recovery (750 ms by default).
pub async fn resolve(
    graph: &FrameGraph,
    snapshot: &Snapshot,
    encoded_id: EncodedId,
    context_wait: Duration,
) -> Result<ResolvedElement> {
    // Route to the frame's session.
    let (session, frame_id, oopif) = locate_frame(graph, snapshot, encoded_id).await?;

    // Per-snapshot cache, valid while the backend mapping is unchanged.
    {
        let cache = snapshot.resolved.lock().unwrap();
        if let Some(cached) = cache.get(&encoded_id) {
            if snapshot.backend_node_id(&encoded_id) == Some(cached.backend_node_id) {
                return Ok(cached.clone());
            }
        }
    }

    let backend_node_id = snapshot
        .backend_node_id(&encoded_id)
        .ok_or_else(|| Error::ElementNotFound(encoded_id.to_string()))?;

    let object_id = match session.resolve_backend_node(backend_node_id).await {
        Ok(object_id) => object_id,
        Err(e) if e.is_node_missing() => {
            tracing::debug!(
                "Backend node {} stale for {}; attempting XPath recovery",
                backend_node_id,
                encoded_id
            );
            recover_via_xpath(
                graph,
                snapshot,
                &session,
                frame_id.as_deref(),
                oopif,
                encoded_id,
                context_wait,
            )
            .await?
        }
        Err(e) => return Err(e),
    };

    let backend_node_id = snapshot
        .backend_node_id(&encoded_id)
        .unwrap_or(backend_node_id);
    let resolved = ResolvedElement {
        session,
        frame_id,
        backend_node_id,
        object_id,
    };

    snapshot
        .resolved
        .lock()
        .unwrap()
        .insert(encoded_id, resolved.clone());
    Ok(resolved)
}

/// Find the session and frame id for an encoded id's frame index
async fn locate_frame(
    graph: &FrameGraph,
    snapshot: &Snapshot,
    encoded_id: EncodedId,
) -> Result<(Session, Option<String>, bool)> {
    if encoded_id.frame_index == 0 {
        let frame_id = graph.record_by_index(0).await.map(|r| r.frame_id);
        return Ok((graph.root_session().clone(), frame_id, false));
    }

    let info = snapshot.frame_map.get(&encoded_id.frame_index);
    let frame_id = match info.and_then(|i| i.frame_id.clone()) {
        Some(frame_id) => frame_id,
        None => graph
            .record_by_index(encoded_id.frame_index)
            .await
            .map(|r| r.frame_id)
            .ok_or_else(|| {
                Error::FrameNotFound(format!("frame index {}", encoded_id.frame_index))
            })?,
    };

    let session = graph.session_for(&frame_id).await?;
    let oopif = info.map(|i| i.oopif).unwrap_or(false);
    Ok((session, Some(frame_id), oopif))
}

/// Re-find the element by XPath, update the backend mapping, and resolve the
/// fresh backend node id
async fn recover_via_xpath(
    graph: &FrameGraph,
    snapshot: &Snapshot,
    session: &Session,
    frame_id: Option<&str>,
    oopif: bool,
    encoded_id: EncodedId,
    context_wait: Duration,
) -> Result<String> {
    let xpath = snapshot
        .xpath(&encoded_id)
        .ok_or_else(|| Error::ElementNotFound(encoded_id.to_string()))?
        .clone();

    // The main frame and OOPIFs evaluate in their session's default context;
    // same-origin iframes need the frame-specific context id.
    let context_id = if encoded_id.frame_index == 0 || oopif {
        None
    } else {
        let frame_id = frame_id.ok_or_else(|| {
            Error::FrameNotFound(format!("frame index {}", encoded_id.frame_index))
        })?;
        match graph.wait_for_execution_context(frame_id, context_wait).await {
            Some(ctx) => Some(ctx),
            None => {
                return Err(Error::FrameNotReady {
                    frame_id: frame_id.to_string(),
                })
            }
        }
    };

    let expression = format!(
        "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
        serde_json::to_string(&xpath)?
    );
    let evaluated = session
        .evaluate_in_context(&expression, context_id, false)
        .await?;

    let Some(found_object) = evaluated.result.object_id else {
        return Err(Error::StaleElement {
            encoded_id: encoded_id.to_string(),
        });
    };

    let node = session.describe_object(&found_object).await?;
    if node.backend_node_id == 0 {
        return Err(Error::StaleElement {
            encoded_id: encoded_id.to_string(),
        });
    }

    snapshot.set_backend_node_id(encoded_id, node.backend_node_id);
    tracing::debug!(
        "Recovered {} via XPath: new backend node {}",
        encoded_id,
        node.backend_node_id
    );

    session.resolve_backend_node(node.backend_node_id).await
}
