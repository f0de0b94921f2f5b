//! Pass 5 — scrollable element detection.
//!
//! A one-shot probe evaluated in each frame's context finds elements with
//! genuinely scrollable overflow (the probe nudges `scrollTop` to verify),
//! orders them by `scrollHeight` descending and reports their XPaths. Each
//! XPath is then resolved back to a backend node id so Pass 6 can decorate
//! roles.

use std::collections::HashSet;

use crate::cdp::Session;
use crate::encoded::EncodedId;
use crate::error::Result;

/// Probe script: returns XPaths of scrollable elements, largest first.
/// The `scrollTop` nudge is observable by scroll listeners; it is restored
/// immediately.
const PROBE: &str = r#"
(() => {
    const xpathFor = (el) => {
        const segments = [];
        let current = el;
        while (current && current.nodeType === 1) {
            const tag = current.localName;
            let index = 1;
            let sibling = current.previousElementSibling;
            while (sibling) {
                if (sibling.localName === tag) index++;
                sibling = sibling.previousElementSibling;
            }
            segments.unshift(tag + '[' + index + ']');
            current = current.parentElement;
        }
        return '/' + segments.join('/');
    };

    const found = [];
    for (const el of document.querySelectorAll('*')) {
        if (el.scrollHeight <= el.clientHeight + 1) continue;
        const style = getComputedStyle(el);
        const overflow = style.overflowY;
        const candidate = overflow === 'auto' || overflow === 'scroll'
            || el === document.scrollingElement;
        if (!candidate) continue;

        const before = el.scrollTop;
        el.scrollTop = before + 1;
        const moved = el.scrollTop !== before;
        el.scrollTop = before;
        if (!moved) continue;

        found.push(el);
    }
    found.sort((a, b) => b.scrollHeight - a.scrollHeight);
    return found.map(xpathFor);
})()
"#;

/// Detect scrollable elements in one frame and resolve them to encoded ids.
///
/// `context_id` addresses the frame's JS world; `None` targets the session's
/// default context (the main frame, or an OOPIF on its own session).
pub async fn detect(
    session: &Session,
    context_id: Option<i64>,
    frame_index: u32,
) -> Result<HashSet<EncodedId>> {
    let result = session.evaluate_in_context(PROBE, context_id, true).await?;

    let xpaths: Vec<String> = result
        .result
        .value
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    let mut ids = HashSet::new();
    for xpath in xpaths {
        match resolve_xpath(session, context_id, &xpath).await {
            Ok(Some(backend_node_id)) => {
                ids.insert(EncodedId::new(frame_index, backend_node_id));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("Scrollable xpath {} did not resolve: {}", xpath, e);
            }
        }
    }
    Ok(ids)
}

/// Evaluate an XPath in the frame's context and read the node's backend id
async fn resolve_xpath(
    session: &Session,
    context_id: Option<i64>,
    xpath: &str,
) -> Result<Option<i64>> {
    let expression = format!(
        "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
        serde_json::to_string(xpath)?
    );

    let result = session
        .evaluate_in_context(&expression, context_id, false)
        .await?;

    let Some(object_id) = result.result.object_id else {
        return Ok(None);
    };

    let node = session.describe_object(&object_id).await?;
    if node.backend_node_id == 0 {
        return Ok(None);
    }
    Ok(Some(node.backend_node_id))
}
