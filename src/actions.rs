//! Action catalog and dispatch.
//!
//! The method set is closed and normative: twelve element operations,
//! represented as a tagged enum with per-variant parameter shape. Validation
//! happens at the boundary (`Action::parse`); a single executor switches on
//! the tag and drives CDP Input/Runtime/DOM primitives. A fallback executor
//! implements the same set through XPath-driven script evaluation for
//! callers that disable CDP dispatch.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::capture::Rect;
use crate::cdp::{CallArgument, InputDispatchKeyEvent, KeyEventType, MouseButton, MouseEventType, Session};
use crate::error::{Error, Result};
use crate::resolver::ResolvedElement;

/// The closed method set callers (including the LLM) may request
pub const METHODS: [&str; 12] = [
    "click",
    "fill",
    "type",
    "press",
    "selectOptionFromDropdown",
    "check",
    "uncheck",
    "hover",
    "scrollToElement",
    "scrollToPercentage",
    "nextChunk",
    "prevChunk",
];

/// Budget for the click event sequence
pub const CLICK_BUDGET: Duration = Duration::from_millis(3500);

/// Budget for smooth-scroll position stability
const SCROLL_STABILITY_BUDGET: Duration = Duration::from_millis(5000);

/// A validated element operation
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Click,
    Fill { value: String },
    Type { text: String, press_enter: bool },
    Press { key: String },
    SelectOptionFromDropdown { option: String },
    Check,
    Uncheck,
    Hover,
    ScrollToElement,
    ScrollToPercentage { percent: f64 },
    NextChunk,
    PrevChunk,
}

impl Action {
    /// Validate a (method, arguments) pair from the boundary.
    ///
    /// Unknown methods and malformed arguments are `BadRequest`; they are
    /// never retried.
    pub fn parse(method: &str, args: &[String]) -> Result<Self> {
        let first = || -> Result<&String> {
            args.first()
                .ok_or_else(|| Error::BadRequest(format!("{} requires an argument", method)))
        };

        match method {
            "click" => Ok(Action::Click),
            "fill" => Ok(Action::Fill {
                value: first()?.clone(),
            }),
            "type" => {
                let press_enter = args
                    .get(1)
                    .map(|flag| flag.eq_ignore_ascii_case("true") || flag == "Enter")
                    .unwrap_or(false);
                Ok(Action::Type {
                    text: first()?.clone(),
                    press_enter,
                })
            }
            "press" => Ok(Action::Press {
                key: first()?.clone(),
            }),
            "selectOptionFromDropdown" => Ok(Action::SelectOptionFromDropdown {
                option: first()?.clone(),
            }),
            "check" => Ok(Action::Check),
            "uncheck" => Ok(Action::Uncheck),
            "hover" => Ok(Action::Hover),
            "scrollToElement" => Ok(Action::ScrollToElement),
            "scrollToPercentage" => {
                let raw = first()?;
                let percent: f64 = raw
                    .trim()
                    .trim_end_matches('%')
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("bad percentage: {}", raw)))?;
                Ok(Action::ScrollToPercentage {
                    percent: percent.clamp(0.0, 100.0),
                })
            }
            "nextChunk" => Ok(Action::NextChunk),
            "prevChunk" => Ok(Action::PrevChunk),
            other => Err(Error::BadRequest(format!("unknown method: {}", other))),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::Fill { .. } => "fill",
            Action::Type { .. } => "type",
            Action::Press { .. } => "press",
            Action::SelectOptionFromDropdown { .. } => "selectOptionFromDropdown",
            Action::Check => "check",
            Action::Uncheck => "uncheck",
            Action::Hover => "hover",
            Action::ScrollToElement => "scrollToElement",
            Action::ScrollToPercentage { .. } => "scrollToPercentage",
            Action::NextChunk => "nextChunk",
            Action::PrevChunk => "prevChunk",
        }
    }

    /// Methods that can change the DOM and therefore require a settle wait
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Action::Click
                | Action::Fill { .. }
                | Action::Type { .. }
                | Action::Press { .. }
                | Action::SelectOptionFromDropdown { .. }
                | Action::Check
                | Action::Uncheck
        )
    }
}

/// Compact result reported for every action
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub ok: bool,
    pub message: String,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Replace `%VAR%` placeholders in action arguments
pub fn substitute_variables(args: &[String], variables: &HashMap<String, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut current = arg.clone();
            for (key, value) in variables {
                current = current.replace(&format!("%{}%", key), value);
            }
            current
        })
        .collect()
}

/// Key metadata for `Input.dispatchKeyEvent`
fn key_definition(key: &str) -> (String, Option<String>, Option<String>, Option<i32>) {
    let (code, text, vkey) = match key {
        "Enter" => (Some("Enter"), Some("\r"), Some(13)),
        "Tab" => (Some("Tab"), None, Some(9)),
        "Escape" => (Some("Escape"), None, Some(27)),
        "Backspace" => (Some("Backspace"), None, Some(8)),
        "Delete" => (Some("Delete"), None, Some(46)),
        "ArrowUp" => (Some("ArrowUp"), None, Some(38)),
        "ArrowDown" => (Some("ArrowDown"), None, Some(40)),
        "ArrowLeft" => (Some("ArrowLeft"), None, Some(37)),
        "ArrowRight" => (Some("ArrowRight"), None, Some(39)),
        "Home" => (Some("Home"), None, Some(36)),
        "End" => (Some("End"), None, Some(35)),
        "PageUp" => (Some("PageUp"), None, Some(33)),
        "PageDown" => (Some("PageDown"), None, Some(34)),
        " " | "Space" => (Some("Space"), Some(" "), Some(32)),
        _ => (None, None, None),
    };

    let text = text
        .map(String::from)
        .or_else(|| (key.chars().count() == 1).then(|| key.to_string()));
    (
        key.to_string(),
        code.map(String::from),
        text,
        vkey,
    )
}

async fn press_key(session: &Session, key: &str) -> Result<()> {
    let (key, code, text, vkey) = key_definition(key);

    session
        .dispatch_key_event(InputDispatchKeyEvent {
            r#type: KeyEventType::KeyDown,
            key: Some(key.clone()),
            code: code.clone(),
            text,
            windows_virtual_key_code: vkey,
            modifiers: None,
        })
        .await?;
    session
        .dispatch_key_event(InputDispatchKeyEvent {
            r#type: KeyEventType::KeyUp,
            key: Some(key),
            code,
            text: None,
            windows_virtual_key_code: vkey,
            modifiers: None,
        })
        .await?;
    Ok(())
}

/// Click point for pointer methods: the snapshot's bounding box when it has
/// one, otherwise the center of the live box model's border quad
async fn click_point(element: &ResolvedElement, snapshot_box: Option<&Rect>) -> Result<(f64, f64)> {
    if let Some(rect) = snapshot_box {
        if !rect.is_empty() {
            return Ok(rect.center());
        }
    }

    let model = element
        .session
        .get_box_model(element.backend_node_id)
        .await
        .map_err(|e| {
            if e.is_no_layout() {
                Error::NotInteractable {
                    encoded_id: element.backend_node_id.to_string(),
                    reason: "not rendered (no box model)".to_string(),
                }
            } else {
                e
            }
        })?;
    Ok(model.center())
}

/// Poll `scrollTop` until three consecutive samples move less than a pixel,
/// or the stability budget elapses
async fn wait_scroll_stable(element: &ResolvedElement) -> Result<()> {
    const PROBE: &str = r#"function() {
        const tag = this.tagName ? this.tagName.toLowerCase() : '';
        const target = (tag === 'html' || tag === 'body')
            ? (document.scrollingElement || document.documentElement)
            : this;
        return target.scrollTop;
    }"#;

    let start = Instant::now();
    let mut last: Option<f64> = None;
    let mut stable_samples = 0u32;

    while start.elapsed() < SCROLL_STABILITY_BUDGET {
        let result = element
            .session
            .call_function_on(&element.object_id, PROBE, Vec::new())
            .await?;
        let position = result
            .result
            .value
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        if let Some(previous) = last {
            if (position - previous).abs() < 1.0 {
                stable_samples += 1;
                if stable_samples >= 3 {
                    return Ok(());
                }
            } else {
                stable_samples = 0;
            }
        }
        last = Some(position);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

/// Execute one action against a resolved element over CDP primitives
pub(crate) async fn dispatch(
    element: &ResolvedElement,
    action: &Action,
    snapshot_box: Option<&Rect>,
) -> Result<()> {
    // Every method starts by bringing the element into view.
    element
        .session
        .scroll_into_view(element.backend_node_id)
        .await
        .map_err(|e| {
            if e.is_no_layout() {
                Error::NotInteractable {
                    encoded_id: element.backend_node_id.to_string(),
                    reason: "not rendered (no box model)".to_string(),
                }
            } else {
                e
            }
        })?;

    match action {
        Action::Click => {
            let (x, y) = click_point(element, snapshot_box).await?;
            let session = element.session.clone();
            let sequence = async move {
                session
                    .dispatch_mouse_event(MouseEventType::MouseMoved, x, y, None, None)
                    .await?;
                session
                    .dispatch_mouse_event(
                        MouseEventType::MousePressed,
                        x,
                        y,
                        Some(MouseButton::Left),
                        Some(1),
                    )
                    .await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                session
                    .dispatch_mouse_event(
                        MouseEventType::MouseReleased,
                        x,
                        y,
                        Some(MouseButton::Left),
                        Some(1),
                    )
                    .await?;
                Ok::<(), Error>(())
            };
            tokio::time::timeout(CLICK_BUDGET, sequence)
                .await
                .map_err(|_| Error::Timeout(format!("click did not complete within {:?}", CLICK_BUDGET)))??;
        }

        Action::Hover => {
            let (x, y) = click_point(element, snapshot_box).await?;
            element
                .session
                .dispatch_mouse_event(MouseEventType::MouseMoved, x, y, None, None)
                .await?;
        }

        Action::Fill { value } => {
            element
                .session
                .call_function_on(&element.object_id, "function() { this.focus(); }", Vec::new())
                .await?;
            element
                .session
                .call_function_on(
                    &element.object_id,
                    r#"function(value) {
                        if ('value' in this) { this.value = value; }
                        this.dispatchEvent(new Event('input', { bubbles: true }));
                        this.dispatchEvent(new Event('change', { bubbles: true }));
                    }"#,
                    vec![CallArgument {
                        value: Some(json!(value)),
                        object_id: None,
                    }],
                )
                .await?;
        }

        Action::Type { text, press_enter } => {
            element.session.focus(element.backend_node_id).await?;
            element.session.insert_text(text).await?;
            if *press_enter {
                press_key(&element.session, "Enter").await?;
            }
        }

        Action::Press { key } => {
            element.session.focus(element.backend_node_id).await?;
            press_key(&element.session, key).await?;
        }

        Action::SelectOptionFromDropdown { option } => {
            element
                .session
                .call_function_on(
                    &element.object_id,
                    r#"function(desired) {
                        if (!this.options) { throw new Error('Target is not a <select> element'); }
                        const options = Array.from(this.options);
                        let match = options.find(o => o.value === desired);
                        if (!match) { match = options.find(o => (o.text || '').trim() === desired); }
                        if (!match) { throw new Error('No matching option: ' + desired); }
                        match.selected = true;
                        this.value = match.value;
                        this.dispatchEvent(new Event('change', { bubbles: true }));
                    }"#,
                    vec![CallArgument {
                        value: Some(json!(option)),
                        object_id: None,
                    }],
                )
                .await?;
        }

        Action::Check | Action::Uncheck => {
            let desired = matches!(action, Action::Check);
            element
                .session
                .call_function_on(
                    &element.object_id,
                    r#"function(desired) {
                        this.checked = desired;
                        this.dispatchEvent(new Event('change', { bubbles: true }));
                        this.dispatchEvent(new Event('input', { bubbles: true }));
                    }"#,
                    vec![CallArgument {
                        value: Some(json!(desired)),
                        object_id: None,
                    }],
                )
                .await?;
        }

        Action::ScrollToElement => {
            // scrollIntoViewIfNeeded already ran; done.
        }

        Action::ScrollToPercentage { percent } => {
            element
                .session
                .call_function_on(
                    &element.object_id,
                    r#"function(pct) {
                        const tag = this.tagName ? this.tagName.toLowerCase() : '';
                        const target = (tag === 'html' || tag === 'body')
                            ? (document.scrollingElement || document.documentElement)
                            : this;
                        const top = Math.max(target.scrollHeight - target.clientHeight, 0) * (pct / 100);
                        target.scrollTo({ top: top, behavior: 'smooth' });
                    }"#,
                    vec![CallArgument {
                        value: Some(json!(percent)),
                        object_id: None,
                    }],
                )
                .await?;
            wait_scroll_stable(element).await?;
        }

        Action::NextChunk | Action::PrevChunk => {
            let direction = if matches!(action, Action::NextChunk) { 1 } else { -1 };
            element
                .session
                .call_function_on(
                    &element.object_id,
                    r#"function(direction) {
                        let target = this;
                        while (target && target !== document.body && target !== document.documentElement) {
                            const style = getComputedStyle(target);
                            const scrollable = (style.overflowY === 'auto' || style.overflowY === 'scroll')
                                && target.scrollHeight > target.clientHeight;
                            if (scrollable) { break; }
                            target = target.parentElement;
                        }
                        if (!target || target === document.body || target === document.documentElement) {
                            window.scrollBy({ top: window.innerHeight * direction, left: 0, behavior: 'smooth' });
                        } else {
                            target.scrollBy({ top: target.clientHeight * direction, left: 0, behavior: 'smooth' });
                        }
                    }"#,
                    vec![CallArgument {
                        value: Some(json!(direction)),
                        object_id: None,
                    }],
                )
                .await?;
            wait_scroll_stable(element).await?;
        }
    }

    Ok(())
}

fn build_xpath_script(xpath: &str, body: &str) -> Result<String> {
    let xpath_json = serde_json::to_string(xpath)?;
    Ok(format!(
        r#"(function() {{
            const result = document.evaluate({xpath}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null);
            const el = result.singleNodeValue;
            if (!el) {{ throw new Error('Element not found for xpath'); }}
            {body}
            return true;
        }})()"#,
        xpath = xpath_json,
        body = body
    ))
}

/// Fallback executor: the same method set implemented through script
/// evaluation keyed by the snapshot's XPath, for callers that disable CDP
/// dispatch or snapshots without a backend-node map
pub(crate) async fn dispatch_fallback(
    session: &Session,
    context_id: Option<i64>,
    xpath: &str,
    action: &Action,
) -> Result<()> {
    let body = match action {
        Action::Click => "el.click();".to_string(),
        Action::Hover => {
            "el.dispatchEvent(new MouseEvent('mouseover', { bubbles: true }));\n\
             el.dispatchEvent(new MouseEvent('mouseenter', { bubbles: true }));"
                .to_string()
        }
        Action::Fill { value } | Action::Type { text: value, press_enter: false } => {
            format!(
                r#"const value = {};
                el.focus();
                if ('value' in el) {{ el.value = value; }}
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));"#,
                serde_json::to_string(value)?
            )
        }
        Action::Type { text, press_enter: true } => {
            format!(
                r#"const value = {};
                el.focus();
                if ('value' in el) {{ el.value = value; }}
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                const init = {{ key: 'Enter', bubbles: true, cancelable: true }};
                el.dispatchEvent(new KeyboardEvent('keydown', init));
                el.dispatchEvent(new KeyboardEvent('keyup', init));"#,
                serde_json::to_string(text)?
            )
        }
        Action::Press { key } => {
            format!(
                r#"const keyValue = {};
                el.focus();
                const init = {{ key: keyValue, bubbles: true, cancelable: true }};
                el.dispatchEvent(new KeyboardEvent('keydown', init));
                el.dispatchEvent(new KeyboardEvent('keyup', init));"#,
                serde_json::to_string(key)?
            )
        }
        Action::SelectOptionFromDropdown { option } => {
            format!(
                r#"const desired = {};
                if (!el.options) {{ throw new Error('Target is not a <select> element'); }}
                const options = Array.from(el.options);
                let match = options.find(o => o.value === desired);
                if (!match) {{ match = options.find(o => (o.text || '').trim() === desired); }}
                if (!match) {{ throw new Error('No matching option: ' + desired); }}
                match.selected = true;
                el.value = match.value;
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));"#,
                serde_json::to_string(option)?
            )
        }
        Action::Check => {
            "el.checked = true;\n\
             el.dispatchEvent(new Event('change', { bubbles: true }));\n\
             el.dispatchEvent(new Event('input', { bubbles: true }));"
                .to_string()
        }
        Action::Uncheck => {
            "el.checked = false;\n\
             el.dispatchEvent(new Event('change', { bubbles: true }));\n\
             el.dispatchEvent(new Event('input', { bubbles: true }));"
                .to_string()
        }
        Action::ScrollToElement => {
            "el.scrollIntoView({ behavior: 'smooth', block: 'center' });".to_string()
        }
        Action::ScrollToPercentage { percent } => {
            format!(
                r#"const pct = {};
                const tag = el.tagName ? el.tagName.toLowerCase() : '';
                const target = (tag === 'html' || tag === 'body')
                    ? (document.scrollingElement || document.documentElement) : el;
                const top = Math.max(target.scrollHeight - target.clientHeight, 0) * (pct / 100);
                target.scrollTo({{ top: top, behavior: 'smooth' }});"#,
                percent
            )
        }
        Action::NextChunk | Action::PrevChunk => {
            let direction = if matches!(action, Action::NextChunk) { 1 } else { -1 };
            format!(
                r#"const direction = {};
                let target = el;
                while (target && target !== document.body && target !== document.documentElement) {{
                    const style = getComputedStyle(target);
                    if ((style.overflowY === 'auto' || style.overflowY === 'scroll')
                        && target.scrollHeight > target.clientHeight) {{ break; }}
                    target = target.parentElement;
                }}
                if (!target || target === document.body || target === document.documentElement) {{
                    window.scrollBy({{ top: window.innerHeight * direction, left: 0, behavior: 'smooth' }});
                }} else {{
                    target.scrollBy({{ top: target.clientHeight * direction, left: 0, behavior: 'smooth' }});
                }}"#,
                direction
            )
        }
    };

    let script = build_xpath_script(xpath, &body)?;
    session
        .evaluate_in_context(&script, context_id, true)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_method_set_is_closed() {
        for method in METHODS {
            let args = vec!["x".to_string()];
            assert!(Action::parse(method, &args).is_ok(), "{} rejected", method);
        }
        assert!(matches!(
            Action::parse("doubleClick", &[]),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            Action::parse("navigate", &["https://example.com".into()]),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn parse_round_trips_method_names() {
        for method in METHODS {
            let args = vec!["42".to_string()];
            let action = Action::parse(method, &args).unwrap();
            assert_eq!(action.method(), method);
        }
    }

    #[test]
    fn argument_requirements_are_enforced() {
        assert!(Action::parse("fill", &[]).is_err());
        assert!(Action::parse("press", &[]).is_err());
        assert!(Action::parse("selectOptionFromDropdown", &[]).is_err());
        assert!(Action::parse("scrollToPercentage", &["abc".into()]).is_err());
        assert!(Action::parse("click", &[]).is_ok());
        assert!(Action::parse("check", &[]).is_ok());
    }

    #[test]
    fn percentage_is_clamped() {
        let action = Action::parse("scrollToPercentage", &["250".into()]).unwrap();
        assert_eq!(action, Action::ScrollToPercentage { percent: 100.0 });

        let action = Action::parse("scrollToPercentage", &["50%".into()]).unwrap();
        assert_eq!(action, Action::ScrollToPercentage { percent: 50.0 });
    }

    #[test]
    fn type_accepts_trailing_enter_flag() {
        let action = Action::parse("type", &["hello".into(), "true".into()]).unwrap();
        assert_eq!(
            action,
            Action::Type { text: "hello".into(), press_enter: true }
        );

        let action = Action::parse("type", &["hello".into()]).unwrap();
        assert_eq!(
            action,
            Action::Type { text: "hello".into(), press_enter: false }
        );
    }

    #[test]
    fn mutating_classification() {
        assert!(Action::Click.is_mutating());
        assert!(Action::Fill { value: "x".into() }.is_mutating());
        assert!(Action::Check.is_mutating());
        assert!(!Action::Hover.is_mutating());
        assert!(!Action::ScrollToElement.is_mutating());
        assert!(!Action::NextChunk.is_mutating());
    }

    #[test]
    fn variable_substitution() {
        let args = vec!["hello %NAME%".to_string(), "%A%%B%".to_string()];
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "world".to_string());
        vars.insert("A".to_string(), "1".to_string());
        vars.insert("B".to_string(), "2".to_string());

        assert_eq!(
            substitute_variables(&args, &vars),
            vec!["hello world".to_string(), "12".to_string()]
        );
    }

    #[test]
    fn enter_key_definition_carries_text_and_vkey() {
        let (key, code, text, vkey) = key_definition("Enter");
        assert_eq!(key, "Enter");
        assert_eq!(code.as_deref(), Some("Enter"));
        assert_eq!(text.as_deref(), Some("\r"));
        assert_eq!(vkey, Some(13));

        let (_, code, text, vkey) = key_definition("a");
        assert_eq!(code, None);
        assert_eq!(text.as_deref(), Some("a"));
        assert_eq!(vkey, None);
    }
}
