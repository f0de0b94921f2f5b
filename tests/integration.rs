//! Integration tests for vantage
//!
//! The Chrome-backed tests require a running browser with an exposed
//! DevTools endpoint. Start one with e.g.
//! `chromium --headless=new --remote-debugging-port=9222 about:blank`
//! and run:
//! `VANTAGE_CDP_WS=$(curl -s localhost:9222/json/version | jq -r .webSocketDebuggerUrl) \
//!  cargo test --test integration -- --ignored`
//!
//! The property tests at the top run everywhere.

use std::collections::HashSet;

use serde_json::json;
use vantage::capture::a11y;
use vantage::cdp::AxNodeData;
use vantage::{Action, CdpDriver, EncodedId, Engine, Error, ObserveOptions, METHODS};

// =========================================================================
// Property tests (no browser required)
// =========================================================================

#[test]
fn encoded_id_format_parse_round_trip() {
    for (frame, node) in [(0u32, 0i64), (0, 7), (3, 1047), (12, 88), (250, 123456)] {
        let id = EncodedId::new(frame, node);
        let parsed: EncodedId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}

#[test]
fn encoded_id_wire_format_is_strict() {
    assert!("0-12".parse::<EncodedId>().is_ok());
    for bad in ["", "12", "a-1", "1-a", "01-2", "2-03", "-1-2", "1-2-3", "1_2"] {
        assert!(
            matches!(bad.parse::<EncodedId>(), Err(Error::BadEncodedId(_))),
            "accepted {:?}",
            bad
        );
    }
}

#[test]
fn the_action_catalog_is_exactly_twelve_methods() {
    assert_eq!(METHODS.len(), 12);
    let unique: HashSet<&str> = METHODS.iter().copied().collect();
    assert_eq!(unique.len(), 12);

    // Every catalog method parses; nothing outside it does.
    for method in METHODS {
        assert!(Action::parse(method, &["arg".to_string()]).is_ok());
    }
    for bogus in ["navigate", "drag", "doubleClick", "screenshot"] {
        assert!(Action::parse(bogus, &["arg".to_string()]).is_err());
    }
}

#[test]
fn formatted_tree_round_trips_encoded_ids() {
    let nodes: Vec<AxNodeData> = serde_json::from_value(json!([
        {"nodeId": "1", "role": {"value": "RootWebArea"}, "name": {"value": "Shop"},
         "childIds": ["2", "3", "4"], "backendDOMNodeId": 1},
        {"nodeId": "2", "parentId": "1", "role": {"value": "button"},
         "name": {"value": "Add to cart"}, "childIds": [], "backendDOMNodeId": 20},
        {"nodeId": "3", "parentId": "1", "role": {"value": "link"},
         "name": {"value": "Checkout"}, "childIds": [], "backendDOMNodeId": 21},
        {"nodeId": "4", "parentId": "1", "role": {"value": "textbox"},
         "name": {"value": "Coupon"}, "childIds": [], "backendDOMNodeId": 22}
    ]))
    .unwrap();

    let tags = [(1, "html"), (20, "button"), (21, "a"), (22, "input")]
        .into_iter()
        .map(|(backend, tag)| (EncodedId::new(0, backend), tag.to_string()))
        .collect();

    let tree = a11y::build_frame_tree(&nodes, 0, &tags, &HashSet::new(), None);
    let listing = a11y::format_frame_listing(&tree);

    let mut elements = std::collections::HashMap::new();
    a11y::flatten_elements(&tree, &mut elements);

    let from_listing = a11y::parse_formatted_ids(&listing);
    let from_elements: HashSet<EncodedId> = elements.keys().copied().collect();
    assert_eq!(from_listing, from_elements);
}

#[test]
fn scrollable_role_decoration_is_monotonic() {
    let nodes: Vec<AxNodeData> = serde_json::from_value(json!([
        {"nodeId": "1", "role": {"value": "main"}, "name": {"value": "content"},
         "childIds": [], "backendDOMNodeId": 5}
    ]))
    .unwrap();

    let tags = [(EncodedId::new(0, 5), "main".to_string())].into_iter().collect();
    let scrollables: HashSet<EncodedId> = [EncodedId::new(0, 5)].into_iter().collect();

    let tree = a11y::build_frame_tree(&nodes, 0, &tags, &scrollables, None);
    assert!(tree[0].role.starts_with("scrollable"));
}

// =========================================================================
// Chrome-backed scenarios
// =========================================================================

/// DevTools WebSocket URL from the environment, or None to skip
fn ws_url() -> Option<String> {
    std::env::var("VANTAGE_CDP_WS").ok()
}

/// Create a page target with the given HTML and return its target id
async fn new_page(driver: &CdpDriver, html: &str) -> String {
    let result: serde_json::Value = driver
        .connection()
        .transport()
        .send(
            "Target.createTarget",
            &json!({ "url": format!("data:text/html,{}", html) }),
        )
        .await
        .expect("Failed to create target");
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    result["targetId"].as_str().expect("no targetId").to_string()
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn s1_click_a_main_frame_button() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(&driver, "<button id=\"submit\">Submit</button>").await;
    let engine = Engine::with_defaults(driver);

    let snapshot = engine
        .observe(&page, &ObserveOptions::default())
        .await
        .expect("observe failed");

    // Exactly one button, addressed as 0-<backendNodeId>.
    let button = snapshot
        .elements
        .iter()
        .find(|(_, node)| node.role == "button")
        .map(|(id, node)| (*id, node.clone()))
        .expect("button not captured");
    assert_eq!(button.0.frame_index, 0);
    assert_eq!(button.1.name.as_deref(), Some("Submit"));
    assert_eq!(
        snapshot.xpath(&button.0).map(String::as_str),
        Some("//button[@id=\"submit\"]")
    );

    let outcome = engine
        .execute_action(&page, &snapshot, &button.0.to_string(), "click", &[])
        .await
        .expect("action errored");
    assert!(outcome.ok, "{}", outcome.message);
    assert!(snapshot.is_dirty());

    engine.close(&page).await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn s2_fill_then_enter_in_a_same_origin_iframe() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(
        &driver,
        "<iframe srcdoc=\"<input type='text' name='q' aria-label='q'>\"></iframe>",
    )
    .await;
    let engine = Engine::with_defaults(driver);

    let snapshot = engine
        .observe(&page, &ObserveOptions::default())
        .await
        .expect("observe failed");

    // The iframe got frame index 1 with a known frame id.
    let info = snapshot.frame_map.get(&1).expect("iframe not in frame map");
    assert!(info.frame_id.is_some());

    let textbox = snapshot
        .elements
        .iter()
        .find(|(id, node)| id.frame_index == 1 && node.role == "textbox")
        .map(|(id, _)| *id)
        .expect("textbox not captured");

    let outcome = engine
        .execute_action(
            &page,
            &snapshot,
            &textbox.to_string(),
            "fill",
            &["hello".to_string()],
        )
        .await
        .expect("fill errored");
    assert!(outcome.ok, "{}", outcome.message);

    let outcome = engine
        .execute_action(
            &page,
            &snapshot,
            &textbox.to_string(),
            "press",
            &["Enter".to_string()],
        )
        .await
        .expect("press errored");
    assert!(outcome.ok, "{}", outcome.message);

    engine.close(&page).await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn s3_stale_element_recovers_through_xpath() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(&driver, "<button id=\"go\">Go</button>").await;
    let scratch = driver
        .connection()
        .attach(&page)
        .await
        .expect("attach failed");
    let engine = Engine::with_defaults(driver);

    let snapshot = engine
        .observe(&page, &ObserveOptions::default())
        .await
        .expect("observe failed");
    let button = snapshot
        .elements
        .iter()
        .find(|(_, node)| node.role == "button")
        .map(|(id, _)| *id)
        .expect("button not captured");
    let stale_backend = snapshot.backend_node_id(&button).unwrap();

    // Replace the element in place: same markup, fresh backend node id.
    scratch
        .evaluate(
            "const old = document.getElementById('go');\
             const fresh = old.cloneNode(true);\
             old.replaceWith(fresh); true",
        )
        .await
        .expect("replace failed");

    let outcome = engine
        .execute_action(&page, &snapshot, &button.to_string(), "click", &[])
        .await
        .expect("click errored");
    assert!(outcome.ok, "{}", outcome.message);

    // Recovery rewrote the mapping to the recreated node.
    let recovered_backend = snapshot.backend_node_id(&button).unwrap();
    assert_ne!(recovered_backend, stale_backend);

    engine.close(&page).await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn s5_navigation_invalidates_the_cached_snapshot() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(
        &driver,
        "<a id=\"go\" href=\"data:text/html,<h1>Second</h1>\">Go</a>",
    )
    .await;
    let engine = Engine::with_defaults(driver);

    let first = engine
        .observe(&page, &ObserveOptions::cached())
        .await
        .expect("observe failed");

    let link = first
        .elements
        .iter()
        .find(|(_, node)| node.role == "link")
        .map(|(id, _)| *id)
        .expect("link not captured");

    let outcome = engine
        .execute_action(&page, &first, &link.to_string(), "click", &[])
        .await
        .expect("click errored");
    assert!(outcome.ok, "{}", outcome.message);
    assert!(first.is_dirty());

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let second = engine
        .observe(&page, &ObserveOptions::cached())
        .await
        .expect("re-observe failed");
    // The stale snapshot is never served again.
    assert!(!std::sync::Arc::ptr_eq(&first, &second));

    engine.close(&page).await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn s6_scrollable_div_is_decorated() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(
        &driver,
        "<div style=\"height:100px;overflow:auto\" aria-label=\"log\">\
         <div style=\"height:2000px\">tall</div></div>",
    )
    .await;
    let engine = Engine::with_defaults(driver);

    let snapshot = engine
        .observe(&page, &ObserveOptions::default())
        .await
        .expect("observe failed");

    let decorated = snapshot
        .dom_state
        .lines()
        .any(|line| line.trim_start().contains("] scrollable"));
    assert!(decorated, "no scrollable line in:\n{}", snapshot.dom_state);

    engine.close(&page).await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn observe_with_cache_serves_the_same_snapshot() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(&driver, "<button>One</button>").await;
    let engine = Engine::with_defaults(driver);

    let first = engine
        .observe(&page, &ObserveOptions::cached())
        .await
        .expect("observe failed");
    let second = engine
        .observe(&page, &ObserveOptions::cached())
        .await
        .expect("observe failed");
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    engine.invalidate(&page).await;
    let third = engine
        .observe(&page, &ObserveOptions::cached())
        .await
        .expect("observe failed");
    assert!(!std::sync::Arc::ptr_eq(&first, &third));

    engine.close(&page).await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn close_is_idempotent() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(&driver, "<p>bye</p>").await;
    let engine = Engine::with_defaults(driver);

    let _ = engine
        .observe(&page, &ObserveOptions::default())
        .await
        .expect("observe failed");

    engine.close(&page).await;
    engine.close(&page).await;
    engine.close("never-observed").await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn snapshot_invariants_hold_on_a_real_page() {
    let Some(url) = ws_url() else {
        eprintln!("VANTAGE_CDP_WS not set, skipping");
        return;
    };

    let driver = CdpDriver::connect(&url).expect("connect failed");
    let page = new_page(
        &driver,
        "<button>A</button><a href=\"#\">B</a>\
         <iframe srcdoc=\"<button>C</button>\"></iframe>",
    )
    .await;
    let engine = Engine::with_defaults(driver);

    let snapshot = engine
        .observe(&page, &ObserveOptions::default())
        .await
        .expect("observe failed");

    let backend_map = snapshot.backend_node_map();
    for id in snapshot.elements.keys() {
        // Every element is also in the backend-node and xpath maps.
        assert!(backend_map.contains_key(id), "{} missing backend id", id);
        assert!(snapshot.xpath(id).is_some(), "{} missing xpath", id);
        // Every referenced frame index is known.
        assert!(
            id.frame_index == 0 || snapshot.frame_map.contains_key(&id.frame_index),
            "{} references unknown frame",
            id
        );
        if id.frame_index > 0 {
            let info = &snapshot.frame_map[&id.frame_index];
            assert!(info.frame_id.as_deref().map(|f| !f.is_empty()).unwrap_or(false));
        }
    }

    // The formatted tree mentions exactly the captured element set.
    let listed = a11y::parse_formatted_ids(&snapshot.dom_state);
    let captured: HashSet<EncodedId> = snapshot.elements.keys().copied().collect();
    assert_eq!(listed, captured);

    engine.close(&page).await;
}
