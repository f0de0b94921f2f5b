//! Passes 4, 6 and 7 — accessibility tree shaping.
//!
//! Raw `Accessibility` domain nodes are converted into a per-frame hierarchy,
//! cleaned of structural wrappers, decorated with scrollability, and finally
//! rendered as the indented text listing handed to the model.

use std::collections::{HashMap, HashSet};

use crate::capture::{AccessibilityNode, IframeInfo};
use crate::cdp::AxNodeData;
use crate::encoded::EncodedId;

/// Roles that make a frame's accessibility tree useful on its own. A frame
/// whose AX nodes contain none of these gets a DOM-synthesized fallback.
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "searchbox",
    "combobox",
    "checkbox",
    "radio",
];

fn is_structural(role: &str) -> bool {
    matches!(role, "generic" | "none" | "presentation")
}

fn is_noise(role: &str) -> bool {
    is_structural(role) || matches!(role, "StaticText" | "InlineTextBox")
}

/// A node in the cleaned per-frame hierarchy
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Display role, possibly `"scrollable, "`-decorated or tag-replaced
    pub role: String,
    /// Undecorated role as reported by CDP
    pub base_role: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub value: Option<String>,
    pub backend_dom_node_id: Option<i64>,
    pub encoded_id: Option<EncodedId>,
    pub children: Vec<TreeNode>,
}

/// Normalize an accessible name: trim, collapse whitespace and
/// non-breaking-space variants to single spaces, strip private-use unicode.
/// Returns `None` when nothing readable remains.
pub fn normalize_name(raw: &str) -> Option<String> {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\u{00A0}' | '\u{202F}' | '\u{2007}' | '\u{FEFF}' => cleaned.push(' '),
            c if ('\u{E000}'..='\u{F8FF}').contains(&c) => {}
            c => cleaned.push(c),
        }
    }

    let collapsed: Vec<&str> = cleaned.split_whitespace().collect();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.join(" "))
    }
}

/// True when any non-ignored node carries an interactive role
pub fn has_interactive_roles(nodes: &[AxNodeData]) -> bool {
    nodes.iter().any(|node| {
        !node.ignored && INTERACTIVE_ROLES.contains(&node.role_str().as_str())
    })
}

/// Synthesize a flat interactive listing from the DOM maps for frames whose
/// accessibility tree came back empty of interactive content
pub fn synthesize_fallback(
    frame_index: u32,
    tag_name_map: &HashMap<EncodedId, String>,
    accessible_name_map: &HashMap<EncodedId, String>,
) -> Vec<TreeNode> {
    let mut entries: Vec<(EncodedId, &str)> = tag_name_map
        .iter()
        .filter(|(id, _)| id.frame_index == frame_index)
        .filter_map(|(id, tag)| {
            let role = match tag.as_str() {
                "input" | "textarea" => "textbox",
                "button" => "button",
                "a" => "link",
                "select" => "combobox",
                _ => return None,
            };
            Some((*id, role))
        })
        .collect();
    entries.sort_by_key(|(id, _)| id.backend_node_id);

    entries
        .into_iter()
        .map(|(id, role)| TreeNode {
            role: role.to_string(),
            base_role: role.to_string(),
            name: accessible_name_map.get(&id).cloned(),
            description: None,
            value: None,
            backend_dom_node_id: Some(id.backend_node_id),
            encoded_id: Some(id),
            children: Vec::new(),
        })
        .collect()
}

struct BuildContext<'a> {
    frame_index: u32,
    /// Frame id of the document this tree belongs to; descent stops at nodes
    /// from other frames (their content gets its own listing)
    doc_frame_id: Option<&'a str>,
    tag_name_map: &'a HashMap<EncodedId, String>,
    scrollables: &'a HashSet<EncodedId>,
}

/// Build the cleaned hierarchy for one frame from its raw AX node list.
///
/// `root_backend` anchors partial fetches: `getPartialAXTree` with relatives
/// returns the ancestor chain up to the page root, and only the subtree at
/// the frame's content document belongs in this frame's listing.
pub fn build_frame_tree(
    nodes: &[AxNodeData],
    frame_index: u32,
    tag_name_map: &HashMap<EncodedId, String>,
    scrollables: &HashSet<EncodedId>,
    root_backend: Option<i64>,
) -> Vec<TreeNode> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let by_id: HashMap<&str, &AxNodeData> = nodes
        .iter()
        .map(|node| (node.node_id.as_str(), node))
        .collect();

    let roots: Vec<&AxNodeData> = match root_backend
        .and_then(|backend| nodes.iter().find(|n| n.backend_dom_node_id == Some(backend)))
    {
        Some(anchor) => vec![anchor],
        None => nodes
            .iter()
            .filter(|node| {
                node.parent_id
                    .as_deref()
                    .map(|parent| !by_id.contains_key(parent))
                    .unwrap_or(true)
            })
            .collect(),
    };

    let ctx = BuildContext {
        frame_index,
        doc_frame_id: roots.first().and_then(|r| r.frame_id.as_deref()),
        tag_name_map,
        scrollables,
    };

    let mut visited = HashSet::new();
    roots
        .into_iter()
        .flat_map(|root| convert(root.node_id.as_str(), &by_id, &mut visited, &ctx))
        .collect()
}

/// Convert one raw node; returns the cleaned node, or its promoted children
/// when the node itself is dropped
fn convert(
    node_id: &str,
    by_id: &HashMap<&str, &AxNodeData>,
    visited: &mut HashSet<String>,
    ctx: &BuildContext<'_>,
) -> Vec<TreeNode> {
    if !visited.insert(node_id.to_string()) {
        return Vec::new();
    }
    let Some(raw) = by_id.get(node_id) else {
        return Vec::new();
    };

    // Content belonging to another frame gets its own listing.
    if let (Some(node_frame), Some(doc_frame)) = (raw.frame_id.as_deref(), ctx.doc_frame_id) {
        if node_frame != doc_frame {
            return Vec::new();
        }
    }

    let base_role = raw.role_str();

    let mut children: Vec<TreeNode> = if base_role == "Iframe" {
        // The child document is captured per-frame, not inline.
        Vec::new()
    } else {
        raw.child_ids
            .iter()
            .flatten()
            .flat_map(|child| convert(child, by_id, visited, ctx))
            .collect()
    };

    if raw.ignored {
        return children;
    }

    let name = raw.name_str().as_deref().and_then(normalize_name);
    let description = AxNodeData::string_of(&raw.description)
        .as_deref()
        .and_then(normalize_name);
    let value = AxNodeData::string_of(&raw.value);

    // Only nodes the DOM walk saw get an address; anything else (pseudo
    // elements, nodes from a torn-down document) renders without one.
    let encoded_id = raw
        .backend_dom_node_id
        .map(|backend| EncodedId::new(ctx.frame_index, backend))
        .filter(|id| ctx.tag_name_map.contains_key(id));
    let tag = encoded_id
        .and_then(|id| ctx.tag_name_map.get(&id))
        .map(String::as_str);

    let scrollable = encoded_id
        .map(|id| ctx.scrollables.contains(&id))
        .unwrap_or(false);

    let mut role = base_role.clone();
    let structural = is_structural(&base_role);

    if scrollable {
        role = if structural {
            "scrollable".to_string()
        } else {
            format!("scrollable, {}", base_role)
        };
    } else if structural {
        if children.len() == 1 {
            return children;
        }
        if children.is_empty() {
            return Vec::new();
        }
        // Multiple children: keep the node but show what it actually is.
        if let Some(tag) = tag {
            role = tag.to_string();
        }
    }

    if base_role == "combobox" && tag == Some("select") {
        role = "select".to_string();
    }

    // A sole text child that repeats the parent's name adds nothing.
    if children.len() == 1
        && children[0].base_role == "StaticText"
        && children[0].name == name
        && children[0].children.is_empty()
    {
        children.clear();
    }

    let keep = name.is_some() || !children.is_empty() || scrollable || !is_noise(&base_role);
    if !keep {
        return children;
    }

    vec![TreeNode {
        role,
        base_role,
        name,
        description,
        value,
        backend_dom_node_id: raw.backend_dom_node_id,
        encoded_id,
        children,
    }]
}

/// Human-readable ancestry: `Main → Frame 1 → Frame 3`
pub fn frame_path(frame_index: u32, frame_map: &HashMap<u32, IframeInfo>) -> String {
    if frame_index == 0 {
        return "Main".to_string();
    }

    let mut chain = vec![frame_index];
    let mut current = frame_index;
    let mut seen = HashSet::new();
    seen.insert(current);

    while let Some(info) = frame_map.get(&current) {
        match info.parent_frame_index {
            Some(parent) if parent != 0 && seen.insert(parent) => {
                chain.push(parent);
                current = parent;
            }
            _ => break,
        }
    }

    let mut path = String::from("Main");
    for index in chain.iter().rev() {
        path.push_str(&format!(" → Frame {}", index));
    }
    path
}

/// `=== Frame 0 (Main) ===` / `=== Frame 3 (Main → Frame 1 → Frame 3) ===`
pub fn frame_header(frame_index: u32, frame_map: &HashMap<u32, IframeInfo>) -> String {
    format!(
        "=== Frame {} ({}) ===",
        frame_index,
        frame_path(frame_index, frame_map)
    )
}

/// Render one frame's hierarchy as the indented text listing
pub fn format_frame_listing(trees: &[TreeNode]) -> String {
    let mut out = String::new();
    for node in trees {
        format_node(node, 0, &mut out);
    }
    out
}

fn format_node(node: &TreeNode, depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    if let Some(id) = node.encoded_id {
        out.push('[');
        out.push_str(&id.to_string());
        out.push_str("] ");
    }
    out.push_str(&node.role);
    if let Some(name) = &node.name {
        out.push_str(": ");
        out.push_str(name);
    }
    out.push('\n');

    for child in &node.children {
        format_node(child, depth + 1, out);
    }
}

/// Extract every EncodedId a formatted listing mentions
pub fn parse_formatted_ids(text: &str) -> HashSet<EncodedId> {
    let mut ids = HashSet::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                if let Ok(id) = rest[..end].parse::<EncodedId>() {
                    ids.insert(id);
                }
            }
        }
    }
    ids
}

/// Flatten a cleaned hierarchy into the snapshot's element map
pub fn flatten_elements(trees: &[TreeNode], out: &mut HashMap<EncodedId, AccessibilityNode>) {
    for node in trees {
        if let Some(id) = node.encoded_id {
            out.insert(
                id,
                AccessibilityNode {
                    role: node.role.clone(),
                    name: node.name.clone(),
                    description: node.description.clone(),
                    value: node.value.clone(),
                    backend_dom_node_id: id.backend_node_id,
                    children: node
                        .children
                        .iter()
                        .filter_map(|child| child.encoded_id)
                        .collect(),
                },
            );
        }
        flatten_elements(&node.children, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ax(value: serde_json::Value) -> Vec<AxNodeData> {
        serde_json::from_value(value).unwrap()
    }

    fn tags(entries: &[(u32, i64, &str)]) -> HashMap<EncodedId, String> {
        entries
            .iter()
            .map(|(f, b, t)| (EncodedId::new(*f, *b), t.to_string()))
            .collect()
    }

    #[test]
    fn name_normalization_rules() {
        assert_eq!(normalize_name("  Submit  "), Some("Submit".into()));
        assert_eq!(normalize_name("a\u{00A0}b"), Some("a b".into()));
        assert_eq!(normalize_name("a\u{202F}\u{00A0}b"), Some("a b".into()));
        assert_eq!(normalize_name("x\u{E321}y"), Some("xy".into()));
        assert_eq!(normalize_name("\u{00A0}\u{00A0}"), None);
        assert_eq!(normalize_name(""), None);
    }

    #[test]
    fn generic_with_single_child_collapses() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "generic"}, "childIds": ["2"], "backendDOMNodeId": 10},
            {"nodeId": "2", "parentId": "1", "role": {"value": "button"},
             "name": {"value": "Go"}, "childIds": [], "backendDOMNodeId": 11}
        ]));
        let tag_map = tags(&[(0, 10, "div"), (0, 11, "button")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].role, "button");
        assert_eq!(tree[0].name.as_deref(), Some("Go"));
    }

    #[test]
    fn empty_generic_is_pruned() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "RootWebArea"}, "childIds": ["2", "3"]},
            {"nodeId": "2", "parentId": "1", "role": {"value": "generic"}, "childIds": [],
             "backendDOMNodeId": 10},
            {"nodeId": "3", "parentId": "1", "role": {"value": "button"},
             "name": {"value": "Go"}, "childIds": [], "backendDOMNodeId": 11}
        ]));
        let tag_map = tags(&[(0, 10, "div"), (0, 11, "button")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].role, "button");
    }

    #[test]
    fn generic_with_many_children_is_tag_replaced() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "generic"}, "childIds": ["2", "3"],
             "backendDOMNodeId": 10},
            {"nodeId": "2", "parentId": "1", "role": {"value": "button"},
             "name": {"value": "A"}, "childIds": [], "backendDOMNodeId": 11},
            {"nodeId": "3", "parentId": "1", "role": {"value": "button"},
             "name": {"value": "B"}, "childIds": [], "backendDOMNodeId": 12}
        ]));
        let tag_map = tags(&[(0, 10, "nav"), (0, 11, "button"), (0, 12, "button")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].role, "nav");
        assert_eq!(tree[0].children.len(), 2);
    }

    #[test]
    fn combobox_backed_by_select_is_renamed() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "combobox"}, "name": {"value": "Country"},
             "childIds": [], "backendDOMNodeId": 10}
        ]));
        let tag_map = tags(&[(0, 10, "select")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);

        assert_eq!(tree[0].role, "select");
    }

    #[test]
    fn scrollable_decoration_is_monotonic() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "generic"}, "childIds": ["2", "3"],
             "backendDOMNodeId": 10},
            {"nodeId": "2", "parentId": "1", "role": {"value": "main"},
             "name": {"value": "content"}, "childIds": [], "backendDOMNodeId": 11},
            {"nodeId": "3", "parentId": "1", "role": {"value": "button"},
             "name": {"value": "Go"}, "childIds": [], "backendDOMNodeId": 12}
        ]));
        let tag_map = tags(&[(0, 10, "div"), (0, 11, "main"), (0, 12, "button")]);
        let mut scrollables = HashSet::new();
        scrollables.insert(EncodedId::new(0, 10));
        scrollables.insert(EncodedId::new(0, 11));

        let tree = build_frame_tree(&nodes, 0, &tag_map, &scrollables, None);
        // Decorated generic keeps just "scrollable"
        assert_eq!(tree[0].role, "scrollable");
        // Non-structural roles get the prefix
        assert_eq!(tree[0].children[0].role, "scrollable, main");
        assert!(tree[0].children[0].role.starts_with("scrollable"));
    }

    #[test]
    fn sole_static_text_child_matching_parent_name_is_dropped() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "button"}, "name": {"value": "Save"},
             "childIds": ["2"], "backendDOMNodeId": 10},
            {"nodeId": "2", "parentId": "1", "role": {"value": "StaticText"},
             "name": {"value": "Save"}, "childIds": []}
        ]));
        let tag_map = tags(&[(0, 10, "button")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);

        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_empty());
    }

    #[test]
    fn ignored_nodes_promote_their_children() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "RootWebArea"}, "childIds": ["2"]},
            {"nodeId": "2", "parentId": "1", "ignored": true, "childIds": ["3"]},
            {"nodeId": "3", "parentId": "2", "role": {"value": "link"},
             "name": {"value": "Docs"}, "childIds": [], "backendDOMNodeId": 11}
        ]));
        let tag_map = tags(&[(0, 11, "a")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].role, "link");
    }

    #[test]
    fn fallback_synthesis_maps_tags_to_roles() {
        let tag_map = tags(&[
            (1, 5, "input"),
            (1, 6, "button"),
            (1, 7, "a"),
            (1, 8, "select"),
            (1, 9, "div"),
            (0, 10, "input"),
        ]);
        let mut names = HashMap::new();
        names.insert(EncodedId::new(1, 5), "q".to_string());

        let fallback = synthesize_fallback(1, &tag_map, &names);
        let roles: Vec<&str> = fallback.iter().map(|n| n.role.as_str()).collect();
        assert_eq!(roles, vec!["textbox", "button", "link", "combobox"]);
        assert_eq!(fallback[0].name.as_deref(), Some("q"));
    }

    #[test]
    fn formatted_listing_round_trips_its_ids() {
        let nodes = ax(json!([
            {"nodeId": "1", "role": {"value": "RootWebArea"}, "name": {"value": "Page"},
             "childIds": ["2", "3"], "backendDOMNodeId": 1},
            {"nodeId": "2", "parentId": "1", "role": {"value": "button"},
             "name": {"value": "Go"}, "childIds": [], "backendDOMNodeId": 11},
            {"nodeId": "3", "parentId": "1", "role": {"value": "link"},
             "name": {"value": "Docs"}, "childIds": [], "backendDOMNodeId": 12}
        ]));
        let tag_map = tags(&[(0, 1, "html"), (0, 11, "button"), (0, 12, "a")]);
        let tree = build_frame_tree(&nodes, 0, &tag_map, &HashSet::new(), None);
        let listing = format_frame_listing(&tree);

        assert!(listing.contains("[0-11] button: Go"));
        assert!(listing.contains("[0-12] link: Docs"));

        let mut elements = HashMap::new();
        flatten_elements(&tree, &mut elements);
        let expected: HashSet<EncodedId> = elements.keys().copied().collect();
        assert_eq!(parse_formatted_ids(&listing), expected);
    }

    #[test]
    fn frame_headers_reconstruct_ancestry() {
        let mut frame_map = HashMap::new();
        for (index, parent) in [(1u32, Some(0u32)), (3, Some(1))] {
            frame_map.insert(
                index,
                IframeInfo {
                    frame_index: index,
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
                },
            );
        }

        assert_eq!(frame_header(0, &frame_map), "=== Frame 0 (Main) ===");
        assert_eq!(
            frame_header(1, &frame_map),
            "=== Frame 1 (Main → Frame 1) ==="
        );
        assert_eq!(
            frame_header(3, &frame_map),
            "=== Frame 3 (Main → Frame 1 → Frame 3) ==="
        );
        // Missing ancestry degrades to the frame itself.
        assert_eq!(
            frame_header(9, &frame_map),
            "=== Frame 9 (Main → Frame 9) ==="
        );
    }
}
