//! Pass 1 — DOM traversal.
//!
//! Walks a pierced `DOM.getDocument` tree depth-first, building the four
//! backend-id maps (tag names, backend node ids, XPaths, accessible names)
//! and discovering `<iframe>` elements. Same-origin iframes carry an inline
//! `contentDocument` and are recursed into; OOPIFs do not, so only the outer
//! iframe entry is recorded and frame discovery continues in Pass 2.

use std::collections::HashMap;

use crate::capture::IframeInfo;
use crate::cdp::DomNode;
use crate::encoded::EncodedId;

/// Maps produced by walking one or more documents
#[derive(Debug, Default)]
pub struct DomWalk {
    pub tag_name_map: HashMap<EncodedId, String>,
    pub backend_node_map: HashMap<EncodedId, i64>,
    pub xpath_map: HashMap<EncodedId, String>,
    pub accessible_name_map: HashMap<EncodedId, String>,
    pub iframes: Vec<IframeInfo>,
    /// Next frame index to allocate; DFS order is authoritative
    pub next_frame_index: u32,
}

impl DomWalk {
    /// Merge another walk (e.g. an OOPIF's own document) into this one
    pub fn merge(&mut self, other: DomWalk) {
        self.tag_name_map.extend(other.tag_name_map);
        self.backend_node_map.extend(other.backend_node_map);
        self.xpath_map.extend(other.xpath_map);
        self.accessible_name_map.extend(other.accessible_name_map);
        self.iframes.extend(other.iframes);
        self.next_frame_index = self.next_frame_index.max(other.next_frame_index);
    }

    /// Remove every entry belonging to the given frame indices
    pub fn strip_frames(&mut self, dropped: &[u32]) {
        if dropped.is_empty() {
            return;
        }
        let doomed = |id: &EncodedId| dropped.contains(&id.frame_index);
        self.tag_name_map.retain(|id, _| !doomed(id));
        self.backend_node_map.retain(|id, _| !doomed(id));
        self.xpath_map.retain(|id, _| !doomed(id));
        self.accessible_name_map.retain(|id, _| !doomed(id));
        self.iframes
            .retain(|info| !dropped.contains(&info.frame_index));
    }
}

/// Walk one document tree. `frame_index` addresses this document's frame;
/// frame indices for discovered iframes are allocated from
/// `next_frame_index` upward (the caller seeds it with `frame_index + 1`
/// for the main frame, or the running global counter for later documents).
pub fn walk_document(root: &DomNode, frame_index: u32, next_frame_index: u32) -> DomWalk {
    let mut walk = DomWalk {
        next_frame_index,
        ..Default::default()
    };
    let mut iframe_position = 0u32;
    walk_children(root, frame_index, "", &mut walk, &mut iframe_position);
    walk
}

fn walk_children(
    parent: &DomNode,
    frame_index: u32,
    prefix: &str,
    walk: &mut DomWalk,
    iframe_position: &mut u32,
) {
    let Some(children) = parent.children.as_ref() else {
        return;
    };

    let mut tag_counts: HashMap<&str, u32> = HashMap::new();
    for child in children {
        if !child.is_element() {
            continue;
        }

        let tag = child.local_name.as_str();
        let position = tag_counts.entry(tag).or_insert(0);
        *position += 1;

        // An id attribute shortcuts the ancestry
        let xpath = match child.attribute("id") {
            Some(id) if !id.is_empty() && !id.contains('"') => {
                format!("//{}[@id=\"{}\"]", tag, id)
            }
            _ => format!("{}/{}[{}]", prefix, tag, position),
        };

        visit_element(child, frame_index, &xpath, walk, iframe_position);
    }
}

fn visit_element(
    node: &DomNode,
    frame_index: u32,
    xpath: &str,
    walk: &mut DomWalk,
    iframe_position: &mut u32,
) {
    let encoded = EncodedId::new(frame_index, node.backend_node_id);
    walk.tag_name_map.insert(encoded, node.local_name.clone());
    walk.backend_node_map.insert(encoded, node.backend_node_id);
    walk.xpath_map.insert(encoded, xpath.to_string());

    if let Some(name) = accessible_name(node) {
        walk.accessible_name_map.insert(encoded, name);
    }

    if node.local_name == "iframe" {
        *iframe_position += 1;
        let child_index = walk.next_frame_index;
        walk.next_frame_index += 1;

        walk.iframes.push(IframeInfo {
            frame_index: child_index,
            parent_frame_index: Some(frame_index),
            iframe_backend_node_id: node.backend_node_id,
            content_document_backend_node_id: node
                .content_document
                .as_ref()
                .map(|doc| doc.backend_node_id),
            xpath: xpath.to_string(),
            src: node.attribute("src").map(String::from),
            name: node.attribute("name").map(String::from),
            sibling_position: *iframe_position,
            frame_id: None,
            execution_context_id: None,
            cdp_session_id: None,
            absolute_bounding_box: None,
            frame_path: None,
            oopif: false,
        });

        // Same-origin content is inlined by pierce=true; XPaths restart at
        // the child document root.
        if let Some(doc) = node.content_document.as_ref() {
            let mut nested_position = 0u32;
            walk_children(doc, child_index, "", walk, &mut nested_position);
        }
    } else {
        walk_children(node, frame_index, xpath, walk, iframe_position);
    }
}

fn accessible_name(node: &DomNode) -> Option<String> {
    for attr in ["aria-label", "title", "placeholder"] {
        if let Some(value) = node.attribute(attr) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: serde_json::Value) -> DomNode {
        serde_json::from_value(value).unwrap()
    }

    fn document_with_body(children: serde_json::Value) -> DomNode {
        node(json!({
            "nodeId": 1, "backendNodeId": 1, "nodeType": 9, "nodeName": "#document",
            "localName": "", "nodeValue": "",
            "children": [{
                "nodeId": 2, "backendNodeId": 2, "nodeType": 1, "nodeName": "HTML",
                "localName": "html", "nodeValue": "",
                "children": [{
                    "nodeId": 3, "backendNodeId": 3, "nodeType": 1, "nodeName": "BODY",
                    "localName": "body", "nodeValue": "",
                    "children": children
                }]
            }]
        }))
    }

    #[test]
    fn single_button_produces_one_entry_per_map() {
        let doc = document_with_body(json!([{
            "nodeId": 4, "backendNodeId": 17, "nodeType": 1, "nodeName": "BUTTON",
            "localName": "button", "nodeValue": "",
            "attributes": ["id", "submit"]
        }]));

        let walk = walk_document(&doc, 0, 1);
        let id = EncodedId::new(0, 17);

        assert_eq!(walk.tag_name_map.get(&id).map(String::as_str), Some("button"));
        assert_eq!(walk.backend_node_map.get(&id), Some(&17));
        assert_eq!(
            walk.xpath_map.get(&id).map(String::as_str),
            Some("//button[@id=\"submit\"]")
        );
        assert!(walk.iframes.is_empty());
    }

    #[test]
    fn sibling_indices_count_like_named_siblings() {
        let doc = document_with_body(json!([
            {"nodeId": 4, "backendNodeId": 10, "nodeType": 1, "nodeName": "DIV",
             "localName": "div", "nodeValue": ""},
            {"nodeId": 5, "backendNodeId": 11, "nodeType": 1, "nodeName": "SPAN",
             "localName": "span", "nodeValue": ""},
            {"nodeId": 6, "backendNodeId": 12, "nodeType": 1, "nodeName": "DIV",
             "localName": "div", "nodeValue": ""}
        ]));

        let walk = walk_document(&doc, 0, 1);
        assert_eq!(
            walk.xpath_map.get(&EncodedId::new(0, 10)).unwrap(),
            "/html[1]/body[1]/div[1]"
        );
        assert_eq!(
            walk.xpath_map.get(&EncodedId::new(0, 11)).unwrap(),
            "/html[1]/body[1]/span[1]"
        );
        assert_eq!(
            walk.xpath_map.get(&EncodedId::new(0, 12)).unwrap(),
            "/html[1]/body[1]/div[2]"
        );
    }

    #[test]
    fn accessible_names_come_from_aria_label_title_placeholder() {
        let doc = document_with_body(json!([
            {"nodeId": 4, "backendNodeId": 10, "nodeType": 1, "nodeName": "INPUT",
             "localName": "input", "nodeValue": "", "attributes": ["placeholder", "Search"]},
            {"nodeId": 5, "backendNodeId": 11, "nodeType": 1, "nodeName": "BUTTON",
             "localName": "button", "nodeValue": "", "attributes": ["aria-label", "Close"]}
        ]));

        let walk = walk_document(&doc, 0, 1);
        assert_eq!(
            walk.accessible_name_map.get(&EncodedId::new(0, 10)).unwrap(),
            "Search"
        );
        assert_eq!(
            walk.accessible_name_map.get(&EncodedId::new(0, 11)).unwrap(),
            "Close"
        );
    }

    #[test]
    fn same_origin_iframe_is_recursed_with_new_frame_index() {
        let doc = document_with_body(json!([{
            "nodeId": 4, "backendNodeId": 20, "nodeType": 1, "nodeName": "IFRAME",
            "localName": "iframe", "nodeValue": "", "attributes": ["src", "/f.html"],
            "contentDocument": {
                "nodeId": 10, "backendNodeId": 21, "nodeType": 9, "nodeName": "#document",
                "localName": "", "nodeValue": "",
                "children": [{
                    "nodeId": 11, "backendNodeId": 22, "nodeType": 1, "nodeName": "HTML",
                    "localName": "html", "nodeValue": "",
                    "children": [{
                        "nodeId": 12, "backendNodeId": 23, "nodeType": 1, "nodeName": "BODY",
                        "localName": "body", "nodeValue": "",
                        "children": [{
                            "nodeId": 13, "backendNodeId": 24, "nodeType": 1,
                            "nodeName": "INPUT", "localName": "input", "nodeValue": "",
                            "attributes": ["type", "text", "name", "q"]
                        }]
                    }]
                }]
            }
        }]));

        let walk = walk_document(&doc, 0, 1);

        assert_eq!(walk.iframes.len(), 1);
        let info = &walk.iframes[0];
        assert_eq!(info.frame_index, 1);
        assert_eq!(info.parent_frame_index, Some(0));
        assert_eq!(info.iframe_backend_node_id, 20);
        assert_eq!(info.content_document_backend_node_id, Some(21));
        assert_eq!(info.src.as_deref(), Some("/f.html"));
        assert_eq!(info.sibling_position, 1);

        // Child document entries carry the child frame index and a
        // document-relative xpath.
        let inner = EncodedId::new(1, 24);
        assert_eq!(walk.tag_name_map.get(&inner).map(String::as_str), Some("input"));
        assert_eq!(
            walk.xpath_map.get(&inner).unwrap(),
            "/html[1]/body[1]/input[1]"
        );
        assert_eq!(walk.next_frame_index, 2);
    }

    #[test]
    fn oopif_iframe_records_outer_entry_only() {
        let doc = document_with_body(json!([{
            "nodeId": 4, "backendNodeId": 30, "nodeType": 1, "nodeName": "IFRAME",
            "localName": "iframe", "nodeValue": "",
            "attributes": ["src", "https://ads.example/frame"]
        }]));

        let walk = walk_document(&doc, 0, 1);
        assert_eq!(walk.iframes.len(), 1);
        assert_eq!(walk.iframes[0].content_document_backend_node_id, None);
        // Only the iframe element itself was mapped, nothing inside it.
        assert!(walk.backend_node_map.contains_key(&EncodedId::new(0, 30)));
        assert_eq!(walk.backend_node_map.len(), 3); // html, body, iframe
    }

    #[test]
    fn strip_frames_removes_all_entries_for_dropped_indices() {
        let doc = document_with_body(json!([{
            "nodeId": 4, "backendNodeId": 20, "nodeType": 1, "nodeName": "IFRAME",
            "localName": "iframe", "nodeValue": "",
            "contentDocument": {
                "nodeId": 10, "backendNodeId": 21, "nodeType": 9, "nodeName": "#document",
                "localName": "", "nodeValue": "",
                "children": [{
                    "nodeId": 11, "backendNodeId": 22, "nodeType": 1, "nodeName": "HTML",
                    "localName": "html", "nodeValue": "", "children": []
                }]
            }
        }]));

        let mut walk = walk_document(&doc, 0, 1);
        assert!(walk.backend_node_map.contains_key(&EncodedId::new(1, 22)));

        walk.strip_frames(&[1]);
        assert!(!walk.backend_node_map.contains_key(&EncodedId::new(1, 22)));
        assert!(walk.iframes.is_empty());
        // Main-frame entries survive.
        assert!(walk.backend_node_map.contains_key(&EncodedId::new(0, 20)));
    }
}
