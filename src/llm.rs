//! Language-model boundary.
//!
//! The engine consumes two services from whatever model adapter the
//! integrator plugs in — a structured single call and a free-form call —
//! and provides the schemas it needs: the element-finding result and the
//! multi-step agent envelope. Prompt assembly beyond these messages,
//! provider conversions and retries below this seam are the adapter's
//! business.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::actions::METHODS;
use crate::capture::Snapshot;
use crate::encoded::EncodedId;
use crate::error::{Error, Result};

/// Structured-output attempts before giving up (fatal)
const STRUCTURED_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }
}

/// Result of one structured call: the raw text plus the adapter's parse
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub raw: String,
    pub parsed: Option<Value>,
}

/// The model adapter seam
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single schema-constrained call
    async fn invoke_structured(
        &self,
        schema: &Value,
        messages: &[LlmMessage],
    ) -> Result<StructuredResponse>;

    /// Free-form call, for extraction flows
    async fn invoke(&self, messages: &[LlmMessage]) -> Result<String>;
}

/// An element the model selected for an instruction
#[derive(Debug, Clone)]
pub struct ElementMatch {
    pub encoded_id: EncodedId,
    pub description: String,
    pub method: String,
    pub arguments: Vec<String>,
    pub confidence: f64,
}

/// Schema for the element-finding result
pub fn find_element_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "elements": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "elementId": {
                            "type": "string",
                            "pattern": "^\\d+-\\d+$",
                            "description": "The bracketed id of the chosen element"
                        },
                        "description": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                        "method": { "type": "string", "enum": METHODS },
                        "arguments": {
                            "type": "array",
                            "items": { "type": "string" }
                        }
                    },
                    "required": ["elementId", "description", "confidence", "method", "arguments"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["elements"],
        "additionalProperties": false
    })
}

/// Envelope schema for multi-step agent integration: a tagged union over the
/// registered action set (the twelve built-ins plus any custom names)
pub fn agent_action_schema(custom_actions: &[String]) -> Value {
    let mut action_names: Vec<&str> = METHODS.to_vec();
    for name in custom_actions {
        action_names.push(name.as_str());
    }

    json!({
        "type": "object",
        "properties": {
            "thoughts": { "type": "string" },
            "memory": { "type": "string" },
            "action": {
                "type": "object",
                "properties": {
                    "type": { "type": "string", "enum": action_names },
                    "params": {
                        "type": "object",
                        "properties": {
                            "elementId": { "type": "string", "pattern": "^\\d+-\\d+$" },
                            "arguments": {
                                "type": "array",
                                "items": { "type": "string" }
                            }
                        },
                        "required": ["elementId", "arguments"],
                        "additionalProperties": false
                    }
                },
                "required": ["type", "params"],
                "additionalProperties": false
            }
        },
        "required": ["thoughts", "memory", "action"],
        "additionalProperties": false
    })
}

fn build_find_messages(instruction: &str, dom_state: &str) -> Vec<LlmMessage> {
    vec![
        LlmMessage::system(
            "You control a web page through its element listing. Each line is \
             `[frameIndex-backendNodeId] role: name`. Select the single element \
             that best fulfills the user's instruction, the method to apply to \
             it, and the method's arguments. Respond only with the requested \
             structure; use an empty elements array when nothing fits.",
        ),
        LlmMessage::user(format!(
            "Instruction: {}\n\nPage elements:\n{}",
            instruction, dom_state
        )),
    ]
}

fn parse_match(value: &Value, snapshot: &Snapshot) -> Option<Result<Option<ElementMatch>>> {
    let elements = value.get("elements")?.as_array()?;
    let Some(first) = elements.first() else {
        return Some(Ok(None));
    };

    let element_id = first.get("elementId")?.as_str()?;
    let encoded_id: EncodedId = match element_id.parse() {
        Ok(id) => id,
        Err(_) => return None,
    };

    let method = first.get("method")?.as_str()?.to_string();
    if !METHODS.contains(&method.as_str()) {
        return None;
    }

    if snapshot.backend_node_id(&encoded_id).is_none() {
        tracing::warn!("Model selected unknown element {}", encoded_id);
        return Some(Ok(None));
    }

    let arguments = first
        .get("arguments")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let confidence = first
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    Some(Ok(Some(ElementMatch {
        encoded_id,
        description: first
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        method,
        arguments,
        confidence,
    })))
}

/// Ask the model to pick an element for an instruction against a snapshot.
///
/// Up to three structured attempts; a model that never produces a parseable
/// result is a fatal [`Error::NoStructuredOutput`]. A parseable result that
/// selects nothing (or something the snapshot does not contain) is
/// `Ok(None)`.
pub async fn find_element(
    llm: &dyn LlmClient,
    instruction: &str,
    snapshot: &Snapshot,
) -> Result<Option<ElementMatch>> {
    let schema = find_element_schema();
    let messages = build_find_messages(instruction, &snapshot.dom_state);

    for attempt in 1..=STRUCTURED_ATTEMPTS {
        let response = llm.invoke_structured(&schema, &messages).await?;

        let parsed = response
            .parsed
            .or_else(|| serde_json::from_str(&response.raw).ok());

        if let Some(value) = parsed {
            if let Some(result) = parse_match(&value, snapshot) {
                return result;
            }
        }
        tracing::warn!(
            "Structured element-finding attempt {}/{} unparseable",
            attempt,
            STRUCTURED_ATTEMPTS
        );
    }

    Err(Error::NoStructuredOutput {
        attempts: STRUCTURED_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureMetrics, SnapshotParts};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn snapshot_with_button() -> Snapshot {
        let id = EncodedId::new(0, 12);
        Snapshot::assemble(SnapshotParts {
            dom_state: "=== Frame 0 (Main) ===\n[0-12] button: Submit\n".to_string(),
            elements: HashMap::new(),
            xpath_map: HashMap::from([(id, "//button[@id=\"submit\"]".to_string())]),
            backend_node_map: HashMap::from([(id, 12)]),
            frame_map: HashMap::new(),
            bounding_box_map: None,
            visual_overlay: None,
            box_failures: Vec::new(),
            metrics: CaptureMetrics::default(),
            epoch: 0,
        })
    }

    struct ScriptedLlm {
        responses: Mutex<Vec<StructuredResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<StructuredResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn invoke_structured(
            &self,
            _schema: &Value,
            _messages: &[LlmMessage],
        ) -> Result<StructuredResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(StructuredResponse {
                    raw: "not json".to_string(),
                    parsed: None,
                });
            }
            Ok(responses.remove(0))
        }

        async fn invoke(&self, _messages: &[LlmMessage]) -> Result<String> {
            Ok(String::new())
        }
    }

    fn structured(value: Value) -> StructuredResponse {
        StructuredResponse {
            raw: value.to_string(),
            parsed: Some(value),
        }
    }

    #[tokio::test]
    async fn returns_the_selected_element() {
        let snapshot = snapshot_with_button();
        let llm = ScriptedLlm::new(vec![structured(json!({
            "elements": [{
                "elementId": "0-12",
                "description": "the submit button",
                "confidence": 0.92,
                "method": "click",
                "arguments": []
            }]
        }))]);

        let found = find_element(&llm, "click submit", &snapshot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.encoded_id, EncodedId::new(0, 12));
        assert_eq!(found.method, "click");
        assert!((found.confidence - 0.92).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn empty_selection_is_not_found() {
        let snapshot = snapshot_with_button();
        let llm = ScriptedLlm::new(vec![structured(json!({ "elements": [] }))]);

        let found = find_element(&llm, "click submit", &snapshot).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn unknown_element_selection_is_not_found() {
        let snapshot = snapshot_with_button();
        let llm = ScriptedLlm::new(vec![structured(json!({
            "elements": [{
                "elementId": "0-9999",
                "description": "ghost",
                "confidence": 1.0,
                "method": "click",
                "arguments": []
            }]
        }))]);

        let found = find_element(&llm, "click submit", &snapshot).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn unparseable_output_three_times_is_fatal() {
        let snapshot = snapshot_with_button();
        let llm = ScriptedLlm::new(vec![]);

        let err = find_element(&llm, "click submit", &snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoStructuredOutput { attempts: 3 }));
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_parses() {
        let snapshot = snapshot_with_button();
        let llm = ScriptedLlm::new(vec![
            StructuredResponse {
                raw: "garbage".to_string(),
                parsed: None,
            },
            structured(json!({
                "elements": [{
                    "elementId": "0-12",
                    "description": "the submit button",
                    "confidence": 2.5,
                    "method": "click",
                    "arguments": []
                }]
            })),
        ]);

        let found = find_element(&llm, "click submit", &snapshot)
            .await
            .unwrap()
            .unwrap();
        // Out-of-range confidence is clamped.
        assert!((found.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn find_schema_covers_the_closed_method_set() {
        let schema = find_element_schema();
        let methods = schema["properties"]["elements"]["items"]["properties"]["method"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(methods.len(), 12);
        assert!(methods.iter().any(|m| m == "selectOptionFromDropdown"));
    }

    #[test]
    fn agent_schema_includes_custom_actions() {
        let schema = agent_action_schema(&["waitForCaptcha".to_string()]);
        let actions = schema["properties"]["action"]["properties"]["type"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(actions.len(), 13);
        assert!(actions.iter().any(|a| a == "waitForCaptcha"));
    }
}
