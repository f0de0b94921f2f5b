//! Error types for vantage

use thiserror::Error;

/// Result type for vantage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for vantage
#[derive(Debug, Error)]
pub enum Error {
    /// Transport error
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// CDP protocol error
    #[error("CDP error in {method}: {message} (code {code})")]
    Cdp {
        method: String,
        code: i64,
        message: String,
    },

    /// CDP error without method context (for simple cases)
    #[error("CDP error: {0}")]
    CdpSimple(String),

    /// Encoded id did not match `<frameIndex>-<backendNodeId>`
    #[error("Bad encoded id: {0}")]
    BadEncodedId(String),

    /// Malformed request (unknown method, wrong arguments)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Frame not present in the frame graph
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// Frame exists but its execution context never became available
    #[error("Frame not ready: no execution context for frame {frame_id}")]
    FrameNotReady { frame_id: String },

    /// Element not found
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Element id no longer resolves and XPath recovery failed
    #[error("Stale element: {encoded_id} could not be recovered")]
    StaleElement { encoded_id: String },

    /// Element exists but cannot be interacted with
    #[error("Element not interactable: {encoded_id} is {reason}")]
    NotInteractable { encoded_id: String, reason: String },

    /// LLM adapter failure
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM produced no parseable structured output
    #[error("No structured output after {attempts} attempts")]
    NoStructuredOutput { attempts: u32 },

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Page closed while an operation was in flight
    #[error("Page closed: {0}")]
    PageClosed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decode error (e.g., base64)
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Retry exhausted
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a CDP error with full context
    pub fn cdp(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Cdp {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Check if this is the "no node with given id" class of CDP errors.
    ///
    /// Raised by `DOM.resolveNode` and friends when a backend node id no
    /// longer identifies a live node (element recreated or document swapped).
    pub fn is_node_missing(&self) -> bool {
        match self {
            Error::Cdp { message, .. } => {
                message.contains("No node with given id")
                    || message.contains("Could not find node")
                    || message.contains("node with given id found")
            }
            _ => false,
        }
    }

    /// Check if this is an execution-context-destroyed error
    pub fn is_context_destroyed(&self) -> bool {
        match self {
            Error::Cdp { message, .. } => {
                message.contains("Execution context was destroyed")
                    || message.contains("Cannot find context")
                    || message.contains("Cannot find default execution context")
            }
            _ => false,
        }
    }

    /// Check if this is a target/session-closed error
    pub fn is_target_closed(&self) -> bool {
        match self {
            Error::Cdp { message, .. } => {
                message.contains("Target closed")
                    || message.contains("Session closed")
                    || message.contains("Session with given id not found")
            }
            Error::Transport { .. } => true,
            _ => false,
        }
    }

    /// Transient errors are recovered by capture retry or XPath recovery
    pub fn is_transient(&self) -> bool {
        self.is_node_missing() || self.is_context_destroyed() || self.is_target_closed()
    }

    /// Check if this is a "box model" error (element has no layout)
    pub fn is_no_layout(&self) -> bool {
        match self {
            Error::Cdp { message, .. } => message.contains("box model"),
            _ => false,
        }
    }
}
