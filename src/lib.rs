//! # Vantage
//!
//! Frame-aware page observation and action dispatch over the Chrome DevTools
//! Protocol, built for language-model-driven browser automation.
//!
//! Vantage turns a live CDP connection into a merged, stably-addressed view
//! of a page — main frame, same-origin iframes and out-of-process iframes —
//! and resolves those stable addresses back to precise CDP interactions that
//! survive DOM mutations and navigations.
//!
//! - **Snapshots** - accessibility + DOM capture across every frame, with one
//!   `"<frameIndex>-<backendNodeId>"` address per element
//! - **Frame graph** - live frame/session/context map synchronized from CDP
//!   events; OOPIFs get their own sessions automatically
//! - **Actions** - a closed twelve-method catalog (click, fill, type, press,
//!   select, check, hover, scroll variants) dispatched through CDP
//!   Input/Runtime/DOM with XPath-based stale-element recovery
//! - **Model seam** - bring your own `LlmClient`; the engine supplies the
//!   element listing and the schemas
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vantage::{CdpDriver, Engine, ObserveOptions};
//!
//! # async fn example(llm: &dyn vantage::LlmClient) -> vantage::Result<()> {
//! let driver = CdpDriver::connect("ws://127.0.0.1:9222/devtools/browser/abc")?;
//! let engine = Engine::with_defaults(driver);
//!
//! let snapshot = engine.observe("PAGE_TARGET_ID", &ObserveOptions::default()).await?;
//! println!("{}", snapshot.dom_state);
//!
//! if let Some(found) = engine.find_element("click the submit button", &snapshot, llm).await? {
//!     let outcome = engine
//!         .execute_action(
//!             "PAGE_TARGET_ID",
//!             &snapshot,
//!             &found.encoded_id.to_string(),
//!             &found.method,
//!             &found.arguments,
//!         )
//!         .await?;
//!     println!("{}", outcome.message);
//! }
//! # Ok(())
//! # }
//! ```

#![recursion_limit = "256"]

use std::path::PathBuf;
use std::time::Duration;

pub mod actions;
pub mod capture;
pub mod cdp;
pub mod driver;
pub mod encoded;
pub mod engine;
pub mod error;
pub mod frames;
pub mod llm;
pub mod overlay;
pub mod resolver;
pub mod settle;

// Re-exports
pub use actions::{Action, ActionOutcome, METHODS};
pub use capture::{AccessibilityNode, CaptureMetrics, IframeInfo, Rect, Snapshot};
pub use cdp::{Connection, Session, SessionKind, Transport};
pub use driver::{CdpDriver, Driver, FrameDescriptor};
pub use encoded::EncodedId;
pub use engine::{CustomAction, CustomActionInvocation, Engine};
pub use error::{Error, Result};
pub use frames::{FrameGraph, FrameRecord};
pub use llm::{ElementMatch, LlmClient, LlmMessage, LlmRole, StructuredResponse};
pub use resolver::ResolvedElement;
pub use settle::{SettleOutcome, SettleReason};

/// Engine-wide tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dispatch actions through CDP Input/Runtime/DOM primitives; when
    /// false, the XPath-driven fallback executor is used instead
    pub cdp_actions: bool,
    /// Age ceiling for serving a cached snapshot
    pub cache_max_age: Duration,
    /// Full-capture attempts before giving up on transient failures
    pub capture_retries: u32,
    /// Hard budget for the DOM settle wait
    pub settle_budget: Duration,
    /// Wait for a frame's execution context during element recovery
    pub context_wait: Duration,
    /// URL substrings recognizing ad/tracking frames, skipped before OOPIF
    /// session creation
    pub frame_deny_list: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cdp_actions: true,
            cache_max_age: Duration::from_secs(1),
            capture_retries: 3,
            settle_budget: Duration::from_millis(5000),
            context_wait: Duration::from_millis(750),
            frame_deny_list: vec![
                "doubleclick.net".into(),
                "googlesyndication.com".into(),
                "googletagmanager.com".into(),
                "adservice.".into(),
                "/ads/".into(),
            ],
        }
    }
}

impl EngineConfig {
    /// Config for the locator-style fallback path (no CDP action dispatch)
    pub fn without_cdp_actions() -> Self {
        Self {
            cdp_actions: false,
            ..Default::default()
        }
    }
}

/// Options for one observation cycle
#[derive(Debug, Clone, Default)]
pub struct ObserveOptions {
    /// Collect bounding boxes and compose the labelled overlay image
    pub visual_mode: bool,
    /// Serve a cached snapshot when it is still valid
    pub use_cache: bool,
    /// Emit per-frame progress as frames complete
    pub streaming: bool,
    /// Write per-capture artifacts (elems.txt, frames.json, perf.json, ...)
    pub debug_dir: Option<PathBuf>,
}

impl ObserveOptions {
    /// Visual-mode options: boxes and overlay included
    pub fn visual() -> Self {
        Self {
            visual_mode: true,
            ..Default::default()
        }
    }

    /// Cached observation
    pub fn cached() -> Self {
        Self {
            use_cache: true,
            ..Default::default()
        }
    }
}
