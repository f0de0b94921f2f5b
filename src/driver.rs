//! Browser driver boundary.
//!
//! The engine needs exactly three operations from whatever owns the browser:
//! a CDP session for a page, an enumeration of the page's frames, and a child
//! CDP session for a given frame (the probe that detects OOPIFs). Any driver
//! exposing these is sufficient; [`CdpDriver`] implements them natively over
//! the Target domain.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cdp::{Connection, FrameTree, Session};
use crate::error::{Error, Result};

/// A frame as reported by the browser driver
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    pub url: String,
    pub name: Option<String>,
    /// URL of the parent frame's document; `None` for the main frame and for
    /// frames whose parent the driver cannot see (cross-process targets)
    pub parent_url: Option<String>,
    /// Dedicated target id, present only for frames the browser isolates
    /// into their own target
    pub target_id: Option<String>,
}

impl FrameDescriptor {
    /// True when this descriptor names the page's main frame
    pub fn is_main(&self) -> bool {
        self.parent_url.is_none() && self.target_id.is_none()
    }
}

/// Browser boundary: the three operations the engine requires
#[async_trait]
pub trait Driver: Send + Sync {
    /// A CDP session routed to the page's main target
    async fn page_session(&self, page: &str) -> Result<Session>;

    /// All frames of the page the driver knows about
    async fn frames(&self, page: &str) -> Result<Vec<FrameDescriptor>>;

    /// Open a dedicated child CDP session for a frame. Fails for frames that
    /// have no target of their own (same-origin iframes).
    async fn frame_session(&self, page: &str, frame: &FrameDescriptor) -> Result<Session>;
}

/// CDP-native driver over a browser connection
pub struct CdpDriver {
    connection: Connection,
    sessions: Mutex<HashMap<String, Session>>,
}

impl CdpDriver {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to a DevTools WebSocket URL
    pub fn connect(ws_url: &str) -> Result<Self> {
        Ok(Self::new(Connection::connect(ws_url)?))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn collect_tree(tree: &FrameTree, parent_url: Option<&str>, out: &mut Vec<FrameDescriptor>) {
        out.push(FrameDescriptor {
            url: tree.frame.url.clone(),
            name: tree.frame.name.clone(),
            parent_url: parent_url.map(String::from),
            target_id: None,
        });
        for child in &tree.child_frames {
            Self::collect_tree(child, Some(&tree.frame.url), out);
        }
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn page_session(&self, page: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(page) {
            return Ok(session.clone());
        }
        let session = self.connection.attach(page).await?;
        sessions.insert(page.to_string(), session.clone());
        Ok(session)
    }

    async fn frames(&self, page: &str) -> Result<Vec<FrameDescriptor>> {
        let session = self.page_session(page).await?;
        let tree = session.get_frame_tree().await?;

        let mut frames = Vec::new();
        Self::collect_tree(&tree, None, &mut frames);

        // Frames the browser isolated into their own process do not appear
        // in the page's frame tree; they surface as iframe-type targets.
        for target in self.connection.targets().await? {
            if target.r#type == "iframe" {
                frames.push(FrameDescriptor {
                    url: target.url.clone(),
                    name: None,
                    parent_url: Some(tree.frame.url.clone()),
                    target_id: Some(target.target_id),
                });
            }
        }

        Ok(frames)
    }

    async fn frame_session(&self, _page: &str, frame: &FrameDescriptor) -> Result<Session> {
        let target_id = frame.target_id.as_deref().ok_or_else(|| {
            Error::CdpSimple(format!("frame {} has no dedicated target", frame.url))
        })?;
        self.connection.attach(target_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_frame_descriptor_is_detected() {
        let main = FrameDescriptor {
            url: "https://example.com".into(),
            name: None,
            parent_url: None,
            target_id: None,
        };
        assert!(main.is_main());

        let child = FrameDescriptor {
            url: "https://example.com/child".into(),
            name: None,
            parent_url: Some("https://example.com".into()),
            target_id: None,
        };
        assert!(!child.is_main());

        let oopif = FrameDescriptor {
            url: "https://ads.example".into(),
            name: None,
            parent_url: None,
            target_id: Some("T1".into()),
        };
        assert!(!oopif.is_main());
    }
}
