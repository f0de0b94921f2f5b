//! Stable element addressing.
//!
//! Every element the engine exposes is addressed by an [`EncodedId`]: the
//! frame index assigned by depth-first DOM traversal (main frame = 0) paired
//! with the CDP backend node id of the element inside that frame's document.
//! The wire format is `"<frameIndex>-<backendNodeId>"`.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A stable element address: `"<frameIndex>-<backendNodeId>"`.
///
/// Both components are non-negative decimal integers without leading zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodedId {
    pub frame_index: u32,
    pub backend_node_id: i64,
}

impl EncodedId {
    pub fn new(frame_index: u32, backend_node_id: i64) -> Self {
        Self {
            frame_index,
            backend_node_id,
        }
    }

    /// True for elements addressed inside the main frame
    pub fn is_main_frame(&self) -> bool {
        self.frame_index == 0
    }
}

impl fmt::Display for EncodedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.frame_index, self.backend_node_id)
    }
}

/// A decimal integer with no sign and no leading zeros
fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl FromStr for EncodedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (frame, node) = s
            .split_once('-')
            .ok_or_else(|| Error::BadEncodedId(s.to_string()))?;

        let frame_index = parse_component(frame)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::BadEncodedId(s.to_string()))?;
        let backend_node_id = parse_component(node)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(|| Error::BadEncodedId(s.to_string()))?;

        Ok(Self {
            frame_index,
            backend_node_id,
        })
    }
}

impl Serialize for EncodedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct EncodedIdVisitor;

impl Visitor<'_> for EncodedIdVisitor {
    type Value = EncodedId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string of the form \"<frameIndex>-<backendNodeId>\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(v), &"frameIndex-backendNodeId")
        })
    }
}

impl<'de> Deserialize<'de> for EncodedId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(EncodedIdVisitor)
    }
}
