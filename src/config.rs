//! # Configuration
//!
//! Plain data structures with serde derives and defaults. A protocol can be
//! built entirely from `Default::default()`; deployments that tune queue
//! depths or session caps can load the same structures from JSON.

use crate::packet::PacketLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for one protocol instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Depth of the outbound frame channel feeding the writer task.
    pub outbox_capacity: usize,
    /// Hard cap on a single inbound frame.
    pub max_frame_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: crate::defaults::OUTBOX_CAPACITY,
            max_frame_len: crate::defaults::MAX_FRAME_LEN,
        }
    }
}

impl ProtocolConfig {
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(std::io::Error::from)
    }
}

/// Configuration for one handler registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Depth of the bounded inbound queue; overflow is answered on the
    /// wire with a BUSY error.
    pub queue_capacity: usize,
    /// Cap on concurrently open sessions; excess Starts are answered Busy.
    pub max_sessions: usize,
    /// Advisory level stamped on frames this handler emits.
    pub level: PacketLevel,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            max_sessions: crate::defaults::MAX_SESSIONS,
            level: PacketLevel::SessionHandler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.outbox_capacity, crate::defaults::OUTBOX_CAPACITY);
        assert_eq!(cfg.max_frame_len, crate::defaults::MAX_FRAME_LEN);

        let hc = HandlerConfig::default();
        assert!(hc.queue_capacity > 0);
        assert!(hc.max_sessions > 0);
        assert_eq!(hc.level, PacketLevel::SessionHandler);
    }

    #[test]
    fn config_parses_from_json() {
        let cfg = ProtocolConfig::from_json_str(
            r#"{ "outbox_capacity": 8, "max_frame_len": 1024 }"#,
        )
        .unwrap();
        assert_eq!(cfg.outbox_capacity, 8);
        assert_eq!(cfg.max_frame_len, 1024);
    }

    #[test]
    fn handler_config_round_trips_through_json() {
        let hc = HandlerConfig {
            queue_capacity: 4,
            max_sessions: 1,
            level: PacketLevel::Service,
        };
        let raw = serde_json::to_string(&hc).unwrap();
        let back: HandlerConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.queue_capacity, 4);
        assert_eq!(back.max_sessions, 1);
        assert_eq!(back.level, PacketLevel::Service);
    }
}
