//! Server-side connection configuration

use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use stompwire_proto::MAX_FRAME_SIZE;

/// Heart-beat intervals in milliseconds, `0` meaning none
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeat {
    /// Smallest interval at which this side sends heart-beats
    pub send_ms: u64,
    /// Interval at which this side wants to receive heart-beats
    pub receive_ms: u64,
}

impl HeartBeat {
    /// Create a heart-beat setting
    pub fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self { send_ms, receive_ms }
    }

    /// Parse a `heart-beat` header value (`<send>,<receive>`)
    pub fn parse(value: &str) -> std::result::Result<Self, ProtocolError> {
        let invalid = || {
            ProtocolError::new(format!("Invalid heart-beat header: {}", value))
                .with_body("heart-beat must be two comma separated integers")
        };
        let (send, receive) = value.split_once(',').ok_or_else(invalid)?;
        Ok(Self {
            send_ms: send.trim().parse().map_err(|_| invalid())?,
            receive_ms: receive.trim().parse().map_err(|_| invalid())?,
        })
    }

    /// Negotiate the server side intervals against the client's request
    ///
    /// The result is from the server's point of view: `send_ms` is how often
    /// the server sends, `receive_ms` how often it expects client data.
    pub fn negotiate(server: HeartBeat, client: HeartBeat) -> HeartBeat {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                0
            } else {
                ours.max(theirs)
            }
        };
        HeartBeat {
            send_ms: pick(server.send_ms, client.receive_ms),
            receive_ms: pick(server.receive_ms, client.send_ms),
        }
    }

    /// Expected interval between inbound data, if any
    pub fn receive_interval(&self) -> Option<Duration> {
        (self.receive_ms > 0).then(|| Duration::from_millis(self.receive_ms))
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StompConfig {
    /// Value of the `server` header sent in 1.1 `CONNECTED` frames
    pub server_name: String,
    /// Largest frame the decoder will buffer
    pub max_frame_size: usize,
    /// Heart-beat intervals offered by the server
    pub heart_beat: HeartBeat,
    /// Size of each transport read
    pub read_buffer_size: usize,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            server_name: format!("stompwire/{}", env!("CARGO_PKG_VERSION")),
            max_frame_size: MAX_FRAME_SIZE,
            heart_beat: HeartBeat::default(),
            read_buffer_size: 8192,
        }
    }
}

impl StompConfig {
    /// Load a configuration from JSON, missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the server name
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set the server heart-beat offer
    pub fn with_heart_beat(mut self, heart_beat: HeartBeat) -> Self {
        self.heart_beat = heart_beat;
        self
    }

    /// Set the transport read size
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_config() {
        let config = StompConfig::default();
        assert!(config.server_name.starts_with("stompwire/"));
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.heart_beat, HeartBeat::new(0, 0));
        assert_eq!(config.read_buffer_size, 8192);
    }

    #[test]
    fn test_config_builder() {
        let config = StompConfig::default()
            .with_server_name("broker-1")
            .with_max_frame_size(1024)
            .with_heart_beat(HeartBeat::new(1000, 2000))
            .with_read_buffer_size(512);

        assert_eq!(config.server_name, "broker-1");
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.heart_beat.receive_ms, 2000);
        assert_eq!(config.read_buffer_size, 512);
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = StompConfig::from_json(r#"{"server_name":"edge","heart_beat":{"send_ms":500,"receive_ms":0}}"#)
            .unwrap();

        assert_eq!(config.server_name, "edge");
        assert_eq!(config.heart_beat, HeartBeat::new(500, 0));
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);

        assert!(StompConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_heart_beat_parse() {
        assert_eq!(HeartBeat::parse("100, 200").unwrap(), HeartBeat::new(100, 200));
        assert!(HeartBeat::parse("100").is_err());
        assert!(HeartBeat::parse("a,b").is_err());
    }

    #[test]
    fn test_heart_beat_negotiation() {
        let server = HeartBeat::new(1000, 3000);

        assert_eq!(
            HeartBeat::negotiate(server, HeartBeat::new(5000, 500)),
            HeartBeat::new(1000, 5000)
        );
        assert_eq!(
            HeartBeat::negotiate(server, HeartBeat::new(0, 4000)),
            HeartBeat::new(4000, 0)
        );
        assert_eq!(
            HeartBeat::negotiate(HeartBeat::default(), HeartBeat::new(100, 100)),
            HeartBeat::default()
        );
        assert_eq!(HeartBeat::new(1000, 5000).to_string(), "1000,5000");
    }

    proptest! {
        #[test]
        fn prop_heart_beat_header_roundtrip(send in 0u64..1_000_000, receive in 0u64..1_000_000) {
            let heart_beat = HeartBeat::new(send, receive);
            prop_assert_eq!(HeartBeat::parse(&heart_beat.to_string()).unwrap(), heart_beat);
        }

        #[test]
        fn prop_negotiated_interval_never_shorter(
            server in (0u64..10_000, 0u64..10_000),
            client in (0u64..10_000, 0u64..10_000),
        ) {
            let server = HeartBeat::new(server.0, server.1);
            let client = HeartBeat::new(client.0, client.1);
            let agreed = HeartBeat::negotiate(server, client);

            if agreed.send_ms != 0 {
                prop_assert!(agreed.send_ms >= server.send_ms && agreed.send_ms >= client.receive_ms);
            } else {
                prop_assert!(server.send_ms == 0 || client.receive_ms == 0);
            }
            prop_assert_eq!(agreed.receive_interval().is_some(), server.receive_ms != 0 && client.send_ms != 0);
        }
    }
}
