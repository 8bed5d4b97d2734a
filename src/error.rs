//! Error types for the session engine
//!
//! Categorizes failures by recovery strategy: peer errors recycle the
//! connection, tracker errors back off, disk errors pause the torrent,
//! resume corruption falls back to a full re-check.

use std::fmt;

/// Categorized error type for engine operations
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Wire-protocol violations (malformed or oversized messages)
    Protocol {
        message: String,
        detail: Option<String>,
    },

    /// Per-peer failures (handshake, timeout, hash-check threshold)
    Peer {
        message: String,
        peer: Option<String>,
        detail: Option<String>,
    },

    /// Tracker announce failures (unreachable, malformed response)
    Tracker {
        message: String,
        url: Option<String>,
        detail: Option<String>,
    },

    /// Disk I/O failures (write failure, permission denied)
    Disk {
        message: String,
        path: Option<String>,
        detail: Option<String>,
    },

    /// Resume-record failures (corrupt or unmigratable record)
    Resume {
        message: String,
        detail: Option<String>,
    },

    /// Configuration errors
    Config {
        message: String,
        field: Option<String>,
    },

    /// Network errors (connect, bind, address parsing)
    Network {
        message: String,
        address: Option<String>,
        detail: Option<String>,
    },
}

impl EngineError {
    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a new Protocol error with detail
    pub fn protocol_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::Protocol {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Create a new Peer error
    pub fn peer(message: impl Into<String>) -> Self {
        EngineError::Peer {
            message: message.into(),
            peer: None,
            detail: None,
        }
    }

    /// Create a new Peer error with peer address
    pub fn peer_with_addr(message: impl Into<String>, peer: impl Into<String>) -> Self {
        EngineError::Peer {
            message: message.into(),
            peer: Some(peer.into()),
            detail: None,
        }
    }

    /// Create a new Peer error with peer address and detail
    pub fn peer_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        EngineError::Peer {
            message: message.into(),
            peer: Some(peer.into()),
            detail: Some(detail.into()),
        }
    }

    /// Create a new Tracker error
    pub fn tracker(message: impl Into<String>) -> Self {
        EngineError::Tracker {
            message: message.into(),
            url: None,
            detail: None,
        }
    }

    /// Create a new Tracker error with announce URL
    pub fn tracker_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        EngineError::Tracker {
            message: message.into(),
            url: Some(url.into()),
            detail: None,
        }
    }

    /// Create a new Tracker error with announce URL and detail
    pub fn tracker_full(
        message: impl Into<String>,
        url: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        EngineError::Tracker {
            message: message.into(),
            url: Some(url.into()),
            detail: Some(detail.into()),
        }
    }

    /// Create a new Disk error
    pub fn disk(message: impl Into<String>) -> Self {
        EngineError::Disk {
            message: message.into(),
            path: None,
            detail: None,
        }
    }

    /// Create a new Disk error with path
    pub fn disk_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        EngineError::Disk {
            message: message.into(),
            path: Some(path.into()),
            detail: None,
        }
    }

    /// Create a new Disk error with path and detail
    pub fn disk_full(
        message: impl Into<String>,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        EngineError::Disk {
            message: message.into(),
            path: Some(path.into()),
            detail: Some(detail.into()),
        }
    }

    /// Create a new Resume error
    pub fn resume(message: impl Into<String>) -> Self {
        EngineError::Resume {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a new Resume error with detail
    pub fn resume_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::Resume {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new Config error with field
    pub fn config_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        EngineError::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new Network error
    pub fn network(message: impl Into<String>) -> Self {
        EngineError::Network {
            message: message.into(),
            address: None,
            detail: None,
        }
    }

    /// Create a new Network error with address
    pub fn network_with_addr(message: impl Into<String>, address: impl Into<String>) -> Self {
        EngineError::Network {
            message: message.into(),
            address: Some(address.into()),
            detail: None,
        }
    }

    /// Create a new Network error with address and detail
    pub fn network_full(
        message: impl Into<String>,
        address: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        EngineError::Network {
            message: message.into(),
            address: Some(address.into()),
            detail: Some(detail.into()),
        }
    }

    /// True when the failure should pause the affected torrent
    pub fn pauses_torrent(&self) -> bool {
        matches!(self, EngineError::Disk { .. })
    }

    /// Short category label used in status strings and events
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Protocol { .. } => "protocol",
            EngineError::Peer { .. } => "peer",
            EngineError::Tracker { .. } => "tracker",
            EngineError::Disk { .. } => "disk",
            EngineError::Resume { .. } => "resume",
            EngineError::Config { .. } => "config",
            EngineError::Network { .. } => "network",
        }
    }
}

fn write_tagged(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    message: &str,
    pairs: &[(&str, &Option<String>)],
) -> fmt::Result {
    write!(f, "{} error: {}", label, message)?;
    let present: Vec<String> = pairs
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}: {}", k, v)))
        .collect();
    if !present.is_empty() {
        write!(f, " ({})", present.join(", "))?;
    }
    Ok(())
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Protocol { message, detail } => {
                write_tagged(f, "Protocol", message, &[("detail", detail)])
            }
            EngineError::Peer {
                message,
                peer,
                detail,
            } => write_tagged(f, "Peer", message, &[("peer", peer), ("detail", detail)]),
            EngineError::Tracker {
                message,
                url,
                detail,
            } => write_tagged(f, "Tracker", message, &[("url", url), ("detail", detail)]),
            EngineError::Disk {
                message,
                path,
                detail,
            } => write_tagged(f, "Disk", message, &[("path", path), ("detail", detail)]),
            EngineError::Resume { message, detail } => {
                write_tagged(f, "Resume", message, &[("detail", detail)])
            }
            EngineError::Config { message, field } => {
                write_tagged(f, "Config", message, &[("field", field)])
            }
            EngineError::Network {
                message,
                address,
                detail,
            } => write_tagged(
                f,
                "Network",
                message,
                &[("address", address), ("detail", detail)],
            ),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::disk_full(err.to_string(), "unknown", err.kind().to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::resume_with_detail("Failed to decode resume record", err.to_string())
    }
}

impl From<serde_bencode::Error> for EngineError {
    fn from(err: serde_bencode::Error) -> Self {
        EngineError::tracker_full("Failed to decode announce response", "unknown", err.to_string())
    }
}

impl From<std::net::AddrParseError> for EngineError {
    fn from(err: std::net::AddrParseError) -> Self {
        EngineError::network_full("Failed to parse address", "unknown", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        EngineError::network("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = EngineError::protocol("oversized message");
        assert_eq!(err.to_string(), "Protocol error: oversized message");
    }

    #[test]
    fn test_peer_error_carries_addr_and_detail() {
        let err = EngineError::peer_full("handshake failed", "10.0.0.1:6881", "bad info hash");
        let rendered = err.to_string();
        assert!(rendered.contains("Peer error"));
        assert!(rendered.contains("10.0.0.1:6881"));
        assert!(rendered.contains("bad info hash"));
    }

    #[test]
    fn test_tracker_error_with_url() {
        let err = EngineError::tracker_with_url("announce rejected", "http://t.example/announce");
        assert!(err.to_string().contains("http://t.example/announce"));
        assert_eq!(err.category(), "tracker");
    }

    #[test]
    fn test_disk_error_pauses_torrent() {
        let err = EngineError::disk_with_path("write failed", "/data/film.mkv");
        assert!(err.pauses_torrent());
        assert!(!EngineError::peer("timeout").pauses_torrent());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Disk { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let parse_err = "not-an-address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: EngineError = parse_err.into();
        assert!(matches!(err, EngineError::Network { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = EngineError::config_with_field("must be positive", "max_active_torrents");
        assert!(err.to_string().contains("max_active_torrents"));
    }

    #[test]
    fn test_resume_error_category() {
        let err = EngineError::resume("truncated record");
        assert_eq!(err.category(), "resume");
    }
}
