//! HTTP announce transport
//!
//! Builds announce URLs (binary info hash percent-encoded), performs
//! the GET, and decodes the bencoded response: interval, peer lists in
//! compact and dictionary form, and failure/warning strings.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::EngineError;
use crate::torrent::metadata::InfoHash;
use crate::tracker::state::AnnounceEvent;

/// HTTP budget for one announce round trip
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a tracker needs to know about us
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
}

/// Decoded announce response
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<u64>,
    pub leechers: Option<u64>,
    pub warning: Option<String>,
}

/// Shared HTTP client for all announces
#[derive(Clone)]
pub struct HttpAnnouncer {
    client: reqwest::Client,
}

impl HttpAnnouncer {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(|e| EngineError::tracker_full("Failed to build HTTP client", "", e.to_string()))?;
        Ok(Self { client })
    }

    /// Build the full announce URL for one tracker
    pub fn build_url(base: &str, params: &AnnounceParams) -> Result<String> {
        // Validate the base; the query is appended manually because the
        // info hash is raw binary, not UTF-8
        Url::parse(base).map_err(|e| {
            EngineError::tracker_full("Invalid announce URL", base, e.to_string())
        })?;
        let sep = if base.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            base,
            sep,
            urlencoding::encode_binary(&params.info_hash.handshake_bytes()),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.numwant,
        );
        if let Some(event) = params.event.query_value() {
            url.push_str("&event=");
            url.push_str(event);
        }
        Ok(url)
    }

    /// Announce to one tracker and decode the response
    pub async fn announce(&self, base: &str, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let url = Self::build_url(base, params)?;
        debug!(tracker = %base, event = ?params.event, "announcing");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::tracker_full("Announce request failed", base, e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::tracker_full("Announce body unreadable", base, e.to_string()))?;
        parse_response(&body)
            .map_err(|e| EngineError::tracker_full("Announce response rejected", base, e.to_string()).into())
    }
}

fn dict_get<'a>(dict: &'a [(Vec<u8>, Value)], key: &str) -> Option<&'a Value> {
    dict.iter()
        .find(|(k, _)| k.as_slice() == key.as_bytes())
        .map(|(_, v)| v)
}

/// Decode a bencoded announce response body
pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let root: Value = serde_bencode::from_bytes(body)
        .map_err(|e| EngineError::tracker_full("Malformed bencode", "", e.to_string()))?;
    let Value::Dict(map) = root else {
        return Err(EngineError::tracker("Response is not a dictionary").into());
    };
    let dict: Vec<(Vec<u8>, Value)> = map.into_iter().collect();

    if let Some(Value::Bytes(reason)) = dict_get(&dict, "failure reason") {
        return Err(EngineError::tracker_with_url(
            String::from_utf8_lossy(reason).into_owned(),
            "",
        )
        .into());
    }

    let mut out = AnnounceResponse::default();
    if let Some(Value::Int(secs)) = dict_get(&dict, "interval") {
        if *secs > 0 {
            out.interval = Some(Duration::from_secs(*secs as u64));
        }
    }
    if let Some(Value::Int(secs)) = dict_get(&dict, "min interval") {
        if *secs > 0 {
            out.min_interval = Some(Duration::from_secs(*secs as u64));
        }
    }
    if let Some(Value::Int(n)) = dict_get(&dict, "complete") {
        out.seeders = Some((*n).max(0) as u64);
    }
    if let Some(Value::Int(n)) = dict_get(&dict, "incomplete") {
        out.leechers = Some((*n).max(0) as u64);
    }
    if let Some(Value::Bytes(text)) = dict_get(&dict, "warning message") {
        out.warning = Some(String::from_utf8_lossy(text).into_owned());
    }

    match dict_get(&dict, "peers") {
        Some(Value::Bytes(compact)) => {
            if compact.len() % 6 != 0 {
                warn!(len = compact.len(), "compact peer list not a multiple of 6");
            }
            for chunk in compact.chunks_exact(6) {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                out.peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        }
        Some(Value::List(entries)) => {
            for entry in entries {
                let Value::Dict(peer_map) = entry else { continue };
                let peer: Vec<(Vec<u8>, Value)> = peer_map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let ip = match dict_get(&peer, "ip") {
                    Some(Value::Bytes(raw)) => String::from_utf8_lossy(raw).parse::<IpAddr>().ok(),
                    _ => None,
                };
                let port = match dict_get(&peer, "port") {
                    Some(Value::Int(p)) if (0..=u16::MAX as i64).contains(p) => Some(*p as u16),
                    _ => None,
                };
                if let (Some(ip), Some(port)) = (ip, port) {
                    out.peers.push(SocketAddr::new(ip, port));
                }
            }
        }
        _ => {}
    }

    if let Some(Value::Bytes(compact6)) = dict_get(&dict, "peers6") {
        for chunk in compact6.chunks_exact(18) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            out.peers
                .push(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash::V1([0xFF; 20]),
            peer_id: *b"-RP0100-abcdefghijkl",
            port: 6881,
            uploaded: 100,
            downloaded: 200,
            left: 300,
            event: AnnounceEvent::Started,
            numwant: 50,
        }
    }

    #[test]
    fn test_build_url_escapes_binary_hash() {
        let url = HttpAnnouncer::build_url("http://t.example/announce", &params()).unwrap();
        assert!(url.contains("info_hash=%FF%FF"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("event=started"));
        assert!(url.contains("left=300"));
    }

    #[test]
    fn test_build_url_appends_to_existing_query() {
        let url = HttpAnnouncer::build_url("http://t.example/announce?key=abc", &params()).unwrap();
        assert!(url.contains("?key=abc&info_hash="));
    }

    #[test]
    fn test_build_url_rejects_garbage() {
        assert!(HttpAnnouncer::build_url("not a url", &params()).is_err());
    }

    #[test]
    fn test_periodic_event_omitted() {
        let mut p = params();
        p.event = AnnounceEvent::Periodic;
        let url = HttpAnnouncer::build_url("http://t.example/announce", &p).unwrap();
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:intervali1800e12:min intervali60e8:completei5e10:incompletei7e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.interval, Some(Duration::from_secs(1800)));
        assert_eq!(resp.min_interval, Some(Duration::from_secs(60)));
        assert_eq!(resp.seeders, Some(5));
        assert_eq!(resp.leechers, Some(7));
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0], "10.0.0.1:6881".parse().unwrap());
        assert_eq!(resp.peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn test_parse_dict_model_peers() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.94:porti6881eeee".to_vec();
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.peers, vec!["10.0.0.9:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_failure_reason_is_error() {
        let body = b"d14:failure reason15:torrent unknowne".to_vec();
        let err = parse_response(&body).unwrap_err();
        assert!(err.to_string().contains("torrent unknown"));
    }

    #[test]
    fn test_parse_ipv6_compact_peers() {
        let mut body = b"d8:intervali900e6:peers618:".to_vec();
        let mut chunk = [0u8; 18];
        chunk[15] = 1; // ::1
        chunk[16..].copy_from_slice(&6881u16.to_be_bytes());
        body.extend_from_slice(&chunk);
        body.push(b'e');

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.peers, vec!["[::1]:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_rejects_non_dict() {
        assert!(parse_response(b"le").is_err());
        assert!(parse_response(b"garbage").is_err());
    }
}
