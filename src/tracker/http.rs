//! HTTP(S) tracker announces per BEP 3.
use super::{Announce, AnnounceRequest, TrackerError, NUM_WANT};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use url::Url;

/// Bencoded announce reply as sent by HTTP trackers.
#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default)]
    peers: Option<Peers>,
}

/// The `peers` value is either a compact byte string (6 bytes per peer) or
/// a list of dictionaries; both appear in the wild.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/**
Performs one HTTP GET announce.

The query carries `info_hash` and `peer_id` as percent-encoded raw bytes,
the transfer counters, `compact=1`, `numwant`, and the event name when one
is set. The response timeout comes from the shared `reqwest` client.
*/
pub(crate) async fn announce(
    http: &reqwest::Client,
    url: &str,
    request: &AnnounceRequest,
) -> Result<Announce, TrackerError> {
    let url = build_announce_url(url, request)?;
    tracing::debug!(%url, "making announce request to tracker");

    let response = http.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            TrackerError::Timeout
        } else {
            TrackerError::HttpRequest(e)
        }
    })?;
    let bytes = response.bytes().await?;
    parse_announce_response(&bytes)
}

/// Builds the announce URL.
///
/// The query string is assembled by hand: `info_hash` and `peer_id` are
/// raw 20-byte values and serializing them through a form encoder would
/// escape the `%` of the already percent-encoded bytes.
fn build_announce_url(url: &str, request: &AnnounceRequest) -> Result<Url, TrackerError> {
    let mut url = Url::parse(url)?;
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.stats.uploaded,
        request.stats.downloaded,
        request.stats.left,
        NUM_WANT,
    );
    if let Some(event) = request.event.query_value() {
        query.push_str("&event=");
        query.push_str(event);
    }
    // Some announce URLs carry their own parameters (e.g. a passkey).
    let full = match url.query() {
        Some(existing) => format!("{existing}&{query}"),
        None => query,
    };
    url.set_query(Some(&full));
    Ok(url)
}

/**
Parses the bencoded announce reply.

A `failure reason` key aborts the announce; otherwise the peer list is
accepted in either the compact or the dictionary form.
*/
fn parse_announce_response(bytes: &[u8]) -> Result<Announce, TrackerError> {
    let response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Rejected(reason));
    }

    let peers = match response.peers {
        Some(Peers::Compact(bytes)) => parse_compact_peers(&bytes)?,
        Some(Peers::NonCompact(dicts)) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, dict.port))
            })
            .collect(),
        None => Vec::new(),
    };

    Ok(Announce {
        interval: response.interval,
        seeders: response.complete,
        leechers: response.incomplete,
        peers,
    })
}

/// Parses the compact peer form: groups of 6 bytes, a 4-byte IPv4 address
/// followed by a big-endian port.
pub(crate) fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::MalformedResponse(format!(
            "compact peer list of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) pass through; every
/// other byte becomes `%XX`.
pub(crate) fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Event, TransferStats};

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xab; 20],
            peer_id: *b"-RL0001-000011112222",
            port: 6881,
            event: Event::Started,
            stats: TransferStats {
                uploaded: 0,
                downloaded: 0,
                left: 1024,
            },
        }
    }

    #[test]
    fn announce_url_preserves_raw_byte_encoding() {
        let url = build_announce_url("http://tracker.example/announce", &request()).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains(&format!("info_hash={}", "%AB".repeat(20))));
        assert!(query.contains("peer_id=-RL0001-000011112222"));
        assert!(query.contains("compact=1"));
        assert!(query.contains("numwant=50"));
        assert!(query.contains("left=1024"));
        assert!(query.ends_with("event=started"));
    }

    #[test]
    fn announce_url_keeps_existing_query() {
        let url = build_announce_url("http://tracker.example/a?passkey=s3cret", &request()).unwrap();
        assert!(url.query().unwrap().starts_with("passkey=s3cret&info_hash="));
    }

    #[test]
    fn parses_compact_peers() {
        let bytes = [10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 1, 9, 0x00, 0x50];
        let peers = parse_compact_peers(&bytes).unwrap();
        assert_eq!(
            peers,
            vec![
                "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "192.168.1.9:80".parse::<SocketAddr>().unwrap(),
            ]
        );
        assert!(parse_compact_peers(&bytes[..5]).is_err());
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn parses_compact_response() {
        let raw = b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:\x0a\x00\x00\x01\x1a\xe1e";
        let announce = parse_announce_response(raw).unwrap();
        assert_eq!(announce.interval, Some(1800));
        assert_eq!(announce.seeders, Some(5));
        assert_eq!(announce.leechers, Some(2));
        assert_eq!(
            announce.peers,
            vec!["10.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn parses_dictionary_response() {
        let raw =
            b"d8:intervali900e5:peersld2:ip8:10.0.0.24:porti6881eed2:ip3:bad4:porti1eeee";
        let announce = parse_announce_response(raw).unwrap();
        assert_eq!(
            announce.peers,
            vec!["10.0.0.2:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn failure_reason_aborts() {
        let raw = b"d14:failure reason11:unregisterede";
        assert!(matches!(
            parse_announce_response(raw).unwrap_err(),
            TrackerError::Rejected(reason) if reason == "unregistered"
        ));
    }
}
