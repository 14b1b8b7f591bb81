//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - HTTP(S) announces per BEP 3 and UDP announces per BEP 15
//! - The announce event lifecycle (`started`/`completed`/`stopped`)
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation
//!
//! Used by the download coordinator to discover peers for a torrent.
use crate::torrent::TorrentMeta;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub mod http;
pub mod udp;

/// Response timeout for a single HTTP announce.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Overall deadline for a UDP connect + announce exchange.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(15);
/// How many peers to ask each tracker for.
pub const NUM_WANT: u32 = 50;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker rejected the announce: {0}")]
    Rejected(String),

    #[error("No tracker returned a usable response")]
    Unavailable,

    #[error("Unsupported tracker URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid announce URL: {0}")]
    InvalidUrl(String),

    #[error("Url parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),

    #[error("Malformed tracker response: {0}")]
    MalformedResponse(String),

    #[error("Announce timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Announce event reported to the tracker, per BEP 3 / BEP 15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    /// Value of the HTTP `event` query parameter; `None` is omitted.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
        }
    }

    /// BEP 15 event code.
    pub fn code(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Byte counters reported with every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A successful announce from one tracker.
#[derive(Debug)]
pub struct Announce {
    pub interval: Option<u64>,
    pub seeders: Option<u64>,
    pub leechers: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

/// Parameters shared by the HTTP and UDP announce encodings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub event: Event,
    pub stats: TransferStats,
}

/// Represents a client communicating with the torrent's trackers.
///
/// The peer ID is fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

impl Client {
    pub fn new(port: u16) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            peer_id: generate_peer_id(),
            port,
            http,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /**
    Announces to every tracker of the torrent and returns the union of the
    peer endpoints they reported.

    # How it works:
    1. One task per announce URL runs the HTTP or UDP exchange, picked by
       scheme.
    2. Successful responses are collected; failures are logged and isolated
       to their tracker.
    3. Endpoints are deduplicated by `(ip, port)`.

    Fails with [`TrackerError::Unavailable`] only when every tracker failed.
    */
    #[tracing::instrument(skip(self, meta), level = "debug")]
    pub async fn announce(
        &self,
        meta: &TorrentMeta,
        event: Event,
        stats: TransferStats,
    ) -> Result<Vec<SocketAddr>, TrackerError> {
        let request = AnnounceRequest {
            info_hash: meta.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            event,
            stats,
        };

        let mut tasks = JoinSet::new();
        for url in meta.announce_list.iter().cloned() {
            let http = self.http.clone();
            tasks.spawn(async move {
                let result = announce_one(&http, &url, &request).await;
                (url, result)
            });
        }

        let mut endpoints = Vec::new();
        let mut successes = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let Ok((url, result)) = joined else { continue };
            match result {
                Ok(announce) => {
                    debug!(
                        tracker = %url,
                        peers = announce.peers.len(),
                        interval = ?announce.interval,
                        seeders = ?announce.seeders,
                        leechers = ?announce.leechers,
                        "announce succeeded"
                    );
                    successes += 1;
                    endpoints.extend(announce.peers);
                }
                Err(error) => {
                    warn!(tracker = %url, %error, "announce failed");
                }
            }
        }

        if successes == 0 {
            return Err(TrackerError::Unavailable);
        }
        Ok(dedup_endpoints(endpoints))
    }
}

async fn announce_one(
    http: &reqwest::Client,
    url: &str,
    request: &AnnounceRequest,
) -> Result<Announce, TrackerError> {
    let scheme = url.split(':').next().unwrap_or_default();
    match scheme {
        "http" | "https" => http::announce(http, url, request).await,
        "udp" => udp::announce(url, request).await,
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

/// Deduplicates `(ip, port)` pairs while preserving first-seen order.
fn dedup_endpoints(endpoints: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    endpoints
        .into_iter()
        .filter(|addr| seen.insert(*addr))
        .collect()
}

/// Generates the process-lifetime peer ID: an Azureus-style `-RL0001-`
/// prefix followed by 12 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RL0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_azureus_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RL0001-");
        assert_ne!(generate_peer_id()[8..], id[8..]);
    }

    #[test]
    fn event_codes_follow_bep15() {
        assert_eq!(Event::None.code(), 0);
        assert_eq!(Event::Completed.code(), 1);
        assert_eq!(Event::Started.code(), 2);
        assert_eq!(Event::Stopped.code(), 3);
        assert_eq!(Event::Started.query_value(), Some("started"));
        assert_eq!(Event::None.query_value(), None);
    }

    #[test]
    fn endpoints_are_deduplicated_in_order() {
        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        assert_eq!(dedup_endpoints(vec![a, b, a]), vec![a, b]);
    }
}
