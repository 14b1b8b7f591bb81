//! UDP tracker announces per BEP 15.
//!
//! The exchange is two request/response steps over UDP: a connect request
//! that yields a connection id, then the announce proper. Both requests are
//! retried with doubling receive timeouts inside one overall deadline.
use super::{http, Announce, AnnounceRequest, TrackerError, NUM_WANT, UDP_TIMEOUT};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Magic connection id for connect requests, fixed by BEP 15.
const PROTOCOL_MAGIC: u64 = 0x0000_0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Per-attempt receive timeout; doubled after every missed reply.
const INITIAL_RECV_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;

/// Performs a full BEP 15 connect + announce exchange against one tracker.
///
/// The whole exchange is bounded by [`UDP_TIMEOUT`].
pub(crate) async fn announce(
    url: &str,
    request: &AnnounceRequest,
) -> Result<Announce, TrackerError> {
    match timeout(UDP_TIMEOUT, announce_inner(url, request)).await {
        Ok(result) => result,
        Err(_) => Err(TrackerError::Timeout),
    }
}

async fn announce_inner(url: &str, request: &AnnounceRequest) -> Result<Announce, TrackerError> {
    let addr = resolve(url).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    // Step 1: obtain a connection id.
    let txn_id = rand::rng().random::<u32>();
    let reply = request_reply(&socket, &connect_request(txn_id)).await?;
    let connection_id = parse_connect_response(&reply, txn_id)?;
    trace!(tracker = %url, connection_id, "udp connect established");

    // Step 2: the announce proper.
    let txn_id = rand::rng().random::<u32>();
    let key = rand::rng().random::<u32>();
    let packet = announce_request(connection_id, txn_id, key, request);
    let reply = request_reply(&socket, &packet).await?;
    let announce = parse_announce_response(&reply, txn_id)?;
    debug!(tracker = %url, peers = announce.peers.len(), "udp announce succeeded");
    Ok(announce)
}

/// Resolves a `udp://host:port/...` announce URL to a socket address.
async fn resolve(url: &str) -> Result<SocketAddr, TrackerError> {
    let parsed = url::Url::parse(url)?;
    if parsed.scheme() != "udp" {
        return Err(TrackerError::UnsupportedScheme(parsed.scheme().to_string()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| TrackerError::InvalidUrl(format!("no host in {url}")))?
        .to_string();
    let port = parsed
        .port()
        .ok_or_else(|| TrackerError::InvalidUrl(format!("no port in {url}")))?;
    let result = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| TrackerError::InvalidUrl(format!("{host} did not resolve to IPv4")));
    result
}

/// Sends `packet` and waits for a reply, retrying with doubled timeouts.
async fn request_reply(socket: &UdpSocket, packet: &[u8]) -> Result<Vec<u8>, TrackerError> {
    let mut wait = INITIAL_RECV_TIMEOUT;
    for attempt in 0..MAX_ATTEMPTS {
        socket.send(packet).await?;
        let mut buf = [0u8; 2048];
        match timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                trace!(attempt, "udp tracker reply timed out");
                wait *= 2;
            }
        }
    }
    Err(TrackerError::Timeout)
}

/// Encodes a 16-byte connect request: magic, action `0`, transaction id.
fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf
}

/// Decodes a connect response into the connection id.
fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    if buf.len() < 16 {
        return Err(TrackerError::MalformedResponse(format!(
            "connect response of {} bytes",
            buf.len()
        )));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let txn = cursor.read_u32::<BigEndian>()?;
    if txn != transaction_id {
        return Err(TrackerError::MalformedResponse(
            "transaction id mismatch".to_string(),
        ));
    }
    if action == ACTION_ERROR {
        return Err(tracker_error_message(&buf[8..]));
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::MalformedResponse(format!(
            "unexpected action {action} in connect response"
        )));
    }
    Ok(cursor.read_u64::<BigEndian>()?)
}

/// Encodes the 98-byte announce request.
fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.extend_from_slice(&connection_id.to_be_bytes());
    buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf.extend_from_slice(&request.info_hash);
    buf.extend_from_slice(&request.peer_id);
    buf.extend_from_slice(&request.stats.downloaded.to_be_bytes());
    buf.extend_from_slice(&request.stats.left.to_be_bytes());
    buf.extend_from_slice(&request.stats.uploaded.to_be_bytes());
    buf.extend_from_slice(&request.event.code().to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // IP address: default
    buf.extend_from_slice(&key.to_be_bytes());
    buf.extend_from_slice(&NUM_WANT.to_be_bytes());
    buf.extend_from_slice(&request.port.to_be_bytes());
    buf
}

/// Decodes the announce response header and the trailing compact peer list.
fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<Announce, TrackerError> {
    if buf.len() < 8 {
        return Err(TrackerError::MalformedResponse(format!(
            "announce response of {} bytes",
            buf.len()
        )));
    }
    let mut cursor = Cursor::new(buf);
    let action = cursor.read_u32::<BigEndian>()?;
    let txn = cursor.read_u32::<BigEndian>()?;
    if txn != transaction_id {
        return Err(TrackerError::MalformedResponse(
            "transaction id mismatch".to_string(),
        ));
    }
    if action == ACTION_ERROR {
        return Err(tracker_error_message(&buf[8..]));
    }
    if action != ACTION_ANNOUNCE || buf.len() < 20 {
        return Err(TrackerError::MalformedResponse(format!(
            "unexpected announce response (action {action}, {} bytes)",
            buf.len()
        )));
    }
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;
    let peers = http::parse_compact_peers(&buf[20..])?;
    Ok(Announce {
        interval: Some(interval as u64),
        seeders: Some(seeders as u64),
        leechers: Some(leechers as u64),
        peers,
    })
}

fn tracker_error_message(bytes: &[u8]) -> TrackerError {
    TrackerError::Rejected(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Event, TransferStats};

    #[test]
    fn connect_request_is_bit_exact() {
        assert_eq!(
            connect_request(0x1122_3344),
            [
                0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80, // magic
                0x00, 0x00, 0x00, 0x00, // action: connect
                0x11, 0x22, 0x33, 0x44, // transaction id
            ]
        );
    }

    #[test]
    fn connect_response_round_trip() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&0u32.to_be_bytes());
        reply.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        reply.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());

        assert_eq!(
            parse_connect_response(&reply, 0xdead_beef).unwrap(),
            0x0102_0304_0506_0708
        );
        assert!(parse_connect_response(&reply, 0x1111_1111).is_err());
        assert!(parse_connect_response(&reply[..10], 0xdead_beef).is_err());
    }

    #[test]
    fn announce_request_is_98_bytes() {
        let request = AnnounceRequest {
            info_hash: [0x11; 20],
            peer_id: [0x22; 20],
            port: 6881,
            event: Event::Started,
            stats: TransferStats {
                uploaded: 1,
                downloaded: 2,
                left: 3,
            },
        };
        let packet = announce_request(0xaaaa_bbbb_cccc_dddd, 0x0102_0304, 0x0a0b_0c0d, &request);
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[0..8], &0xaaaa_bbbb_cccc_ddddu64.to_be_bytes());
        assert_eq!(&packet[8..12], &1u32.to_be_bytes()); // action: announce
        assert_eq!(&packet[12..16], &0x0102_0304u32.to_be_bytes());
        assert_eq!(&packet[16..36], &[0x11; 20]);
        assert_eq!(&packet[36..56], &[0x22; 20]);
        assert_eq!(&packet[56..64], &2u64.to_be_bytes()); // downloaded
        assert_eq!(&packet[64..72], &3u64.to_be_bytes()); // left
        assert_eq!(&packet[72..80], &1u64.to_be_bytes()); // uploaded
        assert_eq!(&packet[80..84], &2u32.to_be_bytes()); // event: started
        assert_eq!(&packet[92..96], &NUM_WANT.to_be_bytes());
        assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn announce_response_yields_peers() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&1u32.to_be_bytes());
        reply.extend_from_slice(&7u32.to_be_bytes());
        reply.extend_from_slice(&1800u32.to_be_bytes());
        reply.extend_from_slice(&3u32.to_be_bytes());
        reply.extend_from_slice(&12u32.to_be_bytes());
        reply.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);

        let announce = parse_announce_response(&reply, 7).unwrap();
        assert_eq!(announce.interval, Some(1800));
        assert_eq!(announce.leechers, Some(3));
        assert_eq!(announce.seeders, Some(12));
        assert_eq!(
            announce.peers,
            vec!["10.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn error_action_carries_the_message() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&3u32.to_be_bytes());
        reply.extend_from_slice(&7u32.to_be_bytes());
        reply.extend_from_slice(b"torrent not registered");

        assert!(matches!(
            parse_announce_response(&reply, 7).unwrap_err(),
            TrackerError::Rejected(message) if message == "torrent not registered"
        ));
    }
}
