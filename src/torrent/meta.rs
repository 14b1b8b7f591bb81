//! Metainfo loading and validation.
//!
//! Parses a BEP 3 single-file .torrent descriptor into an immutable
//! [`TorrentMeta`] shared read-only by every other component.
use crate::bencode::decoder;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::TorrentError;
use super::TorrentResult;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/**
Immutable description of a single-file torrent.

Created once from the metainfo descriptor and shared read-only by the
tracker client, the peer sessions, the piece store, and the coordinator.

Invariant, checked at construction:
`piece_hashes.len() * piece_length >= total_length > (piece_hashes.len() - 1) * piece_length`.
*/
#[derive(Debug, PartialEq, Clone)]
pub struct TorrentMeta {
    /// SHA-1 digest of the raw `info` bytes; the torrent's canonical id.
    pub info_hash: [u8; 20],
    /// One 20-byte digest per piece, in piece order.
    pub piece_hashes: Vec<[u8; 20]>,
    /// Nominal piece size; every piece but possibly the last has this size.
    pub piece_length: u64,
    /// Size of the single payload file in bytes.
    pub total_length: u64,
    /// File name from the info dictionary.
    pub file_name: String,
    /// Tracker URLs, deduplicated, primary announce first.
    pub announce_list: Vec<String>,
}

impl TorrentMeta {
    /// Reads and parses a metainfo file from disk.
    pub fn from_file(path: &Path) -> TorrentResult<TorrentMeta> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /**
    Parses metainfo bytes into a validated `TorrentMeta`.

    # How it works:
    1. Decodes the bencode value while recording the byte range of the
       `info` sub-value.
    2. Collects the announce URL and the optional `announce-list` tiers
       into one deduplicated URL sequence, primary first.
    3. Validates the `info` dictionary: `name`, positive `piece length`,
       `pieces` as a multiple of 20 bytes, positive single-file `length`;
       a `files` key is rejected up front.
    4. Digests the recorded `info` byte range into the info hash.
    */
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<TorrentMeta> {
        let (value, info_range) = decoder::decode_with_info_range(data)?;
        let mut dict = match value {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Root is not a dictionary".to_string(),
                ));
            }
        };

        let announce_list = parse_trackers(&mut dict)?;
        log_optional_fields(&dict);

        let info_range = info_range.ok_or(TorrentError::MissingField("info".to_string()))?;
        let info_dict = match dict.remove(b"info".as_slice()) {
            Some(BencodeValue::Dict(d)) => d,
            Some(_) => {
                return Err(TorrentError::InvalidFormat(
                    "info is not a dictionary".to_string(),
                ));
            }
            None => return Err(TorrentError::MissingField("info".to_string())),
        };

        let (file_name, piece_length, total_length, pieces_bytes) = parse_info_dict(&info_dict)?;
        let piece_hashes = parse_pieces(&pieces_bytes)?;
        validate_piece_geometry(piece_hashes.len(), piece_length, total_length)?;

        let info_hash = info_hash::calculate_info_hash(data, info_range);
        debug!(
            info_hash = %hex::encode(info_hash),
            pieces = piece_hashes.len(),
            "parsed metainfo"
        );

        Ok(TorrentMeta {
            info_hash,
            piece_hashes,
            piece_length,
            total_length,
            file_name,
            announce_list,
        })
    }

    /// Number of pieces, derived from the `pieces` digest string.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /**
    Returns the size of the piece at `index`.

    Every piece has size `piece_length` except the last, whose size is
    `total_length - (num_pieces - 1) * piece_length`.
    */
    pub fn piece_size(&self, index: u32) -> u32 {
        let count = self.num_pieces() as u64;
        let index = index as u64;
        if index + 1 < count {
            self.piece_length as u32
        } else {
            (self.total_length - (count - 1) * self.piece_length) as u32
        }
    }
}

/**
Collects every tracker URL named by the metainfo.

The primary URL is `announce` when present, otherwise the first URL of the
first `announce-list` tier. Duplicates are dropped while preserving
discovery order. At least one URL must survive.
*/
fn parse_trackers(dict: &mut HashMap<Vec<u8>, BencodeValue>) -> TorrentResult<Vec<String>> {
    let mut urls = Vec::new();

    match dict.remove(b"announce".as_slice()) {
        Some(BencodeValue::String(s)) => {
            urls.push(String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce URL (not UTF-8): {}", e))
            })?);
        }
        Some(_) => {
            return Err(TorrentError::InvalidFormat(
                "announce is not a string".to_string(),
            ));
        }
        None => {}
    }

    if let Some(value) = dict.remove(b"announce-list".as_slice()) {
        let BencodeValue::List(tiers) = value else {
            return Err(TorrentError::InvalidFormat(
                "announce-list is not a list".to_string(),
            ));
        };
        for tier in tiers {
            let BencodeValue::List(trackers) = tier else {
                return Err(TorrentError::InvalidFormat(
                    "announce-list tier is not a list".to_string(),
                ));
            };
            for tracker in trackers {
                let BencodeValue::String(s) = tracker else {
                    return Err(TorrentError::InvalidFormat(
                        "Tracker URL is not a string".to_string(),
                    ));
                };
                urls.push(String::from_utf8(s).map_err(|e| {
                    TorrentError::InvalidFormat(format!("Invalid tracker URL (not UTF-8): {}", e))
                })?);
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    urls.retain(|url| seen.insert(url.clone()));

    if urls.is_empty() {
        return Err(TorrentError::MissingField(
            "announce or announce-list".to_string(),
        ));
    }
    Ok(urls)
}

/// Extracts the fields of the info dictionary the engine needs:
/// `(name, piece length, length, pieces)`.
fn parse_info_dict(
    dict: &HashMap<Vec<u8>, BencodeValue>,
) -> TorrentResult<(String, u64, u64, Vec<u8>)> {
    if dict.contains_key(b"files".as_slice()) {
        return Err(TorrentError::MultiFileUnsupported);
    }

    let name = match dict.get(b"name".as_slice()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e)))?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };
    if name.is_empty() {
        return Err(TorrentError::InvalidFormat("Empty file name".to_string()));
    }

    let piece_length = match dict.get(b"piece length".as_slice()) {
        Some(BencodeValue::Integer(i)) if *i > 0 => *i as u64,
        Some(BencodeValue::Integer(_)) => {
            return Err(TorrentError::InvalidFormat(
                "piece length must be positive".to_string(),
            ));
        }
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };

    let length = match dict.get(b"length".as_slice()) {
        Some(BencodeValue::Integer(i)) if *i > 0 => *i as u64,
        Some(BencodeValue::Integer(_)) => {
            return Err(TorrentError::InvalidFormat(
                "length must be positive".to_string(),
            ));
        }
        _ => return Err(TorrentError::MissingField("length".to_string())),
    };

    let pieces = match dict.get(b"pieces".as_slice()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    Ok((name, piece_length, length, pieces))
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

The `pieces` value is a single byte string concatenating one 20-byte SHA-1
digest per piece, in piece order. Its length must therefore be a non-zero
multiple of 20.
*/
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(chunk);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/// The piece count implied by `pieces` must cover `total_length` exactly:
/// all pieces together reach it, and dropping the last piece falls short.
fn validate_piece_geometry(
    piece_count: usize,
    piece_length: u64,
    total_length: u64,
) -> TorrentResult<()> {
    let count = piece_count as u64;
    if count * piece_length < total_length || total_length <= (count - 1) * piece_length {
        return Err(TorrentError::InvalidFormat(format!(
            "{} pieces of {} bytes cannot cover {} bytes",
            piece_count, piece_length, total_length
        )));
    }
    Ok(())
}

/// `comment`, `created by` and `creation date` do not affect the engine;
/// they are surfaced in the logs and otherwise ignored.
fn log_optional_fields(dict: &HashMap<Vec<u8>, BencodeValue>) {
    if let Some(BencodeValue::String(s)) = dict.get(b"comment".as_slice()) {
        debug!(comment = %String::from_utf8_lossy(s), "metainfo comment");
    }
    if let Some(BencodeValue::String(s)) = dict.get(b"created by".as_slice()) {
        debug!(created_by = %String::from_utf8_lossy(s), "metainfo creator");
    }
    if let Some(BencodeValue::Integer(ts)) = dict.get(b"creation date".as_slice()) {
        debug!(creation_date = ts, "metainfo creation date");
    }
}
