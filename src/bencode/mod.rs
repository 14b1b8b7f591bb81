//! Bencode encoding and decoding.
//!
//! Bencode is the self-describing format used by .torrent metainfo files and
//! HTTP tracker replies. Values come in four kinds: byte strings, integers,
//! lists, and dictionaries keyed by byte strings.
use std::collections::HashMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/**
 * Represents a Bencode value, which is the core data structure for the
 * Bencode encoding format.
 *
 * The enum contains four variants that represent all possible Bencode data
 * types:
 *
 * 1. String(Vec<u8>):
 *    - Stored as raw bytes rather than UTF-8 text; whether a byte string is
 *      human-readable is the caller's decision.
 *    - Example: "4:spam" becomes String(b"spam")
 *
 * 2. Integer(i64):
 *    - Example: "i42e" becomes Integer(42)
 *
 * 3. List(Vec<BencodeValue>):
 *    - Example: "l4:spami42ee" becomes List([String(b"spam"), Integer(42)])
 *
 * 4. Dict(HashMap<Vec<u8>, BencodeValue>):
 *    - Keys must be byte strings. On emit, keys are written in raw-byte
 *      lexicographic order, so encoding is deterministic.
 *    - Example: "d3:foo3:bare" becomes Dict({b"foo" => String(b"bar")})
 */
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(HashMap<Vec<u8>, BencodeValue>),
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("Dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("Duplicate dictionary key")]
    DuplicateKey,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
