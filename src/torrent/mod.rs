//! Torrent metainfo parsing and error handling logic.
//!
//! This module provides types and error handling for working with .torrent
//! files, including parsing, validation, and error reporting.
use thiserror::Error;

pub mod info_hash;
pub mod meta;

pub use meta::TorrentMeta;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("Multi-file torrents are not supported")]
    MultiFileUnsupported,
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
