//! Library root for rs-leech.
//!
//! Re-exports the core modules of the leeching BitTorrent client: bencode,
//! torrent metainfo, tracker, peer wire protocol, piece store, and the
//! download coordinator.
pub mod bencode;
pub mod bitfield;
pub mod download;
pub mod peer;
pub mod store;
pub mod torrent;
pub mod tracker;
