use sha1::Digest;
use sha1::Sha1;
use std::ops::Range;

/// Computes the 20-byte SHA-1 digest of a byte slice.
///
/// Used for both the info hash and per-piece verification; the BitTorrent
/// protocol requires bit-exact SHA-1 in both places.
pub fn sha1_digest(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&result);
    digest
}

/// Computes the info hash from the raw metainfo bytes and the `[start, end)`
/// range the decoder recorded for the `info` value.
///
/// Hashing the recorded range digests the exact on-wire bytes, which makes
/// the result independent of how the decoded value would re-encode.
pub fn calculate_info_hash(raw: &[u8], info_range: Range<usize>) -> [u8; 20] {
    sha1_digest(&raw[info_range])
}
