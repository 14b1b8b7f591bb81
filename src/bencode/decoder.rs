use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::HashMap;
use std::ops::Range;
use tracing::instrument;

/// Decodes a complete bencode value from `input`.
///
/// The whole slice must be consumed; trailing bytes after the top-level
/// value are treated as malformed input.
#[instrument(skip(input), level = "trace")]
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, _) = decode_with_info_range(input)?;
    Ok(value)
}

/// Decodes a complete bencode value and, when the top-level value is a
/// dictionary containing an `info` key, reports the `[start, end)` byte
/// range that the `info` sub-value occupied in `input`.
///
/// The info hash of a torrent is defined over the exact on-wire bytes of
/// the `info` value, so the range is recorded during this single decoding
/// pass instead of re-encoding the decoded value later.
#[instrument(skip(input), level = "trace")]
pub fn decode_with_info_range(
    input: &[u8],
) -> BencodeResult<(BencodeValue, Option<Range<usize>>)> {
    let mut decoder = Decoder::new(input);
    let value = decoder.decode_value(0)?;
    if decoder.pos != input.len() {
        return Err(BencodeError::InvalidFormat(format!(
            "{} trailing bytes after top-level value",
            input.len() - decoder.pos
        )));
    }
    Ok((value, decoder.info_range))
}

/// Cursor over the input slice. `pos` always points at the next unread
/// byte, which is what makes the `info` range capture exact.
struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    info_range: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Decoder {
            input,
            pos: 0,
            info_range: None,
        }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEOI)
    }

    fn bump(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Consumes bytes up to (and including) `delimiter` and returns the
    /// bytes before it.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            if self.bump()? == delimiter {
                return Ok(&self.input[start..self.pos - 1]);
            }
        }
    }

    /// Decodes a byte string in the format `<length>:<bytes>`.
    ///
    /// The length prefix must consist of decimal digits only; the declared
    /// length must fit inside the remaining input.
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let length_bytes = self.read_until(b':')?;
        if length_bytes.is_empty() || !length_bytes.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidStringLength);
        }
        let length_str =
            std::str::from_utf8(length_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
        let length = length_str
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidStringLength)?;

        if self.input.len() - self.pos < length {
            return Err(BencodeError::UnexpectedEOI);
        }
        let bytes = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    /// Decodes an integer in the format `i<decimal>e`.
    ///
    /// `-0`, leading zeros, an empty body, and non-decimal characters are
    /// all malformed.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        let first_byte = self.bump()?;
        if first_byte != b'i' {
            return Err(BencodeError::InvalidFormat(
                "Integer must start with 'i'".to_string(),
            ));
        }

        let body = self.read_until(b'e')?;
        let num_str = std::str::from_utf8(body).map_err(|_| BencodeError::InvalidInteger)?;

        if num_str.is_empty() || num_str == "-" {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        let digits = num_str.strip_prefix('-').unwrap_or(num_str);
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(BencodeError::InvalidInteger);
        }

        num_str
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)
    }

    /// Decodes a list in the format `l<items>e`, recursing into
    /// `decode_value` for every element.
    fn decode_list(&mut self, depth: usize) -> BencodeResult<Vec<BencodeValue>> {
        let first_byte = self.bump()?;
        if first_byte != b'l' {
            return Err(BencodeError::InvalidFormat(
                "List must start with 'l'".to_string(),
            ));
        }

        let mut list = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.bump()?;
                break;
            }
            list.push(self.decode_value(depth + 1)?);
        }
        Ok(list)
    }

    /// Decodes a dictionary in the format `d<key><value>...e`.
    ///
    /// Keys must be byte strings and must not repeat. When this dictionary
    /// is the top-level value, the byte range of the value under the
    /// `info` key is recorded for the info-hash computation.
    fn decode_dict(&mut self, depth: usize) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
        let first_byte = self.bump()?;
        if first_byte != b'd' {
            return Err(BencodeError::InvalidFormat(
                "Dictionary must start with 'd'".to_string(),
            ));
        }

        let mut dict = HashMap::new();
        loop {
            let next = self.peek()?;
            if next == b'e' {
                self.bump()?;
                break;
            }
            if !next.is_ascii_digit() {
                return Err(BencodeError::DictKeyNotString);
            }

            let key = self.decode_string()?;
            let value_start = self.pos;
            let value = self.decode_value(depth + 1)?;
            if depth == 0 && key == b"info" {
                self.info_range = Some(value_start..self.pos);
            }
            if dict.insert(key, value).is_some() {
                return Err(BencodeError::DuplicateKey);
            }
        }
        Ok(dict)
    }

    fn decode_value(&mut self, depth: usize) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list(depth).map(BencodeValue::List),
            b'd' => self.decode_dict(depth).map(BencodeValue::Dict),
            other => Err(BencodeError::InvalidFormat(format!(
                "Unexpected character: {}",
                other as char
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), BencodeValue::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i42").is_err());
        assert!(decode(b"i4x2e").is_err());
    }

    #[test]
    fn decodes_strings_as_raw_bytes() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::String(b"spam".to_vec())
        );
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::String(Vec::new()));
    }

    #[test]
    fn rejects_malformed_strings() {
        // Non-digit length prefix, missing colon, declared length past the
        // end of the input.
        assert!(decode(b"x:ab").is_err());
        assert!(decode(b"4spam").is_err());
        assert!(decode(b"10:spam").is_err());
        assert!(matches!(
            decode(b"10:spam").unwrap_err(),
            BencodeError::UnexpectedEOI
        ));
    }

    #[test]
    fn decodes_nested_structures() {
        let value = decode(b"d3:cow3:moo4:spaml1:a1:bee").unwrap();
        let BencodeValue::Dict(dict) = value else {
            panic!("expected a dictionary");
        };
        assert_eq!(
            dict.get(b"cow".as_slice()),
            Some(&BencodeValue::String(b"moo".to_vec()))
        );
        assert_eq!(
            dict.get(b"spam".as_slice()),
            Some(&BencodeValue::List(vec![
                BencodeValue::String(b"a".to_vec()),
                BencodeValue::String(b"b".to_vec()),
            ]))
        );
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert!(matches!(
            decode(b"di1e3:mooe").unwrap_err(),
            BencodeError::DictKeyNotString
        ));
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert!(matches!(
            decode(b"d3:cow3:moo3:cow3:bahe").unwrap_err(),
            BencodeError::DuplicateKey
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(decode(b"i42egarbage").is_err());
    }

    #[test]
    fn rejects_unterminated_containers() {
        assert!(decode(b"l1:a").is_err());
        assert!(decode(b"d3:cow3:moo").is_err());
    }

    #[test]
    fn records_info_value_byte_range() {
        let raw = b"d8:announce3:url4:infod4:name4:fileee";
        let (_, range) = decode_with_info_range(raw).unwrap();
        let range = range.unwrap();
        assert_eq!(&raw[range], b"d4:name4:filee");
    }

    #[test]
    fn info_range_only_tracks_top_level_key() {
        // An `info` key nested below the top level must not be reported.
        let raw = b"d5:outerd4:infoi1eee";
        let (_, range) = decode_with_info_range(raw).unwrap();
        assert!(range.is_none());
    }
}
