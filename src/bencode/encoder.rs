use super::BencodeValue;
use std::collections::HashMap;
use tracing::instrument;

/// Encodes a bencode value into its canonical byte representation.
///
/// Dictionary keys are emitted in raw-byte lexicographic order, so the
/// output is deterministic and `decode(encode(v)) == v` for every value the
/// decoder produces.
#[instrument(skip(value), level = "trace")]
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_value(&mut buffer, value);
    buffer
}

fn encode_string(buffer: &mut Vec<u8>, s: &[u8]) {
    buffer.extend_from_slice(s.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend_from_slice(s);
}

fn encode_integer(buffer: &mut Vec<u8>, i: i64) {
    buffer.push(b'i');
    buffer.extend_from_slice(i.to_string().as_bytes());
    buffer.push(b'e');
}

fn encode_list(buffer: &mut Vec<u8>, list: &[BencodeValue]) {
    buffer.push(b'l');
    for item in list {
        encode_value(buffer, item);
    }
    buffer.push(b'e');
}

fn encode_dict(buffer: &mut Vec<u8>, dict: &HashMap<Vec<u8>, BencodeValue>) {
    buffer.push(b'd');
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        encode_string(buffer, key);
        encode_value(buffer, &dict[key]);
    }
    buffer.push(b'e');
}

fn encode_value(buffer: &mut Vec<u8>, value: &BencodeValue) {
    match value {
        BencodeValue::String(s) => encode_string(buffer, s),
        BencodeValue::Integer(i) => encode_integer(buffer, *i),
        BencodeValue::List(list) => encode_list(buffer, list),
        BencodeValue::Dict(dict) => encode_dict(buffer, dict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder::decode;

    #[test]
    fn encodes_integers() {
        assert_eq!(encode(&BencodeValue::Integer(42)), b"i42e");
        assert_eq!(encode(&BencodeValue::Integer(-7)), b"i-7e");
        assert_eq!(encode(&BencodeValue::Integer(0)), b"i0e");
    }

    #[test]
    fn encodes_dict_with_sorted_keys() {
        let mut dict = HashMap::new();
        dict.insert(b"spam".to_vec(), BencodeValue::String(b"eggs".to_vec()));
        dict.insert(b"cow".to_vec(), BencodeValue::String(b"moo".to_vec()));
        assert_eq!(
            encode(&BencodeValue::Dict(dict)),
            b"d3:cow3:moo4:spam4:eggse"
        );
    }

    #[test]
    fn round_trips_decoded_values() {
        let raw = b"d8:announce17:http://tr.example4:infod6:lengthi4e4:name1:f12:piece \
lengthi2e6:pieces2:abe5:tierslli1ei2eel3:udpeee";
        let value = decode(raw).unwrap();
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }
}
