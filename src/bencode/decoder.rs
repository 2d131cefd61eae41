use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::HashMap;
use tracing::instrument;

/// Decodes the first bencode value found in `input`.
///
/// This is the public entry point of the decoder. It parses exactly one
/// top-level value and reports how many bytes of `input` it consumed, so a
/// caller that received a datagram with trailing bytes (or a metainfo file
/// embedded in a larger buffer) can tell where the value ended.
///
/// # Arguments
/// * `input` - The raw bytes to decode
///
/// # Returns
/// * `BencodeResult<(BencodeValue, usize)>` - The decoded value and the number of
///   bytes consumed, or an error if:
///   - The input is empty or truncated
///   - The value is malformed (bad integer, bad length prefix, unterminated container)
///
/// # Example
/// For input "i42e3:abc", this function returns (Integer(42), 4).
#[instrument(skip(input), level = "debug")]
pub fn decode(input: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut pos = 0usize;
    let value = decode_next(input, &mut pos)?;
    Ok((value, pos))
}

/// Decodes a bencode string from `input` starting at `pos`.
///
/// This function reads a bencode string in the format `<length>:<bytes>` where:
/// - `<length>` is a decimal number indicating the length of the string
/// - `<bytes>` is the actual string data of the specified length
///
/// The payload is copied out verbatim; it is NOT required to be UTF-8. Torrent
/// piece hashes, info hashes and DHT node ids all travel as bencode strings of
/// arbitrary bytes.
///
/// # Arguments
/// * `input` - The raw bytes being decoded
/// * `pos` - Cursor into `input`; advanced past the string on success
///
/// # Returns
/// * `BencodeResult<Vec<u8>>` - The decoded string as a byte vector, or an error if:
///   - The length prefix is not a plain decimal number
///   - The input ends before `length` payload bytes are available
///
/// # Example
/// For input "5:hello", this function will return a Vec<u8> containing [104, 101, 108, 108, 111]
#[instrument(skip(input), level = "trace")]
pub fn decode_string(input: &[u8], pos: &mut usize) -> BencodeResult<Vec<u8>> {
    let length_str = read_until(input, pos, b':')?;
    if length_str.is_empty() || !length_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidStringLength);
    }
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    if input.len() - *pos < length {
        return Err(BencodeError::UnexpectedEOI);
    }
    let string_bytes = input[*pos..*pos + length].to_vec();
    *pos += length;
    Ok(string_bytes)
}

/// Reads bytes from `input` until a specified delimiter is encountered.
///
/// This function scans forward from `pos` until it finds the delimiter byte.
/// It collects all bytes read (excluding the delimiter) and returns them as a
/// UTF-8 string; the delimiter itself is consumed. Only ever used for length
/// prefixes and integer bodies, which are ASCII by grammar.
///
/// # Arguments
/// * `input` - The raw bytes being decoded
/// * `pos` - Cursor into `input`; advanced past the delimiter on success
/// * `delimiter` - The byte value that marks the end of the reading
///
/// # Returns
/// * `BencodeResult<String>` - The collected bytes as a UTF-8 string, or an error if:
///   - The input ends before the delimiter appears
///   - The collected bytes are not valid UTF-8
#[instrument(skip(input), level = "trace")]
pub fn read_until(input: &[u8], pos: &mut usize, delimiter: u8) -> BencodeResult<String> {
    let mut buffer = Vec::new();

    loop {
        let &current_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;
        *pos += 1;

        if current_byte == delimiter {
            break;
        }
        buffer.push(current_byte);
    }

    String::from_utf8(buffer).map_err(|e| {
        BencodeError::InvalidFormat(format!("Non-UTF8 characters in length/integer: {}", e))
    })
}

/// Decodes a bencode integer from `input` starting at `pos`.
///
/// This function reads a bencode integer in the format `i<number>e` where:
/// - `i` is the literal character 'i' marking the start of an integer
/// - `<number>` is the actual integer value
/// - `e` is the literal character 'e' marking the end of the integer
///
/// The function performs several validations:
/// - Ensures the integer starts with 'i'
/// - Rejects leading zeros (except for single '0')
/// - Rejects "-0" as invalid
/// - Rejects empty integers
///
/// # Arguments
/// * `input` - The raw bytes being decoded
/// * `pos` - Cursor into `input`; advanced past the terminating 'e' on success
///
/// # Returns
/// * `BencodeResult<i64>` - The decoded integer value, or an error if the format
///   or value is invalid, or the input ends unexpectedly
///
/// # Example
/// For input "i42e", this function will return Ok(42)
#[instrument(skip(input), level = "trace")]
pub fn decode_integer(input: &[u8], pos: &mut usize) -> BencodeResult<i64> {
    let &first_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;
    *pos += 1;

    if first_byte != b'i' {
        return Err(BencodeError::InvalidFormat(
            "Integer must start with 'i'".to_string(),
        ));
    }

    let num_str = read_until(input, pos, b'e')?;

    if num_str.len() > 1 && num_str.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str.starts_with("-0") {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }

    num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list from `input` starting at `pos`.
///
/// This function reads a bencode list in the format `l<items>e` where:
/// - `l` is the literal character 'l' marking the start of a list
/// - `<items>` is a sequence of bencode values (integers, strings, lists, or dictionaries)
/// - `e` is the literal character 'e' marking the end of the list
///
/// The function recursively decodes each item in the list using `decode_next()`.
///
/// # Arguments
/// * `input` - The raw bytes being decoded
/// * `pos` - Cursor into `input`; advanced past the terminating 'e' on success
///
/// # Returns
/// * `BencodeResult<Vec<BencodeValue>>` - A vector of decoded bencode values, or an
///   error if any item fails to decode or the list is unterminated
///
/// # Example
/// For input "li42ei-1ee", this function will return Ok(vec![Integer(42), Integer(-1)])
#[instrument(skip(input), level = "trace")]
fn decode_list(input: &[u8], pos: &mut usize) -> BencodeResult<Vec<BencodeValue>> {
    let &first_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;
    *pos += 1;
    if first_byte != b'l' {
        return Err(BencodeError::InvalidFormat(
            "List must start with 'l'".to_string(),
        ));
    }

    let mut list = Vec::new();

    loop {
        let &current_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;

        if current_byte == b'e' {
            *pos += 1;
            break;
        }

        let item = decode_next(input, pos)?;
        list.push(item);
    }

    Ok(list)
}

/// Decodes a bencode dictionary from `input` starting at `pos`.
///
/// # Arguments
/// * `input` - The raw bytes being decoded
/// * `pos` - Cursor into `input`; advanced past the terminating 'e' on success
///
/// # Returns
/// * `BencodeResult<HashMap<Vec<u8>, BencodeValue>>` - A hashmap containing the decoded
///   key-value pairs, or an error if:
///   - The format is invalid (doesn't start with 'd')
///   - A key is not a byte string
///   - Any value fails to decode
///   - The dictionary is unterminated
///
/// # Example
/// For input "d3:keyi42ee", this function will return Ok({ "key" => Integer(42) })
///
/// # Format
/// Dictionaries in bencode format start with 'd' and end with 'e'. Keys must be strings,
/// and values can be any valid bencode value. Keys must be sorted in lexicographical order.
#[instrument(skip(input), level = "trace")]
fn decode_dict(input: &[u8], pos: &mut usize) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
    let &first_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;
    *pos += 1;

    if first_byte != b'd' {
        return Err(BencodeError::InvalidFormat(
            "Dictionary must start with 'd'".to_string(),
        ));
    }

    let mut dict = HashMap::new();

    loop {
        let &current_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;

        if current_byte == b'e' {
            *pos += 1;
            break;
        }

        if !current_byte.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }

        let key = decode_string(input, pos)?;
        let value = decode_next(input, pos)?;

        dict.insert(key, value);
    }

    Ok(dict)
}

#[instrument(skip(input), level = "trace")]
fn decode_next(input: &[u8], pos: &mut usize) -> BencodeResult<BencodeValue> {
    let &first_byte = input.get(*pos).ok_or(BencodeError::UnexpectedEOI)?;

    match first_byte {
        b'0'..=b'9' => decode_string(input, pos).map(BencodeValue::String),
        b'i' => decode_integer(input, pos).map(BencodeValue::Integer),
        b'l' => decode_list(input, pos).map(BencodeValue::List),
        b'd' => decode_dict(input, pos).map(BencodeValue::Dict),
        _ => Err(BencodeError::InvalidFormat(format!(
            "Unexpected character: {}",
            first_byte as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integer() {
        let (value, used) = decode(b"i42e").unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert_eq!(used, 4);
    }

    #[test]
    fn decodes_negative_integer() {
        let (value, _) = decode(b"i-17e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-17));
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(matches!(
            decode(b"i-0e"),
            Err(BencodeError::InvalidInteger)
        ));
    }

    #[test]
    fn rejects_leading_zeros() {
        assert!(matches!(
            decode(b"i042e"),
            Err(BencodeError::InvalidInteger)
        ));
        // i0e itself is fine
        assert_eq!(decode(b"i0e").unwrap().0, BencodeValue::Integer(0));
    }

    #[test]
    fn decodes_string() {
        let (value, used) = decode(b"5:hello").unwrap();
        assert_eq!(value, BencodeValue::String(b"hello".to_vec()));
        assert_eq!(used, 7);
    }

    #[test]
    fn decodes_non_utf8_string() {
        let input = [b'3', b':', 0xff, 0x00, 0xfe];
        let (value, _) = decode(&input).unwrap();
        assert_eq!(value, BencodeValue::String(vec![0xff, 0x00, 0xfe]));
    }

    #[test]
    fn rejects_truncated_string() {
        assert!(matches!(
            decode(b"10:short"),
            Err(BencodeError::UnexpectedEOI)
        ));
    }

    #[test]
    fn rejects_non_digit_length_prefix() {
        assert!(decode(b"x:abc").is_err());
    }

    #[test]
    fn decodes_list() {
        let (value, _) = decode(b"li1e1:ae").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::Integer(1),
                BencodeValue::String(b"a".to_vec()),
            ])
        );
    }

    #[test]
    fn decodes_dict() {
        let (value, _) = decode(b"d1:ai1e1:bi2ee").unwrap();
        let mut expected = HashMap::new();
        expected.insert(b"a".to_vec(), BencodeValue::Integer(1));
        expected.insert(b"b".to_vec(), BencodeValue::Integer(2));
        assert_eq!(value, BencodeValue::Dict(expected));
    }

    #[test]
    fn rejects_dict_with_non_string_key() {
        assert!(matches!(
            decode(b"di1ei2ee"),
            Err(BencodeError::DictKeyNotString)
        ));
    }

    #[test]
    fn rejects_unterminated_containers() {
        assert!(matches!(decode(b"li1e"), Err(BencodeError::UnexpectedEOI)));
        assert!(matches!(
            decode(b"d1:ai1e"),
            Err(BencodeError::UnexpectedEOI)
        ));
    }

    #[test]
    fn reports_bytes_consumed_with_trailing_data() {
        let (value, used) = decode(b"d1:ai1ee4:rest").unwrap();
        assert!(matches!(value, BencodeValue::Dict(_)));
        assert_eq!(used, 8);
    }

    #[test]
    fn decodes_nested_structures() {
        let (value, _) = decode(b"d4:listli1ei2ee4:dictd1:k1:vee").unwrap();
        let list = value.get(b"list").and_then(BencodeValue::as_list).unwrap();
        assert_eq!(list.len(), 2);
        let inner = value.get(b"dict").unwrap();
        assert_eq!(
            inner.get(b"k").and_then(BencodeValue::as_bytes),
            Some(&b"v"[..])
        );
    }
}
