use crate::bencode;
use crate::bencode::BencodeValue;
use anyhow::Ok;
use anyhow::Result;
use sha1::Digest;
use sha1::Sha1;
use std::collections::HashMap;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// This function takes a bencode dictionary containing torrent metadata and:
/// 1. Encodes the dictionary into bencode format (canonical key order)
/// 2. Calculates the SHA-1 hash of the encoded data
/// 3. Returns the 20-byte hash as a fixed-size array
///
/// Because the encoder emits dict keys in ascending byte-lex order, the hash computed here
/// equals the info hash every other BitTorrent client derives from the same metainfo.
///
/// # Arguments
/// * `info_dict` - A HashMap containing the torrent's info dictionary
///
/// # Returns
/// * `Result<[u8;20]>` - A 20-byte array containing the SHA-1 hash, or an error if encoding fails
pub fn calculate_info_hash(info_dict: &HashMap<Vec<u8>, BencodeValue>) -> Result<[u8; 20]> {
    let mut buffer = Vec::new();
    bencode::encoder::encode(&mut buffer, &BencodeValue::Dict(info_dict.clone()))?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);

    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    #[test]
    fn hash_matches_sha1_of_canonical_encoding() {
        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(3));

        let hash = calculate_info_hash(&info).unwrap();
        // keys re-encode sorted: length before name
        let expected: [u8; 20] = Sha1::digest(b"d6:lengthi3e4:name1:xe").into();
        assert_eq!(hash, expected);
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let mut info = HashMap::new();
        info.insert(b"b".to_vec(), BencodeValue::Integer(2));
        info.insert(b"a".to_vec(), BencodeValue::Integer(1));
        assert_eq!(
            calculate_info_hash(&info).unwrap(),
            calculate_info_hash(&info).unwrap()
        );
    }
}
