//! Torrent file structure and parsing logic.
//!
//! This module defines the TorrentFile struct and related helpers for parsing, validating,
//! and working with .torrent file metadata.
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::TorrentError;
use anyhow::Ok;
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::instrument;

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

# Torrent Protocol Context:
The `pieces` key within the `info` dictionary is a single string (byte sequence)
that is a concatenation of 20-byte SHA-1 hashes for each piece of the torrent.
This function breaks that long string into individual 20-byte hash arrays.
The order of these hashes is crucial as it corresponds directly to the piece index.

# How it works:
1. Takes a byte slice (`&[u8]`) which is the raw `pieces` data.
2. Validates that the length of this byte slice is a multiple of 20 (since each hash is 20 bytes).
3. Iterates through the byte slice, taking 20 bytes at a time.
4. Copies each 20-byte chunk into a fixed-size `[u8; 20]` array.
5. Collects these arrays into a `Vec<[u8; 20]>`.
*/
#[tracing::instrument(level = "trace")]
fn parse_pieces(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength.into());
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for i in 0..num_pieces {
        let start = i * 20;
        let end = start + 20;

        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(&pieces_bytes[start..end]);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/**
Parses the announce list from the torrent file.

# How it works:
1. Takes a `BencodeValue` which is expected to be a list of lists of strings.
2. Iterates through each tier of trackers, converting them into a `Vec<Vec<String>>`.
3. Validates that each tracker URL is a valid UTF-8 string.
4. Returns an error if the structure is invalid.
*/
fn parse_announce_list(value: &BencodeValue) -> Result<Vec<Vec<String>>> {
    match value {
        BencodeValue::List(tiers) => {
            let mut result = Vec::new();
            for tier in tiers {
                match tier {
                    BencodeValue::List(trackers) => {
                        let mut tier_vec = Vec::new();
                        for tracker in trackers {
                            match tracker {
                                BencodeValue::String(s) => {
                                    tier_vec.push(String::from_utf8(s.clone()).map_err(|e| {
                                        TorrentError::InvalidFormat(format!(
                                            "Invalid tracker URL (not UTF-8): {}",
                                            e
                                        ))
                                    })?);
                                }
                                _ => {
                                    return Err(TorrentError::InvalidFormat(
                                        "Tracker URL not a string".to_string(),
                                    )
                                    .into());
                                }
                            }
                        }
                        result.push(tier_vec);
                    }
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "Announce tier not a list".to_string(),
                        )
                        .into());
                    }
                }
            }
            Ok(result)
        }
        _ => Err(TorrentError::InvalidFormat("Announce-list not a list".to_string()).into()),
    }
}

/**
Parses the info dictionary from the torrent file.

# How it works:
1. Extracts required fields such as `piece_length`, `pieces`, `private`, `name`, `length`, and `files`.
2. Validates the structure and content of each field.
3. Constructs an `InfoDict` struct with the parsed data.
4. Returns an error if any required field is missing or invalid.
*/
fn parse_info_dict(value: &BencodeValue) -> Result<InfoDict> {
    // Step 1: Validate that the input is a dictionary
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => {
            return Err(TorrentError::InvalidFormat("Info is not a dictionary".to_string()).into());
        }
    };

    // Step 2: Extract and validate piece_length (required field)
    let piece_length = match dict.get(&b"piece length".to_vec()) {
        Some(BencodeValue::Integer(i)) => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string()).into()),
    };

    // Step 3: Extract and validate pieces bytes (required field)
    let pieces = match dict.get(&b"pieces".to_vec()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string()).into()),
    };

    // Step 4: Extract private flag (optional field, defaults to false)
    let private = matches!(
        dict.get(&b"private".to_vec()),
        Some(BencodeValue::Integer(1))
    );

    // Step 5: Extract and validate name (required field, must be UTF-8)
    let name = match dict.get(&b"name".to_vec()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e)))?,
        _ => return Err(TorrentError::MissingField("name".to_string()).into()),
    };

    // Step 6: Extract length (present only for single-file torrents)
    let length = match dict.get(&b"length".to_vec()) {
        Some(BencodeValue::Integer(i)) => Some(*i),
        _ => None,
    };

    // Step 7: Parse the files list (multi-file torrents)
    let files = match dict.get(&b"files".to_vec()) {
        Some(BencodeValue::List(list)) => {
            let mut files_vec = Vec::new();
            for file_val in list {
                files_vec.push(parse_file_entry(file_val)?);
            }
            files_vec
        }
        Some(_) => {
            return Err(TorrentError::InvalidFieldType("files".to_string()).into());
        }
        None => Vec::new(),
    };

    // Step 8: A torrent is single-file iff `length` is present; otherwise `files` is required
    let is_directory = length.is_none();
    if is_directory && files.is_empty() {
        return Err(TorrentError::MissingField("length or files".to_string()).into());
    }

    Ok(InfoDict {
        piece_length,
        pieces,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

/// Parses one entry of `info.files`: a dict holding the file `length` and its `path`
/// component list, to be joined with `/` into the file's relative path.
fn parse_file_entry(value: &BencodeValue) -> Result<FileDict> {
    let file_dict = match value {
        BencodeValue::Dict(d) => d,
        _ => {
            return Err(
                TorrentError::InvalidFormat("File entry is not a dictionary".to_string()).into(),
            );
        }
    };

    let length = match file_dict.get(&b"length".to_vec()) {
        Some(BencodeValue::Integer(i)) => *i,
        _ => return Err(TorrentError::MissingField("files.length".to_string()).into()),
    };

    let path = match file_dict.get(&b"path".to_vec()) {
        Some(BencodeValue::List(components)) => {
            let mut path_vec = Vec::new();
            for component in components {
                match component {
                    BencodeValue::String(s) => {
                        path_vec.push(String::from_utf8(s.clone()).map_err(|e| {
                            TorrentError::InvalidFormat(format!(
                                "Invalid path component (not UTF-8): {}",
                                e
                            ))
                        })?);
                    }
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "Path component not a string".to_string(),
                        )
                        .into());
                    }
                }
            }
            path_vec
        }
        _ => return Err(TorrentError::MissingField("files.path".to_string()).into()),
    };

    Ok(FileDict { length, path })
}

/// Reads an optional UTF-8 string field out of the root dictionary, defaulting to empty.
fn optional_string(dict: &HashMap<Vec<u8>, BencodeValue>, key: &[u8]) -> String {
    match dict.get(key) {
        Some(BencodeValue::String(s)) => String::from_utf8_lossy(s).into_owned(),
        _ => String::new(),
    }
}

impl TorrentFile {
    /**
    Parses a complete `.torrent` blob into a `TorrentFile`.

    # How it works:
    1. Decodes the bencoded input; the root value must be a dictionary.
    2. Extracts `announce` (required), plus the optional `announce-list`, `comment`,
       `created by`, `encoding` and `creation date` fields.
    3. Parses the `info` sub-dictionary into an `InfoDict`.
    4. Computes the info hash as the SHA-1 of the canonical re-encoding of `info`.
    5. Splits the `pieces` string into the ordered list of 20-byte piece hashes.
    */
    #[instrument(skip(bytes), level = "debug")]
    pub fn from_bytes(bytes: &[u8]) -> Result<TorrentFile> {
        let (root, _consumed) = bencode::decoder::decode(bytes)?;

        let dict = match root {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(
                    TorrentError::InvalidFormat("Root is not a dictionary".to_string()).into(),
                );
            }
        };

        let announce = match dict.get(&b"announce".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce URL (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("announce".to_string()).into()),
        };

        let announce_list = match dict.get(&b"announce-list".to_vec()) {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        let creation_date = match dict.get(&b"creation date".to_vec()) {
            Some(BencodeValue::Integer(secs)) if *secs >= 0 => {
                Some(UNIX_EPOCH + Duration::from_secs(*secs as u64))
            }
            _ => None,
        };

        let comment = optional_string(&dict, b"comment");
        let created_by = optional_string(&dict, b"created by");
        let encoding = optional_string(&dict, b"encoding");

        let info_value = dict
            .get(&b"info".to_vec())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_dict = match info_value {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(
                    TorrentError::InvalidFormat("Info is not a dictionary".to_string()).into(),
                );
            }
        };
        let info = parse_info_dict(info_value)?;
        let info_hash = info_hash::calculate_info_hash(info_dict)?;
        let pieces_hash = parse_pieces(&info.pieces)?;

        Ok(TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        })
    }

    /// Reads and parses a `.torrent` file from disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<TorrentFile> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Returns the total length of all files in the torrent.
    pub fn total_length(&self) -> i64 {
        if !self.info.is_directory {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    /// Returns the total number of pieces in the torrent.
    /// Derived from the number of 20-byte hashes in `pieces_hash`.
    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Returns the ordered `{path, length}` manifest, with multi-file paths joined by `/`.
    pub fn file_manifest(&self) -> Vec<(String, i64)> {
        if !self.info.is_directory {
            vec![(self.info.name.clone(), self.info.length.unwrap_or(0))]
        } else {
            self.info
                .files
                .iter()
                .map(|f| (f.path.join("/"), f.length))
                .collect()
        }
    }

    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let total_length = self.total_length();
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            let last_piece_size = total_length - full_pieces_length;

            if last_piece_size == 0 && self.num_pieces() > 0 {
                self.info.piece_length
            } else {
                last_piece_size
            }
        }
    }

    /// Returns a vector of file paths that contain data for a specific piece in the torrent.
    ///
    /// This function determines which files contain data for a given piece index by:
    /// 1. Calculating the byte range (start and end) of the requested piece
    /// 2. For single-file torrents, returns the main file path if the piece is valid
    /// 3. For multi-file torrents, checks each file's byte range against the piece range
    ///    and returns paths of files that overlap with the piece
    ///
    /// # Arguments
    /// * `index` - The index of the piece to find files for
    ///
    /// # Returns
    /// A vector of `PathBuf` containing the paths of files that contain data for the specified
    /// piece. Returns an empty vector if the piece index is invalid.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut current_data_position: i64 = 0;
        let mut result_paths = Vec::new();
        if !self.info.is_directory {
            result_paths.push(PathBuf::from(&self.info.name));
        } else {
            for file_info in &self.info.files {
                let file_start = current_data_position;
                let file_end = file_start + file_info.length;
                if file_end > piece_start && file_start < piece_end {
                    let mut full_path = PathBuf::from(&self.info.name);
                    for component in &file_info.path {
                        full_path = full_path.join(component)
                    }
                    result_paths.push(full_path);
                }
                current_data_position = file_end;
            }
        }
        result_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder;
    use sha1::{Digest, Sha1};

    fn bencode_bytes(value: &BencodeValue) -> Vec<u8> {
        let mut buffer = Vec::new();
        encoder::encode(&mut buffer, value).unwrap();
        buffer
    }

    fn single_file_metainfo() -> Vec<u8> {
        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"x.iso".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1_048_576));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(262_144));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0xab; 80]));

        let mut root = HashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        bencode_bytes(&BencodeValue::Dict(root))
    }

    #[test]
    fn parses_single_file_torrent() {
        let torrent = TorrentFile::from_bytes(&single_file_metainfo()).unwrap();
        assert_eq!(torrent.announce, "http://tracker.example/announce");
        assert_eq!(torrent.info.name, "x.iso");
        assert!(!torrent.info.is_directory);
        assert_eq!(torrent.file_manifest(), vec![("x.iso".to_string(), 1_048_576)]);
        assert_eq!(torrent.num_pieces(), 4);
        assert_eq!(torrent.piece_size(0), 262_144);
        assert_eq!(torrent.piece_size(3), 262_144);
        assert_eq!(torrent.total_length(), 1_048_576);
    }

    #[test]
    fn info_hash_is_stable_and_canonical() {
        let bytes = single_file_metainfo();
        let first = TorrentFile::from_bytes(&bytes).unwrap();
        let second = TorrentFile::from_bytes(&bytes).unwrap();
        assert_eq!(first.info_hash, second.info_hash);

        // equals SHA-1 over the canonical re-encoding of the info dict
        let (root, _) = crate::bencode::decoder::decode(&bytes).unwrap();
        let info = root.get(b"info").unwrap();
        let expected: [u8; 20] = Sha1::digest(bencode_bytes(info)).into();
        assert_eq!(first.info_hash, expected);
    }

    #[test]
    fn parses_multi_file_torrent() {
        let mut file_a = HashMap::new();
        file_a.insert(b"length".to_vec(), BencodeValue::Integer(100));
        file_a.insert(
            b"path".to_vec(),
            BencodeValue::List(vec![
                BencodeValue::String(b"sub".to_vec()),
                BencodeValue::String(b"a.txt".to_vec()),
            ]),
        );
        let mut file_b = HashMap::new();
        file_b.insert(b"length".to_vec(), BencodeValue::Integer(50));
        file_b.insert(
            b"path".to_vec(),
            BencodeValue::List(vec![BencodeValue::String(b"b.txt".to_vec())]),
        );

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"dir".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(64));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 60]));
        info.insert(
            b"files".to_vec(),
            BencodeValue::List(vec![
                BencodeValue::Dict(file_a),
                BencodeValue::Dict(file_b),
            ]),
        );

        let mut root = HashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://t/a".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        let torrent = TorrentFile::from_bytes(&bencode_bytes(&BencodeValue::Dict(root))).unwrap();
        assert!(torrent.info.is_directory);
        assert_eq!(torrent.total_length(), 150);
        assert_eq!(
            torrent.file_manifest(),
            vec![("sub/a.txt".to_string(), 100), ("b.txt".to_string(), 50)]
        );
        // last piece is truncated: 150 - 2*64 = 22
        assert_eq!(torrent.piece_size(2), 22);
        assert_eq!(
            torrent.file_paths_for_piece(0),
            vec![PathBuf::from("dir/sub/a.txt")]
        );
    }

    #[test]
    fn rejects_missing_announce() {
        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(1));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        let mut root = HashMap::new();
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        assert!(TorrentFile::from_bytes(&bencode_bytes(&BencodeValue::Dict(root))).is_err());
    }

    #[test]
    fn rejects_misaligned_pieces_string() {
        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(1));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 21]));
        let mut root = HashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://t/a".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        assert!(TorrentFile::from_bytes(&bencode_bytes(&BencodeValue::Dict(root))).is_err());
    }
}
