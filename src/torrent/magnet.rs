//! Magnet link parsing.
//!
//! Only enough of the magnet scheme is implemented to surface the 20-byte info hash
//! (plus display name and tracker hints); metadata exchange over the wire is not part
//! of this crate.
use super::TorrentError;
use super::TorrentResult;
use tracing::instrument;

/// The fields of a parsed `magnet:?` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub file_size: Option<i64>,
}

impl MagnetLink {
    /// Parses a magnet URI of the form
    /// `magnet:?xt=urn:btih:<40-hex>&dn=<name>&tr=<tracker>&xl=<size>`.
    ///
    /// The `xt` parameter is required and must carry a 40-character hex info hash;
    /// every other parameter is optional. Repeated `tr` parameters accumulate.
    #[instrument(level = "debug")]
    pub fn parse(link: &str) -> TorrentResult<MagnetLink> {
        let url = url::Url::parse(link)?;
        if url.scheme() != "magnet" {
            return Err(TorrentError::InvalidMagnet(format!(
                "Not a magnet scheme: {}",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut file_size = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hash_hex = value.strip_prefix("urn:btih:").ok_or_else(|| {
                        TorrentError::InvalidMagnet("xt is not a urn:btih hash".to_string())
                    })?;
                    info_hash = Some(decode_info_hash(hash_hex)?);
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "xl" => {
                    file_size = Some(value.parse::<i64>().map_err(|_| {
                        TorrentError::InvalidMagnet("xl is not an integer".to_string())
                    })?);
                }
                // unknown parameters are ignored
                _ => {}
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| TorrentError::InvalidMagnet("Info hash not found".to_string()))?;

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
            file_size,
        })
    }
}

/// Decodes the 40-character hex form of an info hash into its 20 raw bytes.
fn decode_info_hash(hash_hex: &str) -> TorrentResult<[u8; 20]> {
    if hash_hex.len() != 40 {
        return Err(TorrentError::InvalidMagnet(format!(
            "Info hash must be 40 hex chars, got {}",
            hash_hex.len()
        )));
    }
    let bytes = hex::decode(hash_hex)
        .map_err(|e| TorrentError::InvalidMagnet(format!("Invalid hex info hash: {}", e)))?;
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&bytes);
    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_HEX: &str = "aaf5bb8c1e0d9c8f3a2b4d5e6f708192a3b4c5d6";

    #[test]
    fn parses_full_magnet_link() {
        let link = format!(
            "magnet:?xt=urn:btih:{}&dn=debian.iso&tr=http%3A%2F%2Ftracker.example%2Fannounce&xl=1048576",
            HASH_HEX
        );
        let magnet = MagnetLink::parse(&link).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), HASH_HEX);
        assert_eq!(magnet.display_name.as_deref(), Some("debian.iso"));
        assert_eq!(
            magnet.trackers,
            vec!["http://tracker.example/announce".to_string()]
        );
        assert_eq!(magnet.file_size, Some(1_048_576));
    }

    #[test]
    fn accumulates_multiple_trackers() {
        let link = format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Fa%2Fann&tr=http%3A%2F%2Fb%2Fann",
            HASH_HEX
        );
        let magnet = MagnetLink::parse(&link).unwrap();
        assert_eq!(magnet.trackers.len(), 2);
    }

    #[test]
    fn rejects_missing_info_hash() {
        assert!(MagnetLink::parse("magnet:?dn=foo").is_err());
    }

    #[test]
    fn rejects_short_hash() {
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:abcdef").is_err());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(MagnetLink::parse("http://example.com/?xt=urn:btih:abc").is_err());
    }
}
