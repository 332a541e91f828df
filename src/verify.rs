use crate::benc::{self, BencDict};
use crate::error::ResolveError;
use crate::hash::InfoHash;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Checks candidate metadata against `hash` and returns it as a full torrent.
///
/// `data` may be a complete torrent file or a bare info dictionary (as
/// delivered by `ut_metadata`). The info bytes are never re-encoded, so the
/// returned torrent hashes exactly like the input. For the sentinel hash any
/// well-formed metadata is accepted.
pub fn verify_metadata(data: &[u8], hash: &InfoHash) -> Result<Vec<u8>, ResolveError> {
    let dict = BencDict::parse_exact(data)
        .ok_or_else(|| ResolveError::transport("metadata is not a bencoded dictionary"))?;

    let (info, wrapped) = match dict.get_dict(b"info") {
        Some(info) => (info.raw(), false),
        None if looks_like_info(&dict) => (data, true),
        None => return Err(ResolveError::transport("metadata has no info dictionary")),
    };

    if !hash.is_sentinel() {
        check_info_hash(info, hash)?;
    }

    Ok(if wrapped { wrap_info(info) } else { data.to_vec() })
}

/// Full digest match, or truncated SHA-256 for v1-sized hashes.
pub fn check_info_hash(info: &[u8], hash: &InfoHash) -> Result<(), ResolveError> {
    let sha256 = Sha256::digest(info);
    let ok = match hash {
        InfoHash::V1(expected) => {
            let sha1 = Sha1::digest(info);
            sha1.as_slice() == expected || &sha256[..20] == expected
        }
        InfoHash::V2(expected) => sha256.as_slice() == expected,
    };
    if ok {
        return Ok(());
    }

    let actual = match hash {
        InfoHash::V1(_) => hex::encode(Sha1::digest(info)),
        InfoHash::V2(_) => hex::encode(sha256),
    };
    Err(ResolveError::HashMismatch {
        expected: hash.to_hex(),
        actual,
    })
}

/// `d4:info<raw>e`
pub fn wrap_info(info: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(info.len() + 8);
    out.push(b'd');
    benc::put_bytes(&mut out, b"info");
    out.extend_from_slice(info);
    out.push(b'e');
    out
}

/// Raw info dictionary of a full torrent.
pub fn info_slice(torrent: &[u8]) -> Option<&[u8]> {
    BencDict::parse_exact(torrent)?.get_dict(b"info").map(|d| d.raw())
}

fn looks_like_info(dict: &BencDict<'_>) -> bool {
    dict.get_raw(b"piece length").is_some()
        || dict.get_raw(b"pieces").is_some()
        || dict.get_raw(b"meta version").is_some()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn sample_info(name: &str) -> Vec<u8> {
        let mut out = b"d6:lengthi1024e4:name".to_vec();
        benc::put_bytes(&mut out, name.as_bytes());
        out.extend_from_slice(b"12:piece lengthi16384e6:pieces20:");
        out.extend_from_slice(&[7u8; 20]);
        out.push(b'e');
        out
    }

    pub(crate) fn v1_hash(info: &[u8]) -> InfoHash {
        InfoHash::from_bytes(Sha1::digest(info).as_slice()).unwrap()
    }

    #[test]
    fn bare_info_is_wrapped_and_verified() {
        let info = sample_info("file.bin");
        let hash = v1_hash(&info);
        let torrent = verify_metadata(&info, &hash).unwrap();
        assert_eq!(info_slice(&torrent), Some(info.as_slice()));
    }

    #[test]
    fn deeply_nested_blob_is_rejected() {
        let mut blob = b"d4:info".to_vec();
        blob.extend(std::iter::repeat_n(b'l', 65_536));
        let hash = v1_hash(&sample_info("nested"));
        assert!(matches!(
            verify_metadata(&blob, &hash),
            Err(ResolveError::Transport(_))
        ));
    }

    #[test]
    fn full_torrent_passes_through_unchanged() {
        let info = sample_info("file.bin");
        let mut torrent = b"d8:announce9:http://t/".to_vec();
        torrent.extend_from_slice(b"4:info");
        torrent.extend_from_slice(&info);
        torrent.push(b'e');
        let out = verify_metadata(&torrent, &v1_hash(&info)).unwrap();
        assert_eq!(out, torrent);
    }

    #[test]
    fn truncated_sha256_and_v2_are_accepted() {
        let info = sample_info("v2");
        let digest = Sha256::digest(&info);
        let truncated = InfoHash::from_bytes(&digest[..20]).unwrap();
        let full = InfoHash::from_bytes(digest.as_slice()).unwrap();
        assert!(verify_metadata(&info, &truncated).is_ok());
        assert!(verify_metadata(&info, &full).is_ok());
    }

    #[test]
    fn mismatch_reports_both_hashes() {
        let info = sample_info("a");
        let other = v1_hash(&sample_info("b"));
        match verify_metadata(&info, &other) {
            Err(ResolveError::HashMismatch { expected, actual }) => {
                assert_eq!(expected, other.to_hex());
                assert_eq!(actual, v1_hash(&info).to_hex());
            }
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn sentinel_accepts_any_wellformed_torrent() {
        assert!(verify_metadata(&sample_info("any"), &InfoHash::SENTINEL).is_ok());
        assert!(verify_metadata(b"d3:foo3:bare", &InfoHash::SENTINEL).is_err());
        assert!(verify_metadata(b"<html>", &InfoHash::SENTINEL).is_err());
    }

    proptest! {
        #[test]
        fn corrupted_info_is_never_accepted(
            name in "[a-z]{1,12}",
            pos in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let info = sample_info(&name);
            let hash = v1_hash(&info);
            let mut bad = info.clone();
            let i = pos.index(bad.len());
            bad[i] ^= flip;
            prop_assert!(verify_metadata(&bad, &hash).is_err());

            let mut torrent = b"d4:info".to_vec();
            torrent.extend_from_slice(&bad);
            torrent.push(b'e');
            prop_assert!(verify_metadata(&torrent, &hash).is_err());
        }

        #[test]
        fn truncated_blobs_are_never_accepted(name in "[a-z]{1,12}", cut in 1usize..40) {
            let info = sample_info(&name);
            let hash = v1_hash(&info);
            let keep = info.len().saturating_sub(cut);
            prop_assert!(verify_metadata(&info[..keep], &hash).is_err());
        }
    }
}
