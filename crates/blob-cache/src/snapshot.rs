//! Binary index snapshot
//!
//! File format (integers little-endian):
//! - Header: magic u32, item count u32, save time u32
//! - Records: key fp u64, content fp u64, last access u32, expiry u32,
//!   modtime u32, size u32, flags u8, etag len u8, content type len u8,
//!   then the etag bytes
//! - Footer: 20-byte truncated SHA-256 of everything before it
//!
//! Older versions are readable; writes always produce [`MAGIC_CURRENT`].

use crate::digest::{checksum, CHECKSUM_LEN};
use crate::error::{Result, SnapshotError};
use crate::index::Index;
use crate::types::{CacheItem, MAX_SHORT_STRING};
use std::fs;
use std::io;
use std::path::Path;

/// Headerless fixed records, no flags or strings.
pub const MAGIC_V1: u32 = 0x6263_0200;
/// Adds the header and the important flag plus etag tail.
pub const MAGIC_V2: u32 = 0x6263_0201;
/// Adds the content type length.
pub const MAGIC_CURRENT: u32 = 0x6263_0202;

const FLAG_IMPORTANT: u8 = 0x01;

const V1_RECORD_LEN: usize = 32;
const HEADER_LEN: usize = 12;
const RECORD_LEN: usize = 35;

type DecodeResult<T> = std::result::Result<T, SnapshotError>;

/// Smallest possible file: an empty v1 snapshot.
pub const MIN_SNAPSHOT_LEN: usize = 4 + CHECKSUM_LEN;

/// A decoded snapshot
#[derive(Debug)]
pub struct Snapshot {
    pub index: Index,
    pub magic: u32,
    pub saved_at: u32,
}

pub fn encode(index: &Index, save_epoch: u32) -> Vec<u8> {
    let items = index.iter_by_seq();
    let mut out = Vec::with_capacity(HEADER_LEN + items.len() * (RECORD_LEN + 16) + CHECKSUM_LEN);

    out.extend_from_slice(&MAGIC_CURRENT.to_le_bytes());
    out.extend_from_slice(&(items.len() as u32).to_le_bytes());
    out.extend_from_slice(&save_epoch.to_le_bytes());

    for item in items {
        let etag = item
            .etag
            .as_deref()
            .map(str::as_bytes)
            .filter(|e| e.len() <= MAX_SHORT_STRING)
            .unwrap_or_default();

        out.extend_from_slice(&item.key_fingerprint.to_le_bytes());
        out.extend_from_slice(&(item.content_fingerprint as u64).to_le_bytes());
        out.extend_from_slice(&item.last_access.to_le_bytes());
        out.extend_from_slice(&item.expiry.to_le_bytes());
        out.extend_from_slice(&item.modtime.to_le_bytes());
        out.extend_from_slice(&item.size.to_le_bytes());
        out.push(if item.important { FLAG_IMPORTANT } else { 0 });
        out.push(etag.len() as u8);
        out.push(item.content_type_len);
        out.extend_from_slice(etag);
    }

    let sum = checksum(&out);
    out.extend_from_slice(&sum);
    out
}

pub fn decode(data: &[u8]) -> DecodeResult<Snapshot> {
    if data.len() < MIN_SNAPSHOT_LEN {
        return Err(SnapshotError::TooShort(data.len()));
    }

    let body_len = data.len() - CHECKSUM_LEN;
    let (body, trailer) = data.split_at(body_len);
    if checksum(body).as_slice() != trailer {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let mut reader = Reader::new(body);
    let magic = reader.u32()?;
    let snapshot = match magic {
        MAGIC_V1 => read_v1(reader)?,
        MAGIC_V2 => read_versioned(reader, false)?,
        MAGIC_CURRENT => read_versioned(reader, true)?,
        other => return Err(SnapshotError::UnknownMagic(other)),
    };
    Ok(Snapshot { magic, ..snapshot })
}

fn read_v1(mut reader: Reader<'_>) -> DecodeResult<Snapshot> {
    if reader.remaining() % V1_RECORD_LEN != 0 {
        return Err(SnapshotError::Truncated { offset: reader.pos });
    }

    let mut index = Index::new();
    while reader.remaining() > 0 {
        let key_fingerprint = reader.u64()?;
        let content_fingerprint = reader.u64()? as u32;
        let last_access = reader.u32()?;
        let expiry = reader.u32()?;
        let modtime = reader.u32()?;
        let size = reader.u32()?;
        index.insert(CacheItem {
            key_fingerprint,
            content_fingerprint,
            last_access,
            expiry,
            modtime,
            size,
            content_type_len: 0,
            important: false,
            etag: None,
            seq: 0,
        });
    }

    Ok(Snapshot {
        index,
        magic: MAGIC_V1,
        saved_at: 0,
    })
}

fn read_versioned(
    mut reader: Reader<'_>,
    has_content_type: bool,
) -> DecodeResult<Snapshot> {
    let count = reader.u32()?;
    let saved_at = reader.u32()?;

    let mut index = Index::new();
    for _ in 0..count {
        let key_fingerprint = reader.u64()?;
        let content_fingerprint = reader.u64()? as u32;
        let last_access = reader.u32()?;
        let expiry = reader.u32()?;
        let modtime = reader.u32()?;
        let size = reader.u32()?;
        let flags = reader.u8()?;
        let etag_len = reader.u8()? as usize;
        let content_type_len = if has_content_type { reader.u8()? } else { 0 };
        let etag = reader.bytes(etag_len)?;
        let etag = if etag.is_empty() {
            None
        } else {
            String::from_utf8(etag.to_vec()).ok()
        };

        index.insert(CacheItem {
            key_fingerprint,
            content_fingerprint,
            last_access,
            expiry,
            modtime,
            size,
            content_type_len,
            important: flags & FLAG_IMPORTANT != 0,
            etag,
            seq: 0,
        });
    }

    if reader.remaining() > 0 {
        return Err(SnapshotError::TrailingBytes { offset: reader.pos });
    }

    Ok(Snapshot {
        index,
        magic: 0,
        saved_at,
    })
}

/// Read and decode `path`. A missing file is `Ok(None)`.
pub fn load_file(path: &Path) -> Result<Option<Snapshot>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(decode(&data)?))
}

/// Write via a temp file and rename, so readers never see a torn snapshot.
pub fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("dat.tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(SnapshotError::Truncated { offset: self.pos })?;
        let buf = self.buf;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key_fp: u64, size: u32) -> CacheItem {
        CacheItem {
            key_fingerprint: key_fp,
            content_fingerprint: key_fp as u32 ^ 0xabcd,
            last_access: 1_700_000_000 + key_fp as u32,
            expiry: 1_800_000_000,
            modtime: 1000,
            size,
            content_type_len: 9,
            important: key_fp % 2 == 0,
            etag: Some(format!("\"etag-{}\"", key_fp)),
            seq: 0,
        }
    }

    fn sample_index() -> Index {
        let mut index = Index::new();
        for key in 1..=5u64 {
            index.put(item(key, key as u32 * 100));
        }
        let mut bare = item(6, 1);
        bare.etag = None;
        index.put(bare);
        index
    }

    fn seal(mut body: Vec<u8>) -> Vec<u8> {
        let sum = checksum(&body);
        body.extend_from_slice(&sum);
        body
    }

    #[test]
    fn test_round_trip() {
        let index = sample_index();
        let bytes = encode(&index, 1_700_000_123);
        let snapshot = decode(&bytes).unwrap();

        assert_eq!(snapshot.magic, MAGIC_CURRENT);
        assert_eq!(snapshot.saved_at, 1_700_000_123);
        assert_eq!(snapshot.index.len(), index.len());
        assert_eq!(snapshot.index.current_size(), index.current_size());
        for original in index.iter() {
            let loaded = snapshot.index.lookup(original.key_fingerprint).unwrap();
            assert_eq!(loaded.etag, original.etag);
            assert_eq!(loaded.modtime, original.modtime);
            assert_eq!(loaded.expiry, original.expiry);
            assert_eq!(loaded.important, original.important);
            assert_eq!(loaded.content_type_len, 9);
            assert_eq!(loaded.content_fingerprint, original.content_fingerprint);
        }
    }

    #[test]
    fn test_round_trip_keeps_insertion_order() {
        let index = sample_index();
        let snapshot = decode(&encode(&index, 0)).unwrap();
        let before: Vec<u64> = index.iter_by_seq().iter().map(|i| i.key_fingerprint).collect();
        let after: Vec<u64> = snapshot
            .index
            .iter_by_seq()
            .iter()
            .map(|i| i.key_fingerprint)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_empty_index() {
        let bytes = encode(&Index::new(), 5);
        assert_eq!(bytes.len(), HEADER_LEN + CHECKSUM_LEN);
        let snapshot = decode(&bytes).unwrap();
        assert!(snapshot.index.is_empty());
    }

    #[test]
    fn test_any_flipped_byte_is_rejected() {
        let bytes = encode(&sample_index(), 42);
        for pos in 0..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[pos] ^= 0x40;
            assert!(decode(&corrupt).is_err(), "byte {} flip accepted", pos);
        }
    }

    #[test]
    fn test_flip_in_body_is_checksum_mismatch() {
        let mut bytes = encode(&sample_index(), 42);
        bytes[HEADER_LEN + 3] ^= 0xff;
        assert_eq!(decode(&bytes).unwrap_err(), SnapshotError::ChecksumMismatch);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(decode(&[0u8; 10]).unwrap_err(), SnapshotError::TooShort(10));
    }

    #[test]
    fn test_unknown_magic() {
        let body = 0x1234_5678u32.to_le_bytes().to_vec();
        assert_eq!(
            decode(&seal(body)).unwrap_err(),
            SnapshotError::UnknownMagic(0x1234_5678)
        );
    }

    #[test]
    fn test_count_larger_than_records_is_truncated() {
        let mut body = Vec::new();
        body.extend_from_slice(&MAGIC_CURRENT.to_le_bytes());
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&[0u8; RECORD_LEN]);
        assert!(matches!(
            decode(&seal(body)).unwrap_err(),
            SnapshotError::Truncated { .. }
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut body = encode(&Index::new(), 0);
        body.truncate(body.len() - CHECKSUM_LEN);
        body.push(0);
        assert_eq!(
            decode(&seal(body)).unwrap_err(),
            SnapshotError::TrailingBytes { offset: HEADER_LEN }
        );
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.dat");
        assert!(load_file(&path).unwrap().is_none());

        write_file(&path, &encode(&sample_index(), 9)).unwrap();
        let snapshot = load_file(&path).unwrap().unwrap();
        assert_eq!(snapshot.index.len(), 6);
        assert!(!dir.path().join("index.dat.tmp").exists());
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.dat");
        fs::write(&path, vec![0xa5u8; 200]).unwrap();
        assert!(matches!(
            load_file(&path),
            Err(crate::error::BlobCacheError::Snapshot(SnapshotError::ChecksumMismatch))
        ));
    }

    #[test]
    fn test_reads_v1() {
        let mut body = MAGIC_V1.to_le_bytes().to_vec();
        for (key, size) in [(7u64, 100u32), (8, 50)] {
            body.extend_from_slice(&key.to_le_bytes());
            body.extend_from_slice(&0x1_0000_0042u64.to_le_bytes());
            body.extend_from_slice(&10u32.to_le_bytes());
            body.extend_from_slice(&20u32.to_le_bytes());
            body.extend_from_slice(&30u32.to_le_bytes());
            body.extend_from_slice(&size.to_le_bytes());
        }

        let snapshot = decode(&seal(body)).unwrap();
        assert_eq!(snapshot.magic, MAGIC_V1);
        assert_eq!(snapshot.index.len(), 2);
        assert_eq!(snapshot.index.current_size(), 150);
        let item = snapshot.index.lookup(7).unwrap();
        assert_eq!(item.content_fingerprint, 0x42);
        assert_eq!(item.expiry, 20);
        assert_eq!(item.modtime, 30);
        assert!(!item.important);
        assert_eq!(item.content_type_len, 0);
    }

    #[test]
    fn test_reads_v1_any_record_count() {
        for count in [1u64, 3, 7] {
            let mut body = MAGIC_V1.to_le_bytes().to_vec();
            for key in 0..count {
                body.extend_from_slice(&key.to_le_bytes());
                body.extend_from_slice(&key.to_le_bytes());
                body.extend_from_slice(&[0u8; 12]);
                body.extend_from_slice(&10u32.to_le_bytes());
            }
            assert_eq!(body.len(), 4 + count as usize * V1_RECORD_LEN);

            let snapshot = decode(&seal(body)).unwrap();
            assert_eq!(snapshot.index.len(), count as usize);
            assert_eq!(snapshot.index.current_size(), count * 10);
        }
    }

    #[test]
    fn test_v1_partial_record_rejected() {
        let mut body = MAGIC_V1.to_le_bytes().to_vec();
        body.extend_from_slice(&[0u8; V1_RECORD_LEN + 3]);
        assert!(matches!(
            decode(&seal(body)).unwrap_err(),
            SnapshotError::Truncated { .. }
        ));
    }

    #[test]
    fn test_reads_v2_and_rewrites_current() {
        let mut body = Vec::new();
        body.extend_from_slice(&MAGIC_V2.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&99u32.to_le_bytes());
        body.extend_from_slice(&3u64.to_le_bytes());
        body.extend_from_slice(&5u64.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(&64u32.to_le_bytes());
        body.push(FLAG_IMPORTANT);
        body.push(2);
        body.extend_from_slice(b"e1");

        let snapshot = decode(&seal(body)).unwrap();
        assert_eq!(snapshot.magic, MAGIC_V2);
        assert_eq!(snapshot.saved_at, 99);
        let item = snapshot.index.lookup(3).unwrap();
        assert!(item.important);
        assert_eq!(item.etag.as_deref(), Some("e1"));
        assert_eq!(item.size, 64);

        let rewritten = decode(&encode(&snapshot.index, 100)).unwrap();
        assert_eq!(rewritten.magic, MAGIC_CURRENT);
        assert_eq!(rewritten.index.lookup(3).unwrap().etag.as_deref(), Some("e1"));
    }
}
