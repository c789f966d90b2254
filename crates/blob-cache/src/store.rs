//! Sharded on-disk blob files
//!
//! Layout: `<root>/<low byte of fp, 2 hex>/<fp, 16 hex>`. Each file holds the
//! content type bytes followed by the payload.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bytes read back from a blob file
#[derive(Debug)]
pub struct StoredBlob {
    pub content_type: Option<String>,
    /// Payload followed by the requested zero padding
    pub data: Vec<u8>,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn shard_name(key_fp: u64) -> String {
        format!("{:02x}", key_fp as u8)
    }

    pub fn file_name(key_fp: u64) -> String {
        format!("{:016x}", key_fp)
    }

    pub fn path_for(&self, key_fp: u64, create_dir: bool) -> PathBuf {
        let dir = self.root.join(Self::shard_name(key_fp));
        if create_dir {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(dir = ?dir, error = %e, "Failed to create shard directory");
            }
        }
        dir.join(Self::file_name(key_fp))
    }

    /// Write a blob file next to its final path, then rename it into place.
    pub fn write(&self, key_fp: u64, content_type: Option<&str>, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(key_fp, true);
        let tmp = path.with_extension("tmp");
        let result = File::create(&tmp)
            .and_then(|mut file| {
                if let Some(content_type) = content_type {
                    file.write_all(content_type.as_bytes())?;
                }
                file.write_all(data)?;
                file.flush()
            })
            .and_then(|()| fs::rename(&tmp, &path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    /// Read a blob file, checking its length against what the index expects.
    pub fn read(
        &self,
        key_fp: u64,
        content_type_len: usize,
        payload_len: usize,
        pad: usize,
    ) -> io::Result<StoredBlob> {
        let path = self.path_for(key_fp, false);
        let mut file = File::open(&path)?;

        let actual = file.metadata()?.len();
        let expected = (content_type_len + payload_len) as u64;
        if actual != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("blob file is {} bytes, index expects {}", actual, expected),
            ));
        }

        let content_type = if content_type_len > 0 {
            let mut buf = vec![0u8; content_type_len];
            file.read_exact(&mut buf)?;
            Some(String::from_utf8_lossy(&buf).into_owned())
        } else {
            None
        };

        let mut data = padded_buffer(payload_len, pad).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("cannot allocate {} bytes plus {} padding", payload_len, pad),
            )
        })?;
        data.resize(payload_len, 0);
        file.read_exact(&mut data)?;
        data.resize(payload_len + pad, 0);

        Ok(StoredBlob {
            content_type,
            data,
            len: payload_len,
        })
    }

    /// Best-effort removal; a file that is already gone is fine.
    pub fn delete(&self, key_fp: u64) {
        let path = self.path_for(key_fp, false);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = ?path, "Removed blob file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove blob file"),
        }
    }

    /// Every file under the shard directories, with its parsed fingerprint.
    ///
    /// The fingerprint is `None` when the name is not 16 hex digits or the
    /// file sits in the wrong shard.
    pub fn blob_files(&self) -> impl Iterator<Item = (PathBuf, Option<u64>)> {
        shard_dirs(&self.root).flat_map(|(shard, dir)| {
            fs::read_dir(&dir)
                .into_iter()
                .flatten()
                .flatten()
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(move |entry| {
                    let fp = entry
                        .file_name()
                        .to_str()
                        .and_then(parse_fingerprint)
                        .filter(|fp| *fp as u8 == shard);
                    (entry.path(), fp)
                })
        })
    }

    /// Delete files not referenced by `valid`, then any emptied shard dirs.
    pub fn sweep_orphans(&self, valid: &HashSet<u64>) -> usize {
        let mut removed = 0;
        for (path, fp) in self.blob_files() {
            if fp.is_some_and(|fp| valid.contains(&fp)) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = ?path, "Removed stale file");
                    removed += 1;
                }
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale file"),
            }
        }

        for (_, dir) in shard_dirs(&self.root) {
            // Fails while the directory still has entries
            let _ = fs::remove_dir(&dir);
        }
        removed
    }

    /// Delete every blob file.
    pub fn purge(&self) -> usize {
        self.sweep_orphans(&HashSet::new())
    }
}

fn shard_dirs(root: &Path) -> impl Iterator<Item = (u8, PathBuf)> {
    fs::read_dir(root)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            if name.len() != 2 {
                return None;
            }
            let shard = u8::from_str_radix(name, 16).ok()?;
            Some((shard, entry.path()))
        })
}

/// An empty buffer with room for `len + pad` bytes, or `None` when that size
/// overflows or the allocation fails.
pub(crate) fn padded_buffer(len: usize, pad: usize) -> Option<Vec<u8>> {
    let total = len.checked_add(pad)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(total).ok()?;
    Some(buf)
}

fn parse_fingerprint(name: &str) -> Option<u64> {
    if name.len() != 16 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// Directory name of the sharded store; legacy formats sit beside it.
pub const STORE_DIR_NAME: &str = "bc2";

/// Remove cache formats that predate the sharded store.
///
/// They live next to a root named [`STORE_DIR_NAME`]: a `blobcache/` tree of
/// expiry-prefixed files and a `cachedb/` SQLite database. Other roots are
/// left alone.
pub fn remove_legacy_formats(root: &Path) {
    if root.file_name() != Some(OsStr::new(STORE_DIR_NAME)) {
        return;
    }
    let Some(parent) = root.parent() else {
        return;
    };

    let old_tree = parent.join("blobcache");
    if old_tree.is_dir() {
        match fs::remove_dir_all(&old_tree) {
            Ok(()) => info!(path = ?old_tree, "Removed legacy blob cache"),
            Err(e) => warn!(path = ?old_tree, error = %e, "Failed to remove legacy blob cache"),
        }
    }

    for name in ["cache.db", "cache.db-shm", "cache.db-wal"] {
        let path = parent.join("cachedb").join(name);
        match fs::remove_file(&path) {
            Ok(()) => info!(path = ?path, "Removed legacy cache database"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove legacy cache database"),
        }
    }
}
