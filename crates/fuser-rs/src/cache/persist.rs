//! On-disk container for a serialized fusion cache.
//!
//! Layout: 8-byte magic, `u32` format version, `u64` payload length, bincode payload, then the
//! 32-byte blake3 digest of the payload. All integers are little endian. Readers reject unknown
//! versions instead of attempting a lossy decode.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::shape_key::ConcreteShapeKey;
use crate::trace::Trace;

const MAGIC: &[u8; 8] = b"FUSERCCH";
pub const FORMAT_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedCache {
    pub(crate) backend: String,
    pub(crate) entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub(crate) fingerprint: Fingerprint,
    pub(crate) trace: Trace,
    pub(crate) specializations: Vec<PersistedSpecialization>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedSpecialization {
    pub(crate) key: ConcreteShapeKey,
    pub(crate) artifact: PersistedArtifact,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum PersistedArtifact {
    /// Backend-portable artifact encoding.
    Portable(Vec<u8>),
    /// Only the trace and key survive; compiled again on first compatible lookup.
    Recompile,
}

/// Writes through a sibling temporary file so a failed write never clobbers an existing cache.
/// The temporary file is removed whenever the write does not complete.
pub(crate) fn write_container(path: &Path, cache: &PersistedCache) -> Result<()> {
    let payload = bincode::serialize(cache).context("failed to encode cache payload")?;
    let checksum = blake3::hash(&payload);

    let tmp = temporary_path(path);
    let written = write_file(&tmp, &payload, checksum.as_bytes()).and_then(|()| {
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move cache file into {}", path.display()))
    });
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

fn write_file(tmp: &Path, payload: &[u8], checksum: &[u8]) -> Result<()> {
    let file =
        File::create(tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(checksum)?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", tmp.display()))
}

pub(crate) fn read_container(path: &Path) -> Result<PersistedCache> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    decode_container(&bytes)
}

pub(crate) fn decode_container(bytes: &[u8]) -> Result<PersistedCache> {
    let header_len = MAGIC.len() + 4 + 8;
    ensure!(
        bytes.len() >= header_len,
        "file is truncated ({} bytes, header needs {header_len})",
        bytes.len()
    );
    if &bytes[..MAGIC.len()] != MAGIC {
        bail!("invalid fusion cache magic header");
    }
    let version = read_u32(&bytes[8..12])?;
    if version != FORMAT_VERSION {
        bail!(
            "unsupported fusion cache version {version} (expected {FORMAT_VERSION})"
        );
    }
    let payload_len = usize::try_from(read_u64(&bytes[12..20])?)
        .map_err(|_| anyhow!("payload length does not fit in memory"))?;
    let expected_len = header_len
        .checked_add(payload_len)
        .and_then(|len| len.checked_add(CHECKSUM_LEN))
        .ok_or_else(|| anyhow!("payload length {payload_len} overflows"))?;
    ensure!(
        bytes.len() == expected_len,
        "file length {} does not match declared payload ({expected_len} bytes expected)",
        bytes.len()
    );
    let payload = &bytes[header_len..header_len + payload_len];
    let checksum = &bytes[header_len + payload_len..];
    ensure!(
        blake3::hash(payload).as_bytes().as_slice() == checksum,
        "payload checksum mismatch"
    );
    bincode::deserialize(payload).context("failed to decode cache payload")
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes.try_into().context("short u32 field")?;
    Ok(u32::from_le_bytes(array))
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes.try_into().context("short u64 field")?;
    Ok(u64::from_le_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_container() -> Vec<u8> {
        let payload = bincode::serialize(&PersistedCache {
            backend: "cpu".to_string(),
            entries: Vec::new(),
        })
        .expect("payload encodes");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(blake3::hash(&payload).as_bytes());
        bytes
    }

    #[test]
    fn well_formed_container_decodes() {
        let cache = decode_container(&empty_container()).expect("decodes");
        assert_eq!(cache.backend, "cpu");
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn damaged_containers_are_rejected() {
        let good = empty_container();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert!(decode_container(&bad_magic).is_err());

        let mut future = good.clone();
        future[8..12].copy_from_slice(&2u32.to_le_bytes());
        let err = decode_container(&future).expect_err("version skew");
        assert!(err.to_string().contains("unsupported fusion cache version 2"));

        assert!(decode_container(&good[..good.len() - 1]).is_err());
        assert!(decode_container(&good[..10]).is_err());

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(decode_container(&trailing).is_err());

        let mut flipped = good.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert!(decode_container(&flipped).is_err());
    }

    #[test]
    fn failed_writes_leave_no_temporary_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        // Renaming a file onto an existing directory fails after the temporary file exists.
        let occupied = dir.path().join("occupied");
        fs::create_dir(&occupied).expect("directory created");
        let cache = PersistedCache {
            backend: "cpu".to_string(),
            entries: Vec::new(),
        };
        assert!(write_container(&occupied, &cache).is_err());
        assert!(!temporary_path(&occupied).exists());
        assert!(occupied.is_dir());

        let target = dir.path().join("fusion.cache");
        write_container(&target, &cache).expect("container written");
        assert!(!temporary_path(&target).exists());
        let decoded = read_container(&target).expect("container reads back");
        assert_eq!(decoded.backend, "cpu");
    }
}
