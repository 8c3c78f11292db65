//! Manifest persistence.
//!
//! The manifest captures the complete current state — file list per level,
//! counters, comparator name — and is rewritten wholesale on every version
//! install: write to MANIFEST.tmp, fsync, rename over MANIFEST. The rename
//! is the commit point, so a crash leaves either the old or the new state,
//! never a torn one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::version::FileMeta;

const MANIFEST_MAGIC: u64 = 0x4C53_4D5F_4D41_4E31; // "LSM_MAN1"

/// Everything the manifest persists.
#[derive(Debug, Clone)]
pub struct ManifestState {
    pub comparator_name: String,
    pub next_file_number: u64,
    pub last_sequence: u64,
    pub log_number: u64,
    pub files: Vec<(usize, FileMeta)>,
}

pub fn save(path: &Path, state: &ManifestState) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
    let name = state.comparator_name.as_bytes();
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(&state.next_file_number.to_le_bytes());
    buf.extend_from_slice(&state.last_sequence.to_le_bytes());
    buf.extend_from_slice(&state.log_number.to_le_bytes());

    buf.extend_from_slice(&(state.files.len() as u32).to_le_bytes());
    for (level, meta) in &state.files {
        buf.extend_from_slice(&(*level as u32).to_le_bytes());
        buf.extend_from_slice(&meta.number.to_le_bytes());
        buf.extend_from_slice(&meta.file_size.to_le_bytes());
        buf.extend_from_slice(&meta.entry_count.to_le_bytes());
        buf.extend_from_slice(&(meta.smallest.len() as u32).to_le_bytes());
        buf.extend_from_slice(&meta.smallest);
        buf.extend_from_slice(&(meta.largest.len() as u32).to_le_bytes());
        buf.extend_from_slice(&meta.largest);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    // Make the rename itself durable.
    if let Some(dir) = path.parent() {
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<ManifestState> {
    let data = fs::read(path)?;
    if data.len() < 8 + 4 {
        return Err(Error::Corruption("manifest too short".into()));
    }
    let body_len = data.len() - 4;
    let stored_crc = u32::from_le_bytes(data[body_len..].try_into().unwrap());
    if crc32fast::hash(&data[..body_len]) != stored_crc {
        return Err(Error::Corruption("manifest CRC mismatch".into()));
    }

    let mut pos = 0usize;
    let read_u32 = |data: &[u8], pos: &mut usize| -> Result<u32> {
        if *pos + 4 > body_len {
            return Err(Error::Corruption("manifest truncated".into()));
        }
        let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
        *pos += 4;
        Ok(v)
    };
    let read_u64 = |data: &[u8], pos: &mut usize| -> Result<u64> {
        if *pos + 8 > body_len {
            return Err(Error::Corruption("manifest truncated".into()));
        }
        let v = u64::from_le_bytes(data[*pos..*pos + 8].try_into().unwrap());
        *pos += 8;
        Ok(v)
    };
    let read_bytes = |data: &[u8], pos: &mut usize, len: usize| -> Result<Vec<u8>> {
        if *pos + len > body_len {
            return Err(Error::Corruption("manifest truncated".into()));
        }
        let v = data[*pos..*pos + len].to_vec();
        *pos += len;
        Ok(v)
    };

    let magic = read_u64(&data, &mut pos)?;
    if magic != MANIFEST_MAGIC {
        return Err(Error::Corruption(format!("bad manifest magic: {magic:#x}")));
    }
    let name_len = read_u32(&data, &mut pos)? as usize;
    let name = read_bytes(&data, &mut pos, name_len)?;
    let comparator_name = String::from_utf8(name)
        .map_err(|_| Error::Corruption("manifest comparator name not UTF-8".into()))?;
    let next_file_number = read_u64(&data, &mut pos)?;
    let last_sequence = read_u64(&data, &mut pos)?;
    let log_number = read_u64(&data, &mut pos)?;

    let n_files = read_u32(&data, &mut pos)? as usize;
    let mut files = Vec::with_capacity(n_files);
    for _ in 0..n_files {
        let level = read_u32(&data, &mut pos)? as usize;
        if level >= crate::version::NUM_LEVELS {
            return Err(Error::Corruption(format!("manifest level out of range: {level}")));
        }
        let number = read_u64(&data, &mut pos)?;
        let file_size = read_u64(&data, &mut pos)?;
        let entry_count = read_u64(&data, &mut pos)?;
        let slen = read_u32(&data, &mut pos)? as usize;
        let smallest = read_bytes(&data, &mut pos, slen)?;
        let llen = read_u32(&data, &mut pos)? as usize;
        let largest = read_bytes(&data, &mut pos, llen)?;
        files.push((
            level,
            FileMeta {
                number,
                file_size,
                smallest,
                largest,
                entry_count,
            },
        ));
    }

    Ok(ManifestState {
        comparator_name,
        next_file_number,
        last_sequence,
        log_number,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ValueType, encode_internal_key};
    use tempfile::tempdir;

    fn state() -> ManifestState {
        ManifestState {
            comparator_name: "lsm-remote.BytewiseComparator".into(),
            next_file_number: 12,
            last_sequence: 99,
            log_number: 11,
            files: vec![(
                0,
                FileMeta {
                    number: 7,
                    file_size: 4096,
                    smallest: encode_internal_key(b"a", 1, ValueType::Put),
                    largest: encode_internal_key(b"z", 9, ValueType::Put),
                    entry_count: 100,
                },
            )],
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        save(&path, &state()).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.next_file_number, 12);
        assert_eq!(loaded.last_sequence, 99);
        assert_eq!(loaded.log_number, 11);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].0, 0);
        assert_eq!(loaded.files[0].1.number, 7);
    }

    #[test]
    fn corrupt_manifest_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        save(&path, &state()).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0x40;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(load(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn rewrite_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        save(&path, &state()).unwrap();
        let mut second = state();
        second.last_sequence = 1000;
        save(&path, &second).unwrap();
        assert_eq!(load(&path).unwrap().last_sequence, 1000);
        assert!(!path.with_extension("tmp").exists());
    }
}
