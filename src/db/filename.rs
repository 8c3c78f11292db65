//! Naming for the engine's on-disk / on-node artifacts.
//!
//! Sorted files and logs are zero-padded so lexicographic listing order
//! matches numeric order.

pub const MANIFEST_NAME: &str = "MANIFEST";

pub fn table_name(number: u64) -> String {
    format!("{number:06}.sst")
}

pub fn wal_name(number: u64) -> String {
    format!("{number:06}.wal")
}

/// Classify a region/file name produced by this engine.
#[derive(Debug, PartialEq, Eq)]
pub enum FileKind {
    Table(u64),
    Wal(u64),
    Manifest,
    Unknown,
}

pub fn parse_name(name: &str) -> FileKind {
    if name == MANIFEST_NAME {
        return FileKind::Manifest;
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        if let Ok(n) = stem.parse::<u64>() {
            return FileKind::Table(n);
        }
    }
    if let Some(stem) = name.strip_suffix(".wal") {
        if let Ok(n) = stem.parse::<u64>() {
            return FileKind::Wal(n);
        }
    }
    FileKind::Unknown
}
