// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persisted ring sequence number.
//!
//! One file per node, holding `ring_id_seq:u64` little-endian. Rewritten
//! on every successful Commit -> Recovery transition. A missing file
//! means the node has never formed a ring and starts from seq 0.

use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Read the persisted ring sequence at `path`. Returns 0 if the file does
/// not exist.
pub fn read_ring_seq(path: &Path) -> Result<u64> {
    match fs::read(path) {
        Ok(bytes) => {
            if bytes.len() < 8 {
                return Err(Error::PersistFailure(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "ring sequence file shorter than 8 bytes",
                )));
            }
            Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::PersistFailure(e)),
    }
}

/// Persist `seq` to `path`, replacing any previous value. Writes to a
/// sibling temp file and renames over the target so a crash mid-write
/// cannot leave a torn value behind for a future ring to regress into.
pub fn write_ring_seq(path: &Path, seq: u64) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp_path).map_err(Error::PersistFailure)?;
        f.write_all(&seq.to_le_bytes()).map_err(Error::PersistFailure)?;
        f.sync_all().map_err(Error::PersistFailure)?;
    }
    fs::rename(&tmp_path, path).map_err(Error::PersistFailure)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_as_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.seq");
        assert_eq!(read_ring_seq(&path).unwrap(), 0);
    }

    #[test]
    fn round_trip_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.seq");
        write_ring_seq(&path, 42).unwrap();
        assert_eq!(read_ring_seq(&path).unwrap(), 42);
    }

    #[test]
    fn overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.seq");
        write_ring_seq(&path, 1).unwrap();
        write_ring_seq(&path, 2).unwrap();
        assert_eq!(read_ring_seq(&path).unwrap(), 2);
    }

    #[test]
    fn truncated_file_is_persist_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.seq");
        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(matches!(read_ring_seq(&path), Err(Error::PersistFailure(_))));
    }
}
