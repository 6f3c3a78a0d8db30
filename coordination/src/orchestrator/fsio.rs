//! Atomic artifact writes — temp file + rename, never a torn read.
//!
//! Every RunDir artifact (manifest, decisions, reports, ledger mirrors)
//! goes through [`atomic_write`] so a reader never observes a partial
//! write (spec §8 invariant 3). Grounded on the teacher's
//! `harness::session::save_session_state` persistence idiom, generalized
//! with the temp+rename step that file lacks.

use std::io::Write;
use std::path::Path;

use super::error::OrchestratorResult;

/// Write `contents` to `path` atomically: write to `path.tmp.<pid>`, fsync,
/// then rename over the destination. Rename is atomic on the same
/// filesystem on every platform this targets (POSIX `rename(2)`).
pub fn atomic_write(path: &Path, contents: &[u8]) -> OrchestratorResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        path.extension().and_then(|e| e.to_str()).unwrap_or("out")
    ));
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically write it to `path`.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> OrchestratorResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

/// Append a line to a JSONL file under an exclusive advisory lock held for
/// the duration of the write (spec §5: "ledger append holds the ledger
/// file lock only during the write").
pub fn append_line_locked(path: &Path, line: &str) -> OrchestratorResult<()> {
    use fs2::FileExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.lock_exclusive()
        .map_err(|e| super::error::OrchestratorError::RuntimeIo(e.to_string()))?;
    let result = (|| -> OrchestratorResult<()> {
        writeln!(f, "{line}")?;
        f.sync_all()?;
        Ok(())
    })();
    let _ = fs2::FileExt::unlock(&f);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");
        // Overwrite leaves no .tmp.* artifact behind.
        atomic_write(&path, b"{\"a\":2}").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn append_line_locked_accumulates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("actions.jsonl");
        append_line_locked(&path, "{\"a\":1}").unwrap();
        append_line_locked(&path, "{\"a\":2}").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
