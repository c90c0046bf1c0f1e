//! Spill directory lifecycle
//!
//! Partition run files and chain temporaries live under `memory.spill_dir`.
//! The directory is emptied on clean exit. After a crash it still holds
//! partitions; the next run refuses to start unless told to resume, so a
//! crashed run can be diagnosed before its evidence is destroyed.
//!
//! A marker file identifies directories this engine owns; the guard never
//! wipes a directory without it.

use kgm_common::{KgmError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MARKER: &str = ".kgm-spill";

/// How to treat a spill directory left over from an earlier run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Leftovers are an error
    #[default]
    Refuse,
    /// Keep leftovers and continue on top of them
    Resume,
    /// Discard leftovers and start over
    ForceResume,
}

/// Guard over a prepared spill directory
#[derive(Debug)]
pub struct SpillGuard {
    dir: PathBuf,
}

impl SpillGuard {
    /// Prepare the spill directory according to the resume mode
    pub fn prepare(dir: impl Into<PathBuf>, mode: ResumeMode) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            let leftovers = has_leftovers(&dir)?;
            if leftovers {
                match mode {
                    ResumeMode::Refuse => {
                        return Err(KgmError::SpillDirBusy { dir });
                    },
                    ResumeMode::Resume => {
                        warn!(dir = %dir.display(), "resuming on top of existing spill state");
                    },
                    ResumeMode::ForceResume => {
                        info!(dir = %dir.display(), "discarding existing spill state");
                        wipe(&dir)?;
                    },
                }
            }
        }
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(MARKER), b"")
            .map_err(|e| KgmError::write_error(e, dir.join(MARKER)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove everything on clean completion. Not called on crash: the
    /// partitions stay on disk for post-mortem.
    pub fn cleanup(self) -> Result<()> {
        wipe(&self.dir)?;
        std::fs::remove_dir_all(&self.dir).ok();
        Ok(())
    }
}

fn has_leftovers(dir: &Path) -> Result<bool> {
    let marker = dir.join(MARKER);
    if !marker.exists() {
        // A non-empty directory we do not own is also refused; wiping it
        // would be destructive.
        let occupied = std::fs::read_dir(dir)?.next().is_some();
        if occupied {
            return Err(KgmError::config(
                format!("spill directory '{}' is not empty and was not created by kgm", dir.display()),
                "Point memory.spill_dir at a dedicated directory",
            ));
        }
        return Ok(false);
    }
    // Marker plus anything else means a previous run left state behind.
    let extra = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .any(|e| e.file_name() != MARKER);
    Ok(extra)
}

fn wipe(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_directory_prepared() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        let guard = SpillGuard::prepare(&spill, ResumeMode::Refuse).unwrap();
        assert!(spill.join(MARKER).exists());
        guard.cleanup().unwrap();
        assert!(!spill.exists());
    }

    #[test]
    fn test_leftovers_refused_without_resume() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        let guard = SpillGuard::prepare(&spill, ResumeMode::Refuse).unwrap();
        std::fs::write(spill.join("run-d0-0000.jsonl"), "{}").unwrap();
        drop(guard);

        let err = SpillGuard::prepare(&spill, ResumeMode::Refuse).unwrap_err();
        assert!(matches!(err, KgmError::SpillDirBusy { .. }));
    }

    #[test]
    fn test_force_resume_wipes() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        SpillGuard::prepare(&spill, ResumeMode::Refuse).unwrap();
        std::fs::write(spill.join("run-d0-0000.jsonl"), "{}").unwrap();

        SpillGuard::prepare(&spill, ResumeMode::ForceResume).unwrap();
        assert!(!spill.join("run-d0-0000.jsonl").exists());
    }

    #[test]
    fn test_resume_keeps_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        SpillGuard::prepare(&spill, ResumeMode::Refuse).unwrap();
        std::fs::write(spill.join("run-d0-0000.jsonl"), "{}").unwrap();

        SpillGuard::prepare(&spill, ResumeMode::Resume).unwrap();
        assert!(spill.join("run-d0-0000.jsonl").exists());
    }

    #[test]
    fn test_foreign_directory_refused() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        std::fs::create_dir_all(&spill).unwrap();
        std::fs::write(spill.join("precious.txt"), "do not delete").unwrap();

        let err = SpillGuard::prepare(&spill, ResumeMode::ForceResume).unwrap_err();
        assert!(matches!(err, KgmError::Config { .. }));
        assert!(spill.join("precious.txt").exists());
    }
}
