//! Persistent shot counter.
//!
//! A `SHOT` file in the output directory holds the index of the last recorded shot,
//! so looped captures resume numbering across runs and on-disk names never collide.

use std::path::{Path, PathBuf};

use crate::error::{AcqError, AcqResult};

const LEDGER_FILE: &str = "SHOT";

/// Shot counter stored in `<dir>/SHOT`.
///
/// ```
/// # tokio_test::block_on(async {
/// use acq_shot::capture::ShotLedger;
///
/// let dir = tempfile::tempdir()?;
/// let ledger = ShotLedger::open(dir.path()).await?;
/// let shot = ledger.next_index().await?;
/// ledger.record(shot).await?;
/// assert_eq!(ledger.next_index().await?, shot + 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # }).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ShotLedger {
    path: PathBuf,
}

impl ShotLedger {
    /// Open (creating the directory if needed) the ledger in `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> AcqResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            path: dir.join(LEDGER_FILE),
        })
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last recorded shot, `None` if nothing has been recorded yet.
    pub async fn last(&self) -> AcqResult<Option<u64>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text.trim().parse::<u64>().map(Some).map_err(|e| {
                AcqError::InvalidConfig(format!(
                    "{} holds {:?}, not a shot number: {e}",
                    self.path.display(),
                    text.trim()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Index the next shot should use.
    pub async fn next_index(&self) -> AcqResult<u64> {
        Ok(self.last().await?.map_or(0, |last| last + 1))
    }

    /// Record `index` as the last shot. The file is replaced atomically.
    pub async fn record(&self, index: u64) -> AcqResult<()> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, format!("{index}\n")).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(shot = index, path = %self.path.display(), "shot ledger updated");
        Ok(())
    }
}
