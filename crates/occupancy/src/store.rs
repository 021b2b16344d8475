//! JSON-file daily summary store: one `<date>.json` per reset-date.

use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::info;

use crate::summary::{DailyStore, DailySummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write daily summary {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode daily summary: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct JsonDailyStore {
    dir: PathBuf,
}

impl JsonDailyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, summary: &DailySummary) -> PathBuf {
        self.dir
            .join(format!("{}.json", summary.date.format("%Y-%m-%d")))
    }
}

impl DailyStore for JsonDailyStore {
    /// Writes through a temporary file so a crash never leaves a truncated
    /// record behind; an existing record for the same date is replaced.
    fn persist(&self, summary: &DailySummary) -> Result<(), StoreError> {
        let path = self.path_for(summary);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let tmp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&tmp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, summary)?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)?;
        drop(writer);
        fs::rename(&tmp_path, &path).map_err(io_err)?;

        info!(path = %path.display(), daily_count = summary.daily_count, "daily summary saved");
        Ok(())
    }
}
