//! Parquet storage and remote fetch of processed tables.
//!
//! Every write goes to a temporary file next to the target and is renamed
//! into place, so readers never observe a partially written file.

use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use polars::prelude::*;
use reqwest::blocking::Client;

use hbs_model::{HbsError, Result};

/// Reads a parquet file.
pub fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).map_err(|e| HbsError::io(path, e))?;
    Ok(ParquetReader::new(file).finish()?)
}

/// Writes `df` to `path` through a temporary file.
pub fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<()> {
    let temp_path = temp_path_for(path);
    ensure_parent(path)?;

    let mut file = File::create(&temp_path).map_err(|e| HbsError::io(&temp_path, e))?;
    let written = ParquetWriter::new(&mut file).finish(df);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }
    file.sync_all().map_err(|e| HbsError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| HbsError::io(path, e))?;
    tracing::info!(path = %path.display(), rows = df.height(), "saved parquet");
    Ok(())
}

/// Writes text to `path` through a temporary file.
pub fn write_text_atomic(text: &str, path: &Path) -> Result<()> {
    let temp_path = temp_path_for(path);
    ensure_parent(path)?;

    let mut file = File::create(&temp_path).map_err(|e| HbsError::io(&temp_path, e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| HbsError::io(&temp_path, e))?;
    file.sync_all().map_err(|e| HbsError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| HbsError::io(path, e))?;
    Ok(())
}

/// Removes a file if it exists.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HbsError::io(path, e)),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HbsError::io(parent, e))?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Blocking client for the processed-table mirror.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: Client,
}

impl RemoteStore {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HbsError::Download {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Downloads and decodes a parquet file. No retries.
    pub fn download_parquet(&self, url: &str) -> Result<DataFrame> {
        let download_err = |message: String| HbsError::Download {
            url: url.to_string(),
            message,
        };

        tracing::debug!(url, "downloading processed table");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| download_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(download_err(format!("HTTP {}", response.status().as_u16())));
        }

        let bytes = response.bytes().map_err(|e| download_err(e.to_string()))?;
        let df = ParquetReader::new(Cursor::new(bytes.to_vec()))
            .finish()
            .map_err(|e| download_err(e.to_string()))?;
        tracing::info!(url, rows = df.height(), "downloaded processed table");
        Ok(df)
    }
}
