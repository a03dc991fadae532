//! Package settings.
//!
//! Defaults ship inside the crate (`config/default_settings.toml`). A local
//! file may override any of the packaged keys; keys the packaged file does
//! not define are ignored with a warning.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use hbs_model::{HbsError, LoadTableSettings, Result};
use serde::{Deserialize, Serialize};

use crate::resolver::VersioningSettings;
use crate::years::SurveySpan;

const PACKAGED_SETTINGS: &str = include_str!("../config/default_settings.toml");

/// Environment variable naming an override settings file.
pub const SETTINGS_ENV: &str = "HBS_SETTINGS";

/// Override file looked up in the working directory.
pub const LOCAL_SETTINGS_FILE: &str = "hbs_settings.toml";

/// Subdirectories of the local data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySettings {
    pub extracted_data: PathBuf,
    pub processed_data: PathBuf,
    pub external_data: PathBuf,
    pub cached_data: PathBuf,
}

/// Well-known column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSettings {
    pub year: String,
    pub household_id: String,
    pub commodity_code: String,
    pub job_code: String,
    pub weight: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub first_year: i64,
    pub last_year: i64,
    /// Base URL of the published processed tables.
    pub online_directory: String,
    /// Root of the local data tree; relative paths resolve against the
    /// working directory.
    pub local_directory: PathBuf,
    /// Directory of local metadata overrides (`{name}.yaml`).
    pub local_metadata_directory: PathBuf,
    pub worker_threads: usize,
    pub request_timeout_secs: u64,
    pub directories: DirectorySettings,
    pub columns: ColumnSettings,
    pub versioning: VersioningSettings,
    pub load_table: LoadTableSettings,
}

impl Settings {
    /// The packaged defaults.
    pub fn packaged() -> Result<Self> {
        Self::from_toml_str(PACKAGED_SETTINGS, "default_settings.toml")
    }

    /// Packaged defaults overlaid with the first override file found:
    /// `$HBS_SETTINGS`, then `./hbs_settings.toml`.
    pub fn load() -> Result<Self> {
        let settings = Self::packaged()?;
        let override_path = env::var_os(SETTINGS_ENV)
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from(LOCAL_SETTINGS_FILE)).filter(|p| p.exists()));
        match override_path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "applying settings overrides");
                settings.with_override_file(&path)
            }
            None => Ok(settings),
        }
    }

    pub fn from_toml_str(text: &str, source_name: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| HbsError::InvalidSettings {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Applies overrides read from `path`.
    pub fn with_override_file(self, path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| HbsError::io(path, e))?;
        self.with_overrides(&text, &path.display().to_string())
    }

    /// Overwrites known keys with the values of `text`.
    pub fn with_overrides(self, text: &str, source_name: &str) -> Result<Self> {
        let invalid = |reason: String| HbsError::InvalidSettings {
            source_name: source_name.to_string(),
            reason,
        };
        let overrides: toml::Table = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        let mut base = toml::Table::try_from(&self).map_err(|e| invalid(e.to_string()))?;
        merge_known(&mut base, overrides, "");
        toml::Value::Table(base)
            .try_into()
            .map_err(|e: toml::de::Error| invalid(e.to_string()))
    }

    pub fn span(&self) -> SurveySpan {
        SurveySpan::new(self.first_year, self.last_year)
    }

    /// Points the local data tree at `dir`.
    pub fn with_local_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_directory = dir.into();
        self
    }

    pub fn with_local_metadata_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_metadata_directory = dir.into();
        self
    }

    pub fn with_load_table(mut self, load_table: LoadTableSettings) -> Self {
        self.load_table = load_table;
        self
    }

    pub fn paths(&self) -> DataPaths {
        let root = self.local_directory.clone();
        DataPaths {
            extracted: root.join(&self.directories.extracted_data),
            processed: root.join(&self.directories.processed_data),
            external: root.join(&self.directories.external_data),
            cached: root.join(&self.directories.cached_data),
            root,
        }
    }

    /// URL of the published processed file for `(table, year)`.
    pub fn remote_table_url(&self, table: &str, year: i64) -> String {
        format!(
            "{}/parquet_files/{year}_{table}.parquet",
            self.online_directory.trim_end_matches('/')
        )
    }
}

fn merge_known(base: &mut toml::Table, overrides: toml::Table, prefix: &str) {
    for (key, value) in overrides {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(slot)), toml::Value::Table(nested)) => {
                merge_known(slot, nested, &full_key);
            }
            (Some(slot), value) => *slot = value,
            (None, _) => tracing::warn!(key = %full_key, "ignoring unknown settings key"),
        }
    }
}

/// Locations of the local data tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub extracted: PathBuf,
    pub processed: PathBuf,
    pub external: PathBuf,
    pub cached: PathBuf,
}

impl DataPaths {
    /// Raw extract `{extracted}/{year}/{U|R}{yy}{file_code}.csv`.
    ///
    /// Years before 1400 use two digits.
    pub fn raw_file(&self, year: i64, urban: bool, file_code: &str) -> PathBuf {
        let prefix = if urban { "U" } else { "R" };
        let year_part = if year < 1400 { year % 100 } else { year };
        self.extracted
            .join(year.to_string())
            .join(format!("{prefix}{year_part}{file_code}.csv"))
    }

    /// Processed base table `{processed}/{year}_{table}.parquet`.
    pub fn processed_file(&self, table: &str, year: i64) -> PathBuf {
        self.processed.join(format!("{year}_{table}.parquet"))
    }

    /// Cached derived table `{cached}/{table}_{year}.parquet`.
    pub fn cached_file(&self, table: &str, year: i64) -> PathBuf {
        self.cached.join(format!("{table}_{year}.parquet"))
    }

    /// Sidecar of a cached derived table.
    pub fn cached_sidecar(&self, table: &str, year: i64) -> PathBuf {
        self.cached.join(format!("{table}_{year}_metadata.yaml"))
    }

    /// External dataset `{external}/{name}.parquet`.
    pub fn external_file(&self, name: &str) -> PathBuf {
        self.external.join(format!("{name}.parquet"))
    }
}
