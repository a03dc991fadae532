//! Options controlling how survey tables are loaded and built.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HbsError;

/// Which stage of a table `load_table` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    /// Raw extract rows, urban and rural concatenated, no cleaning.
    Original,
    /// Cleaned base table without schema instructions.
    Cleaned,
    /// Fully built table: base table plus schema instructions.
    #[default]
    Processed,
}

/// What the loader does when a processed table is not on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    /// Rebuild from the raw extract.
    Create,
    /// Fetch the processed file from the remote mirror.
    #[default]
    Download,
    /// Fail with `TableNotFound`.
    Error,
}

impl FromStr for Dataset {
    type Err = HbsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(Self::Original),
            "cleaned" => Ok(Self::Cleaned),
            "processed" => Ok(Self::Processed),
            other => Err(HbsError::InvalidSettings {
                source_name: "dataset".to_string(),
                reason: format!("unknown dataset '{other}'"),
            }),
        }
    }
}

impl FromStr for OnMissing {
    type Err = HbsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "download" => Ok(Self::Download),
            "error" => Ok(Self::Error),
            other => Err(HbsError::InvalidSettings {
                source_name: "on_missing".to_string(),
                reason: format!("unknown on_missing policy '{other}'"),
            }),
        }
    }
}

impl fmt::Display for OnMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Create => "create",
            Self::Download => "download",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// Settings for a single `load_table` / `create_table` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTableSettings {
    pub dataset: Dataset,
    pub on_missing: OnMissing,
    /// Download even when a processed file exists.
    pub redownload: bool,
    /// Persist downloaded files to the processed directory.
    pub save_downloaded: bool,
    /// Rebuild from raw extracts even when a processed file exists.
    pub recreate: bool,
    /// Persist rebuilt files to the processed directory.
    pub save_created: bool,
}

impl Default for LoadTableSettings {
    fn default() -> Self {
        Self {
            dataset: Dataset::Processed,
            on_missing: OnMissing::Download,
            redownload: false,
            save_downloaded: true,
            recreate: false,
            save_created: true,
        }
    }
}

impl LoadTableSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_on_missing(mut self, on_missing: OnMissing) -> Self {
        self.on_missing = on_missing;
        self
    }

    pub fn with_recreate(mut self, recreate: bool) -> Self {
        self.recreate = recreate;
        self
    }

    pub fn with_redownload(mut self, redownload: bool) -> Self {
        self.redownload = redownload;
        self
    }

    pub fn with_save_created(mut self, save: bool) -> Self {
        self.save_created = save;
        self
    }

    pub fn with_save_downloaded(mut self, save: bool) -> Self {
        self.save_downloaded = save;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: LoadTableSettings = toml::from_str(
            r#"
            on_missing = "create"
            recreate = true
            "#,
        )
        .unwrap();
        assert_eq!(settings.on_missing, OnMissing::Create);
        assert!(settings.recreate);
        assert!(settings.save_created);
        assert_eq!(settings.dataset, Dataset::Processed);
    }

    #[test]
    fn dataset_from_str() {
        assert_eq!("Cleaned".parse::<Dataset>().unwrap(), Dataset::Cleaned);
        assert!("raw".parse::<Dataset>().is_err());
    }
}
