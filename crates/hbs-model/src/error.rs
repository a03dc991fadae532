//! Error types shared by every HBS crate.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of [`HbsError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Metadata, schema, or settings are malformed or inconsistent.
    Configuration,
    /// A versioned metadata node has no version at or before the requested year.
    MissingVersion,
    /// A table, file, or column the request depends on is absent.
    MissingData,
    /// Data does not satisfy the metadata describing it.
    DataQuality,
    /// Filesystem or network failure.
    Io,
}

/// Errors raised while resolving metadata and building survey tables.
#[derive(Debug, Error)]
pub enum HbsError {
    // === Configuration ===
    /// A `table_list` entry names neither a base table nor a schema entry.
    #[error("table '{table}' is not defined (referenced by '{referenced_by}')")]
    UnresolvableReference { table: String, referenced_by: String },

    /// The schema's `table_list` edges form a cycle.
    #[error("cyclic table dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// An instruction name not known to the pipeline.
    #[error("unknown step '{step}' in table '{table}' ({year})")]
    UnknownStep {
        step: String,
        table: String,
        year: i64,
    },

    /// A known step received input it cannot use.
    #[error("invalid input for step '{step}' in table '{table}' ({year}): {reason}")]
    InvalidInstruction {
        step: String,
        table: String,
        year: i64,
        reason: String,
    },

    /// A named function is not registered.
    #[error("function '{name}' is not registered (table '{table}', {year})")]
    UnknownFunction {
        name: String,
        table: String,
        year: i64,
    },

    /// A code matched more than one classification entry.
    #[error(
        "code {code} matches {matches} entries of '{classification}' at level {level} ({year})"
    )]
    AmbiguousClassification {
        classification: String,
        year: i64,
        code: i64,
        level: i64,
        matches: usize,
    },

    /// A code matched no classification entry and unmatched codes are not allowed.
    #[error("code {code} matches no entry of '{classification}' at level {level} ({year})")]
    UnmatchedClassification {
        classification: String,
        year: i64,
        code: i64,
        level: i64,
    },

    /// A range specification could not be parsed.
    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },

    /// A metadata document has the wrong shape at `path`.
    #[error("invalid metadata at '{path}': {reason}")]
    InvalidMetadata { path: String, reason: String },

    /// Settings could not be read or parsed.
    #[error("invalid settings in {source_name}: {reason}")]
    InvalidSettings { source_name: String, reason: String },

    /// A year specification could not be parsed.
    #[error("invalid year specification '{value}'")]
    InvalidYear { value: String },

    /// A year outside the survey span.
    #[error("year {year} is outside the survey span {first}-{last}")]
    YearOutOfRange { year: i64, first: i64, last: i64 },

    // === Missing version ===
    /// The requested year predates every version of a metadata node.
    #[error("no version of '{path}' for year {year} (earliest version is {earliest})")]
    MissingVersion {
        path: String,
        year: i64,
        earliest: i64,
    },

    // === Missing data ===
    /// The processed table is absent and `on_missing` is `error`.
    #[error("table '{table}' for year {year} is not available")]
    TableNotFound { table: String, year: i64 },

    /// The raw extract for a base table is absent.
    #[error("raw file for table '{table}' ({year}) not found: {path}")]
    RawFileMissing {
        table: String,
        year: i64,
        path: PathBuf,
    },

    /// A column required by an operation is absent.
    #[error("column '{column}' not found in {context}")]
    ColumnNotFound { column: String, context: String },

    // === Data quality ===
    /// A raw column whose metadata says `error`.
    #[error("unexpected column '{column}' in table '{table}' ({year})")]
    UnexpectedColumn {
        table: String,
        year: i64,
        column: String,
    },

    /// A decoded attribute code has no label and the attribute is required.
    #[error("attribute '{attribute}' has no label for code {code} ({year})")]
    UnmappedAttribute {
        attribute: String,
        year: i64,
        code: i64,
    },

    /// Failed DataFrame operation.
    #[error("DataFrame operation failed: {message}")]
    DataFrame { message: String },

    // === I/O ===
    /// Failed to read or write a file.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to fetch a remote file.
    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },
}

impl HbsError {
    /// Returns the coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvableReference { .. }
            | Self::CyclicDependency { .. }
            | Self::UnknownStep { .. }
            | Self::InvalidInstruction { .. }
            | Self::UnknownFunction { .. }
            | Self::AmbiguousClassification { .. }
            | Self::InvalidRange { .. }
            | Self::InvalidMetadata { .. }
            | Self::InvalidSettings { .. }
            | Self::InvalidYear { .. }
            | Self::YearOutOfRange { .. } => ErrorKind::Configuration,
            Self::MissingVersion { .. } => ErrorKind::MissingVersion,
            Self::TableNotFound { .. }
            | Self::RawFileMissing { .. }
            | Self::ColumnNotFound { .. } => ErrorKind::MissingData,
            Self::UnexpectedColumn { .. }
            | Self::UnmappedAttribute { .. }
            | Self::UnmatchedClassification { .. }
            | Self::DataFrame { .. } => ErrorKind::DataQuality,
            Self::Io { .. } | Self::Download { .. } => ErrorKind::Io,
        }
    }

    /// Builds an [`HbsError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds an [`HbsError::InvalidMetadata`].
    pub fn metadata(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<polars::prelude::PolarsError> for HbsError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        Self::DataFrame {
            message: err.to_string(),
        }
    }
}

/// Result type for HBS operations.
pub type Result<T> = std::result::Result<T, HbsError>;
