//! Shared model types for the HBS table crates.

pub mod column;
pub mod error;
pub mod options;
pub mod table;

pub use column::ColumnType;
pub use error::{ErrorKind, HbsError, Result};
pub use options::{Dataset, LoadTableSettings, OnMissing};
pub use table::{Table, TableMeta};
