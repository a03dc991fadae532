//! Raw extract ingestion for the household budget survey.
//!
//! A base table is rebuilt from two raw CSV extracts per year (urban and
//! rural). Each raw column is cleaned according to the year-resolved table
//! layout, then the two halves are stacked. Processed tables are stored as
//! parquet and may also be fetched from the remote mirror.

pub mod cleaner;
pub mod csv;
pub mod descriptor;
pub mod loader;
pub mod storage;

pub use cleaner::{CleanContext, clean_column, clean_table, clean_text, smallest_integer_dtype};
pub use csv::read_raw_csv;
pub use descriptor::{ColumnRule, ColumnSpec, TableLayout};
pub use loader::{LoadSource, TableLoader};
pub use storage::{RemoteStore, read_parquet, remove_if_exists, write_parquet_atomic, write_text_atomic};
