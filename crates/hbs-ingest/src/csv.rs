//! Raw extract reading.

use std::path::Path;

use polars::prelude::*;

use hbs_model::{HbsError, Result};

/// Reads one raw extract CSV.
///
/// The whole file is scanned for type inference: raw extracts mix numeric and
/// text cells in the same column and a short inference window guesses wrong.
pub fn read_raw_csv(path: &Path, table: &str, year: i64) -> Result<DataFrame> {
    if !path.is_file() {
        return Err(HbsError::RawFileMissing {
            table: table.to_string(),
            year,
            path: path.to_path_buf(),
        });
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    tracing::debug!(
        table,
        year,
        path = %path.display(),
        rows = df.height(),
        columns = df.width(),
        "read raw extract"
    );
    Ok(df)
}
