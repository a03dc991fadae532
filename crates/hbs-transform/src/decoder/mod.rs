//! Decoders that derive labelled columns from codes.
//!
//! Both decoders resolve one mapping per distinct `(year, code)` pair present
//! in the table and then fill the output columns in a single pass over the
//! rows.

pub mod classification;
pub mod id;

use polars::prelude::*;

use hbs_common::{categorical_series, column_i64_values};
use hbs_model::{HbsError, Result, Table};

pub use classification::{ClassificationOptions, ClassificationType, add_classification};
pub use id::{AttributeOptions, add_attribute};

/// Year of every row: the year column when present, otherwise the table's year.
pub(crate) fn row_years(table: &Table, year_column: &str) -> Result<Vec<Option<i64>>> {
    match table.data.column(year_column) {
        Ok(column) => Ok(column_i64_values(column)?),
        Err(_) => match table.year() {
            Some(year) => Ok(vec![Some(year); table.height()]),
            None => Err(HbsError::ColumnNotFound {
                column: year_column.to_string(),
                context: table_context(table),
            }),
        },
    }
}

/// Integer values of a required column.
pub(crate) fn required_i64_column(table: &Table, column: &str) -> Result<Vec<Option<i64>>> {
    let values = table
        .data
        .column(column)
        .map_err(|_| HbsError::ColumnNotFound {
            column: column.to_string(),
            context: table_context(table),
        })?;
    Ok(column_i64_values(values)?)
}

/// Adds or replaces a categorical label column.
pub(crate) fn set_label_column(df: &mut DataFrame, name: &str, values: &[Option<String>]) -> Result<()> {
    df.with_column(categorical_series(name.into(), values)?)?;
    Ok(())
}

pub(crate) fn table_context(table: &Table) -> String {
    match (table.table_name(), table.year()) {
        (Some(name), Some(year)) => format!("table '{name}' ({year})"),
        (Some(name), None) => format!("table '{name}'"),
        _ => "input table".to_string(),
    }
}
