//! Stacking tables with provenance.

use hbs_common::concat_diagonal;
use hbs_model::{Result, Table, TableMeta};

/// Stacks tables by column name (see [`concat_diagonal`]).
///
/// Provenance fields survive only when every input agrees on them.
pub fn concat_tables(tables: Vec<Table>) -> Result<Table> {
    let mut meta: Option<TableMeta> = None;
    let mut frames = Vec::with_capacity(tables.len());
    for table in tables {
        meta = Some(match meta {
            None => table.meta.clone(),
            Some(current) => TableMeta {
                table_name: current
                    .table_name
                    .filter(|name| table.meta.table_name.as_ref() == Some(name)),
                year: current.year.filter(|year| table.meta.year == Some(*year)),
            },
        });
        frames.push(table.data);
    }
    let data = concat_diagonal(frames)?;
    Ok(Table::with_meta(data, meta.unwrap_or_default()))
}
