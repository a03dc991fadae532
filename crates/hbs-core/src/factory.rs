//! Builds one table for one year, reading and writing the result cache.

use std::collections::HashMap;
use std::fs;

use polars::prelude::DataFrame;
use tracing::{debug, info, warn};

use hbs_ingest::{TableLoader, read_parquet, remove_if_exists, write_parquet_atomic, write_text_atomic};
use hbs_metadata::MetaValue;
use hbs_model::{LoadTableSettings, Result, Table};
use hbs_transform::{Pipeline, TableProvider, concat_tables};

use crate::dependencies::{DependencyGraph, extract_dependencies, upstream_tables};
use crate::engine::Engine;

/// Builds `table_name` for `year` and every table it depends on.
///
/// Construction preloads all base tables of the dependency graph on the
/// worker pool; derived tables are then built depth-first on demand.
pub struct TableFactory<'e> {
    engine: &'e Engine,
    table_name: String,
    year: i64,
    settings: LoadTableSettings,
    base_tables: HashMap<String, Table>,
}

impl<'e> TableFactory<'e> {
    pub fn new(
        engine: &'e Engine,
        table_name: impl Into<String>,
        year: i64,
        settings: LoadTableSettings,
    ) -> Result<Self> {
        let table_name = table_name.into();
        let ctx = engine.context();
        let graph = extract_dependencies(ctx, &table_name, year)?;
        let names = graph.base_tables();
        let tables = TableLoader::new(ctx, settings).load_many(&names, year)?;
        debug!(table = %table_name, year, base_tables = names.len(), "base tables preloaded");
        Ok(Self {
            engine,
            table_name,
            year,
            settings,
            base_tables: names.into_iter().zip(tables).collect(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn year(&self) -> i64 {
        self.year
    }

    /// Builds the factory's own table.
    pub fn build(&self) -> Result<Table> {
        self.load(&self.table_name)
    }

    /// Builds `name`, which must be part of the factory's dependency graph.
    pub fn load(&self, name: &str) -> Result<Table> {
        let ctx = self.engine.context();
        if ctx.is_base_table(name) {
            let table = self.base_table(name)?;
            if table.is_empty() {
                return Ok(table);
            }
            let instructions = self.instructions(name)?;
            if instructions.is_empty() {
                return Ok(table);
            }
            return self.run_instructions(name, table, &instructions);
        }

        let caches = ctx
            .resolved_schema_node(name, self.year)?
            .and_then(|node| node.get("cache_result").and_then(MetaValue::as_bool))
            .unwrap_or(false);
        if caches {
            self.load_cached(name)
        } else {
            self.construct(name)
        }
    }

    fn base_table(&self, name: &str) -> Result<Table> {
        match self.base_tables.get(name) {
            Some(table) => Ok(table.clone()),
            None => TableLoader::new(self.engine.context(), self.settings).load(name, self.year),
        }
    }

    fn instructions(&self, name: &str) -> Result<Vec<MetaValue>> {
        let node = self.engine.context().resolved_schema_node(name, self.year)?;
        Ok(match node.as_ref().and_then(|node| node.get("instructions")) {
            None | Some(MetaValue::Null) => Vec::new(),
            Some(MetaValue::Seq(items)) => items.clone(),
            Some(single) => vec![single.clone()],
        })
    }

    fn run_instructions(&self, name: &str, table: Table, instructions: &[MetaValue]) -> Result<Table> {
        let engine = self.engine;
        let mut pipeline = Pipeline::new(engine.context(), self, engine.functions(), name, self.year);
        pipeline.run(table, instructions)
    }

    /// Concatenates the non-empty `table_list` parts, then runs instructions.
    fn construct(&self, name: &str) -> Result<Table> {
        let upstream = upstream_tables(self.engine.context(), name, self.year)?.unwrap_or_default();
        let mut parts = Vec::with_capacity(upstream.len());
        for part in &upstream {
            let table = self.load(part)?;
            if !table.is_empty() {
                parts.push(table);
            }
        }
        let stacked = concat_tables(parts)?;
        let table = Table::stamped(stacked.data, name, self.year);
        let instructions = self.instructions(name)?;
        let table = self.run_instructions(name, table, &instructions)?;
        debug!(table = name, year = self.year, rows = table.height(), "constructed table");
        Ok(table)
    }

    fn load_cached(&self, name: &str) -> Result<Table> {
        let ctx = self.engine.context();
        let paths = ctx.paths();
        let data_path = paths.cached_file(name, self.year);
        let sidecar_path = paths.cached_sidecar(name, self.year);
        let graph = extract_dependencies(ctx, name, self.year)?;

        if data_path.is_file() && sidecar_matches(&graph, &sidecar_path) {
            match read_parquet(&data_path) {
                Ok(df) => {
                    info!(table = name, year = self.year, rows = df.height(), "read cached table");
                    return Ok(Table::stamped(df, name, self.year));
                }
                Err(err) => {
                    warn!(table = name, year = self.year, error = %err, "cached table unreadable, rebuilding");
                }
            }
        } else {
            debug!(table = name, year = self.year, "cache missing or stale");
        }

        let table = self.construct(name)?;
        self.save_cache(name, &table.data, &graph)?;
        Ok(table)
    }

    fn save_cache(&self, name: &str, data: &DataFrame, graph: &DependencyGraph) -> Result<()> {
        let paths = self.engine.context().paths();
        let sidecar_path = paths.cached_sidecar(name, self.year);
        let sidecar = graph.to_sidecar_yaml()?;
        remove_if_exists(&sidecar_path)?;
        let mut data = data.clone();
        write_parquet_atomic(&mut data, &paths.cached_file(name, self.year))?;
        write_text_atomic(&sidecar, &sidecar_path)?;
        info!(table = name, year = self.year, rows = data.height(), "cached table");
        Ok(())
    }
}

fn sidecar_matches(graph: &DependencyGraph, path: &std::path::Path) -> bool {
    match fs::read_to_string(path) {
        Ok(text) => {
            let matches = graph.matches_sidecar(&text);
            if !matches {
                warn!(path = %path.display(), "cached table dependencies changed");
            }
            matches
        }
        Err(_) => false,
    }
}

impl TableProvider for TableFactory<'_> {
    fn create_table(&self, table_name: &str, years: &[i64]) -> Result<Table> {
        self.engine.create_table(table_name, years, self.settings)
    }

    fn load_weights(&self, years: &[i64], adjust_for_household_size: bool) -> Result<DataFrame> {
        self.engine
            .load_weights(years, adjust_for_household_size, self.settings)
    }
}

impl std::fmt::Debug for TableFactory<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFactory")
            .field("table_name", &self.table_name)
            .field("year", &self.year)
            .field("base_tables", &self.base_tables.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
