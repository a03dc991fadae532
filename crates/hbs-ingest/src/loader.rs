//! Base table loading: processed parquet, remote mirror, or raw rebuild.

use std::time::Duration;

use polars::prelude::*;
use rayon::prelude::*;

use hbs_common::concat_diagonal;
use hbs_metadata::MetadataContext;
use hbs_model::{HbsError, LoadTableSettings, OnMissing, Result, Table};

use crate::cleaner::clean_table;
use crate::csv::read_raw_csv;
use crate::descriptor::TableLayout;
use crate::storage::{RemoteStore, read_parquet, write_parquet_atomic};

/// Where a loaded table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Processed,
    Downloaded,
    Created,
}

/// Loads base tables for one metadata context and one set of load settings.
#[derive(Debug, Clone)]
pub struct TableLoader<'a> {
    ctx: &'a MetadataContext,
    settings: LoadTableSettings,
}

impl<'a> TableLoader<'a> {
    pub fn new(ctx: &'a MetadataContext, settings: LoadTableSettings) -> Self {
        Self { ctx, settings }
    }

    pub fn settings(&self) -> &LoadTableSettings {
        &self.settings
    }

    /// Loads one processed base table, stamped with its name and year.
    pub fn load(&self, table: &str, year: i64) -> Result<Table> {
        self.load_with_source(table, year)
            .map(|(table, _)| table)
    }

    /// Like [`TableLoader::load`], also reporting where the data came from.
    pub fn load_with_source(&self, table: &str, year: i64) -> Result<(Table, LoadSource)> {
        if !self.ctx.is_base_table(table) {
            return Err(HbsError::TableNotFound {
                table: table.to_string(),
                year,
            });
        }

        let processed = self.ctx.paths().processed_file(table, year);
        let source = if self.settings.recreate {
            LoadSource::Created
        } else if self.settings.redownload {
            LoadSource::Downloaded
        } else if processed.is_file() {
            LoadSource::Processed
        } else {
            match self.settings.on_missing {
                OnMissing::Create => LoadSource::Created,
                OnMissing::Download => LoadSource::Downloaded,
                OnMissing::Error => {
                    return Err(HbsError::TableNotFound {
                        table: table.to_string(),
                        year,
                    });
                }
            }
        };

        tracing::debug!(table, year, source = ?source, "loading base table");
        let df = match source {
            LoadSource::Processed => read_parquet(&processed)?,
            LoadSource::Created => {
                let mut df = self.create(table, year)?;
                if self.settings.save_created {
                    write_parquet_atomic(&mut df, &processed)?;
                }
                df
            }
            LoadSource::Downloaded => {
                let mut df = self.download(table, year)?;
                if self.settings.save_downloaded {
                    write_parquet_atomic(&mut df, &processed)?;
                }
                df
            }
        };

        Ok((Table::stamped(df, table, year), source))
    }

    /// Rebuilds a base table from its urban and rural raw extracts.
    pub fn create(&self, table: &str, year: i64) -> Result<DataFrame> {
        let mut parts = Vec::with_capacity(2);
        for urban in [true, false] {
            let layout = TableLayout::resolve(self.ctx, table, year, urban)?;
            let path = self
                .ctx
                .paths()
                .raw_file(year, urban, &layout.file_code);
            let raw = read_raw_csv(&path, table, year)?;
            parts.push(clean_table(&raw, &layout)?);
        }
        let df = concat_diagonal(parts)?;
        tracing::info!(table, year, rows = df.height(), "created table from raw extracts");
        Ok(df)
    }

    /// Raw extract rows, urban then rural, without cleaning.
    pub fn load_original(&self, table: &str, year: i64) -> Result<Table> {
        let mut parts = Vec::with_capacity(2);
        for urban in [true, false] {
            let layout = TableLayout::resolve(self.ctx, table, year, urban)?;
            let path = self
                .ctx
                .paths()
                .raw_file(year, urban, &layout.file_code);
            parts.push(read_raw_csv(&path, table, year)?);
        }
        Ok(Table::stamped(concat_diagonal(parts)?, table, year))
    }

    fn download(&self, table: &str, year: i64) -> Result<DataFrame> {
        let settings = self.ctx.settings();
        let store = RemoteStore::new(Duration::from_secs(settings.request_timeout_secs))?;
        store.download_parquet(&settings.remote_table_url(table, year))
    }

    /// Loads several tables of one year on a bounded worker pool.
    ///
    /// Tables are returned in request order. On failure the error of the
    /// first failing table (in request order) is returned.
    pub fn load_many<S: AsRef<str> + Sync>(&self, names: &[S], year: i64) -> Result<Vec<Table>> {
        self.load_each(names, year)?.into_iter().collect()
    }

    /// Loads several tables of one year, keeping each table's result.
    pub fn load_each<S: AsRef<str> + Sync>(
        &self,
        names: &[S],
        year: i64,
    ) -> Result<Vec<Result<Table>>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.ctx.settings().worker_threads.max(1))
            .build()
            .map_err(|e| HbsError::InvalidSettings {
                source_name: "worker_threads".to_string(),
                reason: e.to_string(),
            })?;
        Ok(pool.install(|| {
            names
                .par_iter()
                .map(|name| self.load(name.as_ref(), year))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbs_metadata::{DocumentKind, MetaValue, Settings};
    use hbs_model::ErrorKind;
    use tempfile::TempDir;

    const TABLES: &str = r"
default_table_settings:
  missings: drop
food:
  file_code: P3S01
  columns:
    ADDRESS:
      new_name: ID
      type: unsigned
    DYCOL01:
      new_name: Code
      type: unsigned
    DYCOL06:
      new_name: Expenditure
      type: float
";

    fn context(dir: &TempDir) -> MetadataContext {
        let settings = Settings::packaged().unwrap().with_local_directory(dir.path());
        MetadataContext::from_documents(
            settings,
            [(
                DocumentKind::Tables,
                MetaValue::from_yaml_str(TABLES, "tables").unwrap(),
            )],
        )
    }

    fn write_raw(ctx: &MetadataContext, year: i64) {
        let paths = ctx.paths();
        for (urban, rows) in [
            (true, "ADDRESS,DYCOL01,DYCOL06,DYCOL09\n100011,11111,1500,x\n100012,11112,200,y\n"),
            (false, "ADDRESS,DYCOL01,DYCOL06\n200011,11111,700\n"),
        ] {
            let path = paths.raw_file(year, urban, "P3S01");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, rows).unwrap();
        }
    }

    #[test]
    fn test_create_saves_processed_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        write_raw(&ctx, 1390);

        let settings = LoadTableSettings::new().with_on_missing(OnMissing::Create);
        let loader = TableLoader::new(&ctx, settings);
        let (table, source) = loader.load_with_source("food", 1390).unwrap();
        assert_eq!(source, LoadSource::Created);
        assert_eq!(table.height(), 3);
        assert_eq!(table.table_name(), Some("food"));
        assert_eq!(table.year(), Some(1390));
        let names: Vec<_> = table
            .data
            .get_column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, vec!["ID", "Code", "Expenditure"]);
        assert!(ctx.paths().processed_file("food", 1390).is_file());

        let (_, source) = loader.load_with_source("food", 1390).unwrap();
        assert_eq!(source, LoadSource::Processed);
    }

    #[test]
    fn test_missing_processed_file_with_error_policy() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let loader = TableLoader::new(
            &ctx,
            LoadTableSettings::new().with_on_missing(OnMissing::Error),
        );
        let err = loader.load("food", 1390).unwrap_err();
        assert!(matches!(err, HbsError::TableNotFound { year: 1390, .. }));
    }

    #[test]
    fn test_missing_raw_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let loader = TableLoader::new(
            &ctx,
            LoadTableSettings::new()
                .with_on_missing(OnMissing::Create)
                .with_save_created(false),
        );
        let err = loader.load("food", 1391).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingData);
        assert!(!ctx.paths().processed_file("food", 1391).exists());
    }

    #[test]
    fn test_load_original_keeps_raw_columns() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        write_raw(&ctx, 1390);
        let loader = TableLoader::new(&ctx, LoadTableSettings::new());
        let table = loader.load_original("food", 1390).unwrap();
        assert_eq!(table.height(), 3);
        assert!(table.data.column("DYCOL09").is_ok());
    }

    #[test]
    fn test_load_many_reports_first_failure_in_order() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        write_raw(&ctx, 1390);
        let loader = TableLoader::new(
            &ctx,
            LoadTableSettings::new()
                .with_on_missing(OnMissing::Create)
                .with_save_created(false),
        );

        let tables = loader.load_many(&["food", "food"], 1390).unwrap();
        assert_eq!(tables.len(), 2);

        let err = loader
            .load_many(&["food", "clothing", "housing"], 1390)
            .unwrap_err();
        assert!(matches!(
            err,
            HbsError::TableNotFound { ref table, .. } if table == "clothing"
        ));

        let results = loader.load_each(&["clothing", "food"], 1390).unwrap();
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }
}
