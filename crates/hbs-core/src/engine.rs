//! The public entry point: loading, building, and decorating survey tables.

use polars::prelude::*;
use tracing::info;

use hbs_common::{column_i64_values, concat_diagonal};
use hbs_ingest::{TableLoader, read_parquet};
use hbs_metadata::{
    DocumentKind, MetaValue, MetadataContext, YearSpec, construct_table_year_pairs, parse_years,
};
use hbs_model::{Dataset, HbsError, LoadTableSettings, Result, Table};
use hbs_transform::{
    AttributeOptions, ClassificationOptions, FunctionRegistry, add_attribute, add_classification,
    concat_tables, join_on,
};

use crate::factory::TableFactory;

/// Name under which a single ad-hoc schema node is registered.
pub const INPUT_TABLE: &str = "_Input_Table";

/// Table that carries household sizes for weight adjustment.
pub const NUMBER_OF_MEMBERS_TABLE: &str = "Number_of_Members";

/// Last year whose weights come from the external weights dataset.
pub const LAST_EXTERNAL_WEIGHT_YEAR: i64 = 1395;

/// Source of weights for years after [`LAST_EXTERNAL_WEIGHT_YEAR`].
const WEIGHT_SOURCE_TABLE: &str = "household_information";

/// A schema given by the caller instead of a packaged table name.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaInput {
    /// A table already defined in the schema document.
    Named(String),
    /// One schema node; it is built as [`INPUT_TABLE`].
    Node(MetaValue),
    /// Several named nodes; the last one is built.
    Set(Vec<(String, MetaValue)>),
}

impl SchemaInput {
    /// Reads a schema mapping: either a node with `table_list`, or a mapping
    /// of table names to such nodes.
    pub fn from_meta(value: &MetaValue) -> Result<Self> {
        if let Some(name) = value.as_str() {
            return Ok(Self::Named(name.to_string()));
        }
        let Some(map) = value.as_map() else {
            return Err(HbsError::metadata(
                "schema input",
                format!("expected a mapping, found {}", value.type_name()),
            ));
        };
        if value.contains_key("table_list") {
            return Ok(Self::Node(value.clone()));
        }
        let entries: Vec<(String, MetaValue)> = map
            .iter()
            .filter_map(|(key, node)| key.as_str().map(|key| (key.to_string(), node.clone())))
            .collect();
        if entries.is_empty()
            || entries.len() != map.len()
            || entries.iter().any(|(_, node)| !node.contains_key("table_list"))
        {
            return Err(HbsError::metadata(
                "schema input",
                "every entry of a schema set needs a table_list",
            ));
        }
        Ok(Self::Set(entries))
    }
}

/// Metadata plus registered functions; every table request goes through here.
#[derive(Debug, Clone)]
pub struct Engine {
    ctx: MetadataContext,
    functions: FunctionRegistry,
}

impl Engine {
    pub fn new(ctx: MetadataContext) -> Self {
        Self {
            ctx,
            functions: FunctionRegistry::new(),
        }
    }

    /// An engine over settings overrides, packaged metadata, and local
    /// metadata overrides.
    pub fn load() -> Result<Self> {
        Ok(Self::new(MetadataContext::load()?))
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn context(&self) -> &MetadataContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut MetadataContext {
        &mut self.ctx
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    /// Load settings from the `[load_table]` settings section.
    pub fn default_load_settings(&self) -> LoadTableSettings {
        self.ctx.settings().load_table
    }

    /// Re-reads packaged metadata and local overrides.
    pub fn reload_metadata(&mut self) -> Result<()> {
        self.ctx.reload()
    }

    /// Loads `table_name` for the requested years and stacks the years.
    ///
    /// `Original` and `Cleaned` only apply to base tables: the raw extract
    /// rows, or the cleaned table without schema instructions. `Processed`
    /// builds any table, running instructions and using the cache. Base
    /// tables skip years outside their published availability.
    pub fn load_table(
        &self,
        table_name: &str,
        years: impl Into<YearSpec>,
        settings: LoadTableSettings,
    ) -> Result<Table> {
        let years = parse_years(&years.into(), &self.ctx.span())?;
        let is_base = self.ctx.is_base_table(table_name);
        let years: Vec<i64> = if is_base {
            construct_table_year_pairs(&[table_name], &years, &self.ctx)?
                .into_iter()
                .map(|(_, year)| year)
                .collect()
        } else {
            years
        };

        if settings.dataset != Dataset::Processed && !is_base {
            return Err(HbsError::TableNotFound {
                table: table_name.to_string(),
                year: years.first().copied().unwrap_or(self.ctx.span().last_year),
            });
        }
        let table = match settings.dataset {
            Dataset::Original => {
                let loader = TableLoader::new(&self.ctx, settings);
                let parts = years
                    .iter()
                    .map(|&year| loader.load_original(table_name, year))
                    .collect::<Result<Vec<_>>>()?;
                concat_tables(parts)?
            }
            Dataset::Cleaned => {
                let loader = TableLoader::new(&self.ctx, settings);
                let parts = years
                    .iter()
                    .map(|&year| loader.load(table_name, year))
                    .collect::<Result<Vec<_>>>()?;
                concat_tables(parts)?
            }
            Dataset::Processed => self.create_table(table_name, &years, settings)?,
        };
        info!(
            table = table_name,
            years = years.len(),
            rows = table.height(),
            dataset = ?settings.dataset,
            "loaded table"
        );
        Ok(table)
    }

    /// Builds `table_name` once per year and stacks the years.
    pub fn create_table(&self, table_name: &str, years: &[i64], settings: LoadTableSettings) -> Result<Table> {
        let mut parts = Vec::with_capacity(years.len());
        for &year in years {
            parts.push(TableFactory::new(self, table_name, year, settings)?.build()?);
        }
        concat_tables(parts)
    }

    /// Builds a table from a caller-provided schema.
    ///
    /// The nodes are registered on a copy of the metadata, so the engine's
    /// own schema is unchanged afterwards. Without explicit years the node's
    /// `years` entry is used, then the last survey year.
    pub fn create_table_with_schema(
        &self,
        input: SchemaInput,
        years: Option<YearSpec>,
        settings: LoadTableSettings,
    ) -> Result<Table> {
        let mut engine = self.clone();
        let table_name = match input {
            SchemaInput::Named(name) => name,
            SchemaInput::Node(node) => {
                engine.ctx.set_entry(DocumentKind::Schema, INPUT_TABLE, node);
                INPUT_TABLE.to_string()
            }
            SchemaInput::Set(entries) => {
                let mut last = None;
                for (name, node) in entries {
                    engine.ctx.set_entry(DocumentKind::Schema, &name, node);
                    last = Some(name);
                }
                last.ok_or_else(|| HbsError::metadata("schema input", "empty schema set"))?
            }
        };

        let years = match years {
            Some(years) => years,
            None => match engine.ctx.schema_node(&table_name).and_then(|node| node.get("years")) {
                Some(years) if !years.is_null() => YearSpec::from_meta(years)?,
                _ => YearSpec::Last,
            },
        };
        let years = parse_years(&years, &engine.ctx.span())?;
        engine.create_table(&table_name, &years, settings)
    }

    /// Household weights as `Year`, `ID`, `Weight`.
    ///
    /// Years up to 1395 come from the external weights dataset, later years
    /// from `household_information`. With `adjust_for_household_size` each
    /// weight is multiplied by the household's member count.
    pub fn load_weights(
        &self,
        years: &[i64],
        adjust_for_household_size: bool,
        settings: LoadTableSettings,
    ) -> Result<DataFrame> {
        let columns = &self.ctx.settings().columns;
        let (external, internal): (Vec<i64>, Vec<i64>) = years
            .iter()
            .copied()
            .partition(|&year| year <= LAST_EXTERNAL_WEIGHT_YEAR);

        let mut parts = Vec::with_capacity(2);
        if !external.is_empty() {
            parts.push(self.external_weights(&external)?);
        }
        if !internal.is_empty() {
            let source = self.create_table(WEIGHT_SOURCE_TABLE, &internal, settings)?;
            parts.push(
                source
                    .data
                    .lazy()
                    .select([
                        col(columns.year.as_str()).cast(DataType::Int64),
                        col(columns.household_id.as_str()),
                        col(columns.weight.as_str()).cast(DataType::Float64),
                    ])
                    .collect()?,
            );
        }
        let weights = concat_diagonal(parts)?;
        if !adjust_for_household_size {
            return Ok(weights);
        }

        let members = self
            .create_table(NUMBER_OF_MEMBERS_TABLE, years, settings)?
            .data
            .lazy()
            .select([
                col(columns.year.as_str()),
                col(columns.household_id.as_str()),
                col("Members"),
            ])
            .collect()?;
        let keys = [columns.year.clone(), columns.household_id.clone()];
        let adjusted = join_on(weights, members, &keys, JoinType::Left)?
            .lazy()
            .with_column(
                (col(columns.weight.as_str()) * col("Members").cast(DataType::Float64))
                    .alias(columns.weight.as_str()),
            )
            .collect()?;
        Ok(adjusted.drop("Members")?)
    }

    fn external_weights(&self, years: &[i64]) -> Result<DataFrame> {
        let columns = &self.ctx.settings().columns;
        let source = self.external_source("weights", years)?;
        let year = source.column("year", &columns.year);
        let id = source.column("household_id", &columns.household_id);
        let weight = source.column("weight", &columns.weight);

        let df = read_parquet(&self.ctx.paths().external_file(&source.file_name))?
            .lazy()
            .select([
                col(year.as_str()).cast(DataType::Int64).alias(columns.year.as_str()),
                col(id.as_str()).alias(columns.household_id.as_str()),
                col(weight.as_str()).cast(DataType::Float64).alias(columns.weight.as_str()),
            ])
            .filter(in_years(&columns.year, years))
            .collect()?;
        Ok(df)
    }

    /// The `external_data` entry named `entry`, resolved for the first year.
    pub(crate) fn external_source(&self, entry: &str, years: &[i64]) -> Result<ExternalSource> {
        let year = years.first().copied().unwrap_or(self.ctx.span().last_year);
        let node = self
            .ctx
            .resolve(DocumentKind::Other, &["external_data", entry], year)?
            .unwrap_or_default();
        let file_name = node
            .get("file_name")
            .and_then(MetaValue::as_str)
            .unwrap_or(entry)
            .to_string();
        Ok(ExternalSource { file_name, node })
    }

    /// Adds (or replaces) the `Weight` column, matched on year and household.
    pub fn add_weight(&self, table: Table, adjust_for_household_size: bool) -> Result<Table> {
        let columns = &self.ctx.settings().columns;
        let years = distinct_years(&table, &columns.year)?;
        let weights = self.load_weights(&years, adjust_for_household_size, self.default_load_settings())?;
        let mut data = table.data.clone();
        if data.column(&columns.weight).is_ok() {
            data = data.drop(&columns.weight)?;
        }
        let keys = [columns.year.clone(), columns.household_id.clone()];
        let joined = join_on(data, weights, &keys, JoinType::Left)?;
        Ok(table.replace_data(joined))
    }

    pub fn add_classification(&self, table: Table, options: &ClassificationOptions) -> Result<Table> {
        add_classification(&self.ctx, table, options)
    }

    pub fn add_attribute(&self, table: Table, options: &AttributeOptions) -> Result<Table> {
        add_attribute(&self.ctx, table, options)
    }
}

/// File name and column names of an external dataset.
pub(crate) struct ExternalSource {
    pub(crate) file_name: String,
    node: MetaValue,
}

impl ExternalSource {
    /// Source column for `key`, or `default` when not configured.
    pub(crate) fn column(&self, key: &str, default: &str) -> String {
        self.node
            .get("columns")
            .and_then(|columns| columns.get(key))
            .and_then(MetaValue::as_str)
            .unwrap_or(default)
            .to_string()
    }
}

/// Rows whose `year_column` is one of `years`.
pub(crate) fn in_years(year_column: &str, years: &[i64]) -> Expr {
    years
        .iter()
        .fold(lit(false), |acc, &year| acc.or(col(year_column).eq(lit(year))))
}

pub(crate) fn distinct_years(table: &Table, year_column: &str) -> Result<Vec<i64>> {
    let Ok(column) = table.data.column(year_column) else {
        return match table.year() {
            Some(year) => Ok(vec![year]),
            None => Err(HbsError::ColumnNotFound {
                column: year_column.to_string(),
                context: table.table_name().unwrap_or("table").to_string(),
            }),
        };
    };
    let mut years: Vec<i64> = column_i64_values(column)?.into_iter().flatten().collect();
    years.sort_unstable();
    years.dedup();
    Ok(years)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbs_metadata::Settings;

    fn engine() -> Engine {
        Engine::new(MetadataContext::packaged(Settings::packaged().unwrap()).unwrap())
    }

    #[test]
    fn test_schema_input_shapes() {
        let node = MetaValue::from_yaml_str("table_list: food", "input").unwrap();
        assert!(matches!(SchemaInput::from_meta(&node).unwrap(), SchemaInput::Node(_)));

        let set = MetaValue::from_yaml_str(
            "
A: {table_list: food}
B: {table_list: A}
",
            "input",
        )
        .unwrap();
        let SchemaInput::Set(entries) = SchemaInput::from_meta(&set).unwrap() else {
            panic!("expected a schema set");
        };
        assert_eq!(entries.last().map(|(name, _)| name.as_str()), Some("B"));

        let bad = MetaValue::from_yaml_str("A: {instructions: [add_year]}", "input").unwrap();
        assert!(SchemaInput::from_meta(&bad).is_err());
        assert_eq!(
            SchemaInput::from_meta(&MetaValue::from("food")).unwrap(),
            SchemaInput::Named("food".to_string())
        );
    }

    #[test]
    fn test_non_base_tables_need_processed_dataset() {
        let engine = engine();
        let settings = LoadTableSettings::new().with_dataset(Dataset::Cleaned);
        let err = engine.load_table("Expenditures", 1396, settings).unwrap_err();
        assert!(matches!(err, HbsError::TableNotFound { ref table, .. } if table == "Expenditures"));
    }

    #[test]
    fn test_distinct_years() {
        let table = Table::new(df! { "Year" => [1396i64, 1395, 1396] }.unwrap());
        assert_eq!(distinct_years(&table, "Year").unwrap(), vec![1395, 1396]);

        let stamped = Table::stamped(df! { "ID" => [1i64] }.unwrap(), "food", 1390);
        assert_eq!(distinct_years(&stamped, "Year").unwrap(), vec![1390]);
        assert!(distinct_years(&Table::new(DataFrame::empty()), "Year").is_err());
    }
}
