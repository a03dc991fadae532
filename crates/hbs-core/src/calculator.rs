//! Survey statistics over built tables: regional subsets, CPI deflation,
//! weighted averages, and weighted quantiles of household values.
//!
//! Everything here is layered on [`Engine::add_attribute`] and
//! [`Engine::add_weight`]; decoded helper columns that the caller did not ask
//! for are dropped again before a table is returned.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use polars::prelude::*;
use tracing::debug;

use hbs_common::{any_to_string, categorical_dtype, column_i64_values, is_numeric_dtype};
use hbs_ingest::read_parquet;
use hbs_metadata::{YearSpec, parse_years};
use hbs_model::{HbsError, Result, Table};
use hbs_transform::{AttributeOptions, join_on};

use crate::engine::{Engine, NUMBER_OF_MEMBERS_TABLE, distinct_years, in_years};

/// Columns that identify groups rather than hold measures.
pub const GROUPBY_COLUMNS: &[&str] = &[
    "Year",
    "Urban_Rural",
    "Province",
    "Region",
    "Decile",
    "Percentile",
];

/// Monetary columns deflated by [`Engine::adjust_by_cpi`] when none are named.
pub const MONETARY_COLUMNS: &[&str] = &[
    "Expenditure",
    "Net_Expenditure",
    "Gross_Expenditure",
    "Price",
    "Income",
    "Net_Income",
    "Gross_Income",
];

pub const CPI_COLUMN: &str = "CPI";
pub const QUANTILE_COLUMN: &str = "Quantile";
pub const DECILE_COLUMN: &str = "Decile";
pub const PERCENTILE_COLUMN: &str = "Percentile";

const URBAN_RURAL: &str = "Urban_Rural";
const VALUES: &str = "_Values";

/// Row filters for [`Engine::select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    pub urban_rural: Option<String>,
    pub province: Option<String>,
    /// Takes precedence over `province`.
    pub region: Option<String>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_urban_rural(mut self, value: impl Into<String>) -> Self {
        self.urban_rural = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_province(mut self, value: impl Into<String>) -> Self {
        self.province = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_region(mut self, value: impl Into<String>) -> Self {
        self.region = Some(value.into());
        self
    }
}

/// Which CPI series [`Engine::add_cpi`] joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpiOptions {
    /// Separate urban and rural indices (`external_data.cpi`) instead of the
    /// national one (`external_data.cpi_national`).
    pub separate_by_urban_rural: bool,
}

impl Default for CpiOptions {
    fn default() -> Self {
        Self {
            separate_by_urban_rural: true,
        }
    }
}

impl CpiOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_separate_by_urban_rural(mut self, separate: bool) -> Self {
        self.separate_by_urban_rural = separate;
        self
    }

    fn entry(self) -> &'static str {
        if self.separate_by_urban_rural {
            "cpi"
        } else {
            "cpi_national"
        }
    }
}

/// Options for [`Engine::average_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AverageOptions {
    /// Measures to average; defaults to every numeric non-key column.
    pub columns: Option<Vec<String>>,
    /// Grouping columns; defaults to the [`GROUPBY_COLUMNS`] present.
    pub groupby: Option<Vec<String>>,
    pub weight_column: Option<String>,
    pub weighted: bool,
}

impl Default for AverageOptions {
    fn default() -> Self {
        Self {
            columns: None,
            groupby: None,
            weight_column: None,
            weighted: true,
        }
    }
}

impl AverageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_groupby<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.groupby = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_weight_column(mut self, column: impl Into<String>) -> Self {
        self.weight_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn with_weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }
}

/// Household size adjustment applied to values before ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EquivalenceScale {
    /// Values are ranked as they are.
    #[default]
    Household,
    /// Divided by the number of members.
    PerCapita,
    /// `1 + 0.7 * (adults - 1) + 0.5 * children`.
    Oecd,
    /// `1 + 0.5 * (adults - 1) + 0.3 * children`.
    OecdModified,
    /// Square root of the number of members.
    SquareRoot,
}

impl EquivalenceScale {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Household => "Household",
            Self::PerCapita => "Per_Capita",
            Self::Oecd => "OECD",
            Self::OecdModified => "OECD_Modified",
            Self::SquareRoot => "Square_Root",
        }
    }

    /// Divisor for a household with `members` people of whom `adults` are adults.
    pub fn factor(self, members: i64, adults: i64) -> f64 {
        let children = (members - adults) as f64;
        let adults = adults as f64;
        match self {
            Self::Household => 1.0,
            Self::PerCapita => members as f64,
            Self::Oecd => 1.0 + 0.7 * (adults - 1.0) + 0.5 * children,
            Self::OecdModified => 1.0 + 0.5 * (adults - 1.0) + 0.3 * children,
            Self::SquareRoot => (members as f64).sqrt(),
        }
    }
}

impl fmt::Display for EquivalenceScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquivalenceScale {
    type Err = HbsError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "household" | "constant" => Ok(Self::Household),
            "per_capita" => Ok(Self::PerCapita),
            "oecd" => Ok(Self::Oecd),
            "oecd_modified" => Ok(Self::OecdModified),
            "square_root" => Ok(Self::SquareRoot),
            other => Err(HbsError::InvalidSettings {
                source_name: "equivalence_scale".to_string(),
                reason: format!("unknown equivalence scale '{other}'"),
            }),
        }
    }
}

/// Where the ranked household values come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantileSource {
    /// A column of the table being ranked.
    Column(String),
    /// A column of another table, built for the same years.
    Table { table: String, column: String },
}

impl Default for QuantileSource {
    fn default() -> Self {
        Self::Table {
            table: "Expenditures".to_string(),
            column: "Expenditure".to_string(),
        }
    }
}

/// Options for [`Engine::calculate_quantile`] and its `add_*` wrappers.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileOptions {
    pub source: QuantileSource,
    pub column_name: String,
    /// Number of equal-weight bins; `None` keeps the raw quantile in `(0, 1]`.
    pub bins: Option<u32>,
    pub weighted: bool,
    pub adjust_weight_for_household_size: bool,
    pub equivalence_scale: EquivalenceScale,
    /// Rank among every household of the source table, not only those in
    /// the input table.
    pub for_all: bool,
    /// Rank within each year.
    pub annual: bool,
    /// Attributes to rank within, e.g. `Urban_Rural`.
    pub groupby: Vec<String>,
    /// Defaults to the years of the input table, then the last survey year.
    pub years: Option<YearSpec>,
}

impl Default for QuantileOptions {
    fn default() -> Self {
        Self {
            source: QuantileSource::default(),
            column_name: QUANTILE_COLUMN.to_string(),
            bins: None,
            weighted: true,
            adjust_weight_for_household_size: false,
            equivalence_scale: EquivalenceScale::default(),
            for_all: true,
            annual: true,
            groupby: Vec::new(),
            years: None,
        }
    }
}

impl QuantileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranks on a column of the input table.
    #[must_use]
    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        self.source = QuantileSource::Column(column.into());
        self
    }

    /// Ranks on a column of another table.
    #[must_use]
    pub fn on_table(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.source = QuantileSource::Table {
            table: table.into(),
            column: column.into(),
        };
        self
    }

    #[must_use]
    pub fn with_column_name(mut self, name: impl Into<String>) -> Self {
        self.column_name = name.into();
        self
    }

    #[must_use]
    pub fn with_bins(mut self, bins: u32) -> Self {
        self.bins = (bins > 0).then_some(bins);
        self
    }

    #[must_use]
    pub fn with_weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }

    #[must_use]
    pub fn with_adjust_weight_for_household_size(mut self, adjust: bool) -> Self {
        self.adjust_weight_for_household_size = adjust;
        self
    }

    #[must_use]
    pub fn with_equivalence_scale(mut self, scale: EquivalenceScale) -> Self {
        self.equivalence_scale = scale;
        self
    }

    #[must_use]
    pub fn with_for_all(mut self, for_all: bool) -> Self {
        self.for_all = for_all;
        self
    }

    #[must_use]
    pub fn with_annual(mut self, annual: bool) -> Self {
        self.annual = annual;
        self
    }

    #[must_use]
    pub fn with_groupby<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.groupby = attributes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_years(mut self, years: impl Into<YearSpec>) -> Self {
        self.years = Some(years.into());
        self
    }
}

impl Engine {
    /// Keeps the rows of one urban/rural part, region, or province.
    ///
    /// Attributes missing from the table are decoded for the filter and
    /// removed afterwards.
    pub fn select(&self, table: Table, options: &SelectOptions) -> Result<Table> {
        let mut table = table;
        if let Some(value) = &options.urban_rural {
            table = self.keep_attribute(table, URBAN_RURAL, value)?;
        }
        if let Some(value) = &options.region {
            table = self.keep_attribute(table, "Region", value)?;
        } else if let Some(value) = &options.province {
            table = self.keep_attribute(table, "Province", value)?;
        }
        Ok(table)
    }

    fn keep_attribute(&self, table: Table, attribute: &str, value: &str) -> Result<Table> {
        let decoded = table.data.column(attribute).is_err();
        let table = if decoded {
            self.add_attribute(table, &self.attribute_options(attribute))?
        } else {
            table
        };
        let rows = table.height();
        let mut data = table
            .data
            .clone()
            .lazy()
            .filter(col(attribute).cast(DataType::String).eq(lit(value)))
            .collect()?;
        if decoded {
            data = data.drop(attribute)?;
        }
        debug!(attribute, value, kept = data.height(), rows, "selected rows");
        Ok(table.replace_data(data))
    }

    fn attribute_options(&self, attribute: &str) -> AttributeOptions {
        AttributeOptions::new(attribute).with_columns(&self.context().settings().columns)
    }

    /// Adds (or replaces) the `CPI` column, matched on year and, by
    /// default, on the urban/rural part.
    pub fn add_cpi(&self, table: Table, options: CpiOptions) -> Result<Table> {
        let columns = &self.context().settings().columns;
        let years = distinct_years(&table, &columns.year)?;
        let cpi = self.load_cpi(&years, options)?;

        let mut table = table;
        if table.data.column(CPI_COLUMN).is_ok() {
            let data = table.data.drop(CPI_COLUMN)?;
            table = table.replace_data(data);
        }
        let mut keys = vec![columns.year.clone()];
        let mut decoded = false;
        if options.separate_by_urban_rural {
            if table.data.column(URBAN_RURAL).is_err() {
                table = self.add_attribute(table, &self.attribute_options(URBAN_RURAL))?;
                decoded = true;
            }
            keys.push(URBAN_RURAL.to_string());
        }
        let mut joined = join_on(table.data.clone(), cpi, &keys, JoinType::Left)?;
        if decoded {
            joined = joined.drop(URBAN_RURAL)?;
        }
        Ok(table.replace_data(joined))
    }

    /// The CPI series as `Year`, optionally `Urban_Rural`, and `CPI`.
    pub fn load_cpi(&self, years: &[i64], options: CpiOptions) -> Result<DataFrame> {
        let ctx = self.context();
        let columns = &ctx.settings().columns;
        let source = self.external_source(options.entry(), years)?;
        let year = source.column("year", &columns.year);

        let mut select = vec![col(year.as_str()).cast(DataType::Int64).alias(columns.year.as_str())];
        if options.separate_by_urban_rural {
            let part = source.column("urban_rural", URBAN_RURAL);
            select.push(
                col(part.as_str())
                    .cast(DataType::String)
                    .cast(categorical_dtype())
                    .alias(URBAN_RURAL),
            );
        }
        let cpi = source.column("cpi", CPI_COLUMN);
        select.push(col(cpi.as_str()).cast(DataType::Float64).alias(CPI_COLUMN));

        let df = read_parquet(&ctx.paths().external_file(&source.file_name))?
            .lazy()
            .select(select)
            .filter(in_years(&columns.year, years))
            .collect()?;
        Ok(df)
    }

    /// Expresses monetary columns in base-year prices: `value / CPI * 100`.
    ///
    /// Without `columns` every present [`MONETARY_COLUMNS`] entry is
    /// adjusted. A `CPI` column already in the table is used as is.
    pub fn adjust_by_cpi(&self, table: Table, columns: Option<&[String]>, options: CpiOptions) -> Result<Table> {
        let names: Vec<String> = match columns {
            Some(columns) => columns.to_vec(),
            None => MONETARY_COLUMNS
                .iter()
                .filter(|name| table.data.column(name).is_ok())
                .map(|name| (*name).to_string())
                .collect(),
        };
        if let Some(missing) = names.iter().find(|name| table.data.column(name).is_err()) {
            return Err(HbsError::ColumnNotFound {
                column: missing.clone(),
                context: table.table_name().unwrap_or("input table").to_string(),
            });
        }

        let added = table.data.column(CPI_COLUMN).is_err();
        let table = if added { self.add_cpi(table, options)? } else { table };
        let adjusted: Vec<Expr> = names
            .iter()
            .map(|name| {
                (col(name.as_str()).cast(DataType::Float64) / col(CPI_COLUMN) * lit(100.0)).alias(name.as_str())
            })
            .collect();
        let mut data = table.data.clone().lazy().with_columns(adjusted).collect()?;
        if added {
            data = data.drop(CPI_COLUMN)?;
        }
        Ok(table.replace_data(data))
    }

    /// Weighted averages per group.
    ///
    /// Missing grouping attributes are decoded, `Decile` and `Percentile`
    /// groups are ranked with default [`QuantileOptions`], and weights are
    /// added when the table has none. Groups appear in first-seen order.
    pub fn average_table(&self, table: Table, options: &AverageOptions) -> Result<DataFrame> {
        let columns = &self.context().settings().columns;
        let weight = options
            .weight_column
            .clone()
            .unwrap_or_else(|| columns.weight.clone());
        let groupby: Vec<String> = match &options.groupby {
            Some(groupby) => groupby.clone(),
            None => GROUPBY_COLUMNS
                .iter()
                .filter(|name| table.data.column(name).is_ok())
                .map(|name| (*name).to_string())
                .collect(),
        };
        let measures = match &options.columns {
            Some(measures) => measures.clone(),
            None => measure_columns(&table.data, &weight, &columns.household_id, &groupby),
        };

        let mut table = table;
        for name in &groupby {
            if table.data.column(name).is_ok() {
                continue;
            }
            table = match name.as_str() {
                DECILE_COLUMN => self.add_decile(table, QuantileOptions::new())?,
                PERCENTILE_COLUMN => self.add_percentile(table, QuantileOptions::new())?,
                attribute => self.add_attribute(table, &self.attribute_options(attribute))?,
            };
        }
        if !options.weighted {
            let data = table
                .data
                .clone()
                .lazy()
                .with_column(lit(1.0).alias(weight.as_str()))
                .collect()?;
            table = table.replace_data(data);
        } else if table.data.column(&weight).is_err() {
            table = self.add_weight(table, false)?;
        }

        let averages = weighted_mean_exprs(&measures, &weight);
        let lazy = table.data.clone().lazy();
        let result = if groupby.is_empty() {
            lazy.select(averages)
        } else {
            let keys: Vec<Expr> = groupby.iter().map(|name| col(name.as_str())).collect();
            lazy.group_by_stable(keys).agg(averages)
        }
        .collect()?;
        Ok(result)
    }

    /// Weighted quantile of each household's value as `Year`, `ID`, and
    /// the quantile column.
    ///
    /// Values are summed per household, divided by the equivalence scale,
    /// and ranked by cumulative weight within each group: the household with
    /// the largest value in a group has quantile 1. With `bins` the quantile
    /// becomes a bin number from 1 to `bins`.
    pub fn calculate_quantile(&self, table: Option<&Table>, options: &QuantileOptions) -> Result<DataFrame> {
        let columns = &self.context().settings().columns;
        let (year, id) = (columns.year.as_str(), columns.household_id.as_str());
        let keys = [columns.year.clone(), columns.household_id.clone()];
        let years = match (&options.years, table) {
            (Some(spec), _) => parse_years(spec, &self.context().span())?,
            (None, Some(table)) => distinct_years(table, year)?,
            (None, None) => parse_years(&YearSpec::Last, &self.context().span())?,
        };
        let settings = self.default_load_settings();

        let mut values = match (&options.source, table) {
            (QuantileSource::Column(column), Some(table)) => {
                household_values(&table.data, year, id, column, table.table_name().unwrap_or("input table"))?
            }
            (QuantileSource::Column(column), None) => {
                return Err(HbsError::ColumnNotFound {
                    column: column.clone(),
                    context: "quantile input (no table given)".to_string(),
                });
            }
            (QuantileSource::Table { table: name, column }, _) => {
                let source = self.create_table(name, &years, settings)?;
                household_values(&source.data, year, id, column, name)?
            }
        };
        if let (false, Some(table), QuantileSource::Table { .. }) = (options.for_all, table, &options.source) {
            let households = table
                .data
                .clone()
                .lazy()
                .group_by_stable([col(year).cast(DataType::Int64), col(id)])
                .agg([len().alias("Rows")])
                .select([col(year), col(id)])
                .collect()?;
            values = join_on(values, households, &keys, JoinType::Inner)?;
        }

        if options.equivalence_scale != EquivalenceScale::Household {
            let members = self
                .create_table(NUMBER_OF_MEMBERS_TABLE, &years, settings)?
                .data
                .lazy()
                .select([
                    col(year).cast(DataType::Int64),
                    col(id),
                    col("Members"),
                    col("Adults"),
                ])
                .collect()?;
            let joined = join_on(values, members, &keys, JoinType::Left)?;
            values = scale_values(&joined, year, id, options.equivalence_scale)?;
        }

        let mut ranked = Table::new(values.lazy().filter(col(VALUES).is_not_null()).collect()?);
        for attribute in &options.groupby {
            ranked = self.add_attribute(ranked, &self.attribute_options(attribute))?;
        }
        ranked = if options.weighted {
            self.add_weight(ranked, options.adjust_weight_for_household_size)?
        } else {
            let data = ranked
                .data
                .clone()
                .lazy()
                .with_column(lit(1.0).alias(columns.weight.as_str()))
                .collect()?;
            ranked.replace_data(data)
        };

        let mut group_columns: Vec<&str> = options.groupby.iter().map(String::as_str).collect();
        if options.annual {
            group_columns.push(year);
        }
        let quantiles = rank_by_weight(&ranked.data, &group_columns, &columns.weight)?;
        let series = match options.bins {
            Some(bins) => {
                let binned: Vec<Option<i64>> = quantiles.iter().map(|q| q.map(|q| to_bin(q, bins))).collect();
                Series::new(options.column_name.as_str().into(), binned)
            }
            None => Series::new(options.column_name.as_str().into(), quantiles),
        };
        let mut result = ranked.data.select([year, id])?;
        result.with_column(series)?;
        debug!(
            column = %options.column_name,
            households = result.height(),
            scale = %options.equivalence_scale,
            "calculated quantiles"
        );
        Ok(result)
    }

    /// Adds (or replaces) the quantile column, matched on year and household.
    pub fn add_quantile(&self, table: Table, options: &QuantileOptions) -> Result<Table> {
        let columns = &self.context().settings().columns;
        let quantiles = self.calculate_quantile(Some(&table), options)?;
        let mut data = table.data.clone();
        if data.column(&options.column_name).is_ok() {
            data = data.drop(&options.column_name)?;
        }
        let keys = [columns.year.clone(), columns.household_id.clone()];
        let joined = join_on(data, quantiles, &keys, JoinType::Left)?;
        Ok(table.replace_data(joined))
    }

    /// Adds a `Decile` column (1 to 10).
    pub fn add_decile(&self, table: Table, options: QuantileOptions) -> Result<Table> {
        let options = options.with_bins(10).with_column_name(DECILE_COLUMN);
        self.add_quantile(table, &options)
    }

    /// Adds a `Percentile` column (1 to 100).
    pub fn add_percentile(&self, table: Table, options: QuantileOptions) -> Result<Table> {
        let options = options.with_bins(100).with_column_name(PERCENTILE_COLUMN);
        self.add_quantile(table, &options)
    }
}

/// Weighted mean of each column as a one-row frame.
///
/// Rows where a measure is null still count towards the total weight.
pub fn weighted_average(df: &DataFrame, columns: Option<&[String]>, weight_column: &str) -> Result<DataFrame> {
    if df.column(weight_column).is_err() {
        return Err(HbsError::ColumnNotFound {
            column: weight_column.to_string(),
            context: "weighted average input".to_string(),
        });
    }
    let measures = match columns {
        Some(columns) => columns.to_vec(),
        None => measure_columns(df, weight_column, "ID", &[]),
    };
    let averages = weighted_mean_exprs(&measures, weight_column);
    Ok(df.clone().lazy().select(averages).collect()?)
}

/// Numeric columns that are neither keys nor the weight.
fn measure_columns(df: &DataFrame, weight_column: &str, id_column: &str, groupby: &[String]) -> Vec<String> {
    df.get_columns()
        .iter()
        .filter(|column| is_numeric_dtype(column.dtype()))
        .map(|column| column.name().to_string())
        .filter(|name| {
            name != weight_column
                && name != id_column
                && !GROUPBY_COLUMNS.contains(&name.as_str())
                && !groupby.contains(name)
        })
        .collect()
}

fn weighted_mean_exprs(columns: &[String], weight_column: &str) -> Vec<Expr> {
    let weight = || col(weight_column).cast(DataType::Float64);
    columns
        .iter()
        .map(|name| {
            ((col(name.as_str()).cast(DataType::Float64) * weight()).sum() / weight().sum()).alias(name.as_str())
        })
        .collect()
}

/// Sum of `column` per household, as `Year`, `ID`, and the value.
fn household_values(df: &DataFrame, year: &str, id: &str, column: &str, context: &str) -> Result<DataFrame> {
    if df.column(column).is_err() {
        return Err(HbsError::ColumnNotFound {
            column: column.to_string(),
            context: context.to_string(),
        });
    }
    let values = df
        .clone()
        .lazy()
        .filter(col(column).is_not_null())
        .group_by_stable([col(year).cast(DataType::Int64), col(id)])
        .agg([col(column).cast(DataType::Float64).sum().alias(VALUES)])
        .collect()?;
    Ok(values)
}

/// Divides each household value by its equivalence scale. Households with
/// no member count lose their value.
fn scale_values(df: &DataFrame, year: &str, id: &str, scale: EquivalenceScale) -> Result<DataFrame> {
    let members = column_i64_values(df.column("Members")?)?;
    let adults = column_i64_values(df.column("Adults")?)?;
    let values: Vec<Option<f64>> = df.column(VALUES)?.f64()?.into_iter().collect();
    let scaled: Vec<Option<f64>> = values
        .iter()
        .zip(members.iter().zip(&adults))
        .map(|(value, (members, adults))| match (value, members, adults) {
            (Some(value), Some(members), Some(adults)) => {
                let factor = scale.factor(*members, *adults);
                (factor > 0.0).then(|| value / factor)
            }
            _ => None,
        })
        .collect();
    let mut out = df.select([year, id])?;
    out.with_column(Series::new(VALUES.into(), scaled))?;
    Ok(out)
}

/// Cumulative share of weight of each row within its group, rows taken in
/// ascending value order.
fn rank_by_weight(df: &DataFrame, group_columns: &[&str], weight_column: &str) -> Result<Vec<Option<f64>>> {
    let values: Vec<f64> = df
        .column(VALUES)?
        .f64()?
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect();
    let weights: Vec<f64> = df
        .column(weight_column)?
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .map(|weight| weight.unwrap_or(0.0))
        .collect();
    let group_columns = group_columns
        .iter()
        .map(|name| df.column(name))
        .collect::<PolarsResult<Vec<_>>>()?;

    let mut groups: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for row in 0..df.height() {
        let key = group_columns
            .iter()
            .map(|column| column.get(row).map(any_to_string))
            .collect::<PolarsResult<Vec<_>>>()?;
        groups.entry(key).or_default().push(row);
    }

    let mut quantiles = vec![None; df.height()];
    for rows in groups.values_mut() {
        rows.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let total: f64 = rows.iter().map(|&row| weights[row]).sum();
        if total <= 0.0 {
            continue;
        }
        let mut cumulative = 0.0;
        for &row in rows.iter() {
            cumulative += weights[row];
            quantiles[row] = Some(cumulative / total);
        }
    }
    Ok(quantiles)
}

fn to_bin(quantile: f64, bins: u32) -> i64 {
    let bins = i64::from(bins);
    ((quantile * bins as f64).floor() as i64 + 1).clamp(1, bins)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_values(df: &DataFrame, name: &str) -> Vec<Option<f64>> {
        df.column(name).unwrap().f64().unwrap().into_iter().collect()
    }

    #[test]
    fn test_weighted_average() {
        let df = df! {
            "Col1" => [1.0, 2.0, 3.0],
            "Col2" => [25i64, 15, 10],
            "Weight" => [0.25, 0.25, 0.5],
        }
        .unwrap();
        let out = weighted_average(&df, None, "Weight").unwrap();
        assert_eq!(out.height(), 1);
        assert_eq!(f64_values(&out, "Col1"), vec![Some(2.25)]);
        assert_eq!(f64_values(&out, "Col2"), vec![Some(15.0)]);
        assert!(out.column("Weight").is_err());

        let err = weighted_average(&df, None, "Sample_Weight").unwrap_err();
        assert!(matches!(err, HbsError::ColumnNotFound { ref column, .. } if column == "Sample_Weight"));
    }

    #[test]
    fn test_measure_columns_skip_keys() {
        let df = df! {
            "Year" => [1396i64],
            "ID" => [1i64],
            "Province" => ["Tehran"],
            "Expenditure" => [10.0],
            "Members" => [2i64],
            "Weight" => [1.0],
        }
        .unwrap();
        assert_eq!(
            measure_columns(&df, "Weight", "ID", &["Members".to_string()]),
            vec!["Expenditure"]
        );
    }

    #[test]
    fn test_rank_by_weight_within_groups() {
        let df = df! {
            "Group" => ["a", "a", "b", "a"],
            VALUES => [30.0, 10.0, 5.0, 20.0],
            "Weight" => [1.0, 2.0, 4.0, 1.0],
        }
        .unwrap();
        let quantiles = rank_by_weight(&df, &["Group"], "Weight").unwrap();
        assert_eq!(quantiles, vec![Some(1.0), Some(0.5), Some(1.0), Some(0.75)]);

        let pooled = rank_by_weight(&df, &[], "Weight").unwrap();
        assert_eq!(pooled, vec![Some(1.0), Some(0.75), Some(0.5), Some(0.875)]);
    }

    #[test]
    fn test_bins_are_clipped() {
        assert_eq!(to_bin(1.0, 10), 10);
        assert_eq!(to_bin(0.0, 10), 1);
        assert_eq!(to_bin(0.42, 10), 5);
        assert_eq!(to_bin(0.999, 100), 100);
        assert_eq!(QuantileOptions::new().with_bins(0).bins, None);
    }

    #[test]
    fn test_equivalence_scales() {
        assert_eq!(EquivalenceScale::Household.factor(4, 2), 1.0);
        assert_eq!(EquivalenceScale::PerCapita.factor(4, 2), 4.0);
        assert!((EquivalenceScale::Oecd.factor(4, 2) - 2.7).abs() < 1e-9);
        assert!((EquivalenceScale::OecdModified.factor(4, 2) - 2.1).abs() < 1e-9);
        assert_eq!(EquivalenceScale::SquareRoot.factor(4, 2), 2.0);
        assert_eq!(
            "OECD_Modified".parse::<EquivalenceScale>().unwrap(),
            EquivalenceScale::OecdModified
        );
        assert!("Weekly".parse::<EquivalenceScale>().is_err());
    }
}
