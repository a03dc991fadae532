//! Schema instructions applied to a table, in order.
//!
//! Each instruction is either a bare step name (`add_year`) or a mapping with
//! a single entry from step name to step input (`apply_filter: Weight > 0`).
//! `null` instructions are skipped, and steps that take input do nothing when
//! the input is `null`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use polars::prelude::*;

use hbs_common::{categorical_dtype, column_i64_values, is_numeric_dtype};
use hbs_metadata::{MetaValue, MetadataContext};
use hbs_model::{HbsError, Result, Table};
use tracing::debug;

use crate::decoder::{AttributeOptions, ClassificationOptions, add_attribute, add_classification};
use crate::expression::Expression;
use crate::functions::{FunctionRegistry, TableFunction};
use crate::provider::TableProvider;

/// A pipeline step name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    AddYear,
    AddTableName,
    AddWeights,
    AddClassification,
    AddAttribute,
    ApplyOrder,
    CreateColumn,
    ApplyFilter,
    ApplyPandasFunction,
    ApplyExternalFunction,
    Join,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddYear => "add_year",
            Self::AddTableName => "add_table_name",
            Self::AddWeights => "add_weights",
            Self::AddClassification => "add_classification",
            Self::AddAttribute => "add_attribute",
            Self::ApplyOrder => "apply_order",
            Self::CreateColumn => "create_column",
            Self::ApplyFilter => "apply_filter",
            Self::ApplyPandasFunction => "apply_pandas_function",
            Self::ApplyExternalFunction => "apply_external_function",
            Self::Join => "join",
        }
    }

    /// Steps that do nothing without input.
    fn needs_input(self) -> bool {
        !matches!(self, Self::AddYear | Self::AddTableName | Self::AddWeights)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "add_year" => Self::AddYear,
            "add_table_name" => Self::AddTableName,
            "add_weights" => Self::AddWeights,
            "add_classification" => Self::AddClassification,
            "add_attribute" => Self::AddAttribute,
            "apply_order" => Self::ApplyOrder,
            "create_column" => Self::CreateColumn,
            "apply_filter" => Self::ApplyFilter,
            "apply_pandas_function" => Self::ApplyPandasFunction,
            "apply_external_function" => Self::ApplyExternalFunction,
            "join" => Self::Join,
            _ => return Err(()),
        })
    }
}

/// Runs instruction lists for one table and year.
pub struct Pipeline<'a> {
    ctx: &'a MetadataContext,
    provider: &'a dyn TableProvider,
    functions: &'a FunctionRegistry,
    table_name: String,
    year: i64,
    loaded: HashMap<String, TableFunction>,
    executed: Vec<Step>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ctx: &'a MetadataContext,
        provider: &'a dyn TableProvider,
        functions: &'a FunctionRegistry,
        table_name: impl Into<String>,
        year: i64,
    ) -> Self {
        Self {
            ctx,
            provider,
            functions,
            table_name: table_name.into(),
            year,
            loaded: HashMap::new(),
            executed: Vec::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn year(&self) -> i64 {
        self.year
    }

    /// Steps run so far, in order.
    pub fn executed_steps(&self) -> &[Step] {
        &self.executed
    }

    /// Applies `instructions` to `table` in order.
    pub fn run(&mut self, table: Table, instructions: &[MetaValue]) -> Result<Table> {
        let mut table = table;
        for instruction in instructions {
            let Some((step, input)) = self.parse_instruction(instruction)? else {
                continue;
            };
            self.executed.push(step);
            if step.needs_input() && input.is_null() {
                debug!(table = %self.table_name, year = self.year, %step, "step without input skipped");
                continue;
            }
            debug!(
                table = %self.table_name,
                year = self.year,
                %step,
                rows = table.height(),
                "applying step"
            );
            table = self.apply(step, table, input)?;
        }
        Ok(table)
    }

    fn parse_instruction<'i>(&self, instruction: &'i MetaValue) -> Result<Option<(Step, &'i MetaValue)>> {
        static NULL: MetaValue = MetaValue::Null;
        let (name, input) = match instruction {
            MetaValue::Null => return Ok(None),
            MetaValue::Str(name) => (name.as_str(), &NULL),
            MetaValue::Map(map) if map.len() == 1 => {
                let Some((key, input)) = map.iter().next() else {
                    return Ok(None);
                };
                let Some(name) = key.as_str() else {
                    return Err(self.invalid(&key.to_string(), "step name must be a string"));
                };
                (name, input)
            }
            other => {
                return Err(self.invalid(
                    "instruction",
                    format!(
                        "expected a step name or a single-entry mapping, found {}",
                        other.type_name()
                    ),
                ));
            }
        };
        let step = name.parse::<Step>().map_err(|()| HbsError::UnknownStep {
            step: name.to_string(),
            table: self.table_name.clone(),
            year: self.year,
        })?;
        Ok(Some((step, input)))
    }

    fn apply(&mut self, step: Step, table: Table, input: &MetaValue) -> Result<Table> {
        match step {
            Step::AddYear => self.add_year(table),
            Step::AddTableName => self.add_table_name(table),
            Step::AddWeights => self.add_weights(table, input),
            Step::AddClassification => {
                let options = ClassificationOptions::from_meta(input)
                    .map_err(|e| self.invalid(step.as_str(), e.to_string()))?;
                add_classification(self.ctx, table, &options)
            }
            Step::AddAttribute => {
                let options = AttributeOptions::from_meta(input, &self.ctx.settings().columns)
                    .map_err(|e| self.invalid(step.as_str(), e.to_string()))?;
                add_attribute(self.ctx, table, &options)
            }
            Step::ApplyOrder => self.apply_order(table, input),
            Step::CreateColumn => self.create_column(table, input),
            Step::ApplyFilter => self.apply_filter(table, input),
            Step::ApplyPandasFunction | Step::ApplyExternalFunction => {
                self.apply_function(step, table, input)
            }
            Step::Join => self.join(table, input),
        }
    }

    fn invalid(&self, step: &str, reason: impl Into<String>) -> HbsError {
        HbsError::InvalidInstruction {
            step: step.to_string(),
            table: self.table_name.clone(),
            year: self.year,
            reason: reason.into(),
        }
    }

    fn missing_column(&self, column: &str) -> HbsError {
        HbsError::ColumnNotFound {
            column: column.to_string(),
            context: format!("table '{}' ({})", self.table_name, self.year),
        }
    }

    fn add_year(&self, table: Table) -> Result<Table> {
        let column = &self.ctx.settings().columns.year;
        let data = table
            .data
            .clone()
            .lazy()
            .with_column(lit(self.year).cast(DataType::Int64).alias(column.as_str()))
            .collect()?;
        Ok(table.replace_data(data))
    }

    fn add_table_name(&self, table: Table) -> Result<Table> {
        let column = &self.ctx.settings().columns.table_name;
        let data = table
            .data
            .clone()
            .lazy()
            .with_column(lit(self.table_name.as_str()).alias(column.as_str()))
            .collect()?;
        Ok(table.replace_data(data))
    }

    fn add_weights(&self, table: Table, input: &MetaValue) -> Result<Table> {
        let adjust = match input {
            MetaValue::Null => false,
            MetaValue::Bool(adjust) => *adjust,
            MetaValue::Map(_) => input
                .get("adjust_for_household_size")
                .and_then(MetaValue::as_bool)
                .unwrap_or(false),
            other => {
                return Err(self.invalid(
                    Step::AddWeights.as_str(),
                    format!("expected a mapping, found {}", other.type_name()),
                ));
            }
        };
        let columns = &self.ctx.settings().columns;
        let years = self.table_years(&table)?;
        let weights = self.provider.load_weights(&years, adjust)?;
        let keys = [columns.year.clone(), columns.household_id.clone()];
        let mut data = table.data.clone();
        if data.column(&columns.weight).is_ok() {
            data = data.drop(&columns.weight)?;
        }
        let joined = join_on(data, weights, &keys, JoinType::Left)?;
        Ok(table.replace_data(joined))
    }

    fn apply_order(&self, table: Table, input: &MetaValue) -> Result<Table> {
        let step = Step::ApplyOrder.as_str();
        let items = match input {
            MetaValue::Seq(items) => items.as_slice(),
            MetaValue::Str(_) | MetaValue::Map(_) => std::slice::from_ref(input),
            other => {
                return Err(self.invalid(step, format!("expected a list, found {}", other.type_name())));
            }
        };
        let mut exprs = Vec::with_capacity(items.len());
        for item in items {
            let (name, dtype) = match item {
                MetaValue::Str(name) => (name.as_str(), None),
                MetaValue::Map(map) if map.len() == 1 => {
                    let Some((key, kind)) = map.iter().next() else {
                        continue;
                    };
                    let Some(name) = key.as_str() else {
                        return Err(self.invalid(step, format!("column name '{key}' must be a string")));
                    };
                    let kind = kind
                        .as_str()
                        .ok_or_else(|| self.invalid(step, format!("type of '{name}' must be a string")))?;
                    let dtype = order_dtype(kind)
                        .ok_or_else(|| self.invalid(step, format!("unknown type '{kind}' for '{name}'")))?;
                    (name, Some(dtype))
                }
                other => {
                    return Err(self.invalid(
                        step,
                        format!("expected a column name or a mapping, found {}", other.type_name()),
                    ));
                }
            };
            if table.data.column(name).is_err() {
                return Err(self.missing_column(name));
            }
            exprs.push(match dtype {
                Some(dtype) => col(name).cast(dtype),
                None => col(name),
            });
        }
        let data = table.data.clone().lazy().select(exprs).collect()?;
        Ok(table.replace_data(data))
    }

    fn create_column(&self, table: Table, input: &MetaValue) -> Result<Table> {
        let step = Step::CreateColumn.as_str();
        let name = input
            .get("name")
            .and_then(MetaValue::as_str)
            .ok_or_else(|| self.invalid(step, "column name is required"))?;
        let kind = input
            .get("type")
            .and_then(MetaValue::as_str)
            .ok_or_else(|| self.invalid(step, format!("type of '{name}' is required")))?;
        let expr = match kind {
            "numerical" => self.numerical_column(&table, name, input.get("expression"))?,
            "categorical" => self.categorical_column(&table, name, input.get("categories"))?,
            other => {
                return Err(self.invalid(step, format!("unknown column type '{other}'")));
            }
        };
        let data = table.data.clone().lazy().with_column(expr.alias(name)).collect()?;
        Ok(table.replace_data(data))
    }

    fn numerical_column(&self, table: &Table, name: &str, expression: Option<&MetaValue>) -> Result<Expr> {
        let step = Step::CreateColumn.as_str();
        match expression {
            Some(MetaValue::Int(value)) => Ok(lit(*value)),
            Some(MetaValue::Float(value)) => Ok(lit(*value)),
            Some(MetaValue::Str(source)) => {
                let expression = Expression::parse(source)
                    .map_err(|e| self.invalid(step, format!("'{name}': {e}")))?;
                for column in expression.columns() {
                    if table.data.column(column).is_err() {
                        return Err(self.missing_column(column));
                    }
                }
                Ok(expression.to_numeric_expr())
            }
            Some(other) => Err(self.invalid(
                step,
                format!("expression of '{name}' must be a number or a string, found {}", other.type_name()),
            )),
            None => Err(self.invalid(step, format!("expression of '{name}' is required"))),
        }
    }

    /// Rules are tried in order and the first match wins; a `null` rule
    /// matches every row. Unmatched rows keep the column's current value.
    fn categorical_column(&self, table: &Table, name: &str, categories: Option<&MetaValue>) -> Result<Expr> {
        let step = Step::CreateColumn.as_str();
        let rules = categories
            .and_then(MetaValue::as_map)
            .ok_or_else(|| self.invalid(step, format!("categories of '{name}' must be a mapping")))?;
        let fallback = if table.data.column(name).is_ok() {
            col(name).cast(DataType::String)
        } else {
            lit(NULL).cast(DataType::String)
        };
        let mut conditions = Vec::with_capacity(rules.len());
        for (category, condition) in rules {
            let predicate = match condition {
                MetaValue::Null => lit(true),
                MetaValue::Map(map) => {
                    let mut all = Vec::with_capacity(map.len());
                    for (column, value) in map {
                        let column = column.to_string();
                        if table.data.column(&column).is_err() {
                            return Err(self.missing_column(&column));
                        }
                        all.push(self.matches(&column, value, name)?);
                    }
                    all.into_iter()
                        .reduce(Expr::and)
                        .unwrap_or_else(|| lit(true))
                }
                value => {
                    if table.data.column(name).is_err() {
                        return Err(self.missing_column(name));
                    }
                    self.matches(name, value, name)?
                }
            };
            conditions.push((predicate, lit(category.to_string())));
        }
        Ok(conditions
            .into_iter()
            .rev()
            .fold(fallback, |otherwise, (condition, value)| {
                when(condition).then(value).otherwise(otherwise)
            })
            .cast(categorical_dtype()))
    }

    /// Equality with a scalar, or membership in a list.
    fn matches(&self, column: &str, value: &MetaValue, target: &str) -> Result<Expr> {
        let scalar = |value: &MetaValue| -> Option<Expr> {
            match value {
                MetaValue::Str(s) => Some(col(column).eq(lit(s.clone()))),
                MetaValue::Int(i) => Some(col(column).eq(lit(*i))),
                MetaValue::Float(f) => Some(col(column).eq(lit(*f))),
                MetaValue::Bool(b) => Some(col(column).eq(lit(*b))),
                _ => None,
            }
        };
        let expr = match value {
            MetaValue::Seq(items) => items
                .iter()
                .map(scalar)
                .collect::<Option<Vec<_>>>()
                .map(|alternatives| alternatives.into_iter().reduce(Expr::or).unwrap_or_else(|| lit(false))),
            other => scalar(other),
        };
        expr.ok_or_else(|| {
            self.invalid(
                Step::CreateColumn.as_str(),
                format!("unsupported condition on '{column}' for '{target}'"),
            )
        })
    }

    fn apply_filter(&self, table: Table, input: &MetaValue) -> Result<Table> {
        let step = Step::ApplyFilter.as_str();
        let conditions = input
            .to_str_list()
            .ok_or_else(|| self.invalid(step, "expected a condition or a list of conditions"))?;
        let mut lazy = table.data.clone().lazy();
        for condition in &conditions {
            let expression =
                Expression::parse(condition).map_err(|e| self.invalid(step, format!("'{condition}': {e}")))?;
            for column in expression.columns() {
                if table.data.column(column).is_err() {
                    return Err(self.missing_column(column));
                }
            }
            lazy = lazy.filter(expression.to_predicate());
        }
        let data = lazy.collect()?;
        Ok(table.replace_data(data))
    }

    fn apply_function(&mut self, step: Step, table: Table, input: &MetaValue) -> Result<Table> {
        let name = input
            .as_str()
            .map(str::trim)
            .ok_or_else(|| self.invalid(step.as_str(), "expected a function name"))?;
        let function = match self.loaded.get(name) {
            Some(function) => function.clone(),
            None => {
                let function = self.functions.get(name).ok_or_else(|| HbsError::UnknownFunction {
                    name: name.to_string(),
                    table: self.table_name.clone(),
                    year: self.year,
                })?;
                self.loaded.insert(name.to_string(), function.clone());
                function
            }
        };
        let data = function(table.data.clone())?;
        Ok(table.replace_data(data))
    }

    fn join(&self, table: Table, input: &MetaValue) -> Result<Table> {
        let step = Step::Join.as_str();
        let columns = &self.ctx.settings().columns;
        let (other_name, keys) = match input {
            MetaValue::Str(name) => (
                name.as_str(),
                vec![columns.year.clone(), columns.household_id.clone()],
            ),
            MetaValue::Map(_) => {
                let name = input
                    .get("table_name")
                    .and_then(MetaValue::as_str)
                    .ok_or_else(|| self.invalid(step, "table_name is required"))?;
                let keys = match input.get("columns") {
                    Some(keys) => keys
                        .to_str_list()
                        .ok_or_else(|| self.invalid(step, "columns must be a list of names"))?,
                    None => vec![columns.year.clone(), columns.household_id.clone()],
                };
                (name, keys)
            }
            other => {
                return Err(self.invalid(
                    step,
                    format!("expected a table name or a mapping, found {}", other.type_name()),
                ));
            }
        };
        for key in &keys {
            if table.data.column(key).is_err() {
                return Err(self.missing_column(key));
            }
        }
        let years = self.table_years(&table)?;
        let other = self.provider.create_table(other_name, &years)?;
        let joined = join_on(table.data.clone(), other.data, &keys, JoinType::Inner)?;
        debug!(
            table = %self.table_name,
            other = other_name,
            rows = joined.height(),
            "joined table"
        );
        Ok(table.replace_data(joined))
    }

    /// Distinct years of the table's year column, or the pipeline year.
    fn table_years(&self, table: &Table) -> Result<Vec<i64>> {
        let column = &self.ctx.settings().columns.year;
        let Ok(values) = table.data.column(column) else {
            return Ok(vec![self.year]);
        };
        let mut years: Vec<i64> = column_i64_values(values)?
            .into_iter()
            .flatten()
            .collect();
        years.sort_unstable();
        years.dedup();
        if years.is_empty() {
            years.push(self.year);
        }
        Ok(years)
    }
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("table_name", &self.table_name)
            .field("year", &self.year)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

/// Joins on `keys`, first casting key pairs whose dtypes differ.
pub fn join_on(left: DataFrame, right: DataFrame, keys: &[String], how: JoinType) -> Result<DataFrame> {
    let mut left_casts = Vec::new();
    let mut right_casts = Vec::new();
    for key in keys {
        let left_dtype = left.column(key)?.dtype().clone();
        let right_dtype = right.column(key)?.dtype().clone();
        if left_dtype == right_dtype {
            continue;
        }
        let target = if is_numeric_dtype(&left_dtype) && is_numeric_dtype(&right_dtype) {
            if left_dtype.is_float() || right_dtype.is_float() {
                DataType::Float64
            } else {
                DataType::Int64
            }
        } else {
            DataType::String
        };
        left_casts.push(col(key.as_str()).cast(target.clone()));
        right_casts.push(col(key.as_str()).cast(target));
    }
    let key_exprs: Vec<Expr> = keys.iter().map(|key| col(key.as_str())).collect();
    let joined = left
        .lazy()
        .with_columns(left_casts)
        .join(
            right.lazy().with_columns(right_casts),
            key_exprs.clone(),
            key_exprs,
            JoinArgs {
                maintain_order: MaintainOrderJoin::Left,
                ..JoinArgs::new(how)
            },
        )
        .collect()?;
    Ok(joined)
}

/// Column type names accepted by `apply_order`.
fn order_dtype(name: &str) -> Option<DataType> {
    Some(match name.trim().to_ascii_lowercase().as_str() {
        "float" | "float64" | "double" => DataType::Float64,
        "float32" => DataType::Float32,
        "int" | "integer" | "int64" => DataType::Int64,
        "int32" => DataType::Int32,
        "int16" => DataType::Int16,
        "int8" => DataType::Int8,
        "unsigned" | "uint64" => DataType::UInt64,
        "uint32" => DataType::UInt32,
        "uint16" => DataType::UInt16,
        "uint8" => DataType::UInt8,
        "bool" | "boolean" => DataType::Boolean,
        "str" | "string" | "object" => DataType::String,
        "category" | "categorical" => categorical_dtype(),
        _ => return None,
    })
}
