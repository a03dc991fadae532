//! Column cleaning: text cleanup, literal replacement, type coercion, rename.

use polars::prelude::*;

use hbs_common::{any_to_string, categorical_series, is_numeric_dtype, parse_f64, parse_i64};
use hbs_model::{ColumnType, HbsError, Result};

use crate::descriptor::{ColumnRule, ColumnSpec, TableLayout};

/// Characters removed from text cells before coercion.
const REMOVED_CHARS: &[char] = &['\n', '\r', ',', '@', '-', '+'];

/// Arabic decimal separator.
const ARABIC_DECIMAL: char = '\u{066B}';

/// Table and year of the column being cleaned, for errors and logs.
#[derive(Debug, Clone, Copy)]
pub struct CleanContext<'a> {
    pub table: &'a str,
    pub year: i64,
}

impl<'a> CleanContext<'a> {
    pub fn new(table: &'a str, year: i64) -> Self {
        Self { table, year }
    }
}

/// Cleans one raw column according to its rule.
///
/// Returns `None` for dropped columns.
pub fn clean_column(
    column: &Column,
    rule: &ColumnRule,
    ctx: &CleanContext<'_>,
) -> Result<Option<Column>> {
    let spec = match rule {
        ColumnRule::Drop => return Ok(None),
        ColumnRule::Error => {
            return Err(HbsError::UnexpectedColumn {
                table: ctx.table.to_string(),
                year: ctx.year,
                column: column.name().to_string(),
            });
        }
        ColumnRule::Keep(spec) => spec,
    };

    let cells = column_cells(column, spec)?;
    let name = PlSmallStr::from(spec.new_name.as_str());
    let series = match spec.column_type {
        ColumnType::String => {
            if is_numeric_dtype(column.dtype()) && spec.replace.is_empty() {
                column.as_materialized_series().clone()
            } else {
                Series::new(name.clone(), cells)
            }
        }
        ColumnType::Boolean => {
            let truth = spec.true_condition.as_deref().unwrap_or_default();
            let values: Vec<Option<bool>> = cells
                .iter()
                .map(|cell| cell.as_deref().map(|text| text == truth))
                .collect();
            Series::new(name.clone(), values)
        }
        ColumnType::Float => {
            let values = parse_cells(&cells, parse_f64, column.name(), ctx);
            Series::new(name.clone(), values)
        }
        ColumnType::Unsigned | ColumnType::Integer => {
            integer_series(name.clone(), &cells, spec.column_type, column.name(), ctx)?
        }
        ColumnType::Category => {
            let codes = parse_cells(&cells, parse_i64, column.name(), ctx);
            let labels: Vec<Option<&str>> = codes
                .iter()
                .map(|code| code.and_then(|code| spec.categories.get(&code).map(String::as_str)))
                .collect();
            categorical_series(name.clone(), &labels)?
        }
    };

    Ok(Some(series.with_name(name).into_column()))
}

/// Cleans every column of a raw extract.
pub fn clean_table(df: &DataFrame, layout: &TableLayout) -> Result<DataFrame> {
    let ctx = CleanContext::new(&layout.table, layout.year);
    let mut columns = Vec::with_capacity(df.width());
    for column in df.get_columns() {
        let rule = layout.rule_for(column.name());
        if let Some(cleaned) = clean_column(column, rule, &ctx)? {
            columns.push(cleaned);
        }
    }
    Ok(DataFrame::new(columns)?)
}

/// Cleans a single text cell. Whitespace-only cells become `None`.
pub fn clean_text(value: &str) -> Option<String> {
    let cleaned: String = value
        .chars()
        .filter(|c| !REMOVED_CHARS.contains(c) && !c.is_control())
        .map(|c| if c == ARABIC_DECIMAL { '.' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim_end();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Cell texts after cleanup and replacement. Numeric cells are formatted as-is.
fn column_cells(column: &Column, spec: &ColumnSpec) -> Result<Vec<Option<String>>> {
    let numeric = is_numeric_dtype(column.dtype());
    let mut cells = Vec::with_capacity(column.len());
    for idx in 0..column.len() {
        let value = column.get(idx)?;
        let cell = if matches!(value, AnyValue::Null) {
            None
        } else if numeric {
            Some(any_to_string(value))
        } else {
            clean_text(&any_to_string(value))
        };
        cells.push(cell.map(|text| apply_replacements(text, &spec.replace)));
    }
    Ok(cells)
}

fn apply_replacements(mut text: String, replace: &[(String, String)]) -> String {
    for (from, to) in replace {
        if !from.is_empty() && text.contains(from.as_str()) {
            text = text.replace(from.as_str(), to);
        }
    }
    text
}

/// Parses every non-null cell; cells that fail to parse become null.
fn parse_cells<T>(
    cells: &[Option<String>],
    parse: impl Fn(&str) -> Option<T>,
    column: &str,
    ctx: &CleanContext<'_>,
) -> Vec<Option<T>> {
    let mut failed = 0usize;
    let values = cells
        .iter()
        .map(|cell| {
            let text = cell.as_deref()?;
            let parsed = parse(text);
            if parsed.is_none() {
                failed += 1;
            }
            parsed
        })
        .collect();
    if failed > 0 {
        tracing::warn!(
            table = ctx.table,
            year = ctx.year,
            column,
            count = failed,
            "unparseable values set to null"
        );
    }
    values
}

/// Integer column in the smallest fitting type; `Float64` when any value is fractional.
fn integer_series(
    name: PlSmallStr,
    cells: &[Option<String>],
    column_type: ColumnType,
    column: &str,
    ctx: &CleanContext<'_>,
) -> Result<Series> {
    let numbers = parse_cells(cells, parse_f64, column, ctx);
    let integers: Vec<Option<i64>> = cells
        .iter()
        .map(|cell| cell.as_deref().and_then(parse_i64))
        .collect();

    let fractional = numbers
        .iter()
        .zip(&integers)
        .any(|(number, integer)| number.is_some() && integer.is_none());
    if fractional {
        tracing::debug!(
            table = ctx.table,
            year = ctx.year,
            column,
            "fractional values in integer column, keeping Float64"
        );
        return Ok(Series::new(name, numbers));
    }

    let series = Series::new(name, &integers);
    let dtype = smallest_integer_dtype(&integers, column_type == ColumnType::Unsigned);
    Ok(series.cast(&dtype)?)
}

/// Smallest integer dtype holding every value. Negative values force a signed type.
pub fn smallest_integer_dtype(values: &[Option<i64>], unsigned: bool) -> DataType {
    let min = values.iter().flatten().copied().min().unwrap_or(0);
    let max = values.iter().flatten().copied().max().unwrap_or(0);

    if unsigned && min >= 0 {
        if max <= i64::from(u8::MAX) {
            DataType::UInt8
        } else if max <= i64::from(u16::MAX) {
            DataType::UInt16
        } else if max <= i64::from(u32::MAX) {
            DataType::UInt32
        } else {
            DataType::UInt64
        }
    } else if min >= i64::from(i8::MIN) && max <= i64::from(i8::MAX) {
        DataType::Int8
    } else if min >= i64::from(i16::MIN) && max <= i64::from(i16::MAX) {
        DataType::Int16
    } else if min >= i64::from(i32::MIN) && max <= i64::from(i32::MAX) {
        DataType::Int32
    } else {
        DataType::Int64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CleanContext<'static> {
        CleanContext::new("food", 1390)
    }

    fn keep(spec: ColumnSpec) -> ColumnRule {
        ColumnRule::Keep(spec)
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  1,234 "), Some("1234".to_string()));
        assert_eq!(clean_text("12\u{066B}5"), Some("12.5".to_string()));
        assert_eq!(clean_text("45."), Some("45".to_string()));
        assert_eq!(clean_text("-"), None);
        assert_eq!(clean_text("   "), None);
        assert_eq!(clean_text("\u{0007}7@"), Some("7".to_string()));
    }

    #[test]
    fn test_drop_and_error_rules() {
        let column = Column::new("DYCOL00".into(), [1i64, 2]);
        assert!(clean_column(&column, &ColumnRule::Drop, &ctx()).unwrap().is_none());

        let err = clean_column(&column, &ColumnRule::Error, &ctx()).unwrap_err();
        assert!(matches!(
            err,
            HbsError::UnexpectedColumn { ref column, year: 1390, .. } if column == "DYCOL00"
        ));
    }

    #[test]
    fn test_unsigned_downcast() {
        let column = Column::new("DYCOL01".into(), ["11111", " 11112", ""]);
        let rule = keep(ColumnSpec::new("Code", ColumnType::Unsigned));
        let cleaned = clean_column(&column, &rule, &ctx()).unwrap().unwrap();
        assert_eq!(cleaned.name().as_str(), "Code");
        assert_eq!(cleaned.dtype(), &DataType::UInt16);
        assert_eq!(cleaned.null_count(), 1);
    }

    #[test]
    fn test_integer_with_fraction_stays_float() {
        let column = Column::new("DYCOL05".into(), [Some(1.0f64), Some(2.5), None]);
        let rule = keep(ColumnSpec::new("Age", ColumnType::Integer));
        let cleaned = clean_column(&column, &rule, &ctx()).unwrap().unwrap();
        assert_eq!(cleaned.dtype(), &DataType::Float64);
        assert_eq!(cleaned.get(1).unwrap(), AnyValue::Float64(2.5));
    }

    #[test]
    fn test_replace_before_float_coercion() {
        let column = Column::new("DYCOL03".into(), ["2/5", "3", "abc"]);
        let rule = keep(ColumnSpec::new("Amount", ColumnType::Float).with_replace("/", "."));
        let cleaned = clean_column(&column, &rule, &ctx()).unwrap().unwrap();
        assert_eq!(cleaned.dtype(), &DataType::Float64);
        assert_eq!(cleaned.get(0).unwrap(), AnyValue::Float64(2.5));
        assert_eq!(cleaned.null_count(), 1);
    }

    #[test]
    fn test_boolean_keeps_nulls() {
        let column = Column::new("TAKMIL".into(), [Some(1i64), Some(2), None]);
        let rule = keep(ColumnSpec::new("Completed", ColumnType::Boolean).with_true_condition("1"));
        let cleaned = clean_column(&column, &rule, &ctx()).unwrap().unwrap();
        assert_eq!(cleaned.get(0).unwrap(), AnyValue::Boolean(true));
        assert_eq!(cleaned.get(1).unwrap(), AnyValue::Boolean(false));
        assert_eq!(cleaned.get(2).unwrap(), AnyValue::Null);
    }

    #[test]
    fn test_category_labels() {
        let column = Column::new("DYCOL04".into(), [Some(1i64), Some(2), Some(7), None]);
        let rule = keep(
            ColumnSpec::new("Sex", ColumnType::Category)
                .with_category(1, "Male")
                .with_category(2, "Female"),
        );
        let cleaned = clean_column(&column, &rule, &ctx()).unwrap().unwrap();
        let labels: Vec<_> = (0..4).map(|i| any_to_string(cleaned.get(i).unwrap())).collect();
        assert_eq!(labels, vec!["Male", "Female", "", ""]);
        assert_eq!(cleaned.null_count(), 2);
        assert!(cleaned.dtype().is_categorical());
    }

    #[test]
    fn test_smallest_integer_dtype() {
        assert_eq!(smallest_integer_dtype(&[Some(3), Some(200)], true), DataType::UInt8);
        assert_eq!(smallest_integer_dtype(&[Some(-1), Some(200)], true), DataType::Int16);
        assert_eq!(smallest_integer_dtype(&[Some(100_000)], false), DataType::Int32);
        assert_eq!(smallest_integer_dtype(&[None], false), DataType::Int8);
        assert_eq!(
            smallest_integer_dtype(&[Some(10_000_000_000)], true),
            DataType::UInt64
        );
    }
}
