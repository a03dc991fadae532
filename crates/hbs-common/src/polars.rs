//! Polars AnyValue utility functions.
//!
//! Survey tables are inspected cell by cell in a few places (raw column
//! cleaning, categorical rules, household ID decoding). These helpers give
//! those call sites one consistent view of a cell as text or number.

use polars::prelude::*;

/// Converts a Polars `AnyValue` to a `String` representation.
///
/// Returns an empty string for `Null` and formats floats without trailing
/// zeros, so that `1.0` and the YAML literal `1` compare equal.
///
/// # Examples
///
/// ```
/// use polars::prelude::AnyValue;
/// use hbs_common::any_to_string;
///
/// assert_eq!(any_to_string(AnyValue::Null), "");
/// assert_eq!(any_to_string(AnyValue::Int32(42)), "42");
/// assert_eq!(any_to_string(AnyValue::Float64(3.0)), "3");
/// assert_eq!(any_to_string(AnyValue::Boolean(true)), "true");
/// ```
pub fn any_to_string(value: AnyValue<'_>) -> String {
    match value {
        AnyValue::Null => String::new(),
        AnyValue::Int8(v) => v.to_string(),
        AnyValue::Int16(v) => v.to_string(),
        AnyValue::Int32(v) => v.to_string(),
        AnyValue::Int64(v) => v.to_string(),
        AnyValue::UInt8(v) => v.to_string(),
        AnyValue::UInt16(v) => v.to_string(),
        AnyValue::UInt32(v) => v.to_string(),
        AnyValue::UInt64(v) => v.to_string(),
        AnyValue::Float32(v) => format_numeric(f64::from(v)),
        AnyValue::Float64(v) => format_numeric(v),
        AnyValue::String(s) => s.to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        AnyValue::Boolean(b) => b.to_string(),
        other => match other.get_str() {
            Some(label) => label.to_string(),
            None => other.to_string(),
        },
    }
}

/// Formats a float without trailing zeros.
fn format_numeric(v: f64) -> String {
    let s = format!("{v}");
    if !s.contains('.') {
        return s;
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Converts an `AnyValue` to `i64`.
///
/// Floats are accepted only when they hold an integral value; household IDs
/// and commodity codes must never be truncated.
pub fn any_to_i64(value: AnyValue<'_>) -> Option<i64> {
    match value {
        AnyValue::Null => None,
        AnyValue::Int8(v) => Some(i64::from(v)),
        AnyValue::Int16(v) => Some(i64::from(v)),
        AnyValue::Int32(v) => Some(i64::from(v)),
        AnyValue::Int64(v) => Some(v),
        AnyValue::UInt8(v) => Some(i64::from(v)),
        AnyValue::UInt16(v) => Some(i64::from(v)),
        AnyValue::UInt32(v) => Some(i64::from(v)),
        AnyValue::UInt64(v) => i64::try_from(v).ok(),
        AnyValue::Float32(v) => integral_f64(f64::from(v)),
        AnyValue::Float64(v) => integral_f64(v),
        AnyValue::String(s) => parse_i64(s),
        AnyValue::StringOwned(s) => parse_i64(&s),
        _ => None,
    }
}

fn integral_f64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e18 {
        Some(v as i64)
    } else {
        None
    }
}

/// Parses a string as `f64`, returning `None` for invalid or empty strings.
pub fn parse_f64(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

/// Parses a string as `i64`, accepting integral decimals such as `"12.0"`.
pub fn parse_i64(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().and_then(integral_f64))
}

/// Whether a dtype holds plain numbers (integers or floats).
pub fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

/// Categorical dtype over the process-wide category pool.
///
/// Every label column built here shares one pool, so frames from different
/// years stack and join without re-encoding.
pub fn categorical_dtype() -> DataType {
    DataType::from_categories(Categories::global())
}

/// Builds a categorical series from optional labels.
pub fn categorical_series<S: AsRef<str>>(name: PlSmallStr, labels: &[Option<S>]) -> PolarsResult<Series> {
    let labels: Vec<Option<&str>> = labels.iter().map(|label| label.as_ref().map(AsRef::as_ref)).collect();
    Series::new(name, labels).cast(&categorical_dtype())
}

/// Collects a column as optional integers (see [`any_to_i64`]).
pub fn column_i64_values(column: &Column) -> PolarsResult<Vec<Option<i64>>> {
    let mut values = Vec::with_capacity(column.len());
    for idx in 0..column.len() {
        values.push(any_to_i64(column.get(idx)?));
    }
    Ok(values)
}

/// Stacks frames by column name.
///
/// Columns missing from a frame are filled with nulls and differing dtypes
/// are cast to their common supertype.
pub fn concat_diagonal(frames: Vec<DataFrame>) -> PolarsResult<DataFrame> {
    let mut frames = frames;
    match frames.len() {
        0 => Ok(DataFrame::empty()),
        1 => Ok(frames.remove(0)),
        _ => {
            let lazy: Vec<LazyFrame> = frames.into_iter().map(IntoLazy::lazy).collect();
            concat_lf_diagonal(
                lazy,
                UnionArgs {
                    rechunk: true,
                    to_supertypes: true,
                    ..Default::default()
                },
            )?
            .collect()
        }
    }
}
