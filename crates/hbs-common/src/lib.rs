//! Shared utilities for the HBS table crates.
//!
//! This crate provides the Polars value helpers used when survey columns are
//! inspected row by row (cleaning, decoding, categorical rules) and the
//! diagonal concatenation used wherever yearly or urban/rural frames are stacked.

pub mod polars;

pub use polars::{
    any_to_i64, any_to_string, categorical_dtype, categorical_series, column_i64_values,
    concat_diagonal, is_numeric_dtype, parse_f64, parse_i64,
};
