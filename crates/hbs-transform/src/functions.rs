//! Registered table functions for `apply_external_function` and
//! `apply_pandas_function` steps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use polars::prelude::*;

use hbs_model::Result;

/// A whole-table transform supplied by the host.
pub type TableFunction = Arc<dyn Fn(DataFrame) -> Result<DataFrame> + Send + Sync>;

/// Name of the built-in household size function.
pub const NUMBER_OF_MEMBERS: &str = "standard_tables.number_of_members";

/// Age from which a member counts as an adult.
const ADULT_AGE: i64 = 14;

/// Named table functions available to the pipeline.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, TableFunction>,
}

impl FunctionRegistry {
    /// A registry without any functions.
    pub fn empty() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }

    /// A registry with the built-in functions.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(NUMBER_OF_MEMBERS, number_of_members);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(DataFrame) -> Result<DataFrame> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(DataFrame) -> Result<DataFrame> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<TableFunction> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Household size per `(Year, ID)`: `Members`, `Adults`, `Childs`.
pub fn number_of_members(df: DataFrame) -> Result<DataFrame> {
    let out = df
        .lazy()
        .group_by_stable([col("Year"), col("ID")])
        .agg([
            col("Member_Number").count().cast(DataType::Int64).alias("Members"),
            col("Age")
                .gt_eq(lit(ADULT_AGE))
                .cast(DataType::Int64)
                .sum()
                .alias("Adults"),
        ])
        .with_column((col("Members") - col("Adults")).alias("Childs"))
        .collect()?;
    Ok(out)
}
