use polars::prelude::DataFrame;

use hbs_model::{Result, Table};

/// Tables the pipeline pulls in from outside the current table.
///
/// `join` and `add_weights` need fully built tables of other names; the
/// table factory implements this so those steps go through the same cache.
pub trait TableProvider {
    /// Builds `table_name` for every year in `years` and stacks the results.
    fn create_table(&self, table_name: &str, years: &[i64]) -> Result<Table>;

    /// Sampling weights as `Year`, `ID`, `Weight` columns.
    fn load_weights(&self, years: &[i64], adjust_for_household_size: bool) -> Result<DataFrame>;
}
