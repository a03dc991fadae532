use polars::prelude::DataFrame;

/// Provenance of a table: which survey table and year it was built for.
///
/// Loaded base tables carry both fields. Tables produced by concatenating
/// several years keep the table name and drop the year.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    pub table_name: Option<String>,
    pub year: Option<i64>,
}

impl TableMeta {
    /// Create a new empty metadata instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the table name.
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    /// Set the year.
    pub fn with_year(mut self, year: i64) -> Self {
        self.year = Some(year);
        self
    }
}

/// A survey table: data plus provenance.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub data: DataFrame,
    pub meta: TableMeta,
}

impl Table {
    /// Wrap a frame without provenance.
    pub fn new(data: DataFrame) -> Self {
        Self {
            data,
            meta: TableMeta::default(),
        }
    }

    /// Wrap a frame stamped with its table name and year.
    pub fn stamped(data: DataFrame, table_name: impl Into<String>, year: i64) -> Self {
        Self {
            data,
            meta: TableMeta::new().with_table_name(table_name).with_year(year),
        }
    }

    pub fn with_meta(data: DataFrame, meta: TableMeta) -> Self {
        Self { data, meta }
    }

    pub fn height(&self) -> usize {
        self.data.height()
    }

    pub fn is_empty(&self) -> bool {
        self.data.height() == 0
    }

    pub fn table_name(&self) -> Option<&str> {
        self.meta.table_name.as_deref()
    }

    pub fn year(&self) -> Option<i64> {
        self.meta.year
    }

    /// Replace the data while keeping provenance.
    pub fn replace_data(self, data: DataFrame) -> Self {
        Self {
            data,
            meta: self.meta,
        }
    }

    pub fn into_frame(self) -> DataFrame {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    #[test]
    fn stamped_table_keeps_provenance() {
        let df = df! { "ID" => [1i64, 2] }.unwrap();
        let table = Table::stamped(df, "food", 1400);
        assert_eq!(table.table_name(), Some("food"));
        assert_eq!(table.year(), Some(1400));
        assert_eq!(table.height(), 2);

        let replaced = table.replace_data(DataFrame::empty());
        assert!(replaced.is_empty());
        assert_eq!(replaced.year(), Some(1400));
    }
}
