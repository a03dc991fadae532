//! Household attributes encoded in the digits of the household ID.
//!
//! The household document gives the ID length per year and, per attribute,
//! the digit `position` (`start`, `end`) plus one or more label fields.
//! The attribute code is `id % 10^(len - start) / 10^(len - end)`.

use std::collections::HashMap;

use hbs_metadata::{ColumnSettings, DocumentKind, MetaKey, MetaValue, MetadataContext};
use hbs_model::{HbsError, Result, Table};
use tracing::debug;

use super::{required_i64_column, row_years, set_label_column};

const ID_LENGTH_KEY: &str = "ID_Length";

/// Options of an `add_attribute` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeOptions {
    /// Attribute key in the household document, e.g. `Province`.
    pub name: String,
    /// Label fields of the attribute to decode.
    pub fields: Vec<String>,
    /// Output column per field; derived from the name when absent.
    pub column_names: Option<Vec<String>>,
    pub id_column: String,
    pub year_column: String,
    /// Fail on codes without a label instead of leaving them null.
    pub required: bool,
}

impl AttributeOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec!["names".to_string()],
            column_names: None,
            id_column: "ID".to_string(),
            year_column: "Year".to_string(),
            required: false,
        }
    }

    /// Uses the configured household ID and year column names.
    pub fn with_columns(mut self, columns: &ColumnSettings) -> Self {
        self.id_column = columns.household_id.clone();
        self.year_column = columns.year.clone();
        self
    }

    pub fn with_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_column_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.column_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Reads step input: an attribute name or a mapping of options.
    pub fn from_meta(value: &MetaValue, columns: &ColumnSettings) -> Result<Self> {
        if let Some(name) = value.as_str() {
            return Ok(Self::new(name).with_columns(columns));
        }
        if value.as_map().is_none() {
            return Err(HbsError::metadata(
                "add_attribute",
                format!("expected a name or a mapping, found {}", value.type_name()),
            ));
        }
        let name = value
            .get("name")
            .and_then(MetaValue::as_str)
            .ok_or_else(|| HbsError::metadata("add_attribute.name", "attribute name is required"))?;
        let mut options = Self::new(name).with_columns(columns);
        if let Some(fields) = value.get("fields").or_else(|| value.get("field")) {
            options.fields = string_list(fields, "add_attribute.fields")?;
        }
        if let Some(names) = value.get("column_names").or_else(|| value.get("column_name")) {
            options.column_names = Some(string_list(names, "add_attribute.column_names")?);
        }
        if let Some(column) = value.get("id_column").and_then(MetaValue::as_str) {
            options.id_column = column.to_string();
        }
        if let Some(column) = value.get("year_column").and_then(MetaValue::as_str) {
            options.year_column = column.to_string();
        }
        if let Some(required) = value.get("required").and_then(MetaValue::as_bool) {
            options.required = required;
        }
        Ok(options)
    }

    /// Output column of every field, in field order.
    pub fn output_columns(&self) -> Result<Vec<String>> {
        if let Some(names) = &self.column_names {
            if names.len() != self.fields.len() {
                return Err(HbsError::metadata(
                    "add_attribute.column_names",
                    format!(
                        "{} column names given for {} fields",
                        names.len(),
                        self.fields.len()
                    ),
                ));
            }
            return Ok(names.clone());
        }
        Ok(match self.fields.as_slice() {
            [_] => vec![self.name.clone()],
            fields => fields
                .iter()
                .map(|field| format!("{}_{field}", self.name))
                .collect(),
        })
    }
}

fn string_list(value: &MetaValue, path: &str) -> Result<Vec<String>> {
    value
        .to_str_list()
        .ok_or_else(|| HbsError::metadata(path, "expected a string or a list of strings"))
}

/// The attribute layout that applies to one year.
#[derive(Debug)]
struct AttributeLayout {
    modulus: i64,
    divisor: i64,
    labels: Vec<HashMap<i64, String>>,
}

impl AttributeLayout {
    fn resolve(ctx: &MetadataContext, options: &AttributeOptions, year: i64) -> Result<Self> {
        let id_length = ctx
            .resolve(DocumentKind::Household, &[ID_LENGTH_KEY], year)?
            .and_then(|value| value.as_i64())
            .ok_or_else(|| HbsError::metadata("household.ID_Length", "ID length is not defined"))?;
        let path = format!("household.{}", options.name);
        let attribute = ctx
            .resolve(DocumentKind::Household, &[options.name.as_str()], year)?
            .ok_or_else(|| HbsError::metadata(&path, "unknown household attribute"))?;

        let position = attribute
            .get("position")
            .ok_or_else(|| HbsError::metadata(format!("{path}.position"), "position is required"))?;
        let digit = |key: &str| {
            position
                .get(key)
                .and_then(MetaValue::as_i64)
                .ok_or_else(|| {
                    HbsError::metadata(format!("{path}.position.{key}"), "expected an integer")
                })
        };
        let (start, end) = (digit("start")?, digit("end")?);
        if !(0 <= start && start < end && end <= id_length) {
            return Err(HbsError::metadata(
                format!("{path}.position"),
                format!("digits {start}..{end} do not fit an ID of length {id_length}"),
            ));
        }
        let power = |exponent: i64| {
            u32::try_from(exponent)
                .ok()
                .and_then(|exponent| 10i64.checked_pow(exponent))
                .ok_or_else(|| {
                    HbsError::metadata(format!("{path}.position"), "ID length is too large")
                })
        };

        let mut labels = Vec::with_capacity(options.fields.len());
        for field in &options.fields {
            let mapping = attribute
                .get(field)
                .and_then(MetaValue::as_map)
                .ok_or_else(|| {
                    HbsError::metadata(format!("{path}.{field}"), "label field is not a mapping")
                })?;
            labels.push(
                mapping
                    .iter()
                    .filter_map(|(key, label)| match key {
                        MetaKey::Int(code) => label.to_text().map(|label| (*code, label)),
                        MetaKey::Str(code) => code
                            .parse::<i64>()
                            .ok()
                            .zip(label.to_text()),
                    })
                    .collect(),
            );
        }
        Ok(Self {
            modulus: power(id_length - start)?,
            divisor: power(id_length - end)?,
            labels,
        })
    }

    fn code(&self, id: i64) -> i64 {
        id.rem_euclid(self.modulus) / self.divisor
    }
}

/// Adds the attribute's label columns, decoded from the household ID.
///
/// Rows keep their order and count. Rows with a null ID or year get null
/// labels.
pub fn add_attribute(ctx: &MetadataContext, table: Table, options: &AttributeOptions) -> Result<Table> {
    let columns = options.output_columns()?;
    let ids = required_i64_column(&table, &options.id_column)?;
    let years = row_years(&table, &options.year_column)?;

    let mut layouts: HashMap<i64, AttributeLayout> = HashMap::new();
    let mut decoded: HashMap<(i64, i64), Vec<Option<String>>> = HashMap::new();
    for (id, year) in ids.iter().zip(&years) {
        let (Some(id), Some(year)) = (*id, *year) else {
            continue;
        };
        if decoded.contains_key(&(year, id)) {
            continue;
        }
        if !layouts.contains_key(&year) {
            layouts.insert(year, AttributeLayout::resolve(ctx, options, year)?);
        }
        let Some(layout) = layouts.get(&year) else {
            continue;
        };
        let code = layout.code(id);
        let labels: Vec<Option<String>> = layout
            .labels
            .iter()
            .map(|mapping| mapping.get(&code).cloned())
            .collect();
        if options.required && labels.iter().any(Option::is_none) {
            return Err(HbsError::UnmappedAttribute {
                attribute: options.name.clone(),
                year,
                code,
            });
        }
        decoded.insert((year, id), labels);
    }
    debug!(
        attribute = %options.name,
        households = decoded.len(),
        years = layouts.len(),
        "decoded household attribute"
    );

    let mut outputs: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(ids.len()); columns.len()];
    for (id, year) in ids.iter().zip(&years) {
        let labels = id.zip(*year).and_then(|(id, year)| decoded.get(&(year, id)));
        for (index, output) in outputs.iter_mut().enumerate() {
            output.push(labels.and_then(|labels| labels[index].clone()));
        }
    }

    let mut table = table;
    for (name, values) in columns.iter().zip(outputs) {
        set_label_column(&mut table.data, name, &values)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbs_metadata::Settings;
    use polars::prelude::*;

    fn context() -> MetadataContext {
        let household = MetaValue::from_yaml_str(
            r"
ID_Length:
  1363: 9
Urban_Rural:
  position: {start: 0, end: 1}
  names: {1: Urban, 2: Rural}
Province:
  position: {start: 1, end: 3}
  names:
    0: Markazi
    1: Gilan
    versions:
      1363: null
      1390:
        30: Alborz
  codes: {0: '00', 1: '01', 30: '30'}
",
            "household",
        )
        .unwrap();
        MetadataContext::from_documents(
            Settings::packaged().unwrap(),
            [(DocumentKind::Household, household)],
        )
    }

    fn strings(table: &Table, name: &str) -> Vec<Option<String>> {
        table
            .data
            .column(name)
            .unwrap()
            .cast(&DataType::String)
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect()
    }

    #[test]
    fn test_output_columns() {
        let options = AttributeOptions::new("Province");
        assert_eq!(options.output_columns().unwrap(), vec!["Province"]);

        let options = options.with_fields(["names", "codes"]);
        assert_eq!(
            options.output_columns().unwrap(),
            vec!["Province_names", "Province_codes"]
        );

        let mismatched = options.with_column_names(["Province"]);
        assert!(mismatched.output_columns().is_err());
    }

    #[test]
    fn test_from_meta() {
        let columns = Settings::packaged().unwrap().columns;
        let options = AttributeOptions::from_meta(&MetaValue::from("Urban_Rural"), &columns).unwrap();
        assert_eq!(options.fields, vec!["names"]);

        let value = MetaValue::from_yaml_str(
            "{name: Province, field: codes, column_name: Province_Code, required: true}",
            "step",
        )
        .unwrap();
        let options = AttributeOptions::from_meta(&value, &columns).unwrap();
        assert_eq!(options.fields, vec!["codes"]);
        assert_eq!(options.column_names, Some(vec!["Province_Code".to_string()]));
        assert!(options.required);
    }

    #[test]
    fn test_decode_by_year() {
        let ctx = context();
        let table = Table::new(
            df! {
                "Year" => [1389i64, 1390, 1390, 1390],
                "ID" => [100_012_345i64, 130_012_345, 201_000_001, 130_000_002],
            }
            .unwrap(),
        );
        let table = add_attribute(&ctx, table, &AttributeOptions::new("Urban_Rural")).unwrap();
        let table = add_attribute(&ctx, table, &AttributeOptions::new("Province")).unwrap();

        assert_eq!(table.height(), 4);
        assert!(table.data.column("Province").unwrap().dtype().is_categorical());
        assert_eq!(
            strings(&table, "Urban_Rural"),
            vec![
                Some("Urban".to_string()),
                Some("Urban".to_string()),
                Some("Rural".to_string()),
                Some("Urban".to_string()),
            ]
        );
        assert_eq!(
            strings(&table, "Province"),
            vec![
                Some("Markazi".to_string()),
                Some("Alborz".to_string()),
                Some("Gilan".to_string()),
                Some("Alborz".to_string()),
            ]
        );
    }

    #[test]
    fn test_unmapped_codes() {
        let ctx = context();
        let table = Table::stamped(df! { "ID" => [130_012_345i64, 101_000_000] }.unwrap(), "food", 1389);

        let decoded = add_attribute(&ctx, table.clone(), &AttributeOptions::new("Province")).unwrap();
        assert_eq!(
            strings(&decoded, "Province"),
            vec![None, Some("Gilan".to_string())]
        );

        let err = add_attribute(
            &ctx,
            table,
            &AttributeOptions::new("Province").with_required(true),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HbsError::UnmappedAttribute { code: 30, year: 1389, .. }
        ));
    }

    #[test]
    fn test_missing_id_column() {
        let ctx = context();
        let table = Table::stamped(df! { "Code" => [1i64] }.unwrap(), "food", 1390);
        let err = add_attribute(&ctx, table, &AttributeOptions::new("Province")).unwrap_err();
        assert!(matches!(err, HbsError::ColumnNotFound { .. }));
    }
}
