//! Commodity and occupation classification of coded rows.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use polars::prelude::*;

use hbs_common::categorical_dtype;
use hbs_metadata::{
    DocumentKind, MetaValue, MetadataContext, NumberSet, RangeOptions, categorize_items,
};
use hbs_model::{HbsError, Result, Table};
use tracing::{debug, warn};

use super::{required_i64_column, row_years, set_label_column, table_context};

const DEFAULT_COMMODITY_CLASSIFICATION: &str = "original";
const DEFAULT_OCCUPATION_CLASSIFICATION: &str = "ISCO_4";
const DEFAULT_LABEL: &str = "item_key";
const DEFAULT_LEVEL: i64 = 1;
const CODE_KEYWORD: &str = "code";

/// Which code a classification applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassificationType {
    /// Commodity codes, classified by the commodities document.
    Commodity,
    /// Job codes, classified by the occupations document.
    Occupation,
}

impl ClassificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commodity => "commodity",
            Self::Occupation => "occupation",
        }
    }

    pub fn document(self) -> DocumentKind {
        match self {
            Self::Commodity => DocumentKind::Commodities,
            Self::Occupation => DocumentKind::Occupations,
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            Self::Commodity => DEFAULT_COMMODITY_CLASSIFICATION,
            Self::Occupation => DEFAULT_OCCUPATION_CLASSIFICATION,
        }
    }
}

impl fmt::Display for ClassificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationType {
    type Err = HbsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "commodity" | "commodities" => Ok(Self::Commodity),
            "occupation" | "occupations" | "job" => Ok(Self::Occupation),
            other => Err(HbsError::metadata(
                "add_classification.classification_type",
                format!("unknown classification type '{other}'"),
            )),
        }
    }
}

/// Options of an `add_classification` step.
///
/// Unset options are taken from the classification's `defaults` block, then
/// from built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationOptions {
    /// Classification key; `original` for commodities, `ISCO_4` for occupations.
    pub name: Option<String>,
    /// Inferred from the table's columns when absent.
    pub classification_type: Option<ClassificationType>,
    pub labels: Option<Vec<String>>,
    pub levels: Option<Vec<i64>>,
    /// Output column per `(label, level)` pair, labels outermost.
    pub column_names: Option<Vec<String>>,
    pub code_column: Option<String>,
    pub year_column: Option<String>,
    /// Remove rows whose code has no entry.
    pub drop_value: Option<bool>,
    /// Leave rows whose code has no entry with null labels.
    pub allow_unmatched: Option<bool>,
    /// Fill value per column for null labels.
    pub missing_value_replacements: Option<BTreeMap<String, String>>,
}

impl ClassificationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, classification_type: ClassificationType) -> Self {
        self.classification_type = Some(classification_type);
        self
    }

    pub fn with_labels<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_levels(mut self, levels: impl IntoIterator<Item = i64>) -> Self {
        self.levels = Some(levels.into_iter().collect());
        self
    }

    pub fn with_column_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.column_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_code_column(mut self, column: impl Into<String>) -> Self {
        self.code_column = Some(column.into());
        self
    }

    pub fn with_drop_value(mut self, drop_value: bool) -> Self {
        self.drop_value = Some(drop_value);
        self
    }

    pub fn with_allow_unmatched(mut self, allow_unmatched: bool) -> Self {
        self.allow_unmatched = Some(allow_unmatched);
        self
    }

    /// Reads step input: a classification name or a mapping of options.
    pub fn from_meta(value: &MetaValue) -> Result<Self> {
        match value {
            MetaValue::Null => Ok(Self::new()),
            MetaValue::Str(name) => Ok(Self::named(name.as_str())),
            MetaValue::Map(_) => {
                let mut options = Self::new();
                options.fill_from(value, "add_classification")?;
                if let Some(name) = value.get("name").and_then(MetaValue::as_str) {
                    options.name = Some(name.to_string());
                }
                if let Some(kind) = value
                    .get("classification_type")
                    .or_else(|| value.get("type"))
                    .and_then(MetaValue::as_str)
                {
                    options.classification_type = Some(kind.parse()?);
                }
                if let Some(column) = value
                    .get("code_column")
                    .or_else(|| value.get("classification_column"))
                    .and_then(MetaValue::as_str)
                {
                    options.code_column = Some(column.to_string());
                }
                if let Some(column) = value.get("year_column").and_then(MetaValue::as_str) {
                    options.year_column = Some(column.to_string());
                }
                Ok(options)
            }
            other => Err(HbsError::metadata(
                "add_classification",
                format!("expected a name or a mapping, found {}", other.type_name()),
            )),
        }
    }

    /// Sets every option still unset from a `defaults`-shaped mapping.
    fn fill_from(&mut self, node: &MetaValue, path: &str) -> Result<()> {
        if self.labels.is_none()
            && let Some(labels) = node.get("labels").or_else(|| node.get("label"))
        {
            self.labels = Some(labels.to_str_list().ok_or_else(|| {
                HbsError::metadata(format!("{path}.labels"), "expected a list of strings")
            })?);
        }
        if self.levels.is_none()
            && let Some(levels) = node.get("levels").or_else(|| node.get("level"))
        {
            self.levels = Some(int_list(levels).ok_or_else(|| {
                HbsError::metadata(format!("{path}.levels"), "expected a list of integers")
            })?);
        }
        if self.column_names.is_none()
            && let Some(names) = node.get("column_names").or_else(|| node.get("column_name"))
        {
            self.column_names = Some(names.to_str_list().ok_or_else(|| {
                HbsError::metadata(format!("{path}.column_names"), "expected a list of strings")
            })?);
        }
        if self.drop_value.is_none() {
            self.drop_value = node.get("drop_value").and_then(MetaValue::as_bool);
        }
        if self.allow_unmatched.is_none() {
            self.allow_unmatched = node.get("allow_unmatched").and_then(MetaValue::as_bool);
        }
        if self.missing_value_replacements.is_none()
            && let Some(replacements) = node.get("missing_value_replacements")
        {
            let map = replacements.as_map().ok_or_else(|| {
                HbsError::metadata(
                    format!("{path}.missing_value_replacements"),
                    "expected a mapping",
                )
            })?;
            self.missing_value_replacements = Some(
                map.iter()
                    .filter_map(|(column, value)| value.to_text().map(|v| (column.to_string(), v)))
                    .collect(),
            );
        }
        Ok(())
    }
}

fn int_list(value: &MetaValue) -> Option<Vec<i64>> {
    match value {
        MetaValue::Seq(items) => items.iter().map(MetaValue::as_i64).collect(),
        scalar => scalar.as_i64().map(|level| vec![level]),
    }
}

/// Options with every default applied.
#[derive(Debug)]
struct Plan {
    kind: ClassificationType,
    name: String,
    labels: Vec<String>,
    levels: Vec<i64>,
    columns: Vec<String>,
    code_column: String,
    year_column: String,
    drop_value: bool,
    allow_unmatched: bool,
    replacements: BTreeMap<String, String>,
}

impl Plan {
    fn new(
        ctx: &MetadataContext,
        table: &Table,
        options: &ClassificationOptions,
        reference_year: i64,
    ) -> Result<Self> {
        let columns = &ctx.settings().columns;
        let kind = match (options.classification_type, &options.code_column) {
            (Some(kind), _) => kind,
            (None, Some(code)) if *code == columns.job_code => ClassificationType::Occupation,
            (None, Some(_)) => ClassificationType::Commodity,
            (None, None) => {
                if table.data.column(&columns.commodity_code).is_ok() {
                    ClassificationType::Commodity
                } else if table.data.column(&columns.job_code).is_ok() {
                    ClassificationType::Occupation
                } else {
                    return Err(HbsError::ColumnNotFound {
                        column: columns.commodity_code.clone(),
                        context: table_context(table),
                    });
                }
            }
        };
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| kind.default_name().to_string());

        let mut merged = options.clone();
        if let Some(defaults) = ctx.resolve(kind.document(), &[name.as_str(), "defaults"], reference_year)? {
            merged.fill_from(&defaults, &format!("{}.{name}.defaults", kind.document().name()))?;
        }

        let labels = merged
            .labels
            .filter(|labels| !labels.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_LABEL.to_string()]);
        let levels = merged
            .levels
            .filter(|levels| !levels.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_LEVEL]);
        let output_columns = match merged.column_names {
            Some(names) if names.len() != labels.len() * levels.len() => {
                return Err(HbsError::metadata(
                    "add_classification.column_names",
                    format!(
                        "{} column names given for {} labels at {} levels",
                        names.len(),
                        labels.len(),
                        levels.len()
                    ),
                ));
            }
            Some(names) => names,
            None => labels
                .iter()
                .flat_map(|label| levels.iter().map(move |level| format!("{label}_{level}")))
                .collect(),
        };
        let code_column = merged.code_column.unwrap_or_else(|| match kind {
            ClassificationType::Commodity => columns.commodity_code.clone(),
            ClassificationType::Occupation => columns.job_code.clone(),
        });

        Ok(Self {
            kind,
            name,
            labels,
            levels,
            columns: output_columns,
            code_column,
            year_column: merged.year_column.unwrap_or_else(|| columns.year.clone()),
            drop_value: merged.drop_value.unwrap_or(false),
            allow_unmatched: merged.allow_unmatched.unwrap_or(false),
            replacements: merged.missing_value_replacements.unwrap_or_default(),
        })
    }
}

/// One categorized classification item.
#[derive(Debug)]
struct Entry {
    level: i64,
    codes: NumberSet,
    labels: Vec<Option<String>>,
}

fn read_entries(ctx: &MetadataContext, plan: &Plan, year: i64) -> Result<Vec<Entry>> {
    let document = plan.kind.document();
    let path = format!("{}.{}", document.name(), plan.name);
    let resolved = ctx
        .resolve(document, &[plan.name.as_str()], year)?
        .ok_or_else(|| HbsError::metadata(&path, "unknown classification"))?;
    let versioning = &ctx.settings().versioning;
    let categorized = categorize_items(resolved, versioning)?;
    let items = categorized
        .get(&versioning.items_keyword)
        .and_then(MetaValue::as_seq)
        .unwrap_or_default();

    let span = ctx.span();
    let range_options = RangeOptions::new()
        .with_default_start(span.first_year)
        .with_default_end(span.last_year + 1)
        .with_keyword(CODE_KEYWORD);
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let item_name = item
            .get(&versioning.item_key_name)
            .and_then(MetaValue::to_text)
            .unwrap_or_default();
        let item_path = format!("{path}.{item_name}");
        let Some(level) = item.get("level").and_then(MetaValue::as_i64) else {
            return Err(HbsError::metadata(format!("{item_path}.level"), "level is required"));
        };
        let Some(code) = item.get(CODE_KEYWORD) else {
            return Err(HbsError::metadata(format!("{item_path}.code"), "code is required"));
        };
        entries.push(Entry {
            level,
            codes: NumberSet::parse_with(code, &range_options)?,
            labels: plan
                .labels
                .iter()
                .map(|label| item.get(label).and_then(MetaValue::to_text))
                .collect(),
        });
    }
    Ok(entries)
}

/// Labels of one `(year, code)` pair in output column order, or `None` when
/// the rows are dropped.
fn classify(plan: &Plan, entries: &[Entry], year: i64, code: i64) -> Result<Option<Vec<Option<String>>>> {
    let mut by_level: Vec<Option<&Entry>> = Vec::with_capacity(plan.levels.len());
    for &level in &plan.levels {
        let mut matches = entries
            .iter()
            .filter(|entry| entry.level == level && entry.codes.contains(code));
        let first = matches.next();
        let extra = matches.count();
        if extra > 0 {
            return Err(HbsError::AmbiguousClassification {
                classification: plan.name.clone(),
                year,
                code,
                level,
                matches: extra + 1,
            });
        }
        if first.is_none() {
            if plan.drop_value {
                return Ok(None);
            }
            if !plan.allow_unmatched {
                return Err(HbsError::UnmatchedClassification {
                    classification: plan.name.clone(),
                    year,
                    code,
                    level,
                });
            }
        }
        by_level.push(first);
    }
    let mut labels = Vec::with_capacity(plan.columns.len());
    for label_index in 0..plan.labels.len() {
        for entry in &by_level {
            labels.push(entry.and_then(|entry| entry.labels[label_index].clone()));
        }
    }
    Ok(Some(labels))
}

/// Adds classification label columns for the table's codes.
///
/// Every distinct `(year, code)` pair must match exactly one entry per
/// requested level. Rows keep their order; with `drop_value`, rows whose
/// code is unmatched are removed.
pub fn add_classification(
    ctx: &MetadataContext,
    table: Table,
    options: &ClassificationOptions,
) -> Result<Table> {
    let reference_year = match &options.year_column {
        Some(column) => row_years(&table, column)?,
        None => row_years(&table, &ctx.settings().columns.year)?,
    }
    .into_iter()
    .flatten()
    .min()
    .or(table.year())
    .unwrap_or(ctx.span().last_year);
    let plan = Plan::new(ctx, &table, options, reference_year)?;
    let codes = required_i64_column(&table, &plan.code_column)?;
    let years = row_years(&table, &plan.year_column)?;

    let mut entries_by_year: HashMap<i64, Vec<Entry>> = HashMap::new();
    let mut classified: HashMap<(i64, i64), Option<Vec<Option<String>>>> = HashMap::new();
    for (code, year) in codes.iter().zip(&years) {
        let (Some(code), Some(year)) = (*code, *year) else {
            continue;
        };
        if classified.contains_key(&(year, code)) {
            continue;
        }
        if !entries_by_year.contains_key(&year) {
            entries_by_year.insert(year, read_entries(ctx, &plan, year)?);
        }
        let Some(entries) = entries_by_year.get(&year) else {
            continue;
        };
        classified.insert((year, code), classify(&plan, entries, year, code)?);
    }
    debug!(
        classification = %plan.name,
        kind = %plan.kind,
        codes = classified.len(),
        "classified codes"
    );

    let mut keep = Vec::with_capacity(codes.len());
    let mut outputs: Vec<Vec<Option<String>>> =
        vec![Vec::with_capacity(codes.len()); plan.columns.len()];
    for (code, year) in codes.iter().zip(&years) {
        let labels = match code.zip(*year) {
            Some((code, year)) => match classified.get(&(year, code)) {
                Some(Some(labels)) => Some(labels),
                Some(None) => {
                    keep.push(false);
                    continue;
                }
                None => None,
            },
            None => None,
        };
        keep.push(true);
        for (index, output) in outputs.iter_mut().enumerate() {
            output.push(labels.and_then(|labels| labels[index].clone()));
        }
    }

    let dropped = keep.iter().filter(|keep| !**keep).count();
    let mut data = if dropped > 0 {
        warn!(classification = %plan.name, rows = dropped, "dropped unclassified rows");
        let mask = BooleanChunked::new("keep".into(), keep);
        table.data.filter(&mask)?
    } else {
        table.data.clone()
    };
    for (name, values) in plan.columns.iter().zip(outputs) {
        set_label_column(&mut data, name, &values)?;
    }
    if !plan.replacements.is_empty() {
        let fills: Vec<Expr> = plan
            .replacements
            .iter()
            .filter(|(column, _)| data.column(column).is_ok())
            .map(|(column, value)| {
                col(column.as_str())
                    .cast(DataType::String)
                    .fill_null(lit(value.clone()))
                    .cast(categorical_dtype())
                    .alias(column.as_str())
            })
            .collect();
        if !fills.is_empty() {
            data = data.lazy().with_columns(fills).collect()?;
        }
    }
    Ok(table.replace_data(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbs_metadata::Settings;

    fn context() -> MetadataContext {
        let commodities = MetaValue::from_yaml_str(
            r"
original:
  defaults:
    labels: [item_key]
    levels: [1]
    missing_value_replacements:
      item_key_1: Other
  items:
    food:
      level: 1
      code: {start: 11111, end: 12000}
    tobacco:
      level: 1
      code: {start: 22111, end: 22200}
    rice:
      level: 2
      group: staples
      code:
        1363: [11111, 11112]
        1395: {start: 11111, end: 11115}
    meat:
      level: 2
      group: protein
      code: {start: 11211, end: 11300}
overlapping:
  items:
    food:
      level: 1
      code: {start: 11111, end: 12000}
    rice:
      level: 1
      code: [11111]
",
            "commodities",
        )
        .unwrap();
        let occupations = MetaValue::from_yaml_str(
            r"
ISCO_4:
  items:
    managers:
      level: 1
      code: {start: 1000, end: 2000}
    professionals:
      level: 1
      code: {start: 2000, end: 3000}
",
            "occupations",
        )
        .unwrap();
        MetadataContext::from_documents(
            Settings::packaged().unwrap(),
            [
                (DocumentKind::Commodities, commodities),
                (DocumentKind::Occupations, occupations),
            ],
        )
    }

    fn expenditures() -> Table {
        Table::new(
            df! {
                "Year" => [1394i64, 1395, 1395, 1395, 1394],
                "ID" => [1i64, 1, 2, 2, 3],
                "Code" => [11113i64, 11113, 11211, 22111, 11111],
                "Expenditure" => [10.0, 20.0, 30.0, 40.0, 50.0],
            }
            .unwrap(),
        )
    }

    fn strings(df: &DataFrame, name: &str) -> Vec<Option<String>> {
        df.column(name)
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
    fn test_default_level_one() {
        let ctx = context();
        let table = add_classification(&ctx, expenditures(), &ClassificationOptions::new()).unwrap();
        assert_eq!(table.height(), 5);
        assert_eq!(
            strings(&table.data, "item_key_1"),
            ["food", "food", "food", "tobacco", "food"]
                .map(|s| Some(s.to_string()))
                .to_vec()
        );
    }

    #[test]
    fn test_versioned_codes_and_replacements() {
        let ctx = context();
        let options = ClassificationOptions::new()
            .with_labels(["item_key", "group"])
            .with_levels([2])
            .with_allow_unmatched(true);
        let table = add_classification(&ctx, expenditures(), &options).unwrap();
        // 11113 is rice only from 1395 on
        assert_eq!(
            strings(&table.data, "item_key_2"),
            vec![
                None,
                Some("rice".to_string()),
                Some("meat".to_string()),
                None,
                Some("rice".to_string()),
            ]
        );
        assert_eq!(strings(&table.data, "group_2")[2], Some("protein".to_string()));
        assert!(table.data.column("item_key_1").is_err());
        for name in ["item_key_2", "group_2"] {
            assert!(table.data.column(name).unwrap().dtype().is_categorical(), "{name}");
        }
    }

    #[test]
    fn test_unmatched_code_fails() {
        let ctx = context();
        let options = ClassificationOptions::new().with_levels([2]);
        let err = add_classification(&ctx, expenditures(), &options).unwrap_err();
        assert!(matches!(
            err,
            HbsError::UnmatchedClassification { level: 2, .. }
        ));
    }

    #[test]
    fn test_drop_value_removes_rows() {
        let ctx = context();
        let options = ClassificationOptions::new()
            .with_levels([2])
            .with_drop_value(true);
        let table = add_classification(&ctx, expenditures(), &options).unwrap();
        assert_eq!(table.height(), 3);
        assert_eq!(
            strings(&table.data, "item_key_2"),
            ["rice", "meat", "rice"].map(|s| Some(s.to_string())).to_vec()
        );
    }

    #[test]
    fn test_ambiguous_classification() {
        let ctx = context();
        let table = Table::stamped(df! { "Code" => [11200i64, 11111] }.unwrap(), "food", 1395);
        let err = add_classification(&ctx, table, &ClassificationOptions::named("overlapping"))
            .unwrap_err();
        assert!(matches!(
            err,
            HbsError::AmbiguousClassification {
                code: 11111,
                matches: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_occupation_inferred_from_columns() {
        let ctx = context();
        let table = Table::stamped(
            df! { "ID" => [1i64, 2], "Job_Code" => [1120i64, 2310] }.unwrap(),
            "employment_income",
            1398,
        );
        let table = add_classification(&ctx, table, &ClassificationOptions::new()).unwrap();
        assert_eq!(
            strings(&table.data, "item_key_1"),
            vec![Some("managers".to_string()), Some("professionals".to_string())]
        );
    }

    #[test]
    fn test_options_from_meta() {
        let value = MetaValue::from_yaml_str(
            "{name: food_groups, labels: [item_key, group_fa], levels: 1, drop_value: true}",
            "step",
        )
        .unwrap();
        let options = ClassificationOptions::from_meta(&value).unwrap();
        assert_eq!(options.name.as_deref(), Some("food_groups"));
        assert_eq!(options.levels, Some(vec![1]));
        assert_eq!(options.drop_value, Some(true));
        assert_eq!(options.allow_unmatched, None);
    }
}
