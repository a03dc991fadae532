//! Year-resolved layout of a raw table: file code and per-column rules.

use std::collections::{BTreeMap, HashMap};

use hbs_metadata::{DocumentKind, MetaKey, MetaValue, MetadataContext};
use hbs_model::{ColumnType, HbsError, Result};

/// How one raw column is cleaned.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRule {
    /// Column is removed.
    Drop,
    /// Column must not appear; loading fails with `UnexpectedColumn`.
    Error,
    /// Column is cleaned, coerced, and renamed.
    Keep(ColumnSpec),
}

/// Cleaning instructions for a kept column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub new_name: String,
    pub column_type: ColumnType,
    /// Literal substitutions applied before coercion, in order.
    pub replace: Vec<(String, String)>,
    /// Integer code to label, for `category` columns.
    pub categories: BTreeMap<i64, String>,
    /// Cell text that means `true`, for `boolean` columns.
    pub true_condition: Option<String>,
}

impl ColumnSpec {
    pub fn new(new_name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            new_name: new_name.into(),
            column_type,
            replace: Vec::new(),
            categories: BTreeMap::new(),
            true_condition: None,
        }
    }

    pub fn with_replace(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replace.push((from.into(), to.into()));
        self
    }

    pub fn with_category(mut self, code: i64, label: impl Into<String>) -> Self {
        self.categories.insert(code, label.into());
        self
    }

    pub fn with_true_condition(mut self, value: impl Into<String>) -> Self {
        self.true_condition = Some(value.into());
        self
    }
}

impl ColumnRule {
    /// Parses a resolved column descriptor. `path` names it in errors.
    pub fn from_meta(value: &MetaValue, path: &str) -> Result<Self> {
        match value {
            MetaValue::Str(action) => match action.as_str() {
                "drop" => Ok(Self::Drop),
                "error" => Ok(Self::Error),
                other => Err(HbsError::metadata(
                    path,
                    format!("unknown column action '{other}'"),
                )),
            },
            // a null version means the column is not part of that year's layout
            MetaValue::Null => Ok(Self::Drop),
            MetaValue::Map(_) => parse_spec(value, path).map(Self::Keep),
            other => Err(HbsError::metadata(
                path,
                format!("expected a column action or mapping, found {}", other.type_name()),
            )),
        }
    }

    pub fn new_name(&self) -> Option<&str> {
        match self {
            Self::Keep(spec) => Some(&spec.new_name),
            Self::Drop | Self::Error => None,
        }
    }
}

fn parse_spec(value: &MetaValue, path: &str) -> Result<ColumnSpec> {
    let new_name = value
        .get("new_name")
        .and_then(MetaValue::as_str)
        .ok_or_else(|| HbsError::metadata(format!("{path}.new_name"), "missing column name"))?;
    let column_type: ColumnType = value
        .get("type")
        .and_then(MetaValue::as_str)
        .ok_or_else(|| HbsError::metadata(format!("{path}.type"), "missing column type"))?
        .parse()
        .map_err(|_| HbsError::metadata(format!("{path}.type"), "unknown column type"))?;

    let mut spec = ColumnSpec::new(new_name, column_type);

    if let Some(replace) = value.get("replace").and_then(MetaValue::as_map) {
        for (from, to) in replace {
            let to = to.to_text().unwrap_or_default();
            spec.replace.push((from.to_string(), to));
        }
    }

    if let Some(categories) = value.get("categories").and_then(MetaValue::as_map) {
        for (code, label) in categories {
            let code = match code {
                MetaKey::Int(code) => *code,
                MetaKey::Str(text) => text.trim().parse().map_err(|_| {
                    HbsError::metadata(
                        format!("{path}.categories"),
                        format!("category code '{text}' is not an integer"),
                    )
                })?,
            };
            let label = label.to_text().ok_or_else(|| {
                HbsError::metadata(
                    format!("{path}.categories.{code}"),
                    "category label must be a scalar",
                )
            })?;
            spec.categories.insert(code, label);
        }
    }

    spec.true_condition = value.get("true_condition").and_then(MetaValue::to_text);
    if spec.column_type == ColumnType::Boolean && spec.true_condition.is_none() {
        return Err(HbsError::metadata(
            format!("{path}.true_condition"),
            "boolean columns need a true_condition",
        ));
    }
    if spec.column_type == ColumnType::Category && spec.categories.is_empty() {
        return Err(HbsError::metadata(
            format!("{path}.categories"),
            "category columns need categories",
        ));
    }

    Ok(spec)
}

/// Layout of one raw extract (urban or rural) for one year.
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub table: String,
    pub year: i64,
    pub urban: bool,
    pub file_code: String,
    columns: HashMap<String, ColumnRule>,
    missings: ColumnRule,
}

impl TableLayout {
    /// Resolves the layout of `table` in `year` from the tables document.
    pub fn resolve(ctx: &MetadataContext, table: &str, year: i64, urban: bool) -> Result<Self> {
        if !ctx.is_base_table(table) {
            return Err(HbsError::TableNotFound {
                table: table.to_string(),
                year,
            });
        }
        let Some(mut node) = ctx.resolve(DocumentKind::Tables, &[table], year)? else {
            return Err(HbsError::TableNotFound {
                table: table.to_string(),
                year,
            });
        };

        let fork = if urban { "urban" } else { "rural" };
        if let Some(branch) = node.get(fork) {
            node = branch.clone();
        }
        let path = format!("tables.{table}");

        let file_code = node
            .get("file_code")
            .and_then(MetaValue::to_text)
            .ok_or_else(|| HbsError::metadata(format!("{path}.file_code"), "missing file code"))?;

        let mut columns = HashMap::new();
        if let Some(entries) = node.get("columns").and_then(MetaValue::as_map) {
            for (name, descriptor) in entries {
                let name = name.to_string().to_uppercase();
                let rule = ColumnRule::from_meta(descriptor, &format!("{path}.columns.{name}"))?;
                columns.insert(name, rule);
            }
        }

        let missings = table_setting(ctx, node.get("settings"), "missings", year)?
            .map(|value| ColumnRule::from_meta(&value, &format!("{path}.settings.missings")))
            .transpose()?
            .unwrap_or(ColumnRule::Drop);

        Ok(Self {
            table: table.to_string(),
            year,
            urban,
            file_code,
            columns,
            missings,
        })
    }

    /// Rule for a raw column name; unlisted columns take the `missings` rule.
    pub fn rule_for(&self, raw_column: &str) -> &ColumnRule {
        self.columns
            .get(&raw_column.to_uppercase())
            .unwrap_or(&self.missings)
    }

    pub fn missings(&self) -> &ColumnRule {
        &self.missings
    }

    /// Names of the raw columns listed in metadata.
    pub fn listed_columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

/// A table setting, falling back to `default_table_settings`.
fn table_setting(
    ctx: &MetadataContext,
    table_settings: Option<&MetaValue>,
    key: &str,
    year: i64,
) -> Result<Option<MetaValue>> {
    if let Some(value) = table_settings.and_then(|settings| settings.get(key)) {
        return Ok(Some(value.clone()));
    }
    ctx.resolve(DocumentKind::Tables, &["default_table_settings", key], year)
}
