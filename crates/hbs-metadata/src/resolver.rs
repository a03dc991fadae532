//! Year-versioned metadata resolution.
//!
//! A metadata mapping takes one of three shapes:
//!
//! - unversioned: resolved entry by entry;
//! - simple-versioned: every key is a plausible year, the greatest key not
//!   after the requested year wins;
//! - keyword-versioned: a `versions` entry holds a simple-versioned mapping
//!   whose selected value overrides the sibling entries.
//!
//! Resolution recurses into the selected value, so versions may nest.

use hbs_model::{HbsError, Result};
use serde::{Deserialize, Serialize};

use crate::value::{MetaKey, MetaMap, MetaValue};

/// Keywords and bounds that drive version detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningSettings {
    /// Inclusive bounds for keys treated as version years.
    pub year_range: [i64; 2],
    pub version_keyword: String,
    pub items_keyword: String,
    pub category_keyword: String,
    pub item_key_name: String,
}

impl Default for VersioningSettings {
    fn default() -> Self {
        Self {
            year_range: [1300, 1500],
            version_keyword: "versions".to_string(),
            items_keyword: "items".to_string(),
            category_keyword: "categories".to_string(),
            item_key_name: "item_key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Unversioned,
    Simple,
    Keyword,
}

/// Resolves metadata nodes for a single year.
#[derive(Debug, Clone, Copy)]
pub struct VersionResolver<'a> {
    settings: &'a VersioningSettings,
    year: i64,
}

impl<'a> VersionResolver<'a> {
    pub fn new(settings: &'a VersioningSettings, year: i64) -> Self {
        Self { settings, year }
    }

    pub fn year(&self) -> i64 {
        self.year
    }

    /// Resolves `node`, reporting errors relative to the document root.
    pub fn resolve(&self, node: &MetaValue) -> Result<MetaValue> {
        self.resolve_at(node, "")
    }

    /// Resolves `node` found at the dotted metadata `path`.
    pub fn resolve_at(&self, node: &MetaValue, path: &str) -> Result<MetaValue> {
        match node {
            MetaValue::Seq(items) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| self.resolve_at(item, &format!("{path}[{idx}]")))
                .collect::<Result<Vec<_>>>()
                .map(MetaValue::Seq),
            MetaValue::Map(map) => match self.shape(map) {
                Shape::Unversioned => {
                    let mut resolved = MetaMap::with_capacity(map.len());
                    for (key, value) in map {
                        let child = join_path(path, key);
                        resolved.insert(key.clone(), self.resolve_at(value, &child)?);
                    }
                    Ok(MetaValue::Map(resolved))
                }
                Shape::Simple => {
                    let selected = self.select(map, path)?;
                    self.resolve_at(selected, path)
                }
                Shape::Keyword => {
                    let merged = self.merge_keyword_version(map, path)?;
                    self.resolve_at(&merged, path)
                }
            },
            scalar => Ok(scalar.clone()),
        }
    }

    /// Whether `node` or anything below it is versioned.
    pub fn is_versioned(&self, node: &MetaValue) -> bool {
        match node {
            MetaValue::Seq(items) => items.iter().any(|item| self.is_versioned(item)),
            MetaValue::Map(map) => {
                self.shape(map) != Shape::Unversioned
                    || map.values().any(|value| self.is_versioned(value))
            }
            _ => false,
        }
    }

    fn shape(&self, map: &MetaMap) -> Shape {
        if map.contains_key(&MetaKey::Str(self.settings.version_keyword.clone())) {
            return Shape::Keyword;
        }
        if map.is_empty() {
            return Shape::Unversioned;
        }
        let [low, high] = self.settings.year_range;
        let all_years = map
            .keys()
            .all(|key| matches!(key.as_i64(), Some(year) if (low..=high).contains(&year)));
        if all_years {
            Shape::Simple
        } else {
            Shape::Unversioned
        }
    }

    fn select<'m>(&self, versions: &'m MetaMap, path: &str) -> Result<&'m MetaValue> {
        let mut selected: Option<(i64, &MetaValue)> = None;
        let mut earliest: Option<i64> = None;
        for (key, value) in versions {
            let Some(version) = key.as_i64() else {
                return Err(HbsError::metadata(
                    path,
                    format!("version key '{key}' is not a year"),
                ));
            };
            earliest = Some(earliest.map_or(version, |e| e.min(version)));
            if version <= self.year && selected.is_none_or(|(best, _)| version > best) {
                selected = Some((version, value));
            }
        }
        match (selected, earliest) {
            (Some((_, value)), _) => Ok(value),
            (None, Some(earliest)) => Err(HbsError::MissingVersion {
                path: display_path(path),
                year: self.year,
                earliest,
            }),
            (None, None) => Err(HbsError::metadata(path, "versions mapping is empty")),
        }
    }

    fn merge_keyword_version(&self, map: &MetaMap, path: &str) -> Result<MetaValue> {
        let keyword = MetaKey::Str(self.settings.version_keyword.clone());
        let versions_path = join_path(path, &keyword);
        let versions = match map.get(&keyword) {
            Some(MetaValue::Map(versions)) => versions,
            Some(other) => {
                return Err(HbsError::metadata(
                    versions_path,
                    format!("expected a mapping of years, found {}", other.type_name()),
                ));
            }
            None => return Err(HbsError::metadata(versions_path, "missing versions")),
        };
        let selected = self.select(versions, &versions_path)?;

        let mut merged: MetaMap = map
            .iter()
            .filter(|(key, _)| **key != keyword)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        match selected {
            MetaValue::Null => Ok(MetaValue::Map(merged)),
            MetaValue::Map(version) => {
                for (key, value) in version {
                    merged.insert(key.clone(), value.clone());
                }
                Ok(MetaValue::Map(merged))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Resolves `node` for `year` with the given settings.
pub fn resolve(node: &MetaValue, year: i64, settings: &VersioningSettings) -> Result<MetaValue> {
    VersionResolver::new(settings, year).resolve(node)
}

/// Flattens the `items` mapping of a resolved classification into a list.
///
/// Items with `categories` expand into one entry per category (sorted by
/// category key); keys of the item that a category does not set are copied
/// into it. Every entry records its item name under `item_key`, with
/// surrounding underscores trimmed.
pub fn categorize_items(resolved: MetaValue, settings: &VersioningSettings) -> Result<MetaValue> {
    let MetaValue::Map(mut document) = resolved else {
        return Err(HbsError::metadata(
            &settings.items_keyword,
            "classification must be a mapping",
        ));
    };
    let items_key = MetaKey::Str(settings.items_keyword.clone());
    let items = match document.get(&items_key) {
        Some(MetaValue::Map(items)) => items.clone(),
        Some(other) => {
            return Err(HbsError::metadata(
                &settings.items_keyword,
                format!("expected a mapping of items, found {}", other.type_name()),
            ));
        }
        None => {
            return Err(HbsError::metadata(
                &settings.items_keyword,
                "classification has no items",
            ));
        }
    };

    let category_key = MetaKey::Str(settings.category_keyword.clone());
    let item_key_name = MetaKey::Str(settings.item_key_name.clone());
    let mut flattened = Vec::new();
    for (name, item) in items {
        let item_path = format!("{}.{name}", settings.items_keyword);
        let item = match item {
            MetaValue::Map(item) => item,
            MetaValue::Null => MetaMap::new(),
            other => {
                return Err(HbsError::metadata(
                    item_path,
                    format!("expected a mapping, found {}", other.type_name()),
                ));
            }
        };
        let item_name = name.to_string().trim_matches('_').to_string();
        for mut entry in split_categories(item, &category_key, &item_path)? {
            entry.insert(item_key_name.clone(), MetaValue::Str(item_name.clone()));
            flattened.push(MetaValue::Map(entry));
        }
    }
    document.insert(items_key, MetaValue::Seq(flattened));
    Ok(MetaValue::Map(document))
}

fn split_categories(item: MetaMap, category_key: &MetaKey, path: &str) -> Result<Vec<MetaMap>> {
    let Some(categories) = item.get(category_key) else {
        return Ok(vec![item]);
    };
    let MetaValue::Map(categories) = categories else {
        return Err(HbsError::metadata(
            format!("{path}.{category_key}"),
            "categories must be a mapping",
        ));
    };
    let mut keys: Vec<&MetaKey> = categories.keys().collect();
    keys.sort();

    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let mut entry = match categories.get(key) {
            Some(MetaValue::Map(category)) => category.clone(),
            _ => MetaMap::new(),
        };
        for (shared_key, shared_value) in &item {
            if shared_key != category_key && !entry.contains_key(shared_key) {
                entry.insert(shared_key.clone(), shared_value.clone());
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn join_path(path: &str, key: &MetaKey) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}
