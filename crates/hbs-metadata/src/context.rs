//! The metadata context: settings plus the named metadata documents.
//!
//! A context is built explicitly and passed to every component that needs
//! metadata. Packaged documents are compiled into the crate; files named
//! `{local_metadata_directory}/{document}.yaml` replace their top-level keys.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use hbs_model::{HbsError, Result};

use crate::resolver::VersionResolver;
use crate::settings::{DataPaths, Settings};
use crate::value::{MetaKey, MetaValue};
use crate::years::SurveySpan;

/// Entries of the tables document that are not tables.
pub const RESERVED_TABLE_KEYS: &[&str] = &["default_table_settings", "yearly_table_availability"];

/// The named metadata documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Raw table layouts: file codes and column descriptors.
    Tables,
    /// Derived table definitions.
    Schema,
    /// Household ID layout and attribute labels.
    Household,
    /// Commodity classifications.
    Commodities,
    /// Occupation classifications.
    Occupations,
    /// Geographic references.
    Maps,
    /// External datasets and miscellaneous constants.
    Other,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 7] = [
        Self::Tables,
        Self::Schema,
        Self::Household,
        Self::Commodities,
        Self::Occupations,
        Self::Maps,
        Self::Other,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Tables => "tables",
            Self::Schema => "schema",
            Self::Household => "household",
            Self::Commodities => "commodities",
            Self::Occupations => "occupations",
            Self::Maps => "maps",
            Self::Other => "other",
        }
    }

    fn packaged_text(self) -> &'static str {
        match self {
            Self::Tables => include_str!("../metadata/tables.yaml"),
            Self::Schema => include_str!("../metadata/schema.yaml"),
            Self::Household => include_str!("../metadata/household.yaml"),
            Self::Commodities => include_str!("../metadata/commodities.yaml"),
            Self::Occupations => include_str!("../metadata/occupations.yaml"),
            Self::Maps => include_str!("../metadata/maps.yaml"),
            Self::Other => include_str!("../metadata/other.yaml"),
        }
    }

    /// Parses the packaged copy of this document.
    pub fn packaged(self) -> Result<MetaValue> {
        let value = MetaValue::from_yaml_str(self.packaged_text(), self.name())?;
        Ok(if value.is_null() {
            MetaValue::empty_map()
        } else {
            value
        })
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings and metadata documents shared by one engine.
#[derive(Debug, Clone)]
pub struct MetadataContext {
    settings: Settings,
    documents: HashMap<DocumentKind, MetaValue>,
}

impl MetadataContext {
    /// Loads settings overrides, packaged documents, and local document overrides.
    pub fn load() -> Result<Self> {
        Self::with_settings(Settings::load()?)
    }

    /// Packaged documents with local overrides from `settings`.
    pub fn with_settings(settings: Settings) -> Result<Self> {
        let mut ctx = Self {
            settings,
            documents: HashMap::new(),
        };
        ctx.reload()?;
        Ok(ctx)
    }

    /// Packaged documents only; local override files are not read.
    pub fn packaged(settings: Settings) -> Result<Self> {
        let mut documents = HashMap::new();
        for kind in DocumentKind::ALL {
            documents.insert(kind, kind.packaged()?);
        }
        Ok(Self {
            settings,
            documents,
        })
    }

    /// A context over the given documents; absent documents are empty.
    pub fn from_documents(
        settings: Settings,
        documents: impl IntoIterator<Item = (DocumentKind, MetaValue)>,
    ) -> Self {
        let mut map: HashMap<DocumentKind, MetaValue> = documents.into_iter().collect();
        for kind in DocumentKind::ALL {
            map.entry(kind).or_insert_with(MetaValue::empty_map);
        }
        Self {
            settings,
            documents: map,
        }
    }

    /// Re-reads packaged documents and local overrides. Settings are kept.
    pub fn reload(&mut self) -> Result<()> {
        let local_dir = self.settings.local_metadata_directory.clone();
        for kind in DocumentKind::ALL {
            let mut document = kind.packaged()?;
            apply_local_override(&mut document, kind, &local_dir)?;
            self.documents.insert(kind, document);
        }
        tracing::debug!(dir = %local_dir.display(), "metadata documents loaded");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn span(&self) -> SurveySpan {
        self.settings.span()
    }

    pub fn paths(&self) -> DataPaths {
        self.settings.paths()
    }

    pub fn document(&self, kind: DocumentKind) -> &MetaValue {
        // every kind is inserted on construction
        static EMPTY: MetaValue = MetaValue::Null;
        self.documents.get(&kind).unwrap_or(&EMPTY)
    }

    pub fn set_document(&mut self, kind: DocumentKind, document: MetaValue) {
        self.documents.insert(kind, document);
    }

    pub fn with_document(mut self, kind: DocumentKind, document: MetaValue) -> Self {
        self.set_document(kind, document);
        self
    }

    /// Inserts or replaces one top-level entry of a document.
    pub fn set_entry(&mut self, kind: DocumentKind, key: &str, value: MetaValue) {
        let document = self
            .documents
            .entry(kind)
            .or_insert_with(MetaValue::empty_map);
        if !matches!(document, MetaValue::Map(_)) {
            *document = MetaValue::empty_map();
        }
        if let Some(map) = document.as_map_mut() {
            map.insert(MetaKey::from(key), value);
        }
    }

    pub fn tables(&self) -> &MetaValue {
        self.document(DocumentKind::Tables)
    }

    pub fn schema(&self) -> &MetaValue {
        self.document(DocumentKind::Schema)
    }

    pub fn resolver(&self, year: i64) -> VersionResolver<'_> {
        VersionResolver::new(&self.settings.versioning, year)
    }

    /// Resolves the node at `path` (top-level key first) of a document.
    ///
    /// Returns `None` when the path does not exist.
    pub fn resolve(&self, kind: DocumentKind, path: &[&str], year: i64) -> Result<Option<MetaValue>> {
        let mut node = self.document(kind);
        for key in path {
            match node.get(key) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        let dotted = std::iter::once(kind.name())
            .chain(path.iter().copied())
            .collect::<Vec<_>>()
            .join(".");
        self.resolver(year).resolve_at(node, &dotted).map(Some)
    }

    /// Names of the base tables, in document order.
    pub fn base_table_names(&self) -> Vec<String> {
        self.tables()
            .as_map()
            .map(|map| {
                map.keys()
                    .filter_map(MetaKey::as_str)
                    .filter(|name| !RESERVED_TABLE_KEYS.contains(name))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_base_table(&self, name: &str) -> bool {
        !RESERVED_TABLE_KEYS.contains(&name) && self.tables().contains_key(name)
    }

    /// The unresolved schema node of `name`.
    pub fn schema_node(&self, name: &str) -> Option<&MetaValue> {
        self.schema().get(name)
    }

    /// The schema node of `name` resolved for `year`.
    pub fn resolved_schema_node(&self, name: &str, year: i64) -> Result<Option<MetaValue>> {
        self.resolve(DocumentKind::Schema, &[name], year)
    }
}

fn apply_local_override(document: &mut MetaValue, kind: DocumentKind, dir: &Path) -> Result<()> {
    let path = dir.join(format!("{}.yaml", kind.name()));
    if !path.is_file() {
        return Ok(());
    }
    let text = fs::read_to_string(&path).map_err(|e| HbsError::io(&path, e))?;
    let local = MetaValue::from_yaml_str(&text, &path.display().to_string())?;
    let Some(local) = local.into_map() else {
        return Err(HbsError::metadata(
            path.display().to_string(),
            "local metadata must be a mapping",
        ));
    };
    if let Some(map) = document.as_map_mut() {
        for (key, value) in local {
            map.insert(key, value);
        }
    } else {
        *document = MetaValue::Map(local);
    }
    tracing::info!(document = %kind, path = %path.display(), "applied local metadata overrides");
    Ok(())
}
