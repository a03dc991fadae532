//! Year-versioned metadata for the household budget survey.
//!
//! - [`value`]: the tagged metadata value read from YAML
//! - [`resolver`]: picks the version of a node that applies to a year
//! - [`number_set`]: integer sets from mixed range specifications
//! - [`years`]: year specifications and table availability
//! - [`settings`]: packaged TOML settings and data paths
//! - [`context`]: settings plus the metadata documents, with reload

pub mod context;
pub mod number_set;
pub mod resolver;
pub mod settings;
pub mod value;
pub mod years;

pub use context::{DocumentKind, MetadataContext, RESERVED_TABLE_KEYS};
pub use number_set::{NumberSet, RangeOptions, StepRange};
pub use resolver::{VersionResolver, VersioningSettings, categorize_items, resolve};
pub use settings::{ColumnSettings, DataPaths, DirectorySettings, Settings};
pub use value::{MetaKey, MetaMap, MetaValue};
pub use years::{SurveySpan, YearSpec, construct_table_year_pairs, normalize_year, parse_years};
