//! Household budget survey tables: dependency tracking, cached builds, and
//! the [`Engine`] entry point.
//!
//! - [`dependencies`]: a table's transitive dependencies and leaf fingerprints
//! - [`factory`]: builds one table for one year, with the result cache
//! - [`engine`]: `load_table`, ad-hoc schemas, weights and decoders
//! - [`calculator`]: subsets, CPI adjustment, averages and quantiles
//! - [`logging`]: `tracing-subscriber` setup for hosts

pub mod calculator;
pub mod dependencies;
pub mod engine;
pub mod factory;
pub mod logging;

pub use calculator::{
    AverageOptions, CpiOptions, EquivalenceScale, QuantileOptions, QuantileSource, SelectOptions,
    weighted_average,
};
pub use dependencies::{Dependency, DependencyGraph, LeafFingerprint, extract_dependencies};
pub use engine::{
    Engine, INPUT_TABLE, LAST_EXTERNAL_WEIGHT_YEAR, NUMBER_OF_MEMBERS_TABLE, SchemaInput,
};
pub use factory::TableFactory;
pub use logging::{LogConfig, LogFormat, init_logging, init_logging_with_writer};

pub use hbs_metadata::{MetaValue, MetadataContext, Settings, YearSpec};
pub use hbs_model::{Dataset, ErrorKind, HbsError, LoadTableSettings, OnMissing, Result, Table};
pub use hbs_transform::{
    AttributeOptions, ClassificationOptions, ClassificationType, FunctionRegistry,
};
