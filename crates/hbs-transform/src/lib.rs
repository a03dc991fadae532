//! Schema instructions for the household budget survey tables.
//!
//! - [`pipeline`]: runs a table's `instructions` list step by step
//! - [`expression`]: the formula and filter language used by those steps
//! - [`decoder`]: household attributes from IDs, classifications from codes
//! - [`functions`]: registered whole-table functions
//! - [`provider`]: access to other built tables for `join` and `add_weights`
//! - [`concat`]: stacking tables while keeping provenance

pub mod concat;
pub mod decoder;
pub mod expression;
pub mod functions;
pub mod pipeline;
pub mod provider;

pub use concat::concat_tables;
pub use decoder::{
    AttributeOptions, ClassificationOptions, ClassificationType, add_attribute, add_classification,
};
pub use expression::{Expression, ExpressionError};
pub use functions::{FunctionRegistry, NUMBER_OF_MEMBERS, TableFunction, number_of_members};
pub use pipeline::{Pipeline, Step, join_on};
pub use provider::TableProvider;
