//! Compiles lead-time pipeline definitions into parameterized analytical SQL.
//!
//! A pipeline is an ordered list of stages, each anchored to an event in an
//! issue tracker, an SCM system or a CI/CD system. [`VelocityCompiler`]
//! turns a pipeline plus a [`VelocityQuery`] and per-entity filters into one
//! SQL statement (and, for listings, its count query) with named `:param`
//! placeholders and the bindings for them.

pub mod compiler;
pub mod config;
pub mod error;
pub mod filters;
pub mod model;
pub mod output;

pub use compiler::params::{ParamMap, ParamValue};
pub use compiler::{CompilerSettings, VelocityCompiler};
pub use error::{LeadLensError, Result};
pub use filters::{CriteriaTranslator, FilterTranslator, Translation};
pub use model::{
    Across, Calculation, CompileRequest, CompiledQuery, EntityFilters, Event, EventKind,
    IssueSystem, PipelineConfig, StageDefinition, VelocityQuery,
};
