//! Clinical quality services for OctoFHIR
//!
//! This crate provides the data plumbing around a CQL expression engine:
//! - Compiled library caching with write-through on Library updates
//! - Translation of engine retrieves into resource pool searches
//! - Terminology from local ValueSet/CodeSystem pools or a remote server
//! - Clinical quality measure evaluation into MeasureReports
//! - Patient and group level bulk data export
//!
//! The engine and the CQL compiler are supplied by the embedder through
//! [`ExpressionEvaluator`] and [`LibraryCompiler`].

pub mod bulk_export;
pub mod compartment;
pub mod config;
pub mod data_provider;
pub mod date;
pub mod engine;
pub mod error;
pub mod library_cache;
pub mod measure;
pub mod measure_evaluator;
pub mod observability;
pub mod remote_terminology;
pub mod service;
pub mod terminology_provider;

#[cfg(test)]
pub(crate) mod testing;

pub use bulk_export::{BulkExportOutcome, BulkExportRequest, BulkExporter};
pub use config::{CqfConfig, FailurePolicy};
pub use data_provider::{DateInterval, RetrieveRequest, RetrieveTranslator};
pub use engine::{EvaluationContext, ExpressionEvaluator, ExpressionValue};
pub use error::{CompilerDiagnostic, CqfError, CqfResult};
pub use library_cache::{CompiledLibrary, LibraryCache, LibraryCompiler, VersionedLibraryId};
pub use measure::{MeasureReport, ReportType};
pub use measure_evaluator::{EvaluateMeasureRequest, MeasureEvaluator};
pub use service::CqfService;
pub use terminology_provider::{Code, TerminologyProvider};
