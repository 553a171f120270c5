//! trendscribe: LLM-backed trend-report generation with persistent caching
//!
//! The subsystem between "the statistics are computed" and "the user reads a
//! report": stable scenario keys, a provider/model fallback chain, a parser
//! that always recovers a well-formed report, and a durable single-flight
//! cache so each scenario is generated at most once however many sessions
//! ask for it.
//!
//! [`service::ReportService`] is the entry point; the remaining modules are
//! exposed for tooling that needs the pieces directly (e.g. running the
//! [`ranker`] over an exported performance log).

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parse;
pub mod prompt;
pub mod ranker;
pub mod report;
pub mod scenario;
pub mod service;

pub use error::{BackendError, ExhaustReason, ReportError};
pub use report::{AnalysisPayload, Confidence, GenerationMetadata, Report};
pub use scenario::{build_key, ScenarioKey, ScenarioParams};
pub use service::{Outcome, ReportService};
