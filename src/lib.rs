//! Control-flow and dataflow analysis substrate for JVM bytecode
//! analyzers.
//!
//! The crate turns a decoded method body into a [`cfg::Cfg`], runs
//! [`dataflow::Domain`] specializations over it with a shared worklist
//! engine, and ships the specializations bug detectors lean on most:
//! value numbering ([`valnum`]), resource-leak tracking ([`resource`]),
//! integer ranges for array bounds ([`bounds`]) and an interprocedural
//! side-effect pass ([`callgraph`]). [`engine::AnalysisSession`] ties
//! them together per class, skipping methods whose analysis fails.

use thiserror::Error;

pub mod bounds;
pub mod callgraph;
pub mod cfg;
pub mod dataflow;
pub mod descriptor;
pub mod engine;
pub mod ir;
pub mod resource;
mod solver;
#[cfg(test)]
pub(crate) mod testkit;
pub mod valnum;

pub use cfg::{BasicBlock, BlockId, Cfg, Edge, EdgeId, EdgeKind, Location};
pub use dataflow::{analyze, AnalysisConfig, DataflowResult, Direction, Domain};
pub use engine::{AnalysisSession, Finding, ReportSink, Severity};

/// Failures the analysis substrate reports instead of guessing around.
#[derive(Debug, Error)]
pub enum Error {
    /// The body violates bytecode structure the analyses rely on.
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),
    /// Control flow could not be resolved into a usable CFG.
    #[error("unresolved control flow: {0}")]
    UnresolvedControlFlow(String),
    /// A fixed-point run exceeded its visit budget, which signals a
    /// defective domain rather than a slow method.
    #[error("{analysis} analysis diverged after {visits} block visits")]
    Diverged {
        analysis: &'static str,
        visits: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
