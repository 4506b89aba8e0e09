//! Filterscan: the filter/query execution core of an embedded structured
//! search engine.
//!
//! A filter expression arrives here already compiled into a postfix
//! [`Program`]. The crate executes it three ways, cheapest first:
//!
//! - The `plan` module statically analyzes the program into a sequence of
//!   [`ScanStep`]s, each of which can be answered by an index lookup and a
//!   set operation instead of touching every record.
//! - The `exec` module pattern-matches small common program shapes
//!   (constant, column fetch, simple comparison, simple regexp) and installs
//!   a specialized per-record evaluation closure.
//! - The `vm` module is the general stack-machine evaluator with full
//!   operator semantics, used per record when nothing faster applies.
//!
//! The `scan` module drives a whole table select: it consumes a scan plan,
//! tries the index strategy for each step, and falls back to sequential
//! evaluation over the relevant program sub-range when an index cannot
//! answer. Index, table and column storage are abstract interfaces in
//! `access`; `memory` provides in-process reference implementations.

mod access;
mod exec;
mod memory;
mod plan;
mod procs;
mod program;
mod result;
mod scan;
mod schema;
mod types;
mod vm;

pub use access::*;
pub use exec::*;
pub use memory::*;
pub use plan::*;
pub use procs::*;
pub use program::*;
pub use result::*;
pub use scan::*;
pub use schema::*;
pub use types::*;
pub use vm::*;

use thiserror::Error;

/// Unified error type for filterscan operations.
///
/// Per-record evaluation errors (casts, zero division, unsettable targets)
/// are soft: the driver scores the record zero and continues. Errors for
/// which [`Error::is_fatal`] returns true indicate a malformed program and
/// abort the whole scan.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot cast {from:?} to {to:?}")]
    TypeCast { from: DataKind, to: DataKind },

    #[error("divided by zero")]
    DivisionByZero,

    #[error("operator {0:?} is not executable")]
    UnknownOperator(Operator),

    #[error("stack underflow at instruction {0}")]
    StackUnderflow(usize),

    #[error("malformed program: {0}")]
    MalformedProgram(String),

    #[error("assignment target is not settable")]
    NotSettable,

    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("procedure '{0}' not found")]
    ProcedureNotFound(String),

    #[error("index unavailable: {0}")]
    IndexUnavailable(&'static str),

    #[error("selector '{name}' failed: {message}")]
    Selector { name: String, message: String },
}

impl Error {
    /// Whether this error must abort the surrounding scan instead of
    /// excluding a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownOperator(_) | Error::StackUnderflow(_) | Error::MalformedProgram(_)
        )
    }
}

/// Result type alias for filterscan operations.
pub type Result<T> = std::result::Result<T, Error>;
