//! Normalize raw execution traces from an instrumented memory checker into
//! line-oriented debugger traces for a step-through visualizer.
//!
//! The raw `.vgtrace` stream is a sequence of JSON records separated by
//! `=== pg_trace_inst ===` lines, each capturing the source line, call
//! stack, locals, globals and heap contents at one execution point.
//! [`normalize`] turns that stream into the final `{ code, trace }` object;
//! [`compile_error_trace`] builds the short-circuit variant for programs
//! that never compiled.

pub mod diagnostics;
pub mod encode;
pub mod error;
pub mod record;
pub mod trace;

pub use crate::diagnostics::compile_error_trace;
pub use crate::error::TraceError;
pub use crate::trace::{load_source, normalize, FinalTrace, Normalizer};
