//! Translation of compile-stage failures into a visualizer trace.
//!
//! When the surrounding pipeline fails to compile the user program there is
//! no trace to normalize; this adapter turns the compiler's stderr into a
//! singleton trace whose only entry is an `uncaught_exception` event, so the
//! visualizer can show the diagnostic at the offending line.

use regex::Regex;

use crate::trace::{DiagnosticEvent, Event, FinalTrace, TraceEntry};

const UNKNOWN_COMPILE_ERROR: &str = "unknown compiler error";

/// Build the short-circuit trace for a failed compile.
pub fn compile_error_trace(diagnostics: &str, code: &str, source_filename: &str) -> FinalTrace {
    let (exception_msg, line) = first_diagnostic(diagnostics, source_filename);
    FinalTrace {
        code: code.to_owned(),
        trace: vec![TraceEntry::Diagnostic(DiagnosticEvent {
            event: Event::UncaughtException,
            exception_msg,
            line,
        })],
    }
}

/// Scan compiler stderr for the first line carrying a usable position:
/// a `file:line:col: ... error: ...` diagnostic, or failing that a linker
/// line mentioning an undefined symbol.
fn first_diagnostic(diagnostics: &str, source_filename: &str) -> (String, Option<u64>) {
    let error_re = error_line_regex(source_filename);

    for line in diagnostics.lines() {
        if let Some(caps) = error_re.as_ref().and_then(|re| re.captures(line)) {
            let lineno = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let msg = caps
                .get(3)
                .map_or(UNKNOWN_COMPILE_ERROR, |m| m.as_str())
                .trim()
                .to_owned();
            return (msg, lineno);
        }

        // Linker failures carry no column; the message is the last
        // colon-separated field, and the line number (if any) the second.
        if line.contains("undefined ") {
            let fields: Vec<&str> = line.split(':').collect();
            let msg = fields
                .last()
                .map_or(UNKNOWN_COMPILE_ERROR, |field| field.trim())
                .to_owned();
            let lineno = if fields
                .first()
                .map_or(false, |field| field.contains(source_filename))
            {
                fields.get(1).and_then(|field| field.trim().parse().ok())
            } else {
                None
            };
            return (msg, lineno);
        }
    }

    (UNKNOWN_COMPILE_ERROR.to_owned(), None)
}

/// Matches `<source_filename>:<line>:<col>: ... error: ...`; also catches
/// "fatal error:" since the capture starts at the `error:` token.
fn error_line_regex(source_filename: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"{}:(\d+):(\d+):.+?(error:.*)$",
        regex::escape(source_filename)
    ))
    .ok()
}
