//! Execution points and the normalization pipeline.
//!
//! [`Normalizer::normalize`] drives the whole thing: split the raw stream
//! into records, parse each one, turn it into an [`ExecutionPoint`], then run
//! the filter cascade that drops bogus points, enforces stack coherence
//! between neighbors, names the call/return transitions and fixes up the
//! terminal event.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::encode::{encode, EncodedValue, Heap};
use crate::error::TraceError;
use crate::record::{parse_record, RawRecord, RecordReader};

/// Frame-pointer token of a synthetic frame captured before stack setup.
const INVALID_FRAME_ID: &str = "0x0";

/// Placeholder the runtime emits when it cannot resolve a function name.
const UNRESOLVED_FUNC_NAME: &str = "???";

/// Message attached to the terminal event of a truncated trace.
const CRASH_MSG: &str = "The program crashed before its trace completed.";

/// What one execution point means to the visualizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    StepLine,
    Call,
    Return,
    Exception,
    /// Only produced by the compile-failure adapter.
    UncaughtException,
}

/// One frame of a rendered call stack, outer-to-inner.
#[derive(Clone, Debug, Serialize)]
pub struct RenderedFrame {
    pub func_name: String,
    /// The raw frame-pointer token; unique for the life of the activation.
    pub frame_id: String,
    pub unique_hash: String,
    pub ordered_varnames: Vec<String>,
    pub encoded_locals: BTreeMap<String, EncodedValue>,
    /// True only on the innermost frame.
    pub is_highlighted: bool,
    pub is_parent: bool,
    pub is_zombie: bool,
    pub parent_frame_id_list: Vec<String>,
}

/// A single moment in program execution: line, stack, heap and globals.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionPoint {
    pub line: u64,
    /// Name of the currently executing function (the innermost frame's).
    pub func_name: String,
    pub event: Event,
    pub stack_to_render: Vec<RenderedFrame>,
    pub heap: Heap,
    pub globals: BTreeMap<String, EncodedValue>,
    pub ordered_globals: Vec<String>,
    pub stdout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_msg: Option<String>,
}

impl ExecutionPoint {
    /// Frame-pointer tokens outer-to-inner; the unit the stack heuristics
    /// reason over.
    pub fn frame_ids(&self) -> Vec<&str> {
        self.stack_to_render
            .iter()
            .map(|frame| frame.frame_id.as_str())
            .collect()
    }
}

/// The singleton event produced by the compile-failure adapter.
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticEvent {
    pub event: Event,
    pub exception_msg: String,
    pub line: Option<u64>,
}

/// One entry of the final trace: a normalized execution point, or the
/// synthetic diagnostic emitted when the program never compiled.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum TraceEntry {
    Point(ExecutionPoint),
    Diagnostic(DiagnosticEvent),
}

/// The finished product: user source plus the normalized point sequence.
#[derive(Clone, Debug, Serialize)]
pub struct FinalTrace {
    pub code: String,
    pub trace: Vec<TraceEntry>,
}

impl FinalTrace {
    /// Render as pretty JSON with every object's keys sorted, so identical
    /// inputs always produce byte-identical output.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let value = serde_json::to_value(self)?;
        serde_json::to_string_pretty(&value)
    }
}

/// Configuration for one normalization run.
#[derive(Clone, Debug)]
pub struct Normalizer {
    /// Keep only the first of consecutive same-line `step_line` points,
    /// matching what a line-level debugger would show.
    pub one_record_per_line: bool,
    /// Runtime-crash message reported by the surrounding pipeline; when set,
    /// the terminal event becomes `exception` carrying it.
    pub end_of_trace_error_msg: Option<String>,
    /// Set from another thread to abort at the next record boundary.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            one_record_per_line: true,
            end_of_trace_error_msg: None,
            cancel: None,
        }
    }
}

impl From<&clap::ArgMatches<'_>> for Normalizer {
    fn from(matches: &clap::ArgMatches) -> Self {
        Self {
            end_of_trace_error_msg: matches.value_of("end-of-trace-error-msg").map(Into::into),
            ..Default::default()
        }
    }
}

impl Normalizer {
    /// Run the full pipeline: raw trace text in, final trace out.
    pub fn normalize(&self, raw_trace: &str, code: &str) -> Result<FinalTrace, TraceError> {
        let mut points = Vec::new();
        let mut parse_ok = true;

        for body in RecordReader::new(raw_trace) {
            if self.cancelled() {
                return Err(TraceError::Cancelled);
            }
            let record = match parse_record(&body) {
                Ok(record) => record,
                Err(err) => {
                    // Latch the failure: the points accumulated so far still
                    // flow through the filters, and the terminal event
                    // reports the truncation.
                    log::warn!("bad trace record: {}", err);
                    parse_ok = false;
                    break;
                }
            };
            if let Some(point) = process_record(record)? {
                points.push(point);
            }
        }

        log::debug!("{} execution points before filtering", points.len());

        let points = coarse_filter(points)?;
        let mut points = coherence_filter(points);
        label_events(&mut points);
        self.finish_terminal_event(&mut points, parse_ok);
        let points = if self.one_record_per_line {
            collapse_line_duplicates(points)
        } else {
            points
        };

        log::debug!("{} execution points after filtering", points.len());

        Ok(FinalTrace {
            code: code.to_owned(),
            trace: points.into_iter().map(TraceEntry::Point).collect(),
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    /// Last step of the cascade before de-duplication: the trace ends with a
    /// synthetic program exit, or with an exception if parsing latched a
    /// failure or the surrounding pipeline saw the program crash.
    fn finish_terminal_event(&self, points: &mut [ExecutionPoint], parse_ok: bool) {
        let last = match points.last_mut() {
            Some(last) => last,
            None => return,
        };
        if parse_ok && self.end_of_trace_error_msg.is_none() {
            last.event = Event::Return;
        } else {
            last.event = Event::Exception;
            last.exception_msg = Some(
                self.end_of_trace_error_msg
                    .clone()
                    .unwrap_or_else(|| CRASH_MSG.to_owned()),
            );
        }
    }
}

/// Normalize with default settings; see [`Normalizer`].
pub fn normalize(raw_trace: &str, code: &str) -> Result<FinalTrace, TraceError> {
    Normalizer::default().normalize(raw_trace, code)
}

/// Resolve the user source sitting next to the trace: `<basename>.c`, or
/// `<basename>.cpp` for C++ programs.
pub fn load_source(basename: &str) -> Result<String, TraceError> {
    for ext in &["c", "cpp"] {
        let path = format!("{}.{}", basename, ext);
        if Path::new(&path).is_file() {
            return Ok(fs::read_to_string(path)?);
        }
    }

    Err(TraceError::Source(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no source file at {0}.c or {0}.cpp", basename),
    )))
}

/// Turn one parsed record into an execution point. Records captured before
/// the stack was set up carry no frames and produce nothing.
fn process_record(record: RawRecord) -> Result<Option<ExecutionPoint>, TraceError> {
    if record.stack.is_empty() {
        return Ok(None);
    }

    // The runtime emits frames innermost first; flip so the stack grows
    // downward and the current frame renders last.
    let mut frames = record.stack;
    frames.reverse();

    let mut heap = Heap::new();

    let mut globals = BTreeMap::new();
    for (name, value) in record.globals {
        if let Some(enc) = encode(value, &mut heap)? {
            globals.insert(name, enc);
        }
    }

    let innermost = frames.len() - 1;
    let func_name = frames[innermost].func_name.clone();

    let mut stack_to_render = Vec::with_capacity(frames.len());
    for (idx, frame) in frames.into_iter().enumerate() {
        let mut encoded_locals = BTreeMap::new();
        for (name, value) in frame.locals {
            if let Some(enc) = encode(value, &mut heap)? {
                encoded_locals.insert(name, enc);
            }
        }
        stack_to_render.push(RenderedFrame {
            unique_hash: format!("{}_{}", frame.func_name, frame.fp),
            func_name: frame.func_name,
            frame_id: frame.fp,
            ordered_varnames: frame.ordered_varnames,
            encoded_locals,
            is_highlighted: idx == innermost,
            is_parent: false,
            is_zombie: false,
            parent_frame_id_list: Vec::new(),
        });
    }

    Ok(Some(ExecutionPoint {
        line: record.line,
        func_name,
        event: Event::StepLine,
        stack_to_render,
        heap,
        globals,
        ordered_globals: record.ordered_globals,
        stdout: String::new(),
        exception_msg: None,
    }))
}

/// Pass A: drop points whose frame-pointer vector marks them as garbage.
fn coarse_filter(points: Vec<ExecutionPoint>) -> Result<Vec<ExecutionPoint>, TraceError> {
    let mut kept = Vec::with_capacity(points.len());
    for point in points {
        let ids = point.frame_ids();
        if ids.iter().any(|id| *id == INVALID_FRAME_ID) {
            log::debug!("dropping point at line {}: unset frame pointer", point.line);
            continue;
        }
        // A repeated frame id means some frame's pointer had not been
        // updated yet when the record was captured.
        let mut seen = HashSet::new();
        if !ids.iter().all(|id| seen.insert(*id)) {
            log::debug!(
                "dropping point at line {}: duplicate frame pointer",
                point.line
            );
            continue;
        }
        if point
            .stack_to_render
            .iter()
            .any(|frame| frame.func_name == UNRESOLVED_FUNC_NAME)
        {
            return Err(TraceError::invariant(format!(
                "unresolved function name in retained frame at line {}",
                point.line
            )));
        }
        kept.push(point);
    }
    Ok(kept)
}

/// How one point's frame vector relates to its predecessor's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StackDelta {
    Same,
    Push,
    Pop,
}

fn stack_delta(prev: &ExecutionPoint, cur: &ExecutionPoint) -> Option<StackDelta> {
    let prev_ids = prev.frame_ids();
    let cur_ids = cur.frame_ids();
    if prev_ids == cur_ids {
        Some(StackDelta::Same)
    } else if cur_ids.len() == prev_ids.len() + 1 && cur_ids[..prev_ids.len()] == prev_ids[..] {
        Some(StackDelta::Push)
    } else if prev_ids.len() == cur_ids.len() + 1 && prev_ids[..cur_ids.len()] == cur_ids[..] {
        Some(StackDelta::Pop)
    } else {
        None
    }
}

/// Pass B: enforce stack coherence. A candidate survives only if its frame
/// vector equals the last retained one, extends it by one pushed frame, or
/// drops exactly its last frame. Transient records showing a deeper frame
/// before the caller's vector caught up get discarded here, and the next
/// candidate is compared against the same retained point.
fn coherence_filter(points: Vec<ExecutionPoint>) -> Vec<ExecutionPoint> {
    let mut kept: Vec<ExecutionPoint> = Vec::with_capacity(points.len());
    for point in points {
        let coherent = match kept.last() {
            None => true,
            Some(prev) => stack_delta(prev, &point).is_some(),
        };
        if coherent {
            kept.push(point);
        } else {
            log::debug!("dropping incoherent point at line {}", point.line);
        }
    }
    kept
}

/// Pass C: name the transitions the coherence filter admitted. A pushed
/// frame makes the new point a `call`; a popped frame makes the point before
/// the pop a `return`. Later labels may overwrite earlier ones.
fn label_events(points: &mut [ExecutionPoint]) {
    for i in 1..points.len() {
        match stack_delta(&points[i - 1], &points[i]) {
            Some(StackDelta::Push) => points[i].event = Event::Call,
            Some(StackDelta::Pop) => points[i - 1].event = Event::Return,
            _ => {}
        }
    }
}

/// Pass D tail: keep only the first of a run of `step_line` points sharing a
/// line and frame vector. Runs after all event labeling so call/return
/// boundaries are never collapsed.
fn collapse_line_duplicates(points: Vec<ExecutionPoint>) -> Vec<ExecutionPoint> {
    let mut kept = Vec::with_capacity(points.len());
    let mut prev: Option<(Event, u64, Vec<String>)> = None;
    for point in points {
        let ids: Vec<String> = point
            .frame_ids()
            .iter()
            .map(|id| (*id).to_owned())
            .collect();
        let skip = match &prev {
            Some((event, line, prev_ids)) => {
                *event == Event::StepLine
                    && point.event == Event::StepLine
                    && *line == point.line
                    && *prev_ids == ids
            }
            None => false,
        };
        prev = Some((point.event, point.line, ids));
        if !skip {
            kept.push(point);
        }
    }
    kept
}
