//! Reading and parsing of raw `.vgtrace` streams.
//!
//! A raw trace is UTF-8 text: JSON record bodies separated by lines equal to
//! [`RECORD_SEPARATOR`], with any stdout the traced program produced
//! interleaved as `STDOUT:`-prefixed lines.

use std::collections::BTreeMap;
use std::str::Lines;

use serde::Deserialize;
use serde_json::Value;

/// Separator line written by the instrumented runtime after every record.
pub const RECORD_SEPARATOR: &str = "=== pg_trace_inst ===";

/// Prefix marking captured program stdout interleaved into the trace stream.
const STDOUT_PREFIX: &str = "STDOUT:";

/// One execution-point record as emitted by the instrumented runtime.
#[derive(Clone, Debug, Deserialize)]
pub struct RawRecord {
    /// Source line number at this point.
    pub line: u64,
    /// Frames as emitted: innermost first. The processor reverses this so
    /// the currently executing frame comes last.
    pub stack: Vec<RawFrame>,
    #[serde(default)]
    pub globals: BTreeMap<String, RawValue>,
    #[serde(default)]
    pub ordered_globals: Vec<String>,
}

/// A single activation frame within a raw record.
#[derive(Clone, Debug, Deserialize)]
pub struct RawFrame {
    pub func_name: String,
    /// Frame-pointer token. `"0x0"` marks a synthetic frame captured before
    /// the prologue finished; such points are filtered out downstream.
    #[serde(rename = "FP")]
    pub fp: String,
    /// Local variable names in display order.
    pub ordered_varnames: Vec<String>,
    pub locals: BTreeMap<String, RawValue>,
}

/// A raw value tree, discriminated on `kind`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawValue {
    /// A scalar.
    Base {
        addr: String,
        #[serde(rename = "type")]
        ty: String,
        val: Value,
    },
    /// A pointer; `val` is the target address token.
    Pointer {
        addr: String,
        val: String,
        /// The pointed-to value. Never rendered inline; it is walked only so
        /// that heap blocks inside it land in the heap map.
        #[serde(default)]
        deref_val: Option<Box<RawValue>>,
    },
    Struct {
        addr: String,
        #[serde(rename = "type")]
        ty: String,
        val: BTreeMap<String, RawValue>,
    },
    Array {
        addr: String,
        val: Vec<RawValue>,
    },
    /// Transparent wrapper: the outer `type` wins over the inner value's.
    Typedef {
        #[serde(rename = "type")]
        ty: String,
        val: Box<RawValue>,
    },
    /// A dynamically allocated block. Keyed into the heap map by `addr`
    /// instead of appearing as a value.
    HeapBlock {
        addr: String,
        val: Vec<RawValue>,
    },
    /// Tripwire for record kinds this crate does not know about; rejected by
    /// the encoder instead of being silently dropped.
    #[serde(other)]
    Unknown,
}

impl RawValue {
    /// The address token of this value, looking through typedef wrappers.
    pub fn addr(&self) -> Option<&str> {
        match self {
            RawValue::Base { addr, .. }
            | RawValue::Pointer { addr, .. }
            | RawValue::Struct { addr, .. }
            | RawValue::Array { addr, .. }
            | RawValue::HeapBlock { addr, .. } => Some(addr),
            RawValue::Typedef { val, .. } => val.addr(),
            RawValue::Unknown => None,
        }
    }

    /// Rewrite this value's type token, as unwrapping a typedef does. Kinds
    /// without a type token pass through unchanged; for chained typedefs the
    /// outermost name wins.
    pub fn with_type(self, ty: String) -> RawValue {
        match self {
            RawValue::Base { addr, val, .. } => RawValue::Base { addr, ty, val },
            RawValue::Struct { addr, val, .. } => RawValue::Struct { addr, ty, val },
            RawValue::Typedef { val, .. } => RawValue::Typedef { ty, val },
            other => other,
        }
    }
}

/// Parse one buffered record body.
pub fn parse_record(body: &str) -> Result<RawRecord, serde_json::Error> {
    serde_json::from_str(body)
}

/// Iterator over the record bodies of a raw trace stream.
///
/// Yields each body as a single string with per-line whitespace stripped.
/// `STDOUT:` lines and blank lines contribute nothing; a buffer that
/// collects no lines before its separator is an empty record and is not
/// yielded at all. The unterminated buffer after the last separator is
/// yielded like any other record.
pub struct RecordReader<'a> {
    lines: Lines<'a>,
    done: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            lines: raw.lines(),
            done: false,
        }
    }
}

impl Iterator for RecordReader<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }

        let mut buf: Vec<&str> = Vec::new();
        loop {
            let line = match self.lines.next() {
                Some(line) => line.trim(),
                None => {
                    self.done = true;
                    if buf.is_empty() {
                        return None;
                    }
                    return Some(buf.join("\n"));
                }
            };

            if line == RECORD_SEPARATOR {
                if buf.is_empty() {
                    // An empty record is a no-op, not an error.
                    continue;
                }
                return Some(buf.join("\n"));
            }

            if line.is_empty() || line.starts_with(STDOUT_PREFIX) {
                continue;
            }

            buf.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies(raw: &str) -> Vec<String> {
        RecordReader::new(raw).collect()
    }

    #[test]
    fn test_reader_splits_on_separator() {
        let raw = "{\"a\": 1}\n=== pg_trace_inst ===\n{\"b\": 2}\n=== pg_trace_inst ===\n";
        assert_eq!(bodies(raw), vec!["{\"a\": 1}", "{\"b\": 2}"]);
    }

    #[test]
    fn test_reader_yields_final_unterminated_buffer() {
        let raw = "{\"a\": 1}\n=== pg_trace_inst ===\n{\"b\":\n2}";
        assert_eq!(bodies(raw), vec!["{\"a\": 1}", "{\"b\":\n2}"]);
    }

    #[test]
    fn test_reader_skips_stdout_and_blank_lines() {
        let raw = "STDOUT:hello\n{\"a\":\nSTDOUT: more output\n\n1}\n=== pg_trace_inst ===\n";
        assert_eq!(bodies(raw), vec!["{\"a\":\n1}"]);
    }

    #[test]
    fn test_reader_trims_lines() {
        let raw = "  {\"a\": 1}  \n   === pg_trace_inst ===   \n";
        assert_eq!(bodies(raw), vec!["{\"a\": 1}"]);
    }

    #[test]
    fn test_reader_skips_empty_records() {
        let raw = "=== pg_trace_inst ===\n\n=== pg_trace_inst ===\n{\"a\": 1}\n=== pg_trace_inst ===\n";
        assert_eq!(bodies(raw), vec!["{\"a\": 1}"]);
    }

    #[test]
    fn test_reader_empty_input() {
        assert!(bodies("").is_empty());
        assert!(bodies("\n\n").is_empty());
    }

    #[test]
    fn test_parse_record_full() {
        let body = r#"{
            "line": 4,
            "stack": [
                {
                    "func_name": "foo",
                    "FP": "0xB",
                    "ordered_varnames": ["x"],
                    "locals": {"x": {"kind": "base", "addr": "0x1", "type": "int", "val": 42}}
                },
                {
                    "func_name": "main",
                    "FP": "0xA",
                    "ordered_varnames": [],
                    "locals": {}
                }
            ],
            "globals": {"g": {"kind": "base", "addr": "0x2", "type": "char", "val": "c"}},
            "ordered_globals": ["g"]
        }"#;

        let record = parse_record(body).expect("record should parse");
        assert_eq!(record.line, 4);
        assert_eq!(record.stack.len(), 2);
        // innermost first, exactly as emitted
        assert_eq!(record.stack[0].func_name, "foo");
        assert_eq!(record.stack[0].fp, "0xB");
        assert_eq!(record.stack[1].func_name, "main");
        assert_eq!(record.ordered_globals, vec!["g"]);
        assert!(record.globals.contains_key("g"));
        match &record.stack[0].locals["x"] {
            RawValue::Base { addr, ty, val } => {
                assert_eq!(addr, "0x1");
                assert_eq!(ty, "int");
                assert_eq!(*val, serde_json::json!(42));
            }
            other => panic!("expected base value, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_record_defaults() {
        let record = parse_record(r#"{"line": 1, "stack": []}"#).expect("record should parse");
        assert!(record.globals.is_empty());
        assert!(record.ordered_globals.is_empty());
    }

    #[test]
    fn test_parse_record_malformed() {
        assert!(parse_record("definitely not json").is_err());
        assert!(parse_record(r#"{"stack": []}"#).is_err());
    }

    #[test]
    fn test_parse_unrecognized_kind() {
        let body = r#"{
            "line": 1,
            "stack": [{
                "func_name": "main",
                "FP": "0xA",
                "ordered_varnames": ["x"],
                "locals": {"x": {"kind": "quaternion", "addr": "0x1"}}
            }]
        }"#;

        let record = parse_record(body).expect("unknown kinds still parse");
        assert!(matches!(record.stack[0].locals["x"], RawValue::Unknown));
    }

    #[test]
    fn test_addr_looks_through_typedefs() {
        let value = RawValue::Typedef {
            ty: "size_t".to_owned(),
            val: Box::new(RawValue::Base {
                addr: "0x8".to_owned(),
                ty: "unsigned long".to_owned(),
                val: serde_json::json!(0),
            }),
        };
        assert_eq!(value.addr(), Some("0x8"));
    }
}
