//! Flattening raw value trees into the visualizer's encoded form.
//!
//! Encoding walks a [`RawValue`] tree and produces positional tuples:
//! `["C_DATA", addr, type, val]` for scalars and pointers,
//! `["C_STRUCT", addr, type, [member, value]...]` for structs, and
//! `["C_ARRAY", addr, value...]` for arrays and heap blocks. Heap blocks are
//! never returned inline; they are collected into a per-record heap map as a
//! side effect of the walk.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

use crate::error::TraceError;
use crate::record::RawValue;

/// Heap blocks encountered while encoding one record, keyed by address.
pub type Heap = BTreeMap<String, EncodedValue>;

/// Upper bound on value-tree recursion. Parsed records are trees, so this is
/// only reachable through pathological pointer chains; past it the encoder
/// stops recursing instead of overflowing the stack.
const MAX_ENCODE_DEPTH: usize = 64;

/// An encoded value in the visualizer's positional-tuple form.
#[derive(Clone, Debug, PartialEq)]
pub enum EncodedValue {
    /// `["C_DATA", addr, type, val]`; pointers use the type `"pointer"` and
    /// carry their target address token as `val`.
    Data { addr: String, ty: String, val: Value },
    /// `["C_STRUCT", addr, type, [member, value]...]` in member-address
    /// order.
    Struct {
        addr: String,
        ty: String,
        members: Vec<(String, EncodedValue)>,
    },
    /// `["C_ARRAY", addr, value...]` in index order.
    Array {
        addr: String,
        elems: Vec<EncodedValue>,
    },
}

impl Serialize for EncodedValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            EncodedValue::Data { addr, ty, val } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("C_DATA")?;
                seq.serialize_element(addr)?;
                seq.serialize_element(ty)?;
                seq.serialize_element(val)?;
                seq.end()
            }
            EncodedValue::Struct { addr, ty, members } => {
                let mut seq = serializer.serialize_seq(Some(3 + members.len()))?;
                seq.serialize_element("C_STRUCT")?;
                seq.serialize_element(addr)?;
                seq.serialize_element(ty)?;
                for member in members {
                    seq.serialize_element(member)?;
                }
                seq.end()
            }
            EncodedValue::Array { addr, elems } => {
                let mut seq = serializer.serialize_seq(Some(2 + elems.len()))?;
                seq.serialize_element("C_ARRAY")?;
                seq.serialize_element(addr)?;
                for elem in elems {
                    seq.serialize_element(elem)?;
                }
                seq.end()
            }
        }
    }
}

/// Encode one raw value, collecting any heap blocks into `heap`.
///
/// Returns `Ok(None)` for a heap block (it lives in the heap map, not in the
/// value position) and for children cut off by the recursion bound.
pub fn encode(value: RawValue, heap: &mut Heap) -> Result<Option<EncodedValue>, TraceError> {
    encode_depth(value, heap, 0)
}

fn encode_depth(
    value: RawValue,
    heap: &mut Heap,
    depth: usize,
) -> Result<Option<EncodedValue>, TraceError> {
    if depth > MAX_ENCODE_DEPTH {
        log::warn!(
            "value tree deeper than {} levels, not encoding any further",
            MAX_ENCODE_DEPTH
        );
        return Ok(None);
    }

    match value {
        RawValue::Base { addr, ty, val } => Ok(Some(EncodedValue::Data { addr, ty, val })),

        RawValue::Pointer {
            addr,
            val,
            deref_val,
        } => {
            // The dereferenced value never appears inline; walk it only for
            // the heap blocks it may contain.
            if let Some(target) = deref_val {
                encode_depth(*target, heap, depth + 1)?;
            }
            Ok(Some(EncodedValue::Data {
                addr,
                ty: "pointer".to_owned(),
                val: Value::String(val),
            }))
        }

        RawValue::Struct { addr, ty, val } => {
            // Members render in memory order, not declaration order.
            let mut raw_members: Vec<(String, RawValue)> = val.into_iter().collect();
            raw_members.sort_by(|(_, a), (_, b)| addr_order(a.addr(), b.addr()));

            let mut members = Vec::with_capacity(raw_members.len());
            for (name, member) in raw_members {
                if let Some(enc) = encode_depth(member, heap, depth + 1)? {
                    members.push((name, enc));
                }
            }
            Ok(Some(EncodedValue::Struct { addr, ty, members }))
        }

        RawValue::Array { addr, val } => {
            let mut elems = Vec::with_capacity(val.len());
            for elem in val {
                if let Some(enc) = encode_depth(elem, heap, depth + 1)? {
                    elems.push(enc);
                }
            }
            Ok(Some(EncodedValue::Array { addr, elems }))
        }

        RawValue::Typedef { ty, val } => encode_depth((*val).with_type(ty), heap, depth + 1),

        RawValue::HeapBlock { addr, val } => {
            let mut elems = Vec::with_capacity(val.len());
            for elem in val {
                if let Some(enc) = encode_depth(elem, heap, depth + 1)? {
                    elems.push(enc);
                }
            }
            let block = EncodedValue::Array {
                addr: addr.clone(),
                elems,
            };
            if heap.insert(addr.clone(), block).is_some() {
                return Err(TraceError::invariant(format!(
                    "heap block at {} described twice in one record",
                    addr
                )));
            }
            Ok(None)
        }

        RawValue::Unknown => Err(TraceError::invariant("unrecognized value kind in record")),
    }
}

/// Memory order for struct members: numeric when both addresses parse as hex
/// tokens, lexicographic otherwise. Stable sort upstream breaks ties by
/// member name.
fn addr_order(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a.and_then(parse_addr), b.and_then(parse_addr)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(&b),
    }
}

fn parse_addr(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}
