//! Structural JSON comparison
//!
//! Decides whether what a cluster returns already satisfies a declared body.
//! Object key order never matters. Arrays compare element by element, and
//! trailing elements the cluster adds make the observed array a superset.

use serde_json::{Number, Value};

/// Relation between an observed and a desired document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match {
    /// Both documents are structurally identical
    Full,
    /// The observed document contains everything desired, and more
    Superset,
    /// Something desired is missing or different
    None,
}

impl Match {
    /// Whether the observed document satisfies the desired one
    pub fn is_satisfied(self) -> bool {
        matches!(self, Match::Full | Match::Superset)
    }
}

/// Compare `observed` against `desired`.
pub fn compare(observed: &Value, desired: &Value) -> Match {
    if !contains(observed, desired) {
        return Match::None;
    }
    if values_equal(observed, desired) {
        Match::Full
    } else {
        Match::Superset
    }
}

/// Compare raw bodies. Unparsable observed or desired JSON never matches.
pub fn compare_bytes(observed: &[u8], desired: &[u8]) -> Match {
    let desired: Value = if desired.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        match serde_json::from_slice(desired) {
            Ok(v) => v,
            Err(_) => return Match::None,
        }
    };
    match serde_json::from_slice::<Value>(observed) {
        Ok(observed) => compare(&observed, &desired),
        Err(_) => Match::None,
    }
}

/// Whether every member of `desired` is present in `observed` with a
/// contained value.
fn contains(observed: &Value, desired: &Value) -> bool {
    match (observed, desired) {
        (Value::Object(o), Value::Object(d)) => d
            .iter()
            .all(|(k, dv)| o.get(k).map(|ov| contains(ov, dv)).unwrap_or(false)),
        (Value::Array(o), Value::Array(d)) => {
            o.len() >= d.len() && o.iter().zip(d).all(|(ov, dv)| contains(ov, dv))
        }
        _ => values_equal(observed, desired),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, xv)| y.get(k).map(|yv| values_equal(xv, yv)).unwrap_or(false))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(xv, yv)| values_equal(xv, yv))
        }
        _ => a == b,
    }
}

/// Integers compare exactly; floats only when either side is one.
fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    if !x.is_f64() && !y.is_f64() {
        // one negative, one above i64::MAX
        return false;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
