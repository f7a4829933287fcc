//! Host data bridge.
//!
//! The embedding sequencer keeps step and pattern data as JSON; this module
//! converts such documents into script-visible values and back. JSON
//! objects become runtime objects, arrays become boxed lists, booleans
//! become `0`/`1` numbers and `null` becomes nil. Callables have no JSON
//! form and fail to convert back.

use std::collections::HashMap;

use crate::heap::Heap;
use crate::value::Value;
use crate::vm::{RuntimeError, RuntimeErrorKind, VM};
use crate::{Error, ParseError, ParseErrorKind};

/// Convert a parsed JSON document into a runtime value, allocating through
/// the collector.
pub fn value_from_json(json: &serde_json::Value, heap: &mut Heap) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Number(if *b { 1.0 } else { 0.0 }),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => heap.alloc_str(s),
        serde_json::Value::Array(items) => {
            let values: Vec<Value> = items
                .iter()
                .map(|item| value_from_json(item, heap))
                .collect();
            heap.alloc_list(values)
        }
        serde_json::Value::Object(map) => {
            let mut object = HashMap::new();
            for (key, item) in map {
                let symbol = heap.intern(key);
                let value = value_from_json(item, heap);
                object.insert(symbol, value);
            }
            heap.alloc_object(object)
        }
    }
}

/// Convert a runtime value back to JSON for the host. Proper lists and
/// boxed lists become arrays; callables are not representable.
pub fn value_to_json(value: Value, heap: &Heap) -> Result<serde_json::Value, RuntimeError> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Number(n) => number_to_json(n)?,
        Value::Symbol(s) => serde_json::Value::String(heap.symbol_name(s).to_string()),
        Value::Str(r) => serde_json::Value::String(heap.string(r).unwrap_or("").to_string()),
        Value::Cons(_) => {
            let mut items = Vec::new();
            let mut current = value;
            loop {
                match current {
                    Value::Nil => break,
                    Value::Cons(r) => match heap.cons(r) {
                        Some((car, cdr)) => {
                            items.push(value_to_json(car, heap)?);
                            current = cdr;
                        }
                        None => {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::InvalidType,
                                "stale heap reference",
                            ));
                        }
                    },
                    other => {
                        return Err(RuntimeError::new(
                            RuntimeErrorKind::TypeMismatch,
                            format!("improper list has no JSON form: {}", other.type_name()),
                        ));
                    }
                }
            }
            serde_json::Value::Array(items)
        }
        Value::List(r) => {
            let mut items = Vec::new();
            for &item in heap.list(r).unwrap_or(&[]) {
                items.push(value_to_json(item, heap)?);
            }
            serde_json::Value::Array(items)
        }
        Value::Vector(r) => {
            let mut items = Vec::new();
            for &x in heap.vector(r).unwrap_or(&[]) {
                items.push(number_to_json(f64::from(x))?);
            }
            serde_json::Value::Array(items)
        }
        Value::Object(r) => {
            let mut entries: Vec<(&str, Value)> = heap
                .object(r)
                .map(|map| {
                    map.iter()
                        .map(|(k, v)| (heap.symbol_name(*k), *v))
                        .collect()
                })
                .unwrap_or_default();
            entries.sort_by_key(|(name, _)| *name);
            let mut object = serde_json::Map::new();
            for (name, v) in entries {
                object.insert(name.to_string(), value_to_json(v, heap)?);
            }
            serde_json::Value::Object(object)
        }
        Value::Quote(r) => match heap.quote(r) {
            Some(inner) => value_to_json(inner, heap)?,
            None => serde_json::Value::Null,
        },
        Value::Closure(_) | Value::FunctionDef(_) | Value::Native(_) => {
            return Err(RuntimeError::new(
                RuntimeErrorKind::InvalidType,
                format!("{} has no JSON form", value.type_name()),
            ));
        }
    })
}

fn number_to_json(n: f64) -> Result<serde_json::Value, RuntimeError> {
    if n.fract() == 0.0 && n.is_finite() && n.abs() <= i64::MAX as f64 {
        return Ok(serde_json::Value::Number((n as i64).into()));
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorKind::InvalidType,
                "number has no JSON form",
            )
        })
}

impl VM {
    /// Parse a JSON document and bind the converted value in the global
    /// environment, so scripts can read host data by name.
    pub fn bind_json(&mut self, name: &str, source: &str) -> Result<Value, Error> {
        let json: serde_json::Value = serde_json::from_str(source).map_err(|e| {
            Error::Parse(ParseError::from_message(
                ParseErrorKind::InvalidSyntax,
                format!("invalid JSON: {e}"),
            ))
        })?;
        let value = value_from_json(&json, self.heap_mut());
        self.define_global(name, value);
        Ok(value)
    }

    /// Serialize a script value to a JSON string for the host.
    pub fn to_json(&self, value: Value) -> Result<String, Error> {
        let json = value_to_json(value, self.heap())?;
        Ok(json.to_string())
    }
}
