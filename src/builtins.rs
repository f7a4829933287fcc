//! Built-in function table.
//!
//! Each native takes a slice of evaluated arguments plus the allocator and
//! returns a value; compound results are allocated through the heap so the
//! collector can trace them. The table is installed into the global
//! environment when a VM is built.
//!
//! Comparison results are numbers: `1` for true, `0` for false.

use crate::heap::Heap;
use crate::value::{NativeFn, Value};
use crate::vm::{RuntimeError, RuntimeErrorKind};

/// The registry: name → native, installed under these names before any
/// program runs.
pub fn create_builtins() -> Vec<(&'static str, NativeFn)> {
    vec![
        ("<", native_lt),
        ("==", native_eq),
        ("cons", native_cons),
        ("car", native_car),
        ("cdr", native_cdr),
        ("list", native_list),
        ("nil?", native_is_nil),
        ("nil", native_nil),
        ("len", native_len),
        ("concat", native_concat),
        ("get", native_get),
        ("#", native_vector),
        ("@reduce", native_reduce),
        ("@stride", native_stride),
    ]
}

fn expect_argc(name: &str, args: &[Value], expected: usize) -> Result<(), RuntimeError> {
    if args.len() != expected {
        return Err(RuntimeError::new(
            RuntimeErrorKind::ArgumentCountMismatch,
            format!("{name} expects {expected} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn expect_number(name: &str, value: Value) -> Result<f64, RuntimeError> {
    value.as_number().ok_or_else(|| {
        RuntimeError::new(
            RuntimeErrorKind::NotANumber,
            format!("{name} expects numbers, got {}", value.type_name()),
        )
    })
}

fn bool_value(b: bool) -> Value {
    Value::Number(if b { 1.0 } else { 0.0 })
}

fn native_lt(args: &[Value], _heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("<", args, 2)?;
    let a = expect_number("<", args[0])?;
    let b = expect_number("<", args[1])?;
    Ok(bool_value(a < b))
}

fn native_eq(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("==", args, 2)?;
    Ok(bool_value(heap.values_equal(args[0], args[1])))
}

fn native_cons(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("cons", args, 2)?;
    Ok(heap.alloc_cons(args[0], args[1]))
}

fn native_car(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("car", args, 1)?;
    match args[0] {
        Value::Cons(r) => match heap.cons(r) {
            Some((car, _)) => Ok(car),
            None => Err(RuntimeError::new(
                RuntimeErrorKind::InvalidType,
                "stale heap reference",
            )),
        },
        other => Err(RuntimeError::new(
            RuntimeErrorKind::NotACons,
            format!("car expects a cons, got {}", other.type_name()),
        )),
    }
}

fn native_cdr(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("cdr", args, 1)?;
    match args[0] {
        Value::Cons(r) => match heap.cons(r) {
            Some((_, cdr)) => Ok(cdr),
            None => Err(RuntimeError::new(
                RuntimeErrorKind::InvalidType,
                "stale heap reference",
            )),
        },
        other => Err(RuntimeError::new(
            RuntimeErrorKind::NotACons,
            format!("cdr expects a cons, got {}", other.type_name()),
        )),
    }
}

fn native_list(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    Ok(heap.alloc_chain(args))
}

fn native_is_nil(args: &[Value], _heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("nil?", args, 1)?;
    Ok(bool_value(args[0].is_nil()))
}

fn native_nil(args: &[Value], _heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("nil", args, 0)?;
    Ok(Value::Nil)
}

/// Walk a proper cons list and return its values. Fails on improper tails.
fn chain_to_vec(heap: &Heap, mut value: Value) -> Result<Vec<Value>, RuntimeError> {
    let mut items = Vec::new();
    loop {
        match value {
            Value::Nil => return Ok(items),
            Value::Cons(r) => match heap.cons(r) {
                Some((car, cdr)) => {
                    items.push(car);
                    value = cdr;
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
                    RuntimeErrorKind::NotACons,
                    format!("expected a proper list, found {}", other.type_name()),
                ));
            }
        }
    }
}

fn native_len(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("len", args, 1)?;
    let length = match args[0] {
        Value::Nil => 0,
        Value::Cons(_) => chain_to_vec(heap, args[0])?.len(),
        Value::List(r) => heap.list(r).map(<[Value]>::len).unwrap_or(0),
        Value::Vector(r) => heap.vector(r).map(<[f32]>::len).unwrap_or(0),
        Value::Str(r) => heap.string(r).map(str::len).unwrap_or(0),
        other => {
            return Err(RuntimeError::new(
                RuntimeErrorKind::InvalidType,
                format!("len expects a list, vector or string, got {}", other.type_name()),
            ));
        }
    };
    Ok(Value::Number(length as f64))
}

/// Concatenate homogeneous sequences: cons lists (or nil), strings, or
/// vectors.
fn native_concat(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    let Some(first) = args.first() else {
        return Ok(Value::Nil);
    };
    match first {
        Value::Nil | Value::Cons(_) => {
            let mut items = Vec::new();
            for &arg in args {
                items.extend(chain_to_vec(heap, arg)?);
            }
            Ok(heap.alloc_chain(&items))
        }
        Value::Str(_) => {
            let mut joined = String::new();
            for &arg in args {
                let Value::Str(r) = arg else {
                    return Err(concat_mismatch(arg));
                };
                joined.push_str(heap.string(r).unwrap_or(""));
            }
            Ok(heap.alloc_str(&joined))
        }
        Value::Vector(_) => {
            let mut items = Vec::new();
            for &arg in args {
                let Value::Vector(r) = arg else {
                    return Err(concat_mismatch(arg));
                };
                items.extend_from_slice(heap.vector(r).unwrap_or(&[]));
            }
            Ok(heap.alloc_vector(items))
        }
        other => Err(RuntimeError::new(
            RuntimeErrorKind::TypeMismatch,
            format!("concat expects lists, strings or vectors, got {}", other.type_name()),
        )),
    }
}

fn concat_mismatch(value: Value) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::TypeMismatch,
        format!("concat arguments must share one type, got {}", value.type_name()),
    )
}

/// `(get subject key)` — string key into an object, or a 0-based numeric
/// index into a list or vector.
fn native_get(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("get", args, 2)?;
    match (args[0], args[1]) {
        (Value::Object(object_ref), key) => {
            let name = match key {
                Value::Str(r) => heap.string(r).unwrap_or("").to_string(),
                Value::Symbol(s) => heap.symbol_name(s).to_string(),
                other => {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::InvalidKey,
                        format!("object keys are strings, got {}", other.type_name()),
                    ));
                }
            };
            let symbol = heap.intern(&name);
            match heap.object(object_ref).and_then(|map| map.get(&symbol)) {
                Some(&value) => Ok(value),
                None => Err(RuntimeError::new(
                    RuntimeErrorKind::InvalidKey,
                    format!("missing key: {name}"),
                )),
            }
        }
        (subject @ (Value::Cons(_) | Value::Nil), key) => {
            let index = expect_index(key)?;
            let items = chain_to_vec(heap, subject)?;
            items.get(index).copied().ok_or_else(|| index_error(index))
        }
        (Value::List(r), key) => {
            let index = expect_index(key)?;
            heap.list(r)
                .and_then(|items| items.get(index).copied())
                .ok_or_else(|| index_error(index))
        }
        (Value::Vector(r), key) => {
            let index = expect_index(key)?;
            heap.vector(r)
                .and_then(|items| items.get(index).copied())
                .map(|x| Value::Number(f64::from(x)))
                .ok_or_else(|| index_error(index))
        }
        (other, _) => Err(RuntimeError::new(
            RuntimeErrorKind::TypeMismatch,
            format!("get expects an object, list or vector, got {}", other.type_name()),
        )),
    }
}

fn expect_index(key: Value) -> Result<usize, RuntimeError> {
    match key {
        Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        other => Err(RuntimeError::new(
            RuntimeErrorKind::InvalidKey,
            format!("index must be a non-negative integer, got {}", other.type_name()),
        )),
    }
}

fn index_error(index: usize) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::InvalidKey,
        format!("index {index} out of range"),
    )
}

/// `(# n…)` — construct a vector from number arguments.
fn native_vector(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    let mut items = Vec::with_capacity(args.len());
    for &arg in args {
        items.push(expect_number("#", arg)? as f32);
    }
    Ok(heap.alloc_vector(items))
}

/// `(@reduce op vec)` — fold a vector with `+`, `*`, `min` or `max`.
fn native_reduce(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("@reduce", args, 2)?;
    let Value::Symbol(op) = args[0] else {
        return Err(RuntimeError::new(
            RuntimeErrorKind::TypeMismatch,
            format!("@reduce expects an operator symbol, got {}", args[0].type_name()),
        ));
    };
    let Value::Vector(r) = args[1] else {
        return Err(RuntimeError::new(
            RuntimeErrorKind::TypeMismatch,
            format!("@reduce expects a vector, got {}", args[1].type_name()),
        ));
    };
    let items = heap.vector(r).unwrap_or(&[]);
    let result = match heap.symbol_name(op) {
        "+" => items.iter().sum::<f32>(),
        "*" => items.iter().product::<f32>(),
        "min" => match items.iter().copied().reduce(f32::min) {
            Some(x) => x,
            None => return Err(empty_reduce("min")),
        },
        "max" => match items.iter().copied().reduce(f32::max) {
            Some(x) => x,
            None => return Err(empty_reduce("max")),
        },
        other => {
            return Err(RuntimeError::new(
                RuntimeErrorKind::InvalidType,
                format!("@reduce supports + * min max, got {other}"),
            ));
        }
    };
    Ok(Value::Number(f64::from(result)))
}

fn empty_reduce(op: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::TypeMismatch,
        format!("@reduce {op} needs a non-empty vector"),
    )
}

/// `(@stride vec stride offset)` — every stride-th element starting at
/// offset.
fn native_stride(args: &[Value], heap: &mut Heap) -> Result<Value, RuntimeError> {
    expect_argc("@stride", args, 3)?;
    let Value::Vector(r) = args[0] else {
        return Err(RuntimeError::new(
            RuntimeErrorKind::TypeMismatch,
            format!("@stride expects a vector, got {}", args[0].type_name()),
        ));
    };
    let stride = expect_number("@stride", args[1])?;
    let offset = expect_number("@stride", args[2])?;
    if stride < 1.0 || stride.fract() != 0.0 {
        return Err(RuntimeError::new(
            RuntimeErrorKind::InvalidType,
            "stride must be a positive integer",
        ));
    }
    if offset < 0.0 || offset.fract() != 0.0 {
        return Err(RuntimeError::new(
            RuntimeErrorKind::InvalidType,
            "offset must be a non-negative integer",
        ));
    }
    let items = heap.vector(r).unwrap_or(&[]);
    let strided: Vec<f32> = items
        .iter()
        .skip(offset as usize)
        .step_by(stride as usize)
        .copied()
        .collect();
    Ok(heap.alloc_vector(strided))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::vm::VM;

    fn render_eval(vm: &mut VM, source: &str) -> String {
        let value = vm
            .eval(source)
            .unwrap_or_else(|e| panic!("eval '{source}' failed: {e}"));
        vm.render(value)
    }

    fn runtime_kind(vm: &mut VM, source: &str) -> RuntimeErrorKind {
        match vm.eval(source) {
            Err(Error::Runtime(e)) => e.kind,
            other => panic!("expected runtime error for '{source}', got {other:?}"),
        }
    }

    #[test]
    fn test_list_primitives() {
        let mut vm = VM::new();
        let cases = vec![
            ("(cons 1 2)", "(1 . 2)"),
            ("(cons 1 (cons 2 (nil)))", "(1 2)"),
            ("(car (cons 1 2))", "1"),
            ("(cdr (cons 1 2))", "2"),
            ("(list 1 2 3)", "(1 2 3)"),
            ("(list)", "()"),
            ("(nil)", "()"),
            ("(nil? (nil))", "1"),
            ("(nil? 0)", "0"),
            ("(len (list 1 2 3))", "3"),
            ("(len (nil))", "0"),
            ("(len \"abcd\")", "4"),
            ("(len (# 1 2))", "2"),
            ("(concat (list 1) (list 2 3))", "(1 2 3)"),
            ("(concat (nil) (list 1))", "(1)"),
            ("(concat \"a\" \"bc\")", "\"abc\""),
            ("(concat (# 1) (# 2 3))", "(# 1 2 3)"),
        ];
        for (source, expected) in cases {
            assert_eq!(render_eval(&mut vm, source), expected, "for '{source}'");
        }
    }

    #[test]
    fn test_comparisons() {
        let mut vm = VM::new();
        let cases = vec![
            ("(< 1 2)", "1"),
            ("(< 2 1)", "0"),
            ("(== 1 1)", "1"),
            ("(== 1 2)", "0"),
            ("(== \"a\" \"a\")", "1"),
            ("(== \"a\" \"b\")", "0"),
            ("(== (list 1 2) (list 1 2))", "1"),
            ("(== (list 1) (list 1 2))", "0"),
            ("(== (nil) (nil))", "1"),
        ];
        for (source, expected) in cases {
            assert_eq!(render_eval(&mut vm, source), expected, "for '{source}'");
        }
    }

    #[test]
    fn test_get() {
        let mut vm = VM::new();
        vm.eval("(set step { stepNumber 0 gate \"open\" })").unwrap();
        let cases = vec![
            ("(get step \"stepNumber\")", "0"),
            ("(get step \"gate\")", "\"open\""),
            ("(get (list 10 20 30) 0)", "10"),
            ("(get (list 10 20 30) 2)", "30"),
            ("(get (# 1.5 2.5) 1)", "2.5"),
        ];
        for (source, expected) in cases {
            assert_eq!(render_eval(&mut vm, source), expected, "for '{source}'");
        }
        assert_eq!(
            runtime_kind(&mut vm, "(get step \"missing\")"),
            RuntimeErrorKind::InvalidKey
        );
        assert_eq!(
            runtime_kind(&mut vm, "(get (list 1) 5)"),
            RuntimeErrorKind::InvalidKey
        );
        assert_eq!(
            runtime_kind(&mut vm, "(get 5 0)"),
            RuntimeErrorKind::TypeMismatch
        );
    }

    #[test]
    fn test_vector_builtins() {
        let mut vm = VM::new();
        let cases = vec![
            ("(# 1 2 3)", "(# 1 2 3)"),
            ("(#)", "(#)"),
            ("(@reduce + (# 1 2 3 4 5))", "15"),
            ("(@reduce * (# 2 3 4))", "24"),
            ("(@reduce min (# 3 1 2))", "1"),
            ("(@reduce max (# 3 9 4))", "9"),
            ("(@stride (# 1 2 3 4 5 6) 2 0)", "(# 1 3 5)"),
            ("(@stride (# 1 2 3 4 5 6) 2 1)", "(# 2 4 6)"),
            ("(@stride (# 1 2 3) 1 0)", "(# 1 2 3)"),
            ("(@stride (# 1 2 3) 2 4)", "(#)"),
        ];
        for (source, expected) in cases {
            assert_eq!(render_eval(&mut vm, source), expected, "for '{source}'");
        }
        assert_eq!(
            runtime_kind(&mut vm, "(# 1 \"a\")"),
            RuntimeErrorKind::NotANumber
        );
        assert_eq!(
            runtime_kind(&mut vm, "(@reduce / (# 1 2))"),
            RuntimeErrorKind::InvalidType
        );
        assert_eq!(
            runtime_kind(&mut vm, "(@reduce min (#))"),
            RuntimeErrorKind::TypeMismatch
        );
        assert_eq!(
            runtime_kind(&mut vm, "(@stride (# 1 2) 0 0)"),
            RuntimeErrorKind::InvalidType
        );
    }

    #[test]
    fn test_arity_errors() {
        let mut vm = VM::new();
        let cases = vec!["(car)", "(cons 1)", "(nil 1)", "(len)", "(get (list 1))"];
        for source in cases {
            assert_eq!(
                runtime_kind(&mut vm, source),
                RuntimeErrorKind::ArgumentCountMismatch,
                "for '{source}'"
            );
        }
    }
}
