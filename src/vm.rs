//! Virtual machine.
//!
//! Executes a linear sequence of typed [`Instruction`]s against a single
//! operand stack shared by every call frame — return values never need
//! copying between frames. Calls to bytecode closures push a new
//! [`Frame`] instead of recursing in the host, so script recursion depth is
//! bounded by memory, not the Rust stack.
//!
//! The VM owns the garbage-collected heap. Between instructions, once the
//! heap's live count passes its watermark, a collection runs with the
//! current roots: the global environment, everything on the operand stack,
//! and every active frame's environment chain.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::env::Env;
use crate::heap::Heap;
use crate::parser::{self, Expr};
use crate::value::{Closure, FunctionDef, HeapRef, Pattern, StringSymbol, Value};
use crate::{Error, builtins, compiler};

/// Categorizes runtime failures. All of them abort the current evaluation
/// and unwind to the embedder.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RuntimeErrorKind {
    StackUnderflow,
    InvalidResult,
    DivisionByZero,
    VariableNotFound,
    NotAFunction,
    ArgumentCountMismatch,
    NotANumber,
    NotACons,
    NotAnObject,
    /// Missing object key; also "no matching arm" on a named call
    InvalidKey,
    TypeMismatch,
    NoParentScope,
    InvalidType,
    VectorLengthMismatch,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Runtime error: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

fn stale_ref() -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::InvalidType, "stale heap reference")
}

/// Lambda template carried by `PushFunc`; becomes a heap closure capturing
/// the current environment when executed.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncTemplate {
    pub params: Vec<StringSymbol>,
    pub code: Rc<[Instruction]>,
}

/// One-arm template carried by `PushFuncDef`.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDefTemplate {
    pub patterns: Vec<Pattern>,
    pub code: Rc<[Instruction]>,
}

/// The instruction set. Arithmetic opcodes carry their operand count so the
/// variadic source operators fold into one instruction; jump offsets are
/// relative to the jump's own index and always non-negative.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Push a number
    PushConst(f64),
    /// Push a freshly allocated string
    PushConstString(String),
    /// Push a symbol
    PushConstSymbol(StringSymbol),
    /// Materialize a quoted expression (lists become chained cons cells)
    PushQuote(Rc<Expr>),
    /// Allocate a closure capturing the current environment
    PushFunc(Rc<FuncTemplate>),
    /// Allocate one pattern-dispatch arm
    PushFuncDef(Rc<FuncDefTemplate>),
    /// Push a freshly allocated empty object
    PushEmptyObject,
    /// Duplicate the top operand
    Dup,
    /// Pop n operands, push their sum (numbers or element-wise vectors)
    Add(usize),
    Sub(usize),
    Mul(usize),
    Div(usize),
    /// Look a name up through the scope chain and push its value
    LoadVar(StringSymbol),
    /// Pop the top operand and bind it in the current scope
    StoreVar(StringSymbol),
    /// Replace the frame's environment with a fresh child scope
    EnterScope,
    /// Restore the parent scope
    ExitScope,
    /// Bind the (unconsumed) top operand in the current scope
    DefineFunc(StringSymbol),
    /// Pop an arm; append it to (or create) the named function
    DefineFuncDef(StringSymbol),
    /// Pop argc arguments and a callee, dispatch the call
    Call(usize),
    /// pc += offset
    Jump(usize),
    /// Pop; pc += offset when falsy, else pc += 1
    JumpIfFalse(usize),
    /// End the current frame
    Return,
    /// Pop value, key and object; set object[key] = value; push the object
    CallObjSet,
    /// Pop source and destination objects; copy entries over; push the
    /// destination
    CallObjMerge,
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

fn combine(a: f64, b: f64, op: ArithOp) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
    }
}

/// Element-wise combine in lanes of four so the optimizer can keep the loop
/// in vector registers.
fn apply_lanes(acc: &mut [f32], src: &[f32], op: ArithOp) {
    let combine = |a: f32, b: f32| match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
    };
    let n = acc.len();
    let mut i = 0;
    while i + 4 <= n {
        acc[i] = combine(acc[i], src[i]);
        acc[i + 1] = combine(acc[i + 1], src[i + 1]);
        acc[i + 2] = combine(acc[i + 2], src[i + 2]);
        acc[i + 3] = combine(acc[i + 3], src[i + 3]);
        i += 4;
    }
    while i < n {
        acc[i] = combine(acc[i], src[i]);
        i += 1;
    }
}

/// Names that still load as symbol literals when unbound, so reduction
/// operators can be passed by name.
fn is_operator_symbol(name: &str) -> bool {
    matches!(name, "+" | "-" | "*" | "/") || name.starts_with("min") || name.starts_with("max")
}

/// One call frame: code, program counter and environment. `entry_env` pins
/// the scope the frame started in so `ExitScope` cannot walk out of it.
struct Frame {
    code: Rc<[Instruction]>,
    pc: usize,
    env: HeapRef,
    entry_env: HeapRef,
}

/// The execution engine. Owns the heap, the global environment, the operand
/// stack and the call-frame stack. Global state persists across `eval`
/// calls.
pub struct VM {
    heap: Heap,
    global_env: HeapRef,
    stack: Vec<Value>,
    frames: Vec<Frame>,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    /// Build a VM with the built-in function table installed in the global
    /// environment.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let global_env = heap.alloc_env(Env::new());
        let mut vm = VM {
            heap,
            global_env,
            stack: Vec::new(),
            frames: Vec::new(),
        };
        for (name, native) in builtins::create_builtins() {
            vm.define_global(name, Value::Native(native));
        }
        vm
    }

    /// Parse, compile and execute one expression. Global definitions
    /// persist for the next call.
    pub fn eval(&mut self, source: &str) -> Result<Value, Error> {
        let expr = parser::parse(source)?;
        let code = compiler::compile(&expr, &mut self.heap)?;
        let value = self.execute(code)?;
        Ok(value)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn global_env(&self) -> HeapRef {
        self.global_env
    }

    /// Bind a value in the global environment.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let symbol = self.heap.intern(name);
        self.heap.env_define(self.global_env, symbol, value);
    }

    /// Render a value for display.
    pub fn render(&self, value: Value) -> String {
        self.heap.render(value)
    }

    /// Force a collection at a quiescent point. Returns the number of
    /// objects freed.
    pub fn collect(&mut self) -> usize {
        self.run_gc()
    }

    /// Run an instruction sequence to completion. A well-formed program
    /// leaves exactly one operand, which is the result.
    pub fn execute(&mut self, code: Rc<[Instruction]>) -> Result<Value, RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.frames.push(Frame {
            code,
            pc: 0,
            env: self.global_env,
            entry_env: self.global_env,
        });

        loop {
            if self.heap.should_collect() {
                self.run_gc();
            }
            let instruction = {
                let Some(frame) = self.frames.last() else {
                    break;
                };
                if frame.pc >= frame.code.len() {
                    None
                } else {
                    Some(frame.code[frame.pc].clone())
                }
            };
            match instruction {
                Some(instruction) => self.step(instruction)?,
                None => {
                    // Fell off the end of the frame's code.
                    self.frames.pop();
                }
            }
        }

        if self.stack.len() != 1 {
            return Err(RuntimeError::new(
                RuntimeErrorKind::InvalidResult,
                format!("program left {} operands on the stack", self.stack.len()),
            ));
        }
        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    fn step(&mut self, instruction: Instruction) -> Result<(), RuntimeError> {
        match instruction {
            Instruction::Jump(offset) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc += offset;
                }
                return Ok(());
            }
            Instruction::JumpIfFalse(offset) => {
                let condition = self.pop()?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc += if condition.is_truthy() { 1 } else { offset };
                }
                return Ok(());
            }
            Instruction::Call(argc) => return self.call(argc),
            Instruction::Return => {
                self.frames.pop();
                return Ok(());
            }

            Instruction::PushConst(n) => self.stack.push(Value::Number(n)),
            Instruction::PushConstString(ref s) => {
                let value = self.heap.alloc_str(s);
                self.stack.push(value);
            }
            Instruction::PushConstSymbol(symbol) => self.stack.push(Value::Symbol(symbol)),
            Instruction::PushQuote(ref expr) => {
                let value = self.materialize_quote(expr)?;
                self.stack.push(value);
            }
            Instruction::PushFunc(ref template) => {
                let closure = self.heap.alloc_closure(Closure {
                    defs: Vec::new(),
                    params: Some(template.params.clone()),
                    code: Some(template.code.clone()),
                    env: self.current_env(),
                });
                self.stack.push(closure);
            }
            Instruction::PushFuncDef(ref template) => {
                let def = self.heap.alloc_function_def(FunctionDef {
                    patterns: template.patterns.clone(),
                    code: template.code.clone(),
                });
                self.stack.push(def);
            }
            Instruction::PushEmptyObject => {
                let object = self.heap.alloc_object(Default::default());
                self.stack.push(object);
            }
            Instruction::Dup => {
                let top = self.peek()?;
                self.stack.push(top);
            }

            Instruction::Add(n) => self.arithmetic(n, ArithOp::Add)?,
            Instruction::Sub(n) => self.arithmetic(n, ArithOp::Sub)?,
            Instruction::Mul(n) => self.arithmetic(n, ArithOp::Mul)?,
            Instruction::Div(n) => self.arithmetic(n, ArithOp::Div)?,

            Instruction::LoadVar(symbol) => {
                match self.heap.env_lookup(self.current_env(), symbol) {
                    Some(value) => self.stack.push(value),
                    None => {
                        let name = self.heap.symbol_name(symbol);
                        if is_operator_symbol(name) {
                            // Reduction operators load as symbol literals so
                            // they can be passed to natives by name.
                            self.stack.push(Value::Symbol(symbol));
                        } else {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::VariableNotFound,
                                format!("undefined variable: {name}"),
                            ));
                        }
                    }
                }
            }
            Instruction::StoreVar(symbol) => {
                let value = self.pop()?;
                let env = self.current_env();
                self.heap.env_define(env, symbol, value);
            }
            Instruction::EnterScope => {
                let parent = self.current_env();
                let child = self.heap.alloc_env(Env::with_parent(parent));
                if let Some(frame) = self.frames.last_mut() {
                    frame.env = child;
                }
            }
            Instruction::ExitScope => {
                let (env, entry_env) = self
                    .frames
                    .last()
                    .map(|f| (f.env, f.entry_env))
                    .unwrap_or((self.global_env, self.global_env));
                if env == entry_env {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NoParentScope,
                        "no scope to exit at frame root",
                    ));
                }
                let parent = self.heap.env_parent(env).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::NoParentScope, "scope has no parent")
                })?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.env = parent;
                }
            }
            Instruction::DefineFunc(symbol) => {
                let value = self.peek()?;
                let env = self.current_env();
                self.heap.env_define(env, symbol, value);
            }
            Instruction::DefineFuncDef(symbol) => self.define_func_def(symbol)?,

            Instruction::CallObjSet => {
                let value = self.pop()?;
                let key = self.pop()?;
                let object = self.pop()?;
                let Value::Symbol(key) = key else {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::TypeMismatch,
                        format!("object key must be a symbol, got {}", key.type_name()),
                    ));
                };
                let Value::Object(object_ref) = object else {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NotAnObject,
                        format!("cannot set key on {}", object.type_name()),
                    ));
                };
                self.heap
                    .object_mut(object_ref)
                    .ok_or_else(stale_ref)?
                    .insert(key, value);
                self.stack.push(object);
            }
            Instruction::CallObjMerge => {
                let source = self.pop()?;
                let destination = self.pop()?;
                let (Value::Object(source_ref), Value::Object(destination_ref)) =
                    (source, destination)
                else {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NotAnObject,
                        format!(
                            "spread requires objects, got {} and {}",
                            destination.type_name(),
                            source.type_name()
                        ),
                    ));
                };
                let entries: Vec<(StringSymbol, Value)> = self
                    .heap
                    .object(source_ref)
                    .ok_or_else(stale_ref)?
                    .iter()
                    .map(|(k, v)| (*k, *v))
                    .collect();
                let destination_map = self
                    .heap
                    .object_mut(destination_ref)
                    .ok_or_else(stale_ref)?;
                for (key, value) in entries {
                    destination_map.insert(key, value);
                }
                self.stack.push(destination);
            }
        }

        // Default: advance to the next instruction.
        self.advance();
        Ok(())
    }

    // ── Call dispatch ──

    fn call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        if self.stack.len() < argc + 1 {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackUnderflow,
                format!("call needs {} operands, have {}", argc + 1, self.stack.len()),
            ));
        }
        let args = self.pop_n(argc)?;
        let callee = self.pop()?;

        match callee {
            Value::Closure(closure_ref) => {
                let closure = self.heap.closure(closure_ref).ok_or_else(stale_ref)?.clone();
                match (&closure.params, &closure.code) {
                    (Some(params), Some(code)) => {
                        if params.len() != argc {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::ArgumentCountMismatch,
                                format!("expected {} arguments, got {argc}", params.len()),
                            ));
                        }
                        let call_env = self.heap.alloc_env(Env::with_parent(closure.env));
                        for (&param, &arg) in params.iter().zip(args.iter()) {
                            self.heap.env_define(call_env, param, arg);
                        }
                        self.push_frame(code.clone(), call_env);
                        Ok(())
                    }
                    _ => self.call_named(&closure, &args),
                }
            }
            Value::Native(func) => {
                let result = func(&args, &mut self.heap)?;
                self.stack.push(result);
                self.advance();
                Ok(())
            }
            other => Err(RuntimeError::new(
                RuntimeErrorKind::NotAFunction,
                format!("cannot call {}", other.type_name()),
            )),
        }
    }

    /// Try each arm in definition order; the first whose patterns all match
    /// wins.
    fn call_named(&mut self, closure: &Closure, args: &[Value]) -> Result<(), RuntimeError> {
        for &arm_ref in &closure.defs {
            let arm = self.heap.function_def(arm_ref).ok_or_else(stale_ref)?;
            if arm.patterns.len() != args.len() {
                continue;
            }
            if !arm.patterns.iter().zip(args).all(|(p, &a)| p.matches(a)) {
                continue;
            }
            let patterns = arm.patterns.clone();
            let code = arm.code.clone();
            let call_env = self.heap.alloc_env(Env::with_parent(closure.env));
            for (pattern, &arg) in patterns.iter().zip(args) {
                if let Pattern::Binding(name) = pattern {
                    self.heap.env_define(call_env, *name, arg);
                }
            }
            self.push_frame(code, call_env);
            return Ok(());
        }
        Err(RuntimeError::new(
            RuntimeErrorKind::InvalidKey,
            format!("no matching definition for {} arguments", args.len()),
        ))
    }

    fn define_func_def(&mut self, symbol: StringSymbol) -> Result<(), RuntimeError> {
        let def = self.pop()?;
        let Value::FunctionDef(def_ref) = def else {
            return Err(RuntimeError::new(
                RuntimeErrorKind::TypeMismatch,
                format!("expected a function definition, got {}", def.type_name()),
            ));
        };
        let current = self.current_env();

        match self.heap.env_lookup(current, symbol) {
            Some(Value::Closure(closure_ref))
                if self
                    .heap
                    .closure(closure_ref)
                    .is_some_and(|c| c.is_named()) =>
            {
                let new_patterns = self
                    .heap
                    .function_def(def_ref)
                    .ok_or_else(stale_ref)?
                    .patterns
                    .clone();
                let arms = self
                    .heap
                    .closure(closure_ref)
                    .ok_or_else(stale_ref)?
                    .defs
                    .clone();

                // Equal pattern vector replaces in place, otherwise append.
                let mut replaced = false;
                for (index, &arm_ref) in arms.iter().enumerate() {
                    let equal = self
                        .heap
                        .function_def(arm_ref)
                        .is_some_and(|arm| arm.patterns == new_patterns);
                    if equal {
                        if let Some(closure) = self.heap.closure_mut(closure_ref) {
                            closure.defs[index] = def_ref;
                        }
                        replaced = true;
                        break;
                    }
                }
                if !replaced {
                    if let Some(closure) = self.heap.closure_mut(closure_ref) {
                        closure.defs.push(def_ref);
                    }
                }

                // Later definitions see the defining scope as it is now.
                let refreshed = self.heap.alloc_env(Env::with_parent(current));
                if let Some(closure) = self.heap.closure_mut(closure_ref) {
                    closure.env = refreshed;
                }
                self.stack.push(Value::Closure(closure_ref));
            }
            _ => {
                let capture = self.heap.alloc_env(Env::with_parent(current));
                let closure = self.heap.alloc_closure(Closure {
                    defs: vec![def_ref],
                    params: None,
                    code: None,
                    env: capture,
                });
                self.heap.env_define(current, symbol, closure);
                self.stack.push(closure);
            }
        }
        Ok(())
    }

    // ── Arithmetic ──

    fn arithmetic(&mut self, count: usize, op: ArithOp) -> Result<(), RuntimeError> {
        if count < 2 {
            return Err(RuntimeError::new(
                RuntimeErrorKind::ArgumentCountMismatch,
                "arithmetic requires at least two operands",
            ));
        }
        let args = self.pop_n(count)?;

        let mut numbers = SmallVec::<[f64; 4]>::new();
        let mut all_numbers = true;
        for value in &args {
            match value {
                Value::Number(n) => numbers.push(*n),
                _ => {
                    all_numbers = false;
                    break;
                }
            }
        }
        if all_numbers {
            let mut acc = numbers[0];
            for &x in &numbers[1..] {
                if matches!(op, ArithOp::Div) && x == 0.0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::DivisionByZero,
                        "division by zero",
                    ));
                }
                acc = combine(acc, x, op);
            }
            self.stack.push(Value::Number(acc));
            return Ok(());
        }

        let mut refs = SmallVec::<[HeapRef; 4]>::new();
        for value in &args {
            match value {
                Value::Vector(r) => refs.push(*r),
                other => {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NotANumber,
                        format!(
                            "arithmetic requires all numbers or all vectors, got {}",
                            other.type_name()
                        ),
                    ));
                }
            }
        }
        let mut acc = self.heap.vector(refs[0]).ok_or_else(stale_ref)?.to_vec();
        for &r in &refs[1..] {
            let src = self.heap.vector(r).ok_or_else(stale_ref)?;
            if src.len() != acc.len() {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::VectorLengthMismatch,
                    format!("vector lengths differ: {} vs {}", acc.len(), src.len()),
                ));
            }
            apply_lanes(&mut acc, src, op);
        }
        let result = self.heap.alloc_vector(acc);
        self.stack.push(result);
        Ok(())
    }

    // ── Quote materialization ──

    /// Build the runtime value for a quoted expression: lists become chained
    /// cons cells (the empty list is nil), nested quotes become heap quote
    /// values.
    fn materialize_quote(&mut self, expr: &Expr) -> Result<Value, RuntimeError> {
        Ok(match expr {
            Expr::Number(n) => Value::Number(*n),
            Expr::Str(s) => self.heap.alloc_str(s),
            Expr::Symbol(name) => Value::Symbol(self.heap.intern(name)),
            Expr::List(items) => {
                let mut tail = Value::Nil;
                for item in items.iter().rev() {
                    let value = self.materialize_quote(item)?;
                    tail = self.heap.alloc_cons(value, tail);
                }
                tail
            }
            Expr::Quote(inner) => {
                let value = self.materialize_quote(inner)?;
                self.heap.alloc_quote(value)
            }
            // The compiler rejects quoted object literals.
            Expr::Object(_) => {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::InvalidType,
                    "object literal cannot be quoted",
                ));
            }
        })
    }

    // ── Stack and frame helpers ──

    fn current_env(&self) -> HeapRef {
        self.frames.last().map(|f| f.env).unwrap_or(self.global_env)
    }

    fn advance(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }
    }

    /// Advance the caller past its `Call`, then enter the callee.
    fn push_frame(&mut self, code: Rc<[Instruction]>, env: HeapRef) {
        self.advance();
        self.frames.push(Frame {
            code,
            pc: 0,
            env,
            entry_env: env,
        });
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::StackUnderflow, "operand stack is empty")
        })
    }

    fn pop_n(&mut self, n: usize) -> Result<SmallVec<[Value; 4]>, RuntimeError> {
        if self.stack.len() < n {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackUnderflow,
                format!("need {n} operands, have {}", self.stack.len()),
            ));
        }
        let at = self.stack.len() - n;
        Ok(self.stack.drain(at..).collect())
    }

    fn peek(&self) -> Result<Value, RuntimeError> {
        self.stack.last().copied().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::StackUnderflow, "operand stack is empty")
        })
    }

    // ── Garbage collection ──

    fn run_gc(&mut self) -> usize {
        let mut env_roots: Vec<HeapRef> = Vec::with_capacity(self.frames.len() + 1);
        env_roots.push(self.global_env);
        for frame in &self.frames {
            env_roots.push(frame.env);
            env_roots.push(frame.entry_env);
        }
        self.heap.collect(&self.stack, &env_roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Instruction as I;
    use crate::Error;

    fn eval_ok(vm: &mut VM, source: &str) -> Value {
        vm.eval(source)
            .unwrap_or_else(|e| panic!("eval '{source}' failed: {e}"))
    }

    fn render_eval(vm: &mut VM, source: &str) -> String {
        let value = eval_ok(vm, source);
        vm.render(value)
    }

    fn runtime_kind(vm: &mut VM, source: &str) -> RuntimeErrorKind {
        match vm.eval(source) {
            Err(Error::Runtime(e)) => e.kind,
            other => panic!("expected runtime error for '{source}', got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_programs() {
        let mut vm = VM::new();
        let cases = vec![
            ("(+ 1 2)", "3"),
            ("(- 10 2 3)", "5"),
            ("(* 2 3 4)", "24"),
            ("(/ 8 2 2)", "2"),
            ("(+ 0.5 0.25)", "0.75"),
            ("(- 1 2)", "-1"),
            ("(+ 1 (* 2 3))", "7"),
        ];
        for (source, expected) in cases {
            assert_eq!(render_eval(&mut vm, source), expected, "for '{source}'");
        }
    }

    #[test]
    fn test_defun_and_call() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(defun sq (x) (* x x))");
        assert_eq!(eval_ok(&mut vm, "(sq 5)"), Value::Number(25.0));
        // The defun expression itself evaluates to the named function.
        assert_eq!(render_eval(&mut vm, "(defun cube (x) (* x x x))"), "#<function>");
        assert_eq!(eval_ok(&mut vm, "(cube 3)"), Value::Number(27.0));
    }

    #[test]
    fn test_object_literals_and_spread() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(set step { stepNumber 0 time 123 })");
        eval_ok(&mut vm, "(set step2 { ... step transpose 4 })");
        assert_eq!(
            eval_ok(&mut vm, "(get step2 \"transpose\")"),
            Value::Number(4.0)
        );
        assert_eq!(
            eval_ok(&mut vm, "(get step2 \"stepNumber\")"),
            Value::Number(0.0)
        );
        // The source object is unchanged by the spread.
        assert!(
            vm.eval("(get step \"transpose\")").is_err(),
            "spread must copy, not alias"
        );
    }

    #[test]
    fn test_literal_pattern_precedence() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(defun f 0 1)");
        eval_ok(&mut vm, "(defun f (n) (* n (f (- n 1))))");
        assert_eq!(eval_ok(&mut vm, "(f 3)"), Value::Number(6.0));
        // The literal arm still wins at zero.
        assert_eq!(eval_ok(&mut vm, "(f 0)"), Value::Number(1.0));
    }

    #[test]
    fn test_arm_selection_and_replacement() {
        let mut vm = VM::new();
        // Arms with different arity coexist.
        eval_ok(&mut vm, "(defun k (x) 1)");
        eval_ok(&mut vm, "(defun k (x y) 2)");
        assert_eq!(eval_ok(&mut vm, "(k 5)"), Value::Number(1.0));
        assert_eq!(eval_ok(&mut vm, "(k 5 6)"), Value::Number(2.0));
        // An equal pattern vector replaces the arm in place.
        eval_ok(&mut vm, "(defun k (x) 9)");
        assert_eq!(eval_ok(&mut vm, "(k 5)"), Value::Number(9.0));
        assert_eq!(eval_ok(&mut vm, "(k 5 6)"), Value::Number(2.0));
        // No arm matches three arguments.
        assert_eq!(runtime_kind(&mut vm, "(k 1 2 3)"), RuntimeErrorKind::InvalidKey);
    }

    #[test]
    fn test_let_scoping() {
        let mut vm = VM::new();
        assert_eq!(
            eval_ok(&mut vm, "(let ((x 2) (y 3)) (+ x y))"),
            Value::Number(5.0)
        );
        // Bindings do not leak into the enclosing environment.
        assert_eq!(runtime_kind(&mut vm, "x"), RuntimeErrorKind::VariableNotFound);
        assert_eq!(runtime_kind(&mut vm, "y"), RuntimeErrorKind::VariableNotFound);
        // Later bindings see earlier ones.
        assert_eq!(
            eval_ok(&mut vm, "(let ((x 2) (y (+ x 1))) (* x y))"),
            Value::Number(6.0)
        );
    }

    #[test]
    fn test_vector_reduce_scenario() {
        let mut vm = VM::new();
        assert_eq!(
            eval_ok(&mut vm, "(@reduce + (# 1 2 3 4 5))"),
            Value::Number(15.0)
        );
    }

    #[test]
    fn test_lambda_captures_definition_env() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(defun make-adder (n) (lambda (x) (+ x n)))");
        eval_ok(&mut vm, "(set add2 (make-adder 2))");
        eval_ok(&mut vm, "(set add10 (make-adder 10))");
        assert_eq!(eval_ok(&mut vm, "(add2 40)"), Value::Number(42.0));
        assert_eq!(eval_ok(&mut vm, "(add10 40)"), Value::Number(50.0));

        // Free variables resolve against the defining environment, not the
        // caller's.
        eval_ok(&mut vm, "(set base 1)");
        eval_ok(&mut vm, "(defun get-base () base)");
        assert_eq!(
            eval_ok(&mut vm, "(let ((base 99)) (get-base))"),
            Value::Number(1.0)
        );
    }

    #[test]
    fn test_immediate_lambda_application() {
        let mut vm = VM::new();
        assert_eq!(
            eval_ok(&mut vm, "((lambda (x y) (+ x y)) 2 3)"),
            Value::Number(5.0)
        );
    }

    #[test]
    fn test_conditionals() {
        let mut vm = VM::new();
        let cases = vec![
            ("(if 1 2 3)", "2"),
            ("(if 0 2 3)", "3"),
            ("(if 1 2)", "2"),
            ("(if 0 1)", "()"),
            // Non-numbers are falsy.
            ("(if \"s\" 1 2)", "2"),
            ("(if (nil) 1 2)", "2"),
            ("(if (< 1 2) 10 20)", "10"),
        ];
        for (source, expected) in cases {
            assert_eq!(render_eval(&mut vm, source), expected, "for '{source}'");
        }
    }

    #[test]
    fn test_set_leaves_value_and_persists() {
        let mut vm = VM::new();
        assert_eq!(eval_ok(&mut vm, "(set tempo 120)"), Value::Number(120.0));
        assert_eq!(eval_ok(&mut vm, "tempo"), Value::Number(120.0));
        assert_eq!(eval_ok(&mut vm, "(+ tempo 8)"), Value::Number(128.0));
    }

    #[test]
    fn test_operator_symbol_fallback() {
        let mut vm = VM::new();
        assert_eq!(render_eval(&mut vm, "+"), "+");
        assert_eq!(render_eval(&mut vm, "*"), "*");
        assert_eq!(render_eval(&mut vm, "min3"), "min3");
        assert_eq!(render_eval(&mut vm, "maxVelocity"), "maxVelocity");
        assert_eq!(
            runtime_kind(&mut vm, "plus"),
            RuntimeErrorKind::VariableNotFound
        );
    }

    #[test]
    fn test_vector_arithmetic() {
        let mut vm = VM::new();
        assert_eq!(render_eval(&mut vm, "(+ (# 1 2) (# 3 4))"), "(# 4 6)");
        assert_eq!(render_eval(&mut vm, "(* (# 2 2) (# 3 4))"), "(# 6 8)");
        assert_eq!(render_eval(&mut vm, "(- (# 5 5 5) (# 1 2 3))"), "(# 4 3 2)");
        // More than one lane of four plus a remainder.
        assert_eq!(
            render_eval(&mut vm, "(+ (# 1 2 3 4 5 6) (# 1 1 1 1 1 1))"),
            "(# 2 3 4 5 6 7)"
        );
        assert_eq!(
            runtime_kind(&mut vm, "(+ (# 1 2) (# 1 2 3))"),
            RuntimeErrorKind::VectorLengthMismatch
        );
        assert_eq!(
            runtime_kind(&mut vm, "(+ (# 1 2) 3)"),
            RuntimeErrorKind::NotANumber
        );
    }

    #[test]
    fn test_quote_materialization() {
        let mut vm = VM::new();
        assert_eq!(render_eval(&mut vm, "'(1 2 3)"), "(1 2 3)");
        assert_eq!(render_eval(&mut vm, "'()"), "()");
        assert_eq!(render_eval(&mut vm, "'foo"), "foo");
        assert_eq!(render_eval(&mut vm, "''x"), "'x");
        assert_eq!(eval_ok(&mut vm, "(car '(1 2))"), Value::Number(1.0));
        assert_eq!(render_eval(&mut vm, "(cdr '(1 2))"), "(2)");
        assert_eq!(eval_ok(&mut vm, "(nil? '())"), Value::Number(1.0));
    }

    #[test]
    fn test_runtime_errors() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(defun two (x y) x)");
        let cases = vec![
            ("(/ 1 0)", RuntimeErrorKind::DivisionByZero),
            ("(/ 1 2 0)", RuntimeErrorKind::DivisionByZero),
            ("unbound", RuntimeErrorKind::VariableNotFound),
            ("((+ 1 2) 3)", RuntimeErrorKind::NotAFunction),
            ("(car 5)", RuntimeErrorKind::NotACons),
            ("(+ 1 \"a\")", RuntimeErrorKind::NotANumber),
            ("((lambda (x) x) 1 2)", RuntimeErrorKind::ArgumentCountMismatch),
            ("(two 1)", RuntimeErrorKind::InvalidKey),
        ];
        for (source, expected) in cases {
            assert_eq!(runtime_kind(&mut vm, source), expected, "for '{source}'");
        }
    }

    #[test]
    fn test_stack_balance_across_programs() {
        // Every successful top-level program leaves exactly one operand;
        // execute() enforces it, so success here is the property.
        let mut vm = VM::new();
        let programs = vec![
            "42",
            "(set a 1)",
            "(defun id (x) x)",
            "(id 7)",
            "(if 1 (+ 1 2) (+ 3 4))",
            "(let ((x 1)) x)",
            "{ a 1 b 2 }",
            "'(1 2 3)",
            "(lambda (x) x)",
            "(set b { ... { p 1 } q 2 })",
        ];
        for source in programs {
            assert!(vm.eval(source).is_ok(), "program '{source}' failed");
        }
    }

    #[test]
    fn test_hand_built_define_func() {
        let mut vm = VM::new();
        let x = vm.heap_mut().intern("x");
        let code: Rc<[Instruction]> = vec![I::PushConst(7.0), I::DefineFunc(x), I::Return].into();
        // DefineFunc binds without consuming the operand.
        assert_eq!(vm.execute(code).unwrap(), Value::Number(7.0));
        assert_eq!(eval_ok(&mut vm, "x"), Value::Number(7.0));
    }

    #[test]
    fn test_hand_built_stack_errors() {
        let mut vm = VM::new();

        let code: Rc<[Instruction]> = vec![I::Dup].into();
        assert_eq!(
            vm.execute(code).unwrap_err().kind,
            RuntimeErrorKind::StackUnderflow
        );

        // Two residual operands violate the top-level contract.
        let code: Rc<[Instruction]> = vec![I::PushConst(1.0), I::PushConst(2.0), I::Return].into();
        assert_eq!(
            vm.execute(code).unwrap_err().kind,
            RuntimeErrorKind::InvalidResult
        );

        let code: Rc<[Instruction]> = vec![I::ExitScope].into();
        assert_eq!(
            vm.execute(code).unwrap_err().kind,
            RuntimeErrorKind::NoParentScope
        );

        // Arity below two on an arithmetic opcode is rejected.
        let code: Rc<[Instruction]> = vec![I::PushConst(1.0), I::Add(1), I::Return].into();
        assert_eq!(
            vm.execute(code).unwrap_err().kind,
            RuntimeErrorKind::ArgumentCountMismatch
        );
    }

    #[test]
    fn test_deep_recursion_and_gc_pressure() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(defun count (n) (if n (count (- n 1)) 0))");
        // Deep enough to pass the collection watermark while every frame
        // environment is still a live root.
        assert_eq!(eval_ok(&mut vm, "(count 2000)"), Value::Number(0.0));
    }

    #[test]
    fn test_collect_preserves_globals() {
        let mut vm = VM::new();
        eval_ok(&mut vm, "(set keep '(1 2 3))");
        eval_ok(&mut vm, "(len '(9 9 9 9))"); // quoted list becomes garbage
        let freed = vm.collect();
        assert!(freed >= 4, "expected the scratch list freed, got {freed}");
        assert_eq!(eval_ok(&mut vm, "(get keep 0)"), Value::Number(1.0));
        assert_eq!(eval_ok(&mut vm, "(get keep 2)"), Value::Number(3.0));
        assert_eq!(render_eval(&mut vm, "keep"), "(1 2 3)");
    }

    #[test]
    fn test_print_parse_round_trip() {
        let mut vm = VM::new();
        // (source, readback prefix) — heap lists read back through quote.
        let cases = vec![
            ("42", ""),
            ("-0.5", ""),
            ("\"tick\\ntock\"", ""),
            ("+", ""),
            ("(# 1 2 3)", ""),
            ("{ transpose 4 stepNumber 0 }", ""),
            ("'(1 2 (3 4))", "'"),
            ("'()", "'"),
        ];
        for (source, prefix) in cases {
            let first = eval_ok(&mut vm, source);
            let printed = vm.render(first);
            let readback = format!("{prefix}{printed}");
            let second = eval_ok(&mut vm, &readback);
            assert!(
                vm.heap().values_equal(first, second),
                "round trip failed for '{source}': printed '{printed}'"
            );
        }
    }
}
