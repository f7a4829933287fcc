//! StepLisp - embeddable scripting engine for sequencing hosts
//!
//! This crate provides a small Lisp-family language a host audio/sequencing
//! application embeds to script patterns and steps. Programs are
//! S-expressions over numbers, symbols, strings, lists, float vectors and
//! JavaScript-style objects with a spread merge syntax:
//!
//! ```lisp
//! (set step { stepNumber 0 time 123 })
//! (set step2 { ... step transpose 4 })
//! (get step2 "transpose")              ; => 4
//!
//! (defun f 0 1)                        ; literal-pattern arm
//! (defun f (n) (* n (f (- n 1))))      ; symbol-pattern arm
//! (f 3)                                ; => 6
//!
//! (@reduce + (# 1 2 3 4 5))            ; => 15
//! ```
//!
//! The engine parses source to an AST, compiles each expression to a linear
//! instruction sequence, and runs it on a stack-based virtual machine with
//! lexically scoped environments, first-class closures, named functions
//! dispatched by argument pattern, and a tracing mark-sweep garbage
//! collector that owns every compound value.
//!
//! ## Embedding
//!
//! ```
//! use steplisp::vm::VM;
//!
//! let mut vm = VM::new();
//! vm.eval("(defun sq (x) (* x x))").unwrap();
//! let result = vm.eval("(sq 5)").unwrap();
//! assert_eq!(vm.render(result), "25");
//! ```
//!
//! Global definitions persist across `eval` calls; the REPL binary is a thin
//! loop over the same surface. With the `json` feature the host can bind
//! JSON documents (step and pattern data) as script-visible objects.
//!
//! ## Modules
//!
//! - `parser`: source text to expression trees
//! - `compiler`: expression trees to instruction sequences
//! - `vm`: the instruction set and execution engine
//! - `heap`: the garbage-collected heap and symbol interner
//! - `builtins`: the native function table
//! - `json`: host data bridge (feature `json`)

use std::fmt;

/// Maximum parser recursion depth; deeper nesting is rejected rather than
/// risking a host stack overflow on hostile input.
pub const MAX_PARSE_DEPTH: usize = 64;

/// Categorizes the different kinds of parse failures.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Input ended before the expression was complete
    UnexpectedEof,
    /// An object literal entry whose key position is not a symbol
    InvalidObjectKey,
    /// Invalid or unexpected syntax
    InvalidSyntax,
    /// Extra input after a complete expression
    TrailingContent,
}

/// A structured parse failure with a context snippet from the input.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Snippet of the input around the failure point
    pub context: Option<String>,
}

impl ParseError {
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Build an error carrying a snippet of `input` around `offset`.
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 60;

        let start = offset.saturating_sub(20);
        let snippet: String = input.chars().skip(start).take(MAX_CONTEXT).collect();

        let mut context = String::new();
        if start > 0 {
            context.push_str("[...]");
        }
        context.push_str(&snippet);
        if start + snippet.len() < input.len() {
            context.push_str("[...]");
        }
        let context = context.replace('\n', "\\n");

        ParseError {
            kind,
            message: message.into(),
            context: Some(context),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Parse error: {}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\n  near: {context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Top-level error type: every failure surfaced to the embedder is one of
/// these. All errors are fatal to the current evaluation; the engine itself
/// stays usable for the next input.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    Parse(ParseError),
    Compile(compiler::CompileError),
    Runtime(vm::RuntimeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(e) => write!(f, "{e}"),
            Error::Compile(e) => write!(f, "{e}"),
            Error::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

impl From<compiler::CompileError> for Error {
    fn from(e: compiler::CompileError) -> Self {
        Error::Compile(e)
    }
}

impl From<vm::RuntimeError> for Error {
    fn from(e: vm::RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

pub mod builtins;
pub mod compiler;
pub mod env;
pub mod heap;
pub mod parser;
pub mod value;
pub mod vm;

#[cfg(feature = "json")]
pub mod json;

pub use value::Value;
pub use vm::VM;
