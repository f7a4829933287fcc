//! Bytecode compiler.
//!
//! Walks a parsed [`Expr`] tree and appends typed instructions to a growable
//! buffer. Special forms (`set`, `defun`, `lambda`, `let`, `if`, the
//! variadic arithmetic operators) are resolved here; everything else in
//! operator position compiles to a function call. `if` emits placeholder
//! jump offsets that are patched once the target index is known — offsets
//! are relative to the jump instruction's own index and always point
//! forward.
//!
//! `lambda` and `defun` bodies compile into fresh buffers terminated by
//! `Return`; the resulting templates travel inside `PushFunc` /
//! `PushFuncDef` instructions and only become heap closures when the VM
//! executes them.

use std::fmt;
use std::rc::Rc;

use crate::heap::Heap;
use crate::parser::{Expr, ObjectEntry};
use crate::value::Pattern;
use crate::vm::{FuncDefTemplate, FuncTemplate, Instruction};

/// Categorizes compile failures.
#[derive(Debug, PartialEq, Clone)]
pub enum CompileErrorKind {
    /// Empty or structurally ill-formed form
    InvalidExpression,
    /// Non-symbol in the name position of a `set`
    InvalidOperator,
    /// Ill-formed `defun`
    InvalidFunctionDefinition,
    /// A `defun` parameter that is neither a symbol nor a number literal
    InvalidPattern,
    /// Ill-formed `lambda`
    InvalidLambda,
    /// A form the compiler cannot express (e.g. a quoted object literal)
    UnsupportedExpression,
}

#[derive(Debug, PartialEq, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    /// Rendered form of the offending expression
    pub expression: Option<String>,
}

impl CompileError {
    fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            expression: None,
        }
    }

    fn with_expression(mut self, expr: &Expr) -> Self {
        self.expression = Some(format!("{expr}"));
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compile error: {}", self.message)?;
        if let Some(expr) = &self.expression {
            write!(f, "\n  while compiling: {expr}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Compile one top-level expression to an executable instruction sequence.
/// The sequence always ends in `Return`, so every jump offset patched during
/// compilation lands on a real instruction.
pub fn compile(expr: &Expr, heap: &mut Heap) -> Result<Rc<[Instruction]>, CompileError> {
    let mut compiler = Compiler::new(heap);
    compiler.compile_expr(expr)?;
    compiler.emit(Instruction::Return);
    Ok(compiler.finish())
}

struct Compiler<'h> {
    code: Vec<Instruction>,
    heap: &'h mut Heap,
}

impl<'h> Compiler<'h> {
    fn new(heap: &'h mut Heap) -> Self {
        Compiler {
            code: Vec::new(),
            heap,
        }
    }

    fn emit(&mut self, instruction: Instruction) {
        self.code.push(instruction);
    }

    fn finish(self) -> Rc<[Instruction]> {
        self.code.into()
    }

    /// Patch a placeholder jump at `at` to land `offset` instructions ahead.
    fn patch_jump(&mut self, at: usize, offset: usize) {
        if let Some(Instruction::Jump(o) | Instruction::JumpIfFalse(o)) = self.code.get_mut(at) {
            *o = offset;
        }
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Number(n) => self.emit(Instruction::PushConst(*n)),
            Expr::Str(s) => self.emit(Instruction::PushConstString(s.clone())),
            Expr::Symbol(name) => {
                let symbol = self.heap.intern(name);
                self.emit(Instruction::LoadVar(symbol));
            }
            Expr::Quote(inner) => {
                check_quotable(inner)?;
                self.emit(Instruction::PushQuote(Rc::new((**inner).clone())));
            }
            Expr::Object(entries) => self.compile_object(entries)?,
            Expr::List(items) => self.compile_list(items, expr)?,
        }
        Ok(())
    }

    fn compile_object(&mut self, entries: &[ObjectEntry]) -> Result<(), CompileError> {
        self.emit(Instruction::PushEmptyObject);
        for entry in entries {
            match entry {
                ObjectEntry::Pair(key, value) => {
                    let symbol = self.heap.intern(key);
                    self.emit(Instruction::PushConstSymbol(symbol));
                    self.compile_expr(value)?;
                    self.emit(Instruction::CallObjSet);
                }
                ObjectEntry::Spread(value) => {
                    self.compile_expr(value)?;
                    self.emit(Instruction::CallObjMerge);
                }
            }
        }
        Ok(())
    }

    fn compile_list(&mut self, items: &[Expr], whole: &Expr) -> Result<(), CompileError> {
        let Some(head) = items.first() else {
            return Err(
                CompileError::new(CompileErrorKind::InvalidExpression, "empty application")
                    .with_expression(whole),
            );
        };
        match head {
            Expr::Symbol(name) => match name.as_str() {
                "set" => self.compile_set(items, whole),
                "defun" => self.compile_defun(items, whole),
                "lambda" => self.compile_lambda(items, whole),
                "let" => self.compile_let(items, whole),
                "if" => self.compile_if(items, whole),
                "+" => self.compile_arithmetic(items, whole, Instruction::Add),
                "-" => self.compile_arithmetic(items, whole, Instruction::Sub),
                "*" => self.compile_arithmetic(items, whole, Instruction::Mul),
                "/" => self.compile_arithmetic(items, whole, Instruction::Div),
                _ => self.compile_call(items),
            },
            // ((lambda ...) args) and other computed callees
            Expr::List(_) => self.compile_call(items),
            _ => Err(CompileError::new(
                CompileErrorKind::InvalidExpression,
                format!("cannot call {head}"),
            )
            .with_expression(whole)),
        }
    }

    /// `head` then each argument, then the call.
    fn compile_call(&mut self, items: &[Expr]) -> Result<(), CompileError> {
        for item in items {
            self.compile_expr(item)?;
        }
        self.emit(Instruction::Call(items.len() - 1));
        Ok(())
    }

    /// `(set NAME EXPR)` — bind and leave the value on the stack.
    fn compile_set(&mut self, items: &[Expr], whole: &Expr) -> Result<(), CompileError> {
        let [_, name, value] = items else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidExpression,
                "set takes a name and a value",
            )
            .with_expression(whole));
        };
        let Expr::Symbol(name) = name else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidOperator,
                format!("set target must be a symbol, got {name}"),
            )
            .with_expression(whole));
        };
        self.compile_expr(value)?;
        let symbol = self.heap.intern(name);
        self.emit(Instruction::Dup);
        self.emit(Instruction::StoreVar(symbol));
        Ok(())
    }

    /// `(defun NAME PATTERNS BODY)` — one pattern-dispatch arm. PATTERNS is
    /// a list of symbols and number literals, or a single bare pattern.
    fn compile_defun(&mut self, items: &[Expr], whole: &Expr) -> Result<(), CompileError> {
        let [_, name, patterns, body] = items else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidFunctionDefinition,
                "defun takes a name, a pattern list and a body",
            )
            .with_expression(whole));
        };
        let Expr::Symbol(name) = name else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidFunctionDefinition,
                format!("defun name must be a symbol, got {name}"),
            )
            .with_expression(whole));
        };

        let patterns = match patterns {
            Expr::List(entries) => {
                let mut compiled = Vec::with_capacity(entries.len());
                for entry in entries {
                    compiled.push(self.compile_pattern(entry, whole)?);
                }
                compiled
            }
            single => vec![self.compile_pattern(single, whole)?],
        };

        let code = self.compile_body(body)?;
        let symbol = self.heap.intern(name);
        self.emit(Instruction::PushFuncDef(Rc::new(FuncDefTemplate {
            patterns,
            code,
        })));
        self.emit(Instruction::DefineFuncDef(symbol));
        Ok(())
    }

    fn compile_pattern(&mut self, expr: &Expr, whole: &Expr) -> Result<Pattern, CompileError> {
        match expr {
            Expr::Symbol(name) => Ok(Pattern::Binding(self.heap.intern(name))),
            Expr::Number(n) => Ok(Pattern::Literal(*n)),
            other => Err(CompileError::new(
                CompileErrorKind::InvalidPattern,
                format!("patterns are symbols or number literals, got {other}"),
            )
            .with_expression(whole)),
        }
    }

    /// `(lambda (PARAMS) BODY)` — leaves the closure on the stack.
    fn compile_lambda(&mut self, items: &[Expr], whole: &Expr) -> Result<(), CompileError> {
        let [_, params, body] = items else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidLambda,
                "lambda takes a parameter list and a body",
            )
            .with_expression(whole));
        };
        let Expr::List(params) = params else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidLambda,
                format!("lambda parameters must be a list, got {params}"),
            )
            .with_expression(whole));
        };
        let mut names = Vec::with_capacity(params.len());
        for param in params {
            let Expr::Symbol(param) = param else {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidLambda,
                    format!("lambda parameters must be symbols, got {param}"),
                )
                .with_expression(whole));
            };
            names.push(self.heap.intern(param));
        }
        let code = self.compile_body(body)?;
        self.emit(Instruction::PushFunc(Rc::new(FuncTemplate {
            params: names,
            code,
        })));
        Ok(())
    }

    /// `(let ((N1 E1) (N2 E2) …) BODY)` — block scope; bindings see earlier
    /// bindings of the same `let`.
    fn compile_let(&mut self, items: &[Expr], whole: &Expr) -> Result<(), CompileError> {
        let [_, bindings, body] = items else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidExpression,
                "let takes a binding list and a body",
            )
            .with_expression(whole));
        };
        let Expr::List(bindings) = bindings else {
            return Err(CompileError::new(
                CompileErrorKind::InvalidExpression,
                format!("let bindings must be a list, got {bindings}"),
            )
            .with_expression(whole));
        };
        self.emit(Instruction::EnterScope);
        for binding in bindings {
            let Expr::List(pair) = binding else {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidExpression,
                    format!("let binding must be a (name value) pair, got {binding}"),
                )
                .with_expression(whole));
            };
            let [name, value] = pair.as_slice() else {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidExpression,
                    format!("let binding must be a (name value) pair, got {binding}"),
                )
                .with_expression(whole));
            };
            let Expr::Symbol(name) = name else {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidExpression,
                    format!("let binding name must be a symbol, got {name}"),
                )
                .with_expression(whole));
            };
            self.compile_expr(value)?;
            let symbol = self.heap.intern(name);
            self.emit(Instruction::StoreVar(symbol));
        }
        self.compile_expr(body)?;
        self.emit(Instruction::ExitScope);
        Ok(())
    }

    /// `(if COND THEN [ELSE])` — a missing ELSE yields nil.
    fn compile_if(&mut self, items: &[Expr], whole: &Expr) -> Result<(), CompileError> {
        let (condition, then_branch, else_branch) = match items {
            [_, condition, then_branch] => (condition, then_branch, None),
            [_, condition, then_branch, else_branch] => {
                (condition, then_branch, Some(else_branch))
            }
            _ => {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidExpression,
                    "if takes a condition, a then-branch and an optional else-branch",
                )
                .with_expression(whole));
            }
        };

        self.compile_expr(condition)?;
        let jump_to_else = self.code.len();
        self.emit(Instruction::JumpIfFalse(0)); // patched below
        self.compile_expr(then_branch)?;
        let jump_to_end = self.code.len();
        self.emit(Instruction::Jump(0)); // patched below

        let else_start = self.code.len();
        self.patch_jump(jump_to_else, else_start - jump_to_else);
        match else_branch {
            Some(expr) => self.compile_expr(expr)?,
            // The quoted empty list materializes as nil.
            None => self.emit(Instruction::PushQuote(Rc::new(Expr::List(Vec::new())))),
        }
        let end = self.code.len();
        self.patch_jump(jump_to_end, end - jump_to_end);
        Ok(())
    }

    /// Variadic `+ - * /` fold into a single opcode carrying the operand
    /// count; fewer than two operands is an error.
    fn compile_arithmetic(
        &mut self,
        items: &[Expr],
        whole: &Expr,
        make: fn(usize) -> Instruction,
    ) -> Result<(), CompileError> {
        let operands = &items[1..];
        if operands.len() < 2 {
            return Err(CompileError::new(
                CompileErrorKind::InvalidExpression,
                "arithmetic operators take at least two operands",
            )
            .with_expression(whole));
        }
        for operand in operands {
            self.compile_expr(operand)?;
        }
        self.emit(make(operands.len()));
        Ok(())
    }

    /// Bodies of `lambda`/`defun` compile into their own buffer ending in
    /// `Return`.
    fn compile_body(&mut self, body: &Expr) -> Result<Rc<[Instruction]>, CompileError> {
        let mut sub = Compiler::new(&mut *self.heap);
        sub.compile_expr(body)?;
        sub.emit(Instruction::Return);
        Ok(sub.finish())
    }
}

/// Quote payloads are carried in the instruction stream, outside the GC
/// heap; object literals cannot travel there.
fn check_quotable(expr: &Expr) -> Result<(), CompileError> {
    match expr {
        Expr::Number(_) | Expr::Str(_) | Expr::Symbol(_) => Ok(()),
        Expr::Quote(inner) => check_quotable(inner),
        Expr::List(items) => {
            for item in items {
                check_quotable(item)?;
            }
            Ok(())
        }
        Expr::Object(_) => Err(CompileError::new(
            CompileErrorKind::UnsupportedExpression,
            "object literals cannot be quoted",
        )
        .with_expression(expr)),
    }
}
