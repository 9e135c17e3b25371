//! AST lowering.
//!
//! Purely syntax-directed: one post-order walk per expression leaving
//! exactly one value on the operand stack, statement forms expanded into
//! jump/label skeletons, and a buffered `main` collecting the free
//! top-level statements no matter how function definitions interleave with
//! them. The output stream goes straight into [`Program::build`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

use crate::ast;
use crate::bytecode::{FnKind, Label, Op, SourceInstruction, SourceItem};
use crate::program::{BuildError, Program};
use crate::syscall;

#[derive(Debug, PartialEq, Eq)]
pub enum CompileError {
    UndefinedName {
        name: String,
        line: usize,
        column: usize,
    },
    /// `return expr` in a proc (or in top-level code).
    ReturnValueFromProc {
        function: String,
        line: usize,
        column: usize,
    },
    /// Bare `return` inside a `fn`.
    ReturnWithoutValue {
        function: String,
        line: usize,
        column: usize,
    },
    /// A `fn` whose body can fall off the end.
    MissingReturn {
        function: String,
    },
    MalformedInt {
        value: String,
        line: usize,
        column: usize,
    },
    EmptyCharLiteral {
        line: usize,
        column: usize,
    },
    /// An operator token that is not a binary operator.
    UnsupportedOperator {
        op: Op,
    },
    Build(BuildError),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UndefinedName { name, line, column } => {
                write!(f, "{}:{}: Undefined name {}", line, column, name)
            }
            CompileError::ReturnValueFromProc {
                function,
                line,
                column,
            } => write!(
                f,
                "{}:{}: {} does not return a value",
                line, column, function
            ),
            CompileError::ReturnWithoutValue {
                function,
                line,
                column,
            } => write!(
                f,
                "{}:{}: return in function {} needs a value",
                line, column, function
            ),
            CompileError::MissingReturn { function } => {
                write!(f, "Function {} can end without returning a value", function)
            }
            CompileError::MalformedInt { value, line, column } => {
                write!(f, "{}:{}: Malformed integer literal {}", line, column, value)
            }
            CompileError::EmptyCharLiteral { line, column } => {
                write!(f, "{}:{}: Empty character literal", line, column)
            }
            CompileError::UnsupportedOperator { op } => {
                write!(f, "{} is not a binary operator", op)
            }
            CompileError::Build(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<BuildError> for CompileError {
    fn from(err: BuildError) -> Self {
        CompileError::Build(err)
    }
}

/// Lower an AST and build the resulting program.
pub fn compile(ast: &ast::Program) -> Result<Program, CompileError> {
    let mut compiler = Compiler::new();
    compiler.lower(ast)?;
    Ok(Program::build(compiler.finish())?)
}

/// Lexical scope of the function currently being lowered. Parameters come
/// pre-declared; locals appear at their first assignment.
struct Scope {
    function: String,
    kind: FnKind,
    params: Vec<String>,
    locals: BTreeSet<String>,
}

impl Scope {
    fn new(function: impl Into<String>, kind: FnKind, params: Vec<String>) -> Scope {
        Scope {
            function: function.into(),
            kind,
            params,
            locals: BTreeSet::new(),
        }
    }

    fn knows(&self, name: &str) -> bool {
        self.params.iter().any(|p| p == name) || self.locals.contains(name)
    }
}

/// Scratch local an unused statement result is stored into. The ISA has no
/// drop opcode, so this is how the operand stack stays balanced.
const DISCARD: &str = "__void";

struct Compiler {
    /// Lowered function definitions, in definition order.
    code: Vec<SourceItem>,
    /// Body of `main`, accumulated from free top-level statements.
    main: Vec<SourceItem>,
    main_scope: Option<Scope>,
    globals: BTreeSet<String>,
    /// Whether each defined function returns a value, for statement calls.
    signatures: BTreeMap<String, bool>,
    next_label: usize,
}

impl Compiler {
    fn new() -> Compiler {
        Compiler {
            code: Vec::new(),
            main: Vec::new(),
            main_scope: None,
            globals: BTreeSet::new(),
            signatures: BTreeMap::new(),
            next_label: 0,
        }
    }

    fn lower(&mut self, program: &ast::Program) -> Result<(), CompileError> {
        // Function kinds first: a statement-position call may reference a
        // function defined further down.
        for item in &program.items {
            if let ast::Item::Function(function) = item {
                self.signatures.insert(
                    function.name.value.clone(),
                    function.kind().returns_value(),
                );
            }
        }

        for item in &program.items {
            match item {
                ast::Item::Global(token) => {
                    self.globals.insert(token.value.clone());
                }
                ast::Item::Function(function) => self.lower_function(function)?,
                ast::Item::Stmt(stmt) => {
                    // First free statement opens main's body.
                    let mut scope = match self.main_scope.take() {
                        Some(scope) => scope,
                        None => {
                            self.main.push(SourceItem::label("main"));
                            self.main.push(
                                SourceInstruction::ENTER {
                                    kind: FnKind::Proc,
                                    params: vec![],
                                }
                                .into(),
                            );
                            Scope::new("main", FnKind::Proc, vec![])
                        }
                    };
                    let mut out = std::mem::take(&mut self.main);
                    let result = self.lower_stmt(stmt, &mut scope, &mut out);
                    self.main = out;
                    self.main_scope = Some(scope);
                    result?;
                }
            }
        }
        Ok(())
    }

    /// The finished stream: function definitions first, then `main` closed
    /// with the implicit successful exit.
    fn finish(mut self) -> Vec<SourceItem> {
        let mut source = std::mem::take(&mut self.code);
        if self.main_scope.is_some() {
            source.append(&mut self.main);
            source.push(SourceInstruction::CONST { value: 0 }.into());
            source.push(
                SourceInstruction::SYSCALL {
                    number: syscall::EXIT,
                }
                .into(),
            );
            source.push(SourceInstruction::LEAVE.into());
        }
        source
    }

    fn lower_function(&mut self, function: &ast::Function) -> Result<(), CompileError> {
        let kind = function.kind();
        let params: Vec<String> = function.params.iter().map(|p| p.value.clone()).collect();
        let mut scope = Scope::new(function.name.value.clone(), kind, params.clone());

        let mut out = vec![
            SourceItem::label(function.name.value.clone()),
            SourceInstruction::ENTER { kind, params }.into(),
        ];
        self.lower_block(&function.body, &mut scope, &mut out)?;

        match kind {
            FnKind::Proc => out.push(SourceInstruction::RET.into()),
            FnKind::Fn => {
                if !always_returns(&function.body) {
                    return Err(CompileError::MissingReturn {
                        function: scope.function,
                    });
                }
            }
        }
        out.push(SourceInstruction::LEAVE.into());
        self.code.extend(out);
        Ok(())
    }

    fn lower_block(
        &mut self,
        block: &ast::Block,
        scope: &mut Scope,
        out: &mut Vec<SourceItem>,
    ) -> Result<(), CompileError> {
        for stmt in &block.stmts {
            self.lower_stmt(stmt, scope, out)?;
        }
        Ok(())
    }

    fn lower_stmt(
        &mut self,
        stmt: &ast::Stmt,
        scope: &mut Scope,
        out: &mut Vec<SourceItem>,
    ) -> Result<(), CompileError> {
        match stmt {
            ast::Stmt::Assign { name, expr } => {
                self.lower_expr(expr, scope, out)?;
                self.store(&name.value, scope, out);
            }
            ast::Stmt::AssignAt { obj, index, expr } => {
                // list_set pops the list first, then the index, then the
                // value, so push in the opposite order.
                self.lower_expr(expr, scope, out)?;
                self.lower_expr(index, scope, out)?;
                self.lower_expr(obj, scope, out)?;
                out.push(
                    SourceInstruction::SYSCALL {
                        number: syscall::LIST_SET,
                    }
                    .into(),
                );
            }
            ast::Stmt::IfElse { arms, otherwise } => {
                let end = self.r#gen("if_end");
                for (cond, block) in arms {
                    let next = self.r#gen("if_false");
                    self.lower_expr(cond, scope, out)?;
                    out.push(SourceInstruction::JZ {
                        target: next.clone(),
                    }
                    .into());
                    self.lower_block(block, scope, out)?;
                    out.push(SourceInstruction::JMP { target: end.clone() }.into());
                    out.push(SourceItem::Label(next));
                }
                if let Some(block) = otherwise {
                    self.lower_block(block, scope, out)?;
                }
                out.push(SourceItem::Label(end));
            }
            ast::Stmt::While { cond, body } => {
                let cond_label = self.r#gen("while_cond");
                let body_label = self.r#gen("while_body");
                out.push(SourceInstruction::JMP {
                    target: cond_label.clone(),
                }
                .into());
                out.push(SourceItem::Label(body_label.clone()));
                self.lower_block(body, scope, out)?;
                out.push(SourceItem::Label(cond_label));
                self.lower_expr(cond, scope, out)?;
                out.push(SourceInstruction::JNZ { target: body_label }.into());
            }
            ast::Stmt::DoWhile { body, cond } => {
                let start = self.r#gen("do_while");
                out.push(SourceItem::Label(start.clone()));
                self.lower_block(body, scope, out)?;
                self.lower_expr(cond, scope, out)?;
                out.push(SourceInstruction::JNZ { target: start }.into());
            }
            ast::Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                let cond_label = self.r#gen("for_cond");
                let body_label = self.r#gen("for_body");
                self.lower_stmt(init, scope, out)?;
                out.push(SourceInstruction::JMP {
                    target: cond_label.clone(),
                }
                .into());
                out.push(SourceItem::Label(body_label.clone()));
                self.lower_block(body, scope, out)?;
                self.lower_stmt(step, scope, out)?;
                out.push(SourceItem::Label(cond_label));
                self.lower_expr(cond, scope, out)?;
                out.push(SourceInstruction::JNZ { target: body_label }.into());
            }
            ast::Stmt::Return { token, expr } => match (scope.kind, expr) {
                (FnKind::Fn, Some(expr)) => {
                    self.lower_expr(expr, scope, out)?;
                    out.push(SourceInstruction::RET.into());
                }
                (FnKind::Proc, None) => out.push(SourceInstruction::RET.into()),
                (FnKind::Proc, Some(_)) => {
                    return Err(CompileError::ReturnValueFromProc {
                        function: scope.function.clone(),
                        line: token.line,
                        column: token.column,
                    });
                }
                (FnKind::Fn, None) => {
                    return Err(CompileError::ReturnWithoutValue {
                        function: scope.function.clone(),
                        line: token.line,
                        column: token.column,
                    });
                }
            },
            ast::Stmt::Expr(expr) => {
                let unused_value = self.leaves_value(expr);
                self.lower_expr(expr, scope, out)?;
                if unused_value {
                    self.store(DISCARD, scope, out);
                }
            }
            ast::Stmt::Pass => {}
        }
        Ok(())
    }

    fn lower_expr(
        &mut self,
        expr: &ast::Expr,
        scope: &mut Scope,
        out: &mut Vec<SourceItem>,
    ) -> Result<(), CompileError> {
        match expr {
            ast::Expr::IntLit(token) => {
                let value =
                    token
                        .value
                        .parse()
                        .map_err(|_| CompileError::MalformedInt {
                            value: token.value.clone(),
                            line: token.line,
                            column: token.column,
                        })?;
                out.push(SourceInstruction::CONST { value }.into());
            }
            ast::Expr::CharLit(token) => {
                let c = token
                    .value
                    .chars()
                    .next()
                    .ok_or(CompileError::EmptyCharLiteral {
                        line: token.line,
                        column: token.column,
                    })?;
                out.push(SourceInstruction::CONST { value: c as i64 }.into());
            }
            ast::Expr::StrLit(token) => {
                let elements: Vec<i64> = token.value.chars().map(|c| c as i64).collect();
                self.lower_list(&elements, scope, out, |_, value, _, out| {
                    out.push(SourceInstruction::CONST { value: *value }.into());
                    Ok(())
                })?;
            }
            ast::Expr::ListLit(elements) => {
                self.lower_list(elements, scope, out, |compiler, element, scope, out| {
                    compiler.lower_expr(element, scope, out)
                })?;
            }
            ast::Expr::Var(token) => {
                if scope.knows(&token.value) {
                    out.push(SourceInstruction::LOAD {
                        name: token.value.clone(),
                    }
                    .into());
                } else if self.globals.contains(&token.value) {
                    out.push(SourceInstruction::GLOAD {
                        name: token.value.clone(),
                    }
                    .into());
                } else {
                    return Err(CompileError::UndefinedName {
                        name: token.value.clone(),
                        line: token.line,
                        column: token.column,
                    });
                }
            }
            ast::Expr::ListAt { obj, index } => {
                self.lower_expr(index, scope, out)?;
                self.lower_expr(obj, scope, out)?;
                out.push(
                    SourceInstruction::SYSCALL {
                        number: syscall::LIST_GET,
                    }
                    .into(),
                );
            }
            ast::Expr::Call { name, args } => {
                // Arguments go on the stack in reverse parameter order, so
                // the first pop lands in slot 0 (or rcx).
                for arg in args.iter().rev() {
                    self.lower_expr(arg, scope, out)?;
                }
                match syscall::by_name(&name.value) {
                    Some(syscall) => out.push(
                        SourceInstruction::SYSCALL {
                            number: syscall.number,
                        }
                        .into(),
                    ),
                    None => out.push(
                        SourceInstruction::CALL {
                            target: Label::new(name.value.clone()),
                        }
                        .into(),
                    ),
                }
            }
            ast::Expr::Binary { op, lhs, rhs } => {
                self.lower_expr(lhs, scope, out)?;
                self.lower_expr(rhs, scope, out)?;
                out.push(binop(*op)?.into());
            }
        }
        Ok(())
    }

    /// Shared skeleton of list and string literals: allocate an empty list,
    /// park it in a compiler temporary, push every element, reload the
    /// temporary as the expression's value.
    fn lower_list<T>(
        &mut self,
        elements: &[T],
        scope: &mut Scope,
        out: &mut Vec<SourceItem>,
        mut lower_element: impl FnMut(
            &mut Compiler,
            &T,
            &mut Scope,
            &mut Vec<SourceItem>,
        ) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let temp = format!("__list_{}", self.next_label);
        self.next_label += 1;

        out.push(
            SourceInstruction::SYSCALL {
                number: syscall::LIST,
            }
            .into(),
        );
        self.store(&temp, scope, out);
        for element in elements {
            lower_element(self, element, scope, out)?;
            out.push(SourceInstruction::LOAD { name: temp.clone() }.into());
            out.push(
                SourceInstruction::SYSCALL {
                    number: syscall::PUSH,
                }
                .into(),
            );
        }
        out.push(SourceInstruction::LOAD { name: temp }.into());
        Ok(())
    }

    /// Whether an expression in statement position leaves a value on the
    /// operand stack: calls to procs and to non-returning syscalls do not,
    /// everything else does.
    fn leaves_value(&self, expr: &ast::Expr) -> bool {
        match expr {
            ast::Expr::Call { name, .. } => match syscall::by_name(&name.value) {
                Some(syscall) => syscall.returns_value,
                None => self.signatures.get(&name.value).copied().unwrap_or(false),
            },
            _ => true,
        }
    }

    /// The assignment rule: known locals stay local, declared globals go to
    /// the global table, anything else becomes a fresh local of the current
    /// function.
    fn store(&mut self, name: &str, scope: &mut Scope, out: &mut Vec<SourceItem>) {
        if scope.knows(name) {
            out.push(SourceInstruction::STORE { name: name.into() }.into());
        } else if self.globals.contains(name) {
            out.push(SourceInstruction::GSTORE { name: name.into() }.into());
        } else {
            scope.locals.insert(name.into());
            out.push(SourceInstruction::STORE { name: name.into() }.into());
        }
    }

    fn r#gen(&mut self, base: &str) -> Label {
        let label = Label::new(format!("{}_{}", base, self.next_label));
        self.next_label += 1;
        label
    }
}

fn binop(op: Op) -> Result<SourceInstruction, CompileError> {
    Ok(match op {
        Op::ADD => SourceInstruction::ADD,
        Op::SUB => SourceInstruction::SUB,
        Op::MUL => SourceInstruction::MUL,
        Op::DIV => SourceInstruction::DIV,
        Op::MOD => SourceInstruction::MOD,
        Op::AND => SourceInstruction::AND,
        Op::OR => SourceInstruction::OR,
        Op::LT => SourceInstruction::LT,
        Op::LE => SourceInstruction::LE,
        Op::GT => SourceInstruction::GT,
        Op::GE => SourceInstruction::GE,
        Op::EQ => SourceInstruction::EQ,
        Op::NE => SourceInstruction::NE,
        _ => return Err(CompileError::UnsupportedOperator { op }),
    })
}

/// Does every path through the block end in `return`? Conservative and
/// structural: the last statement must be a `return`, or an if/else whose
/// arms (including a mandatory else) all do.
fn always_returns(block: &ast::Block) -> bool {
    match block.stmts.last() {
        Some(ast::Stmt::Return { .. }) => true,
        Some(ast::Stmt::IfElse { arms, otherwise }) => {
            otherwise.as_ref().is_some_and(always_returns)
                && arms.iter().all(|(_, arm)| always_returns(arm))
        }
        _ => false,
    }
}
