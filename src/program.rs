//! Program image and the build procedure.
//!
//! [`Program::build`] consumes a pre-resolution stream (labels interleaved
//! with symbolic instructions) and produces the immutable, resolved image:
//! globals collected and sorted, functions discovered from their
//! `enter`/`leave` brackets, memory operands rewritten to slots, jump
//! targets rewritten to instruction indices. Any inconsistency is a fatal
//! [`BuildError`]; no partial program is ever produced.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use crate::bytecode::{Fn, FnKind, Instruction, SourceInstruction, SourceItem};

/// Label of the function execution starts at.
pub const ENTRYPOINT: &str = "main";

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    DuplicateLabel(String),
    UndefinedLabel(String),
    UndefinedVariable {
        name: String,
        function: Option<String>,
    },
    EnterWithoutLabel {
        index: usize,
    },
    NestedEnter {
        function: String,
    },
    StrayLeave {
        index: usize,
    },
    MissingLeave {
        function: String,
    },
    MissingEntry,
}

impl Display for BuildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::DuplicateLabel(name) => write!(f, "Label {} defined twice", name),
            BuildError::UndefinedLabel(name) => write!(f, "Jump or call to undefined label {}", name),
            BuildError::UndefinedVariable {
                name,
                function: Some(function),
            } => write!(f, "Undefined variable {} in function {}", name, function),
            BuildError::UndefinedVariable { name, function: None } => {
                write!(f, "Memory access to {} outside of any function", name)
            }
            BuildError::EnterWithoutLabel { index } => {
                write!(f, "enter at instruction {} is not preceded by a label", index)
            }
            BuildError::NestedEnter { function } => {
                write!(f, "enter inside the body of function {}", function)
            }
            BuildError::StrayLeave { index } => {
                write!(f, "leave at instruction {} outside of any function", index)
            }
            BuildError::MissingLeave { function } => {
                write!(f, "Function {} has no leave", function)
            }
            BuildError::MissingEntry => write!(f, "No {} function", ENTRYPOINT),
        }
    }
}

impl std::error::Error for BuildError {}

/// A built program. Immutable; may be shared across interpreter runs.
///
/// `source` is the pre-resolution stream retained verbatim for reflection
/// and text rendering, `instructions` the label-free vector that actually
/// executes. `globals` is sorted lexicographically and `entry` is the
/// resolved index of `main`'s `enter`.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub source: Vec<SourceItem>,
    pub instructions: Vec<Instruction>,
    pub globals: Vec<String>,
    pub functions: BTreeMap<String, Fn>,
    pub entry: usize,
}

/// Function bracket being scanned, before its `leave` is found.
struct OpenFn {
    name: String,
    kind: FnKind,
    params: Vec<String>,
    locals: Vec<String>,
    start: usize,
}

impl Program {
    pub fn build(source: Vec<SourceItem>) -> Result<Program, BuildError> {
        let globals = list_globals(&source);
        let labels = resolve_labels(&source)?;
        let functions = list_functions(&source)?;

        // Spans ordered by start, for tracking the enclosing function while
        // resolving. Functions never nest or overlap.
        let mut spans: Vec<&Fn> = functions.values().collect();
        spans.sort_by_key(|fun| fun.start);

        let mut instructions = Vec::new();
        let mut current: Option<&Fn> = None;
        let mut next_span = 0;

        for item in &source {
            let instruction = match item {
                SourceItem::Label(_) => continue,
                SourceItem::Instruction(instruction) => instruction,
            };
            let index = instructions.len();

            if current.is_some_and(|fun| index >= fun.end) {
                current = None;
            }
            if next_span < spans.len() && spans[next_span].start == index {
                current = Some(spans[next_span]);
                next_span += 1;
            }

            instructions.push(resolve(instruction, current, &globals, &labels)?);
        }

        let entry = *labels.get(ENTRYPOINT).ok_or(BuildError::MissingEntry)?;
        Ok(Program {
            source,
            instructions,
            globals,
            functions,
            entry,
        })
    }

    /// The function whose body contains the resolved instruction `index`.
    pub fn function_of(&self, index: usize) -> Option<&Fn> {
        self.functions
            .values()
            .find(|fun| fun.start <= index && index < fun.end)
    }
}

/// Collect the operand of every `gload`/`gstore` into the sorted global
/// list.
fn list_globals(source: &[SourceItem]) -> Vec<String> {
    let mut globals = std::collections::BTreeSet::new();
    for item in source {
        if let SourceItem::Instruction(
            SourceInstruction::GLOAD { name } | SourceInstruction::GSTORE { name },
        ) = item
        {
            globals.insert(name.clone());
        }
    }
    globals.into_iter().collect()
}

/// Map each label to the instruction index it will occupy once labels are
/// removed. Duplicates are an error.
fn resolve_labels(source: &[SourceItem]) -> Result<BTreeMap<String, usize>, BuildError> {
    let mut labels = BTreeMap::new();
    for (i, item) in source.iter().enumerate() {
        if let SourceItem::Label(label) = item {
            let index = i - labels.len();
            if labels.insert(label.name.clone(), index).is_some() {
                return Err(BuildError::DuplicateLabel(label.name.clone()));
            }
        }
    }
    Ok(labels)
}

/// Discover function brackets: the label before each `enter` names the
/// function, each `store` of a fresh non-parameter name appends a local,
/// `leave` closes the bracket. Indices recorded are into the resolved
/// vector.
fn list_functions(source: &[SourceItem]) -> Result<BTreeMap<String, Fn>, BuildError> {
    let mut functions = BTreeMap::new();
    let mut open: Option<OpenFn> = None;
    let mut index = 0;

    for (i, item) in source.iter().enumerate() {
        let instruction = match item {
            SourceItem::Label(_) => continue,
            SourceItem::Instruction(instruction) => instruction,
        };

        match instruction {
            SourceInstruction::ENTER { kind, params } => {
                if let Some(open) = &open {
                    return Err(BuildError::NestedEnter {
                        function: open.name.clone(),
                    });
                }
                let name = match i.checked_sub(1).map(|p| &source[p]) {
                    Some(SourceItem::Label(label)) => label.name.clone(),
                    _ => return Err(BuildError::EnterWithoutLabel { index }),
                };
                open = Some(OpenFn {
                    name,
                    kind: *kind,
                    params: params.clone(),
                    locals: Vec::new(),
                    start: index,
                });
            }
            SourceInstruction::STORE { name } => {
                if let Some(open) = &mut open
                    && !open.params.iter().any(|p| p == name)
                    && !open.locals.iter().any(|l| l == name)
                {
                    open.locals.push(name.clone());
                }
            }
            SourceInstruction::LEAVE => {
                let closed = open.take().ok_or(BuildError::StrayLeave { index })?;
                functions.insert(
                    closed.name.clone(),
                    Fn {
                        name: closed.name,
                        args: closed.params,
                        locals: closed.locals,
                        returns_value: closed.kind.returns_value(),
                        start: closed.start,
                        end: index + 1,
                    },
                );
            }
            _ => {}
        }
        index += 1;
    }

    match open {
        Some(open) => Err(BuildError::MissingLeave { function: open.name }),
        None => Ok(functions),
    }
}

fn resolve(
    instruction: &SourceInstruction,
    current: Option<&Fn>,
    globals: &[String],
    labels: &BTreeMap<String, usize>,
) -> Result<Instruction, BuildError> {
    use SourceInstruction as S;

    let local_slot = |name: &str| {
        current
            .and_then(|fun| fun.slot_of(name))
            .ok_or_else(|| BuildError::UndefinedVariable {
                name: name.to_string(),
                function: current.map(|fun| fun.name.clone()),
            })
    };
    let global_slot = |name: &str| {
        globals
            .iter()
            .position(|g| g == name)
            .ok_or_else(|| BuildError::UndefinedVariable {
                name: name.to_string(),
                function: None,
            })
    };
    let target = |label: &crate::bytecode::Label| {
        labels
            .get(&label.name)
            .copied()
            .ok_or_else(|| BuildError::UndefinedLabel(label.name.clone()))
    };

    Ok(match instruction {
        S::LOAD { name } => Instruction::LOAD { slot: local_slot(name)? },
        S::STORE { name } => Instruction::STORE { slot: local_slot(name)? },
        S::GLOAD { name } => Instruction::GLOAD { slot: global_slot(name)? },
        S::GSTORE { name } => Instruction::GSTORE { slot: global_slot(name)? },
        S::CONST { value } => Instruction::CONST { value: *value },
        S::ADD => Instruction::ADD,
        S::SUB => Instruction::SUB,
        S::MUL => Instruction::MUL,
        S::DIV => Instruction::DIV,
        S::MOD => Instruction::MOD,
        S::AND => Instruction::AND,
        S::OR => Instruction::OR,
        S::LT => Instruction::LT,
        S::LE => Instruction::LE,
        S::GT => Instruction::GT,
        S::GE => Instruction::GE,
        S::EQ => Instruction::EQ,
        S::NE => Instruction::NE,
        S::JMP { target: t } => Instruction::JMP { target: target(t)? },
        S::JZ { target: t } => Instruction::JZ { target: target(t)? },
        S::JNZ { target: t } => Instruction::JNZ { target: target(t)? },
        S::CALL { target: t } => Instruction::CALL { target: target(t)? },
        S::SYSCALL { number } => Instruction::SYSCALL { number: *number },
        S::RET => Instruction::RET,
        S::ENTER { kind, params } => {
            // The discovery pass has a record for every enter it accepted.
            let fun = current.ok_or(BuildError::EnterWithoutLabel { index: 0 })?;
            debug_assert_eq!(params.len(), fun.args.len());
            Instruction::ENTER {
                returns_value: kind.returns_value(),
                n_args: fun.args.len(),
                n_locals: fun.locals.len(),
            }
        }
        S::LEAVE => Instruction::LEAVE,
    })
}

/// Renders the retained source stream in the textual bytecode format:
/// labels flush left with a trailing colon, instructions indented.
impl Display for Program {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, item) in self.source.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match item {
                SourceItem::Label(label) => write!(f, "{}:", label)?,
                SourceItem::Instruction(instruction) => write!(f, "    {}", instruction)?,
            }
        }
        Ok(())
    }
}
