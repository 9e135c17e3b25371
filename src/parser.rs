//! Parser for the textual bytecode format.
//!
//! The grammar lives in `bytecode.pest`. Parsing returns a *built*
//! [`Program`], so `parse(render(p))` reproduces `p` structurally; build
//! inconsistencies in hand-written text (duplicate labels, unknown jump
//! targets, ...) surface as [`ParserError::Build`].

use std::fmt::{self, Display, Formatter};

use pest::Parser;
use pest::iterators::Pair;
use pest::Span;
use pest_derive::Parser;

use crate::bytecode::{FnKind, Label, SourceInstruction, SourceItem};
use crate::program::{BuildError, Program};

#[derive(Parser)]
#[grammar = "bytecode.pest"]
struct BytecodeParser;

pub type SyntaxError = pest::error::Error<Rule>;

#[derive(Debug)]
pub enum ParserError {
    Syntax(Box<SyntaxError>),
    Build(BuildError),
}

impl Display for ParserError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ParserError::Syntax(err) => write!(f, "{}", err),
            ParserError::Build(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ParserError {}

impl From<BuildError> for ParserError {
    fn from(err: BuildError) -> Self {
        ParserError::Build(err)
    }
}

impl From<SyntaxError> for ParserError {
    fn from(err: SyntaxError) -> Self {
        ParserError::Syntax(Box::new(err))
    }
}

fn custom_error(span: Span, message: String) -> ParserError {
    SyntaxError::new_from_span(pest::error::ErrorVariant::CustomError { message }, span).into()
}

pub fn parse(input: &str) -> Result<Program, ParserError> {
    let mut items = Vec::new();
    let program = BytecodeParser::parse(Rule::program, input)?.next().unwrap();

    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::label_def => {
                let name = pair.into_inner().next().unwrap();
                items.push(SourceItem::label(name.as_str()));
            }
            Rule::instruction => {
                let inner = pair.into_inner().next().unwrap();
                items.push(SourceItem::Instruction(instruction(inner)?));
            }
            Rule::EOI => {}
            _ => unreachable!(),
        }
    }

    Ok(Program::build(items)?)
}

fn instruction(pair: Pair<Rule>) -> Result<SourceInstruction, ParserError> {
    let rule = pair.as_rule();
    let mut pairs = pair.into_inner();

    Ok(match rule {
        Rule::mem_insn => {
            let kw = pairs.next().unwrap();
            let name = pairs.next().unwrap().as_str().to_string();
            match kw.as_rule() {
                Rule::kw_load => SourceInstruction::LOAD { name },
                Rule::kw_store => SourceInstruction::STORE { name },
                Rule::kw_gload => SourceInstruction::GLOAD { name },
                Rule::kw_gstore => SourceInstruction::GSTORE { name },
                _ => unreachable!(),
            }
        }
        Rule::const_insn => {
            pairs.next();
            let value = int(&pairs.next().unwrap())?;
            SourceInstruction::CONST { value }
        }
        Rule::jump_insn => {
            let kw = pairs.next().unwrap();
            let target = Label::new(pairs.next().unwrap().as_str());
            match kw.as_rule() {
                Rule::kw_jmp => SourceInstruction::JMP { target },
                Rule::kw_jz => SourceInstruction::JZ { target },
                Rule::kw_jnz => SourceInstruction::JNZ { target },
                Rule::kw_call => SourceInstruction::CALL { target },
                _ => unreachable!(),
            }
        }
        Rule::syscall_insn => {
            pairs.next();
            let number = pairs.next().unwrap();
            let number = number
                .as_str()
                .parse()
                .map_err(|_| custom_error(number.as_span(), "invalid syscall number".into()))?;
            SourceInstruction::SYSCALL { number }
        }
        Rule::enter_insn => {
            pairs.next();
            let tag = pairs.next().unwrap().into_inner().next().unwrap();
            let kind = match tag.as_rule() {
                Rule::kw_fn => FnKind::Fn,
                Rule::kw_proc => FnKind::Proc,
                _ => unreachable!(),
            };
            let params = match pairs.next() {
                Some(params) => params
                    .into_inner()
                    .map(|p| p.as_str().to_string())
                    .collect(),
                None => vec![],
            };
            SourceInstruction::ENTER { kind, params }
        }
        Rule::nullary_insn => {
            let kw = pairs.next().unwrap();
            match kw.as_rule() {
                Rule::kw_add => SourceInstruction::ADD,
                Rule::kw_sub => SourceInstruction::SUB,
                Rule::kw_mul => SourceInstruction::MUL,
                Rule::kw_div => SourceInstruction::DIV,
                Rule::kw_mod => SourceInstruction::MOD,
                Rule::kw_and => SourceInstruction::AND,
                Rule::kw_or => SourceInstruction::OR,
                Rule::kw_lt => SourceInstruction::LT,
                Rule::kw_le => SourceInstruction::LE,
                Rule::kw_gt => SourceInstruction::GT,
                Rule::kw_ge => SourceInstruction::GE,
                Rule::kw_eq => SourceInstruction::EQ,
                Rule::kw_ne => SourceInstruction::NE,
                Rule::kw_ret => SourceInstruction::RET,
                Rule::kw_leave => SourceInstruction::LEAVE,
                _ => unreachable!(),
            }
        }
        _ => unreachable!(),
    })
}

fn int(pair: &Pair<Rule>) -> Result<i64, ParserError> {
    pair.as_str()
        .parse()
        .map_err(|_| custom_error(pair.as_span(), format!("integer out of range: {}", pair.as_str())))
}
