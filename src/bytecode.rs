//! Descriptor of nox bytecode
//!
//! Instructions exist in two forms. [`SourceInstruction`] is what the
//! lowering and the text parser produce: memory operands are variable names
//! and jump targets are [`Label`]s, interleaved with label markers in a
//! [`SourceItem`] stream. [`Instruction`] is the resolved form the VM
//! executes and the image serializes: slots, global indices and instruction
//! indices. [`crate::program::Program::build`] turns the first into the
//! second.

use std::fmt::{self, Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Opcode tags. The numeric values are part of the binary image format and
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    // Memory ops
    LOAD = 1,
    STORE = 2,
    GLOAD = 3,
    GSTORE = 4,
    // Values
    CONST = 5,
    // Arithmetic ops
    ADD = 6,
    SUB = 7,
    MUL = 8,
    DIV = 9,
    MOD = 10,
    // Logic ops, all yield 0 or 1
    AND = 11,
    OR = 12,
    LT = 13,
    LE = 14,
    GT = 15,
    GE = 16,
    EQ = 17,
    NE = 18,
    // Jumps and calls
    JMP = 19,
    JZ = 20,
    JNZ = 21,
    CALL = 22,
    SYSCALL = 23,
    RET = 24,
    // Function boundaries
    ENTER = 25,
    LEAVE = 26,
}

impl Op {
    /// Lower-case mnemonic used by the text format.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::LOAD => "load",
            Op::STORE => "store",
            Op::GLOAD => "gload",
            Op::GSTORE => "gstore",
            Op::CONST => "const",
            Op::ADD => "add",
            Op::SUB => "sub",
            Op::MUL => "mul",
            Op::DIV => "div",
            Op::MOD => "mod",
            Op::AND => "and",
            Op::OR => "or",
            Op::LT => "lt",
            Op::LE => "le",
            Op::GT => "gt",
            Op::GE => "ge",
            Op::EQ => "eq",
            Op::NE => "ne",
            Op::JMP => "jmp",
            Op::JZ => "jz",
            Op::JNZ => "jnz",
            Op::CALL => "call",
            Op::SYSCALL => "syscall",
            Op::RET => "ret",
            Op::ENTER => "enter",
            Op::LEAVE => "leave",
        }
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// A symbolic jump target. Labels are either user-given (function names) or
/// generated by the lowering with a per-compilation counter; they must be
/// unique within a program and are eliminated by the build step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    pub name: String,
}

impl Label {
    pub fn new(name: impl Into<String>) -> Label {
        Label { name: name.into() }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Whether a function returns a value (`fn`) or not (`proc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Proc,
    Fn,
}

impl FnKind {
    pub fn returns_value(self) -> bool {
        matches!(self, FnKind::Fn)
    }
}

impl Display for FnKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FnKind::Proc => write!(f, "proc"),
            FnKind::Fn => write!(f, "fn"),
        }
    }
}

/// Pre-resolution instruction: operands are names and labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceInstruction {
    /// Push the named local (a parameter or a first-store local).
    LOAD { name: String },
    /// Pop into the named local.
    STORE { name: String },
    /// Push the named global.
    GLOAD { name: String },
    /// Pop into the named global.
    GSTORE { name: String },
    /// Push an immediate signed integer.
    CONST { value: i64 },
    ADD,
    SUB,
    MUL,
    DIV,
    MOD,
    AND,
    OR,
    LT,
    LE,
    GT,
    GE,
    EQ,
    NE,
    JMP { target: Label },
    JZ { target: Label },
    JNZ { target: Label },
    CALL { target: Label },
    SYSCALL { number: u32 },
    RET,
    /// Marks the start of a function body. Must immediately follow the label
    /// carrying the function's name; `params` are the parameter names in
    /// declaration order.
    ENTER { kind: FnKind, params: Vec<String> },
    /// Marks the end of a function body.
    LEAVE,
}

impl SourceInstruction {
    pub fn op(&self) -> Op {
        use SourceInstruction::*;
        match self {
            LOAD { .. } => Op::LOAD,
            STORE { .. } => Op::STORE,
            GLOAD { .. } => Op::GLOAD,
            GSTORE { .. } => Op::GSTORE,
            CONST { .. } => Op::CONST,
            ADD => Op::ADD,
            SUB => Op::SUB,
            MUL => Op::MUL,
            DIV => Op::DIV,
            MOD => Op::MOD,
            AND => Op::AND,
            OR => Op::OR,
            LT => Op::LT,
            LE => Op::LE,
            GT => Op::GT,
            GE => Op::GE,
            EQ => Op::EQ,
            NE => Op::NE,
            JMP { .. } => Op::JMP,
            JZ { .. } => Op::JZ,
            JNZ { .. } => Op::JNZ,
            CALL { .. } => Op::CALL,
            SYSCALL { .. } => Op::SYSCALL,
            RET => Op::RET,
            ENTER { .. } => Op::ENTER,
            LEAVE => Op::LEAVE,
        }
    }
}

/// Text rendering, one instruction per line without indentation.
/// `enter` prints its tag and parameter list the way the parser reads it
/// back: `enter fn(a, b)`.
impl Display for SourceInstruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use SourceInstruction::*;
        match self {
            LOAD { name } | STORE { name } | GLOAD { name } | GSTORE { name } => {
                write!(f, "{} {}", self.op(), name)
            }
            CONST { value } => write!(f, "const {}", value),
            JMP { target } | JZ { target } | JNZ { target } | CALL { target } => {
                write!(f, "{} {}", self.op(), target)
            }
            SYSCALL { number } => write!(f, "syscall {}", number),
            ENTER { kind, params } => write!(f, "enter {}({})", kind, params.join(", ")),
            _ => write!(f, "{}", self.op()),
        }
    }
}

/// One element of the pre-resolution stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    Label(Label),
    Instruction(SourceInstruction),
}

impl SourceItem {
    pub fn label(name: impl Into<String>) -> SourceItem {
        SourceItem::Label(Label::new(name))
    }
}

impl From<SourceInstruction> for SourceItem {
    fn from(instruction: SourceInstruction) -> SourceItem {
        SourceItem::Instruction(instruction)
    }
}

/// Resolved instruction: label-free, name-free, directly executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Push the current frame's slot `slot`.
    LOAD { slot: usize },
    /// Pop into the current frame's slot `slot`.
    STORE { slot: usize },
    /// Push global `slot`.
    GLOAD { slot: usize },
    /// Pop into global `slot`.
    GSTORE { slot: usize },
    CONST { value: i64 },
    ADD,
    SUB,
    MUL,
    DIV,
    MOD,
    AND,
    OR,
    LT,
    LE,
    GT,
    GE,
    EQ,
    NE,
    JMP { target: usize },
    /// Pop one value, jump if it is zero.
    JZ { target: usize },
    /// Pop one value, jump if it is non-zero.
    JNZ { target: usize },
    /// Push the return address, jump to the callee's `ENTER`.
    CALL { target: usize },
    SYSCALL { number: u32 },
    /// Drop the current frame and return to the caller.
    RET,
    /// Pop `n_args` values (first pop goes to slot 0) and open a frame of
    /// `n_args + n_locals` slots, the rest zero-initialized.
    ENTER {
        returns_value: bool,
        n_args: usize,
        n_locals: usize,
    },
    /// End-of-function marker, unreachable in a well-formed program.
    LEAVE,
}

impl Instruction {
    pub fn op(&self) -> Op {
        use Instruction::*;
        match self {
            LOAD { .. } => Op::LOAD,
            STORE { .. } => Op::STORE,
            GLOAD { .. } => Op::GLOAD,
            GSTORE { .. } => Op::GSTORE,
            CONST { .. } => Op::CONST,
            ADD => Op::ADD,
            SUB => Op::SUB,
            MUL => Op::MUL,
            DIV => Op::DIV,
            MOD => Op::MOD,
            AND => Op::AND,
            OR => Op::OR,
            LT => Op::LT,
            LE => Op::LE,
            GT => Op::GT,
            GE => Op::GE,
            EQ => Op::EQ,
            NE => Op::NE,
            JMP { .. } => Op::JMP,
            JZ { .. } => Op::JZ,
            JNZ { .. } => Op::JNZ,
            CALL { .. } => Op::CALL,
            SYSCALL { .. } => Op::SYSCALL,
            RET => Op::RET,
            ENTER { .. } => Op::ENTER,
            LEAVE => Op::LEAVE,
        }
    }
}

/// Metadata of one function discovered by the build step.
///
/// `start` points at the `ENTER` and `end` one past the `LEAVE`, both as
/// indices into the resolved instruction vector. `locals` is in first-store
/// order and does not repeat parameter names; slot `i` of the frame is
/// `args[i]` for `i < args.len()` and `locals[i - args.len()]` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fn {
    pub name: String,
    pub args: Vec<String>,
    pub locals: Vec<String>,
    pub returns_value: bool,
    pub start: usize,
    pub end: usize,
}

impl Fn {
    /// Frame slot of a parameter or local, if the name is one.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        if let Some(i) = self.args.iter().position(|a| a == name) {
            return Some(i);
        }
        self.locals
            .iter()
            .position(|l| l == name)
            .map(|i| self.args.len() + i)
    }

    pub fn frame_size(&self) -> usize {
        self.args.len() + self.locals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_stable() {
        assert_eq!(u8::from(Op::LOAD), 1);
        assert_eq!(u8::from(Op::CONST), 5);
        assert_eq!(u8::from(Op::NE), 18);
        assert_eq!(u8::from(Op::SYSCALL), 23);
        assert_eq!(u8::from(Op::LEAVE), 26);
        assert_eq!(Op::try_from(9u8), Ok(Op::DIV));
        assert!(Op::try_from(0u8).is_err());
        assert!(Op::try_from(27u8).is_err());
    }

    #[test]
    fn render_matches_text_format() {
        let enter = SourceInstruction::ENTER {
            kind: FnKind::Fn,
            params: vec!["a".into(), "b".into()],
        };
        assert_eq!(enter.to_string(), "enter fn(a, b)");

        let enter = SourceInstruction::ENTER {
            kind: FnKind::Proc,
            params: vec![],
        };
        assert_eq!(enter.to_string(), "enter proc()");

        assert_eq!(SourceInstruction::CONST { value: -3 }.to_string(), "const -3");
        assert_eq!(
            SourceInstruction::JNZ {
                target: Label::new("while_body_0")
            }
            .to_string(),
            "jnz while_body_0"
        );
        assert_eq!(SourceInstruction::ADD.to_string(), "add");
        assert_eq!(
            SourceInstruction::SYSCALL { number: 100 }.to_string(),
            "syscall 100"
        );
    }

    #[test]
    fn fn_slots_cover_args_then_locals() {
        let fun = Fn {
            name: "f".into(),
            args: vec!["x".into(), "y".into()],
            locals: vec!["t".into()],
            returns_value: true,
            start: 0,
            end: 5,
        };
        assert_eq!(fun.slot_of("x"), Some(0));
        assert_eq!(fun.slot_of("y"), Some(1));
        assert_eq!(fun.slot_of("t"), Some(2));
        assert_eq!(fun.slot_of("z"), None);
        assert_eq!(fun.frame_size(), 3);
    }
}
