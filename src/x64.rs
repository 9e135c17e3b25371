//! x64 backend: Windows-x64 NASM assembly from a resolved program.
//!
//! The register allocator mirrors the VM's operand stack at compile time.
//! Every virtual push takes a register from the free pool, or a fresh
//! `rbp`-relative slot past the locals area once the pool is dry; every
//! virtual pop returns registers to the pool. There is no liveness
//! analysis: the uniform post-order lowering keeps the virtual stack
//! consistent at every jump target.
//!
//! Register roles:
//! - `rax` carries return values and the `idiv` quotient, `rdx` the
//!   remainder. `rdx` doubles as the second argument register, so it is
//!   saved around the `idiv` sequence whenever it holds a parameter.
//! - `rcx`, `rdx`, `r8`, `r9` are the Windows x64 argument registers; a
//!   function's first four parameters live there for its whole body.
//! - `r10` is scratch for memory-to-memory transfers.
//! - Everything else (`rbx`, `rsi`, `rdi`, `r11`-`r15`) belongs to the
//!   operand scheduler.
//!
//! The output expects to be linked against a runtime providing `sys_setup`
//! and one `sys_<name>` trampoline per syscall the program uses.
//!
//! Violated assumptions (more than four parameters, operands left on the
//! virtual stack at `ret`) are panics: this backend has no runtime error
//! channel of its own.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use crate::bytecode::{SourceInstruction, SourceItem};
use crate::program::{ENTRYPOINT, Program};
use crate::syscall;

const WORD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg {
    RAX,
    RCX,
    RDX,
    RBX,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    fn name(self) -> &'static str {
        match self {
            Reg::RAX => "rax",
            Reg::RCX => "rcx",
            Reg::RDX => "rdx",
            Reg::RBX => "rbx",
            Reg::RSI => "rsi",
            Reg::RDI => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }

    /// Low byte name, for `setcc`.
    fn byte_name(self) -> &'static str {
        match self {
            Reg::RAX => "al",
            Reg::RCX => "cl",
            Reg::RDX => "dl",
            Reg::RBX => "bl",
            Reg::RSI => "sil",
            Reg::RDI => "dil",
            Reg::R8 => "r8b",
            Reg::R9 => "r9b",
            Reg::R10 => "r10b",
            Reg::R11 => "r11b",
            Reg::R12 => "r12b",
            Reg::R13 => "r13b",
            Reg::R14 => "r14b",
            Reg::R15 => "r15b",
        }
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Windows x64 argument registers, in parameter order.
const ARG_REGS: [Reg; 4] = [Reg::RCX, Reg::RDX, Reg::R8, Reg::R9];

/// Scratch for operations whose operands are both in memory.
const TMP: Reg = Reg::R10;

/// The operand scheduler's pool; allocation pops from the back, so `rbx`
/// goes first.
const POOL: [Reg; 8] = [
    Reg::R15,
    Reg::R14,
    Reg::R13,
    Reg::R12,
    Reg::R11,
    Reg::RDI,
    Reg::RSI,
    Reg::RBX,
];

/// One slot of the virtual operand stack: a pool register, or the stack
/// slot `n` words below `rbp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Reg(Reg),
    Stack(usize),
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Stack(slot) => write!(f, "qword [rbp - {}]", slot * WORD_SIZE),
        }
    }
}

impl Operand {
    /// Byte-sized rendering, for `setcc` destinations.
    fn byte(self) -> String {
        match self {
            Operand::Reg(reg) => reg.byte_name().to_string(),
            Operand::Stack(slot) => format!("byte [rbp - {}]", slot * WORD_SIZE),
        }
    }
}

/// Function bracket in source-stream coordinates. The backend walks
/// `program.source` so it can emit label names and resolve variable names;
/// spans are recomputed here because [`crate::bytecode::Fn`] records
/// resolved-vector indices.
struct FnSpan {
    name: String,
    args: Vec<String>,
    locals: Vec<String>,
    returns_value: bool,
    start: usize,
    end: usize,
}

impl FnSpan {
    fn frame_size(&self) -> usize {
        self.args.len() + self.locals.len()
    }
}

fn function_spans(source: &[SourceItem]) -> Vec<FnSpan> {
    let mut spans = Vec::new();
    let mut open: Option<FnSpan> = None;

    for (i, item) in source.iter().enumerate() {
        let SourceItem::Instruction(instruction) = item else {
            continue;
        };
        match instruction {
            SourceInstruction::ENTER { kind, params } => {
                let name = match i.checked_sub(1).map(|p| &source[p]) {
                    Some(SourceItem::Label(label)) => label.name.clone(),
                    _ => unreachable!("enter without a preceding label survived the build"),
                };
                open = Some(FnSpan {
                    name,
                    args: params.clone(),
                    locals: Vec::new(),
                    returns_value: kind.returns_value(),
                    start: i,
                    end: 0,
                });
            }
            SourceInstruction::STORE { name } => {
                if let Some(span) = &mut open
                    && !span.args.iter().any(|a| a == name)
                    && !span.locals.iter().any(|l| l == name)
                {
                    span.locals.push(name.clone());
                }
            }
            SourceInstruction::LEAVE => {
                let mut span = open.take().expect("leave without enter survived the build");
                span.end = i + 1;
                spans.push(span);
            }
            _ => {}
        }
    }
    spans
}

/// Compile a resolved program to NASM text. Running this twice on the same
/// program yields the same text.
pub fn compile(program: &Program) -> String {
    Compiler::new(program).compile()
}

struct Compiler<'p> {
    program: &'p Program,
    spans: Vec<FnSpan>,
    current: usize,
    listing: String,
    /// Free scheduler registers; allocation pops from the back.
    free: Vec<Reg>,
    /// Compile-time mirror of the VM operand stack.
    stack: Vec<Operand>,
    /// Slots below `rbp` taken by the current function's locals.
    frame_base: usize,
    /// Deepest slot the function ever touches; sizes the stack frame.
    max_slot: usize,
}

impl<'p> Compiler<'p> {
    fn new(program: &'p Program) -> Self {
        Compiler {
            program,
            spans: function_spans(&program.source),
            current: 0,
            listing: String::new(),
            free: POOL.to_vec(),
            stack: Vec::new(),
            frame_base: 0,
            max_slot: 0,
        }
    }

    fn compile(mut self) -> String {
        self.header();
        if !self.program.globals.is_empty() {
            self.line("section .data");
            for global in &self.program.globals {
                self.line(&format!("{}: dq 0", global));
            }
            self.line("");
        }
        self.line("section .text");
        for index in 0..self.spans.len() {
            self.compile_function(index);
        }
        self.listing
    }

    fn header(&mut self) {
        self.line(&format!("global {}", ENTRYPOINT));
        self.line("extern sys_setup");
        let used: BTreeSet<u32> = self
            .program
            .source
            .iter()
            .filter_map(|item| match item {
                SourceItem::Instruction(SourceInstruction::SYSCALL { number }) => Some(*number),
                _ => None,
            })
            .collect();
        for number in used {
            let syscall = syscall::by_number(number)
                .unwrap_or_else(|| panic!("no trampoline for syscall {}", number));
            self.line(&format!("extern {}", syscall.extern_symbol()));
        }
        self.line("");
    }

    fn compile_function(&mut self, index: usize) {
        self.current = index;
        self.free = POOL.to_vec();
        self.stack.clear();

        let span = &self.spans[index];
        assert!(
            span.args.len() <= ARG_REGS.len(),
            "Too many args (pass through stack is not implemented)"
        );
        self.frame_base = span.frame_size();
        self.max_slot = self.frame_base;

        let (name, start, end) = (span.name.clone(), span.start, span.end);
        self.line(&format!("{}:", name));
        for i in start..end {
            match self.program.source[i].clone() {
                SourceItem::Label(label) => self.line(&format!("{}:", label.name)),
                SourceItem::Instruction(instruction) => self.instruction(&instruction),
            }
        }
    }

    fn instruction(&mut self, instruction: &SourceInstruction) {
        use SourceInstruction::*;

        match instruction {
            CONST { value } => {
                let dst = self.allocate();
                if matches!(dst, Operand::Stack(_)) && i32::try_from(*value).is_err() {
                    self.asm(&format!("mov {}, {}", TMP, value));
                    self.asm(&format!("mov {}, {}", dst, TMP));
                } else {
                    self.asm(&format!("mov {}, {}", dst, value));
                }
            }
            LOAD { name } => {
                let src = self.location(name);
                let dst = self.allocate();
                self.mov(dst, src);
            }
            STORE { name } => {
                let top = self.pop();
                let dst = self.location(name);
                self.mov(dst, top);
            }
            GLOAD { name } => {
                let dst = self.allocate();
                match dst {
                    Operand::Reg(_) => self.asm(&format!("mov {}, [rel {}]", dst, name)),
                    Operand::Stack(_) => {
                        self.asm(&format!("mov {}, [rel {}]", TMP, name));
                        self.asm(&format!("mov {}, {}", dst, TMP));
                    }
                }
            }
            GSTORE { name } => {
                let top = self.pop();
                match top {
                    Operand::Reg(_) => self.asm(&format!("mov [rel {}], {}", name, top)),
                    Operand::Stack(_) => {
                        self.asm(&format!("mov {}, {}", TMP, top));
                        self.asm(&format!("mov [rel {}], {}", name, TMP));
                    }
                }
            }
            ADD => self.arith("add"),
            SUB => self.arith("sub"),
            MUL => self.arith("imul"),
            DIV => self.divide("rax"),
            MOD => self.divide("rdx"),
            AND => self.logic("and"),
            OR => self.logic("or"),
            LT => self.compare("setl"),
            LE => self.compare("setle"),
            GT => self.compare("setg"),
            GE => self.compare("setge"),
            EQ => self.compare("sete"),
            NE => self.compare("setne"),
            JMP { target } => self.asm(&format!("jmp {}", target)),
            JZ { target } => {
                let value = self.pop();
                self.test(value);
                self.asm(&format!("jz {}", target));
            }
            JNZ { target } => {
                let value = self.pop();
                self.test(value);
                self.asm(&format!("jnz {}", target));
            }
            CALL { target } => {
                let callee = self
                    .program
                    .functions
                    .get(&target.name)
                    .unwrap_or_else(|| panic!("call target {} is not a function", target.name));
                let (n_args, returns_value) = (callee.args.len(), callee.returns_value);
                let name = target.name.clone();
                self.compile_call(&name, n_args, returns_value);
            }
            SYSCALL { number } => {
                let syscall = syscall::by_number(*number)
                    .unwrap_or_else(|| panic!("no trampoline for syscall {}", number));
                self.compile_call(&syscall.extern_symbol(), syscall.arity(), syscall.returns_value);
            }
            RET => {
                let name = self.cur().name.clone();
                if self.cur().returns_value {
                    let top = self.pop();
                    self.asm(&format!("mov rax, {}", top));
                }
                assert!(
                    self.stack.is_empty(),
                    "operands left on the virtual stack at ret in {}",
                    name
                );
                self.asm(&format!("jmp {}_epilogue", name));
            }
            ENTER { .. } => {
                let name = self.cur().name.clone();
                if name == ENTRYPOINT {
                    // The runtime initializes itself before anything else
                    // in the program runs.
                    self.asm("call sys_setup");
                }
                self.asm("push rbp");
                self.asm("mov rbp, rsp");
                self.asm(&format!("sub rsp, {}_stackframe", name));
            }
            LEAVE => {
                let name = self.cur().name.clone();
                self.line(&format!("{}_epilogue:", name));
                self.asm(&format!("add rsp, {}_stackframe", name));
                self.asm("pop rbp");
                self.asm("ret");
                self.line(&format!(
                    "{}_stackframe EQU {}",
                    name,
                    self.max_slot * WORD_SIZE
                ));
            }
        }
    }

    /// `add`/`sub`/`imul`: result replaces the left operand's slot.
    fn arith(&mut self, mnemonic: &str) {
        let r = self.pop();
        let l = self.pop();
        match l {
            Operand::Reg(_) => self.asm(&format!("{} {}, {}", mnemonic, l, r)),
            Operand::Stack(_) => {
                self.asm(&format!("mov {}, {}", TMP, l));
                self.asm(&format!("{} {}, {}", mnemonic, TMP, r));
                self.asm(&format!("mov {}, {}", l, TMP));
            }
        }
        self.push(l);
    }

    /// `idiv` path shared by div and mod; `result` is `rax` or `rdx`.
    ///
    /// `cqo` and `idiv` clobber `rdx`, which is also the permanent home of
    /// the current function's second parameter, so it gets the same
    /// protection parameters get across calls. The result is captured
    /// before the restore.
    fn divide(&mut self, result: &str) {
        let r = self.pop();
        let l = self.pop();
        let save_rdx = self.cur().args.len() >= 2;
        if save_rdx {
            self.asm(&format!("push {}", Reg::RDX));
        }
        self.asm(&format!("mov rax, {}", l));
        self.asm("cqo");
        self.asm(&format!("idiv {}", r));
        self.asm(&format!("mov {}, {}", l, result));
        if save_rdx {
            self.asm(&format!("pop {}", Reg::RDX));
        }
        self.push(l);
    }

    /// Comparisons materialize 0/1 through `setcc` on the low byte.
    fn compare(&mut self, setcc: &str) {
        let r = self.pop();
        let l = self.pop();
        match l {
            Operand::Reg(reg) => {
                self.asm(&format!("cmp {}, {}", l, r));
                self.asm(&format!("{} {}", setcc, reg.byte_name()));
                self.asm(&format!("and {}, 1", l));
            }
            Operand::Stack(_) => {
                self.asm(&format!("mov {}, {}", TMP, l));
                self.asm(&format!("cmp {}, {}", TMP, r));
                self.asm(&format!("{} {}", setcc, TMP.byte_name()));
                self.asm(&format!("and {}, 1", TMP));
                self.asm(&format!("mov {}, {}", l, TMP));
            }
        }
        self.push(l);
    }

    /// Eager logical and/or: booleanise both operands, combine bitwise,
    /// mask the result to 0/1.
    fn logic(&mut self, mnemonic: &str) {
        let r = self.pop();
        let l = self.pop();
        self.booleanize(r);
        self.booleanize(l);
        match (l, r) {
            (Operand::Stack(_), Operand::Stack(_)) => {
                self.asm(&format!("mov {}, {}", TMP, r));
                self.asm(&format!("{} {}, {}", mnemonic, l, TMP));
            }
            _ => self.asm(&format!("{} {}, {}", mnemonic, l, r)),
        }
        self.asm(&format!("and {}, 1", l));
        self.push(l);
    }

    fn booleanize(&mut self, operand: Operand) {
        match operand {
            Operand::Reg(reg) => {
                self.asm(&format!("test {}, {}", reg, reg));
                self.asm(&format!("setne {}", reg.byte_name()));
            }
            Operand::Stack(_) => {
                self.asm(&format!("cmp {}, 0", operand));
                self.asm(&format!("setne {}", operand.byte()));
            }
        }
    }

    /// `test`-or-`cmp` a value against zero ahead of a conditional jump.
    fn test(&mut self, value: Operand) {
        match value {
            Operand::Reg(reg) => self.asm(&format!("test {}, {}", reg, reg)),
            Operand::Stack(_) => self.asm(&format!("cmp {}, 0", value)),
        }
    }

    /// The call protocol: save live registers, load argument registers from
    /// the virtual stack, call, capture `rax`, restore.
    fn compile_call(&mut self, target: &str, n_args: usize, returns_value: bool) {
        assert!(
            n_args <= ARG_REGS.len(),
            "Too many args (pass through stack is not implemented)"
        );
        assert!(self.stack.len() >= n_args, "not enough operands for {}", target);

        // Everything on the virtual stack below the arguments being
        // consumed is live across the call, as are the argument registers
        // holding this function's own parameters. Saved before the argument
        // registers are overwritten.
        let keep = self.stack.len() - n_args;
        let mut save: Vec<Reg> = self.stack[..keep]
            .iter()
            .filter_map(|operand| match operand {
                Operand::Reg(reg) => Some(*reg),
                Operand::Stack(_) => None,
            })
            .collect();
        save.extend(&ARG_REGS[..self.cur().args.len().min(ARG_REGS.len())]);

        for reg in &save {
            self.asm(&format!("push {}", reg));
        }
        for k in 0..n_args {
            let operand = self.pop();
            self.asm(&format!("mov {}, {}", ARG_REGS[k], operand));
        }
        self.asm(&format!("call {}", target));
        if returns_value {
            let dst = self.allocate();
            self.asm(&format!("mov {}, rax", dst));
        }
        for reg in save.iter().rev() {
            self.asm(&format!("pop {}", reg));
        }
    }

    /// Where a parameter or local of the current function lives: the first
    /// four parameters stay in their argument registers, locals get frame
    /// slots below `rbp`.
    fn location(&self, name: &str) -> Operand {
        let span = self.cur();
        if let Some(i) = span.args.iter().position(|a| a == name) {
            return Operand::Reg(ARG_REGS[i]);
        }
        if let Some(i) = span.locals.iter().position(|l| l == name) {
            return Operand::Stack(span.args.len() + i + 1);
        }
        unreachable!("variable {} survived the build unresolved", name)
    }

    /// Allocate a slot for a virtual push: a pool register while any are
    /// free, a fresh frame slot past everything live otherwise.
    fn allocate(&mut self) -> Operand {
        let operand = match self.free.pop() {
            Some(reg) => Operand::Reg(reg),
            None => {
                let deepest = self
                    .stack
                    .iter()
                    .filter_map(|operand| match operand {
                        Operand::Stack(slot) => Some(*slot),
                        Operand::Reg(_) => None,
                    })
                    .max()
                    .unwrap_or(self.frame_base);
                Operand::Stack(deepest + 1)
            }
        };
        self.push(operand);
        operand
    }

    fn push(&mut self, operand: Operand) {
        match operand {
            Operand::Reg(reg) => self.free.retain(|r| *r != reg),
            Operand::Stack(slot) => self.max_slot = self.max_slot.max(slot),
        }
        self.stack.push(operand);
    }

    fn pop(&mut self) -> Operand {
        let operand = self.stack.pop().expect("virtual operand stack underflow");
        if let Operand::Reg(reg) = operand {
            self.free.push(reg);
        }
        operand
    }

    /// Moves that may be memory-to-memory go through the scratch register.
    fn mov(&mut self, dst: Operand, src: Operand) {
        match (dst, src) {
            (Operand::Stack(_), Operand::Stack(_)) => {
                self.asm(&format!("mov {}, {}", TMP, src));
                self.asm(&format!("mov {}, {}", dst, TMP));
            }
            _ => self.asm(&format!("mov {}, {}", dst, src)),
        }
    }

    fn cur(&self) -> &FnSpan {
        &self.spans[self.current]
    }

    fn line(&mut self, line: &str) {
        self.listing.push_str(line);
        self.listing.push('\n');
    }

    /// Mnemonic column formatting: 4-space indent, mnemonic padded to 7.
    fn asm(&mut self, text: &str) {
        let mut parts = text.split_whitespace();
        let mnemonic = parts.next().unwrap_or_default();
        let operands: Vec<&str> = parts.collect();
        let formatted = format!("    {:<7} {}", mnemonic, operands.join(" "));
        self.line(formatted.trim_end());
    }
}

#[cfg(test)]
mod tests;
