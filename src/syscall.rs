//! The syscall table: named side-effecting primitives with fixed arity.
//!
//! Numbers are stable; the lowering looks syscalls up by name, the
//! interpreter and the x64 backend by number. Lists are heap objects owned
//! by the interpreter and reachable only through this table.

pub const EXIT: u32 = 0;
pub const OPEN: u32 = 1;
pub const CLOSE: u32 = 2;
pub const READ: u32 = 3;
pub const WRITE: u32 = 4;
pub const LIST: u32 = 20;
pub const LIST_GET: u32 = 21;
pub const LIST_SET: u32 = 22;
pub const PUSH: u32 = 23;
pub const LEN: u32 = 24;
pub const CLEAR: u32 = 25;
pub const SLICE: u32 = 26;
pub const REF: u32 = 27;
pub const UNREF: u32 = 28;
pub const PRINT: u32 = 100;
pub const INPUT: u32 = 101;

/// One entry of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall {
    pub number: u32,
    pub name: &'static str,
    /// Parameter names, in order. The first value popped at `SYSCALL` is the
    /// first parameter.
    pub params: &'static [&'static str],
    pub returns_value: bool,
}

impl Syscall {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Symbol of the trampoline the x64 runtime provides for this syscall.
    pub fn extern_symbol(&self) -> String {
        format!("sys_{}", self.name)
    }
}

pub static SYSCALLS: &[Syscall] = &[
    // Exit the program
    Syscall { number: EXIT, name: "exit", params: &["code"], returns_value: false },
    // File IO
    Syscall { number: OPEN, name: "open", params: &["filename"], returns_value: true },
    Syscall { number: CLOSE, name: "close", params: &["fd"], returns_value: true },
    Syscall { number: READ, name: "read", params: &["fd", "n"], returns_value: true },
    Syscall { number: WRITE, name: "write", params: &["fd", "data"], returns_value: true },
    // List builtins
    Syscall { number: LIST, name: "list", params: &[], returns_value: true },
    Syscall { number: LIST_GET, name: "list_get", params: &["list", "i"], returns_value: true },
    Syscall { number: LIST_SET, name: "list_set", params: &["list", "i", "val"], returns_value: false },
    Syscall { number: PUSH, name: "push", params: &["list", "val"], returns_value: false },
    Syscall { number: LEN, name: "len", params: &["list"], returns_value: true },
    Syscall { number: CLEAR, name: "clear", params: &["list"], returns_value: false },
    Syscall { number: SLICE, name: "slice", params: &["list", "lo", "hi"], returns_value: true },
    Syscall { number: REF, name: "ref", params: &["list"], returns_value: true },
    Syscall { number: UNREF, name: "unref", params: &["list"], returns_value: true },
    // Terminal IO
    Syscall { number: PRINT, name: "print", params: &["val"], returns_value: false },
    Syscall { number: INPUT, name: "input", params: &[], returns_value: true },
];

pub fn by_name(name: &str) -> Option<&'static Syscall> {
    SYSCALLS.iter().find(|s| s.name == name)
}

pub fn by_number(number: u32) -> Option<&'static Syscall> {
    SYSCALLS.iter().find(|s| s.number == number)
}
