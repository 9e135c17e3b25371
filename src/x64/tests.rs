use pretty_assertions::assert_eq;

use crate::ast::{self, Block, Expr, Function, Item, Stmt, Token};
use crate::bytecode::Op;
use crate::compiler;

fn tok(value: &str) -> Token {
    Token::new(value, 1, 1)
}

fn int(value: i64) -> Expr {
    Expr::IntLit(tok(&value.to_string()))
}

fn var(name: &str) -> Expr {
    Expr::Var(tok(name))
}

fn bin(op: Op, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: tok(name),
        args,
    }
}

fn assign(name: &str, expr: Expr) -> Stmt {
    Stmt::Assign {
        name: tok(name),
        expr,
    }
}

fn print(expr: Expr) -> Stmt {
    Stmt::Expr(call("print", vec![expr]))
}

fn block(stmts: Vec<Stmt>) -> Block {
    Block { stmts }
}

fn compile_ast(items: Vec<Item>) -> String {
    let program = compiler::compile(&ast::Program { items }).unwrap();
    super::compile(&program)
}

/// Assert the listing contains these lines, consecutively.
fn assert_lines(listing: &str, window: &[&str]) {
    let lines: Vec<&str> = listing.lines().collect();
    assert!(
        lines.windows(window.len()).any(|w| w == window),
        "expected lines:\n{}\n\nin listing:\n{}",
        window.join("\n"),
        listing
    );
}

fn id_fn() -> Item {
    Item::Function(Function {
        name: tok("id"),
        params: vec![tok("x")],
        ret_type: Some(tok("int")),
        body: block(vec![Stmt::Return {
            token: tok("return"),
            expr: Some(var("x")),
        }]),
    })
}

#[test]
fn arithmetic_program_full_listing() {
    let listing = compile_ast(vec![Item::Stmt(print(bin(
        Op::ADD,
        int(1),
        bin(Op::MUL, int(2), int(3)),
    )))]);

    assert_eq!(
        listing,
        "global main\n\
         extern sys_setup\n\
         extern sys_exit\n\
         extern sys_print\n\
         \n\
         section .text\n\
         main:\n\
         \x20   call    sys_setup\n\
         \x20   push    rbp\n\
         \x20   mov     rbp, rsp\n\
         \x20   sub     rsp, main_stackframe\n\
         \x20   mov     rbx, 1\n\
         \x20   mov     rsi, 2\n\
         \x20   mov     rdi, 3\n\
         \x20   imul    rsi, rdi\n\
         \x20   add     rbx, rsi\n\
         \x20   mov     rcx, rbx\n\
         \x20   call    sys_print\n\
         \x20   mov     rbx, 0\n\
         \x20   mov     rcx, rbx\n\
         \x20   call    sys_exit\n\
         main_epilogue:\n\
         \x20   add     rsp, main_stackframe\n\
         \x20   pop     rbp\n\
         \x20   ret\n\
         main_stackframe EQU 0\n"
    );
}

#[test]
fn emission_is_deterministic() {
    let items = vec![
        id_fn(),
        Item::Stmt(print(call("id", vec![int(1)]))),
    ];
    let program = compiler::compile(&ast::Program {
        items: items.clone(),
    })
    .unwrap();
    assert_eq!(super::compile(&program), super::compile(&program));
}

#[test]
fn parameters_live_in_argument_registers() {
    let listing = compile_ast(vec![
        Item::Function(Function {
            name: tok("sub2"),
            params: vec![tok("a"), tok("b")],
            ret_type: Some(tok("int")),
            body: block(vec![Stmt::Return {
                token: tok("return"),
                expr: Some(bin(Op::SUB, var("a"), var("b"))),
            }]),
        }),
        Item::Stmt(print(call("sub2", vec![int(7), int(2)]))),
    ]);

    // Function body: a arrives in rcx, b in rdx.
    assert_lines(
        &listing,
        &[
            "sub2:",
            "    push    rbp",
            "    mov     rbp, rsp",
            "    sub     rsp, sub2_stackframe",
            "    mov     rbx, rcx",
            "    mov     rsi, rdx",
            "    sub     rbx, rsi",
            "    mov     rax, rbx",
            "    jmp     sub2_epilogue",
            "sub2_epilogue:",
        ],
    );

    // Call site: the first popped operand (the left argument, 7) lands in
    // rcx, the second in rdx, and the result comes back through rax.
    assert_lines(
        &listing,
        &[
            "    mov     rcx, rsi",
            "    mov     rdx, rbx",
            "    call    sub2",
            "    mov     rbx, rax",
        ],
    );
}

#[test]
fn live_scheduler_registers_are_saved_across_calls() {
    // In 1 + id(2), the register holding 1 is live across the call.
    let listing = compile_ast(vec![
        id_fn(),
        Item::Stmt(print(bin(Op::ADD, int(1), call("id", vec![int(2)])))),
    ]);
    assert_lines(
        &listing,
        &[
            "    push    rbx",
            "    mov     rcx, rsi",
            "    call    id",
            "    mov     rsi, rax",
            "    pop     rbx",
            "    add     rbx, rsi",
        ],
    );
}

#[test]
fn own_parameters_are_saved_across_calls() {
    // wrap's parameter occupies rcx, which the nested call overwrites.
    let listing = compile_ast(vec![
        id_fn(),
        Item::Function(Function {
            name: tok("wrap"),
            params: vec![tok("a")],
            ret_type: Some(tok("int")),
            body: block(vec![Stmt::Return {
                token: tok("return"),
                expr: Some(call("id", vec![var("a")])),
            }]),
        }),
        Item::Stmt(print(call("wrap", vec![int(3)]))),
    ]);
    assert_lines(
        &listing,
        &[
            "    push    rcx",
            "    mov     rcx, rbx",
            "    call    id",
            "    mov     rbx, rax",
            "    pop     rcx",
        ],
    );
}

#[test]
fn globals_live_in_the_data_section() {
    let listing = compile_ast(vec![
        Item::Global(tok("g")),
        Item::Stmt(assign("g", int(5))),
        Item::Stmt(print(var("g"))),
    ]);

    assert_lines(&listing, &["section .data", "g: dq 0"]);
    assert_lines(&listing, &["    mov     [rel g], rbx"]);
    assert_lines(&listing, &["    mov     rbx, [rel g]"]);
}

#[test]
fn locals_live_in_the_frame() {
    let listing = compile_ast(vec![
        Item::Stmt(assign("x", int(1))),
        Item::Stmt(assign("y", int(2))),
        Item::Stmt(print(bin(Op::ADD, var("x"), var("y")))),
    ]);

    assert_lines(&listing, &["    mov     qword [rbp - 8], rbx"]);
    assert_lines(&listing, &["    mov     qword [rbp - 16], rbx"]);
    assert_lines(&listing, &["    mov     rbx, qword [rbp - 8]"]);
    assert_lines(&listing, &["    mov     rsi, qword [rbp - 16]"]);
    // Two locals, no spills: 16 bytes of frame.
    assert_lines(&listing, &["main_stackframe EQU 16"]);
}

#[test]
fn comparisons_materialize_through_setcc() {
    let listing = compile_ast(vec![Item::Stmt(print(bin(Op::LT, int(2), int(3))))]);
    assert_lines(
        &listing,
        &[
            "    cmp     rbx, rsi",
            "    setl    bl",
            "    and     rbx, 1",
        ],
    );
}

#[test]
fn logic_ops_booleanize_both_operands() {
    let listing = compile_ast(vec![Item::Stmt(print(bin(Op::AND, int(2), int(3))))]);
    assert_lines(
        &listing,
        &[
            "    test    rsi, rsi",
            "    setne   sil",
            "    test    rbx, rbx",
            "    setne   bl",
            "    and     rbx, rsi",
            "    and     rbx, 1",
        ],
    );
}

#[test]
fn division_goes_through_idiv() {
    let listing = compile_ast(vec![Item::Stmt(print(bin(Op::DIV, int(7), int(2))))]);
    assert_lines(
        &listing,
        &[
            "    mov     rax, rbx",
            "    cqo",
            "    idiv    rsi",
            "    mov     rbx, rax",
        ],
    );
    // main has no parameters, so rdx needs no protection here.
    assert!(!listing.contains("push    rdx"));

    let listing = compile_ast(vec![Item::Stmt(print(bin(Op::MOD, int(7), int(2))))]);
    assert_lines(&listing, &["    mov     rbx, rdx"]);
}

#[test]
fn division_preserves_the_second_parameter() {
    // b lives in rdx for its whole body, and cqo/idiv clobber rdx: the
    // divide sequence must save it or the later load of b reads garbage.
    let listing = compile_ast(vec![
        Item::Function(Function {
            name: tok("halve_plus"),
            params: vec![tok("a"), tok("b")],
            ret_type: Some(tok("int")),
            body: block(vec![
                assign("q", bin(Op::DIV, var("a"), int(2))),
                Stmt::Return {
                    token: tok("return"),
                    expr: Some(bin(Op::ADD, var("q"), var("b"))),
                },
            ]),
        }),
        Item::Stmt(print(call("halve_plus", vec![int(10), int(1)]))),
    ]);

    assert_lines(
        &listing,
        &[
            "    push    rdx",
            "    mov     rax, rbx",
            "    cqo",
            "    idiv    rsi",
            "    mov     rbx, rax",
            "    pop     rdx",
        ],
    );
}

#[test]
fn loop_labels_and_conditional_jumps() {
    let listing = compile_ast(vec![
        Item::Stmt(assign("s", int(0))),
        Item::Stmt(Stmt::While {
            cond: bin(Op::LT, var("s"), int(5)),
            body: block(vec![assign("s", bin(Op::ADD, var("s"), int(1)))]),
        }),
    ]);

    assert!(listing.contains("while_body_1:\n"));
    assert!(listing.contains("while_cond_0:\n"));
    assert_lines(
        &listing,
        &["    test    rbx, rbx", "    jnz     while_body_1"],
    );
    assert_lines(&listing, &["    jmp     while_cond_0"]);
}

#[test]
fn deep_expressions_spill_past_the_locals_area() {
    // Nine live operands: eight scheduler registers, then memory.
    let mut expr = int(9);
    for value in (1..=8).rev() {
        expr = bin(Op::ADD, int(value), expr);
    }
    let listing = compile_ast(vec![Item::Stmt(print(expr))]);

    assert_lines(&listing, &["    mov     qword [rbp - 8], 9"]);
    assert_lines(&listing, &["    add     r15, qword [rbp - 8]"]);
    assert_lines(&listing, &["main_stackframe EQU 8"]);
}

#[test]
fn discarded_statement_call_compiles_and_stores_to_the_frame() {
    // proc h() { g() }: g's unused result goes to h's scratch local, so
    // the virtual stack is empty again at h's implicit ret.
    let listing = compile_ast(vec![
        Item::Function(Function {
            name: tok("g"),
            params: vec![],
            ret_type: Some(tok("int")),
            body: block(vec![Stmt::Return {
                token: tok("return"),
                expr: Some(int(1)),
            }]),
        }),
        Item::Function(Function {
            name: tok("h"),
            params: vec![],
            ret_type: None,
            body: block(vec![Stmt::Expr(call("g", vec![]))]),
        }),
        Item::Stmt(Stmt::Expr(call("h", vec![]))),
    ]);

    assert_lines(
        &listing,
        &[
            "    call    g",
            "    mov     rbx, rax",
            "    mov     qword [rbp - 8], rbx",
            "    jmp     h_epilogue",
        ],
    );
    assert_lines(&listing, &["h_stackframe EQU 8"]);
}

#[test]
fn sys_setup_runs_once_at_main_entry() {
    let listing = compile_ast(vec![
        id_fn(),
        Item::Stmt(print(call("id", vec![int(1)]))),
    ]);
    assert_eq!(listing.matches("call    sys_setup").count(), 1);
    assert_lines(&listing, &["main:", "    call    sys_setup", "    push    rbp"]);
}

#[test]
fn externs_cover_exactly_the_used_syscalls() {
    let listing = compile_ast(vec![Item::Stmt(print(int(1)))]);
    assert!(listing.contains("extern sys_exit\n"));
    assert!(listing.contains("extern sys_print\n"));
    assert!(!listing.contains("extern sys_input"));
    assert!(!listing.contains("extern sys_list"));
}

#[test]
#[should_panic(expected = "Too many args")]
fn more_than_four_parameters_is_rejected() {
    compile_ast(vec![
        Item::Function(Function {
            name: tok("wide"),
            params: vec![tok("a"), tok("b"), tok("c"), tok("d"), tok("e")],
            ret_type: None,
            body: block(vec![Stmt::Pass]),
        }),
        Item::Stmt(Stmt::Pass),
    ]);
}
