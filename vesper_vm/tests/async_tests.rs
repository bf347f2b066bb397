//! Async/await integration tests: thread launch, future settlement, await
//! reaping, cancellation, and the GC safepoint protocol under parallel load.

use vesper_compiler::ast::*;
use vesper_core::{Token, Value, VesperError};
use vesper_vm::interpret;

// =============================================================================
// Test infrastructure
// =============================================================================

fn run(stmts: Vec<Stmt>) -> Result<Value, VesperError> {
    interpret(&[Module::script("async_test.vsp", stmts)])
}

fn tok(name: &str) -> Token {
    Token::new(name, 0)
}

fn num(value: f64) -> Expr {
    Expr::Number { value, line: 0 }
}

fn ident(name: &str) -> Expr {
    Expr::Ident(tok(name))
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
        line: 0,
    }
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
        line: 0,
    }
}

fn let_var(name: &str, init: Expr) -> Stmt {
    Stmt::Var {
        name: tok(name),
        initializer: Some(init),
    }
}

fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::Expr(Expr::Assign {
        name: tok(name),
        value: Box::new(value),
    })
}

fn ret(value: Expr) -> Stmt {
    Stmt::Return {
        keyword: tok("return"),
        value: Some(value),
    }
}

fn async_call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Async {
        callee: Box::new(ident(name)),
        args,
        line: 0,
    }
}

fn await_expr(expr: Expr) -> Expr {
    Expr::Await {
        expr: Box::new(expr),
        line: 0,
    }
}

/// fn slow() { return 7; }
fn slow_fn() -> Stmt {
    Stmt::Func {
        name: tok("slow"),
        params: vec![],
        body: vec![ret(num(7.0))],
    }
}

// =============================================================================
// Futures and await
// =============================================================================

#[test]
fn await_returns_the_settled_value() {
    // let f = async slow(); return await f;
    let result = run(vec![
        slow_fn(),
        let_var("f", async_call("slow", vec![])),
        ret(await_expr(ident("f"))),
    ])
    .expect("program should run");
    assert_eq!(result.as_int(), 7);
}

#[test]
fn async_call_passes_arguments() {
    let result = run(vec![
        Stmt::Func {
            name: tok("mul"),
            params: vec![tok("a"), tok("b")],
            body: vec![ret(binary(BinaryOp::Multiply, ident("a"), ident("b")))],
        },
        ret(await_expr(async_call("mul", vec![num(6.0), num(7.0)]))),
    ])
    .expect("program should run");
    assert_eq!(result.as_int(), 42);
}

#[test]
fn multiple_futures_settle_independently() {
    let result = run(vec![
        Stmt::Func {
            name: tok("id"),
            params: vec![tok("n")],
            body: vec![ret(ident("n"))],
        },
        let_var("a", async_call("id", vec![num(1.0)])),
        let_var("b", async_call("id", vec![num(2.0)])),
        let_var("c", async_call("id", vec![num(3.0)])),
        ret(binary(
            BinaryOp::Add,
            await_expr(ident("a")),
            binary(
                BinaryOp::Add,
                await_expr(ident("b")),
                await_expr(ident("c")),
            ),
        )),
    ])
    .expect("program should run");
    assert_eq!(result.as_int(), 6);
}

#[test]
fn awaiting_a_non_future_is_a_type_error() {
    let result = run(vec![Stmt::Expr(await_expr(num(3.0)))]);
    match result {
        Err(VesperError::Runtime(err)) => assert_eq!(err.code.as_u8(), 3),
        other => panic!("expected type error, got {other:?}"),
    }
}

#[test]
fn future_done_method_reports_settlement() {
    // A settled future reports done eventually; awaiting first guarantees it.
    let result = run(vec![
        slow_fn(),
        let_var("f", async_call("slow", vec![])),
        Stmt::Expr(await_expr(ident("f"))),
        ret(call(
            Expr::Property {
                callee: Box::new(ident("f")),
                name: tok("done"),
            },
            vec![],
        )),
    ])
    .expect("program should run");
    assert!(result.as_bool());
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn cancelled_spin_loop_settles_nil() {
    // fn spin() { while (true) {} }  — only the cancel flag can stop it.
    let result = run(vec![
        Stmt::Func {
            name: tok("spin"),
            params: vec![],
            body: vec![Stmt::While {
                condition: Expr::Bool {
                    value: true,
                    line: 0,
                },
                body: Box::new(Stmt::Block(vec![])),
            }],
        },
        let_var("f", async_call("spin", vec![])),
        Stmt::Expr(call(
            Expr::Property {
                callee: Box::new(ident("f")),
                name: tok("cancel"),
            },
            vec![],
        )),
        ret(await_expr(ident("f"))),
    ])
    .expect("program should run");
    assert!(result.is_nil());
}

// =============================================================================
// Safepoints under parallel allocation
// =============================================================================

#[test]
fn parallel_allocation_crosses_safepoints() {
    // Two children and the main thread all churn the heap hard enough to
    // force collections, exercising the stop-the-world handshake.
    let work_body = vec![
        let_var("i", num(0.0)),
        Stmt::While {
            condition: binary(BinaryOp::Less, ident("i"), num(20000.0)),
            body: Box::new(Stmt::Block(vec![
                let_var(
                    "t",
                    Expr::ArrayLiteral {
                        elements: vec![num(1.0), num(2.0), num(3.0)],
                        line: 0,
                    },
                ),
                assign("i", binary(BinaryOp::Add, ident("i"), num(1.0))),
            ])),
        },
        ret(num(1.0)),
    ];
    let result = run(vec![
        Stmt::Func {
            name: tok("work"),
            params: vec![],
            body: work_body.clone(),
        },
        let_var("f1", async_call("work", vec![])),
        let_var("f2", async_call("work", vec![])),
        // Main churns too while the children run.
        let_var("i", num(0.0)),
        Stmt::While {
            condition: binary(BinaryOp::Less, ident("i"), num(20000.0)),
            body: Box::new(Stmt::Block(vec![
                let_var(
                    "t",
                    Expr::ArrayLiteral {
                        elements: vec![num(4.0), num(5.0)],
                        line: 0,
                    },
                ),
                assign("i", binary(BinaryOp::Add, ident("i"), num(1.0))),
            ])),
        },
        ret(binary(
            BinaryOp::Add,
            await_expr(ident("f1")),
            await_expr(ident("f2")),
        )),
    ]);
    assert_eq!(result.expect("program should run").as_int(), 2);
}
