//! End-to-end interpreter tests.
//!
//! The parser is an external collaborator, so programs are built directly as
//! module ASTs through the helpers below and run through the full
//! compile-then-execute pipeline.

use vesper_compiler::ast::*;
use vesper_core::{RuntimeErrorCode, Token, Value, VesperError};
use vesper_runtime::object::{self, ObjKind};
use vesper_vm::interpret;

// =============================================================================
// Test infrastructure
// =============================================================================

fn run(stmts: Vec<Stmt>) -> Result<Value, VesperError> {
    interpret(&[Module::script("test.vsp", stmts)])
}

fn run_value(stmts: Vec<Stmt>) -> Value {
    run(stmts).expect("program should run")
}

fn runtime_code(result: Result<Value, VesperError>) -> RuntimeErrorCode {
    match result {
        Err(VesperError::Runtime(err)) => err.code,
        other => panic!("expected runtime error, got {other:?}"),
    }
}

fn tok(name: &str) -> Token {
    Token::new(name, 0)
}

fn num(value: f64) -> Expr {
    Expr::Number { value, line: 0 }
}

fn string(value: &str) -> Expr {
    Expr::Str {
        value: value.to_string(),
        line: 0,
    }
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

fn method_call(receiver: Expr, name: &str, args: Vec<Expr>) -> Expr {
    call(
        Expr::Property {
            callee: Box::new(receiver),
            name: tok(name),
        },
        args,
    )
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

fn lambda(params: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::Lambda {
        params: params.iter().map(|&p| tok(p)).collect(),
        body,
        line: 0,
    }
}

fn expect_string(value: Value, expected: &str) {
    assert!(object::is_obj_kind(value, ObjKind::String), "not a string");
    let chars = unsafe { &(*object::as_string(value)).chars };
    assert_eq!(chars, expected);
}

// =============================================================================
// Arithmetic and control flow
// =============================================================================

#[test]
fn sum_loop_evaluates_to_45() {
    // let x = 0; for (let i = 0; i < 10; i = i + 1) x = x + i; return x;
    let result = run_value(vec![
        let_var("x", num(0.0)),
        Stmt::For {
            init: Some(Box::new(let_var("i", num(0.0)))),
            condition: Some(binary(BinaryOp::Less, ident("i"), num(10.0))),
            increment: Some(Expr::Assign {
                name: tok("i"),
                value: Box::new(binary(BinaryOp::Add, ident("i"), num(1.0))),
            }),
            body: Box::new(assign("x", binary(BinaryOp::Add, ident("x"), ident("i")))),
        },
        ret(ident("x")),
    ]);
    assert_eq!(result.as_int(), 45);
}

#[test]
fn fib_10_is_55() {
    // fn fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }
    let fib_body = vec![
        Stmt::If {
            condition: binary(BinaryOp::Less, ident("n"), num(2.0)),
            then_branch: Box::new(ret(ident("n"))),
            else_branch: None,
        },
        ret(binary(
            BinaryOp::Add,
            call(ident("fib"), vec![binary(BinaryOp::Subtract, ident("n"), num(1.0))]),
            call(ident("fib"), vec![binary(BinaryOp::Subtract, ident("n"), num(2.0))]),
        )),
    ];
    let result = run_value(vec![
        Stmt::Func {
            name: tok("fib"),
            params: vec![tok("n")],
            body: fib_body,
        },
        ret(call(ident("fib"), vec![num(10.0)])),
    ]);
    assert_eq!(result.as_int(), 55);
}

#[test]
fn while_loop_with_break_and_continue() {
    // count even numbers below 10, stopping at 8
    let result = run_value(vec![
        let_var("n", num(0.0)),
        let_var("sum", num(0.0)),
        Stmt::While {
            condition: Expr::Bool {
                value: true,
                line: 0,
            },
            body: Box::new(Stmt::Block(vec![
                assign("n", binary(BinaryOp::Add, ident("n"), num(1.0))),
                Stmt::If {
                    condition: binary(BinaryOp::Greater, ident("n"), num(8.0)),
                    then_branch: Box::new(Stmt::Break(tok("break"))),
                    else_branch: None,
                },
                Stmt::If {
                    condition: binary(
                        BinaryOp::NotEqual,
                        binary(BinaryOp::Mod, ident("n"), num(2.0)),
                        num(0.0),
                    ),
                    then_branch: Box::new(Stmt::Continue(tok("continue"))),
                    else_branch: None,
                },
                assign("sum", binary(BinaryOp::Add, ident("sum"), ident("n"))),
            ])),
        },
        ret(ident("sum")),
    ]);
    // 2 + 4 + 6 + 8
    assert_eq!(result.as_int(), 20);
}

#[test]
fn int_overflow_promotes_to_double() {
    let result = run_value(vec![ret(binary(
        BinaryOp::Multiply,
        binary(BinaryOp::Multiply, num(65536.0), num(65536.0)),
        num(2.0),
    ))]);
    // 2^32 * 2 does not fit an i32
    assert!(result.is_double());
    assert_eq!(result.as_double(), 8_589_934_592.0);
}

#[test]
fn mixed_arithmetic_widens_to_double() {
    let result = run_value(vec![ret(binary(BinaryOp::Add, num(1.0), num(0.5)))]);
    assert!(result.is_double());
    assert_eq!(result.as_double(), 1.5);
}

#[test]
fn string_concatenation() {
    let result = run_value(vec![ret(binary(
        BinaryOp::Add,
        string("foo"),
        string("bar"),
    ))]);
    expect_string(result, "foobar");
}

#[test]
fn prefix_and_postfix_increment() {
    let result = run_value(vec![
        let_var("a", num(5.0)),
        // postfix yields the old value
        let_var(
            "old",
            Expr::Increment {
                positive: true,
                prefix: false,
                target: Box::new(ident("a")),
                line: 0,
            },
        ),
        // prefix yields the new value
        let_var(
            "new_val",
            Expr::Increment {
                positive: true,
                prefix: true,
                target: Box::new(ident("a")),
                line: 0,
            },
        ),
        ret(binary(
            BinaryOp::Add,
            binary(BinaryOp::Multiply, ident("old"), num(100.0)),
            ident("new_val"),
        )),
    ]);
    // old = 5, a ends at 7
    assert_eq!(result.as_int(), 507);
}

// =============================================================================
// Switch
// =============================================================================

fn case(constants: Vec<CaseConstant>, body: Vec<Stmt>) -> SwitchCase {
    SwitchCase {
        constants,
        is_default: false,
        body,
        line: 0,
    }
}

fn default_case(body: Vec<Stmt>) -> SwitchCase {
    SwitchCase {
        constants: vec![],
        is_default: true,
        body,
        line: 0,
    }
}

#[test]
fn switch_dispatches_to_matching_case() {
    let result = run_value(vec![
        let_var("r", num(0.0)),
        Stmt::Switch {
            subject: num(2.0),
            cases: vec![
                case(vec![CaseConstant::Number(1.0)], vec![assign("r", num(10.0))]),
                case(vec![CaseConstant::Number(2.0)], vec![assign("r", num(20.0))]),
                default_case(vec![assign("r", num(99.0))]),
            ],
        },
        ret(ident("r")),
    ]);
    assert_eq!(result.as_int(), 20);
}

#[test]
fn switch_takes_default_on_miss() {
    let result = run_value(vec![
        let_var("r", num(0.0)),
        Stmt::Switch {
            subject: num(7.0),
            cases: vec![
                case(vec![CaseConstant::Number(1.0)], vec![assign("r", num(10.0))]),
                default_case(vec![assign("r", num(99.0))]),
            ],
        },
        ret(ident("r")),
    ]);
    assert_eq!(result.as_int(), 99);
}

#[test]
fn switch_without_default_falls_past() {
    let result = run_value(vec![
        let_var("r", num(0.0)),
        Stmt::Switch {
            subject: num(7.0),
            cases: vec![case(
                vec![CaseConstant::Number(1.0)],
                vec![assign("r", num(10.0))],
            )],
        },
        ret(ident("r")),
    ]);
    assert_eq!(result.as_int(), 0);
}

#[test]
fn switch_on_strings_and_multi_constant_cases() {
    let result = run_value(vec![
        let_var("r", num(0.0)),
        Stmt::Switch {
            subject: string("b"),
            cases: vec![
                case(
                    vec![
                        CaseConstant::Str("a".to_string()),
                        CaseConstant::Str("b".to_string()),
                    ],
                    vec![assign("r", num(1.0))],
                ),
                default_case(vec![assign("r", num(2.0))]),
            ],
        },
        ret(ident("r")),
    ]);
    assert_eq!(result.as_int(), 1);
}

#[test]
fn advance_falls_through_to_next_case() {
    let result = run_value(vec![
        let_var("r", num(0.0)),
        Stmt::Switch {
            subject: num(2.0),
            cases: vec![
                case(
                    vec![CaseConstant::Number(2.0)],
                    vec![
                        assign("r", num(20.0)),
                        Stmt::Advance(tok("advance")),
                    ],
                ),
                case(
                    vec![CaseConstant::Number(3.0)],
                    vec![assign("r", binary(BinaryOp::Add, ident("r"), num(1.0)))],
                ),
            ],
        },
        ret(ident("r")),
    ]);
    assert_eq!(result.as_int(), 21);
}

// =============================================================================
// Arrays and structs
// =============================================================================

#[test]
fn array_index_out_of_bounds_is_code_9() {
    // let a = [1, 2, 3]; a[5];
    let code = runtime_code(run(vec![
        let_var(
            "a",
            Expr::ArrayLiteral {
                elements: vec![num(1.0), num(2.0), num(3.0)],
                line: 0,
            },
        ),
        Stmt::Expr(Expr::Index {
            callee: Box::new(ident("a")),
            index: Box::new(num(5.0)),
            line: 0,
        }),
    ]));
    assert_eq!(code, RuntimeErrorCode::OutOfBounds);
}

#[test]
fn negative_array_index_is_code_9() {
    let code = runtime_code(run(vec![
        let_var(
            "a",
            Expr::ArrayLiteral {
                elements: vec![num(1.0)],
                line: 0,
            },
        ),
        Stmt::Expr(Expr::Index {
            callee: Box::new(ident("a")),
            index: Box::new(Expr::Unary {
                op: UnaryOp::Negate,
                operand: Box::new(num(1.0)),
                line: 0,
            }),
            line: 0,
        }),
    ]));
    assert_eq!(code, RuntimeErrorCode::OutOfBounds);
}

#[test]
fn array_read_and_write() {
    let result = run_value(vec![
        let_var(
            "a",
            Expr::ArrayLiteral {
                elements: vec![num(1.0), num(2.0), num(3.0)],
                line: 0,
            },
        ),
        Stmt::Expr(Expr::SetIndex {
            callee: Box::new(ident("a")),
            index: Box::new(num(1.0)),
            value: Box::new(num(20.0)),
            line: 0,
        }),
        ret(Expr::Index {
            callee: Box::new(ident("a")),
            index: Box::new(num(1.0)),
            line: 0,
        }),
    ]);
    assert_eq!(result.as_int(), 20);
}

#[test]
fn array_methods() {
    let result = run_value(vec![
        let_var(
            "a",
            Expr::ArrayLiteral {
                elements: vec![num(1.0)],
                line: 0,
            },
        ),
        Stmt::Expr(method_call(ident("a"), "push", vec![num(9.0)])),
        ret(binary(
            BinaryOp::Add,
            method_call(ident("a"), "length", vec![]),
            method_call(ident("a"), "pop", vec![]),
        )),
    ]);
    // length 2 + popped 9
    assert_eq!(result.as_int(), 11);
}

#[test]
fn struct_literal_fields() {
    // let p = { x: 1, y: 2 }; p.y = p.y + 10; return p.x + p["y"];
    let result = run_value(vec![
        let_var(
            "p",
            Expr::StructLiteral {
                fields: vec![(tok("x"), num(1.0)), (tok("y"), num(2.0))],
                line: 0,
            },
        ),
        Stmt::Expr(Expr::SetProperty {
            callee: Box::new(ident("p")),
            name: tok("y"),
            value: Box::new(binary(
                BinaryOp::Add,
                Expr::Property {
                    callee: Box::new(ident("p")),
                    name: tok("y"),
                },
                num(10.0),
            )),
        }),
        ret(binary(
            BinaryOp::Add,
            Expr::Property {
                callee: Box::new(ident("p")),
                name: tok("x"),
            },
            Expr::Index {
                callee: Box::new(ident("p")),
                index: Box::new(string("y")),
                line: 0,
            },
        )),
    ]);
    assert_eq!(result.as_int(), 13);
}

#[test]
fn missing_struct_field_is_code_4() {
    let code = runtime_code(run(vec![
        let_var(
            "p",
            Expr::StructLiteral {
                fields: vec![(tok("x"), num(1.0))],
                line: 0,
            },
        ),
        Stmt::Expr(Expr::Index {
            callee: Box::new(ident("p")),
            index: Box::new(string("ghost")),
            line: 0,
        }),
    ]));
    assert_eq!(code, RuntimeErrorCode::MissingMember);
}

// =============================================================================
// Type errors
// =============================================================================

#[test]
fn string_plus_number_is_code_3() {
    let code = runtime_code(run(vec![Stmt::Expr(binary(
        BinaryOp::Add,
        string("hi"),
        num(1.0),
    ))]));
    assert_eq!(code, RuntimeErrorCode::Type);
}

#[test]
fn calling_a_number_is_code_3() {
    let code = runtime_code(run(vec![Stmt::Expr(call(num(3.0), vec![]))]));
    assert_eq!(code, RuntimeErrorCode::Type);
}

#[test]
fn arity_mismatch_is_code_2() {
    let code = runtime_code(run(vec![
        Stmt::Func {
            name: tok("two"),
            params: vec![tok("a"), tok("b")],
            body: vec![ret(ident("a"))],
        },
        Stmt::Expr(call(ident("two"), vec![num(1.0)])),
    ]));
    assert_eq!(code, RuntimeErrorCode::Arity);
}

#[test]
fn deep_recursion_is_code_1() {
    let code = runtime_code(run(vec![
        Stmt::Func {
            name: tok("spin"),
            params: vec![],
            body: vec![ret(call(ident("spin"), vec![]))],
        },
        Stmt::Expr(call(ident("spin"), vec![])),
    ]));
    assert_eq!(code, RuntimeErrorCode::StackOverflow);
}

#[test]
fn integer_ops_reject_floats() {
    let code = runtime_code(run(vec![Stmt::Expr(binary(
        BinaryOp::Mod,
        num(1.5),
        num(2.0),
    ))]));
    assert_eq!(code, RuntimeErrorCode::Type);
}

// =============================================================================
// Closures and upvalues
// =============================================================================

#[test]
fn sibling_closures_share_one_cell() {
    // let make = || { let count = 0; return [|| count = count + 1, || count]; };
    let make_body = vec![
        let_var("count", num(0.0)),
        ret(Expr::ArrayLiteral {
            elements: vec![
                lambda(
                    &[],
                    vec![ret(Expr::Assign {
                        name: tok("count"),
                        value: Box::new(binary(BinaryOp::Add, ident("count"), num(1.0))),
                    })],
                ),
                lambda(&[], vec![ret(ident("count"))]),
            ],
            line: 0,
        }),
    ];
    let index_call = |i: f64| {
        call(
            Expr::Index {
                callee: Box::new(ident("fns")),
                index: Box::new(num(i)),
                line: 0,
            },
            vec![],
        )
    };
    let result = run_value(vec![
        let_var("make", lambda(&[], make_body)),
        let_var("fns", call(ident("make"), vec![])),
        Stmt::Expr(index_call(0.0)),
        Stmt::Expr(index_call(0.0)),
        ret(index_call(1.0)),
    ]);
    assert_eq!(result.as_int(), 2);
}

#[test]
fn closure_captures_parameter() {
    // let adder = |n| { return |m| { return n + m; }; }; return adder(3)(4);
    let result = run_value(vec![
        let_var(
            "adder",
            lambda(
                &["n"],
                vec![ret(lambda(
                    &["m"],
                    vec![ret(binary(BinaryOp::Add, ident("n"), ident("m")))],
                ))],
            ),
        ),
        ret(call(call(ident("adder"), vec![num(3.0)]), vec![num(4.0)])),
    ]);
    assert_eq!(result.as_int(), 7);
}

// =============================================================================
// Classes
// =============================================================================

fn method(name: &str, params: Vec<Token>, body: Vec<Stmt>) -> MethodDecl {
    MethodDecl {
        name: tok(name),
        params,
        body,
    }
}

#[test]
fn inheritance_and_super_returns_ba() {
    // class A { greet() "A" }  class B : A { greet() "B" + super.greet() }
    let result = run_value(vec![
        Stmt::Class {
            name: tok("A"),
            superclass: None,
            methods: vec![method("greet", vec![], vec![ret(string("A"))])],
        },
        Stmt::Class {
            name: tok("B"),
            superclass: Some(SuperclassRef::Name(tok("A"))),
            methods: vec![method(
                "greet",
                vec![],
                vec![ret(binary(
                    BinaryOp::Add,
                    string("B"),
                    call(
                        Expr::Super {
                            method: tok("greet"),
                        },
                        vec![],
                    ),
                ))],
            )],
        },
        ret(method_call(call(ident("B"), vec![]), "greet", vec![])),
    ]);
    expect_string(result, "BA");
}

#[test]
fn constructor_initializes_fields_and_returns_this() {
    // class Point { Point(x) { this.x = x; } get() { return this.x; } }
    let result = run_value(vec![
        Stmt::Class {
            name: tok("Point"),
            superclass: None,
            methods: vec![
                method(
                    "Point",
                    vec![tok("x")],
                    vec![Stmt::Expr(Expr::SetProperty {
                        callee: Box::new(Expr::This(tok("this"))),
                        name: tok("x"),
                        value: Box::new(ident("x")),
                    })],
                ),
                method(
                    "get",
                    vec![],
                    vec![ret(Expr::Property {
                        callee: Box::new(Expr::This(tok("this"))),
                        name: tok("x"),
                    })],
                ),
            ],
        },
        ret(method_call(
            call(ident("Point"), vec![num(42.0)]),
            "get",
            vec![],
        )),
    ]);
    assert_eq!(result.as_int(), 42);
}

#[test]
fn bound_method_remembers_its_receiver() {
    // let p = Point(9); let m = p.get; return m();
    let result = run_value(vec![
        Stmt::Class {
            name: tok("Point"),
            superclass: None,
            methods: vec![
                method(
                    "Point",
                    vec![tok("x")],
                    vec![Stmt::Expr(Expr::SetProperty {
                        callee: Box::new(Expr::This(tok("this"))),
                        name: tok("x"),
                        value: Box::new(ident("x")),
                    })],
                ),
                method(
                    "get",
                    vec![],
                    vec![ret(Expr::Property {
                        callee: Box::new(Expr::This(tok("this"))),
                        name: tok("x"),
                    })],
                ),
            ],
        },
        let_var("p", call(ident("Point"), vec![num(9.0)])),
        let_var(
            "m",
            Expr::Property {
                callee: Box::new(ident("p")),
                name: tok("get"),
            },
        ),
        ret(call(ident("m"), vec![])),
    ]);
    assert_eq!(result.as_int(), 9);
}

#[test]
fn missing_instance_member_is_code_4() {
    let code = runtime_code(run(vec![
        Stmt::Class {
            name: tok("Empty"),
            superclass: None,
            methods: vec![],
        },
        Stmt::Expr(Expr::Property {
            callee: Box::new(call(ident("Empty"), vec![])),
            name: tok("ghost"),
        }),
    ]));
    assert_eq!(code, RuntimeErrorCode::MissingMember);
}

#[test]
fn zero_arg_class_with_constructor_args_is_code_2() {
    let code = runtime_code(run(vec![
        Stmt::Class {
            name: tok("Empty"),
            superclass: None,
            methods: vec![],
        },
        Stmt::Expr(call(ident("Empty"), vec![num(1.0)])),
    ]));
    assert_eq!(code, RuntimeErrorCode::Arity);
}

// =============================================================================
// Builtin methods
// =============================================================================

#[test]
fn string_length_method() {
    let result = run_value(vec![ret(method_call(string("hello"), "length", vec![]))]);
    assert_eq!(result.as_int(), 5);
}

#[test]
fn to_text_on_numbers() {
    let result = run_value(vec![ret(method_call(num(42.0), "to_text", vec![]))]);
    expect_string(result, "42");
}

#[test]
fn unknown_primitive_method_is_code_4() {
    let code = runtime_code(run(vec![Stmt::Expr(Expr::Property {
        callee: Box::new(string("s")),
        name: tok("frobnicate"),
    })]));
    assert_eq!(code, RuntimeErrorCode::MissingMember);
}

// =============================================================================
// Garbage collection under load
// =============================================================================

#[test]
fn allocation_heavy_loop_survives_collections() {
    // Churn enough short-lived arrays to cross the heap budget repeatedly;
    // the long-lived accumulator must survive every cycle.
    let result = run_value(vec![
        let_var(
            "keep",
            Expr::ArrayLiteral {
                elements: vec![string("anchor")],
                line: 0,
            },
        ),
        let_var("i", num(0.0)),
        Stmt::While {
            condition: binary(BinaryOp::Less, ident("i"), num(50000.0)),
            body: Box::new(Stmt::Block(vec![
                let_var(
                    "garbage",
                    Expr::ArrayLiteral {
                        elements: vec![string("x"), ident("keep"), num(3.0)],
                        line: 0,
                    },
                ),
                assign("i", binary(BinaryOp::Add, ident("i"), num(1.0))),
            ])),
        },
        ret(method_call(
            Expr::Index {
                callee: Box::new(ident("keep")),
                index: Box::new(num(0.0)),
                line: 0,
            },
            "length",
            vec![],
        )),
    ]);
    assert_eq!(result.as_int(), 6);
}

// =============================================================================
// Modules
// =============================================================================

#[test]
fn unaliased_import_resolves_exports() {
    let lib = Module {
        name: "lib.vsp".to_string(),
        declarations: vec![],
        exports: vec!["triple".to_string()],
        deps: vec![],
        stmts: vec![Stmt::Func {
            name: tok("triple"),
            params: vec![tok("n")],
            body: vec![ret(binary(BinaryOp::Multiply, ident("n"), num(3.0)))],
        }],
    };
    let lib = Module {
        declarations: lib.derive_declarations(),
        ..lib
    };
    let mut main = Module::script("main.vsp", vec![ret(call(ident("triple"), vec![num(7.0)]))]);
    main.deps = vec![Dependency {
        module: "lib.vsp".to_string(),
        alias: None,
    }];
    let result = interpret(&[lib, main]).expect("program should run");
    assert_eq!(result.as_int(), 21);
}

#[test]
fn aliased_import_requires_module_access() {
    let lib = Module {
        name: "lib.vsp".to_string(),
        declarations: vec![],
        exports: vec!["seven".to_string()],
        deps: vec![],
        stmts: vec![Stmt::Var {
            name: tok("seven"),
            initializer: Some(num(7.0)),
        }],
    };
    let lib = Module {
        declarations: lib.derive_declarations(),
        ..lib
    };
    let mut main = Module::script(
        "main.vsp",
        vec![ret(Expr::ModuleAccess {
            module: tok("m"),
            name: tok("seven"),
        })],
    );
    main.deps = vec![Dependency {
        module: "lib.vsp".to_string(),
        alias: Some(tok("m")),
    }];
    let result = interpret(&[lib, main]).expect("program should run");
    assert_eq!(result.as_int(), 7);
}

#[test]
fn plain_name_does_not_see_aliased_imports() {
    let lib = Module {
        name: "lib.vsp".to_string(),
        declarations: vec![],
        exports: vec!["seven".to_string()],
        deps: vec![],
        stmts: vec![Stmt::Var {
            name: tok("seven"),
            initializer: Some(num(7.0)),
        }],
    };
    let lib = Module {
        declarations: lib.derive_declarations(),
        ..lib
    };
    let mut main = Module::script("main.vsp", vec![ret(ident("seven"))]);
    main.deps = vec![Dependency {
        module: "lib.vsp".to_string(),
        alias: Some(tok("m")),
    }];
    let result = interpret(&[lib, main]);
    assert!(matches!(result, Err(VesperError::Compile(_))));
}
