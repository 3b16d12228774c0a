//! In-process tests of the engine facade.
//!
//! These drive the public API directly: submission, lookup, calls into
//! JIT-compiled code, failure handling and teardown.

#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::sync::Arc;
use std::thread;

use orca::config::EngineConfig;
use orca::error::{CompileError, JitError, LinkError, LookupError};
use orca::ir::{Function, Global, Inst, Module, parse_module};
use orca::jit::{Engine, SymbolFlags};

fn engine() -> Engine {
    Engine::with_config(EngineConfig {
        compile_workers: Some(2),
        ..Default::default()
    })
    .unwrap()
}

fn constant(module: &str, name: &str, value: i64) -> Module {
    Module::new(module).with_function(Function::new(name, &[]).with_body(vec![Inst::Const(value), Inst::Ret]))
}

fn call0(engine: &Engine, name: &str) -> i64 {
    let f: extern "C" fn() -> i64 = unsafe { engine.get_function(name).unwrap() };
    f()
}

#[test]
fn test_add_returns_sum() {
    let engine = engine();
    let module = parse_module(
        "module arith\n\
         export func add(a, b) {\n\
           arg a\n\
           arg b\n\
           add\n\
           ret\n\
         }\n",
    )
    .unwrap();
    engine.add_module(module).unwrap();

    let first = engine.get_symbol_address("add").unwrap();
    assert_ne!(first, 0);
    // Repeat lookups return the same address
    assert_eq!(engine.get_symbol_address("add").unwrap(), first);

    let add: extern "C" fn(i64, i64) -> i64 = unsafe { engine.get_function("add").unwrap() };
    assert_eq!(add(2, 3), 5);
    assert_eq!(add(i64::MAX, 1), i64::MIN);
}

#[test]
fn test_duplicate_definition_is_rejected() {
    let engine = engine();
    engine.add_module(constant("first", "answer", 42)).unwrap();

    let err = engine.add_module(constant("second", "answer", 7)).unwrap_err();
    assert!(err.is_duplicate_symbol());

    // The first definition is unchanged
    assert_eq!(call0(&engine, "answer"), 42);
}

#[test]
fn test_process_symbol_resolves() {
    let engine = engine();
    let labs = engine.lookup_symbol("labs").unwrap();
    assert_ne!(labs.address, 0);
    assert!(labs.flags.absolute);
}

#[test]
fn test_unknown_symbol() {
    let engine = engine();
    assert_eq!(
        engine.lookup_symbol("orca_definitely_not_defined"),
        Err(LookupError::SymbolNotFound("orca_definitely_not_defined".to_string()))
    );
}

#[test]
fn test_concurrent_submission() {
    let engine = Arc::new(engine());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..8 {
                    let value = t * 100 + i;
                    let name = format!("value_{}", value);
                    engine
                        .add_module(constant(&format!("m{}", value), &name, value))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..8 {
            let value = t * 100 + i;
            assert_eq!(call0(&engine, &format!("value_{}", value)), value);
        }
    }
}

#[test]
fn test_lookups_from_many_threads_agree() {
    let engine = Arc::new(engine());
    engine.add_module(constant("m", "shared", 11)).unwrap();

    let addresses: Vec<u64> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.get_symbol_address("shared").unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_end_fails_later_operations() {
    let engine = engine();
    engine.add_module(constant("m", "one", 1)).unwrap();
    engine.get_symbol_address("one").unwrap();
    assert!(engine.session().memory_in_use() > 0);

    engine.end();
    engine.end();
    assert_eq!(engine.lookup_symbol("one"), Err(LookupError::SessionEnded));
    assert_eq!(engine.lookup_symbol("labs"), Err(LookupError::SessionEnded));
    assert_eq!(engine.add_module(constant("n", "two", 2)), Err(JitError::SessionEnded));
    assert_eq!(engine.session().memory_in_use(), 0);
}

#[test]
fn test_compile_failure_is_isolated() {
    let engine = engine();
    let broken = Module::new("broken").with_function(Function::new("bad", &[]).with_body(vec![Inst::Add, Inst::Ret]));
    engine.add_module(broken).unwrap();
    engine.add_module(constant("fine", "good", 3)).unwrap();

    assert!(matches!(
        engine.lookup_symbol("bad"),
        Err(LookupError::MaterializationFailed { ref reason, .. }) if reason.contains("underflow")
    ));
    assert_eq!(call0(&engine, "good"), 3);

    // The name is free again once its module failed
    engine.add_module_blocking(constant("fixed", "bad", 4)).unwrap();
    assert_eq!(call0(&engine, "bad"), 4);
}

#[test]
fn test_blocking_submission_reports_compile_error() {
    let engine = engine();
    let empty = Module::new("empty").with_function(Function::new("nothing", &[]));
    let err = engine.add_module_blocking(empty).unwrap_err();
    assert!(matches!(err, JitError::Compile(CompileError::Verify { .. })));
}

#[test]
fn test_memory_limit_rolls_back() {
    let engine = Engine::with_config(EngineConfig {
        compile_workers: Some(1),
        memory_limit: Some(1),
        ..Default::default()
    })
    .unwrap();

    let err = engine.add_module_blocking(constant("m", "big", 1)).unwrap_err();
    assert!(matches!(err, JitError::Link(LinkError::Allocation(_))));
    assert!(engine.main_library().symbols().is_empty());
    assert_eq!(engine.session().memory_in_use(), 0);
    assert!(matches!(
        engine.lookup_symbol("big"),
        Err(LookupError::MaterializationFailed { .. })
    ));
}

#[test]
fn test_calls_across_modules_and_into_process() {
    let engine = engine();
    // Submitted before the function it calls
    let caller = parse_module(
        "module caller\n\
         export func distance(a, b) {\n\
           arg a\n\
           arg b\n\
           call diff 2\n\
           call labs 1\n\
           ret\n\
         }\n",
    )
    .unwrap();
    let callee = parse_module(
        "module callee\n\
         export func diff(a, b) {\n\
           arg a\n\
           arg b\n\
           sub\n\
           ret\n\
         }\n",
    )
    .unwrap();
    engine.add_module(caller).unwrap();
    engine.add_module(callee).unwrap();

    let distance: extern "C" fn(i64, i64) -> i64 = unsafe { engine.get_function("distance").unwrap() };
    assert_eq!(distance(3, 10), 7);
    assert_eq!(distance(10, 3), 7);
}

#[test]
fn test_mutually_recursive_modules() {
    let engine = engine();
    let even = parse_module(
        "module even\n\
         export func is_even(n) {\n\
           arg n\n\
           br_nonzero recurse\n\
           const 1\n\
           ret\n\
         recurse:\n\
           arg n\n\
           const 1\n\
           sub\n\
           call is_odd 1\n\
           ret\n\
         }\n",
    )
    .unwrap();
    let odd = parse_module(
        "module odd\n\
         export func is_odd(n) {\n\
           arg n\n\
           br_nonzero recurse\n\
           const 0\n\
           ret\n\
         recurse:\n\
           arg n\n\
           const 1\n\
           sub\n\
           call is_even 1\n\
           ret\n\
         }\n",
    )
    .unwrap();
    engine.add_module(even).unwrap();
    engine.add_module(odd).unwrap();

    let is_even: extern "C" fn(i64) -> i64 = unsafe { engine.get_function("is_even").unwrap() };
    let is_odd: extern "C" fn(i64) -> i64 = unsafe { engine.get_function("is_odd").unwrap() };
    assert_eq!(is_even(10), 1);
    assert_eq!(is_even(3), 0);
    assert_eq!(is_odd(7), 1);
    assert_eq!(is_odd(0), 0);
}

#[test]
fn test_unresolved_reference_fails_link() {
    let engine = Engine::with_config(EngineConfig {
        compile_workers: Some(1),
        process_symbols: false,
        ..Default::default()
    })
    .unwrap();
    let module = Module::new("m").with_function(Function::new("f", &[]).with_body(vec![
        Inst::Call {
            callee: "nowhere".into(),
            argc: 0,
        },
        Inst::Ret,
    ]));
    let err = engine.add_module_blocking(module).unwrap_err();
    assert!(matches!(err, JitError::Link(LinkError::UnresolvedSymbol { .. })));
}

#[test]
fn test_globals_and_loops() {
    let engine = engine();
    let module = Module::new("data")
        .with_global(Global::new("counter", vec![0]).mutable())
        .with_global(Global::new("limit", vec![5]))
        .with_function(Function::new("count_up", &[]).with_locals(&["i"]).with_body(vec![
            Inst::Label(0),
            Inst::LocalGet(0),
            Inst::SymbolAddr("limit".into()),
            Inst::Load,
            Inst::Lt,
            Inst::BranchIfZero(1),
            Inst::SymbolAddr("counter".into()),
            Inst::SymbolAddr("counter".into()),
            Inst::Load,
            Inst::LocalGet(0),
            Inst::Add,
            Inst::Store,
            Inst::LocalGet(0),
            Inst::Const(1),
            Inst::Add,
            Inst::LocalSet(0),
            Inst::Jump(0),
            Inst::Label(1),
            Inst::SymbolAddr("counter".into()),
            Inst::Load,
            Inst::Ret,
        ]));
    engine.add_module(module).unwrap();

    // 0 + 1 + 2 + 3 + 4
    assert_eq!(call0(&engine, "count_up"), 10);
    assert_eq!(call0(&engine, "count_up"), 20);

    let counter = engine.lookup_symbol("counter").unwrap();
    assert_eq!(counter.flags, SymbolFlags::DATA);
    assert_eq!(unsafe { *(counter.address as *const i64) }, 20);
}

#[test]
fn test_division_edge_cases() {
    let engine = engine();
    let binary = |name: &str, op: Inst| {
        Function::new(name, &["a", "b"]).with_body(vec![Inst::Arg(0), Inst::Arg(1), op, Inst::Ret])
    };
    let module = Module::new("div")
        .with_function(binary("div", Inst::Div))
        .with_function(binary("rem", Inst::Rem))
        .with_function(binary("shr", Inst::Shr));
    engine.add_module(module).unwrap();

    let div: extern "C" fn(i64, i64) -> i64 = unsafe { engine.get_function("div").unwrap() };
    let rem: extern "C" fn(i64, i64) -> i64 = unsafe { engine.get_function("rem").unwrap() };
    let shr: extern "C" fn(i64, i64) -> i64 = unsafe { engine.get_function("shr").unwrap() };

    assert_eq!(div(-9, 2), -4);
    assert_eq!(rem(-9, 2), -1);
    assert_eq!(div(7, 0), 0);
    assert_eq!(rem(7, 0), 7);
    assert_eq!(div(i64::MIN, -1), i64::MIN);
    assert_eq!(rem(i64::MIN, -1), 0);
    assert_eq!(shr(-16, 2), -4);
    assert_eq!(shr(1, 65), 0);
}

#[test]
fn test_internal_functions_are_hidden() {
    let engine = engine();
    let module = Module::new("m")
        .with_function(Function::new("helper", &[]).internal().with_body(vec![Inst::Const(9), Inst::Ret]))
        .with_function(Function::new("public", &[]).with_body(vec![
            Inst::Call {
                callee: "helper".into(),
                argc: 0,
            },
            Inst::Ret,
        ]));
    engine.add_module_blocking(module).unwrap();

    assert_eq!(call0(&engine, "public"), 9);
    assert!(matches!(
        engine.lookup_symbol("helper"),
        Err(LookupError::SymbolNotFound(_))
    ));
}

#[cfg(target_os = "linux")]
#[test]
fn test_code_pages_are_not_writable() {
    let engine = engine();
    engine.add_module(constant("m", "seven", 7)).unwrap();
    let address = engine.get_symbol_address("seven").unwrap();

    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    let perms = maps
        .lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let range = fields.next()?;
            let perms = fields.next()?;
            let (start, end) = range.split_once('-')?;
            let start = u64::from_str_radix(start, 16).ok()?;
            let end = u64::from_str_radix(end, 16).ok()?;
            (start..end).contains(&address).then(|| perms.to_string())
        })
        .unwrap();
    assert!(perms.starts_with("r-x"), "code mapped as {}", perms);
}
