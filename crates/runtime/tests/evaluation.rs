//! Whole-interpreter behavior through the public embedding API

use cellvm_core::sym;
use cellvm_runtime::{ApiItem, Cell, Config, Eval, Flow, Interpreter};

fn interp() -> Interpreter {
    Interpreter::new(Config::default())
}

fn eval(interp: &mut Interpreter, source: &str) -> Eval<Cell> {
    let array = interp.load(source, None)?;
    interp.do_array(array, 0, None)
}

#[test]
fn test_sequence_yields_last_value() {
    let mut interp = interp();
    let result = eval(&mut interp, "[1 2 3]").unwrap();
    let block = result.value.series().unwrap();
    let result = interp.do_array(block, 0, None).unwrap();
    assert_eq!(result.as_integer(), Some(3));
    assert_eq!(interp.depth(), 0);
}

#[test]
fn test_derived_object_resolves_to_its_own_fields() {
    let mut interp = interp();
    eval(
        &mut interp,
        "o1: object [x: 10 f: func [] [x]]  o2: derive o1 [x: 20]",
    )
    .unwrap();
    assert_eq!(eval(&mut interp, "o2/f").unwrap().as_integer(), Some(20));
    assert_eq!(eval(&mut interp, "o1/f").unwrap().as_integer(), Some(10));

    // a third generation still overrides the first
    eval(&mut interp, "o3: derive o2 [x: 30]").unwrap();
    assert_eq!(eval(&mut interp, "o3/f").unwrap().as_integer(), Some(30));
}

#[test]
fn test_repeated_calls_reuse_argument_buffers() {
    let mut interp = interp();
    interp.run_text("add 1 2").unwrap();
    let before = interp.arena_stats();
    for _ in 0..1000 {
        let result = interp.run_text("add 1 2").unwrap();
        assert_eq!(result.as_integer(), Some(3));
    }
    let after = interp.arena_stats();
    assert_eq!(after.allocated, before.allocated);
    assert!(after.reused - before.reused >= 1000);
}

#[test]
fn test_unbound_word_is_caught_two_levels_up() {
    let mut interp = interp();
    let source = "outer: func [] [inner]  inner: func [] [nowhere-defined]  trap [outer]";
    let error = eval(&mut interp, source).unwrap();
    assert_eq!(interp.error_id(&error).as_deref(), Some("not-bound"));

    let word = interp.error_field(&error, sym::ARG1).unwrap();
    let expected = interp.symbols.lookup("nowhere-defined").unwrap();
    assert_eq!(word.as_symbol(), Some(expected));
    assert_eq!(interp.depth(), 0);
}

#[test]
fn test_throw_is_seen_through_every_level() {
    let mut interp = interp();
    eval(
        &mut interp,
        "down: func [n] [either n = 0 [throw/name 99 'bottom] [down n - 1  0]]",
    )
    .unwrap();

    let caught = eval(&mut interp, "catch/name [down 8] 'bottom").unwrap();
    assert_eq!(caught.as_integer(), Some(99));

    // an unnamed catch is not listening for a named throw
    let err = eval(&mut interp, "catch [down 3]").unwrap_err();
    assert!(matches!(err, Flow::Throw { value, .. } if value.as_integer() == Some(99)));
    assert_eq!(interp.depth(), 0);
}

#[test]
fn test_return_only_leaves_its_own_function() {
    let mut interp = interp();
    let source = "inner: func [] [return 1  2]  outer: func [] [inner + 10]  outer";
    assert_eq!(eval(&mut interp, source).unwrap().as_integer(), Some(11));
}

#[test]
#[should_panic(expected = "stack overflow")]
fn test_runaway_recursion_is_fatal() {
    let mut interp = Interpreter::new(Config::default().with_max_depth(32));
    let _ = eval(&mut interp, "f: func [] [f]  f");
}

#[test]
fn test_halt_stops_run_and_clears() {
    let mut interp = interp();
    interp.request_halt();
    let err = interp.run_text("1 + 1").unwrap_err();
    assert!(err.is_halt());
    assert_eq!(interp.depth(), 0);
    assert_eq!(interp.run_text("1 + 1").unwrap().as_integer(), Some(2));
}

#[test]
fn test_api_handles_survive_collection() {
    let mut interp = interp();
    let handle = interp.text("kept");
    interp.recycle();
    let value = interp.handle_value(&handle);
    assert_eq!(interp.form(&value), "kept");

    let before = interp.heap.live_pairings();
    let result = interp
        .run(vec![
            ApiItem::Text("append".into()),
            ApiItem::Release(handle),
            ApiItem::Text("\"!\"".into()),
        ])
        .unwrap();
    assert_eq!(interp.form(&result), "kept!");
    assert_eq!(interp.heap.live_pairings(), before - 1);
}

#[test]
fn test_error_report_names_the_word() {
    let mut interp = interp();
    let err = interp.run_text("print missing-thing").unwrap_err();
    let report = interp.report(&err);
    assert!(report.starts_with("** Script Error:"), "{report}");
    assert!(report.contains("missing-thing"), "{report}");
}

#[test]
fn test_object_bodies_survive_collection() {
    let mut interp = interp();
    let object = eval(&mut interp, "object [recycle]").unwrap();
    assert_eq!(interp.mold(&object), "make object! []");

    let source = "o1: object [x: 1 recycle y: x + 1]  o1/y";
    assert_eq!(eval(&mut interp, source).unwrap().as_integer(), Some(2));

    let source = "o2: derive o1 [recycle z: y * 10]  recycle  o2/z";
    assert_eq!(eval(&mut interp, source).unwrap().as_integer(), Some(20));
    assert_eq!(eval(&mut interp, "o2/x").unwrap().as_integer(), Some(1));
}

#[test]
fn test_function_bodies_survive_collection() {
    let mut interp = interp();
    let source = "make-counter: func [n] [recycle object [count: n  bump: func [] [count: count + 1]]]
        c: make-counter 5  recycle  c/bump  c/bump";
    assert_eq!(eval(&mut interp, source).unwrap().as_integer(), Some(7));

    let source = "grow: func [b] [recycle append b [1 2] recycle b]  grow [0]";
    let block = eval(&mut interp, source).unwrap();
    assert_eq!(interp.mold(&block), "[0 1 2]");
}

#[test]
fn test_evaluation_under_ballast_pressure() {
    let mut interp = Interpreter::new(Config::default().with_gc_ballast(1024));
    let source = "o: object [items: []  add-item: func [v] [append items v]]
        o/add-item 1  o/add-item 2  o/add-item 3  o/items";
    let items = eval(&mut interp, source).unwrap();
    assert_eq!(interp.mold(&items), "[1 2 3]");
    assert!(interp.heap.stats().collections > 0);
}
