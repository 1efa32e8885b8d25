//! Boot natives
//!
//! The smallest library that exercises the evaluator: invisibles, quoting,
//! integer arithmetic (with enfix operators), interpreted functions with
//! definitional RETURN, objects and derivation, throw/catch, errors and
//! trap, protection, and a few series helpers.
//!
//! Dispatchers 0 and 1 are reserved for interpreted function bodies and
//! definitional RETURN; every FUNC-made action points at the first, and
//! the RETURN stored in a function frame points at the second.

use crate::dispatch::{Bounce, Dispatcher};
use crate::error::RuntimeError;
use crate::interpreter::{FrameId, Interpreter};
use crate::throw::{Eval, Flow};
use cellvm_core::action::{action_body, action_details, action_num_params, action_param, make_action};
use cellvm_core::context::{
    append_key, derive_context, ensure_key, freeze_context, make_context, manage_context,
};
use cellvm_core::series::{SERIES_INFO_FROZEN, SERIES_INFO_PROTECTED};
use cellvm_core::{
    ArrayKind, Cell, ContextKind, Fatal, Guard, Key, ParamClass, SeriesId, Specifier, TextKind,
    Value, crash,
};

pub(crate) const FUNC_DISPATCHER: u32 = 0;
pub(crate) const RETURN_DISPATCHER: u32 = 1;

const NATIVES: &[(&str, &str, Dispatcher)] = &[
    ("comment", "'discarded", comment),
    ("elide", "discarded", elide),
    ("quote", "'value", quote),
    ("add", "value1 value2", add),
    ("subtract", "value1 value2", subtract),
    ("multiply", "value1 value2", multiply),
    ("equal?", "value1 value2", equal_q),
    ("lesser?", "value1 value2", lesser_q),
    ("func", "spec [block!] body [block!]", func),
    ("does", "body [block!]", does),
    ("object", "body [block!]", object),
    ("derive", "parent [object!] body [block!]", derive),
    ("do", "source", do_native),
    ("if", "condition branch [block!]", if_native),
    ("either", "condition true-branch [block!] false-branch [block!]", either),
    ("throw", "value /name word", throw),
    ("catch", "block [block!] /name word", catch),
    ("fail", "reason [text! error!]", fail),
    ("trap", "block [block!]", trap),
    ("get", "word", get),
    ("set", "word value", set),
    ("protect", "value", protect),
    ("unprotect", "value", unprotect),
    ("freeze", "value", freeze),
    ("append", "series value /only", append),
    ("print", "value", print),
    ("recycle", "", recycle),
];

const ENFIX: &[(&str, &str, Dispatcher)] = &[
    ("+", "value1 value2", add),
    ("-", "value1 value2", subtract),
    ("*", "value1 value2", multiply),
    ("=", "value1 value2", equal_q),
    ("<", "value1 value2", lesser_q),
];

/// Install the reserved dispatchers, the natives and the constants in
/// `lib`. No action is run during boot.
pub(crate) fn boot(interp: &mut Interpreter) {
    let func_id = interp.add_dispatcher("func", func_dispatcher);
    let return_id = interp.add_dispatcher("return", return_dispatcher);
    debug_assert_eq!((func_id, return_id), (FUNC_DISPATCHER, RETURN_DISPATCHER));

    let value = interp.symbols.intern("value");
    interp.return_action = make_action(&mut interp.heap, &[Key::new(value)], RETURN_DISPATCHER, None);

    for &(name, spec, dispatcher) in NATIVES {
        if let Err(flow) = interp.register_native(name, spec, dispatcher) {
            crash(Fatal::Invariant(format!("boot: native {name} failed: {flow:?}")));
        }
    }
    for &(name, spec, dispatcher) in ENFIX {
        if let Err(flow) = interp.register_enfix(name, spec, dispatcher) {
            crash(Fatal::Invariant(format!("boot: operator {name} failed: {flow:?}")));
        }
    }

    let constants = [
        ("true", Cell::logic(true)),
        ("false", Cell::logic(false)),
        ("null", Cell::nulled()),
        ("blank", Cell::blank()),
    ];
    for (name, value) in constants {
        let symbol = interp.symbols.intern(name);
        if let Err(flow) = interp.define_lib(symbol, value) {
            crash(Fatal::Invariant(format!("boot: constant {name} failed: {flow:?}")));
        }
    }
}

/// Series, index and specifier of a block argument.
fn block_arg(
    interp: &mut Interpreter,
    f: FrameId,
    index: usize,
) -> Eval<(SeriesId, usize, Option<SeriesId>)> {
    let cell = interp.arg(f, index);
    match cell.value {
        Value::Array {
            kind: ArrayKind::Block,
            series,
            index: at,
            ..
        } => Ok((series, at as usize, interp.array_specifier(&cell))),
        _ => Err(interp.arg_type_error(f, index, &cell)),
    }
}

// =============================================================================
// Invisibles and quoting
// =============================================================================

fn comment(_interp: &mut Interpreter, _f: FrameId) -> Eval<Bounce> {
    Ok(Bounce::Invisible)
}

fn elide(_interp: &mut Interpreter, _f: FrameId) -> Eval<Bounce> {
    Ok(Bounce::Invisible)
}

fn quote(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let value = interp.arg(f, 1);
    match value.quoted(1) {
        Some(quoted) => Ok(Bounce::Out(quoted)),
        None => Err(interp.arg_type_error(f, 1, &value)),
    }
}

// =============================================================================
// Arithmetic and comparison
// =============================================================================

fn arithmetic(
    interp: &mut Interpreter,
    f: FrameId,
    int_op: fn(i64, i64) -> Option<i64>,
    dec_op: fn(f64, f64) -> f64,
) -> Eval<Bounce> {
    let a = interp.arg(f, 1);
    let b = interp.arg(f, 2);
    let result = match (a.value, b.value) {
        (Value::Integer(x), Value::Integer(y)) => match int_op(x, y) {
            Some(n) => Cell::integer(n),
            None => return Err(interp.raise(RuntimeError::Overflow)),
        },
        (Value::Integer(x), Value::Decimal(y)) => Cell::decimal(dec_op(x as f64, y)),
        (Value::Decimal(x), Value::Integer(y)) => Cell::decimal(dec_op(x, y as f64)),
        (Value::Decimal(x), Value::Decimal(y)) => Cell::decimal(dec_op(x, y)),
        (Value::Integer(_) | Value::Decimal(_), _) => return Err(interp.arg_type_error(f, 2, &b)),
        _ => return Err(interp.arg_type_error(f, 1, &a)),
    };
    Ok(Bounce::Out(result))
}

fn add(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    arithmetic(interp, f, i64::checked_add, |x, y| x + y)
}

fn subtract(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    arithmetic(interp, f, i64::checked_sub, |x, y| x - y)
}

fn multiply(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    arithmetic(interp, f, i64::checked_mul, |x, y| x * y)
}

/// Equality: numbers by value, words by canon spelling, text by content,
/// everything else by identity.
pub(crate) fn values_equal(interp: &Interpreter, a: &Cell, b: &Cell) -> bool {
    if a.quote_depth() != b.quote_depth() {
        return false;
    }
    match (a.value, b.value) {
        (Value::Integer(x), Value::Decimal(y)) | (Value::Decimal(y), Value::Integer(x)) => {
            x as f64 == y
        }
        (
            Value::Word {
                kind: ka,
                symbol: sa,
                ..
            },
            Value::Word {
                kind: kb,
                symbol: sb,
                ..
            },
        ) => ka == kb && interp.symbols.same(sa, sb),
        (
            Value::Text {
                kind: ka,
                series: sa,
                index: ia,
            },
            Value::Text {
                kind: kb,
                series: sb,
                index: ib,
            },
        ) => {
            let text = |series: SeriesId, index: u32| {
                interp
                    .heap
                    .series(series)
                    .as_str()
                    .get(index as usize..)
                    .unwrap_or("")
            };
            ka == kb && text(sa, ia) == text(sb, ib)
        }
        (x, y) => x == y,
    }
}

fn equal_q(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let a = interp.arg(f, 1);
    let b = interp.arg(f, 2);
    Ok(Bounce::Out(Cell::logic(values_equal(interp, &a, &b))))
}

fn lesser_q(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let a = interp.arg(f, 1);
    let b = interp.arg(f, 2);
    let number = |cell: &Cell| match cell.value {
        Value::Integer(i) => Some(i as f64),
        Value::Decimal(d) => Some(d),
        _ => None,
    };
    match (number(&a), number(&b)) {
        (Some(x), Some(y)) => Ok(Bounce::Out(Cell::logic(x < y))),
        (None, _) => Err(interp.arg_type_error(f, 1, &a)),
        (_, None) => Err(interp.arg_type_error(f, 2, &b)),
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Make an interpreted function. The body is copied (resolving anything
/// relative to the frame it came from) and its parameter words are made
/// relative to the new action.
fn make_function(
    interp: &mut Interpreter,
    spec: Option<(SeriesId, usize)>,
    body: (SeriesId, usize, Option<SeriesId>),
) -> Eval<Cell> {
    let mut keys = match spec {
        Some((series, index)) => interp.params_from_spec(series, index)?,
        None => Vec::new(),
    };
    interp.add_return_key(&mut keys);

    let (series, index, specifier) = body;
    let copy = interp.copy_deep(series, index, specifier);
    let paramlist = make_action(&mut interp.heap, &keys, FUNC_DISPATCHER, None);
    interp.relativize_deep(copy, paramlist);

    let details = action_details(&interp.heap, paramlist);
    interp.heap.series_mut(details).push_unchecked(Cell::new(Value::Array {
        kind: ArrayKind::Block,
        series: copy,
        index: 0,
        specifier: Specifier::Relative(paramlist),
    }));
    Ok(Cell::action(paramlist, None))
}

fn func(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let (spec, spec_index, _) = block_arg(interp, f, 1)?;
    let body = block_arg(interp, f, 2)?;
    make_function(interp, Some((spec, spec_index)), body).map(Bounce::Out)
}

fn does(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let body = block_arg(interp, f, 1)?;
    make_function(interp, None, body).map(Bounce::Out)
}

/// Run an interpreted function's body against its frame.
fn func_dispatcher(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let (Some(paramlist), Some(varlist)) = (interp.frame(f).original, interp.frame_varlist(f))
    else {
        crash(Fatal::Invariant("function dispatch without a frame".into()));
    };
    for index in 1..=action_num_params(&interp.heap, paramlist) {
        if action_param(&interp.heap, paramlist, index).class == ParamClass::Return {
            let definitional = Cell::action(interp.return_action, Some(varlist));
            interp.set_arg(f, index, definitional);
        }
    }

    let body = action_body(&interp.heap, paramlist).map(|cell| cell.value);
    let Some(Value::Array { series, index, .. }) = body else {
        crash(Fatal::Invariant("function without a body".into()));
    };
    let mut out = Cell::void();
    match interp.eval_array_into(&mut out, series, index as usize, Some(varlist)) {
        Ok(_) => Ok(Bounce::Out(out)),
        Err(Flow::Throw { label, value }) => {
            let flow = Flow::Throw { label, value };
            if flow.is_return_to(varlist) {
                Ok(Bounce::Out(value))
            } else {
                Err(flow)
            }
        }
        Err(flow) => Err(flow),
    }
}

/// Definitional RETURN: throw to the frame this RETURN is bound to.
fn return_dispatcher(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let value = interp.arg(f, 1);
    let Some(target) = interp.frame(f).binding else {
        return Err(interp.raise(RuntimeError::User("return used outside of a function".into())));
    };
    if !interp.heap.series(target).is_accessible() {
        return Err(interp.raise(RuntimeError::ExpiredFrame));
    }
    Err(Flow::Throw {
        label: Cell::context(ContextKind::Frame, target),
        value,
    })
}

// =============================================================================
// Objects
// =============================================================================

/// Copy `body`, bind it to `context` and evaluate it.
///
/// The context is only reachable from this native until it is returned, so
/// it stays guarded while the body runs.
fn run_in_context(
    interp: &mut Interpreter,
    context: SeriesId,
    body: (SeriesId, usize, Option<SeriesId>),
) -> Eval<()> {
    let (series, index, specifier) = body;
    let copy = interp.copy_deep(series, index, specifier);
    interp.bind_deep(copy, context);
    let guards = interp.heap.guards_len();
    interp.heap.push_guard(Guard::Series(context));
    let result = interp.do_array(copy, 0, None);
    interp.heap.truncate_guards(guards);
    result.map(|_| ())
}

fn object(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let body = block_arg(interp, f, 1)?;
    let words = interp.collect_set_words(body.0, body.1);
    let context = make_context(&mut interp.heap, ContextKind::Object, words.len());
    for symbol in words {
        if let Err(e) = append_key(&mut interp.heap, context, symbol) {
            return Err(interp.raise(RuntimeError::Locked(e)));
        }
    }
    manage_context(&mut interp.heap, context);
    run_in_context(interp, context, body)?;
    Ok(Bounce::Out(Cell::context(ContextKind::Object, context)))
}

fn derive(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let parent = interp.arg(f, 1);
    let Value::Context {
        kind: ContextKind::Object,
        varlist: parent,
        ..
    } = parent.value
    else {
        return Err(interp.arg_type_error(f, 1, &parent));
    };
    let body = block_arg(interp, f, 2)?;
    let words = interp.collect_set_words(body.0, body.1);
    let child = derive_context(&mut interp.heap, parent, words.len());
    for symbol in words {
        if let Err(e) = ensure_key(&mut interp.heap, &interp.symbols, child, symbol) {
            return Err(interp.raise(RuntimeError::Locked(e)));
        }
    }
    manage_context(&mut interp.heap, child);
    run_in_context(interp, child, body)?;
    Ok(Bounce::Out(Cell::context(ContextKind::Object, child)))
}

// =============================================================================
// Evaluation and control
// =============================================================================

fn do_native(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let source = interp.arg(f, 1);
    let result = match source.value {
        Value::Array {
            kind: ArrayKind::Block | ArrayKind::Group,
            series,
            index,
            ..
        } => {
            let specifier = interp.array_specifier(&source);
            interp.do_array(series, index as usize, specifier)?
        }
        Value::Text {
            kind: TextKind::Text,
            series,
            index,
        } => {
            let text = interp
                .heap
                .series(series)
                .as_str()
                .get(index as usize..)
                .unwrap_or("")
                .to_string();
            let array = interp.load(&text, None)?;
            interp.do_array(array, 0, None)?
        }
        Value::Context {
            kind: ContextKind::Error,
            ..
        } => return Err(Flow::Raise(source)),
        _ => source,
    };
    Ok(Bounce::Out(result))
}

fn if_native(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    if !interp.arg(f, 1).is_truthy() {
        return Ok(Bounce::Out(Cell::nulled()));
    }
    let (series, index, specifier) = block_arg(interp, f, 2)?;
    interp.do_array(series, index, specifier).map(Bounce::Out)
}

fn either(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let branch = if interp.arg(f, 1).is_truthy() { 2 } else { 3 };
    let (series, index, specifier) = block_arg(interp, f, branch)?;
    interp.do_array(series, index, specifier).map(Bounce::Out)
}

fn throw(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let value = interp.arg(f, 1);
    let label = if interp.has_refinement(f, "name") {
        interp.arg(f, 3)
    } else {
        Cell::nulled()
    };
    Err(Flow::Throw { label, value })
}

fn catch(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let (series, index, specifier) = block_arg(interp, f, 1)?;
    let name = interp.has_refinement(f, "name").then(|| interp.arg(f, 3));
    let snap = interp.snapshot();
    match interp.do_array(series, index, specifier) {
        Ok(value) => Ok(Bounce::Out(value)),
        Err(Flow::Throw { label, value }) if catches(interp, name.as_ref(), &label) => {
            interp.rollback(&snap);
            Ok(Bounce::Out(value))
        }
        Err(flow) => Err(flow),
    }
}

/// Unnamed CATCH takes only unnamed throws; CATCH/NAME takes throws whose
/// label equals its name.
fn catches(interp: &Interpreter, name: Option<&Cell>, label: &Cell) -> bool {
    match name {
        None => label.is_nulled(),
        Some(name) => !label.is_nulled() && values_equal(interp, name, label),
    }
}

fn fail(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let reason = interp.arg(f, 1);
    match reason.value {
        Value::Text { series, .. } => {
            let message = interp.heap.series(series).as_str().to_string();
            Err(interp.raise(RuntimeError::User(message)))
        }
        Value::Context {
            kind: ContextKind::Error,
            ..
        } => Err(Flow::Raise(reason)),
        _ => Err(interp.arg_type_error(f, 1, &reason)),
    }
}

fn trap(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let (series, index, specifier) = block_arg(interp, f, 1)?;
    let snap = interp.snapshot();
    match interp.do_array(series, index, specifier) {
        Ok(_) => Ok(Bounce::Out(Cell::nulled())),
        Err(Flow::Raise(error)) => {
            interp.rollback(&snap);
            Ok(Bounce::Out(error))
        }
        Err(flow) => Err(flow),
    }
}

// =============================================================================
// Variables and protection
// =============================================================================

fn get(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let word = interp.arg(f, 1);
    if word.as_symbol().is_none() {
        return Err(interp.arg_type_error(f, 1, &word));
    }
    interp.get_var(&word, None).map(Bounce::Out)
}

fn set(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let word = interp.arg(f, 1);
    let value = interp.arg(f, 2);
    if word.as_symbol().is_none() {
        return Err(interp.arg_type_error(f, 1, &word));
    }
    interp.escape(&value);
    interp.set_var(&word, None, value)?;
    Ok(Bounce::Out(value))
}

fn set_protection(interp: &mut Interpreter, f: FrameId, protect: bool) -> Eval<Bounce> {
    let value = interp.arg(f, 1);
    match value.value {
        Value::Word { .. } => interp.protect_word(&value, protect)?,
        Value::Context { varlist: series, .. }
        | Value::Array { series, .. }
        | Value::Text { series, .. }
        | Value::Binary { series, .. } => {
            let target = interp.heap.series_mut(series);
            if protect {
                target.set_info(SERIES_INFO_PROTECTED);
            } else {
                target.clear_info(SERIES_INFO_PROTECTED);
            }
        }
        _ => return Err(interp.arg_type_error(f, 1, &value)),
    }
    Ok(Bounce::Out(value))
}

fn protect(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    set_protection(interp, f, true)
}

fn unprotect(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    set_protection(interp, f, false)
}

fn freeze(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let value = interp.arg(f, 1);
    match value.value {
        Value::Context { varlist, .. } => freeze_context(&mut interp.heap, varlist),
        Value::Array { series, .. } | Value::Text { series, .. } | Value::Binary { series, .. } => {
            interp.heap.series_mut(series).set_info(SERIES_INFO_FROZEN)
        }
        _ => return Err(interp.arg_type_error(f, 1, &value)),
    }
    Ok(Bounce::Out(value))
}

// =============================================================================
// Series
// =============================================================================

fn append(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    let target = interp.arg(f, 1);
    let value = interp.arg(f, 2);
    let only = interp.has_refinement(f, "only");
    let result = match (target.value, value.value) {
        (
            Value::Array { series, .. },
            Value::Array {
                kind: ArrayKind::Block,
                series: source,
                index,
                ..
            },
        ) if !only => {
            let specifier = interp.array_specifier(&value);
            let items = interp
                .heap
                .series(source)
                .cells()
                .get(index as usize..)
                .unwrap_or(&[])
                .to_vec();
            let mut result = Ok(());
            for item in items {
                let item = interp.derelativize(item, specifier).copied();
                interp.escape(&item);
                result = interp.heap.series_mut(series).push(item);
                if result.is_err() {
                    break;
                }
            }
            result
        }
        (Value::Array { series, .. }, _) => {
            interp.escape(&value);
            interp.heap.series_mut(series).push(value.copied())
        }
        (Value::Text { series, .. }, _) => {
            let text = interp.form(&value);
            interp.heap.series_mut(series).push_str(&text)
        }
        _ => return Err(interp.arg_type_error(f, 1, &target)),
    };
    result.map_err(|e| interp.raise(RuntimeError::Locked(e)))?;
    Ok(Bounce::Out(target))
}

fn print(interp: &mut Interpreter, f: FrameId) -> Eval<Bounce> {
    use std::io::Write;
    let value = interp.arg(f, 1);
    let text = interp.form(&value);
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{text}") {
        tracing::warn!(error = %e, "print failed");
    }
    Ok(Bounce::Out(Cell::void()))
}

fn recycle(interp: &mut Interpreter, _f: FrameId) -> Eval<Bounce> {
    let freed = interp.recycle();
    Ok(Bounce::Out(Cell::integer(freed as i64)))
}
