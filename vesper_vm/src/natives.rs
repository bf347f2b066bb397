//! The concrete native function set.
//!
//! Two tables are built at startup: the flat function table (`print`,
//! `clock`, `open`) addressed by `GET_NATIVE`, and the per-builtin method
//! dictionaries consulted by property access on primitive receivers.
//!
//! Stub convention: arguments sit on top of the stack, the receiver (for
//! bound methods) in the callee slot below them. A stub pops its arguments,
//! pushes its result, and returns `Ok(true)` to make the VM collapse the
//! callee slot with that result.

use std::time::{SystemTime, UNIX_EPOCH};
use vesper_core::{RuntimeError, RuntimeErrorCode, Value};
use vesper_runtime::object::{self, ObjKind};
use vesper_runtime::{Builtin, GcHeap, NativeCtx, NativeRegistry};

fn err(code: RuntimeErrorCode, message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(code, message)
}

/// Build the registry the VM runs with.
#[must_use]
pub fn create_registry(heap: &GcHeap) -> NativeRegistry {
    let mut registry = NativeRegistry::new();

    registry.add_function(heap, "print", -1, native_print);
    registry.add_function(heap, "clock", 0, native_clock);
    registry.add_function(heap, "open", 1, native_open);

    registry.add_method(Builtin::Common, "to_text", 0, common_to_text);

    registry.add_method(Builtin::Str, "length", 0, string_length);
    registry.add_method(Builtin::Str, "contains", 1, string_contains);

    registry.add_method(Builtin::Array, "length", 0, array_length);
    registry.add_method(Builtin::Array, "push", 1, array_push);
    registry.add_method(Builtin::Array, "pop", 0, array_pop);

    registry.add_method(Builtin::File, "path", 0, file_path);

    registry.add_method(Builtin::Mutex, "lock", 0, mutex_lock);
    registry.add_method(Builtin::Mutex, "unlock", 0, mutex_unlock);

    registry.add_method(Builtin::Future, "done", 0, future_done);
    registry.add_method(Builtin::Future, "cancel", 0, future_cancel);

    registry
}

// =============================================================================
// Flat natives
// =============================================================================

/// `print(...)`: write every argument, space separated, then a newline.
fn native_print(ctx: &mut dyn NativeCtx, argc: usize) -> Result<bool, RuntimeError> {
    let mut parts = Vec::with_capacity(argc);
    for _ in 0..argc {
        parts.push(object::display_value(ctx.pop()));
    }
    parts.reverse();
    println!("{}", parts.join(" "));
    ctx.push(Value::nil())?;
    Ok(true)
}

/// `clock()`: seconds since the epoch as a double.
fn native_clock(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    ctx.push(Value::double(seconds))?;
    Ok(true)
}

/// `open(path)`: make a file object for `path`.
fn native_open(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let path = ctx.pop();
    if !object::is_obj_kind(path, ObjKind::String) {
        return Err(err(
            RuntimeErrorCode::Type,
            format!("Expected a string path, got {}.", object::type_name(path)),
        ));
    }
    // SAFETY: kind checked; the argument is rooted until popped above and
    // no collection can run inside a native.
    let path = unsafe { (*object::as_string(path)).chars.clone() };
    let file = ctx.heap().alloc_file(path);
    ctx.push(Value::obj(file.cast()))?;
    Ok(true)
}

// =============================================================================
// Common methods
// =============================================================================

/// `value.to_text()`: the display rendering as an interned string.
fn common_to_text(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    let text = object::display_value(receiver);
    let string = ctx.heap().intern(&text);
    ctx.push(Value::obj(string.cast()))?;
    Ok(true)
}

// =============================================================================
// String methods
// =============================================================================

fn string_length(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    // SAFETY: the method table dispatched on the receiver's kind.
    let len = unsafe { (&(*object::as_string(receiver)).chars).len() };
    ctx.push(Value::int(len as i32))?;
    Ok(true)
}

fn string_contains(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let needle = ctx.pop();
    let receiver = ctx.peek(0);
    if !object::is_obj_kind(needle, ObjKind::String) {
        return Err(err(
            RuntimeErrorCode::Type,
            format!("Expected a string, got {}.", object::type_name(needle)),
        ));
    }
    // SAFETY: kinds checked / dispatched.
    let found = unsafe {
        (*object::as_string(receiver))
            .chars
            .contains(&(*object::as_string(needle)).chars)
    };
    ctx.push(Value::bool(found))?;
    Ok(true)
}

// =============================================================================
// Array methods
// =============================================================================

fn array_length(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind.
    let len = unsafe { (*object::as_array(receiver)).values.len() };
    ctx.push(Value::int(len as i32))?;
    Ok(true)
}

fn array_push(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let value = ctx.pop();
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind; the traced-pointer count stays exact.
    unsafe {
        let array = object::as_array(receiver);
        if value.is_obj() {
            (*array).heap_ptr_count += 1;
        }
        (*array).values.push(value);
    }
    ctx.push(Value::nil())?;
    Ok(true)
}

fn array_pop(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind.
    let popped = unsafe { (*object::as_array(receiver)).values.pop() };
    let Some(value) = popped else {
        return Err(err(RuntimeErrorCode::OutOfBounds, "Pop from an empty array."));
    };
    if value.is_obj() {
        // SAFETY: same array as above.
        unsafe { (*object::as_array(receiver)).heap_ptr_count -= 1 };
    }
    ctx.push(value)?;
    Ok(true)
}

// =============================================================================
// File methods
// =============================================================================

fn file_path(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind.
    let path = unsafe { (*object::as_file(receiver)).path.clone() };
    let string = ctx.heap().intern(&path);
    ctx.push(Value::obj(string.cast()))?;
    Ok(true)
}

// =============================================================================
// Mutex methods
// =============================================================================

fn mutex_lock(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    use parking_lot::lock_api::RawMutex as _;
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind; the raw lock supports split lock/unlock.
    unsafe { (*object::as_mutex(receiver)).raw.lock() };
    ctx.push(Value::nil())?;
    Ok(true)
}

fn mutex_unlock(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    use parking_lot::lock_api::RawMutex as _;
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind; unlocking an unheld mutex is the caller's
    // bug, same as in the language model.
    unsafe { (*object::as_mutex(receiver)).raw.unlock() };
    ctx.push(Value::nil())?;
    Ok(true)
}

// =============================================================================
// Future methods
// =============================================================================

fn future_done(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind.
    let settled = unsafe { (*object::as_future(receiver)).settled_value().is_some() };
    ctx.push(Value::bool(settled))?;
    Ok(true)
}

fn future_cancel(ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
    let receiver = ctx.peek(0);
    // SAFETY: dispatched on kind.
    ctx.request_cancel(unsafe { object::as_future(receiver) });
    ctx.push(Value::nil())?;
    Ok(true)
}
