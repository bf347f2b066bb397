//! Per-thread interpreter state.
//!
//! Every interpreter thread owns a fixed-size value stack and call-frame
//! array; these are never shared. Stack slot 0 holds nil on the main thread
//! and the rooted `Future` on a child, which is also how the dispatch loop
//! tells the two apart.

use crate::vm::Vm;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use vesper_core::{RuntimeError, RuntimeErrorCode, Value};
use vesper_runtime::object::{self, ObjClosure, ObjFuture, ObjKind, ObjUpvalue};
use vesper_runtime::{GcHeap, NativeCtx, Tracer};

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;

/// Value stack capacity per thread.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// A call frame: the active closure, the instruction pointer into the
/// shared bytecode, and the stack slot of the call's receiver.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    /// The closure being executed.
    pub closure: *mut ObjClosure,
    /// Absolute index into the shared bytecode array.
    pub ip: usize,
    /// Stack index of the callee slot; argument `i` is at `slots + 1 + i`.
    pub slots: usize,
}

/// One interpreter thread.
pub struct Thread {
    /// Fixed-size operand stack.
    pub stack: Box<[Value]>,
    /// Index one past the top of the stack.
    pub stack_top: usize,
    /// Call frames, bounded by [`FRAMES_MAX`].
    pub frames: Vec<CallFrame>,
    /// The shared VM.
    pub vm: Arc<Vm>,
    /// Cooperative cancellation flag, observed at the dispatch safepoint.
    pub cancel: AtomicBool,
}

// SAFETY: a Thread is owned by exactly one OS thread; the raw pointers it
// holds reference the shared GC heap, whose access is serialized by the
// stop-the-world protocol.
unsafe impl Send for Thread {}

impl Thread {
    /// Fresh thread with an empty stack.
    #[must_use]
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            stack: vec![Value::nil(); STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            vm,
            cancel: AtomicBool::new(false),
        }
    }

    /// The future rooted in stack slot 0, if this is a child thread.
    #[must_use]
    pub fn future(&self) -> Option<*mut ObjFuture> {
        let slot = self.stack[0];
        if object::is_obj_kind(slot, ObjKind::Future) {
            // SAFETY: kind just checked.
            Some(unsafe { object::as_future(slot) })
        } else {
            None
        }
    }

    // =========================================================================
    // Stack
    // =========================================================================

    /// Push a value, checking for stack exhaustion.
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack_top >= STACK_MAX {
            return Err(RuntimeError::new(
                RuntimeErrorCode::StackOverflow,
                "Stack overflow.",
            ));
        }
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
        Ok(())
    }

    /// Pop the top value.
    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    /// Drop `n` values.
    #[inline]
    pub fn popn(&mut self, n: usize) {
        self.stack_top -= n;
    }

    /// Read `depth` slots below the top.
    #[inline]
    #[must_use]
    pub fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack_top - 1 - depth]
    }

    /// Overwrite `depth` slots below the top.
    #[inline]
    pub fn set_peek(&mut self, depth: usize, value: Value) {
        self.stack[self.stack_top - 1 - depth] = value;
    }

    /// Mark this thread's roots: every live stack slot and every frame's
    /// closure.
    pub fn mark(&self, tracer: &mut Tracer) {
        for &value in &self.stack[..self.stack_top] {
            tracer.mark_value(value);
        }
        for frame in &self.frames {
            tracer.mark_obj(frame.closure.cast());
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Dispatch a call on `callee` sitting `argc` slots below the stack top.
    pub fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        match object::obj_kind(callee) {
            Some(ObjKind::Closure) => {
                // SAFETY: kind checked.
                self.call_closure(unsafe { object::as_closure(callee) }, argc)
            }
            Some(ObjKind::Native) => {
                // SAFETY: kind checked.
                let native = unsafe { object::as_native(callee) };
                let (func, arity, name) =
                    unsafe { ((*native).func, (*native).arity, (*native).name.clone()) };
                self.call_native(func, arity, &name, argc)
            }
            Some(ObjKind::BoundNative) => {
                // SAFETY: kind checked.
                let bound = unsafe { object::as_bound_native(callee) };
                let (func, arity, name, receiver) = unsafe {
                    (
                        (*bound).func,
                        (*bound).arity,
                        (*bound).name.clone(),
                        (*bound).receiver,
                    )
                };
                // Plant the receiver in the callee slot; `this` for natives.
                self.set_peek(argc, receiver);
                self.call_native(func, arity, &name, argc)
            }
            Some(ObjKind::Class) => {
                // SAFETY: kind checked.
                let class = unsafe { object::as_class(callee) };
                let instance = self.vm.heap.alloc_instance(class);
                self.set_peek(argc, Value::obj(instance.cast()));
                let constructor = unsafe { (*class).methods.get(&(*class).name).copied() };
                match constructor {
                    Some(ctor) => {
                        // SAFETY: the compiler only stores closures in method tables.
                        self.call_closure(unsafe { object::as_closure(ctor) }, argc)
                    }
                    None if argc != 0 => Err(RuntimeError::new(
                        RuntimeErrorCode::Arity,
                        format!("Class constructor expects 0 arguments but got {argc}."),
                    )),
                    None => Ok(()),
                }
            }
            Some(ObjKind::BoundMethod) => {
                // SAFETY: kind checked.
                let bound = unsafe { object::as_bound_method(callee) };
                let (receiver, method) = unsafe { ((*bound).receiver, (*bound).method) };
                self.set_peek(argc, receiver);
                self.call_closure(method, argc)
            }
            _ => Err(RuntimeError::new(
                RuntimeErrorCode::Type,
                "Can only call functions and classes.",
            )),
        }
    }

    /// Install a new call frame for `closure`.
    pub fn call_closure(
        &mut self,
        closure: *mut ObjClosure,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        // SAFETY: closures and their functions are kept live by the stack.
        let (arity, bytecode_offset) = unsafe {
            let func = (*closure).function;
            ((*func).arity as usize, (*func).bytecode_offset)
        };
        if argc != arity {
            return Err(RuntimeError::new(
                RuntimeErrorCode::Arity,
                format!("Expected {arity} arguments for function call but got {argc}."),
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::new(
                RuntimeErrorCode::StackOverflow,
                "Stack overflow.",
            ));
        }
        self.frames.push(CallFrame {
            closure,
            ip: bytecode_offset,
            slots: self.stack_top - argc - 1,
        });
        Ok(())
    }

    /// Invoke a native stub with the arity check and the collapse-on-true
    /// convention: when the stub returns true, the callee slot is replaced
    /// by the result it pushed.
    pub fn call_native(
        &mut self,
        func: vesper_runtime::NativeFn,
        arity: i8,
        name: &str,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        if arity != -1 && argc != arity as usize {
            return Err(RuntimeError::new(
                RuntimeErrorCode::Arity,
                format!("Function {name} expects {arity} arguments but got {argc}."),
            ));
        }
        if func(self, argc)? {
            let result = self.pop();
            self.set_peek(0, result);
        }
        Ok(())
    }

    // =========================================================================
    // Upvalues and method binding
    // =========================================================================

    /// Promote the local at `slot` to a heap cell, or reuse the cell it was
    /// already promoted to. Every closure capturing the same local must end
    /// up with the same cell.
    pub fn capture_upvalue(&mut self, slot: usize) -> *mut ObjUpvalue {
        let value = self.stack[slot];
        if object::is_obj_kind(value, ObjKind::Upvalue) {
            // SAFETY: kind checked.
            return unsafe { object::as_upvalue(value) };
        }
        let cell = self.vm.heap.alloc_upvalue(value);
        self.stack[slot] = Value::obj(cell.cast());
        cell
    }

    /// Replace the stack top (the receiver) with a bound method for `name`
    /// looked up on `class`. False when the class has no such method.
    pub fn bind_method(
        &mut self,
        class: *mut vesper_runtime::ObjClass,
        name: &str,
    ) -> Result<bool, RuntimeError> {
        // SAFETY: classes are rooted through the globals array.
        let Some(method) = (unsafe { (*class).methods.get(name).copied() }) else {
            return Ok(false);
        };
        let receiver = self.peek(0);
        // SAFETY: method tables hold closures only.
        let bound = self
            .vm
            .heap
            .alloc_bound_method(receiver, unsafe { object::as_closure(method) });
        self.set_peek(0, Value::obj(bound.cast()));
        Ok(true)
    }

    /// Replace the stack top with a native method bound to it. Unknown
    /// method names fail here, with the missing-member code.
    pub fn bind_native_method(&mut self, name: &str) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        let method = self.vm.natives.find_method(receiver, name).ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorCode::MissingMember,
                format!(
                    "{} doesn't contain property '{}'.",
                    object::type_name(receiver),
                    name
                ),
            )
        })?;
        let bound =
            self.vm
                .heap
                .alloc_bound_native(name, method.arity, method.func, receiver);
        self.set_peek(0, Value::obj(bound.cast()));
        Ok(())
    }

    /// Call `class`'s method `name` with the receiver already sitting below
    /// the arguments. False when the class has no such method.
    pub fn invoke_from_class(
        &mut self,
        class: *mut vesper_runtime::ObjClass,
        name: &str,
        argc: usize,
    ) -> Result<bool, RuntimeError> {
        // SAFETY: classes are rooted through the globals array.
        let Some(method) = (unsafe { (*class).methods.get(name).copied() }) else {
            return Ok(false);
        };
        // SAFETY: method tables hold closures only.
        self.call_closure(unsafe { object::as_closure(method) }, argc)?;
        Ok(true)
    }

    /// Fused field-access-then-call.
    pub fn invoke(&mut self, name: &str, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        if object::is_obj_kind(receiver, ObjKind::Instance) {
            // SAFETY: kind checked.
            let instance = unsafe { object::as_instance(receiver) };
            // A field holding a callable replaces the receiver slot.
            if let Some(field) = unsafe { (*instance).fields.get(name).copied() } {
                self.set_peek(argc, field);
                return self.call_value(field, argc);
            }
            let class = unsafe { (*instance).class };
            if !class.is_null() && self.invoke_from_class(class, name, argc)? {
                return Ok(());
            }
        }
        let method = self.vm.natives.find_method(receiver, name).ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorCode::MissingMember,
                format!(
                    "{} doesn't contain property '{}'.",
                    object::type_name(receiver),
                    name
                ),
            )
        })?;
        self.call_native(method.func, method.arity, name, argc)
    }
}

impl NativeCtx for Thread {
    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        Thread::push(self, v)
    }

    fn pop(&mut self) -> Value {
        Thread::pop(self)
    }

    fn peek(&self, depth: usize) -> Value {
        Thread::peek(self, depth)
    }

    fn heap(&self) -> &GcHeap {
        &self.vm.heap
    }

    /// Holding the pool lock keeps the target thread from finishing its
    /// reap, so the flag write cannot race its deallocation.
    fn request_cancel(&self, fut: *mut ObjFuture) {
        let pool = self.vm.child_threads.lock();
        // SAFETY: the future is rooted by the caller's stack.
        let target = unsafe { (*fut).thread_ptr() };
        if target.is_null() {
            return;
        }
        if pool.iter().any(|&p| p.cast::<()>() == target) {
            // SAFETY: membership in the pool means the thread is alive.
            unsafe {
                (*target.cast::<Thread>())
                    .cancel
                    .store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}
