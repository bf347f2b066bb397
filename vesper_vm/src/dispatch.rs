//! The bytecode dispatch loop.
//!
//! Each iteration begins at the safepoint: the cancel flag and the
//! collector's `should_collect` flag are checked before the next opcode is
//! fetched. This is the only safepoint; everything the stop-the-world
//! protocol guarantees hangs off it, which is why `AWAIT` takes care to keep
//! participating in the pause handshake while it blocks.
//!
//! Runtime errors travel out of the loop as an explicit `Result`; the outer
//! driver prints the trace and surfaces the numeric code.

use crate::thread::{CallFrame, Thread};
use std::sync::atomic::Ordering;
use std::time::Duration;
use vesper_compiler::OpCode;
use vesper_core::{RuntimeError, RuntimeErrorCode, Value};
use vesper_runtime::object::{self, ObjArray, ObjKind};

/// How long a blocked `await` sleeps between safepoint re-checks.
const AWAIT_POLL: Duration = Duration::from_millis(1);

fn err(code: RuntimeErrorCode, message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(code, message)
}

impl Thread {
    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch with no frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("dispatch with no frame")
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("dispatch with no frame");
        let byte = self.vm.code.bytecode[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    /// Base of the running function's constants in the shared pool.
    #[inline]
    fn const_base(&self) -> usize {
        // SAFETY: frame closures and their functions are rooted by the stack.
        unsafe { (*(*self.frame().closure).function).constants_offset }
    }

    #[inline]
    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        self.vm.code.constants[self.const_base() + index]
    }

    /// Read a name constant. The compiler only ever emits interned strings
    /// for these slots.
    fn read_string(&mut self, long: bool) -> Result<String, RuntimeError> {
        let value = self.read_constant(long);
        if !object::is_obj_kind(value, ObjKind::String) {
            return Err(err(
                RuntimeErrorCode::MalformedOpcode,
                "Name operand is not a string constant.",
            ));
        }
        // SAFETY: kind checked.
        Ok(unsafe { (*object::as_string(value)).chars.clone() })
    }

    /// Run bytecode until frame 0 returns. The result is the returned value.
    pub fn execute(&mut self) -> Result<Value, RuntimeError> {
        let my_fut = self.future();
        // An async call on a native runs to completion inside LAUNCH_ASYNC
        // and leaves no frame; its result is already on the stack.
        if self.frames.is_empty() {
            let result = if self.stack_top > 0 {
                self.peek(0)
            } else {
                Value::nil()
            };
            if let Some(fut) = my_fut {
                // SAFETY: the future is rooted in stack slot 0.
                unsafe { (*fut).settle(result) };
                self.vm.reap(fut);
            }
            return Ok(result);
        }
        loop {
            // Safepoint: cancellation, then the collector's pause request.
            if my_fut.is_some() && self.cancel.load(Ordering::SeqCst) {
                let fut = my_fut.expect("checked");
                // SAFETY: the future is rooted in stack slot 0.
                unsafe { (*fut).settle(Value::nil()) };
                self.vm.reap(fut);
                return Ok(Value::nil());
            }
            if self.vm.heap.should_collect.load(Ordering::SeqCst) {
                let vm = self.vm.clone();
                if my_fut.is_none() {
                    vm.run_gc_as_main(self);
                } else {
                    vm.pause_as_child();
                }
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(err(
                    RuntimeErrorCode::MalformedOpcode,
                    format!("Unrecognized opcode {byte:#04x}."),
                ));
            };
            match op {
                // =============================================================
                // Stack shuffling and constants
                // =============================================================
                OpCode::Pop => {
                    self.stack_top -= 1;
                }
                OpCode::PopN => {
                    let n = self.read_byte() as usize;
                    self.popn(n);
                }
                OpCode::LoadInt => {
                    let n = self.read_byte();
                    self.push(Value::int(i32::from(n)))?;
                }
                OpCode::Constant => {
                    let constant = self.read_constant(false);
                    self.push(constant)?;
                }
                OpCode::ConstantLong => {
                    let constant = self.read_constant(true);
                    self.push(constant)?;
                }
                OpCode::Nil => self.push(Value::nil())?,
                OpCode::True => self.push(Value::bool(true))?,
                OpCode::False => self.push(Value::bool(false))?,

                // =============================================================
                // Unary
                // =============================================================
                OpCode::Negate => {
                    let value = self.peek(0);
                    if !value.is_number() {
                        return Err(err(
                            RuntimeErrorCode::Type,
                            format!(
                                "Operand must be a number, got {}.",
                                object::type_name(value)
                            ),
                        ));
                    }
                    let negated = if value.is_int() {
                        Value::int(value.as_int().wrapping_neg())
                    } else {
                        Value::double(-value.as_double())
                    };
                    self.set_peek(0, negated);
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::bool(value.is_falsey()))?;
                }
                OpCode::BinNot => {
                    let value = self.peek(0);
                    if !value.is_number() {
                        return Err(err(
                            RuntimeErrorCode::Type,
                            format!(
                                "Operand must be a number, got {}.",
                                object::type_name(value)
                            ),
                        ));
                    }
                    if !value.is_int() {
                        return Err(err(
                            RuntimeErrorCode::Type,
                            "Number must be an integer, got a float.",
                        ));
                    }
                    self.set_peek(0, Value::int(!value.as_int()));
                }
                OpCode::Increment => self.op_increment()?,

                // =============================================================
                // Binary numeric
                // =============================================================
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.arith(|a, b| a - b, |a, b| a - b)?,
                OpCode::Multiply => self.arith(|a, b| a * b, |a, b| a * b)?,
                OpCode::Divide => self.op_divide()?,
                OpCode::Mod => self.int_op("%", |a, b| a.wrapping_rem(b))?,
                OpCode::BitshiftLeft => self.int_op("<<", |a, b| a.wrapping_shl(b as u32))?,
                OpCode::BitshiftRight => self.int_op(">>", |a, b| a.wrapping_shr(b as u32))?,
                OpCode::BitwiseAnd => self.int_op("&", |a, b| a & b)?,
                OpCode::BitwiseOr => self.int_op("|", |a, b| a | b)?,
                OpCode::BitwiseXor => self.int_op("^", |a, b| a ^ b)?,

                // =============================================================
                // Comparison
                // =============================================================
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(object::equals(a, b)))?;
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(!object::equals(a, b)))?;
                }
                OpCode::Greater => self.compare(|a, b| a > b)?,
                // Epsilon tolerance on the inclusive comparisons.
                OpCode::GreaterEqual => self.compare(|a, b| a >= b - f64::EPSILON)?,
                OpCode::Less => self.compare(|a, b| a < b)?,
                OpCode::LessEqual => self.compare(|a, b| a < b + f64::EPSILON)?,

                // =============================================================
                // Variables
                // =============================================================
                OpCode::GetNative => {
                    let slot = self.read_u16() as usize;
                    let Some(&native) = self.vm.natives.functions.get(slot) else {
                        return Err(err(
                            RuntimeErrorCode::MalformedOpcode,
                            format!("Native slot {slot} out of range."),
                        ));
                    };
                    self.push(Value::obj(native.cast()))?;
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let index = if op == OpCode::DefineGlobal {
                        self.read_byte() as usize
                    } else {
                        self.read_u16() as usize
                    };
                    let value = self.pop();
                    self.vm.globals.set(index, value);
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let index = if op == OpCode::GetGlobal {
                        self.read_byte() as usize
                    } else {
                        self.read_u16() as usize
                    };
                    let value = self.vm.globals.get(index);
                    self.push(value)?;
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let index = if op == OpCode::SetGlobal {
                        self.read_byte() as usize
                    } else {
                        self.read_u16() as usize
                    };
                    self.vm.globals.set(index, self.peek(0));
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    // A captured local holds its cell; reads indirect.
                    if object::is_obj_kind(value, ObjKind::Upvalue) {
                        // SAFETY: kind checked.
                        let cell = unsafe { object::as_upvalue(value) };
                        self.push(unsafe { (*cell).value })?;
                    } else {
                        self.push(value)?;
                    }
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let index = self.frame().slots + slot;
                    let current = self.stack[index];
                    if object::is_obj_kind(current, ObjKind::Upvalue) {
                        // SAFETY: kind checked.
                        let cell = unsafe { object::as_upvalue(current) };
                        unsafe { (*cell).value = self.peek(0) };
                    } else {
                        self.stack[index] = self.peek(0);
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    // SAFETY: frame closure rooted by the stack.
                    let value = unsafe { (*(&(*self.frame().closure).upvalues)[slot]).value };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    // SAFETY: frame closure rooted by the stack.
                    unsafe { (*(&mut (*self.frame().closure).upvalues)[slot]).value = value };
                }

                // =============================================================
                // Control flow
                // =============================================================
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfFalsePop => {
                    let offset = self.read_u16() as usize;
                    if self.pop().is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::LoopIfTrue => {
                    let offset = self.read_u16() as usize;
                    if !self.pop().is_falsey() {
                        self.frame_mut().ip -= offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::JumpPopN => {
                    let n = self.read_byte() as usize;
                    self.popn(n);
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::Switch => self.op_switch(false)?,
                OpCode::SwitchLong => self.op_switch(true)?,

                // =============================================================
                // Calls and closures
                // =============================================================
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(self.peek(argc), argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no frame");
                    if self.frames.is_empty() {
                        if let Some(fut) = my_fut {
                            // SAFETY: future rooted in stack slot 0.
                            unsafe { (*fut).settle(result) };
                            self.vm.reap(fut);
                        }
                        return Ok(result);
                    }
                    self.stack_top = frame.slots;
                    self.push(result)?;
                }
                OpCode::Closure => self.op_closure(false)?,
                OpCode::ClosureLong => self.op_closure(true)?,
                OpCode::Invoke | OpCode::InvokeLong => {
                    let argc = self.read_byte() as usize;
                    let name = self.read_string(op == OpCode::InvokeLong)?;
                    self.invoke(&name, argc)?;
                }
                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let argc = self.read_byte() as usize;
                    let name = self.read_string(op == OpCode::SuperInvokeLong)?;
                    let superclass = self.pop();
                    if !object::is_obj_kind(superclass, ObjKind::Class) {
                        return Err(err(
                            RuntimeErrorCode::MalformedOpcode,
                            "Super invoke without a class operand.",
                        ));
                    }
                    // SAFETY: kind checked.
                    let class = unsafe { object::as_class(superclass) };
                    if !self.invoke_from_class(class, &name, argc)? {
                        let class_name = unsafe { (*class).name.clone() };
                        return Err(err(
                            RuntimeErrorCode::MissingMember,
                            format!("{class_name} doesn't contain method '{name}'."),
                        ));
                    }
                }

                // =============================================================
                // Async
                // =============================================================
                OpCode::LaunchAsync => self.op_launch_async()?,
                OpCode::Await => self.op_await(my_fut.is_none())?,

                // =============================================================
                // Aggregates
                // =============================================================
                OpCode::CreateArray => {
                    let count = self.read_byte() as usize;
                    let mut values = vec![Value::nil(); count];
                    // Stack order is reversed relative to the literal.
                    for slot in values.iter_mut().rev() {
                        *slot = self.pop();
                    }
                    let array = self.vm.heap.alloc_array(values);
                    self.push(Value::obj(array.cast()))?;
                }
                OpCode::Get => self.op_get()?,
                OpCode::Set => self.op_set()?,
                OpCode::CreateStruct | OpCode::CreateStructLong => {
                    let long = op == OpCode::CreateStructLong;
                    let count = self.read_byte() as usize;
                    // Null class marks a struct literal.
                    let instance = self.vm.heap.alloc_instance(std::ptr::null_mut());
                    // Names come in reverse field order, matching pop order.
                    for _ in 0..count {
                        let name = self.read_string(long)?;
                        let value = self.pop();
                        // SAFETY: just allocated; rooted after push below.
                        unsafe { (*instance).fields.insert(name, value) };
                    }
                    self.push(Value::obj(instance.cast()))?;
                }

                // =============================================================
                // Classes and properties
                // =============================================================
                OpCode::Class => {
                    let name = self.read_string(true)?;
                    let class = self.vm.heap.alloc_class(name);
                    self.push(Value::obj(class.cast()))?;
                }
                OpCode::Method => {
                    let name = self.read_string(true)?;
                    let method = self.peek(0);
                    let class_value = self.peek(1);
                    if !object::is_obj_kind(class_value, ObjKind::Class) {
                        return Err(err(
                            RuntimeErrorCode::MalformedOpcode,
                            "Method target is not a class.",
                        ));
                    }
                    // SAFETY: kind checked; only the method is popped, the
                    // class stays for its siblings.
                    unsafe {
                        (*object::as_class(class_value)).methods.insert(name, method);
                    }
                    self.stack_top -= 1;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !object::is_obj_kind(superclass, ObjKind::Class) {
                        return Err(err(
                            RuntimeErrorCode::Type,
                            format!(
                                "Superclass must be a class, got {}.",
                                object::type_name(superclass)
                            ),
                        ));
                    }
                    let subclass = self.peek(0);
                    if !object::is_obj_kind(subclass, ObjKind::Class) {
                        return Err(err(
                            RuntimeErrorCode::MalformedOpcode,
                            "Inherit target is not a class.",
                        ));
                    }
                    // SAFETY: kinds checked; copy-down inheritance.
                    unsafe {
                        let superclass = object::as_class(superclass);
                        let subclass = object::as_class(subclass);
                        let methods = (*superclass).methods.clone();
                        (*subclass).methods.extend(methods);
                        (*subclass).superclass = superclass;
                    }
                }
                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let name = self.read_string(op == OpCode::GetPropertyLong)?;
                    self.op_get_property(&name)?;
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let name = self.read_string(op == OpCode::SetPropertyLong)?;
                    let target = self.pop();
                    if !object::is_obj_kind(target, ObjKind::Instance) {
                        return Err(err(
                            RuntimeErrorCode::Type,
                            format!(
                                "Only instances/structs have properties, got {}.",
                                object::type_name(target)
                            ),
                        ));
                    }
                    let value = self.peek(0);
                    // SAFETY: kind checked. Setting always succeeds, whether
                    // overriding or creating the field.
                    unsafe {
                        (*object::as_instance(target)).fields.insert(name, value);
                    }
                }
                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let name = self.read_string(op == OpCode::GetSuperLong)?;
                    let superclass = self.pop();
                    if !object::is_obj_kind(superclass, ObjKind::Class) {
                        return Err(err(
                            RuntimeErrorCode::MalformedOpcode,
                            "Super access without a class operand.",
                        ));
                    }
                    // SAFETY: kind checked.
                    let class = unsafe { object::as_class(superclass) };
                    if !self.bind_method(class, &name)? {
                        let class_name = unsafe { (*class).name.clone() };
                        return Err(err(
                            RuntimeErrorCode::MissingMember,
                            format!("{class_name} doesn't contain method '{name}'."),
                        ));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Compound handlers
    // =========================================================================

    /// `ADD`: numbers add with int-to-double overflow promotion; two strings
    /// concatenate into a fresh interned string.
    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_number() && b.is_number() {
            return self.arith(|a, b| a + b, |a, b| a + b);
        }
        if object::is_obj_kind(a, ObjKind::String) && object::is_obj_kind(b, ObjKind::String) {
            // SAFETY: kinds checked; operands stay rooted until set_peek.
            let joined = unsafe {
                let a = object::as_string(a);
                let b = object::as_string(b);
                format!("{}{}", (*a).chars, (*b).chars)
            };
            let result = self.vm.heap.intern(&joined);
            self.set_peek(1, Value::obj(result.cast()));
            self.stack_top -= 1;
            return Ok(());
        }
        Err(err(
            RuntimeErrorCode::Type,
            format!(
                "Operands must be two numbers or two strings, got {} and {}.",
                object::type_name(a),
                object::type_name(b)
            ),
        ))
    }

    /// Shared body of `SUBTRACT`/`MULTIPLY`/numeric `ADD`: int pairs compute
    /// in 64 bits and promote to double on 32-bit overflow, mixed operands
    /// widen to double.
    fn arith(
        &mut self,
        int_op: fn(i64, i64) -> i64,
        double_op: fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Operands must be numbers, got '{}' and '{}'.",
                    object::type_name(a),
                    object::type_name(b)
                ),
            ));
        }
        let result = if a.is_int() && b.is_int() {
            let wide = int_op(i64::from(a.as_int()), i64::from(b.as_int()));
            if wide >= i64::from(i32::MIN) && wide <= i64::from(i32::MAX) {
                Value::int(wide as i32)
            } else {
                Value::double(wide as f64)
            }
        } else {
            Value::double(double_op(a.as_number(), b.as_number()))
        };
        self.set_peek(1, result);
        self.stack_top -= 1;
        Ok(())
    }

    /// `DIVIDE` with the integer-division-by-zero guard.
    fn op_divide(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        if b.is_int() && b.as_int() == 0 && self.peek(1).is_int() {
            return Err(err(RuntimeErrorCode::Type, "Division by zero."));
        }
        self.arith(|a, b| a / b, |a, b| a / b)
    }

    /// Integer-only binary ops: `MOD`, shifts, bitwise.
    fn int_op(&mut self, symbol: &str, op: fn(i32, i32) -> i32) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_int() || !b.is_int() {
            return Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Operands must be integers, got '{}' and '{}'.",
                    object::type_name(a),
                    object::type_name(b)
                ),
            ));
        }
        if symbol == "%" && b.as_int() == 0 {
            return Err(err(RuntimeErrorCode::Type, "Division by zero."));
        }
        self.set_peek(1, Value::int(op(a.as_int(), b.as_int())));
        self.stack_top -= 1;
        Ok(())
    }

    /// Ordering comparisons over numbers, widened to double.
    fn compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Operands must be two numbers, got {} and {}.",
                    object::type_name(a),
                    object::type_name(b)
                ),
            ));
        }
        self.set_peek(1, Value::bool(op(a.as_number(), b.as_number())));
        self.stack_top -= 1;
        Ok(())
    }

    /// Array index check: integer within `[0, len)`.
    fn check_array_bounds(
        &self,
        field: Value,
        array: *mut ObjArray,
    ) -> Result<usize, RuntimeError> {
        if !field.is_int() {
            return Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Index must be an integer, got {}.",
                    object::type_name(field)
                ),
            ));
        }
        let index = field.as_int();
        // SAFETY: array rooted by the caller's stack.
        let len = unsafe { (*array).values.len() };
        if index < 0 || index as usize >= len {
            return Err(err(
                RuntimeErrorCode::OutOfBounds,
                format!(
                    "Index {} outside of range [0, {}].",
                    index,
                    len as i64 - 1
                ),
            ));
        }
        Ok(index as usize)
    }

    /// `GET`: array indexing or struct field access.
    fn op_get(&mut self) -> Result<(), RuntimeError> {
        let field = self.pop();
        let callee = self.pop();
        match object::obj_kind(callee) {
            Some(ObjKind::Array) => {
                // SAFETY: kind checked.
                let array = unsafe { object::as_array(callee) };
                let index = self.check_array_bounds(field, array)?;
                let value = unsafe { (&(*array).values)[index] };
                self.push(value)
            }
            // Bracket access is for struct literals only; class instances
            // use the property opcodes.
            Some(ObjKind::Instance)
                // SAFETY: kind checked.
                if unsafe { (*object::as_instance(callee)).class.is_null() } =>
            {
                if !object::is_obj_kind(field, ObjKind::String) {
                    return Err(err(
                        RuntimeErrorCode::Type,
                        format!(
                            "Expected a string for field name, got {}.",
                            object::type_name(field)
                        ),
                    ));
                }
                // SAFETY: kinds checked.
                let value = unsafe {
                    let name = &(*object::as_string(field)).chars;
                    (*object::as_instance(callee)).fields.get(name).copied()
                };
                match value {
                    Some(value) => self.push(value),
                    None => {
                        // SAFETY: kind checked above.
                        let name = unsafe { (*object::as_string(field)).chars.clone() };
                        Err(err(
                            RuntimeErrorCode::MissingMember,
                            format!("Field '{name}' doesn't exist."),
                        ))
                    }
                }
            }
            _ => Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Expected an array or struct, got {}.",
                    object::type_name(callee)
                ),
            )),
        }
    }

    /// `SET`: array element or struct field write; the value stays on the
    /// stack since assignment is an expression.
    fn op_set(&mut self) -> Result<(), RuntimeError> {
        let field = self.pop();
        let callee = self.pop();
        let value = self.peek(0);
        match object::obj_kind(callee) {
            Some(ObjKind::Array) => {
                // SAFETY: kind checked.
                let array = unsafe { object::as_array(callee) };
                let index = self.check_array_bounds(field, array)?;
                // SAFETY: index checked; keep the traced-pointer count exact.
                unsafe {
                    let old = (&(*array).values)[index];
                    if value.is_obj() && !old.is_obj() {
                        (*array).heap_ptr_count += 1;
                    } else if !value.is_obj() && old.is_obj() {
                        (*array).heap_ptr_count -= 1;
                    }
                    (&mut (*array).values)[index] = value;
                }
                Ok(())
            }
            Some(ObjKind::Instance)
                // SAFETY: kind checked.
                if unsafe { (*object::as_instance(callee)).class.is_null() } =>
            {
                if !object::is_obj_kind(field, ObjKind::String) {
                    return Err(err(
                        RuntimeErrorCode::Type,
                        format!(
                            "Expected a string for field name, got {}.",
                            object::type_name(field)
                        ),
                    ));
                }
                // SAFETY: kinds checked; overriding or creating both fine.
                unsafe {
                    let name = (*object::as_string(field)).chars.clone();
                    (*object::as_instance(callee)).fields.insert(name, value);
                }
                Ok(())
            }
            _ => Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Expected an array or struct, got {}.",
                    object::type_name(callee)
                ),
            )),
        }
    }

    /// `GET_PROPERTY`: field, then bound class method, then bound native
    /// method; the receiver on top of the stack is replaced by the result.
    fn op_get_property(&mut self, name: &str) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        if object::is_obj_kind(receiver, ObjKind::Instance) {
            // SAFETY: kind checked.
            let instance = unsafe { object::as_instance(receiver) };
            if let Some(value) = unsafe { (*instance).fields.get(name).copied() } {
                self.set_peek(0, value);
                return Ok(());
            }
            let class = unsafe { (*instance).class };
            if !class.is_null() && self.bind_method(class, name)? {
                return Ok(());
            }
        }
        self.bind_native_method(name)
    }

    /// `SWITCH`/`SWITCH_LONG`: scan the case constants for a structural
    /// match, then take the matching jump slot, or the trailing default.
    fn op_switch(&mut self, long: bool) -> Result<(), RuntimeError> {
        let value = self.pop();
        let count = self.read_u16() as usize;
        let const_width = if long { 2 } else { 1 };
        let base = self.frame().ip;
        let jump_table = base + count * const_width;
        let const_base = self.const_base();

        let mut slot = count; // default
        for i in 0..count {
            let index = if long {
                let high = self.vm.code.bytecode[base + i * 2] as usize;
                let low = self.vm.code.bytecode[base + i * 2 + 1] as usize;
                (high << 8) | low
            } else {
                self.vm.code.bytecode[base + i] as usize
            };
            let constant = self.vm.code.constants[const_base + index];
            if object::equals(value, constant) {
                slot = i;
                break;
            }
        }
        let slot_pos = jump_table + slot * 2;
        let offset = ((self.vm.code.bytecode[slot_pos] as usize) << 8)
            | self.vm.code.bytecode[slot_pos + 1] as usize;
        self.frame_mut().ip = slot_pos + 2 + offset;
        Ok(())
    }

    /// `CLOSURE`/`CLOSURE_LONG`: build the closure and capture its upvalues
    /// from `(is_local, index)` pairs.
    fn op_closure(&mut self, long: bool) -> Result<(), RuntimeError> {
        let func_value = self.read_constant(long);
        if !object::is_obj_kind(func_value, ObjKind::Function) {
            return Err(err(
                RuntimeErrorCode::MalformedOpcode,
                "Closure operand is not a function constant.",
            ));
        }
        // SAFETY: kind checked.
        let func = unsafe { object::as_function(func_value) };
        let closure = self.vm.heap.alloc_closure(func);
        let count = unsafe { (*func).upvalue_count } as usize;
        for i in 0..count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let cell = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                // SAFETY: enclosing closure rooted by the stack.
                unsafe { (&(*self.frame().closure).upvalues)[index] }
            };
            // SAFETY: closure just allocated, sized to upvalue_count.
            unsafe { (&mut (*closure).upvalues)[i] = cell };
        }
        self.push(Value::obj(closure.cast()))
    }

    /// The fused `INCREMENT`. The packed argument selects sign, fixity, and
    /// how the target place is addressed; each kind reads the place, writes
    /// the updated value, and leaves the chosen (old or new) value on the
    /// stack.
    fn op_increment(&mut self) -> Result<(), RuntimeError> {
        let arg = self.read_byte();
        let delta: i32 = if arg & 0b01 == 1 { 1 } else { -1 };
        let prefix = arg & 0b10 == 0b10;
        let kind = arg >> 2;

        let updated = |value: Value| -> Result<Value, RuntimeError> {
            if !value.is_number() {
                return Err(err(
                    RuntimeErrorCode::Type,
                    format!(
                        "Operand must be a number, got {}.",
                        object::type_name(value)
                    ),
                ));
            }
            if value.is_int() {
                let wide = i64::from(value.as_int()) + i64::from(delta);
                if wide >= i64::from(i32::MIN) && wide <= i64::from(i32::MAX) {
                    Ok(Value::int(wide as i32))
                } else {
                    Ok(Value::double(wide as f64))
                }
            } else {
                Ok(Value::double(value.as_double() + f64::from(delta)))
            }
        };

        match kind {
            // Local slot, possibly promoted to a cell.
            0 => {
                let slot = self.read_byte() as usize;
                let index = self.frame().slots + slot;
                let current = self.stack[index];
                if object::is_obj_kind(current, ObjKind::Upvalue) {
                    // SAFETY: kind checked.
                    let cell = unsafe { object::as_upvalue(current) };
                    let old = unsafe { (*cell).value };
                    let new = updated(old)?;
                    unsafe { (*cell).value = new };
                    self.push(if prefix { new } else { old })
                } else {
                    let new = updated(current)?;
                    self.stack[index] = new;
                    self.push(if prefix { new } else { current })
                }
            }
            // Upvalue cell.
            1 => {
                let slot = self.read_byte() as usize;
                // SAFETY: frame closure rooted by the stack.
                let cell = unsafe { (&(*self.frame().closure).upvalues)[slot] };
                let old = unsafe { (*cell).value };
                let new = updated(old)?;
                unsafe { (*cell).value = new };
                self.push(if prefix { new } else { old })
            }
            // Global, narrow and wide index.
            2 | 3 => {
                let index = if kind == 2 {
                    self.read_byte() as usize
                } else {
                    self.read_u16() as usize
                };
                let old = self.vm.globals.get(index);
                let new = updated(old)?;
                self.vm.globals.set(index, new);
                self.push(if prefix { new } else { old })
            }
            // Dot access, narrow and wide name constant.
            4 | 5 => {
                let target = self.pop();
                let name = self.read_string(kind == 5)?;
                if !object::is_obj_kind(target, ObjKind::Instance) {
                    return Err(err(
                        RuntimeErrorCode::Type,
                        format!(
                            "Only instances/structs have properties, got {}.",
                            object::type_name(target)
                        ),
                    ));
                }
                // SAFETY: kind checked.
                let instance = unsafe { object::as_instance(target) };
                let Some(old) = (unsafe { (*instance).fields.get(&name).copied() }) else {
                    return Err(err(
                        RuntimeErrorCode::MissingMember,
                        format!("Field '{name}' doesn't exist."),
                    ));
                };
                let new = updated(old)?;
                unsafe { (*instance).fields.insert(name, new) };
                self.push(if prefix { new } else { old })
            }
            // Bracket access: the target and field were compiled to the stack.
            6 => {
                let field = self.pop();
                let callee = self.pop();
                if object::is_obj_kind(callee, ObjKind::Array) {
                    // SAFETY: kind checked.
                    let array = unsafe { object::as_array(callee) };
                    let index = self.check_array_bounds(field, array)?;
                    let old = unsafe { (&(*array).values)[index] };
                    let new = updated(old)?;
                    unsafe { (&mut (*array).values)[index] = new };
                    return self.push(if prefix { new } else { old });
                }
                if !object::is_obj_kind(callee, ObjKind::Instance) {
                    return Err(err(
                        RuntimeErrorCode::Type,
                        format!(
                            "Expected a array or struct, got {}.",
                            object::type_name(callee)
                        ),
                    ));
                }
                if !object::is_obj_kind(field, ObjKind::String) {
                    return Err(err(
                        RuntimeErrorCode::Type,
                        format!(
                            "Expected a string for field name, got {}.",
                            object::type_name(field)
                        ),
                    ));
                }
                // SAFETY: kinds checked.
                let (instance, name) = unsafe {
                    (
                        object::as_instance(callee),
                        (*object::as_string(field)).chars.clone(),
                    )
                };
                let Some(old) = (unsafe { (*instance).fields.get(&name).copied() }) else {
                    return Err(err(
                        RuntimeErrorCode::MissingMember,
                        format!("Field '{name}' doesn't exist."),
                    ));
                };
                let new = updated(old)?;
                unsafe { (*instance).fields.insert(name, new) };
                self.push(if prefix { new } else { old })
            }
            _ => Err(err(
                RuntimeErrorCode::MalformedOpcode,
                "Unrecognized argument in INCREMENT.",
            )),
        }
    }

    /// `LAUNCH_ASYNC`: stand up a child thread with the callee and
    /// arguments copied over, its future rooted in slot 0, and hand it to
    /// the OS.
    fn op_launch_async(&mut self) -> Result<(), RuntimeError> {
        let argc = self.read_byte() as usize;
        let callee_index = self.stack_top - argc - 1;

        let mut child = Box::new(Thread::new(self.vm.clone()));
        let child_ptr: *mut Thread = &mut *child;
        let fut = self.vm.heap.alloc_future(child_ptr.cast());
        // Slot 0 keeps the future, and through it the child, alive.
        child.push(Value::obj(fut.cast()))?;
        for i in 0..=argc {
            child.push(self.stack[callee_index + i])?;
        }
        self.popn(argc + 1);
        self.vm.register_child(child_ptr);

        let callee = child.peek(argc);
        if let Err(error) = child.call_value(callee, argc) {
            self.vm.reap(fut);
            return Err(error);
        }
        let spawn = std::thread::Builder::new()
            .name("vesper-async".to_string())
            .spawn(move || {
                let mut child = child;
                child.run_as_child();
            });
        if spawn.is_err() {
            self.vm.reap(fut);
            return Err(err(
                RuntimeErrorCode::StackOverflow,
                "Failed to spawn a thread for async call.",
            ));
        }
        self.push(Value::obj(fut.cast()))
    }

    /// `AWAIT`: block until the future on top of the stack settles, keeping
    /// the safepoint protocol alive the whole time, then reap the child and
    /// replace the future with its value.
    fn op_await(&mut self, is_main: bool) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        if !object::is_obj_kind(value, ObjKind::Future) {
            return Err(err(
                RuntimeErrorCode::Type,
                format!(
                    "Await can only be applied to a future, got {}.",
                    object::type_name(value)
                ),
            ));
        }
        // SAFETY: the future stays rooted on our stack until replaced below.
        let fut = unsafe { object::as_future(value) };
        let settled = loop {
            // The collector may need this thread: drive it (main) or park
            // (child) before going back to sleep.
            if self.vm.heap.should_collect.load(Ordering::SeqCst) {
                let vm = self.vm.clone();
                if is_main {
                    vm.run_gc_as_main(self);
                } else {
                    vm.pause_as_child();
                }
            }
            // SAFETY: rooted, see above.
            let mut state = unsafe { (*fut).state.lock() };
            if state.settled {
                break state.value;
            }
            unsafe { (*fut).done.wait_for(&mut state, AWAIT_POLL) };
            if state.settled {
                break state.value;
            }
        };
        self.vm.reap(fut);
        self.set_peek(0, settled);
        Ok(())
    }

    /// Child-thread entry: run to completion; on a runtime error print the
    /// trace, settle the future with nil so awaiters wake, and reap.
    pub fn run_as_child(&mut self) {
        let fut = self.future();
        if let Err(error) = self.execute() {
            let vm = self.vm.clone();
            vm.print_stack_trace(self, &error);
            if let Some(fut) = fut {
                // SAFETY: rooted in stack slot 0.
                unsafe {
                    if (*fut).settled_value().is_none() {
                        (*fut).settle(Value::nil());
                    }
                }
                vm.reap(fut);
            }
        }
    }
}
