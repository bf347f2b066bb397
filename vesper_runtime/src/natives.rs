//! Native-function registry types.
//!
//! The VM is handed two tables at startup: a flat index table of native
//! function stubs (referenced by the `GET_NATIVE` instruction) and a
//! per-builtin-kind method dictionary consulted by property access on
//! primitive receivers. The concrete stub set lives in `vesper_vm`; this
//! module only defines the shapes.

use crate::gc::GcHeap;
use crate::object::{self, ObjFuture, ObjKind, ObjNative};
use rustc_hash::FxHashMap;
use vesper_core::{RuntimeError, Value};

/// The surface a native stub sees of the calling interpreter thread: its
/// operand stack and the shared heap. Implemented by the VM's thread type.
pub trait NativeCtx {
    /// Push onto the operand stack.
    fn push(&mut self, v: Value) -> Result<(), RuntimeError>;
    /// Pop from the operand stack.
    fn pop(&mut self) -> Value;
    /// Peek `depth` slots below the top.
    fn peek(&self, depth: usize) -> Value;
    /// The shared heap, for allocating results.
    fn heap(&self) -> &GcHeap;
    /// Raise the cancel flag of the child thread behind `fut`, if it is
    /// still running.
    fn request_cancel(&self, fut: *mut ObjFuture);
}

/// A native callable stub. Arguments sit on top of the stack; returning
/// `Ok(true)` asks the VM to collapse the callee slot with the result the
/// stub pushed.
pub type NativeFn = fn(&mut dyn NativeCtx, usize) -> Result<bool, RuntimeError>;

/// One entry of a per-builtin method dictionary.
#[derive(Clone, Copy)]
pub struct BuiltinMethod {
    /// The stub.
    pub func: NativeFn,
    /// Expected argument count, or -1 for variadic.
    pub arity: i8,
}

/// Builtin receiver kinds with native method dictionaries. `Common` is the
/// fallback for every receiver without a dedicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Builtin {
    /// Any receiver without its own table.
    Common = 0,
    /// String receivers.
    Str,
    /// Array receivers.
    Array,
    /// File receivers.
    File,
    /// Mutex receivers.
    Mutex,
    /// Future receivers.
    Future,
}

impl Builtin {
    /// Number of builtin kinds.
    pub const COUNT: usize = 6;

    /// Classify a receiver value.
    #[must_use]
    pub fn of(receiver: Value) -> Self {
        match object::obj_kind(receiver) {
            Some(ObjKind::String) => Self::Str,
            Some(ObjKind::Array) => Self::Array,
            Some(ObjKind::File) => Self::File,
            Some(ObjKind::Mutex) => Self::Mutex,
            Some(ObjKind::Future) => Self::Future,
            _ => Self::Common,
        }
    }
}

/// The two native tables, fixed after startup.
pub struct NativeRegistry {
    /// Flat stub table addressed by `GET_NATIVE`.
    pub functions: Vec<*mut ObjNative>,
    /// Name to slot in `functions`.
    pub names: FxHashMap<String, u16>,
    /// Method dictionaries indexed by [`Builtin`].
    pub methods: [FxHashMap<String, BuiltinMethod>; Builtin::COUNT],
}

// SAFETY: the registry is immutable after construction and the native
// function objects it points at are rooted for the life of the program.
unsafe impl Send for NativeRegistry {}
unsafe impl Sync for NativeRegistry {}

impl NativeRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            names: FxHashMap::default(),
            methods: std::array::from_fn(|_| FxHashMap::default()),
        }
    }

    /// Register a flat native function, returning its slot.
    pub fn add_function(&mut self, heap: &GcHeap, name: &str, arity: i8, func: NativeFn) -> u16 {
        let slot = self.functions.len() as u16;
        self.functions.push(heap.alloc_native(name, arity, func));
        self.names.insert(name.to_string(), slot);
        slot
    }

    /// Register a builtin method.
    pub fn add_method(&mut self, builtin: Builtin, name: &str, arity: i8, func: NativeFn) {
        self.methods[builtin as usize].insert(name.to_string(), BuiltinMethod { func, arity });
    }

    /// Slot of a native function by name.
    #[must_use]
    pub fn lookup_function(&self, name: &str) -> Option<u16> {
        self.names.get(name).copied()
    }

    /// Find the builtin method `name` for `receiver`, falling back to the
    /// `Common` table.
    #[must_use]
    pub fn find_method(&self, receiver: Value, name: &str) -> Option<BuiltinMethod> {
        let table = &self.methods[Builtin::of(receiver) as usize];
        table
            .get(name)
            .or_else(|| self.methods[Builtin::Common as usize].get(name))
            .copied()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_ctx: &mut dyn NativeCtx, _argc: usize) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    #[test]
    fn builtin_classification() {
        let heap = GcHeap::new();
        let s = heap.intern("x");
        assert_eq!(Builtin::of(Value::obj(s as *mut ())), Builtin::Str);
        assert_eq!(Builtin::of(Value::int(3)), Builtin::Common);
        let arr = heap.alloc_array(vec![]);
        assert_eq!(Builtin::of(Value::obj(arr as *mut ())), Builtin::Array);
    }

    #[test]
    fn method_lookup_falls_back_to_common() {
        let heap = GcHeap::new();
        let mut reg = NativeRegistry::new();
        reg.add_method(Builtin::Common, "to_text", 0, nop);
        reg.add_method(Builtin::Str, "length", 0, nop);

        let s = Value::obj(heap.intern("x") as *mut ());
        assert!(reg.find_method(s, "length").is_some());
        assert!(reg.find_method(s, "to_text").is_some());
        assert!(reg.find_method(Value::int(1), "length").is_none());
    }

    #[test]
    fn function_slots_are_stable() {
        let heap = GcHeap::new();
        let mut reg = NativeRegistry::new();
        let a = reg.add_function(&heap, "print", -1, nop);
        let b = reg.add_function(&heap, "clock", 0, nop);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(reg.lookup_function("clock"), Some(1));
        assert_eq!(reg.lookup_function("missing"), None);
    }
}
