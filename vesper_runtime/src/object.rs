//! Heap object variants.
//!
//! Every heap object starts with an [`ObjHeader`] holding its kind tag and
//! the GC mark bit, so a type-erased `*mut ObjHeader` can be classified and
//! cast to its concrete variant. Layouts are `#[repr(C)]` to make the
//! header-first cast well defined.
//!
//! Objects are allocated and owned exclusively by [`crate::gc::GcHeap`];
//! nothing else frees them. Pointers stored inside objects (superclass
//! links, closure upvalues, bound methods) are kept alive by tracing, not by
//! ownership.

use crate::natives::NativeFn;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicPtr, Ordering};
use vesper_core::{Value, ValueKind};

/// Kind tag stored in every object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjKind {
    /// Interned immutable string.
    String,
    /// Compiled function: offsets into the shared code block.
    Function,
    /// Native function stub.
    Native,
    /// Native function bound to a receiver.
    BoundNative,
    /// Function plus captured upvalue cells.
    Closure,
    /// Heap cell holding one value shared by closures.
    Upvalue,
    /// Dense value sequence.
    Array,
    /// Class with a method table and optional superclass.
    Class,
    /// Class instance, or a struct literal when the class pointer is null.
    Instance,
    /// Closure bound to a receiver.
    BoundMethod,
    /// File handle.
    File,
    /// Mutual exclusion lock.
    Mutex,
    /// One-shot synchronization object for an async call.
    Future,
}

/// Common header at offset zero of every heap object.
#[derive(Debug)]
#[repr(C)]
pub struct ObjHeader {
    /// Variant tag.
    pub kind: ObjKind,
    /// Mark bit; owned by the collector.
    pub marked: bool,
}

impl ObjHeader {
    /// Fresh unmarked header.
    #[must_use]
    pub const fn new(kind: ObjKind) -> Self {
        Self {
            kind,
            marked: false,
        }
    }
}

// =============================================================================
// Variants
// =============================================================================

/// An interned string. Two live strings with equal contents are the same
/// object, so the VM may compare them by pointer.
#[repr(C)]
pub struct ObjString {
    /// Object header.
    pub header: ObjHeader,
    /// UTF-8 contents.
    pub chars: String,
}

/// A compiled function. The bytecode and constants live in the process-wide
/// code block; the function records its base offsets into both.
#[repr(C)]
pub struct ObjFunction {
    /// Object header.
    pub header: ObjHeader,
    /// First instruction, as an index into the shared bytecode array.
    pub bytecode_offset: usize,
    /// Base of this function's constants in the shared constant pool.
    pub constants_offset: usize,
    /// Declared parameter count.
    pub arity: u8,
    /// Number of upvalues a closure over this function captures.
    pub upvalue_count: u8,
    /// Name for stack traces; empty for the script body.
    pub name: String,
}

/// A native function stub. Arity -1 means variadic.
#[repr(C)]
pub struct ObjNative {
    /// Object header.
    pub header: ObjHeader,
    /// The callable stub.
    pub func: NativeFn,
    /// Expected argument count, or -1 for variadic.
    pub arity: i8,
    /// Name for diagnostics.
    pub name: String,
}

/// A native method bound to its receiver.
#[repr(C)]
pub struct ObjBoundNative {
    /// Object header.
    pub header: ObjHeader,
    /// The callable stub.
    pub func: NativeFn,
    /// Expected argument count, or -1 for variadic.
    pub arity: i8,
    /// Name for diagnostics.
    pub name: String,
    /// Receiver planted in the callee slot when invoked.
    pub receiver: Value,
}

/// A closure: a function plus the upvalue cells it captured.
#[repr(C)]
pub struct ObjClosure {
    /// Object header.
    pub header: ObjHeader,
    /// The compiled function.
    pub function: *mut ObjFunction,
    /// Captured cells; length equals `function.upvalue_count`.
    pub upvalues: Vec<*mut ObjUpvalue>,
}

/// A heap cell holding one value. A captured local is promoted to one of
/// these in place, and every closure that captured it shares the cell.
#[repr(C)]
pub struct ObjUpvalue {
    /// Object header.
    pub header: ObjHeader,
    /// The cell contents.
    pub value: Value,
}

/// A dense, ordered array of values.
#[repr(C)]
pub struct ObjArray {
    /// Object header.
    pub header: ObjHeader,
    /// Elements.
    pub values: Vec<Value>,
    /// Number of elements that are heap pointers; tracing skips the array
    /// entirely while this is zero.
    pub heap_ptr_count: usize,
}

/// A class: name, method table, optional superclass.
#[repr(C)]
pub struct ObjClass {
    /// Object header.
    pub header: ObjHeader,
    /// Class name.
    pub name: String,
    /// Method name to closure value.
    pub methods: FxHashMap<String, Value>,
    /// Superclass, or null.
    pub superclass: *mut ObjClass,
}

/// An instance. A null class pointer marks a struct literal, whose field map
/// holds exactly the fields named in the source.
#[repr(C)]
pub struct ObjInstance {
    /// Object header.
    pub header: ObjHeader,
    /// The class, or null for a struct literal.
    pub class: *mut ObjClass,
    /// Field name to value.
    pub fields: FxHashMap<String, Value>,
}

/// A class method bound to its receiver.
#[repr(C)]
pub struct ObjBoundMethod {
    /// Object header.
    pub header: ObjHeader,
    /// Receiver planted in slot zero when called.
    pub receiver: Value,
    /// The underlying closure.
    pub method: *mut ObjClosure,
}

/// A file object. Internals beyond the path are outside the engine core.
#[repr(C)]
pub struct ObjFile {
    /// Object header.
    pub header: ObjHeader,
    /// Filesystem path.
    pub path: String,
}

/// A mutex object, the language's only sharing primitive.
#[repr(C)]
pub struct ObjMutex {
    /// Object header.
    pub header: ObjHeader,
    /// The lock. Raw so `lock`/`unlock` can be split across native calls.
    pub raw: parking_lot::RawMutex,
}

/// Settled state of a future.
pub struct FutureState {
    /// True once the child thread stored its result.
    pub settled: bool,
    /// The settled value; must not be mutated after settling.
    pub value: Value,
}

/// A future: the handle to a thread spawned by an async call and the slot
/// its result settles into.
#[repr(C)]
pub struct ObjFuture {
    /// Object header.
    pub header: ObjHeader,
    /// Type-erased pointer to the child interpreter; null once reaped.
    /// The VM owns the concrete type.
    pub thread: AtomicPtr<()>,
    /// Settled flag and value, guarded for cross-thread handoff.
    pub state: Mutex<FutureState>,
    /// Signalled when the future settles.
    pub done: Condvar,
}

impl ObjFuture {
    /// Store the result and wake every waiter. Settling twice is a bug.
    pub fn settle(&self, value: Value) {
        let mut st = self.state.lock();
        debug_assert!(!st.settled, "future settled twice");
        st.value = value;
        st.settled = true;
        self.done.notify_all();
    }

    /// Read the settled value, if any.
    #[must_use]
    pub fn settled_value(&self) -> Option<Value> {
        let st = self.state.lock();
        st.settled.then_some(st.value)
    }

    /// The child thread pointer, null once reaped.
    #[must_use]
    pub fn thread_ptr(&self) -> *mut () {
        self.thread.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Value-side helpers
// =============================================================================

/// Kind of the object a value points at, if it is an object.
#[inline]
#[must_use]
pub fn obj_kind(v: Value) -> Option<ObjKind> {
    if v.is_obj() {
        // SAFETY: an obj-kinded value always holds a pointer produced by the
        // collector, valid until swept.
        Some(unsafe { (*(v.as_obj_ptr() as *const ObjHeader)).kind })
    } else {
        None
    }
}

/// Is `v` an object of kind `k`?
#[inline]
#[must_use]
pub fn is_obj_kind(v: Value, k: ObjKind) -> bool {
    obj_kind(v) == Some(k)
}

macro_rules! typed_cast {
    ($fn_name:ident, $ty:ty, $kind:ident) => {
        /// Cast to the concrete variant.
        ///
        /// # Safety
        /// The value must be an object of the matching kind.
        #[inline]
        #[must_use]
        pub unsafe fn $fn_name(v: Value) -> *mut $ty {
            debug_assert!(is_obj_kind(v, ObjKind::$kind));
            v.as_obj_ptr() as *mut $ty
        }
    };
}

typed_cast!(as_string, ObjString, String);
typed_cast!(as_function, ObjFunction, Function);
typed_cast!(as_native, ObjNative, Native);
typed_cast!(as_bound_native, ObjBoundNative, BoundNative);
typed_cast!(as_closure, ObjClosure, Closure);
typed_cast!(as_upvalue, ObjUpvalue, Upvalue);
typed_cast!(as_array, ObjArray, Array);
typed_cast!(as_class, ObjClass, Class);
typed_cast!(as_instance, ObjInstance, Instance);
typed_cast!(as_bound_method, ObjBoundMethod, BoundMethod);
typed_cast!(as_file, ObjFile, File);
typed_cast!(as_mutex, ObjMutex, Mutex);
typed_cast!(as_future, ObjFuture, Future);

/// Structural equality: kind mismatch is false, doubles compare within an
/// epsilon, strings compare by contents, everything else by bits.
#[must_use]
pub fn equals(a: Value, b: Value) -> bool {
    let kind = a.kind();
    if kind != b.kind() {
        return false;
    }
    if kind == ValueKind::Double {
        return (a.as_double() - b.as_double()).abs() <= f64::EPSILON;
    }
    if is_obj_kind(a, ObjKind::String) && is_obj_kind(b, ObjKind::String) {
        // Interning makes this a pointer compare in practice; contents are
        // the authoritative answer.
        // SAFETY: both checked to be strings.
        return unsafe { (*as_string(a)).chars == (*as_string(b)).chars };
    }
    a.to_bits() == b.to_bits()
}

/// Type name for diagnostics, looking through the object kind.
#[must_use]
pub fn type_name(v: Value) -> &'static str {
    match obj_kind(v) {
        None => v.kind().as_str(),
        Some(ObjKind::String) => "string",
        Some(ObjKind::Function) => "function",
        Some(ObjKind::Native) | Some(ObjKind::BoundNative) => "native function",
        Some(ObjKind::Closure) => "function",
        Some(ObjKind::Upvalue) => "upvalue",
        Some(ObjKind::Array) => "array",
        Some(ObjKind::Class) => "class",
        Some(ObjKind::Instance) => "instance",
        Some(ObjKind::BoundMethod) => "method",
        Some(ObjKind::File) => "file",
        Some(ObjKind::Mutex) => "mutex",
        Some(ObjKind::Future) => "future",
    }
}

/// Render a value for `print` and stack traces.
#[must_use]
pub fn display_value(v: Value) -> String {
    match v.kind() {
        ValueKind::Nil => "nil".to_string(),
        ValueKind::Bool => v.as_bool().to_string(),
        ValueKind::Int => v.as_int().to_string(),
        ValueKind::Double => v.as_double().to_string(),
        ValueKind::Obj => display_obj(v),
    }
}

fn display_obj(v: Value) -> String {
    // SAFETY: all casts are guarded by the kind match.
    unsafe {
        match obj_kind(v).expect("object value") {
            ObjKind::String => (*as_string(v)).chars.clone(),
            ObjKind::Function => format!("<fn {}>", (*as_function(v)).name),
            ObjKind::Native => format!("<native fn {}>", (*as_native(v)).name),
            ObjKind::BoundNative => format!("<native fn {}>", (*as_bound_native(v)).name),
            ObjKind::Closure => {
                let func = (*as_closure(v)).function;
                let name = &(*func).name;
                if name.is_empty() {
                    "<fn>".to_string()
                } else {
                    format!("<fn {name}>")
                }
            }
            ObjKind::Upvalue => display_value((*as_upvalue(v)).value),
            ObjKind::Array => {
                let arr = &*as_array(v);
                let items: Vec<String> = arr.values.iter().map(|&e| display_value(e)).collect();
                format!("[{}]", items.join(", "))
            }
            ObjKind::Class => format!("<class {}>", (*as_class(v)).name),
            ObjKind::Instance => {
                let inst = &*as_instance(v);
                if inst.class.is_null() {
                    "<struct>".to_string()
                } else {
                    format!("<{} instance>", (*inst.class).name)
                }
            }
            ObjKind::BoundMethod => {
                let method = (*as_bound_method(v)).method;
                format!("<fn {}>", (*(*method).function).name)
            }
            ObjKind::File => format!("<file {}>", (*as_file(v)).path),
            ObjKind::Mutex => "<mutex>".to_string(),
            ObjKind::Future => "<future>".to_string(),
        }
    }
}
