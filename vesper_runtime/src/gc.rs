//! Mark-and-sweep garbage collector.
//!
//! The collector owns every heap allocation through its live-objects list
//! and decides when a collection is due (bytes-allocated threshold). It does
//! not stop the world itself: crossing the threshold raises the atomic
//! `should_collect` flag and pokes the registered wake hook; the VM's
//! safepoint protocol parks every interpreter thread and the main thread
//! then drives [`GcHeap::collect`].
//!
//! Marking is iterative over an explicit worklist so deep object graphs
//! cannot blow the host stack. Sweeping walks the object list in reverse,
//! destroys unmarked objects, and recomputes the heap counter from the
//! survivors. The string intern table is weak: it is pruned of unmarked
//! entries just before the sweep so interned strings die like everything
//! else.

use crate::natives::NativeFn;
use crate::object::*;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use vesper_core::Value;

/// Initial heap budget before the first collection (1 MiB).
const HEAP_START_LIMIT: usize = 1024 * 1024;

/// Mark worklist handed to root-marking callbacks.
pub struct Tracer {
    stack: Vec<*mut ObjHeader>,
}

impl Tracer {
    fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Mark a value if it references an object.
    #[inline]
    pub fn mark_value(&mut self, v: Value) {
        if v.is_obj() {
            self.mark_obj(v.as_obj_ptr() as *mut ObjHeader);
        }
    }

    /// Push an object onto the worklist. Duplicate pushes are tolerated;
    /// the mark bit short-circuits re-tracing.
    #[inline]
    pub fn mark_obj(&mut self, obj: *mut ObjHeader) {
        self.stack.push(obj);
    }

    /// Drain the worklist, setting mark bits and tracing outgoing edges.
    fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            // SAFETY: worklist entries come from the live-objects list or
            // from tracing live objects; the world is stopped.
            unsafe {
                if (*obj).marked {
                    continue;
                }
                (*obj).marked = true;
                trace_children(obj, self);
            }
        }
    }
}

/// Push the outgoing references of `obj` onto the worklist.
///
/// # Safety
/// `obj` must point at a live heap object and the world must be stopped.
unsafe fn trace_children(obj: *mut ObjHeader, tracer: &mut Tracer) {
    // SAFETY: callers guarantee a live object; casts are guarded by kind.
    unsafe {
        match (*obj).kind {
            ObjKind::String
            | ObjKind::Function
            | ObjKind::Native
            | ObjKind::File
            | ObjKind::Mutex => {}
            ObjKind::BoundNative => {
                tracer.mark_value((*(obj as *mut ObjBoundNative)).receiver);
            }
            ObjKind::Closure => {
                let closure = obj as *mut ObjClosure;
                tracer.mark_obj((*closure).function as *mut ObjHeader);
                for &upvalue in &(*closure).upvalues {
                    tracer.mark_obj(upvalue as *mut ObjHeader);
                }
            }
            ObjKind::Upvalue => {
                tracer.mark_value((*(obj as *mut ObjUpvalue)).value);
            }
            ObjKind::Array => {
                let arr = obj as *mut ObjArray;
                if (*arr).heap_ptr_count > 0 {
                    for &v in &(*arr).values {
                        tracer.mark_value(v);
                    }
                }
            }
            ObjKind::Class => {
                let class = obj as *mut ObjClass;
                for &method in (*class).methods.values() {
                    tracer.mark_value(method);
                }
                if !(*class).superclass.is_null() {
                    tracer.mark_obj((*class).superclass as *mut ObjHeader);
                }
            }
            ObjKind::Instance => {
                let inst = obj as *mut ObjInstance;
                if !(*inst).class.is_null() {
                    tracer.mark_obj((*inst).class as *mut ObjHeader);
                }
                for &field in (*inst).fields.values() {
                    tracer.mark_value(field);
                }
            }
            ObjKind::BoundMethod => {
                let bound = obj as *mut ObjBoundMethod;
                tracer.mark_value((*bound).receiver);
                tracer.mark_obj((*bound).method as *mut ObjHeader);
            }
            ObjKind::Future => {
                let fut = obj as *mut ObjFuture;
                let st = (*fut).state.lock();
                tracer.mark_value(st.value);
            }
        }
    }
}

/// Current size of an object in bytes, including owned heap storage.
/// Recomputed at sweep time because arrays, maps, and strings grow.
///
/// # Safety
/// `obj` must point at a live heap object.
unsafe fn obj_size(obj: *const ObjHeader) -> usize {
    const ENTRY: usize = std::mem::size_of::<String>() + std::mem::size_of::<Value>();
    // SAFETY: callers guarantee a live object; casts are guarded by kind.
    unsafe {
        match (*obj).kind {
            ObjKind::String => {
                std::mem::size_of::<ObjString>() + (*(obj as *const ObjString)).chars.capacity()
            }
            ObjKind::Function => {
                std::mem::size_of::<ObjFunction>() + (*(obj as *const ObjFunction)).name.capacity()
            }
            ObjKind::Native => {
                std::mem::size_of::<ObjNative>() + (*(obj as *const ObjNative)).name.capacity()
            }
            ObjKind::BoundNative => {
                std::mem::size_of::<ObjBoundNative>()
                    + (*(obj as *const ObjBoundNative)).name.capacity()
            }
            ObjKind::Closure => {
                std::mem::size_of::<ObjClosure>()
                    + (*(obj as *const ObjClosure)).upvalues.capacity()
                        * std::mem::size_of::<*mut ObjUpvalue>()
            }
            ObjKind::Upvalue => std::mem::size_of::<ObjUpvalue>(),
            ObjKind::Array => {
                std::mem::size_of::<ObjArray>()
                    + (*(obj as *const ObjArray)).values.capacity() * std::mem::size_of::<Value>()
            }
            ObjKind::Class => {
                let class = obj as *const ObjClass;
                std::mem::size_of::<ObjClass>()
                    + (*class).name.capacity()
                    + (*class).methods.len() * ENTRY
            }
            ObjKind::Instance => {
                std::mem::size_of::<ObjInstance>()
                    + (*(obj as *const ObjInstance)).fields.len() * ENTRY
            }
            ObjKind::BoundMethod => std::mem::size_of::<ObjBoundMethod>(),
            ObjKind::File => {
                std::mem::size_of::<ObjFile>() + (*(obj as *const ObjFile)).path.capacity()
            }
            ObjKind::Mutex => std::mem::size_of::<ObjMutex>(),
            ObjKind::Future => std::mem::size_of::<ObjFuture>(),
        }
    }
}

/// Run the destructor for a swept object.
///
/// # Safety
/// `obj` must have been allocated by this collector and must not be
/// referenced again.
unsafe fn free_obj(obj: *mut ObjHeader) {
    // SAFETY: the pointer was produced by `Box::into_raw` of the concrete
    // type named by its kind tag.
    unsafe {
        match (*obj).kind {
            ObjKind::String => drop(Box::from_raw(obj as *mut ObjString)),
            ObjKind::Function => drop(Box::from_raw(obj as *mut ObjFunction)),
            ObjKind::Native => drop(Box::from_raw(obj as *mut ObjNative)),
            ObjKind::BoundNative => drop(Box::from_raw(obj as *mut ObjBoundNative)),
            ObjKind::Closure => drop(Box::from_raw(obj as *mut ObjClosure)),
            ObjKind::Upvalue => drop(Box::from_raw(obj as *mut ObjUpvalue)),
            ObjKind::Array => drop(Box::from_raw(obj as *mut ObjArray)),
            ObjKind::Class => drop(Box::from_raw(obj as *mut ObjClass)),
            ObjKind::Instance => drop(Box::from_raw(obj as *mut ObjInstance)),
            ObjKind::BoundMethod => drop(Box::from_raw(obj as *mut ObjBoundMethod)),
            ObjKind::File => drop(Box::from_raw(obj as *mut ObjFile)),
            ObjKind::Mutex => drop(Box::from_raw(obj as *mut ObjMutex)),
            ObjKind::Future => drop(Box::from_raw(obj as *mut ObjFuture)),
        }
    }
}

struct HeapState {
    /// Every live allocation, in allocation order. The sole authoritative
    /// set of heap objects.
    objects: Vec<*mut ObjHeader>,
    /// Weak intern table: contents to string object.
    interned: FxHashMap<String, *mut ObjString>,
    /// Bytes currently allocated.
    heap_size: usize,
    /// Collection threshold; doubled while still over budget after a sweep.
    heap_limit: usize,
}

// SAFETY: the raw pointers in HeapState are only dereferenced under the
// heap mutex or while the world is stopped; the pause protocol serializes
// collector access with interpreter threads.
unsafe impl Send for HeapState {}

/// The process-wide heap. Shared by the compiler, the VM, and every
/// interpreter thread; allocation is serialized by an internal mutex.
pub struct GcHeap {
    state: Mutex<HeapState>,
    /// Raised when the heap crosses its budget; every dispatch loop checks
    /// it at its safepoint.
    pub should_collect: AtomicBool,
    /// Called (without the heap lock relevance) when a pause is requested,
    /// so threads blocked in `await` wake up and reach their safepoint.
    wake_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

// SAFETY: see HeapState; the public surface locks before touching state.
unsafe impl Sync for GcHeap {}

impl GcHeap {
    /// Fresh heap with the default budget.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                objects: Vec::new(),
                interned: FxHashMap::default(),
                heap_size: 0,
                heap_limit: HEAP_START_LIMIT,
            }),
            should_collect: AtomicBool::new(false),
            wake_hook: Mutex::new(None),
        }
    }

    /// Register the VM's pause-request hook.
    pub fn set_wake_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.wake_hook.lock() = Some(hook);
    }

    /// Bytes currently attributed to live objects.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.state.lock().heap_size
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Append to the object list and account the bytes, requesting a pause
    /// when the heap crosses its budget.
    fn register(st: &mut HeapState, obj: *mut ObjHeader) -> bool {
        // SAFETY: freshly boxed object.
        st.heap_size += unsafe { obj_size(obj) };
        st.objects.push(obj);
        st.heap_size > st.heap_limit
    }

    fn request_pause(&self) {
        if !self.should_collect.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.wake_hook.lock().as_ref() {
                hook();
            }
        }
    }

    fn alloc<T>(&self, obj: T) -> *mut T {
        let ptr = Box::into_raw(Box::new(obj));
        let over = Self::register(&mut self.state.lock(), ptr as *mut ObjHeader);
        if over {
            self.request_pause();
        }
        ptr
    }

    /// Intern a string, returning the unique live object for its contents.
    /// Check and insert happen under one lock so equal contents can never
    /// yield two live objects.
    pub fn intern(&self, chars: &str) -> *mut ObjString {
        let mut st = self.state.lock();
        if let Some(&existing) = st.interned.get(chars) {
            return existing;
        }
        let ptr = Box::into_raw(Box::new(ObjString {
            header: ObjHeader::new(ObjKind::String),
            chars: chars.to_string(),
        }));
        let over = Self::register(&mut st, ptr as *mut ObjHeader);
        st.interned.insert(chars.to_string(), ptr);
        drop(st);
        if over {
            self.request_pause();
        }
        ptr
    }

    /// Allocate a function object.
    pub fn alloc_function(&self, name: String, arity: u8) -> *mut ObjFunction {
        self.alloc(ObjFunction {
            header: ObjHeader::new(ObjKind::Function),
            bytecode_offset: 0,
            constants_offset: 0,
            arity,
            upvalue_count: 0,
            name,
        })
    }

    /// Allocate a native function stub.
    pub fn alloc_native(&self, name: &str, arity: i8, func: NativeFn) -> *mut ObjNative {
        self.alloc(ObjNative {
            header: ObjHeader::new(ObjKind::Native),
            func,
            arity,
            name: name.to_string(),
        })
    }

    /// Allocate a native method bound to `receiver`.
    pub fn alloc_bound_native(
        &self,
        name: &str,
        arity: i8,
        func: NativeFn,
        receiver: Value,
    ) -> *mut ObjBoundNative {
        self.alloc(ObjBoundNative {
            header: ObjHeader::new(ObjKind::BoundNative),
            func,
            arity,
            name: name.to_string(),
            receiver,
        })
    }

    /// Allocate a closure over `function` with null upvalue slots to be
    /// filled by the `CLOSURE` instruction.
    pub fn alloc_closure(&self, function: *mut ObjFunction) -> *mut ObjClosure {
        // SAFETY: function objects are live for the life of the program.
        let count = unsafe { (*function).upvalue_count } as usize;
        self.alloc(ObjClosure {
            header: ObjHeader::new(ObjKind::Closure),
            function,
            upvalues: vec![std::ptr::null_mut(); count],
        })
    }

    /// Allocate an upvalue cell holding `value`.
    pub fn alloc_upvalue(&self, value: Value) -> *mut ObjUpvalue {
        self.alloc(ObjUpvalue {
            header: ObjHeader::new(ObjKind::Upvalue),
            value,
        })
    }

    /// Allocate an array from its elements.
    pub fn alloc_array(&self, values: Vec<Value>) -> *mut ObjArray {
        let heap_ptr_count = values.iter().filter(|v| v.is_obj()).count();
        self.alloc(ObjArray {
            header: ObjHeader::new(ObjKind::Array),
            values,
            heap_ptr_count,
        })
    }

    /// Allocate a class.
    pub fn alloc_class(&self, name: String) -> *mut ObjClass {
        self.alloc(ObjClass {
            header: ObjHeader::new(ObjKind::Class),
            name,
            methods: FxHashMap::default(),
            superclass: std::ptr::null_mut(),
        })
    }

    /// Allocate an instance. A null class makes a struct literal.
    pub fn alloc_instance(&self, class: *mut ObjClass) -> *mut ObjInstance {
        self.alloc(ObjInstance {
            header: ObjHeader::new(ObjKind::Instance),
            class,
            fields: FxHashMap::default(),
        })
    }

    /// Allocate a bound method.
    pub fn alloc_bound_method(&self, receiver: Value, method: *mut ObjClosure) -> *mut ObjBoundMethod {
        self.alloc(ObjBoundMethod {
            header: ObjHeader::new(ObjKind::BoundMethod),
            receiver,
            method,
        })
    }

    /// Allocate a file object.
    pub fn alloc_file(&self, path: String) -> *mut ObjFile {
        self.alloc(ObjFile {
            header: ObjHeader::new(ObjKind::File),
            path,
        })
    }

    /// Allocate a mutex object.
    pub fn alloc_mutex(&self) -> *mut ObjMutex {
        self.alloc(ObjMutex {
            header: ObjHeader::new(ObjKind::Mutex),
            raw: <parking_lot::RawMutex as parking_lot::lock_api::RawMutex>::INIT,
        })
    }

    /// Allocate an unsettled future tied to a child thread.
    pub fn alloc_future(&self, thread: *mut ()) -> *mut ObjFuture {
        self.alloc(ObjFuture {
            header: ObjHeader::new(ObjKind::Future),
            thread: AtomicPtr::new(thread),
            state: Mutex::new(FutureState {
                settled: false,
                value: Value::nil(),
            }),
            done: parking_lot::Condvar::new(),
        })
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Mark from `mark_roots`, then sweep.
    ///
    /// The caller must guarantee the world is stopped: this is the main
    /// thread at a safepoint with every child parked, or the single-threaded
    /// compiler. Clearing `should_collect` and waking the children is the
    /// caller's job, because the flag must be cleared under the VM's pause
    /// mutex to avoid missed wakeups.
    pub fn collect(&self, mark_roots: impl FnOnce(&mut Tracer)) {
        let mut st = self.state.lock();
        let st = &mut *st;

        let mut tracer = Tracer::new();
        mark_roots(&mut tracer);
        tracer.drain();

        // Prune dead interned strings first so the object sweep can free them.
        st.interned
            .retain(|_, &mut ptr| unsafe { (*(ptr as *mut ObjHeader)).marked });

        let before = st.heap_size;
        let mut live = 0usize;
        st.objects.retain(|&obj| {
            // SAFETY: entries in the object list are live until this sweep
            // decides otherwise; the world is stopped.
            unsafe {
                if (*obj).marked {
                    (*obj).marked = false;
                    live += obj_size(obj);
                    true
                } else {
                    free_obj(obj);
                    false
                }
            }
        });
        st.heap_size = live;
        if st.heap_size > st.heap_limit {
            st.heap_limit *= 2;
        }

        tracing::debug!(
            freed = before.saturating_sub(live),
            live,
            limit = st.heap_limit,
            "collection cycle"
        );
    }

    /// Compile-time collection: the compiler is single-threaded, so no pause
    /// coordination is needed and the flag is cleared here.
    pub fn collect_for_compiler(&self, mark_roots: impl FnOnce(&mut Tracer)) {
        self.collect(mark_roots);
        self.should_collect.store(false, Ordering::SeqCst);
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for &obj in &st.objects {
            // SAFETY: the heap owns every object; nothing can reference them
            // once the heap itself is gone.
            unsafe { free_obj(obj) };
        }
        st.objects.clear();
    }
}
