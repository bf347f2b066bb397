//! The virtual machine.
//!
//! One [`Vm`] exists per program run. It owns the shared code block, the
//! globals array, the native tables, the child-thread pool, and the
//! synchronization state for the stop-the-world protocol:
//!
//! - `pause_lock` + `main_cv`: the main thread waits here until every child
//!   has parked at its safepoint.
//! - `children_cv`: parked children wait here until the collection finishes.
//! - `threads_paused`: how many children are currently parked.
//!
//! Thread-pool mutation (launch, reap) is serialized by the pool mutex,
//! which is separate from the pause lock.

use crate::thread::Thread;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vesper_compiler::{CodeBlock, CompilerOutput, GlobalVar};
use vesper_core::{RuntimeError, Value};
use vesper_runtime::object::{ObjClosure, ObjFuture};
use vesper_runtime::{GcHeap, NativeRegistry, Tracer};

/// The globals array. Addressed by integer index assigned at declaration
/// time; slots never move.
///
/// Access is deliberately unsynchronized, like every other object field:
/// the language offers no sharing primitive beyond `Mutex` objects, so
/// concurrent writes to one slot are a program bug, not an engine concern.
/// The collector reads the table only while the world is stopped.
pub struct GlobalTable {
    slots: UnsafeCell<Vec<GlobalVar>>,
}

// SAFETY: see the type docs; the data-race discipline is the language's.
unsafe impl Send for GlobalTable {}
unsafe impl Sync for GlobalTable {}

impl GlobalTable {
    fn new(slots: Vec<GlobalVar>) -> Self {
        Self {
            slots: UnsafeCell::new(slots),
        }
    }

    /// Read slot `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Value {
        // SAFETY: slots never move and the index was assigned by the compiler.
        unsafe { (&(*self.slots.get()))[index].value }
    }

    /// Write slot `index`.
    #[inline]
    pub fn set(&self, index: usize, value: Value) {
        // SAFETY: see get.
        unsafe { (&mut (*self.slots.get()))[index].value = value }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: see get.
        unsafe { (*self.slots.get()).len() }
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark(&self, tracer: &mut Tracer) {
        // SAFETY: called with the world stopped.
        for global in unsafe { (*self.slots.get()).iter() } {
            tracer.mark_value(global.value);
        }
    }
}

/// The virtual machine.
pub struct Vm {
    /// The shared code block produced by the compiler.
    pub code: CodeBlock,
    /// The globals array.
    pub globals: GlobalTable,
    /// Native function tables.
    pub natives: NativeRegistry,
    /// The shared heap.
    pub heap: Arc<GcHeap>,
    /// Live child interpreter threads. Pool mutex.
    pub child_threads: Mutex<Vec<*mut Thread>>,
    /// Guards the pause handshake state.
    pub pause_lock: Mutex<()>,
    /// Signalled to the main thread when a child parks or exits.
    pub main_cv: Condvar,
    /// Signalled to parked children when collection finishes.
    pub children_cv: Condvar,
    /// Children currently parked at the safepoint.
    pub threads_paused: AtomicUsize,
    main_closure: *mut ObjClosure,
}

// SAFETY: the raw pointers in Vm reference GC-owned objects and child
// threads whose lifecycle is serialized by the pool mutex and the
// stop-the-world protocol.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    /// Build a VM around the compiler's output.
    #[must_use]
    pub fn new(heap: Arc<GcHeap>, natives: NativeRegistry, output: CompilerOutput) -> Arc<Self> {
        let vm = Arc::new(Self {
            code: output.code,
            globals: GlobalTable::new(output.globals),
            natives,
            heap,
            child_threads: Mutex::new(Vec::new()),
            pause_lock: Mutex::new(()),
            main_cv: Condvar::new(),
            children_cv: Condvar::new(),
            threads_paused: AtomicUsize::new(0),
            main_closure: output.main,
        });
        // Wake anything blocked in await so it reaches its safepoint.
        let weak = Arc::downgrade(&vm);
        vm.heap.set_wake_hook(Box::new(move || {
            if let Some(vm) = weak.upgrade() {
                vm.main_cv.notify_all();
                vm.children_cv.notify_all();
            }
        }));
        vm
    }

    /// Install the main closure as frame 0 of the main thread and run the
    /// dispatch loop to completion. On a runtime error the stack trace is
    /// printed before the error is returned.
    pub fn run(self: &Arc<Self>) -> Result<Value, RuntimeError> {
        let mut main = Thread::new(Arc::clone(self));
        main.push(Value::nil())?;
        main.push(Value::obj(self.main_closure.cast()))?;
        main.call_value(main.peek(0), 0)?;
        match main.execute() {
            Ok(value) => Ok(value),
            Err(err) => {
                self.print_stack_trace(&main, &err);
                Err(err)
            }
        }
    }

    /// Print a runtime error and the call stack, innermost frame first,
    /// decoding instruction pointers through the line table.
    pub fn print_stack_trace(&self, thread: &Thread, err: &RuntimeError) {
        eprintln!("Runtime error: \n{}", err.message);
        for frame in thread.frames.iter().rev() {
            // SAFETY: frame closures are rooted by the thread's stack.
            let name = unsafe { (*(*frame.closure).function).name.clone() };
            let name = if name.is_empty() { "script".to_string() } else { name };
            let instruction = frame.ip.saturating_sub(1);
            match self.code.line_for(instruction) {
                Some(range) => {
                    eprintln!(
                        "{}:{} | in {}",
                        self.code.file_name(range),
                        range.line + 1,
                        name
                    );
                }
                None => eprintln!("<unknown> | in {name}"),
            }
        }
        eprintln!("\nExited with code: {}", err.code.as_u8());
    }

    // =========================================================================
    // Stop-the-world coordination
    // =========================================================================

    /// Main-thread side of the safepoint: wait for every child to park, run
    /// the collection, clear the flag under the pause lock, release the
    /// children.
    pub fn run_gc_as_main(&self, main_thread: &Thread) {
        {
            let mut guard = self.pause_lock.lock();
            while self.threads_paused.load(Ordering::SeqCst) != self.child_threads.lock().len() {
                self.main_cv.wait(&mut guard);
            }
        }
        self.heap.collect(|tracer| self.mark_roots(tracer, main_thread));
        {
            let _guard = self.pause_lock.lock();
            self.heap
                .should_collect
                .store(false, Ordering::SeqCst);
        }
        self.children_cv.notify_all();
    }

    /// Child-thread side of the safepoint: park until the collection is
    /// done.
    pub fn pause_as_child(&self) {
        let mut guard = self.pause_lock.lock();
        self.threads_paused.fetch_add(1, Ordering::SeqCst);
        self.main_cv.notify_one();
        while self.heap.should_collect.load(Ordering::SeqCst) {
            self.children_cv.wait(&mut guard);
        }
        self.threads_paused.fetch_sub(1, Ordering::SeqCst);
    }

    /// Mark every root: the main thread, every child thread's stack and
    /// frames, the globals, the constant pool, and the native table.
    fn mark_roots(&self, tracer: &mut Tracer, main_thread: &Thread) {
        main_thread.mark(tracer);
        for &child in self.child_threads.lock().iter() {
            // SAFETY: children in the pool are parked; their stacks are
            // stable for the duration of the collection.
            unsafe { (*child).mark(tracer) };
        }
        self.globals.mark(tracer);
        for &constant in &self.code.constants {
            tracer.mark_value(constant);
        }
        for &native in &self.natives.functions {
            tracer.mark_obj(native.cast());
        }
    }

    // =========================================================================
    // Child thread lifecycle
    // =========================================================================

    /// Register a freshly launched child.
    pub fn register_child(&self, thread: *mut Thread) {
        self.child_threads.lock().push(thread);
        tracing::trace!(pool = self.child_threads.lock().len(), "thread launched");
    }

    /// Reap the child behind `fut`: claim its thread pointer, drop it from
    /// the pool, and wake the main thread in case it is waiting to collect.
    /// Both the awaiting thread and the child itself call this; whoever
    /// claims the pointer first does the work.
    pub fn reap(&self, fut: *mut ObjFuture) {
        // SAFETY: the future is rooted by whichever stack is reaping it.
        let thread = unsafe { &(*fut).thread }.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if thread.is_null() {
            return;
        }
        {
            let _pause = self.pause_lock.lock();
            let mut pool = self.child_threads.lock();
            pool.retain(|&p| p.cast::<()>() != thread);
        }
        self.main_cv.notify_one();
        tracing::trace!("thread reaped");
    }
}
