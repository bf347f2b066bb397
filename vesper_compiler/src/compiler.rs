//! AST to bytecode compiler.
//!
//! Consumes a topologically sorted list of parsed modules and produces one
//! shared [`CodeBlock`], a globals array with compile-time initial values,
//! and the main-entry closure that runs every module's top-level statements
//! in order.
//!
//! Name resolution walks four scopes: locals (reverse linear scan), upvalues
//! (recursive scan up the enclosing-function chain), globals (current module
//! first, then the exports of unaliased imports), and finally the native
//! function table.
//!
//! Diagnostics are collected rather than fatal: a failed statement is
//! discarded and compilation resyncs at the next top-level statement, so a
//! single run reports as many errors as it can find.

use crate::ast::*;
use crate::chunk::{Chunk, CodeBlock};
use crate::opcode::{OpCode, ScopeJump};
use smallvec::SmallVec;
use vesper_core::{CompileError, Token, Value};
use vesper_runtime::object::{self, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjKind};
use vesper_runtime::{GcHeap, NativeRegistry};

/// Highest constant index that fits the short instruction forms.
const SHORT_CONSTANT_LIMIT: u16 = u8::MAX as u16;

/// Maximum locals per function, including the reserved slot 0.
pub const LOCAL_MAX: usize = 256;

/// Maximum upvalues captured per function.
pub const UPVAL_MAX: usize = 256;

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    /// The implicit script body running all module top-level statements.
    Script,
    /// A named or anonymous function.
    Function,
    /// A class method; `this` occupies local slot 0.
    Method,
    /// The constructor method; returns `this` implicitly.
    Constructor,
}

/// A local variable slot known to the compiler.
struct Local {
    name: String,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
}

/// A compact upvalue record emitted after a `CLOSURE` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRec {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state, chained through `enclosing`.
struct FuncScope {
    enclosing: Option<Box<FuncScope>>,
    chunk: Chunk,
    func: *mut ObjFunction,
    kind: FuncKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRec>,
    scope_depth: i32,
    line: u32,
    /// Patch positions of pending break/continue/advance placeholders.
    scope_jumps: SmallVec<[usize; 8]>,
    /// Scope depths at which a loop was entered.
    scopes_with_loop: SmallVec<[i32; 4]>,
    /// Scope depths at which a switch was entered.
    scopes_with_switch: SmallVec<[i32; 4]>,
}

impl FuncScope {
    fn new(enclosing: Option<Box<FuncScope>>, kind: FuncKind, func: *mut ObjFunction) -> Self {
        let slot_zero = Local {
            name: if matches!(kind, FuncKind::Method | FuncKind::Constructor) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
        };
        Self {
            enclosing,
            chunk: Chunk::new(),
            func,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            line: 0,
            scope_jumps: SmallVec::new(),
            scopes_with_loop: SmallVec::new(),
            scopes_with_switch: SmallVec::new(),
        }
    }
}

/// Class context while compiling a class body.
struct ClassCtx {
    superclass: *mut ObjClass,
}

/// One entry of the globals array.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    /// Declared name.
    pub name: String,
    /// Current value; compile-time for functions and classes.
    pub value: Value,
}

/// Per-module metadata gathered before compilation.
struct UnitMeta {
    name: String,
    decls: Vec<(String, DeclKind)>,
    exports: Vec<String>,
    /// (unit index, alias) per import.
    deps: Vec<(usize, Option<String>)>,
    /// First slot of this module's globals.
    global_base: usize,
}

/// Everything the VM needs to start executing.
#[derive(Debug)]
pub struct CompilerOutput {
    /// The shared code block.
    pub code: CodeBlock,
    /// Main-entry closure over the script body.
    pub main: *mut ObjClosure,
    /// The globals array, declaration order across all modules.
    pub globals: Vec<GlobalVar>,
}

/// How a plain name resolved at global scope.
enum GlobalRes {
    Index(u16),
    NotFound,
}

type CResult<T> = Result<T, CompileError>;

/// The compiler. One instance compiles one topologically sorted program.
pub struct Compiler<'e> {
    heap: &'e GcHeap,
    natives: &'e NativeRegistry,
    code: CodeBlock,
    globals: Vec<GlobalVar>,
    defined: Vec<bool>,
    units: Vec<UnitMeta>,
    current: Box<FuncScope>,
    class_ctx: Option<ClassCtx>,
    cur_unit: usize,
    cur_file: u16,
    errors: Vec<CompileError>,
}

impl<'e> Compiler<'e> {
    /// Compile `modules` into a runnable [`CompilerOutput`].
    ///
    /// Modules must be topologically sorted: every import precedes its
    /// importer. On failure the collected diagnostics are returned; the
    /// compiler keeps going past failed statements so the list is as
    /// complete as it can make it.
    pub fn compile(
        modules: &[Module],
        heap: &'e GcHeap,
        natives: &'e NativeRegistry,
    ) -> Result<CompilerOutput, Vec<CompileError>> {
        let script_func = heap.alloc_function(String::new(), 0);
        let mut compiler = Compiler {
            heap,
            natives,
            code: CodeBlock::new(),
            globals: Vec::new(),
            defined: Vec::new(),
            units: Vec::new(),
            current: Box::new(FuncScope::new(None, FuncKind::Script, script_func)),
            class_ctx: None,
            cur_unit: 0,
            cur_file: 0,
            errors: Vec::new(),
        };

        compiler.collect_unit_metadata(modules);

        for (index, module) in modules.iter().enumerate() {
            compiler.cur_unit = index;
            compiler.cur_file = index as u16;
            compiler.code.files.push(module.name.clone());

            // Pass one: every top-level declaration claims its global slot
            // before any statement compiles, enabling forward references.
            for decl in &module.declarations {
                compiler.globals.push(GlobalVar {
                    name: decl.name.name.clone(),
                    value: Value::nil(),
                });
                compiler.defined.push(false);
            }

            // Pass two: compile statements, resyncing after a failure.
            for stmt in &module.stmts {
                if let Err(err) = compiler.compile_stmt(stmt) {
                    compiler.errors.push(err);
                    compiler.recover_to_script_scope();
                }
            }
        }

        let main_func = compiler.end_func();
        // SAFETY: function objects stay live through compilation; the only
        // collection happens below with this function as a root.
        unsafe { (*main_func).name = "script".to_string() };

        let roots_globals = compiler.globals.clone();
        heap.collect_for_compiler(|tracer| {
            for value in &compiler.code.constants {
                tracer.mark_value(*value);
            }
            for global in &roots_globals {
                tracer.mark_value(global.value);
            }
            for &native in &natives.functions {
                tracer.mark_obj(native as *mut ObjHeader);
            }
            tracer.mark_obj(main_func as *mut ObjHeader);
        });

        if !compiler.errors.is_empty() {
            return Err(compiler.errors);
        }

        let main = heap.alloc_closure(main_func);
        Ok(CompilerOutput {
            code: compiler.code,
            main,
            globals: compiler.globals,
        })
    }

    /// Gather declaration/export/import metadata and validate the module
    /// graph before any code is emitted.
    fn collect_unit_metadata(&mut self, modules: &[Module]) {
        let mut base = 0usize;
        for (index, module) in modules.iter().enumerate() {
            let mut decls: Vec<(String, DeclKind)> = Vec::new();
            for decl in &module.declarations {
                if decls.iter().any(|(name, _)| *name == decl.name.name) {
                    self.errors.push(CompileError::at(
                        decl.name.clone(),
                        module.name.clone(),
                        format!("Redeclaration of top-level symbol '{}'.", decl.name.name),
                    ));
                }
                decls.push((decl.name.name.clone(), decl.kind));
            }

            let mut deps: Vec<(usize, Option<String>)> = Vec::new();
            for dep in &module.deps {
                let Some(unit) = modules[..index].iter().position(|m| m.name == dep.module)
                else {
                    self.errors.push(CompileError::system(
                        module.name.clone(),
                        format!("Import '{}' does not precede this module.", dep.module),
                    ));
                    continue;
                };
                let alias = dep.alias.as_ref().map(|t| t.name.clone());
                if let Some(alias_name) = &alias {
                    if deps
                        .iter()
                        .any(|(_, existing)| existing.as_deref() == Some(alias_name))
                    {
                        self.errors.push(CompileError::at(
                            dep.alias.clone().expect("alias token"),
                            module.name.clone(),
                            format!("Two imports share the alias '{alias_name}'."),
                        ));
                    }
                }
                deps.push((unit, alias));
            }

            self.units.push(UnitMeta {
                name: module.name.clone(),
                decls,
                exports: module.exports.clone(),
                deps,
                global_base: base,
            });
            base += module.declarations.len();
        }
    }

    /// After a failed statement, unwind abandoned function scopes and reset
    /// the script scope so the next statement compiles on a clean slate.
    fn recover_to_script_scope(&mut self) {
        while self.current.enclosing.is_some() {
            let enclosing = self.current.enclosing.take().expect("checked");
            self.current = enclosing;
        }
        self.class_ctx = None;
        self.current.scope_depth = 0;
        self.current.locals.retain(|local| local.depth == 0);
        self.current.scope_jumps.clear();
        self.current.scopes_with_loop.clear();
        self.current.scopes_with_switch.clear();
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn file_name(&self) -> String {
        self.units
            .get(self.cur_unit)
            .map_or_else(|| "<script>".to_string(), |u| u.name.clone())
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> CompileError {
        CompileError::at(token.clone(), self.file_name(), message)
    }

    fn system_error(&self, message: impl Into<String>) -> CompileError {
        CompileError::system(self.file_name(), message)
    }

    fn update_line(&mut self, line: u32) {
        self.current.line = line;
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit_byte(&mut self, byte: u8) {
        let line = self.current.line;
        let file = self.cur_file;
        self.current.chunk.write_byte(byte, line, file);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.as_byte());
    }

    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte((value & 0xFF) as u8);
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_op_u16(&mut self, op: OpCode, operand: u16) {
        self.emit_op(op);
        self.emit_u16(operand);
    }

    fn make_constant(&mut self, value: Value) -> CResult<u16> {
        let index = self.current.chunk.add_constant(value);
        if index > u16::MAX as usize {
            return Err(self.system_error("Too many constants in one chunk."));
        }
        Ok(index as u16)
    }

    fn emit_constant(&mut self, value: Value) -> CResult<()> {
        let constant = self.make_constant(value)?;
        if constant <= SHORT_CONSTANT_LIMIT {
            self.emit_op_u8(OpCode::Constant, constant as u8);
        } else {
            self.emit_op_u16(OpCode::ConstantLong, constant);
        }
        Ok(())
    }

    /// Constant holding the interned string for an identifier.
    fn identifier_constant(&mut self, token: &Token) -> CResult<u16> {
        self.update_line(token.line);
        let string = self.heap.intern(&token.name);
        self.make_constant(Value::obj(string as *mut ()))
    }

    /// Implicit return: `this` from a constructor, nil otherwise.
    fn emit_return(&mut self) {
        if self.current.kind == FuncKind::Constructor {
            self.emit_op_u8(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Emit a forward jump with a placeholder offset; returns the patch
    /// position.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.current.chunk.bytecode.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> CResult<()> {
        let jump = self.current.chunk.bytecode.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(self.system_error("Too much code to jump over."));
        }
        self.current.chunk.bytecode[offset] = (jump >> 8) as u8;
        self.current.chunk.bytecode[offset + 1] = (jump & 0xFF) as u8;
        Ok(())
    }

    /// Backward conditional jump closing a loop body.
    fn emit_loop(&mut self, loop_start: usize) -> CResult<()> {
        self.emit_op(OpCode::LoopIfTrue);
        let offset = self.current.chunk.bytecode.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(self.system_error("Loop body too large."));
        }
        self.emit_u16(offset as u16);
        Ok(())
    }

    /// Emit a break/continue/advance placeholder recording the scope depth
    /// it was written at and the locals to pop; `patch_scope_jumps` rewrites
    /// it once the enclosing construct is closed.
    fn emit_scope_jump(&mut self, kind: ScopeJump, token: &Token) -> CResult<()> {
        self.update_line(token.line);
        let mut to_pop: u32 = 0;
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && self.scope_jump_stops_at(kind, local.depth) {
                break;
            }
            to_pop += 1;
        }
        if to_pop > u8::MAX as u32 {
            return Err(self.error_at(token, "Too many variables to pop."));
        }
        self.emit_byte(kind as u8);
        let patch_pos = self.current.chunk.bytecode.len();
        let depth = self.current.scope_depth as u16;
        self.emit_u16(depth);
        self.emit_byte(to_pop as u8);
        self.current.scope_jumps.push(patch_pos);
        Ok(())
    }

    /// Does a local at `depth` belong to the construct this jump targets?
    fn scope_jump_stops_at(&self, kind: ScopeJump, depth: i32) -> bool {
        let loop_depth = self.current.scopes_with_loop.last().copied();
        let switch_depth = self.current.scopes_with_switch.last().copied();
        match kind {
            // break leaves the innermost loop or switch, whichever is nearer
            ScopeJump::Break => {
                loop_depth.is_some_and(|d| depth <= d) || switch_depth.is_some_and(|d| depth <= d)
            }
            ScopeJump::Continue => loop_depth.is_some_and(|d| depth <= d),
            ScopeJump::Advance => switch_depth.is_some_and(|d| depth <= d),
        }
    }

    /// Rewrite every pending placeholder of `kind` that belongs to the
    /// construct just closed into a concrete `JUMP_POPN` to here.
    fn patch_scope_jumps(&mut self, kind: ScopeJump) -> CResult<()> {
        let cur_code = self.current.chunk.bytecode.len();
        let mut index = self.current.scope_jumps.len();
        while index > 0 {
            index -= 1;
            let patch_pos = self.current.scope_jumps[index];
            let bytecode = &self.current.chunk.bytecode;
            let jump_type = bytecode[patch_pos - 1];
            let jump_depth =
                ((bytecode[patch_pos] as u32) << 8) | bytecode[patch_pos + 1] as u32;
            let to_pop = bytecode[patch_pos + 2];
            let depth_matches = if kind == ScopeJump::Continue {
                jump_depth as i32 >= self.current.scope_depth
            } else {
                jump_depth as i32 > self.current.scope_depth
            };
            if depth_matches && jump_type == kind as u8 {
                let jump_len = cur_code - patch_pos - 3;
                if jump_len > u16::MAX as usize {
                    return Err(self.system_error("Too much code to jump over."));
                }
                let bytecode = &mut self.current.chunk.bytecode;
                bytecode[patch_pos - 1] = OpCode::JumpPopN.as_byte();
                bytecode[patch_pos] = to_pop;
                bytecode[patch_pos + 1] = (jump_len >> 8) as u8;
                bytecode[patch_pos + 2] = (jump_len & 0xFF) as u8;
                self.current.scope_jumps.remove(index);
            } else if (jump_depth as i32) < self.current.scope_depth {
                // Entries below are shallower still.
                break;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Scopes and variables
    // =========================================================================

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        let mut to_pop = 0u32;
        while let Some(local) = self.current.locals.last() {
            if local.depth <= self.current.scope_depth {
                break;
            }
            self.current.locals.pop();
            to_pop += 1;
        }
        match to_pop {
            0 => {}
            1 => self.emit_op(OpCode::Pop),
            n => self.emit_op_u8(OpCode::PopN, n as u8),
        }
    }

    /// Declare a variable: for a local, claim a slot; for a global, return
    /// its index in the globals array.
    fn parse_var(&mut self, name: &Token) -> CResult<u16> {
        self.update_line(name.line);
        self.declare_var(name)?;
        if self.current.scope_depth > 0 {
            return Ok(0);
        }
        let base = self.units[self.cur_unit].global_base;
        for (index, global) in self.globals.iter().enumerate().skip(base) {
            if global.name == name.name {
                return Ok(index as u16);
            }
        }
        Err(self.error_at(name, "Couldn't find variable."))
    }

    /// Reserve a local slot, rejecting shadowing within the same scope.
    fn declare_var(&mut self, name: &Token) -> CResult<()> {
        if self.current.scope_depth == 0 {
            return Ok(());
        }
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.current.scope_depth {
                break;
            }
            if local.name == name.name {
                return Err(
                    self.error_at(name, "Already a variable with this name in this scope.")
                );
            }
        }
        if self.current.locals.len() == LOCAL_MAX {
            return Err(self.error_at(name, "Too many local variables in function."));
        }
        self.current.locals.push(Local {
            name: name.name.clone(),
            depth: -1,
        });
        Ok(())
    }

    /// Mark a declared variable ready: locals get their depth, globals flip
    /// their defined bit.
    fn define_var(&mut self, index: u16) {
        if self.current.scope_depth > 0 {
            if let Some(local) = self.current.locals.last_mut() {
                local.depth = self.current.scope_depth;
            }
            return;
        }
        self.defined[index as usize] = true;
    }

    fn resolve_local_in(scope: &FuncScope, name: &str) -> Result<Option<u8>, String> {
        for (index, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.".to_string());
                }
                return Ok(Some(index as u8));
            }
        }
        Ok(None)
    }

    fn resolve_local(&self, name: &Token) -> CResult<Option<u8>> {
        Self::resolve_local_in(&self.current, &name.name)
            .map_err(|msg| self.error_at(name, msg))
    }

    fn resolve_upvalue_in(scope: &mut FuncScope, name: &str) -> Result<Option<u8>, String> {
        let Some(enclosing) = scope.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some(local) = Self::resolve_local_in(enclosing, name)? {
            return Self::add_upvalue(scope, local, true).map(Some);
        }
        if let Some(upvalue) = Self::resolve_upvalue_in(enclosing, name)? {
            return Self::add_upvalue(scope, upvalue, false).map(Some);
        }
        Ok(None)
    }

    fn resolve_upvalue(&mut self, name: &Token) -> CResult<Option<u8>> {
        let result = Self::resolve_upvalue_in(&mut self.current, &name.name);
        result.map_err(|msg| self.error_at(name, msg))
    }

    fn add_upvalue(scope: &mut FuncScope, index: u8, is_local: bool) -> Result<u8, String> {
        for (slot, upvalue) in scope.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(slot as u8);
            }
        }
        if scope.upvalues.len() == UPVAL_MAX {
            return Err("Too many closure variables in function.".to_string());
        }
        scope.upvalues.push(UpvalueRec { index, is_local });
        // SAFETY: compiler-allocated function objects stay live until the
        // compile-time collection, which roots them.
        unsafe { (*scope.func).upvalue_count = scope.upvalues.len() as u8 };
        Ok((scope.upvalues.len() - 1) as u8)
    }

    /// Resolve `name` against the current module's globals, then the exports
    /// of its unaliased imports.
    fn resolve_global(&self, name: &Token, can_assign: bool) -> CResult<GlobalRes> {
        let unit = &self.units[self.cur_unit];
        for (offset, (decl_name, kind)) in unit.decls.iter().enumerate() {
            if *decl_name == name.name {
                let index = unit.global_base + offset;
                // Top-level statements execute in compile order, so reading a
                // slot that has not been defined yet is use-before-init.
                // Function and method bodies only run after every top-level
                // declaration is materialized, so forward references are fine
                // there.
                if !self.defined[index] && self.current.kind == FuncKind::Script {
                    return Err(self.error_at(
                        name,
                        format!(
                            "Trying to access variable '{}' before it's initialized.",
                            name.name
                        ),
                    ));
                }
                if can_assign {
                    match kind {
                        DeclKind::Func => {
                            return Err(self.error_at(name, "Cannot assign to a function."))
                        }
                        DeclKind::Class => {
                            return Err(self.error_at(name, "Cannot assign to a class."))
                        }
                        DeclKind::Var => {}
                    }
                }
                return Ok(GlobalRes::Index(index as u16));
            }
        }
        if can_assign {
            return Err(
                self.error_at(name, "Cannot assign to a variable not declared in this module.")
            );
        }
        self.check_symbol(name)
    }

    /// Search the exports of every unaliased import for `name`. Finding it
    /// in more than one is an ambiguity error.
    fn check_symbol(&self, name: &Token) -> CResult<GlobalRes> {
        let unit = &self.units[self.cur_unit];
        let mut found: Option<usize> = None;
        for (dep_unit, alias) in &unit.deps {
            if alias.is_some() {
                continue;
            }
            let dep = &self.units[*dep_unit];
            if !dep.exports.iter().any(|e| *e == name.name) {
                continue;
            }
            let Some(offset) = dep.decls.iter().position(|(n, _)| *n == name.name) else {
                return Err(self.error_at(
                    name,
                    format!("Module '{}' exports undeclared symbol '{}'.", dep.name, name.name),
                ));
            };
            let index = dep.global_base + offset;
            if found.is_some() {
                return Err(self.error_at(
                    name,
                    format!(
                        "Symbol '{}' is ambiguous: exported by more than one unaliased import.",
                        name.name
                    ),
                ));
            }
            found = Some(index);
        }
        Ok(found.map_or(GlobalRes::NotFound, |i| GlobalRes::Index(i as u16)))
    }

    /// Resolve `alias::name` to its global slot.
    fn resolve_module_variable(&self, module: &Token, name: &Token) -> CResult<u16> {
        let unit = &self.units[self.cur_unit];
        let dep_unit = unit
            .deps
            .iter()
            .find(|(_, alias)| alias.as_deref() == Some(module.name.as_str()))
            .map(|(u, _)| *u)
            .ok_or_else(|| self.error_at(module, "Module alias doesn't exist."))?;
        let dep = &self.units[dep_unit];
        if !dep.exports.iter().any(|e| *e == name.name) {
            return Err(self.error_at(
                name,
                format!("Module {} doesn't export this symbol.", module.name),
            ));
        }
        let offset = dep
            .decls
            .iter()
            .position(|(n, _)| *n == name.name)
            .ok_or_else(|| {
                self.error_at(
                    name,
                    format!("Module '{}' exports undeclared symbol '{}'.", dep.name, name.name),
                )
            })?;
        Ok((dep.global_base + offset) as u16)
    }

    /// Compile a read or write of a plain name, walking
    /// locals -> upvalues -> globals -> natives.
    fn named_var(&mut self, name: &Token, can_assign: bool) -> CResult<()> {
        self.update_line(name.line);
        if let Some(slot) = self.resolve_local(name)? {
            let op = if can_assign {
                OpCode::SetLocal
            } else {
                OpCode::GetLocal
            };
            self.emit_op_u8(op, slot);
            return Ok(());
        }
        if let Some(slot) = self.resolve_upvalue(name)? {
            let op = if can_assign {
                OpCode::SetUpvalue
            } else {
                OpCode::GetUpvalue
            };
            self.emit_op_u8(op, slot);
            return Ok(());
        }
        match self.resolve_global(name, can_assign)? {
            GlobalRes::Index(index) => {
                if index <= SHORT_CONSTANT_LIMIT {
                    let op = if can_assign {
                        OpCode::SetGlobal
                    } else {
                        OpCode::GetGlobal
                    };
                    self.emit_op_u8(op, index as u8);
                } else {
                    let op = if can_assign {
                        OpCode::SetGlobalLong
                    } else {
                        OpCode::GetGlobalLong
                    };
                    self.emit_op_u16(op, index);
                }
                Ok(())
            }
            GlobalRes::NotFound => {
                let Some(slot) = self.natives.lookup_function(&name.name) else {
                    return Err(self.error_at(
                        name,
                        format!(
                            "'{}' doesn't match any declared variable name or native function name.",
                            name.name
                        ),
                    ));
                };
                if can_assign {
                    return Err(self.error_at(name, "Cannot assign to a native function."));
                }
                self.emit_op_u16(OpCode::GetNative, slot);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn begin_func(&mut self, kind: FuncKind, name: &str) {
        let func = self.heap.alloc_function(name.to_string(), 0);
        let enclosing = std::mem::replace(
            &mut self.current,
            Box::new(FuncScope::new(None, kind, func)),
        );
        self.current.enclosing = Some(enclosing);
    }

    /// Close the current function: append its chunk to the shared code block,
    /// record the offsets, and pop back to the enclosing scope. The implicit
    /// return is always emitted; after an explicit return it is dead bytes.
    fn end_func(&mut self) -> *mut ObjFunction {
        self.emit_return();
        let func = self.current.func;
        let chunk = std::mem::take(&mut self.current.chunk);
        let (bytecode_offset, constants_offset) = self.code.append(chunk);
        // SAFETY: compiler-allocated function objects stay live; see module
        // docs on the compile-time collection.
        unsafe {
            (*func).bytecode_offset = bytecode_offset;
            (*func).constants_offset = constants_offset;
        }
        if let Some(enclosing) = self.current.enclosing.take() {
            self.current = enclosing;
        }
        func
    }

    /// Compile a function body shared by declarations, literals, and
    /// methods; returns the finished function and its upvalue records.
    fn compile_function(
        &mut self,
        kind: FuncKind,
        name: &str,
        params: &[Token],
        body: &[Stmt],
    ) -> CResult<(*mut ObjFunction, Vec<UpvalueRec>)> {
        self.begin_func(kind, name);
        self.begin_scope();
        if params.len() > u8::MAX as usize {
            let err = self.error_at(&params[0], "Too many parameters.");
            self.end_func();
            return Err(err);
        }
        for param in params {
            match self.parse_var(param) {
                Ok(index) => self.define_var(index),
                Err(err) => {
                    self.end_func();
                    return Err(err);
                }
            }
        }
        for stmt in body {
            if let Err(err) = self.compile_stmt(stmt) {
                self.end_func();
                return Err(err);
            }
        }
        let upvalues = self.current.upvalues.clone();
        let func = self.current.func;
        // SAFETY: see end_func.
        unsafe { (*func).arity = params.len() as u8 };
        let func = self.end_func();
        Ok((func, upvalues))
    }

    /// Compile a class method into a closure. Methods cannot capture
    /// upvalues; there is no enclosing function scope to capture from.
    fn compile_method(&mut self, method: &MethodDecl, class_name: &Token) -> CResult<*mut ObjClosure> {
        self.update_line(method.name.line);
        let kind = if method.name.name == class_name.name {
            FuncKind::Constructor
        } else {
            FuncKind::Method
        };
        let (func, _) = self.compile_function(kind, &method.name.name, &method.params, &method.body)?;
        // SAFETY: see end_func.
        if unsafe { (*func).upvalue_count } != 0 {
            return Err(self.error_at(&method.name, "Upvalues captured in method."));
        }
        Ok(self.heap.alloc_closure(func))
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Pop);
                Ok(())
            }
            Stmt::Var { name, initializer } => self.compile_var_decl(name, initializer.as_ref()),
            Stmt::Func { name, params, body } => self.compile_func_decl(name, params, body),
            Stmt::Class {
                name,
                superclass,
                methods,
            } => self.compile_class_decl(name, superclass.as_ref(), methods),
            Stmt::Block(stmts) => {
                self.begin_scope();
                let mut result = Ok(());
                for stmt in stmts {
                    result = self.compile_stmt(stmt);
                    if result.is_err() {
                        break;
                    }
                }
                self.end_scope();
                result
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let then_jump = self.emit_jump(OpCode::JumpIfFalsePop);
                self.compile_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let else_jump = self.emit_jump(OpCode::Jump);
                    self.patch_jump(then_jump)?;
                    self.compile_stmt(else_branch)?;
                    self.patch_jump(else_jump)?;
                } else {
                    self.patch_jump(then_jump)?;
                }
                Ok(())
            }
            Stmt::While { condition, body } => self.compile_while(condition, body),
            Stmt::For {
                init,
                condition,
                increment,
                body,
            } => self.compile_for(init.as_deref(), condition.as_ref(), increment.as_ref(), body),
            Stmt::Break(token) => {
                if self.current.scopes_with_loop.is_empty()
                    && self.current.scopes_with_switch.is_empty()
                {
                    return Err(self.error_at(token, "Can't use 'break' outside a loop or switch."));
                }
                self.emit_scope_jump(ScopeJump::Break, token)
            }
            Stmt::Continue(token) => {
                if self.current.scopes_with_loop.is_empty() {
                    return Err(self.error_at(token, "Can't use 'continue' outside a loop."));
                }
                self.emit_scope_jump(ScopeJump::Continue, token)
            }
            Stmt::Advance(token) => {
                if self.current.scopes_with_switch.is_empty() {
                    return Err(self.error_at(token, "Can't use 'advance' outside a switch."));
                }
                self.emit_scope_jump(ScopeJump::Advance, token)
            }
            Stmt::Switch { subject, cases } => self.compile_switch(subject, cases),
            Stmt::Return { keyword, value } => {
                self.update_line(keyword.line);
                if self.current.kind == FuncKind::Constructor && value.is_some() {
                    return Err(
                        self.error_at(keyword, "Can't return a value from a constructor.")
                    );
                }
                match value {
                    None => self.emit_return(),
                    Some(expr) => {
                        self.compile_expr(expr)?;
                        self.emit_op(OpCode::Return);
                    }
                }
                Ok(())
            }
        }
    }

    fn compile_var_decl(&mut self, name: &Token, initializer: Option<&Expr>) -> CResult<()> {
        let index = self.parse_var(name)?;
        match initializer {
            None => self.emit_op(OpCode::Nil),
            Some(expr) => self.compile_expr(expr)?,
        }
        self.define_var(index);
        if self.current.scope_depth > 0 {
            // The compiled value's stack slot becomes the local.
            return Ok(());
        }
        if index <= SHORT_CONSTANT_LIMIT {
            self.emit_op_u8(OpCode::SetGlobal, index as u8);
        } else {
            self.emit_op_u16(OpCode::SetGlobalLong, index);
        }
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    /// Global function declaration: compiled to a finished closure stored
    /// into its global slot at compile time, so recursion works and no
    /// runtime bytecode is needed.
    fn compile_func_decl(&mut self, name: &Token, params: &[Token], body: &[Stmt]) -> CResult<()> {
        if self.current.scope_depth > 0 {
            return Err(
                self.error_at(name, "Functions can only be declared at the top level.")
            );
        }
        let index = self.parse_var(name)?;
        // Defined before the body compiles to allow recursion.
        self.define_var(index);
        let (func, _) = self.compile_function(FuncKind::Function, &name.name, params, body)?;
        // SAFETY: see end_func.
        if unsafe { (*func).upvalue_count } != 0 {
            return Err(self.error_at(name, "Global function cannot capture variables."));
        }
        let closure = self.heap.alloc_closure(func);
        self.globals[index as usize].value = Value::obj(closure as *mut ());
        Ok(())
    }

    fn compile_class_decl(
        &mut self,
        name: &Token,
        superclass: Option<&SuperclassRef>,
        methods: &[MethodDecl],
    ) -> CResult<()> {
        if self.current.scope_depth > 0 {
            return Err(self.error_at(name, "Classes can only be declared at the top level."));
        }
        let index = self.parse_var(name)?;
        let class = self.heap.alloc_class(name.name.clone());
        let prev_ctx = self.class_ctx.take();
        self.class_ctx = Some(ClassCtx {
            superclass: std::ptr::null_mut(),
        });

        let result = self.compile_class_body(index, class, superclass, methods, name);
        self.class_ctx = prev_ctx;
        result
    }

    fn compile_class_body(
        &mut self,
        index: u16,
        class: *mut ObjClass,
        superclass: Option<&SuperclassRef>,
        methods: &[MethodDecl],
        name: &Token,
    ) -> CResult<()> {
        if let Some(superclass_ref) = superclass {
            let (super_index, token) = match superclass_ref {
                SuperclassRef::Name(token) => match self.resolve_global(token, false)? {
                    GlobalRes::Index(i) => (i, token),
                    GlobalRes::NotFound => {
                        return Err(self.error_at(token, "Variable isn't defined."))
                    }
                },
                SuperclassRef::Module { module, name } => {
                    (self.resolve_module_variable(module, name)?, name)
                }
            };
            let super_value = self.globals[super_index as usize].value;
            if !object::is_obj_kind(super_value, ObjKind::Class) {
                return Err(self.error_at(token, "Superclass must be a class."));
            }
            // SAFETY: just verified the global slot holds a class object.
            let superclass = unsafe { object::as_class(super_value) };
            unsafe {
                // Copy-down inheritance before the subclass's own methods.
                let method_table = (*superclass).methods.clone();
                (*class).methods = method_table;
                (*class).superclass = superclass;
            }
            self.class_ctx.as_mut().expect("in class").superclass = superclass;
        }
        // Define after inheriting so a class can't be its own superclass.
        self.define_var(index);

        for method in methods {
            let closure = self.compile_method(method, name)?;
            // SAFETY: class allocated above, alive through compilation.
            unsafe {
                (*class)
                    .methods
                    .insert(method.name.name.clone(), Value::obj(closure as *mut ()));
            }
        }
        self.globals[index as usize].value = Value::obj(class as *mut ());
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt) -> CResult<()> {
        // Loop inversion: test once before entry, then test at the bottom.
        self.compile_expr(condition)?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalsePop);
        let loop_start = self.current.chunk.bytecode.len();
        let depth = self.current.scope_depth;
        self.current.scopes_with_loop.push(depth);
        self.begin_scope();
        let body_result = self.compile_stmt(body);
        self.end_scope();
        self.current.scopes_with_loop.pop();
        body_result?;
        self.patch_scope_jumps(ScopeJump::Continue)?;
        self.compile_expr(condition)?;
        self.emit_loop(loop_start)?;
        self.patch_jump(exit_jump)?;
        self.patch_scope_jumps(ScopeJump::Break)?;
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Expr>,
        body: &Stmt,
    ) -> CResult<()> {
        self.begin_scope();
        let result = self.compile_for_inner(init, condition, increment, body);
        self.end_scope();
        result
    }

    fn compile_for_inner(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Expr>,
        body: &Stmt,
    ) -> CResult<()> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        let mut exit_jump = None;
        if let Some(condition) = condition {
            self.compile_expr(condition)?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalsePop));
        }
        let loop_start = self.current.chunk.bytecode.len();
        let depth = self.current.scope_depth;
        self.current.scopes_with_loop.push(depth);
        self.begin_scope();
        let body_result = self.compile_stmt(body);
        self.end_scope();
        self.current.scopes_with_loop.pop();
        body_result?;
        self.patch_scope_jumps(ScopeJump::Continue)?;
        if let Some(increment) = increment {
            self.compile_expr(increment)?;
            self.emit_op(OpCode::Pop);
        }
        match condition {
            Some(condition) => {
                self.compile_expr(condition)?;
                self.emit_loop(loop_start)?;
            }
            None => {
                self.emit_op(OpCode::Loop);
                let offset = self.current.chunk.bytecode.len() - loop_start + 2;
                if offset > u16::MAX as usize {
                    return Err(self.system_error("Loop body too large."));
                }
                self.emit_u16(offset as u16);
            }
        }
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
        }
        self.patch_scope_jumps(ScopeJump::Break)?;
        Ok(())
    }

    fn compile_switch(&mut self, subject: &Expr, cases: &[SwitchCase]) -> CResult<()> {
        let depth = self.current.scope_depth;
        self.current.scopes_with_switch.push(depth);
        let result = self.compile_switch_inner(subject, cases);
        self.current.scopes_with_switch.pop();
        result?;
        self.patch_scope_jumps(ScopeJump::Break)
    }

    fn compile_switch_inner(&mut self, subject: &Expr, cases: &[SwitchCase]) -> CResult<()> {
        self.compile_expr(subject)?;

        // Collect every case constant; a single case may carry several.
        let mut constants: Vec<u16> = Vec::new();
        let mut is_long = false;
        let mut seen_default = false;
        for case in cases {
            if case.is_default {
                if seen_default {
                    // Non-fatal: report and keep compiling.
                    let err = self.system_error(format!(
                        "Duplicate 'default' case in switch (line {}).",
                        case.line + 1
                    ));
                    self.errors.push(err);
                }
                seen_default = true;
                continue;
            }
            for constant in &case.constants {
                let value = match constant {
                    CaseConstant::Number(n) => Value::number(*n),
                    CaseConstant::Bool(b) => Value::bool(*b),
                    CaseConstant::Nil => Value::nil(),
                    CaseConstant::Str(s) => Value::obj(self.heap.intern(s) as *mut ()),
                };
                let index = self.make_constant(value)?;
                if index > SHORT_CONSTANT_LIMIT {
                    is_long = true;
                }
                constants.push(index);
            }
        }

        // Header: count, constant indexes, then count+1 jump slots with the
        // default slot last.
        if is_long {
            self.emit_op(OpCode::SwitchLong);
            self.emit_u16(constants.len() as u16);
            for &constant in &constants {
                self.emit_u16(constant);
            }
        } else {
            self.emit_op(OpCode::Switch);
            self.emit_u16(constants.len() as u16);
            for &constant in &constants {
                self.emit_byte(constant as u8);
            }
        }
        let mut jump_slots: Vec<usize> = Vec::with_capacity(constants.len() + 1);
        for _ in 0..=constants.len() {
            jump_slots.push(self.current.chunk.bytecode.len());
            self.emit_u16(0xFFFF);
        }

        // Case bodies. Each ends with an implicit break; advance placeholders
        // are patched right after it, landing on the next case's body.
        let mut implicit_breaks: Vec<usize> = Vec::with_capacity(cases.len());
        let mut slot = 0usize;
        let mut handled_default = false;
        for case in cases {
            if case.is_default {
                if handled_default {
                    continue;
                }
                handled_default = true;
                self.patch_jump(jump_slots[constants.len()])?;
            } else {
                for _ in &case.constants {
                    self.patch_jump(jump_slots[slot])?;
                    slot += 1;
                }
            }
            self.begin_scope();
            let mut body_result = Ok(());
            for stmt in &case.body {
                body_result = self.compile_stmt(stmt);
                if body_result.is_err() {
                    break;
                }
            }
            self.end_scope();
            body_result?;
            implicit_breaks.push(self.emit_jump(OpCode::Jump));
            self.patch_scope_jumps(ScopeJump::Advance)?;
        }

        // No default: a miss falls past the switch.
        if !seen_default {
            self.patch_jump(jump_slots[constants.len()])?;
        }
        for jump in implicit_breaks {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_expr(&mut self, expr: &Expr) -> CResult<()> {
        match expr {
            Expr::Number { value, line } => {
                self.update_line(*line);
                if value.fract() == 0.0 && *value >= 0.0 && *value <= 255.0 {
                    self.emit_op_u8(OpCode::LoadInt, *value as u8);
                } else {
                    self.emit_constant(Value::number(*value))?;
                }
                Ok(())
            }
            Expr::Bool { value, line } => {
                self.update_line(*line);
                self.emit_op(if *value { OpCode::True } else { OpCode::False });
                Ok(())
            }
            Expr::Nil { line } => {
                self.update_line(*line);
                self.emit_op(OpCode::Nil);
                Ok(())
            }
            Expr::Str { value, line } => {
                self.update_line(*line);
                let string = self.heap.intern(value);
                self.emit_constant(Value::obj(string as *mut ()))
            }
            Expr::Ident(token) => self.named_var(token, false),
            Expr::This(token) => {
                if self.class_ctx.is_none() {
                    return Err(
                        self.error_at(token, "Can't use keyword 'this' outside of a class.")
                    );
                }
                self.named_var(token, false)
            }
            Expr::Assign { name, value } => {
                self.compile_expr(value)?;
                self.named_var(name, true)
            }
            Expr::SetIndex {
                callee,
                index,
                value,
                line,
            } => {
                self.update_line(*line);
                self.compile_expr(value)?;
                self.compile_expr(callee)?;
                self.compile_expr(index)?;
                self.emit_op(OpCode::Set);
                Ok(())
            }
            Expr::SetProperty {
                callee,
                name,
                value,
            } => {
                self.compile_expr(value)?;
                self.compile_expr(callee)?;
                let constant = self.identifier_constant(name)?;
                if constant <= SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::SetProperty, constant as u8);
                } else {
                    self.emit_op_u16(OpCode::SetPropertyLong, constant);
                }
                Ok(())
            }
            Expr::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let then_jump = self.emit_jump(OpCode::JumpIfFalsePop);
                self.compile_expr(then_branch)?;
                let else_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(then_jump)?;
                if let Some(else_branch) = else_branch {
                    self.compile_expr(else_branch)?;
                }
                self.patch_jump(else_jump)?;
                Ok(())
            }
            Expr::Binary {
                op,
                left,
                right,
                line,
            } => self.compile_binary(*op, left, right, *line),
            Expr::Unary { op, operand, line } => {
                self.update_line(*line);
                self.compile_expr(operand)?;
                self.emit_op(match op {
                    UnaryOp::Negate => OpCode::Negate,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::BitNot => OpCode::BinNot,
                });
                Ok(())
            }
            Expr::Increment {
                positive,
                prefix,
                target,
                line,
            } => self.compile_increment(*positive, *prefix, target, *line),
            Expr::ArrayLiteral { elements, line } => {
                self.update_line(*line);
                if elements.len() > u8::MAX as usize {
                    return Err(self.system_error("Too many elements in array literal."));
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit_op_u8(OpCode::CreateArray, elements.len() as u8);
                Ok(())
            }
            Expr::Call { callee, args, line } => self.compile_call(callee, args, *line),
            Expr::Index {
                callee,
                index,
                line,
            } => {
                self.update_line(*line);
                self.compile_expr(callee)?;
                self.compile_expr(index)?;
                self.emit_op(OpCode::Get);
                Ok(())
            }
            Expr::Property { callee, name } => {
                self.compile_expr(callee)?;
                let constant = self.identifier_constant(name)?;
                if constant <= SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::GetProperty, constant as u8);
                } else {
                    self.emit_op_u16(OpCode::GetPropertyLong, constant);
                }
                Ok(())
            }
            Expr::StructLiteral { fields, line } => {
                self.update_line(*line);
                if fields.len() > u8::MAX as usize {
                    return Err(self.system_error("Too many fields in struct literal."));
                }
                let mut constants: Vec<u16> = Vec::with_capacity(fields.len());
                let mut is_long = false;
                for (name, value) in fields {
                    self.compile_expr(value)?;
                    let constant = self.identifier_constant(name)?;
                    if constant > SHORT_CONSTANT_LIMIT {
                        is_long = true;
                    }
                    constants.push(constant);
                }
                // Field names are emitted in reverse: the VM pops the values
                // back off in reverse push order.
                if is_long {
                    self.emit_op_u8(OpCode::CreateStructLong, constants.len() as u8);
                    for &constant in constants.iter().rev() {
                        self.emit_u16(constant);
                    }
                } else {
                    self.emit_op_u8(OpCode::CreateStruct, constants.len() as u8);
                    for &constant in constants.iter().rev() {
                        self.emit_byte(constant as u8);
                    }
                }
                Ok(())
            }
            Expr::Super { method } => {
                let constant = self.identifier_constant(method)?;
                let superclass = self.require_superclass(method)?;
                self.named_var(&Token::synthetic("this"), false)?;
                self.emit_constant(Value::obj(superclass as *mut ()))?;
                if constant <= SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::GetSuper, constant as u8);
                } else {
                    self.emit_op_u16(OpCode::GetSuperLong, constant);
                }
                Ok(())
            }
            Expr::Lambda { params, body, line } => {
                self.update_line(*line);
                let (func, upvalues) =
                    self.compile_function(FuncKind::Function, "anonymous", params, body)?;
                // SAFETY: see end_func.
                let upvalue_count = unsafe { (*func).upvalue_count };
                if upvalue_count == 0 {
                    // Nothing to capture: the finished closure is a constant.
                    let closure = self.heap.alloc_closure(func);
                    return self.emit_constant(Value::obj(closure as *mut ()));
                }
                let constant = self.make_constant(Value::obj(func as *mut ()))?;
                if constant <= SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::Closure, constant as u8);
                } else {
                    self.emit_op_u16(OpCode::ClosureLong, constant);
                }
                for upvalue in upvalues {
                    self.emit_byte(u8::from(upvalue.is_local));
                    self.emit_byte(upvalue.index);
                }
                Ok(())
            }
            Expr::ModuleAccess { module, name } => {
                let index = self.resolve_module_variable(module, name)?;
                if index <= SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::GetGlobal, index as u8);
                } else {
                    self.emit_op_u16(OpCode::GetGlobalLong, index);
                }
                Ok(())
            }
            Expr::Async { callee, args, line } => {
                self.update_line(*line);
                if args.len() > u8::MAX as usize {
                    return Err(self.system_error("Too many arguments."));
                }
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_op_u8(OpCode::LaunchAsync, args.len() as u8);
                Ok(())
            }
            Expr::Await { expr, line } => {
                self.update_line(*line);
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Await);
                Ok(())
            }
        }
    }

    fn require_superclass(&self, token: &Token) -> CResult<*mut ObjClass> {
        let Some(ctx) = &self.class_ctx else {
            return Err(self.error_at(token, "Can't use 'super' outside of a class."));
        };
        if ctx.superclass.is_null() {
            return Err(self.error_at(token, "Can't use 'super' in a class with no superclass."));
        }
        Ok(ctx.superclass)
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, line: u32) -> CResult<()> {
        self.update_line(line);
        self.compile_expr(left)?;
        match op {
            BinaryOp::Or => {
                // Truthy left short-circuits as the whole expression.
                let jump = self.emit_jump(OpCode::JumpIfTrue);
                self.emit_op(OpCode::Pop);
                self.compile_expr(right)?;
                self.patch_jump(jump)?;
                return Ok(());
            }
            BinaryOp::And => {
                let jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);
                self.compile_expr(right)?;
                self.patch_jump(jump)?;
                return Ok(());
            }
            _ => {}
        }
        self.compile_expr(right)?;
        self.emit_op(match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Subtract => OpCode::Subtract,
            BinaryOp::Multiply => OpCode::Multiply,
            BinaryOp::Divide => OpCode::Divide,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::ShiftLeft => OpCode::BitshiftLeft,
            BinaryOp::ShiftRight => OpCode::BitshiftRight,
            BinaryOp::BitAnd => OpCode::BitwiseAnd,
            BinaryOp::BitOr => OpCode::BitwiseOr,
            BinaryOp::BitXor => OpCode::BitwiseXor,
            BinaryOp::Equal => OpCode::Equal,
            BinaryOp::NotEqual => OpCode::NotEqual,
            BinaryOp::Greater => OpCode::Greater,
            BinaryOp::GreaterEqual => OpCode::GreaterEqual,
            BinaryOp::Less => OpCode::Less,
            BinaryOp::LessEqual => OpCode::LessEqual,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        });
        Ok(())
    }

    /// Fused increment/decrement. The operand byte packs
    /// `(kind << 2) | (prefix << 1) | positive`; the kind selects how the
    /// place is addressed and what operand follows.
    fn compile_increment(
        &mut self,
        positive: bool,
        prefix: bool,
        target: &Expr,
        line: u32,
    ) -> CResult<()> {
        self.update_line(line);
        // (kind, operand, wide)
        let (kind, operand): (u8, Option<u16>) = match target {
            Expr::Ident(token) => {
                self.update_line(token.line);
                if let Some(slot) = self.resolve_local(token)? {
                    (0, Some(slot as u16))
                } else if let Some(slot) = self.resolve_upvalue(token)? {
                    (1, Some(slot as u16))
                } else {
                    match self.resolve_global(token, false)? {
                        GlobalRes::Index(index) => {
                            if index > SHORT_CONSTANT_LIMIT {
                                (3, Some(index))
                            } else {
                                (2, Some(index))
                            }
                        }
                        GlobalRes::NotFound => {
                            return Err(self.error_at(
                                token,
                                format!("Variable '{}' isn't declared.", token.name),
                            ));
                        }
                    }
                }
            }
            Expr::Property { callee, name } => {
                self.compile_expr(callee)?;
                let constant = self.identifier_constant(name)?;
                if constant > SHORT_CONSTANT_LIMIT {
                    (5, Some(constant))
                } else {
                    (4, Some(constant))
                }
            }
            Expr::Index {
                callee,
                index,
                line,
            } => {
                self.update_line(*line);
                self.compile_expr(callee)?;
                self.compile_expr(index)?;
                (6, None)
            }
            _ => {
                return Err(self.system_error(format!(
                    "Left side is not incrementable (line {}).",
                    line + 1
                )))
            }
        };

        let args = u8::from(positive) | (u8::from(prefix) << 1) | (kind << 2);
        self.emit_op_u8(OpCode::Increment, args);
        if let Some(operand) = operand {
            // Kinds 3 and 5 take the wide operand.
            if kind == 3 || kind == 5 {
                self.emit_u16(operand);
            } else {
                self.emit_byte(operand as u8);
            }
        }
        Ok(())
    }

    /// Calls, with the fused paths: `receiver.name(args)` becomes `INVOKE`
    /// and `super.name(args)` becomes `SUPER_INVOKE`.
    fn compile_call(&mut self, callee: &Expr, args: &[Expr], line: u32) -> CResult<()> {
        self.update_line(line);
        if args.len() > u8::MAX as usize {
            return Err(self.system_error("Too many arguments."));
        }
        match callee {
            Expr::Property {
                callee: receiver,
                name,
            } => {
                self.compile_expr(receiver)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let constant = self.identifier_constant(name)?;
                if constant > SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::InvokeLong, args.len() as u8);
                    self.emit_u16(constant);
                } else {
                    self.emit_op_u8(OpCode::Invoke, args.len() as u8);
                    self.emit_byte(constant as u8);
                }
                Ok(())
            }
            Expr::Super { method } => {
                let constant = self.identifier_constant(method)?;
                let superclass = self.require_superclass(method)?;
                self.named_var(&Token::synthetic("this"), false)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_constant(Value::obj(superclass as *mut ()))?;
                if constant > SHORT_CONSTANT_LIMIT {
                    self.emit_op_u8(OpCode::SuperInvokeLong, args.len() as u8);
                    self.emit_u16(constant);
                } else {
                    self.emit_op_u8(OpCode::SuperInvoke, args.len() as u8);
                    self.emit_byte(constant as u8);
                }
                Ok(())
            }
            _ => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_op_u8(OpCode::Call, args.len() as u8);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast;

    fn compile_single(stmts: Vec<Stmt>) -> Result<CompilerOutput, Vec<CompileError>> {
        let heap = Box::leak(Box::new(GcHeap::new()));
        let natives = Box::leak(Box::new(NativeRegistry::new()));
        let module = ast::Module::script("test.vsp", stmts);
        Compiler::compile(&[module], heap, natives)
    }

    fn num(value: f64) -> Expr {
        Expr::Number { value, line: 0 }
    }

    #[test]
    fn small_int_literal_uses_load_int() {
        let output = compile_single(vec![Stmt::Expr(num(7.0))]).unwrap();
        assert_eq!(output.code.bytecode[0], OpCode::LoadInt.as_byte());
        assert_eq!(output.code.bytecode[1], 7);
        assert_eq!(output.code.bytecode[2], OpCode::Pop.as_byte());
    }

    #[test]
    fn large_literal_uses_constant_pool() {
        let output = compile_single(vec![Stmt::Expr(num(300.0))]).unwrap();
        assert_eq!(output.code.bytecode[0], OpCode::Constant.as_byte());
        assert!(object::equals(output.code.constants[0], Value::int(300)));
    }

    #[test]
    fn global_var_decl_emits_set_global() {
        let output = compile_single(vec![Stmt::Var {
            name: Token::new("x", 0),
            initializer: Some(num(1.0)),
        }])
        .unwrap();
        assert_eq!(output.globals.len(), 1);
        assert_eq!(output.globals[0].name, "x");
        let bytecode = &output.code.bytecode;
        assert!(bytecode
            .windows(2)
            .any(|w| w[0] == OpCode::SetGlobal.as_byte() && w[1] == 0));
    }

    #[test]
    fn use_before_definition_is_an_error() {
        // let x = x;
        let errs = compile_single(vec![Stmt::Var {
            name: Token::new("x", 0),
            initializer: Some(Expr::Ident(Token::new("x", 0))),
        }])
        .unwrap_err();
        assert!(errs[0].message.contains("before it's initialized"));
    }

    #[test]
    fn undeclared_variable_is_an_error() {
        let errs = compile_single(vec![Stmt::Expr(Expr::Ident(Token::new("ghost", 3)))])
            .unwrap_err();
        assert!(errs[0].message.contains("doesn't match any declared variable"));
    }

    #[test]
    fn shadowing_in_same_scope_is_an_error() {
        let errs = compile_single(vec![Stmt::Block(vec![
            Stmt::Var {
                name: Token::new("a", 0),
                initializer: None,
            },
            Stmt::Var {
                name: Token::new("a", 1),
                initializer: None,
            },
        ])])
        .unwrap_err();
        assert!(errs[0].message.contains("Already a variable"));
    }

    #[test]
    fn global_function_is_materialized_at_compile_time() {
        let output = compile_single(vec![Stmt::Func {
            name: Token::new("f", 0),
            params: vec![],
            body: vec![],
        }])
        .unwrap();
        assert!(object::is_obj_kind(
            output.globals[0].value,
            ObjKind::Closure
        ));
    }

    #[test]
    fn class_is_materialized_with_copied_methods() {
        let make_method = |name: &str| MethodDecl {
            name: Token::new(name, 0),
            params: vec![],
            body: vec![],
        };
        let output = compile_single(vec![
            Stmt::Class {
                name: Token::new("A", 0),
                superclass: None,
                methods: vec![make_method("greet")],
            },
            Stmt::Class {
                name: Token::new("B", 1),
                superclass: Some(SuperclassRef::Name(Token::new("A", 1))),
                methods: vec![make_method("other")],
            },
        ])
        .unwrap();
        assert!(object::is_obj_kind(output.globals[1].value, ObjKind::Class));
        // SAFETY: just checked the kind.
        let class_b = unsafe { object::as_class(output.globals[1].value) };
        let methods = unsafe { &(*class_b).methods };
        assert!(methods.contains_key("greet"), "inherited method missing");
        assert!(methods.contains_key("other"));
    }

    #[test]
    fn compiler_reports_multiple_errors() {
        let errs = compile_single(vec![
            Stmt::Expr(Expr::Ident(Token::new("a", 0))),
            Stmt::Expr(Expr::Ident(Token::new("b", 1))),
        ])
        .unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn duplicate_import_alias_is_an_error() {
        let heap = Box::leak(Box::new(GcHeap::new()));
        let natives = Box::leak(Box::new(NativeRegistry::new()));
        let dep = ast::Module::script("dep.vsp", vec![]);
        let mut main = ast::Module::script("main.vsp", vec![]);
        main.deps = vec![
            Dependency {
                module: "dep.vsp".to_string(),
                alias: Some(Token::new("d", 0)),
            },
            Dependency {
                module: "dep.vsp".to_string(),
                alias: Some(Token::new("d", 1)),
            },
        ];
        let errs = Compiler::compile(&[dep, main], heap, natives).unwrap_err();
        assert!(errs[0].message.contains("share the alias"));
    }
}
