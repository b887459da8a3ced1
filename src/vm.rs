//! Stack-based Virtual Machine for Ferrule
//!
//! Executes a compiled `Program` one coroutine at a time. The running
//! coroutine is taken out of the scheduler for the duration of its slice
//! and handed to every instruction explicitly, so the collector can always
//! see it as a root. Collection only happens inside `alloc`: instructions
//! that allocate keep their inputs on the operand stack until the new
//! object exists.

use crate::ast::Qualifier;
use crate::bytecode::{Chunk, OpCode};
use crate::config::{parse_option, EngineConfig, OptionKind, OptionValue};
use crate::coroutine::{Coroutine, CoroutineState, Frame, ReturnMode};
use crate::error::{ErrorKind, FerruleError, Result};
use crate::gc::{Callable, CollectStats, ErrorValue, Heap, Object};
use crate::host::{HostCall, HostResult, HostTable, Pinned};
use crate::persist::{self, PersistStore, Persisted};
use crate::program::Program;
use crate::scheduler::{Completion, Scheduler};
use crate::token::Span;
use crate::types::{Type, TypeId};
use crate::value::{Slot, Value};
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

/// How a coroutine's slice ended
enum Flow {
    Continue,
    Suspend,
    Finish,
}

fn runtime(kind: ErrorKind) -> FerruleError {
    FerruleError::new(kind, None)
}

fn null_dereference() -> FerruleError {
    runtime(ErrorKind::NullDereference)
}

fn checked_index(index: i64, len: usize) -> Result<usize> {
    if index < 0 || index as usize >= len {
        return Err(runtime(ErrorKind::IndexOutOfBounds(index, len)));
    }
    Ok(index as usize)
}

fn read_u8(chunk: &Chunk, co: &mut Coroutine) -> u8 {
    let value = chunk.read_u8(co.ip);
    co.ip += 1;
    value
}

fn read_u32(chunk: &Chunk, co: &mut Coroutine) -> u32 {
    let value = chunk.read_u32(co.ip);
    co.ip += 4;
    value
}

fn read_i32(chunk: &Chunk, co: &mut Coroutine) -> i32 {
    let value = chunk.read_i32(co.ip);
    co.ip += 4;
    value
}

fn read_i64(chunk: &Chunk, co: &mut Coroutine) -> i64 {
    let value = chunk.read_i64(co.ip);
    co.ip += 8;
    value
}

fn read_f64(chunk: &Chunk, co: &mut Coroutine) -> f64 {
    let value = chunk.read_f64(co.ip);
    co.ip += 8;
    value
}

fn jump(co: &mut Coroutine, offset: i32) {
    co.ip = (co.ip as i64 + offset as i64) as usize;
}

fn int_binary(co: &mut Coroutine, op: impl FnOnce(i64, i64) -> Result<i64>) -> Result<()> {
    let b = co.pop()?.as_int();
    let a = co.pop()?.as_int();
    co.push(Slot::int(op(a, b)?));
    Ok(())
}

fn float_binary(co: &mut Coroutine, op: impl FnOnce(f64, f64) -> f64) -> Result<()> {
    let b = co.pop()?.as_float();
    let a = co.pop()?.as_float();
    co.push(Slot::float(op(a, b)));
    Ok(())
}

fn compare(co: &mut Coroutine, op: impl FnOnce(Slot, Slot) -> bool) -> Result<()> {
    let b = co.pop()?;
    let a = co.pop()?;
    co.push(Slot::bool(op(a, b)));
    Ok(())
}

/// The Virtual Machine
pub struct Vm {
    program: Rc<Program>,
    host: Rc<HostTable>,
    config: EngineConfig,
    heap: Heap,
    globals: Vec<Slot>,
    scheduler: Scheduler,
    persist: PersistStore,
    /// Coroutine whose return value is the current phase's result
    main: Option<u32>,
    main_result: Option<Slot>,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(program: Program, host: Rc<HostTable>, config: EngineConfig) -> Result<Self> {
        let main_path = program.modules.get(program.main as usize).map(|m| m.path.clone()).unwrap_or_default();
        let persist = PersistStore::new(config.persist_path_for(Path::new(&main_path)));
        let mut vm = Self {
            heap: Heap::new(config.initial_heap, config.max_heap),
            globals: vec![Slot::NULL; program.globals.len()],
            program: Rc::new(program),
            host,
            config,
            scheduler: Scheduler::new(),
            persist,
            main: None,
            main_result: None,
            out: Box::new(std::io::stdout()),
        };

        // Strings default to "" rather than null
        for index in 0..vm.globals.len() {
            if vm.program.globals[index].ty == TypeId::STRING {
                vm.globals[index] = vm.alloc(None, Object::Str("".into()))?;
            }
        }
        Ok(vm)
    }

    /// Redirect script output (host `Print` and friends)
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Run startup and the start function; returns the start function's value
    pub fn run(&mut self) -> Result<Value> {
        self.check_options()?;
        let program = Rc::clone(&self.program);
        for init in &program.inits {
            self.run_phase(init.globals)?;
            self.apply_options(init.module)?;
            if let Some(function) = init.init {
                self.run_phase(function)?;
            }
        }

        tracing::debug!(start = %program.functions[program.start as usize].name, "running start function");
        match self.run_phase(program.start)? {
            Some(slot) => self.value_of(slot, program.result_type()),
            None => Ok(Value::Void),
        }
    }

    /// Current value of the first global called `name`
    pub fn global(&self, name: &str) -> Result<Option<Value>> {
        match self.program.globals.iter().position(|g| g.name == name) {
            Some(index) => Ok(Some(self.value_of(self.globals[index], self.program.globals[index].ty)?)),
            None => Ok(None),
        }
    }

    /// Force a collection cycle
    /// Drop a pin a host callback took; the entry is collectable again
    pub fn release(&mut self, pinned: Pinned) -> Result<()> {
        self.heap.unpin(pinned.entry())
    }

    pub fn collect_garbage(&mut self) -> CollectStats {
        self.heap.collect(self.globals.iter().chain(self.scheduler.slots()).chain(self.main_result.iter()))
    }

    // ==================== Scheduling ====================

    /// Run `function` as a fresh coroutine until no coroutine can make progress
    fn run_phase(&mut self, function: u32) -> Result<Option<Slot>> {
        let id = self.scheduler.next_id();
        let coroutine = Coroutine::new(id, &self.program, function, Vec::new(), Vec::new())?;
        self.scheduler.spawn(coroutine);
        self.main = Some(id);
        self.main_result = None;
        self.run_until_idle()?;
        self.main = None;
        Ok(self.main_result.take())
    }

    fn run_until_idle(&mut self) -> Result<()> {
        loop {
            for completion in self.scheduler.completed(false) {
                self.complete_host_call(completion)?;
            }
            if let Some(coroutine) = self.scheduler.take_ready() {
                self.resume(coroutine)?;
                continue;
            }
            if self.scheduler.pending_host() > 0 {
                for completion in self.scheduler.completed(true) {
                    self.complete_host_call(completion)?;
                }
                continue;
            }
            if self.scheduler.is_empty() {
                return Ok(());
            }

            let report = self.scheduler.blocked_report();
            let traces = self.scheduler.iter().map(|co| co.trace(&self.program)).collect();
            self.scheduler.clear();
            return Err(runtime(ErrorKind::Deadlock(report)).with_backtrace(traces));
        }
    }

    fn resume(&mut self, mut co: Coroutine) -> Result<()> {
        tracing::trace!(id = co.id, from = %co.state, "resuming coroutine");
        co.state = CoroutineState::Running;
        match self.execute(&mut co) {
            Ok(Flow::Finish) => {
                if self.main == Some(co.id) {
                    self.main_result = co.result;
                }
                self.scheduler.finish(co);
                Ok(())
            }
            Ok(Flow::Suspend) | Ok(Flow::Continue) => {
                self.scheduler.park(co);
                Ok(())
            }
            Err(err) => {
                let err = self.locate(err, &co);
                self.scheduler.clear();
                Err(err)
            }
        }
    }

    /// Attach the failing instruction's source line and every coroutine's backtrace
    fn locate(&self, mut err: FerruleError, current: &Coroutine) -> FerruleError {
        let (module, offset) = current.position();
        if let Some(info) = self.program.modules.get(module as usize) {
            if err.span.is_none() {
                err.span = info.chunk.line_at(offset).map(|entry| Span::new(module, entry.line, entry.column));
            }
            err = err.with_source(&info.path, &info.source);
        }
        let mut traces = vec![current.trace(&self.program)];
        traces.extend(self.scheduler.iter().map(|co| co.trace(&self.program)));
        tracing::debug!(error = %err.kind, coroutines = traces.len(), "runtime error");
        err.with_backtrace(traces)
    }

    fn spawn(&mut self, function: u32, args: Vec<Slot>, modes: Vec<ReturnMode>) -> Result<u32> {
        let id = self.scheduler.next_id();
        let coroutine = Coroutine::new(id, &self.program, function, args, modes)?;
        self.scheduler.spawn(coroutine);
        Ok(id)
    }

    fn complete_host_call(&mut self, completion: Completion) -> Result<()> {
        let Completion { coroutine: id, host, outcome } = completion;
        tracing::debug!(coroutine = id, "async host job completed");
        let result = match outcome {
            Ok(result) => result,
            Err(message) => {
                let err = runtime(ErrorKind::HostFailure(self.host_name(host), message));
                let err = match self.scheduler.take(id) {
                    Some(co) => self.locate(err, &co),
                    None => err,
                };
                self.scheduler.clear();
                return Err(err);
            }
        };
        let slot = self.host_slot(None, result)?;
        let coroutine = self
            .scheduler
            .resume_after_host(id)
            .ok_or_else(|| FerruleError::defect(format!("host completion for coroutine #{} which is not waiting", id)))?;
        if let Some(slot) = slot {
            coroutine.push(slot);
        }
        Ok(())
    }

    // ==================== Startup ====================

    fn check_options(&self) -> Result<()> {
        for (name, _) in &self.config.options {
            let declared = self.program.globals.iter().any(|g| g.qualifier == Qualifier::Option && &g.name == name);
            if !declared {
                return Err(runtime(ErrorKind::InvalidOption(format!("no option named '{}'", name))));
            }
        }
        Ok(())
    }

    /// Bind command-line values to the `option` globals `module` declares
    fn apply_options(&mut self, module: u32) -> Result<()> {
        let program = Rc::clone(&self.program);
        let options = self.config.options.clone();
        for (index, global) in program.globals.iter().enumerate() {
            if global.module != module || global.qualifier != Qualifier::Option {
                continue;
            }
            for (name, text) in options.iter().filter(|(name, _)| *name == global.name) {
                let kind = match global.ty {
                    TypeId::INT => OptionKind::Int,
                    TypeId::BOOL => OptionKind::Bool,
                    TypeId::STRING => OptionKind::Str,
                    ty => {
                        return Err(runtime(ErrorKind::InvalidOption(format!(
                            "'{}' has type {}",
                            name,
                            program.types.name(ty)
                        ))))
                    }
                };
                self.globals[index] = match parse_option(name, kind, text)? {
                    OptionValue::Int(n) => Slot::int(n),
                    OptionValue::Bool(b) => Slot::bool(b),
                    OptionValue::Str(s) => self.alloc(None, Object::Str(s.into()))?,
                };
                tracing::debug!(name = %name, value = %text, "bound option");
            }
        }
        Ok(())
    }

    // ==================== Persisted globals ====================

    /// On first access, overwrite persisted globals with the values on file
    fn load_persisted(&mut self, co: &Coroutine) -> Result<()> {
        if self.persist.is_loaded() {
            return Ok(());
        }
        self.persist.load()?;
        let program = Rc::clone(&self.program);
        for (index, global) in program.globals.iter().enumerate() {
            if global.qualifier != Qualifier::Persist {
                continue;
            }
            let Some(payload) = self.persist.get(&global.name)?.map(<[u8]>::to_vec) else { continue };
            let corrupt = || runtime(ErrorKind::Io(format!("persisted value for '{}' is corrupt", global.name)));
            self.globals[index] = match global.ty {
                TypeId::INT => Slot::int(persist::decode_int(&payload).ok_or_else(corrupt)?),
                TypeId::FLOAT => Slot::float(persist::decode_float(&payload).ok_or_else(corrupt)?),
                TypeId::BOOL => Slot::bool(persist::decode_bool(&payload).ok_or_else(corrupt)?),
                TypeId::STRING => {
                    let text = persist::decode_string(&payload).ok_or_else(corrupt)?;
                    self.alloc(Some(co), Object::Str(text.into()))?
                }
                _ => return Err(FerruleError::defect(format!("'{}' cannot be persisted", global.name))),
            };
        }
        Ok(())
    }

    fn save_persisted(&mut self, index: u32) -> Result<()> {
        let global = self
            .program
            .globals
            .get(index as usize)
            .ok_or_else(|| FerruleError::defect(format!("no global {}", index)))?;
        let slot = self.globals[index as usize];
        let value = match global.ty {
            TypeId::INT => Persisted::Int(slot.as_int()),
            TypeId::FLOAT => Persisted::Float(slot.as_float()),
            TypeId::BOOL => Persisted::Bool(slot.as_bool()),
            TypeId::STRING => match slot.heap_index() {
                Some(entry) => Persisted::Str(self.heap.read_string(entry)?),
                None => Persisted::Str(String::new()),
            },
            _ => return Err(FerruleError::defect(format!("'{}' cannot be persisted", global.name))),
        };
        let name = global.name.clone();
        self.persist.set(&name, &value)
    }

    fn global_slot(&self, index: u32) -> Result<Slot> {
        self.globals.get(index as usize).copied().ok_or_else(|| FerruleError::defect(format!("no global {}", index)))
    }

    fn set_global(&mut self, index: u32, value: Slot) -> Result<()> {
        let slot = self
            .globals
            .get_mut(index as usize)
            .ok_or_else(|| FerruleError::defect(format!("no global {}", index)))?;
        *slot = value;
        Ok(())
    }

    // ==================== Allocation ====================

    /// Allocate `object`, collecting first when the heap is full. Roots are
    /// the globals, every parked coroutine, `current` and the phase result.
    fn alloc(&mut self, current: Option<&Coroutine>, object: Object) -> Result<Slot> {
        if self.heap.is_full() {
            let stats = self.heap.collect(
                self.globals
                    .iter()
                    .chain(self.scheduler.slots())
                    .chain(current.into_iter().flat_map(|co| co.slots()))
                    .chain(self.main_result.iter()),
            );
            if stats.freed() < stats.capacity / 5 {
                if let Err(err) = self.heap.grow() {
                    if self.heap.is_full() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(Slot::Managed(self.heap.insert(object)?))
    }

    fn alloc_in(&mut self, co: &Coroutine, object: Object) -> Result<Slot> {
        self.alloc(Some(co), object)
    }

    fn alloc_string(&mut self, co: &Coroutine, text: &str) -> Result<Slot> {
        self.alloc(Some(co), Object::Str(text.into()))
    }

    /// Copy a host value onto the heap
    fn alloc_value(&mut self, current: Option<&Coroutine>, value: &Value) -> Result<Slot> {
        match value {
            Value::Void | Value::Null => Ok(Slot::NULL),
            Value::Int(n) => Ok(Slot::int(*n)),
            Value::Float(n) => Ok(Slot::float(*n)),
            Value::Bool(b) => Ok(Slot::bool(*b)),
            Value::Nominal { value, .. } => Ok(Slot::int(*value)),
            Value::Str(text) => self.alloc(current, Object::Str(text.as_str().into())),
            Value::List(items) => {
                let slots = self.alloc_children(current, items.iter())?;
                let slot = self.alloc(current, Object::List(slots.clone()));
                self.unpin_all(&slots)?;
                slot
            }
            Value::Tuple(items) => {
                let slots = self.alloc_children(current, items.iter())?;
                let slot = self.alloc(current, Object::Struct(slots.clone()));
                self.unpin_all(&slots)?;
                slot
            }
            Value::Struct { fields, .. } => {
                let slots = self.alloc_children(current, fields.iter().map(|(_, v)| v))?;
                let slot = self.alloc(current, Object::Struct(slots.clone()));
                self.unpin_all(&slots)?;
                slot
            }
            Value::Error(Ok(inner)) => {
                let slots = self.alloc_children(current, std::iter::once(inner.as_ref()))?;
                let slot = self.alloc(current, Object::Error(ErrorValue::Success(slots[0])));
                self.unpin_all(&slots)?;
                slot
            }
            Value::Error(Err(message)) => self.alloc(current, Object::Error(ErrorValue::Failure(message.clone()))),
            Value::Func(_) | Value::Any(_) => {
                Err(FerruleError::defect(format!("a host value of type {} cannot be allocated", value.type_name())))
            }
        }
    }

    /// Allocate each child and pin it until its parent exists
    fn alloc_children<'v>(
        &mut self,
        current: Option<&Coroutine>,
        children: impl Iterator<Item = &'v Value>,
    ) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();
        for child in children {
            let slot = self.alloc_value(current, child)?;
            if let Some(index) = slot.heap_index() {
                self.heap.pin(index)?;
            }
            slots.push(slot);
        }
        Ok(slots)
    }

    fn unpin_all(&mut self, slots: &[Slot]) -> Result<()> {
        for index in slots.iter().filter_map(|s| s.heap_index()) {
            self.heap.unpin(index)?;
        }
        Ok(())
    }

    /// Turn a host result into the slot the call leaves on the stack
    fn host_slot(&mut self, current: Option<&Coroutine>, result: HostResult) -> Result<Option<Slot>> {
        match result {
            HostResult::Unit => Ok(None),
            HostResult::Scalar(bits) => Ok(Some(Slot::Scalar(bits))),
            HostResult::Managed(value) => self.alloc_value(current, &value).map(Some),
            HostResult::Entry(entry) if self.heap.is_live(entry) => Ok(Some(Slot::Managed(entry))),
            HostResult::Entry(entry) => Err(FerruleError::defect(format!("host returned dead heap entry {}", entry))),
            HostResult::Success(inner) => {
                let payload = self.host_slot(current, *inner)?.unwrap_or(Slot::NULL);
                if let Some(index) = payload.heap_index() {
                    self.heap.pin(index)?;
                }
                let slot = self.alloc(current, Object::Error(ErrorValue::Success(payload)));
                if let Some(index) = payload.heap_index() {
                    self.heap.unpin(index)?;
                }
                slot.map(Some)
            }
            HostResult::Failure(message) => self.alloc(current, Object::Error(ErrorValue::Failure(message))).map(Some),
            HostResult::Async(_) => Err(FerruleError::defect("an asynchronous host job returned another job")),
        }
    }

    // ==================== Values ====================

    /// Host-facing copy of `slot`, read as a value of type `ty`
    pub fn value_of(&self, slot: Slot, ty: TypeId) -> Result<Value> {
        self.describe(slot, ty, &mut Vec::new())
    }

    fn describe(&self, slot: Slot, ty: TypeId, path: &mut Vec<u32>) -> Result<Value> {
        let types = &self.program.types;
        let kind = types.get(ty).clone();
        match kind {
            Type::Int => return Ok(Value::Int(slot.as_int())),
            Type::Float => return Ok(Value::Float(slot.as_float())),
            Type::Bool => return Ok(Value::Bool(slot.as_bool())),
            Type::Void => return Ok(Value::Void),
            Type::IntType(_) | Type::Handle(_) => return Ok(Value::Nominal { name: types.name(ty), value: slot.as_int() }),
            _ => {}
        }

        // Reference types; cycles print as null
        let Some(index) = slot.heap_index() else { return Ok(Value::Null) };
        if path.contains(&index) {
            return Ok(Value::Null);
        }
        path.push(index);
        let value = self.describe_object(index, ty, kind, path);
        path.pop();
        value
    }

    fn describe_object(&self, index: u32, ty: TypeId, kind: Type, path: &mut Vec<u32>) -> Result<Value> {
        let object = self.heap.get(index)?;
        let mismatch = || FerruleError::defect(format!("heap entry {} is not a {}", index, self.program.types.name(ty)));
        Ok(match (kind, object) {
            (Type::Str, Object::Str(_) | Object::Concat { .. }) => Value::Str(self.heap.read_string(index)?),
            (Type::List(element), Object::List(items)) => {
                Value::List(items.iter().map(|&item| self.describe(item, element, path)).collect::<Result<_>>()?)
            }
            (Type::Tuple(types), Object::Struct(items)) => Value::Tuple(
                items.iter().zip(types).map(|(&item, ty)| self.describe(item, ty, path)).collect::<Result<_>>()?,
            ),
            (Type::Struct(_), Object::Struct(items)) => {
                let info = self.program.types.struct_info(ty).ok_or_else(mismatch)?;
                let mut fields = Vec::with_capacity(items.len());
                for ((name, field_ty), &item) in info.fields.iter().zip(items) {
                    fields.push((name.clone(), self.describe(item, *field_ty, path)?));
                }
                Value::Struct { name: info.name.clone(), fields }
            }
            (Type::Error(payload), Object::Error(ErrorValue::Success(value))) => {
                Value::Error(Ok(Box::new(self.describe(*value, payload, path)?)))
            }
            (Type::Error(_), Object::Error(ErrorValue::Failure(message))) => Value::Error(Err(message.clone())),
            (Type::Any, Object::Boxed { type_id, value }) => {
                Value::Any(Box::new(self.describe(*value, TypeId(*type_id), path)?))
            }
            (Type::Func { .. }, Object::Func(_)) => Value::Func(self.function_name(index)?),
            _ => return Err(mismatch()),
        })
    }

    /// Name of the function a callable ultimately invokes
    fn function_name(&self, mut index: u32) -> Result<String> {
        loop {
            match self.heap.get(index)? {
                Object::Func(Callable::Plain(function)) => {
                    return Ok(self.program.function(*function).map_or_else(|| format!("#{}", function), |f| f.name.clone()))
                }
                Object::Func(Callable::Curried { func, .. }) => index = *func,
                Object::Func(Callable::Discard(inner) | Callable::Assert(inner)) => index = *inner,
                other => return Err(FerruleError::defect(format!("expected function, found {:?}", other))),
            }
        }
    }

    // ==================== Execution ====================

    fn execute(&mut self, co: &mut Coroutine) -> Result<Flow> {
        let program = Rc::clone(&self.program);
        loop {
            let start = co.ip;
            match self.step(&program, co) {
                Ok(Flow::Continue) => {
                    if co.operands.len() > self.config.max_operand_stack {
                        co.ip = start + 1;
                        return Err(runtime(ErrorKind::StackOverflow));
                    }
                }
                Ok(flow) => return Ok(flow),
                Err(err) => {
                    // Leave ip inside the failing instruction for the error location
                    co.ip = start + 1;
                    return Err(err);
                }
            }
        }
    }

    fn step(&mut self, program: &Program, co: &mut Coroutine) -> Result<Flow> {
        let chunk = &program
            .modules
            .get(co.module as usize)
            .ok_or_else(|| FerruleError::defect(format!("no module {}", co.module)))?
            .chunk;
        let byte = *chunk.code.get(co.ip).ok_or_else(|| FerruleError::defect("ran off the end of the code"))?;
        let op = OpCode::from_byte(byte).ok_or_else(|| FerruleError::defect(format!("bad opcode {:#04x}", byte)))?;
        co.ip += 1;

        match op {
            OpCode::PushInt => {
                let value = read_i64(chunk, co);
                co.push(Slot::int(value));
            }
            OpCode::PushFloat => {
                let value = read_f64(chunk, co);
                co.push(Slot::float(value));
            }
            OpCode::PushNull => co.push(Slot::NULL),
            OpCode::PushStr => {
                let index = read_u32(chunk, co);
                let text = chunk
                    .strings
                    .get_index(index as usize)
                    .ok_or_else(|| FerruleError::defect(format!("no string constant {}", index)))?;
                let slot = self.alloc_string(co, text)?;
                co.push(slot);
            }
            OpCode::Pop => {
                co.pop()?;
            }
            OpCode::Dup => {
                let top = co.peek(0)?;
                co.push(top);
            }
            OpCode::Dup2 => {
                let (a, b) = (co.peek(1)?, co.peek(0)?);
                co.push(a);
                co.push(b);
            }
            OpCode::Swap => {
                let b = co.pop()?;
                let a = co.pop()?;
                co.push(b);
                co.push(a);
            }
            OpCode::Rot => {
                // [a, b, c] -> [b, c, a]
                let c = co.pop()?;
                let b = co.pop()?;
                let a = co.pop()?;
                co.push(b);
                co.push(c);
                co.push(a);
            }

            OpCode::Reserve => {
                let count = read_u32(chunk, co) as usize;
                co.locals.resize(co.locals.len() + count, Slot::NULL);
            }
            OpCode::Release => {
                let count = read_u32(chunk, co) as usize;
                let base = co.frame()?.local_base;
                let len = co
                    .locals
                    .len()
                    .checked_sub(count)
                    .filter(|&len| len >= base)
                    .ok_or_else(|| FerruleError::defect("released more locals than the frame holds"))?;
                co.locals.truncate(len);
            }
            OpCode::LoadLocal => {
                let slot = read_u32(chunk, co);
                let value = co.local(slot)?;
                co.push(value);
            }
            OpCode::StoreLocal => {
                let slot = read_u32(chunk, co);
                let value = co.pop()?;
                co.set_local(slot, value)?;
            }
            OpCode::LoadGlobal => {
                let index = read_u32(chunk, co);
                co.push(self.global_slot(index)?);
            }
            OpCode::StoreGlobal => {
                let index = read_u32(chunk, co);
                let value = co.pop()?;
                self.set_global(index, value)?;
            }
            OpCode::LoadPersist => {
                let index = read_u32(chunk, co);
                self.load_persisted(co)?;
                co.push(self.global_slot(index)?);
            }
            OpCode::StorePersist => {
                let index = read_u32(chunk, co);
                self.load_persisted(co)?;
                let value = co.pop()?;
                self.set_global(index, value)?;
                self.save_persisted(index)?;
            }

            OpCode::AddI => int_binary(co, |a, b| Ok(a.wrapping_add(b)))?,
            OpCode::SubI => int_binary(co, |a, b| Ok(a.wrapping_sub(b)))?,
            OpCode::MulI => int_binary(co, |a, b| Ok(a.wrapping_mul(b)))?,
            OpCode::DivI => int_binary(co, |a, b| match b {
                0 => Err(runtime(ErrorKind::DivisionByZero)),
                _ => Ok(a.wrapping_div(b)),
            })?,
            OpCode::ModI => int_binary(co, |a, b| match b {
                0 => Err(runtime(ErrorKind::DivisionByZero)),
                _ => Ok(a.wrapping_rem(b)),
            })?,
            OpCode::NegI => {
                let value = co.pop()?.as_int();
                co.push(Slot::int(value.wrapping_neg()));
            }
            OpCode::AddF => float_binary(co, |a, b| a + b)?,
            OpCode::SubF => float_binary(co, |a, b| a - b)?,
            OpCode::MulF => float_binary(co, |a, b| a * b)?,
            OpCode::DivF => float_binary(co, |a, b| a / b)?,
            OpCode::NegF => {
                let value = co.pop()?.as_float();
                co.push(Slot::float(-value));
            }

            OpCode::LtI => compare(co, |a, b| a.as_int() < b.as_int())?,
            OpCode::LeI => compare(co, |a, b| a.as_int() <= b.as_int())?,
            OpCode::LtF => compare(co, |a, b| a.as_float() < b.as_float())?,
            OpCode::LeF => compare(co, |a, b| a.as_float() <= b.as_float())?,
            OpCode::EqI => compare(co, |a, b| a.bits() == b.bits())?,
            OpCode::EqF => compare(co, |a, b| a.as_float() == b.as_float())?,
            OpCode::EqRef => compare(co, |a, b| a == b)?,
            OpCode::LtS | OpCode::LeS | OpCode::EqS => {
                let b = co.pop()?;
                let a = co.pop()?;
                let result = match (a.heap_index(), b.heap_index()) {
                    (Some(x), Some(y)) => {
                        let (x, y) = (self.heap.flatten(x)?, self.heap.flatten(y)?);
                        match op {
                            OpCode::LtS => x < y,
                            OpCode::LeS => x <= y,
                            _ => x == y,
                        }
                    }
                    _ if op == OpCode::EqS => a == b,
                    _ => return Err(null_dereference()),
                };
                co.push(Slot::bool(result));
            }
            OpCode::Not => {
                let value = co.pop()?.as_bool();
                co.push(Slot::bool(!value));
            }
            OpCode::IntToFloat => {
                let value = co.pop()?.as_int();
                co.push(Slot::float(value as f64));
            }
            OpCode::FloatToInt => {
                let value = co.pop()?.as_float();
                co.push(Slot::int(value as i64));
            }

            OpCode::Concat => {
                let (left, right) = (co.peek(1)?, co.peek(0)?);
                let (Some(l), Some(r)) = (left.heap_index(), right.heap_index()) else {
                    return Err(null_dereference());
                };
                let (left_len, right_len) = (self.heap.string_len(l)?, self.heap.string_len(r)?);
                let slot = if right_len == 0 {
                    left
                } else if left_len == 0 {
                    right
                } else {
                    self.alloc_in(co, Object::Concat { left: l, right: r, len: left_len + right_len })?
                };
                co.drop_top(2)?;
                co.push(slot);
            }
            OpCode::ToStrI => {
                let value = co.pop()?.as_int();
                let slot = self.alloc_string(co, &value.to_string())?;
                co.push(slot);
            }
            OpCode::ToStrF => {
                let value = co.pop()?.as_float();
                let slot = self.alloc_string(co, &crate::value::format_float(value))?;
                co.push(slot);
            }
            OpCode::ToStrB => {
                let value = co.pop()?.as_bool();
                let slot = self.alloc_string(co, if value { "true" } else { "false" })?;
                co.push(slot);
            }

            OpCode::Jump => {
                let offset = read_i32(chunk, co);
                jump(co, offset);
            }
            OpCode::JumpIfFalse => {
                let offset = read_i32(chunk, co);
                if !co.pop()?.as_bool() {
                    jump(co, offset);
                }
            }
            OpCode::JumpIfFalseOrPop => {
                let offset = read_i32(chunk, co);
                if co.peek(0)?.as_bool() {
                    co.pop()?;
                } else {
                    jump(co, offset);
                }
            }
            OpCode::JumpIfTrueOrPop => {
                let offset = read_i32(chunk, co);
                if co.peek(0)?.as_bool() {
                    jump(co, offset);
                } else {
                    co.pop()?;
                }
            }

            OpCode::Call => {
                let function = read_u32(chunk, co);
                self.enter(program, co, function, Vec::new())?;
            }
            OpCode::CallHost => {
                let host = read_u32(chunk, co);
                let argc = read_u32(chunk, co) as usize;
                return self.call_host(co, host, argc);
            }
            OpCode::CallPtr => {
                let argc = read_u32(chunk, co) as usize;
                let (function, modes) = self.take_callee(co, argc)?;
                self.enter(program, co, function, modes)?;
            }
            OpCode::Return => {
                let has_value = read_u8(chunk, co) != 0;
                return self.return_from(co, has_value);
            }
            OpCode::Unreachable => {
                return Err(FerruleError::defect("control reached the end of a function that returns a value"));
            }
            OpCode::FuncRef => {
                let function = read_u32(chunk, co);
                let slot = self.alloc_in(co, Object::Func(Callable::Plain(function)))?;
                co.push(slot);
            }
            OpCode::BindFn => {
                let (func, arg) = (co.peek(1)?, co.peek(0)?);
                let func = func.heap_index().ok_or_else(null_dereference)?;
                let slot = self.alloc_in(co, Object::Func(Callable::Curried { func, arg }))?;
                co.drop_top(2)?;
                co.push(slot);
            }
            OpCode::DiscardFn | OpCode::AssertFn => {
                let inner = co.peek(0)?.heap_index().ok_or_else(null_dereference)?;
                let callable = if op == OpCode::DiscardFn { Callable::Discard(inner) } else { Callable::Assert(inner) };
                let slot = self.alloc_in(co, Object::Func(callable))?;
                co.pop()?;
                co.push(slot);
            }

            OpCode::NewStruct => {
                let ty = TypeId(read_u32(chunk, co));
                let info = program
                    .types
                    .struct_info(ty)
                    .ok_or_else(|| FerruleError::defect(format!("{} is not a struct", program.types.name(ty))))?;
                let slot = self.alloc_in(co, Object::Struct(vec![Slot::NULL; info.fields.len()]))?;
                co.push(slot);
                for (field, (_, field_ty)) in info.fields.iter().enumerate() {
                    if *field_ty == TypeId::STRING {
                        let empty = self.alloc_string(co, "")?;
                        self.set_field(slot, field as u32, empty)?;
                    }
                }
            }
            OpCode::MakeTuple | OpCode::MakeList => {
                let count = read_u32(chunk, co) as usize;
                let items = co.top(count)?.to_vec();
                let object = if op == OpCode::MakeList { Object::List(items) } else { Object::Struct(items) };
                let slot = self.alloc_in(co, object)?;
                co.drop_top(count)?;
                co.push(slot);
            }
            OpCode::NewList => {
                let slot = self.alloc_in(co, Object::List(Vec::new()))?;
                co.push(slot);
            }
            OpCode::GetField => {
                let field = read_u32(chunk, co) as usize;
                let object = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                let value = match self.heap.get(object)? {
                    Object::Struct(fields) => fields.get(field).copied(),
                    _ => None,
                }
                .ok_or_else(|| FerruleError::defect(format!("no field {} on heap entry {}", field, object)))?;
                co.push(value);
            }
            OpCode::SetField => {
                let field = read_u32(chunk, co);
                let value = co.pop()?;
                let object = co.pop()?;
                self.set_field(object, field, value)?;
                co.push(value);
            }
            OpCode::GetIndex => {
                let index = co.pop()?.as_int();
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                let item = match self.heap.get(target)? {
                    Object::List(items) => Some(items[checked_index(index, items.len())?]),
                    _ => None,
                };
                let slot = match item {
                    Some(slot) => slot,
                    None => {
                        let text = self.heap.flatten(target)?;
                        let position = checked_index(index, text.chars().count())?;
                        let ch: String = text.chars().skip(position).take(1).collect();
                        self.alloc_string(co, &ch)?
                    }
                };
                co.push(slot);
            }
            OpCode::SetIndex => {
                let value = co.pop()?;
                let index = co.pop()?.as_int();
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                match self.heap.get_mut(target)? {
                    Object::List(items) => {
                        let position = checked_index(index, items.len())?;
                        items[position] = value;
                    }
                    other => return Err(FerruleError::defect(format!("cannot index-assign {:?}", other))),
                }
                co.push(value);
            }
            OpCode::Length => {
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                let len = match self.heap.get(target)? {
                    Object::List(items) => items.len(),
                    _ => self.heap.string_len(target)?,
                };
                co.push(Slot::int(len as i64));
            }
            OpCode::Push => {
                let value = co.pop()?;
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                match self.heap.get_mut(target)? {
                    Object::List(items) => items.push(value),
                    other => return Err(FerruleError::defect(format!("cannot push onto {:?}", other))),
                }
            }

            OpCode::WrapOk => {
                let value = co.peek(0)?;
                let slot = self.alloc_in(co, Object::Error(ErrorValue::Success(value)))?;
                co.pop()?;
                co.push(slot);
            }
            OpCode::WrapFail => {
                let message = match co.pop()?.heap_index() {
                    Some(index) => self.heap.read_string(index)?,
                    None => String::new(),
                };
                let slot = self.alloc_in(co, Object::Error(ErrorValue::Failure(message)))?;
                co.push(slot);
            }
            OpCode::ErrorMessage => {
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                let message = match self.heap.get(target)? {
                    Object::Error(ErrorValue::Failure(message)) => message.clone(),
                    Object::Error(ErrorValue::Success(_)) => String::new(),
                    other => return Err(FerruleError::defect(format!("expected error value, found {:?}", other))),
                };
                let slot = self.alloc_string(co, &message)?;
                co.push(slot);
            }
            OpCode::ErrorUnwrap => {
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                match self.heap.get(target)? {
                    Object::Error(ErrorValue::Success(value)) => {
                        co.push(*value);
                        co.push(Slot::bool(true));
                    }
                    Object::Error(ErrorValue::Failure(_)) => co.push(Slot::bool(false)),
                    other => return Err(FerruleError::defect(format!("expected error value, found {:?}", other))),
                }
            }
            OpCode::Box => {
                let type_id = read_u32(chunk, co);
                let value = co.peek(0)?;
                let slot = self.alloc_in(co, Object::Boxed { type_id, value })?;
                co.pop()?;
                co.push(slot);
            }
            OpCode::Unbox => {
                let wanted = TypeId(read_u32(chunk, co));
                let target = co.pop()?.heap_index().ok_or_else(null_dereference)?;
                match self.heap.get(target)? {
                    Object::Boxed { type_id, value } if program.types.same(TypeId(*type_id), wanted) => co.push(*value),
                    Object::Boxed { type_id, .. } => {
                        return Err(runtime(ErrorKind::BadDowncast(
                            program.types.name(wanted),
                            program.types.name(TypeId(*type_id)),
                        )))
                    }
                    other => return Err(FerruleError::defect(format!("expected boxed value, found {:?}", other))),
                }
            }
            OpCode::Assert => {
                if !co.pop()?.as_bool() {
                    return Err(runtime(ErrorKind::AssertionFailed));
                }
            }

            OpCode::Async => {
                let function = read_u32(chunk, co);
                let argc = read_u32(chunk, co) as usize;
                let args = co.top(argc)?.to_vec();
                let id = self.spawn(function, args, Vec::new())?;
                co.drop_top(argc)?;
                co.push(Slot::int(id as i64));
            }
            OpCode::AsyncPtr => {
                let argc = read_u32(chunk, co) as usize;
                let (function, modes) = self.take_callee(co, argc)?;
                let arity = program.function(function).map_or(0, |f| f.arity as usize);
                let args = co.top(arity)?.to_vec();
                let id = self.spawn(function, args, modes)?;
                co.drop_top(arity)?;
                co.push(Slot::int(id as i64));
            }
            OpCode::Await => return self.await_ids(co),
        }
        Ok(Flow::Continue)
    }

    fn set_field(&mut self, object: Slot, field: u32, value: Slot) -> Result<()> {
        let index = object.heap_index().ok_or_else(null_dereference)?;
        match self.heap.get_mut(index)? {
            Object::Struct(fields) if (field as usize) < fields.len() => {
                fields[field as usize] = value;
                Ok(())
            }
            other => Err(FerruleError::defect(format!("no field {} on {:?}", field, other))),
        }
    }

    /// Remove the function value below `argc` arguments and peel its
    /// wrappers: curried arguments are inserted in front of the others
    fn take_callee(&self, co: &mut Coroutine, argc: usize) -> Result<(u32, Vec<ReturnMode>)> {
        let at = co
            .operands
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| FerruleError::defect("operand stack underflow"))?;
        let mut callee = co.operands.remove(at);
        let mut modes = Vec::new();
        loop {
            let index = callee.heap_index().ok_or_else(null_dereference)?;
            let callable = match self.heap.get(index)? {
                Object::Func(callable) => callable.clone(),
                other => return Err(FerruleError::defect(format!("calling {:?}", other))),
            };
            match callable {
                Callable::Plain(function) => return Ok((function, modes)),
                Callable::Curried { func, arg } => {
                    co.operands.insert(at, arg);
                    callee = Slot::Managed(func);
                }
                Callable::Discard(inner) => {
                    modes.push(ReturnMode::Discard);
                    callee = Slot::Managed(inner);
                }
                Callable::Assert(inner) => {
                    modes.push(ReturnMode::Assert);
                    callee = Slot::Managed(inner);
                }
            }
        }
    }

    /// Push a frame for `function`, moving its arguments into locals
    fn enter(&self, program: &Program, co: &mut Coroutine, function: u32, modes: Vec<ReturnMode>) -> Result<()> {
        let info = program
            .function(function)
            .ok_or_else(|| FerruleError::defect(format!("no function {}", function)))?;
        if co.frames.len() >= self.config.max_call_depth {
            return Err(runtime(ErrorKind::StackOverflow));
        }
        let split = co
            .operands
            .len()
            .checked_sub(info.arity as usize)
            .ok_or_else(|| FerruleError::defect("operand stack underflow"))?;
        let local_base = co.locals.len();
        co.locals.extend(co.operands.drain(split..));
        co.frames.push(Frame {
            function,
            ret: Some((co.module, co.ip)),
            local_base,
            operand_base: co.operands.len(),
            modes,
        });
        co.module = info.module;
        co.ip = info.entry;
        Ok(())
    }

    fn return_from(&mut self, co: &mut Coroutine, has_value: bool) -> Result<Flow> {
        let mut value = if has_value { Some(co.pop()?) } else { None };
        for mode in co.frame()?.modes.iter().rev() {
            match mode {
                ReturnMode::Discard => value = None,
                ReturnMode::Assert => {
                    if !value.take().map_or(false, Slot::as_bool) {
                        return Err(runtime(ErrorKind::AssertionFailed));
                    }
                }
            }
        }

        let frame = co.frames.pop().ok_or_else(|| FerruleError::defect("return without a frame"))?;
        co.locals.truncate(frame.local_base);
        co.operands.truncate(frame.operand_base);
        match frame.ret {
            Some((module, ip)) => {
                co.module = module;
                co.ip = ip;
                if let Some(value) = value {
                    co.push(value);
                }
                Ok(Flow::Continue)
            }
            None => {
                co.result = value;
                co.state = CoroutineState::Finished;
                Ok(Flow::Finish)
            }
        }
    }

    fn call_host(&mut self, co: &mut Coroutine, host: u32, argc: usize) -> Result<Flow> {
        let args = co.top(argc)?.to_vec();
        let table = Rc::clone(&self.host);
        let outcome = {
            let mut call = HostCall::new(&args, &mut self.heap, &mut *self.out);
            table.call(host, &mut call)?
        };
        let result = outcome.map_err(|message| runtime(ErrorKind::HostFailure(self.host_name(host), message)))?;

        match result {
            HostResult::Async(job) => {
                co.drop_top(argc)?;
                co.state = CoroutineState::AwaitingHost;
                self.scheduler.start_job(co.id, host, job);
                Ok(Flow::Suspend)
            }
            result => {
                // Arguments stay on the stack, and so rooted, until the result exists
                let slot = self.host_slot(Some(co), result)?;
                co.drop_top(argc)?;
                if let Some(slot) = slot {
                    co.push(slot);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn host_name(&self, host: u32) -> String {
        self.program.host_names.get(host as usize).cloned().unwrap_or_default()
    }

    /// Suspend until every listed coroutine has finished. Ids that are not
    /// live are skipped; with nothing to wait for the result is 0.
    fn await_ids(&mut self, co: &mut Coroutine) -> Result<Flow> {
        let list = co.pop()?.heap_index().ok_or_else(null_dereference)?;
        let ids: Vec<i64> = match self.heap.get(list)? {
            Object::List(items) => items.iter().map(|slot| slot.as_int()).collect(),
            other => return Err(FerruleError::defect(format!("await on {:?}", other))),
        };

        let mut wait_set = Vec::new();
        for id in ids.into_iter().filter_map(|id| u32::try_from(id).ok()) {
            let live = id == co.id || self.scheduler.is_live(id);
            if live && !wait_set.contains(&id) {
                wait_set.push(id);
            }
        }
        if wait_set.is_empty() {
            co.push(Slot::int(0));
            return Ok(Flow::Continue);
        }

        for &target in &wait_set {
            self.scheduler.add_waiter(target, co.id);
        }
        co.wait_set = wait_set;
        co.state = CoroutineState::Awaiting;
        Ok(Flow::Suspend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Category;
    use crate::host::CapturedOutput;
    use crate::loader::compile_source;

    fn vm_with(source: &str, config: EngineConfig) -> Vm {
        let host = Rc::new(HostTable::standard());
        let program = compile_source("vm.fer", source, Rc::clone(&host), &config).unwrap();
        Vm::new(program, host, config).unwrap()
    }

    fn run(source: &str) -> Result<Value> {
        vm_with(source, EngineConfig::default()).run()
    }

    #[test]
    fn test_vm_arithmetic() {
        assert_eq!(run("int Start() { return 2 + 3 * 4; }").unwrap(), Value::Int(14));
        assert_eq!(run("int Start() { return (10 - 4) / 4 % 5; }").unwrap(), Value::Int(1));
        assert_eq!(run("float Start() { return 1.5 * 2.0; }").unwrap(), Value::Float(3.0));
        assert_eq!(run("int Start() { return -7 / 2; }").unwrap(), Value::Int(-3));
    }

    #[test]
    fn test_vm_division_by_zero_points_at_line() {
        let err = run("int Start() {\n  int z = 0;\n  return 1 / z;\n}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
        assert_eq!(err.category(), Category::Runtime);
        assert_eq!(err.span.map(|s| s.line), Some(3));
        assert_eq!(err.backtrace.len(), 1);
        assert_eq!(err.backtrace[0].frames[0].function, "Start");
    }

    #[test]
    fn test_vm_comparison_and_logic() {
        assert_eq!(run("bool Start() { return 3 > 2 && 2 >= 2; }").unwrap(), Value::Bool(true));
        assert_eq!(run("bool Start() { return 1 == 2 || !(1 != 1); }").unwrap(), Value::Bool(true));
        assert_eq!(run("bool Start() { return \"abc\" < \"abd\"; }").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_vm_strings() {
        let source = "string Start() { string s = \"ab\" + \"cd\"; return s + \"$s.length$\" + s[2]; }";
        assert_eq!(run(source).unwrap(), Value::Str("abcd4c".to_string()));
    }

    #[test]
    fn test_vm_while_and_for() {
        let source = "int Start() {
            int total = 0;
            for int i = 0; i < 10; i += 1 {
                if i % 2 == 0 { continue; }
                if i > 7 { break; }
                total += i;
            }
            int n = 3;
            while n > 0 { total += 100; n -= 1; }
            return total;
        }";
        assert_eq!(run(source).unwrap(), Value::Int(316));
    }

    #[test]
    fn test_vm_for_in_over_string() {
        let source = "int Start() { int count = 0; for string c in \"banana\" { if c == \"a\" { count += 1; } } return count; }";
        assert_eq!(run(source).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_vm_struct_defaults() {
        let source = "struct P { int x; string name; list<int> items; }
            P Start() { P p = new P; p.x = 4; return p; }";
        let value = run(source).unwrap();
        assert_eq!(
            value,
            Value::Struct {
                name: "P".to_string(),
                fields: vec![
                    ("x".to_string(), Value::Int(4)),
                    ("name".to_string(), Value::Str(String::new())),
                    ("items".to_string(), Value::Null),
                ],
            }
        );
    }

    #[test]
    fn test_vm_function_values() {
        let source = "int Add(int a, int b) { return a + b; }
            int Start() { fn<int(int)> inc = bind(Add, 1); fn<int(int, int)> add = Add; return inc(41) + add(1, 1); }";
        assert_eq!(run(source).unwrap(), Value::Int(44));
    }

    #[test]
    fn test_vm_asserting_wrapper_fails() {
        let source = "bool Positive(int x) { return x > 0; }
            void Start() { fn<void(int)> check = asserting(Positive); check(1); check(-1); }";
        assert_eq!(run(source).unwrap_err().kind, ErrorKind::AssertionFailed);
    }

    #[test]
    fn test_vm_error_values() {
        let source = "error<int> Half(int x) { if x % 2 != 0 { return error<int>(\"odd\"); } return x / 2; }
            int Start() {
                int total = 0;
                if int h in Half(8) { total += h; }
                if int h in Half(3) { total += 100; } else { total += Half(3).message.length; }
                return total;
            }";
        assert_eq!(run(source).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_vm_stack_overflow() {
        let source = "int Down(int n) { return Down(n + 1); } int Start() { return Down(0); }";
        let err = vm_with(source, EngineConfig::default().with_max_call_depth(64)).run().unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
        assert!(err.backtrace[0].frames.len() >= 64);
    }

    #[test]
    fn test_vm_print_goes_to_output() {
        let mut vm = vm_with("void Start() { Print(\"hello $1 + 1$\"); }", EngineConfig::default());
        let out = CapturedOutput::new();
        vm.set_output(Box::new(out.clone()));
        assert_eq!(vm.run().unwrap(), Value::Void);
        assert_eq!(out.contents(), "hello 2\n");
    }

    #[test]
    fn test_vm_any_round_trip() {
        let source = "string Start() { any a = \"boxed\"; return a as string; }";
        assert_eq!(run(source).unwrap(), Value::Str("boxed".to_string()));
        let err = run("int Start() { any a = \"boxed\"; return a as int; }").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::BadDowncast(..)));
    }

    #[test]
    fn test_vm_index_out_of_bounds() {
        let err = run("int Start() { list<int> xs = [1, 2]; return xs[2]; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfBounds(2, 2));
    }
}
