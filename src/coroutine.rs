//! Coroutine state
//!
//! Each coroutine owns its operand stack, its locals and its call frames.
//! Only the coroutine the VM is currently running is ever mutated; the rest
//! sit in the scheduler until they are ready again.

use crate::error::{CoroutineTrace, FerruleError, Result, TraceFrame};
use crate::program::Program;
use crate::value::Slot;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    NotStarted,
    Running,
    /// Blocked in `await` on other coroutines
    Awaiting,
    /// Blocked on an asynchronous host call
    AwaitingHost,
    Finished,
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoroutineState::NotStarted => "not started",
            CoroutineState::Running => "running",
            CoroutineState::Awaiting => "awaiting",
            CoroutineState::AwaitingHost => "awaiting host",
            CoroutineState::Finished => "finished",
        };
        write!(f, "{}", name)
    }
}

/// What a call wrapper does to the callee's return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnMode {
    Discard,
    Assert,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub function: u32,
    /// Module and offset to continue at in the caller; `None` for the
    /// outermost frame, whose return finishes the coroutine
    pub ret: Option<(u32, usize)>,
    pub local_base: usize,
    pub operand_base: usize,
    /// Wrappers peeled off the callee, outermost first
    pub modes: Vec<ReturnMode>,
}

#[derive(Debug)]
pub struct Coroutine {
    pub id: u32,
    pub state: CoroutineState,
    pub operands: Vec<Slot>,
    pub locals: Vec<Slot>,
    pub frames: Vec<Frame>,
    pub module: u32,
    /// Offset of the next instruction
    pub ip: usize,
    /// Ids that must finish before an `await` resumes
    pub wait_set: Vec<u32>,
    /// Coroutines awaiting this one
    pub waiters: Vec<u32>,
    /// Value returned by the outermost frame
    pub result: Option<Slot>,
}

impl Coroutine {
    /// A coroutine that will start by calling `function` with `args`
    pub fn new(id: u32, program: &Program, function: u32, args: Vec<Slot>, modes: Vec<ReturnMode>) -> Result<Self> {
        let info = program
            .function(function)
            .ok_or_else(|| FerruleError::defect(format!("no function {}", function)))?;
        if info.arity as usize != args.len() {
            return Err(FerruleError::defect(format!(
                "'{}' takes {} arguments, coroutine got {}",
                info.name,
                info.arity,
                args.len()
            )));
        }
        Ok(Self {
            id,
            state: CoroutineState::NotStarted,
            operands: Vec::new(),
            locals: args,
            frames: vec![Frame { function, ret: None, local_base: 0, operand_base: 0, modes }],
            module: info.module,
            ip: info.entry,
            wait_set: Vec::new(),
            waiters: Vec::new(),
            result: None,
        })
    }

    pub fn push(&mut self, slot: Slot) {
        self.operands.push(slot);
    }

    pub fn pop(&mut self) -> Result<Slot> {
        self.operands.pop().ok_or_else(|| FerruleError::defect("operand stack underflow"))
    }

    /// Slot `distance` entries below the top
    pub fn peek(&self, distance: usize) -> Result<Slot> {
        self.operands
            .len()
            .checked_sub(distance + 1)
            .map(|i| self.operands[i])
            .ok_or_else(|| FerruleError::defect("operand stack underflow"))
    }

    /// The top `count` operands, bottom first
    pub fn top(&self, count: usize) -> Result<&[Slot]> {
        let start = self
            .operands
            .len()
            .checked_sub(count)
            .ok_or_else(|| FerruleError::defect("operand stack underflow"))?;
        Ok(&self.operands[start..])
    }

    pub fn drop_top(&mut self, count: usize) -> Result<()> {
        let len = self.operands.len().checked_sub(count).ok_or_else(|| FerruleError::defect("operand stack underflow"))?;
        self.operands.truncate(len);
        Ok(())
    }

    pub fn frame(&self) -> Result<&Frame> {
        self.frames.last().ok_or_else(|| FerruleError::defect("coroutine has no frame"))
    }

    fn local_index(&self, slot: u32) -> Result<usize> {
        let index = self.frame()?.local_base + slot as usize;
        if index < self.locals.len() {
            Ok(index)
        } else {
            Err(FerruleError::defect(format!("local slot {} out of range", slot)))
        }
    }

    pub fn local(&self, slot: u32) -> Result<Slot> {
        Ok(self.locals[self.local_index(slot)?])
    }

    pub fn set_local(&mut self, slot: u32, value: Slot) -> Result<()> {
        let index = self.local_index(slot)?;
        self.locals[index] = value;
        Ok(())
    }

    /// Every slot this coroutine keeps alive
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.operands.iter().chain(self.locals.iter()).chain(self.result.iter())
    }

    /// Module and offset of the instruction being executed: the one just
    /// before `ip` once the coroutine has started
    pub fn position(&self) -> (u32, usize) {
        match self.state {
            CoroutineState::NotStarted => (self.module, self.ip),
            _ => (self.module, self.ip.saturating_sub(1)),
        }
    }

    pub fn trace(&self, program: &Program) -> CoroutineTrace {
        let describe = |function: u32, (module, offset): (u32, usize)| {
            let module_info = program.modules.get(module as usize);
            TraceFrame {
                function: program.function(function).map_or_else(|| format!("#{}", function), |f| f.name.clone()),
                path: module_info.map_or_else(String::new, |m| m.path.clone()),
                line: module_info.and_then(|m| m.chunk.line_at(offset)).map_or(0, |entry| entry.line),
            }
        };

        let mut frames = Vec::with_capacity(self.frames.len());
        let mut at = self.position();
        for frame in self.frames.iter().rev() {
            frames.push(describe(frame.function, at));
            if let Some((module, ip)) = frame.ret {
                at = (module, ip.saturating_sub(1));
            }
        }
        let state = match self.state {
            CoroutineState::Awaiting => format!("{} {:?}", self.state, self.wait_set),
            state => state.to_string(),
        };
        CoroutineTrace { id: self.id, state, frames }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::host::HostTable;
    use crate::loader::compile_source;
    use std::rc::Rc;

    fn program(source: &str) -> Program {
        compile_source("co.fer", source, Rc::new(HostTable::standard()), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_new_coroutine_holds_arguments_as_locals() {
        let program = program("int Add(int a, int b) { return a + b; } void Start() { }");
        let add = program.functions.iter().position(|f| f.name == "Add").unwrap() as u32;
        let co = Coroutine::new(1, &program, add, vec![Slot::int(1), Slot::int(2)], Vec::new()).unwrap();
        assert_eq!(co.state, CoroutineState::NotStarted);
        assert_eq!(co.local(1).unwrap(), Slot::int(2));
        assert!(Coroutine::new(2, &program, add, Vec::new(), Vec::new()).is_err());
    }

    #[test]
    fn test_stack_helpers() {
        let program = program("void Start() { }");
        let mut co = Coroutine::new(1, &program, program.start, Vec::new(), Vec::new()).unwrap();
        co.push(Slot::int(1));
        co.push(Slot::int(2));
        co.push(Slot::int(3));
        assert_eq!(co.peek(0).unwrap(), Slot::int(3));
        assert_eq!(co.top(2).unwrap(), &[Slot::int(2), Slot::int(3)]);
        co.drop_top(2).unwrap();
        assert_eq!(co.pop().unwrap(), Slot::int(1));
        assert!(co.pop().is_err());
    }

    #[test]
    fn test_trace_names_the_start_function() {
        let program = program("void Start() { }");
        let co = Coroutine::new(3, &program, program.start, Vec::new(), Vec::new()).unwrap();
        let trace = co.trace(&program);
        assert_eq!(trace.id, 3);
        assert_eq!(trace.state, "not started");
        assert_eq!(trace.frames[0].function, "Start");
        assert_eq!(trace.frames[0].line, 1);
    }
}
