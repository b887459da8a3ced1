//! Bytecode instructions for the Ferrule VM
//!
//! One `Chunk` per module: a flat, variable-length instruction stream where
//! every opcode byte is followed by its inline immediates (little-endian),
//! a pool of string constants and a side table mapping code offsets back
//! to source lines and the enclosing function.

use crate::error::{FerruleError, Result};
use indexmap::IndexSet;
use std::fmt::Write as _;

/// Kinds of inline immediates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// u32 index: function, global, local slot, field, string, type
    Index,
    /// u32 element or argument count
    Count,
    I64,
    F64,
    /// i32 branch offset relative to the end of the operand
    Offset,
    /// single byte flag
    Flag,
}

impl Operand {
    pub fn width(self) -> usize {
        match self {
            Operand::Index | Operand::Count | Operand::Offset => 4,
            Operand::I64 | Operand::F64 => 8,
            Operand::Flag => 1,
        }
    }
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident $([$($operand:ident),*])?,)*) => {
        /// Opcodes for the VM
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum OpCode {
            $($(#[$doc])* $name,)*
        }

        impl OpCode {
            const ALL: &'static [OpCode] = &[$(OpCode::$name,)*];

            /// Decode an opcode byte; `None` for bytes no opcode uses
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                Self::ALL.get(byte as usize).copied()
            }

            /// Immediates that follow the opcode, in order
            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $(OpCode::$name => &[$($(Operand::$operand),*)?],)*
                }
            }
        }
    };
}

opcodes! {
    // Constants
    PushInt [I64],
    PushFloat [F64],
    /// Null reference, also integer zero
    PushNull,
    PushStr [Index],

    // Stack manipulation
    Pop,
    Dup,
    /// Duplicate the top two values
    Dup2,
    Swap,
    /// Bring the third value to the top: [a, b, c] -> [b, c, a]
    Rot,

    // Variables
    /// Push `n` null locals
    Reserve [Count],
    /// Drop `n` locals
    Release [Count],
    LoadLocal [Index],
    StoreLocal [Index],
    LoadGlobal [Index],
    StoreGlobal [Index],
    LoadPersist [Index],
    StorePersist [Index],

    // Arithmetic
    AddI,
    SubI,
    MulI,
    DivI,
    ModI,
    NegI,
    AddF,
    SubF,
    MulF,
    DivF,
    NegF,

    // Comparison; `>` and `>=` swap their operands and use these
    LtI,
    LeI,
    LtF,
    LeF,
    LtS,
    LeS,
    /// Scalar bit equality: int, bool, inttype, handletype
    EqI,
    EqF,
    EqS,
    /// Reference identity; null equals null
    EqRef,
    Not,

    // Conversions
    IntToFloat,
    FloatToInt,
    Concat,
    ToStrI,
    ToStrF,
    ToStrB,

    // Control flow
    Jump [Offset],
    /// Pops the condition
    JumpIfFalse [Offset],
    /// Keeps the condition when branching, pops it otherwise
    JumpIfFalseOrPop [Offset],
    JumpIfTrueOrPop [Offset],

    // Functions
    Call [Index],
    CallHost [Index, Count],
    /// [fn, args..] -> result
    CallPtr [Count],
    Return [Flag],
    /// End of a function that must have returned earlier
    Unreachable,
    FuncRef [Index],
    /// [fn, arg] -> fn with `arg` curried in front
    BindFn,
    DiscardFn,
    AssertFn,

    // Aggregates
    NewStruct [Index],
    MakeTuple [Count],
    MakeList [Count],
    NewList,
    GetField [Index],
    /// [object, value] -> [value]
    SetField [Index],
    GetIndex,
    /// [list, index, value] -> [value]
    SetIndex,
    Length,
    /// [list, value] -> []
    Push,

    // Errors and any
    WrapOk,
    WrapFail,
    ErrorMessage,
    /// [error] -> [payload, true] on success, [false] on failure
    ErrorUnwrap,
    Box [Index],
    Unbox [Index],
    Assert,

    // Coroutines
    Async [Index, Count],
    AsyncPtr [Count],
    Await,
}

/// One row of the line table: code from `offset` on belongs to `line`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    pub function: u32,
}

/// A chunk of bytecode with associated data
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// String constant pool
    pub strings: IndexSet<String>,
    /// Sorted by offset
    pub lines: Vec<LineEntry>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Record that code emitted from now on comes from `line`
    pub fn mark_line(&mut self, line: usize, column: usize, function: u32) {
        let offset = self.code.len();
        if let Some(last) = self.lines.last_mut() {
            if last.line == line && last.column == column && last.function == function {
                return;
            }
            if last.offset == offset {
                *last = LineEntry { offset, line, column, function };
                return;
            }
        }
        self.lines.push(LineEntry { offset, line, column, function });
    }

    /// Line table row covering `offset`
    pub fn line_at(&self, offset: usize) -> Option<&LineEntry> {
        let index = self.lines.partition_point(|entry| entry.offset <= offset);
        index.checked_sub(1).map(|i| &self.lines[i])
    }

    pub fn emit(&mut self, op: OpCode) {
        self.code.push(op as u8);
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i64(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_f64(&mut self, value: f64) {
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Intern a string constant and return its index
    pub fn add_string(&mut self, text: &str) -> u32 {
        match self.strings.get_index_of(text) {
            Some(index) => index as u32,
            None => self.strings.insert_full(text.to_string()).0 as u32,
        }
    }

    /// Emit a forward branch with a placeholder offset; returns the
    /// position to hand to `patch_jump`
    pub fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        let at = self.code.len();
        self.code.extend_from_slice(&[0xff; 4]);
        at
    }

    /// Point the branch at `at` to the current end of code
    pub fn patch_jump(&mut self, at: usize) -> Result<()> {
        self.patch_jump_to(at, self.code.len())
    }

    pub fn patch_jump_to(&mut self, at: usize, target: usize) -> Result<()> {
        let offset = target as i64 - (at as i64 + 4);
        let offset = i32::try_from(offset).map_err(|_| FerruleError::defect("branch offset out of range"))?;
        self.code[at..at + 4].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    /// Emit an unconditional backward branch to `target`
    pub fn emit_loop(&mut self, target: usize) -> Result<()> {
        let at = self.emit_jump(OpCode::Jump);
        self.patch_jump_to(at, target)
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.code[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.code[offset..offset + 8]);
        i64::from_le_bytes(bytes)
    }

    pub fn read_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.read_i64(offset) as u64)
    }

    /// Disassemble for debugging; `function_name` labels function entries
    pub fn disassemble(&self, name: &str, function_name: &dyn Fn(u32) -> String) -> String {
        let mut out = format!("== {} ==\n", name);
        let mut offset = 0;
        let mut current_function = None;
        let mut current_line = 0;

        while offset < self.code.len() {
            if let Some(entry) = self.line_at(offset) {
                if current_function != Some(entry.function) {
                    current_function = Some(entry.function);
                    let _ = writeln!(out, "-- {} --", function_name(entry.function));
                    current_line = 0;
                }
                if entry.line != current_line {
                    current_line = entry.line;
                    let _ = write!(out, "{:04} {:4} ", offset, entry.line);
                } else {
                    let _ = write!(out, "{:04}    | ", offset);
                }
            } else {
                let _ = write!(out, "{:04}    ? ", offset);
            }

            let (text, next) = self.disassemble_instruction(offset);
            out.push_str(&text);
            out.push('\n');
            offset = next;
        }
        out
    }

    fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let Some(op) = OpCode::from_byte(self.code[offset]) else {
            return (format!("<bad opcode {:#04x}>", self.code[offset]), offset + 1);
        };
        let mut text = format!("{:?}", op);
        let mut cursor = offset + 1;
        for operand in op.operands() {
            if cursor + operand.width() > self.code.len() {
                text.push_str(" <truncated>");
                return (text, self.code.len());
            }
            match operand {
                Operand::Index if op == OpCode::PushStr => {
                    let index = self.read_u32(cursor);
                    let value = self.strings.get_index(index as usize).map(String::as_str).unwrap_or("?");
                    let _ = write!(text, " {} {:?}", index, value);
                }
                Operand::Index | Operand::Count => {
                    let _ = write!(text, " {}", self.read_u32(cursor));
                }
                Operand::I64 => {
                    let _ = write!(text, " {}", self.read_i64(cursor));
                }
                Operand::F64 => {
                    let _ = write!(text, " {}", self.read_f64(cursor));
                }
                Operand::Offset => {
                    let target = (cursor + 4) as i64 + self.read_i32(cursor) as i64;
                    let _ = write!(text, " -> {:04}", target);
                }
                Operand::Flag => {
                    let _ = write!(text, " {}", self.read_u8(cursor));
                }
            }
            cursor += operand.width();
        }
        (text, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes_round_trip() {
        for &op in OpCode::ALL {
            assert_eq!(OpCode::from_byte(op as u8), Some(op));
        }
        assert_eq!(OpCode::from_byte(255), None);
    }

    #[test]
    fn test_jump_patching() {
        let mut chunk = Chunk::new();
        let at = chunk.emit_jump(OpCode::JumpIfFalse);
        chunk.emit(OpCode::Pop);
        chunk.emit(OpCode::Pop);
        chunk.patch_jump(at).unwrap();
        assert_eq!(chunk.read_i32(at), 2);

        let top = chunk.len();
        chunk.emit(OpCode::Dup);
        chunk.emit_loop(top).unwrap();
        let back = chunk.len() - 4;
        assert_eq!(back as i64 + 4 + chunk.read_i32(back) as i64, top as i64);
    }

    #[test]
    fn test_line_lookup() {
        let mut chunk = Chunk::new();
        chunk.mark_line(1, 1, 0);
        chunk.emit(OpCode::PushInt);
        chunk.emit_i64(7);
        chunk.mark_line(3, 5, 0);
        chunk.emit(OpCode::Pop);

        assert_eq!(chunk.line_at(0).map(|e| e.line), Some(1));
        assert_eq!(chunk.line_at(8).map(|e| e.line), Some(1));
        assert_eq!(chunk.line_at(9).map(|e| e.line), Some(3));
    }

    #[test]
    fn test_disassemble() {
        let mut chunk = Chunk::new();
        chunk.mark_line(1, 1, 0);
        let hello = chunk.add_string("hello");
        chunk.emit(OpCode::PushStr);
        chunk.emit_u32(hello);
        chunk.emit(OpCode::Return);
        chunk.emit_u8(1);

        let text = chunk.disassemble("main", &|_| "Start".to_string());
        assert!(text.contains("-- Start --"));
        assert!(text.contains("PushStr 0 \"hello\""));
        assert!(text.contains("Return 1"));
    }
}
