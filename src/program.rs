//! Compiled programs
//!
//! Everything the VM needs once the front end is done: one chunk per
//! module, the function and global tables, the interned type table used for
//! runtime type checks and printing, and the startup plan.

use crate::ast::Qualifier;
use crate::bytecode::Chunk;
use crate::types::{TypeId, TypeTable};

/// One module's code
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub path: String,
    pub source: String,
    pub chunk: Chunk,
    pub global_base: u32,
    pub global_count: u32,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub module: u32,
    /// Code offset of the first instruction
    pub entry: usize,
    pub arity: u32,
    pub ret: TypeId,
}

#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub name: String,
    pub module: u32,
    pub ty: TypeId,
    pub qualifier: Qualifier,
}

/// Startup work for one module, run in import post-order
#[derive(Debug, Clone)]
pub struct ModuleInit {
    pub module: u32,
    /// Synthetic function running the module's global initializers
    pub globals: u32,
    pub init: Option<u32>,
}

/// A runnable program
#[derive(Debug, Clone)]
pub struct Program {
    pub modules: Vec<CompiledModule>,
    pub functions: Vec<FunctionInfo>,
    pub globals: Vec<GlobalInfo>,
    pub types: TypeTable,
    pub inits: Vec<ModuleInit>,
    pub start: u32,
    pub main: u32,
    /// Host table entry names, for diagnostics
    pub host_names: Vec<String>,
}

impl Program {
    pub fn function(&self, index: u32) -> Option<&FunctionInfo> {
        self.functions.get(index as usize)
    }

    /// Type of the start function's result
    pub fn result_type(&self) -> TypeId {
        self.function(self.start).map_or(TypeId::VOID, |f| f.ret)
    }

    /// Human-readable listing of every module's bytecode
    pub fn disassemble(&self) -> String {
        let names = |index: u32| self.function(index).map_or_else(|| format!("#{}", index), |f| f.name.clone());
        self.modules
            .iter()
            .filter(|module| !module.chunk.is_empty())
            .map(|module| module.chunk.disassemble(&module.path, &names))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
