//! Ferrule - an embeddable, statically typed scripting language
//!
//! Scripts are lexed, parsed, resolved and type-checked per module, compiled
//! to bytecode, and run on a garbage-collected VM whose coroutines can call
//! back into the host, synchronously or on worker threads.

pub mod token;
pub mod lexer;
pub mod parser;
pub mod ast;
pub mod types;
pub mod scope;
pub mod resolver;
pub mod loader;
pub mod checker;
pub mod bytecode;
pub mod compiler;
pub mod program;
pub mod value;
pub mod gc;
pub mod coroutine;
pub mod scheduler;
pub mod host;
pub mod persist;
pub mod config;
pub mod error;
pub mod vm;

pub use config::EngineConfig;
pub use error::{Category, ErrorKind, FerruleError, Result};
pub use host::{CapturedOutput, HostCall, HostResult, HostTable, Pinned};
pub use lexer::Lexer;
pub use parser::Parser;
pub use program::Program;
pub use value::Value;
pub use vm::Vm;

use std::path::Path;
use std::rc::Rc;

/// Compiles and runs scripts against one host table
pub struct Engine {
    config: EngineConfig,
    host: Rc<HostTable>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// An engine with the standard host table
    pub fn new(config: EngineConfig) -> Self {
        Self::with_host(config, HostTable::standard())
    }

    pub fn with_host(config: EngineConfig, host: HostTable) -> Self {
        Self { config, host: Rc::new(host) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// Add a host entry; see [`HostTable::register`]. Fails while a `Vm`
    /// created by this engine is still alive.
    pub fn register<F>(&mut self, prototype: &str, func: F) -> Result<()>
    where
        F: Fn(&mut HostCall<'_>) -> std::result::Result<HostResult, String> + 'static,
    {
        let host = Rc::get_mut(&mut self.host)
            .ok_or_else(|| FerruleError::defect("host table is in use by a running program"))?;
        host.register(prototype, func);
        Ok(())
    }

    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<Program> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "compiling");
        loader::compile_file(path, Rc::clone(&self.host), &self.config)
    }

    pub fn compile_source(&self, name: &str, source: &str) -> Result<Program> {
        loader::compile_source(name, source, Rc::clone(&self.host), &self.config)
    }

    /// A VM ready to run the program; set its output before running
    pub fn load(&self, program: Program) -> Result<Vm> {
        Vm::new(program, Rc::clone(&self.host), self.config.clone())
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Vm> {
        self.load(self.compile_file(path)?)
    }

    pub fn load_source(&self, name: &str, source: &str) -> Result<Vm> {
        self.load(self.compile_source(name, source)?)
    }

    pub fn run_file(&self, path: impl AsRef<Path>) -> Result<Value> {
        self.load_file(path)?.run()
    }

    pub fn run_source(&self, name: &str, source: &str) -> Result<Value> {
        self.load_source(name, source)?.run()
    }
}

/// Convenience function to run Ferrule code with the default configuration
pub fn run(source: &str) -> Result<Value> {
    Engine::default().run_source("main.fer", source)
}

/// Version of the Ferrule language
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
