//! Module loading
//!
//! Drives the front end for a whole program: reads each source file once,
//! parses it into the shared arena, loads its imports first and then
//! resolves and checks it. Modules are memoized by canonical path, so a
//! module imported from several places gets its globals exactly once. A
//! module that imports one of its own importers is a cyclic import.

use crate::ast::{Ast, NodeId, NodeKind, Qualifier};
use crate::checker::Checker;
use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, FerruleError, Result};
use crate::host::HostTable;
use crate::parser::parse_source;
use crate::program::Program;
use crate::resolver::Resolver;
use crate::scope::{Binding, ScopeId, ScopeTable};
use crate::types::{TypeId, TypeTable};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Extension appended to import paths that have none
pub const SOURCE_EXTENSION: &str = "fer";

/// A loaded source file
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Path as shown in diagnostics
    pub display: String,
    /// Directory that relative imports resolve against
    pub dir: PathBuf,
    pub source: String,
    pub root: NodeId,
    pub scope: ScopeId,
    /// The module whose import loaded this one
    pub importer: Option<u32>,
    pub global_base: u32,
    pub global_count: u32,
}

/// A script function declared at module level
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub decl: NodeId,
    pub module: u32,
    pub ty: TypeId,
}

/// A global variable
#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    /// The binder node that declares it
    pub decl: NodeId,
    pub module: u32,
    pub ty: TypeId,
    pub qualifier: Qualifier,
}

/// Everything the front end knows about a program being compiled
pub struct Session {
    pub ast: Ast,
    pub types: TypeTable,
    pub scopes: ScopeTable,
    /// Resolved identifiers, namespace members and declared names
    pub bindings: HashMap<NodeId, Binding>,
    /// Identifier or namespace member -> the node that declares it
    pub references: HashMap<NodeId, NodeId>,
    /// Import directive -> module it loaded
    pub imports: HashMap<NodeId, u32>,
    /// Module 0 is the host prelude
    pub modules: Vec<ModuleInfo>,
    pub functions: Vec<FunctionDecl>,
    pub globals: Vec<GlobalDecl>,
    pub host: Rc<HostTable>,
    pub prelude: Option<ScopeId>,
    /// User modules in the order their initializers run: imports first
    pub order: Vec<u32>,
    by_path: HashMap<PathBuf, u32>,
}

impl Session {
    /// Start a session whose outermost scope holds the host table's prototypes
    pub fn new(host: Rc<HostTable>) -> Result<Self> {
        let mut session = Self {
            ast: Ast::new(),
            types: TypeTable::new(),
            scopes: ScopeTable::new(),
            bindings: HashMap::new(),
            references: HashMap::new(),
            imports: HashMap::new(),
            modules: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            host,
            prelude: None,
            order: Vec::new(),
            by_path: HashMap::new(),
        };

        let source = session.host.prelude_source();
        session.modules.push(ModuleInfo {
            display: "<prelude>".to_string(),
            dir: PathBuf::new(),
            source: source.clone(),
            root: NodeId(0),
            scope: ScopeId(0),
            importer: None,
            global_base: 0,
            global_count: 0,
        });
        let root = parse_source(&source, 0, &mut session.ast).map_err(|e| session.locate(e))?;
        session.modules[0].root = root;
        let scope = Resolver::new(&mut session, 0).resolve_prelude().map_err(|e| FerruleError::defect(e.to_string()))?;
        session.prelude = Some(scope);
        Ok(session)
    }

    /// Load a script file and everything it imports
    pub fn load_file(&mut self, path: &Path) -> Result<u32> {
        self.load_path(path, None, None)
    }

    /// Load a script held in memory; its imports resolve against `dir`
    pub fn load_source(&mut self, name: &str, source: &str, dir: &Path) -> Result<u32> {
        self.load_module(name.to_string(), dir.to_path_buf(), source.to_string(), None)
    }

    fn load_path(&mut self, path: &Path, importer: Option<u32>, site: Option<NodeId>) -> Result<u32> {
        let site_span = site.map(|node| self.ast.span(node));
        let canonical = std::fs::canonicalize(path)
            .map_err(|_| FerruleError::new(ErrorKind::ModuleNotFound(path.display().to_string()), site_span))?;

        if let Some(&id) = self.by_path.get(&canonical) {
            let mut chain = vec![self.modules[id as usize].display.clone()];
            let mut cursor = importer;
            while let Some(module) = cursor {
                chain.push(self.modules[module as usize].display.clone());
                if module == id {
                    chain.reverse();
                    return Err(FerruleError::new(ErrorKind::CyclicImport(chain.join(" -> ")), site_span));
                }
                cursor = self.modules[module as usize].importer;
            }
            tracing::trace!(path = %canonical.display(), "module already loaded");
            return Ok(id);
        }

        let source = std::fs::read_to_string(&canonical)
            .map_err(|e| FerruleError::new(ErrorKind::Io(format!("{}: {}", path.display(), e)), site_span))?;
        let dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        self.by_path.insert(canonical, self.modules.len() as u32);
        self.load_module(path.display().to_string(), dir, source, importer)
    }

    fn load_module(&mut self, name: String, dir: PathBuf, source: String, importer: Option<u32>) -> Result<u32> {
        let id = self.modules.len() as u32;
        tracing::debug!(module = %name, id, "loading module");
        self.modules.push(ModuleInfo {
            display: name,
            dir: dir.clone(),
            source,
            root: NodeId(0),
            scope: ScopeId(0),
            importer,
            global_base: 0,
            global_count: 0,
        });

        let source = self.modules[id as usize].source.clone();
        let root = parse_source(&source, id, &mut self.ast)?;
        self.modules[id as usize].root = root;

        let items = match self.ast.kind(root) {
            NodeKind::Module { items } => items.clone(),
            _ => Vec::new(),
        };
        for item in items {
            let path = match self.ast.kind(item) {
                NodeKind::Import { path, .. } => path.clone(),
                _ => continue,
            };
            let mut target = dir.join(path);
            if target.extension().is_none() {
                target.set_extension(SOURCE_EXTENSION);
            }
            let imported = self.load_path(&target, Some(id), Some(item))?;
            self.imports.insert(item, imported);
        }

        Resolver::new(self, id).resolve_module()?;
        Checker::new(self, id).check_module()?;
        self.order.push(id);
        Ok(id)
    }

    /// Attach the path and offending line of the module the error points into
    pub fn locate(&self, err: FerruleError) -> FerruleError {
        match err.span {
            Some(span) if err.path.is_none() => match self.modules.get(span.module as usize) {
                Some(module) => err.with_source(&module.display, &module.source),
                None => err,
            },
            _ => err,
        }
    }
}

/// Compile a script file and its imports into a runnable program
pub fn compile_file(path: &Path, host: Rc<HostTable>, config: &EngineConfig) -> Result<Program> {
    let mut session = Session::new(host)?;
    let main = session.load_file(path).map_err(|e| session.locate(e))?;
    Compiler::new(&mut session).compile(main, config).map_err(|e| session.locate(e))
}

/// Compile a script held in memory; imports resolve against the working directory
pub fn compile_source(name: &str, source: &str, host: Rc<HostTable>, config: &EngineConfig) -> Result<Program> {
    let mut session = Session::new(host)?;
    let dir = std::env::current_dir().unwrap_or_default();
    let main = session.load_source(name, source, &dir).map_err(|e| session.locate(e))?;
    Compiler::new(&mut session).compile(main, config).map_err(|e| session.locate(e))
}
