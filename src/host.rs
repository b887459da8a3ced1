//! External call bridge
//!
//! A fixed, name-indexed table of host callbacks. Scripts see each entry
//! through an `extern` prototype in the prelude. A callback reads its
//! arguments through `HostCall` and returns a `HostResult`; blocking work is
//! returned as an `Async` job that runs on a worker thread while the calling
//! coroutine waits. Jobs only ever see owned Rust values, never VM state.
//!
//! A callback that holds on to a heap entry past the call pins it through
//! `HostCall::pin`; the entry and everything it references survive
//! collections until the `Pinned` handle is released.

use crate::error::Result;
use crate::gc::{Heap, Object};
use crate::value::{Slot, Value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Work run off the interpreter thread
pub type AsyncJob = Box<dyn FnOnce() -> HostResult + Send>;

/// What a host callback produces
pub enum HostResult {
    /// No result (void prototype)
    Unit,
    /// An unmanaged scalar: int, float bits, bool
    Scalar(u64),
    /// A value the VM allocates on the script heap
    Managed(Value),
    /// An existing heap entry, returned without copying. Entries handed back
    /// from an `Async` job must stay pinned until the job finishes.
    Entry(u32),
    /// Success payload of an `error<T>`
    Success(Box<HostResult>),
    /// Failure of an `error<T>`
    Failure(String),
    /// Start asynchronous work; the job's result replaces the call's result
    Async(AsyncJob),
}

impl HostResult {
    pub fn int(value: i64) -> Self {
        HostResult::Scalar(value as u64)
    }

    pub fn float(value: f64) -> Self {
        HostResult::Scalar(value.to_bits())
    }

    pub fn bool(value: bool) -> Self {
        HostResult::Scalar(value as u64)
    }

    pub fn string(text: impl Into<String>) -> Self {
        HostResult::Managed(Value::Str(text.into()))
    }

    pub fn success(inner: HostResult) -> Self {
        HostResult::Success(Box::new(inner))
    }

    pub fn pinned(pinned: Pinned) -> Self {
        HostResult::Entry(pinned.0)
    }
}

impl std::fmt::Debug for HostResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostResult::Unit => write!(f, "Unit"),
            HostResult::Scalar(bits) => write!(f, "Scalar({})", bits),
            HostResult::Managed(value) => write!(f, "Managed({:?})", value),
            HostResult::Entry(entry) => write!(f, "Entry({})", entry),
            HostResult::Success(inner) => write!(f, "Success({:?})", inner),
            HostResult::Failure(message) => write!(f, "Failure({:?})", message),
            HostResult::Async(_) => write!(f, "Async(..)"),
        }
    }
}

/// A heap entry kept alive for a host until released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pinned(u32);

impl Pinned {
    pub fn entry(self) -> u32 {
        self.0
    }
}

/// Arguments and context of one host call
pub struct HostCall<'a> {
    args: &'a [Slot],
    heap: &'a mut Heap,
    out: &'a mut dyn Write,
}

impl<'a> HostCall<'a> {
    pub fn new(args: &'a [Slot], heap: &'a mut Heap, out: &'a mut dyn Write) -> Self {
        Self { args, heap, out }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, index: usize) -> std::result::Result<Slot, String> {
        self.args.get(index).copied().ok_or_else(|| format!("missing argument {}", index))
    }

    pub fn int(&self, index: usize) -> std::result::Result<i64, String> {
        Ok(self.arg(index)?.as_int())
    }

    pub fn float(&self, index: usize) -> std::result::Result<f64, String> {
        Ok(self.arg(index)?.as_float())
    }

    pub fn bool(&self, index: usize) -> std::result::Result<bool, String> {
        Ok(self.arg(index)?.as_bool())
    }

    pub fn string(&self, index: usize) -> std::result::Result<String, String> {
        self.text(self.arg(index)?)
    }

    /// Heap entry behind a reference argument; `None` for null
    pub fn entry(&self, index: usize) -> std::result::Result<Option<u32>, String> {
        Ok(self.arg(index)?.heap_index())
    }

    /// Items of a list argument
    pub fn list(&self, index: usize) -> std::result::Result<Vec<Slot>, String> {
        let entry = self.entry(index)?.ok_or_else(|| format!("argument {} is null", index))?;
        self.items(entry)
    }

    /// Items of a list entry, or the fields of a struct or tuple entry in
    /// declaration order
    pub fn items(&self, entry: u32) -> std::result::Result<Vec<Slot>, String> {
        match self.heap.get(entry).map_err(|e| e.to_string())? {
            Object::List(items) | Object::Struct(items) => Ok(items.clone()),
            _ => Err(format!("heap entry {} is not a list or struct", entry)),
        }
    }

    /// Text of a string slot, such as an item read through `items`
    pub fn text(&self, slot: Slot) -> std::result::Result<String, String> {
        match slot {
            Slot::Managed(entry) => self.heap.read_string(entry).map_err(|e| e.to_string()),
            Slot::Scalar(_) => Err("string is null".to_string()),
        }
    }

    /// Pin the entry behind argument `index`
    pub fn pin(&mut self, index: usize) -> std::result::Result<Pinned, String> {
        let entry = self.entry(index)?.ok_or_else(|| format!("argument {} is null", index))?;
        self.pin_entry(entry)
    }

    pub fn pin_entry(&mut self, entry: u32) -> std::result::Result<Pinned, String> {
        self.heap.pin(entry).map_err(|e| e.to_string())?;
        Ok(Pinned(entry))
    }

    /// Drop a pin taken by this or an earlier call
    pub fn release(&mut self, pinned: Pinned) -> std::result::Result<(), String> {
        self.heap.unpin(pinned.0).map_err(|e| e.to_string())
    }

    /// Where script-visible output goes
    pub fn out(&mut self) -> &mut dyn Write {
        self.out
    }
}

/// Script output collected in memory; clones share one buffer
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Rc<RefCell<Vec<u8>>>);

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A host callback; an `Err` becomes a runtime `HostFailure`
pub type HostFn = Box<dyn Fn(&mut HostCall<'_>) -> std::result::Result<HostResult, String>>;

pub struct HostEntry {
    pub name: String,
    /// Declaration as scripts see it, without `extern` and `;`
    pub prototype: String,
    pub func: HostFn,
}

/// The host function table
#[derive(Default)]
pub struct HostTable {
    entries: IndexMap<String, HostEntry>,
}

impl HostTable {
    /// A table with no entries
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard entries every engine provides
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register("void Print(string text)", |call| {
            let text = call.string(0)?;
            writeln!(call.out(), "{}", text).map_err(|e| e.to_string())?;
            Ok(HostResult::Unit)
        });
        table.register("string IntToString(int value)", |call| Ok(HostResult::string(call.int(0)?.to_string())));
        table.register("string FloatToString(float value)", |call| {
            Ok(HostResult::string(crate::value::format_float(call.float(0)?)))
        });
        table.register("error<int> ParseInt(string text)", |call| {
            let text = call.string(0)?;
            Ok(match text.trim().parse::<i64>() {
                Ok(n) => HostResult::success(HostResult::int(n)),
                Err(_) => HostResult::Failure(format!("'{}' is not an integer", text)),
            })
        });
        table.register("int Clock()", |_| {
            let millis = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?.as_millis();
            Ok(HostResult::int(millis as i64))
        });
        table.register("void Sleep(int millis)", |call| {
            let millis = call.int(0)?.max(0) as u64;
            Ok(HostResult::Async(Box::new(move || {
                std::thread::sleep(Duration::from_millis(millis));
                HostResult::Unit
            })))
        });
        table.register("error<string> Exec(string command)", |call| {
            let command = call.string(0)?;
            Ok(HostResult::Async(Box::new(move || run_shell(&command))))
        });
        table.register("error<string> ReadFile(string path)", |call| {
            let path = call.string(0)?;
            Ok(HostResult::Async(Box::new(move || match std::fs::read_to_string(&path) {
                Ok(text) => HostResult::success(HostResult::string(text)),
                Err(err) => HostResult::Failure(format!("{}: {}", path, err)),
            })))
        });
        table.register("error<bool> WriteFile(string path, string contents)", |call| {
            let path = call.string(0)?;
            let contents = call.string(1)?;
            Ok(HostResult::Async(Box::new(move || match std::fs::write(&path, contents) {
                Ok(()) => HostResult::success(HostResult::bool(true)),
                Err(err) => HostResult::Failure(format!("{}: {}", path, err)),
            })))
        });
        table
    }

    /// Add or replace an entry. The name is taken from the prototype, e.g.
    /// `"int Twice(int x)"` registers `Twice`.
    pub fn register<F>(&mut self, prototype: &str, func: F)
    where
        F: Fn(&mut HostCall<'_>) -> std::result::Result<HostResult, String> + 'static,
    {
        let name = prototype_name(prototype).to_string();
        self.entries.insert(
            name.clone(),
            HostEntry { name, prototype: prototype.trim().to_string(), func: Box::new(func) },
        );
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.entries.get_index_of(name).map(|i| i as u32)
    }

    pub fn get(&self, index: u32) -> Option<&HostEntry> {
        self.entries.get_index(index as usize).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Source of the prelude module: one `extern` prototype per entry
    pub fn prelude_source(&self) -> String {
        self.entries.values().map(|entry| format!("extern {};\n", entry.prototype)).collect()
    }

    /// Invoke entry `index`
    pub fn call(&self, index: u32, call: &mut HostCall<'_>) -> Result<std::result::Result<HostResult, String>> {
        let entry = self
            .get(index)
            .ok_or_else(|| crate::error::FerruleError::defect(format!("no host entry {}", index)))?;
        Ok((entry.func)(call))
    }
}

/// Identifier just before the parameter list
fn prototype_name(prototype: &str) -> &str {
    let mut depth = 0i32;
    let mut end = prototype.len();
    for (i, c) in prototype.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth -= 1,
            '(' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let head = prototype[..end].trim_end();
    head.rsplit(|c: char| c.is_whitespace() || c == '>').next().unwrap_or(head)
}

fn run_shell(command: &str) -> HostResult {
    let output = if cfg!(windows) {
        std::process::Command::new("cmd").args(["/C", command]).output()
    } else {
        std::process::Command::new("sh").args(["-c", command]).output()
    };
    match output {
        Ok(output) if output.status.success() => {
            HostResult::success(HostResult::string(String::from_utf8_lossy(&output.stdout).into_owned()))
        }
        Ok(output) => HostResult::Failure(format!(
            "'{}' exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(err) => HostResult::Failure(format!("cannot run '{}': {}", command, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prototype_names() {
        assert_eq!(prototype_name("void Print(string text)"), "Print");
        assert_eq!(prototype_name("error<int> ParseInt(string text)"), "ParseInt");
        assert_eq!(prototype_name("fn<int(int)> Make()"), "Make");
    }

    #[test]
    fn test_prelude_lists_every_entry() {
        let table = HostTable::standard();
        let prelude = table.prelude_source();
        assert!(prelude.contains("extern void Print(string text);"));
        assert!(prelude.contains("extern error<bool> WriteFile(string path, string contents);"));
        assert_eq!(prelude.lines().count(), table.len());
        assert_eq!(table.index_of("Print"), Some(0));
        assert_eq!(table.index_of("Missing"), None);
    }

    #[test]
    fn test_call_reads_typed_arguments() {
        let mut table = HostTable::new();
        table.register("int Twice(int x)", |call| Ok(HostResult::int(call.int(0)? * 2)));
        let mut heap = Heap::new(4, 4);
        let mut out = Vec::new();
        let args = [Slot::int(21)];
        let mut call = HostCall::new(&args, &mut heap, &mut out);
        let index = table.index_of("Twice").unwrap();
        match table.call(index, &mut call).unwrap() {
            Ok(HostResult::Scalar(bits)) => assert_eq!(bits as i64, 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pinned_arguments_survive_collection() {
        let mut heap = Heap::new(4, 4);
        let word = heap.insert(Object::Str("kept".into())).unwrap();
        let list = heap.insert(Object::List(vec![Slot::Managed(word)])).unwrap();
        let args = [Slot::Managed(list)];
        let mut out = Vec::new();

        let pinned = {
            let mut call = HostCall::new(&args, &mut heap, &mut out);
            let items = call.list(0).unwrap();
            assert_eq!(call.text(items[0]).unwrap(), "kept");
            call.pin(0).unwrap()
        };
        heap.collect(std::iter::empty());
        assert!(heap.is_live(list));
        assert!(heap.is_live(word));

        let mut call = HostCall::new(&[], &mut heap, &mut out);
        call.release(pinned).unwrap();
        assert!(call.release(pinned).is_err());
        heap.collect(std::iter::empty());
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn test_exec_reports_exit_status() {
        match run_shell("exit 3") {
            HostResult::Failure(message) => assert!(message.contains("exit")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
