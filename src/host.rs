/// `host.rs` — the dataflow host as seen from a script node
///
/// The runtime that owns boxes, ports and the message graph lives outside
/// this crate. `Host` is the seam: port creation, typed emission, named
/// delivery, file resolution and the console/error sinks.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use serde::Serialize;

use crate::message::Message;

/// Opaque id of an inlet or outlet, allocated by the host.
pub type PortId = u64;

/// A resolved script: absolute file path and the directory it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptFile {
    pub path: PathBuf,
    pub dir: PathBuf,
}

impl ScriptFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self { path, dir }
    }
}

pub trait Host {
    /// Resolve `name` relative to the enclosing patch.
    fn resolve_script(&self, name: &str) -> Option<ScriptFile>;

    fn create_inlet(&self) -> PortId;
    fn release_inlet(&self, id: PortId);
    fn create_outlet(&self) -> PortId;
    fn release_outlet(&self, id: PortId);

    /// Send a typed message out of one of the node's outlets.
    fn emit(&self, outlet: PortId, message: &Message);

    /// Deliver to whatever is bound to `name`. Returns `false` if nothing is.
    fn send_named(&self, name: &str, message: &Message) -> bool;

    /// Host console (`post`).
    fn post(&self, text: &str);

    /// Plain process output (`cpost`).
    fn console(&self, text: &str);

    /// Error attributed to the node.
    fn report_error(&self, text: &str);
}

// ── File resolution ───────────────────────────────────────────────────────────

/// Looks a script name up in an ordered list of directories.
#[derive(Debug, Clone, Default)]
pub struct FsResolver {
    search_paths: Vec<PathBuf>,
}

impl FsResolver {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    pub fn resolve(&self, name: &str) -> Option<ScriptFile> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| ScriptFile::new(candidate));
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(candidate))
            .find(|path| path.is_file())
            .map(|path| ScriptFile::new(std::fs::canonicalize(&path).unwrap_or(path)))
    }
}

// ── In-memory host ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Post,
    Console,
    Error,
}

/// One line written to a host sink.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Emission {
    pub outlet: PortId,
    pub message: Message,
}

type Receiver = Rc<dyn Fn(&Message)>;

/// Records everything a node does to its host. Named receivers are plain
/// callbacks, so several nodes can be wired together through `messnamed`.
#[derive(Default)]
pub struct MemoryHost {
    resolver: FsResolver,
    next_port: Cell<PortId>,
    released: RefCell<Vec<PortId>>,
    emissions: RefCell<Vec<Emission>>,
    console: RefCell<Vec<ConsoleEntry>>,
    receivers: RefCell<HashMap<String, Receiver>>,
}

impl MemoryHost {
    pub fn new(resolver: FsResolver) -> Self {
        Self {
            resolver,
            ..Self::default()
        }
    }

    pub fn register_receiver(&self, name: &str, receiver: impl Fn(&Message) + 'static) {
        self.receivers
            .borrow_mut()
            .insert(name.to_string(), Rc::new(receiver));
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.emissions.borrow().clone()
    }

    pub fn take_emissions(&self) -> Vec<Emission> {
        std::mem::take(&mut *self.emissions.borrow_mut())
    }

    pub fn entries(&self, level: ConsoleLevel) -> Vec<String> {
        self.console
            .borrow()
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn released(&self) -> Vec<PortId> {
        self.released.borrow().clone()
    }

    fn allocate(&self) -> PortId {
        let id = self.next_port.get() + 1;
        self.next_port.set(id);
        id
    }

    fn record(&self, level: ConsoleLevel, text: &str) {
        self.console.borrow_mut().push(ConsoleEntry {
            level,
            message: text.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}

impl Host for MemoryHost {
    fn resolve_script(&self, name: &str) -> Option<ScriptFile> {
        self.resolver.resolve(name)
    }

    fn create_inlet(&self) -> PortId {
        self.allocate()
    }

    fn release_inlet(&self, id: PortId) {
        self.released.borrow_mut().push(id);
    }

    fn create_outlet(&self) -> PortId {
        self.allocate()
    }

    fn release_outlet(&self, id: PortId) {
        self.released.borrow_mut().push(id);
    }

    fn emit(&self, outlet: PortId, message: &Message) {
        self.emissions.borrow_mut().push(Emission {
            outlet,
            message: message.clone(),
        });
    }

    fn send_named(&self, name: &str, message: &Message) -> bool {
        let receiver = self.receivers.borrow().get(name).cloned();
        match receiver {
            Some(receiver) => {
                receiver(message);
                true
            }
            None => false,
        }
    }

    fn post(&self, text: &str) {
        self.record(ConsoleLevel::Post, text);
    }

    fn console(&self, text: &str) {
        self.record(ConsoleLevel::Console, text);
    }

    fn report_error(&self, text: &str) {
        self.record(ConsoleLevel::Error, text);
    }
}

// ── Stdio host ────────────────────────────────────────────────────────────────

/// Host for the command-line runner: outlets print to stdout as
/// `<index>: <message>`, errors go to stderr.
#[derive(Default)]
pub struct StdioHost {
    resolver: FsResolver,
    next_port: Cell<PortId>,
    outlets: RefCell<Vec<PortId>>,
}

impl StdioHost {
    pub fn new(resolver: FsResolver) -> Self {
        Self {
            resolver,
            ..Self::default()
        }
    }
}

impl Host for StdioHost {
    fn resolve_script(&self, name: &str) -> Option<ScriptFile> {
        self.resolver.resolve(name)
    }

    fn create_inlet(&self) -> PortId {
        let id = self.next_port.get() + 1;
        self.next_port.set(id);
        id
    }

    fn release_inlet(&self, _id: PortId) {}

    fn create_outlet(&self) -> PortId {
        let id = self.create_inlet();
        self.outlets.borrow_mut().push(id);
        id
    }

    fn release_outlet(&self, id: PortId) {
        self.outlets.borrow_mut().retain(|o| *o != id);
    }

    fn emit(&self, outlet: PortId, message: &Message) {
        let index = self.outlets.borrow().iter().position(|o| *o == outlet);
        match index {
            Some(index) => println!("{index}: {message}"),
            None => log::warn!("[host] emit on released outlet {outlet}"),
        }
    }

    fn send_named(&self, name: &str, message: &Message) -> bool {
        println!("{name}: {message}");
        true
    }

    fn post(&self, text: &str) {
        println!("{text}");
    }

    fn console(&self, text: &str) {
        println!("{text}");
    }

    fn report_error(&self, text: &str) {
        eprintln!("error: {text}");
    }
}
