/// `node/mod.rs` — a script node hosted in a patch
///
/// `ScriptNode` is what the host instantiates. It owns the port topology,
/// the per-message bookkeeping scripts can read back (`inlet`,
/// `messagename`, `jsarguments`) and the active execution context.
///
/// Reloads build the replacement context off to the side and swap it in
/// only once its top-level code ran cleanly, so a broken edit never costs
/// the node its working script.
pub mod dispatch;
pub mod topology;

use std::{
    cell::RefCell,
    path::Path,
    rc::{Rc, Weak},
};

use mlua::{Lua, Result as LuaResult, Value};

use crate::{
    config::BridgeConfig,
    error::{BridgeError, Result},
    host::{Host, PortId, ScriptFile},
    message::{codec, selector, Atom},
    scripting::{
        api::{self, reserved},
        context::{ContextState, ExecutionContext},
    },
};
use topology::Topology;

/// Mutable per-node bookkeeping.
#[derive(Debug)]
pub struct NodeState {
    pub topology: Topology,
    /// Inlet of the message being handled.
    pub inlet: usize,
    /// Selector of the message being handled.
    pub messagename: String,
    /// Construction arguments, script name first.
    pub arguments: Vec<Atom>,
    pub script: Option<ScriptFile>,
    pub status: ContextState,
}

pub(crate) struct NodeShared {
    pub(crate) host: Rc<dyn Host>,
    config: BridgeConfig,
    state: RefCell<NodeState>,
    context: RefCell<Option<Rc<ExecutionContext>>>,
}

impl NodeShared {
    pub(crate) fn active_context(&self) -> Option<Rc<ExecutionContext>> {
        self.context.borrow().clone()
    }

    /// Load `name`, or reload the current script when `name` is `None`.
    pub(crate) fn load(self: &Rc<Self>, name: Option<&str>) -> Result<()> {
        let script = match name {
            Some(name) => self
                .host
                .resolve_script(name)
                .ok_or_else(|| BridgeError::ScriptNotFound(name.to_string()))?,
            None => self
                .state
                .borrow()
                .script
                .clone()
                .ok_or(BridgeError::NotLoaded)?,
        };

        let reloading = self.context.borrow().is_some();
        {
            let mut state = self.state.borrow_mut();
            state.script = Some(script.clone());
            state.status = if reloading {
                ContextState::Reloading
            } else {
                ContextState::Loading
            };
        }
        log::info!("[node] loading {}", script.path.display());

        let node = Rc::downgrade(self);
        let dir = script.dir.clone();
        let built = ExecutionContext::new(script, &self.config.trust, move |lua, handles| {
            api::register_all(lua, handles, node, &dir)
        })
        .and_then(|ctx| ctx.run_main().map(|_| ctx));

        match built {
            Ok(ctx) => {
                let previous = self.context.replace(Some(Rc::new(ctx)));
                drop(previous);
                self.set_status(ContextState::Ready);
                Ok(())
            }
            Err(err) => {
                self.set_status(ContextState::Failed);
                Err(err)
            }
        }
    }

    /// Resolve a file named by a script: next to the script first, then
    /// wherever the host looks.
    pub(crate) fn resolve_relative(&self, dir: &Path, name: &str) -> Result<ScriptFile> {
        let local = dir.join(name);
        if local.is_file() {
            return Ok(ScriptFile::new(local));
        }
        self.host
            .resolve_script(name)
            .ok_or_else(|| BridgeError::ScriptNotFound(name.to_string()))
    }

    pub(crate) fn outlet_port(&self, index: usize) -> Option<PortId> {
        self.state.borrow().topology.outlet(index)
    }

    pub(crate) fn reset_topology(&self) {
        self.state.borrow_mut().topology.reset(&*self.host);
    }

    pub(crate) fn record_message(&self, inlet: usize, selector: &str) {
        let mut state = self.state.borrow_mut();
        state.inlet = inlet;
        state.messagename = selector.to_string();
    }

    pub(crate) fn report(&self, err: &BridgeError) {
        log::error!("[node] {err}");
        self.host.report_error(&err.to_string());
    }

    /// Value of a reserved global, or `None` for ordinary names.
    ///
    /// Lua allocations may run finalizers that write reserved names, so the
    /// state borrow is released before any Lua value is built.
    pub(crate) fn read_reserved(&self, lua: &Lua, name: &str) -> LuaResult<Option<Value>> {
        let value = match name {
            reserved::INLETS => Value::Integer(self.state.borrow().topology.inlet_count() as i64),
            reserved::OUTLETS => Value::Integer(self.state.borrow().topology.outlet_count() as i64),
            reserved::INLET => Value::Integer(self.state.borrow().inlet as i64),
            reserved::MESSAGENAME => {
                let text = self.state.borrow().messagename.clone();
                Value::String(lua.create_string(&text)?)
            }
            reserved::JSARGUMENTS => {
                let arguments = self.state.borrow().arguments.clone();
                let values = arguments
                    .iter()
                    .map(|atom| codec::atom_to_value(lua, atom))
                    .collect::<LuaResult<Vec<_>>>()?;
                Value::Table(lua.create_sequence_from(values)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Apply a write to a reserved global. Returns `false` for ordinary
    /// names, which the caller stores normally.
    pub(crate) fn write_reserved(&self, name: &str, value: &Value) -> bool {
        match name {
            reserved::INLETS | reserved::OUTLETS => {
                let Some(count) = api::value_to_integer(value) else {
                    log::warn!("[node] ignoring non-numeric {name} = {}", value.type_name());
                    return true;
                };
                let Ok(mut state) = self.state.try_borrow_mut() else {
                    log::warn!("[node] ignoring {name} = {count} while node state is in use");
                    return true;
                };
                if name == reserved::INLETS {
                    state.topology.set_inlets(&*self.host, count);
                } else {
                    state.topology.set_outlets(&*self.host, count);
                }
                true
            }
            reserved::INLET | reserved::MESSAGENAME | reserved::JSARGUMENTS => {
                log::debug!("[node] ignoring write to read-only {name}");
                true
            }
            _ => false,
        }
    }

    fn set_status(&self, status: ContextState) {
        self.state.borrow_mut().status = status;
    }
}

/// Handle the host keeps for one script node.
pub struct ScriptNode {
    shared: Rc<NodeShared>,
}

impl ScriptNode {
    /// Create a node from its construction arguments and load the script
    /// named by the first one. Starts with one inlet and one outlet.
    pub fn new(host: Rc<dyn Host>, config: BridgeConfig, arguments: Vec<Atom>) -> Result<Self> {
        let topology = Topology::new(&*host, 1, 1);
        let shared = Rc::new(NodeShared {
            host,
            config,
            state: RefCell::new(NodeState {
                topology,
                inlet: 0,
                messagename: String::new(),
                arguments: arguments.clone(),
                script: None,
                status: ContextState::Unloaded,
            }),
            context: RefCell::new(None),
        });
        let node = Self { shared };

        let Some(name) = arguments.first().and_then(Atom::as_symbol) else {
            let err = BridgeError::MissingScript;
            node.shared.report(&err);
            return Err(err);
        };
        if let Err(err) = node.shared.load(Some(name)) {
            node.shared.report(&err);
            return Err(err);
        }
        Ok(node)
    }

    /// Deliver one message arriving on `inlet`. Errors are reported to the
    /// host and returned; the node stays usable either way.
    pub fn deliver(&self, inlet: usize, selector: &str, atoms: &[Atom]) -> Result<()> {
        let result = dispatch::dispatch(&self.shared, inlet, selector, atoms);
        if let Err(err) = &result {
            self.shared.report(err);
        }
        result
    }

    pub fn loadbang(&self) -> Result<()> {
        self.deliver(0, selector::LOADBANG, &[])
    }

    /// Reload the current script, or switch to `name`.
    pub fn compile(&self, name: Option<&str>) -> Result<()> {
        let atoms: Vec<Atom> = name.map(Atom::symbol).into_iter().collect();
        self.deliver(0, dispatch::verb::COMPILE, &atoms)
    }

    pub fn inlet_count(&self) -> usize {
        self.shared.state.borrow().topology.inlet_count()
    }

    pub fn outlet_count(&self) -> usize {
        self.shared.state.borrow().topology.outlet_count()
    }

    pub fn outlet_port(&self, index: usize) -> Option<PortId> {
        self.shared.outlet_port(index)
    }

    pub fn status(&self) -> ContextState {
        self.shared.state.borrow().status
    }

    pub fn script(&self) -> Option<ScriptFile> {
        self.shared.state.borrow().script.clone()
    }

    /// Live handle count of the active context.
    pub fn handle_count(&self) -> usize {
        self.shared
            .active_context()
            .map_or(0, |ctx| ctx.handles().len())
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> Option<Rc<ExecutionContext>> {
        self.shared.active_context()
    }
}

/// A weak back-reference for primitives bound into a context.
pub(crate) type NodeRef = Weak<NodeShared>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        host::{ConsoleLevel, FsResolver, MemoryHost},
    };
    use std::fs;

    fn fixture(files: &[(&str, &str)]) -> (tempfile::TempDir, Rc<MemoryHost>) {
        let dir = tempfile::tempdir().unwrap();
        for (name, source) in files {
            fs::write(dir.path().join(name), source).unwrap();
        }
        let host = Rc::new(MemoryHost::new(FsResolver::new(vec![dir.path().into()])));
        (dir, host)
    }

    fn node(host: &Rc<MemoryHost>, args: &[&str]) -> Result<ScriptNode> {
        let arguments = args.iter().map(|a| Atom::parse(a)).collect();
        ScriptNode::new(host.clone(), BridgeConfig::default(), arguments)
    }

    #[test]
    fn missing_argument_is_reported() {
        let (_dir, host) = fixture(&[]);
        let err = node(&host, &[]).err().unwrap();
        assert!(matches!(err, BridgeError::MissingScript));
        assert_eq!(host.entries(ConsoleLevel::Error), vec!["Must specify source file."]);

        let err = node(&host, &["3"]).err().unwrap();
        assert!(matches!(err, BridgeError::MissingScript));
    }

    #[test]
    fn unknown_script_is_reported() {
        let (_dir, host) = fixture(&[]);
        let err = node(&host, &["nope.lua"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ScriptNotFound);
        assert_eq!(
            host.entries(ConsoleLevel::Error),
            vec!["Script file 'nope.lua' not found."]
        );
    }

    #[test]
    fn starts_with_one_inlet_and_one_outlet() {
        let (_dir, host) = fixture(&[("empty.lua", "")]);
        let node = node(&host, &["empty.lua"]).unwrap();
        assert_eq!(node.inlet_count(), 1);
        assert_eq!(node.outlet_count(), 1);
        assert_eq!(node.status(), ContextState::Ready);
        assert!(node.script().unwrap().path.ends_with("empty.lua"));
    }

    #[test]
    fn top_level_code_sizes_the_node() {
        let (_dir, host) = fixture(&[("ports.lua", "inlets = 3\noutlets = 2\ncount = inlets")]);
        let node = node(&host, &["ports.lua"]).unwrap();
        assert_eq!(node.inlet_count(), 3);
        assert_eq!(node.outlet_count(), 2);

        let ctx = node.context().unwrap();
        assert_eq!(ctx.globals().get::<i64>("count").unwrap(), 3);
        // reserved names are never stored as plain globals
        assert!(matches!(ctx.globals().raw_get::<Value>("inlets").unwrap(), Value::Nil));
    }

    #[test]
    fn jsarguments_reflect_construction_arguments() {
        let (_dir, host) = fixture(&[(
            "args.lua",
            "seen = #jsarguments\nfirst = jsarguments[1]\nsecond = jsarguments[2]\njsarguments = 5",
        )]);
        let node = node(&host, &["args.lua", "7", "name"]).unwrap();
        let globals = node.context().unwrap().globals();
        assert_eq!(globals.get::<i64>("seen").unwrap(), 3);
        assert_eq!(globals.get::<String>("first").unwrap(), "args.lua");
        assert_eq!(globals.get::<i64>("second").unwrap(), 7);
        let still: mlua::Table = globals.get("jsarguments").unwrap();
        assert_eq!(still.raw_len(), 3);
    }

    #[test]
    fn finalizers_may_resize_during_reserved_reads() {
        let (_dir, host) = fixture(&[(
            "gc.lua",
            r#"
collectgarbage("incremental", 0, 1000)
for i = 1, 2000 do
    setmetatable({}, { __gc = function() outlets = 2 end })
    local args = jsarguments
    local name = messagename
end
collectgarbage()
collectgarbage()
"#,
        )]);
        let node = node(&host, &["gc.lua", "a", "b"]).unwrap();
        assert_eq!(node.status(), ContextState::Ready);
        assert_eq!(node.outlet_count(), 2);
    }

    #[test]
    fn compile_error_is_reported_with_location() {
        let (_dir, host) = fixture(&[("bad.lua", "x = = 1")]);
        let err = node(&host, &["bad.lua"]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert!(host.entries(ConsoleLevel::Error)[0].contains("bad.lua:1:"));
    }
}
