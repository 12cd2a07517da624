/// `node/dispatch.rs` — routes inbound messages to script handlers
///
/// Control verbs (`compile`, `setprop`, `getprop`, `delprop`) are handled by
/// the node itself and never reach the script. Everything else looks up a
/// global handler named after the selector (`msg_float` for `float`),
/// falling back to `anything`. `loadbang` never falls back and a missing
/// `loadbang` handler is not an error.
use std::borrow::Cow;
use std::rc::Rc;

use mlua::{Function, MultiValue, Result as LuaResult, Table, Value};

use super::NodeShared;
use crate::{
    error::{BridgeError, Result},
    message::{codec, selector, Atom},
    scripting::diagnostic::ScriptDiagnostic,
};

pub mod verb {
    pub const COMPILE: &str = "compile";
    pub const SETPROP: &str = "setprop";
    pub const GETPROP: &str = "getprop";
    pub const DELPROP: &str = "delprop";
}

/// Handler probed for `float` messages.
pub const NUMERIC_HANDLER: &str = "msg_float";
/// Handler tried when no handler matches the selector.
pub const FALLBACK_HANDLER: &str = "anything";
/// Field that marks a callable table as not invocable from the patch.
pub const PRIVATE_MARKER: &str = "private";

#[derive(Debug, Clone, PartialEq)]
pub enum ControlVerb {
    /// Reload, or load a different script after resetting the topology.
    Compile(Option<String>),
    SetProp { name: String, values: Vec<Atom> },
    GetProp(String),
    DelProp(String),
    /// A control verb with unusable arguments; consumed without effect.
    Malformed(&'static str),
}

impl ControlVerb {
    pub fn parse(sel: &str, atoms: &[Atom]) -> Option<Self> {
        let name = atoms.first().and_then(Atom::as_symbol).map(str::to_string);
        let verb = match (sel, name) {
            (verb::COMPILE, name) => ControlVerb::Compile(name),
            (verb::SETPROP, Some(name)) if atoms.len() > 1 => ControlVerb::SetProp {
                name,
                values: atoms[1..].to_vec(),
            },
            (verb::GETPROP, Some(name)) => ControlVerb::GetProp(name),
            (verb::DELPROP, Some(name)) => ControlVerb::DelProp(name),
            (verb::SETPROP, _) => ControlVerb::Malformed(verb::SETPROP),
            (verb::GETPROP, None) => ControlVerb::Malformed(verb::GETPROP),
            (verb::DELPROP, None) => ControlVerb::Malformed(verb::DELPROP),
            _ => return None,
        };
        Some(verb)
    }
}

enum Callable {
    Function(Function),
    Object { table: Table, call: Function },
}

/// A resolved script handler.
pub struct Handler {
    name: String,
    target: Callable,
}

impl Handler {
    /// Read global `name` without triggering the reserved-name traps.
    /// Functions and tables with a `__call` metamethod qualify.
    fn from_globals(globals: &Table, name: &str) -> LuaResult<Option<Self>> {
        let target = match globals.raw_get::<Value>(name)? {
            Value::Function(f) => Callable::Function(f),
            Value::Table(table) => {
                let call = match table.get_metatable() {
                    Some(meta) => meta.raw_get::<Value>("__call")?,
                    None => Value::Nil,
                };
                match call {
                    Value::Function(call) => Callable::Object { table, call },
                    _ => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(Self {
            name: name.to_string(),
            target,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the handler carries a truthy `private` field.
    pub fn is_private(&self) -> LuaResult<bool> {
        match &self.target {
            Callable::Function(_) => Ok(false),
            Callable::Object { table, .. } => Ok(!matches!(
                table.raw_get::<Value>(PRIVATE_MARKER)?,
                Value::Nil | Value::Boolean(false)
            )),
        }
    }

    pub fn invoke(&self, args: Vec<Value>) -> LuaResult<()> {
        match &self.target {
            Callable::Function(f) => f.call::<()>(MultiValue::from_vec(args)),
            Callable::Object { table, call } => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(Value::Table(table.clone()));
                full.extend(args);
                call.call::<()>(MultiValue::from_vec(full))
            }
        }
    }
}

pub enum HandlerLookup {
    Found(Handler),
    FoundFallback(Handler),
    NotFound,
}

pub fn handler_name(sel: &str) -> &str {
    if sel == selector::FLOAT {
        NUMERIC_HANDLER
    } else {
        sel
    }
}

pub fn lookup_handler(globals: &Table, sel: &str) -> LuaResult<HandlerLookup> {
    if let Some(handler) = Handler::from_globals(globals, handler_name(sel))? {
        return Ok(HandlerLookup::Found(handler));
    }
    if sel != selector::LOADBANG {
        if let Some(handler) = Handler::from_globals(globals, FALLBACK_HANDLER)? {
            return Ok(HandlerLookup::FoundFallback(handler));
        }
    }
    Ok(HandlerLookup::NotFound)
}

pub(crate) fn dispatch(node: &Rc<NodeShared>, inlet: usize, sel: &str, atoms: &[Atom]) -> Result<()> {
    if let Some(verb) = ControlVerb::parse(sel, atoms) {
        return run_control_verb(node, verb);
    }

    // Hold our own reference: the handler may reload the node.
    let context = node.active_context().ok_or(BridgeError::NotLoaded)?;
    let handler = match lookup_handler(&context.globals(), sel)? {
        HandlerLookup::Found(handler) => handler,
        HandlerLookup::FoundFallback(handler) => {
            log::trace!("[dispatch] '{sel}' falls back to '{FALLBACK_HANDLER}'");
            handler
        }
        HandlerLookup::NotFound if sel == selector::LOADBANG => return Ok(()),
        HandlerLookup::NotFound => {
            return Err(BridgeError::UnknownHandler(handler_name(sel).to_string()))
        }
    };

    let payload: Cow<[Atom]> = if sel == selector::JSOBJECT {
        let mut full = Vec::with_capacity(atoms.len() + 1);
        full.push(Atom::symbol(selector::JSOBJECT));
        full.extend_from_slice(atoms);
        Cow::Owned(full)
    } else {
        Cow::Borrowed(atoms)
    };
    let args = codec::args_to_values(context.lua(), context.handles(), &payload)?;
    node.record_message(inlet, sel);

    if handler.is_private()? {
        return Err(BridgeError::PrivateHandler(handler.name().to_string()));
    }

    log::debug!("[dispatch] inlet {inlet}: {sel} -> {}", handler.name());
    handler.invoke(args).map_err(|e| BridgeError::Runtime {
        during: format!("calling '{}'", handler.name()),
        diagnostic: ScriptDiagnostic::for_scripts(&e, &context.loaded_scripts()),
    })
}

fn run_control_verb(node: &Rc<NodeShared>, verb: ControlVerb) -> Result<()> {
    log::debug!("[dispatch] control {verb:?}");
    match verb {
        ControlVerb::Compile(Some(name)) => {
            node.reset_topology();
            node.load(Some(&name))
        }
        ControlVerb::Compile(None) => node.load(None),
        ControlVerb::SetProp { name, values } => {
            let context = node.active_context().ok_or(BridgeError::NotLoaded)?;
            let lua = context.lua();
            let mut converted = codec::args_to_values(lua, context.handles(), &values)?;
            let value = if converted.len() == 1 {
                converted.remove(0)
            } else {
                Value::Table(lua.create_sequence_from(converted)?)
            };
            context
                .globals()
                .set(name.as_str(), value)
                .map_err(|source| BridgeError::Property { name, source })
        }
        ControlVerb::GetProp(name) => {
            let context = node.active_context().ok_or(BridgeError::NotLoaded)?;
            let value: Value = context.globals().get(name.as_str())?;
            if value.is_nil() {
                return Ok(());
            }
            let Some(port) = node.outlet_port(0) else {
                return Ok(());
            };
            if let Some(message) = codec::values_to_message(context.lua(), context.handles(), &[value])? {
                node.host.emit(port, &message);
            }
            Ok(())
        }
        ControlVerb::DelProp(name) => {
            let context = node.active_context().ok_or(BridgeError::NotLoaded)?;
            context.globals().raw_set(name.as_str(), Value::Nil)?;
            Ok(())
        }
        ControlVerb::Malformed(verb) => {
            log::warn!("[dispatch] ignoring '{verb}' without a property name");
            Ok(())
        }
    }
}
