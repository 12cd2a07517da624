/// `scripting/api.rs` — registers the host primitives in a context
///
/// Provides the script-facing surface of a node:
///   post, cpost, error, outlet, messnamed, include, require
/// plus the reserved globals (`inlets`, `outlets`, `inlet`, `messagename`,
/// `jsarguments`) served through a metatable on the globals table.
///
/// Every primitive holds only a weak reference to its node. Once the node
/// is gone the primitives quietly do nothing.
use std::{path::Path, rc::Rc};

use mlua::{Lua, Result as LuaResult, Table, Value, Variadic};

use super::{context, handles::HandleRegistry};
use crate::{message::codec, node::NodeRef};

/// Names backed by node state instead of plain globals.
pub mod reserved {
    pub const INLETS: &str = "inlets";
    pub const OUTLETS: &str = "outlets";
    pub const INLET: &str = "inlet";
    pub const MESSAGENAME: &str = "messagename";
    pub const JSARGUMENTS: &str = "jsarguments";
}

/// Bind all primitives into a fresh state.
///
/// `script_dir` is searched first by `include` and `require`.
pub(crate) fn register_all(
    lua: &Lua,
    handles: &Rc<HandleRegistry>,
    node: NodeRef,
    script_dir: &Path,
) -> LuaResult<()> {
    register_console(lua, &node)?;
    register_outlets(lua, handles, &node)?;
    register_loader(lua, &node, script_dir)?;
    register_reserved(lua, node)?;
    Ok(())
}

// ── console ───────────────────────────────────────────────────────────────────

fn register_console(lua: &Lua, node: &NodeRef) -> LuaResult<()> {
    let globals = lua.globals();

    macro_rules! sink_fn {
        ($sink:ident) => {{
            let node = node.clone();
            lua.create_function(move |_, args: Variadic<Value>| {
                let Some(node) = node.upgrade() else {
                    return Ok(());
                };
                let text = join_display(&args);
                log::debug!("[script][{}] {}", stringify!($sink), text);
                node.host.$sink(&text);
                Ok(())
            })?
        }};
    }

    globals.set("post", sink_fn!(post))?;
    globals.set("cpost", sink_fn!(console))?;
    globals.set("error", sink_fn!(report_error))?;
    Ok(())
}

// ── outlet / messnamed ────────────────────────────────────────────────────────

fn register_outlets(lua: &Lua, handles: &Rc<HandleRegistry>, node: &NodeRef) -> LuaResult<()> {
    let globals = lua.globals();

    let outlet = {
        let node = node.clone();
        let handles = Rc::clone(handles);
        lua.create_function(move |lua, args: Variadic<Value>| {
            let Some(node) = node.upgrade() else {
                return Ok(());
            };
            let Some((first, rest)) = args.split_first() else {
                return Ok(());
            };
            let Some(index) = value_to_integer(first).and_then(|i| usize::try_from(i).ok()) else {
                log::debug!("[script] outlet index must be a number");
                return Ok(());
            };
            let Some(port) = node.outlet_port(index) else {
                log::debug!("[script] no outlet {index}");
                return Ok(());
            };
            if let Some(message) = codec::values_to_message(lua, &handles, rest)? {
                node.host.emit(port, &message);
            }
            Ok(())
        })?
    };
    globals.set("outlet", outlet)?;

    let messnamed = {
        let node = node.clone();
        let handles = Rc::clone(handles);
        lua.create_function(move |lua, args: Variadic<Value>| {
            let Some(node) = node.upgrade() else {
                return Ok(());
            };
            let Some((first, rest)) = args.split_first() else {
                return Ok(());
            };
            let name = display_value(first);
            if let Some(message) = codec::values_to_message(lua, &handles, rest)? {
                if !node.host.send_named(&name, &message) {
                    log::debug!("[script] nothing bound to '{name}'");
                }
            }
            Ok(())
        })?
    };
    globals.set("messnamed", messnamed)?;
    Ok(())
}

// ── include / require ─────────────────────────────────────────────────────────

fn register_loader(lua: &Lua, node: &NodeRef, script_dir: &Path) -> LuaResult<()> {
    let globals = lua.globals();

    let include = {
        let node = node.clone();
        let dir = script_dir.to_path_buf();
        lua.create_function(move |lua, (name, receiver): (Value, Value)| {
            let (Some(node), Value::String(name)) = (node.upgrade(), name) else {
                return Ok(());
            };
            let receiver = match receiver {
                Value::Table(t) => Some(t),
                _ => None,
            };
            let result = node
                .resolve_relative(&dir, &name.to_string_lossy())
                .and_then(|script| context::include(lua, &script, receiver.as_ref()));
            if let Err(err) = result {
                node.report(&err);
            }
            Ok(())
        })?
    };
    globals.set("include", include)?;

    let require = {
        let node = node.clone();
        let dir = script_dir.to_path_buf();
        lua.create_function(move |lua, name: Value| {
            let (Some(node), Value::String(name)) = (node.upgrade(), name) else {
                return Ok(Value::Nil);
            };
            let result = node
                .resolve_relative(&dir, &name.to_string_lossy())
                .and_then(|script| context::require(lua, &script));
            match result {
                Ok(exports) => Ok(exports),
                Err(err) => {
                    node.report(&err);
                    Ok(Value::Nil)
                }
            }
        })?
    };
    globals.set("require", require)?;
    Ok(())
}

// ── reserved globals ──────────────────────────────────────────────────────────

/// Install `__index` / `__newindex` on the globals table. Only names that
/// are not already raw globals reach the traps, so reserved names must
/// never be raw-set.
fn register_reserved(lua: &Lua, node: NodeRef) -> LuaResult<()> {
    let meta = lua.create_table()?;

    let index = {
        let node = node.clone();
        lua.create_function(move |lua, (_, key): (Table, Value)| {
            let (Some(node), Value::String(key)) = (node.upgrade(), key) else {
                return Ok(Value::Nil);
            };
            Ok(node
                .read_reserved(lua, &key.to_string_lossy())?
                .unwrap_or(Value::Nil))
        })?
    };

    let newindex = lua.create_function(move |_, (globals, key, value): (Table, Value, Value)| {
        if let Value::String(name) = &key {
            if let Some(node) = node.upgrade() {
                if node.write_reserved(&name.to_string_lossy(), &value) {
                    return Ok(());
                }
            }
        }
        globals.raw_set(key, value)
    })?;

    meta.raw_set("__index", index)?;
    meta.raw_set("__newindex", newindex)?;
    lua.globals().set_metatable(Some(meta));
    Ok(())
}

// ── helpers ───────────────────────────────────────────────────────────────────

/// Numeric coercion used for port counts and outlet indices.
pub(crate) fn value_to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.is_finite() => Some(n.trunc() as i64),
        Value::String(s) => s
            .to_str()
            .ok()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(|n| n.trunc() as i64),
        _ => None,
    }
}

fn join_display(values: &[Value]) -> String {
    values.iter().map(display_value).collect::<Vec<_>>().join(" ")
}

/// Text form of a value for console output. Arrays print comma-separated.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy(),
        Value::Table(t) if codec::is_array(t).unwrap_or(false) => (1..=t.raw_len())
            .map(|i| t.raw_get::<Value>(i).map(|v| display_value(&v)).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(","),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_coercion() {
        let lua = Lua::new();
        assert_eq!(value_to_integer(&Value::Integer(3)), Some(3));
        assert_eq!(value_to_integer(&Value::Number(2.9)), Some(2));
        assert_eq!(value_to_integer(&Value::Number(f64::NAN)), None);
        let s = Value::String(lua.create_string(" 4 ").unwrap());
        assert_eq!(value_to_integer(&s), Some(4));
        let s = Value::String(lua.create_string("four").unwrap());
        assert_eq!(value_to_integer(&s), None);
        assert_eq!(value_to_integer(&Value::Boolean(true)), None);
    }

    #[test]
    fn display_joins_arrays_with_commas() {
        let lua = Lua::new();
        let list: Value = lua.load("{ 'a', 1, 2.5 }").eval().unwrap();
        assert_eq!(display_value(&list), "a,1,2.5");
        assert_eq!(display_value(&Value::Nil), "nil");

        let obj: Value = lua.load("{ x = 1 }").eval().unwrap();
        assert!(display_value(&obj).starts_with("table: 0x"));
    }
}
