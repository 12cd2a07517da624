/// `message/codec.rs` — atoms <-> Lua values
///
/// Value codec (one atom / one value) and message codec (whole argument
/// lists, handle pairs, selector inference). Arrays flatten depth-first on
/// the way out: the host has no nested lists.
use mlua::{Lua, Result as LuaResult, Table, Value};

use super::atom::{selector, Atom, Message};
use crate::{error::BridgeError, scripting::handles::HandleRegistry};

// ── Value codec ───────────────────────────────────────────────────────────────

/// Encode one atom. Integral numbers become Lua integers.
pub fn atom_to_value(lua: &Lua, atom: &Atom) -> LuaResult<Value> {
    match atom {
        Atom::Number(n) => Ok(number_to_value(*n)),
        Atom::Symbol(s) => Ok(Value::String(lua.create_string(s)?)),
    }
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Integer(n as i64)
    } else {
        Value::Number(n)
    }
}

/// Decode one value, appending its atoms to `out`.
pub fn value_to_atoms(
    lua: &Lua,
    handles: &HandleRegistry,
    value: &Value,
    out: &mut Vec<Atom>,
) -> LuaResult<()> {
    match value {
        Value::Nil => {}
        Value::Boolean(b) => out.push(Atom::Number(if *b { 1.0 } else { 0.0 })),
        Value::Integer(i) => out.push(Atom::Number(*i as f64)),
        Value::Number(n) => out.push(Atom::Number(*n)),
        Value::String(s) => out.push(Atom::Symbol(s.to_string_lossy())),
        Value::Table(t) if is_array(t)? => {
            for i in 1..=t.raw_len() {
                let item: Value = t.raw_get(i)?;
                value_to_atoms(lua, handles, &item, out)?;
            }
        }
        Value::Table(_) | Value::Function(_) | Value::Thread(_) | Value::UserData(_) => {
            let token = handles.mint_or_reuse(lua, value)?;
            out.extend(HandleRegistry::encode(token));
        }
        other => {
            log::debug!("[codec] dropping unsupported {} value", other.type_name());
        }
    }
    Ok(())
}

/// A table with no metatable whose keys are exactly `1..n`, `n >= 1`.
pub fn is_array(table: &Table) -> LuaResult<bool> {
    if table.get_metatable().is_some() {
        return Ok(false);
    }
    let len = table.raw_len();
    if len == 0 {
        return Ok(false);
    }
    let mut count = 0usize;
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, _) = pair?;
        match key {
            Value::Integer(i) if i >= 1 && (i as usize) <= len => count += 1,
            _ => return Ok(false),
        }
    }
    Ok(count == len)
}

// ── Message codec ─────────────────────────────────────────────────────────────

/// Convert an inbound payload. `jsobject <token>` pairs collapse to the
/// referenced object; a stale token drops the pair (argument omitted).
pub fn args_to_values(lua: &Lua, handles: &HandleRegistry, atoms: &[Atom]) -> LuaResult<Vec<Value>> {
    let mut values = Vec::with_capacity(atoms.len());
    let mut i = 0;
    while i < atoms.len() {
        let atom = &atoms[i];
        if atom.as_symbol() == Some(selector::JSOBJECT) {
            if let Some(token) = atoms.get(i + 1).and_then(HandleRegistry::parse_token) {
                match handles.resolve(lua, token)? {
                    Some(value) => values.push(value),
                    None => log::warn!(
                        "[codec] {} Argument omitted.",
                        BridgeError::StaleHandleToken(token)
                    ),
                }
                i += 2;
                continue;
            }
        }
        values.push(atom_to_value(lua, atom)?);
        i += 1;
    }
    Ok(values)
}

/// Decode each value and concatenate the atoms.
pub fn values_to_args(lua: &Lua, handles: &HandleRegistry, values: &[Value]) -> LuaResult<Vec<Atom>> {
    let mut atoms = Vec::new();
    for value in values {
        value_to_atoms(lua, handles, value, &mut atoms)?;
    }
    Ok(atoms)
}

/// Pick the selector for a decoded atom list.
///
/// One number -> `float`, one symbol -> that symbol (so `bang` -> `bang`),
/// anything else -> `list`. A leading atom equal to the selector is dropped
/// from the payload.
pub fn infer_selector(mut atoms: Vec<Atom>) -> Message {
    let sel = match atoms.as_slice() {
        [Atom::Number(_)] => selector::FLOAT.to_string(),
        [Atom::Symbol(s)] => s.clone(),
        _ => selector::LIST.to_string(),
    };
    if atoms.first().and_then(Atom::as_symbol) == Some(sel.as_str()) {
        atoms.remove(0);
    }
    Message::new(sel, atoms)
}

/// Build the outbound message for `outlet(...)` / `messnamed(...)` values.
///
/// Single-value shortcuts avoid one-element lists. Returns `None` when the
/// values decode to nothing.
pub fn values_to_message(lua: &Lua, handles: &HandleRegistry, values: &[Value]) -> LuaResult<Option<Message>> {
    if let [value] = values {
        match value {
            Value::Integer(i) => return Ok(Some(Message::float(*i as f64))),
            Value::Number(n) => return Ok(Some(Message::float(*n))),
            Value::String(s) => {
                let s = s.to_string_lossy();
                return Ok(Some(if s == selector::BANG {
                    Message::bang()
                } else {
                    Message::symbol(s)
                }));
            }
            Value::Table(t) if is_array(t)? => {}
            Value::Table(_) | Value::Function(_) | Value::Thread(_) | Value::UserData(_) => {
                let token = handles.mint_or_reuse(lua, value)?;
                let [_, tail] = HandleRegistry::encode(token);
                return Ok(Some(Message::new(selector::JSOBJECT, vec![tail])));
            }
            _ => {}
        }
    }

    let atoms = values_to_args(lua, handles, values)?;
    if atoms.is_empty() {
        return Ok(None);
    }
    Ok(Some(infer_selector(atoms)))
}
