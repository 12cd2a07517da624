/// `scripting/handles.rs` — opaque object handles
///
/// Lua objects that cannot be flattened into atoms cross the host as the
/// two-atom form `jsobject <token>`. The registry keeps only weak Lua-side
/// references: an objects table with weak values (token -> object) and an
/// ephemeron anchors table (object -> sentinel userdata).
///
/// When the collector reclaims an object, its sentinel becomes unreachable
/// too and the sentinel's `Drop` pushes the token onto the reclaim queue.
/// That is the only path driven by the garbage collector; it never touches
/// the Lua state.
///
/// Tokens come from one process-wide counter, so a token minted by another
/// node, or by this node before a reload, is unknown here rather than
/// aliasing a different object.
use std::{
    cell::RefCell,
    collections::BTreeSet,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use mlua::{Lua, Result as LuaResult, Table, UserData, Value};

use crate::message::atom::{selector, Atom};

pub type HandleToken = u64;

const OBJECTS_KEY: &str = "patchlua.handles.objects";
const ANCHORS_KEY: &str = "patchlua.handles.anchors";

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> HandleToken {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Tokens whose objects were collected, waiting to be dropped from the registry.
#[derive(Debug, Clone, Default)]
pub struct ReclaimQueue(Rc<RefCell<Vec<HandleToken>>>);

impl ReclaimQueue {
    /// Finalizer callback. Runs during a collector pass: no Lua calls allowed here.
    pub fn on_reclaim(&self, token: HandleToken) {
        self.0.borrow_mut().push(token);
    }

    fn drain(&self) -> Vec<HandleToken> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

/// Anchored to a registered object through the ephemeron table.
struct HandleSentinel {
    token: HandleToken,
    queue: ReclaimQueue,
}

impl UserData for HandleSentinel {}

impl Drop for HandleSentinel {
    fn drop(&mut self) {
        self.queue.on_reclaim(self.token);
    }
}

/// Sole owner of the token table for one execution context.
#[derive(Debug)]
pub struct HandleRegistry {
    live: RefCell<BTreeSet<HandleToken>>,
    reclaimed: ReclaimQueue,
}

impl HandleRegistry {
    /// Create the weak tables inside `lua` and return the registry bound to them.
    pub fn install(lua: &Lua) -> LuaResult<Self> {
        let objects: Table = lua
            .load("return setmetatable({}, { __mode = 'v' })")
            .set_name("=handles")
            .eval()?;
        let anchors: Table = lua
            .load("return setmetatable({}, { __mode = 'k' })")
            .set_name("=handles")
            .eval()?;
        lua.set_named_registry_value(OBJECTS_KEY, objects)?;
        lua.set_named_registry_value(ANCHORS_KEY, anchors)?;

        Ok(Self {
            live: RefCell::new(BTreeSet::new()),
            reclaimed: ReclaimQueue::default(),
        })
    }

    /// Token for `value`, reusing the existing one while the object is alive.
    pub fn mint_or_reuse(&self, lua: &Lua, value: &Value) -> LuaResult<HandleToken> {
        self.collect_reclaimed();
        let anchors: Table = lua.named_registry_value(ANCHORS_KEY)?;

        if let Value::UserData(ud) = anchors.raw_get::<Value>(value.clone())? {
            if let Ok(sentinel) = ud.borrow::<HandleSentinel>() {
                return Ok(sentinel.token);
            }
        }

        let token = next_token();

        let sentinel = lua.create_userdata(HandleSentinel {
            token,
            queue: self.reclaimed.clone(),
        })?;
        let objects: Table = lua.named_registry_value(OBJECTS_KEY)?;
        anchors.raw_set(value.clone(), sentinel)?;
        objects.raw_set(token, value.clone())?;
        self.live.borrow_mut().insert(token);

        log::debug!("[handles] minted token {token} for {}", value.type_name());
        Ok(token)
    }

    /// Object behind `token`, or `None` once it has been reclaimed.
    pub fn resolve(&self, lua: &Lua, token: HandleToken) -> LuaResult<Option<Value>> {
        self.collect_reclaimed();
        if !self.live.borrow().contains(&token) {
            return Ok(None);
        }
        let objects: Table = lua.named_registry_value(OBJECTS_KEY)?;
        match objects.raw_get::<Value>(token)? {
            // Cleared by the collector; the sentinel's finalizer has not run yet.
            Value::Nil => Ok(None),
            value => Ok(Some(value)),
        }
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.collect_reclaimed();
        self.live.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect_reclaimed(&self) {
        let tokens = self.reclaimed.drain();
        if tokens.is_empty() {
            return;
        }
        let mut live = self.live.borrow_mut();
        for token in tokens {
            live.remove(&token);
            log::debug!("[handles] token {token} reclaimed");
        }
    }

    /// The `jsobject <token>` atom pair.
    pub fn encode(token: HandleToken) -> [Atom; 2] {
        [Atom::symbol(selector::JSOBJECT), Atom::Symbol(token.to_string())]
    }

    /// Token encoded in the second atom of a handle pair.
    pub fn parse_token(atom: &Atom) -> Option<HandleToken> {
        atom.as_symbol()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Lua, HandleRegistry) {
        let lua = Lua::new();
        let handles = HandleRegistry::install(&lua).unwrap();
        (lua, handles)
    }

    #[test]
    fn same_object_reuses_token() {
        let (lua, handles) = setup();
        let obj = Value::Table(lua.create_table().unwrap());
        let other = Value::Table(lua.create_table().unwrap());

        let first = handles.mint_or_reuse(&lua, &obj).unwrap();
        let again = handles.mint_or_reuse(&lua, &obj).unwrap();
        let second = handles.mint_or_reuse(&lua, &other).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, second);
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn resolve_returns_the_registered_object() {
        let (lua, handles) = setup();
        let table = lua.create_table().unwrap();
        table.set("name", "osc").unwrap();
        let token = handles.mint_or_reuse(&lua, &Value::Table(table)).unwrap();

        match handles.resolve(&lua, token).unwrap() {
            Some(Value::Table(t)) => assert_eq!(t.get::<String>("name").unwrap(), "osc"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handles.resolve(&lua, token + 100).unwrap().is_none());
    }

    #[test]
    fn reclaimed_object_invalidates_token() {
        let (lua, handles) = setup();
        let token = {
            let obj = Value::Table(lua.create_table().unwrap());
            handles.mint_or_reuse(&lua, &obj).unwrap()
        };

        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();

        assert!(handles.resolve(&lua, token).unwrap().is_none());
        assert!(handles.is_empty());

        // Tokens are never handed out twice.
        let fresh = Value::Table(lua.create_table().unwrap());
        let next = handles.mint_or_reuse(&lua, &fresh).unwrap();
        assert!(next > token);
    }

    #[test]
    fn registries_never_share_tokens() {
        let (lua_a, handles_a) = setup();
        let (lua_b, handles_b) = setup();
        let a = handles_a
            .mint_or_reuse(&lua_a, &Value::Table(lua_a.create_table().unwrap()))
            .unwrap();
        let b = handles_b
            .mint_or_reuse(&lua_b, &Value::Table(lua_b.create_table().unwrap()))
            .unwrap();

        assert_ne!(a, b);
        assert!(handles_b.resolve(&lua_b, a).unwrap().is_none());
        assert!(handles_a.resolve(&lua_a, b).unwrap().is_none());
    }

    #[test]
    fn token_atoms_round_trip() {
        let [head, tail] = HandleRegistry::encode(42);
        assert_eq!(head, Atom::symbol("jsobject"));
        assert_eq!(HandleRegistry::parse_token(&tail), Some(42));
        assert_eq!(HandleRegistry::parse_token(&Atom::Number(42.0)), None);
    }
}
