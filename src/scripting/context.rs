/// `scripting/context.rs` — execution contexts
///
/// One `ExecutionContext` per node: a sandboxed Lua state, its handle
/// registry and the script it was built from. Loading a script compiles
/// the file to a function, then runs it; compile and run failures are
/// reported separately.
///
/// `include` runs another file in the same state. With a receiver table
/// the file runs in a scope where the receiver shadows the globals and new
/// names land on the receiver, which is how `require` gives files a module
/// contract without touching the shared globals.
use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use mlua::{Function, Lua, Result as LuaResult, Table, Value};
use serde::Serialize;

use super::{
    diagnostic::ScriptDiagnostic,
    handles::HandleRegistry,
    sandbox::{create_sandboxed_vm, TrustLevel},
};
use crate::{
    error::{BridgeError, Result},
    host::ScriptFile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Unloaded,
    Loading,
    Ready,
    Reloading,
    Failed,
}

/// Every file executed in a state, kept as Lua app data so diagnostics can
/// restore chunk names Lua shortened.
#[derive(Default)]
struct LoadedScripts(RefCell<Vec<PathBuf>>);

fn remember(lua: &Lua, path: &Path) {
    if let Some(loaded) = lua.app_data_ref::<LoadedScripts>() {
        let mut paths = loaded.0.borrow_mut();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_path_buf());
        }
    }
}

/// Files executed so far in `lua`, main script first.
pub fn loaded_scripts(lua: &Lua) -> Vec<PathBuf> {
    lua.app_data_ref::<LoadedScripts>()
        .map(|loaded| loaded.0.borrow().clone())
        .unwrap_or_default()
}

pub struct ExecutionContext {
    lua: Lua,
    handles: Rc<HandleRegistry>,
    script: ScriptFile,
}

impl ExecutionContext {
    /// Build a fresh state for `script`. `install` binds the host primitives.
    pub fn new<F>(script: ScriptFile, trust: &TrustLevel, install: F) -> Result<Self>
    where
        F: FnOnce(&Lua, &Rc<HandleRegistry>) -> LuaResult<()>,
    {
        let lua = create_sandboxed_vm(trust)?;
        lua.set_app_data(LoadedScripts::default());
        let handles = Rc::new(HandleRegistry::install(&lua)?);
        install(&lua, &handles)?;
        Ok(Self {
            lua,
            handles,
            script,
        })
    }

    /// Compile and run the script's top-level code against the globals.
    pub fn run_main(&self) -> Result<()> {
        execute(&self.lua, &self.script, None).map(|_| ())
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn handles(&self) -> &Rc<HandleRegistry> {
        &self.handles
    }

    pub fn script(&self) -> &ScriptFile {
        &self.script
    }

    pub fn globals(&self) -> Table {
        self.lua.globals()
    }

    pub fn loaded_scripts(&self) -> Vec<PathBuf> {
        loaded_scripts(&self.lua)
    }
}

/// Read, compile and run `script`, returning the chunk's first result.
pub fn execute(lua: &Lua, script: &ScriptFile, receiver: Option<&Table>) -> Result<Value> {
    let source = fs::read_to_string(&script.path).map_err(|source| BridgeError::ScriptRead {
        path: script.path.clone(),
        source,
    })?;

    remember(lua, &script.path);
    let mut chunk = lua.load(source.as_str()).set_name(chunk_name(&script.path));
    if let Some(receiver) = receiver {
        chunk = chunk.set_environment(scoped_env(lua, receiver)?);
    }

    let function: Function = chunk.into_function().map_err(|e| BridgeError::Compile {
        path: script.path.clone(),
        diagnostic: ScriptDiagnostic::for_scripts(&e, &loaded_scripts(lua)),
    })?;

    let result = match receiver {
        Some(receiver) => function.call::<Value>(receiver.clone()),
        None => function.call::<Value>(()),
    };
    result.map_err(|e| BridgeError::Runtime {
        during: format!("running '{}'", script.path.display()),
        diagnostic: ScriptDiagnostic::for_scripts(&e, &loaded_scripts(lua)),
    })
}

/// Run `script` in the current state without creating a new context.
pub fn include(lua: &Lua, script: &ScriptFile, receiver: Option<&Table>) -> Result<()> {
    log::debug!("[context] include {}", script.path.display());
    execute(lua, script, receiver).map(|_| ())
}

/// Run `script` as a module and return its exports.
///
/// The file sees a fresh `exports` table. A chunk that returns a non-nil
/// value exports that value instead.
pub fn require(lua: &Lua, script: &ScriptFile) -> Result<Value> {
    let module = lua.create_table()?;
    module.set("exports", lua.create_table()?)?;
    match execute(lua, script, Some(&module))? {
        Value::Nil => Ok(module.get("exports")?),
        returned => Ok(returned),
    }
}

const SCOPE_CHUNK: &str = r#"
local receiver, globals = ...
return setmetatable({}, {
    __index = function(_, key)
        local value = receiver[key]
        if value == nil then
            value = globals[key]
        end
        return value
    end,
    __newindex = receiver,
})
"#;

/// Environment where reads hit `receiver` then the globals and writes hit `receiver`.
fn scoped_env(lua: &Lua, receiver: &Table) -> LuaResult<Table> {
    lua.load(SCOPE_CHUNK)
        .set_name("=scope")
        .into_function()?
        .call((receiver.clone(), lua.globals()))
}

fn chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn write(dir: &Path, name: &str, source: &str) -> ScriptFile {
        let path = dir.join(name);
        fs::write(&path, source).unwrap();
        ScriptFile::new(path)
    }

    fn context(script: ScriptFile) -> ExecutionContext {
        ExecutionContext::new(script, &TrustLevel::Basic, |_, _| Ok(())).unwrap()
    }

    #[test]
    fn run_main_defines_globals() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(write(dir.path(), "main.lua", "counter = 41 + 1\nfunction bang() end"));
        ctx.run_main().unwrap();
        assert_eq!(ctx.globals().get::<i64>("counter").unwrap(), 42);
        assert!(matches!(ctx.globals().get::<Value>("bang").unwrap(), Value::Function(_)));
    }

    #[test]
    fn compile_and_runtime_errors_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let broken = context(write(dir.path(), "broken.lua", "x = = 1"));
        let err = broken.run_main().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert!(err.to_string().contains("broken.lua:1:"));

        let throws = context(write(dir.path(), "throws.lua", "local t = nil\nt.field = 1"));
        let err = throws.run_main().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        match err {
            BridgeError::Runtime { diagnostic, .. } => {
                assert_eq!(diagnostic.line, Some(2));
                assert_eq!(diagnostic.source_line.as_deref(), Some("t.field = 1"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(ScriptFile::new(dir.path().join("gone.lua")));
        assert!(matches!(ctx.run_main(), Err(BridgeError::ScriptRead { .. })));
    }

    #[test]
    fn include_shares_globals() {
        let dir = tempfile::tempdir().unwrap();
        let lib = write(dir.path(), "lib.lua", "shared = (shared or 0) + 1");
        let ctx = context(write(dir.path(), "main.lua", ""));
        include(ctx.lua(), &lib, None).unwrap();
        include(ctx.lua(), &lib, None).unwrap();
        assert_eq!(ctx.globals().get::<i64>("shared").unwrap(), 2);
    }

    #[test]
    fn include_with_receiver_keeps_globals_clean() {
        let dir = tempfile::tempdir().unwrap();
        let lib = write(dir.path(), "lib.lua", "name = 'voice'\nscaled = gain * 2");
        let ctx = context(write(dir.path(), "main.lua", ""));
        ctx.globals().set("gain", 3).unwrap();

        let receiver = ctx.lua().create_table().unwrap();
        include(ctx.lua(), &lib, Some(&receiver)).unwrap();

        assert_eq!(receiver.get::<String>("name").unwrap(), "voice");
        assert_eq!(receiver.get::<i64>("scaled").unwrap(), 6);
        assert!(matches!(ctx.globals().get::<Value>("name").unwrap(), Value::Nil));
    }

    #[test]
    fn require_returns_exports() {
        let dir = tempfile::tempdir().unwrap();
        let exports_style = write(
            dir.path(),
            "util.lua",
            "exports.double = function(x) return x * 2 end\nhelper = true",
        );
        let return_style = write(dir.path(), "mod.lua", "return { answer = 42 }");
        let ctx = context(write(dir.path(), "main.lua", ""));

        let util = match require(ctx.lua(), &exports_style).unwrap() {
            Value::Table(t) => t,
            other => panic!("expected table, got {other:?}"),
        };
        let double: Function = util.get("double").unwrap();
        assert_eq!(double.call::<i64>(21).unwrap(), 42);
        assert!(matches!(ctx.globals().get::<Value>("helper").unwrap(), Value::Nil));

        match require(ctx.lua(), &return_style).unwrap() {
            Value::Table(t) => assert_eq!(t.get::<i64>("answer").unwrap(), 42),
            other => panic!("expected table, got {other:?}"),
        }
    }
}
