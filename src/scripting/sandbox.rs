/// `scripting/sandbox.rs` — Lua sandbox restrictions per execution context
///
/// Every context VM is created with a restricted set of standard libraries.
/// I/O, OS and the native package loader are omitted by default; the bridge
/// injects its own `include`/`require` instead.
use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib};
use serde::{Deserialize, Serialize};

/// Controls which Lua standard libraries are available to a script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Default: string, table, math, utf8 and coroutine. No I/O or OS.
    #[default]
    Basic,
    /// Basic + io (scripts that read data files next to the patch)
    FileRead,
    /// Basic + io + os + package, for trusted patches only
    Elevated,
}

impl TrustLevel {
    pub fn libs(&self) -> StdLib {
        let basic = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        match self {
            TrustLevel::Basic => basic,
            TrustLevel::FileRead => basic | StdLib::IO,
            TrustLevel::Elevated => basic | StdLib::IO | StdLib::OS | StdLib::PACKAGE,
        }
    }
}

/// Creates a new Lua VM with sandbox restrictions applied.
pub fn create_sandboxed_vm(trust: &TrustLevel) -> LuaResult<Lua> {
    Lua::new_with(trust.libs(), LuaOptions::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Value;

    fn global_is_nil(lua: &Lua, name: &str) -> bool {
        matches!(lua.globals().get::<Value>(name).unwrap(), Value::Nil)
    }

    #[test]
    fn basic_has_no_io_or_os() {
        let lua = create_sandboxed_vm(&TrustLevel::Basic).unwrap();
        assert!(global_is_nil(&lua, "io"));
        assert!(global_is_nil(&lua, "os"));
        assert!(!global_is_nil(&lua, "string"));
        assert!(!global_is_nil(&lua, "math"));
    }

    #[test]
    fn elevated_loads_os() {
        let lua = create_sandboxed_vm(&TrustLevel::Elevated).unwrap();
        assert!(!global_is_nil(&lua, "os"));
        assert!(!global_is_nil(&lua, "io"));
    }
}
