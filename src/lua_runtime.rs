//! Sandboxed Lua 5.4 VM used to host the sync engine script.
//!
//! The VM runs on a blocking thread (via [`tokio::task::spawn_blocking`]),
//! so host functions are synchronous.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `log` | `info`, `warn`, `error`, `debug` (routed to `tracing`) |
//! | `env` | `get` |
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed. `require` stays
//! available so engines can be split into several modules under `src/`.

use mlua::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};

/// Create a sandboxed VM with the host APIs registered.
pub(crate) fn new_sandboxed_vm(script_name: &str) -> LuaResult<Lua> {
    let lua = Lua::new();
    sandbox_globals(&lua)?;
    register_env_api(&lua)?;
    register_log_api(&lua, script_name)?;
    Ok(lua)
}

pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

/// Prepend `<dir>/?.lua` to `package.path` unless it is already there.
///
/// Returns `true` when the path was inserted.
pub(crate) fn ensure_search_path(lua: &Lua, dir: &Path) -> LuaResult<bool> {
    let package: LuaTable = lua.globals().get("package")?;
    let current: String = package.get("path")?;
    let entry = format!("{}/?.lua", dir.display());

    if current.split(';').any(|p| p == entry) {
        return Ok(false);
    }
    package.set("path", format!("{};{}", entry, current))?;
    Ok(true)
}

/// Abort the running script once `timeout` has elapsed from now.
///
/// Call before each entry into script code; the previous deadline is
/// replaced.
pub(crate) fn arm_deadline(lua: &Lua, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let secs = timeout.as_secs();
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "script timed out after {} seconds",
                    secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: env
// ═══════════════════════════════════════════════════════════════════════

fn register_env_api(lua: &Lua) -> LuaResult<()> {
    let env = lua.create_table()?;

    env.set(
        "get",
        lua.create_function(|_lua, name: String| Ok(std::env::var(&name).ok()))?,
    )?;

    lua.globals().set("env", env)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua, script_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = script_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            tracing::error!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = script_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(script = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value conversions
// ═══════════════════════════════════════════════════════════════════════

/// Convert a Lua value to JSON. Tables with a non-zero sequence length
/// become arrays, everything else becomes an object.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

/// Expand `${VAR_NAME}` patterns in a string from the process environment.
/// Unset variables expand to the empty string.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut from = 0;
    while let Some(rel) = result[from..].find("${") {
        let start = from + rel;
        let end = match result[start..].find('}') {
            Some(pos) => start + pos,
            None => break,
        };
        let var_name = &result[start + 2..end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[end + 1..]);
        from = start + value.len();
    }
    result
}
