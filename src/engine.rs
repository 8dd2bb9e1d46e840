//! Sync engine abstraction and loader.
//!
//! The adapter fronts an external DataSync engine it knows only through two
//! operations: report status and sync tables. The engine is a Lua module
//! (`<home>/src/<module>.lua`) resolved at request time, so dropping in a new
//! engine or removing it takes effect without restarting the server.
//!
//! ```text
//!   EngineLoader::load()
//!          │
//!          ├── require("sync_engine") ok ──▶ ScriptEngine
//!          │
//!          └── any failure ──────────────▶ FallbackEngine
//!                                          system_health = "fallback: <Category>"
//! ```
//!
//! Loading never fails. A missing or broken engine yields a
//! [`FallbackEngine`] so `/status` keeps answering with a degraded report.
//!
//! # Engine module contract
//!
//! ```lua
//! local M = {}
//!
//! function M.get_sync_status()
//!     return {
//!         sqlserver = true, mysql = true,
//!         configured_tables = 1, enabled_tables = 1,
//!         system_health = "healthy",
//!     }
//! end
//!
//! function M.sync_all_tables(tables, dry_run)
//!     -- tables is nil (sync everything) or an array of names
//! end
//!
//! return M
//! ```

use anyhow::{bail, Context, Result};
use mlua::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::lua_runtime::{arm_deadline, ensure_search_path, lua_value_to_json, new_sandboxed_vm};

/// Status report returned by `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub sqlserver: bool,
    pub mysql: bool,
    pub configured_tables: i64,
    pub enabled_tables: i64,
    pub system_health: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The two-operation contract every engine implementation honours.
///
/// Calls block; async callers run them under `spawn_blocking`.
pub trait SyncEngine: Send + Sync {
    /// Where this engine came from, for logs (`"script:<path>"`, `"fallback"`).
    fn origin(&self) -> String;

    fn sync_status(&self) -> Result<StatusReport>;

    /// `tables == None` means every configured table.
    fn sync_all_tables(&self, tables: Option<&[String]>, dry_run: bool) -> Result<()>;
}

/// Resolves the engine to use for one request.
pub trait EngineLoader: Send + Sync {
    fn load(&self) -> Arc<dyn SyncEngine>;
}

/// Why the script engine could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum EngineLoadError {
    #[error("engine module not found at {0}")]
    ModuleNotFound(PathBuf),
    #[error("engine script failed to load: {0}")]
    ScriptError(String),
    #[error("engine module is missing '{0}'")]
    InvalidModule(String),
    #[error("could not create Lua VM: {0}")]
    RuntimeUnavailable(String),
}

impl EngineLoadError {
    /// Short category name embedded in the fallback health string.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineLoadError::ModuleNotFound(_) => "ModuleNotFound",
            EngineLoadError::ScriptError(_) => "ScriptError",
            EngineLoadError::InvalidModule(_) => "InvalidModule",
            EngineLoadError::RuntimeUnavailable(_) => "RuntimeUnavailable",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Fallback engine
// ═══════════════════════════════════════════════════════════════════════

/// No-op engine used when the real one cannot be loaded.
#[derive(Debug, Clone)]
pub struct FallbackEngine {
    reason: String,
}

impl FallbackEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn from_error(err: &EngineLoadError) -> Self {
        Self::new(err.kind())
    }
}

impl SyncEngine for FallbackEngine {
    fn origin(&self) -> String {
        "fallback".to_string()
    }

    fn sync_status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            sqlserver: false,
            mysql: false,
            configured_tables: 0,
            enabled_tables: 0,
            system_health: format!("fallback: {}", self.reason),
            extra: None,
        })
    }

    fn sync_all_tables(&self, _tables: Option<&[String]>, _dry_run: bool) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Script engine
// ═══════════════════════════════════════════════════════════════════════

/// An engine implemented by a Lua module.
pub struct ScriptEngine {
    // The VM is Send with mlua's `send` feature but not reentrant; calls
    // are serialized.
    lua: Mutex<Lua>,
    module: LuaTable,
    path: PathBuf,
    timeout: Duration,
}

impl ScriptEngine {
    /// Load `<src_dir>/<module>.lua` through `require`.
    pub fn load(src_dir: &Path, module: &str, timeout: Duration) -> Result<Self, EngineLoadError> {
        let path = src_dir.join(format!("{}.lua", module));
        if !path.is_file() {
            return Err(EngineLoadError::ModuleNotFound(path));
        }

        let lua = new_sandboxed_vm(&format!("engine:{}", module))
            .map_err(|e| EngineLoadError::RuntimeUnavailable(e.to_string()))?;
        ensure_search_path(&lua, src_dir)
            .map_err(|e| EngineLoadError::RuntimeUnavailable(e.to_string()))?;

        arm_deadline(&lua, timeout);
        let require: LuaFunction = lua
            .globals()
            .get("require")
            .map_err(|e| EngineLoadError::RuntimeUnavailable(e.to_string()))?;
        let value: LuaValue = require
            .call(module)
            .map_err(|e| EngineLoadError::ScriptError(e.to_string()))?;

        let table = match value {
            LuaValue::Table(t) => t,
            _ => {
                return Err(EngineLoadError::InvalidModule(format!(
                    "{} (module did not return a table)",
                    module
                )))
            }
        };
        for func in ["get_sync_status", "sync_all_tables"] {
            let v: LuaValue = table
                .get(func)
                .map_err(|e| EngineLoadError::ScriptError(e.to_string()))?;
            if !v.is_function() {
                return Err(EngineLoadError::InvalidModule(func.to_string()));
            }
        }

        Ok(Self {
            lua: Mutex::new(lua),
            module: table,
            path,
            timeout,
        })
    }

    fn call<R>(&self, name: &str, args: impl mlua::IntoLuaMulti) -> Result<R>
    where
        R: mlua::FromLuaMulti,
    {
        let lua = self
            .lua
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        arm_deadline(&lua, self.timeout);
        let func: LuaFunction = self.module.get(name)?;
        func.call::<R>(args)
            .map_err(|e| anyhow::anyhow!("{}.{}() failed: {}", self.path.display(), name, e))
    }
}

impl SyncEngine for ScriptEngine {
    fn origin(&self) -> String {
        format!("script:{}", self.path.display())
    }

    fn sync_status(&self) -> Result<StatusReport> {
        let table: LuaTable = self.call("get_sync_status", ())?;
        status_from_lua(&table)
    }

    fn sync_all_tables(&self, tables: Option<&[String]>, dry_run: bool) -> Result<()> {
        let lua = self
            .lua
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let arg = match tables {
            Some(names) => LuaValue::Table(lua.create_sequence_from(names.iter().cloned())?),
            None => LuaValue::Nil,
        };
        drop(lua);
        self.call::<()>("sync_all_tables", (arg, dry_run))
    }
}

fn status_from_lua(table: &LuaTable) -> Result<StatusReport> {
    let system_health: Option<String> = table
        .get("system_health")
        .map_err(|e| anyhow::anyhow!("system_health must be a string: {}", e))?;
    let extra = match table.get::<LuaValue>("extra")? {
        LuaValue::Nil => None,
        v => Some(lua_value_to_json(v)?),
    };

    Ok(StatusReport {
        sqlserver: table.get::<Option<bool>>("sqlserver")?.unwrap_or(false),
        mysql: table.get::<Option<bool>>("mysql")?.unwrap_or(false),
        configured_tables: table.get::<Option<i64>>("configured_tables")?.unwrap_or(0),
        enabled_tables: table.get::<Option<i64>>("enabled_tables")?.unwrap_or(0),
        system_health: system_health.unwrap_or_else(|| "unknown".to_string()),
        extra,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Loader
// ═══════════════════════════════════════════════════════════════════════

/// Loads the Lua engine from the configured DataSync home on every call.
#[derive(Debug, Clone)]
pub struct ScriptEngineLoader {
    src_dir: PathBuf,
    module: String,
    timeout: Duration,
}

impl ScriptEngineLoader {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            src_dir: config.src_dir(),
            module: config.module.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Like [`EngineLoader::load`], but surfaces the failure instead of
    /// degrading. Used by the CLI to explain a fallback.
    pub fn try_load(&self) -> Result<ScriptEngine, EngineLoadError> {
        ScriptEngine::load(&self.src_dir, &self.module, self.timeout)
    }
}

impl EngineLoader for ScriptEngineLoader {
    fn load(&self) -> Arc<dyn SyncEngine> {
        match self.try_load() {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                tracing::warn!(
                    category = e.kind(),
                    error = %e,
                    "sync engine unavailable, using fallback"
                );
                Arc::new(FallbackEngine::from_error(&e))
            }
        }
    }
}

/// Resolve an engine on the blocking pool.
///
/// Loading runs the module's top-level code, which may take as long as
/// `engine.timeout_secs`.
pub async fn load_blocking(loader: Arc<dyn EngineLoader>) -> Result<Arc<dyn SyncEngine>> {
    tokio::task::spawn_blocking(move || loader.load())
        .await
        .context("sync engine loader panicked")
}

/// Run a blocking engine call off the async runtime.
pub async fn run_blocking<T, F>(engine: Arc<dyn SyncEngine>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn SyncEngine) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(engine.as_ref()))
        .await
        .context("sync engine task panicked")?
}

/// Scaffold a new engine module from a template.
///
/// Creates `<home>/src/<module>.lua`; refuses to overwrite an existing file.
pub fn scaffold_engine(config: &EngineConfig) -> Result<PathBuf> {
    let dir = config.src_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create engine directory: {}", dir.display()))?;

    let path = dir.join(format!("{}.lua", config.module));
    if path.exists() {
        bail!("Engine module already exists: {}", path.display());
    }

    let template = format!(
        r#"--[[
  DataSync engine: {module}

  Loaded by the adapter with require("{module}") from {dir}.
  Host APIs: log.info/warn/error/debug, env.get
]]

local M = {{}}

function M.get_sync_status()
    return {{
        sqlserver = false,
        mysql = false,
        configured_tables = 0,
        enabled_tables = 0,
        system_health = "not-implemented",
    }}
end

--- @param tables table|nil array of table names, nil for all tables
--- @param dry_run boolean
function M.sync_all_tables(tables, dry_run)
    log.info("sync requested (dry_run=" .. tostring(dry_run) .. ")")
end

return M
"#,
        module = config.module,
        dir = dir.display(),
    );

    std::fs::write(&path, template)
        .with_context(|| format!("Failed to write engine module: {}", path.display()))?;
    Ok(path)
}
