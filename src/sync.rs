//! Table-sync request validation and dispatch to the engine.
//!
//! Validation runs before the engine is loaded, in this order:
//!
//! 1. an explicit empty list is rejected (`[]` is not "all tables");
//! 2. names containing `;` or whitespace are rejected as a group;
//! 3. with a non-empty whitelist, every requested table must be on it.
//!    A whitelist containing `*` allows every table.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::{load_blocking, run_blocking, EngineLoader};

/// Whitelist entry that lifts the restriction.
pub const ALLOW_ALL: &str = "*";

fn default_dry_run() -> bool {
    true
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncRequest {
    /// `None` syncs every table the engine knows about.
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            tables: None,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub ok: bool,
    pub tables: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("tables must contain at least one table name when provided")]
    EmptyTableList,
    #[error("Invalid table names: {0:?}")]
    InvalidTableNames(Vec<String>),
    #[error("Tables not allowed: {0:?}")]
    TableNotWhitelisted(Vec<String>),
    #[error("sync engine failed: {0:#}")]
    Engine(#[from] anyhow::Error),
}

fn is_invalid_name(name: &str) -> bool {
    name.chars().any(|c| c == ';' || c.is_whitespace())
}

/// Check a request against the naming and whitelist rules.
pub fn validate_request(request: &SyncRequest, whitelist: &[String]) -> Result<(), DispatchError> {
    let tables = match &request.tables {
        None => return Ok(()),
        Some(tables) => tables,
    };

    if tables.is_empty() {
        return Err(DispatchError::EmptyTableList);
    }

    let invalid: Vec<String> = tables
        .iter()
        .filter(|t| is_invalid_name(t))
        .cloned()
        .collect();
    if !invalid.is_empty() {
        return Err(DispatchError::InvalidTableNames(invalid));
    }

    if !whitelist.is_empty() && !whitelist.iter().any(|t| t == ALLOW_ALL) {
        let denied: Vec<String> = tables
            .iter()
            .filter(|t| !whitelist.contains(t))
            .cloned()
            .collect();
        if !denied.is_empty() {
            return Err(DispatchError::TableNotWhitelisted(denied));
        }
    }

    Ok(())
}

/// Validate, then hand the request to a freshly loaded engine.
pub async fn dispatch_sync(
    request: SyncRequest,
    whitelist: &[String],
    loader: Arc<dyn EngineLoader>,
) -> Result<SyncResult, DispatchError> {
    validate_request(&request, whitelist)?;

    let engine = load_blocking(loader).await?;
    tracing::info!(
        engine = %engine.origin(),
        tables = ?request.tables,
        dry_run = request.dry_run,
        "dispatching sync"
    );

    let SyncRequest { tables, dry_run } = request;
    let tables = run_blocking(engine, move |e| {
        e.sync_all_tables(tables.as_deref(), dry_run)?;
        Ok(tables)
    })
    .await?;

    Ok(SyncResult {
        ok: true,
        tables: tables.unwrap_or_default(),
        message: None,
    })
}
