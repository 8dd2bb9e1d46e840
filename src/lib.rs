//! # DataSync QA adapter
//!
//! An authenticated HTTP front end for a table-synchronisation engine and
//! for the project's test runner.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐
//!   HTTP ─────▶│    server    │── require_auth ──▶ auth (JWT)
//!              └──┬────────┬──┘
//!                 │        │
//!        /status, /sync    /qa/*
//!                 ▼        ▼
//!           ┌────────┐  ┌──────┐     ┌──────────┐
//!           │  sync  │  │  qa  │────▶│ coverage │
//!           └───┬────┘  └──┬───┘     └──────────┘
//!               ▼          ▼
//!        ┌────────────┐  pytest / AI runner
//!        │   engine   │  (child process)
//!        │ Lua module │
//!        │ or fallback│
//!        └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! datasync-qa serve                     # start on 127.0.0.1:8000
//! datasync-qa token                     # print an admin bearer token
//! datasync-qa engine status             # load the engine and report
//! datasync-qa qa run --mode pytest      # run the tests locally
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`auth`] | JWT issue/verify and admin credential check |
//! | [`engine`] | Sync engine trait, Lua loader, fallback |
//! | [`sync`] | Table-sync validation and dispatch |
//! | [`qa`] | Test runner invocation, buffered and streamed |
//! | [`coverage`] | Cobertura XML parsing and HTML report discovery |
//! | [`ratelimit`] | Fixed-window per-client limits |
//! | [`server`] | HTTP routes and middleware |

pub mod auth;
pub mod config;
pub mod coverage;
pub mod engine;
mod lua_runtime;
pub mod qa;
pub mod ratelimit;
pub mod server;
pub mod sync;
