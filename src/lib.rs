//! resgraph - resource identity and cache store for CI workers
//!
//! Keeps the graph of resource configs and caches, the edges that keep
//! them alive, their projections onto workers, and the containers and
//! volumes materialized there. Everything lives in one SQLite database
//! and every multi-row change runs in a single transaction.

pub mod build;
pub mod check;
pub mod cli;
pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod gc;
pub mod ids;
pub mod resource;
pub mod volume;
pub mod worker;

pub use error::{StoreError, StoreResult};
