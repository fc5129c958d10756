//! Database library providing connectors and utilities for Redis
//!
//! This library provides a unified interface for connecting to and managing database
//! connections. Trimmed to the backend this workspace's services actually speak;
//! `common` stays backend-agnostic so a future connector slots in the same way.
//!
//! # Features
//!
//! - `redis` (default) - Redis support
//! - `config` - Configuration support with `core_config::FromEnv`
//! - `all` - All database features
//!
//! # Examples
//!
//! ## Redis
//!
//! ```ignore
//! use database::redis;
//! use redis::AsyncCommands;
//!
//! let mut conn = redis::connect("redis://127.0.0.1:6379").await?;
//! conn.set::<_, _, ()>("key", "value").await?;
//! ```

// Always available modules
pub mod common;

#[cfg(feature = "redis")]
pub mod redis;

// Re-exports for convenience
pub use common::{DatabaseError, DatabaseResult};
