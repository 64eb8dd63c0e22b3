//! Shared building blocks for the Courier notification core.

pub mod config;
pub mod db;
pub mod error;
pub mod payload;
pub mod redis_pool;
pub mod types;
