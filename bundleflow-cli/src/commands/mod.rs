//! CLI command implementations.

pub mod cache;
pub mod common;
pub mod config;
pub mod diff;
pub mod update;
pub mod verify;
