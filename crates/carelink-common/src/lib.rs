//! Shared types for the CareLink patient monitor.
//!
//! This crate contains:
//! - **Alert models**: fall and location events and their SMS payload format
//! - **Configuration**: TOML config input, defaults and validation

pub mod config;
pub mod models;
