//! Core types, config, errors, and the persistence gateway contract for shapeshare.

pub mod color;
pub mod config;
pub mod error;
pub mod gateway;
pub mod memory_gateway;
pub mod types;
