//! # knight-core
//!
//! Core types, traits, configuration, and error handling for the Knight bot.

pub mod config;
pub mod error;
pub mod event;
pub mod traits;
