//! # knight-handlers
//!
//! Chat features behind the `EventHandler` trait: prefix commands
//! (`.sticker`, `.flirt`, `.antibadword`, `.help`) and the group bad-word filter.

pub mod commands;

pub use commands::{moderation::ModerationStore, Command, CommandHandler, StickerMeta};
