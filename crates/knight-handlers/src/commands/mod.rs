//! Prefix commands and the per-message moderation hook.

pub mod antibadword;
mod flirt;
pub mod moderation;
pub mod sticker;

#[cfg(test)]
mod tests;

pub use sticker::StickerMeta;

use antibadword::BadwordFilter;
use async_trait::async_trait;
use knight_core::{
    config::BotConfig,
    error::KnightError,
    event::{ChatMessage, OutgoingMessage},
    traits::{EventHandler, Transport},
};
use moderation::ModerationStore;
use std::sync::Arc;
use tracing::debug;

/// Known chat commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Sticker,
    Flirt,
    AntiBadword,
    Help,
}

impl Command {
    /// Parse `text` as `{prefix}{name} [args]`. Returns the command and the
    /// trimmed argument string, or `None` for anything else.
    pub fn parse<'a>(text: &'a str, prefix: &str) -> Option<(Self, &'a str)> {
        let rest = text.trim_start().strip_prefix(prefix)?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        let cmd = match name.to_ascii_lowercase().as_str() {
            "sticker" | "s" => Self::Sticker,
            "flirt" => Self::Flirt,
            "antibadword" => Self::AntiBadword,
            "help" | "menu" => Self::Help,
            _ => return None,
        };
        Some((cmd, args))
    }
}

/// Routes commands and runs the bad-word filter on every other group message.
pub struct CommandHandler {
    prefix: String,
    sticker_meta: StickerMeta,
    filter: BadwordFilter,
}

impl CommandHandler {
    pub fn new(config: &BotConfig, moderation: Arc<ModerationStore>) -> Self {
        Self {
            prefix: config.prefix.clone(),
            sticker_meta: StickerMeta {
                packname: config.packname.clone(),
                author: config.author.clone(),
            },
            filter: BadwordFilter::new(moderation, &config.bad_words),
        }
    }

    fn help_text(&self) -> String {
        let p = &self.prefix;
        format!(
            "*Commands*\n\n\
             {p}sticker: reply to an image (or send one with the command) to make a sticker\n\
             {p}flirt: get a pick-up line\n\
             {p}antibadword on|off|set <delete|kick|warn>: group bad-word filter (admins)\n\
             {p}help: this list"
        )
    }
}

#[async_trait]
impl EventHandler for CommandHandler {
    fn name(&self) -> &str {
        "commands"
    }

    async fn on_message(
        &self,
        transport: Arc<dyn Transport>,
        message: &ChatMessage,
    ) -> Result<(), KnightError> {
        let Some((cmd, args)) = Command::parse(message.body(), &self.prefix) else {
            if message.is_group() && !message.from_me {
                self.filter.check(transport.as_ref(), message).await?;
            }
            return Ok(());
        };

        debug!("command {cmd:?} from {} in {}", message.sender_id, message.chat_id);
        match cmd {
            Command::Sticker => sticker::handle(transport.as_ref(), message, &self.sticker_meta).await,
            Command::Flirt => flirt::handle(transport.as_ref(), message).await,
            Command::AntiBadword => {
                self.filter
                    .handle_command(transport.as_ref(), message, args)
                    .await
            }
            Command::Help => {
                transport
                    .send(OutgoingMessage::text(&message.chat_id, self.help_text()).quoting(&message.id))
                    .await
            }
        }
    }
}
