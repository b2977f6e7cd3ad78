//! Group bad-word filter: the `antibadword` command and per-message detection.

use super::moderation::{BadwordAction, ModerationStore};
use knight_core::{
    error::KnightError,
    event::{jid_user, normalize_jid, ChatMessage, OutgoingMessage, ParticipantAction},
    traits::Transport,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Warnings before a `warn`-mode group removes the sender.
pub const MAX_WARNINGS: u32 = 3;

const DEFAULT_BAD_WORDS: &[&str] = &[
    "fuck",
    "fucker",
    "motherfucker",
    "bitch",
    "bastard",
    "asshole",
    "dick",
    "idiot",
    "son of a bitch",
    "piece of shit",
];

const USAGE: &str = "*ANTIBADWORD SETUP*\n\n\
    *.antibadword on*\nTurn on antibadword\n\n\
    *.antibadword set <action>*\nSet action: delete/kick/warn\n\n\
    *.antibadword off*\nDisables antibadword in this group";

/// Lowercase, turn punctuation into spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Word list plus the group settings it applies to.
pub struct BadwordFilter {
    words: Vec<String>,
    phrases: Vec<String>,
    store: Arc<ModerationStore>,
}

impl BadwordFilter {
    /// Built-in list extended by `extra`.
    pub fn new(store: Arc<ModerationStore>, extra: &[String]) -> Self {
        let mut words = Vec::new();
        let mut phrases = Vec::new();
        let all = DEFAULT_BAD_WORDS
            .iter()
            .map(|w| normalize(w))
            .chain(extra.iter().map(|w| normalize(w)));
        for entry in all.filter(|w| !w.is_empty()) {
            if entry.contains(' ') {
                phrases.push(entry);
            } else {
                words.push(entry);
            }
        }
        Self {
            words,
            phrases,
            store,
        }
    }

    /// Whether `text` contains a listed word (exact, length ≥ 2) or phrase.
    pub fn contains_bad_word(&self, text: &str) -> bool {
        let clean = normalize(text);
        if clean.is_empty() {
            return false;
        }
        let word_hit = clean
            .split(' ')
            .filter(|w| w.chars().count() >= 2)
            .any(|w| self.words.iter().any(|bad| bad == w));
        word_hit || self.phrases.iter().any(|p| clean.contains(p.as_str()))
    }

    /// Handle `.antibadword [on|off|set <action>]`.
    pub async fn handle_command(
        &self,
        transport: &dyn Transport,
        message: &ChatMessage,
        args: &str,
    ) -> Result<(), KnightError> {
        let chat = message.chat_id.as_str();
        let say = |text: String| OutgoingMessage::text(chat, text).quoting(&message.id);

        if !message.is_group() {
            return transport
                .send(say("This command can only be used in groups.".into()))
                .await;
        }
        if !message.from_me {
            let meta = transport.group_metadata(chat).await?;
            if !meta.is_admin(&normalize_jid(&message.sender_id)) {
                return transport
                    .send(say("*Only group admins can use this command*".into()))
                    .await;
            }
        }

        let mut parts = args.split_whitespace();
        let text = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None => USAGE.to_string(),
            Some("on") => {
                if self.store.enable(chat).await? {
                    info!("antibadword: enabled in {chat}");
                    "*AntiBadword has been enabled. Use .antibadword set <action> to customize action*"
                        .to_string()
                } else {
                    "*AntiBadword is already enabled for this group*".to_string()
                }
            }
            Some("off") => {
                if self.store.disable(chat).await? {
                    info!("antibadword: disabled in {chat}");
                    "*AntiBadword has been disabled for this group*".to_string()
                } else {
                    "*AntiBadword is already disabled for this group*".to_string()
                }
            }
            Some("set") => match parts.next().and_then(BadwordAction::parse) {
                Some(action) => {
                    self.store.set_action(chat, action).await?;
                    format!("*AntiBadword action set to: {}*", action.as_str())
                }
                None => "*Invalid action. Choose: delete, kick, or warn*".to_string(),
            },
            Some(_) => "*Invalid command. Use .antibadword to see usage*".to_string(),
        };
        transport.send(say(text)).await
    }

    /// Check a group message and act on it if the filter is on.
    pub async fn check(&self, transport: &dyn Transport, message: &ChatMessage) -> Result<(), KnightError> {
        if !message.is_group() || message.from_me {
            return Ok(());
        }
        let chat = message.chat_id.as_str();
        let Some(action) = self.store.action(chat).await else {
            return Ok(());
        };
        if !self.contains_bad_word(message.body()) {
            return Ok(());
        }
        debug!("antibadword: hit in {chat} from {}", message.sender_id);

        let meta = transport.group_metadata(chat).await?;
        let Some(bot) = transport.own_id().map(|id| normalize_jid(&id)) else {
            warn!("antibadword: own id unknown, skipping");
            return Ok(());
        };
        if !meta.is_admin(&bot) {
            debug!("antibadword: bot is not admin in {chat}");
            return Ok(());
        }
        let sender = normalize_jid(&message.sender_id);
        if meta.is_admin(&sender) {
            debug!("antibadword: sender {sender} is admin, skipping");
            return Ok(());
        }

        transport
            .send(OutgoingMessage::delete(chat, &message.id, Some(message.sender_id.as_str())))
            .await?;

        let tag = jid_user(&sender).to_string();
        let notice = |text: String| OutgoingMessage::text(chat, text).mentioning(&sender);
        match action {
            BadwordAction::Delete => {
                transport
                    .send(notice(format!("*@{tag} bad words are not allowed here*")))
                    .await
            }
            BadwordAction::Kick => {
                self.remove(transport, chat, &sender).await?;
                transport
                    .send(notice(format!("*@{tag} has been kicked for using bad words*")))
                    .await
            }
            BadwordAction::Warn => {
                let count = self.store.add_warning(chat, &sender).await?;
                if count == 0 {
                    debug!("antibadword: filter turned off in {chat}, no warning");
                    return Ok(());
                }
                if count >= MAX_WARNINGS {
                    self.remove(transport, chat, &sender).await?;
                    self.store.reset_warnings(chat, &sender).await?;
                    transport
                        .send(notice(format!(
                            "*@{tag} has been kicked after {MAX_WARNINGS} warnings*"
                        )))
                        .await
                } else {
                    transport
                        .send(notice(format!(
                            "*@{tag} warning {count}/{MAX_WARNINGS} for using bad words*"
                        )))
                        .await
                }
            }
        }
    }

    async fn remove(&self, transport: &dyn Transport, chat: &str, user: &str) -> Result<(), KnightError> {
        transport
            .update_participants(chat, &[user.to_string()], ParticipantAction::Remove)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> BadwordFilter {
        BadwordFilter::new(Arc::new(ModerationStore::in_memory()), &["Dummkopf".to_string()])
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Hello,   WORLD!!  you? "), "hello world you");
        assert_eq!(normalize("a.b-c"), "a b c");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn test_exact_word_match_only() {
        let f = filter();
        assert!(f.contains_bad_word("you IDIOT!"));
        assert!(f.contains_bad_word("what a dummkopf"));
        // Substrings of longer words don't count.
        assert!(!f.contains_bad_word("idiotic behaviour"));
        assert!(!f.contains_bad_word("moby dickens"));
        assert!(!f.contains_bad_word(""));
    }

    #[test]
    fn test_phrase_match() {
        let f = filter();
        assert!(f.contains_bad_word("total piece   of shit, honestly"));
        assert!(!f.contains_bad_word("a piece of cake"));
    }
}
