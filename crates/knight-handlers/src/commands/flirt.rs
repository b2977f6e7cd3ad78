use knight_core::{
    error::KnightError,
    event::{ChatMessage, OutgoingMessage, Presence},
    traits::Transport,
};
use rand::seq::SliceRandom;
use tracing::warn;

const FLIRT_LINES: &[&str] = &[
    "Are you a magician? Because whenever I look at you, everyone else disappears! ✨",
    "Do you have a map? I just keep getting lost in your eyes. 🗺️",
    "Is your name Google? Because you've got everything I've been searching for! 🔍",
    "Are you a camera? Because every time I look at you, I smile! 📸",
    "Is your name Wi-Fi? Because I'm really feeling a connection! 📶",
    "Are you a bank loan? Because you've got my interest! 💰",
    "Do you like coffee? Because I like you a latte! ☕",
    "Are you French? Because Eiffel for you! 🗼",
    "Is your name Spotify? Because you're the hottest single around! 🎵",
    "Are you a dictionary? Because you add meaning to my life! 📚",
    "Are you a keyboard? Because you're just my type! ⌨️",
    "Do you like Star Wars? Because Yoda one for me! 🌟",
    "Are you a time traveler? Because I see you in my future! ⏰",
    "Do you play soccer? Because you're a keeper! ⚽",
    "Is your name Autumn? Because you're making me fall for you! 🍂",
    "If you were a fruit, you'd be a fine-apple! 🍍",
    "Is your name Siri? Because you autocomplete me! 📱",
    "Is this the library? Because I'm checking you out! 📚",
    "Are you a computer? Because you've turned my life from a 0 to a 1! 💻",
    "Do you have 11 protons? Because you're sodium fine! ⚛️",
    "Are you a planet? Because you've got my world revolving around you! 🌍",
    "Can I call you TCP? Because I'd like to establish a connection! 🔌",
    "Is your name RAM? Because you're always on my memory! 💾",
    "Do you like math? Because I'd like to add you to my life! ➕",
];

pub(super) fn pick_line() -> &'static str {
    FLIRT_LINES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FLIRT_LINES[0])
}

/// Reply with a random line, mentioning the sender.
pub(super) async fn handle(transport: &dyn Transport, message: &ChatMessage) -> Result<(), KnightError> {
    let chat = message.chat_id.as_str();
    if let Err(e) = transport.presence(chat, Presence::Composing).await {
        warn!("flirt: presence update failed: {e}");
    }

    let reply = OutgoingMessage::text(chat, format!("\n{}", pick_line()))
        .quoting(&message.id)
        .mentioning(&message.sender_id);
    if let Err(e) = transport.send(reply).await {
        warn!("flirt: send failed: {e}");
        transport
            .send(
                OutgoingMessage::text(chat, "❌ Failed to send flirt message. Please try again.")
                    .quoting(&message.id),
            )
            .await?;
    }
    Ok(())
}
