use super::*;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, RgbaImage};
use knight_core::{
    config::BotConfig,
    event::{
        GroupMetadata, GroupParticipant, MediaKind, MediaRef, OutgoingContent, ParticipantAction,
        Presence, QuotedMessage,
    },
};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const GROUP: &str = "120363@g.us";
const BOT: &str = "100@s.whatsapp.net";
const ADMIN: &str = "200@s.whatsapp.net";
const MEMBER: &str = "300@s.whatsapp.net";

/// Records everything the handlers ask the transport to do.
#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<OutgoingMessage>>,
    presence: Mutex<Vec<(String, Presence)>>,
    removed: Mutex<Vec<String>>,
    media: Option<Vec<u8>>,
    bot_is_admin: bool,
    fail_next_send: AtomicBool,
}

impl MockTransport {
    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.content {
                OutgoingContent::Text { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), KnightError> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(KnightError::Transport("send failed".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn probe(&self) -> Result<(), KnightError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), KnightError> {
        Ok(())
    }

    async fn presence(&self, chat_id: &str, presence: Presence) -> Result<(), KnightError> {
        self.presence
            .lock()
            .unwrap()
            .push((chat_id.to_string(), presence));
        Ok(())
    }

    async fn group_metadata(&self, group_id: &str) -> Result<GroupMetadata, KnightError> {
        Ok(GroupMetadata {
            id: group_id.to_string(),
            subject: "test".into(),
            participants: vec![
                GroupParticipant {
                    id: BOT.into(),
                    admin: self.bot_is_admin,
                },
                GroupParticipant {
                    id: ADMIN.into(),
                    admin: true,
                },
                GroupParticipant {
                    id: MEMBER.into(),
                    admin: false,
                },
            ],
        })
    }

    async fn update_participants(
        &self,
        _group_id: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), KnightError> {
        assert_eq!(action, ParticipantAction::Remove);
        self.removed
            .lock()
            .unwrap()
            .extend(participants.iter().cloned());
        Ok(())
    }

    async fn download_media(&self, _media: &MediaRef) -> Result<Vec<u8>, KnightError> {
        self.media
            .clone()
            .ok_or_else(|| KnightError::Transport("media expired".into()))
    }

    fn own_id(&self) -> Option<String> {
        Some("100:7@s.whatsapp.net".into())
    }
}

fn message(chat: &str, sender: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: "MSG1".into(),
        chat_id: chat.into(),
        sender_id: sender.into(),
        from_me: false,
        push_name: None,
        text: Some(text.into()),
        media: None,
        quoted: None,
        timestamp: Utc::now(),
    }
}

fn handler() -> CommandHandler {
    CommandHandler::new(&BotConfig::default(), Arc::new(ModerationStore::in_memory()))
}

fn png_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(32, 16, image::Rgba([0, 200, 0, 255])))
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

fn image_ref() -> MediaRef {
    MediaRef {
        kind: MediaKind::Image,
        mimetype: Some("image/png".into()),
        handle: "media-1".into(),
    }
}

async fn run(handler: &CommandHandler, transport: &Arc<MockTransport>, msg: &ChatMessage) {
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    handler.on_message(dyn_transport, msg).await.unwrap();
}

#[test]
fn test_parse_commands() {
    assert_eq!(Command::parse(".sticker", "."), Some((Command::Sticker, "")));
    assert_eq!(Command::parse("  .FLIRT ", "."), Some((Command::Flirt, "")));
    assert_eq!(
        Command::parse(".antibadword set  kick", "."),
        Some((Command::AntiBadword, "set  kick"))
    );
    assert_eq!(Command::parse("!help", "!"), Some((Command::Help, "")));
    assert_eq!(Command::parse(".unknown", "."), None);
    assert_eq!(Command::parse("sticker", "."), None);
    assert_eq!(Command::parse("", "."), None);
}

#[tokio::test]
async fn test_flirt_quotes_and_mentions_sender() {
    let transport = Arc::new(MockTransport::default());
    let msg = message(GROUP, MEMBER, ".flirt");
    run(&handler(), &transport, &msg).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].quoted.as_deref(), Some("MSG1"));
    assert_eq!(sent[0].mentions, vec![MEMBER.to_string()]);
    assert_eq!(
        *transport.presence.lock().unwrap(),
        vec![(GROUP.to_string(), Presence::Composing)]
    );
}

#[tokio::test]
async fn test_flirt_failure_sends_apology() {
    let transport = Arc::new(MockTransport {
        fail_next_send: AtomicBool::new(true),
        ..Default::default()
    });
    run(&handler(), &transport, &message(GROUP, MEMBER, ".flirt")).await;
    let texts = transport.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("Failed to send flirt"));
}

#[tokio::test]
async fn test_help_lists_commands() {
    let transport = Arc::new(MockTransport::default());
    run(&handler(), &transport, &message(GROUP, MEMBER, ".help")).await;
    let text = &transport.texts()[0];
    assert!(text.contains(".sticker"));
    assert!(text.contains(".antibadword"));
}

#[tokio::test]
async fn test_sticker_from_quoted_image() {
    let transport = Arc::new(MockTransport {
        media: Some(png_bytes()),
        ..Default::default()
    });
    let mut msg = message(GROUP, MEMBER, ".sticker");
    msg.quoted = Some(Box::new(QuotedMessage {
        id: Some("ORIG".into()),
        text: None,
        media: Some(image_ref()),
    }));
    run(&handler(), &transport, &msg).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0].content {
        OutgoingContent::Sticker { webp } => {
            assert_eq!(&webp[0..4], b"RIFF");
            assert_eq!(&webp[12..16], b"VP8X");
        }
        other => panic!("expected sticker, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sticker_without_media_explains() {
    let transport = Arc::new(MockTransport::default());
    run(&handler(), &transport, &message(GROUP, MEMBER, ".sticker")).await;
    assert!(transport.texts()[0].starts_with("Please reply to an image"));
}

#[tokio::test]
async fn test_sticker_video_unsupported() {
    let transport = Arc::new(MockTransport::default());
    let mut msg = message(GROUP, MEMBER, ".sticker");
    msg.media = Some(MediaRef {
        kind: MediaKind::Video,
        mimetype: Some("video/mp4".into()),
        handle: "v".into(),
    });
    run(&handler(), &transport, &msg).await;
    assert!(transport.texts()[0].contains("not supported"));
}

#[tokio::test]
async fn test_sticker_download_failure_replies() {
    let transport = Arc::new(MockTransport::default());
    let mut msg = message(GROUP, MEMBER, ".sticker");
    msg.media = Some(image_ref());
    run(&handler(), &transport, &msg).await;
    assert!(transport.texts()[0].starts_with("Failed to download"));
}

#[tokio::test]
async fn test_antibadword_requires_group_admin() {
    let transport = Arc::new(MockTransport::default());
    let h = handler();
    run(&h, &transport, &message(GROUP, MEMBER, ".antibadword on")).await;
    assert!(transport.texts()[0].contains("Only group admins"));

    run(&h, &transport, &message(MEMBER, MEMBER, ".antibadword on")).await;
    assert!(transport.texts()[1].contains("only be used in groups"));
}

#[tokio::test]
async fn test_antibadword_command_flow() {
    let transport = Arc::new(MockTransport::default());
    let h = handler();
    for cmd in [
        ".antibadword",
        ".antibadword on",
        ".antibadword on",
        ".antibadword set warn",
        ".antibadword set ban",
        ".antibadword off",
        ".antibadword off",
        ".antibadword maybe",
    ] {
        run(&h, &transport, &message(GROUP, ADMIN, cmd)).await;
    }
    let texts = transport.texts();
    assert!(texts[0].contains("ANTIBADWORD SETUP"));
    assert!(texts[1].contains("has been enabled"));
    assert!(texts[2].contains("already enabled"));
    assert!(texts[3].contains("set to: warn"));
    assert!(texts[4].contains("Invalid action"));
    assert!(texts[5].contains("has been disabled"));
    assert!(texts[6].contains("already disabled"));
    assert!(texts[7].contains("Invalid command"));
}

async fn enable(h: &CommandHandler, transport: &Arc<MockTransport>, action: &str) {
    run(h, transport, &message(GROUP, ADMIN, ".antibadword on")).await;
    run(h, transport, &message(GROUP, ADMIN, &format!(".antibadword set {action}"))).await;
    transport.sent.lock().unwrap().clear();
}

#[tokio::test]
async fn test_bad_word_deleted_and_sender_told() {
    let transport = Arc::new(MockTransport {
        bot_is_admin: true,
        ..Default::default()
    });
    let h = handler();
    enable(&h, &transport, "delete").await;

    run(&h, &transport, &message(GROUP, MEMBER, "you are an IDIOT")).await;
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(
        &sent[0].content,
        OutgoingContent::Delete { message_id, .. } if message_id == "MSG1"
    ));
    assert_eq!(transport.texts()[0], "*@300 bad words are not allowed here*");
    assert_eq!(sent[1].mentions, vec![MEMBER.to_string()]);
}

#[tokio::test]
async fn test_bad_word_kick() {
    let transport = Arc::new(MockTransport {
        bot_is_admin: true,
        ..Default::default()
    });
    let h = handler();
    enable(&h, &transport, "kick").await;

    run(&h, &transport, &message(GROUP, MEMBER, "idiot")).await;
    assert_eq!(*transport.removed.lock().unwrap(), vec![MEMBER.to_string()]);
    assert!(transport.texts()[0].contains("has been kicked"));
}

#[tokio::test]
async fn test_three_warnings_then_kick() {
    let transport = Arc::new(MockTransport {
        bot_is_admin: true,
        ..Default::default()
    });
    let h = handler();
    enable(&h, &transport, "warn").await;

    for _ in 0..3 {
        run(&h, &transport, &message(GROUP, MEMBER, "idiot")).await;
    }
    let texts = transport.texts();
    assert_eq!(texts[0], "*@300 warning 1/3 for using bad words*");
    assert_eq!(texts[1], "*@300 warning 2/3 for using bad words*");
    assert_eq!(texts[2], "*@300 has been kicked after 3 warnings*");
    assert_eq!(*transport.removed.lock().unwrap(), vec![MEMBER.to_string()]);

    // Count was reset after the kick.
    run(&h, &transport, &message(GROUP, MEMBER, "idiot")).await;
    assert_eq!(
        transport.texts().last().unwrap(),
        "*@300 warning 1/3 for using bad words*"
    );
}

#[tokio::test]
async fn test_filter_skips_admins_and_non_admin_bot() {
    let transport = Arc::new(MockTransport {
        bot_is_admin: true,
        ..Default::default()
    });
    let h = handler();
    enable(&h, &transport, "delete").await;
    run(&h, &transport, &message(GROUP, ADMIN, "idiot")).await;
    assert!(transport.sent().is_empty());

    let transport = Arc::new(MockTransport::default());
    let h = handler();
    enable(&h, &transport, "delete").await;
    run(&h, &transport, &message(GROUP, MEMBER, "idiot")).await;
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_filter_off_by_default_and_ignores_direct_chats() {
    let transport = Arc::new(MockTransport {
        bot_is_admin: true,
        ..Default::default()
    });
    let h = handler();
    run(&h, &transport, &message(GROUP, MEMBER, "idiot")).await;
    run(&h, &transport, &message(MEMBER, MEMBER, "idiot")).await;
    assert!(transport.sent().is_empty());
}
