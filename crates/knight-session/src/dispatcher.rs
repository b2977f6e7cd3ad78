//! Fans inbound events out to chat handlers.
//!
//! Every handler call runs in its own task. Errors and panics are logged
//! there and never reach the lifecycle manager.

use crate::lifecycle::Phase;
use futures_util::FutureExt;
use knight_core::{
    event::InboundEvent,
    traits::{EventHandler, Transport},
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Registered handlers, invoked for every message and membership event.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Forward `event` to every handler if the session is open.
    ///
    /// Events seen in any other phase are dropped. Returns the spawned
    /// handler tasks; callers may ignore them.
    pub fn dispatch(
        &self,
        phase: Phase,
        transport: &Arc<dyn Transport>,
        event: InboundEvent,
    ) -> Vec<JoinHandle<()>> {
        if phase != Phase::Open {
            debug!("dispatcher: dropping event while {phase}");
            return Vec::new();
        }

        let mut tasks = Vec::new();
        match event {
            InboundEvent::MessagesUpsert(messages) => {
                for message in messages.into_iter().map(Arc::new) {
                    for handler in &self.handlers {
                        let handler = handler.clone();
                        let transport = transport.clone();
                        let message = message.clone();
                        tasks.push(supervise(handler.name().to_string(), async move {
                            handler.on_message(transport, &message).await
                        }));
                    }
                }
            }
            InboundEvent::GroupParticipantsUpdate(update) => {
                let update = Arc::new(update);
                for handler in &self.handlers {
                    let handler = handler.clone();
                    let transport = transport.clone();
                    let update = update.clone();
                    tasks.push(supervise(handler.name().to_string(), async move {
                        handler.on_participants(transport, &update).await
                    }));
                }
            }
            other => debug!("dispatcher: ignoring {other:?}"),
        }
        tasks
    }
}

/// Run a handler future in its own task, logging its error or panic.
fn supervise<F>(name: String, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), knight_core::error::KnightError>> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("handler {name} failed: {e}"),
            Err(panic) => error!("handler {name} panicked: {}", panic_message(&*panic)),
        }
    })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use knight_core::error::KnightError;
    use knight_core::event::{
        ChatMessage, GroupMetadata, MediaRef, OutgoingMessage, ParticipantAction,
        ParticipantsUpdate,
    };
    use std::sync::Mutex;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _message: OutgoingMessage) -> Result<(), KnightError> {
            Ok(())
        }
        async fn probe(&self) -> Result<(), KnightError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), KnightError> {
            Ok(())
        }
        async fn group_metadata(&self, group_id: &str) -> Result<GroupMetadata, KnightError> {
            Ok(GroupMetadata {
                id: group_id.to_string(),
                subject: String::new(),
                participants: Vec::new(),
            })
        }
        async fn update_participants(
            &self,
            _group_id: &str,
            _participants: &[String],
            _action: ParticipantAction,
        ) -> Result<(), KnightError> {
            Ok(())
        }
        async fn download_media(&self, _media: &MediaRef) -> Result<Vec<u8>, KnightError> {
            Ok(Vec::new())
        }
        fn own_id(&self) -> Option<String> {
            None
        }
    }

    /// Records message ids; panics or errors on request.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
        panic_on: Option<&'static str>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_message(
            &self,
            _transport: Arc<dyn Transport>,
            message: &ChatMessage,
        ) -> Result<(), KnightError> {
            if self.panic_on == Some(message.id.as_str()) {
                panic!("boom on {}", message.id);
            }
            self.seen.lock().unwrap().push(message.id.clone());
            if self.fail_on == Some(message.id.as_str()) {
                return Err(KnightError::Handler("failed".into()));
            }
            Ok(())
        }

        async fn on_participants(
            &self,
            _transport: Arc<dyn Transport>,
            update: &ParticipantsUpdate,
        ) -> Result<(), KnightError> {
            self.seen.lock().unwrap().push(update.group_id.clone());
            Ok(())
        }
    }

    fn message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            chat_id: "1@s.whatsapp.net".to_string(),
            sender_id: "1@s.whatsapp.net".to_string(),
            from_me: false,
            push_name: None,
            text: Some("hi".to_string()),
            media: None,
            quoted: None,
            timestamp: Utc::now(),
        }
    }

    fn transport() -> Arc<dyn Transport> {
        Arc::new(NullTransport)
    }

    async fn join_all(tasks: Vec<JoinHandle<()>>) {
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dispatch_while_open() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new().with_handler(Arc::new(Recorder {
            seen: seen.clone(),
            fail_on: None,
            panic_on: None,
        }));

        let tasks = dispatcher.dispatch(
            Phase::Open,
            &transport(),
            InboundEvent::MessagesUpsert(vec![message("a"), message("b")]),
        );
        join_all(tasks).await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_events_dropped_unless_open() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new().with_handler(Arc::new(Recorder {
            seen: seen.clone(),
            fail_on: None,
            panic_on: None,
        }));

        for phase in [Phase::Reconnecting, Phase::Terminated, Phase::Connecting] {
            let tasks = dispatcher.dispatch(
                phase,
                &transport(),
                InboundEvent::MessagesUpsert(vec![message("a")]),
            );
            assert!(tasks.is_empty());
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_are_contained() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new().with_handler(Arc::new(Recorder {
            seen: seen.clone(),
            fail_on: Some("err"),
            panic_on: Some("panic"),
        }));

        let tasks = dispatcher.dispatch(
            Phase::Open,
            &transport(),
            InboundEvent::MessagesUpsert(vec![message("err"), message("panic"), message("ok")]),
        );
        // Supervised tasks finish normally even when the handler panics.
        join_all(tasks).await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["err", "ok"]);
    }

    #[tokio::test]
    async fn test_participants_update_dispatched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new().with_handler(Arc::new(Recorder {
            seen: seen.clone(),
            fail_on: None,
            panic_on: None,
        }));

        let tasks = dispatcher.dispatch(
            Phase::Open,
            &transport(),
            InboundEvent::GroupParticipantsUpdate(ParticipantsUpdate {
                group_id: "g@g.us".into(),
                participants: vec!["2@s.whatsapp.net".into()],
                action: ParticipantAction::Add,
            }),
        );
        join_all(tasks).await;
        assert_eq!(*seen.lock().unwrap(), vec!["g@g.us"]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
