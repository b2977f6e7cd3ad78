//! Connection lifecycle manager.
//!
//! Owns the single logical session: resolve, load credentials, connect,
//! watch the event stream, classify the close, and either reconnect with
//! backoff or stop for good. One cycle runs at a time and the previous
//! transport is closed before the next cycle resolves.

mod retry;
mod state;


pub use retry::{shutdown_channel, sleep_or_shutdown, RetryPolicy, ShutdownSignal, ShutdownTrigger};
pub use state::{ConnectionState, Phase, StateHandle};

use crate::{
    credentials::{generate_session_id, CredentialStore},
    dispatcher::{panic_message, Dispatcher},
    qr::render_pairing_qr,
    resolver::Resolver,
};
use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use knight_core::{
    config::Config,
    error::KnightError,
    event::{ConnectionUpdate, CredentialRecord, DisconnectReason, InboundEvent},
    traits::{ConnectParams, Connection, ProtocolClient, Transport},
};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome of one liveness check bounded by `probe_timeout`.
type ProbeResult = Result<Result<(), KnightError>, tokio::time::error::Elapsed>;

/// Settings the manager needs, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub service_host: String,
    pub port: u16,
    /// Identity the credential store keys files by.
    pub identity: String,
    /// Externally supplied session id, if any.
    pub session_id: Option<String>,
    /// Prefix for a generated session id.
    pub session_prefix: String,
    pub retry: RetryPolicy,
    /// Consecutive retries before giving up (0 = never).
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub probe_timeout: Duration,
}

impl LifecycleConfig {
    pub fn from_config(config: &Config) -> Self {
        let conn = &config.connection;
        Self {
            service_host: config.dns.service_host.clone(),
            port: conn.port,
            identity: config.session.identity().to_string(),
            session_id: config.session.id.clone(),
            session_prefix: config.session.prefix.clone(),
            retry: RetryPolicy::from_config(conn),
            max_retries: conn.max_retries,
            connect_timeout: Duration::from_secs(conn.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(conn.keepalive_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(conn.probe_timeout_secs.max(1)),
        }
    }
}

/// Why [`LifecycleManager::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Shutdown was requested.
    Shutdown,
    /// The remote side ended the session for good.
    Terminated(DisconnectReason),
    /// `max_retries` consecutive attempts failed.
    RetriesExhausted(u32),
}

/// How one connection cycle ended.
#[derive(Debug)]
enum CycleEnd {
    Shutdown,
    Closed(DisconnectReason),
    /// Resolution or connect failure before any transport existed.
    Failed(String),
}

/// Drives the session through its phases until shutdown or a terminal close.
pub struct LifecycleManager {
    client: Arc<dyn ProtocolClient>,
    resolver: Arc<Resolver>,
    store: Arc<CredentialStore>,
    dispatcher: Arc<Dispatcher>,
    config: LifecycleConfig,
    state: StateHandle,
    shutdown: ShutdownSignal,
    current: Mutex<Option<Arc<dyn Transport>>>,
}

impl LifecycleManager {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        resolver: Arc<Resolver>,
        store: Arc<CredentialStore>,
        dispatcher: Arc<Dispatcher>,
        config: LifecycleConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        let state = StateHandle::new(ConnectionState::new(config.session_id.clone()));
        Self {
            client,
            resolver,
            store,
            dispatcher,
            config,
            state,
            shutdown,
            current: Mutex::new(None),
        }
    }

    /// Read handle for the health endpoint and diagnostics.
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Run connection cycles until shutdown or a terminal close.
    pub async fn run(&self) -> Outcome {
        info!(
            "lifecycle: starting session '{}' via {} ({}:{})",
            self.config.identity,
            self.client.name(),
            self.config.service_host,
            self.config.port
        );

        loop {
            if self.shutdown.is_triggered() {
                return self.finish_shutdown();
            }
            if let Err(e) = self.state.update(|s| s.begin_attempt()) {
                error!("lifecycle: cannot start attempt: {e}");
                return self.finish_with(self.state.snapshot().terminal_reason().cloned());
            }

            let end = match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(end) => end,
                Err(panic) => {
                    let detail = panic_message(&*panic);
                    error!("lifecycle: connection cycle panicked: {detail}");
                    CycleEnd::Failed(format!("panic: {detail}"))
                }
            };
            self.close_current().await;

            let reason = match end {
                CycleEnd::Shutdown => return self.finish_shutdown(),
                CycleEnd::Closed(reason) if reason.is_terminal() => {
                    error!(
                        "lifecycle: session '{}' ended: {reason}; not reconnecting, re-pairing required",
                        self.config.identity
                    );
                    self.state.update(|s| s.terminate(Some(reason.clone())));
                    return Outcome::Terminated(reason);
                }
                CycleEnd::Closed(reason) => reason.to_string(),
                CycleEnd::Failed(detail) => detail,
            };
            if self.shutdown.is_triggered() {
                return self.finish_shutdown();
            }

            let previous = match self.state.update(|s| s.schedule_retry()) {
                Ok(previous) => previous,
                Err(e) => {
                    error!("lifecycle: cannot schedule retry: {e}");
                    return self.finish_shutdown();
                }
            };
            if self.config.max_retries > 0 && previous >= self.config.max_retries {
                error!(
                    "lifecycle: giving up after {previous} consecutive retries (last: {reason})"
                );
                self.state.update(|s| s.terminate(None));
                return Outcome::RetriesExhausted(previous);
            }

            let delay = self.config.retry.delay(previous);
            warn!(
                "lifecycle: {reason}; reconnecting in {}ms (retry {})",
                delay.as_millis(),
                previous + 1
            );
            if !sleep_or_shutdown(delay, &self.shutdown).await {
                return self.finish_shutdown();
            }
        }
    }

    async fn run_cycle(&self) -> CycleEnd {
        let host = self.config.service_host.clone();
        let address = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return CycleEnd::Shutdown,
            resolved = self.resolver.resolve(&host) => match resolved {
                Ok(ip) => ip,
                Err(e) => return CycleEnd::Failed(e.to_string()),
            },
        };
        debug!("lifecycle: {host} -> {address}");

        let credentials: Option<CredentialRecord> = self.store.load(&self.config.identity).await;
        if credentials.is_none() {
            info!(
                "lifecycle: no stored credentials for '{}', pairing required",
                self.config.identity
            );
        }

        if let Err(e) = self.state.update(|s| s.transition(Phase::Connecting)) {
            return CycleEnd::Failed(e.to_string());
        }
        let params = ConnectParams {
            host,
            address,
            port: self.config.port,
            credentials,
            connect_timeout: self.config.connect_timeout,
            keepalive_interval: self.config.keepalive_interval,
        };
        let connecting = tokio::time::timeout(self.config.connect_timeout, self.client.connect(params));
        let Connection { transport, events } = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return CycleEnd::Shutdown,
            connected = connecting => match connected {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return CycleEnd::Failed(format!("connect failed: {e}")),
                Err(_) => return CycleEnd::Closed(DisconnectReason::TimedOut),
            },
        };
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport.clone());

        self.watch(transport, events).await
    }

    /// Event loop for one live transport.
    async fn watch(
        &self,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<InboundEvent>,
    ) -> CycleEnd {
        let mut probe = tokio::time::interval(self.config.keepalive_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        probe.reset();
        // At most one liveness check in flight; it is polled alongside the
        // other branches so shutdown and events are never held up by it.
        let mut in_flight: Option<BoxFuture<'static, ProbeResult>> = None;

        loop {
            let open = self.state.phase() == Phase::Open;
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    if let Err(e) = self.state.update(|s| s.transition(Phase::Closing)) {
                        debug!("lifecycle: {e}");
                    }
                    info!("lifecycle: shutdown requested, closing transport");
                    return CycleEnd::Shutdown;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(end) = self.handle_event(&transport, event).await {
                            return end;
                        }
                    }
                    None => {
                        return CycleEnd::Closed(DisconnectReason::Transport(
                            "event stream ended".into(),
                        ))
                    }
                },
                Some(result) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    match result {
                        Ok(Ok(())) => self.state.update(|s| s.touch()),
                        Ok(Err(e)) => {
                            warn!("lifecycle: liveness probe failed: {e}");
                            return CycleEnd::Closed(DisconnectReason::TimedOut);
                        }
                        Err(_) => {
                            warn!(
                                "lifecycle: no probe ack within {}s, forcing reconnect",
                                self.config.probe_timeout.as_secs()
                            );
                            return CycleEnd::Closed(DisconnectReason::TimedOut);
                        }
                    }
                }
                _ = probe.tick(), if open && in_flight.is_none() => {
                    let transport = transport.clone();
                    let limit = self.config.probe_timeout;
                    in_flight = Some(
                        async move { tokio::time::timeout(limit, transport.probe()).await }.boxed(),
                    );
                }
            }
        }
    }

    async fn handle_event(
        &self,
        transport: &Arc<dyn Transport>,
        event: InboundEvent,
    ) -> Option<CycleEnd> {
        match event {
            InboundEvent::ConnectionUpdate(ConnectionUpdate::Connecting) => {
                debug!("lifecycle: transport handshaking");
            }
            InboundEvent::ConnectionUpdate(ConnectionUpdate::Open) => {
                if self.state.phase() == Phase::Open {
                    self.state.update(|s| s.touch());
                    return None;
                }
                let prefix = &self.config.session_prefix;
                let opened = self.state.update(|s| {
                    s.mark_open(|| generate_session_id(prefix))
                        .map(str::to_string)
                });
                match opened {
                    Ok(id) => info!(
                        "lifecycle: connected as {} (session {id})",
                        transport.own_id().unwrap_or_else(|| "unknown".into())
                    ),
                    Err(e) => warn!("lifecycle: ignoring open: {e}"),
                }
            }
            InboundEvent::ConnectionUpdate(ConnectionUpdate::Close(reason)) => {
                return Some(CycleEnd::Closed(reason));
            }
            InboundEvent::CredentialsUpdate(record) => {
                // Saved inline so updates land on disk in arrival order.
                if !self.store.save(&self.config.identity, &record).await {
                    error!(
                        "lifecycle: credential update for '{}' not persisted",
                        self.config.identity
                    );
                }
            }
            InboundEvent::PairingCode(code) => match render_pairing_qr(&code) {
                Ok(qr) => info!("lifecycle: scan to pair this device:\n{qr}"),
                Err(e) => warn!("lifecycle: {e}"),
            },
            event => {
                self.dispatcher.dispatch(self.state.phase(), transport, event);
            }
        }
        None
    }

    /// Close and forget the current transport, if any.
    async fn close_current(&self) {
        let transport = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!("lifecycle: close: {e}");
            }
        }
    }

    fn finish_shutdown(&self) -> Outcome {
        self.state.update(|s| s.terminate(None));
        info!("lifecycle: session '{}' stopped", self.config.identity);
        Outcome::Shutdown
    }

    fn finish_with(&self, reason: Option<DisconnectReason>) -> Outcome {
        match reason {
            Some(reason) => Outcome::Terminated(reason),
            None => self.finish_shutdown(),
        }
    }
}
