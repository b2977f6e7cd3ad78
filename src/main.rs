mod health;

use clap::{Parser, Subcommand};
use knight_core::config::{self, Config};
use knight_handlers::{CommandHandler, ModerationStore};
use knight_session::{
    shutdown_channel, CredentialKey, CredentialStore, Dispatcher, LifecycleConfig,
    LifecycleManager, Outcome, Resolver, ShutdownTrigger, WsClient,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "knight",
    version,
    about = "Knight: WhatsApp-Web bot with a self-healing session"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, env = "KNIGHT_CONFIG", default_value = "~/.knight/config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the session alive until stopped.
    Start,
    /// Show stored sessions and check name resolution.
    Status,
    /// Delete stored credentials so the next start pairs again.
    Reset {
        /// Identity to clear. Defaults to the configured one.
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&config::shellexpand(&cli.config), std::io::stderr)?;
    let _log_guard = init_logging(&cfg)?;

    match cli.command {
        Commands::Start => start(cfg).await,
        Commands::Status => {
            status(&cli.config, &cfg).await;
            Ok(())
        }
        Commands::Reset { session } => {
            let id = session.unwrap_or_else(|| cfg.session.identity().to_string());
            // Removing files never decrypts, so no key is loaded here.
            let store = CredentialStore::new(cfg.sessions_dir(), CredentialKey::generate());
            if store.clear(&id).await {
                println!("Cleared credentials for '{id}'.");
            } else {
                println!("No stored credentials for '{id}'.");
            }
            Ok(())
        }
    }
}

/// Load the config under a temporary stderr subscriber, so warnings raised
/// while loading are not lost before `init_logging` runs.
fn load_config<W>(path: &str, writer: W) -> anyhow::Result<Config>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let early = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(writer)
        .finish();
    Ok(tracing::subscriber::with_default(early, || config::load(path))?)
}

/// Console output plus a daily log file under `{data_dir}/logs`.
fn init_logging(cfg: &Config) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = cfg.data_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "knight.log"));

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.knight.log_level)),
        )
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

async fn start(cfg: Config) -> anyhow::Result<()> {
    let key = CredentialKey::from_env_or_file(&cfg.key_file())?;
    let store = Arc::new(
        CredentialStore::new(cfg.sessions_dir(), key)
            .minimize_local_state(cfg.session.minimize_local_state),
    );
    let resolver = Arc::new(Resolver::from_config(&cfg.dns));

    let moderation = Arc::new(ModerationStore::open(cfg.moderation_file()).await);
    let dispatcher =
        Arc::new(Dispatcher::new().with_handler(Arc::new(CommandHandler::new(&cfg.bot, moderation))));
    info!("handlers: {}", dispatcher.handler_names().join(", "));

    let (trigger, signal) = shutdown_channel();
    let manager = LifecycleManager::new(
        Arc::new(WsClient::new(cfg.connection.bridge_url.clone())),
        resolver.clone(),
        store,
        dispatcher,
        LifecycleConfig::from_config(&cfg),
        signal,
    );

    let health = cfg.health.enabled.then(|| {
        tokio::spawn(health::serve(
            cfg.health.clone(),
            health::HealthState {
                resolver,
                state: manager.state(),
            },
        ))
    });
    tokio::spawn(wait_for_signal(trigger));

    info!("{} starting", cfg.knight.name);
    let outcome = manager.run().await;
    if let Some(task) = health {
        task.abort();
    }

    match outcome {
        Outcome::Shutdown => {
            info!("{} stopped", cfg.knight.name);
            Ok(())
        }
        Outcome::Terminated(reason) => anyhow::bail!(
            "session ended by the service ({reason}). \
             Run `knight reset` and start again to pair a new device."
        ),
        Outcome::RetriesExhausted(n) => {
            anyhow::bail!("gave up after {n} consecutive failed connection attempts")
        }
    }
}

/// Trigger shutdown on Ctrl-C or SIGTERM.
async fn wait_for_signal(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
    trigger.trigger();
}

async fn status(config_path: &str, cfg: &Config) {
    println!("Knight: Status Check\n");
    println!("Config:   {config_path}");
    println!("Data dir: {}", cfg.data_dir().display());
    println!("Key file: {}", cfg.key_file().display());
    println!("Identity: {}", cfg.session.identity());
    println!();

    let store = CredentialStore::new(cfg.sessions_dir(), CredentialKey::generate());
    let sessions = store.list_sessions().await;
    if sessions.is_empty() {
        println!("  sessions: none stored");
    }
    for id in sessions {
        match store.session_info(&id).await {
            Some(info) => println!(
                "  {id}: created {}, last update {}",
                info.created.to_rfc3339(),
                info.last_update.to_rfc3339()
            ),
            None => println!("  {id}: no metadata"),
        }
    }
    println!();

    let resolver = Resolver::from_config(&cfg.dns);
    let host = resolver.service_host().to_string();
    match resolver.lookup_all(&host).await {
        Ok(ip) => println!("  {host}: {ip}"),
        Err(e) => println!("  {host}: resolution failed ({e})"),
    }
}
