//! CLI entrypoint and subcommand orchestration.

mod config;
mod daemon;
mod remote;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use channels::{BridgeClient, router};
use clap::{Parser, Subcommand};
use config::{Config, LoginConfig};
use daemon::PidFile;
use gateway::{
    GatewayService, LoginOutcome, LoginPhase, LoginStatus, QrArtifact, SessionClient,
    SqliteDeviceStore, StartMode, render_terminal,
};
use proto::GatewayError;
use remote::ApiClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pause between failed login rounds.
const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Top-level command-line arguments.
#[derive(Parser)]
#[command(name = "wagate")]
#[command(about = "WhatsApp Web gateway: HTTP API, WebSocket push and webhooks", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.wagate/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the gateway (default when no subcommand is given)
    Serve,
    /// Pair a device by scanning QR codes in the terminal, then exit
    Login,
    /// Show the login status of a running gateway
    Status,
    /// Send a text message through a running gateway
    Send {
        /// Recipient JID or phone number
        #[arg(short, long)]
        to: String,
        /// Message text
        #[arg(short, long)]
        message: String,
    },
    /// Unlink the device of a running gateway
    Logout,
    /// Manage webhook targets of a running gateway
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
}

/// `webhook` sub-subcommands.
#[derive(Subcommand, Debug, PartialEq)]
enum WebhookCommands {
    /// Register a webhook URL
    Add { url: String },
    /// Remove a webhook URL
    Remove { url: String },
    /// List registered webhook URLs
    List,
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Serve => "serve",
            Commands::Login => "login",
            Commands::Status => "status",
            Commands::Send { .. } => "send",
            Commands::Logout => "logout",
            Commands::Webhook { .. } => "webhook",
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);

    // When --debug is passed, write debug-level logs to ~/.wagate/logs/debug.YYYY-MM-DD.log
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let log_dir = std::path::PathBuf::from(home).join(".wagate").join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer().with_target(false).with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new(
                "debug,hyper_util=info,rustls=info,reqwest=info,sqlx=info",
            ));
        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .init();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = command.label(),
            log_level = %cli.log_level,
            "========== wagate session start =========="
        );
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
    }

    let config = Config::load(cli.config.as_deref())?;

    match command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Login => cmd_login(config).await,
        Commands::Status => cmd_status(config).await,
        Commands::Send { to, message } => cmd_send(config, to, message).await,
        Commands::Logout => cmd_logout(config).await,
        Commands::Webhook { command } => cmd_webhook(config, command).await,
    }
}

/// Opens the store and builds the service around a bridge client.
async fn build_service(config: &Config) -> anyhow::Result<(Arc<GatewayService>, Arc<BridgeClient>)> {
    let store = SqliteDeviceStore::open(&config.store.url).await?;

    let client = Arc::new(BridgeClient::new(config.bridge_config()));
    if !client.check_runtime().await {
        warn!(
            node = %config.bridge.node_bin,
            "Node.js runtime not found, the bridge will fail to start"
        );
    }

    let service = Arc::new(GatewayService::new(
        client.clone(),
        Arc::new(store),
        QrArtifact::new(&config.login.qr_file),
        config.webhook_settings(),
    ));
    Ok((service, client))
}

/// Runs the gateway until SIGINT/SIGTERM.
async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let (service, client) = build_service(&config).await?;
    for url in &config.webhooks.urls {
        service.register_webhook(url)?;
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (event_tx, event_rx) = mpsc::channel(256);
    client.set_event_sink(event_tx);
    let dispatcher = service.dispatcher(config.dispatch_policy());
    let dispatch_cancel = cancel.clone();
    tracker.spawn(async move { dispatcher.run(event_rx, dispatch_cancel).await });

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    let app = router(service.clone(), &config.http_config());
    let http_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = channels::serve(listener, app, http_cancel).await {
            error!("HTTP server error: {e}");
        }
    });

    match service.start().await? {
        StartMode::Restored(identity) => info!(identity = %identity, "Resumed stored device"),
        StartMode::NeedsLogin => info!("Waiting for QR login, see GET /login"),
    }
    tracker.spawn(login_supervisor(
        service.clone(),
        config.login.clone(),
        cancel.clone(),
    ));

    let pid_file = PidFile::new(PidFile::default_path());
    if let Err(e) = pid_file.write().await {
        warn!("Failed to write PID file: {e}");
    }

    daemon::wait_for_shutdown().await;

    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(config.shutdown_grace(), tracker.wait())
        .await
        .is_err()
    {
        warn!("Background tasks did not stop within the grace period");
    }
    service.shutdown(config.shutdown_grace()).await;
    pid_file.remove().await;
    Ok(())
}

/// Keeps the gateway logged in: runs QR rounds whenever no device is linked.
async fn login_supervisor(service: Arc<GatewayService>, login: LoginConfig, cancel: CancellationToken) {
    loop {
        if !service.session().is_authenticated() {
            let linked = tokio::select! {
                _ = cancel.cancelled() => return,
                linked = run_login_rounds(&service, &login) => linked,
            };
            if !linked {
                warn!(
                    attempts = login.max_attempts,
                    "Giving up on QR login, restart the gateway to try again"
                );
                service.abandon_login();
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = service.logged_out() => info!("Device unlinked, starting a new QR login"),
        }
    }
}

/// Up to `max_attempts` QR rounds. Returns whether a device was linked.
async fn run_login_rounds(service: &GatewayService, login: &LoginConfig) -> bool {
    let print_qr = login.print_qr;
    for attempt in 1..=login.max_attempts {
        info!(attempt, max = login.max_attempts, "Starting QR login");
        let result = service
            .login_with(|code| {
                if print_qr {
                    print_qr_code(code);
                }
            })
            .await;
        match result {
            Ok(LoginOutcome::Authenticated(identity)) => {
                info!(identity = %identity, "Device linked");
                return true;
            }
            Ok(LoginOutcome::TimedOut) => info!(attempt, "QR code expired"),
            Err(GatewayError::AlreadyAuthenticated) => return true,
            Err(e) => {
                warn!(attempt, "QR login failed: {e}");
                tokio::time::sleep(LOGIN_RETRY_DELAY).await;
            }
        }
    }
    false
}

fn print_qr_code(code: &str) {
    match render_terminal(code) {
        Some(text) => println!("{text}"),
        None => println!("QR data: {code}"),
    }
    println!();
    println!("Scan this QR code with WhatsApp on your phone.");
    println!("(Open WhatsApp > Settings > Linked Devices > Link a Device)");
    println!();
}

/// Interactive terminal pairing.
async fn cmd_login(config: Config) -> anyhow::Result<()> {
    let pid_path = PidFile::default_path();
    if let Some(pid) = PidFile::new(&pid_path).read().await {
        anyhow::bail!(
            "a gateway appears to be running (pid {pid}); scan the QR at {}/qr instead, \
             or delete {} if it is stale",
            config.api_base_url(),
            pid_path.display()
        );
    }

    let (service, _client) = build_service(&config).await?;
    if let StartMode::Restored(identity) = service.start().await? {
        println!("Already logged in as {identity}.");
        service.shutdown(Duration::ZERO).await;
        return Ok(());
    }

    println!("Waiting for QR code... (scan with your phone)");
    println!();
    let mut login = config.login.clone();
    login.print_qr = true;
    let linked = run_login_rounds(&service, &login).await;
    service.shutdown(Duration::ZERO).await;

    if linked {
        let status = service.login_status();
        println!("{}", format_status(&status));
        println!("Run `wagate serve` to start the gateway.");
        Ok(())
    } else {
        anyhow::bail!("no device linked after {} attempts", login.max_attempts)
    }
}

fn api_client(config: &Config) -> ApiClient {
    ApiClient::new(config.api_base_url(), config.http_config().api_token)
}

async fn cmd_status(config: Config) -> anyhow::Result<()> {
    if let Some(pid) = PidFile::new(PidFile::default_path()).read().await {
        println!("Gateway pid: {pid}");
    }
    let status = api_client(&config).login_status().await?;
    println!("{}", format_status(&status));
    Ok(())
}

async fn cmd_send(config: Config, to: String, message: String) -> anyhow::Result<()> {
    let response = api_client(&config).send(&to, &message).await?;
    println!("{}", response.status);
    Ok(())
}

async fn cmd_logout(config: Config) -> anyhow::Result<()> {
    let response = api_client(&config).logout().await?;
    println!("{}", response.status);
    Ok(())
}

async fn cmd_webhook(config: Config, command: WebhookCommands) -> anyhow::Result<()> {
    let client = api_client(&config);
    match command {
        WebhookCommands::Add { url } => {
            let added = client.add_webhook(&url).await?;
            println!("Added {} ({} registered)", added.added, added.total);
        }
        WebhookCommands::Remove { url } => {
            let removed = client.remove_webhook(&url).await?;
            println!("Removed {} ({} registered)", removed.removed, removed.total);
        }
        WebhookCommands::List => {
            let urls = client.list_webhooks().await?;
            if urls.is_empty() {
                println!("No webhooks registered.");
            }
            for url in urls {
                println!("{url}");
            }
        }
    }
    Ok(())
}

/// Human-readable login status.
fn format_status(status: &LoginStatus) -> String {
    match status.status {
        LoginPhase::LoggedIn => {
            let who = status.logged_in_as.as_deref().unwrap_or("unknown");
            match status.login_time {
                Some(at) => format!("Logged in as {who} since {}", at.to_rfc3339()),
                None => format!("Logged in as {who}"),
            }
        }
        LoginPhase::WaitingQr => format!(
            "Not logged in, scan the QR code at {}",
            status.qr_file.as_deref().unwrap_or("/qr")
        ),
        LoginPhase::Waiting => "Not logged in, QR login stopped".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn no_subcommand_defaults_to_serve() {
        let cli = Cli::try_parse_from(["wagate"]).expect("parse");
        assert_eq!(cli.command.unwrap_or(Commands::Serve), Commands::Serve);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.debug);
    }

    #[test]
    fn send_requires_recipient_and_message() {
        let cli = Cli::try_parse_from(["wagate", "send", "--to", "628123", "-m", "halo"])
            .expect("parse");
        assert_eq!(
            cli.command,
            Some(Commands::Send {
                to: "628123".to_string(),
                message: "halo".to_string()
            })
        );
        assert!(Cli::try_parse_from(["wagate", "send", "--to", "628123"]).is_err());
    }

    #[test]
    fn webhook_subcommands_parse() {
        let cli = Cli::try_parse_from(["wagate", "webhook", "add", "https://x/hook"])
            .expect("parse");
        assert_eq!(
            cli.command,
            Some(Commands::Webhook {
                command: WebhookCommands::Add {
                    url: "https://x/hook".to_string()
                }
            })
        );
        let cli = Cli::try_parse_from(["wagate", "--debug", "webhook", "list"]).expect("parse");
        assert!(cli.debug);
        assert_eq!(cli.command.map(|c| c.label()), Some("webhook"));
    }

    #[test]
    fn format_status_covers_each_phase() {
        let mut status = LoginStatus {
            status: LoginPhase::WaitingQr,
            qr_file: Some("/qr".to_string()),
            logged_in_as: None,
            login_time: None,
            generated_at: Utc::now(),
        };
        assert!(format_status(&status).contains("/qr"));

        status.status = LoginPhase::Waiting;
        assert!(format_status(&status).contains("stopped"));

        status.status = LoginPhase::LoggedIn;
        status.logged_in_as = Some("628123".to_string());
        assert_eq!(format_status(&status), "Logged in as 628123");
    }
}
