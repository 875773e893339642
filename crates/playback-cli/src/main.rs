mod config;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, EnvFilter};

use playback_core::{
    classify, format_time, headless_factory, notification_channel, substitute, FaultRecord,
    HeadlessSurface, HttpLoader, LoadRequest, Notification, PlaybackSession, Player, PlayerConfig,
    RecordingClient, RequestKind, SessionSnapshot, SessionState, SignedUrlDirectory,
    StreamSource, Substitution, TierMenu, WebhookConfig, WebhookDispatcher,
};

fn version_string() -> &'static str {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    const GIT_HASH: &str = env!("GIT_HASH");

    if GIT_HASH.is_empty() {
        VERSION
    } else {
        Box::leak(format!("{VERSION} ({GIT_HASH})").into_boxed_str())
    }
}

/// Headless HLS playback through signed, time-limited URLs.
#[derive(Parser)]
#[command(name = "hls-playback", version = version_string(), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server.
    Serve {
        /// Listen address (e.g. 0.0.0.0:8080). Overrides config file.
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Path to TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Play one stream from the command line (no API server).
    Play(PlayArgs),
    /// Show how a single request would be classified and rewritten.
    Resolve {
        /// Request URL as the engine would issue it.
        url: String,

        /// What the engine is asking for: manifest, level or segment.
        #[arg(long, default_value = "manifest")]
        kind: RequestKind,

        /// JSON file mapping stream keys to signed URLs.
        #[arg(long)]
        signed_urls: Option<PathBuf>,
    },
}

#[derive(Args)]
struct PlayArgs {
    /// Stream URL (.m3u8 for adaptive playback, anything else plays progressively).
    #[arg(required_unless_present = "recording", conflicts_with = "recording")]
    url: Option<String>,

    /// JSON file mapping stream keys to signed URLs.
    #[arg(long, conflicts_with = "recording")]
    signed_urls: Option<PathBuf>,

    /// Recording id to resolve through the recording service.
    #[arg(long, requires = "backend")]
    recording: Option<String>,

    /// Recording service base URL.
    #[arg(long)]
    backend: Option<String>,

    /// Bearer token for the recording service.
    #[arg(long)]
    token: Option<String>,

    /// Tier height pinned once the manifest is parsed.
    #[arg(long, default_value_t = 320)]
    target_height: u32,

    /// Let the engine adapt the tier to measured throughput.
    #[arg(long, default_value_t = false)]
    abr: bool,

    /// Stop after this many fragments.
    #[arg(long)]
    max_segments: Option<u64>,

    /// Optional webhook URL to POST notifications to.
    #[arg(long)]
    webhook_url: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen, config } => {
            run_serve(listen, config).await;
        }
        Commands::Play(args) => {
            init_tracing("pretty", "warn");
            if let Err(e) = run_play(args).await {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::Resolve {
            url,
            kind,
            signed_urls,
        } => {
            init_tracing("pretty", "warn");
            if let Err(e) = run_resolve(&url, kind, signed_urls.as_deref()) {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_serve(listen_override: Option<SocketAddr>, config_path: Option<PathBuf>) {
    let app_config = match config_path {
        Some(ref path) => match config::AppConfig::load(path) {
            Ok(c) => {
                init_tracing(&c.server.log_format, "info");
                tracing::info!(path = %path.display(), "Loaded config file");
                c
            }
            Err(e) => {
                init_tracing("pretty", "info");
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        },
        None => {
            init_tracing("pretty", "info");
            config::AppConfig::default()
        }
    };

    let listen = listen_override.unwrap_or(app_config.server.listen);
    let default_config = app_config.player.to_player_config();

    let (notification_tx, notification_rx) = notification_channel();

    let mut state = playback_api::state::AppState::new()
        .with_default_config(default_config.clone())
        .with_notification_tx(notification_tx.clone());

    if let Some(backend) = &app_config.backend {
        match backend.to_client() {
            Ok(client) => {
                tracing::info!(base_url = %client.base_url(), "Recording service configured");
                state = state.with_backend(client);
            }
            Err(e) => {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let webhook_handle = if app_config.webhook.is_empty() {
        tokio::spawn(async move {
            let mut rx = notification_rx;
            while rx.recv().await.is_some() {}
        })
    } else {
        let client = HttpLoader::build_client(default_config.request_timeout);
        let dispatcher =
            WebhookDispatcher::new(notification_rx, app_config.webhook.clone(), client);
        tracing::info!(count = app_config.webhook.len(), "Webhook dispatcher started");
        tokio::spawn(dispatcher.run())
    };

    tracing::info!(%listen, "Starting HLS playback API server");
    let shutdown = playback_api::shutdown_signal();
    if let Err(e) = playback_api::serve_with_state(listen, state, shutdown).await {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }

    drop(notification_tx);

    match tokio::time::timeout(std::time::Duration::from_secs(5), webhook_handle).await {
        Ok(_) => tracing::info!("Webhook dispatcher shut down"),
        Err(_) => tracing::warn!("Webhook dispatcher did not shut down in time, aborting"),
    }

    tracing::info!("Shutdown complete");
}

fn load_directory(path: &Path) -> Result<SignedUrlDirectory, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read signed URLs {}: {}", path.display(), e))?;
    let entries: HashMap<String, String> = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse signed URLs {}: {}", path.display(), e))?;
    SignedUrlDirectory::from_entries(entries).map_err(|e| e.to_string())
}

async fn resolve_play_source(args: &PlayArgs) -> Result<StreamSource, String> {
    if let Some(recording_id) = &args.recording {
        let base = args
            .backend
            .as_deref()
            .ok_or("--recording needs --backend")?;
        let base_url =
            config::parse_http_url(base).map_err(|e| format!("Invalid --backend: {}", e))?;
        let client = RecordingClient::new(base_url, args.token.clone());
        return client.resolve(recording_id).await.map_err(|e| e.to_string());
    }

    let url = args.url.as_deref().ok_or("a stream URL or --recording is required")?;
    config::parse_http_url(url).map_err(|e| format!("Invalid URL: {}", e))?;
    let directory = args.signed_urls.as_deref().map(load_directory).transpose()?;
    StreamSource::from_url(url, directory).map_err(|e| e.to_string())
}

async fn run_play(args: PlayArgs) -> Result<(), String> {
    if args.target_height == 0 {
        return Err("--target-height must be greater than 0".into());
    }
    let config = PlayerConfig::default()
        .with_target_height(args.target_height)
        .with_abr(args.abr)
        .with_max_segments(args.max_segments);

    let source = resolve_play_source(&args).await?;

    let (tx, mut notifications) = notification_channel();
    let (webhook_tx, webhook_rx) = notification_channel();
    if let Some(url) = &args.webhook_url {
        let client = HttpLoader::build_client(config.request_timeout);
        let webhooks = vec![WebhookConfig::new(url.clone())];
        let dispatcher = WebhookDispatcher::new(webhook_rx, webhooks, client);
        tokio::spawn(dispatcher.run());
    }

    print_header(&source, &config, args.webhook_url.as_deref());

    let fetch: Arc<dyn playback_core::Loader> = Arc::new(HttpLoader::from_config(&config));
    let factory = headless_factory();
    let session = PlaybackSession::start(
        source,
        config,
        Box::new(HeadlessSurface::new()),
        Arc::clone(&fetch),
        |loader, config| factory(loader, config),
    )
    .with_notifier(Some(tx));
    let (handle, task) = Player::spawn(session, fetch, factory);

    let bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {wide_msg}").map_err(|e| e.to_string())?,
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(120));

    let mut updates = handle.subscribe();
    let mut menu_printed = false;
    let shutdown = playback_api::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if !menu_printed {
                    if let Some(menu) = snapshot.tiers.as_ref().filter(|m| !m.tiers.is_empty()) {
                        bar.println(format_menu(menu));
                        menu_printed = true;
                    }
                }
                bar.set_message(format_progress(&snapshot));
                if snapshot.state != SessionState::Active {
                    break;
                }
            }
            Some(notification) = notifications.recv() => {
                if let Some(line) = format_notification(&notification) {
                    bar.println(line);
                }
                if args.webhook_url.is_some() {
                    let _ = webhook_tx.send(notification);
                }
            }
            _ = &mut shutdown => {
                bar.println(format!("{}", style("Interrupted.").dim()));
                break;
            }
        }
    }

    let last = handle.snapshot();
    if handle.stop().await.is_err() {
        tracing::debug!(session_id = handle.id(), "Player had already stopped");
    }
    if let Err(e) = task.await {
        tracing::warn!(error = %e, "Player task did not finish cleanly");
    }
    bar.finish_and_clear();

    while let Ok(notification) = notifications.try_recv() {
        if let Some(line) = format_notification(&notification) {
            println!("{}", line);
        }
        if args.webhook_url.is_some() {
            let _ = webhook_tx.send(notification);
        }
    }
    drop(webhook_tx);

    println!("{}", format_progress(&last));
    match last.state {
        SessionState::Failed { message } => Err(message),
        _ => Ok(()),
    }
}

fn run_resolve(url: &str, kind: RequestKind, signed_urls: Option<&Path>) -> Result<(), String> {
    let directory = signed_urls.map(load_directory).transpose()?.unwrap_or_default();
    let request = LoadRequest::new(url, kind);

    println!("  {} {}", style("request:").dim(), style(url).bold());
    println!("  {} {}", style("kind:   ").dim(), kind);
    println!("  {} {}", style("ref:    ").dim(), classify(url, kind));

    match substitute(&directory, &request) {
        Substitution::Rewritten { url, .. } => {
            println!("  {} {}", style("signed: ").dim(), style(url).green());
        }
        Substitution::DirectoryMiss(reference) => {
            println!(
                "  {} {} {}",
                style("signed: ").dim(),
                style("no entry for").yellow(),
                reference
            );
        }
        Substitution::Unclassified => {
            println!(
                "  {} {}",
                style("signed: ").dim(),
                style("unclassified, sent unchanged").yellow()
            );
        }
    }
    Ok(())
}

fn print_header(source: &StreamSource, config: &PlayerConfig, webhook_url: Option<&str>) {
    println!(
        "{} {}",
        style("hls-playback").bold(),
        style(env!("CARGO_PKG_VERSION")).dim()
    );
    println!("  {} {}", style("url:    ").dim(), style(source.url()).bold());
    println!("  {} {}", style("kind:   ").dim(), source.kind());
    let signed = source.directory().map(|d| d.tiers().join(",")).unwrap_or_default();
    if !signed.is_empty() {
        println!("  {} {}", style("signed: ").dim(), signed);
    }
    println!("  {} {}p", style("target: ").dim(), config.target_height);
    println!("  {} {}", style("abr:    ").dim(), config.abr_enabled);
    if let Some(wh) = webhook_url {
        println!("  {} {}", style("webhook:").dim(), wh);
    }
    println!();
}

fn format_menu(menu: &TierMenu) -> String {
    let mut lines = vec![format!("  {}", style("tiers").bold())];
    for tier in &menu.tiers {
        let marker = if menu.active.index() == Some(tier.id) {
            style("*").green().bold().to_string()
        } else {
            " ".to_string()
        };
        lines.push(format!(
            "  {} {:>2}  {:<18} {}x{}",
            marker, tier.id, tier.name, tier.width, tier.height
        ));
    }
    lines.join("\n")
}

fn format_notification(notification: &Notification) -> Option<String> {
    let ts = chrono::Local::now().format("%H:%M:%S").to_string();
    match notification {
        Notification::TierSwitched { tier, .. } => Some(format!(
            "  {}  {:<8} {}",
            style(ts).dim(),
            style("SWITCH").green(),
            tier.display_name()
        )),
        Notification::Fault { record, .. } => Some(format_fault(record)),
        Notification::SessionFailed { message, .. } => Some(format!(
            "  {}  {:<8} {}",
            style(ts).dim(),
            style("FAILED").red().bold(),
            message
        )),
        Notification::SessionEnded { .. } => None,
    }
}

fn format_fault(record: &FaultRecord) -> String {
    let ts = record
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string();
    let label = if record.fatal {
        style(format!("{:<8}", "FATAL")).red().bold()
    } else {
        style(format!("{:<8}", "FAULT")).yellow()
    };
    format!(
        "  {}  {} {:<8} {}  {}",
        style(ts).dim(),
        label,
        record.kind,
        style(&record.action).dim(),
        record.details
    )
}

fn format_progress(snapshot: &SessionSnapshot) -> String {
    let tier = snapshot
        .active_tier
        .as_ref()
        .map(|t| t.name.clone())
        .unwrap_or_else(|| "-".into());
    let position = format_time(snapshot.transport.position);
    let duration = snapshot
        .transport
        .duration
        .map(format_time)
        .unwrap_or_else(|| "-:--".into());
    let faults: u64 = snapshot.fault_counts.values().sum();
    format!(
        "{:<7} {} / {}  tier {}  fragments {}  faults {}",
        snapshot.state.name(),
        position,
        duration,
        tier,
        snapshot.fragments_loaded,
        faults
    )
}

fn init_tracing(log_format: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_format {
        "json" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }
}
