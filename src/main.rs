//! Binary entrypoint for the meshscope CLI.
//!
//! Commands:
//! - `monitor [address]` - connect, request the config dump and log one line per frame;
//!   stdin accepts `!nodeid text` to send a direct message plus a few `/` commands
//! - `probe [address] [--timeout <s>]` - wait for the config dump and print a JSON report
//! - `init` - write a starter `meshscope.toml`
//!
//! See the library crate docs for module-level details: `meshscope::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use meshscope::config::Config;
use meshscope::logutil::escape_log;
use meshscope::metrics;
use meshscope::protocol::{summarize_frame, DisplayStatus, Envelope, NodeId};
use meshscope::session::MeshSession;

/// Interval between `heartbeat` frames while monitoring.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "meshscope")]
#[command(about = "Field diagnostics for Meshtastic devices over the HTTP API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshscope.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch live traffic and exchange direct messages
    Monitor {
        /// Device host name or IP (defaults to device.address from the config)
        address: Option<String>,
        /// Use https when the address has no scheme
        #[arg(long)]
        tls: bool,
        /// Poll interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },
    /// Request the config dump and print a JSON report of what the device knows
    Probe {
        /// Device host name or IP (defaults to device.address from the config)
        address: Option<String>,
        /// Use https when the address has no scheme
        #[arg(long)]
        tls: bool,
        /// Seconds to wait for the config dump before giving up
        #[arg(short, long, default_value_t = 20)]
        timeout: u64,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before a config exists
    let pre_config = match cli.command {
        Commands::Init { .. } => None,
        _ => Some(Config::load_or_default(&cli.config).await?),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Monitor {
            address,
            tls,
            poll_ms,
        } => {
            let mut config = pre_config.unwrap_or_default();
            if tls {
                config.device.tls = true;
            }
            if let Some(ms) = poll_ms {
                config.device.poll_interval_ms = ms;
            }
            config.validate()?;
            let address = address.unwrap_or_else(|| config.device.address.clone());
            monitor(config, &address).await?;
        }
        Commands::Probe {
            address,
            tls,
            timeout,
        } => {
            let mut config = pre_config.unwrap_or_default();
            if tls {
                config.device.tls = true;
            }
            let address = address.unwrap_or_else(|| config.device.address.clone());
            let complete = probe(config, &address, timeout).await?;
            std::process::exit(if complete { 0 } else { 1 });
        }
        Commands::Init { force } => {
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    cli.config
                ));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
    }

    Ok(())
}

async fn monitor(config: Config, address: &str) -> Result<()> {
    info!("Starting meshscope v{} against {}", env!("CARGO_PKG_VERSION"), address);
    let session = Arc::new(MeshSession::start(&config, address).await?);
    let state = Arc::clone(session.state());

    let _printer = {
        let nodes = Arc::clone(state.nodes());
        state
            .packets()
            .subscribe(move |frame| info!("{}", summarize_frame(frame, &nodes)))
    };

    let mut status = session.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!("link {}", current);
        }
    });

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };

    if let Err(e) = session.request_config().await {
        warn!("config request failed: {}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = session.send_heartbeat().await {
                    warn!("heartbeat failed: {}", e);
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_input(&session, &config, &line).await {
                            break;
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    session.shutdown().await;
    if let Err(e) = runner.await {
        error!("event loop task failed: {}", e);
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Input<'a> {
    Send { peer: u32, text: &'a str },
    Nodes,
    Conversations,
    Open(u32),
    Close,
    Favorite(u32),
    Delete(u32),
    Rebuild,
    Stats,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Result<Option<Input<'_>>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).unwrap_or_default();
        let node = || -> Result<u32> { Ok(arg.parse::<NodeId>()?.0) };
        let input = match cmd {
            "nodes" => Input::Nodes,
            "dms" => Input::Conversations,
            "open" => Input::Open(node()?),
            "close" => Input::Close,
            "fav" => Input::Favorite(node()?),
            "delete" => Input::Delete(node()?),
            "rebuild" => Input::Rebuild,
            "stats" => Input::Stats,
            "quit" => Input::Quit,
            "help" => Input::Help,
            other => return Err(anyhow!("unknown command /{}", other)),
        };
        return Ok(Some(input));
    }
    let (id, text) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| anyhow!("expected '!nodeid message'"))?;
    let peer = id.parse::<NodeId>()?.0;
    Ok(Some(Input::Send {
        peer,
        text: text.trim(),
    }))
}

/// Returns `false` when the operator asked to quit.
async fn handle_input(session: &MeshSession, config: &Config, line: &str) -> bool {
    let input = match parse_input(line) {
        Ok(Some(input)) => input,
        Ok(None) => return true,
        Err(e) => {
            println!("{}", e);
            return true;
        }
    };
    let state = session.state();
    match input {
        Input::Send { peer, text } => match session.send_direct_message(peer, text).await {
            Ok(msg) => println!(
                "-> {} (packet 0x{:08x}) {}",
                state.nodes().get_node_name(peer),
                msg.packet_id,
                escape_log(&msg.text)
            ),
            Err(e) => println!("send failed: {}", e),
        },
        Input::Nodes => {
            for node in state.nodes().nodes() {
                println!(
                    "{} {:<10} hops={} snr={} batt={} {}",
                    NodeId(node.num),
                    node.display_name(),
                    node.hops_away.map(|h| h.to_string()).unwrap_or_else(|| "?".into()),
                    node.snr.map(|s| format!("{:.1}", s)).unwrap_or_else(|| "-".into()),
                    node.battery_level
                        .map(|b| format!("{}%", b))
                        .unwrap_or_else(|| "-".into()),
                    if node.is_favorite { "*" } else { "" }
                );
            }
        }
        Input::Conversations => {
            for summary in state.conversations().summaries() {
                println!(
                    "{} [{} unread / {}] {}",
                    state.nodes().get_node_name(summary.peer),
                    summary.unread,
                    summary.message_count,
                    summary
                        .last_text
                        .as_deref()
                        .map(escape_log)
                        .unwrap_or_default()
                );
            }
        }
        Input::Open(peer) => {
            state.set_open_peer(Some(peer));
            let now = chrono::Utc::now();
            if let Some(thread) = state.conversations().conversation(peer) {
                for msg in &thread.messages {
                    let status = match state.conversations().display_status(msg, now) {
                        DisplayStatus::Pending => "…",
                        DisplayStatus::Acked => "✓",
                        DisplayStatus::Error => msg.error_reason.as_deref().unwrap_or("error"),
                        DisplayStatus::TimedOut => "timed out",
                    };
                    let who = if msg.is_own() {
                        "me".to_string()
                    } else {
                        state.nodes().get_node_name(msg.from)
                    };
                    println!(
                        "{} {}: {} [{}]",
                        msg.timestamp.format("%H:%M:%S"),
                        who,
                        escape_log(&msg.text),
                        status
                    );
                }
            }
        }
        Input::Close => state.set_open_peer(None),
        Input::Favorite(peer) => match state.nodes().toggle_favorite(peer) {
            Some(fav) => println!("{} favorite={}", NodeId(peer), fav),
            None => println!("unknown node {}", NodeId(peer)),
        },
        Input::Delete(peer) => {
            if state.open_peer() == Some(peer) {
                state.set_open_peer(None);
            }
            if !state.conversations().delete_conversation(peer) {
                println!("no conversation with {}", NodeId(peer));
            }
        }
        Input::Rebuild => {
            if let Err(e) = session.rebuild_derived().await {
                println!("rebuild failed: {:#}", e);
            }
        }
        Input::Stats => {
            let report = serde_json::json!({
                "status": session.transport().status(),
                "frames_held": state.packets().len(),
                "nodes": state.nodes().len(),
                "unread": state.conversations().total_unread(),
                "ack_timeout_secs": config.messages.ack_timeout_secs,
                "metrics": metrics::snapshot(),
            });
            println!("{}", report);
        }
        Input::Quit => return false,
        Input::Help => println!(
            "!nodeid text | /nodes | /dms | /open !id | /close | /fav !id | /delete !id | /rebuild | /stats | /quit"
        ),
    }
    true
}

async fn probe(config: Config, address: &str, timeout: u64) -> Result<bool> {
    let session = Arc::new(MeshSession::start(&config, address).await?);
    let state = Arc::clone(session.state());

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let _watch = state.packets().subscribe(move |frame| {
        if let Some(Envelope::ConfigComplete(id)) = frame.envelope() {
            let _ = done_tx.send(*id);
        }
    });
    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };

    info!("Probing {} (timeout {}s)", session.transport().base_url(), timeout);
    let request_id = session.request_config().await?;
    let wait = async {
        while let Some(id) = done_rx.recv().await {
            if id == request_id {
                return true;
            }
        }
        false
    };
    let complete = tokio::time::timeout(Duration::from_secs(timeout), wait)
        .await
        .unwrap_or(false);
    if !complete {
        warn!("no config_complete_id 0x{:08x} within {}s", request_id, timeout);
    }

    let nodes = state.nodes();
    let report = serde_json::json!({
        "status": if complete { "ok" } else { "incomplete" },
        "address": session.session_id(),
        "link": session.transport().status(),
        "config_request_id": format!("0x{:08x}", request_id),
        "my_node": nodes.my_node_num().map(|n| NodeId(n).to_string()),
        "node_count": nodes.len(),
        "nodes": nodes.nodes(),
        "frames": state.packets().len(),
        "metrics": metrics::snapshot(),
        "timeout_seconds": timeout,
    });
    println!("{}", report);

    session.shutdown().await;
    if let Err(e) = runner.await {
        error!("event loop task failed: {}", e);
    }
    Ok(complete)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // HTTP client internals stay at info
    builder.filter_module("hyper", log::LevelFilter::Info);
    builder.filter_module("reqwest", log::LevelFilter::Info);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    let file = log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eprintln!("cannot open log file {}: {}", path, e))
            .ok()
    });

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when stdout is a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
