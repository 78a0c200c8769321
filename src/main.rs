#![forbid(unsafe_code)]

//! `assessment-relay` — runs one assessment session and prints its events.
//!
//! Loads configuration, launches the agent through the container CLI, prints
//! every session event to stdout (plain text or JSON lines), forwards stdin
//! lines into the agent, and stops the session on Ctrl-C / SIGTERM.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use assessment_relay::config::GlobalConfig;
use assessment_relay::models::event::{EventKind, LifecycleStage, SessionEvent};
use assessment_relay::models::session::{LaunchParams, TerminalSignal};
use assessment_relay::orchestrator::session_manager::{
    ExecuteOptions, SessionControl, SessionManager,
};
use assessment_relay::runtime::discovery::TopologyOverride;
use assessment_relay::runtime::docker::DockerCli;
use assessment_relay::{AppError, Result};

/// Grace period for runtime tasks once the session has ended.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "assessment-relay", about = "Run a security-assessment agent session", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Assessment target (host, URL, or CIDR).
    #[arg(long)]
    target: String,

    /// Assessment module the agent should run.
    #[arg(long)]
    module: String,

    /// Extra launch parameter, repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Always create a fresh instance.
    #[arg(long, conflicts_with = "shared")]
    fresh: bool,

    /// Always exec into the running shared instance.
    #[arg(long)]
    shared: bool,

    /// Answer interactive prompts automatically.
    #[arg(long)]
    auto_confirm: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print events as JSON lines instead of text.
    #[arg(long)]
    json: bool,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    let outcome = rt.block_on(run(args));
    // The stdin reader sits on a blocking thread that only returns once a
    // line arrives; do not wait for it.
    rt.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    let signal = match outcome {
        Ok(signal) => signal,
        Err(err) => {
            error!(%err, "session failed");
            err.terminal_signal()
        }
    };
    ExitCode::from(signal.exit_code())
}

async fn run(args: Cli) -> Result<TerminalSignal> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => {
            let config = GlobalConfig::default();
            config.validate()?;
            config
        }
    };
    info!(runtime = %config.runtime.binary, "configuration loaded");

    let runtime = Arc::new(DockerCli::new(config.runtime.binary.clone()));
    let manager = SessionManager::new(runtime, config);

    let mut params = LaunchParams::new(args.target, args.module);
    params.extra.extend(args.params);

    let topology = if args.fresh {
        Some(TopologyOverride::Fresh)
    } else if args.shared {
        Some(TopologyOverride::Shared)
    } else {
        None
    };

    // ── Wire shutdown to the session abort signal ───────
    let abort = CancellationToken::new();
    let signal_abort = abort.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping session");
        signal_abort.cancel();
    });

    let options = ExecuteOptions {
        env: Vec::new(),
        auto_confirm: args.auto_confirm.then_some(true),
        topology,
        abort: Some(abort),
    };
    let mut handle = match manager.execute(params, options).await {
        Ok(handle) => handle,
        Err(err) => {
            signal_task.abort();
            return Err(err);
        }
    };

    let input_task = tokio::spawn(forward_stdin(handle.control()));

    // ── Print events until the terminal one ─────────────
    let mut signal = TerminalSignal::Stopped;
    while let Some(event) = handle.next_event().await {
        print_event(&event, args.json)?;
        if let SessionEvent::Terminated { signal: terminal, .. } = event {
            signal = terminal;
        }
    }

    input_task.abort();
    signal_task.abort();
    info!(?signal, "assessment-relay finished");
    Ok(signal)
}

/// Forward stdin lines into the session until stdin closes or the session ends.
async fn forward_stdin(control: SessionControl) {
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(%err, "stdin read failed, input forwarding stopped");
                break;
            }
        };
        if let Err(err) = control.send_input(&line).await {
            debug!(%err, "input not forwarded");
            if !control.is_active() {
                break;
            }
        }
    }
}

fn print_event(event: &SessionEvent, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if json {
        let line = serde_json::to_string(event)
            .map_err(|err| AppError::Stream(format!("failed to encode event: {err}")))?;
        writeln!(out, "{line}")?;
    } else {
        writeln!(out, "{}", render_text(event))?;
    }
    Ok(())
}

fn render_text(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Lifecycle { stage, .. } => match stage {
            LifecycleStage::Starting { detail } => format!("[starting] {detail}"),
            LifecycleStage::Ready => "[ready]".to_owned(),
            LifecycleStage::Error { message } => format!("[error] {message}"),
        },
        SessionEvent::Frame { frame } => match &frame.kind {
            EventKind::Message { content } => content.clone(),
            EventKind::Thinking { content } => format!("(thinking) {content}"),
            EventKind::ToolStart { tool_name, .. } => format!("[tool] {tool_name} started"),
            EventKind::ToolOutput { output, .. } => output.clone(),
            EventKind::ToolEnd { tool_name, status } => format!(
                "[tool] {} finished{}",
                tool_name.as_deref().unwrap_or("tool"),
                status.as_deref().map(|s| format!(" ({s})")).unwrap_or_default()
            ),
            EventKind::Step { index } => match index {
                Some(index) => format!("[step {index}]"),
                None => "[step]".to_owned(),
            },
            EventKind::Finding {
                title, severity, ..
            } => format!(
                "[finding:{}] {title}",
                severity.as_deref().unwrap_or("info")
            ),
            EventKind::Status { message } => format!("[status] {message}"),
            EventKind::Error { message } => format!("[agent error] {message}"),
            EventKind::Complete { summary } => match summary {
                Some(summary) => format!("[complete] {summary}"),
                None => "[complete]".to_owned(),
            },
            EventKind::Other { kind } => format!("[{kind}] {}", frame.to_json()),
        },
        SessionEvent::OutputChunk { content, .. } => content.trim_end_matches('\n').to_owned(),
        SessionEvent::Diagnostic { kind, message } => format!("[diagnostic:{kind:?}] {message}"),
        SessionEvent::PromptAnswered { pattern, response } => {
            format!("[auto-answer] {pattern}: {response:?}")
        }
        SessionEvent::Terminated { signal, reason } => format!("[terminated:{signal:?}] {reason}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
