use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tandem_core::{ChatTurn, Envelope, EnvelopeKind, FrameDecoder, TaskType};
use tandem_gateway::GatewayServer;
use tandem_gateway::server::PROVIDER_USED_HEADER;

mod config;

use config::TandemConfig;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version)]
#[command(about = "Tandem — multi-provider chat and media gateway with fallback")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Override the [server] bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Send one chat message and stream the reply
    Ask {
        /// The message to send
        message: String,

        /// Provider to try first
        #[arg(short, long)]
        provider: Option<String>,

        /// Base URL of a running gateway; runs in-process when omitted
        #[arg(long)]
        url: Option<String>,
    },

    /// List providers per task in fallback order
    Providers,

    /// Show current configuration (secrets masked)
    Config,

    /// Initialize config directory and default config
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins unless --debug is given
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Providers => cmd_providers(&cli.config).await,
        Commands::Serve { bind } => cmd_serve(&cli.config, bind).await,
        Commands::Ask {
            message,
            provider,
            url,
        } => match url {
            Some(url) => cmd_ask_remote(&url, message, provider).await,
            None => cmd_ask(&cli.config, message, provider).await,
        },
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Tandem initialized at {}", config_dir.display());
    println!(
        "Export OPENAI_API_KEY / ANTHROPIC_API_KEY / REPLICATE_API_TOKEN or edit {} to configure providers.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = TandemConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.masked())?);
    Ok(())
}

async fn cmd_providers(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = TandemConfig::load(config_path)?;
    let registry = cfg.build_registry()?;

    for task in TaskType::ALL {
        println!("{}:", task);
        let chain = registry.get_order(task, None);
        if chain.is_empty() {
            println!("  (none)");
        }
        for (i, d) in chain.iter().enumerate() {
            println!("  {}. {} ({}) priority {}", i + 1, d.id, d.display_name, d.priority);
        }
    }
    Ok(())
}

async fn cmd_serve(config_path: &Option<PathBuf>, bind: Option<String>) -> Result<()> {
    let mut cfg = TandemConfig::load(config_path)?;
    if let Some(bind) = bind {
        cfg.server.bind = bind;
    }
    let addr = cfg.bind_addr()?;
    let handler = cfg.build_handler().context("Failed to build providers")?;
    info!(
        "Starting gateway with {} chat, {} image, {} video, {} optimize provider(s)",
        handler.registry().len(TaskType::Chat),
        handler.registry().len(TaskType::Image),
        handler.registry().len(TaskType::Video),
        handler.registry().len(TaskType::Optimize),
    );

    let cancel = CancellationToken::new();
    let server = GatewayServer::new(addr, handler).spawn(cancel.clone());

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    server.await.context("Gateway task panicked")??;
    println!("Tandem stopped.");
    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, message: String, provider: Option<String>) -> Result<()> {
    let cfg = TandemConfig::load(config_path)?;
    let handler = cfg.build_handler()?;

    let turn = ChatTurn {
        message,
        provider_id: provider,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let mut chat = handler.stream_chat(&turn, cancel.clone()).await?;
    debug!(
        "Answering with {} after {} attempt(s)",
        chat.provider_used,
        chat.attempts.len()
    );

    loop {
        let envelope = tokio::select! {
            _ = signal::ctrl_c() => {
                cancel.cancel();
                bail!("Interrupted");
            }
            next = chat.envelopes.next() => next,
        };
        match envelope {
            Some(envelope) => {
                if render(&envelope)? {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(())
}

async fn cmd_ask_remote(url: &str, message: String, provider: Option<String>) -> Result<()> {
    let endpoint = format!("{}/api/chat", url.trim_end_matches('/'));
    let body = serde_json::json!({
        "message": message,
        "providerId": provider,
        "history": [],
    });

    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach gateway at {}", endpoint))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(text);
        bail!("Gateway returned {}: {}", status, message);
    }

    if let Some(provider) = response.headers().get(PROVIDER_USED_HEADER).and_then(|v| v.to_str().ok()) {
        debug!("Answering with {}", provider);
    }

    let mut decoder = FrameDecoder::new();
    let mut bytes = response.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.context("Stream from gateway broke")?;
        for envelope in decoder.push(&chunk) {
            if render(&envelope?)? {
                return Ok(());
            }
        }
    }
    bail!("Gateway closed the stream without a terminal event")
}

/// Print one envelope. Returns true once the stream is over.
fn render(envelope: &Envelope) -> Result<bool> {
    match envelope.kind {
        EnvelopeKind::Token => {
            let mut stdout = std::io::stdout();
            stdout.write_all(envelope.data.as_deref().unwrap_or_default().as_bytes())?;
            stdout.flush()?;
            Ok(false)
        }
        EnvelopeKind::End => {
            println!();
            Ok(true)
        }
        EnvelopeKind::Error => {
            println!();
            bail!("{}", envelope.data.as_deref().unwrap_or("stream failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask_flags() {
        let cli = Cli::try_parse_from([
            "tandem", "--debug", "ask", "hello there", "--provider", "anthropic", "--url", "http://127.0.0.1:8787",
        ])
        .unwrap();
        assert!(cli.debug);
        let Commands::Ask { message, provider, url } = cli.command else {
            panic!("expected ask");
        };
        assert_eq!(message, "hello there");
        assert_eq!(provider.as_deref(), Some("anthropic"));
        assert_eq!(url.as_deref(), Some("http://127.0.0.1:8787"));
    }

    #[test]
    fn test_parse_serve_with_global_config() {
        let cli = Cli::try_parse_from(["tandem", "serve", "--bind", "0.0.0.0:9000", "-c", "/tmp/t.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(matches!(cli.command, Commands::Serve { bind: Some(ref b) } if b == "0.0.0.0:9000"));
    }

    #[test]
    fn test_render_terminal_envelopes() {
        assert!(!render(&Envelope::token("")).unwrap());
        assert!(render(&Envelope::end()).unwrap());
        let err = render(&Envelope::error("The provider failed: boom")).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
