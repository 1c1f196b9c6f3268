use anyhow::{bail, Context, Result};
use clap::Parser;
use dcc_transfer::{
    config::Settings, network::protocol, DccEngine, EngineHandle, OutgoingControl, TransferEvent,
    TransferId,
};
use futures::{SinkExt, StreamExt};
use tokio::io::Stdout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dcc-transfer")]
#[command(about = "DCC file transfer engine bridged over stdin/stdout")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

type Output = FramedWrite<Stdout, LinesCodec>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the chat channel, so logs go to stderr.
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("dcc_transfer={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    info!("Starting dcc-transfer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    info!("Saving downloads to {}", settings.download_dir().display());

    let (engine, handle, mut control, mut events) = DccEngine::new(settings);
    let engine_task = tokio::spawn(engine.run());

    let mut input = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut output: Output = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());

    let shutdown_signal = setup_shutdown_handler();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            line = input.next() => match line {
                Some(Ok(line)) => {
                    if let Err(e) = handle_line(&handle, &line, &mut output).await {
                        warn!("{}", e);
                        output.send(format!("* error: {}", e)).await?;
                    }
                }
                Some(Err(e)) => warn!("Unreadable input line: {}", e),
                None => {
                    info!("Input closed");
                    break;
                }
            },
            Some(OutgoingControl { partner, text }) = control.recv() => {
                output.send(format!("{} DCC {}", partner, text)).await?;
            }
            Some(event) = events.recv() => {
                if let Some(line) = describe(&event) {
                    output.send(line).await?;
                }
            }
            result = &mut shutdown_signal => {
                if let Err(e) = result {
                    error!("Signal handler failed: {}", e);
                }
                info!("Shutdown signal received, stopping engine...");
                break;
            }
        }
    }

    let _ = handle.shutdown().await;
    engine_task.await.context("engine task")?;
    info!("dcc-transfer stopped");
    Ok(())
}

/// Runs one input line: a slash command or `<nick> [DCC] <verb> <args...>`.
async fn handle_line(handle: &EngineHandle, line: &str, output: &mut Output) -> Result<()> {
    let words = protocol::tokenize(line);
    let Some(first) = words.first() else {
        return Ok(());
    };

    match first.as_str() {
        "/accept" => {
            let id = parse_id(words.get(1))?;
            handle.accept(id).await?;
        }
        "/abort" => {
            let id = parse_id(words.get(1))?;
            handle.abort(id).await?;
        }
        "/send" => {
            let (Some(nick), Some(path)) = (words.get(1), words.get(2)) else {
                bail!("usage: /send <nick> <path> [passive]");
            };
            let passive = words.get(3).map(|w| w == "passive");
            let id = handle.offer_file(nick, path.as_str(), passive).await?;
            output.send(format!("* offered {} as {}", path, id)).await?;
        }
        "/chat" => {
            let Some(nick) = words.get(1) else {
                bail!("usage: /chat <nick> [passive]");
            };
            let passive = words.get(2).map(|w| w == "passive").unwrap_or(false);
            handle.offer_chat(nick, passive).await?;
        }
        "/list" => {
            for snapshot in handle.snapshot().await? {
                output.send(serde_json::to_string(&snapshot)?).await?;
            }
        }
        command if command.starts_with('/') => bail!("unknown command {}", command),
        nick => {
            let mut args = &words[1..];
            if args
                .first()
                .map(|w| w.eq_ignore_ascii_case("DCC"))
                .unwrap_or(false)
            {
                args = &args[1..];
            }
            handle.handle_control(nick, args).await?;
        }
    }
    Ok(())
}

fn parse_id(word: Option<&String>) -> Result<TransferId> {
    let word = word.context("missing transfer id")?;
    word.parse()
        .with_context(|| format!("invalid transfer id '{}'", word))
}

fn describe(event: &TransferEvent) -> Option<String> {
    match event {
        TransferEvent::OfferReceived { id } => Some(format!(
            "* offer {} received, /accept {} to download",
            id, id.0
        )),
        TransferEvent::ChatOffered {
            partner,
            address,
            port,
            ..
        } => Some(format!("* {} offers a chat at {}:{}", partner, address, port)),
        TransferEvent::Notice { text, .. } => Some(format!("* {}", text)),
        TransferEvent::StatusChanged { id, new, .. } => Some(format!("* {} {}", id, new)),
        TransferEvent::Progress { .. } | TransferEvent::Done { .. } => None,
    }
}

async fn setup_shutdown_handler() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
