#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use lark_courier::channels::{Channel, LarkChannel};
use lark_courier::config::Config;
use lark_courier::delivery::{self, LarkTransport, Outbox, SendStatus};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Deliver long-form text to Lark / Feishu chats.
#[derive(Parser, Debug)]
#[command(name = "lark-courier")]
#[command(version)]
#[command(about = "Deliver long-form text to Lark / Feishu chats.", long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to $LARK_COURIER_CONFIG or ~/.lark-courier/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a message, choosing direct send, document or chunks by length
    Send {
        /// Destination chat (oc_...) or user (ou_...)
        #[arg(long)]
        chat: String,

        /// Read the message body from this file instead of the arguments
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Seconds to wait for the long connection to become ready
        #[arg(long, default_value_t = 30)]
        connect_timeout: u64,

        /// Message text; read from stdin when neither this nor --file is given
        text: Vec<String>,
    },
    /// Print inbound messages as JSON lines
    Listen,
    /// Preview how stdin would be split into chunks
    Chunk {
        /// Maximum characters per chunk (defaults to the configured value)
        #[arg(long)]
        max_length: Option<usize>,
    },
    /// Preview the document title derived from stdin
    Title {
        /// Label used for the timestamp fallback
        #[arg(long, default_value = "Message")]
        label: String,
    },
    /// Manage configuration
    #[command(long_about = "\
Inspect the lark-courier configuration.

Use 'schema' to dump the JSON Schema for config.toml, which documents \
every available key, type and default value.

Examples:
  lark-courier config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
    /// Generate shell completion script to stdout
    ///
    /// Examples:
    /// - `lark-courier completions bash >> ~/.bashrc`
    /// - `lark-courier completions zsh > ~/.zfunc/_lark-courier`
    #[command(verbatim_doc_comment)]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Both ring and aws-lc-rs may be compiled in; pick one explicitly.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Chunk { max_length } => {
            let max_length = match max_length {
                Some(max) => max,
                None => load_config(cli.config.as_deref()).await?.delivery.chunk_max_length,
            };
            if max_length == 0 {
                bail!("--max-length must be greater than 0");
            }
            let input = read_stdin().await?;
            let chunks = delivery::label_chunks(&delivery::chunk_text(&input, max_length));
            let mut stdout = std::io::stdout().lock();
            for chunk in &chunks {
                writeln!(stdout, "{chunk}\n")?;
            }
            info!(chunk_count = chunks.len(), "Chunk preview done");
            Ok(())
        }
        Commands::Title { label } => {
            let input = read_stdin().await?;
            println!("{}", delivery::extract_title(&input, &label));
            Ok(())
        }
        Commands::Listen => {
            let config = load_config(cli.config.as_deref()).await?;
            let channel = LarkChannel::from_config(&config.lark);
            let (tx, mut rx) = tokio::sync::mpsc::channel(100);
            let listener = tokio::spawn(async move { channel.listen(tx).await });

            let mut stdout = std::io::stdout();
            while let Some(message) = rx.recv().await {
                writeln!(stdout, "{}", serde_json::to_string(&message)?)?;
                stdout.flush()?;
            }
            listener.await.context("listener task panicked")?
        }
        Commands::Send {
            chat,
            file,
            connect_timeout,
            text,
        } => {
            let config = load_config(cli.config.as_deref()).await?;
            let body = match (file, text.is_empty()) {
                (Some(path), _) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, false) => text.join(" "),
                (None, true) => read_stdin().await?,
            };
            if body.trim().is_empty() {
                bail!("nothing to send");
            }
            send(&config, &chat, &body, Duration::from_secs(connect_timeout)).await
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&schema).context("serializing JSON Schema")?
                );
                Ok(())
            }
        },
        Commands::Completions { .. } => Ok(()),
    }
}

async fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    Config::load_or_init(path).await
}

async fn read_stdin() -> Result<String> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("reading stdin")?;
    Ok(input)
}

async fn send(config: &Config, chat: &str, body: &str, connect_timeout: Duration) -> Result<()> {
    if !LarkChannel::owns_chat(chat) {
        warn!(chat, "Destination does not look like a Lark chat or user id");
    }

    let channel = LarkChannel::from_config(&config.lark);
    let transport: Arc<dyn LarkTransport> = Arc::new(channel.clone());
    let outbox = Outbox::new(transport, &config.delivery, &config.documents);

    tokio::time::timeout(connect_timeout, outbox.connect(&channel))
        .await
        .context("timed out waiting for the long connection")??;

    let mut status = outbox.send(chat, body).await;
    while let SendStatus::Requeued { attempts } = status {
        let delay = retry_delay(attempts);
        info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying queued message");
        tokio::time::sleep(delay).await;
        status = match outbox.flush().await.pop() {
            Some(next) => next,
            None => bail!("connection lost before the message was delivered"),
        };
    }
    outbox.disconnect();

    match status {
        SendStatus::Sent => println!("sent"),
        SendStatus::Published(delivery::PublishOutcome::Document(doc)) => {
            println!("published {} -> {}", doc.file_name, doc.link);
        }
        SendStatus::Published(delivery::PublishOutcome::Chunked { chunks, reason }) => {
            println!("sent in {chunks} chunks ({reason})");
        }
        SendStatus::DeadLettered => {
            for letter in outbox.dead_letters() {
                eprintln!(
                    "undelivered after {} attempts: {}",
                    letter.delivery.attempts, letter.reason
                );
            }
            bail!("message could not be delivered");
        }
        SendStatus::Queued | SendStatus::Requeued { .. } => {
            bail!("message is still queued ({} pending)", outbox.queue_len());
        }
    }
    Ok(())
}

/// Pause before retry `attempts + 1`: 1 s, doubling, capped at 30 s.
fn retry_delay(attempts: u32) -> Duration {
    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);
    let exponent = attempts.saturating_sub(1).min(16);
    BASE.saturating_mul(1u32 << exponent).min(MAX)
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
