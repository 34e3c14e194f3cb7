//! URD CLI - discovery based command interface over Zenoh
//!
//! Discovers the daemon's RPC services and publishers at startup and calls
//! or subscribes to them generically. No service-specific logic.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use urd_client_zenoh::{CallArgs, CallResponse, Client, ClientError, Message, SdkConfig, SubscribeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Compact,
}

#[derive(Parser)]
#[command(name = "urd_cli")]
#[command(about = "Universal Robots CLI via Zenoh service discovery")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// SDK config file (client and zenoh sections)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Default RPC timeout in seconds
    #[arg(long, global = true)]
    rpc_timeout: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered services and publishers
    Discover,
    /// Print the raw API description
    Api,
    /// Call a discovered service
    Call {
        /// Service name (see `discover`)
        service: String,
        /// Positional arguments, parsed as JSON and falling back to strings
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
        /// Keyword argument
        #[arg(short = 'k', long = "kwarg", value_name = "KEY=VALUE")]
        kwargs: Vec<String>,
        /// Timeout for this call in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Subscribe to a publisher name or topic
    Sub {
        /// Publisher name (e.g. blocks) or key expression
        topic: String,
        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Stop after this many seconds
        #[arg(short = 't', long, default_value_t = 10.0)]
        timeout: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "urd_cli=info,urd_client=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SdkConfig::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SdkConfig::default(),
    };
    if let Some(secs) = args.rpc_timeout {
        config.client = config.client.with_rpc_timeout(seconds(secs)?);
    }

    let client = urd_client_zenoh::connect_with(&config)
        .await
        .context("Failed to connect to URD daemon. Make sure the urd daemon is running")?;

    let result = match args.command {
        Commands::Discover => discover(&client, args.format),
        Commands::Api => print_json(&client.api(), args.format),
        Commands::Call {
            service,
            args: positional,
            kwargs,
            timeout,
        } => call(&client, &service, &positional, &kwargs, timeout, args.format).await,
        Commands::Sub { topic, count, timeout } => {
            subscribe(&client, &topic, count, timeout, args.format).await
        }
    };

    client.close().await;
    result
}

fn discover(client: &Client, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&client.api(), format);
    }

    println!("Available URD services:");
    println!("\nRPC Services:");
    for method in client.methods() {
        println!("  - {}", method.signature());
        println!("      {} ({})", method.descriptor().description, method.descriptor().topic);
    }

    let mut publishers = client.list_publishers().peekable();
    if publishers.peek().is_some() {
        println!("\nPublishers:");
        for publisher in publishers {
            println!(
                "  - {} ({}): {} [{} @ {} Hz]",
                publisher.name,
                publisher.topic,
                publisher.description,
                publisher.message_type,
                publisher.rate_hz
            );
        }
    }
    Ok(())
}

async fn call(
    client: &Client,
    service: &str,
    positional: &[String],
    kwargs: &[String],
    timeout: Option<f64>,
    format: OutputFormat,
) -> Result<()> {
    let method = client.method(service).map_err(|e| {
        let available: Vec<&str> = client.list_services().map(|s| s.name.as_str()).collect();
        anyhow::anyhow!("{}. Available services: {}", e, available.join(", "))
    })?;

    let mut call_args: CallArgs = positional.iter().map(|a| parse_value(a)).collect();
    for kwarg in kwargs {
        let (key, value) = kwarg
            .split_once('=')
            .with_context(|| format!("Keyword argument '{}' must be KEY=VALUE", kwarg))?;
        call_args = call_args.kwarg(key, parse_value(value));
    }
    if let Some(secs) = timeout {
        call_args = call_args.timeout(seconds(secs)?);
    }

    info!("🔄 Calling service: {}", method.descriptor().topic);
    match method.call(call_args).await {
        Ok(response) => print_response(&response, format),
        Err(ClientError::RemoteOperation { message, details, .. }) => {
            let failure = serde_json::json!({
                "success": false,
                "message": message,
                "data": details,
            });
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&failure)?),
                _ => {
                    println!("✗ Failed: {}", message.as_deref().unwrap_or("No message"));
                    if let Some(data) = details.filter(|d| !d.is_null()) {
                        println!("📊 Data: {}", serde_json::to_string_pretty(&data)?);
                    }
                }
            }
            anyhow::bail!("Service '{}' reported failure", service)
        }
        Err(e @ ClientError::Arity { .. })
        | Err(e @ ClientError::Validation { .. })
        | Err(e @ ClientError::InvalidArgument { .. }) => {
            anyhow::bail!("{}\n\n{}", e, method.help())
        }
        Err(e) => Err(e.into()),
    }
}

async fn subscribe(
    client: &Client,
    topic: &str,
    count: Option<usize>,
    timeout: f64,
    format: OutputFormat,
) -> Result<()> {
    let mut options = SubscribeOptions::new(seconds(timeout)?);
    if let Some(count) = count {
        options = options.with_count(count);
    }

    let (interrupt_tx, mut interrupt_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, stopping subscription...");
        let _ = interrupt_tx.send(true);
    })
    .context("Failed to set signal handler")?;

    let mut subscription = client.subscribe(topic, options).await?;
    info!("Listening on '{}' (Ctrl+C to stop)", subscription.topic());

    loop {
        tokio::select! {
            message = subscription.next() => match message {
                Some(message) => print_message(&message, format)?,
                None => break,
            },
            _ = interrupt_rx.changed() => {
                subscription.cancel().await;
                break;
            }
        }
    }

    if format == OutputFormat::Text {
        println!(
            "Received {} messages ({} dropped)",
            subscription.delivered(),
            subscription.dropped()
        );
    }
    Ok(())
}

fn print_response(response: &CallResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response.to_json())?),
        OutputFormat::Compact => println!("{}", response),
        OutputFormat::Text => {
            match response.success() {
                Some(true) | None => println!("✓ Success: {}", response.message().unwrap_or("No message")),
                Some(false) => println!("✗ Failed: {}", response.message().unwrap_or("No message")),
            }
            if let Some(data) = response.data() {
                println!("📊 Data: {}", serde_json::to_string_pretty(data)?);
            }
            for field in response.fields() {
                if ["success", "message", "data"].contains(&field) {
                    continue;
                }
                if let Some(value) = response.get(field).filter(|v| !v.is_null()) {
                    println!("🔹 {}: {}", field, value);
                }
            }
        }
    }
    Ok(())
}

fn print_message(message: &Message, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let line = serde_json::json!({
                "topic": message.topic(),
                "received_at": message.received_at().to_rfc3339(),
                "payload": message.payload(),
            });
            println!("{}", line);
        }
        OutputFormat::Compact => println!("{}", message),
        OutputFormat::Text => println!(
            "[{}] {}: {}",
            message
                .received_at()
                .with_timezone(&chrono::Local)
                .format("%H:%M:%S%.3f"),
            message.topic(),
            serde_json::to_string_pretty(message.payload())?
        ),
    }
    Ok(())
}

fn print_json(value: &Value, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Compact => println!("{}", value),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// CLI values are JSON when they parse as JSON, strings otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn seconds(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if secs > 0.0 => Ok(duration),
        _ => anyhow::bail!("Timeout must be a positive number of seconds, got {}", secs),
    }
}
