use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kms_core::{
    AggregateHealth, EncryptionConfig, HealthConfig, ProviderConfig, ProviderRegistry,
    ResourceBinding,
};
use tracing::Instrument;

mod telemetry;

#[derive(Parser)]
#[command(
    name = "kms-probe",
    version,
    about = "Check KMS v2 plugins and run one-shot envelope transforms"
)]
struct Cli {
    #[command(flatten)]
    providers: ProviderArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ProviderArgs {
    /// JSON encryption config; replaces the --provider flags
    #[arg(long, env = "KMS_PROBE_CONFIG", conflicts_with = "provider")]
    config: Option<PathBuf>,
    /// Provider as `name=unix:///path/to/plugin.sock`, in priority order
    #[arg(long = "provider", value_parser = parse_provider)]
    provider: Vec<ProviderConfig>,
    /// Per-call plugin timeout
    #[arg(long, default_value_t = 3_000)]
    timeout_ms: u64,
    /// DEK cache size per provider (defaults to KMS_DEK_CACHE_SIZE or 1000)
    #[arg(long)]
    cache_size: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every provider once, or keep probing with --watch
    Health(HealthArgs),
    /// Encrypt stdin and write the stored envelope to stdout
    Encrypt(EncryptArgs),
    /// Decrypt an envelope from stdin and write the plaintext to stdout
    Decrypt(DecryptArgs),
}

#[derive(Args)]
struct HealthArgs {
    #[arg(long)]
    watch: bool,
    /// Probe interval while watching
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct EncryptArgs {
    /// Resource whose binding selects the provider
    #[arg(long, default_value = "secrets", conflicts_with = "provider")]
    resource: String,
    /// Encrypt with this provider regardless of bindings
    #[arg(long)]
    provider: Option<String>,
    /// Authenticated context, usually the storage key
    #[arg(long)]
    context: String,
}

#[derive(Args)]
struct DecryptArgs {
    #[arg(long)]
    context: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();
    let config = load_config(&cli.providers)?;
    let registry = ProviderRegistry::connect(&config).context("failed to build kms providers")?;

    match cli.command {
        Command::Health(args) => {
            let span = telemetry::command_span("health");
            handle_health(&registry, args).instrument(span).await
        }
        Command::Encrypt(args) => {
            let span = telemetry::command_span("encrypt");
            handle_encrypt(&registry, args).instrument(span).await
        }
        Command::Decrypt(args) => {
            let span = telemetry::command_span("decrypt");
            handle_decrypt(&registry, args).instrument(span).await
        }
    }
}

fn parse_provider(raw: &str) -> Result<ProviderConfig, String> {
    let (name, endpoint) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=unix:///path, got `{raw}`"))?;
    let provider = ProviderConfig::new(name.trim(), endpoint.trim());
    provider.validate().map_err(|err| err.to_string())?;
    Ok(provider)
}

fn load_config(args: &ProviderArgs) -> Result<EncryptionConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: EncryptionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        return Ok(config);
    }
    if args.provider.is_empty() {
        bail!("at least one --provider or --config is required");
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    let providers: Vec<ProviderConfig> = args
        .provider
        .iter()
        .cloned()
        .map(|provider| {
            let provider = provider.with_timeout(timeout);
            match args.cache_size {
                Some(size) => provider.with_cache_size(size),
                None => provider,
            }
        })
        .collect();
    let resources = vec![ResourceBinding {
        resources: vec!["secrets".into()],
        provider: providers[0].name.clone(),
    }];

    Ok(EncryptionConfig {
        providers,
        resources,
        health: HealthConfig::from_env(),
        ..EncryptionConfig::default()
    })
}

async fn handle_health(registry: &ProviderRegistry, args: HealthArgs) -> Result<()> {
    if !args.watch {
        let report = registry.health().check_all().await;
        print_report(&report, args.json)?;
        if !report.is_healthy() {
            process::exit(1);
        }
        return Ok(());
    }

    let interval = args
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(registry.health().config().interval);
    let _tasks = registry.health().spawn();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        print_report(&registry.health().aggregate(), args.json)?;
    }
}

fn print_report(report: &AggregateHealth, json: bool) -> Result<()> {
    if json {
        let checks: Vec<_> = report
            .checks
            .iter()
            .map(|check| {
                serde_json::json!({
                    "name": check.name,
                    "provider": check.provider,
                    "healthy": check.status.is_healthy(),
                    "status": check.status.to_string(),
                })
            })
            .collect();
        let body = serde_json::json!({ "healthy": report.is_healthy(), "checks": checks });
        println!("{body}");
    } else {
        println!("{report}");
    }
    Ok(())
}

async fn handle_encrypt(registry: &ProviderRegistry, args: EncryptArgs) -> Result<()> {
    let plaintext = read_stdin()?;
    let envelope = match &args.provider {
        Some(name) => {
            let provider = registry
                .provider(name)
                .with_context(|| format!("no provider named `{name}`"))?;
            provider
                .transformer()
                .transform_to_storage(&plaintext, args.context.as_bytes())
                .await
        }
        None => {
            registry
                .transform_to_storage(&args.resource, &plaintext, args.context.as_bytes())
                .await
        }
    }
    .context("encryption failed")?;
    write_stdout(&envelope)
}

async fn handle_decrypt(registry: &ProviderRegistry, args: DecryptArgs) -> Result<()> {
    let envelope = read_stdin()?;
    let plaintext = registry
        .transform_from_storage(&envelope, args.context.as_bytes())
        .await
        .context("decryption failed")?;
    write_stdout(&plaintext)
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("failed to read stdin")?;
    Ok(buf)
}

fn write_stdout(bytes: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes).context("failed to write stdout")?;
    stdout.flush().context("failed to write stdout")
}
