//! Turnstile operator CLI
//!
//! Runs one engine operation against the configured storage backend and
//! prints the result as JSON.
//!
//! ```bash
//! # Register policies from a bundle
//! turnstile --config turnstile.yaml apply policies.yaml
//!
//! # Consume quota for a subject
//! turnstile consume --tenant T-1 --subject-id U-1 --resource /api/v1/orders --cost 2
//!
//! # Inspect recent denials
//! turnstile audit --tenant T-1 --limit 20
//! ```
//!
//! Only the file backend keeps state between invocations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, StorageBackendKind, TurnstileConfig};
use turnstile::ratelimit::{
    ConsumeRequest, PolicyBundle, RateLimiter, Resource, ResourceType, Subject, SubjectType,
};

#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(about = "Multi-tenant quota and rate limiting decision engine")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upsert every policy in a bundle file
    Apply {
        /// Policy bundle in YAML
        bundle: PathBuf,
    },
    /// List policies by descending priority
    Policies {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Evaluate a request and consume quota if allowed
    Consume(RequestArgs),
    /// Evaluate a request without consuming quota
    Check(RequestArgs),
    /// List audit events, most recent first
    Audit {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(long)]
    tenant: String,

    #[arg(long, default_value = "USER")]
    subject_type: SubjectType,

    #[arg(long)]
    subject_id: String,

    /// Subject attribute as key=value, repeatable
    #[arg(long = "attr", value_parser = parse_attribute)]
    attributes: Vec<(String, String)>,

    #[arg(long, default_value = "ENDPOINT")]
    resource_type: ResourceType,

    /// Resource name, e.g. /api/v1/orders
    #[arg(long)]
    resource: String,

    #[arg(long)]
    cost: Option<f64>,

    /// Idempotency key
    #[arg(long)]
    request_id: Option<String>,

    #[arg(long)]
    dry_run: bool,

    /// Evaluation instant (RFC 3339), defaults to the current time
    #[arg(long)]
    now: Option<String>,
}

impl RequestArgs {
    fn into_request(self) -> ConsumeRequest {
        let mut subject = Subject::new(self.subject_type, self.subject_id);
        for (key, value) in self.attributes {
            subject = subject.with_attribute(key, serde_json::Value::String(value));
        }

        let mut request = ConsumeRequest::new(
            self.tenant,
            subject,
            Resource::new(self.resource_type, self.resource),
        );
        request.request_id = self.request_id;
        request.cost = self.cost;
        request.dry_run = self.dry_run;
        request.now = self.now;
        request
    }
}

fn parse_attribute(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    // logs go to stderr so stdout stays parseable JSON
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config.logging);

    if config.engine.storage.backend == StorageBackendKind::Memory {
        warn!("Using memory storage, state is discarded when the command exits");
    }

    let limiter = RateLimiter::from_config(&config.engine)?;

    match cli.command {
        Command::Apply { bundle } => {
            let bundle = PolicyBundle::from_file(&bundle)
                .with_context(|| format!("failed to load policy bundle {}", bundle.display()))?;

            let mut applied = Vec::with_capacity(bundle.policies.len());
            for input in bundle.policies {
                let policy_id = input.policy_id.clone();
                let policy = limiter
                    .upsert_policy(input)
                    .with_context(|| format!("failed to apply policy {}", policy_id))?;
                applied.push(policy);
            }
            info!(count = applied.len(), "Policy bundle applied");
            print_json(&applied)?;
        }
        Command::Policies { tenant } => {
            print_json(&limiter.list_policies(tenant.as_deref()))?;
        }
        Command::Consume(args) => {
            print_json(&limiter.consume(args.into_request()).await?)?;
        }
        Command::Check(args) => {
            print_json(&limiter.check(args.into_request()).await?)?;
        }
        Command::Audit { tenant, limit } => {
            print_json(&limiter.list_audit_events(tenant.as_deref(), limit))?;
        }
    }

    Ok(())
}
