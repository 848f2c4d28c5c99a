use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mixer_ratelimit::config::ServiceConfig;
use mixer_ratelimit::ratelimit::{
    check_policy, classify_path, enforce_content_rate_limits, header_pairs, CheckOptions,
    ContentLimitOptions, ContentLimitOutcome, Policy, RateLimiter, RequestDescriptor,
    FORWARDED_FOR, USER_ID,
};

/// Inspect and exercise the MixerAI rate limiter.
#[derive(Debug, Parser)]
#[command(name = "ratelimit", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the policy a request path falls under
    Classify { path: String },
    /// Count one request and print the verdict
    Check(RequestArgs),
    /// Print the verdict the next request would get, without counting it
    Status(RequestArgs),
    /// Apply the layered content generation limits
    Content {
        /// The user generating content
        #[arg(long)]
        user: String,
        /// The brand the content is for
        #[arg(long)]
        resource: Option<String>,
    },
    /// Delete every rate limit entry
    Reset,
}

#[derive(Debug, clap::Args)]
struct RequestArgs {
    /// Request path, used to pick a policy when --policy is absent
    path: String,
    /// Policy to apply instead of classifying the path
    #[arg(long)]
    policy: Option<Policy>,
    /// Explicit caller identity
    #[arg(long)]
    identifier: Option<String>,
    /// Value for the x-forwarded-for header
    #[arg(long)]
    forwarded_for: Option<String>,
    /// Value for the x-user-id header
    #[arg(long)]
    user_id: Option<String>,
}

impl RequestArgs {
    fn descriptor(&self) -> RequestDescriptor {
        let mut request = RequestDescriptor::new(&self.path);
        if let Some(ip) = &self.forwarded_for {
            request = request.with_header(FORWARDED_FOR, ip);
        }
        if let Some(user) = &self.user_id {
            request = request.with_header(USER_ID, user);
        }
        request
    }

    fn policy(&self) -> Policy {
        self.policy.unwrap_or_else(|| classify_path(&self.path))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())?;

    if let Command::Classify { path } = &cli.command {
        println!("{}", classify_path(path));
        return Ok(());
    }

    let limiter = RateLimiter::from_config(&config)?;
    info!(backend = %limiter.backend(), namespace = %config.namespace, "Rate limiter initialized");

    match cli.command {
        Command::Classify { .. } => {}
        Command::Check(args) => {
            let verdict = check_policy(
                &limiter,
                &args.descriptor(),
                args.policy(),
                args.identifier.as_deref(),
            )
            .await;
            print_json(&json!({
                "verdict": verdict,
                "headers": header_pairs(&verdict.headers()),
            }))?;
        }
        Command::Status(args) => {
            let mut options = CheckOptions::new();
            if let Some(identifier) = &args.identifier {
                options = options.with_identifier(identifier);
            }
            let result = limiter
                .peek(&args.descriptor(), &args.policy().config(), &options)
                .await?;
            print_json(&json!({
                "result": result,
                "headers": header_pairs(&result.headers()),
            }))?;
        }
        Command::Content { user, resource } => {
            let request = RequestDescriptor::new("/api/content/generate");
            let outcome = enforce_content_rate_limits(
                &limiter,
                &request,
                &user,
                resource.as_deref(),
                ContentLimitOptions::default(),
            )
            .await;
            match outcome {
                ContentLimitOutcome::Allowed => print_json(&json!({ "ok": true }))?,
                ContentLimitOutcome::Denied(failure) => print_json(&json!({
                    "type": failure.scope,
                    "status": failure.status.as_u16(),
                    "body": failure.body,
                    "headers": header_pairs(&failure.headers),
                }))?,
            }
        }
        Command::Reset => {
            limiter.reset_all().await?;
            info!(backend = %limiter.backend(), "Rate limit entries cleared");
            println!("cleared");
        }
    }

    info!(metrics = ?limiter.metrics().snapshot(), "Done");
    Ok(())
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
