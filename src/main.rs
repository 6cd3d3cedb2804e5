use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LoggingConfig};
use floodgate::error::AdmissionError;
use floodgate::pipeline::{connect_store, AdmissionPipeline, AdmissionState};
use floodgate::ratelimit::{
    AdmissionRequest, FacadeMetrics, FileRuleSource, RuleRefresher, RuleRegistry,
};

#[derive(Parser)]
#[command(name = "floodgate", version, about = "Admission control and rate limiting")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/floodgate.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic request through the admission pipeline
    Check {
        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long)]
        path: String,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        repo: Option<String>,

        #[arg(long)]
        user: Option<String>,

        /// Declared request body length; a transfer chunk of this size is charged
        #[arg(long)]
        content_length: Option<i64>,

        /// Number of times to send the request
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },

    /// Keep the rule set fresh and evict idle limiters until shut down
    Watch,
}

/// One admission decision, printed as a JSON line.
#[derive(Serialize)]
struct Decision<'a> {
    attempt: u32,
    request: &'a AdmissionRequest,
    admitted: bool,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Totals over all attempts of a `check` run.
#[derive(Serialize, Default)]
struct Summary {
    attempts: u32,
    admitted: u32,
    /// Rejections by error code
    rejected: BTreeMap<&'static str, u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FloodgateConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config.logging);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rate_limiting = &config.rate_limiting;
    let registry = Arc::new(RuleRegistry::default());
    let refresher = rate_limiting
        .rules_path
        .as_ref()
        .map(|path| RuleRefresher::new(Arc::new(FileRuleSource::new(path)), registry.clone()));
    if let Some(refresher) = &refresher {
        let installed = refresher.refresh_once().await.context("loading rate limit rules")?;
        info!(rules = installed, "Rules loaded");
    } else {
        warn!("No rules_path configured, every request will be admitted");
    }

    let store = connect_store(&rate_limiting.store).await.context("connecting counter store")?;
    let pipeline = AdmissionPipeline::from_config(rate_limiting, registry, store, Arc::new(FacadeMetrics));

    match cli.command {
        Command::Check {
            method,
            path,
            project,
            repo,
            user,
            content_length,
            repeat,
        } => {
            let method = http::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid method {}", method))?;
            let mut request = AdmissionRequest::new(method, path);
            if let Some(project) = project {
                request = request.with_project(project);
            }
            if let Some(repo) = repo {
                request = request.with_repo(repo);
            }
            if let Some(user) = user {
                request = request.with_user(user);
            }
            if let Some(length) = content_length {
                request = request.with_content_length(length);
            }

            let mut summary = Summary::default();
            for attempt in 1..=repeat {
                let (state, result) = evaluate(&pipeline, &request).await;
                summary.attempts += 1;
                match &result {
                    Ok(()) => summary.admitted += 1,
                    Err(e) => *summary.rejected.entry(e.code()).or_default() += 1,
                }
                let decision = Decision {
                    attempt,
                    request: &request,
                    admitted: result.is_ok(),
                    state: state.as_str(),
                    status: result.as_ref().err().map(|e| e.status().as_u16()),
                    code: result.as_ref().err().map(|e| e.code()),
                    error: result.as_ref().err().map(|e| e.to_string()),
                };
                println!("{}", serde_json::to_string(&decision)?);
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Watch => {
            let refresh = refresher.map(|refresher| refresher.spawn(rate_limiting.refresh_interval()));
            let idle = rate_limiting.limiter_idle();
            let pipeline = Arc::new(pipeline);
            let eviction = {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(eviction_period(idle));
                    loop {
                        ticker.tick().await;
                        pipeline.evict_idle(idle);
                    }
                })
            };
            info!(
                refresh_secs = rate_limiting.refresh_interval_secs,
                limiter_idle_secs = rate_limiting.limiter_idle_secs,
                "Watching"
            );

            shutdown_signal().await;
            eviction.abort();
            if let Some(refresh) = refresh {
                refresh.abort();
            }
            info!(limiters = pipeline.limiter_count(), "Stopped watching");
        }
    }

    info!("Floodgate stopped");
    Ok(())
}

/// Run one request through every stage, completing it when admitted.
async fn evaluate(
    pipeline: &AdmissionPipeline,
    request: &AdmissionRequest,
) -> (AdmissionState, Result<(), AdmissionError>) {
    let mut ctx = match pipeline.admit(request).await {
        Ok(ctx) => ctx,
        Err(e) => return (AdmissionState::Rejected, Err(e)),
    };
    if let Err(e) = pipeline.authenticate(&mut ctx, request).await {
        return (ctx.state(), Err(e));
    }
    if let Some(bytes) = request.declared_length() {
        if let Err(e) = pipeline.check_transfer(&mut ctx, request, bytes).await {
            return (ctx.state(), Err(e));
        }
    }
    let result = ctx.complete().map(|_| ());
    (ctx.state(), result)
}

fn eviction_period(idle: Duration) -> Duration {
    (idle / 2).max(Duration::from_secs(1))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
