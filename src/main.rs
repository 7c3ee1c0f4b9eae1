use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crpt_api_client::config::Config;
use crpt_api_client::document::Document;
use crpt_api_client::error::{AppError, Result};
use crpt_api_client::http::{Outcome, SubmissionGate};

fn init_tracing(config: &Config) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| AppError::Init("usage: crpt-submit <documents.json>".into()))?;
    let signature = std::env::var("CRPT_SIGNATURE")
        .map_err(|_| AppError::Init("CRPT_SIGNATURE must be set".into()))?;

    let raw = tokio::fs::read(&path).await?;
    let documents: Vec<Document> = serde_json::from_slice(&raw)?;

    info!("Submitting {} documents to {}", documents.len(), config.api_url);
    info!(
        "Rate limit: {} requests per {}ms",
        config.request_limit, config.window_ms
    );

    let gate = Arc::new(SubmissionGate::from_config(&config)?);

    let tasks: Vec<_> = documents
        .into_iter()
        .map(|document| {
            let gate = gate.clone();
            let signature = signature.clone();
            tokio::spawn(async move { gate.submit_and_wait(&document, &signature).await })
        })
        .collect();

    tokio::select! {
        results = join_all(tasks) => {
            for result in results {
                match result {
                    Ok(Ok(report)) => {
                        if let Outcome::Failure { .. } = report.outcome {
                            warn!("Submission {} did not reach the registry", report.id);
                        }
                    }
                    Ok(Err(e)) => error!("Submission refused: {}", e),
                    Err(e) => error!("Submission task failed: {}", e),
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, abandoning queued submissions...");
        }
    }

    gate.stats().log_stats();
    gate.shutdown();
    info!("Shutting down...");

    Ok(())
}
