use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidgen_core::template::TemplateStore;
use vidgen_worker::config::WorkerConfig;
use vidgen_worker::handler::{Handler, Job, JobResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    // Logs go to stderr; stdout carries only the response document.
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vidgen_worker=info,vidgen_comfyui=info,vidgen_core=info".into()
            }),
        )
        .with(json_logs.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env();
    tracing::info!(
        engine = %config.engine.http_url(),
        templates = %config.template_dir.display(),
        publish_mode = config.publish_mode.as_str(),
        timeout_secs = config.completion_timeout.as_secs(),
        "Loaded worker configuration",
    );

    // --- Templates ---
    let templates = Arc::new(TemplateStore::new(&config.template_dir));
    let loaded = templates
        .preload()
        .await
        .context("Graph templates do not match their binding descriptors")?;
    tracing::info!(loaded, "Graph templates validated");

    // --- Job ---
    let raw = read_job(std::env::args().nth(1)).await?;
    let handler = Handler::new(&config, templates);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling job");
            on_signal.cancel();
        }
    });

    let response = match serde_json::from_str::<Job>(&raw) {
        Ok(job) => handler.handle(job, &cancel).await,
        Err(e) => {
            tracing::error!(error = %e, "Job document is not valid JSON");
            JobResponse::error(format!("Invalid input: job document is malformed: {e}"))
        }
    };

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

/// Read the job document from `path`, or from stdin when absent.
async fn read_job(path: Option<String>) -> anyhow::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read job file {path}")),
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("Failed to read job from stdin")?;
            Ok(raw)
        }
    }
}
