//! Revalidation Demo
//!
//! Drives a [`Client`] against a simulated backend with 300ms latency:
//!
//! 1. Search-as-you-type: every keystroke is a cancelable request, so only the
//!    last one reaches the cache.
//! 2. Focus and reconnect firing together: the revalidation burst collapses
//!    into one call.
//! 3. A flaky endpoint recovering after two failed attempts.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=debug cargo run -p revalidation-demo
//! ```

#![allow(missing_docs)]

use courier_core::{FnTransport, Request, TransportContext, TransportResponse};
use courier_runtime::metrics::MetricsServer;
use courier_runtime::{AddOptions, Client, ClientConfig, DispatcherConfig, RetryPolicy};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LATENCY: Duration = Duration::from_millis(300);

/// Backend answering `/search` with the query, `/feed` with a version counter
/// and failing `/flaky` twice before it recovers.
fn backend() -> Arc<dyn courier_core::Transport> {
    let feed_version = Arc::new(AtomicUsize::new(0));
    let flaky_calls = Arc::new(AtomicUsize::new(0));

    Arc::new(FnTransport::new(move |request: Request, context: TransportContext| {
        let feed_version = Arc::clone(&feed_version);
        let flaky_calls = Arc::clone(&flaky_calls);
        async move {
            tokio::select! {
                () = context.cancellation.cancelled() => {
                    return TransportResponse::failure(json!("canceled"), 0);
                }
                () = tokio::time::sleep(LATENCY) => {}
            }
            context.progress.response_start();

            match request.endpoint() {
                "/search" => {
                    TransportResponse::success(json!({ "results_for": request.query() }), 200)
                },
                "/feed" => {
                    let version = feed_version.fetch_add(1, Ordering::SeqCst) + 1;
                    TransportResponse::success(json!({ "version": version }), 200)
                },
                "/flaky" if flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 => {
                    TransportResponse::failure(json!("service unavailable"), 503)
                },
                "/flaky" => TransportResponse::success(json!("recovered"), 200),
                _ => TransportResponse::failure(json!("not found"), 404),
            }
        }
    }))
}

async fn search_as_you_type(client: &Client) {
    tracing::info!("--- Search as you type ---");

    let _aborts = client.events().on_abort("GET_/search", |details| {
        tracing::info!(query = ?details.request.query(), "Superseded");
    });

    for prefix in ["r", "ru", "rus", "rust"] {
        client.send(
            Request::new("/search")
                .with_query(format!("q={prefix}"))
                .with_cancelable(true),
            AddOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
    }
    tokio::time::sleep(LATENCY * 2).await;

    for prefix in ["r", "rust"] {
        let key = format!("GET_/search?q={prefix}");
        let entry = client.cache().get(&key).and_then(|entry| entry.data);
        tracing::info!(cache_key = %key, entry = ?entry, "Cache slot");
    }
}

async fn revalidation_burst(client: &Client) {
    tracing::info!("--- Revalidation burst ---");

    let _loading = client.fetch_dispatcher().get_loading("GET_/feed", |loading| {
        tracing::info!(loading, "Feed loading state");
    });
    let _data = client.cache().events().on_data("GET_/feed", |entry| {
        tracing::info!(data = ?entry.data, "Feed updated");
    });

    client.send(Request::new("/feed"), AddOptions::default());
    tokio::time::sleep(LATENCY * 2).await;

    // Window focus and network reconnect land in the same tick
    let focus = client.send(Request::new("/feed"), AddOptions::revalidate());
    let reconnect = client.send(Request::new("/feed"), AddOptions::revalidate());
    tracing::info!(coalesced = focus == reconnect, "Revalidations dispatched");
    tokio::time::sleep(LATENCY * 2).await;
}

async fn flaky_endpoint(client: &Client) -> anyhow::Result<()> {
    tracing::info!("--- Flaky endpoint ---");

    let _loading = client.events().on_loading("GET_/flaky", |event| {
        tracing::info!(loading = event.is_loading, retry = event.is_retry, "Flaky loading state");
    });

    let response = client
        .send_and_wait(Request::new("/flaky").with_retry(3), Duration::from_secs(10))
        .await?;
    let retries = client.cache().get("GET_/flaky").map_or(0, |entry| entry.retries);
    tracing::info!(data = ?response.data, retries, "Flaky endpoint answered");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier_runtime=debug,revalidation_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsServer::new(([127, 0, 0, 1], 9000).into());
    metrics.start()?;

    let retry_policy = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(200))
        .jitter(true)
        .build();
    let config = ClientConfig::default()
        .with_fetch(DispatcherConfig::new().with_retry_policy(retry_policy.clone()))
        .with_submit(DispatcherConfig::new().with_retry_policy(retry_policy));
    let client = Client::with_config(backend(), config);

    search_as_you_type(&client).await;
    revalidation_burst(&client).await;
    flaky_endpoint(&client).await?;

    if let Some(rendered) = metrics.render() {
        let summary: Vec<&str> = rendered
            .lines()
            .filter(|line| line.starts_with("courier_requests_") && !line.starts_with('#'))
            .collect();
        tracing::info!(metrics = ?summary, "Final counters");
    }

    client.clear();
    Ok(())
}
