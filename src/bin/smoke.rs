//! Smoke-test CLI: posts a small run tree against a configured ingest
//! endpoint and waits for the dispatcher to drain, so a deployment can
//! be sanity-checked without writing a throwaway integration test.
//!
//! Usage:
//!   cargo run --features cli --bin ob_trace_smoke -- \
//!     --endpoint https://api.example.com --api-key $OB_TRACE_API_KEY

use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use ob_trace::{ClientConfigBuilder, RunConfig, RunType, TraceClient};

#[derive(Parser, Debug)]
#[command(name = "ob_trace_smoke")]
#[command(about = "Post a sample run tree and confirm it drains cleanly")]
struct Args {
    /// Ingest endpoint, e.g. https://api.example.com
    #[arg(long, env = "OB_TRACE_ENDPOINT")]
    endpoint: String,

    /// API key for the endpoint, if required
    #[arg(long, env = "OB_TRACE_API_KEY")]
    api_key: Option<String>,

    /// Project name to attach runs to
    #[arg(long, env = "OB_TRACE_PROJECT")]
    project: Option<String>,

    /// How many child runs to nest under the root
    #[arg(long, default_value_t = 2)]
    children: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut builder = ClientConfigBuilder::new().endpoint(&args.endpoint);
    if let Some(key) = &args.api_key {
        builder = builder.api_key(key.clone());
    }
    if let Some(project) = &args.project {
        builder = builder.project(project.clone());
    }
    let config = builder.build()?;
    let client = TraceClient::new(config);

    let root = RunConfig::new("smoke-test-root")
        .run_type(RunType::Chain)
        .sink(client.sink())
        .inputs(json!({"children": args.children}).as_object().unwrap().clone())
        .build();
    root.post_run();
    tracing::info!(run_id = %root.id(), "posted root run");

    for i in 0..args.children {
        let child = root.create_child(
            RunConfig::new(format!("child-{i}"))
                .run_type(RunType::Tool)
                .inputs(json!({"index": i}).as_object().unwrap().clone()),
        );
        child.post_run();
        child.end(Some(json!({"ok": true}).as_object().unwrap().clone()), None, None);
        child.patch_run(false);
    }

    root.end(Some(json!({"status": "done"}).as_object().unwrap().clone()), None, None);
    root.patch_run(false);

    tokio::time::timeout(Duration::from_secs(30), client.drain()).await?;
    tracing::info!("drained cleanly");
    Ok(())
}
