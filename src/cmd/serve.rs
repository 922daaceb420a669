//! Development mode command
//!
//! Runs an engine over in-memory storage with a demo tenant and workflow,
//! feeding it synthetic user events so the whole pipeline can be watched
//! from the logs without a cluster.

use anyhow::{Context, Result};
use clap::Parser;
use hiveflow_engine::{Engine, EngineOptions};
use hiveflow_meta::{Branch, Kv, LoaderKind, Step, UserEvent, Workflow};
use hiveflow_storage::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Demo tenant ID
    #[arg(long, default_value_t = 1)]
    tenant: u64,

    /// Input/output queue partitions for the demo tenant
    #[arg(long, default_value_t = 4)]
    partitions: u32,

    /// Size of the synthetic crowd
    #[arg(long, default_value_t = 10_000)]
    crowd: u32,

    /// Worker shards for the demo instance
    #[arg(long, default_value_t = 4)]
    workers: u32,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let store = Arc::new(MemoryStorage::new());
    let engine = Engine::new(store, EngineOptions::default());
    engine.start().context("engine start")?;
    engine
        .tenant_init(args.tenant, args.partitions, args.partitions)
        .await
        .context("tenant init")?;

    let workflow = Workflow::new(1, args.tenant, "demo")
        .with_step(Step::conditional(
            "signup",
            vec![
                Branch::new("kv.channel == \"ad\"", "converted"),
                Branch::new("uid % 10 == 0", "converted"),
            ],
        ))
        .with_step(Step::sink("converted").with_notify());

    let crowd: hiveflow_bitmap::RoaringBitmap = (1..=args.crowd).collect();
    let instance_id = engine
        .start_instance(
            workflow,
            LoaderKind::Raw,
            hiveflow_bitmap::marshal(&crowd),
            args.workers,
        )
        .await
        .context("start demo instance")?;
    info!(instance = instance_id, crowd = args.crowd, "demo instance started");

    let mut next_user = 1u32;
    let mut report = tokio::time::interval(Duration::from_secs(5));
    let mut feed = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = feed.tick() => {
                let event = UserEvent {
                    tenant_id: args.tenant,
                    workflow_id: 1,
                    instance_id,
                    user_id: next_user,
                    data: vec![Kv::new("channel", if next_user % 3 == 0 { "ad" } else { "organic" })],
                };
                let _ = engine.submit_event(event).await;
                next_user = next_user % args.crowd + 1;
            }
            _ = report.tick() => {
                if let Ok(state) = engine.instance_count_state(1).await {
                    for step in &state.states {
                        info!(step = %step.step, count = step.count, "step membership");
                    }
                }
            }
        }
    }

    info!("shutting down");
    engine.stop_instance(1).await.ok();
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.stop();
    Ok(())
}
