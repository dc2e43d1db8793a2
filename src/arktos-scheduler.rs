use std::sync::Arc;

use arktos::manifest::load_pods;
use arktos::opts::Opts;
use compute_client::Client;
use kubelet::events::LoggingRecorder;
use scheduler::algorithm::RoundRobin;
use scheduler::condition::InMemoryStatusStore;
use scheduler::queue::SchedulingQueue;
use scheduler::Scheduler;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opts = Opts::from_args();
    let config = opts.scheduler_config();
    let client = Client::new(opts.client_config(), opts.credentials().await?)?;

    let queue = Arc::new(SchedulingQueue::default());
    for pod in load_pods(opts.manifests()).await? {
        queue.add(pod).await;
    }

    let scheduler = Scheduler::new(
        config.clone(),
        Arc::clone(&queue),
        Arc::new(RoundRobin::new(config.hosts.clone())),
        Arc::new(client),
        Arc::new(InMemoryStatusStore::default()),
        Arc::new(LoggingRecorder),
    );
    let worker = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c().await?;
    tracing::warn!("Caught keyboard interrupt.");
    queue.close().await;
    worker.await?;
    Ok(())
}
