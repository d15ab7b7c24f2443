//! `ray-core-scheduler` binary entry point: loads configuration, installs a
//! `tracing_subscriber`, and serves the scheduler-side `CoreWorkerRpc`
//! surface (spec.md §13 Non-goals carve-out for process/CLI/logging setup).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use ray_core_common::{Address, NodeId, RayCoreConfig, ResourceSet};
use ray_core_rpc::CoreWorkerRpcServer;
use ray_core_scheduler::local_scheduler::{ClusterResourceView, LocalScheduler};
use ray_core_scheduler::peer_client::PeerClient;
use ray_core_scheduler::service::SchedulerService;
use ray_core_scheduler::worker_pool::{WorkerPool, WorkerProcessLauncher};
use tonic::transport::Server;
use tracing::info;

/// Process launching is out of scope (spec.md §1 Non-goals); a deployment
/// wires in a real launcher (e.g. forking a language-specific worker
/// shim). This one always declines, so an unconfigured scheduler fails
/// leases cleanly instead of hanging.
struct NullLauncher;
impl WorkerProcessLauncher for NullLauncher {
    fn launch(&self, _language: &str, _job_id: ray_core_common::JobId) -> Option<u32> {
        None
    }
}

/// A single-node deployment has no peers to spill back to; a real
/// deployment wires this to the cluster metadata service's resource
/// pub/sub (spec.md §6).
struct NoPeers;
#[async_trait]
impl ClusterResourceView for NoPeers {
    fn find_node_satisfying(&self, _required: &ResourceSet) -> Option<Address> {
        None
    }
}

fn main() -> Result<(), std::io::Error> {
    let config = RayCoreConfig::load(std::env::var("RAY_CORE_CONFIG_PATH").ok().as_deref())
        .unwrap_or_else(|e| {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        });

    if std::env::args().any(|arg| arg == "--dump-config") {
        println!("{}", config.dump_json());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: RayCoreConfig) -> Result<(), std::io::Error> {
    let port: u16 = std::env::var("RAY_CORE_SCHEDULER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6380);
    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), port).into();
    let self_address = Address::new(NodeId::from_random(), bind_addr);

    let worker_pool = Arc::new(WorkerPool::new(config.scheduler.max_startup_concurrency, Box::new(NullLauncher)));
    let declared_resources = ResourceSet::new();
    let scheduler = LocalScheduler::new(self_address, declared_resources, worker_pool, Arc::new(NoPeers));

    let metrics_registry = prometheus::Registry::new();
    if let Err(e) = scheduler.register(&metrics_registry) {
        tracing::warn!(error = %e, "failed to register scheduler metrics");
    }

    let service = SchedulerService::new(scheduler, PeerClient::new());

    info!(%bind_addr, "ray-core-scheduler listening");

    Server::builder()
        .add_service(CoreWorkerRpcServer::new(service))
        .serve(bind_addr)
        .await
        .map_err(std::io::Error::other)
}
