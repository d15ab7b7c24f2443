//! Outgoing calls this process makes to *other* workers/schedulers: pushing
//! a forwarded task to the worker this node just leased for it (spec.md §6
//! `ForwardTask(spec, lineage)` "spillback variant"). Mirrors the lazily-
//! connected-channel-per-peer approach `ray-core-worker::client_registry`
//! uses for its own outgoing calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use ray_core_common::Address;
use tonic::transport::Channel;

use ray_core_rpc::proto;
use ray_core_rpc::CoreWorkerRpcClient;

pub struct PeerClient {
    clients: Mutex<HashMap<Address, CoreWorkerRpcClient<Channel>>>,
}

impl PeerClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, addr: Address) -> CoreWorkerRpcClient<Channel> {
        if let Some(client) = self.clients.lock().get(&addr) {
            return client.clone();
        }
        let uri = format!("http://{}", addr.socket);
        let channel = Channel::from_shared(uri)
            .expect("address formatted as http://ip:port is always a valid URI")
            .connect_lazy();
        let client = CoreWorkerRpcClient::new(channel);
        self.clients.lock().insert(addr, client.clone());
        client
    }

    /// Dispatches a task this node just leased a worker for. Forwarded
    /// tasks are a one-way handoff from the caller's perspective (it already
    /// received its `ForwardTaskReply` ack); failures are logged, not
    /// propagated anywhere.
    pub async fn push_task(&self, worker_addr: Address, spec: proto::TaskSpec) {
        let mut client = self.client_for(worker_addr);
        if let Err(status) = client.push_task(proto::PushTaskRequest { spec: Some(spec) }).await {
            tracing::warn!(%worker_addr, %status, "forwarded task dispatch failed");
        }
    }
}
