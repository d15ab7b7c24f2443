//! Generated scheduler/peer RPC types (spec.md §6) plus the hand-framed
//! object store daemon envelope.

pub mod store_protocol;

pub mod proto {
    tonic::include_proto!("ray.core_worker.v1");
}

pub use proto::core_worker_rpc_client::CoreWorkerRpcClient;
pub use proto::core_worker_rpc_server::{CoreWorkerRpc, CoreWorkerRpcServer};
