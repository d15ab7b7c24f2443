//! Scheduler-side implementation of the shared `CoreWorkerRpc` service
//! (spec.md §6): this process answers `RequestWorkerLease`, `ReturnWorker`
//! and `ForwardTask`. The remaining RPCs in the shared proto belong to the
//! per-process worker library's role, not the scheduler's — see the proto's
//! own comment in `ray-core-rpc/proto/core_worker.proto`.

use std::sync::Arc;

use ray_core_common::{ActorId, JobId, TaskId};
use ray_core_rpc::proto;
use ray_core_rpc::CoreWorkerRpc;
use tonic::{Request, Response, Status};

use crate::local_scheduler::{LeaseDecision, LeaseRequest, LocalScheduler};
use crate::peer_client::PeerClient;
use crate::rpc;

pub struct SchedulerService {
    scheduler: Arc<LocalScheduler>,
    peer_client: Arc<PeerClient>,
}

impl SchedulerService {
    pub fn new(scheduler: Arc<LocalScheduler>, peer_client: Arc<PeerClient>) -> Self {
        Self { scheduler, peer_client }
    }

    fn lease_request_from_proto(spec: &proto::TaskSpec) -> Result<LeaseRequest, Status> {
        let invalid = |e: ray_core_common::RayCoreError| Status::invalid_argument(e.to_string());
        let task_id = TaskId::from_binary(&spec.task_id).map_err(invalid)?;
        let job_id = JobId::from_binary(&spec.job_id).map_err(invalid)?;
        let actor_id = if spec.actor_id.is_empty() {
            ActorId::nil()
        } else {
            ActorId::from_binary(&spec.actor_id).map_err(invalid)?
        };
        Ok(LeaseRequest {
            task_id,
            job_id,
            actor_id,
            language: spec.language.clone(),
            required_resources: rpc::resource_set_from_proto(&spec.required_resources),
        })
    }
}

fn worker_side_only(rpc_name: &str) -> Status {
    Status::unimplemented(format!("{rpc_name} is answered by the worker process, not the scheduler"))
}

impl CoreWorkerRpc for SchedulerService {
    async fn request_worker_lease(
        &self,
        request: Request<proto::RequestWorkerLeaseRequest>,
    ) -> Result<Response<proto::RequestWorkerLeaseReply>, Status> {
        let spec = request
            .into_inner()
            .spec
            .ok_or_else(|| Status::invalid_argument("RequestWorkerLease missing spec"))?;
        let lease_request = Self::lease_request_from_proto(&spec)?;

        let decision = self.scheduler.handle_request_worker_lease(lease_request).await;
        let outcome = match decision {
            LeaseDecision::Granted {
                worker_id,
                worker_addr,
                resource_ids,
            } => proto::request_worker_lease_reply::Outcome::Granted(proto::WorkerLease {
                worker_id: worker_id.to_be_bytes().to_vec(),
                worker_address: Some(rpc::address_to_proto(worker_addr)),
                resource_ids: resource_ids
                    .into_iter()
                    .map(|r| proto::ResourceQuantity {
                        label: r.id.to_string(),
                        numerator: r.fraction.numerator(),
                    })
                    .collect(),
            }),
            LeaseDecision::RetryAt(addr) => proto::request_worker_lease_reply::Outcome::RetryAt(rpc::address_to_proto(addr)),
            LeaseDecision::Error(msg) => proto::request_worker_lease_reply::Outcome::Error(msg),
        };

        Ok(Response::new(proto::RequestWorkerLeaseReply { outcome: Some(outcome) }))
    }

    async fn return_worker(
        &self,
        request: Request<proto::ReturnWorkerRequest>,
    ) -> Result<Response<proto::ReturnWorkerReply>, Status> {
        let req = request.into_inner();
        let worker_id = u64::from_be_bytes(
            req.worker_id[..8.min(req.worker_id.len())]
                .try_into()
                .unwrap_or([0u8; 8]),
        );
        self.scheduler.handle_return_worker(worker_id, req.disconnect, false);
        Ok(Response::new(proto::ReturnWorkerReply {}))
    }

    async fn forward_task(
        &self,
        request: Request<proto::ForwardTaskRequest>,
    ) -> Result<Response<proto::ForwardTaskReply>, Status> {
        let req = request.into_inner();
        let spec = req.spec.ok_or_else(|| Status::invalid_argument("ForwardTask missing spec"))?;
        let lease_request = Self::lease_request_from_proto(&spec)?;

        let scheduler = self.scheduler.clone();
        let peer_client = self.peer_client.clone();
        tokio::spawn(async move {
            let decision = scheduler.handle_request_worker_lease(lease_request).await;
            if let LeaseDecision::Granted { worker_addr, .. } = decision {
                peer_client.push_task(worker_addr, spec).await;
            } else {
                tracing::warn!("forwarded task could not be scheduled locally");
            }
        });

        Ok(Response::new(proto::ForwardTaskReply {}))
    }

    async fn push_task(
        &self,
        _request: Request<proto::PushTaskRequest>,
    ) -> Result<Response<proto::PushTaskReply>, Status> {
        Err(worker_side_only("PushTask"))
    }

    async fn pull_request(
        &self,
        _request: Request<proto::PullRequestMessage>,
    ) -> Result<Response<proto::PullRequestReply>, Status> {
        Err(worker_side_only("PullRequest"))
    }

    async fn push(&self, _request: Request<proto::PushChunkRequest>) -> Result<Response<proto::PushChunkReply>, Status> {
        Err(worker_side_only("Push"))
    }

    async fn wait_for_object_eviction(
        &self,
        _request: Request<proto::WaitForObjectEvictionRequest>,
    ) -> Result<Response<proto::WaitForObjectEvictionReply>, Status> {
        Err(worker_side_only("WaitForObjectEviction"))
    }

    async fn wait_for_ref_removed(
        &self,
        _request: Request<proto::WaitForRefRemovedRequest>,
    ) -> Result<Response<proto::WaitForRefRemovedReply>, Status> {
        Err(worker_side_only("WaitForRefRemoved"))
    }

    async fn pin_object_ids(
        &self,
        _request: Request<proto::PinObjectIdsRequest>,
    ) -> Result<Response<proto::PinObjectIdsReply>, Status> {
        Err(worker_side_only("PinObjectIds"))
    }
}
