//! Conversions between this crate's native [`crate::model`] types and the
//! wire types generated from `ray-core-rpc`'s `.proto` (spec.md §6). Nothing
//! in `services` touches `ray_core_rpc::proto` directly; everything crosses
//! this boundary once, here.

use std::net::SocketAddr;

use bytes::Bytes;
use ray_core_common::{
    Address, JobId, NodeId, ObjectId, Quantity, ResourceSet, TaskId,
};
use ray_core_rpc::proto;

use crate::model::{ArgRef, BorrowerRefEntry, ReferenceTable, ReturnObject, TaskSpec};

pub fn address_to_proto(addr: Address) -> proto::NodeAddress {
    proto::NodeAddress {
        node_id: addr.node_id.as_bytes().to_vec(),
        ip: addr.socket.ip().to_string(),
        port: addr.socket.port() as u32,
    }
}

pub fn address_from_proto(addr: &proto::NodeAddress) -> Result<Address, ray_core_common::RayCoreError> {
    let node_id = NodeId::from_bytes(&addr.node_id)?;
    let ip = addr
        .ip
        .parse()
        .map_err(|e| ray_core_common::RayCoreError::Rpc(format!("invalid ip in NodeAddress: {e}")))?;
    let socket = SocketAddr::new(ip, addr.port as u16);
    Ok(Address::new(node_id, socket))
}

pub fn resource_set_to_proto(set: &ResourceSet) -> Vec<proto::ResourceQuantity> {
    set.labels()
        .map(|label| proto::ResourceQuantity {
            label: label.to_string(),
            numerator: set.get(label).numerator(),
        })
        .collect()
}

pub fn resource_set_from_proto(quantities: &[proto::ResourceQuantity]) -> ResourceSet {
    let mut set = ResourceSet::new();
    for q in quantities {
        set = set.with(q.label.clone(), Quantity::from_numerator(q.numerator));
    }
    set
}

pub fn arg_ref_to_proto(arg: &ArgRef) -> proto::ArgumentRef {
    match arg {
        ArgRef::Reference(id) => proto::ArgumentRef {
            object_id: id.as_bytes().to_vec(),
            inlined_data: Vec::new(),
            inlined_metadata: Vec::new(),
        },
        ArgRef::Inlined { data, metadata } => proto::ArgumentRef {
            object_id: Vec::new(),
            inlined_data: data.to_vec(),
            inlined_metadata: metadata.to_vec(),
        },
    }
}

pub fn arg_ref_from_proto(arg: &proto::ArgumentRef) -> Result<ArgRef, ray_core_common::RayCoreError> {
    if arg.object_id.is_empty() {
        Ok(ArgRef::Inlined {
            data: Bytes::from(arg.inlined_data.clone()),
            metadata: Bytes::from(arg.inlined_metadata.clone()),
        })
    } else {
        Ok(ArgRef::Reference(ObjectId::from_binary(&arg.object_id)?))
    }
}

pub fn task_spec_to_proto(spec: &TaskSpec) -> proto::TaskSpec {
    proto::TaskSpec {
        task_id: spec.task_id.as_bytes().to_vec(),
        job_id: spec.job_id.as_bytes().to_vec(),
        actor_id: spec.task_id.actor_id().as_bytes().to_vec(),
        sequence_number: spec.sequence_number,
        client_processed_up_to: spec.client_processed_up_to,
        args: spec.args.iter().map(arg_ref_to_proto).collect(),
        required_resources: resource_set_to_proto(&spec.required_resources),
        language: spec.language.clone(),
        num_returns: spec.num_returns,
    }
}

pub fn task_spec_from_proto(spec: &proto::TaskSpec) -> Result<TaskSpec, ray_core_common::RayCoreError> {
    let task_id = TaskId::from_binary(&spec.task_id)?;
    let job_id = JobId::from_binary(&spec.job_id)?;
    let args = spec
        .args
        .iter()
        .map(arg_ref_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TaskSpec {
        task_id,
        job_id,
        sequence_number: spec.sequence_number,
        client_processed_up_to: spec.client_processed_up_to,
        args,
        required_resources: resource_set_from_proto(&spec.required_resources),
        language: spec.language.clone(),
        num_returns: spec.num_returns,
    })
}

pub fn return_object_to_proto(ret: &ReturnObject) -> proto::ReturnObject {
    proto::ReturnObject {
        object_id: ret.object_id.as_bytes().to_vec(),
        data: ret.data.to_vec(),
        metadata: ret.metadata.to_vec(),
        in_plasma: ret.in_plasma,
    }
}

pub fn return_object_from_proto(ret: &proto::ReturnObject) -> Result<ReturnObject, ray_core_common::RayCoreError> {
    Ok(ReturnObject {
        object_id: ObjectId::from_binary(&ret.object_id)?,
        data: Bytes::from(ret.data.clone()),
        metadata: Bytes::from(ret.metadata.clone()),
        in_plasma: ret.in_plasma,
    })
}

pub fn reference_table_to_proto(table: &ReferenceTable) -> proto::ReferenceTable {
    proto::ReferenceTable {
        entries: table
            .entries
            .values()
            .map(|e| proto::BorrowerRefEntry {
                object_id: e.object_id.as_bytes().to_vec(),
                local_ref_count: e.local_ref_count,
                further_borrowers: e.further_borrowers.iter().copied().map(address_to_proto).collect(),
                is_owned_here: e.is_owned_here,
            })
            .collect(),
    }
}

pub fn reference_table_from_proto(table: &proto::ReferenceTable) -> Result<ReferenceTable, ray_core_common::RayCoreError> {
    let mut out = ReferenceTable::default();
    for e in &table.entries {
        let further_borrowers = e
            .further_borrowers
            .iter()
            .map(address_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        out.insert(BorrowerRefEntry {
            object_id: ObjectId::from_binary(&e.object_id)?,
            local_ref_count: e.local_ref_count,
            further_borrowers,
            is_owned_here: e.is_owned_here,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_core_common::{ActorId, NodeId, ObjectKind, TaskIdOrigin, TransportClass};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn address_roundtrips_through_proto() {
        let addr = Address::new(NodeId::from_random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 6379));
        let proto = address_to_proto(addr);
        let back = address_from_proto(&proto).unwrap();
        assert_eq!(addr, back);
    }

    #[test]
    fn task_spec_roundtrips_with_mixed_args() {
        let job = JobId::from_int(3);
        let actor = ActorId::from_random(job);
        let task_id = TaskId::for_origin(actor, TaskIdOrigin::Root);
        let referenced = ObjectId::new(task_id, ObjectKind::Put, TransportClass::Plasma, 0);

        let spec = TaskSpec {
            task_id,
            job_id: job,
            sequence_number: 5,
            client_processed_up_to: 4,
            args: vec![
                ArgRef::Reference(referenced),
                ArgRef::Inlined {
                    data: Bytes::from_static(b"x"),
                    metadata: Bytes::new(),
                },
            ],
            required_resources: ResourceSet::new().with("CPU", Quantity::from_whole(2)),
            language: "rust".to_string(),
            num_returns: 1,
        };

        let proto = task_spec_to_proto(&spec);
        let back = task_spec_from_proto(&proto).unwrap();
        assert_eq!(back.task_id, spec.task_id);
        assert_eq!(back.sequence_number, spec.sequence_number);
        assert_eq!(back.args.len(), 2);
        assert_eq!(back.required_resources.get("CPU"), Quantity::from_whole(2));
    }
}
