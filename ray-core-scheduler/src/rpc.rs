//! Conversions between this crate's native types and the generated
//! `ray_core_rpc::proto` wire types (spec.md §6), scoped to what the
//! scheduler-side RPCs need. Mirrors `ray-core-worker::rpc`'s boundary, kept
//! separate since this crate doesn't depend on `ray-core-worker`.

use std::net::SocketAddr;

use ray_core_common::{Address, NodeId, Quantity, RayCoreError, ResourceSet};
use ray_core_rpc::proto;

pub fn address_to_proto(addr: Address) -> proto::NodeAddress {
    proto::NodeAddress {
        node_id: addr.node_id.as_bytes().to_vec(),
        ip: addr.socket.ip().to_string(),
        port: addr.socket.port() as u32,
    }
}

pub fn address_from_proto(addr: &proto::NodeAddress) -> Result<Address, RayCoreError> {
    let node_id = NodeId::from_bytes(&addr.node_id)?;
    let ip = addr
        .ip
        .parse()
        .map_err(|e| RayCoreError::Rpc(format!("invalid ip in NodeAddress: {e}")))?;
    let socket = SocketAddr::new(ip, addr.port as u16);
    Ok(Address::new(node_id, socket))
}

pub fn resource_set_from_proto(quantities: &[proto::ResourceQuantity]) -> ResourceSet {
    let mut set = ResourceSet::new();
    for q in quantities {
        set = set.with(q.label.clone(), Quantity::from_numerator(q.numerator));
    }
    set
}
