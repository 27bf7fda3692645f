//! Pure functions that derive addresses and names from cluster objects.
//!
//! These never touch the kernel or the network; they only parse and compute,
//! which keeps them trivially unit-testable (see `spec.md` properties
//! P6–P8).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::command::CommandRunner;
use crate::error::Error;

/// The handful of node fields this controller cares about, lifted out of
/// whatever orchestrator type the caller has (`mesh-controller` builds this
/// from a `k8s_openapi::api::core::v1::Node`). Keeping `mesh-core` free of
/// an orchestrator-client dependency means every function below is testable
/// with plain literals.
#[derive(Debug, Clone, Default)]
pub struct NodeView {
    pub name: String,
    pub internal_ip: Option<IpAddr>,
    pub pod_cidr: Option<String>,
    pub pod_cidrs: Vec<String>,
    pub annotations: HashMap<String, String>,
}

pub const PUBLIC_KEY_ANNOTATION: &str = "wireguard.kubernetes.io/publickey";

/// Returns the node's internal address; fails if the node reports none.
pub fn machine_ip(node: &NodeView) -> Result<IpAddr, Error> {
    node.internal_ip
        .ok_or_else(|| Error::NotFound(format!("no internal IP for node {}", node.name)))
}

/// Maps a machine address into the private overlay's address space: the
/// routing network's first two octets, followed by the machine address's
/// last two octets. Only defined for IPv4 /16 routing networks, which the
/// caller must have already validated (see [`assert_slash_16`]).
pub fn inner_ip(machine_ip: IpAddr, internal_routing_net: IpNet) -> Result<IpAddr, Error> {
    assert_slash_16(internal_routing_net)?;
    let routing = match internal_routing_net.addr() {
        IpAddr::V4(a) => a.octets(),
        IpAddr::V6(_) => {
            return Err(Error::Configuration(
                "internal routing network must be IPv4".into(),
            ))
        },
    };
    let machine = match machine_ip {
        IpAddr::V4(a) => a.octets(),
        IpAddr::V6(_) => {
            return Err(Error::Configuration("machine IP must be IPv4".into()))
        },
    };
    Ok(IpAddr::V4(Ipv4Addr::new(
        routing[0], routing[1], machine[2], machine[3],
    )))
}

/// The routing network must carry an exact /16 mask; the controller refuses
/// to start otherwise (see `spec.md` §4.2 precondition).
pub fn assert_slash_16(net: IpNet) -> Result<(), Error> {
    if net.prefix_len() != 16 {
        return Err(Error::Configuration(format!(
            "internal routing network must be a /16, got /{}",
            net.prefix_len()
        )));
    }
    Ok(())
}

/// Extracts the `{ipv4, ipv6}` pod subnets for a node, preferring the plural
/// `pod_cidrs` list and falling back to the singular `pod_cidr` field when
/// the list is empty.
pub fn pod_cidrs(node: &NodeView) -> HashMap<&'static str, String> {
    let mut out = HashMap::new();
    let cidrs: Vec<&String> = if !node.pod_cidrs.is_empty() {
        node.pod_cidrs.iter().collect()
    } else if let Some(ref single) = node.pod_cidr {
        vec![single]
    } else {
        vec![]
    };

    for cidr in cidrs {
        if let Ok(net) = cidr.parse::<IpNet>() {
            let key = match net {
                IpNet::V4(_) => "ipv4",
                IpNet::V6(_) => "ipv6",
            };
            out.insert(key, cidr.clone());
        }
    }
    out
}

/// Returns the address one greater than the network address, paired with
/// the original mask. Works for both v4 and v6 CIDRs.
pub fn first_network_address(cidr: &str) -> Result<(String, u8), Error> {
    let net: IpNet = cidr
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid CIDR: {cidr}")))?;
    let addr = match net.network() {
        IpAddr::V4(a) => {
            let mut octets = a.octets();
            octets[3] += 1;
            IpAddr::V4(Ipv4Addr::from(octets))
        },
        IpAddr::V6(a) => {
            let mut segments = a.segments();
            segments[7] += 1;
            IpAddr::V6(Ipv6Addr::from(segments))
        },
    };
    Ok((addr.to_string(), net.prefix_len()))
}

/// `veth<first 11 chars of container id>`, stable across calls.
///
/// One source draft truncated to 8 characters; the canonical test fixture
/// (`veth57d2933c-48` for `57d2933c-4848-4d13-9656-dd061b6320bf`) mandates
/// 11, which is what's implemented here.
pub fn veth_name(container_id: &str) -> String {
    let truncated: String = container_id.chars().take(11).collect();
    format!("veth{truncated}")
}

/// Runs `ip link ls dev <interface>` inside `compartment` and returns the
/// `link/ether` address, the way `tunnel::is_tunnel` and
/// `compartment::ensure_bridge` compose and run their own probes.
pub fn interface_mac(
    runner: &dyn CommandRunner,
    compartment: &str,
    interface: &str,
) -> Result<String, Error> {
    let out = runner.run_with_output(
        "interface_mac",
        &format!("ip netns exec {compartment} ip link ls dev {interface}"),
    )?;
    parse_interface_mac(&String::from_utf8_lossy(&out))
}

/// Parses `ip link ls dev <interface>` output and returns the `link/ether`
/// address.
pub fn parse_interface_mac(output: &str) -> Result<String, Error> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("link/ether ") {
            return Ok(rest.split_whitespace().next().unwrap_or_default().to_string());
        }
    }
    Err(Error::NotFound("no link/ether line in ip link output".into()))
}
