//! Startup sequence and node watch loop.
//!
//! Startup establishes this node's place in the mesh (keys, annotation,
//! compartment, bridge, tunnel); the watch loop then keeps the peer table in
//! sync with the cluster and reconciles kernel state after every event.

use std::collections::HashMap;
use std::net::IpAddr;

use futures::{StreamExt, TryStreamExt};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams, WatchEvent, WatchParams};
use kube::Client;

use mesh_core::command::{CommandRunner, ShellCommandRunner};
use mesh_core::host::{self, NodeView, PUBLIC_KEY_ANNOTATION};
use mesh_core::iface::{AllowedIp, InterfaceName};
use mesh_core::peer::{Peer, PeerTable};
use mesh_core::reconcile::{self, ReconcileConfig};
use mesh_core::{compartment, keys, tunnel};

use crate::args::{self, Args};

/// Static addressing decided once at startup and then threaded through
/// every reconcile pass.
pub struct Context {
    pub compartment: String,
    pub tunnel_interface: String,
    pub bridge_interface: String,
    pub host_side_iface: String,
    pub compartment_side_iface: String,
    pub listen_port: u16,
    pub hostname: String,
    pub local_pod_cidr: String,
    pub internal_routing_net: IpNet,
}

fn node_view(node: &Node) -> NodeView {
    let name = node
        .metadata
        .name
        .clone()
        .unwrap_or_default();
    let internal_ip = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .and_then(|a| a.address.parse::<IpAddr>().ok());
    let pod_cidr = node.spec.as_ref().and_then(|s| s.pod_cidr.clone());
    let pod_cidrs = node
        .spec
        .as_ref()
        .and_then(|s| s.pod_cidrs.clone())
        .unwrap_or_default();
    let annotations = node
        .metadata
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect::<HashMap<_, _>>();

    NodeView {
        name,
        internal_ip,
        pod_cidr,
        pod_cidrs,
        annotations,
    }
}

/// Patches `PUBLIC_KEY_ANNOTATION` onto the node, creating the annotations
/// map if absent (the `~1` escapes the `/` in the annotation key per
/// RFC 6901).
async fn add_public_key_label(
    nodes: &Api<Node>,
    hostname: &str,
    public_key: &str,
) -> anyhow::Result<()> {
    let escaped_key = PUBLIC_KEY_ANNOTATION.replace('/', "~1");
    let patch: json_patch::Patch = serde_json::from_value(serde_json::json!([
        { "op": "replace", "path": format!("/metadata/annotations/{escaped_key}"), "value": public_key },
    ]))?;
    let params = PatchParams::default();
    nodes.patch(hostname, &params, &Patch::Json(patch)).await?;
    Ok(())
}

/// Finds the interface carrying the node's default route, used as the
/// outward-facing side of the compartment's NAT chain.
fn default_interface(runner: &dyn CommandRunner) -> anyhow::Result<String> {
    let out = runner.run_with_output("default_interface", "ip route show default")?;
    String::from_utf8_lossy(&out)
        .lines()
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields
                .iter()
                .position(|f| *f == "dev")
                .and_then(|i| fields.get(i + 1))
                .map(|s| s.to_string())
        })
        .ok_or_else(|| anyhow::anyhow!("no default route found"))
}

/// Runs the one-time startup sequence: keys, annotation, compartment,
/// bridge, tunnel. Returns the [`Context`] the watch loop reconciles
/// against.
pub async fn startup(args: &Args, client: &Client) -> anyhow::Result<Context> {
    let internal_routing_net: IpNet = args.internal_routing_cidr.parse()?;
    host::assert_slash_16(internal_routing_net)?;

    // Fail fast on a malformed --wg-interface/--wg-bridge before either
    // name makes its way into a composed shell command.
    let tunnel_interface: InterfaceName = args.wg_interface.parse()?;
    let bridge_interface: InterfaceName = args.wg_bridge.parse()?;

    let runner = ShellCommandRunner;
    keys::ensure_keys(&runner, &args.wg_private_key, &args.wg_public_key)?;
    let public_key = keys::read_public_key(&args.wg_public_key)?;

    let hostname = args.hostname.clone().unwrap_or_else(hostname_from_kernel);

    let nodes: Api<Node> = Api::all(client.clone());
    add_public_key_label(&nodes, &hostname, &public_key).await?;

    let local_node = nodes.get(&hostname).await?;
    let local_view = node_view(&local_node);
    let machine_ip = host::machine_ip(&local_view)?;
    let inner_ip = host::inner_ip(machine_ip, internal_routing_net)?;
    let pod_cidrs = host::pod_cidrs(&local_view);
    let local_pod_cidr = pod_cidrs
        .get("ipv4")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("node {} has no IPv4 pod CIDR", hostname))?;

    let compartment = args.wg_namespace.clone();
    compartment::ensure_compartment(&runner, &compartment)?;

    let node_default_iface = default_interface(&runner)?;
    let host_side_iface = "to-wg-ns".to_string();
    let compartment_side_iface = "to-host-ns".to_string();
    compartment::connect_compartment(
        &runner,
        &compartment,
        &host_side_iface,
        &compartment_side_iface,
        "169.254.0.1",
        "169.254.0.2",
        30,
        &node_default_iface,
    )?;

    let (bridge_ip, bridge_mask) = host::first_network_address(&local_pod_cidr)?;
    compartment::ensure_bridge(
        &runner,
        &compartment,
        bridge_interface.as_str(),
        &bridge_ip,
        bridge_mask,
    )?;

    tunnel::ensure_tunnel(
        &runner,
        &compartment,
        tunnel_interface.as_str(),
        args::WG_LISTEN_PORT,
        &inner_ip.to_string(),
        &args.wg_private_key,
    )?;

    Ok(Context {
        compartment,
        tunnel_interface: tunnel_interface.as_str().to_string(),
        bridge_interface: bridge_interface.as_str().to_string(),
        host_side_iface,
        compartment_side_iface,
        listen_port: args::WG_LISTEN_PORT,
        hostname,
        local_pod_cidr,
        internal_routing_net,
    })
}

fn hostname_from_kernel() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Converts a watched node into a [`Peer`], skipping nodes that don't carry
/// enough information to join the mesh yet (no public key annotation, no
/// pod CIDR, or no internal IP).
fn node_to_peer(node: &Node, internal_routing_net: IpNet) -> Option<Peer> {
    let view = node_view(node);
    let public_key = view.annotations.get(PUBLIC_KEY_ANNOTATION)?.clone();
    let machine_ip = host::machine_ip(&view).ok()?;
    let inner_ip = host::inner_ip(machine_ip, internal_routing_net).ok()?;
    let pod_cidrs = host::pod_cidrs(&view);
    let pod_subnet = pod_cidrs.get("ipv4")?.clone();
    // Reject a malformed pod CIDR here rather than splicing it into a wg/ip
    // command string further down the pipeline.
    let _: AllowedIp = pod_subnet.parse().ok()?;

    Some(Peer {
        hostname: view.name,
        machine_ip,
        inner_ip,
        public_key,
        listen_port: args::WG_LISTEN_PORT,
        pod_subnet,
    })
}

/// Watches cluster nodes indefinitely, maintaining `table` and reconciling
/// kernel state after every event. Re-establishes the watch (and does a
/// full list-based resync) whenever the stream closes, since a closed watch
/// may have silently dropped events.
pub async fn run(client: Client, ctx: Context) -> anyhow::Result<()> {
    let nodes: Api<Node> = Api::all(client);
    let runner = ShellCommandRunner;
    let mut table = PeerTable::new();

    loop {
        let listed = nodes.list(&Default::default()).await?;
        for node in &listed.items {
            if node.metadata.name.as_deref() == Some(ctx.hostname.as_str()) {
                continue;
            }
            if let Some(peer) = node_to_peer(node, ctx.internal_routing_net) {
                table.upsert(peer);
            }
        }
        reconcile_now(&runner, &ctx, &table)?;

        let params = WatchParams::default().fields("");
        let mut stream = nodes
            .watch(&params, &listed.metadata.resource_version.unwrap_or_default())
            .await?
            .boxed();

        while let Some(event) = stream.try_next().await.transpose() {
            match event {
                Ok(WatchEvent::Added(node)) | Ok(WatchEvent::Modified(node)) => {
                    if node.metadata.name.as_deref() == Some(ctx.hostname.as_str()) {
                        continue;
                    }
                    match node_to_peer(&node, ctx.internal_routing_net) {
                        Some(peer) => table.upsert(peer),
                        None => {
                            log::debug!(
                                "skipping node {:?}: missing annotation, pod CIDR, or internal IP",
                                node.metadata.name
                            );
                            continue;
                        },
                    }
                    reconcile_now(&runner, &ctx, &table)?;
                },
                Ok(WatchEvent::Deleted(node)) => {
                    if node.metadata.name.as_deref() == Some(ctx.hostname.as_str()) {
                        continue;
                    }
                    if let Some(name) = node.metadata.name {
                        table.delete(&name);
                        reconcile_now(&runner, &ctx, &table)?;
                    }
                },
                Ok(WatchEvent::Bookmark(_)) => {},
                Ok(WatchEvent::Error(e)) => {
                    log::warn!("watch stream reported an error, resyncing: {e}");
                    break;
                },
                Err(e) => {
                    log::warn!("watch stream failed, resyncing: {e}");
                    break;
                },
            }
        }
        log::info!("node watch closed; re-listing and re-establishing watch");
    }
}

fn reconcile_now(runner: &dyn CommandRunner, ctx: &Context, table: &PeerTable) -> anyhow::Result<()> {
    let config = ReconcileConfig {
        compartment: &ctx.compartment,
        tunnel_interface: &ctx.tunnel_interface,
        host_side_iface: &ctx.host_side_iface,
        local_pod_cidr: &ctx.local_pod_cidr,
    };
    reconcile::reconcile(runner, &config, table)?;
    Ok(())
}
