use clap::Parser;

/// UDP port every node's tunnel listens on; not configurable, per the wire
/// protocol's fixed-endpoint convention.
pub const WG_LISTEN_PORT: u16 = 10000;

/// Joins this node to a full-mesh WireGuard overlay spanning the cluster.
#[derive(Parser, Debug)]
#[command(name = "mesh-controller", version, about)]
pub struct Args {
    /// Path to a kubeconfig file; falls back to in-cluster config when unset.
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Path to this node's WireGuard private key.
    #[arg(long, default_value = "/etc/wireguard/private")]
    pub wg_private_key: String,

    /// Path to this node's WireGuard public key.
    #[arg(long, default_value = "/etc/wireguard/public")]
    pub wg_public_key: String,

    /// Name of the network compartment the tunnel and bridge live in.
    #[arg(long, default_value = "wireguard-kubernetes")]
    pub wg_namespace: String,

    /// Name of the WireGuard tunnel interface inside the compartment.
    #[arg(long, default_value = "wg0")]
    pub wg_interface: String,

    /// Name of the pod bridge inside the compartment.
    #[arg(long, default_value = "wgb0")]
    pub wg_bridge: String,

    /// This node's hostname as known to the cluster; defaults to the kernel
    /// hostname.
    #[arg(long)]
    pub hostname: Option<String>,

    /// The cluster-wide /16 address space the overlay's inner addresses are
    /// drawn from.
    #[arg(long, default_value = "100.64.0.0/16")]
    pub internal_routing_cidr: String,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
