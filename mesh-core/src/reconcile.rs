//! The engine that enforces invariants I1-I4 against kernel state: applies
//! the current [`PeerTable`] to the tunnel and routing tables, then prunes
//! whatever the table no longer backs.
//!
//! Apply and prune are deliberately ordered apply-then-prune within each
//! layer (peers, then tunnel routes, then host routes) so a peer whose
//! identity changed (e.g. a new subnet on a Modified event) always has its
//! new state installed before any old state referencing it is removed —
//! this preserves connectivity across a modify.

use std::collections::HashSet;

use crate::command::CommandRunner;
use crate::error::Error;
use crate::peer::PeerTable;

/// Static addressing this reconciler needs that isn't carried by any single
/// peer: the names of the compartment and its interfaces, and the local
/// node's own pod subnet (which always gets a host route alongside the
/// peers').
pub struct ReconcileConfig<'a> {
    pub compartment: &'a str,
    pub tunnel_interface: &'a str,
    pub host_side_iface: &'a str,
    pub local_pod_cidr: &'a str,
}

/// Runs one full apply+prune pass. A transient (apply) failure for a single
/// peer or route is logged and the pass continues; a prune failure aborts
/// the pass and bubbles, since a stale cryptographic peer left configured is
/// a correctness hazard.
pub fn reconcile(
    runner: &dyn CommandRunner,
    config: &ReconcileConfig,
    table: &PeerTable,
) -> Result<(), Error> {
    apply_peers(runner, config, table);
    apply_tunnel_routes(runner, config, table);
    apply_host_routes(runner, config, table);
    prune_peers(runner, config, table)?;
    prune_tunnel_routes(runner, config, table)?;
    prune_host_routes(runner, config, table)?;
    Ok(())
}

fn apply_peers(runner: &dyn CommandRunner, config: &ReconcileConfig, table: &PeerTable) {
    for peer in table.iterate() {
        let cmd = format!(
            "ip netns exec {} wg set {} peer {} allowed-ips {},{} endpoint {}:{}",
            config.compartment,
            config.tunnel_interface,
            peer.public_key,
            peer.inner_ip,
            peer.pod_subnet,
            peer.machine_ip,
            peer.listen_port,
        );
        if let Err(e) = runner.run_silent("apply_peers", &cmd) {
            log::warn!("failed to apply peer {}: {}", peer.hostname, e);
        }
    }
}

fn apply_tunnel_routes(runner: &dyn CommandRunner, config: &ReconcileConfig, table: &PeerTable) {
    for peer in table.iterate() {
        let cmd = format!(
            "ip netns exec {} ip route add {} via {} dev {}",
            config.compartment, peer.pod_subnet, peer.inner_ip, config.tunnel_interface,
        );
        if let Err(e) = runner.run_silent("apply_tunnel_routes", &cmd) {
            log::warn!(
                "failed to apply tunnel route for {}: {}",
                peer.hostname,
                e
            );
        }
    }
}

fn apply_host_routes(runner: &dyn CommandRunner, config: &ReconcileConfig, table: &PeerTable) {
    let mut subnets: Vec<&str> = vec![config.local_pod_cidr];
    subnets.extend(table.iterate().map(|p| p.pod_subnet.as_str()));
    for subnet in subnets {
        let cmd = format!(
            "ip route add {} via 169.254.0.2 dev {}",
            subnet, config.host_side_iface,
        );
        if let Err(e) = runner.run_silent("apply_host_routes", &cmd) {
            log::warn!("failed to apply host route for {}: {}", subnet, e);
        }
    }
}

fn prune_peers(
    runner: &dyn CommandRunner,
    config: &ReconcileConfig,
    table: &PeerTable,
) -> Result<(), Error> {
    let table_keys: HashSet<&str> = table.iterate().map(|p| p.public_key.as_str()).collect();
    let out = runner.run_with_output(
        "prune_peers",
        &format!(
            "ip netns exec {} wg show {} | awk '/^peer/ {{print $2}}'",
            config.compartment, config.tunnel_interface,
        ),
    )?;
    for configured_key in String::from_utf8_lossy(&out).lines() {
        let configured_key = configured_key.trim();
        if configured_key.is_empty() || table_keys.contains(configured_key) {
            continue;
        }
        runner.run_silent(
            "prune_peers",
            &format!(
                "ip netns exec {} wg set {} peer {} remove",
                config.compartment, config.tunnel_interface, configured_key,
            ),
        )?;
    }
    Ok(())
}

fn prune_tunnel_routes(
    runner: &dyn CommandRunner,
    config: &ReconcileConfig,
    table: &PeerTable,
) -> Result<(), Error> {
    let wanted: HashSet<&str> = table.iterate().map(|p| p.pod_subnet.as_str()).collect();
    let out = runner.run_with_output(
        "prune_tunnel_routes",
        &format!(
            "ip netns exec {} ip route ls dev {}",
            config.compartment, config.tunnel_interface,
        ),
    )?;
    for line in String::from_utf8_lossy(&out).lines() {
        if line.contains("proto kernel") {
            continue;
        }
        let destination = match line.split_whitespace().next() {
            Some(d) => d,
            None => continue,
        };
        if wanted.contains(destination) {
            continue;
        }
        runner.run_silent(
            "prune_tunnel_routes",
            &format!(
                "ip netns exec {} ip route delete {}",
                config.compartment, line,
            ),
        )?;
    }
    Ok(())
}

fn prune_host_routes(
    runner: &dyn CommandRunner,
    config: &ReconcileConfig,
    table: &PeerTable,
) -> Result<(), Error> {
    let mut wanted: HashSet<&str> = table.iterate().map(|p| p.pod_subnet.as_str()).collect();
    wanted.insert(config.local_pod_cidr);
    let out = runner.run_with_output(
        "prune_host_routes",
        &format!("ip route ls dev {}", config.host_side_iface),
    )?;
    for line in String::from_utf8_lossy(&out).lines() {
        if line.contains("proto kernel") {
            continue;
        }
        let destination = match line.split_whitespace().next() {
            Some(d) => d,
            None => continue,
        };
        if wanted.contains(destination) {
            continue;
        }
        runner.run_silent(
            "prune_host_routes",
            &format!("ip route delete {}", line),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::MockCommandRunner;
    use crate::peer::Peer;

    fn peer(hostname: &str, machine_ip: &str, inner_ip: &str, subnet: &str, key: &str) -> Peer {
        Peer {
            hostname: hostname.to_string(),
            machine_ip: machine_ip.parse().unwrap(),
            inner_ip: inner_ip.parse().unwrap(),
            public_key: key.to_string(),
            listen_port: 10000,
            pod_subnet: subnet.to_string(),
        }
    }

    fn config() -> ReconcileConfig<'static> {
        ReconcileConfig {
            compartment: "wireguard-kubernetes",
            tunnel_interface: "wg0",
            host_side_iface: "to-wg-ns",
            local_pod_cidr: "10.245.6.0/24",
        }
    }

    // S1: cold start, one remote peer.
    #[test]
    fn s1_cold_start_one_peer() {
        let mut table = PeerTable::new();
        table.upsert(peer(
            "worker-0",
            "172.18.0.103",
            "100.64.0.103",
            "10.245.3.0/24",
            "qP+jGI=",
        ));
        let runner = MockCommandRunner::new();
        reconcile(&runner, &config(), &table).unwrap();

        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c
            == "ip netns exec wireguard-kubernetes wg set wg0 peer qP+jGI= allowed-ips 100.64.0.103,10.245.3.0/24 endpoint 172.18.0.103:10000"));
        assert!(cmds.iter().any(|c| c
            == "ip netns exec wireguard-kubernetes ip route add 10.245.3.0/24 via 100.64.0.103 dev wg0"));
        assert!(cmds
            .iter()
            .any(|c| c == "ip route add 10.245.6.0/24 via 169.254.0.2 dev to-wg-ns"));
        assert!(cmds
            .iter()
            .any(|c| c == "ip route add 10.245.3.0/24 via 169.254.0.2 dev to-wg-ns"));
    }

    // S2: add three peers, verify route/peer accounting.
    #[test]
    fn s2_three_peers() {
        let mut table = PeerTable::new();
        table.upsert(peer("worker-0", "172.18.0.103", "100.64.0.103", "10.245.3.0/24", "k0="));
        table.upsert(peer("worker-1", "172.18.0.104", "100.64.0.104", "10.245.4.0/24", "k1="));
        table.upsert(peer("worker-2", "172.18.0.105", "100.64.0.105", "10.245.5.0/24", "k2="));
        let runner = MockCommandRunner::new();
        reconcile(&runner, &config(), &table).unwrap();

        let peer_cmds = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains("wg set wg0 peer"))
            .count();
        assert_eq!(peer_cmds, 3);
        let tunnel_route_cmds = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains("ip route add") && c.contains("dev wg0"))
            .count();
        assert_eq!(tunnel_route_cmds, 3);
        // local subnet + 3 peer subnets = 4 host routes.
        let host_route_cmds = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains("dev to-wg-ns") && c.starts_with("ip route add"))
            .count();
        assert_eq!(host_route_cmds, 4);
    }

    // S3: deleting a peer prunes its tunnel peer entry and both routes,
    // leaving the others untouched.
    #[test]
    fn s3_delete_prunes_peer_and_routes() {
        let mut table = PeerTable::new();
        table.upsert(peer("worker-0", "172.18.0.103", "100.64.0.103", "10.245.3.0/24", "k0="));
        table.upsert(peer("worker-1", "172.18.0.104", "100.64.0.104", "10.245.4.0/24", "k1="));

        let runner = MockCommandRunner::new()
            .with_output(
                "ip netns exec wireguard-kubernetes wg show wg0 | awk '/^peer/ {print $2}'",
                "k0=\nk1=\nk2=\n",
            )
            .with_output(
                "ip netns exec wireguard-kubernetes ip route ls dev wg0",
                "10.245.3.0/24 via 100.64.0.103 dev wg0\n10.245.4.0/24 via 100.64.0.104 dev wg0\n10.245.5.0/24 via 100.64.0.105 dev wg0\n",
            )
            .with_output(
                "ip route ls dev to-wg-ns",
                "10.245.6.0/24 via 169.254.0.2 dev to-wg-ns\n10.245.3.0/24 via 169.254.0.2 dev to-wg-ns\n10.245.4.0/24 via 169.254.0.2 dev to-wg-ns\n10.245.5.0/24 via 169.254.0.2 dev to-wg-ns\n",
            );

        reconcile(&runner, &config(), &table).unwrap();

        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c.contains("peer k2= remove")));
        assert!(!cmds.iter().any(|c| c.contains("peer k0= remove")));
        assert!(!cmds.iter().any(|c| c.contains("peer k1= remove")));
        assert!(cmds
            .iter()
            .any(|c| c.contains("ip route delete 10.245.5.0/24 via 100.64.0.105 dev wg0")));
        assert!(cmds
            .iter()
            .any(|c| c.contains("ip route delete 10.245.5.0/24 via 169.254.0.2 dev to-wg-ns")));
    }

    // S5/S6: a foreign peer and its route are pruned; a kernel route is
    // never touched even if no peer claims its subnet.
    #[test]
    fn s5_s6_foreign_peer_and_kernel_route() {
        let table = PeerTable::new();
        let runner = MockCommandRunner::new()
            .with_output(
                "ip netns exec wireguard-kubernetes wg show wg0 | awk '/^peer/ {print $2}'",
                "toBePrunedKey=\n",
            )
            .with_output(
                "ip netns exec wireguard-kubernetes ip route ls dev wg0",
                "10.99.0.0/24 via 100.64.0.200 dev wg0\n10.245.6.0/24 via 100.64.0.1 dev wg0  proto kernel\n",
            )
            .with_output("ip route ls dev to-wg-ns", "");

        reconcile(&runner, &config(), &table).unwrap();

        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c.contains("peer toBePrunedKey= remove")));
        assert!(cmds
            .iter()
            .any(|c| c.contains("ip route delete 10.99.0.0/24 via 100.64.0.200 dev wg0")));
        assert!(!cmds.iter().any(|c| c.contains("proto kernel") && c.contains("delete")));
    }

    // P2: idempotence — rerunning on an unchanged table issues only apply
    // commands; prune scans find nothing to delete.
    #[test]
    fn p2_idempotent_rerun_prunes_nothing() {
        let mut table = PeerTable::new();
        table.upsert(peer("worker-0", "172.18.0.103", "100.64.0.103", "10.245.3.0/24", "k0="));

        let runner = MockCommandRunner::new()
            .with_output(
                "ip netns exec wireguard-kubernetes wg show wg0 | awk '/^peer/ {print $2}'",
                "k0=\n",
            )
            .with_output(
                "ip netns exec wireguard-kubernetes ip route ls dev wg0",
                "10.245.3.0/24 via 100.64.0.103 dev wg0\n",
            )
            .with_output(
                "ip route ls dev to-wg-ns",
                "10.245.6.0/24 via 169.254.0.2 dev to-wg-ns\n10.245.3.0/24 via 169.254.0.2 dev to-wg-ns\n",
            );

        reconcile(&runner, &config(), &table).unwrap();

        assert!(!runner.commands().iter().any(|c| c.contains("remove")));
        assert!(!runner.commands().iter().any(|c| c.contains("delete")));
    }

    // Apply failures for one peer don't block others.
    #[test]
    fn apply_failure_for_one_peer_does_not_starve_others() {
        let mut table = PeerTable::new();
        table.upsert(peer("worker-0", "172.18.0.103", "100.64.0.103", "10.245.3.0/24", "k0="));
        table.upsert(peer("worker-1", "172.18.0.104", "100.64.0.104", "10.245.4.0/24", "k1="));

        let runner = MockCommandRunner::new().with_failure(
            "ip netns exec wireguard-kubernetes wg set wg0 peer k0= allowed-ips 100.64.0.103,10.245.3.0/24 endpoint 172.18.0.103:10000",
            "device busy",
        );
        // Should not error out overall despite the one failure.
        reconcile(&runner, &config(), &table).unwrap();
        assert!(runner.commands().iter().any(|c| c.contains("k1=")));
    }

    // Prune failures abort the pass.
    #[test]
    fn prune_peer_failure_is_fatal() {
        let table = PeerTable::new();
        let runner = MockCommandRunner::new()
            .with_output(
                "ip netns exec wireguard-kubernetes wg show wg0 | awk '/^peer/ {print $2}'",
                "stale=\n",
            )
            .with_failure(
                "ip netns exec wireguard-kubernetes wg set wg0 peer stale= remove",
                "no such device",
            );
        assert!(reconcile(&runner, &config(), &table).is_err());
    }
}
