//! Ensures the isolated network compartment, its link to the host, and its
//! pod bridge match the design — idempotently. Every operation probes
//! current state first and returns immediately if the target already
//! exists.

use crate::command::CommandRunner;
use crate::error::Error;

/// Parses `ip netns` output (or similar line-oriented listings) tolerating
/// extra whitespace, and checks whether `name` appears as the given field.
fn first_field_matches(output: &[u8], name: &str) -> bool {
    String::from_utf8_lossy(output)
        .lines()
        .any(|line| line.split_whitespace().next() == Some(name))
}

/// If a compartment named `name` exists, does nothing; otherwise creates it
/// and brings its loopback up.
pub fn ensure_compartment(runner: &dyn CommandRunner, name: &str) -> Result<(), Error> {
    let out = runner.run_with_output("ensure_compartment", "ip netns")?;
    if first_field_matches(&out, name) {
        return Ok(());
    }
    runner.run_silent("ensure_compartment", &format!("ip netns add {name}"))?;
    runner.run_silent(
        "ensure_compartment",
        &format!("ip netns exec {name} ip link set dev lo up"),
    )?;
    Ok(())
}

/// Connects the compartment to the host's default compartment via a private
/// `/30` veth link with source-NAT both ways, unless `host_side_iface`
/// already exists as a peer link (the presence-check key is the interface
/// name with a trailing `@`).
#[allow(clippy::too_many_arguments)]
pub fn connect_compartment(
    runner: &dyn CommandRunner,
    name: &str,
    host_side_iface: &str,
    compartment_side_iface: &str,
    host_ip: &str,
    compartment_ip: &str,
    prefix_len: u8,
    node_default_iface: &str,
) -> Result<(), Error> {
    let out = runner.run_with_output("connect_compartment", "ip link show")?;
    let marker = format!("{host_side_iface}@");
    if String::from_utf8_lossy(&out).contains(&marker) {
        return Ok(());
    }

    runner.run_silent(
        "connect_compartment",
        &format!("ip link add {host_side_iface} type veth peer name {compartment_side_iface}"),
    )?;
    runner.run_silent(
        "connect_compartment",
        &format!("ip link set {compartment_side_iface} netns {name}"),
    )?;
    runner.run_silent(
        "connect_compartment",
        &format!("ip address add {host_ip}/{prefix_len} dev {host_side_iface}"),
    )?;
    runner.run_silent(
        "connect_compartment",
        &format!(
            "ip netns exec {name} ip address add {compartment_ip}/{prefix_len} dev {compartment_side_iface}"
        ),
    )?;
    runner.run_silent(
        "connect_compartment",
        &format!("ip link set dev {host_side_iface} up"),
    )?;
    runner.run_silent(
        "connect_compartment",
        &format!("ip netns exec {name} ip link set dev {compartment_side_iface} up"),
    )?;
    runner.run_silent(
        "connect_compartment",
        &format!("ip netns exec {name} ip route add default via {host_ip} dev {compartment_side_iface}"),
    )?;

    // (i) masquerade traffic from the compartment as it leaves via the
    // host-side interface.
    runner.run_silent(
        "connect_compartment",
        &format!(
            "iptables -t nat -A POSTROUTING -s {compartment_ip}/32 -o {host_side_iface} -j MASQUERADE"
        ),
    )?;
    // (ii) masquerade the host-side source address as it crosses into the
    // compartment, so return traffic routes back through the veth.
    runner.run_silent(
        "connect_compartment",
        &format!(
            "ip netns exec {name} iptables -t nat -A POSTROUTING -s {host_ip}/32 -o {compartment_side_iface} -j MASQUERADE"
        ),
    )?;
    // (iii) masquerade compartment-sourced traffic again on the node's
    // default interface, so it reaches the outside world with the node's
    // own address.
    runner.run_silent(
        "connect_compartment",
        &format!(
            "iptables -t nat -A POSTROUTING -s {compartment_ip}/32 -o {node_default_iface} -j MASQUERADE"
        ),
    )?;

    Ok(())
}

/// If a bridge named `bridge_name` already exists in `compartment`, does
/// nothing; otherwise creates it, addresses it at the node's pod-subnet
/// first address, and brings it up.
pub fn ensure_bridge(
    runner: &dyn CommandRunner,
    compartment: &str,
    bridge_name: &str,
    bridge_ip: &str,
    mask: u8,
) -> Result<(), Error> {
    let out = runner.run_with_output(
        "ensure_bridge",
        &format!("ip netns exec {compartment} ip link ls type bridge"),
    )?;
    let marker = format!("{bridge_name}:");
    let exists = String::from_utf8_lossy(&out)
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(marker.as_str()));
    if exists {
        return Ok(());
    }

    runner.run_silent(
        "ensure_bridge",
        &format!("ip netns exec {compartment} ip link add {bridge_name} type bridge"),
    )?;
    runner.run_silent(
        "ensure_bridge",
        &format!(
            "ip netns exec {compartment} ip address add dev {bridge_name} {bridge_ip}/{mask}"
        ),
    )?;
    runner.run_silent(
        "ensure_bridge",
        &format!("ip netns exec {compartment} ip link set dev {bridge_name} up"),
    )?;
    Ok(())
}

/// Test-only: removes the compartment if present.
pub fn delete_compartment(runner: &dyn CommandRunner, name: &str) -> Result<(), Error> {
    let out = runner.run_with_output("delete_compartment", "ip netns")?;
    if first_field_matches(&out, name) {
        runner.run_silent("delete_compartment", &format!("ip netns del {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::MockCommandRunner;

    #[test]
    fn ensure_compartment_is_idempotent() {
        let runner = MockCommandRunner::new().with_output("ip netns", "wireguard-kubernetes (id: 0)\n");
        ensure_compartment(&runner, "wireguard-kubernetes").unwrap();
        assert_eq!(runner.commands(), vec!["ip netns"]);
    }

    #[test]
    fn ensure_compartment_creates_when_absent() {
        let runner = MockCommandRunner::new().with_output("ip netns", "");
        ensure_compartment(&runner, "wireguard-kubernetes").unwrap();
        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c == "ip netns add wireguard-kubernetes"));
        assert!(cmds
            .iter()
            .any(|c| c == "ip netns exec wireguard-kubernetes ip link set dev lo up"));
    }

    #[test]
    fn connect_compartment_noop_when_peer_link_present() {
        let runner = MockCommandRunner::new()
            .with_output("ip link show", "4: to-wg-ns@if5: <BROADCAST,UP> mtu 1500\n");
        connect_compartment(
            &runner,
            "wireguard-kubernetes",
            "to-wg-ns",
            "to-host-ns",
            "169.254.0.1",
            "169.254.0.2",
            30,
            "eth0",
        )
        .unwrap();
        assert_eq!(runner.commands(), vec!["ip link show"]);
    }

    #[test]
    fn connect_compartment_creates_link_and_nat_rules() {
        let runner = MockCommandRunner::new().with_output("ip link show", "");
        connect_compartment(
            &runner,
            "wireguard-kubernetes",
            "to-wg-ns",
            "to-host-ns",
            "169.254.0.1",
            "169.254.0.2",
            30,
            "eth0",
        )
        .unwrap();
        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c.contains("type veth peer name to-host-ns")));
        assert!(cmds.iter().any(|c| c.contains("netns wireguard-kubernetes")));
        assert_eq!(cmds.iter().filter(|c| c.contains("MASQUERADE")).count(), 3);
    }

    #[test]
    fn ensure_bridge_tolerates_whitespace() {
        let runner = MockCommandRunner::new().with_output(
            "ip netns exec wireguard-kubernetes ip link ls type bridge",
            "2:   wgb0:   <BROADCAST,NOARP> mtu 1500\n",
        );
        ensure_bridge(&runner, "wireguard-kubernetes", "wgb0", "10.245.6.1", 24).unwrap();
        assert_eq!(
            runner.commands(),
            vec!["ip netns exec wireguard-kubernetes ip link ls type bridge"]
        );
    }
}
