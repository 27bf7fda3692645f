//! Ensures the cryptographic tunnel interface exists inside the compartment.
//!
//! If the interface already exists at startup it is deleted and recreated —
//! a known limitation (see `spec.md` §9 and `DESIGN.md`): it causes a
//! data-plane gap across controller restarts, but matches the original
//! behavior this controller is ported from.

use crate::command::CommandRunner;
use crate::error::Error;

/// Returns whether an interface named `interface` exists inside
/// `compartment`.
pub fn is_tunnel(
    runner: &dyn CommandRunner,
    compartment: &str,
    interface: &str,
) -> Result<bool, Error> {
    let out = runner.run_with_output(
        "is_tunnel",
        &format!("ip netns exec {compartment} ip -o address show"),
    )?;
    Ok(String::from_utf8_lossy(&out)
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(interface)))
}

/// Creates (or recreates, if present) the tunnel interface inside
/// `compartment`, carrying `private_key_path`'s content and `listen_port`,
/// addressed as `inner_ip/16`.
pub fn ensure_tunnel(
    runner: &dyn CommandRunner,
    compartment: &str,
    interface: &str,
    listen_port: u16,
    inner_ip: &str,
    private_key_path: &str,
) -> Result<(), Error> {
    if is_tunnel(runner, compartment, interface)? {
        runner.run_silent(
            "ensure_tunnel",
            &format!("ip netns exec {compartment} ip link del {interface}"),
        )?;
    }

    runner.run_silent(
        "ensure_tunnel",
        &format!("ip link add {interface} type wireguard"),
    )?;
    runner.run_silent(
        "ensure_tunnel",
        &format!(
            "wg set {interface} private-key {private_key_path} listen-port {listen_port}"
        ),
    )?;
    runner.run_silent(
        "ensure_tunnel",
        &format!("ip link set dev {interface} netns {compartment}"),
    )?;
    runner.run_silent(
        "ensure_tunnel",
        &format!("ip netns exec {compartment} ip link set dev {interface} up"),
    )?;
    runner.run_silent(
        "ensure_tunnel",
        &format!("ip netns exec {compartment} ip address add dev {interface} {inner_ip}/16"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::MockCommandRunner;

    #[test]
    fn is_tunnel_finds_interface() {
        let runner = MockCommandRunner::new().with_output(
            "ip netns exec wireguard-kubernetes ip -o address show",
            "1: lo    inet 127.0.0.1/8 scope host lo\n2: wg0    inet 100.64.0.1/16 scope global wg0\n",
        );
        assert!(is_tunnel(&runner, "wireguard-kubernetes", "wg0").unwrap());
        assert!(!is_tunnel(&runner, "wireguard-kubernetes", "wg1").unwrap());
    }

    #[test]
    fn ensure_tunnel_recreates_when_present() {
        let runner = MockCommandRunner::new().with_output(
            "ip netns exec wireguard-kubernetes ip -o address show",
            "2: wg0    inet 100.64.0.1/16 scope global wg0\n",
        );
        ensure_tunnel(
            &runner,
            "wireguard-kubernetes",
            "wg0",
            10000,
            "100.64.0.1",
            "/etc/wireguard/private",
        )
        .unwrap();
        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c.contains("ip link del wg0")));
        assert!(cmds.iter().any(|c| c.contains("type wireguard")));
        assert!(cmds.iter().any(|c| c.contains("100.64.0.1/16")));
    }

    #[test]
    fn ensure_tunnel_creates_when_absent() {
        let runner = MockCommandRunner::new()
            .with_output("ip netns exec wireguard-kubernetes ip -o address show", "");
        ensure_tunnel(
            &runner,
            "wireguard-kubernetes",
            "wg0",
            10000,
            "100.64.0.1",
            "/etc/wireguard/private",
        )
        .unwrap();
        assert!(!runner.commands().iter().any(|c| c.contains("link del")));
    }
}
