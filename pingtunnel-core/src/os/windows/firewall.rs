//! Firewall bindings, shelled through `netsh advfirewall`. `duct` (a
//! `talpid-core` dependency already used for running external commands)
//! is the natural fit here: the Windows Filtering Platform COM surface
//! this product would otherwise bind is large, and shelling out to the
//! equivalent command is fine as long as the operations stay idempotent.

use std::net::Ipv4Addr;

use pingtunnel_types::Error;

const RULE_PREFIX: &str = "PingTunnelVPN_BlockUDP_";

fn run_netsh(args: &[&str]) -> Result<String, Error> {
    let output = duct::cmd("netsh", args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| Error::os("netsh", e.raw_os_error().unwrap_or(-1) as i64))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn add_block_outbound_udp(local_subnet: Ipv4Addr, prefix_length: u8) -> Result<(), Error> {
    let name = format!("{}local_{}_{}", RULE_PREFIX, local_subnet, prefix_length);
    let local_ip = format!("{}/{}", local_subnet, prefix_length);
    run_netsh(&[
        "advfirewall",
        "firewall",
        "add",
        "rule",
        &format!("name={}", name),
        "dir=out",
        "action=block",
        "protocol=UDP",
        &format!("localip={}", local_ip),
    ])?;
    Ok(())
}

pub fn add_allow_outbound_udp(remote_ip: Ipv4Addr) -> Result<(), Error> {
    let name = format!("{}allow_{}", RULE_PREFIX, remote_ip);
    run_netsh(&[
        "advfirewall",
        "firewall",
        "add",
        "rule",
        &format!("name={}", name),
        "dir=out",
        "action=allow",
        "protocol=UDP",
        &format!("remoteip={}", remote_ip),
    ])?;
    Ok(())
}

/// Idempotent: `netsh` reports an error when the named rule does not
/// exist, which this treats as success rather than propagating.
pub fn remove_rule(name: &str) -> Result<(), Error> {
    run_netsh(&[
        "advfirewall",
        "firewall",
        "delete",
        "rule",
        &format!("name={}", name),
    ])?;
    Ok(())
}

pub fn list_rules_with_prefix(prefix: &str) -> Result<Vec<String>, Error> {
    let output = run_netsh(&["advfirewall", "firewall", "show", "rule", "name=all"])?;
    let mut names = Vec::new();
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("Rule Name:") {
            let name = rest.trim();
            if name.starts_with(prefix) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_names_from_netsh_show_output() {
        let output = "Rule Name:                           PingTunnelVPN_BlockUDP_local_198.18.0.0_24\r\n\
                       ----------------------------------------------------------------------\r\n\
                       Enabled:                             Yes\r\n\
                       \r\n\
                       Rule Name:                           Some Other Rule\r\n";
        let mut names = Vec::new();
        for line in output.lines() {
            if let Some(rest) = line.trim().strip_prefix("Rule Name:") {
                let name = rest.trim();
                if name.starts_with(RULE_PREFIX) {
                    names.push(name.to_string());
                }
            }
        }
        assert_eq!(names, vec!["PingTunnelVPN_BlockUDP_local_198.18.0.0_24".to_string()]);
    }
}
