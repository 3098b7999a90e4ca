//! Firewall rule builder.
//!
//! Pure function producing the packet-filter and NAT rule set for a tunnel's
//! protocol/port/interface triple, renderable in iptables-restore format for
//! the remote host's boot-time rules file.

use crate::registry::Protocol;

/// Ordered packet-filter and NAT rules for one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRuleSet {
    pub filter: Vec<String>,
    pub nat: Vec<String>,
}

/// Build the rule set for a tunnel.
///
/// `egress` is the remote host's primary egress interface; forwarding is
/// accepted bidirectionally between it and the tunnel interface, and NAT
/// masquerades outbound traffic on it.
pub fn build(protocol: Protocol, port: u16, interface: &str, egress: &str) -> FirewallRuleSet {
    let filter = vec![
        ":INPUT ACCEPT [0:0]".to_string(),
        ":FORWARD ACCEPT [0:0]".to_string(),
        ":OUTPUT ACCEPT [0:0]".to_string(),
        "-A INPUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT".to_string(),
        "-A INPUT -m conntrack --ctstate INVALID -j DROP".to_string(),
        "-A INPUT -i lo -j ACCEPT".to_string(),
        "-A INPUT -p icmp -j ACCEPT".to_string(),
        "-A INPUT -p tcp --dport 22 -j ACCEPT".to_string(),
        "-A OUTPUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT".to_string(),
        "-A OUTPUT -m conntrack --ctstate INVALID -j DROP".to_string(),
        "-A OUTPUT -o lo -j ACCEPT".to_string(),
        "-A OUTPUT -p icmp -j ACCEPT".to_string(),
        "-A FORWARD -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT".to_string(),
        "-A FORWARD -m conntrack --ctstate INVALID -j DROP".to_string(),
        format!("-A INPUT -p {} --dport {} -j ACCEPT", protocol, port),
        format!("-A FORWARD -i {} -o {} -j ACCEPT", interface, egress),
        format!("-A FORWARD -i {} -o {} -j ACCEPT", egress, interface),
    ];

    let nat = vec![
        ":PREROUTING ACCEPT [0:0]".to_string(),
        ":INPUT ACCEPT [0:0]".to_string(),
        ":OUTPUT ACCEPT [0:0]".to_string(),
        ":POSTROUTING ACCEPT [0:0]".to_string(),
        format!("-A POSTROUTING -o {} -j MASQUERADE", egress),
    ];

    FirewallRuleSet { filter, nat }
}

impl FirewallRuleSet {
    /// Render as a single iptables-restore document: filter table, then NAT
    /// table, each terminated by its commit marker.
    pub fn render(&self) -> String {
        let filter_section = std::iter::once("*filter")
            .chain(self.filter.iter().map(String::as_str))
            .chain(std::iter::once("COMMIT"))
            .collect::<Vec<_>>()
            .join("\n");

        let nat_section = std::iter::once("*nat")
            .chain(self.nat.iter().map(String::as_str))
            .chain(std::iter::once("COMMIT"))
            .collect::<Vec<_>>()
            .join("\n");

        format!("{}\n\n{}", filter_section, nat_section)
    }
}
