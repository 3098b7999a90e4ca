//! Directive builders.
//!
//! Pure functions producing the ordered configuration-line sequences for the
//! server and client roles. No I/O, no validation; callers validate the
//! record before building. The cipher suite, digest, and TLS floor are
//! pinned; `dh none` relies on ECDHE via the TLS handshake instead of a
//! Diffie-Hellman parameter file.

use crate::registry::TunnelRecord;

/// Build the server-side directive sequence for a tunnel.
pub fn server_directives(name: &str, record: &TunnelRecord) -> Vec<String> {
    vec![
        format!("log {}-server.log", name),
        "tls-server".to_string(),
        "dev-type tun".to_string(),
        format!("dev {}", record.interface_name),
        format!("topology {}", record.connection_type),
        format!(
            "ifconfig {} {}",
            record.server_private_ip, record.client_private_ip
        ),
        format!("port {}", record.port_number),
        format!("proto {}", record.protocol),
        "ncp-ciphers AES-128-GCM:AES-128-CBC".to_string(),
        "cipher AES-128-GCM".to_string(),
        "auth SHA256".to_string(),
        "tls-cipher TLS-ECDHE-RSA-WITH-AES-256-GCM-SHA384".to_string(),
        "dh none".to_string(),
        format!("verify-x509-name {}-client name", name),
        "remote-cert-tls client".to_string(),
        "tls-version-min 1.3 or-highest".to_string(),
        format!("chroot {}-jail", name),
        "user nobody".to_string(),
        "group nogroup".to_string(),
        "persist-key".to_string(),
        "persist-tun".to_string(),
        "verb 4".to_string(),
        "keepalive 10 60".to_string(),
        "fast-io".to_string(),
        "push \"redirect-gateway def1\"".to_string(),
        "push \"dhcp-option DNS 1.1.1.1\"".to_string(),
        "push \"dhcp-option DNS 8.8.8.8\"".to_string(),
    ]
}

/// Build the client-side directive sequence for a tunnel.
pub fn client_directives(name: &str, record: &TunnelRecord) -> Vec<String> {
    vec![
        format!("log {}-client.log", name),
        "client".to_string(),
        "nobind".to_string(),
        "pull".to_string(),
        "dev-type tun".to_string(),
        format!("dev {}", record.interface_name),
        format!("topology {}", record.connection_type),
        format!(
            "ifconfig {} {}",
            record.client_private_ip, record.server_private_ip
        ),
        format!("remote {}", record.server_public_ip),
        format!("port {}", record.port_number),
        format!("proto {}", record.protocol),
        "redirect-gateway def1".to_string(),
        "cipher AES-128-GCM".to_string(),
        "auth SHA256".to_string(),
        format!("verify-x509-name {}-server name", name),
        "remote-cert-tls server".to_string(),
        "user nobody".to_string(),
        "group nogroup".to_string(),
        "persist-key".to_string(),
        "persist-tun".to_string(),
        "verb 4".to_string(),
        "keepalive 10 60".to_string(),
        "fast-io".to_string(),
        "up /etc/openvpn/update-resolv-conf".to_string(),
        "down /etc/openvpn/update-resolv-conf".to_string(),
    ]
}
