//! Picks the virtual server that answers a request.

use crate::config::{ListenAddr, ServerConfig};
use crate::error::{Error, Result};

/// Resolves the connection's local address plus the request's host name to a
/// server.
///
/// Candidates are the servers listening on exactly `addr`; when none match,
/// any server sharing the port qualifies. Among several candidates the first
/// one naming `hostname` wins, otherwise the first in configuration order.
/// An empty candidate set is a hard error: no listener should have accepted
/// the connection.
pub fn resolve<'a>(
    servers: &'a [ServerConfig],
    addr: &ListenAddr,
    hostname: &str,
) -> Result<&'a ServerConfig> {
    let mut candidates: Vec<&ServerConfig> = servers
        .iter()
        .filter(|server| server.listens.iter().any(|listen| listen == addr))
        .collect();

    if candidates.is_empty() {
        candidates = servers
            .iter()
            .filter(|server| server.listens.iter().any(|listen| listen.port == addr.port))
            .collect();
    }

    if candidates.is_empty() {
        return Err(Error::NoServer(addr.ip.clone(), addr.port.clone()));
    }

    if candidates.len() > 1 {
        if let Some(named) = candidates
            .iter()
            .find(|server| server.server_names.iter().any(|name| name == hostname))
        {
            return Ok(named);
        }
    }

    Ok(candidates[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    fn server(listen: (&str, &str), names: &[&str]) -> ServerConfig {
        ServerConfig {
            listens: vec![ListenAddr::new(listen.0, listen.1)],
            server_names: names.iter().map(|n| n.to_string()).collect(),
            root: Utf8PathBuf::from("/var/www"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn exact_address_beats_port_fallback() {
        let servers = vec![
            server(("0.0.0.0", "9000"), &["wild"]),
            server(("127.0.0.1", "8080"), &["local"]),
        ];

        let picked = resolve(&servers, &ListenAddr::new("127.0.0.1", "8080"), "").unwrap();
        assert_eq!(picked.server_names, ["local"]);
    }

    #[test]
    fn port_fallback_applies_when_no_exact_match() {
        let servers = vec![server(("10.0.0.1", "8080"), &["a"])];

        let picked = resolve(&servers, &ListenAddr::new("127.0.0.1", "8080"), "").unwrap();
        assert_eq!(picked.server_names, ["a"]);
    }

    #[test]
    fn host_header_breaks_ties() {
        let servers = vec![
            server(("127.0.0.1", "8080"), &["first"]),
            server(("127.0.0.1", "8080"), &["second"]),
        ];

        let addr = ListenAddr::new("127.0.0.1", "8080");
        let picked = resolve(&servers, &addr, "second").unwrap();
        assert_eq!(picked.server_names, ["second"]);
    }

    #[test]
    fn unknown_host_falls_back_to_first_candidate() {
        let servers = vec![
            server(("127.0.0.1", "8080"), &["first"]),
            server(("127.0.0.1", "8080"), &["second"]),
        ];

        let addr = ListenAddr::new("127.0.0.1", "8080");
        let picked = resolve(&servers, &addr, "nobody").unwrap();
        assert_eq!(picked.server_names, ["first"]);
    }

    #[test]
    fn no_candidate_is_a_hard_error() {
        let servers = vec![server(("127.0.0.1", "8080"), &["a"])];
        let addr = ListenAddr::new("127.0.0.1", "9999");
        assert_matches!(resolve(&servers, &addr, ""), Err(Error::NoServer(_, _)));
    }
}
