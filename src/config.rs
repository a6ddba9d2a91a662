//! The configuration tree consumed by the server.
//!
//! A [`ServerConfig`] describes one virtual server: where it listens, which
//! host names it answers to, and how requests under each route are handled.
//! Routes are overlaid with [`Location`] blocks whose unset fields delegate
//! back to the enclosing server, so every lookup goes through the `*_for`
//! accessors which take the matched route.

mod parser;

pub use parser::{load, parse};

use crate::error::{Error, Result};
use crate::request::Method;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, BTreeSet};

/// Effective body limit when `client_max_body_size` is unset.
pub const DEFAULT_BODY_LIMIT: i64 = 1 << 20;

const KB: i64 = 1024;
const MB: i64 = KB * KB;
const GB: i64 = KB * KB * KB;

/// A listen endpoint, kept as the textual (ip, port) pair it was configured
/// with. Ordering is lexicographic by ip, then port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenAddr {
    pub ip: String,
    pub port: String,
}

impl ListenAddr {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }

    /// The wildcard ip shadows every specific ip on the same port.
    pub fn is_wildcard(&self) -> bool {
        self.ip.is_empty() || self.ip == "0.0.0.0"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Autoindex {
    On,
    Off,
    #[default]
    Unset,
}

/// A URI-prefix-scoped overlay of configuration attached to a server.
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub root: Option<Utf8PathBuf>,
    pub index: Vec<String>,
    pub autoindex: Autoindex,
    pub client_max_body_size: Option<i64>,
    pub limit_except: BTreeSet<Method>,
    pub error_pages: BTreeMap<u16, Utf8PathBuf>,
    pub upload_store: Option<Utf8PathBuf>,
    pub return_to: Option<(u16, String)>,
    pub cgi_ext: Option<String>,
}

/// Configuration for one virtual server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listens: Vec<ListenAddr>,
    pub server_names: Vec<String>,
    pub client_max_body_size: Option<i64>,
    pub error_pages: BTreeMap<u16, Utf8PathBuf>,
    pub root: Utf8PathBuf,
    pub locations: BTreeMap<String, Location>,
    pub index: Vec<String>,
    pub autoindex: Autoindex,
    pub upload_store: Option<Utf8PathBuf>,
    pub methods: BTreeSet<Method>,
    pub return_to: Option<(u16, String)>,
    pub cgi_ext: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listens: Vec::new(),
            server_names: Vec::new(),
            client_max_body_size: None,
            error_pages: BTreeMap::new(),
            root: Utf8PathBuf::new(),
            locations: BTreeMap::new(),
            index: vec!["index.html".to_string(), "index.htm".to_string()],
            autoindex: Autoindex::Off,
            upload_store: None,
            methods: BTreeSet::from([Method::Get, Method::Post, Method::Delete]),
            return_to: None,
            cgi_ext: None,
        }
    }
}

impl ServerConfig {
    /// Returns the route of the location whose prefix is the longest match
    /// for `decoded_uri`, or `None` if the bare server config applies.
    pub fn matched_route(&self, decoded_uri: &str) -> Option<&str> {
        self.locations
            .keys()
            .filter(|route| decoded_uri.starts_with(route.as_str()))
            .max_by_key(|route| route.len())
            .map(String::as_str)
    }

    fn location(&self, route: Option<&str>) -> Option<&Location> {
        route.and_then(|r| self.locations.get(r))
    }

    pub fn root_for(&self, route: Option<&str>) -> &Utf8Path {
        match self.location(route).and_then(|l| l.root.as_deref()) {
            Some(root) => root,
            None => &self.root,
        }
    }

    pub fn index_for(&self, route: Option<&str>) -> &[String] {
        match self.location(route) {
            Some(l) if !l.index.is_empty() => &l.index,
            _ => &self.index,
        }
    }

    pub fn autoindex_for(&self, route: Option<&str>) -> bool {
        match self.location(route).map(|l| l.autoindex) {
            Some(Autoindex::On) => true,
            Some(Autoindex::Off) => false,
            _ => self.autoindex == Autoindex::On,
        }
    }

    pub fn body_limit_for(&self, route: Option<&str>) -> i64 {
        self.location(route)
            .and_then(|l| l.client_max_body_size)
            .or(self.client_max_body_size)
            .unwrap_or(DEFAULT_BODY_LIMIT)
    }

    /// The method set permitted at `route`: the location's `limit_except`
    /// when one is configured, the server-wide set otherwise.
    pub fn methods_for(&self, route: Option<&str>) -> &BTreeSet<Method> {
        match self.location(route) {
            Some(l) if !l.limit_except.is_empty() => &l.limit_except,
            _ => &self.methods,
        }
    }

    pub fn error_pages_for(&self, route: Option<&str>) -> &BTreeMap<u16, Utf8PathBuf> {
        match self.location(route) {
            Some(l) if !l.error_pages.is_empty() => &l.error_pages,
            _ => &self.error_pages,
        }
    }

    pub fn upload_store_for(&self, route: Option<&str>) -> Option<&Utf8Path> {
        self.location(route)
            .and_then(|l| l.upload_store.as_deref())
            .or(self.upload_store.as_deref())
    }

    pub fn return_for(&self, route: Option<&str>) -> Option<&(u16, String)> {
        self.location(route)
            .and_then(|l| l.return_to.as_ref())
            .or(self.return_to.as_ref())
    }

    pub fn cgi_ext_for(&self, route: Option<&str>) -> Option<&str> {
        self.location(route)
            .and_then(|l| l.cgi_ext.as_deref())
            .or(self.cgi_ext.as_deref())
    }
}

/// Parses a size with an optional `k`/`m`/`g` suffix, rejecting values that
/// would overflow a signed 64-bit byte count.
pub fn parse_size(input: &str) -> Result<i64> {
    let invalid = || Error::Config(format!("invalid size '{input}'"));

    if input.is_empty() {
        return Err(invalid());
    }

    let (digits, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_digit() => (input, 1),
        Some('k') | Some('K') => (&input[..input.len() - 1], KB),
        Some('m') | Some('M') => (&input[..input.len() - 1], MB),
        Some('g') | Some('G') => (&input[..input.len() - 1], GB),
        _ => return Err(invalid()),
    };

    let value: i64 = digits.parse().map_err(|_| invalid())?;
    if value < 0 {
        return Err(invalid());
    }
    value
        .checked_mul(unit)
        .ok_or_else(|| Error::Config(format!("size '{input}' overflows")))
}

/// Rejects server sets where two servers share an exact (address, name) pair.
pub fn ensure_unique(servers: &[ServerConfig]) -> Result<()> {
    // A server with no names still claims the bare address.
    let nameless = [String::new()];
    let mut seen = BTreeSet::new();
    for server in servers {
        let names = if server.server_names.is_empty() {
            &nameless[..]
        } else {
            &server.server_names[..]
        };
        for listen in &server.listens {
            for name in names {
                if !seen.insert((listen.clone(), name.clone())) {
                    return Err(Error::Config(format!(
                        "duplicate virtual server {}:{} '{name}'",
                        listen.ip, listen.port
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_locations(routes: &[&str]) -> ServerConfig {
        let mut server = ServerConfig {
            root: Utf8PathBuf::from("/var/www"),
            ..ServerConfig::default()
        };
        for route in routes {
            server
                .locations
                .insert(route.to_string(), Location::default());
        }
        server
    }

    #[test]
    fn longest_prefix_wins() {
        let server = server_with_locations(&["/", "/files", "/files/img"]);

        assert_eq!(server.matched_route("/files/img/a.png"), Some("/files/img"));
        assert_eq!(server.matched_route("/files/a.txt"), Some("/files"));
        assert_eq!(server.matched_route("/other"), Some("/"));
    }

    #[test]
    fn unmatched_uri_uses_bare_server() {
        let server = server_with_locations(&["/files"]);
        assert_eq!(server.matched_route("/other"), None);
        assert_eq!(server.root_for(None), Utf8Path::new("/var/www"));
    }

    #[test]
    fn location_fields_delegate_when_unset() {
        let mut server = server_with_locations(&["/up"]);
        server.client_max_body_size = Some(2 * MB);
        server.upload_store = Some(Utf8PathBuf::from("/srv/uploads"));

        assert_eq!(server.body_limit_for(Some("/up")), 2 * MB);
        assert_eq!(
            server.upload_store_for(Some("/up")),
            Some(Utf8Path::new("/srv/uploads"))
        );

        let loc = server.locations.get_mut("/up").unwrap();
        loc.client_max_body_size = Some(5 * KB);
        assert_eq!(server.body_limit_for(Some("/up")), 5 * KB);
    }

    #[test]
    fn body_limit_defaults_to_one_mebibyte() {
        let server = ServerConfig::default();
        assert_eq!(server.body_limit_for(None), DEFAULT_BODY_LIMIT);
    }

    #[test]
    fn limit_except_overrides_server_methods() {
        let mut server = server_with_locations(&["/ro"]);
        server
            .locations
            .get_mut("/ro")
            .unwrap()
            .limit_except
            .insert(Method::Get);

        assert!(server.methods_for(Some("/ro")).contains(&Method::Get));
        assert!(!server.methods_for(Some("/ro")).contains(&Method::Post));
        assert!(server.methods_for(None).contains(&Method::Post));
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("8k").unwrap(), 8 * KB);
        assert_eq!(parse_size("1m").unwrap(), MB);
        assert_eq!(parse_size("2G").unwrap(), 2 * GB);
    }

    #[test]
    fn size_overflow_is_rejected() {
        assert!(parse_size("9223372036854775807g").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("12x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn duplicate_virtual_servers_are_rejected() {
        let mut a = ServerConfig {
            root: Utf8PathBuf::from("/a"),
            ..ServerConfig::default()
        };
        a.listens.push(ListenAddr::new("127.0.0.1", "8080"));
        a.server_names.push("site".to_string());

        let mut b = a.clone();
        b.root = Utf8PathBuf::from("/b");

        assert!(ensure_unique(&[a.clone()]).is_ok());
        assert!(ensure_unique(&[a, b]).is_err());
    }

    #[test]
    fn wildcard_detection() {
        assert!(ListenAddr::new("0.0.0.0", "80").is_wildcard());
        assert!(ListenAddr::new("", "80").is_wildcard());
        assert!(!ListenAddr::new("127.0.0.1", "80").is_wildcard());
    }
}
