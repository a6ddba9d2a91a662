//! Loader for the nginx-style configuration file.
//!
//! The grammar is a flat sequence of `server { ... }` blocks holding
//! `;`-terminated directives and `location <route> { ... }` sub-blocks.
//! `#` starts a comment that runs to the end of the line.

use super::{parse_size, Autoindex, ListenAddr, Location, ServerConfig};
use crate::error::{Error, Result};
use crate::request::Method;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Reads and parses the configuration file at `path`.
pub fn load(path: &Utf8Path) -> Result<Vec<ServerConfig>> {
    let source = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {path}: {e}")))?;
    parse(&source)
}

/// Parses configuration text into the server set.
pub fn parse(source: &str) -> Result<Vec<ServerConfig>> {
    let tokens = tokenize(source);
    if tokens.is_empty() {
        return Err(Error::Config("config file is empty".to_string()));
    }

    let mut servers = Vec::new();
    let mut cursor = tokens.iter().peekable();

    while let Some(token) = cursor.next() {
        if token != "server" {
            return Err(Error::Config(format!("expected 'server', found '{token}'")));
        }
        expect(&mut cursor, "{")?;
        servers.push(parse_server(&mut cursor)?);
    }

    Ok(servers)
}

type Cursor<'a> = std::iter::Peekable<std::slice::Iter<'a, String>>;

/// Splits the source into words, treating `{`, `}` and `;` as standalone
/// tokens even when glued to a word.
fn tokenize(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    for line in source.lines() {
        let line = line.split('#').next().unwrap_or("");
        for c in line.chars() {
            match c {
                '{' | '}' | ';' => {
                    if !word.is_empty() {
                        tokens.push(std::mem::take(&mut word));
                    }
                    tokens.push(c.to_string());
                }
                c if c.is_whitespace() => {
                    if !word.is_empty() {
                        tokens.push(std::mem::take(&mut word));
                    }
                }
                c => word.push(c),
            }
        }
        if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }

    tokens
}

fn expect(cursor: &mut Cursor, expected: &str) -> Result<()> {
    match cursor.next() {
        Some(t) if t == expected => Ok(()),
        Some(t) => Err(Error::Config(format!(
            "expected '{expected}', found '{t}'"
        ))),
        None => Err(Error::Config(format!(
            "expected '{expected}', found end of file"
        ))),
    }
}

/// Collects the argument tokens of one directive up to the closing `;`.
fn directive_args(cursor: &mut Cursor) -> Result<Vec<String>> {
    let mut args = Vec::new();
    loop {
        match cursor.next() {
            Some(t) if t == ";" => return Ok(args),
            Some(t) if t == "{" || t == "}" => {
                return Err(Error::Config(format!("unexpected '{t}' in directive")))
            }
            Some(t) => args.push(t.clone()),
            None => return Err(Error::Config("unterminated directive".to_string())),
        }
    }
}

fn parse_server(cursor: &mut Cursor) -> Result<ServerConfig> {
    let mut server = ServerConfig::default();

    loop {
        let Some(token) = cursor.next() else {
            return Err(Error::Config("unterminated server block".to_string()));
        };

        match token.as_str() {
            "}" => break,
            "location" => {
                let Some(route) = cursor.next() else {
                    return Err(Error::Config("location block missing route".to_string()));
                };
                if route == "{" {
                    return Err(Error::Config("location block missing route".to_string()));
                }
                expect(cursor, "{")?;
                let location = parse_location(cursor)?;
                if server.locations.insert(route.clone(), location).is_some() {
                    return Err(Error::Config(format!("duplicate location '{route}'")));
                }
            }
            name => {
                let args = directive_args(cursor)?;
                apply_server_directive(&mut server, name, &args)?;
            }
        }
    }

    if server.root.as_str().is_empty() {
        return Err(Error::Config("server block has no root".to_string()));
    }
    Ok(server)
}

fn parse_location(cursor: &mut Cursor) -> Result<Location> {
    let mut location = Location::default();

    loop {
        let Some(token) = cursor.next() else {
            return Err(Error::Config("unterminated location block".to_string()));
        };
        match token.as_str() {
            "}" => return Ok(location),
            "location" => {
                return Err(Error::Config("nested location blocks are not supported".to_string()))
            }
            name => {
                let args = directive_args(cursor)?;
                apply_location_directive(&mut location, name, &args)?;
            }
        }
    }
}

fn apply_server_directive(server: &mut ServerConfig, name: &str, args: &[String]) -> Result<()> {
    if args.is_empty() {
        return Err(Error::Config(format!("directive '{name}' has no arguments")));
    }
    match name {
        "listen" => {
            for arg in args {
                server.listens.push(parse_listen(arg)?);
            }
        }
        "server_name" => server.server_names.extend(args.iter().cloned()),
        "client_max_body_size" => {
            one_arg(name, args)?;
            if server.client_max_body_size.is_some() {
                return Err(already_set(name));
            }
            server.client_max_body_size = Some(parse_size(&args[0])?);
        }
        "error_page" => parse_error_page(&mut server.error_pages, args)?,
        "root" => {
            one_arg(name, args)?;
            if !server.root.as_str().is_empty() {
                return Err(already_set(name));
            }
            server.root = Utf8PathBuf::from(&args[0]);
        }
        "index" => server.index.extend(args.iter().cloned()),
        "autoindex" => {
            one_arg(name, args)?;
            server.autoindex = parse_autoindex(server.autoindex, &args[0])?;
        }
        "upload_store" => {
            one_arg(name, args)?;
            if server.upload_store.is_some() {
                return Err(already_set(name));
            }
            server.upload_store = Some(Utf8PathBuf::from(&args[0]));
        }
        "return" => {
            if server.return_to.is_some() {
                return Err(already_set(name));
            }
            server.return_to = Some(parse_return(args)?);
        }
        "cgi_ext" => {
            one_arg(name, args)?;
            if server.cgi_ext.is_some() {
                return Err(already_set(name));
            }
            server.cgi_ext = Some(args[0].clone());
        }
        _ => return Err(Error::Config(format!("unknown directive '{name}'"))),
    }
    Ok(())
}

fn apply_location_directive(location: &mut Location, name: &str, args: &[String]) -> Result<()> {
    if args.is_empty() {
        return Err(Error::Config(format!("directive '{name}' has no arguments")));
    }
    match name {
        "root" => {
            one_arg(name, args)?;
            if location.root.is_some() {
                return Err(already_set(name));
            }
            location.root = Some(Utf8PathBuf::from(&args[0]));
        }
        "index" => location.index.extend(args.iter().cloned()),
        "autoindex" => {
            one_arg(name, args)?;
            location.autoindex = parse_autoindex(location.autoindex, &args[0])?;
        }
        "client_max_body_size" => {
            one_arg(name, args)?;
            if location.client_max_body_size.is_some() {
                return Err(already_set(name));
            }
            location.client_max_body_size = Some(parse_size(&args[0])?);
        }
        "limit_except" => {
            if !location.limit_except.is_empty() {
                return Err(already_set(name));
            }
            for arg in args {
                let method = Method::from_token(arg);
                if method == Method::Unknown {
                    return Err(Error::Config(format!(
                        "invalid method '{arg}' in limit_except"
                    )));
                }
                location.limit_except.insert(method);
            }
        }
        "error_page" => parse_error_page(&mut location.error_pages, args)?,
        "upload_store" => {
            one_arg(name, args)?;
            if location.upload_store.is_some() {
                return Err(already_set(name));
            }
            location.upload_store = Some(Utf8PathBuf::from(&args[0]));
        }
        "return" => {
            if location.return_to.is_some() {
                return Err(already_set(name));
            }
            location.return_to = Some(parse_return(args)?);
        }
        "cgi_ext" => {
            one_arg(name, args)?;
            if location.cgi_ext.is_some() {
                return Err(already_set(name));
            }
            location.cgi_ext = Some(args[0].clone());
        }
        _ => return Err(Error::Config(format!("unknown directive '{name}'"))),
    }
    Ok(())
}

fn one_arg(name: &str, args: &[String]) -> Result<()> {
    if args.len() != 1 {
        return Err(Error::Config(format!(
            "directive '{name}' takes exactly one argument"
        )));
    }
    Ok(())
}

fn already_set(name: &str) -> Error {
    Error::Config(format!("directive '{name}' is already set"))
}

/// Accepts `ip:port`, a bare port, or a bare ip. Missing parts default to
/// `0.0.0.0` and `80`.
fn parse_listen(value: &str) -> Result<ListenAddr> {
    let (mut ip, mut port) = match value.split_once(':') {
        Some((ip, port)) => {
            if ip.is_empty() || port.is_empty() {
                return Err(Error::Config(format!("invalid listen '{value}'")));
            }
            (ip.to_string(), port.to_string())
        }
        None if value.bytes().all(|b| b.is_ascii_digit()) && !value.is_empty() => {
            (String::new(), value.to_string())
        }
        None => (value.to_string(), String::new()),
    };

    if ip.is_empty() {
        ip = "0.0.0.0".to_string();
    }
    if port.is_empty() {
        port = "80".to_string();
    }

    if !ip_is_valid(&ip) {
        return Err(Error::Config(format!("invalid listen ip '{ip}'")));
    }
    if !port_is_valid(&port) {
        return Err(Error::Config(format!("invalid listen port '{port}'")));
    }

    Ok(ListenAddr::new(ip, port))
}

fn ip_is_valid(ip: &str) -> bool {
    if ip == "0.0.0.0" || ip == "localhost" {
        return true;
    }
    let segments: Vec<&str> = ip.split('.').collect();
    segments.len() == 4
        && segments.iter().all(|seg| {
            !seg.is_empty()
                && seg.len() <= 3
                && seg.bytes().all(|b| b.is_ascii_digit())
                && seg.parse::<u16>().is_ok_and(|n| n <= 255)
        })
}

fn port_is_valid(port: &str) -> bool {
    port.bytes().all(|b| b.is_ascii_digit()) && port.parse::<u32>().is_ok_and(|n| n <= 65535)
}

/// `error_page <code>... <page>` — every code must lie in [300, 599].
fn parse_error_page(
    pages: &mut std::collections::BTreeMap<u16, Utf8PathBuf>,
    args: &[String],
) -> Result<()> {
    if args.len() < 2 {
        return Err(Error::Config("invalid error_page directive".to_string()));
    }
    let page = Utf8PathBuf::from(args.last().map(String::as_str).unwrap_or_default());
    for code in &args[..args.len() - 1] {
        let code: u16 = code
            .parse()
            .map_err(|_| Error::Config(format!("invalid error_page code '{code}'")))?;
        if !(300..=599).contains(&code) {
            return Err(Error::Config(format!(
                "error_page code '{code}' outside [300, 599]"
            )));
        }
        pages.insert(code, page.clone());
    }
    Ok(())
}

/// `return <code> <target>` — the code must lie in [0, 999].
fn parse_return(args: &[String]) -> Result<(u16, String)> {
    if args.len() != 2 {
        return Err(Error::Config("invalid return directive".to_string()));
    }
    let code: u16 = args[0]
        .parse()
        .map_err(|_| Error::Config(format!("invalid return code '{}'", args[0])))?;
    if code > 999 {
        return Err(Error::Config(format!(
            "return code '{code}' outside [0, 999]"
        )));
    }
    Ok((code, args[1].clone()))
}

fn parse_autoindex(current: Autoindex, value: &str) -> Result<Autoindex> {
    if current != Autoindex::Unset && current != Autoindex::Off {
        return Err(already_set("autoindex"));
    }
    match value {
        "on" => Ok(Autoindex::On),
        "off" => Ok(Autoindex::Off),
        _ => Err(Error::Config(format!("invalid autoindex value '{value}'"))),
    }
}
