//! Error responses: configured error pages with a synthesized fallback.

use super::Handler;
use crate::config::ServerConfig;
use crate::response::Response;
use crate::status;
use std::fs;

pub struct ErrorPipeline<'a> {
    server: &'a ServerConfig,
    route: Option<&'a str>,
    code: u16,
}

impl<'a> ErrorPipeline<'a> {
    pub fn new(server: &'a ServerConfig, route: Option<&'a str>, code: u16) -> Self {
        Self {
            server,
            route,
            code,
        }
    }
}

impl Handler for ErrorPipeline<'_> {
    fn run(self) -> Response {
        error_response(self.server, self.route, self.code)
    }
}

/// Builds the reply for `code`: the configured error page when one exists
/// and is readable, a minimal HTML page otherwise.
pub fn error_response(server: &ServerConfig, route: Option<&str>, code: u16) -> Response {
    let body = configured_page(server, route, code)
        .unwrap_or_else(|| default_page(code).into_bytes());

    Response::new(code)
        .set_header("Content-Type", "text/html")
        .set_body(body)
        .with_common_headers()
}

/// Error page paths are resolved against the effective root for the route.
fn configured_page(server: &ServerConfig, route: Option<&str>, code: u16) -> Option<Vec<u8>> {
    let page = server.error_pages_for(route).get(&code)?;
    let path = server
        .root_for(route)
        .join(page.as_str().trim_start_matches('/'));
    fs::read(path).ok()
}

fn default_page(code: u16) -> String {
    format!("<h1>{code} {}</h1>", status::reason_phrase(code))
}
