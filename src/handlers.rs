//! Response pipelines.
//!
//! Handling a request is one of four pipelines (GET, POST, DELETE, error),
//! each a [`Handler`] that consumes its inputs and produces the final
//! [`Response`]. Dispatch happens here, after the virtual server has been
//! resolved: the location route is matched once and handed to the pipeline.

mod delete;
mod error;
mod get;
mod post;

pub use delete::DeletePipeline;
pub use error::{error_response, ErrorPipeline};
pub use get::GetPipeline;
pub use post::PostPipeline;

use crate::cgi;
use crate::config::ServerConfig;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::status;
use camino::{Utf8Path, Utf8PathBuf};

/// One response pipeline. Running it consumes the pipeline and always yields
/// a complete, well-formed response.
pub trait Handler {
    fn run(self) -> Response;
}

/// Routes a parsed request through the matching pipeline.
///
/// A non-200 `parse_status` short-circuits into the error pipeline. Methods
/// outside {GET, POST, DELETE} answer 405. A configured `return` directive
/// takes precedence over any filesystem work.
pub fn dispatch(
    server: &ServerConfig,
    request: &Request,
    parse_status: u16,
    storage_size: &mut u64,
) -> Response {
    let route = server.matched_route(&request.decoded_uri);

    if parse_status != status::OK {
        return ErrorPipeline::new(server, route, parse_status).run();
    }

    if let Some((code, target)) = server.return_for(route) {
        return return_response(*code, target);
    }

    match request.method {
        Method::Get => GetPipeline::new(server, request, route).run(),
        Method::Post => PostPipeline::new(server, request, route).run(),
        Method::Delete => DeletePipeline::new(server, request, route, storage_size).run(),
        _ => ErrorPipeline::new(server, route, status::METHOD_NOT_ALLOWED).run(),
    }
}

/// Answer for a `return` directive: redirect codes carry a `Location`
/// header, anything else carries the target text as the body.
fn return_response(code: u16, target: &str) -> Response {
    let response = if (300..400).contains(&code) {
        Response::new(code).set_header("Location", target)
    } else {
        Response::new(code)
            .set_header("Content-Type", "text/plain")
            .set_body(target.as_bytes().to_vec())
    };
    response.with_common_headers()
}

/// Resolution of a decoded URI onto the filesystem.
#[derive(Debug)]
pub(crate) enum ResolvedPath {
    /// The canonical target, confined to the effective root.
    Found(Utf8PathBuf),
    /// Nothing exists at the candidate path (or the root itself is gone).
    NotFound,
    /// The path resolves outside the effective root.
    Escapes,
}

/// Maps the decoded URI onto the filesystem: the effective root joined with
/// the URI tail left after stripping the matched route. Both the root and
/// the candidate are canonicalized, and a candidate whose canonical form
/// leaves the root is refused, so a `..`-laden path can never reach a file,
/// script, or delete target outside the root.
pub(crate) fn resolve_path(
    server: &ServerConfig,
    route: Option<&str>,
    decoded_uri: &str,
) -> ResolvedPath {
    let Ok(base) = server.root_for(route).canonicalize_utf8() else {
        return ResolvedPath::NotFound;
    };

    let tail = route
        .and_then(|r| decoded_uri.strip_prefix(r))
        .unwrap_or(decoded_uri);
    let tail = tail.trim_start_matches('/');

    match base.join(tail).canonicalize_utf8() {
        Ok(resolved) if resolved.starts_with(&base) => ResolvedPath::Found(resolved),
        Ok(_) => ResolvedPath::Escapes,
        // The target does not exist, so there is nothing to canonicalize;
        // still refuse dot-dot segments so a missing path cannot probe
        // outside the root.
        Err(_) if tail.split('/').any(|segment| segment == "..") => ResolvedPath::Escapes,
        Err(_) => ResolvedPath::NotFound,
    }
}

pub(crate) fn is_cgi(server: &ServerConfig, route: Option<&str>, path: &Utf8Path) -> bool {
    server
        .cgi_ext_for(route)
        .is_some_and(|ext| path.as_str().ends_with(ext))
}

/// Runs the script and folds its output into a response. CGI headers never
/// overwrite ones the server already set; a `Status` pseudo-header selects
/// the response code instead of being forwarded.
pub(crate) fn cgi_response(
    server: &ServerConfig,
    route: Option<&str>,
    request: &Request,
    script: &Utf8Path,
) -> Response {
    match cgi::execute(request, script) {
        Ok(output) => {
            let mut response = Response::new(status::OK).set_body(output.body);
            for (name, value) in output.headers {
                if name.eq_ignore_ascii_case("status") {
                    if let Some(code) = value
                        .split_whitespace()
                        .next()
                        .and_then(|c| c.parse::<u16>().ok())
                    {
                        response.status = code;
                    }
                    continue;
                }
                if name.eq_ignore_ascii_case("content-length") {
                    continue;
                }
                response.insert_header_if_absent(&name, value);
            }
            response.with_common_headers()
        }
        Err(code) => error_response(server, route, code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Location;
    use crate::request;
    use assert_matches::assert_matches;

    fn server_at(root: &str) -> ServerConfig {
        ServerConfig {
            root: Utf8PathBuf::from(root),
            ..ServerConfig::default()
        }
    }

    fn temp_server() -> (tempfile::TempDir, ServerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let server = ServerConfig {
            root,
            ..ServerConfig::default()
        };
        (dir, server)
    }

    #[test]
    fn path_resolution_joins_root_and_uri() {
        let (_guard, server) = temp_server();
        std::fs::create_dir(server.root.join("a")).unwrap();
        std::fs::write(server.root.join("a/b.txt"), "x").unwrap();

        let resolved = resolve_path(&server, None, "/a/b.txt");
        assert_matches!(resolved, ResolvedPath::Found(ref path) if path.ends_with("a/b.txt"));
    }

    #[test]
    fn missing_target_resolves_not_found() {
        let (_guard, server) = temp_server();
        assert_matches!(
            resolve_path(&server, None, "/nothing.txt"),
            ResolvedPath::NotFound
        );
    }

    #[test]
    fn traversal_out_of_the_root_is_refused() {
        let (_guard, server) = temp_server();

        assert_matches!(
            resolve_path(&server, None, "/../../etc/passwd"),
            ResolvedPath::Escapes
        );
        // A dot-dot path that resolves to nothing is refused too.
        assert_matches!(
            resolve_path(&server, None, "/../no-such-file-anywhere"),
            ResolvedPath::Escapes
        );
    }

    #[test]
    fn dot_dot_segments_that_stay_inside_the_root_are_allowed() {
        let (_guard, server) = temp_server();
        std::fs::create_dir(server.root.join("sub")).unwrap();
        std::fs::write(server.root.join("top.txt"), "x").unwrap();

        let resolved = resolve_path(&server, None, "/sub/../top.txt");
        assert_matches!(resolved, ResolvedPath::Found(ref path) if path.ends_with("top.txt"));
    }

    #[test]
    fn matched_route_prefix_is_stripped() {
        let (_guard, mut server) = temp_server();
        let files_dir = tempfile::tempdir().unwrap();
        let files_root = Utf8PathBuf::from_path_buf(files_dir.path().to_path_buf()).unwrap();
        std::fs::write(files_root.join("a.txt"), "x").unwrap();

        server.locations.insert(
            "/files".to_string(),
            Location {
                root: Some(files_root.clone()),
                ..Location::default()
            },
        );

        let resolved = resolve_path(&server, Some("/files"), "/files/a.txt");
        let base = files_root.canonicalize_utf8().unwrap();
        assert_matches!(resolved, ResolvedPath::Found(ref path) if path.starts_with(&base));
    }

    #[test]
    fn cgi_extension_matches_on_suffix() {
        let mut server = server_at("/var/www");
        server.cgi_ext = Some(".py".to_string());

        assert!(is_cgi(&server, None, Utf8Path::new("/var/www/app.py")));
        assert!(!is_cgi(&server, None, Utf8Path::new("/var/www/app.pyc")));
        assert!(!is_cgi(&server, None, Utf8Path::new("/var/www/app.html")));
    }

    #[test]
    fn unimplemented_method_dispatches_to_405() {
        let server = server_at("/var/www");
        let (req, st) = request::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(st, status::OK);

        let mut req = req;
        req.method = Method::Put;
        let mut storage = 0;
        let response = dispatch(&server, &req, status::OK, &mut storage);
        assert_eq!(response.status, status::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn return_directive_redirects() {
        let mut server = server_at("/var/www");
        server.return_to = Some((301, "/moved".to_string()));

        let (req, st) = request::parse(b"GET /old HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut storage = 0;
        let response = dispatch(&server, &req, st, &mut storage);

        assert_eq!(response.status, 301);
        assert_eq!(response.header("Location"), Some("/moved"));
    }

    #[test]
    fn non_redirect_return_carries_the_text() {
        let mut server = server_at("/var/www");
        server.return_to = Some((200, "pong".to_string()));

        let (req, st) = request::parse(b"GET /ping HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut storage = 0;
        let response = dispatch(&server, &req, st, &mut storage);

        assert_eq!(response.status, 200);
        assert_eq!(response.body(), b"pong");
    }
}
