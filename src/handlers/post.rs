//! The POST pipeline: body-size enforcement, multipart uploads, and CGI.

use super::{cgi_response, error_response, is_cgi, resolve_path, Handler, ResolvedPath};
use crate::config::ServerConfig;
use crate::request::{find, Method, Request};
use crate::response::Response;
use crate::status;
use std::collections::BTreeMap;
use std::fs;
use std::io;

pub struct PostPipeline<'a> {
    server: &'a ServerConfig,
    request: &'a Request,
    route: Option<&'a str>,
}

/// One multipart segment: its own header lines plus the raw content.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Part {
    pub headers: BTreeMap<String, String>,
    pub content: Vec<u8>,
}

impl Part {
    /// Extracts a quoted parameter such as `filename="..."` from a header.
    fn parameter(&self, header: &str, name: &str) -> Option<String> {
        let value = self.headers.get(header)?;
        let start = value.find(&format!("{name}=\""))? + name.len() + 2;
        let end = value[start..].find('"')? + start;
        Some(value[start..end].to_string())
    }

    fn filename(&self) -> Option<String> {
        self.parameter("content-disposition", "filename")
    }
}

impl<'a> PostPipeline<'a> {
    pub fn new(server: &'a ServerConfig, request: &'a Request, route: Option<&'a str>) -> Self {
        Self {
            server,
            request,
            route,
        }
    }

    fn fail(&self, code: u16) -> Response {
        error_response(self.server, self.route, code)
    }

    fn upload(&self) -> Response {
        let Some(boundary) = self.boundary() else {
            return self.fail(status::BAD_REQUEST);
        };

        let parts = match parse_multipart(&self.request.body, &boundary) {
            Ok(parts) => parts,
            Err(code) => return self.fail(code),
        };

        let store = self
            .server
            .upload_store_for(self.route)
            .unwrap_or_else(|| self.server.root_for(self.route));

        let mut uploaded = 0;
        for part in &parts {
            let Some(filename) = part.filename() else {
                continue;
            };
            if escapes_store(&filename) {
                return self.fail(status::FORBIDDEN);
            }

            let target = store.join(&filename);
            if let Err(e) = fs::write(&target, &part.content) {
                log::warn!(path = target.as_str(), error:err = e; "upload write failed");
                return self.fail(write_error_status(&e));
            }
            log::info!(path = target.as_str(), bytes = part.content.len(); "upload stored");
            uploaded += 1;
        }

        if uploaded == 0 {
            return self.fail(status::BAD_REQUEST);
        }

        Response::new(status::CREATED)
            .set_header("Content-Type", "text/html")
            .set_body(upload_success_page().into_bytes())
            .with_common_headers()
    }

    /// Reads the boundary parameter out of the `Content-Type` header.
    fn boundary(&self) -> Option<String> {
        let content_type = self.request.header("content-type")?;
        if !content_type.starts_with("multipart/form-data") {
            return None;
        }
        let boundary = content_type.split("boundary=").nth(1)?;
        let boundary = boundary.split(';').next()?.trim();
        let boundary = boundary.trim_matches('"');
        if boundary.is_empty() {
            None
        } else {
            Some(boundary.to_string())
        }
    }
}

impl Handler for PostPipeline<'_> {
    fn run(self) -> Response {
        if !self.server.methods_for(self.route).contains(&Method::Post) {
            return self.fail(status::METHOD_NOT_ALLOWED);
        }

        let limit = self.server.body_limit_for(self.route);
        if self.request.body.len() as i64 > limit {
            return self.fail(status::PAYLOAD_TOO_LARGE);
        }

        match resolve_path(self.server, self.route, &self.request.decoded_uri) {
            ResolvedPath::Found(path) if is_cgi(self.server, self.route, &path) => {
                return cgi_response(self.server, self.route, self.request, &path);
            }
            ResolvedPath::Escapes => return self.fail(status::FORBIDDEN),
            // Upload targets rarely exist beforehand; anything else falls
            // through to the multipart pipeline.
            _ => {}
        }

        self.upload()
    }
}

/// True when the provided file name would land outside the upload store.
fn escapes_store(filename: &str) -> bool {
    filename.starts_with('/') || filename.split('/').any(|segment| segment == "..")
}

fn write_error_status(error: &io::Error) -> u16 {
    if error.raw_os_error() == Some(libc::ENOSPC) {
        status::INSUFFICIENT_STORAGE
    } else {
        status::INTERNAL_SERVER_ERROR
    }
}

fn upload_success_page() -> String {
    "<!DOCTYPE html>\n\
     <html lang=\"en\">\n\
     <head>\n\
     \t<meta charset=\"UTF-8\">\n\
     \t<title>Upload Successful</title>\n\
     </head>\n\
     <body>\n\
     \t<h1>File Uploaded Successfully!</h1>\n\
     \t<p>Your file has been uploaded.</p>\n\
     \t<a href=\"index.html\">Back to Index</a>\n\
     </body>\n\
     </html>\n"
        .to_string()
}

/// Splits `body` into its parts. Segments are delimited by `--boundary`
/// lines and the final `--boundary--` marker; each part is header lines,
/// a blank line, then content.
pub(crate) fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Part>, u16> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut segments = Vec::new();
    let mut rest = body;
    loop {
        match find(rest, delimiter) {
            Some(pos) => {
                segments.push(&rest[..pos]);
                rest = &rest[pos + delimiter.len()..];
            }
            None => {
                segments.push(rest);
                break;
            }
        }
    }

    // The first segment is the preamble; a trailing `--` marks the epilogue.
    if segments.len() < 2 {
        return Err(status::BAD_REQUEST);
    }

    let mut parts = Vec::new();
    for segment in &segments[1..] {
        if segment.starts_with(b"--") {
            break;
        }
        let segment = strip_crlf(segment);
        let Some(split) = find(segment, b"\r\n\r\n") else {
            return Err(status::BAD_REQUEST);
        };

        let mut headers = BTreeMap::new();
        for line in String::from_utf8_lossy(&segment[..split]).lines() {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        parts.push(Part {
            headers,
            content: segment[split + 4..].to_vec(),
        });
    }

    if parts.is_empty() {
        return Err(status::BAD_REQUEST);
    }
    Ok(parts)
}

fn strip_crlf(segment: &[u8]) -> &[u8] {
    let segment = segment.strip_prefix(b"\r\n").unwrap_or(segment);
    segment.strip_suffix(b"\r\n").unwrap_or(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request;
    use camino::{Utf8Path, Utf8PathBuf};

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn server_at(root: &Utf8Path) -> ServerConfig {
        ServerConfig {
            root: root.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn multipart_request(boundary: &str, filename: &str, contents: &str) -> Vec<u8> {
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             {contents}\r\n\
             --{boundary}--\r\n"
        );
        format!(
            "POST /upload HTTP/1.1\r\n\
             Host: a\r\n\
             Content-Type: multipart/form-data; boundary={boundary}\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {body}",
            body.len()
        )
        .into_bytes()
    }

    fn post(server: &ServerConfig, raw: &[u8]) -> Response {
        let (req, st) = request::parse(raw);
        assert_eq!(st, status::OK);
        let route = server.matched_route(&req.decoded_uri);
        PostPipeline::new(server, &req, route).run()
    }

    #[test]
    fn multipart_upload_writes_the_file() {
        let (_guard, root) = temp_root();
        let store = root.join("store");
        fs::create_dir(&store).unwrap();

        let mut server = server_at(&root);
        server.upload_store = Some(store.clone());

        let response = post(&server, &multipart_request("X", "hello.txt", "hi"));

        assert_eq!(response.status, status::CREATED);
        assert_eq!(fs::read(store.join("hello.txt")).unwrap(), b"hi");
    }

    #[test]
    fn upload_without_store_falls_back_to_root() {
        let (_guard, root) = temp_root();
        let server = server_at(&root);

        let response = post(&server, &multipart_request("bnd", "a.txt", "data"));
        assert_eq!(response.status, status::CREATED);
        assert!(root.join("a.txt").is_file());
    }

    #[test]
    fn oversize_body_is_413_and_writes_nothing() {
        let (_guard, root) = temp_root();
        let store = root.join("store");
        fs::create_dir(&store).unwrap();

        let mut server = server_at(&root);
        server.upload_store = Some(store.clone());
        server.client_max_body_size = Some(16);

        let big = "x".repeat(200);
        let response = post(&server, &multipart_request("X", "big.txt", &big));

        assert_eq!(response.status, status::PAYLOAD_TOO_LARGE);
        assert!(!store.join("big.txt").exists());
    }

    #[test]
    fn traversal_in_filename_is_403() {
        let (_guard, root) = temp_root();
        let store = root.join("store");
        fs::create_dir(&store).unwrap();

        let mut server = server_at(&root);
        server.upload_store = Some(store.clone());

        let response = post(&server, &multipart_request("X", "../escape.txt", "no"));
        assert_eq!(response.status, status::FORBIDDEN);
        assert!(!root.join("escape.txt").exists());
    }

    #[test]
    fn traversal_in_the_request_uri_is_403() {
        let (_guard, root) = temp_root();
        let server = server_at(&root);

        let raw = b"POST /../up HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data; boundary=X\r\nContent-Length: 0\r\n\r\n";
        let response = post(&server, raw);
        assert_eq!(response.status, status::FORBIDDEN);
    }

    #[test]
    fn missing_boundary_is_400() {
        let (_guard, root) = temp_root();
        let server = server_at(&root);

        let raw = b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nblob";
        let response = post(&server, raw);
        assert_eq!(response.status, status::BAD_REQUEST);
    }

    #[test]
    fn post_denied_by_limit_except() {
        let (_guard, root) = temp_root();
        let mut server = server_at(&root);
        let mut location = crate::config::Location::default();
        location.limit_except.insert(Method::Get);
        server.locations.insert("/upload".to_string(), location);

        let response = post(&server, &multipart_request("X", "a.txt", "hi"));
        assert_eq!(response.status, status::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn parts_round_trip_through_parse_and_serialize() {
        let boundary = "frontier";
        let original = b"--frontier\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\r\n\x00\x01binary\xff\r\n--frontier--\r\n";

        let parts = parse_multipart(original, boundary).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, b"\x00\x01binary\xff");

        // Re-serialize the part with the same boundary and parse again.
        let mut rebuilt = Vec::new();
        rebuilt.extend_from_slice(b"--frontier\r\n");
        rebuilt.extend_from_slice(
            b"content-disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\r\n",
        );
        rebuilt.extend_from_slice(&parts[0].content);
        rebuilt.extend_from_slice(b"\r\n--frontier--\r\n");

        let reparsed = parse_multipart(&rebuilt, boundary).unwrap();
        assert_eq!(reparsed[0].content, parts[0].content);
        assert_eq!(
            reparsed[0].filename().as_deref(),
            parts[0].filename().as_deref()
        );
    }

    #[test]
    fn multiple_parts_are_all_parsed() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"x\"; filename=\"x.txt\"\r\n\r\nfirst\r\n--B\r\nContent-Disposition: form-data; name=\"y\"\r\n\r\nsecond\r\n--B--\r\n";
        let parts = parse_multipart(body, "B").unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].filename().as_deref(), Some("x.txt"));
        assert_eq!(parts[1].filename(), None);
        assert_eq!(parts[1].content, b"second");
    }

    #[test]
    fn garbage_without_parts_is_400() {
        assert_eq!(parse_multipart(b"just bytes", "B"), Err(status::BAD_REQUEST));
        assert_eq!(parse_multipart(b"--B--\r\n", "B"), Err(status::BAD_REQUEST));
    }
}
