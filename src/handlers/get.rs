//! The GET pipeline: static files, index lookup, and directory listings.

use super::{cgi_response, error_response, is_cgi, resolve_path, Handler, ResolvedPath};
use crate::config::ServerConfig;
use crate::request::{Method, Request};
use crate::response::{http_date, parse_http_date, Response};
use crate::status;
use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use jiff::Timestamp;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fs;
use std::io;

/// Bytes escaped in autoindex hrefs, so that decoding an emitted link gives
/// back exactly the entry name.
const HREF_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'%')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^');

pub struct GetPipeline<'a> {
    server: &'a ServerConfig,
    request: &'a Request,
    route: Option<&'a str>,
}

impl<'a> GetPipeline<'a> {
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

    fn serve_file(&self, path: &Utf8Path) -> Response {
        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(e) => return self.fail(io_status(&e)),
        };
        let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();

        // A client revalidating with If-Modified-Since gets 304 when the
        // file has not changed since the date it already holds.
        if let Some(since) = self.request.header("if-modified-since") {
            if let Some(received) = parse_http_date(since) {
                if mtime <= received {
                    return Response::new(status::NOT_MODIFIED).with_common_headers();
                }
            }
        }

        let body = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(io_status(&e)),
        };

        let mut response = Response::new(status::OK)
            .set_header("Content-Type", extension_to_mime(path.extension()))
            .set_body(body);
        if let Ok(ts) = Timestamp::from_second(mtime) {
            response = response.set_header("Last-Modified", http_date(ts));
        }

        if self.is_download() {
            let filename = match path.file_name() {
                Some(name) => name.to_string(),
                None => "download".to_string(),
            };
            response = response.set_header(
                "Content-Disposition",
                format!("attachment; filename=\"{filename}\""),
            );
        }

        response.with_common_headers()
    }

    fn is_download(&self) -> bool {
        self.request
            .decoded_uri
            .split('/')
            .any(|segment| segment == "download")
    }

    fn serve_directory(&self, path: &Utf8Path) -> Response {
        for index in self.server.index_for(self.route) {
            let candidate = path.join(index);
            if candidate.is_file() {
                return self.serve_file(&candidate);
            }
        }

        if !self.server.autoindex_for(self.route) {
            return self.fail(status::FORBIDDEN);
        }

        match directory_listing(path, &self.request.decoded_uri) {
            Ok(html) => Response::new(status::OK)
                .set_header("Content-Type", "text/html")
                .set_body(html.into_bytes())
                .with_common_headers(),
            Err(_) => self.fail(status::INTERNAL_SERVER_ERROR),
        }
    }
}

impl Handler for GetPipeline<'_> {
    fn run(self) -> Response {
        if !self.server.methods_for(self.route).contains(&Method::Get) {
            return self.fail(status::METHOD_NOT_ALLOWED);
        }

        let path = match resolve_path(self.server, self.route, &self.request.decoded_uri) {
            ResolvedPath::Found(path) => path,
            ResolvedPath::NotFound => return self.fail(status::NOT_FOUND),
            ResolvedPath::Escapes => return self.fail(status::FORBIDDEN),
        };

        if is_cgi(self.server, self.route, &path) {
            return cgi_response(self.server, self.route, self.request, &path);
        }

        if path.is_dir() {
            self.serve_directory(&path)
        } else {
            self.serve_file(&path)
        }
    }
}

fn io_status(error: &io::Error) -> u16 {
    match error.kind() {
        io::ErrorKind::NotFound => status::NOT_FOUND,
        io::ErrorKind::PermissionDenied => status::FORBIDDEN,
        _ => status::INTERNAL_SERVER_ERROR,
    }
}

/// Renders the generated listing for `uri`: one row per entry with its name,
/// last-modified date, and size.
fn directory_listing(path: &Utf8Path, uri: &str) -> io::Result<String> {
    let mut names: Vec<Utf8PathBuf> = Vec::new();
    for entry in path.read_dir_utf8()? {
        names.push(entry?.path().to_path_buf());
    }
    names.sort();

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head><title>Index of ");
    html.push_str(uri);
    html.push_str("</title></head>\n<body>\n<h1>Index of ");
    html.push_str(uri);
    html.push_str("</h1>\n<hr>\n<table>\n");
    html.push_str("<tr><th>Name</th><th>Last modified</th><th>Size</th></tr>\n");

    for entry in &names {
        let Some(name) = entry.file_name() else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };

        let display = if metadata.is_dir() {
            format!("{name}/")
        } else {
            name.to_string()
        };
        let href = utf8_percent_encode(&display, HREF_ESCAPES).to_string();

        let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
        let modified = Timestamp::from_second(mtime)
            .map(http_date)
            .unwrap_or_default();
        let size = if metadata.is_dir() {
            "-".to_string()
        } else {
            metadata.len().to_string()
        };

        html.push_str(&format!(
            "<tr><td><a href=\"{href}\">{display}</a></td><td>{modified}</td><td>{size}</td></tr>\n"
        ));
    }

    html.push_str("</table>\n<hr>\n</body>\n</html>\n");
    Ok(html)
}


/// Returns the mime type of a file based on its extension.
fn extension_to_mime(extension: Option<&str>) -> &'static str {
    match extension {
        Some("avif") => "image/avif",
        Some("bin") => "application/octet-stream",
        Some("bmp") => "image/bmp",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("gif") => "image/gif",
        Some("gz") => "application/x-gzip",
        Some("htm") => "text/html",
        Some("html") => "text/html",
        Some("ico") => "image/x-icon",
        Some("jpeg") => "image/jpeg",
        Some("jpg") => "image/jpeg",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("md") => "text/markdown",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("ogg") => "application/ogg",
        Some("otf") => "application/x-font-opentype",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("sh") => "application/x-sh",
        Some("svg") => "image/svg+xml",
        Some("tar") => "application/x-tar",
        Some("tif") => "image/tiff",
        Some("tiff") => "image/tiff",
        Some("ttf") => "application/x-font-ttf",
        Some("txt") => "text/plain",
        Some("wasm") => "application/wasm",
        Some("wav") => "audio/wav",
        Some("webm") => "video/webm",
        Some("webp") => "image/webp",
        Some("woff") => "application/font-woff",
        Some("woff2") => "application/font-woff2",
        Some("xhtml") => "application/xhtml+xml",
        Some("xml") => "application/xml",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
