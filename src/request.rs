//! HTTP/1.1 request parsing.
//!
//! The parser is a single strict pass over a fully-buffered request. It never
//! fails with a Rust error; malformed input is reported as the 4xx/5xx status
//! the response pipeline should answer with.

use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;

use crate::status;

/// Longest accepted percent-decoded request target.
pub const MAX_URI_LEN: usize = 8192;

/// Bytes that are never valid in a decoded request target.
const FORBIDDEN_URI_BYTES: &[u8] = b"<>\"`{}|\\^";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    #[default]
    Unknown,
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// The subset of recognized methods this server actually serves.
    pub fn is_implemented(self) -> bool {
        matches!(self, Method::Get | Method::Post | Method::Delete)
    }
}

/// A parsed request. Header keys are stored lowercased; values keep their
/// insertion order within a key. `decoded_uri` is the percent-decoded path
/// component of the target, without the query tail.
#[derive(Debug, Default)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub decoded_uri: String,
    pub version: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Returns the first value of `name` (matched case-insensitively).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Returns every value of `name`, in insertion order.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The `Host` header with any `:port` suffix stripped.
    pub fn hostname(&self) -> &str {
        let host = self.header("host").unwrap_or("");
        host.split(':').next().unwrap_or("")
    }
}

/// Parses `input` into a request and the status the response should carry.
/// Any status other than 200 means parsing stopped early.
pub fn parse(input: &[u8]) -> (Request, u16) {
    let mut request = Request::default();
    let status = parse_into(&mut request, input);
    (request, status)
}

fn parse_into(request: &mut Request, input: &[u8]) -> u16 {
    if input.is_empty() || !input.iter().any(|b| matches!(b, b'\r' | b'\n' | b'\t')) {
        return status::BAD_REQUEST;
    }

    let (head, body) = match find(input, b"\r\n\r\n") {
        Some(pos) => (&input[..pos], &input[pos + 4..]),
        None => (input, &input[..0]),
    };

    let head = String::from_utf8_lossy(head);
    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

    let request_line = lines.next().unwrap_or("");
    let line_status = parse_request_line(request, request_line);
    if line_status != status::OK {
        return line_status;
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return status::BAD_REQUEST;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().replace('\0', "");
        request.headers.entry(name).or_default().push(value);
    }

    parse_query(request);
    request.body = body.to_vec();

    status::OK
}

fn parse_request_line(request: &mut Request, line: &str) -> u16 {
    if line.starts_with(|c: char| c.is_whitespace()) {
        return status::BAD_REQUEST;
    }

    let mut parts = line.split_whitespace();

    let method_token = parts.next().unwrap_or("");
    if method_token.is_empty() {
        return status::METHOD_NOT_ALLOWED;
    }
    let method = Method::from_token(method_token);
    if method == Method::Unknown {
        return status::NOT_IMPLEMENTED;
    }
    if !method.is_implemented() {
        return status::METHOD_NOT_ALLOWED;
    }

    let target = parts.next().unwrap_or("");
    // The query tail is split off before decoding; it is parsed separately
    // into the query multimap and is never part of the decoded path.
    let path_part = target.split_once('?').map_or(target, |(path, _)| path);
    let Ok(decoded) = percent_decode_str(path_part).decode_utf8() else {
        return status::BAD_REQUEST;
    };
    let decoded = decoded.into_owned();
    if decoded.is_empty() || !uri_is_valid(&decoded) {
        return status::BAD_REQUEST;
    }
    if decoded.len() > MAX_URI_LEN {
        return status::URI_TOO_LONG;
    }

    let version = parts.next().unwrap_or("");
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return status::HTTP_VERSION_NOT_SUPPORTED;
    }

    request.method = method;
    request.uri = target.to_string();
    request.decoded_uri = decoded;
    request.version = version.to_string();

    status::OK
}

fn uri_is_valid(decoded: &str) -> bool {
    decoded.starts_with('/')
        && !decoded
            .bytes()
            .any(|b| b < 0x20 || b == 0x7f || FORBIDDEN_URI_BYTES.contains(&b))
}

/// Splits the raw target on `?` and feeds the tail through the urlencoded
/// parser, preserving pair order.
fn parse_query(request: &mut Request) {
    let Some((_, tail)) = request.uri.split_once('?') else {
        return;
    };
    for (key, value) in form_urlencoded::parse(tail.as_bytes()) {
        request.query.push((key.into_owned(), value.into_owned()));
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
