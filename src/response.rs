//! The outbound HTTP response and its wire form.

use crate::status;
use jiff::Timestamp;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = "webserv";

/// RFC 7231 IMF-fixdate layout.
pub const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// The interim reply sent when a client asks for `Expect: 100-continue`.
pub const CONTINUE_INTERIM: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    headers: BTreeMap<String, Vec<String>>,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: status::OK,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Sets the header `key` to a single `value`, replacing prior values.
    pub fn set_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), vec![value.into()]);
        self
    }

    /// Appends one more value for `key`, keeping existing ones.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.entry(key.into()).or_default().push(value.into());
    }

    /// Inserts `key: value` only when no header with that name exists yet,
    /// comparing names case-insensitively.
    pub fn insert_header_if_absent(&mut self, key: &str, value: impl Into<String>) {
        if !self.has_header(key) {
            self.headers.insert(key.to_string(), vec![value.into()]);
        }
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(key))
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Stamps the headers every reply carries: `Server`, `Date`,
    /// `Content-Length`, `Connection: close`, and a `text/html` content type
    /// when no pipeline chose one.
    pub fn with_common_headers(mut self) -> Self {
        self.headers
            .insert("Server".to_string(), vec![SERVER_NAME.to_string()]);
        self.headers
            .insert("Date".to_string(), vec![http_date(Timestamp::now())]);
        self.headers.insert(
            "Content-Length".to_string(),
            vec![self.body.len().to_string()],
        );
        self.headers
            .insert("Connection".to_string(), vec!["close".to_string()]);
        self.insert_header_if_absent("Content-Type", "text/html");
        self
    }

    /// Serializes the status line, headers, blank line, and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        // The write targets a Vec, which cannot fail.
        let _ = self.write_bytes(&mut out);
        out
    }

    fn write_bytes<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write!(
            writer,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            status::reason_phrase(self.status)
        )?;
        for (key, values) in &self.headers {
            for value in values {
                write!(writer, "{key}: {value}\r\n")?;
            }
        }
        writer.write_all(b"\r\n")?;
        writer.write_all(&self.body)
    }
}

/// Formats a timestamp as an IMF-fixdate string, e.g.
/// `Wed, 21 Oct 2015 07:28:00 GMT`.
pub fn http_date(ts: Timestamp) -> String {
    ts.strftime(IMF_FIXDATE).to_string()
}

/// Parses an IMF-fixdate header value back into unix seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let datetime = jiff::civil::DateTime::strptime(IMF_FIXDATE, value).ok()?;
    let zoned = datetime.to_zoned(jiff::tz::TimeZone::UTC).ok()?;
    Some(zoned.timestamp().as_second())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_status_line_and_headers() {
        let response = Response::new(status::NOT_FOUND)
            .set_header("Content-Type", "text/html")
            .set_body(b"gone".to_vec());

        let bytes = response.to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.ends_with("\r\n\r\ngone"));
    }

    #[test]
    fn common_headers_are_always_stamped() {
        let response = Response::new(status::OK)
            .set_body(b"hello\n".to_vec())
            .with_common_headers();

        assert_eq!(response.header("Server"), Some(SERVER_NAME));
        assert_eq!(response.header("Content-Length"), Some("6"));
        assert_eq!(response.header("Connection"), Some("close"));
        assert_eq!(response.header("Content-Type"), Some("text/html"));
        assert!(response.header("Date").is_some());
    }

    #[test]
    fn chosen_content_type_survives_finalization() {
        let response = Response::new(status::OK)
            .set_header("Content-Type", "image/png")
            .with_common_headers();
        assert_eq!(response.header("Content-Type"), Some("image/png"));
    }

    #[test]
    fn repeated_headers_serialize_in_order() {
        let mut response = Response::new(status::OK);
        response.add_header("Set-Cookie", "a=1");
        response.add_header("Set-Cookie", "b=2");

        let text = String::from_utf8(response.to_bytes()).unwrap();
        let first = text.find("Set-Cookie: a=1").unwrap();
        let second = text.find("Set-Cookie: b=2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn date_round_trips() {
        let now = Timestamp::from_second(1_444_000_000).unwrap();
        let formatted = http_date(now);
        assert_eq!(parse_http_date(&formatted), Some(1_444_000_000));
    }

    #[test]
    fn malformed_dates_parse_to_none() {
        assert_eq!(parse_http_date("yesterday-ish"), None);
        assert_eq!(parse_http_date(""), None);
    }
}
