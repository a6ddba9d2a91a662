//! HTTP status code constants and reason phrases

macro_rules! status_codes {
    ($($name:ident $value:literal $reason:literal),* $(,)?) => {
        $(
            pub const $name: u16 = $value;
        )*

        /// Returns the reason phrase for `code`, or `"Unknown"` for codes
        /// this server never emits.
        pub fn reason_phrase(code: u16) -> &'static str {
            match code {
                $(
                    $value => $reason,
                )*
                _ => "Unknown",
            }
        }
    }
}

status_codes! {
    CONTINUE                    100 "Continue",
    OK                          200 "OK",
    CREATED                     201 "Created",
    NO_CONTENT                  204 "No Content",
    MOVED_PERMANENTLY           301 "Moved Permanently",
    FOUND                       302 "Found",
    NOT_MODIFIED                304 "Not Modified",
    TEMPORARY_REDIRECT          307 "Temporary Redirect",
    PERMANENT_REDIRECT          308 "Permanent Redirect",
    BAD_REQUEST                 400 "Bad Request",
    FORBIDDEN                   403 "Forbidden",
    NOT_FOUND                   404 "Not Found",
    METHOD_NOT_ALLOWED          405 "Method Not Allowed",
    CONFLICT                    409 "Conflict",
    PAYLOAD_TOO_LARGE           413 "Payload Too Large",
    URI_TOO_LONG                414 "URI Too Long",
    EXPECTATION_FAILED          417 "Expectation Failed",
    INTERNAL_SERVER_ERROR       500 "Internal Server Error",
    NOT_IMPLEMENTED             501 "Not Implemented",
    GATEWAY_TIMEOUT             504 "Gateway Timeout",
    HTTP_VERSION_NOT_SUPPORTED  505 "HTTP Version Not Supported",
    INSUFFICIENT_STORAGE        507 "Insufficient Storage",
}
