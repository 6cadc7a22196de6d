//! HTTP status code constants

macro_rules! status_codes {
    ($($name:ident  $value:literal  $reason:literal),* $(,)?) => {
        $(
            pub const $name: u16 = $value;
        )*

        /// Returns the reason phrase for `code`, for use in the status line.
        pub fn reason(code: u16) -> &'static str {
            match code {
                $(
                    $value => $reason,
                )*
                _ => "Internal Server Error",
            }
        }
    }
}

status_codes! {
    OK                          200  "OK",
    CREATED                     201  "Created",
    NO_CONTENT                  204  "No Content",
    FOUND                       302  "Found",
    TEMPORARY_REDIRECT          307  "Temporary Redirect",
    BAD_REQUEST                 400  "Bad Request",
    NOT_FOUND                   404  "Not Found",
    METHOD_NOT_ALLOWED          405  "Method Not Allowed",
    CONFLICT                    409  "Conflict",
    PAYLOAD_TOO_LARGE           413  "Payload Too Large",
    INTERNAL_SERVER_ERROR       500  "Internal Server Error",
    BAD_GATEWAY                 502  "Bad Gateway",
    SERVICE_UNAVAILABLE         503  "Service Unavailable",
    GATEWAY_TIMEOUT             504  "Gateway Timeout",
}
