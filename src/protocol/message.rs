//! Request/response envelope types

use bytes::Bytes;

/// An outbound request above the length-prefixed envelope.
///
/// The body is opaque to the connection: a codec layer keyed by API key and
/// version produces it and later consumes the matching response body. The
/// connection only adds the header (API key, version, correlation id,
/// client id) and the length prefix.
#[derive(Debug, Clone)]
pub struct Request {
    /// API key identifying the request type
    pub api_key: i16,
    /// API version the body was encoded with
    pub api_version: i16,
    /// False for fire-and-forget requests (acks=0 produce): the broker sends
    /// no response, so no in-flight entry is kept and the completion handle
    /// resolves immediately
    pub expect_response: bool,
    /// Encoded request body
    pub body: Bytes,
}

impl Request {
    /// Create a request that expects a correlated response
    pub fn new(api_key: i16, api_version: i16, body: Bytes) -> Self {
        Self {
            api_key,
            api_version,
            expect_response: true,
            body,
        }
    }

    /// Mark this request fire-and-forget
    pub fn no_response(mut self) -> Self {
        self.expect_response = false;
        self
    }
}

/// An inbound response with its envelope header stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Correlation id echoed from the originating request
    pub correlation_id: i32,
    /// Encoded response body, opaque to the connection
    pub body: Bytes,
}
