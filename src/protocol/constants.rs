//! Wire protocol constants

/// Size of the length prefix framing every request and response
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// API keys identifying the request type in the header
pub mod api_keys {
    /// Produce
    pub const PRODUCE: i16 = 0;

    /// Fetch
    pub const FETCH: i16 = 1;

    /// ListOffsets
    pub const LIST_OFFSETS: i16 = 2;

    /// Metadata
    pub const METADATA: i16 = 3;

    /// SaslHandshake
    pub const SASL_HANDSHAKE: i16 = 17;

    /// ApiVersions
    pub const API_VERSIONS: i16 = 18;

    /// SaslAuthenticate
    pub const SASL_AUTHENTICATE: i16 = 36;
}
