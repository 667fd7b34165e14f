//! Control-channel message types and framing, independent of any socket

pub mod headers;
pub mod request;
pub mod response;
pub mod server_codec;


pub use headers::Headers;
pub use request::{RtspRequest, RtspRequestBuilder};
pub use response::{RtspResponse, StatusCode};
pub use server_codec::{ParseError, ResponseBuilder, RtspServerCodec, encode_response};

macro_rules! methods {
    ($($(#[$doc:meta])* $variant:ident => $token:literal,)+) => {
        /// Control-channel methods a mirroring sender issues
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($(#[$doc])* $variant,)+
        }

        impl Method {
            /// Token on the request line
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $token,)+
                }
            }
        }

        impl std::str::FromStr for Method {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                $(if s.eq_ignore_ascii_case($token) {
                    return Ok(Self::$variant);
                })+
                Err(())
            }
        }
    };
}

methods! {
    /// Capability query
    Options => "OPTIONS",
    /// `/info`
    Get => "GET",
    /// Pairing endpoints
    Post => "POST",
    /// Session and stream setup
    Setup => "SETUP",
    /// Start streaming
    Record => "RECORD",
    /// Discard buffered media
    Flush => "FLUSH",
    /// End the session
    Teardown => "TEARDOWN",
    /// Volume
    SetParameter => "SET_PARAMETER",
    /// Volume query
    GetParameter => "GET_PARAMETER",
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content types seen on the control channel
pub mod content_types {
    /// Binary property list
    pub const BINARY_PLIST: &str = "application/x-apple-binary-plist";
    /// Raw bytes (pairing messages)
    pub const OCTET_STREAM: &str = "application/octet-stream";
    /// `key: value` text lines
    pub const TEXT_PARAMETERS: &str = "text/parameters";
}
