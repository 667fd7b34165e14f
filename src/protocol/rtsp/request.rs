use super::{Headers, Method, headers::names};
use crate::protocol::plist::{self, PlistValue};

/// A control-channel request
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// Method
    pub method: Method,
    /// Target, e.g. `/info` or `rtsp://10.0.0.2/1234`
    pub uri: String,
    /// Headers
    pub headers: Headers,
    /// Body, possibly empty
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Request without headers or body
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Start a builder
    pub fn builder(method: Method, uri: impl Into<String>) -> RtspRequestBuilder {
        RtspRequestBuilder::new(method, uri)
    }

    /// Path component of the URI, without scheme and authority
    #[must_use]
    pub fn path(&self) -> &str {
        let uri = self.uri.as_str();
        let Some(rest) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("http://"))
        else {
            return uri;
        };
        rest.find('/').map_or("/", |i| &rest[i..])
    }

    /// `CSeq` header, 0 when absent
    #[must_use]
    pub fn cseq(&self) -> u32 {
        self.headers.cseq().unwrap_or(0)
    }

    /// Serialize for the wire, deriving `Content-Length` from the body
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!("{} {} RTSP/1.0\r\n", self.method, self.uri);
        let headers = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(names::CONTENT_LENGTH));
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if !self.body.is_empty() {
            head.push_str(&format!("{}: {}\r\n", names::CONTENT_LENGTH, self.body.len()));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Fluent request construction, used by senders and tests
#[derive(Debug)]
pub struct RtspRequestBuilder {
    request: RtspRequest,
}

impl RtspRequestBuilder {
    fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            request: RtspRequest::new(method, uri),
        }
    }

    /// Set a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(name, value);
        self
    }

    /// `CSeq`
    #[must_use]
    pub fn cseq(self, seq: u32) -> Self {
        self.header(names::CSEQ, seq.to_string())
    }

    /// `Content-Type`
    #[must_use]
    pub fn content_type(self, content_type: &str) -> Self {
        self.header(names::CONTENT_TYPE, content_type)
    }

    /// Raw body
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.request.body = body;
        self
    }

    /// Binary plist body with its content type
    #[must_use]
    pub fn body_plist(mut self, value: &PlistValue) -> Self {
        self.request.body = plist::encode(value);
        self.request
            .headers
            .insert(names::CONTENT_TYPE, super::content_types::BINARY_PLIST);
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> RtspRequest {
        self.request
    }
}
