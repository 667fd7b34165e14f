//! Receiver-side framing: requests in, responses out

use bytes::BytesMut;

use super::headers::{head_end, names, parse_head};
use super::{Headers, Method, RtspRequest, RtspResponse, StatusCode, content_types};
use crate::protocol::plist::{self, PlistValue};

/// Control-channel framing errors; each one closes the connection
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Start line is not `METHOD uri RTSP/x.y` (or a valid status line)
    #[error("invalid start line: {0}")]
    InvalidRequestLine(String),

    /// Method the receiver does not speak
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// Header line without a colon, or a head that never ends
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// `Content-Length` is not a number
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// Declared body exceeds the limit
    #[error("body too large: {size} > {max}")]
    BodyTooLarge {
        /// Declared size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Head bytes are not UTF-8
    #[error("invalid UTF-8 in headers")]
    InvalidUtf8,
}

const MAX_BODY_SIZE: usize = 1024 * 1024;
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Incremental request parser for one control connection
///
/// ```rust
/// use airplay_mirror::protocol::rtsp::RtspServerCodec;
///
/// let mut codec = RtspServerCodec::new();
/// codec.feed(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
///
/// let request = codec.decode().unwrap().unwrap();
/// assert_eq!(request.cseq(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RtspServerCodec {
    buffer: BytesMut,
}

impl RtspServerCodec {
    /// Empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete request, or `None` until more bytes arrive
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for a malformed or oversized request.
    pub fn decode(&mut self) -> Result<Option<RtspRequest>, ParseError> {
        let Some(end) = head_end(&self.buffer) else {
            if self.buffer.len() > MAX_HEAD_SIZE {
                return Err(ParseError::InvalidHeader("head exceeds 64 KiB".into()));
            }
            return Ok(None);
        };

        let (start, headers) = parse_head(&self.buffer[..end])?;
        let (method, uri) = parse_request_line(start)?;
        let length = match headers.get(names::CONTENT_LENGTH) {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(v.to_string()))?,
            None => 0,
        };
        if length > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge {
                size: length,
                max: MAX_BODY_SIZE,
            });
        }
        if self.buffer.len() < end + 4 + length {
            return Ok(None);
        }

        let _ = self.buffer.split_to(end + 4);
        let body = self.buffer.split_to(length).to_vec();
        Ok(Some(RtspRequest {
            method,
            uri,
            headers,
            body,
        }))
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String), ParseError> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidRequestLine(line.to_string()));
    };
    if !(version.starts_with("RTSP/") || version.starts_with("HTTP/")) {
        return Err(ParseError::InvalidRequestLine(line.to_string()));
    }
    let method = method
        .parse::<Method>()
        .map_err(|()| ParseError::InvalidMethod(method.to_string()))?;
    Ok((method, uri.to_string()))
}

/// Response under construction
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseBuilder {
    /// `200 OK`
    #[must_use]
    pub fn ok() -> Self {
        Self::error(StatusCode::OK)
    }

    /// Response with `status`
    #[must_use]
    pub fn error(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Echo the request's `CSeq`
    #[must_use]
    pub fn cseq(self, cseq: u32) -> Self {
        self.header(names::CSEQ, &cseq.to_string())
    }

    /// Set a header
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// `text/parameters` body
    #[must_use]
    pub fn text_body(self, body: &str) -> Self {
        self.binary_body(body.as_bytes().to_vec(), content_types::TEXT_PARAMETERS)
    }

    /// Raw body of the given type
    #[must_use]
    pub fn binary_body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = body;
        self.header(names::CONTENT_TYPE, content_type)
    }

    /// Binary plist body
    #[must_use]
    pub fn plist_body(self, value: &PlistValue) -> Self {
        self.binary_body(plist::encode(value), content_types::BINARY_PLIST)
    }

    /// Finish, adding `Content-Length`
    #[must_use]
    pub fn build(self) -> RtspResponse {
        let mut headers = self.headers;
        headers.insert(names::CONTENT_LENGTH, self.body.len().to_string());
        RtspResponse {
            version: "RTSP/1.0".to_string(),
            status: self.status,
            reason: self.status.reason().to_string(),
            headers,
            body: self.body,
        }
    }
}

/// Serialize a response for the wire
#[must_use]
pub fn encode_response(response: &RtspResponse) -> Vec<u8> {
    let mut head = format!(
        "{} {} {}\r\n",
        response.version,
        response.status.as_u16(),
        response.reason
    );
    for (name, value) in response.headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&response.body);
    out
}
