use super::headers::{head_end, parse_head};
use super::{Headers, ParseError};
use crate::protocol::plist::{self, PlistError, PlistValue};

/// RTSP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

#[allow(missing_docs)]
impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_ACCEPTABLE: StatusCode = StatusCode(406);
    pub const METHOD_NOT_VALID: StatusCode = StatusCode(455);
    pub const CONNECTION_AUTH_REQUIRED: StatusCode = StatusCode(470);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);

    /// 2xx
    #[must_use]
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Numeric code
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Reason phrase sent on the status line
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            406 => "Not Acceptable",
            455 => "Method Not Valid in This State",
            470 => "Connection Authorization Required",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }
}

/// A response, as built by the receiver or parsed by a sender
#[derive(Debug, Clone)]
pub struct RtspResponse {
    /// Protocol version from the status line
    pub version: String,
    /// Status code
    pub status: StatusCode,
    /// Reason phrase
    pub reason: String,
    /// Headers
    pub headers: Headers,
    /// Body, possibly empty
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Echoed `CSeq`
    #[must_use]
    pub fn cseq(&self) -> Option<u32> {
        self.headers.cseq()
    }

    /// Decode the body as a binary plist
    ///
    /// # Errors
    ///
    /// Returns `PlistError` for anything but a well-formed `bplist00`.
    pub fn body_as_plist(&self) -> Result<PlistValue, PlistError> {
        plist::decode(&self.body)
    }

    /// Parse one response from the front of `buf`
    ///
    /// Yields the response and the bytes it used, or `None` while the
    /// message is incomplete.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for a malformed status line or header.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ParseError> {
        let Some(end) = head_end(buf) else {
            return Ok(None);
        };
        let (start, headers) = parse_head(&buf[..end])?;

        let bad_line = || ParseError::InvalidRequestLine(start.to_string());
        let mut parts = start.splitn(3, ' ');
        let version = parts.next().filter(|v| v.starts_with("RTSP/")).ok_or_else(bad_line)?;
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(bad_line)?;
        let reason = parts.next().unwrap_or_default();

        let total = end + 4 + headers.content_length().unwrap_or(0);
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((
            Self {
                version: version.to_string(),
                status: StatusCode(status),
                reason: reason.to_string(),
                body: buf[end + 4..total].to_vec(),
                headers,
            },
            total,
        )))
    }
}
