/// Header names the control channel reads or writes
pub mod names {
    /// Sequence number echoed in every response
    pub const CSEQ: &str = "CSeq";
    /// Body media type
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Body length in bytes
    pub const CONTENT_LENGTH: &str = "Content-Length";
    /// Methods supported by the receiver
    pub const PUBLIC: &str = "Public";
    /// Receiver software
    pub const SERVER: &str = "Server";
}

/// Message headers in arrival order
///
/// Lookups ignore case. Inserting a name that is already present
/// replaces the old entry in place.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// No headers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Value of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find_map(|(k, v)| k.eq_ignore_ascii_case(name).then_some(v.as_str()))
    }

    /// Parsed `CSeq`
    #[must_use]
    pub fn cseq(&self) -> Option<u32> {
        self.get(names::CSEQ)?.trim().parse().ok()
    }

    /// Parsed `Content-Length`
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.get(names::CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// `Content-Type`
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get(names::CONTENT_TYPE)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Offset of the blank line ending the head, if it has arrived
pub(crate) fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split a message head into its start line and headers
pub(crate) fn parse_head(head: &[u8]) -> Result<(&str, Headers), super::ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| super::ParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or_default();

    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| super::ParseError::InvalidHeader(line.to_string()))?;
        headers.insert(name.trim(), value.trim());
    }
    Ok((start, headers))
}
