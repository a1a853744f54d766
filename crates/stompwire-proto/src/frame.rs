//! Frame structure and serialization

use crate::DecodeError;
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// STOMP commands understood by the server side of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client connect (1.0 and 1.1)
    Connect,
    /// Client connect, 1.1 spelling
    Stomp,
    /// Server reply to a successful connect
    Connected,
    /// Publish a message
    Send,
    /// Create a subscription
    Subscribe,
    /// Remove a subscription
    Unsubscribe,
    /// Acknowledge a message
    Ack,
    /// Reject a message (1.1)
    Nack,
    /// Start a transaction
    Begin,
    /// Commit a transaction
    Commit,
    /// Roll back a transaction
    Abort,
    /// Graceful close
    Disconnect,
    /// Server-delivered message
    Message,
    /// Server confirmation of a `receipt` request
    Receipt,
    /// Server-reported error
    Error,
}

impl Command {
    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Look up a command by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        let command = match name {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        };
        Some(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| DecodeError::InvalidCommand(s.to_string()))
    }
}

/// Header value escaping rules
///
/// STOMP 1.0 writes header bytes verbatim. STOMP 1.1 escapes backslash,
/// newline and colon, except on CONNECT and CONNECTED frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escaping {
    /// Headers are copied as-is (STOMP 1.0)
    #[default]
    None,
    /// STOMP 1.1 escape sequences
    Stomp11,
}

impl Escaping {
    /// Escaping is never applied to the connect handshake frames
    pub(crate) fn applies_to(self, command: &str) -> bool {
        self == Self::Stomp11 && !matches!(command, "CONNECT" | "STOMP" | "CONNECTED")
    }

    /// Whether a `key:value` header line survives encoding intact
    ///
    /// CR and NUL have no escape sequence. Without escaping, line feeds would
    /// end the line early and a colon in the key would split it.
    pub fn can_encode(self, key: &str, value: &str) -> bool {
        let unescapable = |text: &str| text.contains(['\r', '\0']);
        if unescapable(key) || unescapable(value) {
            return false;
        }
        match self {
            Self::None => !key.contains(['\n', ':']) && !value.contains('\n'),
            Self::Stomp11 => true,
        }
    }
}

/// Ordered header map with unique keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing the value in place if the key exists
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Insert a header only if the key is not present yet.
    ///
    /// Returns `false` when the header was ignored.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    /// Get a header value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Check whether a header is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Iterate headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A single STOMP frame
///
/// Frames are assembled with the `with_*` builder methods and are read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: String,
    headers: Headers,
    body: Bytes,
}

impl Frame {
    /// Create a frame with no headers and an empty body
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Create a frame from already assembled parts
    pub fn from_parts(command: impl Into<String>, headers: Headers, body: Bytes) -> Self {
        Self {
            command: command.into(),
            headers,
            body,
        }
    }

    /// Create a frame for a known command
    pub fn command_frame(command: Command) -> Self {
        Self::new(command.as_str())
    }

    /// Add or replace a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Add a header only if it is not set yet
    pub fn with_default_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert_if_absent(key, value);
        self
    }

    /// Set the frame body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Raw command string
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Parsed command, `None` for commands this crate does not know
    pub fn known_command(&self) -> Option<Command> {
        Command::from_name(&self.command)
    }

    /// Check the command
    pub fn is(&self, command: Command) -> bool {
        self.command == command.as_str()
    }

    /// Header map
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Single header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Frame body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Serialize to wire bytes
    pub fn encode(&self, escaping: Escaping) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode_into(&mut buf, escaping);
        buf.freeze()
    }

    /// Serialize to wire bytes, appending to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut, escaping: Escaping) {
        let escape = escaping.applies_to(&self.command);

        buf.put_slice(self.command.as_bytes());
        buf.put_u8(b'\n');

        for (key, value) in self.headers.iter() {
            if escape {
                escape_into(buf, key);
                buf.put_u8(b':');
                escape_into(buf, value);
            } else {
                buf.put_slice(key.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(value.as_bytes());
            }
            buf.put_u8(b'\n');
        }

        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
    }

    fn encoded_len_hint(&self) -> usize {
        // command + headers + separators, escaping may add a little more
        self.command.len()
            + self.headers.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>()
            + self.body.len()
            + 3
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.command)?;
        for (key, value) in self.headers.iter() {
            writeln!(f, "{}:{}", key, value)?;
        }
        write!(f, "<{} bytes>", self.body.len())
    }
}

fn escape_into(buf: &mut BytesMut, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"), // Order is significant
            b'\n' => buf.put_slice(b"\\n"),
            b':' => buf.put_slice(b"\\c"),
            b => buf.put_u8(b),
        }
    }
}

/// Reverse STOMP 1.1 header escaping
pub(crate) fn unescape(value: &str) -> Result<String, DecodeError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(DecodeError::InvalidHeader(value.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        for command in [Command::Connect, Command::Nack, Command::Message, Command::Error] {
            assert_eq!(Command::from_name(command.as_str()), Some(command));
        }
        assert_eq!(Command::from_name("connect"), None);
        assert_eq!(Command::from_name("PUBLISH"), None);
        assert_eq!("NACK".parse::<Command>(), Ok(Command::Nack));
        assert!("nack".parse::<Command>().is_err());
    }

    #[test]
    fn test_headers_keep_insertion_order_and_unique_keys() {
        let mut headers = Headers::new();
        headers.insert("destination", "/queue/a");
        headers.insert("ack", "client");
        headers.insert("destination", "/queue/b");

        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(entries, vec![("destination", "/queue/b"), ("ack", "client")]);

        assert!(!headers.insert_if_absent("ack", "auto"));
        assert_eq!(headers.get("ack"), Some("client"));
    }

    #[test]
    fn test_encode_plain_frame() {
        let frame = Frame::command_frame(Command::Send)
            .with_header("destination", "x")
            .with_header("ack", "auto")
            .with_body("hello");

        let encoded = frame.encode(Escaping::None);
        assert_eq!(&encoded[..], b"SEND\ndestination:x\nack:auto\n\nhello\0");
    }

    #[test]
    fn test_encode_escapes_headers_for_stomp11() {
        let frame = Frame::new("MESSAGE").with_header("key:1", "line\nback\\slash");

        let encoded = frame.encode(Escaping::Stomp11);
        assert_eq!(&encoded[..], b"MESSAGE\nkey\\c1:line\\nback\\\\slash\n\n\0");

        let raw = frame.encode(Escaping::None);
        assert_eq!(&raw[..], b"MESSAGE\nkey:1:line\nback\\slash\n\n\0");
    }

    #[test]
    fn test_connected_frame_is_never_escaped() {
        let frame = Frame::command_frame(Command::Connected).with_header("server", "a:b");
        let encoded = frame.encode(Escaping::Stomp11);
        assert_eq!(&encoded[..], b"CONNECTED\nserver:a:b\n\n\0");
    }

    #[test]
    fn test_can_encode() {
        assert!(Escaping::None.can_encode("color", "red:ish"));
        assert!(!Escaping::None.can_encode("color", "red\n\nEVIL"));
        assert!(!Escaping::None.can_encode("co:lor", "red"));
        assert!(Escaping::Stomp11.can_encode("co:lor", "red\nblue"));
        assert!(!Escaping::Stomp11.can_encode("color", "red\0"));
        assert!(!Escaping::Stomp11.can_encode("color", "red\r"));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a\\cb\\nc\\\\d").unwrap(), "a:b\nc\\d");
        assert_eq!(unescape("plain").unwrap(), "plain");
        assert!(matches!(unescape("bad\\x"), Err(DecodeError::InvalidHeader(_))));
        assert!(matches!(unescape("trailing\\"), Err(DecodeError::InvalidHeader(_))));
    }

    #[test]
    fn test_display_hides_body() {
        let frame = Frame::new("SEND").with_header("destination", "x").with_body("secret");
        let shown = frame.to_string();
        assert!(shown.contains("destination:x"));
        assert!(shown.contains("<6 bytes>"));
        assert!(!shown.contains("secret"));
    }
}
