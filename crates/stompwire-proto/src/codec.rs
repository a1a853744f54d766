//! Incremental STOMP frame decoder

use crate::frame::unescape;
use crate::{DecodeError, Escaping, Frame, Headers};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Per-connection decoder turning raw transport chunks into frames
///
/// Bytes are appended with [`StompDecoder::extend`] in arrival order and
/// complete frames are pulled with [`StompDecoder::next_frame`]. Incomplete
/// frames stay buffered until the rest arrives. Progress on a partial frame
/// is kept between calls, so every buffered byte is scanned once.
#[derive(Debug)]
pub struct StompDecoder {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
    /// Header escaping applied when reading header lines
    escaping: Escaping,
    /// Number of bare EOL heart-beats skipped so far
    heartbeats: u64,
    /// Progress on the frame at the front of `read_buf`
    state: ParseState,
}

impl Default for StompDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoding progress of the frame at the front of the read buffer
#[derive(Debug)]
enum ParseState {
    /// Looking for the blank line closing the headers
    Head {
        /// Offset of the first byte of the current line
        line_start: usize,
        /// Bytes already searched for a line feed
        scanned: usize,
        /// Complete lines seen so far
        lines: usize,
    },
    /// Headers parsed, waiting for the rest of the body
    Body {
        command: String,
        headers: Headers,
        body_start: usize,
        bounds: BodyBounds,
    },
}

impl Default for ParseState {
    fn default() -> Self {
        ParseState::Head {
            line_start: 0,
            scanned: 0,
            lines: 0,
        }
    }
}

/// How the end of a body is found
#[derive(Debug, Clone, Copy)]
enum BodyBounds {
    /// `content-length` was given, the NUL is expected at `end`
    Length { end: usize },
    /// Body runs to the first NUL at or after `scanned`
    Terminated { scanned: usize },
}

/// Outcome of scanning for the end of the header block
enum HeadScan {
    Incomplete { line_start: usize, scanned: usize, lines: usize },
    Complete { body_start: usize, lines: usize },
}

impl StompDecoder {
    /// Create a new decoder with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new decoder with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
            escaping: Escaping::None,
            heartbeats: 0,
            state: ParseState::default(),
        }
    }

    /// Switch header escaping, normally once the protocol version is known
    pub fn set_escaping(&mut self, escaping: Escaping) {
        self.escaping = escaping;
    }

    /// Current header escaping
    pub fn escaping(&self) -> Escaping {
        self.escaping
    }

    /// Append bytes received from the transport
    pub fn extend(&mut self, bytes: &[u8]) {
        self.read_buf.extend_from_slice(bytes);
    }

    /// Lazily yield every complete frame currently buffered
    ///
    /// The iterator stops at the first incomplete frame, or right after
    /// yielding a decode error.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            failed: false,
        }
    }

    /// Try to decode the next frame from the internal buffer
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            match std::mem::take(&mut self.state) {
                ParseState::Head {
                    line_start,
                    mut scanned,
                    lines,
                } => {
                    // Heart-beats only occur between frames
                    if lines == 0 && self.skip_heartbeats() {
                        scanned = 0;
                    }
                    if self.read_buf.is_empty() {
                        return Ok(None);
                    }

                    match self.scan_head(line_start, scanned, lines)? {
                        HeadScan::Incomplete {
                            line_start,
                            scanned,
                            lines,
                        } => {
                            self.state = ParseState::Head {
                                line_start,
                                scanned,
                                lines,
                            };
                            return Ok(None);
                        }
                        HeadScan::Complete { body_start, lines } => {
                            let (command, headers) = self.parse_head(body_start, lines)?;
                            let bounds = self.body_bounds(&headers, body_start)?;
                            self.state = ParseState::Body {
                                command,
                                headers,
                                body_start,
                                bounds,
                            };
                        }
                    }
                }

                ParseState::Body {
                    command,
                    headers,
                    body_start,
                    mut bounds,
                } => match self.locate_body_end(&mut bounds)? {
                    Some(body_end) => {
                        let mut frame_data = self.read_buf.split_to(body_end + 1);
                        frame_data.truncate(body_end);
                        frame_data.advance(body_start);
                        return Ok(Some(Frame::from_parts(command, headers, frame_data.freeze())));
                    }
                    None => {
                        self.state = ParseState::Body {
                            command,
                            headers,
                            body_start,
                            bounds,
                        };
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// Read a frame from an async reader
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, DecodeError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader
                .read(&mut temp_buf)
                .await
                .map_err(|e| DecodeError::Io(e.to_string()))?;

            if n == 0 {
                // EOF reached
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(DecodeError::MissingTerminator);
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Number of heart-beat EOLs skipped between frames
    pub fn heartbeats_received(&self) -> u64 {
        self.heartbeats
    }

    /// Clear the internal buffer and any partial frame
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
        self.state = ParseState::default();
    }

    /// Drop leading EOLs, returning whether any were found
    fn skip_heartbeats(&mut self) -> bool {
        let mut skipped = false;
        loop {
            if self.read_buf.starts_with(b"\n") {
                self.read_buf.advance(1);
            } else if self.read_buf.starts_with(b"\r\n") {
                self.read_buf.advance(2);
            } else {
                return skipped;
            }
            self.heartbeats += 1;
            skipped = true;
        }
    }

    fn check_size(&self, size: usize) -> Result<(), DecodeError> {
        if size > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Continue the search for the blank line ending the headers
    fn scan_head(&self, mut line_start: usize, mut scanned: usize, mut lines: usize) -> Result<HeadScan, DecodeError> {
        let buf = &self.read_buf[..];

        while let Some(offset) = buf[scanned..].iter().position(|b| *b == b'\n') {
            let newline = scanned + offset;
            let line = strip_cr(&buf[line_start..newline]);
            line_start = newline + 1;
            scanned = line_start;
            if line.is_empty() && lines > 0 {
                self.check_size(line_start)?;
                return Ok(HeadScan::Complete {
                    body_start: line_start,
                    lines,
                });
            }
            lines += 1;
        }

        self.check_size(buf.len())?;
        Ok(HeadScan::Incomplete {
            line_start,
            scanned: buf.len(),
            lines,
        })
    }

    /// Parse the command and the first `lines - 1` header lines
    fn parse_head(&self, body_start: usize, lines: usize) -> Result<(String, Headers), DecodeError> {
        let mut lines = self.read_buf[..body_start]
            .split(|b| *b == b'\n')
            .map(strip_cr)
            .take(lines);

        let command = parse_command(lines.next().unwrap_or_default())?;
        let escape = self.escaping.applies_to(&command);
        let mut headers = Headers::new();
        for line in lines {
            let (key, value) = parse_header(line, escape)?;
            // Repeated headers: the first occurrence wins
            headers.insert_if_absent(key, value);
        }
        Ok((command, headers))
    }

    fn body_bounds(&self, headers: &Headers, body_start: usize) -> Result<BodyBounds, DecodeError> {
        let Some(value) = headers.get("content-length") else {
            return Ok(BodyBounds::Terminated { scanned: body_start });
        };

        let length: usize = value
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidContentLength(value.to_string()))?;
        if length > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let end = body_start
            .checked_add(length)
            .ok_or_else(|| DecodeError::InvalidContentLength(value.to_string()))?;
        self.check_size(end.saturating_add(1))?;
        Ok(BodyBounds::Length { end })
    }

    /// Offset of the terminating NUL, `None` while the body is incomplete
    fn locate_body_end(&self, bounds: &mut BodyBounds) -> Result<Option<usize>, DecodeError> {
        let buf = &self.read_buf[..];
        match bounds {
            BodyBounds::Length { end } => {
                if buf.len() <= *end {
                    return Ok(None);
                }
                if buf[*end] != 0 {
                    return Err(DecodeError::MissingTerminator);
                }
                Ok(Some(*end))
            }
            BodyBounds::Terminated { scanned } => match buf[*scanned..].iter().position(|b| *b == 0) {
                Some(offset) => Ok(Some(*scanned + offset)),
                None => {
                    self.check_size(buf.len())?;
                    *scanned = buf.len();
                    Ok(None)
                }
            },
        }
    }
}

/// Iterator returned by [`StompDecoder::frames`]
pub struct Frames<'a> {
    decoder: &'a mut StompDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_command(line: &[u8]) -> Result<String, DecodeError> {
    let command = std::str::from_utf8(line).map_err(|_| DecodeError::InvalidUtf8)?;
    if command.is_empty() || !command.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(DecodeError::InvalidCommand(command.to_string()));
    }
    Ok(command.to_string())
}

fn parse_header(line: &[u8], escape: bool) -> Result<(String, String), DecodeError> {
    let line = std::str::from_utf8(line).map_err(|_| DecodeError::InvalidUtf8)?;
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| DecodeError::InvalidHeader(line.to_string()))?;
    if escape {
        Ok((unescape(key)?, unescape(value)?))
    } else {
        Ok((key.to_string(), value.to_string()))
    }
}
