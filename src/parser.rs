use crate::config::MAX_START_LINE;
use crate::request::{Method, Request, Version};
use thiserror::Error;

/// Parse phases. `Error` is terminal until [`Parser::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    StartLine,
    Headers,
    Body,
    ChunkedBody,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("request line too long")]
    StartLineTooLong,
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(String),
    #[error("missing CRLF after chunk data")]
    MissingChunkTerminator,
}

/// Result of one [`Parser::parse`] call.
#[derive(Debug)]
pub struct ParseOutcome {
    pub state: ParseState,
    /// Bytes consumed from the scratch buffer by this call.
    pub consumed: usize,
    pub error: Option<ParseError>,
}

impl ParseOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }
}

enum Step {
    Advanced,
    NeedMore,
    Failed(ParseError),
}

/// Incremental HTTP/1.x request parser.
///
/// Pure byte-consuming state machine; does no I/O. Input is appended to a
/// scratch buffer and consumed in place, so a message may arrive in any
/// number of pieces — even one byte at a time — and produce the same
/// request as a single-shot parse. The fully consumed prefix is dropped
/// after every call to bound memory.
pub struct Parser {
    state: ParseState,
    request: Option<Request>,
    buffer: Vec<u8>,
    content_length: usize,
    chunked: bool,
    chunk_remaining: usize,
    chunk_size_parsed: bool,
    total_consumed: u64,
    last_error: Option<ParseError>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StartLine,
            request: Some(Request::new()),
            buffer: Vec::new(),
            content_length: 0,
            chunked: false,
            chunk_remaining: 0,
            chunk_size_parsed: false,
            total_consumed: 0,
            last_error: None,
        }
    }

    /// Appends `data` to the scratch buffer and consumes as much as the
    /// current state allows. Parsing stops at `Complete` or `Error`; both
    /// persist until [`reset`].
    ///
    /// [`reset`]: Parser::reset
    pub fn parse(&mut self, data: &[u8]) -> ParseOutcome {
        if self.state == ParseState::Error {
            return ParseOutcome {
                state: self.state,
                consumed: 0,
                error: self.last_error.clone(),
            };
        }

        self.buffer.extend_from_slice(data);
        let mut pos = 0;
        let mut failure = None;

        while self.state != ParseState::Complete && self.state != ParseState::Error {
            let step = match self.state {
                ParseState::StartLine => self.step_start_line(&mut pos),
                ParseState::Headers => self.step_headers(&mut pos),
                ParseState::Body => self.step_body(&mut pos),
                ParseState::ChunkedBody => self.step_chunked(&mut pos),
                ParseState::Complete | ParseState::Error => unreachable!(),
            };
            match step {
                Step::Advanced => {}
                Step::NeedMore => break,
                Step::Failed(err) => {
                    self.state = ParseState::Error;
                    failure = Some(err);
                }
            }
        }

        self.total_consumed += pos as u64;
        self.buffer.drain(..pos);
        self.last_error = failure.clone();

        ParseOutcome {
            state: self.state,
            consumed: pos,
            error: failure,
        }
    }

    /// Hands over the completed request, if any. The parser keeps its
    /// `Complete` state; call [`reset`] before feeding the next message.
    ///
    /// [`reset`]: Parser::reset
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state == ParseState::Complete {
            self.request.take()
        } else {
            None
        }
    }

    /// Reinitializes for the next request, dropping any unconsumed bytes.
    pub fn reset(&mut self) {
        self.state = ParseState::StartLine;
        self.request = Some(Request::new());
        self.buffer.clear();
        self.content_length = 0;
        self.chunked = false;
        self.chunk_remaining = 0;
        self.chunk_size_parsed = false;
        self.total_consumed = 0;
        self.last_error = None;
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_parsing(&self) -> bool {
        self.state != ParseState::Complete && self.state != ParseState::Error
    }

    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    /// Whether the current message declared `Transfer-Encoding: chunked`.
    pub fn is_chunked_transfer(&self) -> bool {
        self.chunked
    }

    fn request_mut(&mut self) -> &mut Request {
        self.request.as_mut().expect("request present while parsing")
    }

    /// Position of the next `\r\n` at or after `from`. A bare `\n` does not
    /// terminate a line.
    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buffer[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }

    fn step_start_line(&mut self, pos: &mut usize) -> Step {
        let Some(line_end) = self.find_crlf(*pos) else {
            if self.buffer.len() - *pos > MAX_START_LINE {
                return Step::Failed(ParseError::StartLineTooLong);
            }
            return Step::NeedMore;
        };
        if line_end - *pos > MAX_START_LINE {
            return Step::Failed(ParseError::StartLineTooLong);
        }

        let Ok(line) = std::str::from_utf8(&self.buffer[*pos..line_end]) else {
            return Step::Failed(ParseError::InvalidRequestLine);
        };
        let mut tokens = line.split_whitespace();
        let (Some(method_token), Some(target), Some(version_token)) =
            (tokens.next(), tokens.next(), tokens.next())
        else {
            return Step::Failed(ParseError::InvalidRequestLine);
        };

        let method = Method::from_token(method_token);
        if method == Method::Unknown {
            return Step::Failed(ParseError::UnsupportedMethod(method_token.to_string()));
        }
        let version = Version::from_token(version_token);
        if version == Version::Unknown {
            return Step::Failed(ParseError::UnsupportedVersion(version_token.to_string()));
        }

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };

        let request = self.request_mut();
        request.set_method(method);
        request.set_path(path);
        request.set_query(query);
        request.set_version(version);

        *pos = line_end + 2;
        self.state = ParseState::Headers;
        Step::Advanced
    }

    fn step_headers(&mut self, pos: &mut usize) -> Step {
        let Some(line_end) = self.find_crlf(*pos) else {
            return Step::NeedMore;
        };

        // Empty line ends the header section.
        if line_end == *pos {
            *pos += 2;
            return self.finish_headers();
        }

        let Ok(line) = std::str::from_utf8(&self.buffer[*pos..line_end]) else {
            return Step::Failed(ParseError::MalformedHeader(String::from_utf8_lossy(
                &self.buffer[*pos..line_end],
            )
            .into_owned()));
        };
        let Some((name, value)) = line.split_once(':') else {
            return Step::Failed(ParseError::MalformedHeader(line.to_string()));
        };

        let name = name.trim_matches(|c| c == ' ' || c == '\t').to_string();
        let value = value.trim_matches(|c| c == ' ' || c == '\t').to_string();
        self.request_mut().add_header(name, value);

        *pos = line_end + 2;
        Step::Advanced
    }

    fn finish_headers(&mut self) -> Step {
        let content_length = self
            .request_mut()
            .header("Content-Length")
            .map(str::to_string);
        if let Some(value) = content_length {
            match value.parse::<usize>() {
                Ok(length) => {
                    self.content_length = length;
                    self.state = ParseState::Body;
                }
                Err(_) => return Step::Failed(ParseError::InvalidContentLength(value)),
            }
        } else if self.request_mut().is_chunked() {
            self.chunked = true;
            self.state = ParseState::ChunkedBody;
        } else {
            self.state = ParseState::Complete;
        }
        Step::Advanced
    }

    fn step_body(&mut self, pos: &mut usize) -> Step {
        let needed = self.content_length - self.request_mut().body_len();
        let available = self.buffer.len() - *pos;

        if available >= needed {
            let chunk = self.buffer[*pos..*pos + needed].to_vec();
            self.request_mut().append_body(&chunk);
            *pos += needed;
            self.state = ParseState::Complete;
            Step::Advanced
        } else {
            let chunk = self.buffer[*pos..].to_vec();
            self.request_mut().append_body(&chunk);
            *pos += available;
            Step::NeedMore
        }
    }

    fn step_chunked(&mut self, pos: &mut usize) -> Step {
        if !self.chunk_size_parsed {
            return self.step_chunk_size(pos);
        }
        if self.chunk_remaining > 0 {
            return self.step_chunk_data(pos);
        }
        // Chunk data fully consumed; its trailing CRLF may still be in
        // flight from a previous packet.
        if self.buffer.len() - *pos < 2 {
            return Step::NeedMore;
        }
        if &self.buffer[*pos..*pos + 2] != b"\r\n" {
            return Step::Failed(ParseError::MissingChunkTerminator);
        }
        *pos += 2;
        self.chunk_size_parsed = false;
        Step::Advanced
    }

    fn step_chunk_size(&mut self, pos: &mut usize) -> Step {
        let Some(line_end) = self.find_crlf(*pos) else {
            return Step::NeedMore;
        };
        let raw = String::from_utf8_lossy(&self.buffer[*pos..line_end]).into_owned();
        // Chunk extensions after ';' are ignored.
        let size_token = raw.split(';').next().unwrap_or("").trim();

        let Ok(size) = usize::from_str_radix(size_token, 16) else {
            return Step::Failed(ParseError::InvalidChunkSize(raw));
        };

        *pos = line_end + 2;
        if size == 0 {
            // Trailer headers are not supported; the final CRLF is left
            // for reset() to discard.
            self.state = ParseState::Complete;
        } else {
            self.chunk_remaining = size;
            self.chunk_size_parsed = true;
        }
        Step::Advanced
    }

    fn step_chunk_data(&mut self, pos: &mut usize) -> Step {
        let available = self.buffer.len() - *pos;
        if available == 0 {
            return Step::NeedMore;
        }
        let take = self.chunk_remaining.min(available);
        let chunk = self.buffer[*pos..*pos + take].to_vec();
        self.request_mut().append_body(&chunk);
        *pos += take;
        self.chunk_remaining -= take;
        Step::Advanced
    }
}
