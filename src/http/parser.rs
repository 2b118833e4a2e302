//! HTTP message parsing
//!
//! Incremental parsers for requests (server side) and responses (client
//! side). Data is fed as it arrives off the session; a parser returns
//! `Ok(None)` until a complete message is available.
//!
//! Response bodies are delimited by `Content-Length`, by chunked transfer
//! encoding, or by the peer closing the connection. The last case only
//! completes through [`ResponseParser::finish`].

use super::{Error, Headers, HttpRequest, HttpResponse, Method, Result, Status, Version, MAX_BODY_SIZE};

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Remove and return the next CRLF-terminated line
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = find_crlf(buf)?;
    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.drain(..pos + 2);
    Some(line)
}

/// Parse a request line: `METHOD URI VERSION`
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(Error::Parse(format!("Invalid request line: {:?}", line)));
    }

    Ok((parts[0].parse()?, parts[1].to_string(), parts[2].parse()?))
}

/// Parse a status line: `VERSION CODE [REASON]`
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default().parse()?;
    let code = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("Invalid status line: {:?}", line)))?;
    let code = code
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", code)))?;
    let status = Status::new(code)?;
    let reason = match parts.next() {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// Decode a chunked body
///
/// Returns `Ok(None)` until the terminating zero-size chunk and the
/// trailer section have been received. A body growing past
/// [`MAX_BODY_SIZE`] is rejected as an invalid chunk size.
pub fn decode_chunked(input: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(eol) = find_crlf(&input[pos..]) else {
            return Ok(None);
        };
        let size_line = String::from_utf8_lossy(&input[pos..pos + eol]);
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;
        pos += eol + 2;

        if size == 0 {
            // Skip trailer headers up to the empty line
            loop {
                let Some(eol) = find_crlf(&input[pos..]) else {
                    return Ok(None);
                };
                pos += eol + 2;
                if eol == 0 {
                    return Ok(Some(body));
                }
            }
        }

        let end = body
            .len()
            .checked_add(size)
            .filter(|total| *total <= MAX_BODY_SIZE)
            .and_then(|_| pos.checked_add(size))
            .ok_or_else(|| Error::InvalidChunkSize(size_str.to_string()))?;
        if input.len() < end + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&input[pos..end]);
        pos = end;
        if &input[pos..pos + 2] != b"\r\n" {
            return Err(Error::Parse("Expected CRLF after chunk".to_string()));
        }
        pos += 2;
    }
}

fn checked_length(length: usize) -> Result<usize> {
    if length > MAX_BODY_SIZE {
        return Err(Error::InvalidHeader(format!("Content-Length {} too large", length)));
    }
    Ok(length)
}

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Length(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    StartLine,
    Headers,
    Body(BodyMode),
    Complete,
}

/// HTTP request parser
///
/// Request bodies must carry a `Content-Length`; a request without one
/// has an empty body.
pub struct RequestParser {
    state: ParserState,
    buffer: Vec<u8>,
    start: Option<(Method, String, Version)>,
    headers: Headers,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            state: ParserState::StartLine,
            buffer: Vec::new(),
            start: None,
            headers: Headers::new(),
        }
    }

    /// Feed data to the parser
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpRequest>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParserState::StartLine => {
                    let Some(line) = take_line(&mut self.buffer) else {
                        return Ok(None);
                    };
                    self.start = Some(parse_request_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(line) = take_line(&mut self.buffer) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        let length = checked_length(self.headers.content_length()?.unwrap_or(0))?;
                        self.state = ParserState::Body(BodyMode::Length(length));
                    } else {
                        let (name, value) = Headers::parse_header_line(&line)?;
                        self.headers.insert(name, value);
                    }
                }
                ParserState::Body(BodyMode::Length(length)) => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..length).collect();
                    return self.complete(body).map(Some);
                }
                ParserState::Body(_) | ParserState::Complete => return Ok(None),
            }
        }
    }

    fn complete(&mut self, body: Vec<u8>) -> Result<HttpRequest> {
        self.state = ParserState::Complete;
        let (method, uri, version) = self.start.take().ok_or(Error::Incomplete)?;

        Ok(HttpRequest::builder()
            .method(method)
            .uri(uri)
            .version(version)
            .headers(std::mem::take(&mut self.headers))
            .body(body)
            .build())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP response parser
pub struct ResponseParser {
    state: ParserState,
    buffer: Vec<u8>,
    start: Option<(Version, Status, String)>,
    headers: Headers,
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            state: ParserState::StartLine,
            buffer: Vec::new(),
            start: None,
            headers: Headers::new(),
        }
    }

    /// Feed data to the parser
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParserState::StartLine => {
                    let Some(line) = take_line(&mut self.buffer) else {
                        return Ok(None);
                    };
                    self.start = Some(parse_status_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(line) = take_line(&mut self.buffer) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = ParserState::Body(self.body_mode()?);
                    } else {
                        let (name, value) = Headers::parse_header_line(&line)?;
                        self.headers.insert(name, value);
                    }
                }
                ParserState::Body(BodyMode::Length(length)) => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..length).collect();
                    return self.complete(body).map(Some);
                }
                ParserState::Body(BodyMode::Chunked) => {
                    return match decode_chunked(&self.buffer)? {
                        Some(body) => self.complete(body).map(Some),
                        None => Ok(None),
                    };
                }
                ParserState::Body(BodyMode::UntilClose) | ParserState::Complete => {
                    return Ok(None)
                }
            }
        }
    }

    /// Signal that the peer closed the connection
    ///
    /// Completes a close-delimited body; any other unfinished message is
    /// an error.
    pub fn finish(&mut self) -> Result<HttpResponse> {
        match self.state {
            ParserState::Body(BodyMode::UntilClose) => {
                let body = std::mem::take(&mut self.buffer);
                self.complete(body)
            }
            ParserState::StartLine if self.buffer.is_empty() => Err(Error::ConnectionClosed),
            _ => Err(Error::Incomplete),
        }
    }

    /// Reset the parser for reuse
    pub fn reset(&mut self) {
        *self = ResponseParser::new();
    }

    fn body_mode(&self) -> Result<BodyMode> {
        let no_body = self
            .start
            .as_ref()
            .map(|(_, status, _)| matches!(status.code(), 100..=199 | 204 | 304))
            .unwrap_or(false);

        if no_body {
            Ok(BodyMode::Length(0))
        } else if self.headers.is_chunked() {
            Ok(BodyMode::Chunked)
        } else if let Some(length) = self.headers.content_length()? {
            Ok(BodyMode::Length(checked_length(length)?))
        } else {
            Ok(BodyMode::UntilClose)
        }
    }

    fn complete(&mut self, body: Vec<u8>) -> Result<HttpResponse> {
        self.state = ParserState::Complete;
        let (version, status, reason) = self.start.take().ok_or(Error::Incomplete)?;

        Ok(HttpResponse::builder()
            .version(version)
            .status(status)
            .reason(reason)
            .headers(std::mem::take(&mut self.headers))
            .body(body)
            .build())
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}
