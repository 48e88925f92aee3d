//! HTTP/1.x request and response decoders using httparse.
//!
//! Each direction of a connection buffers until a whole message (head plus
//! body) is available, then emits it. Bodies are framed by Content-Length or
//! chunked transfer encoding; a message with neither has no body.
//!
//! Requests queue their method and URL on the request context. The response
//! side reaches that queue through its reverse link to label each response
//! with the URL it answers.
//!
//! Lock order: response context, then request context. The request side
//! never takes the response side's lock.
//!
//! A successful reply to `CONNECT` turns both directions of the connection
//! into opaque streams.

use std::collections::VecDeque;
use std::sync::Arc;

use httparse::{Request, Response, Status, EMPTY_HEADER};
use tracing::debug;

use super::{app_context, unrecognised};
use crate::address::ProtocolTag;
use crate::context::{ContextKind, ContextNode, ContextState};
use crate::dispatch::ports::handlers;
use crate::dispatch::{tcp, Pdu};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::{EventPayload, Headers};

const PROTOCOL: &str = "HTTP";

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

/// Largest message head accepted before the blank line.
const MAX_HEAD: usize = 64 * 1024;

/// Largest body collected for one message.
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Requests remembered while waiting for their responses.
const MAX_PENDING: usize = 64;

type ParseResult<T> = std::result::Result<T, ProtocolError>;

/// A request still waiting for its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub method: String,
    pub url: String,
}

/// Per-direction HTTP state.
#[derive(Debug, Default)]
pub struct HttpState {
    buffer: Vec<u8>,
    pending: VecDeque<PendingRequest>,
}

struct Head {
    first: FirstLine,
    headers: Headers,
}

enum FirstLine {
    Request { method: String, path: String },
    Response { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

fn violation(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::violation(PROTOCOL, reason)
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Headers {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

fn header<'h>(headers: &'h Headers, name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn incomplete(data: &[u8]) -> ParseResult<Option<(usize, Head)>> {
    if data.len() > MAX_HEAD {
        return Err(violation("message head too large"));
    }
    Ok(None)
}

fn parse_request_head(data: &[u8]) -> ParseResult<Option<(usize, Head)>> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = Request::new(&mut headers);
    match req.parse(data) {
        Ok(Status::Complete(len)) => Ok(Some((
            len,
            Head {
                first: FirstLine::Request {
                    method: req.method.unwrap_or_default().to_string(),
                    path: req.path.unwrap_or_default().to_string(),
                },
                headers: collect_headers(req.headers),
            },
        ))),
        Ok(Status::Partial) => incomplete(data),
        Err(e) => Err(violation(format!("bad request: {e}"))),
    }
}

fn parse_response_head(data: &[u8]) -> ParseResult<Option<(usize, Head)>> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut resp = Response::new(&mut headers);
    match resp.parse(data) {
        Ok(Status::Complete(len)) => Ok(Some((
            len,
            Head {
                first: FirstLine::Response {
                    code: resp.code.unwrap_or_default(),
                    reason: resp.reason.unwrap_or_default().to_string(),
                },
                headers: collect_headers(resp.headers),
            },
        ))),
        Ok(Status::Partial) => incomplete(data),
        Err(e) => Err(violation(format!("bad response: {e}"))),
    }
}

fn framing(headers: &Headers) -> ParseResult<Framing> {
    let chunked = header(headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }
    match header(headers, "content-length") {
        Some(value) => {
            let len: usize = value
                .trim()
                .parse()
                .map_err(|_| violation(format!("bad Content-Length {value:?}")))?;
            if len > MAX_BODY {
                return Err(violation(format!("body of {len} bytes too large")));
            }
            Ok(Framing::Length(len))
        }
        None => Ok(Framing::Empty),
    }
}

/// Read a body framed by `framing` from the start of `data`.
/// Returns the bytes consumed and the decoded body once complete.
fn read_body(framing: Framing, data: &[u8]) -> ParseResult<Option<(usize, Vec<u8>)>> {
    match framing {
        Framing::Empty => Ok(Some((0, Vec::new()))),
        Framing::Length(len) if data.len() >= len => Ok(Some((len, data[..len].to_vec()))),
        Framing::Length(_) => Ok(None),
        Framing::Chunked => decode_chunked(data),
    }
}

/// Decode a chunked body, returning the total length consumed (trailers
/// included) and the joined chunk data.
fn decode_chunked(data: &[u8]) -> ParseResult<Option<(usize, Vec<u8>)>> {
    let mut pos = 0;
    let mut body = Vec::new();

    loop {
        let Some(line_end) = data[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| pos + p)
        else {
            return Ok(None);
        };

        let size_line = std::str::from_utf8(&data[pos..line_end])
            .map_err(|_| violation("chunk size not ASCII"))?;
        // Chunk extensions follow a semicolon.
        let size_part = size_line.split(';').next().unwrap_or(size_line);
        let chunk_size = usize::from_str_radix(size_part.trim(), 16)
            .map_err(|_| violation(format!("bad chunk size {size_part:?}")))?;
        if chunk_size > MAX_BODY || body.len() + chunk_size > MAX_BODY {
            return Err(violation("chunked body too large"));
        }

        pos = line_end + 2;

        if chunk_size == 0 {
            if data.len() >= pos + 2 && &data[pos..pos + 2] == b"\r\n" {
                return Ok(Some((pos + 2, body)));
            }
            return Ok(data[pos..]
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|end| (pos + end + 4, body)));
        }

        if data.len() < pos + chunk_size + 2 {
            return Ok(None);
        }
        if &data[pos + chunk_size..pos + chunk_size + 2] != b"\r\n" {
            return Err(violation("chunk not terminated by CRLF"));
        }
        body.extend_from_slice(&data[pos..pos + chunk_size]);
        pos += chunk_size + 2;
    }
}

/// `http://<host><path>`, or the target as given when it is already
/// absolute or there is no Host header.
fn request_url(method: &str, path: &str, headers: &Headers) -> String {
    if method.eq_ignore_ascii_case("CONNECT") || path.contains("://") {
        return path.to_string();
    }
    match header(headers, "host") {
        Some(host) => format!("http://{host}{path}"),
        None => path.to_string(),
    }
}

fn has_no_body(code: u16, method: Option<&str>) -> bool {
    (100..200).contains(&code)
        || code == 204
        || code == 304
        || method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD"))
}

fn is_tunnel(code: u16, method: Option<&str>) -> bool {
    (200..300).contains(&code) && method.is_some_and(|m| m.eq_ignore_ascii_case("CONNECT"))
}

fn front_request(request: Option<&ContextNode>) -> Option<PendingRequest> {
    match &*request?.state() {
        ContextState::HttpRequest(http) => http.pending.front().cloned(),
        _ => None,
    }
}

fn pop_request(request: Option<&ContextNode>) {
    if let Some(request) = request {
        if let ContextState::HttpRequest(http) = &mut *request.state() {
            http.pending.pop_front();
        }
    }
}

impl HttpState {
    fn append(&mut self, data: &[u8]) -> ParseResult<()> {
        if self.buffer.len() + data.len() > MAX_HEAD + MAX_BODY {
            return Err(violation("message too large"));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Requests waiting for a response, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending.iter()
    }

    fn requests(&mut self, data: &[u8], events: &mut Vec<EventPayload>) -> ParseResult<()> {
        self.append(data)?;

        while !self.buffer.is_empty() {
            let Some((head_len, head)) = parse_request_head(&self.buffer)? else {
                break;
            };
            let Some((body_len, body)) = read_body(framing(&head.headers)?, &self.buffer[head_len..])? else {
                break;
            };
            let FirstLine::Request { method, path } = head.first else {
                break;
            };

            let url = request_url(&method, &path, &head.headers);
            if self.pending.len() == MAX_PENDING {
                self.pending.pop_front();
            }
            self.pending.push_back(PendingRequest {
                method: method.clone(),
                url: url.clone(),
            });
            events.push(EventPayload::HttpRequest {
                method,
                url,
                headers: head.headers,
                body,
            });
            self.buffer.drain(..head_len + body_len);
        }
        Ok(())
    }

    /// Parse buffered responses. Returns the bytes following a successful
    /// `CONNECT` reply, which belong to the tunnel.
    fn responses(
        &mut self,
        data: &[u8],
        request: Option<&ContextNode>,
        events: &mut Vec<EventPayload>,
    ) -> ParseResult<Option<Vec<u8>>> {
        self.append(data)?;

        while !self.buffer.is_empty() {
            let Some((head_len, head)) = parse_response_head(&self.buffer)? else {
                break;
            };
            let FirstLine::Response { code, reason } = head.first else {
                break;
            };

            let answered = front_request(request);
            let method = answered.as_ref().map(|r| r.method.as_str());
            let tunnel = is_tunnel(code, method);
            let body_framing = if has_no_body(code, method) || tunnel {
                Framing::Empty
            } else {
                framing(&head.headers)?
            };
            let Some((body_len, body)) = read_body(body_framing, &self.buffer[head_len..])? else {
                break;
            };

            // Interim responses leave the request waiting for its final one.
            if !(100..200).contains(&code) {
                pop_request(request);
            }
            events.push(EventPayload::HttpResponse {
                code,
                status: reason,
                headers: head.headers,
                url: answered.map(|r| r.url),
                body,
            });
            self.buffer.drain(..head_len + body_len);

            if tunnel {
                return Ok(Some(std::mem::take(&mut self.buffer)));
            }
        }
        Ok(None)
    }
}

pub fn process_request(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Http, pdu.direction, || {
        ContextState::HttpRequest(Box::default())
    });

    let mut events = Vec::new();
    let result = match &mut *context.state() {
        ContextState::HttpRequest(http) => http.requests(pdu.data, &mut events),
        _ => Ok(()),
    };
    engine.emit_all(&context, pdu.timestamp_us, events);
    result.map_err(Into::into)
}

pub fn process_response(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let context = app_context(transport, ProtocolTag::Http, pdu.direction, || {
        ContextState::HttpResponse(Box::default())
    });
    let request = context
        .reverse()
        .filter(|r| r.kind() == ContextKind::HttpRequest);

    let mut events = Vec::new();
    let result = match &mut *context.state() {
        ContextState::HttpResponse(http) => http.responses(pdu.data, request.as_deref(), &mut events),
        _ => Ok(None),
    };
    engine.emit_all(&context, pdu.timestamp_us, events);

    match result? {
        Some(rest) => open_tunnel(engine, transport, pdu.with_data(&rest)),
        None => Ok(()),
    }
}

/// Hand both directions of the connection to the unrecognised-stream
/// decoder, starting with `pdu`.
fn open_tunnel(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    debug!(context = transport.id(), "CONNECT accepted, stream now opaque");
    tcp::rebind(transport, handlers::UNRECOGNISED_STREAM);
    if let Some(client) = transport.reverse() {
        tcp::rebind(&client, handlers::UNRECOGNISED_STREAM);
    }
    if pdu.is_empty() {
        return Ok(());
    }
    unrecognised::process_stream(engine, transport, pdu)
}
