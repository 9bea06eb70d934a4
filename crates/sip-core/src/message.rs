//! SIP requests and responses as owned values.
//!
//! Headers are stored raw and parsed on demand through typed accessors, so
//! a proxied message keeps its original spelling for everything this node
//! does not touch.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::contact::Contact;
use crate::types::cseq::CSeq;
use crate::types::headers::{Header, HeaderName, Headers};
use crate::types::method::Method;
use crate::types::name_addr::NameAddr;
use crate::types::session_expires::SessionExpires;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;

const SIP_VERSION: &str = "SIP/2.0";

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Either kind of message, as read off a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    // ---- Core header accessors -------------------------------------------

    pub fn call_id(&self) -> Option<&str> {
        self.headers.first(&HeaderName::CallId)
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers
            .first(&HeaderName::CSeq)
            .and_then(|v| v.parse().ok())
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.headers
            .first(&HeaderName::From)
            .and_then(|v| v.parse().ok())
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.headers
            .first(&HeaderName::To)
            .and_then(|v| v.parse().ok())
    }

    /// Expires header value in seconds.
    pub fn expires(&self) -> Option<u32> {
        self.headers
            .first(&HeaderName::Expires)
            .and_then(|v| v.trim().parse().ok())
    }

    /// All contacts across all Contact headers.
    pub fn contacts(&self) -> Result<Vec<Contact>> {
        let mut out = Vec::new();
        for value in self.headers.all(&HeaderName::Contact) {
            out.extend(Contact::parse_list(value)?);
        }
        Ok(out)
    }

    pub fn session_expires(&self) -> Option<SessionExpires> {
        self.headers
            .first(&HeaderName::SessionExpires)
            .and_then(|v| v.parse().ok())
    }

    // ---- Routing headers -------------------------------------------------

    /// All Route entries across all Route headers, topmost first.
    pub fn routes(&self) -> Result<Vec<NameAddr>> {
        let mut out = Vec::new();
        for value in self.headers.all(&HeaderName::Route) {
            out.extend(NameAddr::parse_list(value)?);
        }
        Ok(out)
    }

    /// The topmost Route entry.
    pub fn top_route(&self) -> Option<NameAddr> {
        self.headers
            .first(&HeaderName::Route)
            .and_then(|v| NameAddr::parse_list(v).ok())
            .and_then(|l| l.into_iter().next())
    }

    /// Remove and return the topmost Route entry, keeping any further
    /// entries from the same header line in place.
    pub fn pop_top_route(&mut self) -> Option<NameAddr> {
        let value = self.headers.first(&HeaderName::Route)?.to_string();
        let mut entries = NameAddr::parse_list(&value).ok()?;
        if entries.is_empty() {
            self.headers.remove_first(&HeaderName::Route);
            return None;
        }
        let top = entries.remove(0);
        if entries.is_empty() {
            self.headers.remove_first(&HeaderName::Route);
        } else {
            let rest = entries
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.headers.replace_first(&HeaderName::Route, rest);
        }
        Some(top)
    }

    /// Insert a new topmost Route.
    pub fn push_route_front(&mut self, route: NameAddr) {
        self.headers
            .push_front(HeaderName::Route, route.to_string());
    }

    pub fn record_routes(&self) -> Result<Vec<NameAddr>> {
        let mut out = Vec::new();
        for value in self.headers.all(&HeaderName::RecordRoute) {
            out.extend(NameAddr::parse_list(value)?);
        }
        Ok(out)
    }

    pub fn push_record_route_front(&mut self, rr: NameAddr) {
        self.headers
            .push_front(HeaderName::RecordRoute, rr.to_string());
    }

    pub fn paths(&self) -> Result<Vec<NameAddr>> {
        let mut out = Vec::new();
        for value in self.headers.all(&HeaderName::Path) {
            out.extend(NameAddr::parse_list(value)?);
        }
        Ok(out)
    }

    // ---- Via handling ----------------------------------------------------

    /// Add a Via for this hop with the given branch.
    pub fn push_via_front(&mut self, sent_by: &str, branch: &str) {
        self.headers.push_front(
            HeaderName::Via,
            format!("SIP/2.0/UDP {};branch={}", sent_by, branch),
        );
    }

    /// Branch parameter of the topmost Via.
    pub fn top_via_branch(&self) -> Option<String> {
        let via = self.headers.first(&HeaderName::Via)?;
        via.split(';')
            .map(str::trim)
            .find_map(|p| p.strip_prefix("branch="))
            .map(str::to_string)
    }

    // ---- Option tags and identity headers --------------------------------

    /// Whether a token appears in any Supported header.
    pub fn supports(&self, token: &str) -> bool {
        self.headers
            .all(&HeaderName::Supported)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn p_asserted_identity(&self) -> Result<Vec<NameAddr>> {
        let mut out = Vec::new();
        for value in self.headers.all(&HeaderName::PAssertedIdentity) {
            out.extend(NameAddr::parse_list(value)?);
        }
        Ok(out)
    }

    pub fn p_served_user(&self) -> Option<NameAddr> {
        self.headers
            .first(&HeaderName::PServedUser)
            .and_then(|v| v.parse().ok())
    }

    // ---- Serialization ---------------------------------------------------

    /// Wire encoding including the computed Content-Length.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, SIP_VERSION).into_bytes();
        append_headers(&mut out, &self.headers, self.body.len());
        out.extend_from_slice(&self.body);
        out
    }
}

impl Response {
    /// Build a response with the default reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Build a response to a request, copying the dialog-identifying
    /// headers per RFC 3261 8.2.6, and adding a To tag on non-100 final
    /// responses when the request's To had none.
    pub fn for_request(req: &Request, status: StatusCode, reason: Option<&str>) -> Self {
        let mut rsp = Response::new(status);
        if let Some(r) = reason {
            rsp.reason = r.to_string();
        }
        for h in req.headers.iter() {
            match h.name {
                HeaderName::Via | HeaderName::From | HeaderName::CallId | HeaderName::CSeq => {
                    rsp.headers.push(h.name.clone(), h.value.clone());
                }
                HeaderName::To => {
                    let mut value = h.value.clone();
                    if status.0 > 100 && !value.contains("tag=") {
                        value = format!("{};tag={}", value, Uuid::new_v4().simple());
                    }
                    rsp.headers.push(HeaderName::To, value);
                }
                _ => {}
            }
        }
        rsp
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.first(&HeaderName::CallId)
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers
            .first(&HeaderName::CSeq)
            .and_then(|v| v.parse().ok())
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.headers
            .first(&HeaderName::To)
            .and_then(|v| v.parse().ok())
    }

    pub fn contacts(&self) -> Result<Vec<Contact>> {
        let mut out = Vec::new();
        for value in self.headers.all(&HeaderName::Contact) {
            out.extend(Contact::parse_list(value)?);
        }
        Ok(out)
    }

    /// Branch parameter of the topmost Via (fork correlation).
    pub fn top_via_branch(&self) -> Option<String> {
        let via = self.headers.first(&HeaderName::Via)?;
        via.split(';')
            .map(str::trim)
            .find_map(|p| p.strip_prefix("branch="))
            .map(str::to_string)
    }

    /// Remove the topmost Via (this hop's own) before passing upstream.
    pub fn pop_top_via(&mut self) -> Option<Header> {
        self.headers.remove_first(&HeaderName::Via)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            format!("{} {} {}\r\n", SIP_VERSION, self.status, self.reason).into_bytes();
        append_headers(&mut out, &self.headers, self.body.len());
        out.extend_from_slice(&self.body);
        out
    }
}

impl SipMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(r) => r.to_bytes(),
            SipMessage::Response(r) => r.to_bytes(),
        }
    }

    /// Parse a message off the wire.  Folding continuation lines are not
    /// supported; header values keep their received text.
    pub fn parse(input: &str) -> Result<SipMessage> {
        let (head, body) = match input.split_once("\r\n\r\n") {
            Some((h, b)) => (h, b.as_bytes().to_vec()),
            None => match input.split_once("\n\n") {
                Some((h, b)) => (h, b.as_bytes().to_vec()),
                None => (input.trim_end_matches(['\r', '\n']), Vec::new()),
            },
        };
        let mut lines = head.lines();
        let start = lines
            .next()
            .ok_or_else(|| Error::InvalidFormat("empty message".to_string()))?
            .trim_end();

        let mut headers = Headers::new();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidFormat(format!("bad header line: {}", line)))?;
            let name: HeaderName = name.trim().parse().unwrap();
            if name == HeaderName::ContentLength {
                // Recomputed on output; the body is framed by the blank line.
                continue;
            }
            headers.push(name, value.trim());
        }

        if let Some(rest) = start.strip_prefix(SIP_VERSION) {
            // Status line
            let mut parts = rest.trim_start().splitn(2, ' ');
            let code: u16 = parts
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| Error::InvalidFormat(format!("bad status line: {}", start)))?;
            if !(100..700).contains(&code) {
                return Err(Error::InvalidStatusCode(code));
            }
            let reason = parts.next().unwrap_or("").to_string();
            return Ok(SipMessage::Response(Response {
                status: StatusCode(code),
                reason,
                headers,
                body,
            }));
        }

        // Request line
        let mut parts = start.split_whitespace();
        let method: Method = parts
            .next()
            .ok_or_else(|| Error::InvalidFormat(format!("bad request line: {}", start)))?
            .parse()?;
        let uri: Uri = parts
            .next()
            .ok_or_else(|| Error::InvalidFormat(format!("bad request line: {}", start)))?
            .parse()?;
        match parts.next() {
            Some(SIP_VERSION) => {}
            _ => return Err(Error::InvalidFormat(format!("bad request line: {}", start))),
        }
        Ok(SipMessage::Request(Request {
            method,
            uri,
            headers,
            body,
        }))
    }
}

impl FromStr for SipMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SipMessage::parse(s)
    }
}

fn append_headers(out: &mut Vec<u8>, headers: &Headers, body_len: usize) {
    for h in headers.iter() {
        if h.name == HeaderName::ContentLength {
            continue;
        }
        out.extend_from_slice(h.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body_len).as_bytes());
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}
