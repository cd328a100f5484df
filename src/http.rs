//! Incremental HTTP/1.1 request parsing.
//!
//! One `RequestParser` lives for the duration of a client's handshake and is
//! fed raw socket chunks as they arrive.  Successive `parse` calls append to
//! an internal buffer and re-run httparse over the whole thing, so a request
//! split across arbitrarily small reads parses to the same state as one fed
//! in a single chunk.  Header bytes are bounded by `HTTPREQ_BUFSIZ` and POST
//! body bytes by `HTTP_POST_MAX`.

use std::collections::HashMap;

/// Maximum accepted header length in bytes. A request whose headers total
/// exactly this many bytes is accepted; one more is rejected.
pub const HTTPREQ_BUFSIZ: usize = 4096;

/// Maximum accepted POST body length in bytes.
pub const HTTP_POST_MAX: usize = 1_048_576;

const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Full non-POST request completed.
    Ok,
    /// Headers not yet terminated; keep reading.
    Incomplete,
    /// Header bytes would exceed `HTTPREQ_BUFSIZ`.
    TooBig,
    /// Malformed request line or headers.
    Failed,
    /// Headers completed; POST with a valid Content-Length, body pending.
    PostStart,
    /// POST without a usable Content-Length (missing, non-integer, or < 1).
    PostInvalidLength,
    /// POST body bytes absorbed so far are short of Content-Length.
    PostIncomplete,
    /// POST body fully absorbed.
    PostOk,
    /// POST body bytes would exceed `HTTP_POST_MAX`.
    PostTooLarge,
}

#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
    headers_complete: bool,
    is_post: bool,
    post_expected: usize,
    post_received: usize,
    post_body: Vec<u8>,
    method: String,
    path: String,
    basepath: String,
    subpath: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of raw request bytes.
    pub fn parse(&mut self, data: &[u8]) -> ParseStatus {
        if self.is_post {
            return self.absorb_body(data);
        }
        if self.headers_complete {
            return ParseStatus::Ok;
        }
        if self.buf.len() + data.len() > HTTPREQ_BUFSIZ {
            return ParseStatus::TooBig;
        }
        self.buf.extend_from_slice(data);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let consumed = match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return ParseStatus::Incomplete,
            Err(_) => return ParseStatus::Failed,
        };

        self.method = req.method.unwrap_or("").to_owned();
        let raw_path = req.path.unwrap_or("").to_owned();
        for header in req.headers.iter() {
            let value = match std::str::from_utf8(header.value) {
                Ok(v) => v.trim().to_owned(),
                Err(_) => return ParseStatus::Failed,
            };
            self.headers.insert(header.name.to_ascii_lowercase(), value);
        }
        self.split_path_and_query(&raw_path);
        self.headers_complete = true;

        if self.method == "POST" {
            let expected = match self.content_length() {
                Some(n) if n >= 1 => n,
                _ => return ParseStatus::PostInvalidLength,
            };
            if expected > HTTP_POST_MAX {
                return ParseStatus::PostTooLarge;
            }
            self.post_expected = expected;
            self.is_post = true;

            // Body bytes trailing the header terminator in the same chunk
            // re-enter as the first body chunk.
            if self.buf.len() > consumed {
                let rest = self.buf.split_off(consumed);
                return self.parse(&rest);
            }
            return ParseStatus::PostStart;
        }

        ParseStatus::Ok
    }

    fn absorb_body(&mut self, data: &[u8]) -> ParseStatus {
        self.post_received += data.len();
        if self.post_received > HTTP_POST_MAX {
            self.post_body.clear();
            return ParseStatus::PostTooLarge;
        }
        self.post_body.extend_from_slice(data);
        if self.post_received < self.post_expected {
            return ParseStatus::PostIncomplete;
        }
        // Anything past the declared length is not part of the body.
        self.post_body.truncate(self.post_expected);
        ParseStatus::PostOk
    }

    fn content_length(&self) -> Option<usize> {
        self.headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
    }

    fn split_path_and_query(&mut self, raw: &str) {
        match raw.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_owned();
                self.parse_query(query);
            }
            None => self.path = raw.to_owned(),
        }

        let path = self.path.clone();
        let trimmed = path.strip_prefix('/').unwrap_or(&path);
        match trimmed.split_once('/') {
            Some((base, sub)) => {
                self.basepath = base.to_owned();
                self.subpath = sub.to_owned();
            }
            None => {
                self.basepath = trimmed.to_owned();
                self.subpath = String::new();
            }
        }
    }

    fn parse_query(&mut self, query: &str) {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key.is_empty() || value.is_empty() {
                    continue;
                }
                self.query.insert(key.to_ascii_lowercase(), value.to_owned());
            }
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn basepath(&self) -> &str {
        &self.basepath
    }

    pub fn subpath(&self) -> &str {
        &self.subpath
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Case-insensitive query parameter lookup. Duplicate keys keep the last
    /// value seen.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn num_query_params(&self) -> usize {
        self.query.len()
    }

    pub fn post_data(&self) -> String {
        String::from_utf8_lossy(&self.post_body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::{HTTP_POST_MAX, HTTPREQ_BUFSIZ, ParseStatus, RequestParser};

    const GET_REQ: &str =
        "GET /news/sports?event=msg&ID=42 HTTP/1.1\r\nHost: x\r\nLast-Event-ID: 7\r\n\r\n";

    #[test]
    fn single_chunk_get_parses() {
        let mut p = RequestParser::new();
        assert_eq!(p.parse(GET_REQ.as_bytes()), ParseStatus::Ok);
        assert_eq!(p.method(), "GET");
        assert_eq!(p.path(), "/news/sports");
        assert_eq!(p.basepath(), "news");
        assert_eq!(p.subpath(), "sports");
        assert_eq!(p.header("last-event-id"), Some("7"));
        assert_eq!(p.header("LAST-EVENT-ID"), Some("7"));
        assert_eq!(p.query_param("event"), Some("msg"));
        assert_eq!(p.query_param("id"), Some("42"));
    }

    #[test]
    fn byte_by_byte_matches_single_chunk() {
        let mut whole = RequestParser::new();
        assert_eq!(whole.parse(GET_REQ.as_bytes()), ParseStatus::Ok);

        let mut split = RequestParser::new();
        let bytes = GET_REQ.as_bytes();
        for b in &bytes[..bytes.len() - 1] {
            assert_eq!(split.parse(std::slice::from_ref(b)), ParseStatus::Incomplete);
        }
        assert_eq!(
            split.parse(std::slice::from_ref(&bytes[bytes.len() - 1])),
            ParseStatus::Ok
        );

        assert_eq!(split.path(), whole.path());
        assert_eq!(split.basepath(), whole.basepath());
        assert_eq!(split.subpath(), whole.subpath());
        assert_eq!(split.header("host"), whole.header("host"));
        assert_eq!(split.query_param("event"), whole.query_param("event"));
    }

    #[test]
    fn duplicate_query_keys_keep_the_last_value() {
        let mut p = RequestParser::new();
        let req = "GET /c?event=a&event=b HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::Ok);
        assert_eq!(p.query_param("event"), Some("b"));
        assert_eq!(p.num_query_params(), 1);
    }

    #[test]
    fn empty_query_keys_and_values_are_skipped() {
        let mut p = RequestParser::new();
        let req = "GET /c?=x&a=&b=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::Ok);
        assert_eq!(p.query_param("a"), None);
        assert_eq!(p.query_param("b"), Some("1"));
        assert_eq!(p.num_query_params(), 1);
    }

    #[test]
    fn malformed_request_line_fails() {
        let mut p = RequestParser::new();
        assert_eq!(p.parse(b"NOT A REQUEST\r\n\r\n"), ParseStatus::Failed);
    }

    #[test]
    fn header_at_limit_is_accepted_one_past_is_rejected() {
        // Build a request totalling exactly HTTPREQ_BUFSIZ bytes.
        let skeleton = "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: \r\n\r\n";
        let pad = HTTPREQ_BUFSIZ - skeleton.len();
        let at_limit = format!(
            "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: {}\r\n\r\n",
            "a".repeat(pad)
        );
        assert_eq!(at_limit.len(), HTTPREQ_BUFSIZ);
        let mut p = RequestParser::new();
        assert_eq!(p.parse(at_limit.as_bytes()), ParseStatus::Ok);

        let over = format!(
            "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: {}\r\n\r\n",
            "a".repeat(pad + 1)
        );
        let mut p = RequestParser::new();
        assert_eq!(p.parse(over.as_bytes()), ParseStatus::TooBig);
    }

    #[test]
    fn post_without_content_length_is_invalid() {
        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostInvalidLength);
    }

    #[test]
    fn post_with_zero_or_garbage_content_length_is_invalid() {
        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostInvalidLength);

        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: ten\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostInvalidLength);
    }

    #[test]
    fn post_headers_only_starts_the_body_phase() {
        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostStart);
        assert_eq!(p.parse(b"he"), ParseStatus::PostIncomplete);
        assert_eq!(p.parse(b"llo"), ParseStatus::PostOk);
        assert_eq!(p.post_data(), "hello");
    }

    #[test]
    fn post_body_in_the_same_chunk_completes_immediately() {
        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostOk);
        assert_eq!(p.post_data(), "hello");
        assert_eq!(p.basepath(), "news");
    }

    #[test]
    fn post_partial_body_in_the_same_chunk_is_incomplete() {
        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostIncomplete);
        assert_eq!(p.parse(b"lo"), ParseStatus::PostOk);
        assert_eq!(p.post_data(), "hello");
    }

    #[test]
    fn oversized_declared_body_is_rejected_at_header_time() {
        let mut p = RequestParser::new();
        let req = format!(
            "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            HTTP_POST_MAX + 1
        );
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostTooLarge);
    }

    #[test]
    fn oversized_absorbed_body_is_rejected() {
        let mut p = RequestParser::new();
        let req = format!(
            "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: {HTTP_POST_MAX}\r\n\r\n"
        );
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostStart);
        let chunk = vec![b'x'; HTTP_POST_MAX / 2];
        assert_eq!(p.parse(&chunk), ParseStatus::PostIncomplete);
        assert_eq!(p.parse(&chunk), ParseStatus::PostOk);

        let mut p = RequestParser::new();
        let req = "POST /news HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::PostStart);
        let chunk = vec![b'x'; HTTP_POST_MAX + 1];
        assert_eq!(p.parse(&chunk), ParseStatus::PostTooLarge);
    }

    #[test]
    fn header_names_are_case_folded() {
        let mut p = RequestParser::new();
        let req = "GET / HTTP/1.1\r\nHOST: example\r\nX-Thing: v\r\n\r\n";
        assert_eq!(p.parse(req.as_bytes()), ParseStatus::Ok);
        assert_eq!(p.header("host"), Some("example"));
        assert_eq!(p.header("x-thing"), Some("v"));
    }

    #[test]
    fn completed_request_stays_completed() {
        let mut p = RequestParser::new();
        assert_eq!(p.parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), ParseStatus::Ok);
        assert_eq!(p.parse(b""), ParseStatus::Ok);
    }

    #[test]
    fn root_path_has_empty_basepath() {
        let mut p = RequestParser::new();
        assert_eq!(p.parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), ParseStatus::Ok);
        assert_eq!(p.path(), "/");
        assert_eq!(p.basepath(), "");
        assert_eq!(p.subpath(), "");
    }
}
