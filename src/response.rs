//! Minimal HTTP/1.1 response rendering.
//!
//! Covers the handful of replies this server sends: short status responses,
//! the stats document, and the SSE preamble (a 200 with stream headers and
//! no body, so no Content-Length is emitted).

#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        // Informational responses carry no body and no length; a bodyless
        // final response (the SSE preamble) leaves the length open.
        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::Response;

    #[test]
    fn status_only_response() {
        assert_eq!(Response::new(100).render(), "HTTP/1.1 100 Continue\r\n\r\n");
    }

    #[test]
    fn body_sets_content_length() {
        let mut res = Response::new(200);
        res.body("OK\n");
        assert_eq!(
            res.render(),
            "HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nOK\n"
        );
    }

    #[test]
    fn headers_render_in_insertion_order() {
        let mut res = Response::new(200);
        res.header("Content-Type", "text/event-stream");
        res.header("Cache-Control", "no-cache");
        let rendered = res.render();
        let ct = rendered.find("Content-Type").unwrap();
        let cc = rendered.find("Cache-Control").unwrap();
        assert!(ct < cc);
        assert!(rendered.ends_with("\r\n\r\n"));
    }
}
