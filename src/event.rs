//! SSE event model.
//!
//! An event is constructed from a raw JSON payload and compiled on demand:
//! `compile` parses the JSON (required `data`, optional `id`/`event`/`retry`)
//! and `serialize` renders the SSE wire frame.  The event path can be forced
//! with `set_path` before compiling, in which case the JSON `path` field is
//! ignored; this is how events published on `POST /<channel>` are pinned to
//! the endpoint they arrived on.

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct Event {
    raw: String,
    path: String,
    basepath: String,
    subpath: String,
    id: Option<String>,
    event: Option<String>,
    retry: u64,
    data: Vec<String>,
}

impl Event {
    /// Store the raw JSON payload. No parsing happens until `compile`.
    pub fn new(json: impl Into<String>) -> Self {
        Event {
            raw: json.into(),
            ..Default::default()
        }
    }

    /// Force the event path. Must be called before `compile` to take effect.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// Parse the stored JSON. Returns false on malformed JSON, a missing
    /// `data` field, or a missing `path` when none was forced. Absent
    /// optional fields are not an error.
    pub fn compile(&mut self) -> bool {
        let parsed: Value = match serde_json::from_str(&self.raw) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let obj = match parsed.as_object() {
            Some(o) => o,
            None => return false,
        };

        if self.path.is_empty() {
            match obj.get("path").and_then(Value::as_str) {
                Some(p) => self.path = p.to_owned(),
                None => return false,
            }
        }

        let data = match obj.get("data").and_then(Value::as_str) {
            Some(d) => d,
            None => return false,
        };
        self.data = data.split('\n').map(str::to_owned).collect();

        self.id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        self.event = obj
            .get("event")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        self.retry = obj.get("retry").and_then(Value::as_u64).unwrap_or(0);

        self.derive_paths();
        true
    }

    fn derive_paths(&mut self) {
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

    pub fn path(&self) -> &str {
        &self.path
    }

    /// First path segment: the channel the event belongs to.
    pub fn basepath(&self) -> &str {
        &self.basepath
    }

    /// Remainder of the path after the first segment; secondary filter target.
    pub fn subpath(&self) -> &str {
        &self.subpath
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Render the SSE wire frame. Empty iff `data` or `path` is empty.
    pub fn serialize(&self) -> String {
        if self.data.is_empty() || self.path.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if self.retry > 0 {
            out.push_str("retry: ");
            out.push_str(&self.retry.to_string());
            out.push('\n');
        }
        for line in &self.data {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}
