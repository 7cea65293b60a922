use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// `Http20` is recognized by the parser but never served; see the version
/// check in the start-line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
    Http20,
    Unknown,
}

impl Version {
    pub fn from_token(token: &str) -> Self {
        match token {
            "HTTP/1.0" => Version::Http10,
            "HTTP/1.1" => Version::Http11,
            "HTTP/2.0" => Version::Http20,
            _ => Version::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http20 => "HTTP/2.0",
            Version::Unknown => "UNKNOWN",
        }
    }
}

/// Header map that preserves insertion order and original field-name case
/// while answering lookups ASCII-case-insensitively.
///
/// A lowercased index points into the ordered entry list, so iteration sees
/// headers exactly as they arrived on the wire. Inserting a name that is
/// already present (in any case) replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let key = name.to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        let Some(i) = self.index.remove(&key) else {
            return false;
        };
        self.entries.remove(i);
        // Entries after the removal point shifted down by one.
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates in insertion order with original case.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

/// A parsed HTTP/1.x request.
///
/// Built incrementally by the parser; metadata (remote address, receive
/// time, request id) is stamped by the server once the request completes.
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    query: String,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
    query_params: OnceLock<HashMap<String, String>>,
    remote_addr: Option<SocketAddr>,
    received_at: Option<SystemTime>,
    request_id: u64,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            path: String::new(),
            query: String::new(),
            version: Version::Unknown,
            headers: Headers::new(),
            body: Vec::new(),
            query_params: OnceLock::new(),
            remote_addr: None,
            received_at: None,
            request_id: 0,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Raw request-target up to the first `?`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw, un-decoded query string (empty when the target had no `?`).
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Query parameters, split on `&` and `=` on first access. No percent
    /// decoding is applied; values are as they appeared in the target.
    pub fn query_params(&self) -> &HashMap<String, String> {
        self.query_params.get_or_init(|| {
            let mut params = HashMap::new();
            for pair in self.query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => params.insert(k.to_string(), v.to_string()),
                    None => params.insert(pair.to_string(), String::new()),
                };
            }
            params
        })
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params().get(key).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// HTTP/1.1 stays open unless the client sends `Connection: close`;
    /// HTTP/1.0 closes unless it sends `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(value) if self.version == Version::Http11 => {
                !value.eq_ignore_ascii_case("close")
            }
            Some(value) => value.eq_ignore_ascii_case("keep-alive"),
            None => self.version == Version::Http11,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn received_at(&self) -> Option<SystemTime> {
        self.received_at
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn set_received_at(&mut self, time: SystemTime) {
        self.received_at = Some(time);
    }

    pub fn set_request_id(&mut self, id: u64) {
        self.request_id = id;
    }

    /// Serializes the request back to wire form: start line, headers in
    /// insertion order with original case, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let target = if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        };
        let mut out = format!(
            "{} {} {}\r\n",
            self.method.as_str(),
            target,
            self.version.as_str()
        );
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_path(&mut self, path: String) {
        self.path = path;
    }

    pub(crate) fn set_query(&mut self, query: String) {
        self.query = query;
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn add_header(&mut self, name: String, value: String) {
        self.headers.insert(name, value);
    }

    pub(crate) fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }
}

// Metadata and the lazy query cache are excluded: two requests are equal
// when they would serialize to the same message.
impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.path == other.path
            && self.query == other.query
            && self.version == other.version
            && self.headers == other.headers
            && self.body == other.body
    }
}
