//! Request-side model: method, version, fields, and the per-request state
//! the parser fills in.

use std::any::Any;
use std::collections::HashMap;

use bytes::BytesMut;

/// Request attribute that MAY carry a replacement connection, observed when
/// a 101 Switching Protocols response completes.
pub const SWITCHED_CONNECTION_ATTRIBUTE: &str = "selwire.connection.switched";

/// HTTP protocol version on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Other(String),
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Other(s) => s,
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Method::Head)
    }
}

/// An ordered header-field collection with case-insensitive lookup.
#[derive(Debug, Default, Clone)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn new() -> Self {
        Fields(Vec::new())
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// The request the parser assembled for the current round trip.
pub struct Request {
    method: Method,
    target: String,
    version: HttpVersion,
    fields: Fields,
    content: BytesMut,
    attributes: HashMap<String, Box<dyn Any + Send + Sync>>,
    async_started: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Request {
            method: Method::Get,
            target: String::new(),
            version: HttpVersion::Http11,
            fields: Fields::new(),
            content: BytesMut::new(),
            attributes: HashMap::new(),
            async_started: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Request body accumulated by the parser.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn is_head(&self) -> bool {
        self.method.is_head()
    }

    pub(crate) fn set_request_line(&mut self, method: Method, target: &str, version: HttpVersion) {
        self.method = method;
        self.target = target.to_string();
        self.version = version;
    }

    pub(crate) fn add_field(&mut self, name: &str, value: &str) {
        self.fields.add(name, value);
    }

    pub(crate) fn append_content(&mut self, content: &[u8]) {
        self.content.extend_from_slice(content);
    }

    /// Attach an attribute. Used by handlers to hand state to the engine,
    /// e.g. [`SWITCHED_CONNECTION_ATTRIBUTE`].
    pub fn set_attribute(&mut self, name: impl Into<String>, value: Box<dyn Any + Send + Sync>) {
        self.attributes.insert(name.into(), value);
    }

    pub fn attribute(&self, name: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.attributes.get(name).map(|b| b.as_ref())
    }

    pub fn take_attribute(&mut self, name: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.attributes.remove(name)
    }

    /// Whether the handler started asynchronous suspension of this request.
    pub fn is_async_started(&self) -> bool {
        self.async_started
    }

    pub(crate) fn set_async_started(&mut self, started: bool) {
        self.async_started = started;
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.target.clear();
        self.version = HttpVersion::Http11;
        self.fields.clear();
        self.content.clear();
        self.attributes.clear();
        self.async_started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_lookup_is_case_insensitive() {
        let mut fields = Fields::new();
        fields.add("Content-Type", "text/plain");
        assert_eq!(fields.get("content-type"), Some("text/plain"));
        assert_eq!(fields.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(!fields.contains("content-length"));
    }

    #[test]
    fn method_round_trip() {
        assert_eq!(Method::from_token("GET"), Method::Get);
        assert_eq!(Method::from_token("get"), Method::Other("get".to_string()));
        assert!(Method::from_token("HEAD").is_head());
        assert_eq!(Method::from_token("PATCH").as_str(), "PATCH");
    }

    #[test]
    fn attributes_round_trip() {
        let mut request = Request::new();
        request.set_attribute("key", Box::new(42usize));
        let value = request.attribute("key").unwrap();
        assert_eq!(*value.downcast_ref::<usize>().unwrap(), 42);
        let taken = request.take_attribute("key").unwrap();
        assert_eq!(*taken.downcast::<usize>().unwrap(), 42);
        assert!(request.attribute("key").is_none());
    }
}
