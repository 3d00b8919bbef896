//! # Handler Contract
//!
//! What a compiled handler module exposes to the dispatcher, and the
//! request/response values it works on.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use super::errors::{Fault, FaultResult};
use crate::snapshot::ContentStream;

/// One capability a handler may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Bound to its own source path; owns the response when invoked
    Script,
    /// Offered every request until one claims it
    Processor,
    /// Offered faults before the default error page
    ExceptionHandler,
}

/// Capability descriptor computed once when a handler is loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub script: bool,
    pub processor: bool,
    pub exception_handler: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        script: false,
        processor: false,
        exception_handler: false,
    };

    pub fn with(mut self, capability: Capability) -> Self {
        match capability {
            Capability::Script => self.script = true,
            Capability::Processor => self.processor = true,
            Capability::ExceptionHandler => self.exception_handler = true,
        }
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        match capability {
            Capability::Script => self.script,
            Capability::Processor => self.processor,
            Capability::ExceptionHandler => self.exception_handler,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.script {
            names.push("script");
        }
        if self.processor {
            names.push("processor");
        }
        if self.exception_handler {
            names.push("exception-handler");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("+"))
        }
    }
}

/// Incoming request as seen by handlers
#[derive(Debug, Clone, Default)]
pub struct HandlerRequest {
    /// HTTP method, unused by dispatch itself
    pub method: String,

    /// Raw request target, e.g. `/docs/index.html`
    pub target: String,

    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,

    pub remote_addr: Option<SocketAddr>,
}

impl HandlerRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn post(target: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("POST", target).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header named `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remote address for log lines
    pub fn peer(&self) -> String {
        self.remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Buffered response written by the dispatch chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl HandlerResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing any previous value of the same name
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Drop anything written so far
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl io::Write for HandlerResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An instantiated handler.
///
/// Instances are shared by every request served from the same snapshot and
/// may be invoked concurrently. The dispatcher only calls the methods that
/// match the instance's [`Capabilities`].
pub trait Handler: Send + Sync {
    /// Capabilities this handler satisfies
    fn capabilities(&self) -> Capabilities;

    /// Serve a request for the handler's own path
    fn execute(
        &self,
        path: &str,
        _request: &HandlerRequest,
        _response: &mut HandlerResponse,
    ) -> FaultResult<()> {
        Err(Fault::bad_request(format!(
            "This file ({}) can't be requested this way. Maybe it should be hidden",
            path
        )))
    }

    /// Offer a request; `content` is `None` when no servable file matched.
    /// Returns `true` when the request was handled.
    fn process(
        &self,
        _path: &str,
        _content: &mut Option<ContentStream>,
        _request: &HandlerRequest,
        _response: &mut HandlerResponse,
    ) -> FaultResult<bool> {
        Ok(false)
    }

    /// Offer a fault; returns `true` when the handler produced the response
    fn handle(
        &self,
        _path: &str,
        _request: &HandlerRequest,
        _response: &mut HandlerResponse,
        _fault: &Fault,
    ) -> FaultResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_capabilities_builder() {
        let caps = Capabilities::NONE
            .with(Capability::Processor)
            .with(Capability::ExceptionHandler);

        assert!(caps.contains(Capability::Processor));
        assert!(caps.contains(Capability::ExceptionHandler));
        assert!(!caps.contains(Capability::Script));
        assert_eq!(caps.to_string(), "processor+exception-handler");
        assert_eq!(Capabilities::NONE.to_string(), "none");
        assert!(Capabilities::default().is_empty());
    }

    #[test]
    fn test_request_header_lookup() {
        let request = HandlerRequest::get("/a").with_header("Content-Type", "text/plain");
        assert_eq!(request.header("content-type"), Some("text/plain"));
        assert_eq!(request.header("accept"), None);
        assert_eq!(request.peer(), "-");
    }

    #[test]
    fn test_response_write_and_reset() {
        let mut response = HandlerResponse::new();
        response.set_status(201);
        response.set_header("X-A", "1");
        response.set_header("x-a", "2");
        write!(response, "hello").unwrap();

        assert_eq!(response.header("X-A"), Some("2"));
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.body_text(), "hello");

        response.reset();
        assert_eq!(response, HandlerResponse::default());
    }

    struct Plain;

    impl Handler for Plain {
        fn capabilities(&self) -> Capabilities {
            Capabilities::NONE
        }
    }

    #[test]
    fn test_default_execute_is_bad_request() {
        let mut response = HandlerResponse::new();
        let fault = Plain
            .execute("Plain.wat", &HandlerRequest::get("/Plain.wat"), &mut response)
            .unwrap_err();
        assert_eq!(fault.status_code(), 400);
    }
}
