//! HTTP seam used by every network operation.
//!
//! The core never talks to the network directly: it builds an [`HttpRequest`]
//! and hands it to an injected [`Transport`]. Production callers are expected
//! to inject a transport that presents a current browser TLS fingerprint;
//! [`ReqwestTransport`] is a plain rustls-backed default.

use reqwest::header::{HeaderMap, COOKIE};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

/// Shared cancellation flag passed from the public boundary down to the transport.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    Text(String),
    Form(Vec<(String, String)>),
    /// Single-file `multipart/form-data` body.
    Multipart {
        field: String,
        filename: String,
        mime_type: String,
        data: Vec<u8>,
    },
}

impl RequestBody {
    pub fn form(fields: &[(&str, &str)]) -> Self {
        RequestBody::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// Value of a form field, if this is a form body.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        match self {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

pub fn encode_form(fields: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub cookies: Vec<(String, String)>,
    pub cancel: Option<CancelToken>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            cookies: Vec::new(),
            cancel: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_cookies(mut self, cookies: Vec<(String, String)>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<CancelToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `Cookie` header value for the attached cookies.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Cookies set by the response, as `(name, value)` pairs.
    pub set_cookies: Vec<(String, String)>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            set_cookies: Vec::new(),
            body: Box::new(io::Cursor::new(body.into())),
        }
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.set_cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.set_cookies
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.body.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Reads at most `limit` bytes of the body, lossily decoded.
    pub fn excerpt(&mut self, limit: usize) -> String {
        let mut buffer = Vec::new();
        let _ = (&mut self.body).take(limit as u64).read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("set_cookies", &self.set_cookies)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<F> Transport for F
where
    F: Fn(HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync,
{
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self(request)
    }
}

#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
        }
    }
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(options: TransportOptions) -> Result<Self, TransportError> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(proxy) = options.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| TransportError::Failed(format!("Invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| TransportError::Failed(format!("Failed to build client: {err}")))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if request.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.headers(request.headers.clone());
        if let Some(cookie) = request.cookie_header() {
            builder = builder.header(COOKIE, cookie);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Text(text) => builder.body(text),
            RequestBody::Form(fields) => builder.body(encode_form(&fields)),
            RequestBody::Multipart {
                field,
                filename,
                mime_type,
                data,
            } => {
                let part = reqwest::blocking::multipart::Part::bytes(data)
                    .file_name(filename)
                    .mime_str(&mime_type)
                    .map_err(|err| TransportError::Failed(format!("Invalid MIME type: {err}")))?;
                builder.multipart(reqwest::blocking::multipart::Form::new().part(field, part))
            }
        };

        let response = builder.send().map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Failed(format!("Request failed: {err}"))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let set_cookies = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();
        let body: Box<dyn Read + Send> = match request.cancel {
            Some(cancel) => Box::new(CancellableReader {
                inner: response,
                cancel,
            }),
            None => Box::new(response),
        };

        Ok(HttpResponse {
            status,
            headers,
            set_cookies,
            body,
        })
    }
}

struct CancellableReader<R> {
    inner: R,
    cancel: CancelToken,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("request cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_encoding_escapes_json() {
        let body = encode_form(&[
            ("at".to_string(), "tok:1".to_string()),
            ("f.req".to_string(), r#"[null,"[]"]"#.to_string()),
        ]);
        assert_eq!(body, "at=tok%3A1&f.req=%5Bnull%2C%22%5B%5D%22%5D");
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let request = HttpRequest::new(Method::Get, "https://example.com").with_cookies(vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert_eq!(request.cookie_header().as_deref(), Some("a=1; b=2"));
        assert_eq!(request.cookie("b"), Some("2"));
    }

    #[test]
    fn cancelled_reader_stops_reading() {
        let cancel = CancelToken::new();
        let mut reader = CancellableReader {
            inner: io::Cursor::new(b"abc".to_vec()),
            cancel: cancel.clone(),
        };
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        cancel.cancel();
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn excerpt_is_bounded() {
        let mut response = HttpResponse::new(500, vec![b'x'; 10_000]);
        assert_eq!(response.excerpt(4096).len(), 4096);
    }
}
