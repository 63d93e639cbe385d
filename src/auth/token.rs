use super::Credentials;
use crate::constants::{gemini_headers, Endpoint};
use crate::error::{GeminiError, Result};
use crate::transport::{HttpRequest, Method, Transport};
use regex::bytes::Regex;
use std::sync::OnceLock;

fn access_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#""SNlM0e":"([^"]+)""#).expect("valid SNlM0e pattern"))
}

/// Pulls the `SNlM0e` access token out of the landing page HTML.
pub fn extract_access_token(html: &[u8]) -> Option<String> {
    access_token_pattern()
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|token| String::from_utf8_lossy(token.as_bytes()).into_owned())
}

pub fn fetch_access_token(transport: &dyn Transport, credentials: &Credentials) -> Result<String> {
    let endpoint = Endpoint::Init;
    let request = HttpRequest::new(Method::Get, endpoint.url())
        .with_headers(gemini_headers())
        .with_cookies(credentials.cookies());

    let mut response = transport
        .execute(request)
        .map_err(|err| GeminiError::network(endpoint.name(), err))?;
    if response.status != 200 {
        return Err(GeminiError::Auth(format!(
            "failed to fetch access token, status={}",
            response.status
        )));
    }

    let body = response.read_to_end().map_err(|err| GeminiError::Network {
        endpoint: endpoint.name().to_string(),
        message: format!("Failed to read landing page: {err}"),
    })?;
    extract_access_token(&body).ok_or_else(|| {
        GeminiError::Auth("SNlM0e token not found; cookies may be expired".to_string())
    })
}
