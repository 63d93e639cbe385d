//! Endpoints, header sets, cookie names and model definitions for the web service.

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HOST, ORIGIN,
    REFERER, USER_AGENT,
};

pub const SESSION_ID_COOKIE: &str = "__Secure-1PSID";
pub const ROTATION_TOKEN_COOKIE: &str = "__Secure-1PSIDTS";

pub const ROTATE_COOKIES_BODY: &str = r#"[000,"-0000000000000000000"]"#;

const MODEL_HEADER: &str = "x-goog-ext-525001261-jspb";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Landing page carrying the `SNlM0e` access token.
    Init,
    Generate,
    BatchExecute,
    RotateCookies,
    Upload,
}

impl Endpoint {
    pub fn url(&self) -> &'static str {
        match self {
            Endpoint::Init => "https://gemini.google.com/app",
            Endpoint::Generate => "https://gemini.google.com/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate",
            Endpoint::BatchExecute => "https://gemini.google.com/_/BardChatUi/data/batchexecute",
            Endpoint::RotateCookies => "https://accounts.google.com/RotateCookies",
            Endpoint::Upload => "https://content-push.googleapis.com/upload",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Init => "init",
            Endpoint::Generate => "generate",
            Endpoint::BatchExecute => "batchexecute",
            Endpoint::RotateCookies => "rotate-cookies",
            Endpoint::Upload => "upload",
        }
    }
}

/// RPC method ids understood by the batch-execute endpoint.
pub mod rpc_method {
    pub const LIST_GEMS: &str = "CNgdBe";
    pub const CREATE_GEM: &str = "oMH3Zd";
    pub const UPDATE_GEM: &str = "kHv0Vd";
    pub const DELETE_GEM: &str = "UXcSJb";
}

/// Browser-like header set sent with every request to the chat frontend.
pub fn gemini_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded;charset=utf-8"),
    );
    headers.insert(HOST, HeaderValue::from_static("gemini.google.com"));
    headers.insert(ORIGIN, HeaderValue::from_static("https://gemini.google.com"));
    headers.insert(REFERER, HeaderValue::from_static("https://gemini.google.com/"));
    headers.insert(
        HeaderName::from_static("x-same-domain"),
        HeaderValue::from_static("1"),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-site"),
        HeaderValue::from_static("same-origin"),
    );
    headers
}

pub fn rotate_cookies_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

pub fn upload_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("push-id"),
        HeaderValue::from_static("feeds/mcudyrk2a4khkz"),
    );
    headers
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Model {
    /// Lets the service pick its default model.
    #[default]
    Unspecified,
    G2_0Flash,
    G2_0FlashThinking,
    G2_5Flash,
    G2_5Pro,
    /// Requires an advanced subscription.
    G2_0ExpAdvanced,
    /// Requires an advanced subscription.
    G2_5ExpAdvanced,
}

impl Model {
    pub const ALL: [Model; 7] = [
        Model::Unspecified,
        Model::G2_0Flash,
        Model::G2_0FlashThinking,
        Model::G2_5Flash,
        Model::G2_5Pro,
        Model::G2_0ExpAdvanced,
        Model::G2_5ExpAdvanced,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Model::Unspecified => "unspecified",
            Model::G2_0Flash => "gemini-2.0-flash",
            Model::G2_0FlashThinking => "gemini-2.0-flash-thinking",
            Model::G2_5Flash => "gemini-2.5-flash",
            Model::G2_5Pro => "gemini-2.5-pro",
            Model::G2_0ExpAdvanced => "gemini-2.0-exp-advanced",
            Model::G2_5ExpAdvanced => "gemini-2.5-exp-advanced",
        }
    }

    fn header_value(&self) -> Option<&'static str> {
        let value = match self {
            Model::Unspecified => return None,
            Model::G2_0Flash => r#"[1,null,null,null,"f299729663a2343f"]"#,
            Model::G2_0FlashThinking => r#"[null,null,null,null,"7ca48d02d802f20a"]"#,
            Model::G2_5Flash => r#"[1,null,null,null,"35609594dbe934d8"]"#,
            Model::G2_5Pro => r#"[1,null,null,null,"2525e3954d185b3c"]"#,
            Model::G2_0ExpAdvanced => r#"[null,null,null,null,"b1e46a6037e6aa9f"]"#,
            Model::G2_5ExpAdvanced => r#"[null,null,null,null,"203e6bb81620bcfe"]"#,
        };
        Some(value)
    }

    /// Per-model header overrides; empty for [`Model::Unspecified`].
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self.header_value() {
            headers.insert(
                HeaderName::from_static(MODEL_HEADER),
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    pub fn is_advanced_only(&self) -> bool {
        matches!(self, Model::G2_0ExpAdvanced | Model::G2_5ExpAdvanced)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Model::ALL.into_iter().find(|model| model.name() == name)
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Default headers merged with the model's overrides.
pub fn generate_headers(model: Model) -> HeaderMap {
    let mut headers = gemini_headers();
    headers.extend(model.headers());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_round_trip() {
        for model in Model::ALL {
            assert_eq!(Model::from_name(model.name()), Some(model));
        }
        assert_eq!(Model::from_name("gpt-4"), None);
    }

    #[test]
    fn unspecified_model_adds_no_header() {
        assert!(Model::Unspecified.headers().is_empty());
        let headers = generate_headers(Model::G2_5Pro);
        assert_eq!(
            headers.get(MODEL_HEADER).and_then(|v| v.to_str().ok()),
            Some(r#"[1,null,null,null,"2525e3954d185b3c"]"#)
        );
        assert!(headers.get("x-same-domain").is_some());
    }
}
