//! Batched RPC framing for the `batchexecute` endpoint.
//!
//! Calls ride in a triply nested array `[[[method, payload, null, id], ...]]`
//! posted as the `f.req` form field next to `at=<access token>`. The reply is
//! a prefixed, chunked stream whose entries carry the caller's correlation id
//! in their tail slots.

pub mod layout;
pub mod stream;

use crate::auth::Credentials;
use crate::constants::{generate_headers, Endpoint, Model};
use crate::error::{GeminiError, Result};
use crate::transport::{CancelToken, HttpRequest, Method, RequestBody, Transport};
use self::layout::{ENTRY_BODY, ENTRY_STATUS};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

pub use stream::{json_array_lines, strip_truncation_prefix, STREAM_END_SENTINEL};

pub const DEFAULT_CORRELATION_ID: &str = "generic";
pub const ERROR_EXCERPT_LIMIT: usize = 4096;

const REQID_STEP: u64 = 100_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcCall {
    pub method_id: String,
    /// JSON text, sent as a string inside the envelope.
    pub payload: String,
    pub correlation_id: String,
}

impl RpcCall {
    pub fn new(method_id: &str, payload: impl Into<String>) -> Self {
        Self::with_id(method_id, payload, DEFAULT_CORRELATION_ID)
    }

    pub fn with_id(method_id: &str, payload: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            method_id: method_id.to_string(),
            payload: payload.into(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

/// Wire form: `[method_id, payload, null, correlation_id]`.
impl Serialize for RpcCall {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&self.method_id)?;
        seq.serialize_element(&self.payload)?;
        seq.serialize_element(&Option::<()>::None)?;
        seq.serialize_element(&self.correlation_id)?;
        seq.end()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcReply {
    pub correlation_id: String,
    /// The server's inner JSON, verbatim. Empty when the response had no matching entry.
    pub data: String,
    /// In-band status reported for this entry, if any.
    pub error: Option<String>,
}

impl RpcReply {
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.data).map_err(|err| {
            GeminiError::parse(
                format!("reply[{}]", self.correlation_id),
                format!("invalid JSON: {err}"),
            )
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Serialises a batch into the `f.req` value.
pub fn encode_envelope(calls: &[RpcCall]) -> Result<String> {
    serde_json::to_string(&[calls]).map_err(|err| {
        GeminiError::InvalidArgument(format!("failed to encode RPC envelope: {err}"))
    })
}

/// Inverse of [`encode_envelope`].
pub fn decode_envelope(envelope: &str) -> Result<Vec<RpcCall>> {
    let value: Value = serde_json::from_str(envelope)
        .map_err(|err| GeminiError::parse("f.req", format!("invalid JSON: {err}")))?;
    let calls = value
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| GeminiError::parse("f.req[0]", "expected an array of calls"))?;
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            let field = |slot: usize| {
                call.get(slot).and_then(Value::as_str).ok_or_else(|| {
                    GeminiError::parse(format!("f.req[0][{index}][{slot}]"), "expected a string")
                })
            };
            Ok(RpcCall::with_id(field(0)?, field(1)?, field(3)?))
        })
        .collect()
}

pub fn validate_batch(calls: &[RpcCall]) -> Result<()> {
    if calls.is_empty() {
        return Err(GeminiError::InvalidArgument(
            "batch must contain at least one call".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for call in calls {
        if !seen.insert(call.correlation_id.as_str()) {
            return Err(GeminiError::InvalidArgument(format!(
                "duplicate correlation id \"{}\" in batch",
                call.correlation_id
            )));
        }
    }
    Ok(())
}

/// Matches response entries to calls by the correlation id found in each entry's tail.
///
/// Calls with no matching entry keep an empty `data`.
pub fn demultiplex(calls: &[RpcCall], lines: &[Value]) -> Vec<RpcReply> {
    let mut replies: Vec<RpcReply> = calls
        .iter()
        .map(|call| RpcReply {
            correlation_id: call.correlation_id.clone(),
            ..RpcReply::default()
        })
        .collect();

    let entries = lines
        .iter()
        .filter_map(Value::as_array)
        .flatten()
        .filter(|entry| entry.is_array());
    for entry in entries {
        let Some(index) = entry
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .skip(3)
            .rev()
            .filter_map(Value::as_str)
            .find_map(|tag| calls.iter().position(|call| call.correlation_id == tag))
        else {
            continue;
        };
        let reply = &mut replies[index];
        if let Some(data) = ENTRY_BODY.str(entry) {
            if reply.data.is_empty() {
                reply.data = data.to_string();
            }
        }
        if let Some(status) = ENTRY_STATUS.get(entry).filter(|status| !status.is_null()) {
            reply.error = Some(status.to_string());
        }
    }
    replies
}

/// `_reqid` query parameter: random base, stepped per request.
pub struct RequestCounter(AtomicU64);

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(rand::random_range(1_000..10_000)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(REQID_STEP, Ordering::Relaxed)
    }
}

/// Authenticated state a batch needs, copied out of the controller.
pub struct BatchContext<'a> {
    pub transport: &'a dyn Transport,
    pub credentials: &'a Credentials,
    pub access_token: &'a str,
    pub model: Model,
    pub reqid: u64,
    pub cancel: Option<&'a CancelToken>,
}

pub fn batch_url(calls: &[RpcCall], reqid: u64) -> Result<String> {
    let method_ids = calls
        .iter()
        .map(|call| call.method_id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let mut url = url::Url::parse(Endpoint::BatchExecute.url())
        .map_err(|err| GeminiError::InvalidArgument(format!("invalid endpoint URL: {err}")))?;
    url.query_pairs_mut()
        .append_pair("rpcids", &method_ids)
        .append_pair("_reqid", &reqid.to_string())
        .append_pair("rt", "c")
        .append_pair("source-path", "/app");
    Ok(url.into())
}

/// Posts one batch and returns one reply per call, in call order.
pub fn batch_execute(context: &BatchContext<'_>, calls: &[RpcCall]) -> Result<Vec<RpcReply>> {
    validate_batch(calls)?;

    let endpoint = Endpoint::BatchExecute;
    let envelope = encode_envelope(calls)?;
    let request = HttpRequest::new(Method::Post, batch_url(calls, context.reqid)?)
        .with_headers(generate_headers(context.model))
        .with_body(RequestBody::form(&[
            ("at", context.access_token),
            ("f.req", &envelope),
        ]))
        .with_cookies(context.credentials.cookies())
        .with_cancel(context.cancel.cloned());

    tracing::debug!(calls = calls.len(), "posting batch");
    let mut response = context
        .transport
        .execute(request)
        .map_err(|err| GeminiError::network(endpoint.name(), err))?;

    match response.status {
        200 => {}
        401 => {
            return Err(GeminiError::Auth(format!(
                "{} rejected the session with status 401",
                endpoint.name()
            )))
        }
        status => {
            return Err(GeminiError::Api {
                endpoint: endpoint.name().to_string(),
                status,
                excerpt: response.excerpt(ERROR_EXCERPT_LIMIT),
            })
        }
    }

    let body = stream::read_until_sentinel(
        &mut response,
        stream::BATCH_BUFFER_SIZE,
        endpoint.name(),
        context.cancel,
    )?;
    let lines = stream::require_json_lines(&body)?;
    Ok(demultiplex(calls, &lines))
}
