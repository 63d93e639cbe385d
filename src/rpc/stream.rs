use crate::error::{GeminiError, Result};
use crate::transport::{CancelToken, HttpResponse};
use serde_json::Value;
use std::io::Read;

/// Marks the final chunk of a streamed reply: `[["e",<status>,null,null,<bytes>]]`.
pub const STREAM_END_SENTINEL: &[u8] = br#"[["e","#;

pub const BATCH_BUFFER_SIZE: usize = 8 * 1024;
pub const GENERATE_BUFFER_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Reads the body until the end-of-stream chunk shows up or the body ends.
pub fn read_until_sentinel(
    response: &mut HttpResponse,
    initial_capacity: usize,
    endpoint: &str,
    cancel: Option<&CancelToken>,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(initial_capacity);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(GeminiError::Cancelled);
        }
        let read = match response.body.read(&mut chunk) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    return Err(GeminiError::Cancelled);
                }
                return Err(GeminiError::Network {
                    endpoint: endpoint.to_string(),
                    message: format!("Failed to read response body: {err}"),
                });
            }
        };
        if read == 0 {
            break;
        }
        // The sentinel may straddle two reads.
        let search_from = buffer.len().saturating_sub(STREAM_END_SENTINEL.len() - 1);
        buffer.extend_from_slice(&chunk[..read]);
        if contains(&buffer[search_from..], STREAM_END_SENTINEL) {
            break;
        }
    }
    Ok(buffer)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Drops the anti-XSSI prefix (`)]}'`, or the stray `)]}` variant).
pub fn strip_truncation_prefix(text: &str) -> &str {
    let trimmed = text.trim_start();
    trimmed
        .strip_prefix(")]}'")
        .or_else(|| trimmed.strip_prefix(")]}"))
        .unwrap_or(trimmed)
}

/// Every line of the body that parses as a JSON array.
///
/// Blank lines and the chunk size prefixes (bare numbers) are skipped.
pub fn json_array_lines(body: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(body);
    strip_truncation_prefix(&text)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_array)
        .collect()
}

/// Like [`json_array_lines`] but fails when nothing usable was found.
pub fn require_json_lines(body: &[u8]) -> Result<Vec<Value>> {
    let lines = json_array_lines(body);
    if lines.is_empty() {
        let excerpt: String = String::from_utf8_lossy(body).chars().take(200).collect();
        return Err(GeminiError::parse(
            "$",
            format!("no JSON line found in response: {excerpt}"),
        ));
    }
    Ok(lines)
}
