//! Anonymous content-push uploads.
//!
//! The upload endpoint takes no session cookies; the returned resource id is
//! what a prompt later references.

use super::Client;
use crate::constants::{upload_headers, Endpoint};
use crate::error::{GeminiError, Result};
use crate::rpc::ERROR_EXCERPT_LIMIT;
use crate::transport::{CancelToken, HttpRequest, Method, RequestBody, Transport};
use crate::types::UploadedFile;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::Path;

pub const IMAGE_SIZE_LIMIT: u64 = 20 * 1024 * 1024;
pub const FILE_SIZE_LIMIT: u64 = 50 * 1024 * 1024;

const RESOURCE_ID_PREFIX: &str = "/contrib_service/";
const UPLOAD_FIELD: &str = "file";
const TEXT_CHARSET: &str = "; charset=utf-8";
const DEFAULT_TEXT_MIME: &str = "text/plain; charset=utf-8";

const TEXT_LIKE_MIME_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/pdf",
    "application/javascript",
    "application/x-sh",
    "application/x-yaml",
    "application/toml",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileClass {
    Image,
    Text,
}

impl FileClass {
    pub fn size_limit(&self) -> u64 {
        match self {
            FileClass::Image => IMAGE_SIZE_LIMIT,
            FileClass::Text => FILE_SIZE_LIMIT,
        }
    }
}

fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Size class of a MIME type, or `None` when the service does not accept it.
pub fn classify_mime(mime_type: &str) -> Option<FileClass> {
    let essence = essence(mime_type);
    if essence.starts_with("image/") {
        Some(FileClass::Image)
    } else if essence.starts_with("text/") || TEXT_LIKE_MIME_TYPES.contains(&essence.as_str()) {
        Some(FileClass::Text)
    } else {
        None
    }
}

/// MIME type from the file extension; `text/*` gains an explicit UTF-8 charset.
pub fn guess_mime_type(path: &Path) -> Option<String> {
    let mime = mime_guess::from_path(path).first()?;
    Some(with_text_charset(mime.essence_str()))
}

fn with_text_charset(mime_type: &str) -> String {
    if mime_type.starts_with("text/") && !mime_type.contains("charset") {
        format!("{mime_type}{TEXT_CHARSET}")
    } else {
        mime_type.to_string()
    }
}

fn check_upload(filename: &str, mime_type: &str, size: u64) -> Result<FileClass> {
    let class = classify_mime(mime_type).ok_or_else(|| {
        GeminiError::Upload(format!("unsupported MIME type {mime_type} for {filename}"))
    })?;
    let limit = class.size_limit();
    if size > limit {
        return Err(GeminiError::Upload(format!(
            "{filename} is {size} bytes; limit for {mime_type} is {limit} bytes"
        )));
    }
    Ok(class)
}

fn find_resource_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(text) if text.starts_with(RESOURCE_ID_PREFIX) => Some(text),
        Value::Array(items) => items.iter().find_map(find_resource_id),
        Value::Object(map) => map.values().find_map(find_resource_id),
        _ => None,
    }
}

fn header_resource_id(headers: &HeaderMap) -> Option<String> {
    headers
        .values()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| value.starts_with(RESOURCE_ID_PREFIX))
        .map(str::to_string)
}

/// Resource id from an upload response.
///
/// The current endpoint answers with the id as plain text. Older variants
/// wrapped it in JSON or returned it in a header; both are still accepted.
pub fn parse_upload_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Result<String> {
    if status != 200 && status != 201 {
        let limit = body.len().min(ERROR_EXCERPT_LIMIT);
        return Err(GeminiError::Api {
            endpoint: Endpoint::Upload.name().to_string(),
            status,
            excerpt: String::from_utf8_lossy(&body[..limit]).into_owned(),
        });
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.starts_with('{') || text.starts_with('[') {
        if let Some(id) = serde_json::from_str::<Value>(text)
            .ok()
            .as_ref()
            .and_then(find_resource_id)
        {
            return Ok(id.to_string());
        }
        return header_resource_id(headers)
            .ok_or_else(|| GeminiError::Upload("no resource id in upload response".to_string()));
    }
    if text.is_empty() {
        return header_resource_id(headers)
            .ok_or_else(|| GeminiError::Upload("empty resource id".to_string()));
    }
    Ok(text.to_string())
}

fn upload_bytes(
    transport: &dyn Transport,
    filename: &str,
    mime_type: &str,
    data: Vec<u8>,
    cancel: Option<CancelToken>,
) -> Result<UploadedFile> {
    let size_bytes = data.len() as u64;
    check_upload(filename, mime_type, size_bytes)?;

    let endpoint = Endpoint::Upload;
    let request = HttpRequest::new(Method::Post, endpoint.url())
        .with_headers(upload_headers())
        .with_body(RequestBody::Multipart {
            field: UPLOAD_FIELD.to_string(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            data,
        })
        .with_cancel(cancel);

    tracing::debug!(filename, mime_type, size_bytes, "uploading file");
    let mut response = transport
        .execute(request)
        .map_err(|err| GeminiError::network(endpoint.name(), err))?;
    let body = response.read_to_end().map_err(|err| GeminiError::Network {
        endpoint: endpoint.name().to_string(),
        message: format!("Failed to read response body: {err}"),
    })?;
    let resource_id = parse_upload_response(response.status, &response.headers, &body)?;

    Ok(UploadedFile {
        resource_id,
        filename: filename.to_string(),
        mime_type: mime_type.to_string(),
        size_bytes,
    })
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| GeminiError::InvalidArgument(format!("{} has no file name", path.display())))
}

fn required_mime_type(path: &Path) -> Result<String> {
    guess_mime_type(path).ok_or_else(|| {
        GeminiError::Upload(format!(
            "unsupported MIME type: cannot determine one for {}",
            path.display()
        ))
    })
}

impl Client {
    /// Uploads a file, deriving the MIME type from its extension.
    pub fn upload_file(&self, path: impl AsRef<Path>) -> Result<UploadedFile> {
        let path = path.as_ref();
        self.upload_path(path, &required_mime_type(path)?, None)
    }

    /// [`Client::upload_file`] that stops as soon as `cancel` fires.
    pub fn upload_file_with(
        &self,
        path: impl AsRef<Path>,
        cancel: CancelToken,
    ) -> Result<UploadedFile> {
        let path = path.as_ref();
        self.upload_path(path, &required_mime_type(path)?, Some(&cancel))
    }

    /// Uploads a file with a caller-chosen MIME type.
    pub fn upload_file_with_mime(
        &self,
        path: impl AsRef<Path>,
        mime_type: &str,
    ) -> Result<UploadedFile> {
        self.upload_path(path.as_ref(), mime_type, None)
    }

    pub fn upload_image(&self, path: impl AsRef<Path>) -> Result<UploadedFile> {
        let path = path.as_ref();
        match guess_mime_type(path) {
            Some(mime_type) if classify_mime(&mime_type) == Some(FileClass::Image) => {
                self.upload_path(path, &mime_type, None)
            }
            other => Err(GeminiError::Upload(format!(
                "{} is not an image ({})",
                path.display(),
                other.as_deref().unwrap_or("unknown type")
            ))),
        }
    }

    /// Uploads in-memory text under `filename`; plain text unless the name says otherwise.
    pub fn upload_text(&self, filename: &str, text: &str) -> Result<UploadedFile> {
        let mime_type = guess_mime_type(Path::new(filename))
            .filter(|mime| classify_mime(mime) == Some(FileClass::Text))
            .unwrap_or_else(|| DEFAULT_TEXT_MIME.to_string());
        self.upload_data(filename, &mime_type, text.as_bytes().to_vec(), None)
    }

    /// Reads at most one byte past the class limit before rejecting.
    pub fn upload_from_reader(
        &self,
        reader: impl Read,
        filename: &str,
        mime_type: Option<&str>,
    ) -> Result<UploadedFile> {
        self.read_and_upload(reader, filename, mime_type, None)
    }

    pub fn upload_from_reader_with(
        &self,
        reader: impl Read,
        filename: &str,
        mime_type: Option<&str>,
        cancel: CancelToken,
    ) -> Result<UploadedFile> {
        self.read_and_upload(reader, filename, mime_type, Some(&cancel))
    }

    fn read_and_upload(
        &self,
        reader: impl Read,
        filename: &str,
        mime_type: Option<&str>,
        cancel: Option<&CancelToken>,
    ) -> Result<UploadedFile> {
        let mime_type = match mime_type {
            Some(mime_type) => mime_type.to_string(),
            None => guess_mime_type(Path::new(filename)).ok_or_else(|| {
                GeminiError::Upload(format!(
                    "unsupported MIME type: cannot determine one for {filename}"
                ))
            })?,
        };
        let class = check_upload(filename, &mime_type, 0)?;
        let mut data = Vec::new();
        reader
            .take(class.size_limit() + 1)
            .read_to_end(&mut data)?;
        self.upload_data(filename, &mime_type, data, cancel)
    }

    fn upload_path(
        &self,
        path: &Path,
        mime_type: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<UploadedFile> {
        let filename = file_name(path)?;
        let size = fs::metadata(path)?.len();
        check_upload(&filename, mime_type, size)?;
        let data = fs::read(path)?;
        self.upload_data(&filename, mime_type, data, cancel)
    }

    fn upload_data(
        &self,
        filename: &str,
        mime_type: &str,
        data: Vec<u8>,
        cancel: Option<&CancelToken>,
    ) -> Result<UploadedFile> {
        check_upload(filename, mime_type, data.len() as u64)?;
        let session = self.running_session(cancel)?;
        upload_bytes(session.transport.as_ref(), filename, mime_type, data, cancel.cloned())
    }
}
