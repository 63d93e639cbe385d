//! StreamGenerate: prompt envelope out, candidate list back.

use super::Session;
use crate::constants::{generate_headers, Endpoint, Model};
use crate::error::{GeminiError, Result};
use crate::rpc::layout::{
    BODY_CANDIDATES, BODY_METADATA, CANDIDATE_CARD_TEXT, CANDIDATE_GENERATED_IMAGES,
    CANDIDATE_RCID, CANDIDATE_TEXT, CANDIDATE_THOUGHTS, CANDIDATE_WEB_IMAGES, ENTRY_BODY,
    GENERATED_IMAGE_ALTS, GENERATED_IMAGE_NUMBER, GENERATED_IMAGE_URL, LINE_ERROR_CODE,
    LINE_STATUS_CODE, WEB_IMAGE_ALT, WEB_IMAGE_TITLE, WEB_IMAGE_URL,
};
use crate::rpc::{stream, ERROR_EXCERPT_LIMIT};
use crate::transport::{CancelToken, HttpRequest, Method, RequestBody};
use crate::types::{Candidate, GeneratedImage, Metadata, ModelOutput, UploadedFile, WebImage};
use regex::Regex;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;
use std::sync::OnceLock;

/// Nulls between the metadata slot and the gem id.
const GEM_PADDING: usize = 16;

#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    /// Overrides the client's model for this call.
    pub model: Option<Model>,
    pub metadata: Option<Metadata>,
    pub files: Vec<UploadedFile>,
    pub gem_id: Option<String>,
    pub cancel: Option<CancelToken>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_files(mut self, files: Vec<UploadedFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_gem(mut self, gem_id: impl Into<String>) -> Self {
        self.gem_id = Some(gem_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// The inner generate payload.
///
/// `[[prompt], null, metadata]`, or `[[prompt, 0, null, files], null, metadata]`
/// with attachments. A gem id lands at index 19 after sixteen nulls.
pub struct PromptPayload<'a> {
    pub prompt: &'a str,
    pub files: &'a [UploadedFile],
    pub metadata: Option<&'a Metadata>,
    pub gem_id: Option<&'a str>,
}

struct PromptPart<'a>(&'a str, &'a [UploadedFile]);

struct FilePart<'a>(&'a UploadedFile);

impl Serialize for FilePart<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&[&self.0.resource_id])?;
        seq.serialize_element(&self.0.filename)?;
        seq.end()
    }
}

impl Serialize for PromptPart<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let PromptPart(prompt, files) = *self;
        if files.is_empty() {
            let mut seq = serializer.serialize_seq(Some(1))?;
            seq.serialize_element(prompt)?;
            return seq.end();
        }
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(prompt)?;
        seq.serialize_element(&0)?;
        seq.serialize_element(&Option::<()>::None)?;
        let parts: Vec<FilePart<'_>> = files.iter().map(FilePart).collect();
        seq.serialize_element(&parts)?;
        seq.end()
    }
}

impl Serialize for PromptPayload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(&PromptPart(self.prompt, self.files))?;
        seq.serialize_element(&Option::<()>::None)?;
        seq.serialize_element(&self.metadata.map(Metadata::to_wire))?;
        if let Some(gem_id) = self.gem_id {
            for _ in 0..GEM_PADDING {
                seq.serialize_element(&Option::<()>::None)?;
            }
            seq.serialize_element(gem_id)?;
        }
        seq.end()
    }
}

impl PromptPayload<'_> {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            GeminiError::InvalidArgument(format!("failed to encode prompt payload: {err}"))
        })
    }
}

/// `f.req` value: `[null, "<inner json>"]`.
pub fn build_f_req(inner: &str) -> Result<String> {
    serde_json::to_string(&(Option::<()>::None, inner))
        .map_err(|err| GeminiError::InvalidArgument(format!("failed to encode f.req: {err}")))
}

fn generate_url(reqid: u64) -> Result<String> {
    let mut url = url::Url::parse(Endpoint::Generate.url())
        .map_err(|err| GeminiError::InvalidArgument(format!("invalid endpoint URL: {err}")))?;
    url.query_pairs_mut()
        .append_pair("_reqid", &reqid.to_string())
        .append_pair("rt", "c");
    Ok(url.into())
}

pub(crate) fn send(session: &Session, prompt: &str, options: &GenerateOptions) -> Result<ModelOutput> {
    let endpoint = Endpoint::Generate;
    let model = options.model.unwrap_or(session.model);
    let gem_id = options.gem_id.as_deref().filter(|id| !id.is_empty());
    let metadata = options.metadata.as_ref().filter(|metadata| !metadata.is_empty());
    let inner = PromptPayload {
        prompt,
        files: &options.files,
        metadata,
        gem_id,
    }
    .to_json()?;
    let f_req = build_f_req(&inner)?;

    let request = HttpRequest::new(Method::Post, generate_url(session.reqid)?)
        .with_headers(generate_headers(model))
        .with_body(RequestBody::form(&[
            ("at", session.access_token.as_str()),
            ("f.req", &f_req),
        ]))
        .with_cookies(session.credentials.cookies())
        .with_cancel(options.cancel.clone());

    tracing::debug!(
        model = %model,
        files = options.files.len(),
        gem = gem_id.is_some(),
        "sending prompt"
    );
    let mut response = session
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
        stream::GENERATE_BUFFER_SIZE,
        endpoint.name(),
        options.cancel.as_ref(),
    )?;
    parse_model_output(&body)
}

fn card_content_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^https?://googleusercontent\.com/card_content/\d+")
            .expect("valid card content pattern")
    })
}

fn image_placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"https?://googleusercontent\.com/image_generation_content/\d+")
            .expect("valid image placeholder pattern")
    })
}

/// What a pass over the response lines found.
#[derive(Default)]
struct ResponseScan {
    /// Decoded entry bodies that carry a candidate list, in stream order.
    bodies: Vec<Value>,
    service_code: Option<i64>,
}

impl ResponseScan {
    fn scan(lines: &[Value]) -> Self {
        let mut scan = ResponseScan::default();
        for line in lines {
            if scan.service_code.is_none() {
                scan.service_code = LINE_ERROR_CODE
                    .i64(line)
                    .or_else(|| LINE_STATUS_CODE.i64(line));
            }
            let entries = line.as_array().into_iter().flatten();
            for entry in entries {
                let Some(raw) = ENTRY_BODY.str(entry) else {
                    continue;
                };
                let Ok(body) = serde_json::from_str::<Value>(raw) else {
                    continue;
                };
                if BODY_CANDIDATES.items(&body).is_some() {
                    scan.bodies.push(body);
                }
            }
        }
        scan
    }

    /// Streamed replies repeat the candidate list with growing text; the last
    /// body that has any text holds the final answer.
    fn chosen_body(&self) -> Option<usize> {
        self.bodies
            .iter()
            .rposition(|body| {
                BODY_CANDIDATES
                    .items(body)
                    .is_some_and(|candidates| candidates.iter().any(|c| CANDIDATE_TEXT.text(c).is_some()))
            })
            .or_else(|| (!self.bodies.is_empty()).then_some(0))
    }

    /// Generated images for `rcid`, looked up in `preferred` first and then
    /// in every other body, later ones first.
    fn generated_images_for(&self, preferred: usize, rcid: &str) -> Option<&Vec<Value>> {
        let order = std::iter::once(preferred)
            .chain((0..self.bodies.len()).rev().filter(|index| *index != preferred));
        for index in order {
            let Some(candidates) = BODY_CANDIDATES.items(&self.bodies[index]) else {
                continue;
            };
            let found = candidates
                .iter()
                .filter(|candidate| CANDIDATE_RCID.str(candidate) == Some(rcid))
                .find_map(|candidate| CANDIDATE_GENERATED_IMAGES.items(candidate));
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

/// Parses a StreamGenerate body into a [`ModelOutput`].
///
/// In-band service codes only fail the call when no usable candidate was found.
pub fn parse_model_output(body: &[u8]) -> Result<ModelOutput> {
    let lines = stream::require_json_lines(body)?;
    let scan = ResponseScan::scan(&lines);

    let Some(chosen) = scan.chosen_body() else {
        if let Some(code) = scan.service_code {
            return Err(GeminiError::from_service_code(code));
        }
        return Err(GeminiError::parse(
            BODY_CANDIDATES.describe(),
            "no response body carries candidates",
        ));
    };

    let body = &scan.bodies[chosen];
    let candidates: Vec<Candidate> = BODY_CANDIDATES
        .require_array(body)?
        .iter()
        .filter_map(|raw| parse_candidate(&scan, chosen, raw))
        .collect();

    if let Some(code) = scan.service_code {
        if !candidates.is_empty() {
            tracing::warn!(code, "response carried a service code alongside candidates");
        }
    }

    let metadata = parse_metadata(body, candidates.first().map(|c| c.rcid.as_str()));
    match ModelOutput::new(metadata, candidates) {
        Some(output) => Ok(output),
        None => match scan.service_code {
            Some(code) => Err(GeminiError::from_service_code(code)),
            None => Err(GeminiError::parse(
                CANDIDATE_RCID.describe(),
                "no candidate carries a reply candidate id",
            )),
        },
    }
}

fn parse_metadata(body: &Value, fallback_rcid: Option<&str>) -> Metadata {
    let Some(raw) = BODY_METADATA.array(body) else {
        return Metadata {
            rcid: fallback_rcid.map(str::to_string),
            ..Metadata::default()
        };
    };
    let field = |index: usize| raw.get(index).and_then(Value::as_str).unwrap_or_default();
    let rcid = match field(2) {
        "" => fallback_rcid.unwrap_or_default(),
        rcid => rcid,
    };
    Metadata::new(field(0), field(1), rcid)
}

fn parse_candidate(scan: &ResponseScan, chosen: usize, raw: &Value) -> Option<Candidate> {
    let rcid = CANDIDATE_RCID.text(raw)?;

    let mut text = CANDIDATE_TEXT.str(raw).unwrap_or_default();
    if card_content_pattern().is_match(text) {
        if let Some(card) = CANDIDATE_CARD_TEXT.text(raw) {
            text = card;
        }
    }
    let mut text = text.to_string();

    let web_images = CANDIDATE_WEB_IMAGES
        .items(raw)
        .map(|items| items.iter().filter_map(parse_web_image).collect())
        .unwrap_or_default();

    let generated_images: Vec<GeneratedImage> = scan
        .generated_images_for(chosen, rcid)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(index, item)| parse_generated_image(index, item))
                .collect()
        })
        .unwrap_or_default();

    if image_placeholder_pattern().is_match(&text) {
        text = image_placeholder_pattern()
            .replace_all(&text, "")
            .trim_end()
            .to_string();
    }

    Some(Candidate {
        rcid: rcid.to_string(),
        text,
        thoughts: CANDIDATE_THOUGHTS.text(raw).map(str::to_string),
        web_images,
        generated_images,
    })
}

fn parse_web_image(raw: &Value) -> Option<WebImage> {
    Some(WebImage {
        url: WEB_IMAGE_URL.text(raw)?.to_string(),
        title: WEB_IMAGE_TITLE.str(raw).unwrap_or_default().to_string(),
        alt: WEB_IMAGE_ALT.str(raw).unwrap_or_default().to_string(),
    })
}

fn parse_generated_image(index: usize, raw: &Value) -> Option<GeneratedImage> {
    let url = GENERATED_IMAGE_URL.text(raw)?;
    let title = match GENERATED_IMAGE_NUMBER.get(raw) {
        Some(Value::Number(number)) => format!("[Generated Image {number}]"),
        Some(Value::String(number)) => format!("[Generated Image {number}]"),
        _ => "[Generated Image]".to_string(),
    };
    let alt = GENERATED_IMAGE_ALTS
        .array(raw)
        .and_then(|alts| alts.get(index).or_else(|| alts.first()))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(GeneratedImage {
        url: url.to_string(),
        title,
        alt,
    })
}
