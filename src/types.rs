use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const FULL_SIZE_SUFFIX: &str = "=s2048";

/// `(conversation id, reply id, reply candidate id)`: resumes a turn on the server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub cid: Option<String>,
    pub rid: Option<String>,
    pub rcid: Option<String>,
}

impl Metadata {
    pub fn new(cid: &str, rid: &str, rcid: &str) -> Self {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        Self {
            cid: non_empty(cid),
            rid: non_empty(rid),
            rcid: non_empty(rcid),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cid.is_none() && self.rid.is_none() && self.rcid.is_none()
    }

    /// Wire form `[cid, rid, rcid]`.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!([self.cid, self.rid, self.rcid])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebImage {
    pub url: String,
    pub title: String,
    pub alt: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    pub title: String,
    pub alt: String,
}

impl GeneratedImage {
    /// The maximum-resolution variant appends `=s2048` unless a size suffix is present.
    pub fn url_for(&self, full_size: bool) -> String {
        if full_size && !self.url.contains("=s") {
            format!("{}{FULL_SIZE_SUFFIX}", self.url)
        } else {
            self.url.clone()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub rcid: String,
    pub text: String,
    pub thoughts: Option<String>,
    pub web_images: Vec<WebImage>,
    pub generated_images: Vec<GeneratedImage>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageRef<'a> {
    Web(&'a WebImage),
    Generated(&'a GeneratedImage),
}

impl Candidate {
    pub fn images(&self) -> Vec<ImageRef<'_>> {
        self.web_images
            .iter()
            .map(ImageRef::Web)
            .chain(self.generated_images.iter().map(ImageRef::Generated))
            .collect()
    }
}

/// Parsed reply to one prompt. `chosen` always indexes into `candidates`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub metadata: Metadata,
    pub candidates: Vec<Candidate>,
    chosen: usize,
}

impl ModelOutput {
    /// Returns `None` when `candidates` is empty.
    pub fn new(metadata: Metadata, candidates: Vec<Candidate>) -> Option<Self> {
        if candidates.is_empty() {
            return None;
        }
        Some(Self {
            metadata,
            candidates,
            chosen: 0,
        })
    }

    pub fn chosen_index(&self) -> usize {
        self.chosen
    }

    pub fn chosen(&self) -> &Candidate {
        &self.candidates[self.chosen]
    }

    /// Picks another candidate; false if `index` is out of range.
    pub fn choose(&mut self, index: usize) -> bool {
        if index >= self.candidates.len() {
            return false;
        }
        self.chosen = index;
        true
    }

    pub fn text(&self) -> &str {
        &self.chosen().text
    }

    pub fn thoughts(&self) -> Option<&str> {
        self.chosen().thoughts.as_deref()
    }

    pub fn images(&self) -> Vec<ImageRef<'_>> {
        self.chosen().images()
    }

    pub fn rcid(&self) -> &str {
        &self.chosen().rcid
    }

    /// Metadata naming the chosen candidate's turn.
    pub fn turn_metadata(&self) -> Metadata {
        Metadata {
            rcid: Some(self.rcid().to_string()),
            ..self.metadata.clone()
        }
    }
}

impl fmt::Display for ModelOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Opaque id from the upload endpoint, e.g. `/contrib_service/ttl_1d/...`.
    pub resource_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Server-side persona.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gem {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub prompt: Option<String>,
    /// Owned by the service; cannot be updated or deleted.
    pub predefined: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GemJar {
    gems: BTreeMap<String, Gem>,
}

impl GemJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, gem: Gem) {
        self.gems.insert(gem.id.clone(), gem);
    }

    pub fn remove(&mut self, id: &str) -> Option<Gem> {
        self.gems.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Gem> {
        self.gems.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Gem> {
        self.gems.values().find(|gem| gem.name == name)
    }

    /// Gems matching every given criterion.
    pub fn filter(&self, predefined: Option<bool>, name: Option<&str>) -> GemJar {
        let gems = self
            .gems
            .iter()
            .filter(|(_, gem)| predefined.map_or(true, |flag| gem.predefined == flag))
            .filter(|(_, gem)| name.map_or(true, |name| gem.name == name))
            .map(|(id, gem)| (id.clone(), gem.clone()))
            .collect();
        GemJar { gems }
    }

    pub fn len(&self) -> usize {
        self.gems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gem> {
        self.gems.values()
    }
}

impl FromIterator<Gem> for GemJar {
    fn from_iter<I: IntoIterator<Item = Gem>>(iter: I) -> Self {
        let mut jar = GemJar::new();
        for gem in iter {
            jar.insert(gem);
        }
        jar
    }
}
