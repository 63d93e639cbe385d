use super::{Client, GenerateOptions};
use crate::constants::Model;
use crate::error::{GeminiError, Result};
use crate::transport::CancelToken;
use crate::types::{Metadata, ModelOutput, UploadedFile};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct ChatState {
    metadata: Metadata,
    last_output: Option<ModelOutput>,
    gem_id: Option<String>,
    model: Option<Model>,
}

/// A multi-turn conversation on top of a [`Client`].
///
/// Turns are serialised; after each successful turn the metadata names the
/// chosen candidate, so the next prompt continues from it.
pub struct ChatSession {
    client: Client,
    turn: Mutex<()>,
    state: RwLock<ChatState>,
}

impl ChatSession {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            turn: Mutex::new(()),
            state: RwLock::new(ChatState::default()),
        }
    }

    /// Resumes an existing conversation.
    pub fn with_metadata(client: Client, metadata: Metadata) -> Self {
        let chat = Self::new(client);
        chat.write_state().metadata = metadata;
        chat
    }

    pub fn with_gem(self, gem_id: impl Into<String>) -> Self {
        self.bind_gem(gem_id);
        self
    }

    pub fn with_model(self, model: Model) -> Self {
        self.set_model(model);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn send_message(&self, prompt: &str, files: Vec<UploadedFile>) -> Result<ModelOutput> {
        self.send(prompt, files, None)
    }

    pub fn send_message_with(
        &self,
        prompt: &str,
        files: Vec<UploadedFile>,
        cancel: CancelToken,
    ) -> Result<ModelOutput> {
        self.send(prompt, files, Some(cancel))
    }

    fn send(
        &self,
        prompt: &str,
        files: Vec<UploadedFile>,
        cancel: Option<CancelToken>,
    ) -> Result<ModelOutput> {
        let _turn = self
            .turn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let options = {
            let state = self.read_state();
            GenerateOptions {
                model: state.model,
                metadata: Some(state.metadata.clone()),
                files,
                gem_id: state.gem_id.clone(),
                cancel,
            }
        };
        let output = self.client.generate(prompt, options)?;

        let mut state = self.write_state();
        state.metadata = output.turn_metadata();
        state.last_output = Some(output.clone());
        Ok(output)
    }

    /// Continues the conversation from another candidate of the last reply.
    pub fn choose_candidate(&self, index: usize) -> Result<ModelOutput> {
        let mut state = self.write_state();
        let Some(output) = state.last_output.as_mut() else {
            return Err(GeminiError::InvalidArgument(
                "no reply to choose a candidate from".to_string(),
            ));
        };
        if !output.choose(index) {
            return Err(GeminiError::InvalidArgument(format!(
                "candidate index {index} out of range ({} candidates)",
                output.candidates.len()
            )));
        }
        let output = output.clone();
        state.metadata = output.turn_metadata();
        Ok(output)
    }

    pub fn last_output(&self) -> Option<ModelOutput> {
        self.read_state().last_output.clone()
    }

    pub fn metadata(&self) -> Metadata {
        self.read_state().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: Metadata) {
        self.write_state().metadata = metadata;
    }

    pub fn cid(&self) -> Option<String> {
        self.read_state().metadata.cid.clone()
    }

    pub fn rid(&self) -> Option<String> {
        self.read_state().metadata.rid.clone()
    }

    pub fn rcid(&self) -> Option<String> {
        self.read_state().metadata.rcid.clone()
    }

    pub fn set_cid(&self, cid: impl Into<String>) {
        self.write_state().metadata.cid = Some(cid.into());
    }

    pub fn set_rid(&self, rid: impl Into<String>) {
        self.write_state().metadata.rid = Some(rid.into());
    }

    pub fn set_rcid(&self, rcid: impl Into<String>) {
        self.write_state().metadata.rcid = Some(rcid.into());
    }

    pub fn bind_gem(&self, gem_id: impl Into<String>) {
        self.write_state().gem_id = Some(gem_id.into());
    }

    pub fn unbind_gem(&self) {
        self.write_state().gem_id = None;
    }

    pub fn gem_id(&self) -> Option<String> {
        self.read_state().gem_id.clone()
    }

    /// The session's model override, falling back to the client's.
    pub fn model(&self) -> Model {
        self.read_state()
            .model
            .unwrap_or_else(|| self.client.model())
    }

    pub fn set_model(&self, model: Model) {
        self.write_state().model = Some(model);
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChatState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChatState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("ChatSession")
            .field("metadata", &state.metadata)
            .field("gem_id", &state.gem_id)
            .field("model", &state.model)
            .finish_non_exhaustive()
    }
}
