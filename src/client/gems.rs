//! Gem CRUD over batch-execute, with a jar cached on the client.

use super::Client;
use crate::constants::{rpc_method, Endpoint};
use crate::error::{GeminiError, Result};
use crate::rpc::layout::{
    CREATED_GEM_ID, GEM_DESCRIPTION, GEM_ID, GEM_LIST, GEM_NAME, GEM_PROMPT,
};
use crate::rpc::{RpcCall, RpcReply};
use crate::types::{Gem, GemJar};
use serde::ser::{Serialize, SerializeSeq, Serializer};

const SYSTEM_GEMS: &str = "system";
const CUSTOM_GEMS: &str = "custom";
const LIST_SYSTEM: &str = "[3]";
const LIST_SYSTEM_WITH_HIDDEN: &str = "[4]";
const LIST_CUSTOM: &str = "[2]";

/// `[name, description, prompt, null x5, 0, null, 1, null x3, []]`, plus a
/// trailing `0` on update.
struct GemFields<'a> {
    name: &'a str,
    description: &'a str,
    prompt: &'a str,
    update: bool,
}

impl Serialize for GemFields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let null = Option::<()>::None;
        let mut seq = serializer.serialize_seq(Some(if self.update { 16 } else { 15 }))?;
        seq.serialize_element(self.name)?;
        seq.serialize_element(self.description)?;
        seq.serialize_element(self.prompt)?;
        for _ in 0..5 {
            seq.serialize_element(&null)?;
        }
        seq.serialize_element(&0)?;
        seq.serialize_element(&null)?;
        seq.serialize_element(&1)?;
        for _ in 0..3 {
            seq.serialize_element(&null)?;
        }
        seq.serialize_element(&[(); 0])?;
        if self.update {
            seq.serialize_element(&0)?;
        }
        seq.end()
    }
}

fn encode<T: Serialize>(payload: &T) -> Result<String> {
    serde_json::to_string(payload)
        .map_err(|err| GeminiError::InvalidArgument(format!("failed to encode gem payload: {err}")))
}

pub fn create_gem_payload(name: &str, prompt: &str, description: &str) -> Result<String> {
    encode(&[GemFields {
        name,
        description,
        prompt,
        update: false,
    }])
}

pub fn update_gem_payload(id: &str, name: &str, prompt: &str, description: &str) -> Result<String> {
    encode(&(
        id,
        GemFields {
            name,
            description,
            prompt,
            update: true,
        },
    ))
}

pub fn delete_gem_payload(id: &str) -> Result<String> {
    encode(&[id])
}

/// Gems listed in one `listGems` reply. An empty reply lists nothing.
pub fn parse_gem_list(reply: &RpcReply, predefined: bool) -> Result<Vec<Gem>> {
    if reply.is_empty() {
        return Ok(Vec::new());
    }
    let value = reply.json()?;
    let Some(entries) = GEM_LIST.array(&value) else {
        return Ok(Vec::new());
    };
    entries
        .iter()
        .map(|entry| {
            Ok(Gem {
                id: GEM_ID.require_str(entry)?.to_string(),
                name: GEM_NAME.require_str(entry)?.to_string(),
                description: GEM_DESCRIPTION.text(entry).map(str::to_string),
                prompt: GEM_PROMPT.text(entry).map(str::to_string),
                predefined,
            })
        })
        .collect()
}

fn check_reply(method_id: &str, reply: &RpcReply) -> Result<()> {
    match &reply.error {
        Some(status) => Err(GeminiError::Api {
            endpoint: Endpoint::BatchExecute.name().to_string(),
            status: 200,
            excerpt: format!("{method_id} reported status {status}"),
        }),
        None => Ok(()),
    }
}

impl Client {
    /// Fetches system and custom gems in one batch and caches the merged jar.
    pub fn fetch_gems(&self, include_hidden: bool) -> Result<GemJar> {
        let system_params = if include_hidden {
            LIST_SYSTEM_WITH_HIDDEN
        } else {
            LIST_SYSTEM
        };
        let calls = [
            RpcCall::with_id(rpc_method::LIST_GEMS, system_params, SYSTEM_GEMS),
            RpcCall::with_id(rpc_method::LIST_GEMS, LIST_CUSTOM, CUSTOM_GEMS),
        ];
        let replies = self.batch_execute(&calls)?;

        let mut jar = GemJar::new();
        for (reply, predefined) in replies.iter().zip([true, false]) {
            check_reply(rpc_method::LIST_GEMS, reply)?;
            for gem in parse_gem_list(reply, predefined)? {
                jar.insert(gem);
            }
        }
        tracing::debug!(count = jar.len(), "fetched gems");
        self.write_state().gems = Some(jar.clone());
        Ok(jar)
    }

    /// The cached jar from the last [`Client::fetch_gems`], if any.
    pub fn gems(&self) -> Option<GemJar> {
        self.read_state().gems.clone()
    }

    pub fn get_gem(&self, id: &str) -> Option<Gem> {
        self.read_state()
            .gems
            .as_ref()
            .and_then(|jar| jar.get(id))
            .cloned()
    }

    pub fn create_gem(&self, name: &str, prompt: &str, description: Option<&str>) -> Result<Gem> {
        if name.trim().is_empty() {
            return Err(GeminiError::InvalidArgument(
                "gem name must not be empty".to_string(),
            ));
        }
        let description = description.unwrap_or_default();
        let call = RpcCall::new(
            rpc_method::CREATE_GEM,
            create_gem_payload(name, prompt, description)?,
        );
        let reply = self.single_call(call)?;
        let value = reply.json()?;
        let gem = Gem {
            id: CREATED_GEM_ID.require_str(&value)?.to_string(),
            name: name.to_string(),
            description: (!description.is_empty()).then(|| description.to_string()),
            prompt: (!prompt.is_empty()).then(|| prompt.to_string()),
            predefined: false,
        };
        tracing::info!(id = %gem.id, "created gem");
        self.cache_gem(gem.clone());
        Ok(gem)
    }

    pub fn update_gem(
        &self,
        id: &str,
        name: &str,
        prompt: &str,
        description: Option<&str>,
    ) -> Result<Gem> {
        self.reject_predefined(id, "update")?;
        let description = description.unwrap_or_default();
        let call = RpcCall::new(
            rpc_method::UPDATE_GEM,
            update_gem_payload(id, name, prompt, description)?,
        );
        self.single_call(call)?;
        let gem = Gem {
            id: id.to_string(),
            name: name.to_string(),
            description: (!description.is_empty()).then(|| description.to_string()),
            prompt: (!prompt.is_empty()).then(|| prompt.to_string()),
            predefined: false,
        };
        self.cache_gem(gem.clone());
        Ok(gem)
    }

    pub fn delete_gem(&self, id: &str) -> Result<()> {
        self.reject_predefined(id, "delete")?;
        let call = RpcCall::new(rpc_method::DELETE_GEM, delete_gem_payload(id)?);
        self.single_call(call)?;
        tracing::info!(id, "deleted gem");
        if let Some(jar) = self.write_state().gems.as_mut() {
            jar.remove(id);
        }
        Ok(())
    }

    fn single_call(&self, call: RpcCall) -> Result<RpcReply> {
        let method_id = call.method_id.clone();
        let reply = self
            .batch_execute(std::slice::from_ref(&call))?
            .pop()
            .ok_or_else(|| GeminiError::parse("$", "batch returned no replies"))?;
        check_reply(&method_id, &reply)?;
        Ok(reply)
    }

    fn reject_predefined(&self, id: &str, action: &str) -> Result<()> {
        if self.get_gem(id).is_some_and(|gem| gem.predefined) {
            return Err(GeminiError::InvalidArgument(format!(
                "cannot {action} predefined gem {id}"
            )));
        }
        Ok(())
    }

    fn cache_gem(&self, gem: Gem) {
        self.write_state().gems.get_or_insert_with(GemJar::new).insert(gem);
    }
}
