//! Per-store configuration cache.
//!
//! Filled by the supervisors at worker start and restart; read by the
//! request server to answer ID and CONFIG without disturbing the workers.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{json, Value};

use pot_wire::ErrorBody;

use crate::error::{ProxyError, ProxyResult};

/// One worker's configuration block, opaque except for the top-level cache
/// identifier.
#[derive(Debug, Clone)]
pub struct ConfigBlock {
    id: String,
    block: Value,
}

impl ConfigBlock {
    /// Wraps a block, extracting its `id` field. Numeric identifiers from
    /// older workers are rendered in the eight-hex wire form.
    pub fn new(block: Value) -> ProxyResult<Self> {
        let id = match block.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id
                .as_u64()
                .map(|value| format!("{:08x}", value as u32))
                .ok_or_else(|| {
                    ProxyError::BadConfigBlock("numeric id is not an unsigned integer".to_string())
                })?,
            Some(_) => {
                return Err(ProxyError::BadConfigBlock(
                    "id is neither a string nor a number".to_string(),
                ))
            }
            None => return Err(ProxyError::BadConfigBlock("missing id field".to_string())),
        };
        Ok(Self { id, block })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn block(&self) -> &Value {
        &self.block
    }
}

/// Mapping from store name to configuration block.
#[derive(Debug, Default)]
pub struct ConfigCache {
    blocks: RwLock<HashMap<String, ConfigBlock>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the block for `store` atomically.
    pub fn store(&self, store: &str, block: ConfigBlock) {
        self.blocks
            .write()
            .expect("configuration cache lock poisoned")
            .insert(store.to_string(), block);
    }

    /// The cached block for `store`, if any.
    pub fn block(&self, store: &str) -> Option<Value> {
        self.blocks
            .read()
            .expect("configuration cache lock poisoned")
            .get(store)
            .map(|cached| cached.block.clone())
    }

    /// `{name, id}` pairs for the ID request, optionally filtered to one
    /// store.
    pub fn identities(&self, filter: Option<&str>) -> Result<Value, ErrorBody> {
        let blocks = self
            .blocks
            .read()
            .expect("configuration cache lock poisoned");

        match filter {
            Some(store) => {
                let cached = blocks.get(store).ok_or_else(|| {
                    ErrorBody::new("KeyError", format!("no local store for '{store}'"))
                })?;
                Ok(json!([{ "name": store, "id": cached.id }]))
            }
            None => {
                let mut names: Vec<&String> = blocks.keys().collect();
                names.sort();
                let entries: Vec<Value> = names
                    .into_iter()
                    .map(|name| json!({ "name": name, "id": blocks[name].id }))
                    .collect();
                Ok(Value::Array(entries))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .expect("configuration cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
