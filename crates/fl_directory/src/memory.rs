//! Default in-memory directory.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use fl_crypto::Aid;

use crate::{AgentMetadata, DirectoryProvider, SearchQuery, ANY_CAPABILITY};

/// Process-local directory backed by a single map. Every operation is
/// atomic under one lock; none of them suspends, so lookups can never
/// stall RPC dispatch.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<Aid, AgentMetadata>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DirectoryProvider for MemoryDirectory {
    async fn discover(&self, capability: &str) -> Vec<Aid> {
        let entries = self.entries.read();
        entries
            .values()
            .filter(|meta| {
                capability == ANY_CAPABILITY
                    || meta.capabilities.iter().any(|c| c.name == capability)
            })
            .map(|meta| meta.did.clone())
            .collect()
    }

    async fn lookup(&self, aid: &Aid) -> Option<AgentMetadata> {
        self.entries.read().get(aid).cloned()
    }

    async fn register(&self, meta: AgentMetadata) {
        debug!(did = %meta.did, name = %meta.name, "directory register");
        self.entries.write().insert(meta.did.clone(), meta);
    }

    async fn unregister(&self, aid: &Aid) -> bool {
        self.entries.write().remove(aid).is_some()
    }

    async fn search(&self, query: &SearchQuery) -> Vec<Aid> {
        let entries = self.entries.read();
        let name_needle = query.name.as_ref().map(|n| n.to_lowercase());
        entries
            .values()
            .filter(|meta| {
                if let Some(needle) = &name_needle {
                    if !meta.name.to_lowercase().contains(needle) {
                        return false;
                    }
                }
                if let Some(wanted) = &query.capabilities {
                    if !wanted.is_empty()
                        && !meta
                            .capabilities
                            .iter()
                            .any(|c| wanted.iter().any(|w| *w == c.name))
                    {
                        return false;
                    }
                }
                true
            })
            .map(|meta| meta.did.clone())
            .collect()
    }
}
