//! Fleetlock agent directory.
//!
//! Maps capabilities and identifiers to agent metadata so the RPC
//! layer can route requests. The provider is a narrow async trait;
//! [`MemoryDirectory`] is the default in-process implementation, and a
//! process-wide shared instance can be installed once at startup.
//! Tests construct isolated instances and never touch the shared one.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fl_crypto::Aid;

pub use memory::MemoryDirectory;

/// Wildcard capability accepted by [`DirectoryProvider::discover`].
pub const ANY_CAPABILITY: &str = "*";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Shared directory already initialized")]
    AlreadyInitialized,
}

/// One advertised capability of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
        }
    }
}

/// Reachable endpoints for an agent. Either may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
}

/// Directory entry: created on register, replaced on re-register with
/// the same AID, removed on unregister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub did: Aid,
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub endpoints: Endpoints,
}

/// Search criteria for [`DirectoryProvider::search`]. Missing fields
/// mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Entry must advertise at least one of these capability names.
    pub capabilities: Option<Vec<String>>,
    /// Case-insensitive substring of the agent name.
    pub name: Option<String>,
}

/// Pluggable capability/identifier lookup.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    /// Agents advertising `capability`; `"*"` matches all.
    async fn discover(&self, capability: &str) -> Vec<Aid>;

    async fn lookup(&self, aid: &Aid) -> Option<AgentMetadata>;

    /// Idempotent upsert keyed by AID.
    async fn register(&self, meta: AgentMetadata);

    /// Returns whether an entry was removed.
    async fn unregister(&self, aid: &Aid) -> bool;

    async fn search(&self, query: &SearchQuery) -> Vec<Aid>;
}

static SHARED: OnceCell<Arc<dyn DirectoryProvider>> = OnceCell::new();

/// Install the process-wide directory. Call once at startup, before
/// any [`shared`] use; a second call fails.
pub fn init_shared(provider: Arc<dyn DirectoryProvider>) -> Result<(), DirectoryError> {
    SHARED
        .set(provider)
        .map_err(|_| DirectoryError::AlreadyInitialized)
}

/// The process-wide directory, lazily defaulting to an empty
/// [`MemoryDirectory`] when none was installed.
pub fn shared() -> Arc<dyn DirectoryProvider> {
    SHARED
        .get_or_init(|| Arc::new(MemoryDirectory::new()) as Arc<dyn DirectoryProvider>)
        .clone()
}
