//! Per-resource access control
//!
//! Maps each secret resource key to the exact destinations it may reach.
//! The whole table is replaced in one step on every successful registration,
//! so a lookup sees either the old keys or the new ones, never a mix.

use gatelink_proto::RegisteredResource;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// A destination a resource key may connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Unknown resource key")]
    UnknownKey,

    #[error("Destination {0} is not allowed for this key")]
    DestinationNotAllowed(Destination),
}

type Grants = HashMap<u64, HashSet<Destination>>;

/// Build the grant map for a freshly keyed manifest
pub fn grants_for(resources: &[RegisteredResource]) -> Grants {
    let mut grants: Grants = HashMap::new();
    for resource in resources {
        grants
            .entry(resource.key)
            .or_default()
            .insert(Destination::new(resource.rule.host.clone(), resource.rule.port));
    }
    grants
}

/// Key to allowed-destination lookup shared by the tunnel and the SOCKS server
#[derive(Debug, Default)]
pub struct AccessTable {
    grants: RwLock<Arc<Grants>>,
}

impl AccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new set of grants. Previous keys stop working immediately.
    pub fn replace(&self, grants: Grants) {
        let grants = Arc::new(grants);
        *self.grants.write().unwrap_or_else(PoisonError::into_inner) = grants;
    }

    /// Replace the table from a registered manifest
    pub fn replace_from(&self, resources: &[RegisteredResource]) {
        self.replace(grants_for(resources));
    }

    fn snapshot(&self) -> Arc<Grants> {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.snapshot().contains_key(&key)
    }

    /// Exact-match check of `destination` against the grants of `key`
    pub fn check(&self, key: u64, destination: &Destination) -> Result<(), AccessError> {
        let grants = self.snapshot();
        let allowed = grants.get(&key).ok_or(AccessError::UnknownKey)?;

        if allowed.contains(destination) {
            Ok(())
        } else {
            Err(AccessError::DestinationNotAllowed(destination.clone()))
        }
    }

    /// Number of keys currently valid
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
