//! Resource registration: key generation and re-registration

use gatelink_proto::{
    Frame, FrameType, RegisteredResource, RegistrationRequest, RegistrationResponse, ResourceRule,
};
use gatelink_transport::{FrameSender, HandlerError, TransportError};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::access::AccessTable;

/// Pair every rule with a fresh random key, unique within the manifest
pub fn assign_keys(rules: &[ResourceRule]) -> Vec<RegisteredResource> {
    let mut rng = rand::thread_rng();
    let mut used = HashSet::with_capacity(rules.len());

    rules
        .iter()
        .map(|rule| {
            let key = loop {
                let candidate: u64 = rng.gen();
                if used.insert(candidate) {
                    break candidate;
                }
            };
            RegisteredResource {
                rule: rule.clone(),
                key,
            }
        })
        .collect()
}

/// Sends registrations on a live session and applies the replies.
///
/// Keys are parked until the gateway answers; only an `Ok` reply makes them
/// the active access table.
#[derive(Clone)]
pub struct ReRegistrar {
    sender: FrameSender,
    access: Arc<AccessTable>,
    pending: Arc<Mutex<VecDeque<Vec<RegisteredResource>>>>,
}

impl ReRegistrar {
    pub fn new(sender: FrameSender, access: Arc<AccessTable>) -> Self {
        Self {
            sender,
            access,
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Vec<RegisteredResource>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registrations sent but not yet answered
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Send the full manifest again with newly generated keys
    pub fn reregister(&self, rules: &[ResourceRule]) -> Result<(), TransportError> {
        let resources = assign_keys(rules);
        let request = RegistrationRequest {
            resources: resources.clone(),
        };

        let mut pending = self.pending();
        self.sender.send_message(FrameType::Registration, &request)?;
        pending.push_back(resources);

        info!(resources = rules.len(), "Re-registration sent");
        Ok(())
    }

    /// Handler for `RegistrationResponse` frames after dispatching starts.
    ///
    /// A rejected or unreadable reply keeps the previous keys; the session
    /// carries on either way.
    pub fn handle_response(&self, frame: Frame) -> Result<(), HandlerError> {
        let Some(resources) = self.pending().pop_front() else {
            warn!("Unsolicited registration response, ignoring");
            return Ok(());
        };

        match frame.message::<RegistrationResponse>() {
            Ok(response) if response.result.is_ok() => {
                self.access.replace_from(&resources);
                info!(
                    resources = resources.len(),
                    "Re-registration accepted, resource keys rotated"
                );
            }
            Ok(response) => {
                warn!(
                    "Re-registration rejected ({:?}): {}; keeping previous keys",
                    response.result,
                    response.message.unwrap_or_default()
                );
            }
            Err(e) => {
                warn!("Malformed registration response: {}; keeping previous keys", e);
            }
        }

        Ok(())
    }
}

/// Where the live session publishes its [`ReRegistrar`]
#[derive(Clone, Default)]
pub struct RegistrarSlot(Arc<Mutex<Option<ReRegistrar>>>);

impl RegistrarSlot {
    pub fn current(&self) -> Option<ReRegistrar> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, registrar: Option<ReRegistrar>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = registrar;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str, port: u16) -> ResourceRule {
        ResourceRule {
            name: host.to_string(),
            pattern: "*".to_string(),
            allowed_identities: vec!["ops".to_string()],
            host: host.to_string(),
            port,
            client_scope: None,
        }
    }

    #[test]
    fn test_keys_are_unique_per_manifest() {
        let rules: Vec<_> = (0..64).map(|i| rule("10.0.0.1", 1000 + i)).collect();
        let resources = assign_keys(&rules);

        let keys: HashSet<u64> = resources.iter().map(|r| r.key).collect();
        assert_eq!(keys.len(), rules.len());
        assert_eq!(resources[3].rule, rules[3]);
    }

    #[test]
    fn test_keys_change_every_cycle() {
        let rules = vec![rule("10.0.0.1", 22)];
        let first = assign_keys(&rules);
        let second = assign_keys(&rules);
        assert_ne!(first[0].key, second[0].key);
    }
}
