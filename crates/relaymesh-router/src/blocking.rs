//! Caller/service blocking.
//!
//! Two flat tables keyed `"cn~~sn"`: one fed by operators at runtime, one
//! replaced wholesale from the remote-config kill-switch list. Either
//! wildcard side is allowed (`*~~sn`, `cn~~*`); the full wildcard `*~~*`
//! is refused. A hit black-holes the request on purpose — the caller sees
//! silence, not an error frame.

use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::time::Instant;

use thiserror::Error;
use tracing::warn;

pub const WILDCARD: &str = "*";

#[derive(Error, Debug, PartialEq)]
pub enum BlockingError {
    #[error("blocking everything is not allowed")]
    FullWildcard,
}

fn block_key(caller_name: &str, service_name: &str) -> String {
    format!("{caller_name}~~{service_name}")
}

#[derive(Debug, Default)]
pub struct BlockingTable {
    operator: StdRwLock<HashMap<String, Instant>>,
    remote: StdRwLock<HashMap<String, Instant>>,
}

impl BlockingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator block of a (caller, service) edge; either side may be `*`.
    pub fn block(&self, caller_name: &str, service_name: &str, now: Instant) -> Result<(), BlockingError> {
        if caller_name == WILDCARD && service_name == WILDCARD {
            return Err(BlockingError::FullWildcard);
        }
        self.operator
            .write()
            .unwrap()
            .insert(block_key(caller_name, service_name), now);
        Ok(())
    }

    pub fn unblock(&self, caller_name: &str, service_name: &str) {
        self.operator.write().unwrap().remove(&block_key(caller_name, service_name));
    }

    /// Replace the remote table from the kill-switch entry list. Malformed
    /// entries and the full wildcard are skipped with a warning.
    pub fn update_remote(&self, entries: &[String], now: Instant) {
        let mut table = HashMap::new();
        for entry in entries {
            match entry.split_once("~~") {
                Some((WILDCARD, WILDCARD)) | None => {
                    warn!(entry = %entry, "ignoring invalid kill-switch entry");
                }
                Some(_) => {
                    table.insert(entry.clone(), now);
                }
            }
        }
        *self.remote.write().unwrap() = table;
    }

    /// True when any of `cn~~sn`, `*~~sn`, `cn~~*` hits either table.
    pub fn is_blocked(&self, caller_name: &str, service_name: &str) -> bool {
        let keys = [
            block_key(caller_name, service_name),
            block_key(WILDCARD, service_name),
            block_key(caller_name, WILDCARD),
        ];
        let operator = self.operator.read().unwrap();
        if keys.iter().any(|k| operator.contains_key(k)) {
            return true;
        }
        let remote = self.remote.read().unwrap();
        keys.iter().any(|k| remote.contains_key(k))
    }

    pub fn operator_len(&self) -> usize {
        self.operator.read().unwrap().len()
    }

    pub fn remote_len(&self) -> usize {
        self.remote.read().unwrap().len()
    }
}
