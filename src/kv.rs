use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::runtime::StateMachine;
use crate::types::LogIndex;

/// Commands for the key-value store, carried in log entries as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Result of applying a command to the KV store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvResult {
    Ok,
    Value(Option<String>),
    /// The entry did not hold a valid `KvCommand`.
    Invalid(String),
}

impl KvResult {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::StateMachine(e.to_string()))
    }
}

/// A simple in-memory key-value store.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Apply a decoded command to the store.
    pub fn execute(&mut self, command: KvCommand) -> KvResult {
        match command {
            KvCommand::Get { key } => KvResult::Value(self.data.get(&key).cloned()),
            KvCommand::Set { key, value } => {
                self.data.insert(key, value);
                KvResult::Ok
            }
            KvCommand::Delete { key } => {
                self.data.remove(&key);
                KvResult::Ok
            }
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        let result = match serde_json::from_slice::<KvCommand>(command) {
            Ok(command) => self.execute(command),
            Err(e) => {
                warn!(index = %index, error = %e, "skipping undecodable kv command");
                KvResult::Invalid(e.to_string())
            }
        };
        serde_json::to_vec(&result).unwrap_or_default()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.data).map_err(|e| Error::StateMachine(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.data = serde_json::from_slice(data).map_err(|e| Error::StateMachine(e.to_string()))?;
        Ok(())
    }
}
