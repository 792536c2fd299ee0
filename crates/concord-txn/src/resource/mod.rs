//! Local resource state.
//!
//! A participant applies each operation to its node's resource manager
//! while holding the matching lock. Every application reports the value
//! before and after, which the participant logs so the effect can be
//! redone or undone during recovery.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use concord_common::types::Access;

use crate::error::ResourceError;
use crate::lock::LockMode;

/// What an operation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Read the current value.
    Read,
    /// Overwrite the value, creating the resource if missing.
    Set(i64),
    /// Add a (possibly negative) delta to an existing value.
    Add(i64),
}

/// A single operation on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Target resource.
    pub resource: String,
    /// What to do.
    pub payload: OpPayload,
}

impl Operation {
    /// Creates a read.
    pub fn read(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            payload: OpPayload::Read,
        }
    }

    /// Creates a write of an absolute value.
    pub fn set(resource: impl Into<String>, value: i64) -> Self {
        Self {
            resource: resource.into(),
            payload: OpPayload::Set(value),
        }
    }

    /// Creates an increment (or decrement, for a negative delta).
    pub fn add(resource: impl Into<String>, delta: i64) -> Self {
        Self {
            resource: resource.into(),
            payload: OpPayload::Add(delta),
        }
    }

    /// Returns the access mode of this operation.
    pub fn access(&self) -> Access {
        match self.payload {
            OpPayload::Read => Access::Read,
            OpPayload::Set(_) | OpPayload::Add(_) => Access::Write,
        }
    }

    /// Returns the lock mode this operation needs.
    pub fn lock_mode(&self) -> LockMode {
        match self.access() {
            Access::Read => LockMode::Shared,
            Access::Write => LockMode::Exclusive,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            OpPayload::Read => write!(f, "read {}", self.resource),
            OpPayload::Set(v) => write!(f, "set {} = {}", self.resource, v),
            OpPayload::Add(d) => write!(f, "add {} {:+}", self.resource, d),
        }
    }
}

/// Effect of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    /// Value before the operation; `None` if the resource did not exist.
    pub before: Option<i64>,
    /// Value after the operation.
    pub after: Option<i64>,
}

impl Applied {
    /// The value the caller observes (the read value, or the new value).
    pub fn value(&self) -> Option<i64> {
        self.after
    }
}

/// Node-local store that applies and reverses individual operations.
///
/// Callers hold the appropriate lock for every resource they touch, so
/// implementations only need to keep single calls atomic.
pub trait ResourceManager: Send + Sync + fmt::Debug {
    /// Reads the current value of a resource.
    fn read(&self, resource: &str) -> Result<i64, ResourceError>;

    /// Applies an operation and reports its before and after images.
    fn apply(&self, op: &Operation) -> Result<Applied, ResourceError>;

    /// Puts a resource back to an image; `None` removes it.
    fn restore(&self, resource: &str, image: Option<i64>);

    /// Checks local constraints over the given resources before voting.
    fn validate(&self, resources: &[String]) -> Result<(), ResourceError>;

    /// Returns every resource and its value.
    fn snapshot(&self) -> BTreeMap<String, i64>;
}

/// In-memory account balances.
///
/// Balances may dip below zero while a transaction is active; they must
/// be non-negative when the transaction votes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<BTreeMap<String, i64>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with balances.
    pub fn with_accounts(accounts: BTreeMap<String, i64>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
        }
    }
}

impl ResourceManager for MemoryStore {
    fn read(&self, resource: &str) -> Result<i64, ResourceError> {
        self.accounts
            .read()
            .get(resource)
            .copied()
            .ok_or_else(|| ResourceError::UnknownResource(resource.to_string()))
    }

    fn apply(&self, op: &Operation) -> Result<Applied, ResourceError> {
        let mut accounts = self.accounts.write();
        let before = accounts.get(&op.resource).copied();

        let after = match op.payload {
            OpPayload::Read => {
                let value =
                    before.ok_or_else(|| ResourceError::UnknownResource(op.resource.clone()))?;
                return Ok(Applied {
                    before: Some(value),
                    after: Some(value),
                });
            }
            OpPayload::Set(value) => value,
            OpPayload::Add(delta) => {
                let current =
                    before.ok_or_else(|| ResourceError::UnknownResource(op.resource.clone()))?;
                current
                    .checked_add(delta)
                    .ok_or_else(|| ResourceError::Overflow(op.resource.clone()))?
            }
        };

        accounts.insert(op.resource.clone(), after);
        Ok(Applied {
            before,
            after: Some(after),
        })
    }

    fn restore(&self, resource: &str, image: Option<i64>) {
        let mut accounts = self.accounts.write();
        match image {
            Some(value) => {
                accounts.insert(resource.to_string(), value);
            }
            None => {
                accounts.remove(resource);
            }
        }
    }

    fn validate(&self, resources: &[String]) -> Result<(), ResourceError> {
        let accounts = self.accounts.read();
        for resource in resources {
            if let Some(&balance) = accounts.get(resource) {
                if balance < 0 {
                    return Err(ResourceError::ConstraintViolation {
                        resource: resource.clone(),
                        reason: format!("balance {} is negative", balance),
                    });
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, i64> {
        self.accounts.read().clone()
    }
}
