//! Core types for Block-STM execution.

use std::fmt;
use std::sync::Arc;

/// Transaction index in the block (0-based).
pub type TxnIndex = usize;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = usize;

/// Raw value bytes stored under a key.
pub type Value = Vec<u8>;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self { txn_idx, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_idx, self.incarnation)
    }
}

/// Name of a partition (sub-store) of the logical store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(Arc<str>);

impl StoreKey {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StoreKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A location in the logical store: a partition plus the key inside it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub store: StoreKey,
    pub bytes: Vec<u8>,
}

impl Key {
    pub fn new(store: &StoreKey, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            store: store.clone(),
            bytes: bytes.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.store)?;
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Status of a transaction in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Waiting for execution at the given incarnation.
    Pending(Incarnation),
    /// Currently executing.
    Executing(Incarnation),
    /// Finished execution, writes installed in the multi-version map.
    Executed(Incarnation),
}

impl ExecutionStatus {
    pub fn incarnation(&self) -> Incarnation {
        match *self {
            ExecutionStatus::Pending(inc)
            | ExecutionStatus::Executing(inc)
            | ExecutionStatus::Executed(inc) => inc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(1, 5) < Version::new(2, 0));
        assert!(Version::new(3, 0) < Version::new(3, 1));
        assert_eq!(Version::new(4, 2).to_string(), "(4, 2)");
    }

    #[test]
    fn test_key_display() {
        let store = StoreKey::new("acc");
        let key = Key::new(&store, vec![0xab, 0x01]);
        assert_eq!(key.to_string(), "acc/ab01");
    }
}
