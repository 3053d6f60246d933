//! Conflict-resolution wrappers for values read from the KVS.
//!
//! The store hands back a [`Lattice`] rather than raw bytes. The client only
//! needs one capability from it, [`Lattice::reconcile`], which collapses the
//! lattice to the bytes a caller should see. Only last-writer-wins lattices
//! support that today; other variants are reported as unsupported.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::error::KvsError;

/// A last-writer-wins register.
///
/// Concurrent writes are resolved by keeping the value with the highest
/// timestamp; equal timestamps keep the larger value so merges are
/// deterministic regardless of order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwLattice {
    /// Logical write timestamp.
    pub timestamp: u64,
    /// Stored value.
    pub value: Bytes,
}

impl LwwLattice {
    /// Creates a register holding `value` written at `timestamp`.
    pub fn new(timestamp: u64, value: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Merges `other` into `self`, returning `true` if `self` changed.
    pub fn merge(&mut self, other: &LwwLattice) -> bool {
        let newer = other.timestamp > self.timestamp
            || (other.timestamp == self.timestamp && other.value > self.value);
        if newer {
            self.timestamp = other.timestamp;
            self.value = other.value.clone();
        }
        newer
    }
}

/// A grow-only set of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetLattice {
    /// Members of the set.
    pub values: BTreeSet<Bytes>,
}

impl SetLattice {
    /// Merges by union, returning `true` if any member was added.
    pub fn merge(&mut self, other: &SetLattice) -> bool {
        let before = self.values.len();
        self.values.extend(other.values.iter().cloned());
        self.values.len() != before
    }
}

/// A value as stored in the KVS, tagged by reconciliation strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lattice {
    /// Last-writer-wins register.
    Lww(LwwLattice),
    /// Grow-only set.
    Set(SetLattice),
}

impl Lattice {
    /// Shorthand for an LWW lattice.
    pub fn lww(timestamp: u64, value: impl Into<Bytes>) -> Self {
        Self::Lww(LwwLattice::new(timestamp, value))
    }

    /// Name of the variant, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lww(_) => "lww",
            Self::Set(_) => "set",
        }
    }

    /// Collapses the lattice read under `key` to the bytes a caller sees.
    ///
    /// # Errors
    ///
    /// [`KvsError::UnsupportedLattice`] for variants without a single
    /// reconciled value.
    pub fn reconcile(&self, key: &str) -> Result<Bytes, KvsError> {
        match self {
            Self::Lww(lww) => Ok(lww.value.clone()),
            other => Err(KvsError::UnsupportedLattice {
                key: key.to_string(),
                kind: other.kind(),
            }),
        }
    }

    /// Merges `other` into `self`, returning `true` if `self` changed.
    ///
    /// # Errors
    ///
    /// [`KvsError::TypeMismatch`] when the variants differ.
    pub fn merge(&mut self, key: &str, other: &Lattice) -> Result<bool, KvsError> {
        match (self, other) {
            (Self::Lww(a), Self::Lww(b)) => Ok(a.merge(b)),
            (Self::Set(a), Self::Set(b)) => Ok(a.merge(b)),
            (stored, incoming) => Err(KvsError::TypeMismatch {
                key: key.to_string(),
                stored: stored.kind(),
                incoming: incoming.kind(),
            }),
        }
    }
}
