//! Per-declaration decision table
//!
//! Every pass picks exactly one step per declaration from what is already
//! known: the phase of this node's status record, the declaration itself
//! and whether its digest is on disk. Steps that write stop the pass.

use crate::cache::CacheKey;
use crate::cluster::{CacheCondition, CacheDeclaration, NodeStatusRecord};
use crate::error::KcacheResult;
use std::fmt;

/// Lifecycle of a node status record
///
/// The API refuses status on create, so the record reaches
/// `InventoryPopulated` only through two separate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Absent,
    Created,
    InventoryPopulated,
}

impl NodePhase {
    pub fn of(record: Option<&NodeStatusRecord>) -> Self {
        match record {
            None => Self::Absent,
            Some(r) if r.status.is_none() => Self::Created,
            Some(_) => Self::InventoryPopulated,
        }
    }
}

/// What a pass does for one declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Create the status record without a status
    CreateRecord,
    /// Detect accelerators and write the first status
    PopulateInventory,
    /// No resolved digest yet
    AwaitAdmission,
    /// Declaration is being deleted
    Remove(CacheKey),
    /// Digest on disk; bring the entry in line with it
    Refresh(CacheKey),
    /// Extraction failed before; needs a human or a new digest
    SkipErrored(CacheKey),
    AddFinalizer(CacheKey),
    Extract(CacheKey),
}

impl Step {
    /// Whether this step always ends with a write
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Self::CreateRecord | Self::PopulateInventory | Self::AddFinalizer(_) | Self::Extract(_)
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateRecord => write!(f, "create status record"),
            Self::PopulateInventory => write!(f, "populate GPU inventory"),
            Self::AwaitAdmission => write!(f, "await admission"),
            Self::Remove(key) => write!(f, "remove {}", key),
            Self::Refresh(key) => write!(f, "refresh {}", key),
            Self::SkipErrored(key) => write!(f, "skip errored {}", key),
            Self::AddFinalizer(key) => write!(f, "add finalizer for {}", key.name),
            Self::Extract(key) => write!(f, "extract {}", key),
        }
    }
}

/// Choose the step for `declaration`
///
/// `record` is this node's record in the declaration's scope, `on_disk`
/// whether the admitted digest is already extracted.
pub fn plan(
    declaration: &CacheDeclaration,
    record: Option<&NodeStatusRecord>,
    on_disk: bool,
) -> KcacheResult<Step> {
    let Some(record) = record else {
        return Ok(Step::CreateRecord);
    };
    if NodePhase::of(Some(record)) == NodePhase::Created {
        return Ok(Step::PopulateInventory);
    }

    let Some(key) = declaration.key()? else {
        return Ok(Step::AwaitAdmission);
    };

    if declaration.deletion_requested {
        return Ok(Step::Remove(key));
    }

    // Only a failed extraction is terminal; a failed unload is retried
    let errored = record
        .entry(&key.name, &key.digest)
        .is_some_and(|e| e.condition == CacheCondition::Error);

    Ok(if errored {
        Step::SkipErrored(key)
    } else if on_disk {
        Step::Refresh(key)
    } else if !record.has_finalizer(&key.name) {
        Step::AddFinalizer(key)
    } else {
        Step::Extract(key)
    })
}
