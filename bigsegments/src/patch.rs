use serde::{Deserialize, Serialize};

/// One atomic mutation of a single segment's membership, plus the cursor
/// transition it represents.
///
/// Patches are ephemeral: they arrive from a poll response or stream event,
/// are applied to the store once, and are discarded. Only their effects are
/// persisted. The `version`/`previous_version` cursors are opaque strings
/// issued by the upstream service and compared only for equality; an empty
/// `previous_version` means no cursor has ever been recorded for the
/// environment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Patch {
    pub environment_id: String,
    pub segment_id: String,
    pub version: String,
    pub previous_version: String,
    pub changes: SegmentChanges,
}

/// Mutations to the two membership sets of a segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentChanges {
    pub included: MembershipChanges,
    pub excluded: MembershipChanges,
}

/// User keys to add to or remove from one membership set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipChanges {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl Patch {
    /// Total number of users touched by this patch, counting one per change
    /// list entry. Drives transaction batching in the DynamoDB backend.
    pub fn affected_user_count(&self) -> usize {
        self.changes.included.add.len()
            + self.changes.included.remove.len()
            + self.changes.excluded.add.len()
            + self.changes.excluded.remove.len()
    }
}
