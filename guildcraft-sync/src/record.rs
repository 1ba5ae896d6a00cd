//! Replicated record types.
//!
//! A [`Record`] is the unit of shared state: one recipe-ownership entry, one
//! craft request or one material snapshot. Every record carries the metadata
//! the last-writer-wins merge needs:
//!
//! ```text
//! ┌──────────┬─────────┬────────────┬────────────┬──────────┐
//! │ id       │ version │ updated_at │ updated_by │ payload  │
//! │ string   │ u64     │ u64 (secs) │ peer id    │ variable │
//! └──────────┴─────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! Ordering is `(version, updated_at, updated_by)` compared lexicographically;
//! the greater triple wins.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Last Write Wins)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identity of a guild member (e.g. `"Thrall-Draenor"`).
///
/// Ordered by plain byte comparison, which is the deterministic
/// tie-break used when two writes share version and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identifier of a replicated record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Recipe ownership entry for one crafter and profession.
    pub fn recipes(crafter: &PeerId, profession: &str) -> Self {
        Self(format!("recipes:{crafter}:{profession}"))
    }

    /// Craft request created by `requester`, numbered per requester.
    pub fn craft_request(requester: &PeerId, serial: u32) -> Self {
        Self(format!("request:{requester}:{serial}"))
    }

    /// Material snapshot of one peer's bags and bank.
    pub fn materials(owner: &PeerId) -> Self {
        Self(format!("materials:{owner}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Which recipes a crafter knows in one profession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeOwnership {
    pub crafter: PeerId,
    pub profession: String,
    pub skill: u16,
    /// Recipe spell ids, sorted.
    pub recipe_ids: Vec<u32>,
}

/// Lifecycle of a craft request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Open,
    Claimed,
    Fulfilled,
    Cancelled,
}

/// A request for someone in the guild to craft an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraftRequest {
    pub requester: PeerId,
    pub recipe_id: u32,
    pub quantity: u16,
    /// Set once a crafter claims the request.
    pub crafter: Option<PeerId>,
    pub status: RequestStatus,
}

/// Count of one item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialCount {
    pub item_id: u32,
    pub count: u32,
}

/// Reagents a peer currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialSnapshot {
    pub owner: PeerId,
    pub items: Vec<MaterialCount>,
}

/// Payload of a replicated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPayload {
    Recipes(RecipeOwnership),
    CraftRequest(CraftRequest),
    Materials(MaterialSnapshot),
}

impl RecordPayload {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordPayload::Recipes(_) => "recipes",
            RecordPayload::CraftRequest(_) => "request",
            RecordPayload::Materials(_) => "materials",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Record & Tombstone
// ───────────────────────────────────────────────────────────────────

/// A versioned unit of replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub payload: RecordPayload,
    /// Monotonic per-record counter.
    pub version: u64,
    /// Server time of the last write, in seconds.
    pub updated_at: u64,
    /// Peer that made the last write.
    pub updated_by: PeerId,
    /// Changed locally since the last publish. Never sent on the wire.
    #[serde(skip)]
    pub dirty: bool,
}

impl Record {
    pub fn new(
        id: RecordId,
        payload: RecordPayload,
        version: u64,
        updated_at: u64,
        updated_by: PeerId,
    ) -> Self {
        Self {
            id,
            payload,
            version,
            updated_at,
            updated_by,
            dirty: false,
        }
    }

    /// Compare two writes of the same record under last-writer-wins.
    pub fn lww_cmp(&self, other: &Record) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.updated_at.cmp(&other.updated_at))
            .then_with(|| self.updated_by.cmp(&other.updated_by))
    }

    /// Whether `self` should replace `other` as local state.
    pub fn supersedes(&self, other: &Record) -> bool {
        self.lww_cmp(other) == Ordering::Greater
    }
}

/// Marks a deleted record so stale copies cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: RecordId,
    /// Server time of the deletion, in seconds.
    pub deleted_at: u64,
    pub deleted_by: PeerId,
    /// Version of the record at deletion plus one.
    pub version: u64,
    #[serde(skip)]
    pub dirty: bool,
}

impl Tombstone {
    pub fn new(id: RecordId, deleted_at: u64, deleted_by: PeerId, version: u64) -> Self {
        Self {
            id,
            deleted_at,
            deleted_by,
            version,
            dirty: false,
        }
    }

    /// A record written at `updated_at` is hidden by this tombstone.
    pub fn suppresses(&self, record: &Record) -> bool {
        self.deleted_at >= record.updated_at
    }

    /// Order two tombstones for the same id; the greater one is kept.
    pub fn lww_cmp(&self, other: &Tombstone) -> Ordering {
        self.deleted_at
            .cmp(&other.deleted_at)
            .then(self.version.cmp(&other.version))
            .then_with(|| self.deleted_by.cmp(&other.deleted_by))
    }
}
