use crate::error::AccessError;
use serde::{Deserialize, Serialize};

/// Longest global or branch qualifier a coordinator may hand us.
pub const MAX_XID_PART_LEN: usize = 64;

/// Identifier of a branch of a globally coordinated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalXid {
    pub format_id: i32,
    #[serde(with = "serde_bytes")]
    pub global_id: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub branch_id: Vec<u8>,
}

impl GlobalXid {
    pub fn new(
        format_id: i32,
        global_id: impl Into<Vec<u8>>,
        branch_id: impl Into<Vec<u8>>,
    ) -> Result<Self, AccessError> {
        let xid = Self {
            format_id,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        };
        if xid.global_id.is_empty() || xid.global_id.len() > MAX_XID_PART_LEN {
            return Err(AccessError::Validation(format!(
                "global id must be 1..={MAX_XID_PART_LEN} bytes"
            )));
        }
        if xid.branch_id.len() > MAX_XID_PART_LEN {
            return Err(AccessError::Validation(format!(
                "branch id must be at most {MAX_XID_PART_LEN} bytes"
            )));
        }
        Ok(xid)
    }
}

impl std::fmt::Display for GlobalXid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            hex::encode(&self.global_id),
            hex::encode(&self.branch_id)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaPrepareOutcome {
    /// Nothing was written; the branch has already been committed.
    ReadOnly,
    /// Work is durable and waits for the coordinator's decision.
    Prepared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XaState {
    Active,
    Prepared,
}
