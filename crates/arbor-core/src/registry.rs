//! Active-branch bookkeeping.
//!
//! Writes keep a single active branch per conversation inside one
//! transaction, but rows written by older builds (or by concurrent writers)
//! can still show zero or several active flags. Readers resolve that here:
//! the most recently created active branch wins, and when nothing is active
//! the most recently created branch is promoted. Repairs are best effort.

use tracing::{info, warn};

use crate::domain::{Branch, BranchId, ConversationId};
use crate::error::{Error, Result};
use crate::store::{ChatStore, NewBranch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveRepair {
    /// Several branches claimed to be active; these lost.
    MultipleActive { deactivated: Vec<BranchId> },
    /// No branch was active.
    NoneActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveResolution {
    pub active: BranchId,
    pub repair: Option<ActiveRepair>,
}

/// Decides which branch is active. `None` only for an empty slice.
pub fn resolve_active_branch(branches: &[Branch]) -> Option<ActiveResolution> {
    let newest = |candidates: Vec<&Branch>| {
        // Later entries win ties on created_at.
        candidates.into_iter().max_by_key(|b| b.created_at).map(|b| b.id)
    };

    let active: Vec<&Branch> = branches.iter().filter(|b| b.is_active).collect();
    match active.len() {
        0 => newest(branches.iter().collect()).map(|id| ActiveResolution {
            active: id,
            repair: Some(ActiveRepair::NoneActive),
        }),
        1 => Some(ActiveResolution {
            active: active[0].id,
            repair: None,
        }),
        _ => {
            let winner = newest(active.clone())?;
            let deactivated = active
                .iter()
                .map(|b| b.id)
                .filter(|id| *id != winner)
                .collect();
            Some(ActiveResolution {
                active: winner,
                repair: Some(ActiveRepair::MultipleActive { deactivated }),
            })
        }
    }
}

/// Branches of one conversation with exactly one of them marked active.
#[derive(Debug, Clone)]
pub struct BranchSet {
    branches: Vec<Branch>,
    active: BranchId,
}

impl BranchSet {
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn active_id(&self) -> BranchId {
        self.active
    }

    pub fn active(&self) -> Option<&Branch> {
        self.get(self.active)
    }

    /// The earliest-created branch, which owns unassigned messages.
    pub fn default_branch(&self) -> Option<&Branch> {
        self.branches.first()
    }

    pub fn get(&self, branch_id: BranchId) -> Option<&Branch> {
        self.branches.iter().find(|b| b.id == branch_id)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

/// Loads the branches of a conversation and heals the active flag.
///
/// A conversation without any branch gets a fresh "Main".
pub async fn load_branches<S>(store: &S, conversation_id: ConversationId) -> Result<BranchSet>
where
    S: ChatStore + ?Sized,
{
    let mut branches = store.list_branches(conversation_id).await?;

    if branches.is_empty() {
        let main = Branch::main(conversation_id);
        info!(
            target: "arbor::registry",
            %conversation_id,
            branch_id = %main.id,
            "Conversation had no branches, creating Main"
        );
        store
            .insert_branch(&NewBranch {
                branch: main.clone(),
                assign: Vec::new(),
            })
            .await?;
        branches.push(main);
    }

    let resolution = resolve_active_branch(&branches)
        .ok_or_else(|| Error::not_found(format!("branches of conversation {conversation_id}")))?;

    if let Some(repair) = &resolution.repair {
        warn!(
            target: "arbor::registry",
            %conversation_id,
            active = %resolution.active,
            ?repair,
            "Inconsistent active branch flags, repairing"
        );
        if let Err(e) = store
            .activate_branch(conversation_id, resolution.active)
            .await
        {
            warn!(
                target: "arbor::registry",
                %conversation_id,
                error = %e,
                "Failed to repair active branch flags"
            );
        }
    }

    for branch in &mut branches {
        branch.is_active = branch.id == resolution.active;
    }

    Ok(BranchSet {
        branches,
        active: resolution.active,
    })
}
