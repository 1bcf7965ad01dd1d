//! Branch lifecycle
//!
//! Branches form a tree rooted at `main`. A branch can be deleted only
//! when it is unpinned and childless; `main` can never be deleted or
//! unpinned. Unpinned branches with a TTL are reaped by `gc`.

use crate::store::{validate_branch_name, Branch, MetaStore};
use chrono::{DateTime, Duration, Utc};
use rift_common::{Result, RiftError};
use tracing::info;

/// Branch management over the metadata store.
pub struct BranchManager<'a> {
    store: &'a MetaStore,
}

impl<'a> BranchManager<'a> {
    pub fn new(store: &'a MetaStore) -> Self {
        Self { store }
    }

    /// Create a new branch. The parent defaults to `main` and must exist;
    /// the branch inherits the parent's upstream database.
    pub async fn create(
        &self,
        name: &str,
        parent: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Branch> {
        if name.is_empty() || name == "main" {
            return Err(RiftError::InvalidBranchName(name.to_string()));
        }
        validate_branch_name(name)?;

        if self.store.get_branch(name).await.is_ok() {
            return Err(RiftError::BranchExists(name.to_string()));
        }

        let parent = if parent.is_empty() { "main" } else { parent };
        let parent_branch = self
            .store
            .get_branch(parent)
            .await
            .map_err(|_| RiftError::BranchNotFound(parent.to_string()))?;

        let now = Utc::now();
        let branch = Branch {
            name: name.to_string(),
            parent: parent.to_string(),
            database: parent_branch.database,
            created_at: now,
            updated_at: now,
            ttl_seconds,
            status: "active".into(),
            ..Default::default()
        };

        self.store.create_branch(&branch).await?;

        // Undo the metadata row if the schema cannot be created
        if let Err(e) = self.store.create_branch_schema(name).await {
            let _ = self.store.delete_branch(name).await;
            return Err(e);
        }

        info!(branch = name, parent, "created branch");
        Ok(branch)
    }

    /// Delete a branch and its overlay schema.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if name == "main" {
            return Err(RiftError::CannotModifyMain);
        }

        let branch = self.store.get_branch(name).await?;
        if branch.pinned {
            return Err(RiftError::BranchPinned(name.to_string()));
        }

        for other in self.store.list_branches().await? {
            if other.parent == name {
                return Err(RiftError::BranchHasChildren(name.to_string(), other.name));
            }
        }

        self.store.drop_branch_schema(name).await?;
        self.store.delete_branch(name).await?;
        info!(branch = name, "deleted branch");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Branch> {
        self.store.get_branch(name).await
    }

    pub async fn list(&self) -> Result<Vec<Branch>> {
        self.store.list_branches().await
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.store.get_branch(name).await.is_ok()
    }

    /// Resolve the upstream database a branch maps to.
    pub async fn resolve_database(&self, name: &str) -> Result<String> {
        Ok(self.store.get_branch(name).await?.database)
    }

    pub async fn pin(&self, name: &str) -> Result<()> {
        let mut branch = self.store.get_branch(name).await?;
        branch.pinned = true;
        self.store.update_branch(&branch).await
    }

    pub async fn unpin(&self, name: &str) -> Result<()> {
        if name == "main" {
            return Err(RiftError::CannotModifyMain);
        }
        let mut branch = self.store.get_branch(name).await?;
        branch.pinned = false;
        self.store.update_branch(&branch).await
    }

    /// Remove expired branches; returns the names of those deleted.
    pub async fn gc(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut deleted = Vec::new();

        for branch in self.store.list_branches().await? {
            if !is_expired(&branch, now) {
                continue;
            }
            self.store.drop_branch_schema(&branch.name).await?;
            self.store.delete_branch(&branch.name).await?;
            info!(branch = %branch.name, "gc: reaped expired branch");
            deleted.push(branch.name);
        }

        Ok(deleted)
    }
}

/// Whether a branch's TTL has elapsed. Pinned branches never expire.
pub fn is_expired(branch: &Branch, now: DateTime<Utc>) -> bool {
    if branch.pinned {
        return false;
    }
    match branch.ttl_seconds {
        Some(ttl) => now > branch.created_at + Duration::seconds(ttl),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_with_ttl(ttl_seconds: Option<i64>, pinned: bool, age_seconds: i64) -> Branch {
        let created = Utc::now() - Duration::seconds(age_seconds);
        Branch {
            name: "t".into(),
            created_at: created,
            updated_at: created,
            ttl_seconds,
            pinned,
            ..Default::default()
        }
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();

        // TTL elapsed, unpinned
        assert!(is_expired(&branch_with_ttl(Some(10), false, 60), now));

        // TTL not yet elapsed
        assert!(!is_expired(&branch_with_ttl(Some(3600), false, 60), now));

        // No TTL never expires
        assert!(!is_expired(&branch_with_ttl(None, false, 60), now));
    }

    #[test]
    fn test_is_expired_pinned_exempt() {
        let now = Utc::now();
        assert!(!is_expired(&branch_with_ttl(Some(1), true, 60), now));
    }
}
