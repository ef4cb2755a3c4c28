use std::collections::BTreeMap;

use crate::election::LeaderElection;
use crate::error::{DatasourceError, Result};
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::store::CoordinationStore;

/// String key/value items stored one per key below a directory.
///
/// Shared by per-machine flags and cluster variables. Reads are served by any
/// instance, writes are gated on leadership.
pub(crate) struct KeySpace<'a> {
    store: &'a dyn CoordinationStore,
    election: &'a LeaderElection,
    dir: String,
    retry: RetryPolicy,
}

pub(crate) fn validate_key(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_control) {
        return Err(DatasourceError::InvalidKey(name.to_string()));
    }
    Ok(())
}

impl<'a> KeySpace<'a> {
    pub(crate) fn new(
        store: &'a dyn CoordinationStore,
        election: &'a LeaderElection,
        dir: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            election,
            dir,
            retry,
        }
    }

    fn path(&self, name: &str) -> Result<String> {
        validate_key(name)?;
        Ok(format!("{}/{name}", self.dir))
    }

    pub(crate) async fn get(&self, name: &str) -> Result<String> {
        let key = self.path(name)?;
        match self.store.get(&key).await? {
            Some(v) => Ok(v.as_str()?.to_string()),
            None => Err(DatasourceError::not_found(key)),
        }
    }

    pub(crate) async fn list(&self) -> Result<BTreeMap<String, String>> {
        let prefix = format!("{}/", self.dir);
        let mut items = BTreeMap::new();
        for (key, v) in self.store.get_prefix(&prefix).await? {
            let name = &key[prefix.len()..];
            // Nested keys belong to some other directory.
            if validate_key(name).is_err() {
                continue;
            }
            items.insert(name.to_string(), v.as_str()?.to_string());
        }
        Ok(items)
    }

    pub(crate) async fn set(&self, name: &str, value: &str) -> Result<()> {
        let key = self.path(name)?;
        self.election.ensure_writable()?;
        self.store.put(&key, value.as_bytes().to_vec()).await
    }

    /// Removing an absent key succeeds without doing anything.
    pub(crate) async fn delete(&self, name: &str) -> Result<()> {
        let key = self.path(name)?;
        self.election.ensure_writable()?;
        self.store.delete(&key).await?;
        Ok(())
    }

    /// Reads and removes the value in one step: the delete only lands if the
    /// key is still at the version that was read, so two racing callers can
    /// never both receive the same value.
    pub(crate) async fn take(&self, name: &str) -> Result<String> {
        let key = &self.path(name)?;
        retry_on_conflict(self.retry, "take", || async move {
            self.election.ensure_writable()?;
            let current = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| DatasourceError::not_found(key.clone()))?;
            if !self
                .store
                .compare_and_delete(key, current.version)
                .await?
            {
                return Err(DatasourceError::Conflict);
            }
            Ok(current.as_str()?.to_string())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("coreos-version").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("a\nb").is_err());
    }
}
