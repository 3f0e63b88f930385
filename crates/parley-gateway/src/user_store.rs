use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::user::UserTable;

/// Whole-table persistence of the user records. No per-record merge: the
/// last save wins.
pub(crate) trait UserStore: Send + Sync {
    fn load_all(&self) -> Result<UserTable>;
    fn save_all(&self, users: &UserTable) -> Result<()>;
}

/// Sync file-backed user store: one pretty-printed JSON document.
///
/// Writes go to a sibling temp file that is then renamed over the target,
/// so a crash mid-write leaves the previous table intact.
#[derive(Debug)]
pub(crate) struct DiskUserStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskUserStore {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create users dir: {}", dir.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl UserStore for DiskUserStore {
    fn load_all(&self) -> Result<UserTable> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no users file yet, starting empty");
                return Ok(UserTable::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };

        let mut users: UserTable = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        for user in users.values_mut() {
            user.repair_selection();
        }
        debug!(path = %self.path.display(), count = users.len(), "loaded users from disk");
        Ok(users)
    }

    fn save_all(&self, users: &UserTable) -> Result<()> {
        let content = serde_json::to_string_pretty(users).context("failed to serialize users")?;
        let tmp = self.path.with_extension("json.tmp");

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = users.len(), "saved users");
        Ok(())
    }
}

/// In-memory store for tests and `parley chat` sessions without a file.
#[derive(Debug, Default)]
pub(crate) struct MemoryUserStore {
    users: Mutex<UserTable>,
}

impl UserStore for MemoryUserStore {
    fn load_all(&self) -> Result<UserTable> {
        Ok(self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_all(&self, users: &UserTable) -> Result<()> {
        users.clone_into(&mut self.users.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Status;
    use crate::user::User;
    use parley_core::{Message, Personality, TokenUsage, UserId};

    fn sample_table() -> UserTable {
        let mut user = User::new(UserId(42), Status::Whitelisted);
        let id = user.new_conversation();
        {
            let conv = user.conversation_mut(id).unwrap();
            conv.set_model("gpt-3.5-turbo");
            conv.set_personality(Personality::Neutral).unwrap();
            conv.append(Message::user("hello")).unwrap();
            conv.usage = TokenUsage::new(12, 34);
        }
        user.select(id).unwrap();
        let mut table = UserTable::new();
        table.insert(user.id, user);
        table
    }

    #[test]
    fn load_returns_empty_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskUserStore::new(dir.path().join("users.json")).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn save_and_load_preserve_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskUserStore::new(dir.path().join("nested/users.json")).unwrap();
        let table = sample_table();

        store.save_all(&table).unwrap();
        let loaded = store.load_all().unwrap();

        assert_eq!(loaded, table);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn save_overwrites_whole_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskUserStore::new(dir.path().join("users.json")).unwrap();
        store.save_all(&sample_table()).unwrap();
        store.save_all(&UserTable::new()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn load_drops_selection_of_deleted_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = DiskUserStore::new(&path).unwrap();

        let mut table = sample_table();
        let user = table.get_mut(&UserId(42)).unwrap();
        let id = user.selected_id().unwrap();
        // Simulate a file written by hand or by an older build.
        user.conversation_mut(id).unwrap().delete();
        store.save_all(&table).unwrap();

        let loaded = store.load_all().unwrap();
        assert!(loaded[&UserId(42)].selected_id().is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = DiskUserStore::new(&path).unwrap();
        let err = store.load_all().unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }
}
