use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::acme::account::RegisteredAccount;
use crate::oauth::AdminCredentials;
use crate::operation::CreateOperation;

#[cfg(unix)]
const STORE_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("store persistence failed: {message}")]
    Persistence { message: String },
}

impl StoreError {
    fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }
}

/// Persistence of operation records, keyed by challenge token.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    /// Returns [`StoreError::AlreadyExists`] if the token is already present.
    async fn create(&self, operation: &CreateOperation) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::NotFound`] if no record has this token.
    async fn get(&self, token: &str) -> Result<CreateOperation, StoreError>;

    async fn list_all(&self) -> Result<Vec<CreateOperation>, StoreError>;

    /// Records not yet mapped to a certificate, oldest first.
    async fn list_active(&self) -> Result<Vec<CreateOperation>, StoreError>;

    /// Upserts a record. Last writer wins.
    async fn save(&self, operation: &CreateOperation) -> Result<(), StoreError>;

    /// Deletes records accepted more than `hard_expiry` before `now`.
    async fn delete_expired(
        &self,
        now: OffsetDateTime,
        hard_expiry: Duration,
    ) -> Result<usize, StoreError>;
}

/// Singleton CA account record.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// # Errors
    /// Returns [`StoreError::NotFound`] before the account has been created.
    async fn get_account(&self) -> Result<RegisteredAccount, StoreError>;

    /// Creates the account record if none exists.
    ///
    /// # Errors
    /// Returns [`StoreError::AlreadyExists`] if another caller created it first.
    async fn create_account(&self, account: &RegisteredAccount) -> Result<(), StoreError>;

    async fn save_account(&self, account: &RegisteredAccount) -> Result<(), StoreError>;
}

/// Singleton operator OAuth state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_admin(&self) -> Result<Option<AdminCredentials>, StoreError>;

    async fn save_admin(&self, credentials: &AdminCredentials) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    operations: BTreeMap<String, CreateOperation>,
    #[serde(default)]
    account: Option<RegisteredAccount>,
    #[serde(default)]
    admin: Option<AdminCredentials>,
}

/// Store backed by a single JSON document, rewritten atomically on every change.
///
/// Without a path the store lives only in memory.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl JsonStore {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Opens the store at `path`, loading existing contents if the file exists.
    ///
    /// # Errors
    /// Returns [`StoreError::Persistence`] if the file cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(contents) => serde_json::from_slice(&contents).map_err(|e| {
                StoreError::persistence(format!("failed to parse {}: {e}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Store file {} not found, starting empty", path.display());
                StoreState::default()
            }
            Err(err) => {
                return Err(StoreError::persistence(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    async fn mutate<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let result = operation(&mut next)?;
        if let Some(path) = &self.path {
            persist_state(path, &next).await?;
        }
        *state = next;
        Ok(result)
    }
}

async fn persist_state(path: &Path, snapshot: &StoreState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::persistence(format!("failed to prepare store dir: {e}")))?;
    }

    let payload = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| StoreError::persistence(format!("failed to encode store: {e}")))?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, payload)
        .await
        .map_err(|e| StoreError::persistence(format!("failed to write store: {e}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(STORE_FILE_MODE))
            .await
            .map_err(|e| StoreError::persistence(format!("failed to set store mode: {e}")))?;
    }
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| StoreError::persistence(format!("failed to finalize store: {e}")))?;
    debug!("Persisted store to {}", path.display());
    Ok(())
}

#[async_trait]
impl OperationStore for JsonStore {
    async fn create(&self, operation: &CreateOperation) -> Result<(), StoreError> {
        let operation = operation.clone();
        self.mutate(move |state| {
            if state.operations.contains_key(&operation.token) {
                return Err(StoreError::AlreadyExists {
                    kind: "operation",
                    key: operation.token,
                });
            }
            state.operations.insert(operation.token.clone(), operation);
            Ok(())
        })
        .await
    }

    async fn get(&self, token: &str) -> Result<CreateOperation, StoreError> {
        let state = self.state.read().await;
        state
            .operations
            .get(token)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "operation",
                key: token.to_string(),
            })
    }

    async fn list_all(&self) -> Result<Vec<CreateOperation>, StoreError> {
        let state = self.state.read().await;
        Ok(state.operations.values().cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<CreateOperation>, StoreError> {
        let state = self.state.read().await;
        let mut active: Vec<CreateOperation> = state
            .operations
            .values()
            .filter(|op| !op.is_mapped())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.accepted.cmp(&b.accepted).then(a.token.cmp(&b.token)));
        Ok(active)
    }

    async fn save(&self, operation: &CreateOperation) -> Result<(), StoreError> {
        let operation = operation.clone();
        self.mutate(move |state| {
            state.operations.insert(operation.token.clone(), operation);
            Ok(())
        })
        .await
    }

    async fn delete_expired(
        &self,
        now: OffsetDateTime,
        hard_expiry: Duration,
    ) -> Result<usize, StoreError> {
        {
            let state = self.state.read().await;
            if !state
                .operations
                .values()
                .any(|op| op.is_expired(now, hard_expiry))
            {
                return Ok(0);
            }
        }
        self.mutate(move |state| {
            let before = state.operations.len();
            state
                .operations
                .retain(|_, op| !op.is_expired(now, hard_expiry));
            Ok(before - state.operations.len())
        })
        .await
    }
}

#[async_trait]
impl AccountStore for JsonStore {
    async fn get_account(&self) -> Result<RegisteredAccount, StoreError> {
        let state = self.state.read().await;
        state.account.clone().ok_or_else(|| StoreError::NotFound {
            kind: "account",
            key: "account".to_string(),
        })
    }

    async fn create_account(&self, account: &RegisteredAccount) -> Result<(), StoreError> {
        let account = account.clone();
        self.mutate(move |state| {
            if state.account.is_some() {
                return Err(StoreError::AlreadyExists {
                    kind: "account",
                    key: "account".to_string(),
                });
            }
            state.account = Some(account);
            Ok(())
        })
        .await
    }

    async fn save_account(&self, account: &RegisteredAccount) -> Result<(), StoreError> {
        let account = account.clone();
        self.mutate(move |state| {
            state.account = Some(account);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CredentialStore for JsonStore {
    async fn get_admin(&self) -> Result<Option<AdminCredentials>, StoreError> {
        Ok(self.state.read().await.admin.clone())
    }

    async fn save_admin(&self, credentials: &AdminCredentials) -> Result<(), StoreError> {
        let credentials = credentials.clone();
        self.mutate(move |state| {
            state.admin = Some(credentials);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;

    use super::*;
    use crate::operation::Stage;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn operation(token: &str, accepted: OffsetDateTime) -> CreateOperation {
        CreateOperation::new(
            "example.com",
            token,
            "https://ca.example/authz",
            "https://ca.example/chall",
            format!("{token}.thumb"),
            accepted,
        )
    }

    #[tokio::test]
    async fn test_get_returns_created_record() {
        let store = JsonStore::in_memory();
        let op = operation("abc123", datetime!(2024-01-01 00:00 UTC));
        store.create(&op).await.unwrap();
        assert_eq!(store.get("abc123").await.unwrap(), op);
    }

    #[tokio::test]
    async fn test_second_create_does_not_overwrite() {
        let store = JsonStore::in_memory();
        let mut first = operation("abc123", datetime!(2024-01-01 00:00 UTC));
        first
            .advance(Stage::Responded, datetime!(2024-01-01 00:00:05 UTC))
            .unwrap();
        store.create(&first).await.unwrap();

        let second = operation("abc123", datetime!(2024-01-01 00:10 UTC));
        let err = store.create(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(store.list_all().await.unwrap().len(), 1);
        assert_eq!(store.get("abc123").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = JsonStore::in_memory();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_active_skips_mapped_and_sorts_oldest_first() {
        let store = JsonStore::in_memory();
        let newer = operation("b", datetime!(2024-01-02 00:00 UTC));
        let older = operation("c", datetime!(2024-01-01 00:00 UTC));
        let mut mapped = operation("a", datetime!(2023-12-31 00:00 UTC));
        mapped.mapped_certificate_id = Some("cert-1".to_string());
        mapped.is_finished = true;
        for op in [&newer, &older, &mapped] {
            store.create(op).await.unwrap();
        }

        let active = store.list_active().await.unwrap();
        let tokens: Vec<&str> = active.iter().map(|op| op.token.as_str()).collect();
        assert_eq!(tokens, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let op = operation("abc123", datetime!(2024-01-01 00:00 UTC));
        {
            let store = JsonStore::open(&path).await.unwrap();
            store.create(&op).await.unwrap();
        }

        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("abc123").await.unwrap(), op);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();
        let err = JsonStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Persistence { .. }));
    }

    #[tokio::test]
    async fn test_delete_expired_with_nothing_to_do() {
        let store = JsonStore::in_memory();
        store
            .create(&operation("abc123", datetime!(2024-01-01 00:00 UTC)))
            .await
            .unwrap();
        let removed = store
            .delete_expired(datetime!(2024-01-01 12:00 UTC), DAY)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_account_create_if_absent() {
        let store = JsonStore::in_memory();
        let account = RegisteredAccount::new(
            datetime!(2024-01-01 00:00 UTC),
            "a2V5".to_string(),
            "ops@example.com".to_string(),
        );
        assert!(matches!(
            store.get_account().await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        store.create_account(&account).await.unwrap();
        let err = store.create_account(&account).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    proptest! {
        #[test]
        fn prop_delete_expired_removes_exactly_expired_records(
            records in proptest::collection::vec((0i64..200_000, any::<bool>()), 0..30),
            now_offset in 0i64..200_000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = JsonStore::in_memory();
                let base = datetime!(2024-01-01 00:00 UTC);
                let now = base + time::Duration::seconds(now_offset);
                let mut expected = Vec::new();
                for (i, (offset, finished)) in records.iter().enumerate() {
                    let mut op = operation(&format!("t{i}"), base + time::Duration::seconds(*offset));
                    op.is_finished = *finished;
                    if !op.is_expired(now, DAY) {
                        expected.push(op.token.clone());
                    }
                    store.create(&op).await.unwrap();
                }

                let removed = store.delete_expired(now, DAY).await.unwrap();

                let mut remaining: Vec<String> =
                    store.list_all().await.unwrap().into_iter().map(|op| op.token).collect();
                remaining.sort();
                expected.sort();
                assert_eq!(removed, records.len() - expected.len());
                assert_eq!(remaining, expected);
            });
        }
    }
}
