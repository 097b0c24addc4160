//! Credential Cache
//!
//! Tiered lookup for session credentials: memory, then a JSON file per kind,
//! then the issuer. Concurrent misses for the same kind collapse into one
//! issuance.
//!
//! When the issuer is throttled the last credential written to disk is
//! returned even if it has expired. It is not promoted into memory, so the
//! next call tries issuance again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::application::ports::{CredentialIssuer, IssueError};
use crate::domain::credential::{Credential, CredentialKind};
use crate::infrastructure::metrics::{CredentialSource, record_credential_lookup};

/// Lifetime assumed when the issuer does not report one.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the credential cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    /// No cached credential and issuance failed.
    #[error("failed to obtain {kind}: {source}")]
    Unavailable {
        /// Credential kind requested.
        kind: &'static str,
        /// Issuer failure.
        #[source]
        source: IssueError,
    },
}

/// Errors from the credential file store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("credential file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// File contents are not a credential.
    #[error("credential file is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// File Store
// =============================================================================

/// One JSON file per credential kind under a directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `kind`.
    #[must_use]
    pub fn path_for(&self, kind: CredentialKind) -> PathBuf {
        self.dir.join(format!("kis_{}.json", kind.as_str()))
    }

    /// Stored credential if it is still valid.
    pub async fn load(&self, kind: CredentialKind) -> Option<Credential> {
        self.load_ignoring_expiry(kind)
            .await
            .filter(Credential::is_valid)
    }

    /// Stored credential regardless of expiry.
    pub async fn load_ignoring_expiry(&self, kind: CredentialKind) -> Option<Credential> {
        match self.read(kind).await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), error = %e, "Ignoring unreadable credential file");
                None
            }
        }
    }

    async fn read(&self, kind: CredentialKind) -> Result<Option<Credential>, StoreError> {
        let text = match tokio::fs::read_to_string(self.path_for(kind)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Persist `credential` for `kind`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the directory or file cannot be written.
    pub async fn save(&self, kind: CredentialKind, credential: &Credential) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let text = serde_json::to_string_pretty(credential)?;
        tokio::fs::write(self.path_for(kind), text).await?;
        Ok(())
    }

    /// Delete the stored credential for `kind`. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the file exists but cannot be removed.
    pub async fn remove(&self, kind: CredentialKind) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(kind)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Lifetimes applied to freshly issued credentials.
#[derive(Debug, Clone, Copy)]
pub struct CredentialTtls {
    /// Access token lifetime when the issuer reports none.
    pub access_token: Duration,
    /// Approval key lifetime.
    pub approval_key: Duration,
}

impl Default for CredentialTtls {
    fn default() -> Self {
        Self {
            access_token: DEFAULT_CREDENTIAL_TTL,
            approval_key: DEFAULT_CREDENTIAL_TTL,
        }
    }
}

impl CredentialTtls {
    const fn fallback_for(&self, kind: CredentialKind) -> Duration {
        match kind {
            CredentialKind::AccessToken => self.access_token,
            CredentialKind::ApprovalKey => self.approval_key,
        }
    }
}

/// Concurrent-safe credential cache shared by every connection.
pub struct CredentialCache {
    issuer: Arc<dyn CredentialIssuer>,
    store: CredentialStore,
    ttls: CredentialTtls,
    memory: RwLock<HashMap<CredentialKind, Credential>>,
    access_token_gate: Mutex<()>,
    approval_key_gate: Mutex<()>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("store", &self.store)
            .field("ttls", &self.ttls)
            .field("cached", &self.memory.read().len())
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    /// Create a cache.
    pub fn new(issuer: Arc<dyn CredentialIssuer>, store: CredentialStore, ttls: CredentialTtls) -> Self {
        Self {
            issuer,
            store,
            ttls,
            memory: RwLock::new(HashMap::new()),
            access_token_gate: Mutex::new(()),
            approval_key_gate: Mutex::new(()),
        }
    }

    /// REST access token.
    ///
    /// # Errors
    ///
    /// See [`CredentialCache::get`].
    pub async fn access_token(&self) -> Result<Credential, CredentialError> {
        self.get(CredentialKind::AccessToken).await
    }

    /// Real-time approval key.
    ///
    /// # Errors
    ///
    /// See [`CredentialCache::get`].
    pub async fn approval_key(&self) -> Result<Credential, CredentialError> {
        self.get(CredentialKind::ApprovalKey).await
    }

    /// Credential of `kind` from the first tier that has a valid one.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Unavailable`] when issuance fails and no
    /// file fallback applies.
    pub async fn get(&self, kind: CredentialKind) -> Result<Credential, CredentialError> {
        if let Some(credential) = self.from_memory(kind) {
            record_credential_lookup(kind.as_str(), CredentialSource::Memory);
            return Ok(credential);
        }

        let _gate = self.gate(kind).lock().await;

        // another caller may have filled it while we waited
        if let Some(credential) = self.from_memory(kind) {
            record_credential_lookup(kind.as_str(), CredentialSource::Memory);
            return Ok(credential);
        }

        if let Some(credential) = self.store.load(kind).await {
            tracing::debug!(kind = kind.as_str(), "Credential loaded from file");
            self.memory.write().insert(kind, credential.clone());
            record_credential_lookup(kind.as_str(), CredentialSource::File);
            return Ok(credential);
        }

        match self.issuer.issue(kind).await {
            Ok(issued) => {
                let ttl = issued.ttl.unwrap_or_else(|| self.ttls.fallback_for(kind));
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
                let credential = Credential::new(issued.value, expires_at);

                self.memory.write().insert(kind, credential.clone());
                if let Err(e) = self.store.save(kind, &credential).await {
                    tracing::warn!(kind = kind.as_str(), error = %e, "Failed to persist credential");
                }

                tracing::info!(kind = kind.as_str(), expires_at = %expires_at, "Credential issued");
                record_credential_lookup(kind.as_str(), CredentialSource::Issued);
                Ok(credential)
            }
            Err(e) if e.is_rate_limited() => {
                if let Some(stale) = self.store.load_ignoring_expiry(kind).await {
                    tracing::warn!(
                        kind = kind.as_str(),
                        expires_at = %stale.expires_at(),
                        "Issuance rate limited, using last stored credential"
                    );
                    record_credential_lookup(kind.as_str(), CredentialSource::StaleFallback);
                    return Ok(stale);
                }
                record_credential_lookup(kind.as_str(), CredentialSource::Failed);
                Err(CredentialError::Unavailable {
                    kind: kind.as_str(),
                    source: e,
                })
            }
            Err(e) => {
                record_credential_lookup(kind.as_str(), CredentialSource::Failed);
                Err(CredentialError::Unavailable {
                    kind: kind.as_str(),
                    source: e,
                })
            }
        }
    }

    /// Place a credential in the memory tier.
    pub fn seed(&self, kind: CredentialKind, credential: Credential) {
        self.memory.write().insert(kind, credential);
    }

    /// Forget `kind` in both tiers so the next lookup issues a new one.
    pub async fn invalidate(&self, kind: CredentialKind) {
        let _gate = self.gate(kind).lock().await;
        self.memory.write().remove(&kind);
        if let Err(e) = self.store.remove(kind).await {
            tracing::warn!(kind = kind.as_str(), error = %e, "Failed to remove credential file");
        }
    }

    fn from_memory(&self, kind: CredentialKind) -> Option<Credential> {
        self.memory
            .read()
            .get(&kind)
            .filter(|c| c.is_valid())
            .cloned()
    }

    const fn gate(&self, kind: CredentialKind) -> &Mutex<()> {
        match kind {
            CredentialKind::AccessToken => &self.access_token_gate,
            CredentialKind::ApprovalKey => &self.approval_key_gate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{IssuedCredential, MockCredentialIssuer};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_with(issuer: MockCredentialIssuer, dir: &Path) -> CredentialCache {
        CredentialCache::new(
            Arc::new(issuer),
            CredentialStore::new(dir),
            CredentialTtls::default(),
        )
    }

    fn issued(value: &str) -> IssuedCredential {
        IssuedCredential {
            value: value.to_string(),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn valid_memory_credential_skips_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = MockCredentialIssuer::new();
        issuer.expect_issue().times(0);
        let cache = cache_with(issuer, dir.path());

        cache.seed(
            CredentialKind::ApprovalKey,
            Credential::new("cached", Utc::now() + ChronoDuration::seconds(3600)),
        );

        let credential = cache.approval_key().await.unwrap();
        assert_eq!(credential.value(), "cached");
    }

    #[tokio::test]
    async fn invalidated_credential_is_reissued_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut issuer = MockCredentialIssuer::new();
        let counter = Arc::clone(&calls);
        issuer.expect_issue().times(2).returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(issued(&format!("key-{n}")))
        });
        let cache = cache_with(issuer, dir.path());

        assert_eq!(cache.approval_key().await.unwrap().value(), "key-0");
        let path = CredentialStore::new(dir.path()).path_for(CredentialKind::ApprovalKey);
        assert!(path.exists());

        cache.invalidate(CredentialKind::ApprovalKey).await;
        assert!(!path.exists());
        assert_eq!(cache.approval_key().await.unwrap().value(), "key-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidating_an_absent_credential_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = MockCredentialIssuer::new();
        issuer.expect_issue().times(0);
        let cache = cache_with(issuer, dir.path());

        cache.invalidate(CredentialKind::AccessToken).await;
        assert!(cache.store.remove(CredentialKind::AccessToken).await.is_ok());
    }

    #[tokio::test]
    async fn expired_memory_credential_is_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = MockCredentialIssuer::new();
        issuer
            .expect_issue()
            .withf(|kind| *kind == CredentialKind::ApprovalKey)
            .times(1)
            .returning(|_| Ok(issued("fresh")));
        let cache = cache_with(issuer, dir.path());

        cache.seed(
            CredentialKind::ApprovalKey,
            Credential::new("stale", Utc::now() - ChronoDuration::seconds(1)),
        );

        let credential = cache.approval_key().await.unwrap();
        assert_eq!(credential.value(), "fresh");
        assert!(credential.is_valid());
    }

    #[tokio::test]
    async fn issued_credential_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = MockCredentialIssuer::new();
        issuer
            .expect_issue()
            .times(1)
            .returning(|_| {
                Ok(IssuedCredential {
                    value: "tok".to_string(),
                    ttl: Some(Duration::from_secs(600)),
                })
            });
        let cache = cache_with(issuer, dir.path());

        let first = cache.access_token().await.unwrap();
        let second = cache.access_token().await.unwrap();
        assert_eq!(first, second);

        let stored = CredentialStore::new(dir.path())
            .load(CredentialKind::AccessToken)
            .await
            .unwrap();
        assert_eq!(stored.value(), "tok");
        assert!(stored.expires_at() <= Utc::now() + ChronoDuration::seconds(601));
    }

    #[tokio::test]
    async fn valid_file_credential_skips_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store
            .save(
                CredentialKind::AccessToken,
                &Credential::new("from-file", Utc::now() + ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        let mut issuer = MockCredentialIssuer::new();
        issuer.expect_issue().times(0);
        let cache = cache_with(issuer, dir.path());

        assert_eq!(cache.access_token().await.unwrap().value(), "from-file");
    }

    #[tokio::test]
    async fn rate_limit_falls_back_to_expired_file_without_promoting() {
        let dir = tempfile::tempdir().unwrap();
        CredentialStore::new(dir.path())
            .save(
                CredentialKind::AccessToken,
                &Credential::new("old", Utc::now() - ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        let mut issuer = MockCredentialIssuer::new();
        issuer
            .expect_issue()
            .times(2)
            .returning(|_| Err(IssueError::RateLimited("EGW00133".to_string())));
        let cache = cache_with(issuer, dir.path());

        assert_eq!(cache.access_token().await.unwrap().value(), "old");
        // not promoted: the second call goes back to the issuer
        assert_eq!(cache.access_token().await.unwrap().value(), "old");
    }

    #[tokio::test]
    async fn rate_limit_without_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = MockCredentialIssuer::new();
        issuer
            .expect_issue()
            .returning(|_| Err(IssueError::RateLimited("429".to_string())));
        let cache = cache_with(issuer, dir.path());

        assert!(matches!(
            cache.approval_key().await,
            Err(CredentialError::Unavailable { kind: "approval_key", .. })
        ));
    }

    #[tokio::test]
    async fn other_issue_errors_do_not_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        CredentialStore::new(dir.path())
            .save(
                CredentialKind::ApprovalKey,
                &Credential::new("old", Utc::now() - ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        let mut issuer = MockCredentialIssuer::new();
        issuer.expect_issue().returning(|_| {
            Err(IssueError::Rejected {
                status: 401,
                body: "bad key".to_string(),
            })
        });
        let cache = cache_with(issuer, dir.path());

        tokio_test::assert_err!(cache.approval_key().await);
    }

    struct CountingIssuer {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CredentialIssuer for CountingIssuer {
        async fn issue(&self, _kind: CredentialKind) -> Result<IssuedCredential, IssueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(issued("shared"))
        }
    }

    #[tokio::test]
    async fn concurrent_misses_issue_once() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(CredentialCache::new(
            issuer.clone(),
            CredentialStore::new(dir.path()),
            CredentialTtls::default(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.approval_key().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value(), "shared");
        }
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        std::fs::write(store.path_for(CredentialKind::ApprovalKey), "not json").unwrap();
        assert!(store.load_ignoring_expiry(CredentialKind::ApprovalKey).await.is_none());
    }
}
