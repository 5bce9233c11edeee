//! Token and family persistence.
//!
//! Layout in the authoritative store:
//!
//! | table | key | value |
//! |-------|-----|-------|
//! | `token_family` | family id | [`TokenFamily`] |
//! | `refresh_token` | SHA-256 of the secret | [`TokenRecord`] |
//! | `refresh_token_jti` | jti | [`TokenRecord`] |
//! | `user_token_family` | user id | list of family ids |
//!
//! Token records never change once written, so they are cached freely.
//! Family rows are read from the store for every update and written with
//! compare-and-put; their cache entry is invalidated after each write.
//!
//! Per-user entries live under `user:{user_id}:` so they can be dropped
//! together.

use serde_json::Value;
use std::sync::Arc;
use wiseup_cache::CacheTierManager;
use wiseup_storage::{DynStore, StoreError};

use crate::config::TokenConfig;
use crate::error::AuthResult;
use crate::token::{TokenFamily, TokenRecord};

pub const FAMILY_TABLE: &str = "token_family";
pub const TOKEN_HASH_TABLE: &str = "refresh_token";
pub const TOKEN_JTI_TABLE: &str = "refresh_token_jti";
pub const USER_FAMILIES_TABLE: &str = "user_token_family";

const USER_INDEX_RETRIES: usize = 8;

pub(crate) fn family_cache_key(family_id: &str) -> String {
    format!("family:{family_id}")
}

fn hash_cache_key(token_hash: &str) -> String {
    format!("token:{token_hash}")
}

fn jti_cache_key(jti: &str) -> String {
    format!("jti:{jti}")
}

pub(crate) fn user_cache_prefix(user_id: &str) -> String {
    format!("user:{user_id}:")
}

fn user_families_cache_key(user_id: &str) -> String {
    format!("{}families", user_cache_prefix(user_id))
}

pub struct FamilyRepository {
    store: DynStore,
    cache: Arc<CacheTierManager>,
    config: TokenConfig,
}

impl FamilyRepository {
    pub fn new(store: DynStore, cache: Arc<CacheTierManager>, config: TokenConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    /// Index a new token under its hash and its jti.
    pub async fn put_token(&self, token_hash: &str, record: &TokenRecord) -> AuthResult<()> {
        let value = serde_json::to_value(record)?;
        self.store
            .put(TOKEN_HASH_TABLE, token_hash, value.clone())
            .await?;
        self.store.put(TOKEN_JTI_TABLE, &record.jti, value).await?;
        Ok(())
    }

    /// Token record by secret hash, read through the cache.
    pub async fn find_by_hash(&self, token_hash: &str) -> AuthResult<Option<TokenRecord>> {
        self.cached_record(hash_cache_key(token_hash), TOKEN_HASH_TABLE, token_hash)
            .await
    }

    /// Token record by jti, read through the cache.
    pub async fn find_by_jti(&self, jti: &str) -> AuthResult<Option<TokenRecord>> {
        self.cached_record(jti_cache_key(jti), TOKEN_JTI_TABLE, jti)
            .await
    }

    async fn cached_record(
        &self,
        cache_key: String,
        table: &'static str,
        key: &str,
    ) -> AuthResult<Option<TokenRecord>> {
        let store = &self.store;
        let record = self
            .cache
            .get_or_load_typed(&cache_key, self.config.lookup_cache_ttl, || async move {
                decode_row::<TokenRecord>(store.get(table, key).await?)
            })
            .await?;
        Ok(record)
    }

    /// Family as currently cached, for read-only checks.
    pub async fn cached_family(&self, family_id: &str) -> AuthResult<Option<TokenFamily>> {
        let store = &self.store;
        let family = self
            .cache
            .get_or_load_typed(
                &family_cache_key(family_id),
                self.config.lookup_cache_ttl,
                || async move { load_family_row(store, family_id).await },
            )
            .await?;
        Ok(family)
    }

    /// Family straight from the store, with its row version, for updates.
    pub async fn load_family(&self, family_id: &str) -> AuthResult<Option<TokenFamily>> {
        Ok(load_family_row(&self.store, family_id).await?)
    }

    /// Create a family row. Fails if the id is taken.
    pub async fn create_family(&self, family: &mut TokenFamily) -> AuthResult<()> {
        let value = serde_json::to_value(&*family)?;
        family.version = self
            .store
            .compare_and_put(FAMILY_TABLE, &family.family_id, None, value)
            .await?;
        self.add_user_family(&family.user_id, &family.family_id)
            .await?;
        Ok(())
    }

    /// Write `family` if the stored row is still at `family.version`.
    ///
    /// # Errors
    ///
    /// `StoreError::VersionConflict` when another writer updated the family
    /// since it was loaded.
    pub async fn update_family(&self, family: &mut TokenFamily) -> Result<(), StoreError> {
        let value = serde_json::to_value(&*family).map_err(StoreError::from)?;
        let version = self
            .store
            .compare_and_put(FAMILY_TABLE, &family.family_id, Some(family.version), value)
            .await;
        // Drop the cached copy even when the write failed: the row changed.
        self.cache
            .invalidate(&family_cache_key(&family.family_id))
            .await;
        family.version = version?;
        Ok(())
    }

    /// Family ids of a user, straight from the store.
    pub async fn user_families(&self, user_id: &str) -> AuthResult<Vec<String>> {
        let row = self.store.get(USER_FAMILIES_TABLE, user_id).await?;
        Ok(match row {
            Some(row) => serde_json::from_value(row.value)?,
            None => Vec::new(),
        })
    }

    /// Family ids of a user, read through the cache. For listings only;
    /// revocation reads the store.
    pub async fn cached_user_families(&self, user_id: &str) -> AuthResult<Vec<String>> {
        let store = &self.store;
        let ids = self
            .cache
            .get_or_load_typed(
                &user_families_cache_key(user_id),
                self.config.lookup_cache_ttl,
                || async move {
                    decode_row::<Vec<String>>(store.get(USER_FAMILIES_TABLE, user_id).await?)
                },
            )
            .await?;
        Ok(ids.unwrap_or_default())
    }

    /// Drop every cached entry scoped to `user_id`, here and on peers.
    pub async fn invalidate_user(&self, user_id: &str) {
        self.cache.invalidate_prefix(&user_cache_prefix(user_id)).await;
    }

    async fn add_user_family(&self, user_id: &str, family_id: &str) -> AuthResult<()> {
        for _ in 0..USER_INDEX_RETRIES {
            let row = self.store.get(USER_FAMILIES_TABLE, user_id).await?;
            let (mut ids, expected): (Vec<String>, Option<u64>) = match row {
                Some(row) => (serde_json::from_value(row.value)?, Some(row.version)),
                None => (Vec::new(), None),
            };
            ids.push(family_id.to_string());
            match self
                .store
                .compare_and_put(USER_FAMILIES_TABLE, user_id, expected, Value::from(ids))
                .await
            {
                Ok(_) => {
                    self.cache.invalidate(&user_families_cache_key(user_id)).await;
                    return Ok(());
                }
                Err(e) if e.is_version_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(crate::error::AuthError::internal(format!(
            "user family index for {user_id} kept conflicting"
        )))
    }
}

async fn load_family_row(
    store: &DynStore,
    family_id: &str,
) -> Result<Option<TokenFamily>, StoreError> {
    match store.get(FAMILY_TABLE, family_id).await? {
        Some(row) => {
            let mut family: TokenFamily = serde_json::from_value(row.value)?;
            family.version = row.version;
            Ok(Some(family))
        }
        None => Ok(None),
    }
}

fn decode_row<T: serde::de::DeserializeOwned>(
    row: Option<wiseup_storage::StoredRow>,
) -> Result<Option<T>, StoreError> {
    row.map(|row| serde_json::from_value(row.value).map_err(StoreError::from))
        .transpose()
}
