//! Keyed store of subscription descriptors.

use crate::error::{Result, SubscriptionError};
use crate::types::{SubscriptionId, Timestamp};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::{
    subscription_key, ListQuery, Page, Subscription, SubscriptionInput, SubscriptionStatus,
    MAX_LIST_LIMIT,
};

/// Magic bytes for the registry file.
const REGISTRY_MAGIC: &[u8; 4] = b"SUB\0";

/// Current registry file format version.
const REGISTRY_VERSION: u8 = 1;

/// Magic + version + body length + checksum.
const REGISTRY_OVERHEAD: usize = 4 + 1 + 8 + 4;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryIndex {
    /// All subscriptions by ID, including those being deleted.
    subscriptions: BTreeMap<SubscriptionId, Subscription>,

    /// Consumer-group bookkeeping: idempotency key to the active
    /// subscription holding it.
    consumer_groups: BTreeMap<String, SubscriptionId>,

    /// Bumped on every create; mixed into generated IDs.
    generation: u64,
}

/// On-disk home of a durable registry.
struct RegistryFile {
    path: PathBuf,
    _lock_file: File,
}

impl RegistryFile {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.with_extension("lock"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SubscriptionError::Locked)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    fn save(&self, index: &RegistryIndex) -> Result<()> {
        let encoded = rmp_serde::to_vec(index)?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(REGISTRY_MAGIC)?;
        file.write_all(&[REGISTRY_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<RegistryIndex> {
        let data = fs::read(&self.path)?;
        if data.len() < REGISTRY_OVERHEAD {
            return Err(SubscriptionError::Corruption(
                "registry file truncated".into(),
            ));
        }

        if &data[0..4] != REGISTRY_MAGIC {
            return Err(SubscriptionError::InvalidFormat(
                "Invalid registry magic".into(),
            ));
        }
        if data[4] != REGISTRY_VERSION {
            return Err(SubscriptionError::InvalidFormat(format!(
                "Unsupported registry version: {}",
                data[4]
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[5..13]);
        let len = u64::from_le_bytes(len_bytes);
        if (data.len() - REGISTRY_OVERHEAD) as u64 != len {
            return Err(SubscriptionError::Corruption(format!(
                "registry body length {} does not match file size {}",
                len,
                data.len()
            )));
        }

        let len = len as usize;
        let body = &data[13..13 + len];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&data[13 + len..]);
        let expected = u32::from_le_bytes(crc_bytes);
        let got = crc32fast::hash(body);
        if expected != got {
            return Err(SubscriptionError::Corruption(format!(
                "registry checksum mismatch: expected {}, got {}",
                expected, got
            )));
        }

        Ok(rmp_serde::from_slice(body)?)
    }
}

/// Stores subscriptions and their consumer-group bookkeeping.
///
/// Listing order is by identifier, so paging with `limit`/`offset` is
/// deterministic while nothing is written concurrently.
pub struct SubscriptionRegistry {
    index: RwLock<RegistryIndex>,
    /// `None` for a purely in-memory registry.
    file: Option<RegistryFile>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("durable", &self.file.is_some())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create an empty in-memory registry.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(RegistryIndex::default()),
            file: None,
        }
    }

    /// Open a durable registry at `path`, creating it if missing.
    ///
    /// The file is locked exclusively for the registry's lifetime.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = RegistryFile::open(path.as_ref())?;

        let index = if file.path.exists() {
            file.load()?
        } else {
            let index = RegistryIndex::default();
            file.save(&index)?;
            index
        };

        tracing::debug!(
            path = %file.path.display(),
            subscriptions = index.subscriptions.len(),
            "opened subscription registry"
        );

        Ok(Self {
            index: RwLock::new(index),
            file: Some(file),
        })
    }

    /// Create a subscription, or return the existing one with the same
    /// owning application, consumer group and event types.
    ///
    /// The flag is `true` when a new subscription was created.
    pub fn create(&self, input: SubscriptionInput) -> Result<(Subscription, bool)> {
        self.create_inner(None, input)
    }

    /// Like [`create`](Self::create) but with a caller-chosen identifier.
    pub fn create_with_id(
        &self,
        id: SubscriptionId,
        input: SubscriptionInput,
    ) -> Result<(Subscription, bool)> {
        if id.as_str().is_empty() {
            return Err(SubscriptionError::InvalidRequest(
                "subscription id must not be empty".into(),
            ));
        }
        self.create_inner(Some(id), input)
    }

    fn create_inner(
        &self,
        id: Option<SubscriptionId>,
        input: SubscriptionInput,
    ) -> Result<(Subscription, bool)> {
        validate_input(&input)?;
        let key = subscription_key(
            &input.owning_application,
            &input.consumer_group,
            &input.event_types,
        );

        self.mutate(|index| {
            if let Some(existing) = index
                .consumer_groups
                .get(&key)
                .and_then(|id| index.subscriptions.get(id))
            {
                return Ok((existing.clone(), false));
            }

            index.generation += 1;
            let id = match id {
                Some(id) => {
                    if index.subscriptions.contains_key(&id) {
                        return Err(SubscriptionError::InvalidRequest(format!(
                            "subscription {} already exists",
                            id
                        )));
                    }
                    id
                }
                None => generate_id(&key, index.generation),
            };

            let subscription = Subscription {
                id: id.clone(),
                owning_application: input.owning_application,
                event_types: input.event_types,
                consumer_group: input.consumer_group,
                read_from: input.read_from,
                status: SubscriptionStatus::Active,
                created_at: Timestamp::now(),
            };

            index.consumer_groups.insert(key, id.clone());
            index.subscriptions.insert(id.clone(), subscription.clone());

            tracing::info!(
                subscription = %id,
                owning_application = %subscription.owning_application,
                event_types = subscription.event_types.len(),
                "created subscription"
            );
            Ok((subscription, true))
        })
    }

    /// Look up a subscription, whatever its status.
    pub fn get(&self, id: &SubscriptionId) -> Result<Subscription> {
        self.index
            .read()
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| SubscriptionError::SubscriptionNotFound(id.clone()))
    }

    /// List active subscriptions matching `query`, ordered by identifier.
    pub fn list(&self, query: &ListQuery) -> Result<Page<Subscription>> {
        if query.limit == 0 || query.limit > MAX_LIST_LIMIT {
            return Err(SubscriptionError::InvalidRequest(format!(
                "limit must be between 1 and {}, got {}",
                MAX_LIST_LIMIT, query.limit
            )));
        }

        let index = self.index.read();
        let mut matching = index
            .subscriptions
            .values()
            .filter(|s| s.is_active() && query.matches(s))
            .skip(query.offset);

        let items: Vec<Subscription> = matching.by_ref().take(query.limit).cloned().collect();
        let has_more = matching.next().is_some();

        Ok(Page {
            items,
            limit: query.limit,
            offset: query.offset,
            prev_offset: (query.offset > 0).then(|| query.offset.saturating_sub(query.limit)),
            next_offset: has_more.then(|| query.offset + query.limit),
        })
    }

    /// Mark a subscription as deleting and release its consumer group.
    ///
    /// Deleting a subscription that is already being deleted succeeds.
    pub fn delete(&self, id: &SubscriptionId) -> Result<()> {
        self.mutate(|index| {
            let subscription = index
                .subscriptions
                .get_mut(id)
                .ok_or_else(|| SubscriptionError::SubscriptionNotFound(id.clone()))?;

            if subscription.status == SubscriptionStatus::Deleting {
                tracing::debug!(subscription = %id, "subscription already deleting");
                return Ok(());
            }

            subscription.status = SubscriptionStatus::Deleting;
            let key = subscription.key();
            if index.consumer_groups.get(&key) == Some(id) {
                index.consumer_groups.remove(&key);
            }

            tracing::info!(subscription = %id, "deleting subscription");
            Ok(())
        })
    }

    /// Remove a subscription that is being deleted.
    pub fn purge(&self, id: &SubscriptionId) -> Result<()> {
        self.mutate(|index| {
            let subscription = index
                .subscriptions
                .get(id)
                .ok_or_else(|| SubscriptionError::SubscriptionNotFound(id.clone()))?;
            if subscription.is_active() {
                return Err(SubscriptionError::InvalidRequest(format!(
                    "subscription {} is active; delete it first",
                    id
                )));
            }
            index.subscriptions.remove(id);
            tracing::debug!(subscription = %id, "purged subscription");
            Ok(())
        })
    }

    /// Remove every subscription that is being deleted. Returns the count.
    pub fn purge_deleting(&self) -> Result<usize> {
        self.mutate(|index| {
            let before = index.subscriptions.len();
            index.subscriptions.retain(|_, s| s.is_active());
            Ok(before - index.subscriptions.len())
        })
    }

    /// Number of stored subscriptions, including those being deleted.
    pub fn len(&self) -> usize {
        self.index.read().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().subscriptions.is_empty()
    }

    /// Apply `f` under the write lock; for durable registries the change is
    /// only kept once it is on disk.
    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryIndex) -> Result<T>,
    {
        let mut index = self.index.write();
        match &self.file {
            None => f(&mut index),
            Some(file) => {
                let mut next = index.clone();
                let out = f(&mut next)?;
                file.save(&next)?;
                *index = next;
                Ok(out)
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_input(input: &SubscriptionInput) -> Result<()> {
    let invalid = |msg: String| Err(SubscriptionError::InvalidRequest(msg));

    if input.owning_application.trim().is_empty() {
        return invalid("owning_application must not be empty".into());
    }
    if input.consumer_group.trim().is_empty() {
        return invalid("consumer_group must not be empty".into());
    }
    if input.event_types.is_empty() {
        return invalid("at least one event type is required".into());
    }
    let mut seen = HashSet::new();
    for event_type in &input.event_types {
        if event_type.trim().is_empty() {
            return invalid("event type names must not be empty".into());
        }
        if !seen.insert(event_type.as_str()) {
            return invalid(format!("duplicate event type: {}", event_type));
        }
    }
    Ok(())
}

/// UUID-shaped identifier derived from the idempotency key.
fn generate_id(key: &str, generation: u64) -> SubscriptionId {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(generation.to_le_bytes());
    let digest = hex::encode(&hasher.finalize()[..16]);
    SubscriptionId(format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    ))
}
