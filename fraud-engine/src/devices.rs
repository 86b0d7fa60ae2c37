//! Device fingerprints and trust promotion
//!
//! Trust is only ever granted by policy: a device becomes trusted after a
//! configured number of consecutive clean transactions. It is lost after a
//! period of inactivity or on explicit revocation.

use crate::{Decision, Error, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Known device for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// Record ID
    pub id: Uuid,

    /// Owner
    pub user_id: String,

    /// SHA-256 of user id and device id; the raw device id is not stored
    pub fingerprint_hash: String,

    /// Promoted to trusted
    pub trusted: bool,

    /// First sighting
    pub first_seen: DateTime<Utc>,

    /// Latest sighting
    pub last_seen: DateTime<Utc>,

    /// Consecutive clean transactions
    pub clean_transaction_count: u32,

    /// When trust was granted
    pub trusted_at: Option<DateTime<Utc>>,
}

/// Compute the stored hash for a device
pub fn fingerprint_hash(user_id: &str, device_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(device_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Log-friendly prefix of a stored hash
fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Trust state change caused by a sighting or an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustChange {
    /// First sighting created the record
    Registered,
    /// Clean streak reached the promotion threshold
    Promoted,
    /// Trust lapsed after inactivity
    Decayed,
    /// User distrusted the device
    Revoked,
}

/// Device state observed at the start of an evaluation
#[derive(Debug, Clone)]
pub struct DeviceSighting {
    /// Record after registration/decay, before the outcome is applied
    pub fingerprint: DeviceFingerprint,

    /// Created by this sighting
    pub first_sighting: bool,

    /// Trust lapsed on this sighting
    pub decayed: bool,
}

/// Promotion and decay constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTrustPolicy {
    /// Consecutive clean transactions needed for trust (>= 2)
    pub promotion_threshold: u32,

    /// Inactivity after which trust lapses
    pub decay_after: Duration,
}

impl Default for DeviceTrustPolicy {
    fn default() -> Self {
        Self {
            promotion_threshold: 5,
            decay_after: Duration::days(90),
        }
    }
}

impl DeviceTrustPolicy {
    /// Trust must never come from a single transaction
    pub fn validate(&self) -> Result<()> {
        if self.promotion_threshold < 2 {
            return Err(Error::Config(format!(
                "device promotion threshold {} must be at least 2",
                self.promotion_threshold
            )));
        }
        if self.decay_after <= Duration::zero() {
            return Err(Error::Config("device trust decay must be positive".to_string()));
        }
        Ok(())
    }
}

/// Device store collaborator
pub trait DeviceStore: Send + Sync {
    /// Fetch a device by its hash
    fn get(&self, user_id: &str, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>>;

    /// Insert or replace by record ID
    fn upsert(&self, device: DeviceFingerprint) -> Result<()>;

    /// All devices of a user
    fn list(&self, user_id: &str) -> Result<Vec<DeviceFingerprint>>;
}

/// In-memory device store keyed by user, then fingerprint hash
#[derive(Debug, Default)]
pub struct InMemoryDeviceStore {
    devices: DashMap<String, Vec<DeviceFingerprint>>,
}

impl InMemoryDeviceStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for InMemoryDeviceStore {
    fn get(&self, user_id: &str, fingerprint_hash: &str) -> Result<Option<DeviceFingerprint>> {
        Ok(self.devices.get(user_id).and_then(|devices| {
            devices
                .iter()
                .find(|d| d.fingerprint_hash == fingerprint_hash)
                .cloned()
        }))
    }

    fn upsert(&self, device: DeviceFingerprint) -> Result<()> {
        let mut devices = self.devices.entry(device.user_id.clone()).or_default();
        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device,
            None => devices.push(device),
        }
        Ok(())
    }

    fn list(&self, user_id: &str) -> Result<Vec<DeviceFingerprint>> {
        Ok(self
            .devices
            .get(user_id)
            .map(|devices| devices.clone())
            .unwrap_or_default())
    }
}

/// Applies the trust policy on top of a [`DeviceStore`]
pub struct DeviceTrustTracker {
    store: Arc<dyn DeviceStore>,
    policy: DeviceTrustPolicy,
}

impl DeviceTrustTracker {
    /// Create tracker
    pub fn new(store: Arc<dyn DeviceStore>, policy: DeviceTrustPolicy) -> Self {
        Self { store, policy }
    }

    /// Active policy
    pub fn policy(&self) -> DeviceTrustPolicy {
        self.policy
    }

    /// Read the device and apply registration and decay without persisting
    pub fn observe(&self, user_id: &str, device_id: &str, at: DateTime<Utc>) -> Result<DeviceSighting> {
        let hash = fingerprint_hash(user_id, device_id);
        let existing = self.store.get(user_id, &hash).map_err(unavailable)?;

        let Some(mut device) = existing else {
            debug!("First sighting of device {} for user {}", short_hash(&hash), user_id);
            return Ok(DeviceSighting {
                fingerprint: DeviceFingerprint {
                    id: Uuid::now_v7(),
                    user_id: user_id.to_string(),
                    fingerprint_hash: hash,
                    trusted: false,
                    first_seen: at,
                    last_seen: at,
                    clean_transaction_count: 0,
                    trusted_at: None,
                },
                first_sighting: true,
                decayed: false,
            });
        };

        let mut decayed = false;
        if device.trusted && at - device.last_seen > self.policy.decay_after {
            info!(
                "Trust decayed for device {} of user {} (idle since {})",
                short_hash(&device.fingerprint_hash),
                user_id,
                device.last_seen
            );
            device.trusted = false;
            device.trusted_at = None;
            device.clean_transaction_count = 0;
            decayed = true;
        }

        if at > device.last_seen {
            device.last_seen = at;
        }

        Ok(DeviceSighting {
            fingerprint: device,
            first_sighting: false,
            decayed,
        })
    }

    /// `touch(userId, deviceId)`: observe and persist the sighting
    pub fn touch(&self, user_id: &str, device_id: &str, at: DateTime<Utc>) -> Result<DeviceFingerprint> {
        let sighting = self.observe(user_id, device_id, at)?;
        self.store.upsert(sighting.fingerprint.clone())?;
        Ok(sighting.fingerprint)
    }

    /// Fold an evaluation outcome into the clean streak
    pub fn apply_outcome(
        &self,
        mut device: DeviceFingerprint,
        decision: Decision,
        at: DateTime<Utc>,
    ) -> (DeviceFingerprint, Option<TrustChange>) {
        if !decision.is_clean() {
            device.clean_transaction_count = 0;
            return (device, None);
        }

        device.clean_transaction_count = device.clean_transaction_count.saturating_add(1);
        if !device.trusted && device.clean_transaction_count >= self.policy.promotion_threshold {
            device.trusted = true;
            device.trusted_at = Some(at);
            info!(
                "Device {} of user {} promoted to trusted after {} clean transactions",
                short_hash(&device.fingerprint_hash),
                device.user_id,
                device.clean_transaction_count
            );
            return (device, Some(TrustChange::Promoted));
        }

        (device, None)
    }

    /// Explicitly distrust a device
    pub fn revoke(&self, user_id: &str, device_id: &str) -> Result<DeviceFingerprint> {
        let hash = fingerprint_hash(user_id, device_id);
        let mut device = self
            .store
            .get(user_id, &hash)?
            .ok_or_else(|| Error::NotFound(format!("device {} for user {}", short_hash(&hash), user_id)))?;

        device.trusted = false;
        device.trusted_at = None;
        device.clean_transaction_count = 0;
        self.store.upsert(device.clone())?;
        info!("Device {} of user {} revoked", short_hash(&hash), user_id);
        Ok(device)
    }

    /// Persist a device record
    pub fn save(&self, device: DeviceFingerprint) -> Result<()> {
        self.store.upsert(device)
    }

    /// Devices known for a user
    pub fn devices(&self, user_id: &str) -> Result<Vec<DeviceFingerprint>> {
        self.store.list(user_id)
    }
}

fn unavailable(err: Error) -> Error {
    match err {
        Error::DependencyUnavailable(msg) => Error::DependencyUnavailable(msg),
        other => Error::DependencyUnavailable(format!("device store: {}", other)),
    }
}
