//! Datastore contracts and the in-process implementation.
//!
//! The real geospatial engine is an external collaborator; the server depends
//! only on these traits. `MemStore` is the DashMap-backed implementation used
//! by the development server and the tests. Methods are fallible so a
//! networked adapter can slot in without touching the handlers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::error::ApiError;
use crate::geo::haversine_km;

/// Hard cap on nearby-query results.
pub const MAX_NUM_USERS_NEARBY: usize = 20;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub hashed_password: String,
    pub disabled: bool,
}

/// One stored point per user; an update replaces it, there is no history.
#[derive(Debug, Clone)]
pub struct LocationEntry {
    pub lat: f64,
    pub lon: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyUser {
    pub user_id: String,
    pub distance_km: f64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

pub trait UserStore: Send + Sync {
    fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;
    /// Idempotent create-or-replace.
    fn upsert_user(&self, user_id: &str, hashed_password: &str, disabled: bool)
        -> Result<(), StoreError>;
    fn user_exists(&self, user_id: &str) -> Result<bool, StoreError>;
}

pub trait GeoStore: Send + Sync {
    fn upsert_point(&self, user_id: &str, lat: f64, lon: f64, timestamp: DateTime<Utc>)
        -> Result<(), StoreError>;
    /// Nearest users within `max_distance_km` of the caller's stored point,
    /// ascending by distance, caller excluded, capped at
    /// [`MAX_NUM_USERS_NEARBY`]. `Ok(None)` when the caller has no point.
    fn query_nearby(&self, user_id: &str, max_distance_km: f64)
        -> Result<Option<Vec<NearbyUser>>, StoreError>;
}

#[derive(Default)]
pub struct MemStore {
    users: DashMap<String, UserRecord>,
    locations: DashMap<String, LocationEntry>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl UserStore for MemStore {
    fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(user_id).map(|r| r.clone()))
    }

    fn upsert_user(&self, user_id: &str, hashed_password: &str, disabled: bool)
        -> Result<(), StoreError>
    {
        self.users.insert(user_id.to_string(), UserRecord {
            user_id: user_id.to_string(),
            hashed_password: hashed_password.to_string(),
            disabled,
        });
        Ok(())
    }

    fn user_exists(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.users.contains_key(user_id))
    }
}

impl GeoStore for MemStore {
    fn upsert_point(&self, user_id: &str, lat: f64, lon: f64, timestamp: DateTime<Utc>)
        -> Result<(), StoreError>
    {
        self.locations
            .insert(user_id.to_string(), LocationEntry { lat, lon, last_updated: timestamp });
        Ok(())
    }

    fn query_nearby(&self, user_id: &str, max_distance_km: f64)
        -> Result<Option<Vec<NearbyUser>>, StoreError>
    {
        let base = match self.locations.get(user_id) {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };

        let mut hits: Vec<NearbyUser> = self
            .locations
            .iter()
            .filter(|e| e.key() != user_id)
            .filter_map(|e| {
                let d = haversine_km(base.lat, base.lon, e.lat, e.lon);
                (d <= max_distance_km).then(|| NearbyUser {
                    user_id: e.key().clone(),
                    distance_km: d,
                    lat: e.lat,
                    lon: e.lon,
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        hits.truncate(MAX_NUM_USERS_NEARBY);
        Ok(Some(hits))
    }
}
