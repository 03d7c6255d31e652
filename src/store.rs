//! The catalog store: single owner of the list of cars.
//!
//! The collection is materialized on first use from the remote mirror (when
//! enabled), then local storage, then the bundled defaults. Every mutation
//! rewrites the whole collection locally, announces `CatalogChanged`, and
//! then makes a best-effort push to the mirror.

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use log::*;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{Storage, StorageError};
use crate::events::{Event, EventBus};
use crate::model::storage::{self, StoredPayload};
use crate::model::{RawRecord, VehicleRecord};
use crate::normalize::{self, ShapeError};
use crate::remote::{self, RemoteMirror, SyncError};

pub const STORAGE_KEY: &str = "mbk_cars";
/// Keys used by earlier releases, deleted whenever a store is opened.
pub const LEGACY_STORAGE_KEYS: [&str; 3] = ["mbk_cars_v1", "cars", "cars_cache"];

const BUNDLED_DEFAULTS: &str = include_str!("../data/cars.json");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to load default cars from {origin}: {reason}")]
    Defaults { origin: String, reason: String },
    #[error("failed to encode cars: {0}")]
    Encode(String),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Remote(#[from] SyncError),
}

/// Seed collection, also the target of a reset.
#[derive(Debug, Clone)]
pub enum DefaultDataset {
    Bundled,
    File(PathBuf),
}

impl DefaultDataset {
    /// Reads the dataset fresh on every call.
    pub fn load(&self) -> Result<Vec<RawRecord>, CatalogError> {
        let (origin, payload) = match self {
            DefaultDataset::Bundled => ("bundled dataset".to_owned(), BUNDLED_DEFAULTS.to_owned()),
            DefaultDataset::File(path) => {
                let payload =
                    std::fs::read_to_string(path).map_err(|e| CatalogError::Defaults {
                        origin: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                (path.display().to_string(), payload)
            }
        };
        normalize::parse_collection_str(&payload).map_err(|e| CatalogError::Defaults {
            origin,
            reason: e.to_string(),
        })
    }
}

pub struct CatalogStore {
    storage: Arc<dyn Storage>,
    defaults: DefaultDataset,
    remote: Option<RemoteMirror>,
    events: EventBus,
    cache: Option<Vec<VehicleRecord>>,
}

fn matches_identifier(car: &VehicleRecord, identifier: &str) -> bool {
    car.slug == identifier || car.id == identifier
}

fn find_match(cars: &[VehicleRecord], needle: &str) -> Option<VehicleRecord> {
    cars.iter()
        .find(|car| matches_identifier(car, needle))
        .or_else(|| {
            // Links created before slugs were stored point at the title slug
            cars.iter().find(|car| {
                let source = if !car.title.is_empty() {
                    car.title.clone()
                } else {
                    normalize::text_value(car.extra.get("name")).unwrap_or_else(|| car.id.clone())
                };
                normalize::slugify(&source) == needle
            })
        })
        .cloned()
}

fn decode_identifier(identifier: &str) -> String {
    let decoded = match percent_decode_str(identifier).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => identifier.to_owned(),
    };
    decoded.trim().to_owned()
}

impl CatalogStore {
    pub fn new(storage: Arc<dyn Storage>, defaults: DefaultDataset, events: EventBus) -> Self {
        for key in LEGACY_STORAGE_KEYS.iter() {
            if let Err(e) = storage.remove(key) {
                warn!("Failed to delete legacy entry {}: {}", key, e);
            }
        }
        CatalogStore {
            storage,
            defaults,
            remote: None,
            events,
            cache: None,
        }
    }

    pub fn with_remote(mut self, remote: RemoteMirror) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn remote(&self) -> Option<&RemoteMirror> {
        self.remote.as_ref()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    fn enabled_remote(&self) -> Option<&RemoteMirror> {
        self.remote.as_ref().filter(|r| r.is_enabled())
    }

    /// The current collection. Never fails: remote, local and default
    /// sources are tried in turn, and an empty list is the last resort.
    pub fn get_all(&mut self) -> Vec<VehicleRecord> {
        if let Some(cars) = &self.cache {
            return cars.clone();
        }
        let cars = self.materialize();
        self.cache = Some(cars.clone());
        cars
    }

    fn materialize(&self) -> Vec<VehicleRecord> {
        if let Some(remote) = self.enabled_remote() {
            match remote.fetch_collection() {
                Ok(snapshot) => {
                    let cars = normalize::normalize_collection(snapshot.cars);
                    if let Err(e) = self.write_local(&cars) {
                        warn!("Failed to store pulled cars locally: {}", e);
                    }
                    return cars;
                }
                Err(e) => {
                    warn!("Remote pull failed, using local data: {}", e);
                    self.events.publish(Event::CatalogRemoteSyncError(e));
                }
            }
        }

        if let Some(cars) = self.load_local() {
            return cars;
        }

        match self.defaults.load() {
            Ok(raw) => {
                let cars = normalize::normalize_collection(raw);
                if let Err(e) = self.write_local(&cars) {
                    warn!("Failed to store default cars: {}", e);
                }
                cars
            }
            Err(e) => {
                error!("{}", e);
                Vec::new()
            }
        }
    }

    fn load_local(&self) -> Option<Vec<VehicleRecord>> {
        let payload = match self.storage.get(STORAGE_KEY) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read stored cars: {}", e);
                return None;
            }
        };
        let (raw, legacy) = match StoredPayload::decode(&payload) {
            Ok(StoredPayload::Current(raw)) => (raw, false),
            Ok(StoredPayload::Legacy(raw)) => (raw, true),
            Ok(StoredPayload::Unrecognized(version)) => {
                info!("Ignoring stored cars with schema version {:?}", version);
                return None;
            }
            Err(e) => {
                warn!("Ignoring unreadable stored cars: {}", e);
                return None;
            }
        };
        let original: Vec<Value> = raw.iter().cloned().map(Value::Object).collect();
        let cars = normalize::normalize_collection(raw);
        if legacy || normalize::to_values(&cars) != original {
            debug!("Rewriting stored cars in normalized form");
            if let Err(e) = self.write_local(&cars) {
                warn!("Failed to rewrite stored cars: {}", e);
            }
        }
        Some(cars)
    }

    fn write_local(&self, cars: &[VehicleRecord]) -> Result<(), CatalogError> {
        let payload = storage::encode(cars).map_err(|e| CatalogError::Encode(e.to_string()))?;
        self.storage.set(STORAGE_KEY, &payload)?;
        Ok(())
    }

    /// Persists, caches and announces an already-normalized collection,
    /// then optionally pushes it to the mirror.
    fn commit(&mut self, cars: Vec<VehicleRecord>, push: bool) -> Result<Vec<VehicleRecord>, CatalogError> {
        self.write_local(&cars)?;
        self.cache = Some(cars.clone());
        self.events.publish(Event::CatalogChanged);
        if push {
            self.push_best_effort(&cars);
        }
        Ok(cars)
    }

    /// The local save has already happened; a failed push is only reported.
    fn push_best_effort(&self, cars: &[VehicleRecord]) {
        if let Some(remote) = self.enabled_remote() {
            if let Err(e) = remote.push_collection(cars) {
                error!("Saved locally but failed to push to remote: {}", e);
                self.events.publish(Event::CatalogRemoteSyncError(e));
            }
        }
    }

    /// Looks a car up by slug or id, then by the slug its title would give.
    /// Falls back to the default dataset before giving up.
    pub fn get_by_slug_or_id(&mut self, identifier: &str) -> Option<VehicleRecord> {
        let needle = decode_identifier(identifier);
        if needle.is_empty() {
            return None;
        }
        if let Some(found) = find_match(&self.get_all(), &needle) {
            return Some(found);
        }
        match self.defaults.load() {
            Ok(raw) => {
                let found = find_match(&normalize::normalize_collection(raw), &needle);
                if found.is_some() {
                    info!("{} is missing locally, found it in the default cars", needle);
                }
                found
            }
            Err(e) => {
                warn!("Could not search default cars: {}", e);
                None
            }
        }
    }

    /// Creates or updates a car. Fields present in `patch` overwrite the
    /// stored ones, absent fields are kept.
    pub fn upsert(&mut self, mut patch: RawRecord) -> Result<VehicleRecord, CatalogError> {
        self.get_all();
        let mut cars: Vec<RawRecord> = self
            .cache
            .iter()
            .flatten()
            .map(VehicleRecord::to_raw)
            .collect();

        let slug = normalize::explicit_slug(patch.get("slug")).unwrap_or_else(|| {
            let source = normalize::text_value(patch.get("title"))
                .or_else(|| normalize::text_value(patch.get("name")))
                .unwrap_or_else(normalize::timestamp_slug);
            normalize::slugify(&source)
        });
        // Stored slugs are folded, so match and store the folded form
        patch.insert("slug".to_owned(), Value::String(slug.clone()));
        let id = normalize::text_value(patch.get("id"));

        let index = cars.iter().position(|car| {
            normalize::text_value(car.get("slug")).as_deref() == Some(slug.as_str())
                || (id.is_some() && normalize::text_value(car.get("id")) == id)
        });
        let target = match index {
            Some(i) => {
                cars[i].extend(patch);
                i
            }
            None => {
                if id.is_none() {
                    patch.insert("id".to_owned(), Value::String(Uuid::new_v4().to_string()));
                }
                cars.push(patch);
                cars.len() - 1
            }
        };

        let mut saved = self.commit(normalize::normalize_collection(cars), true)?;
        let car = saved.swap_remove(target);
        info!("Saved {} ({})", car.title, car.slug);
        Ok(car)
    }

    /// Deletes every car whose slug or id equals `identifier`. Returns
    /// whether anything was removed.
    pub fn remove(&mut self, identifier: &str) -> Result<bool, CatalogError> {
        let cars = self.get_all();
        let before = cars.len();
        let kept: Vec<VehicleRecord> = cars
            .into_iter()
            .filter(|car| !matches_identifier(car, identifier))
            .collect();
        if kept.len() == before {
            debug!("Nothing matches {}, catalog left as is", identifier);
            return Ok(false);
        }
        self.commit(normalize::renormalize(&kept), true)?;
        info!("Removed {}", identifier);
        Ok(true)
    }

    /// Bulk import: the incoming records become the collection.
    pub fn replace_all(&mut self, records: Vec<RawRecord>) -> Result<Vec<VehicleRecord>, CatalogError> {
        self.commit(normalize::normalize_collection(records), true)
    }

    /// Parses an import file's contents and replaces the collection with it.
    pub fn import_json(&mut self, payload: &str) -> Result<Vec<VehicleRecord>, CatalogError> {
        let records = normalize::parse_collection_str(payload)?;
        self.replace_all(records)
    }

    pub fn reset_to_defaults(&mut self) -> Result<Vec<VehicleRecord>, CatalogError> {
        let raw = self.defaults.load()?;
        self.commit(normalize::normalize_collection(raw), false)
    }

    /// Drops the cached collection and pulls from the mirror. Unlike the
    /// background pull in `get_all`, a failure here is returned.
    pub fn force_remote_refresh(&mut self) -> Result<Vec<VehicleRecord>, CatalogError> {
        let remote = match self.enabled_remote() {
            Some(remote) => remote,
            None => {
                self.cache = None;
                return Ok(self.get_all());
            }
        };
        let snapshot = remote.fetch_collection()?;
        let cars = normalize::normalize_collection(snapshot.cars);
        self.commit(cars, false)
    }

    /// The collection as pretty JSON, the same bytes the mirror commits.
    pub fn export_json(&mut self) -> Result<String, CatalogError> {
        Ok(remote::serialize_cars(&self.get_all())?)
    }
}
