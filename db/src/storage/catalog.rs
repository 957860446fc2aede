use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    models::{Identity, is_valid_virtual_code, random_virtual_code},
    storage::{StoreError, lock, read_document, write_document},
};

#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    profiles: Vec<Identity>,
}

/// The persisted list of synthetic identities, in catalog order.
///
/// Every mutating call is a read-modify-persist section under one lock. When
/// the write fails the in-memory list is restored to what it was before the
/// call, so memory and disk never diverge because of a failed save.
#[derive(Debug)]
pub struct IdentityCatalog {
    path: PathBuf,
    profiles: Mutex<Vec<Identity>>,
}

impl IdentityCatalog {
    /// Open the catalog at `path`. A missing file yields an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let catalog = Self {
            path: path.into(),
            profiles: Mutex::new(Vec::new()),
        };
        catalog.load()?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the backing file, replacing the in-memory list.
    ///
    /// Records without an id, and later records repeating an id already seen,
    /// get the next free id in file order. The numbered list is written back.
    pub fn load(&self) -> Result<Vec<Identity>, StoreError> {
        let doc: CatalogDocument = read_document(&self.path)?;
        let mut profiles = doc.profiles;

        for identity in profiles.iter() {
            if !is_valid_virtual_code(&identity.virtual_code) {
                warn!(
                    identity_id = identity.id,
                    virtual_code = %identity.virtual_code,
                    "identity has a malformed virtual code"
                );
            }
        }

        let assigned = assign_missing_ids(&mut profiles);
        if assigned > 0 {
            info!(path = %self.path.display(), assigned, "numbered identities without a usable id");
            // Numbering is deterministic, so a failed write only repeats it
            // on the next load.
            if let Err(error) = self.persist(&profiles) {
                warn!(%error, "could not save numbered identity catalog");
            }
        }

        debug!(path = %self.path.display(), count = profiles.len(), "loaded identity catalog");
        *lock(&self.profiles) = profiles.clone();
        Ok(profiles)
    }

    /// Write the current in-memory list to disk.
    pub fn save(&self) -> Result<(), StoreError> {
        let profiles = lock(&self.profiles);
        self.persist(&profiles)
    }

    pub fn list(&self) -> Vec<Identity> {
        lock(&self.profiles).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.profiles).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.profiles).is_empty()
    }

    pub fn get(&self, id: u32) -> Option<Identity> {
        lock(&self.profiles).iter().find(|p| p.id == id).cloned()
    }

    /// Append `identity`, assigning the next free id when its id is `0`.
    /// Returns the stored record.
    pub fn add(&self, identity: Identity) -> Result<Identity, StoreError> {
        self.mutate(|profiles| {
            let stored = insert(profiles, identity)?;
            Ok(stored)
        })
    }

    /// Generate `count` fresh identities and append them in one write.
    pub fn generate(&self, count: usize) -> Result<Vec<Identity>, StoreError> {
        let generated = self.mutate(|profiles| {
            (0..count)
                .map(|_| insert(profiles, Identity::generate()))
                .collect::<Result<Vec<_>, _>>()
        })?;

        info!(count = generated.len(), "generated identities");
        Ok(generated)
    }

    /// Replace the record with the given id. The stored id always stays `id`.
    /// Returns `false` when no such record exists.
    pub fn update(&self, id: u32, mut identity: Identity) -> Result<bool, StoreError> {
        identity.id = id;
        self.mutate(|profiles| {
            let Some(slot) = profiles.iter_mut().find(|p| p.id == id) else {
                return Ok(false);
            };
            *slot = identity;
            Ok(true)
        })
    }

    /// Record the machine code produced by a successful activation.
    pub fn set_machine_code(&self, id: u32, machine_code: &str) -> Result<bool, StoreError> {
        self.mutate(|profiles| {
            let Some(slot) = profiles.iter_mut().find(|p| p.id == id) else {
                return Ok(false);
            };
            slot.machine_code = Some(machine_code.to_string());
            Ok(true)
        })
    }

    /// Returns `false` when no such record exists.
    pub fn remove(&self, id: u32) -> Result<bool, StoreError> {
        self.mutate(|profiles| {
            let before = profiles.len();
            profiles.retain(|p| p.id != id);
            Ok(profiles.len() != before)
        })
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        self.mutate(|profiles| {
            let removed = profiles.len();
            profiles.clear();
            Ok(removed)
        })
    }

    /// Give every identity a new virtual code. This is the only operation
    /// that rewrites a virtual code in place.
    pub fn regenerate_virtual_codes(&self) -> Result<usize, StoreError> {
        self.mutate(|profiles| {
            for profile in profiles.iter_mut() {
                profile.virtual_code = random_virtual_code();
            }
            Ok(profiles.len())
        })
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<Identity>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut profiles = lock(&self.profiles);
        let mut candidate = profiles.clone();
        let out = f(&mut candidate)?;

        self.persist(&candidate)?;
        *profiles = candidate;
        Ok(out)
    }

    fn persist(&self, profiles: &[Identity]) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            profiles: &'a [Identity],
        }

        write_document(&self.path, &Borrowed { profiles })
    }
}

fn insert(profiles: &mut Vec<Identity>, mut identity: Identity) -> Result<Identity, StoreError> {
    if identity.id == 0 {
        identity.id = profiles.iter().map(|p| p.id).max().unwrap_or(0) + 1;
    } else if profiles.iter().any(|p| p.id == identity.id) {
        return Err(StoreError::DuplicateId(identity.id));
    }

    profiles.push(identity.clone());
    Ok(identity)
}

/// Give every id-less or repeated record the next id above the current
/// maximum. Returns how many records were renumbered.
fn assign_missing_ids(profiles: &mut [Identity]) -> usize {
    let mut next = profiles.iter().map(|p| p.id).max().unwrap_or(0) + 1;
    let mut seen = HashSet::new();
    let mut assigned = 0;

    for profile in profiles.iter_mut() {
        if profile.id != 0 && seen.insert(profile.id) {
            continue;
        }
        if profile.id != 0 {
            warn!(identity_id = profile.id, new_id = next, "duplicate identity id renumbered");
        }

        profile.id = next;
        seen.insert(next);
        next += 1;
        assigned += 1;
    }

    assigned
}
