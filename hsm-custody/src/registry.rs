//! Label to slot resolution and token provisioning.
//!
//! The device is the source of truth. [`SlotRegistry`] keeps a label cache over
//! it, confirms every cached entry against the token before using it, and
//! falls back to a full scan when an entry is missing or stale.

use crate::config::Credentials;
use crate::device::{Device, SlotId, UserType};
use crate::error::{CustodyError, Step};
use crate::session::{LoginTable, Session};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// Maximum length of a token label, in bytes.
pub const MAX_LABEL_LEN: usize = 32;

/// Checks that `label` can be stored as a token label and matched back.
pub fn validate_label(label: &str) -> Result<(), CustodyError> {
    let reason = if label.is_empty() {
        "label is empty"
    } else if label.len() > MAX_LABEL_LEN {
        "label is longer than 32 bytes"
    } else if label.trim() != label {
        "label has leading or trailing whitespace"
    } else {
        return Ok(());
    };
    Err(CustodyError::InvalidLabel {
        label: label.to_string(),
        reason,
    })
}

/// An initialized token and its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotLabel {
    /// The slot id.
    pub slot: SlotId,
    /// The token label.
    pub label: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves labels to slots and provisions new tokens.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    cache: RwLock<HashMap<String, SlotId>>,
    provisioning: Mutex<HashSet<String>>,
    provisioned: Condvar,
    allocation: Mutex<()>,
}

impl SlotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the cache from a full scan of the device. Labels carried by
    /// several slots are left out, so resolving them reports the conflict.
    pub fn refresh<D: Device + ?Sized>(&self, device: &D) -> Result<(), CustodyError> {
        let mut slots_by_label: HashMap<String, Vec<SlotId>> = HashMap::new();
        for SlotLabel { slot, label } in self.labels(device)? {
            slots_by_label.entry(label).or_default().push(slot);
        }
        let mut cache = HashMap::with_capacity(slots_by_label.len());
        for (label, slots) in slots_by_label {
            match slots.as_slice() {
                [slot] => {
                    cache.insert(label, *slot);
                }
                _ => warn!(%label, ?slots, "label carried by several slots"),
            }
        }
        debug!(labels = cache.len(), "slot cache rebuilt");
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = cache;
        Ok(())
    }

    /// Lists every initialized token with its label.
    pub fn labels<D: Device + ?Sized>(
        &self,
        device: &D,
    ) -> Result<Vec<SlotLabel>, CustodyError> {
        let slots = device
            .slots()
            .map_err(|source| CustodyError::device(Step::ListSlots, None, source))?;
        let mut labels = Vec::with_capacity(slots.len());
        for slot in slots {
            let info = device
                .token_info(slot)
                .map_err(|source| CustodyError::device(Step::TokenInfo, Some(slot), source))?;
            if info.initialized {
                labels.push(SlotLabel {
                    slot,
                    label: info.label,
                });
            }
        }
        Ok(labels)
    }

    fn cached(&self, label: &str) -> Option<SlotId> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .copied()
    }

    fn remember(&self, label: &str, slot: Option<SlotId>) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match slot {
            Some(slot) => cache.insert(label.to_string(), slot),
            None => cache.remove(label),
        };
    }

    /// Finds the slot whose token carries `label`.
    pub fn resolve<D: Device + ?Sized>(
        &self,
        device: &D,
        label: &str,
    ) -> Result<SlotId, CustodyError> {
        validate_label(label)?;
        if let Some(slot) = self.cached(label) {
            match device.token_info(slot) {
                Ok(info) if info.initialized && info.label == label => return Ok(slot),
                Ok(_) => debug!(slot, label, "stale cache entry"),
                Err(err) => debug!(slot, label, error = %err, "cached slot unreadable"),
            }
            self.remember(label, None);
        }

        let slots: Vec<SlotId> = self
            .labels(device)?
            .into_iter()
            .filter(|entry| entry.label == label)
            .map(|entry| entry.slot)
            .collect();
        match slots.as_slice() {
            [] => Err(CustodyError::SlotNotFound {
                label: label.to_string(),
            }),
            [slot] => {
                self.remember(label, Some(*slot));
                Ok(*slot)
            }
            _ => {
                error!(label, ?slots, "label carried by several slots");
                Err(CustodyError::DuplicateSlotLabel {
                    label: label.to_string(),
                    slots,
                })
            }
        }
    }

    /// Initializes a free token under `label` and sets its user PIN.
    ///
    /// The check for an existing token and the provisioning run under a
    /// per-label lock. A free token is the first present one that reports
    /// itself uninitialized. If the user PIN cannot be set, the token stays
    /// initialized and the error is [`CustodyError::ProvisioningIncomplete`].
    pub fn create_slot<D: Device + ?Sized>(
        &self,
        device: &D,
        logins: &LoginTable,
        credentials: &Credentials,
        label: &str,
    ) -> Result<SlotId, CustodyError> {
        validate_label(label)?;
        let _label_guard = self.lock_label(label);

        match self.resolve(device, label) {
            Ok(_) => {
                return Err(CustodyError::DuplicateLabel {
                    label: label.to_string(),
                })
            }
            Err(CustodyError::SlotNotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        let slot = {
            let _allocation = lock(&self.allocation);
            let slot = free_slot(device)?;
            device
                .init_token(slot, &credentials.so_pin, label)
                .map_err(|source| CustodyError::device(Step::InitToken, Some(slot), source))?;
            slot
        };
        info!(slot, label, "token initialized");

        if let Err(err) = init_user_pin(device, logins, slot, credentials) {
            error!(slot, label, error = %err, "user PIN not set, token left partially provisioned");
            return Err(CustodyError::ProvisioningIncomplete {
                slot,
                label: label.to_string(),
                source: Box::new(err),
            });
        }
        self.remember(label, Some(slot));
        Ok(slot)
    }

    fn lock_label(&self, label: &str) -> LabelGuard<'_> {
        let mut provisioning = lock(&self.provisioning);
        while provisioning.contains(label) {
            provisioning = self
                .provisioned
                .wait(provisioning)
                .unwrap_or_else(PoisonError::into_inner);
        }
        provisioning.insert(label.to_string());
        LabelGuard {
            registry: self,
            label: label.to_string(),
        }
    }
}

struct LabelGuard<'a> {
    registry: &'a SlotRegistry,
    label: String,
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        lock(&self.registry.provisioning).remove(&self.label);
        self.registry.provisioned.notify_all();
    }
}

fn free_slot<D: Device + ?Sized>(device: &D) -> Result<SlotId, CustodyError> {
    let slots = device
        .slots()
        .map_err(|source| CustodyError::device(Step::ListSlots, None, source))?;
    for slot in slots {
        let info = device
            .token_info(slot)
            .map_err(|source| CustodyError::device(Step::TokenInfo, Some(slot), source))?;
        if !info.initialized {
            return Ok(slot);
        }
    }
    Err(CustodyError::NoFreeSlot)
}

fn init_user_pin<D: Device + ?Sized>(
    device: &D,
    logins: &LoginTable,
    slot: SlotId,
    credentials: &Credentials,
) -> Result<(), CustodyError> {
    let session = Session::open(
        device,
        logins,
        slot,
        UserType::SecurityOfficer,
        &credentials.so_pin,
    )?;
    device
        .init_pin(session.handle(), &credentials.operator_pin())
        .map_err(|source| session.error(Step::InitPin, source))?;
    if let Err(err) = session.close() {
        warn!(slot, error = %err, "security officer session teardown incomplete");
    }
    Ok(())
}
