//! Isolate bookkeeping — which credentials may reach which slots

use crate::error::{TokenError, TokenResult};
use crate::tpm::SlotId;
use std::collections::{BTreeSet, HashMap};

pub const ISOLATE_CREDENTIAL_LEN: usize = 16;

/// Opaque credential naming an isolate
pub type IsolateCredential = [u8; ISOLATE_CREDENTIAL_LEN];

/// Credential of the isolate every process starts with
pub const DEFAULT_ISOLATE: IsolateCredential = [0u8; ISOLATE_CREDENTIAL_LEN];

/// Short printable form for logs; never the whole credential
pub fn short_id(credential: &IsolateCredential) -> String {
    hex::encode(&credential[..4])
}

#[derive(Debug, Default)]
struct Isolate {
    ref_count: usize,
    slots: BTreeSet<SlotId>,
}

/// Credential → (reference count, accessible slots)
#[derive(Debug)]
pub(super) struct IsolateTable {
    isolates: HashMap<IsolateCredential, Isolate>,
}

impl IsolateTable {
    /// Table holding only the default isolate, which is never removed
    pub fn new() -> Self {
        let mut isolates = HashMap::new();
        isolates.insert(
            DEFAULT_ISOLATE,
            Isolate {
                ref_count: 1,
                slots: BTreeSet::new(),
            },
        );
        Self { isolates }
    }

    /// Reference a known isolate, or mint a new one. Returns the credential
    /// in use and whether it was created.
    pub fn open(&mut self, credential: &IsolateCredential) -> TokenResult<(IsolateCredential, bool)> {
        if let Some(isolate) = self.isolates.get_mut(credential) {
            isolate.ref_count += 1;
            return Ok((*credential, false));
        }

        let minted: IsolateCredential = rand::random();
        if minted == DEFAULT_ISOLATE || self.isolates.contains_key(&minted) {
            return Err(TokenError::GeneralError("Isolate credential collision".into()));
        }
        self.isolates.insert(
            minted,
            Isolate {
                ref_count: 1,
                slots: BTreeSet::new(),
            },
        );
        Ok((minted, true))
    }

    /// Drop one reference. Returns the slots of the isolate if this removed it.
    pub fn close(&mut self, credential: &IsolateCredential) -> Option<BTreeSet<SlotId>> {
        let isolate = self.isolates.get_mut(credential)?;
        isolate.ref_count = isolate.ref_count.saturating_sub(1);
        if isolate.ref_count > 0 || *credential == DEFAULT_ISOLATE {
            return None;
        }
        self.isolates.remove(credential).map(|isolate| isolate.slots)
    }

    pub fn contains(&self, credential: &IsolateCredential) -> bool {
        self.isolates.contains_key(credential)
    }

    pub fn can_access(&self, credential: &IsolateCredential, slot: SlotId) -> bool {
        self.isolates
            .get(credential)
            .is_some_and(|isolate| isolate.slots.contains(&slot))
    }

    pub fn check_access(&self, credential: &IsolateCredential, slot: SlotId) -> TokenResult<()> {
        if self.can_access(credential, slot) {
            Ok(())
        } else {
            Err(TokenError::SlotIdInvalid)
        }
    }

    pub fn grant(&mut self, credential: &IsolateCredential, slot: SlotId) {
        if let Some(isolate) = self.isolates.get_mut(credential) {
            isolate.slots.insert(slot);
        }
    }

    pub fn revoke(&mut self, credential: &IsolateCredential, slot: SlotId) -> bool {
        self.isolates
            .get_mut(credential)
            .is_some_and(|isolate| isolate.slots.remove(&slot))
    }

    /// Remove `slot` from every isolate
    pub fn revoke_all(&mut self, slot: SlotId) {
        for isolate in self.isolates.values_mut() {
            isolate.slots.remove(&slot);
        }
    }

    /// Whether an isolate other than `credential` can reach `slot`
    pub fn is_slot_referenced_by_other(&self, slot: SlotId, credential: &IsolateCredential) -> bool {
        self.isolates
            .iter()
            .any(|(other, isolate)| other != credential && isolate.slots.contains(&slot))
    }

    /// Whether any isolate can still reach `slot`
    pub fn is_slot_referenced(&self, slot: SlotId) -> bool {
        self.isolates.values().any(|isolate| isolate.slots.contains(&slot))
    }

    pub fn slots(&self, credential: &IsolateCredential) -> Vec<SlotId> {
        self.isolates
            .get(credential)
            .map(|isolate| isolate.slots.iter().copied().collect())
            .unwrap_or_default()
    }
}
