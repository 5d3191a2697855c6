//! Vat registry and the per-vat keeper: c-list translation, transcript
//! spans, vatstore, incarnations, and terminated-vat cleanup.

use vos_store::DurableStore;

use super::KernelKeeper;
use crate::error::KernelError;
use crate::ids::{KernelSlot, VatId, VatSlot, VatSlotKind};
use crate::records::{
    PromiseState, SnapshotRecord, TranscriptEntry, VatOptions, VatRecord,
};

fn record_key(vat: VatId) -> String {
    format!("{vat}.record")
}

fn clist_key(vat: VatId, kslot: KernelSlot) -> String {
    format!("{vat}.c.{kslot}")
}

fn reverse_key(vat: VatId, vslot: VatSlot) -> String {
    format!("{vat}.r.{vslot}")
}

impl<S: DurableStore> KernelKeeper<S> {
    /// Registers a new vat. The identity is permanent; worker incarnations
    /// come and go underneath it.
    pub fn allocate_vat_id(
        &mut self,
        name: Option<&str>,
        dynamic: bool,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        let vat = VatId(self.bump("vat.nextID")?);
        let record = VatRecord {
            name: name.map(str::to_string),
            options,
            is_alive: true,
            incarnation: 0,
            is_dynamic: dynamic,
        };
        self.set_cbor(&record_key(vat), &record)?;
        if let Some(name) = name {
            self.set_raw(&format!("vat.name.{name}"), vat.to_string().as_bytes())?;
        }
        if dynamic {
            let mut ids: Vec<VatId> = self.get_cbor("vat.dynamicIDs")?.unwrap_or_default();
            ids.push(vat);
            self.set_cbor("vat.dynamicIDs", &ids)?;
        }
        self.set_u64(&format!("{vat}.o.nextID"), 1)?;
        self.set_u64(&format!("{vat}.p.nextID"), 1)?;
        self.set_u64(&format!("{vat}.tStart"), 0)?;
        self.set_u64(&format!("{vat}.tEnd"), 0)?;
        log::info!("registered {vat} ({})", name.unwrap_or("anonymous"));
        Ok(vat)
    }

    pub fn vat_record(&self, vat: VatId) -> Result<VatRecord, KernelError> {
        self.get_cbor(&record_key(vat))?
            .ok_or(KernelError::UnknownVat(vat))
    }

    pub fn set_vat_record(&mut self, vat: VatId, record: &VatRecord) -> Result<(), KernelError> {
        self.set_cbor(&record_key(vat), record)
    }

    pub fn vat_is_alive(&self, vat: VatId) -> Result<bool, KernelError> {
        match self.get_cbor::<VatRecord>(&record_key(vat))? {
            Some(record) => Ok(record.is_alive),
            None => Ok(false),
        }
    }

    pub fn vat_id_by_name(&self, name: &str) -> Result<Option<VatId>, KernelError> {
        match self.get_raw(&format!("vat.name.{name}"))? {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| KernelError::Corrupt(format!("bad vat name index for '{name}'")))?;
                Ok(Some(text.parse()?))
            }
        }
    }

    pub fn dynamic_vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        Ok(self.get_cbor("vat.dynamicIDs")?.unwrap_or_default())
    }

    /// Every vat identity ever registered, dead ones included.
    pub fn vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        let next = self.get_u64("vat.nextID")?.unwrap_or(1);
        Ok((1..next).map(VatId).collect())
    }

    /// Bumps the vat's incarnation for an upgrade; the fresh worker replays
    /// from the last snapshot (or starts clean) under the same identity.
    pub fn bump_incarnation(&mut self, vat: VatId) -> Result<u32, KernelError> {
        let mut record = self.vat_record(vat)?;
        record.incarnation += 1;
        self.set_cbor(&record_key(vat), &record)?;
        Ok(record.incarnation)
    }

    pub fn set_vat_fault(&mut self, vat: VatId, detail: &str) -> Result<(), KernelError> {
        self.set_raw(&format!("{vat}.lastFault"), detail.as_bytes())
    }

    pub fn vat_fault(&self, vat: VatId) -> Result<Option<String>, KernelError> {
        match self.get_raw(&format!("{vat}.lastFault"))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        }
    }

    /// Decrements the vat's reap countdown; when it hits zero the countdown
    /// resets and the caller schedules a forced GC sweep.
    pub fn countdown_reap(&mut self, vat: VatId, interval: u64) -> Result<bool, KernelError> {
        let key = format!("{vat}.reapCountdown");
        let remaining = self.get_u64(&key)?.unwrap_or(interval);
        if remaining <= 1 {
            self.set_u64(&key, interval)?;
            Ok(true)
        } else {
            self.set_u64(&key, remaining - 1)?;
            Ok(false)
        }
    }

    /// Hands out the borrowing accessor for one vat's tables.
    pub fn provide_vat_keeper(&mut self, vat: VatId) -> Result<VatKeeper<'_, S>, KernelError> {
        if !self.vat_is_alive(vat)? {
            return Err(KernelError::VatNotAlive(vat));
        }
        self.active_vat_keepers.insert(vat);
        Ok(VatKeeper { keeper: self, vat })
    }

    /// Drops residency bookkeeping for a vat whose worker is being evicted.
    pub fn evict_vat_keeper(&mut self, vat: VatId) {
        self.active_vat_keepers.remove(&vat);
    }

    pub fn active_vat_keepers(&self) -> impl Iterator<Item = VatId> + '_ {
        self.active_vat_keepers.iter().copied()
    }

    pub(crate) fn vat_has_clist_entry(
        &self,
        vat: VatId,
        kslot: KernelSlot,
    ) -> Result<bool, KernelError> {
        Ok(self.get_raw(&clist_key(vat, kslot))?.is_some())
    }

    /// Tears down everything a terminated vat left behind: exports are
    /// orphaned, imports released, decided promises rejected, and every
    /// per-vat key deleted. Surviving importers keep the orphans alive
    /// until their own references drop.
    pub fn cleanup_after_terminated_vat(&mut self, vat: VatId) -> Result<(), KernelError> {
        let mut record = self.vat_record(vat)?;
        record.is_alive = false;
        self.set_cbor(&record_key(vat), &record)?;

        for key in self.keys_with_prefix(&format!("{vat}.c."))? {
            let kref_text = key
                .rsplit('.')
                .next()
                .ok_or_else(|| KernelError::Corrupt(format!("bad c-list key '{key}'")))?;
            let kslot: KernelSlot = kref_text.parse()?;
            let vslot: VatSlot = match self.get_raw(&key)? {
                Some(bytes) => String::from_utf8(bytes)
                    .map_err(|_| KernelError::Corrupt(format!("bad c-list value at '{key}'")))?
                    .parse()?,
                None => continue,
            };
            let is_import = !vslot.allocated_by_vat;
            match kslot {
                KernelSlot::Object(ko) => {
                    if is_import {
                        self.decrement_ref_count(kslot, "terminated-vat")?;
                    } else if self.object_exists(ko)? {
                        self.orphan_kernel_object(ko)?;
                        let (reachable, _) = self.get_ref_count(ko)?;
                        if reachable == 0 {
                            self.note_maybe_free(ko);
                        }
                    }
                }
                KernelSlot::Promise(kp) => {
                    if self.promise_exists(kp)? {
                        if let PromiseState::Unresolved { decider, .. } = self.promise_state(kp)? {
                            if decider == Some(vat) {
                                self.resolve_promise(
                                    None,
                                    kp,
                                    true,
                                    crate::records::CapData::new(
                                        b"\"vat terminated\"".to_vec(),
                                        vec![],
                                    ),
                                )?;
                            }
                        }
                        if is_import && self.promise_exists(kp)? {
                            self.decrement_ref_count(kslot, "terminated-vat")?;
                        }
                    }
                }
            }
        }

        for key in self.keys_with_prefix(&format!("{vat}."))? {
            self.delete_raw(&key)?;
        }
        if record.is_dynamic {
            let ids: Vec<VatId> = self
                .dynamic_vat_ids()?
                .into_iter()
                .filter(|id| *id != vat)
                .collect();
            self.set_cbor("vat.dynamicIDs", &ids)?;
        }
        if let Some(name) = &record.name {
            self.delete_raw(&format!("vat.name.{name}"))?;
        }
        // Keep the (dead) record so the identity is never reused.
        self.set_cbor(&record_key(vat), &record)?;
        self.evict_vat_keeper(vat);
        log::info!("cleaned up terminated {vat}");
        Ok(())
    }
}

/// Borrowing accessor for one vat's c-list, transcript and vatstore.
pub struct VatKeeper<'a, S: DurableStore> {
    keeper: &'a mut KernelKeeper<S>,
    vat: VatId,
}

impl<'a, S: DurableStore> std::fmt::Debug for VatKeeper<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VatKeeper")
            .field("vat", &self.vat)
            .finish_non_exhaustive()
    }
}

impl<'a, S: DurableStore> VatKeeper<'a, S> {
    pub fn vat(&self) -> VatId {
        self.vat
    }

    /// Translates kernel→vat, importing (allocating an `o-N`/`p-N` slot and
    /// counting the reference) on first sight.
    pub fn map_kernel_to_vat(&mut self, kslot: KernelSlot) -> Result<VatSlot, KernelError> {
        let key = clist_key(self.vat, kslot);
        if let Some(bytes) = self.keeper.get_raw(&key)? {
            let text = String::from_utf8(bytes)
                .map_err(|_| KernelError::Corrupt(format!("bad c-list value at '{key}'")))?;
            return Ok(text.parse()?);
        }
        let kind = match kslot {
            KernelSlot::Object(_) => VatSlotKind::Object,
            KernelSlot::Promise(_) => VatSlotKind::Promise,
        };
        let counter = match kind {
            VatSlotKind::Object => format!("{}.o.nextID", self.vat),
            VatSlotKind::Promise => format!("{}.p.nextID", self.vat),
        };
        let index = self.keeper.bump(&counter)?;
        let vslot = VatSlot::import(kind, index);
        self.keeper.set_raw(&key, vslot.to_string().as_bytes())?;
        self.keeper
            .set_raw(&reverse_key(self.vat, vslot), kslot.to_string().as_bytes())?;
        self.keeper.increment_ref_count(kslot, "clist-import")?;
        Ok(vslot)
    }

    /// Translates vat→kernel. A `+` slot unseen before is a fresh export:
    /// the kernel allocates the object (owned by this vat) or promise
    /// (decided by this vat). A `-` slot must already exist in the c-list.
    pub fn map_vat_to_kernel(&mut self, vslot: VatSlot) -> Result<KernelSlot, KernelError> {
        let key = reverse_key(self.vat, vslot);
        if let Some(bytes) = self.keeper.get_raw(&key)? {
            let text = String::from_utf8(bytes)
                .map_err(|_| KernelError::Corrupt(format!("bad c-list value at '{key}'")))?;
            return Ok(text.parse()?);
        }
        if !vslot.allocated_by_vat {
            return Err(KernelError::ClistMissing {
                vat: self.vat,
                slot: vslot.to_string(),
            });
        }
        let kslot: KernelSlot = match vslot.kind {
            VatSlotKind::Object => self.keeper.add_kernel_object(self.vat)?.into(),
            VatSlotKind::Promise => self.keeper.add_kernel_promise(Some(self.vat))?.into(),
        };
        self.keeper
            .set_raw(&clist_key(self.vat, kslot), vslot.to_string().as_bytes())?;
        self.keeper.set_raw(&key, kslot.to_string().as_bytes())?;
        Ok(kslot)
    }

    pub fn has_clist_entry(&self, kslot: KernelSlot) -> Result<bool, KernelError> {
        self.keeper.vat_has_clist_entry(self.vat, kslot)
    }

    /// Removes the mapping in both directions. Dropping an import releases
    /// its reference; dropping an export does not (exports never counted).
    pub fn delete_clist_entry(&mut self, kslot: KernelSlot) -> Result<(), KernelError> {
        let key = clist_key(self.vat, kslot);
        let Some(bytes) = self.keeper.get_raw(&key)? else {
            return Ok(());
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| KernelError::Corrupt(format!("bad c-list value at '{key}'")))?;
        let vslot: VatSlot = text.parse()?;
        self.keeper.delete_raw(&key)?;
        self.keeper.delete_raw(&reverse_key(self.vat, vslot))?;
        if !vslot.allocated_by_vat {
            self.keeper.decrement_ref_count(kslot, "clist-drop")?;
        }
        Ok(())
    }

    // ---- transcript span ---------------------------------------------------

    /// Appends one entry and returns its position.
    pub fn append_transcript(&mut self, entry: &TranscriptEntry) -> Result<u64, KernelError> {
        let position = self.keeper.required_u64(&format!("{}.tEnd", self.vat))?;
        self.keeper
            .set_cbor(&format!("{}.t.{position}", self.vat), entry)?;
        self.keeper
            .set_u64(&format!("{}.tEnd", self.vat), position + 1)?;
        Ok(position)
    }

    /// The current span: every entry after the last snapshot.
    pub fn transcript_span(&self) -> Result<Vec<TranscriptEntry>, KernelError> {
        let start = self.keeper.required_u64(&format!("{}.tStart", self.vat))?;
        let end = self.keeper.required_u64(&format!("{}.tEnd", self.vat))?;
        let mut entries = Vec::with_capacity((end - start) as usize);
        for position in start..end {
            let key = format!("{}.t.{position}", self.vat);
            let entry = self
                .keeper
                .get_cbor(&key)?
                .ok_or_else(|| KernelError::Corrupt(format!("missing transcript entry '{key}'")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn transcript_end_position(&self) -> Result<u64, KernelError> {
        self.keeper.required_u64(&format!("{}.tEnd", self.vat))
    }

    /// Records a completed snapshot and truncates the span it covers.
    pub fn save_snapshot_record(&mut self, record: &SnapshotRecord) -> Result<(), KernelError> {
        let start = self.keeper.required_u64(&format!("{}.tStart", self.vat))?;
        for position in start..record.up_to_position {
            self.keeper.delete_raw(&format!("{}.t.{position}", self.vat))?;
        }
        self.keeper
            .set_u64(&format!("{}.tStart", self.vat), record.up_to_position)?;
        self.keeper
            .set_cbor(&format!("{}.snapshot", self.vat), record)?;
        Ok(())
    }

    pub fn snapshot_record(&self) -> Result<Option<SnapshotRecord>, KernelError> {
        self.keeper.get_cbor(&format!("{}.snapshot", self.vat))
    }

    // ---- vatstore ----------------------------------------------------------

    pub fn vatstore_get(&self, key: &str) -> Result<Option<Vec<u8>>, KernelError> {
        self.keeper.get_raw(&format!("{}.vs.{key}", self.vat))
    }

    pub fn vatstore_set(&mut self, key: &str, value: &[u8]) -> Result<(), KernelError> {
        self.keeper.set_raw(&format!("{}.vs.{key}", self.vat), value)
    }

    pub fn vatstore_delete(&mut self, key: &str) -> Result<(), KernelError> {
        self.keeper.delete_raw(&format!("{}.vs.{key}", self.vat))
    }
}
