//! Kernel object table: ownership, refcounts, pins.
//!
//! Refcounts are a `reachable,recognizable` pair per object. References come
//! from importing c-list entries, queued and parked messages, promise
//! resolution data, and external holds; decrementing to zero records the
//! kref in the crank's maybe-free set for end-of-crank GC action scheduling.

use vos_store::DurableStore;

use super::KernelKeeper;
use crate::error::KernelError;
use crate::ids::{KObjectId, KPromiseId, KernelSlot, VatId};

fn owner_key(ko: KObjectId) -> String {
    format!("{ko}.owner")
}

fn refcount_key(ko: KObjectId) -> String {
    format!("{ko}.refCounts")
}

fn pin_key(ko: KObjectId) -> String {
    format!("pin.{ko}")
}

impl<S: DurableStore> KernelKeeper<S> {
    /// Registers a fresh kernel object exported by `owner`. The refcount
    /// starts at zero; importers add to it through c-list translation.
    pub fn add_kernel_object(&mut self, owner: VatId) -> Result<KObjectId, KernelError> {
        let ko = KObjectId(self.bump("ko.nextID")?);
        self.set_raw(&owner_key(ko), owner.to_string().as_bytes())?;
        self.set_raw(&refcount_key(ko), b"0,0")?;
        Ok(ko)
    }

    pub fn object_exists(&self, ko: KObjectId) -> Result<bool, KernelError> {
        Ok(self.get_raw(&refcount_key(ko))?.is_some())
    }

    /// The exporting vat, or `None` once the object has been orphaned.
    pub fn owner_of(&self, ko: KObjectId) -> Result<Option<VatId>, KernelError> {
        match self.get_raw(&owner_key(ko))? {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| KernelError::Corrupt(format!("bad owner value for {ko}")))?;
                Ok(Some(text.parse()?))
            }
        }
    }

    /// Detaches the object from its (terminated) exporter while importers
    /// still hold references.
    pub fn orphan_kernel_object(&mut self, ko: KObjectId) -> Result<(), KernelError> {
        self.delete_raw(&owner_key(ko))
    }

    pub fn delete_kernel_object(&mut self, ko: KObjectId) -> Result<(), KernelError> {
        self.delete_raw(&owner_key(ko))?;
        self.delete_raw(&refcount_key(ko))?;
        self.delete_raw(&pin_key(ko))?;
        Ok(())
    }

    /// Pins keep an object alive regardless of refcount, for krefs held by
    /// the embedding application rather than by any vat.
    pub fn pin_object(&mut self, ko: KObjectId) -> Result<(), KernelError> {
        self.set_raw(&pin_key(ko), b"1")
    }

    pub fn unpin_object(&mut self, ko: KObjectId) -> Result<(), KernelError> {
        self.delete_raw(&pin_key(ko))?;
        let (reachable, _) = self.get_ref_count(ko)?;
        if reachable == 0 {
            self.note_maybe_free(ko);
        }
        Ok(())
    }

    pub fn object_is_pinned(&self, ko: KObjectId) -> Result<bool, KernelError> {
        Ok(self.get_raw(&pin_key(ko))?.is_some())
    }

    pub fn get_ref_count(&self, ko: KObjectId) -> Result<(u64, u64), KernelError> {
        let bytes = self
            .get_raw(&refcount_key(ko))?
            .ok_or(KernelError::UnknownObject(ko))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| KernelError::Corrupt(format!("bad refcount value for {ko}")))?;
        let (reachable, recognizable) = text
            .split_once(',')
            .ok_or_else(|| KernelError::Corrupt(format!("bad refcount value for {ko}")))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| KernelError::Corrupt(format!("bad refcount value for {ko}")))
        };
        Ok((parse(reachable)?, parse(recognizable)?))
    }

    fn set_ref_count(&mut self, ko: KObjectId, counts: (u64, u64)) -> Result<(), KernelError> {
        self.set_raw(
            &refcount_key(ko),
            format!("{},{}", counts.0, counts.1).as_bytes(),
        )
    }

    pub(crate) fn promise_ref_count(&self, kp: KPromiseId) -> Result<u64, KernelError> {
        self.get_u64(&format!("{kp}.refCount"))?
            .ok_or(KernelError::UnknownPromise(kp))
    }

    /// Adds one reference to `slot`. An object re-incremented inside the
    /// same crank leaves the maybe-free set, cancelling any pending delete.
    pub fn increment_ref_count(&mut self, slot: KernelSlot, tag: &str) -> Result<(), KernelError> {
        match slot {
            KernelSlot::Object(ko) => {
                let (reachable, recognizable) = self.get_ref_count(ko)?;
                self.set_ref_count(ko, (reachable + 1, recognizable + 1))?;
                self.cancel_maybe_free(&ko);
                log::trace!("incref {ko} -> {} ({tag})", reachable + 1);
            }
            KernelSlot::Promise(kp) => {
                let count = self.promise_ref_count(kp)?;
                self.set_u64(&format!("{kp}.refCount"), count + 1)?;
                self.cancel_maybe_free_promise(&kp);
                log::trace!("incref {kp} -> {} ({tag})", count + 1);
            }
        }
        Ok(())
    }

    /// Drops one reference. Returns true when an object's reachable count
    /// hit zero (the caller's cue that end-of-crank processing may schedule
    /// a sweep). Underflow is a consistency fault.
    pub fn decrement_ref_count(&mut self, slot: KernelSlot, tag: &str) -> Result<bool, KernelError> {
        match slot {
            KernelSlot::Object(ko) => {
                let (reachable, recognizable) = self.get_ref_count(ko)?;
                if reachable == 0 || recognizable == 0 {
                    return Err(KernelError::RefCountUnderflow {
                        kref: ko.to_string(),
                        detail: format!("counts {reachable},{recognizable} ({tag})"),
                    });
                }
                self.set_ref_count(ko, (reachable - 1, recognizable - 1))?;
                log::trace!("decref {ko} -> {} ({tag})", reachable - 1);
                if reachable == 1 {
                    self.note_maybe_free(ko);
                    return Ok(true);
                }
                Ok(false)
            }
            KernelSlot::Promise(kp) => {
                let count = self.promise_ref_count(kp)?;
                if count == 0 {
                    return Err(KernelError::RefCountUnderflow {
                        kref: kp.to_string(),
                        detail: format!("count 0 ({tag})"),
                    });
                }
                self.set_u64(&format!("{kp}.refCount"), count - 1)?;
                log::trace!("decref {kp} -> {} ({tag})", count - 1);
                // Retirement waits for end-of-crank processing; queue churn
                // routinely bounces a count through zero mid-crank.
                if count == 1 {
                    self.note_maybe_free_promise(kp);
                }
                Ok(count == 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcActionKind;
    use crate::keeper::KernelKeeper;
    use crate::records::VatOptions;
    use vos_store::MemStore;

    fn keeper_with_vat() -> (KernelKeeper<MemStore>, VatId) {
        let mut k = KernelKeeper::new(MemStore::new()).unwrap();
        let vat = k
            .allocate_vat_id(Some("owner"), false, VatOptions::default())
            .unwrap();
        (k, vat)
    }

    #[test]
    fn fresh_objects_start_unreferenced() {
        let (mut k, vat) = keeper_with_vat();
        let ko = k.add_kernel_object(vat).unwrap();
        assert!(k.object_exists(ko).unwrap());
        assert_eq!(k.owner_of(ko).unwrap(), Some(vat));
        assert_eq!(k.get_ref_count(ko).unwrap(), (0, 0));
    }

    #[test]
    fn refcounts_move_in_pairs() {
        let (mut k, vat) = keeper_with_vat();
        let ko = k.add_kernel_object(vat).unwrap();
        k.increment_ref_count(ko.into(), "t").unwrap();
        k.increment_ref_count(ko.into(), "t").unwrap();
        assert_eq!(k.get_ref_count(ko).unwrap(), (2, 2));
        assert!(!k.decrement_ref_count(ko.into(), "t").unwrap());
        assert!(k.decrement_ref_count(ko.into(), "t").unwrap());
        assert_eq!(k.get_ref_count(ko).unwrap(), (0, 0));
    }

    #[test]
    fn underflow_is_fatal() {
        let (mut k, vat) = keeper_with_vat();
        let ko = k.add_kernel_object(vat).unwrap();
        let err = k.decrement_ref_count(ko.into(), "t").unwrap_err();
        assert!(matches!(err, KernelError::RefCountUnderflow { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn reincrement_cancels_pending_free() {
        let (mut k, vat) = keeper_with_vat();
        let ko = k.add_kernel_object(vat).unwrap();
        k.increment_ref_count(ko.into(), "t").unwrap();
        k.decrement_ref_count(ko.into(), "t").unwrap();
        // Re-imported within the same crank: no sweep may be scheduled.
        k.increment_ref_count(ko.into(), "t").unwrap();
        k.process_refcounts().unwrap();
        assert!(k.gc_actions().unwrap().is_empty());
        assert!(k.object_exists(ko).unwrap());
    }

    #[test]
    fn pinned_objects_survive_zero_refcounts() {
        let (mut k, vat) = keeper_with_vat();
        let ko = k.add_kernel_object(vat).unwrap();
        k.pin_object(ko).unwrap();
        k.increment_ref_count(ko.into(), "t").unwrap();
        k.decrement_ref_count(ko.into(), "t").unwrap();
        k.process_refcounts().unwrap();
        assert!(k.gc_actions().unwrap().is_empty());

        // Unpinning at zero makes it collectable again.
        k.unpin_object(ko).unwrap();
        k.process_refcounts().unwrap();
        let actions = k.gc_actions().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, GcActionKind::Sweep);
    }

    #[test]
    fn deleting_a_settled_promise_at_zero_references() {
        let (mut k, vat) = keeper_with_vat();
        let kp = k.add_kernel_promise(Some(vat)).unwrap();
        k.increment_ref_count(kp.into(), "t").unwrap();
        k.resolve_promise(Some(vat), kp, false, crate::records::CapData::new(b"42".to_vec(), vec![]))
            .unwrap();
        assert!(k.promise_exists(kp).unwrap());
        k.decrement_ref_count(kp.into(), "t").unwrap();
        // Retirement is deferred to end-of-crank processing.
        assert!(k.promise_exists(kp).unwrap());
        k.process_refcounts().unwrap();
        assert!(!k.promise_exists(kp).unwrap());
    }
}
