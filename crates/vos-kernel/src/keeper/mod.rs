//! Typed access layer over the durable store: object and promise tables,
//! c-lists, queues, the vat registry, meters, GC actions, and crank control.
//!
//! Every persisted field lives under a stable string key so a kernel restart
//! reconstructs exact prior state:
//!
//! ```text
//! ko.nextID / kp.nextID / vat.nextID / meter.nextID   counters
//! ko{N}.owner / ko{N}.refCounts / pin.ko{N}           object table
//! kp{N} / kp{N}.refCount                              promise table
//! v{N}.record / v{N}.c.* / v{N}.r.* / v{N}.vs.*       vat registry, c-lists, vatstore
//! v{N}.t.{seq} / v{N}.tStart / v{N}.tEnd / v{N}.snapshot   transcript span
//! runQueue.* / acceptanceQueue.* / gcActions / reapQueue   queues
//! m{N}                                                meters
//! ```

mod objects;
mod promises;
mod vats;

pub use vats::VatKeeper;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};

use vos_store::{DurableStore, Savepoint};

use crate::error::KernelError;
use crate::gc::{GcAction, GcActionKind, MaybeFreeSet, compare_actions};
use crate::ids::{KObjectId, KPromiseId, KernelSlot, MeterId, VatId, VatSlot};
use crate::records::{Message, MeterRecord, PromiseState, RunQueueItem};

/// Outcome of a meter deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterVerdict {
    Ok { remaining: u64 },
    /// Remaining dropped below the notification threshold.
    BelowThreshold { remaining: u64 },
    /// The budget could not cover the deduction; the crank's guest
    /// computation halts deterministically.
    Exhausted,
}

pub struct KernelKeeper<S: DurableStore> {
    store: S,
    maybe_free: MaybeFreeSet,
    savepoints: Vec<(String, Savepoint)>,
    in_crank: bool,
    /// Vats whose keepers are currently provided to a caller; eviction
    /// bookkeeping for the warehouse's residency accounting.
    active_vat_keepers: BTreeSet<VatId>,
}

impl<S: DurableStore> KernelKeeper<S> {
    pub fn new(store: S) -> Result<Self, KernelError> {
        let mut keeper = Self {
            store,
            maybe_free: MaybeFreeSet::default(),
            savepoints: Vec::new(),
            in_crank: false,
            active_vat_keepers: BTreeSet::new(),
        };
        keeper.ensure_initialized()?;
        Ok(keeper)
    }

    /// Seeds counters and queue cursors on first boot; a restart over an
    /// existing store leaves everything untouched.
    fn ensure_initialized(&mut self) -> Result<(), KernelError> {
        for counter in ["ko.nextID", "kp.nextID", "vat.nextID", "meter.nextID"] {
            if self.store.get(counter)?.is_none() {
                self.set_u64(counter, 1)?;
            }
        }
        for cursor in [
            "runQueue.head",
            "runQueue.tail",
            "acceptanceQueue.head",
            "acceptanceQueue.tail",
        ] {
            if self.store.get(cursor)?.is_none() {
                self.set_u64(cursor, 0)?;
            }
        }
        if self.store.get("gcActions")?.is_none() {
            self.set_cbor("gcActions", &Vec::<GcAction>::new())?;
        }
        if self.store.get("reapQueue")?.is_none() {
            self.set_cbor("reapQueue", &Vec::<VatId>::new())?;
        }
        if self.store.get("vat.dynamicIDs")?.is_none() {
            self.set_cbor("vat.dynamicIDs", &Vec::<VatId>::new())?;
        }
        Ok(())
    }

    // ---- raw store helpers -------------------------------------------------

    pub(crate) fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, KernelError> {
        Ok(self.store.get(key)?)
    }

    pub(crate) fn set_raw(&mut self, key: &str, value: &[u8]) -> Result<(), KernelError> {
        Ok(self.store.set(key, value)?)
    }

    pub(crate) fn delete_raw(&mut self, key: &str) -> Result<(), KernelError> {
        Ok(self.store.delete(key)?)
    }

    pub(crate) fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KernelError> {
        Ok(self.store.keys_with_prefix(prefix)?)
    }

    pub(crate) fn get_u64(&self, key: &str) -> Result<Option<u64>, KernelError> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| KernelError::Corrupt(format!("non-UTF8 value at '{key}'")))?;
                let value = text
                    .parse()
                    .map_err(|_| KernelError::Corrupt(format!("non-numeric value at '{key}'")))?;
                Ok(Some(value))
            }
        }
    }

    pub(crate) fn required_u64(&self, key: &str) -> Result<u64, KernelError> {
        self.get_u64(key)?
            .ok_or_else(|| KernelError::Corrupt(format!("missing counter '{key}'")))
    }

    pub(crate) fn set_u64(&mut self, key: &str, value: u64) -> Result<(), KernelError> {
        Ok(self.store.set(key, value.to_string().as_bytes())?)
    }

    /// Returns the counter's current value and advances it.
    pub(crate) fn bump(&mut self, key: &str) -> Result<u64, KernelError> {
        let value = self.required_u64(key)?;
        self.set_u64(key, value + 1)?;
        Ok(value)
    }

    pub(crate) fn get_cbor<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KernelError> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
        }
    }

    pub(crate) fn set_cbor<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), KernelError> {
        let bytes = serde_cbor::to_vec(value)?;
        Ok(self.store.set(key, &bytes)?)
    }

    // ---- crank control -----------------------------------------------------

    pub fn start_crank(&mut self) -> Result<(), KernelError> {
        self.store.begin_crank()?;
        self.in_crank = true;
        self.savepoints.clear();
        Ok(())
    }

    pub fn establish_crank_savepoint(&mut self, tag: &str) -> Result<(), KernelError> {
        let savepoint = self.store.savepoint()?;
        self.savepoints.push((tag.to_string(), savepoint));
        Ok(())
    }

    /// Rolls back to the most recent savepoint carrying `tag`, discarding
    /// later savepoints. Mutations made before the savepoint survive.
    pub fn rollback_crank(&mut self, tag: &str) -> Result<(), KernelError> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(t, _)| t == tag)
            .ok_or_else(|| KernelError::Corrupt(format!("no crank savepoint tagged '{tag}'")))?;
        let savepoint = self.savepoints[position].1;
        self.store.rollback_to(savepoint)?;
        self.savepoints.truncate(position + 1);
        // Zero-refcount notes taken after the savepoint may describe writes
        // that no longer exist; drop them all rather than risk acting on a
        // rolled-back decrement.
        self.maybe_free.clear();
        Ok(())
    }

    pub fn end_crank(&mut self) -> Result<(), KernelError> {
        self.store.commit_crank()?;
        self.in_crank = false;
        self.savepoints.clear();
        self.maybe_free.clear();
        Ok(())
    }

    pub fn abort_crank(&mut self) -> Result<(), KernelError> {
        self.store.abort_crank()?;
        self.in_crank = false;
        self.savepoints.clear();
        self.maybe_free.clear();
        Ok(())
    }

    pub fn in_crank(&self) -> bool {
        self.in_crank
    }

    // ---- run and acceptance queues ----------------------------------------

    fn queue_push(&mut self, queue: &str, item: &RunQueueItem) -> Result<(), KernelError> {
        let tail = self.required_u64(&format!("{queue}.tail"))?;
        self.set_cbor(&format!("{queue}.{tail}"), item)?;
        self.set_u64(&format!("{queue}.tail"), tail + 1)?;
        // Queued work keeps the slots it mentions alive; a settled promise
        // must survive until its notifies and pipelined sends land, and a
        // target object must survive until its message is routed.
        for slot in queued_slot_refs(item) {
            self.increment_ref_count(slot, "queued")?;
        }
        Ok(())
    }

    fn queue_pop(&mut self, queue: &str) -> Result<Option<RunQueueItem>, KernelError> {
        let head = self.required_u64(&format!("{queue}.head"))?;
        let tail = self.required_u64(&format!("{queue}.tail"))?;
        if head >= tail {
            return Ok(None);
        }
        let key = format!("{queue}.{head}");
        let item: RunQueueItem = self
            .get_cbor(&key)?
            .ok_or_else(|| KernelError::Corrupt(format!("missing queue entry '{key}'")))?;
        self.delete_raw(&key)?;
        self.set_u64(&format!("{queue}.head"), head + 1)?;
        for slot in queued_slot_refs(&item) {
            self.decrement_ref_count(slot, "dequeued")?;
        }
        Ok(Some(item))
    }

    fn queue_peek(&self, queue: &str) -> Result<Option<RunQueueItem>, KernelError> {
        let head = self.required_u64(&format!("{queue}.head"))?;
        let tail = self.required_u64(&format!("{queue}.tail"))?;
        if head >= tail {
            return Ok(None);
        }
        let key = format!("{queue}.{head}");
        self.get_cbor(&key)?
            .ok_or_else(|| KernelError::Corrupt(format!("missing queue entry '{key}'")))
            .map(Some)
    }

    fn queue_length(&self, queue: &str) -> Result<u64, KernelError> {
        let head = self.required_u64(&format!("{queue}.head"))?;
        let tail = self.required_u64(&format!("{queue}.tail"))?;
        Ok(tail - head)
    }

    pub fn add_to_run_queue(&mut self, item: RunQueueItem) -> Result<(), KernelError> {
        self.queue_push("runQueue", &item)
    }

    pub fn next_run_queue_msg(&mut self) -> Result<Option<RunQueueItem>, KernelError> {
        self.queue_pop("runQueue")
    }

    pub fn run_queue_length(&self) -> Result<u64, KernelError> {
        self.queue_length("runQueue")
    }

    pub fn add_to_acceptance_queue(&mut self, item: RunQueueItem) -> Result<(), KernelError> {
        self.queue_push("acceptanceQueue", &item)
    }

    pub fn next_acceptance_queue_msg(&mut self) -> Result<Option<RunQueueItem>, KernelError> {
        self.queue_pop("acceptanceQueue")
    }

    /// Reads the acceptance head without consuming it; refcounts stay put.
    pub fn peek_acceptance_queue_msg(&self) -> Result<Option<RunQueueItem>, KernelError> {
        self.queue_peek("acceptanceQueue")
    }

    pub fn acceptance_queue_length(&self) -> Result<u64, KernelError> {
        self.queue_length("acceptanceQueue")
    }

    // ---- meters ------------------------------------------------------------

    pub fn allocate_meter(&mut self, remaining: u64, threshold: u64) -> Result<MeterId, KernelError> {
        let id = MeterId(self.bump("meter.nextID")?);
        self.set_cbor(&id.to_string(), &MeterRecord { remaining, threshold })?;
        Ok(id)
    }

    pub fn get_meter(&self, id: MeterId) -> Result<MeterRecord, KernelError> {
        self.get_cbor(&id.to_string())?
            .ok_or_else(|| KernelError::UnknownMeter(id.to_string()))
    }

    pub fn check_meter(&self, id: MeterId, amount: u64) -> Result<bool, KernelError> {
        Ok(self.get_meter(id)?.remaining >= amount)
    }

    pub fn deduct_meter(&mut self, id: MeterId, amount: u64) -> Result<MeterVerdict, KernelError> {
        let mut meter = self.get_meter(id)?;
        if meter.remaining < amount {
            meter.remaining = 0;
            self.set_cbor(&id.to_string(), &meter)?;
            return Ok(MeterVerdict::Exhausted);
        }
        let was_above = meter.remaining >= meter.threshold;
        meter.remaining -= amount;
        self.set_cbor(&id.to_string(), &meter)?;
        if was_above && meter.remaining < meter.threshold {
            Ok(MeterVerdict::BelowThreshold {
                remaining: meter.remaining,
            })
        } else {
            Ok(MeterVerdict::Ok {
                remaining: meter.remaining,
            })
        }
    }

    // ---- GC actions --------------------------------------------------------

    pub fn gc_actions(&self) -> Result<Vec<GcAction>, KernelError> {
        Ok(self.get_cbor("gcActions")?.unwrap_or_default())
    }

    fn save_gc_actions(&mut self, actions: &[GcAction]) -> Result<(), KernelError> {
        self.set_cbor("gcActions", &actions.to_vec())
    }

    /// Merges new actions into the persisted set: krefs for the same
    /// (vat, kind) pair collapse into one action, and the whole list keeps
    /// its deterministic order.
    pub fn add_gc_actions(&mut self, new_actions: Vec<GcAction>) -> Result<(), KernelError> {
        let mut actions = self.gc_actions()?;
        for action in new_actions {
            if action.krefs.is_empty() {
                continue;
            }
            match actions
                .iter_mut()
                .find(|a| a.vat == action.vat && a.kind == action.kind)
            {
                Some(existing) => {
                    existing.krefs.extend(action.krefs);
                    existing.krefs.sort();
                    existing.krefs.dedup();
                }
                None => actions.push(action),
            }
        }
        actions.sort_by(compare_actions);
        self.save_gc_actions(&actions)
    }

    /// Pops the highest-priority GC action whose krefs are still live work.
    /// Stale krefs (re-incremented, already retired, owner gone) fall out
    /// here, which is what makes scheduling idempotent instead of
    /// double-deleting.
    pub fn next_gc_action(&mut self) -> Result<Option<GcAction>, KernelError> {
        let mut actions = self.gc_actions()?;
        while !actions.is_empty() {
            let action = actions.remove(0);
            let krefs: Vec<KernelSlot> = action
                .krefs
                .iter()
                .copied()
                .filter(|kref| self.gc_kref_still_actionable(action.vat, action.kind, *kref))
                .collect();
            if !krefs.is_empty() {
                self.save_gc_actions(&actions)?;
                return Ok(Some(GcAction {
                    vat: action.vat,
                    kind: action.kind,
                    krefs,
                }));
            }
        }
        self.save_gc_actions(&actions)?;
        Ok(None)
    }

    fn gc_kref_still_actionable(&self, vat: VatId, kind: GcActionKind, kref: KernelSlot) -> bool {
        let has_clist = matches!(self.vat_has_clist_entry(vat, kref), Ok(true));
        match kind {
            GcActionKind::Sweep => match kref {
                KernelSlot::Object(ko) => match self.get_ref_count(ko) {
                    Ok((reachable, _)) => {
                        reachable == 0
                            && !matches!(self.object_is_pinned(ko), Ok(true))
                            && matches!(self.object_exists(ko), Ok(true))
                    }
                    Err(_) => false,
                },
                KernelSlot::Promise(_) => false,
            },
            GcActionKind::DropExports | GcActionKind::RetireExports | GcActionKind::RetireImports => {
                has_clist
            }
        }
    }

    /// End-of-crank refcount processing. Settled promises still at zero
    /// retire, which may in turn zero the objects their resolution data
    /// named. Objects still at zero, unpinned and owned become exactly one
    /// sweep action addressed to the owner; orphaned objects (owner already
    /// gone) are deleted outright.
    pub fn process_refcounts(&mut self) -> Result<(), KernelError> {
        // Retiring a promise releases its resolution data, which can zero
        // further promises; loop until the cascade settles.
        loop {
            let zeroed = self.maybe_free.drain_promises();
            if zeroed.is_empty() {
                break;
            }
            for kp in zeroed {
                if !self.promise_exists(kp)? {
                    continue;
                }
                if self.promise_ref_count(kp)? != 0 {
                    continue;
                }
                self.retire_promise_if_settled(kp)?;
            }
        }
        let zeroed = self.maybe_free.drain();
        let mut actions: Vec<GcAction> = Vec::new();
        for kref in zeroed {
            if !self.object_exists(kref)? {
                continue;
            }
            let (reachable, _) = self.get_ref_count(kref)?;
            if reachable != 0 || self.object_is_pinned(kref)? {
                continue;
            }
            match self.owner_of(kref)? {
                Some(owner) if self.vat_is_alive(owner)? => {
                    actions.push(GcAction::new(
                        owner,
                        GcActionKind::Sweep,
                        vec![KernelSlot::Object(kref)],
                    ));
                }
                _ => {
                    log::debug!("deleting orphaned {kref} with zero refcount");
                    self.delete_kernel_object(kref)?;
                }
            }
        }
        self.add_gc_actions(actions)
    }

    /// Recomputes every reference count from its sources (importing c-list
    /// entries, queued work items, parked promise-queue messages, settled
    /// resolution data, plus the caller's own `external` holds) and compares
    /// against the stored counters. A mismatch is a consistency fault.
    pub fn audit_ref_counts(&self, external: &[KernelSlot]) -> Result<(), KernelError> {
        let mut expected: BTreeMap<KernelSlot, u64> = BTreeMap::new();

        for vat in self.vat_ids()? {
            let prefix = format!("{vat}.c.");
            for key in self.keys_with_prefix(&prefix)? {
                let bytes = self.get_raw(&key)?.ok_or_else(|| {
                    KernelError::Corrupt(format!("missing c-list entry '{key}'"))
                })?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| KernelError::Corrupt(format!("bad c-list value at '{key}'")))?;
                let vslot: VatSlot = text.parse()?;
                if !vslot.allocated_by_vat {
                    let kslot: KernelSlot = key[prefix.len()..].parse()?;
                    *expected.entry(kslot).or_default() += 1;
                }
            }
        }

        for queue in ["runQueue", "acceptanceQueue"] {
            let head = self.required_u64(&format!("{queue}.head"))?;
            let tail = self.required_u64(&format!("{queue}.tail"))?;
            for index in head..tail {
                let key = format!("{queue}.{index}");
                let item: RunQueueItem = self.get_cbor(&key)?.ok_or_else(|| {
                    KernelError::Corrupt(format!("missing queue entry '{key}'"))
                })?;
                for slot in queued_slot_refs(&item) {
                    *expected.entry(slot).or_default() += 1;
                }
            }
        }

        let next_kp = self.required_u64("kp.nextID")?;
        for id in 1..next_kp {
            let kp = KPromiseId(id);
            if !self.promise_exists(kp)? {
                continue;
            }
            match self.promise_state(kp)? {
                PromiseState::Unresolved { queue, .. } => {
                    for message in &queue {
                        for slot in message_slot_refs(message) {
                            *expected.entry(slot).or_default() += 1;
                        }
                    }
                }
                PromiseState::Fulfilled { data } | PromiseState::Rejected { data } => {
                    for slot in data.slots {
                        *expected.entry(slot).or_default() += 1;
                    }
                }
            }
        }

        for slot in external {
            *expected.entry(*slot).or_default() += 1;
        }

        let next_ko = self.required_u64("ko.nextID")?;
        for id in 1..next_ko {
            let ko = KObjectId(id);
            let slot = KernelSlot::Object(ko);
            if !self.object_exists(ko)? {
                if let Some(count) = expected.remove(&slot) {
                    return Err(KernelError::Corrupt(format!(
                        "{count} dangling references to deleted {ko}"
                    )));
                }
                continue;
            }
            let (reachable, _) = self.get_ref_count(ko)?;
            let wanted = expected.remove(&slot).unwrap_or(0);
            if reachable != wanted {
                return Err(KernelError::Corrupt(format!(
                    "{ko} reachable count is {reachable}, reference sources say {wanted}"
                )));
            }
        }
        for id in 1..next_kp {
            let kp = KPromiseId(id);
            let slot = KernelSlot::Promise(kp);
            if !self.promise_exists(kp)? {
                if let Some(count) = expected.remove(&slot) {
                    return Err(KernelError::Corrupt(format!(
                        "{count} dangling references to retired {kp}"
                    )));
                }
                continue;
            }
            let stored = self.promise_ref_count(kp)?;
            let wanted = expected.remove(&slot).unwrap_or(0);
            if stored != wanted {
                return Err(KernelError::Corrupt(format!(
                    "{kp} refcount is {stored}, reference sources say {wanted}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn note_maybe_free(&mut self, kref: crate::ids::KObjectId) {
        self.maybe_free.note_zero(kref);
    }

    pub(crate) fn cancel_maybe_free(&mut self, kref: &crate::ids::KObjectId) {
        self.maybe_free.cancel(kref);
    }

    pub(crate) fn note_maybe_free_promise(&mut self, kp: crate::ids::KPromiseId) {
        self.maybe_free.note_zero_promise(kp);
    }

    pub(crate) fn cancel_maybe_free_promise(&mut self, kp: &crate::ids::KPromiseId) {
        self.maybe_free.cancel_promise(kp);
    }

    // ---- reap scheduling ---------------------------------------------------

    pub fn schedule_reap(&mut self, vat: VatId) -> Result<(), KernelError> {
        let mut queue: Vec<VatId> = self.get_cbor("reapQueue")?.unwrap_or_default();
        if !queue.contains(&vat) {
            queue.push(vat);
            self.set_cbor("reapQueue", &queue)?;
        }
        Ok(())
    }

    pub fn next_reap_action(&mut self) -> Result<Option<RunQueueItem>, KernelError> {
        let mut queue: Vec<VatId> = self.get_cbor("reapQueue")?.unwrap_or_default();
        if queue.is_empty() {
            return Ok(None);
        }
        let vat = queue.remove(0);
        self.set_cbor("reapQueue", &queue)?;
        Ok(Some(RunQueueItem::BringOutYourDead { vat }))
    }
}

/// Slots a message keeps alive while it sits in a queue: its argument slots
/// plus its result promise.
pub(crate) fn message_slot_refs(message: &Message) -> Vec<KernelSlot> {
    let mut refs = message.args.slots.clone();
    refs.extend(message.result.map(KernelSlot::Promise));
    refs
}

fn queued_slot_refs(item: &RunQueueItem) -> Vec<KernelSlot> {
    match item {
        RunQueueItem::Send { target, message } => {
            let mut refs = message_slot_refs(message);
            refs.push(*target);
            refs
        }
        RunQueueItem::Notify { promise, .. } => vec![KernelSlot::Promise(*promise)],
        RunQueueItem::Gc { .. } | RunQueueItem::BringOutYourDead { .. } => Vec::new(),
    }
}
