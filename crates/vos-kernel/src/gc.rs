//! Garbage-collection actions and their scheduling rules.
//!
//! Refcount bookkeeping lives in the keeper; this module defines the action
//! records, their deterministic priority order, and the per-crank
//! "maybe free" set whose contents become actions only if the count is
//! still zero when the crank settles.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{KObjectId, KPromiseId, KernelSlot, VatId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GcActionKind {
    DropExports,
    RetireExports,
    RetireImports,
    Sweep,
}

impl GcActionKind {
    /// Lower ranks run first. Drops must precede retires so a vat never sees
    /// a retire for an export it still believes is reachable.
    pub fn rank(&self) -> u8 {
        match self {
            GcActionKind::DropExports => 0,
            GcActionKind::RetireExports => 1,
            GcActionKind::RetireImports => 2,
            GcActionKind::Sweep => 3,
        }
    }
}

/// One scheduled GC delivery: tell `vat` about these krefs. Sweep actions
/// only ever carry objects; retire actions may carry resolved promises so
/// vats learn the promise is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcAction {
    pub vat: VatId,
    pub kind: GcActionKind,
    pub krefs: Vec<KernelSlot>,
}

impl GcAction {
    pub fn new(vat: VatId, kind: GcActionKind, mut krefs: Vec<KernelSlot>) -> Self {
        krefs.sort();
        krefs.dedup();
        Self { vat, kind, krefs }
    }
}

/// Deterministic total order over pending actions: kind rank first, then vat
/// id, so every replay picks the same next action.
pub fn compare_actions(a: &GcAction, b: &GcAction) -> std::cmp::Ordering {
    a.kind
        .rank()
        .cmp(&b.kind.rank())
        .then(a.vat.cmp(&b.vat))
        .then(a.krefs.cmp(&b.krefs))
}

/// Krefs whose reference count hit zero during the current crank. The set is
/// ephemeral: a re-increment before the crank settles removes the kref, which
/// is what makes delete scheduling idempotent rather than double-firing.
/// Objects become sweep actions; settled promises retire outright.
#[derive(Debug, Default)]
pub struct MaybeFreeSet {
    objects: BTreeSet<KObjectId>,
    promises: BTreeSet<KPromiseId>,
}

impl MaybeFreeSet {
    pub fn note_zero(&mut self, kref: KObjectId) {
        self.objects.insert(kref);
    }

    pub fn cancel(&mut self, kref: &KObjectId) {
        self.objects.remove(kref);
    }

    pub fn drain(&mut self) -> Vec<KObjectId> {
        std::mem::take(&mut self.objects).into_iter().collect()
    }

    pub fn note_zero_promise(&mut self, kp: KPromiseId) {
        self.promises.insert(kp);
    }

    pub fn cancel_promise(&mut self, kp: &KPromiseId) {
        self.promises.remove(kp);
    }

    pub fn drain_promises(&mut self) -> Vec<KPromiseId> {
        std::mem::take(&mut self.promises).into_iter().collect()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.promises.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.promises.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(n: u64) -> KernelSlot {
        KernelSlot::Object(KObjectId(n))
    }

    #[test]
    fn action_order_is_kind_then_vat() {
        let sweep_v1 = GcAction::new(VatId(1), GcActionKind::Sweep, vec![obj(9)]);
        let drop_v2 = GcAction::new(VatId(2), GcActionKind::DropExports, vec![obj(1)]);
        let drop_v1 = GcAction::new(VatId(1), GcActionKind::DropExports, vec![obj(1)]);
        let mut actions = vec![sweep_v1.clone(), drop_v2.clone(), drop_v1.clone()];
        actions.sort_by(compare_actions);
        assert_eq!(actions, vec![drop_v1, drop_v2, sweep_v1]);
    }

    #[test]
    fn maybe_free_cancellation_wins() {
        let mut set = MaybeFreeSet::default();
        set.note_zero(KObjectId(4));
        set.note_zero(KObjectId(5));
        set.cancel(&KObjectId(4));
        assert_eq!(set.drain(), vec![KObjectId(5)]);
        assert!(set.is_empty());
    }

    #[test]
    fn action_krefs_are_sorted_and_deduped() {
        let action = GcAction::new(
            VatId(1),
            GcActionKind::Sweep,
            vec![obj(3), obj(1), obj(3)],
        );
        assert_eq!(action.krefs, vec![obj(1), obj(3)]);
    }
}
