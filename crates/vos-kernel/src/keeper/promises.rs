//! Kernel promise table and the resolution pipeline: decider checks,
//! subscriber notification, retirement scheduling, and requeueing of
//! messages that were sent before resolution.

use vos_store::DurableStore;

use super::KernelKeeper;
use crate::error::KernelError;
use crate::gc::{GcAction, GcActionKind};
use crate::ids::{KPromiseId, KernelSlot, VatId};
use crate::records::{CapData, Message, PromiseState, RunQueueItem};

impl<S: DurableStore> KernelKeeper<S> {
    pub fn add_kernel_promise(&mut self, decider: Option<VatId>) -> Result<KPromiseId, KernelError> {
        let kp = KPromiseId(self.bump("kp.nextID")?);
        self.set_cbor(&kp.to_string(), &PromiseState::new_unresolved(decider))?;
        self.set_u64(&format!("{kp}.refCount"), 0)?;
        Ok(kp)
    }

    pub fn promise_state(&self, kp: KPromiseId) -> Result<PromiseState, KernelError> {
        self.get_cbor(&kp.to_string())?
            .ok_or(KernelError::UnknownPromise(kp))
    }

    pub fn promise_exists(&self, kp: KPromiseId) -> Result<bool, KernelError> {
        Ok(self.get_raw(&kp.to_string())?.is_some())
    }

    fn save_promise(&mut self, kp: KPromiseId, state: &PromiseState) -> Result<(), KernelError> {
        self.set_cbor(&kp.to_string(), state)
    }

    pub fn set_decider(&mut self, kp: KPromiseId, vat: VatId) -> Result<(), KernelError> {
        match self.promise_state(kp)? {
            PromiseState::Unresolved {
                subscribers, queue, ..
            } => self.save_promise(
                kp,
                &PromiseState::Unresolved {
                    decider: Some(vat),
                    subscribers,
                    queue,
                },
            ),
            _ => Err(KernelError::AlreadyResolved(kp)),
        }
    }

    pub fn clear_decider(&mut self, kp: KPromiseId) -> Result<(), KernelError> {
        match self.promise_state(kp)? {
            PromiseState::Unresolved {
                subscribers, queue, ..
            } => self.save_promise(
                kp,
                &PromiseState::Unresolved {
                    decider: None,
                    subscribers,
                    queue,
                },
            ),
            _ => Err(KernelError::AlreadyResolved(kp)),
        }
    }

    /// Registers `vat` for resolution notification. Subscribing to an
    /// already-settled promise notifies immediately; the exactly-once
    /// guarantee holds because settled promises carry no subscriber list.
    pub fn subscribe(&mut self, vat: VatId, kp: KPromiseId) -> Result<(), KernelError> {
        match self.promise_state(kp)? {
            PromiseState::Unresolved {
                decider,
                mut subscribers,
                queue,
            } => {
                if !subscribers.contains(&vat) {
                    subscribers.push(vat);
                    subscribers.sort();
                }
                self.save_promise(
                    kp,
                    &PromiseState::Unresolved {
                        decider,
                        subscribers,
                        queue,
                    },
                )
            }
            _ => self.add_to_run_queue(RunQueueItem::Notify { vat, promise: kp }),
        }
    }

    /// Appends a message to an unresolved promise's queue; it will be moved
    /// to the run queue, in order, when the promise resolves. Parked messages
    /// hold references on the promises they mention, same as queued ones.
    pub fn add_message_to_promise_queue(
        &mut self,
        kp: KPromiseId,
        message: Message,
    ) -> Result<(), KernelError> {
        match self.promise_state(kp)? {
            PromiseState::Unresolved {
                decider,
                subscribers,
                mut queue,
            } => {
                for parked in super::message_slot_refs(&message) {
                    self.increment_ref_count(parked, "parked")?;
                }
                queue.push(message);
                self.save_promise(
                    kp,
                    &PromiseState::Unresolved {
                        decider,
                        subscribers,
                        queue,
                    },
                )
            }
            _ => Err(KernelError::AlreadyResolved(kp)),
        }
    }

    /// Puts one message back on the run queue addressed to `target`.
    pub fn requeue_message(
        &mut self,
        target: KernelSlot,
        message: Message,
    ) -> Result<(), KernelError> {
        self.add_to_run_queue(RunQueueItem::Send { target, message })
    }

    /// Follows chains of settled slot-ref promises to the terminal target.
    /// Stops at objects, unresolved promises, and promises settled to plain
    /// data or rejection.
    pub fn resolution_target(&self, slot: KernelSlot) -> Result<KernelSlot, KernelError> {
        let mut current = slot;
        loop {
            let KernelSlot::Promise(kp) = current else {
                return Ok(current);
            };
            match self.promise_state(kp)? {
                PromiseState::Fulfilled { data } => match data.as_slot_ref() {
                    Some(next) => current = next,
                    None => return Ok(current),
                },
                _ => return Ok(current),
            }
        }
    }

    /// Resolves a promise on behalf of `caller` (decider-checked) or the
    /// kernel itself (`caller == None`). Subscribers are notified exactly
    /// once; queued messages move to the run queue in their original order.
    pub fn resolve_promise(
        &mut self,
        caller: Option<VatId>,
        kp: KPromiseId,
        rejected: bool,
        data: CapData,
    ) -> Result<(), KernelError> {
        let PromiseState::Unresolved {
            decider,
            subscribers,
            queue,
        } = self.promise_state(kp)?
        else {
            return Err(KernelError::AlreadyResolved(kp));
        };
        if let Some(vat) = caller {
            if decider != Some(vat) {
                return Err(KernelError::NotDecider { vat, promise: kp });
            }
        }

        let state = if rejected {
            PromiseState::Rejected { data: data.clone() }
        } else {
            PromiseState::Fulfilled { data: data.clone() }
        };
        self.save_promise(kp, &state)?;
        // The stored resolution holds its slots until the promise retires.
        for slot in &data.slots {
            self.increment_ref_count(*slot, "resolution-data")?;
        }
        log::debug!(
            "{kp} {} with {} queued message(s), {} subscriber(s)",
            if rejected { "rejected" } else { "fulfilled" },
            queue.len(),
            subscribers.len()
        );

        for subscriber in &subscribers {
            self.add_to_run_queue(RunQueueItem::Notify {
                vat: *subscriber,
                promise: kp,
            })?;
        }

        // Far vats learn the promise is gone once their notify has landed;
        // retire actions run at GC priority, strictly after the notifies.
        let mut retires = Vec::new();
        if let Some(decider_vat) = decider {
            retires.push(GcAction::new(
                decider_vat,
                GcActionKind::RetireExports,
                vec![KernelSlot::Promise(kp)],
            ));
        }
        for subscriber in &subscribers {
            retires.push(GcAction::new(
                *subscriber,
                GcActionKind::RetireImports,
                vec![KernelSlot::Promise(kp)],
            ));
        }
        self.add_gc_actions(retires)?;

        for message in queue {
            let parked = super::message_slot_refs(&message);
            self.requeue_after_resolution(kp, rejected, &data, message)?;
            // Requeueing took its own references; release the parked ones.
            for slot in parked {
                self.decrement_ref_count(slot, "unparked")?;
            }
        }
        Ok(())
    }

    fn requeue_after_resolution(
        &mut self,
        kp: KPromiseId,
        rejected: bool,
        data: &CapData,
        message: Message,
    ) -> Result<(), KernelError> {
        if rejected {
            // Messages to a rejected promise have their results rejected
            // with the same data.
            if let Some(result) = message.result {
                self.resolve_promise(None, result, true, data.clone())?;
            }
            return Ok(());
        }
        match data.as_slot_ref() {
            Some(slot) => {
                let target = self.resolution_target(slot)?;
                self.requeue_message(target, message)
            }
            None => {
                log::debug!("dropping message '{}' queued on {kp}: resolution is plain data", message.method);
                if let Some(result) = message.result {
                    self.resolve_promise(
                        None,
                        result,
                        true,
                        CapData::new(b"\"cannot deliver to non-capability resolution\"".to_vec(), vec![]),
                    )?;
                }
                Ok(())
            }
        }
    }

    /// Deletes a settled promise nobody references anymore, releasing the
    /// references its resolution data holds.
    pub(crate) fn retire_promise_if_settled(&mut self, kp: KPromiseId) -> Result<(), KernelError> {
        let data = match self.promise_state(kp)? {
            PromiseState::Fulfilled { data } | PromiseState::Rejected { data } => data,
            PromiseState::Unresolved { .. } => return Ok(()),
        };
        log::trace!("retiring settled {kp}");
        self.delete_raw(&kp.to_string())?;
        self.delete_raw(&format!("{kp}.refCount"))?;
        for slot in data.slots {
            self.decrement_ref_count(slot, "retired-resolution")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::VatOptions;
    use vos_store::MemStore;

    fn keeper() -> KernelKeeper<MemStore> {
        KernelKeeper::new(MemStore::new()).unwrap()
    }

    fn vat(k: &mut KernelKeeper<MemStore>, name: &str) -> VatId {
        k.allocate_vat_id(Some(name), false, VatOptions::default())
            .unwrap()
    }

    fn msg(method: &str, result: Option<KPromiseId>) -> Message {
        Message {
            method: method.to_string(),
            args: CapData::new(b"[]".to_vec(), vec![]),
            result,
        }
    }

    #[test]
    fn only_the_decider_may_resolve() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let other = vat(&mut k, "other");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();

        let err = k
            .resolve_promise(Some(other), kp, false, CapData::new(b"1".to_vec(), vec![]))
            .unwrap_err();
        assert!(matches!(err, KernelError::NotDecider { .. }));

        k.resolve_promise(Some(decider), kp, false, CapData::new(b"1".to_vec(), vec![]))
            .unwrap();
        let err = k
            .resolve_promise(Some(decider), kp, false, CapData::new(b"2".to_vec(), vec![]))
            .unwrap_err();
        assert!(matches!(err, KernelError::AlreadyResolved(_)));
    }

    #[test]
    fn subscribers_get_one_notify_each() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let s1 = vat(&mut k, "s1");
        let s2 = vat(&mut k, "s2");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();
        k.subscribe(s1, kp).unwrap();
        k.subscribe(s2, kp).unwrap();
        k.subscribe(s1, kp).unwrap(); // duplicate, ignored

        k.resolve_promise(Some(decider), kp, false, CapData::new(b"1".to_vec(), vec![]))
            .unwrap();

        assert_eq!(
            k.next_run_queue_msg().unwrap(),
            Some(RunQueueItem::Notify { vat: s1, promise: kp })
        );
        assert_eq!(
            k.next_run_queue_msg().unwrap(),
            Some(RunQueueItem::Notify { vat: s2, promise: kp })
        );
        assert_eq!(k.next_run_queue_msg().unwrap(), None);
    }

    #[test]
    fn late_subscription_notifies_immediately() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let late = vat(&mut k, "late");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();
        k.resolve_promise(Some(decider), kp, true, CapData::new(b"\"boom\"".to_vec(), vec![]))
            .unwrap();

        k.subscribe(late, kp).unwrap();
        assert_eq!(
            k.next_run_queue_msg().unwrap(),
            Some(RunQueueItem::Notify { vat: late, promise: kp })
        );
    }

    #[test]
    fn resolution_schedules_promise_retirement() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let sub = vat(&mut k, "sub");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();
        k.subscribe(sub, kp).unwrap();
        k.resolve_promise(Some(decider), kp, false, CapData::new(b"1".to_vec(), vec![]))
            .unwrap();

        let actions = k.gc_actions().unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, GcActionKind::RetireExports);
        assert_eq!(actions[0].vat, decider);
        assert_eq!(actions[1].kind, GcActionKind::RetireImports);
        assert_eq!(actions[1].vat, sub);
    }

    #[test]
    fn queued_messages_forward_to_slot_ref_resolution() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let owner = vat(&mut k, "owner");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();
        let ko = k.add_kernel_object(owner).unwrap();
        k.add_message_to_promise_queue(kp, msg("poke", None)).unwrap();

        k.resolve_promise(Some(decider), kp, false, CapData::slot_ref(ko.into()))
            .unwrap();

        assert_eq!(
            k.next_run_queue_msg().unwrap(),
            Some(RunQueueItem::Send {
                target: ko.into(),
                message: msg("poke", None),
            })
        );
    }

    #[test]
    fn queued_messages_reject_on_rejection() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();
        let result = k.add_kernel_promise(None).unwrap();
        k.add_message_to_promise_queue(kp, msg("poke", Some(result)))
            .unwrap();

        let reason = CapData::new(b"\"boom\"".to_vec(), vec![]);
        k.resolve_promise(Some(decider), kp, true, reason.clone())
            .unwrap();

        assert_eq!(
            k.promise_state(result).unwrap(),
            PromiseState::Rejected { data: reason }
        );
    }

    #[test]
    fn queued_messages_reject_on_plain_data_resolution() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let kp = k.add_kernel_promise(Some(decider)).unwrap();
        let result = k.add_kernel_promise(None).unwrap();
        k.add_message_to_promise_queue(kp, msg("poke", Some(result)))
            .unwrap();

        k.resolve_promise(Some(decider), kp, false, CapData::new(b"42".to_vec(), vec![]))
            .unwrap();

        assert!(matches!(
            k.promise_state(result).unwrap(),
            PromiseState::Rejected { .. }
        ));
    }

    #[test]
    fn resolution_target_chases_slot_ref_chains() {
        let mut k = keeper();
        let decider = vat(&mut k, "decider");
        let owner = vat(&mut k, "owner");
        let ko = k.add_kernel_object(owner).unwrap();
        let inner = k.add_kernel_promise(Some(decider)).unwrap();
        let outer = k.add_kernel_promise(Some(decider)).unwrap();
        k.resolve_promise(Some(decider), inner, false, CapData::slot_ref(ko.into()))
            .unwrap();
        k.resolve_promise(Some(decider), outer, false, CapData::slot_ref(inner.into()))
            .unwrap();

        assert_eq!(k.resolution_target(outer.into()).unwrap(), KernelSlot::Object(ko));
        // Unresolved promises are their own target.
        let open = k.add_kernel_promise(None).unwrap();
        assert_eq!(
            k.resolution_target(open.into()).unwrap(),
            KernelSlot::Promise(open)
        );
    }
}
