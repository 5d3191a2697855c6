//! Crank processor and public kernel surface: pops one work item per crank,
//! routes it to a vat worker, and commits or rolls back the store around it.

use vos_store::DurableStore;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::gc::{GcAction, GcActionKind};
use crate::ids::{KPromiseId, KernelSlot, MeterId, VatId, VatSlot, VatSlotKind};
use crate::keeper::{KernelKeeper, MeterVerdict};
use crate::records::{
    CapData, DeliveryStatus, Message, PromiseState, RunQueueItem, VatCapData, VatDelivery,
    VatOptions, VatResolution,
};
use crate::warehouse::{VatWarehouse, WorkerFactory};

/// Flat compute charge per metered delivery; the wire protocol does not
/// report per-delivery usage.
const DELIVERY_METER_COST: u64 = 1;

const SAVEPOINT_START: &str = "start";
const SAVEPOINT_DELIVER: &str = "deliver";

/// Verdict on one acceptance-queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Leave the item (and everything behind it) for a later pass.
    Defer,
}

/// Gatekeeper between the acceptance queue and the run queue. Admission is
/// FIFO: the first deferred item stops the pass so ordering never inverts.
pub trait AdmissionPolicy {
    fn admit(&mut self, item: &RunQueueItem) -> Admission;
}

/// Default policy: everything goes straight through.
pub struct AdmitAll;

impl AdmissionPolicy for AdmitAll {
    fn admit(&mut self, _item: &RunQueueItem) -> Admission {
        Admission::Admit
    }
}

pub struct Controller<S: DurableStore> {
    keeper: KernelKeeper<S>,
    warehouse: VatWarehouse,
    config: KernelConfig,
    policy: Box<dyn AdmissionPolicy>,
}

impl<S: DurableStore> Controller<S> {
    pub fn new(
        store: S,
        factory: Box<dyn WorkerFactory>,
        config: KernelConfig,
    ) -> Result<Self, KernelError> {
        let keeper = KernelKeeper::new(store)?;
        let warehouse = VatWarehouse::new(factory, &config);
        Ok(Self {
            keeper,
            warehouse,
            config,
            policy: Box::new(AdmitAll),
        })
    }

    pub fn set_admission_policy(&mut self, policy: Box<dyn AdmissionPolicy>) {
        self.policy = policy;
    }

    pub fn keeper(&self) -> &KernelKeeper<S> {
        &self.keeper
    }

    pub fn keeper_mut(&mut self) -> &mut KernelKeeper<S> {
        &mut self.keeper
    }

    // ---- vat management ----------------------------------------------------

    /// Registers a static vat. Its worker starts lazily, receiving the start
    /// delivery on first load.
    pub fn add_vat(
        &mut self,
        name: &str,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        self.keeper.allocate_vat_id(Some(name), false, options)
    }

    pub fn create_dynamic_vat(
        &mut self,
        name: Option<&str>,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        self.warehouse
            .create_dynamic_vat(&mut self.keeper, name, options)
    }

    /// The vat's root object (`o+0` by convention), minting the kernel
    /// object on first use.
    pub fn root_object(&mut self, vat: VatId) -> Result<KernelSlot, KernelError> {
        let mut vk = self.keeper.provide_vat_keeper(vat)?;
        vk.map_vat_to_kernel(VatSlot::export(VatSlotKind::Object, 0))
    }

    pub fn allocate_meter(
        &mut self,
        remaining: u64,
        threshold: u64,
    ) -> Result<MeterId, KernelError> {
        self.keeper.allocate_meter(remaining, threshold)
    }

    /// Stops the vat's worker and scrubs its kernel presence: c-list entries
    /// release their references, owned exports are orphaned, and promises it
    /// was deciding reject.
    pub fn terminate_vat(&mut self, vat: VatId, reason: &str) -> Result<(), KernelError> {
        log::info!("terminating {vat}: {reason}");
        self.warehouse.stop_worker(&mut self.keeper, vat);
        let standalone = !self.keeper.in_crank();
        if standalone {
            self.keeper.start_crank()?;
        }
        let outcome = self
            .keeper
            .cleanup_after_terminated_vat(vat)
            .and_then(|()| self.keeper.set_vat_fault(vat, reason))
            .and_then(|()| self.keeper.process_refcounts());
        if standalone {
            match outcome {
                Ok(()) => self.keeper.end_crank()?,
                Err(err) => {
                    self.keeper.abort_crank()?;
                    return Err(err);
                }
            }
        } else {
            outcome?;
        }
        Ok(())
    }

    /// Vat upgrade: discard the current worker and start a fresh incarnation
    /// on next delivery.
    pub fn upgrade_vat(&mut self, vat: VatId) -> Result<u32, KernelError> {
        self.warehouse
            .begin_new_worker_incarnation(&mut self.keeper, vat)
    }

    /// Restart warm-up: preloads registered vats up to the residency limit,
    /// replaying their transcripts. Runs as one crank so a replay fault
    /// leaves the store at the last committed state.
    pub fn start(&mut self) -> Result<(), KernelError> {
        self.keeper.start_crank()?;
        let outcome = self
            .warehouse
            .start(&mut self.keeper)
            .and_then(|()| self.keeper.process_refcounts());
        match outcome {
            Ok(()) => self.keeper.end_crank(),
            Err(err) => {
                if let Err(abort_err) = self.keeper.abort_crank() {
                    log::error!("crank abort failed after {err}: {abort_err}");
                }
                Err(err)
            }
        }
    }

    pub fn shutdown(mut self) {
        self.warehouse.shutdown();
    }

    // ---- external message injection ----------------------------------------

    /// Queues a message from outside the vat graph onto the acceptance
    /// queue. Returns the result promise when one is requested.
    pub fn queue_message(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: CapData,
        want_result: bool,
    ) -> Result<Option<KPromiseId>, KernelError> {
        let result = if want_result {
            let kp = self.keeper.add_kernel_promise(None)?;
            // The embedder holds a reference so the settled state stays
            // readable after subscriber retirement.
            self.keeper.increment_ref_count(kp.into(), "external")?;
            Some(kp)
        } else {
            None
        };
        self.keeper.add_to_acceptance_queue(RunQueueItem::Send {
            target,
            message: Message {
                method: method.to_string(),
                args,
                result,
            },
        })?;
        Ok(result)
    }

    /// Pins an object so zero refcounts never free it. Used for externally
    /// held roots.
    pub fn pin_object(&mut self, slot: KernelSlot) -> Result<(), KernelError> {
        match slot {
            KernelSlot::Object(ko) => self.keeper.pin_object(ko),
            KernelSlot::Promise(kp) => Err(KernelError::Corrupt(format!(
                "cannot pin promise {kp}"
            ))),
        }
    }

    // ---- the crank loop ----------------------------------------------------

    /// Runs cranks until no work remains. Returns how many ran.
    pub fn run_until_quiescent(&mut self) -> Result<u64, KernelError> {
        let mut cranks = 0;
        while self.step()? {
            cranks += 1;
        }
        Ok(cranks)
    }

    /// Runs at most one crank. Returns false when the kernel is quiescent.
    pub fn step(&mut self) -> Result<bool, KernelError> {
        self.keeper.start_crank()?;
        match self.crank_body() {
            Ok(ran) => {
                if ran {
                    self.keeper.end_crank()?;
                } else {
                    self.keeper.abort_crank()?;
                }
                Ok(ran)
            }
            Err(err) => {
                // The abort leaves the store as the last committed crank and
                // restores the popped work item.
                if let Err(abort_err) = self.keeper.abort_crank() {
                    log::error!("crank abort failed after {err}: {abort_err}");
                }
                // A misbehaving or unbootable worker takes down its vat, not
                // the kernel. The restored message splats on the next crank
                // once the vat is gone.
                match err {
                    KernelError::Worker { vat, source } => {
                        self.terminate_vat(vat, &format!("worker fault: {source}"))?;
                        Ok(true)
                    }
                    KernelError::StartFailed { vat, detail } => {
                        self.terminate_vat(vat, &format!("start failed: {detail}"))?;
                        Ok(true)
                    }
                    err => Err(err),
                }
            }
        }
    }

    fn crank_body(&mut self) -> Result<bool, KernelError> {
        self.keeper.establish_crank_savepoint(SAVEPOINT_START)?;
        self.admit_from_acceptance_queue()?;

        let Some(item) = self.next_work_item()? else {
            return Ok(false);
        };
        // The pop above survives a delivery failure; only work done on the
        // vat's behalf rolls back.
        self.keeper.establish_crank_savepoint(SAVEPOINT_DELIVER)?;
        match item {
            RunQueueItem::Send { target, message } => self.process_send(target, message)?,
            RunQueueItem::Notify { vat, promise } => self.process_notify(vat, promise)?,
            RunQueueItem::Gc { action } => self.process_gc_action(action)?,
            RunQueueItem::BringOutYourDead { vat } => self.process_reap(vat)?,
        }
        self.keeper.process_refcounts()?;
        Ok(true)
    }

    /// Moves admitted items from the acceptance queue to the run queue in
    /// order, stopping at the first deferral. A deferred item stays at the
    /// head, untouched, so arrival order holds even when this crank commits
    /// other work.
    fn admit_from_acceptance_queue(&mut self) -> Result<(), KernelError> {
        while let Some(item) = self.keeper.peek_acceptance_queue_msg()? {
            if self.policy.admit(&item) == Admission::Defer {
                break;
            }
            let item = self
                .keeper
                .next_acceptance_queue_msg()?
                .ok_or_else(|| KernelError::Corrupt("acceptance queue head vanished".into()))?;
            self.keeper.add_to_run_queue(item)?;
        }
        Ok(())
    }

    fn next_work_item(&mut self) -> Result<Option<RunQueueItem>, KernelError> {
        if let Some(item) = self.keeper.next_run_queue_msg()? {
            return Ok(Some(item));
        }
        if let Some(action) = self.keeper.next_gc_action()? {
            return Ok(Some(RunQueueItem::Gc { action }));
        }
        self.keeper.next_reap_action()
    }

    // ---- message routing ---------------------------------------------------

    fn process_send(&mut self, target: KernelSlot, message: Message) -> Result<(), KernelError> {
        let target = self.keeper.resolution_target(target)?;
        match target {
            KernelSlot::Object(ko) => {
                let owner = self.keeper.owner_of(ko)?;
                match owner {
                    Some(vat) if self.keeper.vat_is_alive(vat)? => {
                        self.deliver_message(vat, ko.into(), message)
                    }
                    _ => self.splat_message(message, "no such object"),
                }
            }
            KernelSlot::Promise(kp) => {
                if !self.keeper.promise_exists(kp)? {
                    return self.splat_message(message, "no such promise");
                }
                match self.keeper.promise_state(kp)? {
                    PromiseState::Unresolved { .. } => {
                        self.keeper.add_message_to_promise_queue(kp, message)
                    }
                    PromiseState::Rejected { data } => {
                        // Rejection contagion: the result inherits the data.
                        self.reject_result(message.result, data)
                    }
                    // A fulfilled slot-ref was chased above, so this is a
                    // plain-data resolution nothing can be sent to.
                    PromiseState::Fulfilled { .. } => {
                        self.splat_message(message, "cannot deliver to non-capability resolution")
                    }
                }
            }
        }
    }

    /// Undeliverable message: consume it and reject its result.
    fn splat_message(&mut self, message: Message, reason: &str) -> Result<(), KernelError> {
        log::debug!("splatting message '{}': {reason}", message.method);
        self.reject_result(message.result, error_data(reason))
    }

    /// Rejects a message's result promise, tolerating one that something
    /// else already settled or retired. A dying decider's cleanup rejects
    /// every promise it was deciding, including results of messages still
    /// in flight toward it.
    fn reject_result(
        &mut self,
        result: Option<KPromiseId>,
        data: CapData,
    ) -> Result<(), KernelError> {
        let Some(result) = result else {
            return Ok(());
        };
        if !self.keeper.promise_exists(result)? {
            return Ok(());
        }
        if let PromiseState::Unresolved { .. } = self.keeper.promise_state(result)? {
            self.keeper.resolve_promise(None, result, true, data)?;
        }
        Ok(())
    }

    fn deliver_message(
        &mut self,
        vat: VatId,
        target: KernelSlot,
        message: Message,
    ) -> Result<(), KernelError> {
        let meter = self.keeper.vat_record(vat)?.options.meter;
        if let Some(meter) = meter {
            if !self.keeper.check_meter(meter, DELIVERY_METER_COST)? {
                // Termination cleanup may already have rejected (or retired)
                // this result if the dead vat was its decider.
                self.terminate_vat(vat, "meter exhausted")?;
                self.reject_result(message.result, error_data("meter exhausted"))?;
                return Ok(());
            }
        }

        if let Some(result) = message.result {
            self.keeper.set_decider(result, vat)?;
        }
        let delivery = {
            let mut vk = self.keeper.provide_vat_keeper(vat)?;
            let target = vk.map_kernel_to_vat(target)?;
            let args = translate_capdata(&mut vk, &message.args)?;
            let result = match message.result {
                Some(kp) => Some(vk.map_kernel_to_vat(KernelSlot::Promise(kp))?),
                None => None,
            };
            VatDelivery::Message {
                target,
                method: message.method.clone(),
                args,
                result,
            }
        };

        let status = self
            .warehouse
            .deliver_to_vat(&mut self.keeper, vat, delivery)?;
        match status {
            DeliveryStatus::Ok => {
                self.settle_meter(vat, meter)?;
                self.countdown_reap(vat)
            }
            DeliveryStatus::Fail { detail } => {
                self.keeper.rollback_crank(SAVEPOINT_DELIVER)?;
                self.fail_delivery(vat, message.result, &detail)
            }
        }
    }

    /// Rolled-back delivery: fault the vat and reject the result promise.
    /// The consuming pop stays committed, so the message is gone.
    fn fail_delivery(
        &mut self,
        vat: VatId,
        result: Option<KPromiseId>,
        detail: &str,
    ) -> Result<(), KernelError> {
        log::warn!("delivery to {vat} failed: {detail}");
        self.keeper.set_vat_fault(vat, detail)?;
        self.reject_result(result, error_data(detail))
    }

    fn settle_meter(&mut self, vat: VatId, meter: Option<MeterId>) -> Result<(), KernelError> {
        let Some(meter) = meter else {
            return Ok(());
        };
        match self.keeper.deduct_meter(meter, DELIVERY_METER_COST)? {
            MeterVerdict::Ok { .. } => Ok(()),
            MeterVerdict::BelowThreshold { remaining } => {
                log::warn!("{meter} for {vat} down to {remaining}, below threshold");
                Ok(())
            }
            MeterVerdict::Exhausted => self.terminate_vat(vat, "meter exhausted"),
        }
    }

    fn countdown_reap(&mut self, vat: VatId) -> Result<(), KernelError> {
        let record = self.keeper.vat_record(vat)?;
        let interval = record
            .options
            .reap_interval
            .or(self.config.reap_interval);
        let Some(interval) = interval else {
            return Ok(());
        };
        if self.keeper.countdown_reap(vat, interval)? {
            self.keeper.schedule_reap(vat)?;
        }
        Ok(())
    }

    // ---- notifies ----------------------------------------------------------

    fn process_notify(&mut self, vat: VatId, promise: KPromiseId) -> Result<(), KernelError> {
        if !self.keeper.vat_is_alive(vat)? {
            return Ok(());
        }
        // The promise can retire between scheduling and delivery; a stale
        // notify is consumed silently.
        if !self.keeper.promise_exists(promise)? {
            return Ok(());
        }
        let settled = self.collect_settled(promise)?;
        if settled.is_empty() {
            return Ok(());
        }
        let delivery = {
            let mut vk = self.keeper.provide_vat_keeper(vat)?;
            let mut resolutions = Vec::with_capacity(settled.len());
            for (kp, rejected, data) in &settled {
                resolutions.push(VatResolution {
                    promise: vk.map_kernel_to_vat(KernelSlot::Promise(*kp))?,
                    rejected: *rejected,
                    data: translate_capdata(&mut vk, data)?,
                });
            }
            VatDelivery::Notify { resolutions }
        };
        let status = self
            .warehouse
            .deliver_to_vat(&mut self.keeper, vat, delivery)?;
        match status {
            DeliveryStatus::Ok => self.countdown_reap(vat),
            DeliveryStatus::Fail { detail } => {
                self.keeper.rollback_crank(SAVEPOINT_DELIVER)?;
                self.fail_delivery(vat, None, &detail)
            }
        }
    }

    /// The settled promise plus every settled promise reachable through
    /// resolution data, so one notify carries the whole batch.
    fn collect_settled(
        &self,
        root: KPromiseId,
    ) -> Result<Vec<(KPromiseId, bool, CapData)>, KernelError> {
        let mut out: Vec<(KPromiseId, bool, CapData)> = Vec::new();
        let mut pending = vec![root];
        while let Some(kp) = pending.pop() {
            if out.iter().any(|(seen, _, _)| *seen == kp) {
                continue;
            }
            if !self.keeper.promise_exists(kp)? {
                continue;
            }
            let (rejected, data) = match self.keeper.promise_state(kp)? {
                PromiseState::Fulfilled { data } => (false, data),
                PromiseState::Rejected { data } => (true, data),
                PromiseState::Unresolved { .. } => continue,
            };
            for slot in &data.slots {
                if let KernelSlot::Promise(inner) = slot {
                    pending.push(*inner);
                }
            }
            out.push((kp, rejected, data));
        }
        Ok(out)
    }

    // ---- GC and reap deliveries --------------------------------------------

    fn process_gc_action(&mut self, action: GcAction) -> Result<(), KernelError> {
        let GcAction { vat, kind, krefs } = action;
        if !self.keeper.vat_is_alive(vat)? {
            return Ok(());
        }
        let (delivery, slots) = {
            let mut vk = self.keeper.provide_vat_keeper(vat)?;
            let mut slots = Vec::with_capacity(krefs.len());
            let mut kept = Vec::with_capacity(krefs.len());
            for kref in &krefs {
                // Only translate references the vat still holds; GC never
                // mints new c-list entries.
                if vk.has_clist_entry(*kref)? {
                    slots.push(vk.map_kernel_to_vat(*kref)?);
                    kept.push(*kref);
                }
            }
            if slots.is_empty() {
                return Ok(());
            }
            let delivery = match kind {
                // Sweep is a drop from the owner's point of view; the kernel
                // side of it happens after the worker acknowledges.
                GcActionKind::DropExports | GcActionKind::Sweep => {
                    VatDelivery::DropExports { slots }
                }
                GcActionKind::RetireExports => VatDelivery::RetireExports { slots },
                GcActionKind::RetireImports => VatDelivery::RetireImports { slots },
            };
            (delivery, kept)
        };

        let status = self
            .warehouse
            .deliver_to_vat(&mut self.keeper, vat, delivery)?;
        match status {
            DeliveryStatus::Ok => self.finish_gc_action(vat, kind, &slots),
            DeliveryStatus::Fail { detail } => {
                self.keeper.rollback_crank(SAVEPOINT_DELIVER)?;
                self.fail_delivery(vat, None, &detail)
            }
        }
    }

    fn finish_gc_action(
        &mut self,
        vat: VatId,
        kind: GcActionKind,
        krefs: &[KernelSlot],
    ) -> Result<(), KernelError> {
        match kind {
            GcActionKind::DropExports => Ok(()),
            GcActionKind::RetireExports | GcActionKind::RetireImports => {
                let mut vk = self.keeper.provide_vat_keeper(vat)?;
                for kref in krefs {
                    vk.delete_clist_entry(*kref)?;
                }
                Ok(())
            }
            GcActionKind::Sweep => {
                // The owner acknowledged the drop; the object is gone.
                {
                    let mut vk = self.keeper.provide_vat_keeper(vat)?;
                    for kref in krefs {
                        vk.delete_clist_entry(*kref)?;
                    }
                }
                for kref in krefs {
                    if let KernelSlot::Object(ko) = kref {
                        self.keeper.delete_kernel_object(*ko)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn process_reap(&mut self, vat: VatId) -> Result<(), KernelError> {
        if !self.keeper.vat_is_alive(vat)? {
            return Ok(());
        }
        let status =
            self.warehouse
                .deliver_to_vat(&mut self.keeper, vat, VatDelivery::BringOutYourDead)?;
        match status {
            DeliveryStatus::Ok => Ok(()),
            DeliveryStatus::Fail { detail } => {
                self.keeper.rollback_crank(SAVEPOINT_DELIVER)?;
                self.fail_delivery(vat, None, &detail)
            }
        }
    }
}

fn error_data(detail: &str) -> CapData {
    CapData::new(format!("\"{detail}\"").into_bytes(), vec![])
}

fn translate_capdata<S: DurableStore>(
    vk: &mut crate::keeper::VatKeeper<'_, S>,
    data: &CapData,
) -> Result<VatCapData, KernelError> {
    let mut slots = Vec::with_capacity(data.slots.len());
    for slot in &data.slots {
        slots.push(vk.map_kernel_to_vat(*slot)?);
    }
    Ok(VatCapData {
        body: data.body.clone(),
        slots,
    })
}
