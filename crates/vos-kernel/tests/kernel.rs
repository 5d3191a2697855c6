//! End-to-end crank scenarios driven through the public controller surface,
//! with scripted in-process workers standing in for real vat code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vos_kernel::{
    Admission, AdmissionPolicy, CapData, Controller, DeliveryStatus, KObjectId, KernelConfig,
    KernelError, ManagerType, PromiseState, RunQueueItem, SnapshotRecord, SyscallResult,
    SyscallSink, VatCapData, VatDelivery, VatId, VatOptions, VatSlot, VatSlotKind, VatSyscall,
    VatWorker, WorkerFactory,
};
use vos_store::{MemStore, SqliteStore};
use vos_worker::WorkerError;

type Behavior = Arc<
    Mutex<Box<dyn FnMut(&VatDelivery, &mut dyn SyscallSink) -> Result<DeliveryStatus, KernelError> + Send>>,
>;

fn behavior(
    f: impl FnMut(&VatDelivery, &mut dyn SyscallSink) -> Result<DeliveryStatus, KernelError>
        + Send
        + 'static,
) -> Behavior {
    Arc::new(Mutex::new(Box::new(f)))
}

struct ScriptedWorker {
    behavior: Behavior,
}

impl VatWorker for ScriptedWorker {
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallSink,
    ) -> Result<DeliveryStatus, KernelError> {
        (self.behavior.lock().unwrap())(delivery, syscalls)
    }

    fn save_snapshot(&mut self, _path: &str) -> Result<(), KernelError> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

#[derive(Clone, Default)]
struct FactoryHandle {
    behaviors: Arc<Mutex<HashMap<VatId, Behavior>>>,
}

impl FactoryHandle {
    fn set_behavior(&self, vat: VatId, b: Behavior) {
        self.behaviors.lock().unwrap().insert(vat, b);
    }
}

impl WorkerFactory for FactoryHandle {
    fn start_worker(
        &mut self,
        vat: VatId,
        _incarnation: u32,
        _manager: ManagerType,
        _snapshot: Option<&SnapshotRecord>,
    ) -> Result<Box<dyn VatWorker>, KernelError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&vat)
            .cloned()
            .unwrap_or_else(|| behavior(|_, _| Ok(DeliveryStatus::Ok)));
        Ok(Box::new(ScriptedWorker { behavior }))
    }
}

fn kernel(handle: &FactoryHandle) -> Controller<MemStore> {
    let _ = env_logger::builder().is_test(true).try_init();
    Controller::new(
        MemStore::new(),
        Box::new(handle.clone()),
        KernelConfig::default(),
    )
    .unwrap()
}

fn sys(sink: &mut dyn SyscallSink, call: &VatSyscall) -> SyscallResult {
    let request = serde_cbor::to_vec(call).unwrap();
    let response = sink.syscall(&request).unwrap();
    serde_cbor::from_slice(&response).unwrap()
}

fn no_args() -> CapData {
    CapData::new(b"[]".to_vec(), vec![])
}

type DeliveryLog = Arc<Mutex<Vec<String>>>;

fn log_delivery(log: &DeliveryLog, name: &str, delivery: &VatDelivery) {
    let entry = match delivery {
        VatDelivery::StartVat => format!("{name}:start"),
        VatDelivery::Message { method, .. } => format!("{name}:{method}"),
        VatDelivery::Notify { .. } => format!("{name}:notify"),
        VatDelivery::DropExports { .. } => format!("{name}:drop"),
        _ => return,
    };
    log.lock().unwrap().push(entry);
}

#[test]
fn external_message_resolves_its_result() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("responder", VatOptions::default()).unwrap();
    handle.set_behavior(
        vat,
        behavior(|delivery, sink| {
            if let VatDelivery::Message { method, result, .. } = delivery {
                assert_eq!(method, "ping");
                let reply = VatSyscall::Resolve {
                    resolutions: vec![(
                        result.unwrap(),
                        false,
                        VatCapData {
                            body: b"\"pong\"".to_vec(),
                            slots: vec![],
                        },
                    )],
                };
                assert_eq!(sys(sink, &reply), SyscallResult::ok());
            }
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let kp = kernel
        .queue_message(root, "ping", no_args(), true)
        .unwrap()
        .unwrap();
    kernel.run_until_quiescent().unwrap();

    assert_eq!(
        kernel.keeper().promise_state(kp).unwrap(),
        PromiseState::Fulfilled {
            data: CapData::new(b"\"pong\"".to_vec(), vec![]),
        }
    );
    kernel.keeper().audit_ref_counts(&[kp.into()]).unwrap();
}

#[test]
fn failed_delivery_rolls_back_and_rejects_the_result() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("flaky", VatOptions::default()).unwrap();
    handle.set_behavior(
        vat,
        behavior(|delivery, sink| {
            if let VatDelivery::Message { .. } = delivery {
                // State written mid-delivery must vanish with the failure.
                sys(
                    sink,
                    &VatSyscall::VatstoreSet {
                        key: "progress".to_string(),
                        value: b"half".to_vec(),
                    },
                );
                return Ok(DeliveryStatus::Fail {
                    detail: "boom".to_string(),
                });
            }
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let kp = kernel
        .queue_message(root, "explode", no_args(), true)
        .unwrap()
        .unwrap();
    kernel.run_until_quiescent().unwrap();

    assert_eq!(
        kernel.keeper().vat_fault(vat).unwrap().as_deref(),
        Some("boom")
    );
    assert_eq!(
        kernel
            .keeper_mut()
            .provide_vat_keeper(vat)
            .unwrap()
            .vatstore_get("progress")
            .unwrap(),
        None
    );
    assert_eq!(
        kernel.keeper().promise_state(kp).unwrap(),
        PromiseState::Rejected {
            data: CapData::new(b"\"boom\"".to_vec(), vec![]),
        }
    );
    // The message was consumed; the kernel is quiescent, not retrying.
    assert_eq!(kernel.keeper().run_queue_length().unwrap(), 0);
    kernel.keeper().audit_ref_counts(&[kp.into()]).unwrap();
}

#[test]
fn promise_pipeline_forwards_sends_and_notifies_subscribers() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    // Three parties: the provider decides the result, the consumer
    // subscribes to it, and a third vat owns the object it resolves to.
    let provider = kernel.add_vat("provider", VatOptions::default()).unwrap();
    let consumer = kernel.add_vat("consumer", VatOptions::default()).unwrap();
    let owner = kernel.add_vat("owner", VatOptions::default()).unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));

    let result_slot = VatSlot::export(VatSlotKind::Promise, 7);

    let consumer_log = log.clone();
    handle.set_behavior(
        consumer,
        behavior(move |delivery, sink| {
            log_delivery(&consumer_log, "consumer", delivery);
            match delivery {
                VatDelivery::Message { method, args, .. } if method == "begin" => {
                    // Ask the provider for its thing, then pipeline a poke to
                    // the result before it resolves.
                    sys(
                        sink,
                        &VatSyscall::Send {
                            target: args.slots[0],
                            method: "getThing".to_string(),
                            args: VatCapData { body: b"[]".to_vec(), slots: vec![] },
                            result: Some(result_slot),
                        },
                    );
                    sys(sink, &VatSyscall::Subscribe { promise: result_slot });
                    sys(
                        sink,
                        &VatSyscall::Send {
                            target: result_slot,
                            method: "poke".to_string(),
                            args: VatCapData { body: b"[]".to_vec(), slots: vec![] },
                            result: None,
                        },
                    );
                }
                VatDelivery::Notify { resolutions } => {
                    assert_eq!(resolutions.len(), 1);
                    assert!(!resolutions[0].rejected);
                    assert_eq!(resolutions[0].data.body, b"$0");
                    let thing = resolutions[0].data.slots[0];
                    assert!(!thing.allocated_by_vat);
                    sys(sink, &VatSyscall::DropImports { slots: vec![thing] });
                }
                _ => {}
            }
            Ok(DeliveryStatus::Ok)
        }),
    );

    // The provider resolves the result to an object it merely imported,
    // so the poke has to cross into a third c-list.
    let adopted: Arc<Mutex<Option<VatSlot>>> = Arc::new(Mutex::new(None));
    let provider_adopted = adopted.clone();
    let provider_log = log.clone();
    handle.set_behavior(
        provider,
        behavior(move |delivery, sink| {
            log_delivery(&provider_log, "provider", delivery);
            match delivery {
                VatDelivery::Message { method, args, .. } if method == "adopt" => {
                    let thing = args.slots[0];
                    assert!(!thing.allocated_by_vat);
                    *provider_adopted.lock().unwrap() = Some(thing);
                }
                VatDelivery::Message { method, result, .. } if method == "getThing" => {
                    let thing = provider_adopted.lock().unwrap().unwrap();
                    sys(
                        sink,
                        &VatSyscall::Resolve {
                            resolutions: vec![(
                                result.unwrap(),
                                false,
                                VatCapData { body: b"$0".to_vec(), slots: vec![thing] },
                            )],
                        },
                    );
                }
                _ => {}
            }
            Ok(DeliveryStatus::Ok)
        }),
    );

    let owner_log = log.clone();
    handle.set_behavior(
        owner,
        behavior(move |delivery, _| {
            log_delivery(&owner_log, "owner", delivery);
            if let VatDelivery::Message { method, target, .. } = delivery {
                assert_eq!(method, "poke");
                // Forwarded to the resolved thing: our own root.
                assert_eq!(*target, VatSlot::export(VatSlotKind::Object, 0));
            }
            Ok(DeliveryStatus::Ok)
        }),
    );

    let provider_root = kernel.root_object(provider).unwrap();
    let consumer_root = kernel.root_object(consumer).unwrap();
    let owner_root = kernel.root_object(owner).unwrap();
    kernel.pin_object(provider_root).unwrap();
    kernel.pin_object(consumer_root).unwrap();
    kernel.pin_object(owner_root).unwrap();

    kernel
        .queue_message(provider_root, "adopt", CapData::slot_ref(owner_root), false)
        .unwrap();
    kernel
        .queue_message(
            consumer_root,
            "begin",
            CapData::slot_ref(provider_root),
            false,
        )
        .unwrap();
    kernel.run_until_quiescent().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "provider:start",
            "provider:adopt",
            "consumer:start",
            "consumer:begin",
            "provider:getThing",
            "owner:start",
            "owner:poke",
            "consumer:notify",
        ]
    );
    kernel.keeper().audit_ref_counts(&[]).unwrap();
}

#[test]
fn meter_exhaustion_terminates_the_vat() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let meter = kernel.allocate_meter(2, 1).unwrap();
    let vat = kernel
        .add_vat(
            "metered",
            VatOptions {
                meter: Some(meter),
                ..VatOptions::default()
            },
        )
        .unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let vat_log = log.clone();
    handle.set_behavior(
        vat,
        behavior(move |delivery, _| {
            log_delivery(&vat_log, "metered", delivery);
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let first = kernel.queue_message(root, "ping", no_args(), true).unwrap().unwrap();
    let second = kernel.queue_message(root, "ping", no_args(), true).unwrap().unwrap();
    let third = kernel.queue_message(root, "ping", no_args(), true).unwrap().unwrap();
    kernel.run_until_quiescent().unwrap();

    // Two deliveries drained the budget; the third delivery's pre-check
    // terminated the vat instead of running it.
    assert_eq!(
        *log.lock().unwrap(),
        vec!["metered:start", "metered:ping", "metered:ping"]
    );
    assert!(!kernel.keeper().vat_is_alive(vat).unwrap());
    assert_eq!(
        kernel.keeper().vat_fault(vat).unwrap().as_deref(),
        Some("meter exhausted")
    );
    assert_eq!(
        kernel.keeper().promise_state(first).unwrap(),
        PromiseState::Rejected {
            data: CapData::new(b"\"vat terminated\"".to_vec(), vec![]),
        }
    );
    assert_eq!(
        kernel.keeper().promise_state(third).unwrap(),
        PromiseState::Rejected {
            data: CapData::new(b"\"meter exhausted\"".to_vec(), vec![]),
        }
    );
    kernel
        .keeper()
        .audit_ref_counts(&[first.into(), second.into(), third.into()])
        .unwrap();
}

#[test]
fn dropped_import_sweeps_the_export() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let exporter = kernel.add_vat("exporter", VatOptions::default()).unwrap();
    let importer = kernel.add_vat("importer", VatOptions::default()).unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));

    let exporter_log = log.clone();
    handle.set_behavior(
        exporter,
        behavior(move |delivery, sink| {
            log_delivery(&exporter_log, "exporter", delivery);
            if let VatDelivery::Message { method, args, .. } = delivery {
                if method == "make" {
                    // Hand a fresh export to the importer.
                    sys(
                        sink,
                        &VatSyscall::Send {
                            target: args.slots[0],
                            method: "take".to_string(),
                            args: VatCapData {
                                body: b"$0".to_vec(),
                                slots: vec![VatSlot::export(VatSlotKind::Object, 5)],
                            },
                            result: None,
                        },
                    );
                }
            }
            Ok(DeliveryStatus::Ok)
        }),
    );
    let importer_log = log.clone();
    handle.set_behavior(
        importer,
        behavior(move |delivery, sink| {
            log_delivery(&importer_log, "importer", delivery);
            if let VatDelivery::Message { method, args, .. } = delivery {
                if method == "take" {
                    sys(sink, &VatSyscall::DropImports { slots: vec![args.slots[0]] });
                }
            }
            Ok(DeliveryStatus::Ok)
        }),
    );

    let exporter_root = kernel.root_object(exporter).unwrap();
    let importer_root = kernel.root_object(importer).unwrap();
    kernel.pin_object(exporter_root).unwrap();
    kernel.pin_object(importer_root).unwrap();

    kernel
        .queue_message(exporter_root, "make", CapData::slot_ref(importer_root), false)
        .unwrap();
    kernel.run_until_quiescent().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "exporter:start",
            "exporter:make",
            "importer:start",
            "importer:take",
            "exporter:drop",
        ]
    );
    // Roots are ko1 and ko2; the handed-off export was ko3.
    assert!(!kernel.keeper().object_exists(KObjectId(3)).unwrap());
    kernel.keeper().audit_ref_counts(&[]).unwrap();
}

struct Gate(Arc<AtomicBool>);

impl AdmissionPolicy for Gate {
    fn admit(&mut self, _item: &RunQueueItem) -> Admission {
        if self.0.load(Ordering::SeqCst) {
            Admission::Admit
        } else {
            Admission::Defer
        }
    }
}

#[test]
fn deferred_admission_keeps_order_and_goes_quiescent() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("worker", VatOptions::default()).unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let vat_log = log.clone();
    handle.set_behavior(
        vat,
        behavior(move |delivery, _| {
            log_delivery(&vat_log, "worker", delivery);
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let open = Arc::new(AtomicBool::new(false));
    kernel.set_admission_policy(Box::new(Gate(open.clone())));

    for method in ["a", "b", "c"] {
        kernel.queue_message(root, method, no_args(), false).unwrap();
    }

    // Everything deferred: no crank runs and the backlog stays intact.
    assert!(!kernel.step().unwrap());
    assert_eq!(kernel.keeper().acceptance_queue_length().unwrap(), 3);
    assert!(log.lock().unwrap().is_empty());

    open.store(true, Ordering::SeqCst);
    kernel.run_until_quiescent().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["worker:start", "worker:a", "worker:b", "worker:c"]
    );
    kernel.keeper().audit_ref_counts(&[]).unwrap();
}

#[test]
fn meter_exhaustion_on_a_self_send_is_absorbed() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let meter = kernel.allocate_meter(2, 0).unwrap();
    let vat = kernel
        .add_vat(
            "metered",
            VatOptions {
                meter: Some(meter),
                ..VatOptions::default()
            },
        )
        .unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let vat_log = log.clone();
    // Each ping sends the vat's own root an `again`, with a result promise
    // the vat itself decides. When the meter runs dry those in-flight
    // self-sends point at a decider that termination cleanup already
    // rejected.
    let next_promise = AtomicU64::new(1);
    handle.set_behavior(
        vat,
        behavior(move |delivery, sink| {
            log_delivery(&vat_log, "metered", delivery);
            if let VatDelivery::Message { method, .. } = delivery {
                if method == "ping" {
                    let index = next_promise.fetch_add(1, Ordering::SeqCst);
                    sys(
                        sink,
                        &VatSyscall::Send {
                            target: VatSlot::export(VatSlotKind::Object, 0),
                            method: "again".to_string(),
                            args: VatCapData { body: b"[]".to_vec(), slots: vec![] },
                            result: Some(VatSlot::export(VatSlotKind::Promise, index)),
                        },
                    );
                }
            }
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    kernel.queue_message(root, "ping", no_args(), false).unwrap();
    kernel.queue_message(root, "ping", no_args(), false).unwrap();
    // The kernel absorbs the exhaustion and drains the leftover self-sends
    // instead of halting on their dead result promises.
    kernel.run_until_quiescent().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["metered:start", "metered:ping", "metered:ping"]
    );
    assert!(!kernel.keeper().vat_is_alive(vat).unwrap());
    assert_eq!(
        kernel.keeper().vat_fault(vat).unwrap().as_deref(),
        Some("meter exhausted")
    );
    assert_eq!(kernel.keeper().run_queue_length().unwrap(), 0);
    kernel.keeper().audit_ref_counts(&[]).unwrap();
}

#[test]
fn worker_wire_fault_terminates_the_vat() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("wobbly", VatOptions::default()).unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let vat_log = log.clone();
    handle.set_behavior(
        vat,
        behavior(move |delivery, _| {
            log_delivery(&vat_log, "wobbly", delivery);
            if let VatDelivery::Message { .. } = delivery {
                return Err(KernelError::Worker {
                    vat,
                    source: WorkerError::Protocol("unparseable frame".into()),
                });
            }
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let kp = kernel
        .queue_message(root, "ping", no_args(), true)
        .unwrap()
        .unwrap();
    kernel.run_until_quiescent().unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["wobbly:start", "wobbly:ping"]);
    assert!(!kernel.keeper().vat_is_alive(vat).unwrap());
    let fault = kernel.keeper().vat_fault(vat).unwrap().unwrap();
    assert!(fault.contains("worker fault"), "fault was: {fault}");
    // The aborted crank restored the ping; redelivery found the vat gone.
    assert_eq!(
        kernel.keeper().promise_state(kp).unwrap(),
        PromiseState::Rejected {
            data: CapData::new(b"\"no such object\"".to_vec(), vec![]),
        }
    );
    kernel.keeper().audit_ref_counts(&[kp.into()]).unwrap();
}

#[test]
fn a_vat_that_fails_to_start_is_terminated() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("broken", VatOptions::default()).unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let vat_log = log.clone();
    handle.set_behavior(
        vat,
        behavior(move |delivery, _| {
            log_delivery(&vat_log, "broken", delivery);
            if let VatDelivery::StartVat = delivery {
                return Ok(DeliveryStatus::Fail {
                    detail: "cannot boot".to_string(),
                });
            }
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let kp = kernel
        .queue_message(root, "ping", no_args(), true)
        .unwrap()
        .unwrap();
    kernel.run_until_quiescent().unwrap();

    // The ping never reached the vat; the start failure took it down first.
    assert_eq!(*log.lock().unwrap(), vec!["broken:start"]);
    assert!(!kernel.keeper().vat_is_alive(vat).unwrap());
    let fault = kernel.keeper().vat_fault(vat).unwrap().unwrap();
    assert!(fault.contains("start failed"), "fault was: {fault}");
    assert_eq!(
        kernel.keeper().promise_state(kp).unwrap(),
        PromiseState::Rejected {
            data: CapData::new(b"\"no such object\"".to_vec(), vec![]),
        }
    );
    kernel.keeper().audit_ref_counts(&[kp.into()]).unwrap();
}

struct HoldNamed {
    hold: &'static str,
    open: Arc<AtomicBool>,
}

impl AdmissionPolicy for HoldNamed {
    fn admit(&mut self, item: &RunQueueItem) -> Admission {
        if self.open.load(Ordering::SeqCst) {
            return Admission::Admit;
        }
        if let RunQueueItem::Send { message, .. } = item {
            if message.method == self.hold {
                return Admission::Defer;
            }
        }
        Admission::Admit
    }
}

#[test]
fn deferral_holds_the_queue_head_in_place() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("worker", VatOptions::default()).unwrap();
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let vat_log = log.clone();
    handle.set_behavior(
        vat,
        behavior(move |delivery, _| {
            log_delivery(&vat_log, "worker", delivery);
            Ok(DeliveryStatus::Ok)
        }),
    );
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    let open = Arc::new(AtomicBool::new(false));
    kernel.set_admission_policy(Box::new(HoldNamed {
        hold: "b",
        open: open.clone(),
    }));

    for method in ["a", "b", "c"] {
        kernel.queue_message(root, method, no_args(), false).unwrap();
    }

    // `a` is admitted and delivered while `b` blocks the pass. The committed
    // crank must leave `b` at the head, still ahead of `c`.
    kernel.run_until_quiescent().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["worker:start", "worker:a"]);
    assert_eq!(kernel.keeper().acceptance_queue_length().unwrap(), 2);

    open.store(true, Ordering::SeqCst);
    kernel.run_until_quiescent().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["worker:start", "worker:a", "worker:b", "worker:c"]
    );
    kernel.keeper().audit_ref_counts(&[]).unwrap();
}

#[test]
fn state_survives_a_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.sqlite");
    let handle = FactoryHandle::default();
    let pong = || {
        behavior(|delivery, sink| {
            if let VatDelivery::Message { result, .. } = delivery {
                sys(
                    sink,
                    &VatSyscall::Resolve {
                        resolutions: vec![(
                            result.unwrap(),
                            false,
                            VatCapData { body: b"\"pong\"".to_vec(), slots: vec![] },
                        )],
                    },
                );
            }
            Ok(DeliveryStatus::Ok)
        })
    };
    let fulfilled = || PromiseState::Fulfilled {
        data: CapData::new(b"\"pong\"".to_vec(), vec![]),
    };

    let (root, first) = {
        let store = SqliteStore::open(&path).unwrap();
        let mut kernel =
            Controller::new(store, Box::new(handle.clone()), KernelConfig::default()).unwrap();
        let vat = kernel.add_vat("durable", VatOptions::default()).unwrap();
        handle.set_behavior(vat, pong());
        let root = kernel.root_object(vat).unwrap();
        kernel.pin_object(root).unwrap();
        let first = kernel
            .queue_message(root, "ping", no_args(), true)
            .unwrap()
            .unwrap();
        kernel.run_until_quiescent().unwrap();
        assert_eq!(kernel.keeper().promise_state(first).unwrap(), fulfilled());
        kernel.shutdown();
        (root, first)
    };

    // A second kernel over the same store sees the settled promise and
    // replays the vat's transcript into a working worker.
    let store = SqliteStore::open(&path).unwrap();
    let mut kernel =
        Controller::new(store, Box::new(handle.clone()), KernelConfig::default()).unwrap();
    assert_eq!(kernel.keeper().promise_state(first).unwrap(), fulfilled());
    let second = kernel
        .queue_message(root, "ping", no_args(), true)
        .unwrap()
        .unwrap();
    kernel.run_until_quiescent().unwrap();
    assert_eq!(kernel.keeper().promise_state(second).unwrap(), fulfilled());
    kernel
        .keeper()
        .audit_ref_counts(&[first.into(), second.into()])
        .unwrap();
}

#[test]
fn refcount_audit_catches_a_stray_increment() {
    let handle = FactoryHandle::default();
    let mut kernel = kernel(&handle);
    let vat = kernel.add_vat("quiet", VatOptions::default()).unwrap();
    let root = kernel.root_object(vat).unwrap();
    kernel.pin_object(root).unwrap();

    kernel.queue_message(root, "ping", no_args(), false).unwrap();
    kernel.run_until_quiescent().unwrap();
    kernel.keeper().audit_ref_counts(&[]).unwrap();

    kernel.keeper_mut().increment_ref_count(root, "test").unwrap();
    assert!(kernel.keeper().audit_ref_counts(&[]).is_err());
}
