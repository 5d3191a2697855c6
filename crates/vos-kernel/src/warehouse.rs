//! Vat warehouse: worker residency, delivery routing to workers, snapshot
//! heuristics, transcript replay, and upgrade (new incarnation) handling.

use std::collections::HashMap;
use std::path::PathBuf;

use vos_store::DurableStore;
use vos_worker::{CommandOutcome, WorkerCommand, WorkerProcess};

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::ids::VatId;
use crate::keeper::KernelKeeper;
use crate::records::{
    DeliveryStatus, ManagerType, SnapshotRecord, SyscallRecord, TranscriptEntry, VatDelivery,
    VatOptions,
};
use crate::syscall::perform_syscall;

/// Receives a worker's synchronous syscalls during one delivery.
pub trait SyscallSink {
    fn syscall(&mut self, request: &[u8]) -> Result<Vec<u8>, KernelError>;
}

/// One vat's execution engine, however it is hosted.
pub trait VatWorker: Send {
    /// Runs one delivery to completion, feeding syscalls to `syscalls` and
    /// blocking until the worker settles. `Err` means the worker itself
    /// faulted (wire breakage, kill); worker-reported failure is a
    /// [`DeliveryStatus::Fail`] value.
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallSink,
    ) -> Result<DeliveryStatus, KernelError>;

    fn save_snapshot(&mut self, path: &str) -> Result<(), KernelError>;

    fn shutdown(&mut self);
}

/// Starts workers for vats as they become resident.
pub trait WorkerFactory: Send {
    fn start_worker(
        &mut self,
        vat: VatId,
        incarnation: u32,
        manager: ManagerType,
        snapshot: Option<&SnapshotRecord>,
    ) -> Result<Box<dyn VatWorker>, KernelError>;
}

// ---- subprocess-backed workers ---------------------------------------------

/// Worker driven over the supervisor wire protocol.
pub struct ProcessWorker {
    vat: VatId,
    process: WorkerProcess,
}

impl ProcessWorker {
    pub fn new(vat: VatId, process: WorkerProcess) -> Self {
        Self { vat, process }
    }

    fn send(
        &mut self,
        command: &WorkerCommand,
        syscalls: &mut dyn SyscallSink,
    ) -> Result<CommandOutcome, KernelError> {
        let vat = self.vat;
        // The wire handler cannot return errors, so keeper failures park
        // here and override the outcome afterwards.
        let mut sink_error: Option<KernelError> = None;
        let mut handler = |request: &[u8]| -> Vec<u8> {
            if sink_error.is_some() {
                return Vec::new();
            }
            match syscalls.syscall(request) {
                Ok(response) => response,
                Err(err) => {
                    sink_error = Some(err);
                    Vec::new()
                }
            }
        };
        let outcome = self
            .process
            .send(command, &mut handler)
            .map_err(|source| KernelError::Worker { vat, source })?;
        if let Some(err) = sink_error {
            return Err(err);
        }
        Ok(outcome)
    }
}

impl VatWorker for ProcessWorker {
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallSink,
    ) -> Result<DeliveryStatus, KernelError> {
        let payload = serde_cbor::to_vec(delivery)?;
        match self.send(&WorkerCommand::Deliver(payload), syscalls)? {
            CommandOutcome::Ok(_) => Ok(DeliveryStatus::Ok),
            CommandOutcome::Fail(detail) => Ok(DeliveryStatus::Fail {
                detail: String::from_utf8_lossy(&detail).into_owned(),
            }),
        }
    }

    fn save_snapshot(&mut self, path: &str) -> Result<(), KernelError> {
        let mut no_syscalls = NoSyscalls;
        match self.send(&WorkerCommand::WriteSnapshot(path.to_string()), &mut no_syscalls)? {
            CommandOutcome::Ok(_) => Ok(()),
            CommandOutcome::Fail(detail) => Err(KernelError::Worker {
                vat: self.vat,
                source: vos_worker::WorkerError::Protocol(format!(
                    "snapshot write refused: {}",
                    String::from_utf8_lossy(&detail)
                )),
            }),
        }
    }

    fn shutdown(&mut self) {
        self.process.shutdown();
    }
}

struct NoSyscalls;

impl SyscallSink for NoSyscalls {
    fn syscall(&mut self, _request: &[u8]) -> Result<Vec<u8>, KernelError> {
        Ok(Vec::new())
    }
}

/// Spawns one subprocess per vat from a fixed argv.
pub struct ProcessWorkerFactory {
    argv: Vec<String>,
}

impl ProcessWorkerFactory {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn start_worker(
        &mut self,
        vat: VatId,
        incarnation: u32,
        _manager: ManagerType,
        _snapshot: Option<&SnapshotRecord>,
    ) -> Result<Box<dyn VatWorker>, KernelError> {
        let label = format!("{vat}#{incarnation}");
        let process = WorkerProcess::spawn(label, &self.argv)
            .map_err(|source| KernelError::Worker { vat, source })?;
        Ok(Box::new(ProcessWorker::new(vat, process)))
    }
}

// ---- residency -------------------------------------------------------------

struct Resident {
    worker: Box<dyn VatWorker>,
    deliveries_since_snapshot: u64,
    last_used: u64,
}

pub struct VatWarehouse {
    factory: Box<dyn WorkerFactory>,
    resident: HashMap<VatId, Resident>,
    lru_clock: u64,
    snapshot_interval: u64,
    max_resident: usize,
    default_manager: ManagerType,
    snapshot_dir: PathBuf,
}

impl VatWarehouse {
    pub fn new(factory: Box<dyn WorkerFactory>, config: &KernelConfig) -> Self {
        Self {
            factory,
            resident: HashMap::new(),
            lru_clock: 0,
            snapshot_interval: config.snapshot_interval.max(1),
            max_resident: config.max_resident_workers.max(1),
            default_manager: config.default_manager,
            snapshot_dir: config.snapshot_dir.clone(),
        }
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn is_resident(&self, vat: VatId) -> bool {
        self.resident.contains_key(&vat)
    }

    /// Warms the warehouse after a restart: loads registered live vats,
    /// oldest identity first, until the residency limit is full. Everything
    /// else loads lazily on its first delivery.
    pub fn start<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
    ) -> Result<(), KernelError> {
        for vat in keeper.vat_ids()? {
            if self.resident.len() >= self.max_resident {
                break;
            }
            if keeper.vat_is_alive(vat)? {
                self.ensure_vat_loaded(keeper, vat)?;
            }
        }
        Ok(())
    }

    /// Registers a dynamic vat; its worker starts lazily on first delivery.
    pub fn create_dynamic_vat<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
        name: Option<&str>,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        keeper.allocate_vat_id(name, true, options)
    }

    /// Loads the vat's worker if needed, evicting the least-recently-used
    /// idle vat when the residency limit is hit. A fresh worker replays its
    /// transcript span; a brand-new vat gets its start delivery instead.
    pub fn ensure_vat_loaded<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
        vat: VatId,
    ) -> Result<(), KernelError> {
        if let Some(resident) = self.resident.get_mut(&vat) {
            self.lru_clock += 1;
            resident.last_used = self.lru_clock;
            return Ok(());
        }
        while self.resident.len() >= self.max_resident {
            let lru = self
                .resident
                .iter()
                .min_by_key(|(_, r)| r.last_used)
                .map(|(vat, _)| *vat)
                .ok_or_else(|| KernelError::Corrupt("residency limit with no residents".into()))?;
            log::debug!("evicting {lru} to make room for {vat}");
            self.evict(keeper, lru)?;
        }

        let record = keeper.vat_record(vat)?;
        if !record.is_alive {
            return Err(KernelError::VatNotAlive(vat));
        }
        let snapshot = keeper.provide_vat_keeper(vat)?.snapshot_record()?;
        let manager = record.options.manager.unwrap_or(self.default_manager);
        let mut worker = self
            .factory
            .start_worker(vat, record.incarnation, manager, snapshot.as_ref())?;

        let span = keeper.provide_vat_keeper(vat)?.transcript_span()?;
        let fresh = span.is_empty() && snapshot.is_none();
        for (index, entry) in span.iter().enumerate() {
            Self::replay_one(vat, worker.as_mut(), index as u64, entry)?;
        }
        self.lru_clock += 1;
        self.resident.insert(
            vat,
            Resident {
                worker,
                deliveries_since_snapshot: span.len() as u64,
                last_used: self.lru_clock,
            },
        );
        if fresh {
            // First load of a new incarnation with no history: run the start
            // delivery so the worker can wire up its roots. A vat that cannot
            // start does not get residency; nothing was transcribed, so it
            // has never booted.
            let status = self.deliver_to_vat(keeper, vat, VatDelivery::StartVat)?;
            if let DeliveryStatus::Fail { detail } = status {
                self.discard(vat);
                return Err(KernelError::StartFailed { vat, detail });
            }
        }
        Ok(())
    }

    // Replay answers syscalls from the transcript and never touches the
    // keeper, so re-running a span has no kernel-visible effect.
    fn replay_one(
        vat: VatId,
        worker: &mut dyn VatWorker,
        index: u64,
        entry: &TranscriptEntry,
    ) -> Result<(), KernelError> {
        let mut sink = ReplaySink {
            vat,
            delivery: index,
            expected: &entry.syscalls,
            cursor: 0,
            divergence: None,
        };
        let status = worker.deliver(&entry.delivery, &mut sink)?;
        if let Some(divergence) = sink.divergence {
            return Err(divergence);
        }
        if sink.cursor != entry.syscalls.len() {
            return Err(KernelError::ReplayDivergence {
                vat,
                delivery: index,
                detail: format!(
                    "worker made {} of {} recorded syscalls",
                    sink.cursor,
                    entry.syscalls.len()
                ),
            });
        }
        if status != entry.result {
            return Err(KernelError::ReplayDivergence {
                vat,
                delivery: index,
                detail: format!("status {status:?} differs from recorded {:?}", entry.result),
            });
        }
        Ok(())
    }

    /// Routes one translated delivery to the vat's worker and blocks until
    /// it settles. Successful deliveries extend the transcript and count
    /// toward the snapshot heuristic; failed ones are left for the crank
    /// processor to roll back.
    pub fn deliver_to_vat<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
        vat: VatId,
        delivery: VatDelivery,
    ) -> Result<DeliveryStatus, KernelError> {
        self.ensure_vat_loaded(keeper, vat)?;
        let resident = self
            .resident
            .get_mut(&vat)
            .ok_or_else(|| KernelError::Corrupt(format!("{vat} vanished after load")))?;

        let mut sink = LiveSink {
            keeper,
            vat,
            log: Vec::new(),
        };
        let status = match resident.worker.deliver(&delivery, &mut sink) {
            Ok(status) => status,
            Err(err) => {
                // A faulted worker cannot stay resident.
                if matches!(err, KernelError::Worker { .. }) {
                    self.discard(vat);
                }
                return Err(err);
            }
        };
        let syscalls = sink.log;

        if status.is_ok() {
            keeper.provide_vat_keeper(vat)?.append_transcript(&TranscriptEntry {
                delivery,
                syscalls,
                result: status.clone(),
            })?;
            resident.deliveries_since_snapshot += 1;
            self.lru_clock += 1;
            resident.last_used = self.lru_clock;
            self.maybe_save_snapshot(keeper, vat)?;
        }
        Ok(status)
    }

    /// Snapshot heuristic: every `snapshot_interval` deliveries.
    pub fn maybe_save_snapshot<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
        vat: VatId,
    ) -> Result<(), KernelError> {
        let Some(resident) = self.resident.get_mut(&vat) else {
            return Ok(());
        };
        if resident.deliveries_since_snapshot < self.snapshot_interval {
            return Ok(());
        }
        Self::snapshot_now(
            keeper,
            vat,
            resident.worker.as_mut(),
            &self.snapshot_dir,
        )?;
        resident.deliveries_since_snapshot = 0;
        Ok(())
    }

    fn snapshot_now<S: DurableStore>(
        keeper: &mut KernelKeeper<S>,
        vat: VatId,
        worker: &mut dyn VatWorker,
        snapshot_dir: &std::path::Path,
    ) -> Result<(), KernelError> {
        let record = keeper.vat_record(vat)?;
        let position = keeper.provide_vat_keeper(vat)?.transcript_end_position()?;
        let path = snapshot_dir
            .join(format!("{vat}-{}-{position}.snapshot", record.incarnation))
            .to_string_lossy()
            .into_owned();
        worker.save_snapshot(&path)?;
        keeper.provide_vat_keeper(vat)?.save_snapshot_record(&SnapshotRecord {
            path,
            up_to_position: position,
            incarnation: record.incarnation,
        })?;
        log::debug!("{vat} snapshot at position {position}");
        Ok(())
    }

    /// Persists a snapshot, stops the worker and releases residency.
    pub fn evict<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
        vat: VatId,
    ) -> Result<(), KernelError> {
        if let Some(mut resident) = self.resident.remove(&vat) {
            if let Err(err) =
                Self::snapshot_now(keeper, vat, resident.worker.as_mut(), &self.snapshot_dir)
            {
                log::warn!("{vat} eviction snapshot failed: {err}");
            }
            resident.worker.shutdown();
        }
        keeper.evict_vat_keeper(vat);
        Ok(())
    }

    /// Upgrade: discard the current worker and bump the incarnation. The
    /// next load replays from the last snapshot plus transcript tail, or
    /// starts fresh if the vat never snapshotted.
    pub fn begin_new_worker_incarnation<S: DurableStore>(
        &mut self,
        keeper: &mut KernelKeeper<S>,
        vat: VatId,
    ) -> Result<u32, KernelError> {
        self.stop_worker(keeper, vat);
        keeper.bump_incarnation(vat)
    }

    /// Stops the worker without snapshotting (termination, upgrade).
    pub fn stop_worker<S: DurableStore>(&mut self, keeper: &mut KernelKeeper<S>, vat: VatId) {
        self.discard(vat);
        keeper.evict_vat_keeper(vat);
    }

    fn discard(&mut self, vat: VatId) {
        if let Some(mut resident) = self.resident.remove(&vat) {
            resident.worker.shutdown();
        }
    }

    /// Stops every resident worker; kernel shutdown.
    pub fn shutdown(&mut self) {
        for (vat, mut resident) in self.resident.drain() {
            log::debug!("stopping worker for {vat}");
            resident.worker.shutdown();
        }
    }
}

struct LiveSink<'a, S: DurableStore> {
    keeper: &'a mut KernelKeeper<S>,
    vat: VatId,
    log: Vec<SyscallRecord>,
}

impl<'a, S: DurableStore> SyscallSink for LiveSink<'a, S> {
    fn syscall(&mut self, request: &[u8]) -> Result<Vec<u8>, KernelError> {
        let response = perform_syscall(self.keeper, self.vat, request)?;
        self.log.push(SyscallRecord {
            request: request.to_vec(),
            response: response.clone(),
        });
        Ok(response)
    }
}

/// Replay sink: answers from the transcript and flags any divergence from
/// the recorded syscall stream.
struct ReplaySink<'a> {
    vat: VatId,
    delivery: u64,
    expected: &'a [SyscallRecord],
    cursor: usize,
    divergence: Option<KernelError>,
}

impl<'a> ReplaySink<'a> {
    fn diverge(&mut self, detail: String) -> KernelError {
        self.divergence = Some(KernelError::ReplayDivergence {
            vat: self.vat,
            delivery: self.delivery,
            detail: detail.clone(),
        });
        KernelError::ReplayDivergence {
            vat: self.vat,
            delivery: self.delivery,
            detail,
        }
    }
}

impl<'a> SyscallSink for ReplaySink<'a> {
    fn syscall(&mut self, request: &[u8]) -> Result<Vec<u8>, KernelError> {
        let Some(record) = self.expected.get(self.cursor) else {
            let detail = format!("unexpected extra syscall at index {}", self.cursor);
            return Err(self.diverge(detail));
        };
        if record.request != request {
            let detail = format!("syscall {} diverges from transcript", self.cursor);
            return Err(self.diverge(detail));
        }
        self.cursor += 1;
        Ok(record.response.clone())
    }
}
