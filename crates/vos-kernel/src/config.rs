use crate::records::ManagerType;

/// Kernel-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Deliveries to one vat between worker heap snapshots; snapshots are
    /// also forced on eviction and before an upgrade.
    pub snapshot_interval: u64,
    /// Deliveries to one vat between forced GC sweeps; `None` disables
    /// scheduled reaping.
    pub reap_interval: Option<u64>,
    /// Manager used for vats that do not pick one explicitly.
    pub default_manager: ManagerType,
    /// Maximum concurrently loaded workers; exceeding it evicts the
    /// least-recently-used idle vat.
    pub max_resident_workers: usize,
    /// Argv for subprocess workers, program first.
    pub worker_command: Option<Vec<String>>,
    /// Directory for worker heap snapshots.
    pub snapshot_dir: std::path::PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 200,
            reap_interval: Some(1000),
            default_manager: ManagerType::Local,
            max_resident_workers: 50,
            worker_command: None,
            snapshot_dir: std::env::temp_dir(),
        }
    }
}

impl KernelConfig {
    /// Defaults with environment overrides. Unset or unparseable variables
    /// leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_u64("VOS_SNAPSHOT_INTERVAL") {
            config.snapshot_interval = value.max(1);
        }
        if let Some(value) = env_u64("VOS_REAP_INTERVAL") {
            config.reap_interval = (value > 0).then_some(value);
        }
        if let Some(value) = env_u64("VOS_MAX_RESIDENT_WORKERS") {
            config.max_resident_workers = value.max(1) as usize;
        }
        if let Ok(dir) = std::env::var("VOS_SNAPSHOT_DIR") {
            config.snapshot_dir = dir.into();
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}
