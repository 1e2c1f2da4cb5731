use crate::error::AspectDbError;
use crate::retention::RetentionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    Full,
    OsBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Strict,
    Permissive,
}

/// Runtime configuration for an aspectdb instance.
#[derive(Debug, Clone)]
pub struct AspectDbConfig {
    pub durability_mode: DurabilityMode,
    pub recovery_mode: RecoveryMode,
    pub max_journal_bytes: u64,
    pub checkpoint_every_commits: u64,
    pub pair_lock_timeout_ms: u64,
    pub max_batch_units: usize,
    pub max_page_size: usize,
    /// Emit change events for suppressed no-op writes as well as real ones.
    pub publish_no_ops: bool,
    pub retention: RetentionConfig,
    pub retention_worker_enabled: bool,
    pub retention_queue_capacity: usize,
}

impl Default for AspectDbConfig {
    fn default() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            max_journal_bytes: 64 * 1024 * 1024,
            checkpoint_every_commits: 10_000,
            pair_lock_timeout_ms: 5_000,
            max_batch_units: 1_000,
            max_page_size: 1_000,
            publish_no_ops: false,
            retention: RetentionConfig::default(),
            retention_worker_enabled: true,
            retention_queue_capacity: 1_024,
        }
    }
}

impl AspectDbConfig {
    pub fn production() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            ..Self::default()
        }
    }

    /// Faster, less paranoid profile: commits flush to the OS but skip fsync,
    /// and recovery keeps whatever readable prefix it finds.
    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            recovery_mode: RecoveryMode::Permissive,
            max_journal_bytes: 8 * 1024 * 1024,
            checkpoint_every_commits: 1_000,
            ..Self::default()
        }
    }

    pub fn strict_recovery(&self) -> bool {
        matches!(self.recovery_mode, RecoveryMode::Strict)
    }

    pub fn with_durability(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_pair_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.pair_lock_timeout_ms = timeout_ms;
        self
    }

    pub fn with_publish_no_ops(mut self, publish_no_ops: bool) -> Self {
        self.publish_no_ops = publish_no_ops;
        self
    }

    pub fn with_retention_worker(mut self, enabled: bool) -> Self {
        self.retention_worker_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), AspectDbError> {
        if self.pair_lock_timeout_ms == 0 {
            return Err(AspectDbError::InvalidConfig {
                message: "pair_lock_timeout_ms must be positive".into(),
            });
        }
        if self.max_batch_units == 0 {
            return Err(AspectDbError::InvalidConfig {
                message: "max_batch_units must be positive".into(),
            });
        }
        if self.max_page_size == 0 {
            return Err(AspectDbError::InvalidConfig {
                message: "max_page_size must be positive".into(),
            });
        }
        if self.max_journal_bytes == 0 {
            return Err(AspectDbError::InvalidConfig {
                message: "max_journal_bytes must be positive".into(),
            });
        }
        if self.checkpoint_every_commits == 0 {
            return Err(AspectDbError::InvalidConfig {
                message: "checkpoint_every_commits must be positive".into(),
            });
        }
        if self.retention_worker_enabled && self.retention_queue_capacity == 0 {
            return Err(AspectDbError::InvalidConfig {
                message: "retention_queue_capacity must be positive when the worker is enabled"
                    .into(),
            });
        }
        Ok(())
    }
}
