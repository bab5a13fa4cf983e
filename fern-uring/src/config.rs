//! Configuration builders for [`crate::context::IoUringContext`] and
//! [`crate::pool::WorkerPool`]. Grounded on
//! `examples/GssMahadevan-gvthread/crates/gvthread-runtime/src/config.rs`'s
//! `SchedulerConfig`: a `Default` computed from the host's CPU count, plus a
//! fluent `with_*` builder.

/// Tunables for one [`crate::context::IoUringContext`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Submission queue entries.
    pub sq_entries: u32,
    /// Completion queue entries; `None` lets the kernel pick its default
    /// (usually `2 * sq_entries`).
    pub cq_entries: Option<u32>,
    /// Maximum batch of completions drained per run-loop iteration.
    pub max_batch: usize,
    /// Use `IORING_SETUP_SINGLE_ISSUER`: only this context's owning thread
    /// will ever submit to it.
    pub single_issuer: bool,
    /// Use `IORING_SETUP_COOP_TASKRUN`.
    pub cooperative_taskrun: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            cq_entries: None,
            max_batch: 256,
            single_issuer: true,
            cooperative_taskrun: true,
        }
    }
}

impl Config {
    pub fn with_sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn with_cq_entries(mut self, n: u32) -> Self {
        self.cq_entries = Some(n);
        self
    }

    pub fn with_max_batch(mut self, n: usize) -> Self {
        self.max_batch = n;
        self
    }

    pub fn with_single_issuer(mut self, enabled: bool) -> Self {
        self.single_issuer = enabled;
        self
    }

    pub fn with_cooperative_taskrun(mut self, enabled: bool) -> Self {
        self.cooperative_taskrun = enabled;
        self
    }
}

/// Tunables for the blocking-syscall [`crate::pool::WorkerPool`] a context
/// falls back to for opcodes (or kernels) that can't do something
/// asynchronously.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// `None` picks `min(8, num_cpus / 2)`, never fewer than 1.
    pub num_workers: Option<usize>,
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            queue_depth: 1024,
        }
    }
}

impl PoolConfig {
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = Some(n);
        self
    }

    pub fn with_queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    pub(crate) fn resolved_num_workers(&self) -> usize {
        self.num_workers.unwrap_or_else(|| {
            let ncpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            (ncpus / 2).clamp(1, 8)
        })
    }
}
