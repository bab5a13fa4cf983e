//! The shared buffer pool that fork/zip/merge route their per-item detached
//! continuations through, instead of going to the global allocator on every
//! fan-out step.

use std::sync::{Arc, OnceLock};

use fern_core::{spawn_detached_in, DetachableInto, Receiver};
use fern_mem::{Pool, PoolConfig};

fn shared_pool() -> Arc<Pool> {
    static POOL: OnceLock<Arc<Pool>> = OnceLock::new();
    POOL.get_or_init(|| {
        Arc::new(Pool::new(PoolConfig {
            min_bucket_shift: 6,
            max_bucket_shift: 6,
            capacity_per_bucket: None,
        }))
    })
    .clone()
}

/// Same contract as [`fern_core::spawn_detached`], routed through this
/// crate's shared pool.
pub(crate) fn spawn_detached_pooled<S, R>(sender: S, receiver: R)
where
    S: DetachableInto<R>,
    R: Receiver<Value = S::Value, Error = S::Error> + Send + 'static,
{
    spawn_detached_in(shared_pool(), sender, receiver);
}
