//! Parallel conversion of draw requests into [`CompactInstance`]s.
//!
//! The queue is split into `threads` contiguous chunks of `count / threads + 1`
//! requests. Every chunk is packed by one worker and [`InstancePacker::pack`]
//! returns only after all of them finish, so no GPU command is recorded while
//! packing is in flight. Each output slot depends only on the request at the same
//! index, which makes the result independent of how the work was split.

use lumen_core::profiling::{profile_function, profile_scope};
use rayon::prelude::*;

use crate::error::RenderError;
use crate::instance::{CompactInstance, DrawRequest};

pub struct InstancePacker {
    pool: rayon::ThreadPool,
}

impl InstancePacker {
    /// Build the worker pool. `None` uses the hardware concurrency; the pool always
    /// has at least one thread.
    pub fn new(threads: Option<usize>) -> Result<Self, RenderError> {
        let threads = threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lumen-pack-{i}"))
            .build()
            .map_err(|e| {
                tracing::error!("Failed to build instance packing pool: {}", e);
                RenderError::WorkerPool(e.to_string())
            })?;

        tracing::debug!("Instance packer using {} threads", threads);
        Ok(Self { pool })
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Requests handled per worker for a queue of `count`.
    pub fn chunk_size(&self, count: usize) -> usize {
        count / self.thread_count() + 1
    }

    /// Pack `requests[i]` into `destination[i]` for every request.
    ///
    /// Slots past `requests.len()` are left untouched. A destination shorter than
    /// the queue is refused rather than truncated.
    pub fn pack(&self, requests: &[DrawRequest], destination: &mut [CompactInstance]) -> Result<(), RenderError> {
        profile_function!();
        if destination.len() < requests.len() {
            tracing::error!(
                "Refusing to pack {} instances into a buffer of {}",
                requests.len(),
                destination.len()
            );
            return Err(RenderError::CapacityExceeded {
                requested: requests.len(),
                capacity: destination.len(),
            });
        }
        if requests.is_empty() {
            return Ok(());
        }

        let chunk = self.chunk_size(requests.len());
        let destination = &mut destination[..requests.len()];
        self.pool.install(|| {
            destination
                .par_chunks_mut(chunk)
                .zip(requests.par_chunks(chunk))
                .for_each(|(out, input)| {
                    profile_scope!("pack_chunk");
                    pack_chunk(input, out);
                });
        });
        Ok(())
    }
}

/// Pack one contiguous chunk on the calling thread.
pub fn pack_chunk(requests: &[DrawRequest], out: &mut [CompactInstance]) {
    for (slot, request) in out.iter_mut().zip(requests) {
        *slot = CompactInstance::pack(request);
    }
}
