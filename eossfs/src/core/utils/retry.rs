// SPDX-License-Identifier: MIT

//! Timeouts and jittered exponential backoff around backend calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::{RngCore, rng};

use eossio::prelude::{ChunkId, ChunkKind, ChunkStore, ChunkStoreExt};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::core::errors::{ChunkIOError, ChunkIOResult};

/// Runs `fut` under `limit`; an elapsed deadline becomes `ChunkIOError::Timeout`.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> ChunkIOResult<T>
where
    Fut: Future<Output = ChunkIOResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(ChunkIOError::Timeout),
    }
}

/// Delay before retry `attempt` (0-based): `base * 2^attempt` plus up to `base` of jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rng().next_u64() % base_ms;
    Duration::from_millis(exp.saturating_add(jitter))
}

/// Retries an idempotent backend call on transient errors.
///
/// Each attempt runs under `limit`. Non-transient errors are returned at once;
/// the last transient error is returned after `attempts` tries.
pub async fn retry_transient<T, F, Fut>(
    op: &'static str,
    attempts: u32,
    base: Duration,
    limit: Duration,
    mut f: F,
) -> ChunkIOResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChunkIOResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match with_timeout(limit, f()).await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = backoff_delay(base, attempt);
                tracing::warn!(op, attempt, error = %e, ?delay, "transient backend error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Backend handle with the deadline and retry policy applied to every call.
///
/// `create` and `delete` are idempotent from the caller's point of view and are
/// retried; `write` is not.
pub struct StoreOps<S: ?Sized> {
    pub store: Arc<S>,
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl<S: ?Sized> Clone for StoreOps<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            timeout: self.timeout,
            attempts: self.attempts,
            backoff_base: self.backoff_base,
        }
    }
}

impl<S: ChunkStore + ?Sized> StoreOps<S> {
    pub async fn create(&self, kind: ChunkKind) -> ChunkIOResult<ChunkId> {
        retry_transient(
            "create_chunk",
            self.attempts,
            self.backoff_base,
            self.timeout,
            || self.store.create_chunk(kind),
        )
        .await
    }

    pub async fn delete(&self, chunk: ChunkId) -> ChunkIOResult {
        retry_transient(
            "delete_chunk",
            self.attempts,
            self.backoff_base,
            self.timeout,
            || self.store.delete_chunk(&chunk),
        )
        .await
    }

    pub async fn write(&self, chunk: &ChunkId, offset: u64, data: &[u8]) -> ChunkIOResult {
        with_timeout(self.timeout, self.store.write_range(chunk, offset, data)).await
    }

    pub async fn read(&self, chunk: &ChunkId, offset: u64, len: usize) -> ChunkIOResult<Vec<u8>> {
        with_timeout(self.timeout, self.store.read_range(chunk, offset, len)).await
    }

    /// One timeout covers the whole batch.
    pub async fn read_ranges(
        &self,
        reads: &[(ChunkId, u64, usize)],
    ) -> ChunkIOResult<Vec<Vec<u8>>> {
        with_timeout(self.timeout, self.store.read_ranges(reads)).await
    }

    pub async fn write_ranges(&self, writes: &[(ChunkId, u64, &[u8])]) -> ChunkIOResult {
        with_timeout(self.timeout, self.store.write_ranges(writes)).await
    }

    pub async fn read_struct<T>(&self, chunk: &ChunkId, offset: u64) -> ChunkIOResult<T>
    where
        T: FromBytes + KnownLayout + Immutable + Send,
    {
        with_timeout(self.timeout, self.store.read_struct::<T>(chunk, offset)).await
    }

    pub async fn write_struct<T>(&self, chunk: &ChunkId, offset: u64, val: &T) -> ChunkIOResult
    where
        T: IntoBytes + Immutable + Sync,
    {
        with_timeout(self.timeout, self.store.write_struct(chunk, offset, val)).await
    }

    pub async fn list(&self, kind: ChunkKind) -> ChunkIOResult<Vec<ChunkId>> {
        with_timeout(self.timeout, self.store.list_chunks(kind)).await
    }
}
