// SPDX-License-Identifier: MIT

//! Streaming file bytes in and out of the chunks a plan names.
//!
//! The writer stages bytes into block-aligned segments and issues one range
//! write per segment, in plan order. A reader created with
//! [`PayloadWriter::follow`] waits until the segment it needs is written.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

use eossio::prelude::{ChunkId, ChunkStore};

use crate::core::allocator::plan::{PlacementEntry, PlacementPlan};
use crate::core::errors::{ChunkIOError, FsError, FsResult};
use crate::core::layout::ChunkLayout;
use crate::core::utils::retry::StoreOps;

/// Blocks moved per backend call.
pub const SEGMENT_BLOCKS: u64 = 64;

type WriteOp = Pin<Box<dyn Future<Output = FsResult<Vec<u8>>> + Send>>;
type ReadOp = Pin<Box<dyn Future<Output = (FsResult<Vec<u8>>, Option<Progress>)> + Send>>;
type Progress = watch::Receiver<u64>;

/// Recovers the `FsError` carried by an adapter's `io::Error`.
pub fn into_fs_error(e: io::Error) -> FsError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<FsError>()) {
        Some(fs) => *fs,
        None => FsError::BackingStore(ChunkIOError::from(e)),
    }
}

/// Position inside a plan, advanced one segment at a time.
#[derive(Debug, Clone)]
struct Cursor {
    entries: Arc<[PlacementEntry]>,
    layout: ChunkLayout,
    entry: usize,
    /// Bytes done inside the current entry.
    within: u64,
    /// Bytes done over the whole file.
    done: u64,
}

impl Cursor {
    fn new(entries: Arc<[PlacementEntry]>, layout: ChunkLayout) -> Self {
        Self {
            entries,
            layout,
            entry: 0,
            within: 0,
            done: 0,
        }
    }

    /// Chunk, chunk offset and length of the next segment; `None` at the end.
    fn peek(&self) -> Option<(ChunkId, u64, usize)> {
        let e = self.entries.get(self.entry)?;
        let segment = self.layout.block_size() as u64 * SEGMENT_BLOCKS;
        let len = (e.payload_bytes - self.within).min(segment);
        Some((e.chunk_id, e.byte_offset(&self.layout) + self.within, len as usize))
    }

    fn advance(&mut self, n: u64) {
        self.within += n;
        self.done += n;
        if let Some(e) = self.entries.get(self.entry) {
            if self.within >= e.payload_bytes {
                self.entry += 1;
                self.within = 0;
            }
        }
    }
}

/// `AsyncWrite` over the chunks of one plan.
///
/// Accepts exactly `byte_size` bytes; more are refused with a zero-length
/// write, fewer fail `shutdown` with `InvalidRequest`.
pub struct PayloadWriter<S: ChunkStore + ?Sized + 'static> {
    ops: StoreOps<S>,
    cursor: Cursor,
    byte_size: u64,
    staged: Vec<u8>,
    op: Option<WriteOp>,
    progress: watch::Sender<u64>,
}

impl<S: ChunkStore + ?Sized + 'static> PayloadWriter<S> {
    pub(crate) fn new(ops: StoreOps<S>, layout: ChunkLayout, plan: &PlacementPlan) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            ops,
            cursor: Cursor::new(plan.entries.clone().into(), layout),
            byte_size: plan.byte_size,
            staged: Vec::new(),
            op: None,
            progress,
        }
    }

    /// Bytes the backend has accepted so far.
    #[inline]
    pub fn written(&self) -> u64 {
        self.cursor.done
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Reader over the same plan that only hands out written bytes.
    pub fn follow(&self) -> PayloadReader<S> {
        let mut reader = PayloadReader::from_cursor(
            self.ops.clone(),
            Cursor::new(self.cursor.entries.clone(), self.cursor.layout),
            self.byte_size,
        );
        reader.progress = Some(self.progress.subscribe());
        reader
    }

    fn start_op(&mut self) {
        let Some((chunk, offset, _)) = self.cursor.peek() else {
            return;
        };
        let ops = self.ops.clone();
        let data = std::mem::take(&mut self.staged);
        self.op = Some(Box::pin(async move {
            ops.write(&chunk, offset, &data).await?;
            Ok::<_, FsError>(data)
        }));
    }

    fn poll_op(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(op) = self.op.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let res = ready!(op.as_mut().poll(cx));
        self.op = None;
        let mut buf = res.map_err(io::Error::other)?;
        self.cursor.advance(buf.len() as u64);
        self.progress.send_replace(self.cursor.done);
        buf.clear();
        self.staged = buf;
        Poll::Ready(Ok(()))
    }
}

impl<S: ChunkStore + ?Sized + 'static> AsyncWrite for PayloadWriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_op(cx))?;

        let Some((_, _, segment)) = this.cursor.peek() else {
            return Poll::Ready(Ok(0));
        };
        let n = (segment - this.staged.len()).min(buf.len());
        this.staged.extend_from_slice(&buf[..n]);
        if this.staged.len() == segment {
            this.start_op();
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_op(cx))?;
        if !this.staged.is_empty() {
            this.start_op();
            ready!(this.poll_op(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        if self.cursor.done != self.byte_size {
            return Poll::Ready(Err(io::Error::other(FsError::InvalidRequest(
                "payload shorter than its plan",
            ))));
        }
        Poll::Ready(Ok(()))
    }
}

/// `AsyncRead` over the chunks of one plan, one segment per backend read.
pub struct PayloadReader<S: ChunkStore + ?Sized + 'static> {
    ops: StoreOps<S>,
    cursor: Cursor,
    byte_size: u64,
    buffered: Vec<u8>,
    pos: usize,
    op: Option<ReadOp>,
    /// Set when following a writer.
    progress: Option<Progress>,
}

impl<S: ChunkStore + ?Sized + 'static> PayloadReader<S> {
    pub(crate) fn new(ops: StoreOps<S>, layout: ChunkLayout, plan: &PlacementPlan) -> Self {
        Self::from_cursor(ops, Cursor::new(plan.entries.clone().into(), layout), plan.byte_size)
    }

    fn from_cursor(ops: StoreOps<S>, cursor: Cursor, byte_size: u64) -> Self {
        Self {
            ops,
            cursor,
            byte_size,
            buffered: Vec::new(),
            pos: 0,
            op: None,
            progress: None,
        }
    }

    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }
}

async fn wait_then_read<S: ChunkStore + ?Sized>(
    ops: StoreOps<S>,
    chunk: ChunkId,
    offset: u64,
    len: usize,
    need: u64,
    mut progress: Option<Progress>,
) -> (FsResult<Vec<u8>>, Option<Progress>) {
    if let Some(rx) = progress.as_mut() {
        let closed = rx.wait_for(|&done| done >= need).await.is_err();
        if closed {
            return (
                Err(FsError::InvalidRequest("writer stopped before these bytes")),
                progress,
            );
        }
    }
    let res = ops.read(&chunk, offset, len).await.map_err(FsError::from);
    (res, progress)
}

impl<S: ChunkStore + ?Sized + 'static> AsyncRead for PayloadReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            if this.pos < this.buffered.len() {
                let n = (this.buffered.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.buffered[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }

            match this.op.as_mut() {
                Some(op) => {
                    let (res, progress) = ready!(op.as_mut().poll(cx));
                    this.op = None;
                    this.progress = progress;
                    let data = res.map_err(io::Error::other)?;
                    this.cursor.advance(data.len() as u64);
                    this.buffered = data;
                    this.pos = 0;
                }
                None => {
                    // EOF
                    let Some((chunk, offset, len)) = this.cursor.peek() else {
                        return Poll::Ready(Ok(()));
                    };
                    let need = this.cursor.done + len as u64;
                    let ops = this.ops.clone();
                    let progress = this.progress.take();
                    this.op = Some(Box::pin(wait_then_read(
                        ops, chunk, offset, len, need, progress,
                    )));
                }
            }
        }
    }
}
