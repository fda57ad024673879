//! Receive-side file assembler.
//!
//! One assembler per requested file turns an arbitrarily reordered,
//! duplicated chunk stream into strictly ordered sink writes. It tracks
//! the head (next chunk to write), buffers chunks that arrived early,
//! remembers which offsets are known missing, and keeps a rolling MD5
//! over everything it delivered. The client's ACK builder reads resend
//! requests from the shared state while the assembler task runs.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use rftp_core::wire::{Metadata, Payload, ResendEntry};
use rftp_core::{chunk_count, last_chunk_len, ChunkQueue, Shutdown};

use crate::error::TransferError;

/// Byte-stream destination for one received file
pub type FileSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunk slots buffered per file before backpressure kicks in
pub const PAYLOAD_QUEUE_DEPTH: usize = 1024;

/// Everything the ACK builder needs to know about one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendReport {
    /// Whether any chunk of this file has arrived yet
    pub started: bool,
    /// Whether the metadata message has arrived
    pub metadata_received: bool,
    /// Next chunk offset the assembler expects
    pub head: u64,
    /// Resend requests, oldest gap first
    pub entries: Vec<ResendEntry>,
    /// Free payload-queue slots, the receiver's flow-control currency
    pub available_buffer_slots: usize,
}

#[derive(Debug)]
struct AssemblyState {
    head: u64,
    buffer: ChunkQueue,
    gaps: BTreeSet<u64>,
    out_of_order: HashSet<u64>,
    metadata_received: bool,
    size: u64,
    total_chunks: u64,
    checksum: [u8; 16],
    error: Option<TransferError>,
    done: bool,
}

/// Handle to one file's reassembly, shared with the client
pub struct FileAssembler {
    index: u16,
    name: String,
    start_offset: u64,
    state: Arc<Mutex<AssemblyState>>,
    metadata_tx: mpsc::Sender<Metadata>,
    payload_tx: mpsc::Sender<Payload>,
    cancel: Shutdown,
}

/// Final result of one file's reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyOutcome {
    /// Position of the file in the request
    pub index: u16,
    /// Requested file name
    pub name: String,
    /// Announced size, once metadata arrived
    pub size: Option<u64>,
    /// Why the file is not valid, if it is not
    pub error: Option<TransferError>,
}

impl FileAssembler {
    /// Create the assembler handle and its long-running task.
    ///
    /// `done` receives the file index exactly once, when the task ends.
    pub fn new(
        index: u16,
        name: String,
        start_offset: u64,
        sink: FileSink,
        done: mpsc::Sender<u16>,
    ) -> (Self, AssemblerTask) {
        let (metadata_tx, metadata_rx) = mpsc::channel(4);
        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_QUEUE_DEPTH);
        let state = Arc::new(Mutex::new(AssemblyState {
            head: start_offset,
            buffer: ChunkQueue::new(),
            gaps: BTreeSet::new(),
            out_of_order: HashSet::new(),
            metadata_received: false,
            size: 0,
            total_chunks: 0,
            checksum: [0; 16],
            error: None,
            done: false,
        }));
        let cancel = Shutdown::new();

        let task = AssemblerTask {
            index,
            state: Arc::clone(&state),
            metadata_rx,
            payload_rx,
            cancel: cancel.clone(),
            sink,
            hasher: Md5::new(),
            done,
        };
        (
            Self {
                index,
                name,
                start_offset,
                state,
                metadata_tx,
                payload_tx,
                cancel,
            },
            task,
        )
    }

    /// Position of the file in the request.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Queue for the metadata handler.
    #[must_use]
    pub fn metadata_sender(&self) -> mpsc::Sender<Metadata> {
        self.metadata_tx.clone()
    }

    /// Queue for the payload handler.
    #[must_use]
    pub fn payload_sender(&self) -> mpsc::Sender<Payload> {
        self.payload_tx.clone()
    }

    /// Ask the task to stop; buffered chunks are drained to the sink and
    /// the file is recorded as aborted unless it already finished.
    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    /// Whether the task has finished, cleanly or not.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Compute up to `max` gap resend entries plus the metadata request,
    /// in the shape the ACK builder puts on the wire.
    #[must_use]
    pub fn resend_report(&self, max: usize) -> ResendReport {
        let state = self.state.lock().unwrap();
        let mut entries = Vec::new();
        for &offset in &state.gaps {
            if entries.len() >= max {
                break;
            }
            if state.out_of_order.contains(&offset) {
                continue;
            }
            entries.push(ResendEntry {
                file_index: self.index,
                offset,
                length: 1,
            });
        }

        if !state.metadata_received {
            entries.push(ResendEntry {
                file_index: self.index,
                offset: state.head,
                length: 0,
            });
        } else if state.head < state.total_chunks && state.buffer.is_empty() && entries.is_empty()
        {
            // nothing above the head has arrived, so the loss is invisible
            // to the gap set; ask for the head chunk itself
            entries.push(ResendEntry {
                file_index: self.index,
                offset: state.head,
                length: 1,
            });
        }

        ResendReport {
            started: state.head > self.start_offset || !state.buffer.is_empty(),
            metadata_received: state.metadata_received,
            head: state.head,
            entries,
            available_buffer_slots: self.payload_tx.capacity(),
        }
    }

    /// Final per-file result. Meaningful once the task is done.
    #[must_use]
    pub fn outcome(&self) -> AssemblyOutcome {
        let state = self.state.lock().unwrap();
        AssemblyOutcome {
            index: self.index,
            name: self.name.clone(),
            size: state.metadata_received.then_some(state.size),
            error: state.error.clone(),
        }
    }
}

/// The long-running reassembly task behind a [`FileAssembler`]
pub struct AssemblerTask {
    index: u16,
    state: Arc<Mutex<AssemblyState>>,
    metadata_rx: mpsc::Receiver<Metadata>,
    payload_rx: mpsc::Receiver<Payload>,
    cancel: Shutdown,
    sink: FileSink,
    hasher: Md5,
    done: mpsc::Sender<u16>,
}

impl AssemblerTask {
    /// Process metadata, payload, and cancellation until the file is
    /// complete or aborted.
    pub async fn run(mut self) {
        debug!(file = self.index, "assembler started");
        loop {
            tokio::select! {
                () = self.cancel.wait() => {
                    self.drain_on_abort().await;
                    break;
                }
                metadata = self.metadata_rx.recv() => {
                    match metadata {
                        Some(metadata) => {
                            if self.on_metadata(metadata) {
                                break;
                            }
                        }
                        None => {
                            self.drain_on_abort().await;
                            break;
                        }
                    }
                }
                payload = self.payload_rx.recv() => {
                    match payload {
                        Some(payload) => self.on_payload(payload).await,
                        None => {
                            self.drain_on_abort().await;
                            break;
                        }
                    }
                }
            }

            if self.is_complete() {
                self.finish().await;
                break;
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.done = true;
        }
        let _ = self.sink.shutdown().await;
        let _ = self.done.send(self.index).await;
        debug!(file = self.index, "assembler finished");
    }

    /// Returns true when the metadata carried a failure status and the
    /// file is finished.
    fn on_metadata(&mut self, metadata: Metadata) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = TransferError::from_status(metadata.status) {
            warn!(file = self.index, status = %metadata.status, "server rejected file");
            state.error = Some(error);
            return true;
        }
        state.size = metadata.size;
        state.total_chunks = chunk_count(metadata.size);
        state.checksum = metadata.checksum;
        state.metadata_received = true;
        trace!(
            file = self.index,
            size = metadata.size,
            chunks = state.total_chunks,
            "metadata stored"
        );
        false
    }

    async fn on_payload(&mut self, payload: Payload) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            state.absorb(payload)
        };
        self.write_chunks(ready).await;
    }

    /// Write in-order chunks to the sink, hashing as delivered.
    async fn write_chunks(&mut self, chunks: Vec<Payload>) {
        for chunk in chunks {
            trace!(file = self.index, offset = chunk.offset, "writing chunk");
            self.hasher.update(&chunk.data);
            if let Err(error) = self.sink.write_all(&chunk.data).await {
                let mut state = self.state.lock().unwrap();
                if state.error.is_none() {
                    state.error = Some(TransferError::Sink(error.to_string()));
                }
            }
        }
    }

    fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.metadata_received && state.head >= state.total_chunks && state.buffer.is_empty()
    }

    async fn finish(&mut self) {
        let digest: [u8; 16] = self.hasher.clone().finalize().into();
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() && digest != state.checksum {
            warn!(file = self.index, "checksum mismatch");
            state.error = Some(TransferError::ChecksumMismatch);
        }
    }

    /// On cancellation the buffer is flushed even across gaps, matching
    /// the sink contents to everything that was received.
    async fn drain_on_abort(&mut self) {
        let leftover = {
            let mut state = self.state.lock().unwrap();
            let mut chunks = Vec::with_capacity(state.buffer.len());
            while let Some(chunk) = state.buffer.pop() {
                if chunk.offset < state.head {
                    continue;
                }
                if chunk.offset != state.head {
                    warn!(
                        file = self.index,
                        offset = chunk.offset,
                        head = state.head,
                        "gap in aborted file, sink contents will be incomplete"
                    );
                }
                state.head = chunk.offset + 1;
                chunks.push(chunk);
            }
            if state.error.is_none() {
                state.error = Some(TransferError::Aborted);
            }
            chunks
        };
        self.write_chunks(leftover).await;
    }
}

impl AssemblyState {
    /// Take one network chunk and return everything that became
    /// deliverable, in order.
    fn absorb(&mut self, payload: Payload) -> Vec<Payload> {
        let mut ready = Vec::new();

        if payload.offset == self.head {
            self.deliver(payload, &mut ready);
            // drain the buffer while its minimum lines up with the head;
            // anything below the head is a duplicate and is discarded
            while !self.buffer.is_empty() && self.buffer.peek_offset() <= self.head {
                let chunk = self.buffer.pop().expect("buffer is non-empty");
                if chunk.offset == self.head {
                    self.deliver(chunk, &mut ready);
                }
            }
        } else if payload.offset > self.head {
            for missing in self.head..payload.offset {
                if !self.out_of_order.contains(&missing) {
                    self.gaps.insert(missing);
                }
            }
            self.gaps.remove(&payload.offset);
            self.out_of_order.insert(payload.offset);
            self.buffer.push(payload);
        }
        // offsets below the head are duplicates or late arrivals

        ready
    }

    fn deliver(&mut self, mut chunk: Payload, ready: &mut Vec<Payload>) {
        if self.metadata_received && chunk.offset == self.total_chunks.saturating_sub(1) {
            let limit = last_chunk_len(self.size);
            if chunk.data.len() > limit {
                chunk.data.truncate(limit);
            }
        }
        self.gaps.remove(&chunk.offset);
        self.out_of_order.remove(&chunk.offset);
        self.head = chunk.offset + 1;
        ready.push(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rftp_core::wire::FileStatus;
    use rftp_core::CHUNK_SIZE;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::io::AsyncReadExt;

    fn chunk(offset: u64, data: &[u8]) -> Payload {
        Payload {
            ack_number: 0,
            file_index: 0,
            offset,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn metadata_for(content: &[u8]) -> Metadata {
        let digest: [u8; 16] = Md5::digest(content).into();
        Metadata {
            ack_number: 0,
            status: FileStatus::Ok,
            file_index: 0,
            size: content.len() as u64,
            checksum: digest,
        }
    }

    struct Fixture {
        assembler: FileAssembler,
        done: mpsc::Receiver<u16>,
        sink: tokio::io::DuplexStream,
        task: tokio::task::JoinHandle<()>,
    }

    fn fixture() -> Fixture {
        let (done_tx, done) = mpsc::channel(1);
        let (write_half, sink) = duplex(1 << 20);
        let (assembler, task) =
            FileAssembler::new(0, "file".into(), 0, Box::new(write_half), done_tx);
        Fixture {
            assembler,
            done,
            sink,
            task: tokio::spawn(task.run()),
        }
    }

    async fn finish(mut fx: Fixture) -> (AssemblyOutcome, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(5), fx.done.recv())
            .await
            .expect("assembler should finish")
            .unwrap();
        fx.task.await.unwrap();
        let mut content = Vec::new();
        fx.sink.read_to_end(&mut content).await.unwrap();
        (fx.assembler.outcome(), content)
    }

    fn file_content(chunks: usize) -> Vec<u8> {
        (0..chunks)
            .flat_map(|i| vec![i as u8; CHUNK_SIZE])
            .collect()
    }

    #[tokio::test]
    async fn in_order_delivery_completes_with_valid_checksum() {
        let fx = fixture();
        let content = file_content(3);
        fx.assembler
            .metadata_sender()
            .send(metadata_for(&content))
            .await
            .unwrap();
        for (i, part) in content.chunks(CHUNK_SIZE).enumerate() {
            fx.assembler
                .payload_sender()
                .send(chunk(i as u64, part))
                .await
                .unwrap();
        }
        let (outcome, written) = finish(fx).await;
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.size, Some(content.len() as u64));
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn every_permutation_of_four_chunks_delivers_in_order() {
        let content = file_content(4);
        let parts: Vec<&[u8]> = content.chunks(CHUNK_SIZE).collect();
        // all 24 orderings of chunks 0..4
        let mut orders = Vec::new();
        for a in 0..4u64 {
            for b in 0..4u64 {
                for c in 0..4u64 {
                    for d in 0..4u64 {
                        let order = [a, b, c, d];
                        let mut seen: Vec<u64> = order.to_vec();
                        seen.sort_unstable();
                        if seen == [0, 1, 2, 3] {
                            orders.push(order);
                        }
                    }
                }
            }
        }
        assert_eq!(orders.len(), 24);

        for order in orders {
            let fx = fixture();
            fx.assembler
                .metadata_sender()
                .send(metadata_for(&content))
                .await
                .unwrap();
            for &i in &order {
                fx.assembler
                    .payload_sender()
                    .send(chunk(i, parts[i as usize]))
                    .await
                    .unwrap();
            }
            let (outcome, written) = finish(fx).await;
            assert_eq!(outcome.error, None, "order {order:?}");
            assert_eq!(written, content, "order {order:?}");
        }
    }

    #[tokio::test]
    async fn duplicates_are_written_exactly_once() {
        let fx = fixture();
        let content = file_content(3);
        let parts: Vec<&[u8]> = content.chunks(CHUNK_SIZE).collect();
        fx.assembler
            .metadata_sender()
            .send(metadata_for(&content))
            .await
            .unwrap();
        // heavy duplication, including duplicates of buffered chunks
        for i in [2u64, 2, 0, 0, 1, 1, 2, 0] {
            fx.assembler
                .payload_sender()
                .send(chunk(i, parts[i as usize]))
                .await
                .unwrap();
        }
        let (outcome, written) = finish(fx).await;
        assert_eq!(outcome.error, None);
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn last_chunk_is_truncated_to_the_announced_size() {
        let fx = fixture();
        let content = b"0123456789".to_vec();
        fx.assembler
            .metadata_sender()
            .send(metadata_for(&content))
            .await
            .unwrap();
        // sender padded the final chunk; announced size wins
        let mut padded = content.clone();
        padded.extend_from_slice(&[0xAA; 6]);
        fx.assembler
            .payload_sender()
            .send(chunk(0, &padded))
            .await
            .unwrap();
        let (outcome, written) = finish(fx).await;
        assert_eq!(outcome.error, None);
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn status_error_finishes_immediately() {
        let fx = fixture();
        fx.assembler
            .metadata_sender()
            .send(Metadata {
                status: FileStatus::NotExistent,
                ..Metadata::default()
            })
            .await
            .unwrap();
        let (outcome, written) = finish(fx).await;
        assert_eq!(outcome.error, Some(TransferError::NotExistent));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_detected() {
        let fx = fixture();
        let content = file_content(1);
        let mut metadata = metadata_for(&content);
        metadata.checksum[0] ^= 0xFF;
        fx.assembler
            .metadata_sender()
            .send(metadata)
            .await
            .unwrap();
        fx.assembler
            .payload_sender()
            .send(chunk(0, &content))
            .await
            .unwrap();
        let (outcome, _) = finish(fx).await;
        assert_eq!(outcome.error, Some(TransferError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn cancel_drains_and_records_abort() {
        let fx = fixture();
        let content = file_content(3);
        let parts: Vec<&[u8]> = content.chunks(CHUNK_SIZE).collect();
        fx.assembler
            .payload_sender()
            .send(chunk(0, parts[0]))
            .await
            .unwrap();
        fx.assembler
            .payload_sender()
            .send(chunk(2, parts[2]))
            .await
            .unwrap();
        // wait until both chunks were absorbed before cancelling
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let report = fx.assembler.resend_report(8);
                if report.head == 1 && report.entries.iter().any(|entry| entry.length == 1) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        fx.assembler.cancel();
        let (outcome, written) = finish(fx).await;
        assert_eq!(outcome.error, Some(TransferError::Aborted));
        // chunk 0 in order, chunk 2 flushed across the gap
        assert_eq!(written.len(), 2 * CHUNK_SIZE);
    }

    #[tokio::test]
    async fn resend_report_lists_gaps_and_suppresses_buffered_chunks() {
        let fx = fixture();
        let content = file_content(8);
        let parts: Vec<&[u8]> = content.chunks(CHUNK_SIZE).collect();
        fx.assembler
            .payload_sender()
            .send(chunk(3, parts[3]))
            .await
            .unwrap();
        fx.assembler
            .payload_sender()
            .send(chunk(6, parts[6]))
            .await
            .unwrap();
        // wait for the task to absorb both
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if fx.assembler.resend_report(16).started {
                    let report = fx.assembler.resend_report(16);
                    if report.entries.len() >= 5 {
                        break report;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("report should appear");

        let report = fx.assembler.resend_report(16);
        assert!(report.started);
        assert!(!report.metadata_received);
        assert_eq!(report.head, 0);
        let offsets: Vec<(u64, u8)> = report
            .entries
            .iter()
            .map(|entry| (entry.offset, entry.length))
            .collect();
        // gaps 0,1,2,4,5 each once; 3 and 6 are buffered and suppressed;
        // the trailing entry requests the missing metadata
        assert_eq!(
            offsets,
            vec![(0, 1), (1, 1), (2, 1), (4, 1), (5, 1), (0, 0)]
        );

        fx.assembler.cancel();
        finish(fx).await;
    }

    #[tokio::test]
    async fn resend_report_requests_head_when_tail_is_lost() {
        let fx = fixture();
        let content = file_content(2);
        let parts: Vec<&[u8]> = content.chunks(CHUNK_SIZE).collect();
        fx.assembler
            .metadata_sender()
            .send(metadata_for(&content))
            .await
            .unwrap();
        fx.assembler
            .payload_sender()
            .send(chunk(0, parts[0]))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while fx.assembler.resend_report(16).head == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // chunk 1 was lost and nothing beyond it exists to reveal the gap
        let report = fx.assembler.resend_report(16);
        assert_eq!(
            report.entries,
            vec![ResendEntry {
                file_index: 0,
                offset: 1,
                length: 1
            }]
        );

        fx.assembler.cancel();
        finish(fx).await;
    }

    #[tokio::test]
    async fn report_budget_is_respected() {
        let fx = fixture();
        let content = file_content(64);
        let parts: Vec<&[u8]> = content.chunks(CHUNK_SIZE).collect();
        fx.assembler
            .payload_sender()
            .send(chunk(50, parts[50]))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !fx.assembler.resend_report(4).started {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let report = fx.assembler.resend_report(4);
        // four gap entries plus the metadata request
        assert_eq!(report.entries.len(), 5);
        assert!(report.entries[..4].iter().all(|entry| entry.length == 1));
        assert_eq!(report.entries[4].length, 0);

        fx.assembler.cancel();
        finish(fx).await;
    }
}
