//! Per-client send session.
//!
//! A session owns four cooperating tasks wired by bounded channels:
//!
//! - the *reader* pulls the requested files from the [`FileSource`],
//!   hashing while it chunks, and queues payload and metadata events
//! - the *writer* drains resends first, then fresh metadata and payload,
//!   gated by the AIMD rate controller; everything sent lands in the
//!   retransmission caches and echoes the latest ACK number
//! - the *rescheduler* consumes ACKs, feeds the rate controller, and
//!   turns resend entries into cache lookups on the resend queue
//! - the *idle cleaner* evicts the session when no ACK arrives within
//!   the deadline
//!
//! The caches are the only state shared across tasks; the close signal
//! is the only cross-task synchronisation besides the work queues.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use rftp_core::wire::{Ack, FileDescriptor, FileStatus, Message, Metadata, Payload, Request};
use rftp_core::{RateController, Shutdown, CHUNK_SIZE};
use rftp_transport::ReplyWriter;

use crate::source::{FileAccessError, FileSlice, FileSource, SliceReader};

/// Payload and resend queue depth
const PAYLOAD_QUEUE_DEPTH: usize = 1 << 20;

/// Inbound ACK queue depth
const ACK_QUEUE_DEPTH: usize = 1024;

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long the session survives without an ACK
    pub idle_timeout: Duration,
    /// Initial congestion window handed to the rate controller
    pub initial_window: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            initial_window: 20_000,
        }
    }
}

type PayloadCache = Arc<Mutex<HashMap<(u16, u64), Payload>>>;
type MetadataCache = Arc<Mutex<HashMap<u16, Metadata>>>;
type PendingResends = Arc<Mutex<HashMap<u16, HashSet<u64>>>>;

/// Handle to one peer's running session
pub struct Session {
    ack_tx: mpsc::Sender<Ack>,
    shutdown: Shutdown,
}

impl Session {
    /// Spawn all session tasks for `request` from `peer`.
    pub(crate) fn spawn(
        peer: SocketAddr,
        request: Request,
        source: Arc<dyn FileSource>,
        reply: ReplyWriter,
        sessions: Arc<DashMap<SocketAddr, Session>>,
        config: SessionConfig,
    ) -> Self {
        let shutdown = Shutdown::new();
        let (metadata_tx, metadata_rx) = mpsc::channel(request.files.len().max(1));
        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_QUEUE_DEPTH);
        let (resend_tx, resend_rx) = mpsc::channel(PAYLOAD_QUEUE_DEPTH);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_DEPTH);

        let payload_cache: PayloadCache = Arc::default();
        let metadata_cache: MetadataCache = Arc::default();
        let pending_resends: PendingResends = Arc::default();
        let last_echo = Arc::new(AtomicU8::new(0));
        let deadline = Arc::new(Mutex::new(Instant::now() + config.idle_timeout));

        let rate = RateController::new(config.initial_window);
        Arc::clone(&rate).start(shutdown.clone());

        tokio::spawn(
            Writer {
                peer,
                reply,
                rate: Arc::clone(&rate),
                shutdown: shutdown.clone(),
                metadata_rx,
                payload_rx,
                resend_rx,
                payload_cache: Arc::clone(&payload_cache),
                metadata_cache: Arc::clone(&metadata_cache),
                pending_resends: Arc::clone(&pending_resends),
                last_echo: Arc::clone(&last_echo),
            }
            .run(),
        );

        tokio::spawn(
            Rescheduler {
                peer,
                ack_rx,
                rate,
                shutdown: shutdown.clone(),
                payload_cache,
                metadata_cache,
                pending_resends,
                metadata_tx: metadata_tx.clone(),
                resend_tx,
                last_echo,
                deadline: Arc::clone(&deadline),
                idle_timeout: config.idle_timeout,
            }
            .run(),
        );

        tokio::spawn(
            Reader {
                peer,
                files: request.files,
                source,
                payload_tx,
                metadata_tx,
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        tokio::spawn(
            IdleCleaner {
                peer,
                deadline,
                shutdown: shutdown.clone(),
                sessions,
            }
            .run(),
        );

        Self { ack_tx, shutdown }
    }

    /// Sender feeding the rescheduler's ACK queue. Taken out of the
    /// session table before awaiting so table access never blocks on a
    /// slow session.
    pub(crate) fn ack_sender(&self) -> mpsc::Sender<Ack> {
        self.ack_tx.clone()
    }

    /// Stop all session tasks. Idempotent.
    pub fn close(&self) {
        self.shutdown.trigger();
    }
}

struct Writer {
    peer: SocketAddr,
    reply: ReplyWriter,
    rate: Arc<RateController>,
    shutdown: Shutdown,
    metadata_rx: mpsc::Receiver<Metadata>,
    payload_rx: mpsc::Receiver<Payload>,
    resend_rx: mpsc::Receiver<Payload>,
    payload_cache: PayloadCache,
    metadata_cache: MetadataCache,
    pending_resends: PendingResends,
    last_echo: Arc<AtomicU8>,
}

impl Writer {
    async fn run(mut self) {
        loop {
            if self.rate.is_available() {
                // resends jump the queue
                if let Ok(payload) = self.resend_rx.try_recv() {
                    self.send_resend(payload).await;
                    continue;
                }
                tokio::select! {
                    biased;
                    () = self.shutdown.wait() => return,
                    Some(payload) = self.resend_rx.recv() => self.send_resend(payload).await,
                    Some(metadata) = self.metadata_rx.recv() => self.send_metadata(metadata).await,
                    Some(payload) = self.payload_rx.recv() => self.send_payload(payload).await,
                }
            } else {
                tokio::select! {
                    () = self.shutdown.wait() => return,
                    () = self.rate.available() => {}
                }
            }
        }
    }

    async fn send_payload(&self, mut payload: Payload) {
        payload.ack_number = self.last_echo.load(Ordering::Relaxed);
        self.payload_cache
            .lock()
            .unwrap()
            .insert((payload.file_index, payload.offset), payload.clone());
        trace!(peer = %self.peer, file = payload.file_index, offset = payload.offset, "sending payload");
        self.transmit(Message::Payload(payload)).await;
    }

    async fn send_resend(&self, mut payload: Payload) {
        payload.ack_number = self.last_echo.load(Ordering::Relaxed);
        if let Some(pending) = self
            .pending_resends
            .lock()
            .unwrap()
            .get_mut(&payload.file_index)
        {
            pending.remove(&payload.offset);
        }
        trace!(peer = %self.peer, file = payload.file_index, offset = payload.offset, "re-sending payload");
        self.transmit(Message::Payload(payload)).await;
    }

    async fn send_metadata(&self, mut metadata: Metadata) {
        metadata.ack_number = self.last_echo.load(Ordering::Relaxed);
        self.metadata_cache
            .lock()
            .unwrap()
            .insert(metadata.file_index, metadata.clone());
        debug!(
            peer = %self.peer,
            file = metadata.file_index,
            status = %metadata.status,
            size = metadata.size,
            "sending metadata"
        );
        self.transmit(Message::Metadata(metadata)).await;
    }

    async fn transmit(&self, message: Message) {
        self.rate.on_send();
        if let Err(error) = self.reply.send(&message).await {
            debug!(peer = %self.peer, %error, "send failed");
        }
    }
}

struct Rescheduler {
    peer: SocketAddr,
    ack_rx: mpsc::Receiver<Ack>,
    rate: Arc<RateController>,
    shutdown: Shutdown,
    payload_cache: PayloadCache,
    metadata_cache: MetadataCache,
    pending_resends: PendingResends,
    metadata_tx: mpsc::Sender<Metadata>,
    resend_tx: mpsc::Sender<Payload>,
    last_echo: Arc<AtomicU8>,
    deadline: Arc<Mutex<Instant>>,
    idle_timeout: Duration,
}

impl Rescheduler {
    async fn run(mut self) {
        loop {
            let ack = tokio::select! {
                () = self.shutdown.wait() => return,
                received = self.ack_rx.recv() => match received {
                    Some(ack) => ack,
                    None => return,
                },
            };
            *self.deadline.lock().unwrap() = Instant::now() + self.idle_timeout;
            self.rate.on_ack(&ack);
            self.last_echo.store(ack.ack_number, Ordering::Relaxed);
            trace!(
                peer = %self.peer,
                ack = ack.ack_number,
                resends = ack.resend_entries.len(),
                "processing ack"
            );
            if self.reschedule(&ack).await.is_err() {
                return;
            }
        }
    }

    /// Turn one ACK into queued resends. Err means the session is gone.
    async fn reschedule(&self, ack: &Ack) -> Result<(), ()> {
        let mut metadata_files = Vec::new();
        let mut requested = HashSet::new();
        if ack.status != 0 && requested.insert(ack.file_index) {
            metadata_files.push(ack.file_index);
        }

        let mut payloads = Vec::new();
        {
            let cache = self.payload_cache.lock().unwrap();
            let mut pending = self.pending_resends.lock().unwrap();

            for entry in &ack.resend_entries {
                if entry.length == 0 {
                    if requested.insert(entry.file_index) {
                        metadata_files.push(entry.file_index);
                    }
                    continue;
                }
                let pending_file = pending.entry(entry.file_index).or_default();
                let end = entry.offset.saturating_add(u64::from(entry.length));
                for offset in entry.offset..end {
                    if pending_file.contains(&offset) {
                        continue;
                    }
                    match cache.get(&(entry.file_index, offset)) {
                        Some(payload) => {
                            pending_file.insert(offset);
                            payloads.push(payload.clone());
                        }
                        None => debug!(
                            peer = %self.peer,
                            file = entry.file_index,
                            offset,
                            "requested chunk is not in the cache"
                        ),
                    }
                }
            }

            if ack.resend_entries.is_empty() && ack.offset > 0 {
                // nothing was reported missing; probe the confirmed
                // offset so a silently lost tail cannot stall the client
                let pending_file = pending.entry(ack.file_index).or_default();
                if !pending_file.contains(&ack.offset) {
                    if let Some(payload) = cache.get(&(ack.file_index, ack.offset)) {
                        pending_file.insert(ack.offset);
                        payloads.push(payload.clone());
                    }
                }
            }
        }

        for payload in payloads {
            tokio::select! {
                () = self.shutdown.wait() => return Err(()),
                sent = self.resend_tx.send(payload) => {
                    if sent.is_err() {
                        return Err(());
                    }
                }
            }
        }

        let cached: Vec<Metadata> = {
            let cache = self.metadata_cache.lock().unwrap();
            metadata_files
                .into_iter()
                .filter_map(|file| cache.get(&file).cloned())
                .collect()
        };
        for metadata in cached {
            debug!(peer = %self.peer, file = metadata.file_index, "re-queueing metadata");
            tokio::select! {
                () = self.shutdown.wait() => return Err(()),
                sent = self.metadata_tx.send(metadata) => {
                    if sent.is_err() {
                        return Err(());
                    }
                }
            }
        }
        Ok(())
    }
}

struct Reader {
    peer: SocketAddr,
    files: Vec<FileDescriptor>,
    source: Arc<dyn FileSource>,
    payload_tx: mpsc::Sender<Payload>,
    metadata_tx: mpsc::Sender<Metadata>,
    shutdown: Shutdown,
}

impl Reader {
    async fn run(self) {
        for (index, file) in self.files.iter().enumerate() {
            if self.shutdown.is_triggered() {
                return;
            }
            let index = index as u16;
            let outcome = match self.source.open(&file.name) {
                Err(error) => {
                    let status = match error {
                        FileAccessError::NotFound => FileStatus::NotExistent,
                        FileAccessError::PermissionDenied | FileAccessError::Io(_) => {
                            FileStatus::AccessDenied
                        }
                    };
                    warn!(peer = %self.peer, name = %file.name, %status, "cannot serve file");
                    self.emit_status(index, status).await
                }
                Ok(slice) if slice.size == 0 => {
                    info!(peer = %self.peer, name = %file.name, "requested file is empty");
                    self.emit_status(index, FileStatus::Empty).await
                }
                Ok(slice) => self.stream_file(index, file.offset, slice).await,
            };
            if outcome.is_err() {
                return;
            }
        }
        debug!(peer = %self.peer, "all requested files queued");
    }

    async fn emit_status(&self, index: u16, status: FileStatus) -> Result<(), ()> {
        self.emit_metadata(Metadata {
            ack_number: 0,
            status,
            file_index: index,
            size: 0,
            checksum: [0; 16],
        })
        .await
    }

    async fn stream_file(&self, index: u16, start_offset: u64, mut slice: FileSlice) -> Result<(), ()> {
        let mut hasher = Md5::new();
        if start_offset > 0 {
            let position = start_offset * CHUNK_SIZE as u64;
            if let Err(error) = slice.reader.seek(SeekFrom::Start(position)).await {
                warn!(peer = %self.peer, file = index, %error, "seek failed");
                return self.emit_status(index, FileStatus::AccessDenied).await;
            }
        }

        let mut offset = start_offset;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let filled = match read_chunk(&mut slice.reader, &mut buf).await {
                Ok(filled) => filled,
                Err(error) => {
                    warn!(peer = %self.peer, file = index, offset, %error, "read failed mid-file");
                    break;
                }
            };
            if filled == 0 {
                break;
            }
            hasher.update(&buf[..filled]);
            let payload = Payload {
                ack_number: 0,
                file_index: index,
                offset,
                data: Bytes::copy_from_slice(&buf[..filled]),
            };
            tokio::select! {
                () = self.shutdown.wait() => return Err(()),
                sent = self.payload_tx.send(payload) => {
                    if sent.is_err() {
                        return Err(());
                    }
                }
            }
            offset += 1;
            if filled < CHUNK_SIZE {
                break;
            }
        }

        self.emit_metadata(Metadata {
            ack_number: 0,
            status: FileStatus::Ok,
            file_index: index,
            size: slice.size,
            checksum: hasher.finalize().into(),
        })
        .await
    }

    async fn emit_metadata(&self, metadata: Metadata) -> Result<(), ()> {
        tokio::select! {
            () = self.shutdown.wait() => Err(()),
            sent = self.metadata_tx.send(metadata) => sent.map_err(|_| ()),
        }
    }
}

/// Fill `buf` from the reader, stopping only at EOF or a full buffer.
async fn read_chunk(
    reader: &mut Box<dyn SliceReader>,
    buf: &mut [u8; CHUNK_SIZE],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

struct IdleCleaner {
    peer: SocketAddr,
    deadline: Arc<Mutex<Instant>>,
    shutdown: Shutdown,
    sessions: Arc<DashMap<SocketAddr, Session>>,
}

impl IdleCleaner {
    async fn run(self) {
        loop {
            let expires = *self.deadline.lock().unwrap();
            if Instant::now() >= expires {
                break;
            }
            tokio::select! {
                () = self.shutdown.wait() => return,
                () = tokio::time::sleep_until(expires) => {}
            }
        }
        info!(peer = %self.peer, "session idle, evicting");
        self.shutdown.trigger();
        self.sessions.remove(&self.peer);
    }
}
