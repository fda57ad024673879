//! Client orchestrator: request fan-out, ACK pacing, completion.
//!
//! One [`Client::request`] call owns the whole exchange: it spawns an
//! assembler per file, retries the initial REQUEST with exponential
//! backoff until the server shows a sign of life, then paces ACKs off
//! the measured round-trip time until every file is done, the server
//! closes, or the connection goes quiet for too long.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rftp_core::wire::{
    Ack, Close, FileDescriptor, Message, MessageType, Metadata, Payload, Request,
};
use rftp_core::Shutdown;
use rftp_transport::{Carrier, HandlerFn, Packet};

use crate::assembler::{FileAssembler, FileSink};
use crate::error::ClientError;

pub use crate::assembler::AssemblyOutcome as FileOutcome;

/// Hard protocol limit on files per request
const MAX_FILES_PER_REQUEST: usize = 65_536;

/// Floor and ceiling for the ACK pacing interval
const ACK_INTERVAL_FLOOR: Duration = Duration::from_millis(20);
const ACK_INTERVAL_CEIL: Duration = Duration::from_secs(1);

/// Base grace period before `3 × rtt` is added for the idle timeout
const IDLE_GRACE: Duration = Duration::from_secs(1);

/// How long the carrier may drain in-flight handlers on teardown
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

/// Tuning knobs for one client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Flow-rate cap advertised in the REQUEST; 0 means uncapped
    pub max_transmission_rate: u32,
    /// First-response attempts before giving up
    pub request_attempts: u32,
    /// Base of the exponential retry backoff (attempt `i` waits
    /// `base · 2^i`, capped by `max_backoff`)
    pub backoff_base: Duration,
    /// Upper bound on a single retry wait
    pub max_backoff: Duration,
    /// How many files may contribute resend entries to one ACK
    pub files_per_ack: usize,
    /// Resend-entry budget per file, sized to keep an ACK in one datagram
    pub entries_per_file: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_transmission_rate: 0,
            request_attempts: 10,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
            files_per_ack: 3,
            entries_per_file: 140,
        }
    }
}

/// One file the caller wants, with the sink its bytes go to
pub struct FileRequest {
    /// File name as the server understands it
    pub name: String,
    /// First chunk to request, usually 0
    pub start_offset: u64,
    /// Where received bytes are written, strictly in order
    pub sink: FileSink,
}

impl FileRequest {
    /// Request `name` from the start, writing into `sink`.
    pub fn new(name: impl Into<String>, sink: FileSink) -> Self {
        Self {
            name: name.into(),
            start_offset: 0,
            sink,
        }
    }
}

/// RFTP client over one connected carrier
pub struct Client {
    carrier: Arc<dyn Carrier>,
    config: ClientConfig,
}

impl Client {
    /// Create a client with default configuration. The carrier must
    /// already be directed at the server.
    pub fn new(carrier: Arc<dyn Carrier>) -> Self {
        Self::with_config(carrier, ClientConfig::default())
    }

    /// Create a client with explicit configuration.
    pub fn with_config(carrier: Arc<dyn Carrier>, config: ClientConfig) -> Self {
        Self { carrier, config }
    }

    /// Request all `files` and drive the transfer to completion.
    ///
    /// Per-file failures (missing file, checksum mismatch, abort) land in
    /// the returned outcomes without affecting sibling files.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TooManyFiles`] for oversized requests,
    /// [`ClientError::Timeout`] when the server never answers the
    /// REQUEST, and carrier errors for local transport failures.
    pub async fn request(&self, files: Vec<FileRequest>) -> Result<Vec<FileOutcome>, ClientError> {
        if files.len() > MAX_FILES_PER_REQUEST {
            return Err(ClientError::TooManyFiles(files.len()));
        }

        let shared = Arc::new(SharedState::new());
        let (done_tx, mut done_rx) = mpsc::channel(files.len().max(1));

        let mut descriptors = Vec::with_capacity(files.len());
        let mut assemblers = Vec::with_capacity(files.len());
        let mut assembler_tasks = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            descriptors.push(FileDescriptor {
                offset: file.start_offset,
                name: file.name.clone(),
            });
            let (assembler, task) = FileAssembler::new(
                index as u16,
                file.name,
                file.start_offset,
                file.sink,
                done_tx.clone(),
            );
            assembler_tasks.push(tokio::spawn(task.run()));
            assemblers.push(assembler);
        }
        drop(done_tx);
        let assemblers = Arc::new(assemblers);

        self.register_handlers(&assemblers, &shared);
        let carrier_run = {
            let carrier = Arc::clone(&self.carrier);
            tokio::spawn(async move { carrier.run().await })
        };

        // first contact: resend the request until anything comes back
        let request = Message::Request(Request {
            max_transmission_rate: self.config.max_transmission_rate,
            files: descriptors,
        });
        let mut sent_at = Instant::now();
        self.carrier.send(&request).await?;

        let mut responded = false;
        for attempt in 1..=self.config.request_attempts {
            let wait = self
                .config
                .backoff_base
                .saturating_mul(1u32 << attempt.min(30))
                .min(self.config.max_backoff);
            tokio::select! {
                () = shared.started.wait() => {
                    responded = true;
                    break;
                }
                () = tokio::time::sleep(wait) => {
                    if attempt < self.config.request_attempts {
                        debug!(attempt, "no response yet, re-sending request");
                        sent_at = Instant::now();
                        self.carrier.send(&request).await?;
                    }
                }
            }
        }
        if !responded {
            // the response may have raced the final backoff window
            responded = shared.started.is_triggered();
        }
        if !responded {
            warn!(
                attempts = self.config.request_attempts,
                "server never answered the request"
            );
            self.teardown(&assemblers, assembler_tasks, carrier_run).await;
            return Err(ClientError::Timeout(self.config.request_attempts));
        }

        shared.set_rtt(sent_at.elapsed());
        info!(rtt = ?shared.rtt(), "server responded, transfer running");

        let ack_stop = Shutdown::new();
        let ack_task = tokio::spawn(ack_loop(
            Arc::clone(&self.carrier),
            Arc::clone(&assemblers),
            Arc::clone(&shared),
            ack_stop.clone(),
            self.config.clone(),
        ));

        // completion watcher
        let mut remaining = assemblers.len();
        while remaining > 0 {
            tokio::select! {
                finished = done_rx.recv() => match finished {
                    Some(_) => remaining -= 1,
                    None => break,
                },
                () = shared.remote_close.wait() => {
                    info!("server closed the connection");
                    break;
                }
                () = shared.timed_out.wait() => {
                    warn!("connection timed out mid-transfer");
                    break;
                }
            }
        }

        ack_stop.trigger();
        let _ = ack_task.await;
        self.teardown(&assemblers, assembler_tasks, carrier_run).await;

        Ok(assemblers.iter().map(FileAssembler::outcome).collect())
    }

    async fn teardown(
        &self,
        assemblers: &Arc<Vec<FileAssembler>>,
        assembler_tasks: Vec<tokio::task::JoinHandle<()>>,
        carrier_run: tokio::task::JoinHandle<Result<(), rftp_transport::CarrierError>>,
    ) {
        for assembler in assemblers.iter() {
            assembler.cancel();
        }
        for task in assembler_tasks {
            let _ = task.await;
        }
        if let Err(error) = self.carrier.close(CLOSE_DRAIN).await {
            debug!(%error, "carrier close");
        }
        let _ = carrier_run.await;
    }

    fn register_handlers(&self, assemblers: &Arc<Vec<FileAssembler>>, shared: &Arc<SharedState>) {
        let metadata_senders: Arc<Vec<mpsc::Sender<Metadata>>> = Arc::new(
            assemblers
                .iter()
                .map(FileAssembler::metadata_sender)
                .collect(),
        );
        let payload_senders: Arc<Vec<mpsc::Sender<Payload>>> = Arc::new(
            assemblers
                .iter()
                .map(FileAssembler::payload_sender)
                .collect(),
        );

        let handler_shared = Arc::clone(shared);
        self.carrier.register(
            MessageType::Metadata,
            Arc::new(HandlerFn(move |_reply, packet: Packet| {
                let senders = Arc::clone(&metadata_senders);
                let shared = Arc::clone(&handler_shared);
                async move {
                    shared.on_inbound(packet.ack_num);
                    match Metadata::decode(&packet.data) {
                        Ok(mut metadata) => {
                            metadata.ack_number = packet.ack_num;
                            match senders.get(metadata.file_index as usize) {
                                Some(tx) => {
                                    let _ = tx.send(metadata).await;
                                }
                                None => {
                                    debug!(file = metadata.file_index, "metadata for unknown file")
                                }
                            }
                        }
                        Err(error) => debug!(%error, "dropping malformed metadata"),
                    }
                }
            })),
        );

        let handler_shared = Arc::clone(shared);
        self.carrier.register(
            MessageType::Payload,
            Arc::new(HandlerFn(move |_reply, packet: Packet| {
                let senders = Arc::clone(&payload_senders);
                let shared = Arc::clone(&handler_shared);
                async move {
                    shared.on_inbound(packet.ack_num);
                    match Payload::decode(&packet.data) {
                        Ok(mut payload) => {
                            payload.ack_number = packet.ack_num;
                            match senders.get(payload.file_index as usize) {
                                Some(tx) => {
                                    let _ = tx.send(payload).await;
                                }
                                None => {
                                    debug!(file = payload.file_index, "payload for unknown file")
                                }
                            }
                        }
                        Err(error) => debug!(%error, "dropping malformed payload"),
                    }
                }
            })),
        );

        let handler_shared = Arc::clone(shared);
        self.carrier.register(
            MessageType::Close,
            Arc::new(HandlerFn(move |_reply, packet: Packet| {
                let shared = Arc::clone(&handler_shared);
                async move {
                    shared.on_inbound(packet.ack_num);
                    match Close::decode(&packet.data) {
                        Ok(close) => debug!(reason = close.reason, "server sent close"),
                        Err(error) => debug!(%error, "malformed close"),
                    }
                    shared.remote_close.trigger();
                }
            })),
        );
    }
}

/// State the packet handlers, the ACK loop, and the watcher share
struct SharedState {
    /// First inbound packet of any kind
    started: Shutdown,
    /// Server sent CLOSE
    remote_close: Shutdown,
    /// ACK loop declared the connection dead
    timed_out: Shutdown,
    last_ping: Mutex<Instant>,
    rtt: Mutex<Duration>,
    /// Send time per ack number, bounded by the wrap size
    send_times: Mutex<[Option<Instant>; 256]>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            started: Shutdown::new(),
            remote_close: Shutdown::new(),
            timed_out: Shutdown::new(),
            last_ping: Mutex::new(Instant::now()),
            rtt: Mutex::new(Duration::from_secs(1)),
            send_times: Mutex::new([None; 256]),
        }
    }

    /// Every inbound packet proves the server is alive; a non-zero echoed
    /// ack number additionally yields an RTT sample.
    fn on_inbound(&self, ack_num: u8) {
        *self.last_ping.lock().unwrap() = Instant::now();
        if ack_num != 0 {
            if let Some(sent) = self.send_times.lock().unwrap()[ack_num as usize] {
                self.set_rtt(sent.elapsed());
            }
        }
        self.started.trigger();
    }

    fn record_send(&self, ack_num: u8) {
        self.send_times.lock().unwrap()[ack_num as usize] = Some(Instant::now());
    }

    fn rtt(&self) -> Duration {
        *self.rtt.lock().unwrap()
    }

    fn set_rtt(&self, rtt: Duration) {
        *self.rtt.lock().unwrap() = rtt;
    }

    fn last_ping(&self) -> Instant {
        *self.last_ping.lock().unwrap()
    }
}

/// Next ACK number: cycle through 1..=254, never 0.
fn next_ack_number(current: u8) -> u8 {
    if current >= 254 {
        1
    } else {
        current + 1
    }
}

async fn ack_loop(
    carrier: Arc<dyn Carrier>,
    assemblers: Arc<Vec<FileAssembler>>,
    shared: Arc<SharedState>,
    stop: Shutdown,
    config: ClientConfig,
) {
    let mut ack_number: u8 = 1;
    loop {
        let rtt = shared.rtt();
        let interval = rtt.clamp(ACK_INTERVAL_FLOOR, ACK_INTERVAL_CEIL);
        tokio::select! {
            () = stop.wait() => return,
            () = tokio::time::sleep(interval) => {}
        }

        if shared.last_ping().elapsed() > IDLE_GRACE + 3 * rtt {
            warn!("no traffic from server within the idle threshold");
            shared.timed_out.trigger();
            return;
        }

        let ack = build_ack(&assemblers, ack_number, &config);
        shared.record_send(ack_number);
        debug!(
            ack = ack_number,
            file = ack.file_index,
            confirmed = ack.offset,
            resends = ack.resend_entries.len(),
            "sending ack"
        );
        if let Err(error) = carrier.send(&Message::Ack(ack)).await {
            debug!(%error, "ack send failed");
            return;
        }
        ack_number = next_ack_number(ack_number);
    }
}

/// Status bit the client sets when the confirmed file has no metadata yet
pub const STATUS_METADATA_MISSING: u8 = 0x01;

fn build_ack(assemblers: &[FileAssembler], ack_number: u8, config: &ClientConfig) -> Ack {
    let mut file_index = 0u16;
    let mut confirmed_offset = 0u64;
    let mut status = 0u8;
    let mut entries = Vec::new();
    let mut contributing_files = 0usize;
    let mut free_slots: u64 = 0;

    for assembler in assemblers {
        if assembler.is_done() {
            continue;
        }
        let report = assembler.resend_report(config.entries_per_file);
        free_slots += report.available_buffer_slots as u64;

        if report.started {
            // highest-index started file wins
            file_index = assembler.index();
            confirmed_offset = report.head;
            status = if report.metadata_received {
                0
            } else {
                STATUS_METADATA_MISSING
            };
        }
        if !report.entries.is_empty() && contributing_files < config.files_per_ack {
            entries.extend(report.entries);
            contributing_files += 1;
        }
    }

    Ack {
        ack_number,
        file_index,
        status,
        max_transmission_rate: u32::try_from(free_slots).unwrap_or(u32::MAX),
        offset: confirmed_offset,
        resend_entries: entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rftp_core::wire::FileStatus;
    use rftp_core::CHUNK_SIZE;
    use rftp_transport::MemoryCarrier;
    use bytes::Bytes;
    use md5::{Digest, Md5};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::timeout;

    fn quick_config() -> ClientConfig {
        ClientConfig {
            backoff_base: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            request_attempts: 3,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn ack_numbers_cycle_skipping_zero() {
        let mut number = 1u8;
        let mut seen = Vec::new();
        for _ in 0..600 {
            seen.push(number);
            number = next_ack_number(number);
        }
        assert!(seen.iter().all(|&n| (1..=254).contains(&n)));
        assert_eq!(seen[0], 1);
        assert_eq!(seen[253], 254);
        assert_eq!(seen[254], 1);
    }

    #[tokio::test]
    async fn request_times_out_without_any_response() {
        let (carrier, mut endpoint) = MemoryCarrier::new();
        let client = Client::with_config(carrier, quick_config());
        let (write_half, _read_half) = duplex(1024);

        let result = client
            .request(vec![FileRequest::new("missing", Box::new(write_half))])
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(3))));

        // the request was sent once per attempt window
        let mut requests = 0;
        while let Ok(message) = endpoint.from_carrier.try_recv() {
            if matches!(message, Message::Request(_)) {
                requests += 1;
            }
        }
        assert!(requests >= 2, "expected retries, saw {requests}");
    }

    #[tokio::test]
    async fn single_file_transfer_end_to_end() {
        let (carrier, mut endpoint) = MemoryCarrier::new();
        let client = Client::with_config(carrier, quick_config());
        let (write_half, mut read_half) = duplex(1 << 16);

        let content: Vec<u8> = (0..CHUNK_SIZE + 10).map(|i| i as u8).collect();
        let checksum: [u8; 16] = Md5::digest(&content).into();

        let transfer = tokio::spawn(async move {
            client
                .request(vec![FileRequest::new("a", Box::new(write_half))])
                .await
        });

        // server side: wait for the request, then stream the file
        let request = timeout(Duration::from_secs(2), endpoint.from_carrier.recv())
            .await
            .unwrap()
            .unwrap();
        match &request {
            Message::Request(request) => {
                assert_eq!(request.files.len(), 1);
                assert_eq!(request.files[0].name, "a");
            }
            other => panic!("expected request, got {other:?}"),
        }

        for (i, part) in content.chunks(CHUNK_SIZE).enumerate() {
            endpoint
                .inject(&Message::Payload(Payload {
                    ack_number: 0,
                    file_index: 0,
                    offset: i as u64,
                    data: Bytes::copy_from_slice(part),
                }))
                .await
                .unwrap();
        }
        endpoint
            .inject(&Message::Metadata(Metadata {
                ack_number: 0,
                status: FileStatus::Ok,
                file_index: 0,
                size: content.len() as u64,
                checksum,
            }))
            .await
            .unwrap();

        let outcomes = timeout(Duration::from_secs(5), transfer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error, None);
        assert_eq!(outcomes[0].size, Some(content.len() as u64));

        let mut received = Vec::new();
        read_half.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, content);
    }

    #[tokio::test]
    async fn status_error_is_reported_per_file() {
        let (carrier, mut endpoint) = MemoryCarrier::new();
        let client = Client::with_config(carrier, quick_config());
        let (write_half, _read_half) = duplex(1024);

        let transfer = tokio::spawn(async move {
            client
                .request(vec![FileRequest::new("nope", Box::new(write_half))])
                .await
        });

        timeout(Duration::from_secs(2), endpoint.from_carrier.recv())
            .await
            .unwrap()
            .unwrap();
        endpoint
            .inject(&Message::Metadata(Metadata {
                status: FileStatus::NotExistent,
                ..Metadata::default()
            }))
            .await
            .unwrap();

        let outcomes = timeout(Duration::from_secs(5), transfer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcomes[0].error, Some(crate::TransferError::NotExistent));
    }

    #[tokio::test]
    async fn acks_report_gaps_after_a_drop() {
        let (carrier, mut endpoint) = MemoryCarrier::new();
        let client = Client::with_config(carrier, quick_config());
        let (write_half, _read_half) = duplex(1 << 16);

        let transfer = tokio::spawn(async move {
            client
                .request(vec![FileRequest::new("a", Box::new(write_half))])
                .await
        });
        timeout(Duration::from_secs(2), endpoint.from_carrier.recv())
            .await
            .unwrap()
            .unwrap();

        // chunk 0 was lost; chunk 1 arrives out of order
        endpoint
            .inject(&Message::Payload(Payload {
                ack_number: 0,
                file_index: 0,
                offset: 1,
                data: Bytes::from(vec![1u8; CHUNK_SIZE]),
            }))
            .await
            .unwrap();

        // some ACK soon after must request offset 0
        let deadline = Instant::now() + Duration::from_secs(3);
        let entry = loop {
            assert!(Instant::now() < deadline, "no resend entry appeared");
            match timeout(Duration::from_secs(2), endpoint.from_carrier.recv())
                .await
                .unwrap()
                .unwrap()
            {
                Message::Ack(ack) if !ack.resend_entries.is_empty() => {
                    break ack.resend_entries[0];
                }
                _ => {}
            }
        };
        assert_eq!(entry.file_index, 0);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.length, 1);

        transfer.abort();
    }
}
