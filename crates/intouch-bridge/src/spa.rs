//! Spa connection driver
//!
//! A [`SpaConnection`] task owns one [`Session`] and the [`MemoryImage`] it
//! keeps in sync. All mutations of both happen on that task, in package
//! arrival order. Consumers get a [`SpaHandle`]: a push feed of
//! [`SpaEvent`]s, read-only access to the image and a [`CommandSink`].

use async_trait::async_trait;
use bytes::Bytes;
use intouch_core::datas::{self, Datas, StatusChange};
use intouch_core::{
    printable, Command, Error as CoreError, MemoryImage, Package, PackageContent, StateChange,
    TranslatedCommand, Translator, Version, Width,
};
use intouch_transport::{resolve, UdpTransport};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::session::{Output, Session, SessionConfig, SessionEvent, SessionState};
use crate::traits::udp_link;
use crate::{BridgeConfig, BridgeError, CommandError, CommandSink, Link, Result};

/// A memory download without progress for this long is requested again
pub const DOWNLOAD_STALL_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// State-change feed item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaEvent {
    /// Session established with the named spa
    Authorized { name: String },
    /// Confirmed change of the memory image
    Changed(StateChange),
    /// Update rejected because it runs past the image
    OutOfBounds { address: u16, len: usize },
    /// Firmware versions reported by the spa
    Version(Version),
    /// A full memory download finished
    DownloadComplete,
    /// Session expired; a new handshake is under way
    Expired,
    /// Handshake failed repeatedly
    Unreachable { attempts: u32 },
    /// Connection shut down
    Closed,
}

struct CommandRequest {
    translated: TranslatedCommand,
    reply: oneshot::Sender<std::result::Result<(), CommandError>>,
}

/// A translated request waiting for its frames to be sent
struct PendingCommand {
    translated: TranslatedCommand,
    reply: oneshot::Sender<std::result::Result<(), CommandError>>,
}

struct Download {
    expected: u8,
    offset: usize,
    deadline: Instant,
}

/// Handle to a running spa connection
pub struct SpaHandle {
    memory: Arc<RwLock<MemoryImage>>,
    translator: Arc<Translator>,
    events: broadcast::Sender<SpaEvent>,
    state: watch::Receiver<SessionState>,
    commands: mpsc::Sender<CommandRequest>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpaHandle {
    /// Subscribe to the state-change feed
    pub fn subscribe(&self) -> broadcast::Receiver<SpaEvent> {
        self.events.subscribe()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Copy of the cached bytes, `None` if not all of them were observed
    pub fn read(&self, address: u16, width: Width) -> Option<Bytes> {
        self.memory
            .read()
            .read(address, width)
            .map(Bytes::copy_from_slice)
    }

    /// Copy of the whole image
    pub fn snapshot(&self) -> MemoryImage {
        self.memory.read().clone()
    }

    /// Stop the connection and wait for its task to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl CommandSink for SpaHandle {
    async fn submit(&self, command: Command) -> std::result::Result<(), CommandError> {
        let translated = self.translator.translate(&command)?;
        if translated.is_empty() {
            debug!("Nothing to send for {}", command);
            return Ok(());
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(CommandRequest { translated, reply })
            .await
            .map_err(|_| CommandError::SendFailed("spa connection stopped".to_string()))?;
        response
            .await
            .map_err(|_| CommandError::SendFailed("spa connection stopped".to_string()))?
    }
}

/// Task state of a spa connection
pub struct SpaConnection {
    session: Session,
    memory: Arc<RwLock<MemoryImage>>,
    translator: Arc<Translator>,
    link: Link,
    events: broadcast::Sender<SpaEvent>,
    state: watch::Sender<SessionState>,
    commands: mpsc::Receiver<CommandRequest>,
    shutdown: watch::Receiver<bool>,
    queue: VecDeque<PendingCommand>,
    next_send: Instant,
    download: Option<Download>,
    next_full_download: Option<Instant>,
    full_state_interval: Duration,
}

impl SpaConnection {
    /// Talk to the spa directly over UDP
    pub async fn connect(config: &BridgeConfig) -> Result<SpaHandle> {
        let target = resolve(&config.spa_target_with_port()).await?;
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let transport = UdpTransport::bind(bind_addr).await?;
        info!("Connecting to spa at {}", target);
        Self::spawn(config, udp_link(&transport, target))
    }

    /// Run a connection over `link`
    pub fn spawn(config: &BridgeConfig, link: Link) -> Result<SpaHandle> {
        let memory_size = config
            .spa_memory_size
            .ok_or_else(|| BridgeError::Config("spa_memory_size is required".to_string()))?;

        let session = Session::new(SessionConfig {
            udp_timeout: config.udp_timeout(),
            handshake_timeout: config.handshake_timeout(),
            ping_interval: config.ping_interval(),
            ..Default::default()
        });
        let memory = Arc::new(RwLock::new(MemoryImage::new(memory_size.into())));
        let translator = Arc::new(Translator::new(
            config.commands.clone(),
            memory_size.into(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(session.state());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = SpaConnection {
            session,
            memory: memory.clone(),
            translator: translator.clone(),
            link,
            events: events.clone(),
            state: state_tx,
            commands: command_rx,
            shutdown: shutdown_rx,
            queue: VecDeque::new(),
            next_send: Instant::now(),
            download: None,
            next_full_download: None,
            full_state_interval: config.full_state_interval(),
        };
        let task = tokio::spawn(connection.run());

        Ok(SpaHandle {
            memory,
            translator,
            events,
            state: state_rx,
            commands: command_tx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run(mut self) {
        let outputs = self.session.start(Instant::now());
        self.apply_outputs(outputs).await;

        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                package = self.link.rx.recv() => match package {
                    Some(package) => self.on_package(package).await,
                    None => {
                        warn!("Spa link closed");
                        break;
                    }
                },
                Some(request) = self.commands.recv() => {
                    self.enqueue(request);
                    self.flush_queue(Instant::now()).await;
                }
                _ = sleep_until(wake) => self.on_timer().await,
            }
        }

        self.close();
    }

    fn next_wake(&self) -> Instant {
        let now = Instant::now();
        [
            self.session.next_deadline(),
            self.download.as_ref().map(|download| download.deadline),
            self.next_full_download,
            (!self.queue.is_empty()).then_some(self.next_send),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(now + IDLE_WAKE)
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let outputs = self.session.poll(now);
        self.apply_outputs(outputs).await;

        if matches!(self.download, Some(ref download) if download.deadline <= now) {
            warn!("Memory download stalled, requesting again");
            self.request_download(now).await;
        }
        if matches!(self.next_full_download, Some(due) if due <= now) && self.download.is_none() {
            self.request_download(now).await;
        }
        self.flush_queue(now).await;
    }

    async fn on_package(&mut self, package: Package) {
        let now = Instant::now();
        if let Package::Authorized {
            destination: Some(ref destination),
            content: PackageContent::Unknown(ref payload),
            ..
        } = package
        {
            if destination != self.session.key() {
                self.observe(destination, payload);
                return;
            }
        }

        let outputs = self.session.handle(package, now);
        self.apply_outputs(outputs).await;
    }

    /// Traffic between the spa and another client, seen through a relay
    fn observe(&mut self, destination: &Bytes, payload: &Bytes) {
        if let Some(Datas::StatusPush(changes)) = Datas::parse(payload) {
            debug!(
                "Observed {} pushed changes for {}",
                changes.len(),
                printable(destination)
            );
            self.apply_push(&changes);
        }
    }

    async fn apply_outputs(&mut self, outputs: Vec<Output>) {
        let now = Instant::now();
        for output in outputs {
            match output {
                Output::Transmit(package) => self.transmit(package).await,
                Output::Event(event) => self.on_session_event(event, now).await,
            }
        }
        self.state.send_if_modified(|state| {
            let changed = *state != self.session.state();
            *state = self.session.state();
            changed
        });
    }

    async fn transmit(&self, package: Package) {
        if let Err(e) = self.link.tx.send(package).await {
            warn!("Failed to send to spa: {}", e);
        }
    }

    async fn transmit_content(&self, payload: Bytes) {
        if let Some(package) = self.session.frame(PackageContent::Unknown(payload)) {
            self.transmit(package).await;
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Authorized { peer, name } => {
                let name = String::from_utf8_lossy(&name).into_owned();
                info!("Authorized with spa {} ({})", name, printable(&peer));
                self.emit(SpaEvent::Authorized { name });
                self.request_download(now).await;
            }
            SessionEvent::Data { payload, .. } => self.on_data(payload, now).await,
            SessionEvent::MalformedHandshake(payload) => {
                warn!("Malformed hello from spa: {}", printable(&payload));
            }
            SessionEvent::Expired { from } => {
                warn!("Spa session expired while {}, reconnecting", from);
                self.download = None;
                self.next_full_download = None;
                self.fail_queue("session expired");
                self.emit(SpaEvent::Expired);
            }
            SessionEvent::Unreachable { attempts } => {
                warn!("Spa did not answer {} handshakes", attempts);
                self.emit(SpaEvent::Unreachable { attempts });
            }
        }
    }

    async fn on_data(&mut self, payload: Bytes, now: Instant) {
        match Datas::parse(&payload) {
            Some(Datas::StatusPush(changes)) => {
                self.apply_push(&changes);
                let ack = Datas::StatusAck {
                    seq: self.translator.next_seq(),
                };
                self.transmit_content(ack.compose()).await;
            }
            Some(Datas::StatusChunk { seq, next, data }) => self.on_chunk(seq, next, data, now),
            Some(Datas::Version(version)) => {
                let name = self
                    .session
                    .device_name()
                    .map(|name| String::from_utf8_lossy(name).into_owned())
                    .unwrap_or_default();
                info!(
                    "Spa {} firmware en {}.{}.{} co {}.{}.{}",
                    name,
                    version.en_major,
                    version.en_minor,
                    version.en_build,
                    version.co_major,
                    version.co_minor,
                    version.co_build
                );
                self.emit(SpaEvent::Version(version));
            }
            Some(other) => debug!("Ignoring {:?}", other),
            None => debug!("Unparsed payload from spa: {}", printable(&payload)),
        }
    }

    fn on_chunk(&mut self, seq: u8, next: u8, data: Bytes, now: Instant) {
        let Some(download) = self.download.as_mut() else {
            debug!("Status chunk {} without a download in progress", seq);
            return;
        };
        if seq != download.expected {
            debug!("Status chunk {} while expecting {}", seq, download.expected);
            return;
        }

        let offset = download.offset;
        download.offset += data.len();
        download.expected = next;
        download.deadline = now + DOWNLOAD_STALL_TIMEOUT;
        let done = download.offset >= self.memory.read().size();

        match u16::try_from(offset) {
            Ok(address) => self.apply(address, &data),
            Err(_) => warn!("Status chunk at offset {} outside memory", offset),
        }

        if done {
            self.download = None;
            self.next_full_download = Some(now + self.full_state_interval);
            debug!("Memory download complete");
            self.emit(SpaEvent::DownloadComplete);
        }
    }

    fn apply_push(&mut self, changes: &[StatusChange]) {
        for change in changes {
            self.apply(change.pos, &change.data);
        }
    }

    fn apply(&mut self, address: u16, data: &[u8]) {
        let result = self.memory.write().apply(address, data);
        match result {
            Ok(changes) => {
                for change in changes {
                    self.emit(SpaEvent::Changed(change));
                }
            }
            Err(CoreError::OutOfBounds { address, len, size }) => {
                warn!(
                    "Ignoring update of {} bytes at {:#06x}: memory is {} bytes",
                    len, address, size
                );
                self.emit(SpaEvent::OutOfBounds { address, len });
            }
            Err(e) => warn!("Ignoring update at {:#06x}: {}", address, e),
        }
    }

    async fn request_download(&mut self, now: Instant) {
        if !self.session.is_authorized() {
            return;
        }
        let length = self.memory.read().size() as u16;
        let request = Datas::StatusRequest {
            seq: self.translator.next_seq(),
            start: 0,
            length,
        };
        self.download = Some(Download {
            expected: 0,
            offset: 0,
            deadline: now + DOWNLOAD_STALL_TIMEOUT,
        });
        self.next_full_download = None;
        self.transmit_content(request.compose()).await;
    }

    fn enqueue(&mut self, request: CommandRequest) {
        let CommandRequest { translated, reply } = request;
        if !self.session.is_authorized() {
            let _ = reply.send(Err(CommandError::SendFailed(format!(
                "session is {}",
                self.session.state()
            ))));
            return;
        }
        self.queue.push_back(PendingCommand { translated, reply });
    }

    /// Send every queued frame that is due
    async fn flush_queue(&mut self, now: Instant) {
        while now >= self.next_send {
            let Some(pending) = self.queue.front_mut() else {
                return;
            };
            let payload = self.translator.next_payload(&mut pending.translated);
            let spacing = pending.translated.spacing;
            let finished = pending.translated.is_empty();

            let result = match payload {
                None => Ok(()),
                Some(payload) => {
                    let Some(package) = self.session.frame(PackageContent::Unknown(payload))
                    else {
                        self.fail_queue("session not authorized");
                        return;
                    };
                    match self.link.tx.send(package).await {
                        Ok(()) => {
                            self.next_send = now + spacing;
                            Ok(())
                        }
                        Err(e) => Err(CommandError::SendFailed(e.to_string())),
                    }
                }
            };

            if finished || result.is_err() {
                if let Some(pending) = self.queue.pop_front() {
                    let _ = pending.reply.send(result);
                }
            }
        }
    }

    fn fail_queue(&mut self, reason: &str) {
        for pending in self.queue.drain(..) {
            let _ = pending
                .reply
                .send(Err(CommandError::SendFailed(reason.to_string())));
        }
    }

    fn emit(&self, event: SpaEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn close(&mut self) {
        self.session.close();
        self.download = None;
        self.fail_queue("shutting down");
        self.state.send_replace(SessionState::Closed);
        self.emit(SpaEvent::Closed);
        info!("Spa connection closed");
    }
}

/// True if `payload` is a status push
pub fn is_status_push(payload: &[u8]) -> bool {
    payload.starts_with(datas::STATP)
}
