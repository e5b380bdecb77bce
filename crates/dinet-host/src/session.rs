//! Host session: the host's view of a debug subnet.
//!
//! One task receives every packet from the transport and routes it:
//! register responses go to the channel of the module that sent them,
//! events are reassembled and handed to the event handler or queued for
//! `event_receive`. Each module has its own channel task, so at most one
//! register transaction per module is outstanding while different modules
//! proceed independently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use dinet_core::config::DinetConfig;
use dinet_core::reg::{base, scm, words_to_value};
use dinet_core::wire::max_payload_words;
use dinet_core::{
    DiAddr, ModuleIdentity, Packet, PacketClass, PacketKind, RegKind, RegOp, RegWidth,
    RegisterTransaction,
};
use dinet_fabric::event::{self, Reassembler};

use crate::directory::{new_directory, ModuleDescriptor, ModuleDirectory};
use crate::transport::{Transport, TransportError};

/// The subnet control module always lives here.
pub const SCM_ADDRESS: DiAddr = DiAddr::from_word(0);

/// Register responses a module channel holds before the receiver drops more.
const RESPONSE_QUEUE: usize = 4;
/// Calls waiting for a module channel.
const CALL_QUEUE: usize = 16;

/// Called with every complete event while installed.
pub type EventHandler = Arc<dyn Fn(Packet) + Send + Sync>;

/// Connection state, watched by callers waiting on the session.
type LinkState = Arc<watch::Sender<bool>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host_address: DiAddr,
    pub register_timeout: Duration,
    pub event_queue_depth: usize,
    /// Used until discovery reports the subnet's own limit.
    pub max_packet_len: usize,
    /// Longest event the reassembler accepts, in words.
    pub event_word_limit: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&DinetConfig::default())
    }
}

impl From<&DinetConfig> for SessionConfig {
    fn from(config: &DinetConfig) -> Self {
        Self {
            host_address: config.host.address,
            register_timeout: Duration::from_millis(config.host.register_timeout_ms),
            event_queue_depth: config.host.event_queue_depth.max(1),
            max_packet_len: config.link.max_packet_len,
            event_word_limit: Some(1 << 16),
        }
    }
}

/// Result of the discovery run at connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub modules: usize,
    pub max_packet_len: usize,
    /// Modules that did not answer their identity registers.
    pub undescribed: Vec<DiAddr>,
}

impl DiscoveryReport {
    pub fn is_complete(&self) -> bool {
        self.undescribed.is_empty()
    }
}

// ── Channels ──────────────────────────────────────────────────────────────────

struct RegisterCall {
    txn: RegisterTransaction,
    reply: oneshot::Sender<Result<u128, SessionError>>,
}

struct ModuleChannel {
    calls: mpsc::Sender<RegisterCall>,
    responses: mpsc::Sender<Packet>,
}

type ChannelTable = Arc<DashMap<DiAddr, ModuleChannel>>;

struct Connection {
    channels: ChannelTable,
    shutdown: broadcast::Sender<()>,
    receiver: JoinHandle<()>,
}

/// Serves the register transactions of one module, one at a time.
struct ChannelWorker<T> {
    module: DiAddr,
    host: DiAddr,
    transport: Arc<T>,
    timeout: Duration,
    calls: mpsc::Receiver<RegisterCall>,
    responses: mpsc::Receiver<Packet>,
    shutdown: broadcast::Receiver<()>,
}

impl<T: Transport> ChannelWorker<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::trace!(module = %self.module, "module channel shutting down");
                    return;
                }
                call = self.calls.recv() => {
                    let Some(call) = call else { return };
                    let result = self.execute(call.txn).await;
                    // The caller may have given up; nothing to do then.
                    let _ = call.reply.send(result);
                }
            }
        }
    }

    async fn execute(&mut self, txn: RegisterTransaction) -> Result<u128, SessionError> {
        while let Ok(stale) = self.responses.try_recv() {
            tracing::warn!(module = %self.module, packet = %stale, "discarding stale register response");
        }
        self.transport
            .send(txn.into_request(self.module, self.host))
            .await?;
        let response = match tokio::time::timeout(self.timeout, self.responses.recv()).await {
            Ok(Some(p)) => p,
            Ok(None) => return Err(SessionError::NotConnected),
            Err(_) => {
                tracing::warn!(module = %self.module, %txn, "register access timed out");
                return Err(SessionError::Timeout {
                    module: self.module,
                    address: txn.address,
                });
            }
        };
        let result = check_response(self.module, &txn, &response);
        if let Err(e) = &result {
            tracing::warn!(module = %self.module, %txn, error = %e, "register access failed");
        }
        result
    }
}

/// Match a response against the transaction it answers.
fn check_response(
    module: DiAddr,
    txn: &RegisterTransaction,
    response: &Packet,
) -> Result<u128, SessionError> {
    let invalid = |reason: String| SessionError::InvalidResponse { module, reason };
    let PacketKind::Register(kind) = response.kind else {
        return Err(invalid(format!("{} packet", response.class())));
    };
    match (txn.op, kind) {
        (RegOp::Read, RegKind::ReadSuccess(width)) if width == txn.width => {
            if response.payload.len() != width.words() {
                return Err(invalid(format!(
                    "{} payload words for a {}-bit read",
                    response.payload.len(),
                    width
                )));
            }
            Ok(words_to_value(&response.payload))
        }
        (RegOp::Write(value), RegKind::WriteSuccess) => {
            if !response.payload.is_empty() {
                return Err(invalid("write response carries a payload".to_string()));
            }
            Ok(value)
        }
        (RegOp::Read, RegKind::ReadError) | (RegOp::Write(_), RegKind::WriteError) => {
            Err(SessionError::DeviceError {
                module,
                address: txn.address,
            })
        }
        (_, other) => Err(invalid(format!("unexpected subclass {other:?}"))),
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

struct ReceiveLoop<T> {
    transport: Arc<T>,
    channels: ChannelTable,
    handler: Arc<RwLock<Option<EventHandler>>>,
    events: mpsc::Sender<Packet>,
    reassembler: Reassembler,
    connected: LinkState,
    shutdown: broadcast::Receiver<()>,
}

impl<T: Transport> ReceiveLoop<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("receive loop shutting down");
                    return;
                }
                result = self.transport.recv() => match result {
                    Ok(packet) => self.dispatch(packet).await,
                    Err(e) => {
                        tracing::error!(error = %e, "transport failed; session disconnected");
                        self.connected.send_replace(false);
                        return;
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) {
        tracing::trace!(%packet, "received");
        match packet.class() {
            PacketClass::Register => self.route_response(packet),
            PacketClass::Event => match self.reassembler.push(packet) {
                Ok(Some(event)) => self.deliver(event.into_packet()).await,
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "event reassembly failed"),
            },
            PacketClass::Plain | PacketClass::Reserved => self.deliver(packet).await,
        }
    }

    fn route_response(&self, packet: Packet) {
        let src = packet.src;
        match self.channels.get(&src) {
            Some(channel) => {
                if channel.responses.try_send(packet).is_err() {
                    tracing::warn!(module = %src, "module channel not accepting responses; dropped");
                }
            }
            None => tracing::warn!(module = %src, "unsolicited register response dropped"),
        }
    }

    async fn deliver(&self, packet: Packet) {
        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            handler(packet);
            return;
        }
        match self.events.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(p)) => {
                tracing::warn!(src = %p.src, words = p.payload.len(), "event queue full; event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct HostSession<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    directory: ModuleDirectory,
    connected: LinkState,
    connection: RwLock<Option<Connection>>,
    max_packet_len: AtomicUsize,
    handler: Arc<RwLock<Option<EventHandler>>>,
    events_tx: mpsc::Sender<Packet>,
    events_rx: Mutex<mpsc::Receiver<Packet>>,
}

impl<T: Transport> HostSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth.max(1));
        Self {
            transport: Arc::new(transport),
            max_packet_len: AtomicUsize::new(config.max_packet_len),
            config,
            directory: new_directory(),
            connected: Arc::new(watch::channel(false).0),
            connection: RwLock::new(None),
            handler: Arc::new(RwLock::new(None)),
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn host_address(&self) -> DiAddr {
        self.config.host_address
    }

    pub fn directory(&self) -> &ModuleDirectory {
        &self.directory
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Longest packet the subnet accepts, header included.
    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len.load(Ordering::SeqCst)
    }

    /// Payload words that fit into one EVENT packet.
    pub fn max_event_words(&self) -> usize {
        max_payload_words(self.max_packet_len())
    }

    /// Start the receive loop and discover the subnet.
    ///
    /// Fails if the subnet control module cannot be read. A module that
    /// does not describe itself is entered as unknown and listed in the
    /// report; connect still succeeds.
    pub async fn connect(&self) -> Result<DiscoveryReport, SessionError> {
        {
            let mut slot = self.connection.write().await;
            if slot.is_some() {
                return Err(SessionError::AlreadyConnected);
            }
            let (shutdown, _) = broadcast::channel(1);
            let channels: ChannelTable = Arc::new(DashMap::new());
            let receive_loop = ReceiveLoop {
                transport: self.transport.clone(),
                channels: channels.clone(),
                handler: self.handler.clone(),
                events: self.events_tx.clone(),
                reassembler: match self.config.event_word_limit {
                    Some(limit) => Reassembler::with_word_limit(limit),
                    None => Reassembler::new(),
                },
                connected: self.connected.clone(),
                shutdown: shutdown.subscribe(),
            };
            let receiver = tokio::spawn(receive_loop.run());
            *slot = Some(Connection {
                channels,
                shutdown,
                receiver,
            });
            self.connected.send_replace(true);
        }
        tracing::info!(host = %self.config.host_address, "session connected; discovering subnet");

        match self.discover().await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!(error = %e, "discovery failed");
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Stop all session tasks and forget the directory.
    pub async fn disconnect(&self) {
        let connection = self.connection.write().await.take();
        self.connected.send_replace(false);
        if let Some(connection) = connection {
            let _ = connection.shutdown.send(());
            drop(connection.channels);
            if let Err(e) = connection.receiver.await {
                tracing::warn!(error = %e, "receive loop ended abnormally");
            }
            tracing::info!("session disconnected");
        }
        self.directory.clear();
    }

    async fn discover(&self) -> Result<DiscoveryReport, SessionError> {
        self.directory.clear();
        let read_scm = |reg| self.access(SCM_ADDRESS, RegisterTransaction::read(reg, RegWidth::W16));
        let num_modules = read_scm(scm::NUM_MOD).await? as u16;
        let max_packet_len = read_scm(scm::MAX_PKT_LEN).await? as usize;
        if max_payload_words(max_packet_len) == 0 {
            return Err(SessionError::InvalidResponse {
                module: SCM_ADDRESS,
                reason: format!("maximum packet length {max_packet_len} leaves no payload"),
            });
        }
        self.max_packet_len.store(max_packet_len, Ordering::SeqCst);

        let mut undescribed = Vec::new();
        for raw in 0..num_modules {
            let Ok(address) = DiAddr::new(raw) else {
                tracing::warn!(num_modules, "module count exceeds the address space");
                break;
            };
            let descriptor = match self.describe(address).await {
                Ok(identity) => {
                    tracing::debug!(module = %address, %identity, "module described");
                    ModuleDescriptor {
                        address,
                        identity,
                        described: true,
                    }
                }
                Err(e) => {
                    tracing::warn!(module = %address, error = %e, "module did not describe itself");
                    undescribed.push(address);
                    ModuleDescriptor::unknown(address)
                }
            };
            self.directory.insert(address, descriptor);
        }

        if !undescribed.is_empty() {
            tracing::warn!(missing = undescribed.len(), "discovery incomplete");
        }
        tracing::info!(modules = num_modules, max_packet_len, "discovery complete");
        Ok(DiscoveryReport {
            modules: usize::from(num_modules),
            max_packet_len,
            undescribed,
        })
    }

    async fn describe(&self, address: DiAddr) -> Result<ModuleIdentity, SessionError> {
        let read = |reg| self.access(address, RegisterTransaction::read(reg, RegWidth::W16));
        let vendor = read(base::MOD_VENDOR).await? as u16;
        let module_type = read(base::MOD_TYPE).await? as u16;
        let version = read(base::MOD_VERSION).await? as u16;
        Ok(ModuleIdentity {
            vendor: vendor.into(),
            module_type: module_type.into(),
            version,
        })
    }

    /// Hand a transaction to the module's channel and wait for its result.
    async fn access(&self, dest: DiAddr, txn: RegisterTransaction) -> Result<u128, SessionError> {
        let calls = {
            let guard = self.connection.read().await;
            let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;
            self.channel(connection, dest)
        };
        let (reply, result) = oneshot::channel();
        calls
            .send(RegisterCall { txn, reply })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        result.await.map_err(|_| SessionError::NotConnected)?
    }

    /// The module's call queue, starting its channel task on first use.
    fn channel(&self, connection: &Connection, dest: DiAddr) -> mpsc::Sender<RegisterCall> {
        connection
            .channels
            .entry(dest)
            .or_insert_with(|| {
                let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE);
                let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_QUEUE);
                let worker = ChannelWorker {
                    module: dest,
                    host: self.config.host_address,
                    transport: self.transport.clone(),
                    timeout: self.config.register_timeout,
                    calls: calls_rx,
                    responses: responses_rx,
                    shutdown: connection.shutdown.subscribe(),
                };
                tokio::spawn(worker.run());
                tracing::debug!(module = %dest, "module channel opened");
                ModuleChannel {
                    calls: calls_tx,
                    responses: responses_tx,
                }
            })
            .calls
            .clone()
    }

    fn check_module(&self, dest: DiAddr) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if !self.directory.contains_key(&dest) {
            return Err(SessionError::UnknownModule(dest));
        }
        Ok(())
    }

    // ── Register access ───────────────────────────────────────────────────────

    pub async fn register_read(
        &self,
        dest: DiAddr,
        width: RegWidth,
        address: u16,
    ) -> Result<u128, SessionError> {
        self.check_module(dest)?;
        self.access(dest, RegisterTransaction::read(address, width)).await
    }

    pub async fn register_write(
        &self,
        dest: DiAddr,
        width: RegWidth,
        address: u16,
        value: u128,
    ) -> Result<(), SessionError> {
        if !width.fits(value) {
            return Err(SessionError::BadArgument(format!(
                "value {value:#x} does not fit {width} bits"
            )));
        }
        self.check_module(dest)?;
        self.access(dest, RegisterTransaction::write(address, width, value))
            .await
            .map(|_| ())
    }

    /// Read-modify-write of one bit of a 16-bit register.
    pub async fn register_set_bit(
        &self,
        dest: DiAddr,
        address: u16,
        bit: u8,
        set: bool,
    ) -> Result<(), SessionError> {
        if bit >= 16 {
            return Err(SessionError::BadArgument(format!("bit {bit} is outside a 16-bit register")));
        }
        let current = self.register_read(dest, RegWidth::W16, address).await?;
        let mask = 1u128 << bit;
        let value = if set { current | mask } else { current & !mask };
        if value == current {
            return Ok(());
        }
        self.register_write(dest, RegWidth::W16, address, value).await
    }

    /// Point the module's events at this host.
    pub async fn set_event_destination(&self, dest: DiAddr) -> Result<(), SessionError> {
        let host = u128::from(self.config.host_address.raw());
        self.register_write(dest, RegWidth::W16, base::MOD_EVENT_DEST, host)
            .await
    }

    /// Start or stop the module by toggling its active bit.
    pub async fn set_event_active(&self, dest: DiAddr, active: bool) -> Result<(), SessionError> {
        self.register_set_bit(dest, base::MOD_CS, 0, active).await
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Send one non-register packet as-is.
    pub async fn event_send(&self, packet: Packet) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if packet.class() == PacketClass::Register {
            return Err(SessionError::BadArgument(
                "register packets go through register_read/register_write".to_string(),
            ));
        }
        packet
            .check_len(self.max_packet_len())
            .map_err(|e| SessionError::BadArgument(e.to_string()))?;
        self.transport.send(packet).await?;
        Ok(())
    }

    /// Send `payload` to `dest` as one event, fragmented to fit the subnet.
    /// Returns the number of packets sent.
    pub async fn event_send_payload(&self, dest: DiAddr, payload: &[u16]) -> Result<usize, SessionError> {
        self.check_module(dest)?;
        let packets = event::fragment(dest, self.config.host_address, payload, self.max_event_words())
            .map_err(|e| SessionError::BadArgument(e.to_string()))?;
        let count = packets.len();
        for packet in packets {
            self.transport.send(packet).await?;
        }
        tracing::debug!(module = %dest, words = payload.len(), packets = count, "event sent");
        Ok(count)
    }

    /// Install or remove the event handler. While one is installed it
    /// receives every event and `event_receive` sees none.
    pub async fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.handler.write().await = handler;
    }

    /// Wait for the next complete event.
    ///
    /// Fails with `NotConnected` when the session is not connected, or
    /// once it disconnects while waiting.
    pub async fn event_receive(&self) -> Result<Packet, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let link = self.connected.subscribe();
        let mut events = self.events_rx.lock().await;
        tokio::select! {
            biased;
            event = events.recv() => event.ok_or(SessionError::NotConnected),
            _ = disconnected(link) => Err(SessionError::NotConnected),
        }
    }

    /// Like [`Self::event_receive`], giving up after `wait`.
    pub async fn event_receive_timeout(&self, wait: Duration) -> Result<Option<Packet>, SessionError> {
        match tokio::time::timeout(wait, self.event_receive()).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Resolves once the link state reads disconnected.
async fn disconnected(mut link: watch::Receiver<bool>) {
    while *link.borrow_and_update() {
        if link.changed().await.is_err() {
            return;
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("module {module} did not answer access to register 0x{address:04x} in time")]
    Timeout { module: DiAddr, address: u16 },

    #[error("module {module} refused access to register 0x{address:04x}")]
    DeviceError { module: DiAddr, address: u16 },

    #[error("invalid response from module {module}: {reason}")]
    InvalidResponse { module: DiAddr, reason: String },

    #[error("no module at address {0}")]
    UnknownModule(DiAddr),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("bad argument: {0}")]
    BadArgument(String),
}
