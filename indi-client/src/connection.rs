use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use indi_protocol::{
    BlobMode, Member, Message, Property, PropertyKind, Vector, Version,
    codec::IndiCodec,
    error::{DecodeError, LookupError},
    registry::{Merged, Registry},
};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
    sync::{Notify, broadcast, mpsc},
    time,
};
use tokio_util::{codec::FramedRead, io::InspectReader, sync::CancellationToken};

use crate::event::{Event, Subscription};

/// Which side of the protocol a connection speaks for.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Role {
    /// Talks to a server or driver: commands go out as `new*Vector` and the registry only
    /// changes once the driver confirms.
    #[default]
    Client,
    /// Owns the property values: commands go out as `set*Vector`, the registry is updated
    /// immediately, and `getProperties` is answered with the stored definitions.
    Driver,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    /// Quiet period after which the read buffer is discarded and the last command is sent
    /// again. `None` waits forever.
    pub stall_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    /// Events a subscriber may fall behind before it starts losing the oldest ones.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Client,
            stall_timeout: Some(Duration::from_secs(1)),
            read_buffer_size: 32 * 1024,
            event_capacity: 1024,
        }
    }
}

/// Builder to create a [Connection] and modify configuration options
///
/// # Example
///
/// ```no_run
/// use indi_client::{Builder, Role};
/// use std::time::Duration;
///
/// # async fn run() -> std::io::Result<()> {
/// let connection = Builder::new()
///     .role(Role::Client)
///     .stall_timeout(Some(Duration::from_secs(2)))
///     .connect("127.0.0.1:7624")
///     .await?;
/// connection.query_properties(None, None);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    /// Initial capacity of the inbound accumulation buffer.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build a connection that is not attached to any transport yet.
    pub fn build(self) -> Connection {
        Connection::new(self.config)
    }

    /// Build a connection and open a TCP stream to `addr`.
    pub async fn connect(self, addr: impl ToSocketAddrs) -> io::Result<Connection> {
        let connection = self.build();
        connection.connect(addr).await?;
        Ok(connection)
    }
}

/// One INDI endpoint bound to one byte stream.
///
/// A background reader task decodes the inbound stream, merges every vector into the
/// registry and publishes [`Event`]s; a writer task drains the outbound queue. Handles are
/// cheap to clone and all methods may be called from any thread.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    registry: RwLock<Registry>,
    events: broadcast::Sender<Event>,
    outbound: Mutex<BytesMut>,
    outbound_ready: Notify,
    last_command: Mutex<Option<Bytes>>,
    taps: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    session: Mutex<CancellationToken>,
    connected: AtomicBool,
    received: AtomicU64,
}

impl Connection {
    pub fn new(config: Config) -> Connection {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Connection {
            shared: Arc::new(Shared {
                config,
                registry: RwLock::new(Registry::new()),
                events,
                outbound: Mutex::new(BytesMut::new()),
                outbound_ready: Notify::new(),
                last_command: Mutex::new(None),
                taps: Mutex::new(Vec::new()),
                session: Mutex::new(CancellationToken::new()),
                connected: AtomicBool::new(false),
                received: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Opens a TCP stream and starts the reader and writer tasks. Never retries.
    pub async fn connect(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        if let Ok(peer) = tcp.peer_addr() {
            log::info!("Connected to {peer}");
        }
        let (reader, writer) = tcp.into_split();
        self.attach(reader, writer);
        Ok(())
    }

    /// Starts the reader and writer tasks on an arbitrary pair of byte streams, e.g. the
    /// stdout and stdin of a driver process or an in-memory pipe.
    ///
    /// A previous transport is dropped. Must be called from within a tokio runtime.
    pub fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.shared.session.lock(), token.clone());
        previous.cancel();
        self.shared.connected.store(true, Ordering::SeqCst);
        tokio::spawn(read_loop(Arc::clone(&self.shared), reader, token.clone()));
        tokio::spawn(write_loop(Arc::clone(&self.shared), writer, token));
        // Flush anything queued before the transport existed.
        self.shared.outbound_ready.notify_one();
    }

    /// Like [`Connection::attach`] for a single bidirectional stream.
    pub fn attach_stream<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.attach(reader, writer);
    }

    /// Stops both tasks and clears the outbound queue. Idempotent.
    ///
    /// Does not wait for the tasks: a write that is already in progress may still finish.
    pub fn disconnect(&self) {
        self.shared.session.lock().cancel();
        self.shared.outbound.lock().clear();
        *self.shared.last_command.lock() = None;
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            log::info!("Disconnected");
            self.shared.emit(Event::Disconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.shared.events.subscribe())
    }

    /// Every byte read from the transport from now on, in arrival order and unmodified.
    pub fn raw_output(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.taps.lock().push(sender);
        receiver
    }

    /// Appends an XML fragment to the outbound queue, merging it with anything not sent
    /// yet. The fragment is remembered as the command to repeat when the stream stalls.
    pub fn enqueue_outbound(&self, fragment: impl AsRef<[u8]>) {
        let fragment = fragment.as_ref();
        *self.shared.last_command.lock() = Some(Bytes::copy_from_slice(fragment));
        self.shared.push_outbound(fragment);
    }

    /// Appends bytes to the outbound queue without remembering them as a command.
    pub fn send_raw(&self, bytes: impl AsRef<[u8]>) {
        self.shared.push_outbound(bytes.as_ref());
    }

    pub fn send(&self, message: &Message) {
        self.enqueue_outbound(message.to_xml());
    }

    /// Sends `getProperties`, optionally restricted to one device and one vector.
    pub fn query_properties(&self, device: Option<&str>, name: Option<&str>) {
        self.send(&Message::GetProperties {
            device: device.map(str::to_string),
            name: name.map(str::to_string),
            version: Version::latest(),
        });
    }

    pub fn enable_blob(&self, device: &str, name: Option<&str>, mode: BlobMode) {
        self.send(&Message::EnableBlob {
            device: device.to_string(),
            name: name.map(str::to_string),
            mode,
        });
    }

    /// Registers a vector owned by this side and announces it with a `def*Vector`.
    pub fn define_property(&self, property: impl Into<Property>) {
        let property = property.into();
        self.shared.store(property.clone(), Registry::define_or_merge);
        self.send(&Message::Define(property));
    }

    /// Removes vectors owned by this side and announces it with `delProperty`.
    pub fn delete_property(&self, device: &str, name: Option<&str>) {
        self.shared.delete(device, name);
        self.send(&Message::DelProperty {
            device: device.to_string(),
            name: name.map(str::to_string),
        });
    }

    /// Sets one switch. The other members keep their value, or take the complement in a
    /// `OneOfMany` vector.
    pub fn set_switch(
        &self,
        device: &str,
        vector: &str,
        member: &str,
        value: bool,
    ) -> Result<(), LookupError> {
        let mut update =
            self.shared
                .lookup(device, vector, PropertyKind::Switch, Property::into_switch)?;
        let values = update.values_with(member, value)?;
        for (switch, value) in update.members.iter_mut().zip(values) {
            switch.value = value;
        }
        self.command(update.into());
        Ok(())
    }

    /// Turns the switch at `index` on and every other switch of the vector off.
    pub fn select_switch(
        &self,
        device: &str,
        vector: &str,
        index: usize,
    ) -> Result<(), LookupError> {
        let mut update =
            self.shared
                .lookup(device, vector, PropertyKind::Switch, Property::into_switch)?;
        if index >= update.members.len() {
            return Err(LookupError::UnknownMember {
                vector: vector.to_string(),
                member: index.to_string(),
            });
        }
        for (i, switch) in update.members.iter_mut().enumerate() {
            switch.value = i == index;
        }
        self.command(update.into());
        Ok(())
    }

    pub fn set_number(
        &self,
        device: &str,
        vector: &str,
        member: &str,
        value: f64,
    ) -> Result<(), LookupError> {
        let mut update =
            self.shared
                .lookup(device, vector, PropertyKind::Number, Property::into_number)?;
        set_member(&mut update, member, |number| number.value = value)?;
        self.command(update.into());
        Ok(())
    }

    pub fn set_text(
        &self,
        device: &str,
        vector: &str,
        member: &str,
        value: impl Into<String>,
    ) -> Result<(), LookupError> {
        let mut update =
            self.shared
                .lookup(device, vector, PropertyKind::Text, Property::into_text)?;
        set_member(&mut update, member, |text| text.value = value.into())?;
        self.command(update.into());
        Ok(())
    }

    pub fn set_blob(
        &self,
        device: &str,
        vector: &str,
        member: &str,
        value: Vec<u8>,
    ) -> Result<(), LookupError> {
        let mut update =
            self.shared
                .lookup(device, vector, PropertyKind::Blob, Property::into_blob)?;
        set_member(&mut update, member, |blob| blob.set_value(value))?;
        self.command(update.into());
        Ok(())
    }

    fn command(&self, property: Property) {
        match self.shared.config.role {
            Role::Client => self.send(&Message::New(property)),
            Role::Driver => {
                let device = property.device().to_string();
                let name = property.name().to_string();
                self.shared.store(property, Registry::update);
                if let Some(stored) = self.property(&device, &name) {
                    self.send(&Message::Set(stored));
                }
            }
        }
    }

    /// Snapshot of one vector.
    pub fn property(&self, device: &str, name: &str) -> Option<Property> {
        self.shared.registry.read().find(device, name).cloned()
    }

    /// Runs `f` with read access to the registry. Keep `f` short: the reader task waits
    /// for it before storing the next update.
    pub fn with_registry<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        f(&self.shared.registry.read())
    }

    pub fn devices(&self) -> Vec<String> {
        self.shared.registry.read().devices().map(str::to_string).collect()
    }
}

fn set_member<M: Member>(
    vector: &mut Vector<M>,
    member: &str,
    apply: impl FnOnce(&mut M),
) -> Result<(), LookupError> {
    let name = vector.name.clone();
    let target = vector.member_mut(member).ok_or_else(|| LookupError::UnknownMember {
        vector: name,
        member: member.to_string(),
    })?;
    apply(target);
    Ok(())
}

impl Shared {
    fn emit(&self, event: Event) {
        // Sending only fails when nobody is subscribed.
        let _ = self.events.send(event);
    }

    fn push_outbound(&self, bytes: &[u8]) {
        self.outbound.lock().extend_from_slice(bytes);
        self.outbound_ready.notify_one();
    }

    fn forward_raw(&self, chunk: &[u8]) {
        self.received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let mut taps = self.taps.lock();
        if !taps.is_empty() {
            let chunk = Bytes::copy_from_slice(chunk);
            taps.retain(|tap| tap.send(chunk.clone()).is_ok());
        }
    }

    fn lookup<M>(
        &self,
        device: &str,
        name: &str,
        kind: PropertyKind,
        extract: fn(Property) -> Option<Vector<M>>,
    ) -> Result<Vector<M>, LookupError> {
        let property = self.registry.read().expect(device, name, kind)?.clone();
        let found = property.kind();
        extract(property).ok_or_else(|| LookupError::WrongKind {
            name: name.to_string(),
            expected: kind,
            found,
        })
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Define(property) => self.store(property, Registry::define_or_merge),
            Message::Set(property) | Message::New(property) => {
                self.store(property, Registry::update)
            }
            Message::GetProperties { device, name, .. } => {
                if self.config.role == Role::Driver {
                    self.answer_get_properties(device.as_deref(), name.as_deref());
                } else {
                    log::debug!("Ignoring getProperties on a client connection");
                }
            }
            Message::DelProperty { device, name } => self.delete(&device, name.as_deref()),
            Message::Message(notice) => {
                log::debug!("Message from {:?}: {}", notice.device, notice.text);
                self.emit(Event::NewMessage(notice));
            }
            Message::EnableBlob { device, name, mode } => {
                log::debug!("enableBLOB {} for {device}", mode.as_str());
                self.emit(Event::EnableBlob { device, name, mode });
            }
        }
    }

    fn store(&self, property: Property, merge: fn(&mut Registry, Property) -> Merged) {
        let device = property.device().to_string();
        let name = property.name().to_string();
        let (merged, was_connected, connected, snapshot) = {
            let mut registry = self.registry.write();
            let was_connected = registry.is_connected(&device);
            let merged = merge(&mut registry, property);
            (
                merged,
                was_connected,
                registry.is_connected(&device),
                registry.find(&device, &name).cloned(),
            )
        };
        log::trace!("Stored {device}.{name}, created: {}", merged.created);
        if merged.device_added {
            log::info!("New device {device}");
            self.emit(Event::DeviceAdded {
                device: device.clone(),
            });
        }
        if let Some(snapshot) = snapshot {
            self.emit(Event::from_property(snapshot));
        }
        if was_connected != connected {
            log::info!("Device {device} connected: {connected}");
            self.emit(Event::ConnectedChanged { device, connected });
        }
    }

    fn delete(&self, device: &str, name: Option<&str>) {
        let removed = self.registry.write().remove(device, name);
        log::debug!("Removed {} vectors of {device}", removed.len());
        self.emit(Event::DelProperty {
            device: device.to_string(),
            name: name.map(str::to_string),
        });
    }

    fn answer_get_properties(&self, device: Option<&str>, name: Option<&str>) {
        let definitions = self.registry.read().definitions(device, name);
        log::debug!("Answering getProperties with {} definitions", definitions.len());
        let mut buffer = Vec::new();
        for definition in &definitions {
            if let Err(err) = definition.write_to(&mut buffer) {
                log::error!("Could not encode definition: {err}");
            }
        }
        self.push_outbound(&buffer);
    }

    /// Discards a partial message that stopped arriving and repeats the last command once.
    fn recover_stall<R>(&self, frames: &mut FramedRead<R, IndiCodec>) {
        let partial = frames.read_buffer().len();
        if partial > 0 {
            log::warn!("Stream stalled, discarding {partial} bytes of an incomplete message");
            frames.read_buffer_mut().clear();
            frames.decoder_mut().reset();
        }
        if let Some(command) = self.last_command.lock().take() {
            log::debug!("Stream stalled, re-sending last command");
            self.push_outbound(&command);
        }
    }

    /// Ends the session `token` belongs to unless it was already ended from elsewhere.
    fn end_session(&self, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        token.cancel();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(Event::Disconnected);
        }
    }
}

enum Inbound {
    Message(Message),
    Stalled,
    Closed,
    Failed(DecodeError),
}

async fn next_inbound<S>(frames: &mut S, stall_timeout: Option<Duration>) -> Inbound
where
    S: Stream<Item = Result<Message, DecodeError>> + Unpin,
{
    let next = match stall_timeout {
        Some(limit) => match time::timeout(limit, frames.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Stalled,
        },
        None => frames.next().await,
    };
    match next {
        Some(Ok(message)) => Inbound::Message(message),
        Some(Err(err)) => Inbound::Failed(err),
        None => Inbound::Closed,
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, token: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let tap = Arc::clone(&shared);
    let reader = InspectReader::new(reader, move |chunk: &[u8]| tap.forward_raw(chunk));
    let mut frames =
        FramedRead::with_capacity(reader, IndiCodec::new(), shared.config.read_buffer_size);
    let mut seen = shared.received.load(Ordering::Relaxed);
    loop {
        let inbound = tokio::select! {
            _ = token.cancelled() => break,
            inbound = next_inbound(&mut frames, shared.config.stall_timeout) => inbound,
        };
        match inbound {
            Inbound::Message(message) => {
                log::trace!("Received {message:?}");
                shared.dispatch(message);
                seen = shared.received.load(Ordering::Relaxed);
            }
            Inbound::Stalled => {
                let received = shared.received.load(Ordering::Relaxed);
                if received == seen {
                    shared.recover_stall(&mut frames);
                }
                seen = received;
            }
            Inbound::Closed => {
                log::info!("Peer closed the connection");
                break;
            }
            Inbound::Failed(err) => {
                log::warn!("Reading from peer failed: {err}");
                break;
            }
        }
    }
    shared.end_session(&token);
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, token: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = shared.outbound_ready.notified() => {}
        }
        let pending = shared.outbound.lock().split().freeze();
        if pending.is_empty() {
            continue;
        }
        log::trace!("Writing {} bytes", pending.len());
        let written = async {
            writer.write_all(&pending).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            log::warn!("Writing to peer failed: {err}");
            break;
        }
        shared.emit(Event::Sent(String::from_utf8_lossy(&pending).into_owned()));
    }
    shared.end_session(&token);
}
