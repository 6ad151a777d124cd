use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use indi_client::{Config as ConnectionConfig, Event};
use indi_protocol::{Message, frame::FrameSplitter};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::driver::{Driver, DriverSpec};

#[derive(Debug, Clone)]
pub struct Config {
    /// `address:port` to listen on.
    pub bind: String,
    /// Size of the buffer each client socket is read into.
    pub read_buffer_size: usize,
    /// Configuration of the connections to the drivers.
    pub connection: ConnectionConfig,
    /// Drivers started by [`Server::start`].
    pub drivers: Vec<DriverSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7624".to_string(),
            read_buffer_size: 32 * 1024,
            connection: ConnectionConfig {
                // The relay only forwards bytes and never repeats a command on its own.
                stall_timeout: None,
                ..ConnectionConfig::default()
            },
            drivers: Vec::new(),
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```
/// use indi_server::{driver::DriverSpec, server::Builder};
///
/// let server = Builder::new()
///     .bind("0.0.0.0:7624")
///     .driver(DriverSpec::remote("192.168.1.20", 7624))
///     .driver(DriverSpec::process("indi_simulator_telescope"))
///     .build();
/// assert!(!server.is_active());
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the `address:port` to listen on.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind = addr.into();
        self
    }

    /// Set the size of the per-client read buffer.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the configuration used for driver connections.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Add a driver to start together with the server.
    pub fn driver(mut self, spec: DriverSpec) -> Self {
        self.config.drivers.push(spec);
        self
    }

    /// Build and return the server
    pub fn build(self) -> Server {
        Server::new(self.config)
    }
}

/// INDI relay: every byte a driver writes goes to every client, every byte a client writes
/// goes to every driver.
///
/// Traffic is forwarded unmodified but in whole top-level elements, so output of two drivers
/// (or input of two clients) never interleaves inside one message. There is no filtering by
/// device: drivers ignore commands for devices they do not own.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    drivers: Mutex<BTreeMap<String, Driver>>,
    clients: Mutex<BTreeMap<u64, mpsc::UnboundedSender<Bytes>>>,
    next_client: AtomicU64,
    session: Mutex<CancellationToken>,
    active: AtomicBool,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server {
            inner: Arc::new(Inner {
                config,
                drivers: Mutex::new(BTreeMap::new()),
                clients: Mutex::new(BTreeMap::new()),
                next_client: AtomicU64::new(0),
                session: Mutex::new(CancellationToken::new()),
                active: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts the configured drivers and the listener. Returns the bound address.
    ///
    /// A driver that cannot be started is logged and skipped.
    pub async fn start(&self) -> io::Result<SocketAddr> {
        for spec in self.inner.config.drivers.clone() {
            if let Err(err) = self.add_driver(spec.clone()).await {
                log::error!("Could not start driver {spec}: {err}");
            }
        }
        let listener = TcpListener::bind(&self.inner.config.bind).await?;
        let addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.inner.session.lock(), token.clone());
        previous.cancel();
        self.inner.active.store(true, Ordering::SeqCst);
        log::info!("Server listening on {addr}");
        tokio::spawn(accept_loop(Arc::clone(&self.inner), listener, token));
        Ok(addr)
    }

    /// Closes the listener and every client socket and stops all drivers.
    ///
    /// Returns without waiting for the background tasks to finish.
    pub fn stop(&self) {
        self.inner.session.lock().cancel();
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.clients.lock().clear();
        let drivers = std::mem::take(&mut *self.inner.drivers.lock());
        for driver in drivers.values() {
            driver.stop();
        }
        log::info!("Server stopped");
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Connects to or launches a driver and starts relaying its traffic. Returns the name
    /// the driver is registered under.
    pub async fn add_driver(&self, spec: DriverSpec) -> io::Result<String> {
        let name = spec.name();
        if self.inner.drivers.lock().contains_key(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("driver {name} is already running"),
            ));
        }
        let (driver, output) = Driver::start(spec, self.inner.config.connection.clone()).await?;
        tokio::spawn(relay_driver_output(
            Arc::clone(&self.inner),
            driver.clone(),
            output,
        ));
        if let Some(replaced) = self.inner.drivers.lock().insert(name.clone(), driver) {
            replaced.stop();
        }
        Ok(name)
    }

    /// Stops a driver and removes it from the relay.
    pub fn remove_driver(&self, name: &str) -> bool {
        let removed = self.inner.drivers.lock().remove(name);
        match removed {
            Some(driver) => {
                driver.stop();
                true
            }
            None => false,
        }
    }

    pub fn driver(&self, name: &str) -> Option<Driver> {
        self.inner.drivers.lock().get(name).cloned()
    }

    pub fn drivers(&self) -> Vec<String> {
        self.inner.drivers.lock().keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Definitions of every property the drivers announced so far.
    pub fn definitions(&self) -> Vec<Message> {
        let drivers: Vec<Driver> = self.inner.drivers.lock().values().cloned().collect();
        drivers
            .iter()
            .flat_map(|driver| {
                driver
                    .connection()
                    .with_registry(|registry| registry.definitions(None, None))
            })
            .collect()
    }
}

impl Inner {
    fn broadcast(&self, frame: Bytes) {
        self.clients
            .lock()
            .retain(|_, client| client.send(frame.clone()).is_ok());
    }

    fn forward_to_drivers(&self, frame: &[u8]) {
        for driver in self.drivers.lock().values() {
            driver.connection().send_raw(frame);
        }
    }

    fn serve_client(self: &Arc<Self>, tcp: TcpStream, token: CancellationToken) {
        if let Err(err) = tcp.set_nodelay(true) {
            log::debug!("Could not disable Nagle's algorithm: {err}");
        }
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.clients.lock().insert(id, sender);
        let (reader, writer) = tcp.into_split();
        tokio::spawn(client_reader(Arc::clone(self), id, reader, token.clone()));
        tokio::spawn(client_writer(Arc::clone(self), id, writer, receiver, token));
    }

    /// Removes a driver whose transport closed, unless it was replaced in the meantime.
    fn forget_driver(&self, driver: &Driver) {
        let mut drivers = self.drivers.lock();
        let current = drivers
            .get(driver.name())
            .is_some_and(|d| d.connection().same_connection(driver.connection()));
        if current {
            drivers.remove(driver.name());
        }
        drop(drivers);
        driver.stop();
    }

    fn drop_client(&self, id: u64) {
        if self.clients.lock().remove(&id).is_some() {
            log::info!("Client {id} disconnected");
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp, peer)) => {
                log::info!("New client connection from {peer}");
                inner.serve_client(tcp, token.child_token());
            }
            Err(err) => log::error!("Connection error: {err}"),
        }
    }
    log::debug!("Listener closed");
}

/// Forwards everything a client writes to every driver, cut at element boundaries.
async fn client_reader<R>(inner: Arc<Inner>, id: u64, mut reader: R, token: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = FrameSplitter::new();
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(1)];
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                log::trace!("Client {id} sent {n} bytes");
                if let Some(frame) = splitter.push(&buf[..n]) {
                    inner.forward_to_drivers(&frame);
                }
            }
            Err(err) => {
                log::warn!("Reading from client {id} failed: {err}");
                break;
            }
        }
    }
    token.cancel();
    inner.drop_client(id);
}

/// Writes everything the drivers send to one client.
async fn client_writer<W>(
    inner: Arc<Inner>,
    id: u64,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(err) = writer.write_all(&frame).await {
            log::warn!("Writing to client {id} failed: {err}");
            break;
        }
    }
    token.cancel();
    inner.drop_client(id);
}

/// Broadcasts a driver's output to all clients, cut at element boundaries.
async fn relay_driver_output(
    inner: Arc<Inner>,
    driver: Driver,
    mut output: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut events = driver.connection().subscribe();
    let mut splitter = FrameSplitter::new();
    let token = driver.token().clone();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            chunk = output.recv() => {
                let Some(chunk) = chunk else {
                    break;
                };
                if let Some(frame) = splitter.push(&chunk) {
                    inner.broadcast(Bytes::from(frame));
                }
            }
            event = events.recv() => match event {
                Some(Event::Disconnected) => {
                    // Chunks read before the transport closed are already queued.
                    while let Ok(chunk) = output.try_recv() {
                        if let Some(frame) = splitter.push(&chunk) {
                            inner.broadcast(Bytes::from(frame));
                        }
                    }
                    if !token.is_cancelled() {
                        log::warn!("Driver {} disconnected", driver.name());
                        inner.forget_driver(&driver);
                    }
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    log::debug!("Stopped relaying driver {}", driver.name());
}
