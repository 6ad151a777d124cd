//! Shared fixtures for the workspace integration tests.
use std::time::Duration;

use indi_client::{Config, Connection, Event, Role, Subscription};
use indi_server::driver::DriverSpec;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, TcpStream},
    time,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A TCP endpoint the relay connects to as if it were a driver.
pub struct FakeDriver {
    listener: TcpListener,
}

impl FakeDriver {
    pub async fn bind() -> FakeDriver {
        FakeDriver {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn spec(&self) -> DriverSpec {
        let addr = self.listener.local_addr().unwrap();
        DriverSpec::remote(addr.ip().to_string(), addr.port())
    }

    /// Waits for the relay to connect.
    pub async fn accept(&self) -> TcpStream {
        let (tcp, _) = time::timeout(TIMEOUT, self.listener.accept())
            .await
            .expect("relay did not connect")
            .unwrap();
        tcp
    }

    /// Waits for the relay to connect and serves the socket with a driver-side connection.
    pub async fn serve(&self) -> Connection {
        let connection = Connection::new(Config {
            role: Role::Driver,
            stall_timeout: None,
            ..Config::default()
        });
        connection.attach_stream(self.accept().await);
        connection
    }
}

/// Reads until `needle` occurred `count` times and returns everything read.
pub async fn read_until<R>(reader: &mut R, needle: &str, count: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut received = Vec::new();
    time::timeout(TIMEOUT, async {
        let mut buf = [0u8; 4096];
        while String::from_utf8_lossy(&received).matches(needle).count() < count {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed after {:?}", String::from_utf8_lossy(&received));
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "'{needle}' did not arrive in time, got {:?}",
            String::from_utf8_lossy(&received)
        )
    });
    String::from_utf8(received).unwrap()
}

/// Reads exactly `len` bytes.
pub async fn read_len<R>(reader: &mut R, len: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    time::timeout(TIMEOUT, reader.read_exact(&mut buf))
        .await
        .expect("data did not arrive in time")
        .unwrap();
    buf
}

/// Waits for the first event accepted by `matches`.
pub async fn next_event(events: &mut Subscription, matches: impl Fn(&Event) -> bool) -> Event {
    time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("connection dropped");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    time::timeout(TIMEOUT, async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not become true in time")
}
