//! Upstream endpoints of the relay.
use std::{
    fmt::{self, Display, Formatter},
    io,
    path::PathBuf,
    process::Stdio,
    str::FromStr,
};

use bytes::Bytes;
use indi_client::{Config as ConnectionConfig, Connection};
use indi_protocol::DEFAULT_PORT;
use tokio::{
    process::{Child, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Where the relay finds a driver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverSpec {
    /// Another INDI server or a driver listening on TCP.
    Remote { host: String, port: u16 },
    /// A driver executable speaking INDI on its stdin and stdout.
    Process { program: PathBuf, args: Vec<String> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverSpecError {
    EmptyHost,
    InvalidPort(String),
}

impl Display for DriverSpecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DriverSpecError::EmptyHost => write!(f, "Driver address has no host"),
            DriverSpecError::InvalidPort(port) => write!(f, "Invalid port '{port}'"),
        }
    }
}

impl std::error::Error for DriverSpecError {}

impl DriverSpec {
    pub fn remote(host: impl Into<String>, port: u16) -> DriverSpec {
        DriverSpec::Remote {
            host: host.into(),
            port,
        }
    }

    pub fn process(program: impl Into<PathBuf>) -> DriverSpec {
        DriverSpec::Process {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Name the driver is registered under: `host:port` or the program path.
    pub fn name(&self) -> String {
        match self {
            DriverSpec::Remote { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            DriverSpec::Remote { host, port } => format!("{host}:{port}"),
            DriverSpec::Process { program, .. } => program.display().to_string(),
        }
    }
}

impl Display for DriverSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parses `host[:port]`; the port defaults to 7624. IPv6 hosts need brackets when a port
/// is given.
impl FromStr for DriverSpec {
    type Err = DriverSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            match rest.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, port)) => (host, Some(port.strip_prefix(':').unwrap_or(port))),
                None => return Err(DriverSpecError::InvalidPort(s.to_string())),
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (s, None),
            }
        };
        if host.is_empty() {
            return Err(DriverSpecError::EmptyHost);
        }
        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| DriverSpecError::InvalidPort(port.to_string()))?,
            None => DEFAULT_PORT,
        };
        Ok(DriverSpec::remote(host, port))
    }
}

/// A running driver: its connection plus whatever keeps it alive.
#[derive(Clone)]
pub struct Driver {
    name: String,
    spec: DriverSpec,
    connection: Connection,
    token: CancellationToken,
}

impl Driver {
    /// Connects to, or launches, the driver described by `spec`. Also returns everything
    /// the driver writes, starting with its first byte.
    pub(crate) async fn start(
        spec: DriverSpec,
        config: ConnectionConfig,
    ) -> io::Result<(Driver, mpsc::UnboundedReceiver<Bytes>)> {
        let connection = Connection::new(config);
        let output = connection.raw_output();
        let token = CancellationToken::new();
        match &spec {
            DriverSpec::Remote { host, port } => {
                connection.connect((host.as_str(), *port)).await?;
            }
            DriverSpec::Process { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()?;
                let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
                    return Err(io::Error::other("driver process has no stdio pipes"));
                };
                connection.attach(stdout, stdin);
                tokio::spawn(supervise(spec.name(), child, token.clone()));
            }
        }
        log::info!("Driver {spec} started");
        let driver = Driver {
            name: spec.name(),
            spec,
            connection,
            token,
        };
        Ok((driver, output))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &DriverSpec {
        &self.spec
    }

    /// The connection to the driver. Its registry mirrors everything the driver defined.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn stop(&self) {
        self.token.cancel();
        self.connection.disconnect();
        log::info!("Driver {} stopped", self.name);
    }
}

/// Waits for a driver process to exit, killing it when the driver is stopped.
async fn supervise(name: String, mut child: Child, token: CancellationToken) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => log::warn!("Driver {name} exited with {status}"),
            Err(err) => log::error!("Waiting for driver {name} failed: {err}"),
        },
        _ = token.cancelled() => {
            if let Err(err) = child.kill().await {
                log::error!("Could not kill driver {name}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_remote_specs() {
        assert_eq!(
            "localhost".parse::<DriverSpec>(),
            Ok(DriverSpec::remote("localhost", 7624))
        );
        assert_eq!(
            "10.0.0.2:7625".parse::<DriverSpec>(),
            Ok(DriverSpec::remote("10.0.0.2", 7625))
        );
        assert_eq!("::1".parse::<DriverSpec>(), Ok(DriverSpec::remote("::1", 7624)));
        assert_eq!(
            "[::1]:8000".parse::<DriverSpec>(),
            Ok(DriverSpec::remote("::1", 8000))
        );
        assert_eq!(
            "host:port".parse::<DriverSpec>(),
            Err(DriverSpecError::InvalidPort("port".to_string()))
        );
        assert_eq!(":7624".parse::<DriverSpec>(), Err(DriverSpecError::EmptyHost));
    }

    #[test]
    fn names() {
        assert_eq!(DriverSpec::remote("localhost", 7624).name(), "localhost:7624");
        assert_eq!(DriverSpec::remote("::1", 7624).name(), "[::1]:7624");
        assert_eq!(
            DriverSpec::process("/usr/bin/indi_simulator_ccd").to_string(),
            "/usr/bin/indi_simulator_ccd"
        );
    }
}
