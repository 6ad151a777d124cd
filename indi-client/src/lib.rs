//! # INDI Client
//!
//! Connection engine for talking to INDI servers and drivers.
//!
//! ## Overview
//!
//! A [`Connection`] owns one byte stream, usually a TCP socket to an INDI server on port
//! 7624. Two background tasks serve it:
//!
//! - The **reader** decodes the unframed inbound XML stream, merges every property into the
//!   connection's [`Registry`](indi_protocol::registry::Registry) and publishes an [`Event`]
//!   per message
//! - The **writer** drains the outbound queue; fragments enqueued before it gets to run are
//!   coalesced into one write
//!
//! If nothing arrives for [`Config::stall_timeout`], a partially received message is
//! discarded and the last command is sent once more.
//!
//! For the underlying message types see the [`indi_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ### Connecting to a Server
//!
//! ```no_run
//! use indi_client::{Connection, Config, Event};
//!
//! # async fn run() -> std::io::Result<()> {
//! let connection = Connection::new(Config::default());
//! let mut events = connection.subscribe();
//! connection.connect(("127.0.0.1", 7624)).await?;
//! connection.query_properties(None, None);
//!
//! while let Some(event) = events.recv().await {
//!     if let Event::NewNumber { device, vector } = event {
//!         println!("{device}.{}: {:?}", vector.name, vector.members);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Changing Values
//!
//! ```no_run
//! # fn run(connection: indi_client::Connection) -> Result<(), indi_protocol::error::LookupError> {
//! let camera = connection.device("CCD Simulator");
//! camera.set_connected(true)?;
//! camera.set_number("CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 2.5)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - Transport failures end both tasks and mark the connection disconnected; there is no
//!   automatic reconnect
//! - Malformed messages are logged and skipped
//! - Setting a value on an unknown vector or member returns a
//!   [`LookupError`](indi_protocol::error::LookupError)
//! - [`Device`] getters return neutral defaults for properties that are not defined yet
//!
//! ## Related Crates
//!
//! - [`indi_protocol`](https://docs.rs/indi-protocol/) - Property model and XML codec
//! - [`indi_server`](https://docs.rs/indi-server/) - Relay server built on this crate
pub mod connection;
pub mod device;
pub mod event;

pub use connection::{Builder, Config, Connection, Role};
pub use device::{Device, DeviceKind, Profile};
pub use event::{Event, Subscription};
