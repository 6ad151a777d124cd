//! # INDI Server Library
//!
//! An INDI relay server: it multiplexes any number of drivers to any number of clients.
//!
//! ## Overview
//!
//! INDI clients (planetarium programs, capture tools) connect to a server on TCP port 7624.
//! The server talks to the actual device drivers, which are either local executables
//! speaking INDI on stdin/stdout or other INDI servers reachable over TCP.
//!
//! ## Architecture
//!
//! - **[`driver::Driver`]**: one upstream endpoint, backed by an
//!   [`indi_client::Connection`]. Its registry mirrors every property the driver defined
//! - **[`server::Server`]**: accepts client sockets and relays traffic between clients and
//!   drivers
//!
//! ## How It Works
//!
//! 1. Drivers are started from a [`driver::DriverSpec`], either when the server starts or
//!    at runtime through [`server::Server::add_driver`]
//! 2. Every client socket gets a reader and a writer task
//! 3. The reader forwards whatever the client writes to every driver
//! 4. Whatever any driver writes is queued for every client writer
//!
//! Bytes are relayed unmodified. They are however cut at the end of top-level XML elements,
//! so that messages from two drivers arriving at the same time are never mixed up.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use indi_server::{driver::DriverSpec, server::Builder};
//!
//! # async fn run() -> std::io::Result<()> {
//! let server = Builder::new()
//!     .bind("127.0.0.1:7624")
//!     .driver(DriverSpec::process("indi_simulator_ccd"))
//!     .build();
//! let addr = server.start().await?;
//! println!("Listening on {addr}");
//!
//! // Drivers can be added and removed while clients are connected
//! let name = server.add_driver("192.168.1.20:7624".parse().unwrap()).await?;
//! server.remove_driver(&name);
//! server.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! A client or driver whose socket fails is dropped without affecting the others.
//! A driver whose connection closes is removed from the relay and can be added again with
//! [`server::Server::add_driver`]. There is no automatic reconnect.
//!
//! ## Configuration
//!
//! Server behavior can be customized via [`server::Config`]:
//!
//! - **bind**: Listen address (default: `127.0.0.1:7624`)
//! - **read_buffer_size**: Size of the per-client read buffer (default: 32 KiB)
//! - **connection**: Configuration of the driver connections
//! - **drivers**: Drivers started together with the server
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Enable logging to see:
//! - Client connections and disconnections
//! - Drivers starting, exiting and stopping
//! - Relay errors
//!
//! Configure logging with an implementation like `env_logger`:
//!
//! ```ignore
//! env_logger::init();
//! ```
//!
//! ## Thread Model
//!
//! All work happens on tokio tasks: one accept loop, a reader and a writer per client and
//! one relay task per driver. Drivers and clients are shared through mutex-protected maps.
pub mod driver;
pub mod server;
