//! # INDI Protocol Library
//!
//! This crate provides a Rust implementation of the wire protocol of the
//! [Instrument-Neutral Device Interface (INDI)](https://www.indilib.org/develop/developer-manual/106-client-development.html),
//! the XML-over-TCP protocol used to control astronomical instruments such as cameras,
//! mounts, focusers, filter wheels and domes.
//!
//! ## Overview
//!
//! Every instrument ("device") publishes *properties*: named vectors of typed members.
//! This crate provides:
//!
//! - The property model ([`Property`], [`Vector`] and the member types [`Switch`],
//!   [`Number`], [`Text`], [`Blob`])
//! - A [`registry::Registry`] that stores the properties of one connection
//! - Encoding of every [`Message`] to XML
//! - Incremental decoding of the unframed inbound stream ([`decode::StreamDecoder`])
//!
//! ## Protocol Features
//!
//! - **Protocol Versions**: INDI 1.7
//! - **Message Types**:
//!   - `getProperties`: ask for property definitions
//!   - `def*Vector`: define a property
//!   - `new*Vector`: client asks a driver to change values
//!   - `set*Vector`: driver reports changed values
//!   - `delProperty`: remove one property or a whole device
//!   - `message`: free-form device message
//!   - `enableBLOB`: control BLOB traffic
//!
//! ## Basic Usage
//!
//! ### Decoding a Stream
//!
//! ```
//! use indi_protocol::{Message, Property, decode::StreamDecoder};
//!
//! let mut decoder = StreamDecoder::new();
//! // Messages may arrive split at arbitrary points
//! assert!(decoder.feed(b"<defTextVector device=\"Dome\" name=\"DEVICE_PORT\" perm=\"rw\">").is_empty());
//! let messages = decoder.feed(b"<defText name=\"PORT\">/dev/ttyUSB0</defText></defTextVector>");
//! match &messages[..] {
//!     [Message::Define(Property::Text(vector))] => {
//!         assert_eq!(vector.members[0].value, "/dev/ttyUSB0");
//!     }
//!     _ => panic!("expected a text definition"),
//! }
//! ```
//!
//! ### Writing Messages
//!
//! ```
//! use indi_protocol::{Message, Rule, Switch, SwitchVector};
//!
//! let vector = SwitchVector::new("Telescope Simulator", "CONNECTION")
//!     .with_rule(Rule::OneOfMany)
//!     .with_member(Switch::new("CONNECT", "Connect", true))
//!     .with_member(Switch::new("DISCONNECT", "Disconnect", false));
//! let mut buffer = Vec::new();
//! Message::New(vector.into()).write_to(&mut buffer).expect("Writing to vector shouldn't fail");
//! assert!(buffer.starts_with(b"<newSwitchVector device=\"Telescope Simulator\" name=\"CONNECTION\">"));
//! ```
//!
//! ## Message Format
//!
//! - Switch values are the literal strings `On` and `Off`
//! - Numbers always use `.` as decimal separator
//! - BLOB bodies are base64 text and their `size` attribute is the length of that text
//!
//! ## Error Handling
//!
//! Decoding uses [`error::DecodeError`], lookups of unknown properties [`error::LookupError`].
//! Malformed input never ends a stream: it is logged through the `log` crate and dropped.
//!
//! ## Thread Safety
//!
//! The types in this library are thread-safe and can be safely shared across threads.
//! A [`registry::Registry`] however needs external synchronization when it is mutated
//! from more than one thread.

pub mod protocol;
pub use protocol::*;
pub mod property;
pub use property::*;
pub mod codec;
pub mod decode;
pub mod error;
pub mod frame;
pub mod registry;
