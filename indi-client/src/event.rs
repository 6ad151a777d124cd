use indi_protocol::{
    BlobMode, BlobVector, Notice, NumberVector, Property, SwitchVector, TextVector,
};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Something that happened on a [`crate::Connection`].
///
/// Vector events carry a snapshot of the vector as stored in the registry right after the
/// update; the registry itself always holds the live value.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The first property of a device was stored.
    DeviceAdded { device: String },
    NewSwitch { device: String, vector: SwitchVector },
    NewNumber { device: String, vector: NumberVector },
    NewText { device: String, vector: TextVector },
    NewBlob { device: String, vector: BlobVector },
    /// The `CONNECT` member of the device's `CONNECTION` vector changed.
    ConnectedChanged { device: String, connected: bool },
    /// One vector, or every vector of the device when `name` is `None`, was removed.
    DelProperty { device: String, name: Option<String> },
    NewMessage(Notice),
    /// The peer asked for BLOB traffic to be switched on or off.
    EnableBlob {
        device: String,
        name: Option<String>,
        mode: BlobMode,
    },
    /// Bytes were written to the transport.
    Sent(String),
    /// The transport closed or failed, or [`crate::Connection::disconnect`] was called.
    Disconnected,
}

impl Event {
    pub(crate) fn from_property(property: Property) -> Event {
        let device = property.device().to_string();
        match property {
            Property::Switch(vector) => Event::NewSwitch { device, vector },
            Property::Number(vector) => Event::NewNumber { device, vector },
            Property::Text(vector) => Event::NewText { device, vector },
            Property::Blob(vector) => Event::NewBlob { device, vector },
        }
    }

    /// The device the event refers to, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            Event::DeviceAdded { device }
            | Event::NewSwitch { device, .. }
            | Event::NewNumber { device, .. }
            | Event::NewText { device, .. }
            | Event::NewBlob { device, .. }
            | Event::ConnectedChanged { device, .. }
            | Event::DelProperty { device, .. }
            | Event::EnableBlob { device, .. } => Some(device),
            Event::NewMessage(notice) => notice.device.as_deref(),
            Event::Sent(_) | Event::Disconnected => None,
        }
    }
}

/// Receiving end of a connection's events.
///
/// A subscriber that falls behind by more than the configured event capacity loses the
/// oldest events; the loss is logged and receiving continues.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<Event>) -> Subscription {
        Subscription { receiver }
    }

    /// Waits for the next event. Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged behind, {skipped} events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged behind, {skipped} events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
