use std::fmt::Display;

use chrono::NaiveDateTime;

use crate::property::Property;

/// Default TCP port of INDI servers.
pub const DEFAULT_PORT: u16 = 7624;

/// The version of the protocol.
/// A version always consists of a major and a minor part.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Version {
    major: usize,
    minor: usize,
}

impl Version {
    /// Version 1.7 of the protocol
    pub const V1_7: Version = Version { major: 1, minor: 7 };

    /// Returns the latest supported version
    pub fn latest() -> Version {
        Version::V1_7
    }

    pub fn new(major: usize, minor: usize) -> Version {
        Version { major, minor }
    }

    /// Parses `major.minor`. A missing minor part is read as 0.
    pub fn parse(value: &str) -> Option<Version> {
        let mut parts = value.trim().splitn(2, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(minor) => minor.parse().ok()?,
            None => 0,
        };
        Some(Version { major, minor })
    }

    /// The major part of the version
    pub fn major(&self) -> usize {
        self.major
    }

    /// The minor part of the version
    pub fn minor(&self) -> usize {
        self.minor
    }
}

#[test]
fn version_ordering() {
    assert!(Version { major: 1, minor: 6 } < Version { major: 1, minor: 7 });
    assert!(Version { major: 2, minor: 0 } > Version { major: 1, minor: 7 });
    assert_eq!(Version::parse("1.7"), Some(Version::V1_7));
    assert_eq!(Version::parse("x"), None);
}

impl Default for Version {
    fn default() -> Self {
        Self::V1_7
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Whether a client wants BLOB traffic from a device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum BlobMode {
    /// No BLOBs are sent.
    #[default]
    Never,
    /// BLOBs are sent along with all other traffic.
    Also,
    /// Only BLOBs are sent.
    Only,
}

impl BlobMode {
    pub fn parse(value: &str) -> BlobMode {
        match value.trim().to_ascii_lowercase().as_str() {
            "also" => BlobMode::Also,
            "only" => BlobMode::Only,
            _ => BlobMode::Never,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        }
    }
}

/// A free-form message a driver attaches to a device (or to no device at all).
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    pub device: Option<String>,
    pub text: String,
    pub timestamp: Option<NaiveDateTime>,
}

/// A message exchanged between INDI clients, servers and drivers.
///
/// Vector messages carry the complete vector. Which header fields are meaningful depends
/// on the kind of message: `Define` carries label, group, permission and rule, while
/// `New` and `Set` only carry member names and values.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Asks for property definitions, optionally restricted to one device or property.
    GetProperties {
        device: Option<String>,
        name: Option<String>,
        version: Version,
    },
    /// `def*Vector`: a driver announces (or re-announces) a property.
    Define(Property),
    /// `new*Vector`: a client asks a driver to change member values.
    New(Property),
    /// `set*Vector`: a driver reports changed member values.
    Set(Property),
    /// Removes one property, or every property of the device when `name` is `None`.
    DelProperty {
        device: String,
        name: Option<String>,
    },
    Message(Notice),
    EnableBlob {
        device: String,
        name: Option<String>,
        mode: BlobMode,
    },
}

impl Message {
    /// `getProperties` for every device.
    pub fn get_properties() -> Message {
        Message::GetProperties {
            device: None,
            name: None,
            version: Version::latest(),
        }
    }

    /// The device the message refers to, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            Message::GetProperties { device, .. } => device.as_deref(),
            Message::Define(p) | Message::New(p) | Message::Set(p) => Some(p.device()),
            Message::DelProperty { device, .. } | Message::EnableBlob { device, .. } => {
                Some(device)
            }
            Message::Message(notice) => notice.device.as_deref(),
        }
    }
}
