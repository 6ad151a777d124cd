use std::{error::Error, fmt::Display, io};

use crate::property::PropertyKind;

/// Errors that may occur while decoding a fragment of the incoming stream.
#[derive(Debug)]
pub enum DecodeError {
    IoError(io::Error),
    /// A complete fragment that is not well-formed XML.
    Xml(String),
    InvalidNumber { member: String, value: String },
    MissingAttribute { element: String, attribute: &'static str },
}

impl From<io::Error> for DecodeError {
    fn from(value: io::Error) -> Self {
        DecodeError::IoError(value)
    }
}

impl From<roxmltree::Error> for DecodeError {
    fn from(value: roxmltree::Error) -> Self {
        DecodeError::Xml(value.to_string())
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::IoError(error) => write!(f, "{}", error),
            DecodeError::Xml(error) => write!(f, "Malformed XML fragment: {}", error),
            DecodeError::InvalidNumber { member, value } => {
                write!(f, "Invalid number '{}' for member {}", value, member)
            }
            DecodeError::MissingAttribute { element, attribute } => {
                write!(f, "Element {} is missing attribute {}", element, attribute)
            }
        }
    }
}

impl Error for DecodeError {}

/// Errors returned when a command names a vector or member that is not known.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LookupError {
    UnknownVector {
        device: String,
        name: String,
    },
    UnknownMember {
        vector: String,
        member: String,
    },
    WrongKind {
        name: String,
        expected: PropertyKind,
        found: PropertyKind,
    },
}

impl Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::UnknownVector { device, name } => {
                write!(f, "Device {} has no property {}", device, name)
            }
            LookupError::UnknownMember { vector, member } => {
                write!(f, "Property {} has no member {}", vector, member)
            }
            LookupError::WrongKind {
                name,
                expected,
                found,
            } => write!(
                f,
                "Property {} is a {} vector, not a {} vector",
                name, found, expected
            ),
        }
    }
}

impl Error for LookupError {}
