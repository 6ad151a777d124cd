//! Per-device view on a [`Connection`].
//!
//! Properties only exist once the driver has defined them, so the getters here are best
//! effort: a missing vector or member reads as a neutral default instead of an error.
//! Setters go through the connection and do report lookup failures.
use indi_protocol::{
    BlobMode, Permission, Property, PropertyState,
    error::LookupError,
    registry::{CONNECT_MEMBER, CONNECTION_PROPERTY},
};

use crate::connection::Connection;

/// Families of instruments with a well-known set of standard properties.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeviceKind {
    Telescope,
    Camera,
    Focuser,
    FilterWheel,
    Dome,
    Spectrograph,
    Detector,
}

/// Standard property names of one [`DeviceKind`].
#[derive(Debug)]
pub struct Profile {
    pub kind: DeviceKind,
    /// A device defining any of these is considered to be of this kind.
    pub identifying: &'static [&'static str],
    pub properties: &'static [&'static str],
}

static PROFILES: [Profile; 7] = [
    Profile {
        kind: DeviceKind::Telescope,
        identifying: &["EQUATORIAL_EOD_COORD", "EQUATORIAL_COORD"],
        properties: &[
            "EQUATORIAL_COORD",
            "EQUATORIAL_EOD_COORD",
            "HORIZONTAL_COORD",
            "ON_COORD_SET",
            "TELESCOPE_ABORT_MOTION",
            "TELESCOPE_INFO",
            "TELESCOPE_PARK",
            "TELESCOPE_SLEW_RATE",
            "TELESCOPE_TRACK_RATE",
        ],
    },
    Profile {
        kind: DeviceKind::Camera,
        identifying: &["CCD_EXPOSURE"],
        properties: &[
            "CCD_ABORT_EXPOSURE",
            "CCD_BINNING",
            "CCD_CFA",
            "CCD_COMPRESSION",
            "CCD_COOLER",
            "CCD_COOLER_POWER",
            "CCD_EXPOSURE",
            "CCD_FRAME",
            "CCD_FRAME_RESET",
            "CCD_FRAME_TYPE",
            "CCD_INFO",
            "CCD_TEMPERATURE",
        ],
    },
    Profile {
        kind: DeviceKind::Focuser,
        identifying: &["ABS_FOCUS_POSITION", "REL_FOCUS_POSITION", "FOCUS_MOTION"],
        properties: &[
            "ABS_FOCUS_POSITION",
            "FOCUS_ABORT_MOTION",
            "FOCUS_MOTION",
            "FOCUS_SPEED",
            "FOCUS_TIMER",
            "REL_FOCUS_POSITION",
        ],
    },
    Profile {
        kind: DeviceKind::FilterWheel,
        identifying: &["FILTER_SLOT"],
        properties: &["FILTER_NAME", "FILTER_SLOT"],
    },
    Profile {
        kind: DeviceKind::Dome,
        identifying: &["DOME_MOTION", "ABS_DOME_POSITION", "DOME_SHUTTER"],
        properties: &[
            "ABS_DOME_POSITION",
            "DOME_ABORT_MOTION",
            "DOME_AUTOSYNC",
            "DOME_GOTO",
            "DOME_MEASUREMENTS",
            "DOME_MOTION",
            "DOME_PARAMS",
            "DOME_SHUTTER",
            "DOME_SPEED",
            "DOME_TIMER",
            "REL_DOME_POSITION",
        ],
    },
    Profile {
        kind: DeviceKind::Spectrograph,
        identifying: &["SPECTROGRAPH_SETTINGS"],
        properties: &[
            "SENSOR_ABORT_INTEGRATION",
            "SENSOR_INTEGRATION",
            "SENSOR_TEMPERATURE",
            "SPECTROGRAPH_COOLER",
            "SPECTROGRAPH_COOLER_POWER",
            "SPECTROGRAPH_SETTINGS",
        ],
    },
    Profile {
        kind: DeviceKind::Detector,
        identifying: &["DETECTOR_CAPTURE", "DETECTOR_SETTINGS"],
        properties: &[
            "DETECTOR_ABORT_CAPTURE",
            "DETECTOR_CAPTURE",
            "DETECTOR_COOLER",
            "DETECTOR_COOLER_POWER",
            "DETECTOR_INFO",
            "DETECTOR_SETTINGS",
            "DETECTOR_TEMPERATURE",
        ],
    },
];

impl DeviceKind {
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Telescope,
        DeviceKind::Camera,
        DeviceKind::Focuser,
        DeviceKind::FilterWheel,
        DeviceKind::Dome,
        DeviceKind::Spectrograph,
        DeviceKind::Detector,
    ];

    pub fn profile(self) -> &'static Profile {
        // PROFILES is ordered like ALL
        &PROFILES[self as usize]
    }
}

/// Handle on one device of a connection.
#[derive(Clone)]
pub struct Device {
    connection: Connection,
    name: String,
}

impl Connection {
    pub fn device(&self, name: impl Into<String>) -> Device {
        Device {
            connection: self.clone(),
            name: name.into(),
        }
    }
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the driver has defined at least one property for this device.
    pub fn exists(&self) -> bool {
        self.connection
            .with_registry(|registry| registry.contains_device(&self.name))
    }

    pub fn property(&self, vector: &str) -> Option<Property> {
        self.connection.property(&self.name, vector)
    }

    fn read<T: Default>(&self, vector: &str, f: impl FnOnce(&Property) -> Option<T>) -> T {
        self.connection.with_registry(|registry| {
            registry
                .find(&self.name, vector)
                .and_then(f)
                .unwrap_or_default()
        })
    }

    /// Value of a number member, `0.0` when unknown.
    pub fn number(&self, vector: &str, member: &str) -> f64 {
        self.read(vector, |p| Some(p.as_number()?.member(member)?.value))
    }

    /// Value of a text member, empty when unknown.
    pub fn text(&self, vector: &str, member: &str) -> String {
        self.read(vector, |p| Some(p.as_text()?.member(member)?.value.clone()))
    }

    /// Value of a switch member, `false` when unknown.
    pub fn switch(&self, vector: &str, member: &str) -> bool {
        self.read(vector, |p| Some(p.as_switch()?.member(member)?.value))
    }

    /// Payload of a BLOB member, empty when unknown.
    pub fn blob(&self, vector: &str, member: &str) -> Vec<u8> {
        self.read(vector, |p| Some(p.as_blob()?.member(member)?.value.clone()))
    }

    /// Name of the selected member of a switch vector, empty when unknown.
    pub fn selected(&self, vector: &str) -> String {
        self.read(vector, |p| Some(p.as_switch()?.selected()?.name.clone()))
    }

    pub fn state(&self, vector: &str) -> PropertyState {
        self.read(vector, |p| Some(p.state()))
    }

    pub fn permission(&self, vector: &str) -> Permission {
        self.read(vector, |p| Some(p.permission()))
    }

    pub fn groups(&self) -> Vec<String> {
        self.connection
            .with_registry(|registry| registry.groups(&self.name))
    }

    pub fn connected(&self) -> bool {
        self.connection
            .with_registry(|registry| registry.is_connected(&self.name))
    }

    /// Asks the driver to connect to or disconnect from the hardware.
    pub fn set_connected(&self, connect: bool) -> Result<(), LookupError> {
        self.connection
            .set_switch(&self.name, CONNECTION_PROPERTY, CONNECT_MEMBER, connect)
    }

    pub fn set_number(&self, vector: &str, member: &str, value: f64) -> Result<(), LookupError> {
        self.connection.set_number(&self.name, vector, member, value)
    }

    pub fn set_text(
        &self,
        vector: &str,
        member: &str,
        value: impl Into<String>,
    ) -> Result<(), LookupError> {
        self.connection.set_text(&self.name, vector, member, value)
    }

    pub fn set_switch(&self, vector: &str, member: &str, value: bool) -> Result<(), LookupError> {
        self.connection.set_switch(&self.name, vector, member, value)
    }

    pub fn select_switch(&self, vector: &str, index: usize) -> Result<(), LookupError> {
        self.connection.select_switch(&self.name, vector, index)
    }

    pub fn set_blob(&self, vector: &str, member: &str, value: Vec<u8>) -> Result<(), LookupError> {
        self.connection.set_blob(&self.name, vector, member, value)
    }

    /// Asks for the definitions of this device, or of one of its vectors.
    pub fn query_properties(&self, vector: Option<&str>) {
        self.connection.query_properties(Some(&self.name), vector);
    }

    pub fn enable_blob(&self, mode: BlobMode) {
        self.connection.enable_blob(&self.name, None, mode);
    }

    /// Whether the device defines any identifying property of `kind`.
    pub fn matches(&self, kind: DeviceKind) -> bool {
        let profile = kind.profile();
        self.connection.with_registry(|registry| {
            profile
                .identifying
                .iter()
                .any(|name| registry.find(&self.name, name).is_some())
        })
    }

    pub fn kinds(&self) -> Vec<DeviceKind> {
        DeviceKind::ALL
            .into_iter()
            .filter(|kind| self.matches(*kind))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::Config;
    use indi_protocol::{Number, NumberVector, Text, TextVector};

    fn camera() -> Connection {
        let connection = Connection::new(Config::default());
        connection.define_property(
            NumberVector::new("CCD Simulator", "CCD_EXPOSURE")
                .with_group("Main Control")
                .with_member(Number::new("CCD_EXPOSURE_VALUE", "Duration (s)", 1.5)),
        );
        connection.define_property(
            TextVector::new("CCD Simulator", "DRIVER_INFO")
                .with_group("General Info")
                .with_member(Text::new("DRIVER_NAME", "Name", "CCD Simulator")),
        );
        connection
    }

    #[test]
    fn profiles_follow_kind_order() {
        for kind in DeviceKind::ALL {
            assert_eq!(kind.profile().kind, kind);
        }
    }

    #[test]
    fn getters_read_registry() {
        let device = camera().device("CCD Simulator");
        assert!(device.exists());
        assert_eq!(device.number("CCD_EXPOSURE", "CCD_EXPOSURE_VALUE"), 1.5);
        assert_eq!(device.text("DRIVER_INFO", "DRIVER_NAME"), "CCD Simulator");
        assert_eq!(device.groups(), vec!["Main Control", "General Info"]);
    }

    #[test]
    fn missing_properties_read_as_defaults() {
        let device = camera().device("CCD Simulator");
        assert_eq!(device.number("CCD_TEMPERATURE", "CCD_TEMPERATURE_VALUE"), 0.0);
        assert_eq!(device.number("CCD_EXPOSURE", "NO_SUCH_MEMBER"), 0.0);
        assert_eq!(device.text("CCD_EXPOSURE", "CCD_EXPOSURE_VALUE"), "");
        assert!(!device.switch("CONNECTION", "CONNECT"));
        assert!(device.blob("CCD1", "CCD1").is_empty());
        assert!(!device.connected());
        assert!(!camera().device("Other").exists());
    }

    #[test]
    fn setters_report_unknown_vectors() {
        let device = camera().device("CCD Simulator");
        assert_eq!(
            device.set_connected(true),
            Err(LookupError::UnknownVector {
                device: "CCD Simulator".to_string(),
                name: "CONNECTION".to_string(),
            })
        );
        assert!(device.set_number("CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 2.0).is_ok());
    }

    #[test]
    fn kinds_from_identifying_properties() {
        let connection = camera();
        let device = connection.device("CCD Simulator");
        assert!(device.matches(DeviceKind::Camera));
        assert!(!device.matches(DeviceKind::Telescope));
        assert_eq!(device.kinds(), vec![DeviceKind::Camera]);

        connection.define_property(
            NumberVector::new("Filter Wheel", "FILTER_SLOT")
                .with_member(Number::new("FILTER_SLOT_VALUE", "Slot", 1.0)),
        );
        assert_eq!(
            connection.device("Filter Wheel").kinds(),
            vec![DeviceKind::FilterWheel]
        );
    }
}
