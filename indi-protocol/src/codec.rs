/// Write implementations for the protocol messages
use std::{
    borrow::Cow,
    io::{self, Write},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::{
    property::{Blob, Member, Number, Property, PropertyKind, Switch, Text, Vector},
    protocol::{Message, Notice},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Escapes the five XML special characters.
pub fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Renders a number with `.` as decimal separator, independent of any locale.
pub fn format_number(value: f64) -> String {
    format!("{}", value)
}

fn switch_text(value: bool) -> &'static str {
    if value { "On" } else { "Off" }
}

/// Which of the three vector messages is being written.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Verb {
    Def,
    New,
    Set,
}

impl Verb {
    fn element_prefix(self) -> &'static str {
        match self {
            Verb::Def => "def",
            Verb::New => "new",
            Verb::Set => "set",
        }
    }

    fn member_prefix(self) -> &'static str {
        match self {
            Verb::Def => "def",
            Verb::New | Verb::Set => "one",
        }
    }
}

/// Per member type rendering of attributes and body.
trait WireMember: Member {
    fn write_attributes(&self, verb: Verb, writer: &mut impl Write) -> io::Result<()>;
    fn body(&self) -> Cow<'_, str>;
}

impl WireMember for Switch {
    fn write_attributes(&self, _verb: Verb, _writer: &mut impl Write) -> io::Result<()> {
        Ok(())
    }

    fn body(&self) -> Cow<'_, str> {
        Cow::Borrowed(switch_text(self.value))
    }
}

impl WireMember for Number {
    fn write_attributes(&self, verb: Verb, writer: &mut impl Write) -> io::Result<()> {
        if verb == Verb::Def {
            write!(
                writer,
                " format=\"{}\" min=\"{}\" max=\"{}\" step=\"{}\"",
                escape(&self.format),
                format_number(self.min),
                format_number(self.max),
                format_number(self.step)
            )?;
        }
        Ok(())
    }

    fn body(&self) -> Cow<'_, str> {
        Cow::Owned(format_number(self.value))
    }
}

impl WireMember for Text {
    fn write_attributes(&self, _verb: Verb, _writer: &mut impl Write) -> io::Result<()> {
        Ok(())
    }

    fn body(&self) -> Cow<'_, str> {
        escape(&self.value)
    }
}

impl WireMember for Blob {
    fn write_attributes(&self, _verb: Verb, writer: &mut impl Write) -> io::Result<()> {
        // The size attribute is the length of the base64 text.
        let size = base64::encoded_len(self.value.len(), true).unwrap_or(usize::MAX);
        write!(
            writer,
            " format=\"{}\" size=\"{}\"",
            escape(&self.format),
            size
        )
    }

    fn body(&self) -> Cow<'_, str> {
        Cow::Owned(STANDARD.encode(&self.value))
    }
}

fn write_vector<M: WireMember>(
    vector: &Vector<M>,
    verb: Verb,
    writer: &mut impl Write,
) -> io::Result<()> {
    let tag = M::KIND.tag();
    write!(
        writer,
        "<{}{}Vector device=\"{}\" name=\"{}\"",
        verb.element_prefix(),
        tag,
        escape(&vector.device),
        escape(&vector.name)
    )?;
    if verb == Verb::Def {
        write!(
            writer,
            " label=\"{}\" group=\"{}\" perm=\"{}\"",
            escape(&vector.label),
            escape(&vector.group),
            vector.permission.as_str()
        )?;
        if M::KIND == PropertyKind::Switch {
            write!(writer, " rule=\"{}\"", vector.rule.as_str())?;
        }
    }
    if verb != Verb::New {
        write!(writer, " state=\"{}\"", vector.state.as_str())?;
    }
    writeln!(writer, ">")?;

    for member in &vector.members {
        write!(
            writer,
            "  <{}{} name=\"{}\"",
            verb.member_prefix(),
            tag,
            escape(member.name())
        )?;
        if verb == Verb::Def {
            write!(writer, " label=\"{}\"", escape(member.label()))?;
        }
        member.write_attributes(verb, writer)?;
        writeln!(
            writer,
            ">{}</{}{}>",
            member.body(),
            verb.member_prefix(),
            tag
        )?;
    }
    writeln!(writer, "</{}{}Vector>", verb.element_prefix(), tag)
}

fn write_property(property: &Property, verb: Verb, writer: &mut impl Write) -> io::Result<()> {
    match property {
        Property::Switch(v) => write_vector(v, verb, writer),
        Property::Number(v) => write_vector(v, verb, writer),
        Property::Text(v) => write_vector(v, verb, writer),
        Property::Blob(v) => write_vector(v, verb, writer),
    }
}

fn write_optional(writer: &mut impl Write, attribute: &str, value: Option<&str>) -> io::Result<()> {
    match value {
        Some(value) => write!(writer, " {}=\"{}\"", attribute, escape(value)),
        None => Ok(()),
    }
}

impl Message {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        match self {
            Message::GetProperties {
                device,
                name,
                version,
            } => {
                write!(writer, "<getProperties version=\"{}\"", version)?;
                write_optional(writer, "device", device.as_deref())?;
                write_optional(writer, "name", name.as_deref())?;
                writeln!(writer, "/>")
            }
            Message::Define(property) => write_property(property, Verb::Def, writer),
            Message::New(property) => write_property(property, Verb::New, writer),
            Message::Set(property) => write_property(property, Verb::Set, writer),
            Message::DelProperty { device, name } => {
                write!(writer, "<delProperty device=\"{}\"", escape(device))?;
                write_optional(writer, "name", name.as_deref())?;
                writeln!(writer, "/>")
            }
            Message::Message(Notice {
                device,
                text,
                timestamp,
            }) => {
                write!(writer, "<message")?;
                write_optional(writer, "device", device.as_deref())?;
                if let Some(timestamp) = timestamp {
                    write!(
                        writer,
                        " timestamp=\"{}\"",
                        timestamp.format(TIMESTAMP_FORMAT)
                    )?;
                }
                writeln!(writer, " message=\"{}\"/>", escape(text))
            }
            Message::EnableBlob { device, name, mode } => {
                write!(writer, "<enableBLOB device=\"{}\"", escape(device))?;
                write_optional(writer, "name", name.as_deref())?;
                writeln!(writer, ">{}</enableBLOB>", mode.as_str())
            }
        }
    }

    /// Renders the message as XML text.
    pub fn to_xml(&self) -> String {
        let mut buffer = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(feature = "tokio")]
pub use tokio_codec::IndiCodec;

#[cfg(feature = "tokio")]
mod tokio_codec {
    use std::collections::VecDeque;

    use bytes::{BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::{decode::decode_frame, error::DecodeError, frame::FrameScanner, protocol::Message};

    /// [`Decoder`]/[`Encoder`] pair for use with `FramedRead` and `FramedWrite`.
    ///
    /// Malformed fragments never surface as errors: they are logged and dropped so a
    /// misbehaving peer does not end the stream.
    #[derive(Debug, Default)]
    pub struct IndiCodec {
        scanner: FrameScanner,
        pending: VecDeque<Message>,
    }

    impl IndiCodec {
        pub fn new() -> IndiCodec {
            IndiCodec::default()
        }

        /// Must be called whenever the read buffer is cleared from the outside.
        pub fn reset(&mut self) {
            self.scanner.reset();
            self.pending.clear();
        }
    }

    impl Decoder for IndiCodec {
        type Item = Message;
        type Error = DecodeError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
            loop {
                if let Some(message) = self.pending.pop_front() {
                    return Ok(Some(message));
                }
                let complete = self.scanner.scan(src);
                if complete == 0 {
                    return Ok(None);
                }
                let frame = src.split_to(complete);
                self.scanner.consume(complete);
                self.pending.extend(decode_frame(&frame));
            }
        }

        fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
            match self.decode(buf)? {
                Some(message) => Ok(Some(message)),
                None => {
                    if !buf.is_empty() {
                        log::debug!("Discarding {} bytes of an unterminated element", buf.len());
                        buf.clear();
                        self.scanner.reset();
                    }
                    Ok(None)
                }
            }
        }
    }

    impl Encoder<Message> for IndiCodec {
        type Error = DecodeError;

        fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), DecodeError> {
            item.write_to(&mut dst.writer())?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn decodes_across_partial_buffers() {
            let mut codec = IndiCodec::new();
            let mut buffer = BytesMut::new();
            buffer.extend_from_slice(b"<delProperty device=\"Dome\"/><getProp");
            assert!(matches!(
                codec.decode(&mut buffer).unwrap(),
                Some(Message::DelProperty { .. })
            ));
            assert!(codec.decode(&mut buffer).unwrap().is_none());
            buffer.extend_from_slice(b"erties version=\"1.7\"/>");
            assert!(matches!(
                codec.decode(&mut buffer).unwrap(),
                Some(Message::GetProperties { .. })
            ));
            assert!(buffer.is_empty());
        }

        #[test]
        fn encoder_writes_xml() {
            let mut codec = IndiCodec::new();
            let mut buffer = BytesMut::new();
            codec.encode(Message::get_properties(), &mut buffer).unwrap();
            assert_eq!(&buffer[..], b"<getProperties version=\"1.7\"/>\n");
        }

        #[test]
        fn eof_discards_open_element() {
            let mut codec = IndiCodec::new();
            let mut buffer = BytesMut::from(&b"<defTextVector device=\"x\""[..]);
            assert!(codec.decode_eof(&mut buffer).unwrap().is_none());
            assert!(buffer.is_empty());
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;

    use crate::decode::parse_fragment;
    use crate::property::*;
    use crate::protocol::*;

    fn roundtrip(message: &Message) -> Message {
        let mut messages = parse_fragment(&message.to_xml()).unwrap();
        assert_eq!(messages.len(), 1);
        messages.remove(0)
    }

    #[test]
    fn write_new_switch_vector() {
        let vector = SwitchVector::new("Telescope Simulator", "CONNECTION")
            .with_label("Connection")
            .with_rule(Rule::OneOfMany)
            .with_member(Switch::new("CONNECT", "Connect", true))
            .with_member(Switch::new("DISCONNECT", "Disconnect", false));
        let xml = Message::New(vector.into()).to_xml();
        assert_eq!(
            xml,
            "<newSwitchVector device=\"Telescope Simulator\" name=\"CONNECTION\">\n  <oneSwitch name=\"CONNECT\">On</oneSwitch>\n  <oneSwitch name=\"DISCONNECT\">Off</oneSwitch>\n</newSwitchVector>\n"
        );
    }

    #[test]
    fn new_number_carries_only_name_and_value() {
        let vector = NumberVector::new("Focuser", "ABS_FOCUS_POSITION").with_member(
            Number::new("FOCUS_ABSOLUTE_POSITION", "Ticks", 1234.5).with_range(0.0, 1e5, 1.0),
        );
        let xml = Message::New(vector.into()).to_xml();
        assert!(xml.contains("<oneNumber name=\"FOCUS_ABSOLUTE_POSITION\">1234.5</oneNumber>"));
        assert!(!xml.contains("min="));
    }

    #[test]
    fn write_blob_size_is_base64_length() {
        let vector = BlobVector::new("CCD Simulator", "CCD1")
            .with_member(Blob::new("CCD1", "Image", ".fits", b"hello".to_vec()));
        let xml = Message::New(vector.into()).to_xml();
        assert!(xml.contains("<oneBLOB name=\"CCD1\" format=\".fits\" size=\"8\">aGVsbG8=</oneBLOB>"));
    }

    #[test]
    fn write_get_properties() {
        let message = Message::GetProperties {
            device: Some("CCD Simulator".to_string()),
            name: None,
            version: Version::V1_7,
        };
        assert_eq!(
            message.to_xml(),
            "<getProperties version=\"1.7\" device=\"CCD Simulator\"/>\n"
        );
    }

    #[test]
    fn write_enable_blob() {
        let message = Message::EnableBlob {
            device: "CCD Simulator".to_string(),
            name: None,
            mode: BlobMode::Also,
        };
        assert_eq!(
            message.to_xml(),
            "<enableBLOB device=\"CCD Simulator\">Also</enableBLOB>\n"
        );
    }

    #[test]
    fn escapes_special_characters() {
        let vector = TextVector::new("Dome", "NOTES")
            .with_member(Text::new("NOTE", "Note", "a < b & \"c\""));
        let message = Message::Define(vector.into());
        assert!(message.to_xml().contains("a &lt; b &amp; &quot;c&quot;"));
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn definitions_roundtrip() {
        let definitions: Vec<Property> = vec![
            SwitchVector::new("Dome Simulator", "DOME_MOTION")
                .with_label("Motion")
                .with_group("Main Control")
                .with_permission(Permission::ReadWrite)
                .with_rule(Rule::OneOfMany)
                .with_state(PropertyState::Busy)
                .with_member(Switch::new("DOME_CW", "CW", false))
                .with_member(Switch::new("DOME_CCW", "CCW", true))
                .into(),
            NumberVector::new("CCD Simulator", "CCD_TEMPERATURE")
                .with_label("Temperature")
                .with_group("Main Control")
                .with_permission(Permission::ReadWrite)
                .with_member(
                    Number::new("CCD_TEMPERATURE_VALUE", "Temperature (C)", -12.25)
                        .with_range(-50.0, 50.0, 0.5)
                        .with_format("%5.2f"),
                )
                .into(),
            TextVector::new("Telescope Simulator", "DEVICE_PORT")
                .with_label("Ports")
                .with_group("Connection")
                .with_permission(Permission::WriteOnly)
                .with_state(PropertyState::Alert)
                .with_member(Text::new("PORT", "Port", "/dev/ttyUSB0"))
                .into(),
            BlobVector::new("CCD Simulator", "CCD1")
                .with_label("Image")
                .with_group("Image Info")
                .with_member(Blob::new("CCD1", "Image", ".fits", vec![0, 1, 2, 253, 254, 255]))
                .into(),
        ];
        for property in definitions {
            let message = Message::Define(property);
            assert_eq!(roundtrip(&message), message);
        }
    }

    #[test]
    fn message_roundtrip() {
        let message = Message::Message(Notice {
            device: Some("Dome Simulator".to_string()),
            text: "Dome is parked".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2021, 3, 4)
                .and_then(|d| d.and_hms_opt(5, 6, 7)),
        });
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn numbers_use_dot_separator() {
        assert_eq!(super::format_number(0.05), "0.05");
        assert_eq!(super::format_number(10000.0), "10000");
        assert_eq!(super::format_number(-1.5e-3), "-0.0015");
    }
}
