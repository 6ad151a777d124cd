//! Incremental decoding of the incoming INDI stream.
//!
//! Bytes are accumulated until the [`FrameScanner`](crate::frame::FrameScanner) reports a
//! complete top-level element. The complete prefix is cleaned of characters XML does not
//! allow, wrapped as `<document>…</document>` and parsed in one go; every top-level element
//! in it is then turned into a [`Message`]. A fragment that is complete but not well-formed
//! is dropped with a warning, since more bytes cannot repair it. A single element that
//! fails to decode (an unparsable number, say) is skipped and its siblings are kept.
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::NaiveDateTime;
use roxmltree::{Document, Node};

use crate::{
    error::DecodeError,
    frame::FrameSplitter,
    property::{
        Blob, Member, Number, Permission, Property, PropertyKind, PropertyState, Rule, Switch,
        Text, Vector,
    },
    protocol::{BlobMode, Message, Notice, Version},
};

/// Default for `min`, `max`, `step` and `size` when the attribute is absent.
const ABSENT_NUMBER_ATTRIBUTE: f64 = 1.0;
const ABSENT_BLOB_SIZE: usize = 1;

/// Stateful decoder for one connection's inbound stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    splitter: FrameSplitter,
}

impl StreamDecoder {
    pub fn new() -> StreamDecoder {
        StreamDecoder::default()
    }

    /// Feeds the next chunk of the stream and returns every message it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Message> {
        match self.splitter.push(chunk) {
            Some(frame) => decode_frame(&frame),
            None => Vec::new(),
        }
    }

    /// Number of bytes belonging to elements that are still open.
    pub fn pending(&self) -> usize {
        self.splitter.pending()
    }

    /// Forgets any partially received element.
    pub fn clear(&mut self) {
        self.splitter.clear();
    }
}

/// Decodes a complete fragment, logging and dropping it if it is malformed.
pub fn decode_frame(frame: &[u8]) -> Vec<Message> {
    let text = String::from_utf8_lossy(frame);
    let clean = sanitize(&text);
    if clean.trim().is_empty() {
        return Vec::new();
    }
    match parse_fragment(&clean) {
        Ok(messages) => messages,
        Err(e) => {
            log::warn!("Dropping {} bytes: {}", frame.len(), e);
            log::trace!("Dropped fragment: {}", clean);
            Vec::new()
        }
    }
}

/// Parses a fragment holding any number of complete sibling elements.
pub fn parse_fragment(fragment: &str) -> Result<Vec<Message>, DecodeError> {
    let wrapped = format!("<document>{}</document>", fragment);
    let document = Document::parse(&wrapped)?;
    let mut messages = Vec::new();
    for node in document.root_element().children().filter(Node::is_element) {
        match decode_element(node) {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => {}
            Err(e) => log::warn!(
                "Skipping element {}: {}",
                node.tag_name().name(),
                e
            ),
        }
    }
    Ok(messages)
}

/// Whether `c` may appear in an XML 1.0 document.
pub fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// Removes characters that are not legal in XML and any `<?xml …?>` declarations,
/// which would be rejected once the fragment is wrapped in a document.
pub fn sanitize(text: &str) -> String {
    let mut clean: String = text.chars().filter(|c| is_xml_char(*c)).collect();
    while let Some(start) = clean.find("<?xml") {
        match clean[start..].find("?>") {
            Some(end) => clean.replace_range(start..start + end + 2, ""),
            None => break,
        }
    }
    clean
}

fn decode_element(node: Node) -> Result<Option<Message>, DecodeError> {
    let tag = node.tag_name().name().to_ascii_lowercase();
    let (Some(action), Some(target)) = (tag.get(..3), tag.get(3..)) else {
        log::debug!("Ignoring element {}", tag);
        return Ok(None);
    };

    let message = match action {
        "get" if target.contains("properties") => Message::GetProperties {
            device: optional_attribute(node, "device"),
            name: optional_attribute(node, "name"),
            version: node
                .attribute("version")
                .and_then(Version::parse)
                .unwrap_or_default(),
        },
        "del" if target.contains("property") => Message::DelProperty {
            device: required_attribute(node, "device")?,
            name: optional_attribute(node, "name"),
        },
        "mes" => Message::Message(Notice {
            device: optional_attribute(node, "device"),
            text: node.attribute("message").unwrap_or_default().to_string(),
            timestamp: node.attribute("timestamp").and_then(parse_timestamp),
        }),
        "ena" if target.contains("blob") => Message::EnableBlob {
            device: required_attribute(node, "device")?,
            name: optional_attribute(node, "name"),
            mode: BlobMode::parse(node.text().unwrap_or_default()),
        },
        "def" | "new" | "set" if target.ends_with("vector") => {
            let Some(property) = decode_vector(node, target)? else {
                return Ok(None);
            };
            match action {
                "def" => Message::Define(property),
                "new" => Message::New(property),
                _ => Message::Set(property),
            }
        }
        _ => {
            log::debug!("Ignoring element {}", node.tag_name().name());
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn decode_vector(node: Node, target: &str) -> Result<Option<Property>, DecodeError> {
    let Some(kind) = PropertyKind::from_target(target) else {
        log::debug!("Ignoring vector of unknown type {}", target);
        return Ok(None);
    };
    let device = node.attribute("device").unwrap_or_default();
    let name = node.attribute("name").unwrap_or_default();
    if device.is_empty() || name.is_empty() {
        log::debug!("Ignoring {} vector without device or name", kind);
        return Ok(None);
    }

    let property = match kind {
        PropertyKind::Switch => Property::Switch(vector(node, decode_switch)),
        PropertyKind::Number => Property::Number(vector(node, decode_number)),
        PropertyKind::Text => Property::Text(vector(node, decode_text)),
        PropertyKind::Blob => Property::Blob(vector(node, decode_blob)),
    };
    Ok(Some(property))
}

fn vector<M: Member>(
    node: Node,
    decode: fn(Node) -> Result<Option<M>, DecodeError>,
) -> Vector<M> {
    let mut vector = Vector::<M>::new(
        node.attribute("device").unwrap_or_default(),
        node.attribute("name").unwrap_or_default(),
    )
    .with_label(node.attribute("label").unwrap_or_default())
    .with_group(node.attribute("group").unwrap_or_default())
    .with_permission(node.attribute("perm").map(Permission::parse).unwrap_or_default())
    .with_rule(node.attribute("rule").map(Rule::parse).unwrap_or_default())
    .with_state(
        node.attribute("state")
            .and_then(PropertyState::parse)
            .unwrap_or_default(),
    );

    for child in node.children().filter(Node::is_element) {
        let tag = child.tag_name().name().to_ascii_lowercase();
        if tag.ends_with("vector") || PropertyKind::from_target(&tag) != Some(M::KIND) {
            continue;
        }
        match decode(child) {
            Ok(Some(member)) => vector.members.push(member),
            Ok(None) => {}
            Err(err) => log::warn!("Skipping member of {}: {}", vector.name, err),
        }
    }
    vector
}

fn member_value(node: Node) -> String {
    node.text()
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect()
}

fn decode_switch(node: Node) -> Result<Option<Switch>, DecodeError> {
    Ok(Some(Switch::new(
        node.attribute("name").unwrap_or_default(),
        node.attribute("label").unwrap_or_default(),
        member_value(node).contains("On"),
    )))
}

fn decode_number(node: Node) -> Result<Option<Number>, DecodeError> {
    let name = node.attribute("name").unwrap_or_default();
    let text = member_value(node);
    if text.trim().is_empty() {
        log::debug!("Number {} has no value", name);
        return Ok(None);
    }
    let number_attribute = |attribute: &str| match node.attribute(attribute) {
        Some(value) => parse_number(value).ok_or_else(|| DecodeError::InvalidNumber {
            member: name.to_string(),
            value: value.to_string(),
        }),
        None => Ok(ABSENT_NUMBER_ATTRIBUTE),
    };
    Ok(Some(Number {
        name: name.to_string(),
        label: node.attribute("label").unwrap_or_default().to_string(),
        format: node.attribute("format").unwrap_or_default().to_string(),
        min: number_attribute("min")?,
        max: number_attribute("max")?,
        step: number_attribute("step")?,
        value: parse_number(&text).ok_or_else(|| DecodeError::InvalidNumber {
            member: name.to_string(),
            value: text.clone(),
        })?,
    }))
}

fn decode_text(node: Node) -> Result<Option<Text>, DecodeError> {
    Ok(Some(Text::new(
        node.attribute("name").unwrap_or_default(),
        node.attribute("label").unwrap_or_default(),
        member_value(node),
    )))
}

fn decode_blob(node: Node) -> Result<Option<Blob>, DecodeError> {
    let name = node.attribute("name").unwrap_or_default();
    let size = match node.attribute("size") {
        Some(size) => size
            .trim()
            .parse::<usize>()
            .map_err(|_| DecodeError::InvalidNumber {
                member: name.to_string(),
                value: size.to_string(),
            })?,
        None => ABSENT_BLOB_SIZE,
    };
    let body: String = node
        .text()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    // `size` is the base64 length on the wire but is taken as a byte count here.
    let value = STANDARD.decode(body.as_bytes()).unwrap_or_else(|e| {
        log::debug!("BLOB {} is not valid base64 ({}), zero-filling", name, e);
        vec![0; size]
    });
    Ok(Some(Blob {
        name: name.to_string(),
        label: node.attribute("label").unwrap_or_default().to_string(),
        format: node.attribute("format").unwrap_or_default().to_string(),
        value,
        size,
    }))
}

/// Parses a number with `.` as decimal separator. Sexagesimal values such as
/// `-12:30:36` or `5 30` are accepted as well.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if !text.contains(':') && !text.contains(char::is_whitespace) {
        return text.parse().ok();
    }
    let negative = text.starts_with('-');
    let mut value = 0.0;
    let mut scale = 1.0;
    for part in text
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty())
    {
        value += part.parse::<f64>().ok()?.abs() / scale;
        scale *= 60.0;
    }
    Some(if negative { -value } else { value })
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    text.trim().trim_end_matches('Z').parse().ok()
}

fn optional_attribute(node: Node, name: &str) -> Option<String> {
    node.attribute(name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required_attribute(node: Node, attribute: &'static str) -> Result<String, DecodeError> {
    optional_attribute(node, attribute).ok_or_else(|| DecodeError::MissingAttribute {
        element: node.tag_name().name().to_string(),
        attribute,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::property::NumberVector;

    const EXPOSURE: &str = "<defNumberVector device=\"CCD Simulator\" name=\"CCD_EXPOSURE\" label=\"Exposure\" group=\"Main Control\" perm=\"rw\"><defNumber name=\"CCD_EXPOSURE_VALUE\" label=\"Duration (s)\" format=\"%5.2f\" min=\"0.05\" max=\"10000\" step=\"0.05\">1.00</defNumber></defNumberVector>";

    fn exposure(messages: &[Message]) -> &NumberVector {
        match messages {
            [Message::Define(Property::Number(v))] => v,
            other => panic!("expected one number definition, got {:?}", other),
        }
    }

    #[test]
    fn decode_number_definition() {
        let messages = parse_fragment(EXPOSURE).unwrap();
        let vector = exposure(&messages);
        assert_eq!(vector.device, "CCD Simulator");
        assert_eq!(vector.group, "Main Control");
        assert_eq!(vector.permission, Permission::ReadWrite);
        assert_eq!(vector.members.len(), 1);
        let member = &vector.members[0];
        assert_eq!(member.name, "CCD_EXPOSURE_VALUE");
        assert_eq!(member.format, "%5.2f");
        assert_eq!(member.value, 1.0);
        assert_eq!(member.min, 0.05);
        assert_eq!(member.max, 10000.0);
        assert_eq!(member.step, 0.05);
    }

    #[test]
    fn chunked_input_yields_same_messages() {
        let whole = StreamDecoder::new().feed(EXPOSURE.as_bytes());
        for chunk_size in [1, 2, 7, 64] {
            let mut decoder = StreamDecoder::new();
            let mut messages = Vec::new();
            for chunk in EXPOSURE.as_bytes().chunks(chunk_size) {
                messages.extend(decoder.feed(chunk));
            }
            assert_eq!(messages, whole, "chunk size {}", chunk_size);
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn several_siblings_in_one_pass() {
        let input = "<getProperties version=\"1.7\"/>\n<delProperty device=\"Dome\" name=\"DOME_PARK\"/>\n<message device=\"Dome\" timestamp=\"2024-01-02T03:04:05\" message=\"Parked\"/>";
        let messages = StreamDecoder::new().feed(input.as_bytes());
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0],
            Message::GetProperties {
                device: None,
                name: None,
                version: Version::V1_7
            }
        );
        assert_eq!(
            messages[1],
            Message::DelProperty {
                device: "Dome".to_string(),
                name: Some("DOME_PARK".to_string())
            }
        );
        match &messages[2] {
            Message::Message(notice) => {
                assert_eq!(notice.text, "Parked");
                assert_eq!(notice.device.as_deref(), Some("Dome"));
                assert_eq!(
                    notice.timestamp.map(|t| t.to_string()),
                    Some("2024-01-02 03:04:05".to_string())
                );
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn switch_text_containing_on() {
        let input = "<setSwitchVector device=\"Mount\" name=\"CONNECTION\" state=\"Ok\"><oneSwitch name=\"CONNECT\">\n On\n</oneSwitch><oneSwitch name=\"DISCONNECT\">Off</oneSwitch></setSwitchVector>";
        match StreamDecoder::new().feed(input.as_bytes()).as_slice() {
            [Message::Set(Property::Switch(v))] => {
                assert_eq!(v.state, PropertyState::Ok);
                assert_eq!(v.permission, Permission::ReadOnly);
                assert!(v.members[0].value);
                assert!(!v.members[1].value);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn blob_falls_back_to_zeroes() {
        let input = "<setBLOBVector device=\"CCD\" name=\"CCD1\"><oneBLOB name=\"CCD1\" size=\"8\" format=\".fits\">aGVs\nbG8=</oneBLOB><oneBLOB name=\"CCD2\" size=\"6\" format=\".fits\">!!not base64!!</oneBLOB></setBLOBVector>";
        match StreamDecoder::new().feed(input.as_bytes()).as_slice() {
            [Message::Set(Property::Blob(v))] => {
                assert_eq!(v.members[0].value, b"hello".to_vec());
                assert_eq!(v.members[0].size, 8);
                assert_eq!(v.members[1].value, vec![0; 6]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn control_characters_and_declarations_are_stripped() {
        let input = "<?xml version=\"1.0\"?>\u{1}<defTextVector device=\"Focuser\" name=\"DEVICE_PORT\" perm=\"rw\"><defText name=\"PORT\">/dev/tty\u{7}USB0</defText></defTextVector>";
        match StreamDecoder::new().feed(input.as_bytes()).as_slice() {
            [Message::Define(Property::Text(v))] => {
                assert_eq!(v.members[0].value, "/dev/ttyUSB0")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_fragment_is_dropped() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"<a>&bogus;</a>").is_empty());
        assert_eq!(decoder.pending(), 0);
        let messages = decoder.feed(b"<getProperties version=\"1.7\" device=\"Dome\"/>");
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn bad_element_does_not_drop_siblings() {
        let input = "<setNumberVector device=\"D\" name=\"N\"><oneNumber name=\"X\">1,5</oneNumber></setNumberVector><delProperty device=\"D\"/>";
        let messages = StreamDecoder::new().feed(input.as_bytes());
        assert_eq!(messages.len(), 2);
        let Message::Set(Property::Number(vector)) = &messages[0] else {
            panic!("expected a number update, got {:?}", messages[0]);
        };
        assert!(vector.members.is_empty());
        assert_eq!(
            messages[1],
            Message::DelProperty {
                device: "D".to_string(),
                name: None
            }
        );
    }

    #[test]
    fn bad_member_keeps_the_rest_of_the_vector() {
        let input = concat!(
            "<setNumberVector device=\"D\" name=\"N\">",
            "<oneNumber name=\"A\">1.5</oneNumber><oneNumber name=\"B\">1,5</oneNumber>",
            "<oneNumber name=\"C\">-2</oneNumber></setNumberVector>"
        );
        let messages = parse_fragment(input).unwrap();
        let [Message::Set(Property::Number(vector))] = &messages[..] else {
            panic!("expected one number update, got {:?}", messages);
        };
        let values: Vec<(&str, f64)> = vector
            .members
            .iter()
            .map(|n| (n.name.as_str(), n.value))
            .collect();
        assert_eq!(values, vec![("A", 1.5), ("C", -2.0)]);
    }

    #[test]
    fn vectors_without_device_are_ignored() {
        let input = "<defSwitchVector name=\"X\"><defSwitch name=\"A\">On</defSwitch></defSwitchVector>";
        assert!(parse_fragment(input).unwrap().is_empty());
    }

    #[test]
    fn sexagesimal_numbers() {
        assert_eq!(parse_number("12:30:36"), Some(12.51));
        assert_eq!(parse_number("-5 30"), Some(-5.5));
        assert_eq!(parse_number(" 0.05 "), Some(0.05));
        assert_eq!(parse_number("1,5"), None);
    }

    #[test]
    fn xml_chars() {
        assert!(is_xml_char('\t'));
        assert!(is_xml_char('é'));
        assert!(!is_xml_char('\u{0}'));
        assert!(!is_xml_char('\u{FFFE}'));
    }
}
