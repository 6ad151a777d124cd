use std::fmt::Display;

/// Access rights a driver grants to clients for a property.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Permission {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Permission {
    /// Parses the `perm` attribute. Unknown values fall back to read-only.
    pub fn parse(value: &str) -> Permission {
        match value.trim().to_ascii_lowercase().as_str() {
            "wo" => Permission::WriteOnly,
            "rw" => Permission::ReadWrite,
            _ => Permission::ReadOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadOnly => "ro",
            Permission::WriteOnly => "wo",
            Permission::ReadWrite => "rw",
        }
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, Permission::ReadOnly)
    }
}

/// Selection constraint of a switch vector.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Rule {
    /// Exactly one member is `On`.
    OneOfMany,
    /// Zero or one member is `On`.
    AtMostOne,
    /// Unconstrained.
    #[default]
    AnyOfMany,
}

impl Rule {
    pub fn parse(value: &str) -> Rule {
        match value.trim().to_ascii_lowercase().as_str() {
            "oneofmany" => Rule::OneOfMany,
            "atmostone" => Rule::AtMostOne,
            _ => Rule::AnyOfMany,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::OneOfMany => "OneOfMany",
            Rule::AtMostOne => "AtMostOne",
            Rule::AnyOfMany => "AnyOfMany",
        }
    }
}

/// Status a driver reports for a property.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    pub fn parse(value: &str) -> Option<PropertyState> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(PropertyState::Idle),
            "ok" => Some(PropertyState::Ok),
            "busy" => Some(PropertyState::Busy),
            "alert" => Some(PropertyState::Alert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        }
    }
}

/// The four member types a vector can hold.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PropertyKind {
    Switch,
    Number,
    Text,
    Blob,
}

impl PropertyKind {
    /// Name used in element tags, e.g. `Switch` in `defSwitchVector`.
    pub fn tag(&self) -> &'static str {
        match self {
            PropertyKind::Switch => "Switch",
            PropertyKind::Number => "Number",
            PropertyKind::Text => "Text",
            PropertyKind::Blob => "BLOB",
        }
    }

    /// Detects the kind from a lowercased tag target such as `numbervector` or `onenumber`.
    pub fn from_target(target: &str) -> Option<PropertyKind> {
        if target.contains("switch") {
            Some(PropertyKind::Switch)
        } else if target.contains("number") {
            Some(PropertyKind::Number)
        } else if target.contains("text") {
            Some(PropertyKind::Text)
        } else if target.contains("blob") {
            Some(PropertyKind::Blob)
        } else {
            None
        }
    }
}

impl Display for PropertyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Common accessors of the scalar members of a vector.
pub trait Member: Clone {
    const KIND: PropertyKind;

    fn name(&self) -> &str;
    fn label(&self) -> &str;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Switch {
    pub name: String,
    pub label: String,
    pub value: bool,
}

impl Switch {
    pub fn new(name: impl Into<String>, label: impl Into<String>, value: bool) -> Switch {
        Switch {
            name: name.into(),
            label: label.into(),
            value,
        }
    }
}

/// A numeric member. `format` is a printf-style display hint and is never enforced,
/// and `value` is not clamped to `[min, max]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Number {
    pub name: String,
    pub label: String,
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
}

impl Number {
    pub fn new(name: impl Into<String>, label: impl Into<String>, value: f64) -> Number {
        Number {
            name: name.into(),
            label: label.into(),
            format: "%g".to_string(),
            min: 0.0,
            max: 0.0,
            step: 0.0,
            value,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Number {
        self.min = min;
        self.max = max;
        self.step = step;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Number {
        self.format = format.into();
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Text {
    pub name: String,
    pub label: String,
    pub value: String,
}

impl Text {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Text {
        Text {
            name: name.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

/// A binary member.
///
/// `size` mirrors the `size` attribute on the wire, which is the length of the base64
/// text rather than the decoded byte count. When a received body cannot be decoded the
/// value is replaced by `size` zero bytes, i.e. the attribute is then read as a byte count.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Blob {
    pub name: String,
    pub label: String,
    /// File extension such as `.fits`.
    pub format: String,
    pub value: Vec<u8>,
    pub size: usize,
}

impl Blob {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        format: impl Into<String>,
        value: Vec<u8>,
    ) -> Blob {
        let size = base64::encoded_len(value.len(), true).unwrap_or(usize::MAX);
        Blob {
            name: name.into(),
            label: label.into(),
            format: format.into(),
            value,
            size,
        }
    }

    /// Replaces the payload and recomputes `size`.
    pub fn set_value(&mut self, value: Vec<u8>) {
        self.size = base64::encoded_len(value.len(), true).unwrap_or(usize::MAX);
        self.value = value;
    }
}

macro_rules! impl_member {
    ($ty:ty, $kind:expr) => {
        impl Member for $ty {
            const KIND: PropertyKind = $kind;

            fn name(&self) -> &str {
                &self.name
            }

            fn label(&self) -> &str {
                &self.label
            }
        }
    };
}

impl_member!(Switch, PropertyKind::Switch);
impl_member!(Number, PropertyKind::Number);
impl_member!(Text, PropertyKind::Text);
impl_member!(Blob, PropertyKind::Blob);

/// A named, typed group of members belonging to one device.
///
/// `(device, name)` is the key of a vector inside a [`crate::registry::Registry`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vector<M> {
    pub device: String,
    pub name: String,
    pub label: String,
    /// UI grouping only.
    pub group: String,
    pub permission: Permission,
    /// Only meaningful for switch vectors.
    pub rule: Rule,
    pub state: PropertyState,
    pub members: Vec<M>,
}

pub type SwitchVector = Vector<Switch>;
pub type NumberVector = Vector<Number>;
pub type TextVector = Vector<Text>;
pub type BlobVector = Vector<Blob>;

impl<M: Member> Vector<M> {
    pub fn new(device: impl Into<String>, name: impl Into<String>) -> Vector<M> {
        Vector {
            device: device.into(),
            name: name.into(),
            label: String::new(),
            group: String::new(),
            permission: Permission::default(),
            rule: Rule::default(),
            state: PropertyState::default(),
            members: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    pub fn with_member(mut self, member: M) -> Self {
        self.members.push(member);
        self
    }

    pub fn kind(&self) -> PropertyKind {
        M::KIND
    }

    pub fn member(&self, name: &str) -> Option<&M> {
        self.members.iter().find(|m| m.name() == name)
    }

    pub fn member_mut(&mut self, name: &str) -> Option<&mut M> {
        self.members.iter_mut().find(|m| m.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name() == name)
    }
}

impl SwitchVector {
    /// Index of the first member that is `On`.
    pub fn selected_index(&self) -> Option<usize> {
        self.members.iter().position(|s| s.value)
    }

    pub fn selected(&self) -> Option<&Switch> {
        self.selected_index().map(|i| &self.members[i])
    }

    /// Re-establishes the rule invariant after the member values changed.
    ///
    /// For `OneOfMany` exactly one member stays `On`: the first `On` member wins, and if
    /// none is `On` the previous selection (or else the first member) is restored.
    /// For `AtMostOne` only the first `On` member is kept.
    pub fn enforce_rule(&mut self, previous: Option<usize>) {
        match self.rule {
            Rule::AnyOfMany => {}
            Rule::AtMostOne => {
                if let Some(first) = self.selected_index() {
                    self.select(first);
                }
            }
            Rule::OneOfMany => {
                if self.members.is_empty() {
                    return;
                }
                let index = self
                    .selected_index()
                    .or(previous.filter(|i| *i < self.members.len()))
                    .unwrap_or(0);
                self.select(index);
            }
        }
    }

    fn select(&mut self, index: usize) {
        for (i, member) in self.members.iter_mut().enumerate() {
            member.value = i == index;
        }
    }
}

/// Any of the four vector types.
#[derive(Clone, Debug, PartialEq)]
pub enum Property {
    Switch(SwitchVector),
    Number(NumberVector),
    Text(TextVector),
    Blob(BlobVector),
}

macro_rules! header_accessor {
    ($self:ident, $field:ident) => {
        match $self {
            Property::Switch(v) => &v.$field,
            Property::Number(v) => &v.$field,
            Property::Text(v) => &v.$field,
            Property::Blob(v) => &v.$field,
        }
    };
}

impl Property {
    pub fn device(&self) -> &str {
        header_accessor!(self, device)
    }

    pub fn name(&self) -> &str {
        header_accessor!(self, name)
    }

    pub fn label(&self) -> &str {
        header_accessor!(self, label)
    }

    pub fn group(&self) -> &str {
        header_accessor!(self, group)
    }

    pub fn permission(&self) -> Permission {
        *header_accessor!(self, permission)
    }

    pub fn state(&self) -> PropertyState {
        *header_accessor!(self, state)
    }

    pub fn kind(&self) -> PropertyKind {
        match self {
            Property::Switch(_) => PropertyKind::Switch,
            Property::Number(_) => PropertyKind::Number,
            Property::Text(_) => PropertyKind::Text,
            Property::Blob(_) => PropertyKind::Blob,
        }
    }

    pub fn member_names(&self) -> Vec<&str> {
        match self {
            Property::Switch(v) => v.members.iter().map(|m| m.name()).collect(),
            Property::Number(v) => v.members.iter().map(|m| m.name()).collect(),
            Property::Text(v) => v.members.iter().map(|m| m.name()).collect(),
            Property::Blob(v) => v.members.iter().map(|m| m.name()).collect(),
        }
    }

    pub fn as_switch(&self) -> Option<&SwitchVector> {
        match self {
            Property::Switch(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&NumberVector> {
        match self {
            Property::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextVector> {
        match self {
            Property::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobVector> {
        match self {
            Property::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_switch(self) -> Option<SwitchVector> {
        match self {
            Property::Switch(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_number(self) -> Option<NumberVector> {
        match self {
            Property::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<TextVector> {
        match self {
            Property::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_blob(self) -> Option<BlobVector> {
        match self {
            Property::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl From<SwitchVector> for Property {
    fn from(value: SwitchVector) -> Self {
        Property::Switch(value)
    }
}

impl From<NumberVector> for Property {
    fn from(value: NumberVector) -> Self {
        Property::Number(value)
    }
}

impl From<TextVector> for Property {
    fn from(value: TextVector) -> Self {
        Property::Text(value)
    }
}

impl From<BlobVector> for Property {
    fn from(value: BlobVector) -> Self {
        Property::Blob(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn connection(connect: bool) -> SwitchVector {
        SwitchVector::new("CCD Simulator", "CONNECTION")
            .with_rule(Rule::OneOfMany)
            .with_member(Switch::new("CONNECT", "Connect", connect))
            .with_member(Switch::new("DISCONNECT", "Disconnect", !connect))
    }

    #[test]
    fn one_of_many_keeps_first_selection() {
        let mut v = connection(true);
        v.members[1].value = true;
        v.enforce_rule(None);
        assert_eq!(v.selected_index(), Some(0));
        assert_eq!(v.members.iter().filter(|s| s.value).count(), 1);
    }

    #[test]
    fn one_of_many_restores_previous_selection() {
        let mut v = connection(false);
        v.members[1].value = false;
        v.enforce_rule(Some(1));
        assert_eq!(v.selected_index(), Some(1));

        v.members[1].value = false;
        v.enforce_rule(None);
        assert_eq!(v.selected_index(), Some(0));
    }

    #[test]
    fn at_most_one_allows_none() {
        let mut v = connection(false).with_rule(Rule::AtMostOne);
        v.members[1].value = false;
        v.enforce_rule(Some(1));
        assert_eq!(v.selected_index(), None);
    }

    #[test]
    fn permission_defaults_to_read_only() {
        assert_eq!(Permission::parse("rw"), Permission::ReadWrite);
        assert_eq!(Permission::parse("WO"), Permission::WriteOnly);
        assert_eq!(Permission::parse(""), Permission::ReadOnly);
        assert_eq!(Permission::parse("bogus"), Permission::ReadOnly);
    }

    #[test]
    fn blob_size_is_base64_length() {
        let blob = Blob::new("CCD1", "Image", ".fits", b"hello".to_vec());
        assert_eq!(blob.size, 8);
    }

    #[test]
    fn kind_from_target() {
        assert_eq!(
            PropertyKind::from_target("numbervector"),
            Some(PropertyKind::Number)
        );
        assert_eq!(PropertyKind::from_target("oneblob"), Some(PropertyKind::Blob));
        assert_eq!(PropertyKind::from_target("properties"), None);
    }
}
