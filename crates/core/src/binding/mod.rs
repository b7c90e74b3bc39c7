//! Values that user code binds to names, classified once at assignment.

use std::{collections::BTreeMap, fmt};

use serde_json::Value;

use crate::{LifecycleError, ResourceRef, Stream};

/// A value in the live context.
#[derive(Clone)]
pub enum BindingValue {
    Stream(Stream),
    Resource(ResourceRef),
    Array(Vec<BindingValue>),
    Record(Vec<(String, BindingValue)>),
    /// Plain data; never started.
    Opaque(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Stream,
    Resource,
    Group,
    Opaque,
}

impl BindingValue {
    pub fn record<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, BindingValue)>,
    {
        BindingValue::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn kind(&self) -> BindingKind {
        match self {
            BindingValue::Stream(_) => BindingKind::Stream,
            BindingValue::Resource(_) => BindingKind::Resource,
            BindingValue::Array(_) | BindingValue::Record(_) => BindingKind::Group,
            BindingValue::Opaque(_) => BindingKind::Opaque,
        }
    }

    pub fn as_stream(&self) -> Option<&Stream> {
        match self {
            BindingValue::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<&ResourceRef> {
        match self {
            BindingValue::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind() == BindingKind::Group
    }

    /// Direct members of a group keyed `name<sep>index` or `name<sep>key`.
    /// Groups are expanded one level only.
    pub fn members(&self, name: &str, separator: char) -> Vec<(String, &BindingValue)> {
        match self {
            BindingValue::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| (format!("{name}{separator}{index}"), item))
                .collect(),
            BindingValue::Record(entries) => entries
                .iter()
                .map(|(key, item)| (format!("{name}{separator}{key}"), item))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The streams this binding starts, with the ids they run under.
    pub fn stream_members(&self, name: &str, separator: char) -> Vec<(String, Stream)> {
        match self {
            BindingValue::Stream(stream) => vec![(name.to_string(), stream.clone())],
            _ => self
                .members(name, separator)
                .into_iter()
                .filter_map(|(id, item)| item.as_stream().map(|s| (id, s.clone())))
                .collect(),
        }
    }

    /// The resources this binding owns, with the ids they are registered
    /// under.
    pub fn resource_members(&self, name: &str, separator: char) -> Vec<(String, ResourceRef)> {
        match self {
            BindingValue::Resource(resource) => vec![(name.to_string(), resource.clone())],
            _ => self
                .members(name, separator)
                .into_iter()
                .filter_map(|(id, item)| item.as_resource().map(|r| (id, r.clone())))
                .collect(),
        }
    }
}

impl From<Stream> for BindingValue {
    fn from(value: Stream) -> Self {
        BindingValue::Stream(value)
    }
}

impl From<ResourceRef> for BindingValue {
    fn from(value: ResourceRef) -> Self {
        BindingValue::Resource(value)
    }
}

impl From<Value> for BindingValue {
    fn from(value: Value) -> Self {
        BindingValue::Opaque(value)
    }
}

impl From<Vec<Stream>> for BindingValue {
    fn from(value: Vec<Stream>) -> Self {
        BindingValue::Array(value.into_iter().map(BindingValue::Stream).collect())
    }
}

impl fmt::Debug for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            BindingValue::Resource(resource) => {
                f.debug_tuple("Resource").field(&resource.kind()).finish()
            }
            BindingValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            BindingValue::Record(entries) => f.debug_tuple("Record").field(entries).finish(),
            BindingValue::Opaque(value) => f.debug_tuple("Opaque").field(value).finish(),
        }
    }
}

/// Rejects identifiers the start/stop API cannot address.
pub fn validate_name(name: &str) -> std::result::Result<(), LifecycleError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Err(LifecycleError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Name to value table that user code reads from and assigns into.
#[derive(Debug, Default)]
pub struct Context {
    values: BTreeMap<String, BindingValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `value` to `name`, returning the value it replaces.
    pub fn bind(&mut self, name: impl Into<String>, value: BindingValue) -> Option<BindingValue> {
        self.values.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.values.get(name)
    }

    pub fn stream(&self, name: &str) -> Option<&Stream> {
        self.get(name).and_then(BindingValue::as_stream)
    }

    pub fn remove(&mut self, name: &str) -> Option<BindingValue> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use serde_json::json;

    use super::*;
    use crate::{sources, Attributes, Resource};

    struct Voice {
        disposed: Cell<bool>,
    }

    impl Resource for Voice {
        fn dispose(&self) {
            self.disposed.set(true);
        }
    }

    #[test]
    fn groups_expand_to_member_ids() {
        let value = BindingValue::from(vec![
            sources::never(Attributes::any()),
            sources::never(Attributes::any()),
        ]);
        let ids: Vec<String> = value
            .stream_members("accel", '.')
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["accel.0", "accel.1"]);

        let record = BindingValue::record([
            ("x", BindingValue::Stream(sources::never(Attributes::any()))),
            ("label", BindingValue::Opaque(json!("left"))),
        ]);
        let ids: Vec<String> = record
            .stream_members("b", '.')
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["b.x"]);
        assert_eq!(record.kind(), BindingKind::Group);
    }

    #[test]
    fn opaque_values_have_no_members() {
        let value = BindingValue::from(json!([1, 2, 3]));
        assert!(value.stream_members("v", '.').is_empty());
        assert!(value.resource_members("v", '.').is_empty());
    }

    #[test]
    fn resource_members_skip_nested_streams() {
        let voice = Rc::new(Voice {
            disposed: Cell::new(false),
        });
        let resource: ResourceRef = voice.clone();
        let value = BindingValue::record([
            ("lead", BindingValue::Resource(resource.clone())),
            ("lfo", BindingValue::Stream(sources::never(Attributes::any()))),
        ]);

        let members = value.resource_members("pad", '.');
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, "pad.lead");
        assert!(Rc::ptr_eq(&members[0].1, &resource));
        members[0].1.dispose();
        assert!(voice.disposed.get());
        assert!(!value.stream_members("pad", '.').is_empty());
    }

    #[test]
    fn rejects_blank_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("two words").is_err());
        assert!(validate_name("b.x").is_ok());
    }
}
