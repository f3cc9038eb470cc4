//! Identifying attributes of the entity producing spans.
//!
//! A [`Resource`] is an immutable attribute map attached to every span the
//! pipeline exports. Resources are assembled from [`ResourceDetector`]s and
//! caller overrides with a defined precedence: compiled-in defaults, then
//! process-derived attributes, then environment-derived attributes, then
//! explicit overrides, with the service name argument always winning.
//!
//! Building a resource never fails; detectors that encounter missing or
//! malformed input return an empty resource instead of erroring.

use std::collections::{hash_map, HashMap};
use std::env;
use std::sync::Arc;

use crate::span::{Key, KeyValue, Value};

/// The `service.name` resource attribute.
pub const SERVICE_NAME: &str = "service.name";

/// Service name reported when nothing supplies one.
pub const DEFAULT_SERVICE_NAME: &str = "unknown_service";

pub(crate) const ENV_RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";
pub(crate) const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

/// An immutable representation of the entity producing telemetry.
///
/// Shared via `Arc`, so cloning is cheap.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

#[derive(Debug, PartialEq)]
struct ResourceInner {
    attrs: HashMap<Key, Value>,
}

impl Resource {
    /// Creates an empty resource.
    pub fn empty() -> Self {
        Resource {
            inner: Arc::new(ResourceInner {
                attrs: HashMap::new(),
            }),
        }
    }

    /// Create a resource from key-value pairs.
    ///
    /// Values are de-duplicated by key; the last pair wins.
    pub fn new<T: IntoIterator<Item = KeyValue>>(kvs: T) -> Self {
        let mut attrs = HashMap::new();
        for kv in kvs {
            attrs.insert(kv.key, kv.value);
        }
        Resource {
            inner: Arc::new(ResourceInner { attrs }),
        }
    }

    /// Build the resource for one bootstrap cycle.
    ///
    /// Merges, in increasing precedence: compiled-in defaults, process
    /// attributes, environment attributes, explicit `overrides`, and finally
    /// `service_name` (when non-empty). Pure apart from reading the process
    /// environment; never fails.
    pub fn build(service_name: &str, overrides: impl IntoIterator<Item = KeyValue>) -> Self {
        let mut resource = Resource::default_resource()
            .merge(&ProcessResourceDetector.detect())
            .merge(&EnvResourceDetector::new().detect())
            .merge(&Resource::new(overrides));
        if !service_name.is_empty() {
            resource = resource.merge(&Resource::new([KeyValue::new(
                SERVICE_NAME,
                service_name.to_owned(),
            )]));
        }
        resource
    }

    fn default_resource() -> Self {
        Resource::new([
            KeyValue::new(SERVICE_NAME, DEFAULT_SERVICE_NAME),
            KeyValue::new("telemetry.sdk.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("telemetry.sdk.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("telemetry.sdk.language", "rust"),
        ])
    }

    /// Combine two resources. Keys from `other` win.
    pub fn merge(&self, other: &Resource) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut combined = self.inner.attrs.clone();
        for (k, v) in other.inner.attrs.iter() {
            combined.insert(k.clone(), v.clone());
        }
        Resource {
            inner: Arc::new(ResourceInner { attrs: combined }),
        }
    }

    /// Number of attributes in this resource.
    pub fn len(&self) -> usize {
        self.inner.attrs.len()
    }

    /// Returns `true` if the resource has no attributes.
    pub fn is_empty(&self) -> bool {
        self.inner.attrs.is_empty()
    }

    /// Retrieve the value associated with `key`.
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.inner.attrs.get(key).cloned()
    }

    /// Iterate over the attributes of this resource.
    pub fn iter(&self) -> Iter<'_> {
        Iter(self.inner.attrs.iter())
    }
}

/// An iterator over the entries of a [`Resource`].
#[derive(Debug)]
pub struct Iter<'a>(hash_map::Iter<'a, Key, Value>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Key, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl<'a> IntoIterator for &'a Resource {
    type Item = (&'a Key, &'a Value);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Detects resource attributes from the runtime or the environment.
///
/// Detectors never fail: if the source information is inaccessible or
/// invalid, an empty resource is returned.
pub trait ResourceDetector {
    /// Return a resource built from gathered information.
    fn detect(&self) -> Resource;
}

/// Extracts resource attributes from the `OTEL_RESOURCE_ATTRIBUTES` and
/// `OTEL_SERVICE_NAME` environment variables.
///
/// `OTEL_RESOURCE_ATTRIBUTES` holds comma-separated `key=value` pairs;
/// entries without a `=` are dropped, not errored.
#[derive(Debug, Default)]
pub struct EnvResourceDetector {
    _private: (),
}

impl EnvResourceDetector {
    /// Create an `EnvResourceDetector`.
    pub fn new() -> Self {
        EnvResourceDetector { _private: () }
    }
}

impl ResourceDetector for EnvResourceDetector {
    fn detect(&self) -> Resource {
        let mut resource = match env::var(ENV_RESOURCE_ATTRIBUTES) {
            Ok(s) if !s.is_empty() => parse_attribute_list(&s),
            Ok(_) | Err(_) => Resource::empty(),
        };
        if let Ok(name) = env::var(ENV_SERVICE_NAME) {
            if !name.is_empty() {
                resource = resource.merge(&Resource::new([KeyValue::new(SERVICE_NAME, name)]));
            }
        }
        resource
    }
}

/// Extract key-value pairs from a `key1=value1,key2=value2,...` string.
fn parse_attribute_list(s: &str) -> Resource {
    Resource::new(s.split_terminator(',').filter_map(|entry| {
        let (key, value) = entry.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(KeyValue::new(key.to_owned(), value.trim().to_owned()))
    }))
}

/// Detects attributes of the current process: `process.pid` and
/// `process.executable.name`.
#[derive(Debug, Default)]
pub struct ProcessResourceDetector;

impl ResourceDetector for ProcessResourceDetector {
    fn detect(&self) -> Resource {
        let mut attrs = vec![KeyValue::new("process.pid", std::process::id())];
        if let Some(name) = env::current_exe()
            .ok()
            .as_deref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            attrs.push(KeyValue::new("process.executable.name", name.to_owned()));
        }
        Resource::new(attrs)
    }
}
