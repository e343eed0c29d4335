use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a watched resource. Used as the cache key and as the key of
/// in-flight work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceId {
    pub fn new(name: impl AsRef<str>, namespace: Option<impl AsRef<str>>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            namespace: namespace.map(|ns| ns.as_ref().to_string()),
        }
    }

    pub fn namespaced(namespace: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self::new(name, Some(namespace))
    }

    pub fn cluster_scoped(name: impl AsRef<str>) -> Self {
        Self::new(name, None::<&str>)
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(name: impl AsRef<str>, namespace: Option<impl AsRef<str>>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            namespace: namespace.map(|ns| ns.as_ref().to_string()),
            ..Default::default()
        }
    }

    pub fn with_finalizer(mut self, finalizer: impl AsRef<str>) -> Self {
        self.add_finalizer(finalizer);
        self
    }

    pub fn with_label(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.labels
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Finalizers are an ordered set; adding an existing one is a no-op.
    /// Returns whether the list changed.
    pub fn add_finalizer(&mut self, finalizer: impl AsRef<str>) -> bool {
        if self.has_finalizer(finalizer.as_ref()) {
            return false;
        }
        self.finalizers.push(finalizer.as_ref().to_string());
        true
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn controller_owner(&self, kind: &str) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|owner| owner.kind == kind)
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.match_labels
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Parses `k1=v1,k2=v2`.
    pub fn parse(selector: &str) -> Option<Self> {
        let mut parsed = Self::default();
        for pair in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=')?;
            parsed = parsed.with(key.trim(), value.trim());
        }
        Some(parsed)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", pairs.join(","))
    }
}
