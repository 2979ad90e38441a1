//! Device tags and tag parsing.
//!
//! A tag is a `namespace/annotation:label` triple used to group and select
//! devices. Namespace and annotation are optional in the string form; an
//! absent namespace means "default". Tags are case-sensitive.
//!
//! Two namespaces are special: every device is automatically a member of the
//! "system" namespace via its auto-generated id tag, and "default" is treated
//! as an alias for "system" at selection time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{PluginError, PluginResult};

/// The namespace applied to tags that do not specify one.
pub const NAMESPACE_DEFAULT: &str = "default";

/// The namespace holding auto-generated tags for all devices.
pub const NAMESPACE_SYSTEM: &str = "system";

/// The annotation reserved for auto-generated id tags.
pub const ANNOTATION_ID: &str = "id";

/// A device tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub annotation: Option<String>,
    pub label: String,
}

fn default_namespace() -> String {
    NAMESPACE_DEFAULT.to_string()
}

impl Tag {
    /// Create a tag in the given namespace with no annotation.
    pub fn new(namespace: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            annotation: None,
            label: label.into(),
        }
    }

    /// Parse a tag from its `namespace/annotation:label` string form.
    ///
    /// Namespace and annotation are optional: `foo`, `ns/foo`, `a:foo`, and
    /// `ns/a:foo` are all valid. The `id` annotation is reserved for tags the
    /// registry generates itself.
    pub fn parse(tag: &str) -> PluginResult<Self> {
        if tag.is_empty() || tag.chars().any(char::is_whitespace) {
            return Err(PluginError::Registration(format!(
                "invalid tag string: '{tag}'"
            )));
        }

        let (namespace, rest) = match tag.split_once('/') {
            Some((ns, rest)) => (ns.to_string(), rest),
            None => (default_namespace(), tag),
        };
        let (annotation, label) = match rest.split_once(':') {
            Some((a, l)) => (Some(a.to_string()), l.to_string()),
            None => (None, rest.to_string()),
        };

        if namespace.is_empty() || label.is_empty() {
            return Err(PluginError::Registration(format!(
                "invalid tag string: '{tag}'"
            )));
        }
        if annotation.as_deref() == Some(ANNOTATION_ID) {
            return Err(PluginError::Registration(format!(
                "tag '{tag}' uses the reserved 'id' annotation"
            )));
        }

        Ok(Self {
            namespace,
            annotation,
            label,
        })
    }

    /// The auto-generated id tag for a device: `system/id:<device-id>`.
    pub(crate) fn new_id_tag(device_id: &str) -> Self {
        Self {
            namespace: NAMESPACE_SYSTEM.to_string(),
            annotation: Some(ANNOTATION_ID.to_string()),
            label: device_id.to_string(),
        }
    }

    /// The namespace this tag is filed under for selection purposes. The
    /// "default" namespace aliases to "system".
    pub fn effective_namespace(&self) -> &str {
        effective_namespace(&self.namespace)
    }
}

/// Resolve the "default" namespace alias.
pub(crate) fn effective_namespace(namespace: &str) -> &str {
    if namespace == NAMESPACE_DEFAULT {
        NAMESPACE_SYSTEM
    } else {
        namespace
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.annotation {
            Some(a) => write!(f, "{}/{}:{}", self.namespace, a, self.label),
            None => write!(f, "{}/{}", self.namespace, self.label),
        }
    }
}
