//! The device registry.
//!
//! The registry owns all device handlers and device instances for the life
//! of the plugin process. It is populated during setup, then frozen before
//! the scheduler starts; after freeze it is shared read-only and no field of
//! any device may change. Mutation after freeze is a programming error and
//! is rejected, not tolerated.
//!
//! Selection resolves a [`DeviceSelector`] to a set of devices through three
//! indices: the id index, the alias index, and a three-level tag index
//! (`namespace -> annotation -> label -> devices` in insertion order).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{Device, DeviceHandler};
use crate::errors::{PluginError, PluginResult};
use crate::tag::{effective_namespace, Tag, ANNOTATION_ID, NAMESPACE_SYSTEM};

/// Selects zero or more devices: by id (or alias), or by the intersection of
/// a set of tags. An empty selector means "all devices in the system
/// namespace".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelector {
    /// Device id or alias. Takes precedence over tags when set.
    pub id: Option<String>,
    /// Tags a device must all carry to match.
    pub tags: Vec<Tag>,
}

impl DeviceSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            tags: Vec::new(),
        }
    }

    pub fn by_tags(tags: Vec<Tag>) -> Self {
        Self { id: None, tags }
    }
}

type TagIndex = HashMap<String, HashMap<String, HashMap<String, Vec<Arc<Device>>>>>;

/// Registry of device handlers and device instances.
pub struct DeviceRegistry {
    plugin_id: Uuid,
    handlers: HashMap<String, Arc<DeviceHandler>>,
    devices: HashMap<String, Arc<Device>>,
    aliases: HashMap<String, String>,
    /// Device ids in registration order.
    order: Vec<String>,
    tags: TagIndex,
    frozen: bool,
}

impl DeviceRegistry {
    /// Create an empty registry. Device ids are derived under the plugin id
    /// namespace, so the same device config yields the same id across
    /// restarts of the same plugin.
    pub fn new(plugin_id: Uuid) -> Self {
        Self {
            plugin_id,
            handlers: HashMap::new(),
            devices: HashMap::new(),
            aliases: HashMap::new(),
            order: Vec::new(),
            tags: HashMap::new(),
            frozen: false,
        }
    }

    /// Register a device handler. Only valid before freeze; duplicate names
    /// are rejected.
    pub fn add_handler(&mut self, handler: DeviceHandler) -> PluginResult<()> {
        if self.frozen {
            return Err(PluginError::RegistryFrozen(format!(
                "cannot add handler '{}'",
                handler.name()
            )));
        }
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(PluginError::Registration(format!(
                "duplicate handler name: '{name}'"
            )));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Register a device, binding it to its handler and deriving its id.
    /// Returns the derived id.
    pub fn add_device(&mut self, mut device: Device) -> PluginResult<String> {
        if self.frozen {
            return Err(PluginError::RegistryFrozen(format!(
                "cannot add device of type '{}'",
                device.kind
            )));
        }

        let handler = self
            .handlers
            .get(device.handler_name())
            .cloned()
            .ok_or_else(|| {
                PluginError::Registration(format!(
                    "no handler found with name: '{}'",
                    device.handler_name()
                ))
            })?;

        let id = Uuid::new_v5(&self.plugin_id, device.fingerprint().as_bytes())
            .simple()
            .to_string();
        if self.devices.contains_key(&id) {
            return Err(PluginError::Registration(format!(
                "duplicate device: '{id}' ({})",
                device.fingerprint()
            )));
        }
        if let Some(alias) = &device.alias {
            if self.aliases.contains_key(alias) {
                return Err(PluginError::Registration(format!(
                    "duplicate device alias: '{alias}'"
                )));
            }
        }

        device.bind(id.clone(), handler);
        // The id tag makes every device selectable and a member of the
        // system namespace.
        device.tags.push(Tag::new_id_tag(&id));

        let device = Arc::new(device);
        for tag in &device.tags {
            self.index_tag(tag, device.clone());
        }
        if let Some(alias) = &device.alias {
            self.aliases.insert(alias.clone(), id.clone());
        }
        self.order.push(id.clone());
        self.devices.insert(id.clone(), device);
        Ok(id)
    }

    fn index_tag(&mut self, tag: &Tag, device: Arc<Device>) {
        let namespace = effective_namespace(&tag.namespace).to_string();
        let annotation = tag.annotation.clone().unwrap_or_default();
        let entry = self
            .tags
            .entry(namespace)
            .or_default()
            .entry(annotation)
            .or_default()
            .entry(tag.label.clone())
            .or_default();
        if !entry.iter().any(|d| d.id() == device.id()) {
            entry.push(device);
        }
    }

    /// Mark the registry read-only. Registration calls fail afterwards.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn handler(&self, name: &str) -> Option<&Arc<DeviceHandler>> {
        self.handlers.get(name)
    }

    /// All registered handlers, in no particular order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<DeviceHandler>> {
        self.handlers.values()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).cloned()
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<Arc<Device>> {
        self.aliases.get(alias).and_then(|id| self.get(id))
    }

    /// Look up a device by id, falling back to alias.
    pub fn find(&self, id_or_alias: &str) -> Option<Arc<Device>> {
        self.get(id_or_alias)
            .or_else(|| self.get_by_alias(id_or_alias))
    }

    /// All devices, in registration order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Devices bound to the named handler, in registration order.
    pub fn devices_for_handler(&self, name: &str) -> Vec<Arc<Device>> {
        self.devices()
            .into_iter()
            .filter(|d| d.handler_name() == name)
            .collect()
    }

    /// Handlers with a read or bulk read function and at least one device.
    pub fn readable_handlers(&self) -> Vec<Arc<DeviceHandler>> {
        self.handlers
            .values()
            .filter(|h| h.read_fn().is_some() || h.bulk_read_fn().is_some())
            .filter(|h| !self.devices_for_handler(h.name()).is_empty())
            .cloned()
            .collect()
    }

    /// Whether any registered device can be written.
    pub fn has_writable_devices(&self) -> bool {
        self.devices.values().any(|d| d.is_writable())
    }

    /// All devices whose handler defines a listen function, in registration
    /// order.
    pub fn listener_devices(&self) -> Vec<Arc<Device>> {
        self.devices()
            .into_iter()
            .filter(|d| d.handler().is_some_and(|h| h.listen_fn().is_some()))
            .collect()
    }

    /// Resolve a selector to a set of devices.
    ///
    /// Id selection not matching any device is an error; tag selection over
    /// unknown tags yields an empty set without error.
    pub fn select(&self, selector: &DeviceSelector) -> PluginResult<Vec<Arc<Device>>> {
        // An empty id string means "unset", not a lookup for "".
        if let Some(id) = selector.id.as_deref().filter(|id| !id.is_empty()) {
            return self
                .find(id)
                .map(|d| vec![d])
                .ok_or(PluginError::NoDeviceForSelector);
        }

        if selector.tags.is_empty() {
            return Ok(self.namespace_devices(NAMESPACE_SYSTEM));
        }

        // A device matches iff it carries every tag in the selector.
        let mut matched: Option<HashSet<String>> = None;
        for tag in &selector.tags {
            let ids: HashSet<String> = self
                .tag_devices(tag)
                .iter()
                .map(|d| d.id().to_string())
                .collect();
            matched = Some(match matched {
                None => ids,
                Some(current) => current.intersection(&ids).cloned().collect(),
            });
            if matched.as_ref().is_some_and(HashSet::is_empty) {
                return Ok(Vec::new());
            }
        }

        let matched = matched.unwrap_or_default();
        Ok(self
            .order
            .iter()
            .filter(|id| matched.contains(*id))
            .filter_map(|id| self.devices.get(id).cloned())
            .collect())
    }

    /// Devices carrying the given tag, in tag-index insertion order.
    fn tag_devices(&self, tag: &Tag) -> Vec<Arc<Device>> {
        let namespace = effective_namespace(&tag.namespace);
        let annotation = tag.annotation.as_deref().unwrap_or_default();
        self.tags
            .get(namespace)
            .and_then(|a| a.get(annotation))
            .and_then(|l| l.get(&tag.label))
            .cloned()
            .unwrap_or_default()
    }

    /// All devices tagged into the given namespace, deduplicated, in
    /// registration order. Auto-generated id tags do not count as namespace
    /// membership here -- a device is "in" a namespace only through the tags
    /// it was configured with.
    fn namespace_devices(&self, namespace: &str) -> Vec<Arc<Device>> {
        let Some(annotations) = self.tags.get(effective_namespace(namespace)) else {
            return Vec::new();
        };
        let ids: HashSet<&str> = annotations
            .iter()
            .filter(|(annotation, _)| annotation.as_str() != ANNOTATION_ID)
            .flat_map(|(_, labels)| labels.values())
            .flatten()
            .map(|d| d.id())
            .collect();
        self.order
            .iter()
            .filter(|id| ids.contains(id.as_str()))
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Reading;

    fn test_registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(Uuid::new_v4());
        registry
            .add_handler(
                DeviceHandler::builder("temperature")
                    .read(|_| async { Ok(vec![Reading::new("temperature", 20)]) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_add_handler_rejects_duplicate() {
        let mut registry = test_registry();
        let dup = DeviceHandler::builder("temperature").build().unwrap();
        assert!(registry.add_handler(dup).is_err());
    }

    #[test]
    fn test_add_device_unknown_handler() {
        let mut registry = test_registry();
        let result = registry.add_device(Device::new("humidity", "humidity"));
        assert!(result.is_err());
    }

    #[test]
    fn test_add_device_binds_and_indexes() {
        let mut registry = test_registry();
        let id = registry
            .add_device(Device::new("temperature", "temperature").with_alias("temp-1"))
            .unwrap();

        let device = registry.get(&id).unwrap();
        assert_eq!(device.id(), id);
        assert!(device.handler().is_some());
        // The id tag was appended at registration.
        assert!(device.tags.iter().any(|t| t.label == id));

        assert_eq!(registry.get_by_alias("temp-1").unwrap().id(), id);
        assert_eq!(registry.find(&id).unwrap().id(), id);
        assert_eq!(registry.find("temp-1").unwrap().id(), id);
    }

    #[test]
    fn test_device_ids_are_deterministic() {
        let plugin_id = Uuid::new_v4();
        let make = || {
            let mut registry = DeviceRegistry::new(plugin_id);
            registry
                .add_handler(
                    DeviceHandler::builder("temperature")
                        .read(|_| async { Ok(vec![]) })
                        .build()
                        .unwrap(),
                )
                .unwrap();
            registry
                .add_device(Device::new("temperature", "temperature").with_alias("t"))
                .unwrap()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_add_device_rejects_duplicates() {
        let mut registry = test_registry();
        registry
            .add_device(Device::new("temperature", "temperature"))
            .unwrap();

        // Identical config fingerprints to the same id.
        let result = registry.add_device(Device::new("temperature", "temperature"));
        assert!(result.is_err());

        // Distinct device, duplicate alias.
        registry
            .add_device(
                Device::new("temperature", "temperature")
                    .with_alias("dup")
                    .with_context([("zone".to_string(), "1".to_string())].into()),
            )
            .unwrap();
        let result = registry.add_device(
            Device::new("temperature", "temperature")
                .with_alias("dup")
                .with_context([("zone".to_string(), "2".to_string())].into()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let mut registry = test_registry();
        registry.freeze();
        assert!(registry.is_frozen());

        let result = registry.add_device(Device::new("temperature", "temperature"));
        assert!(matches!(result, Err(PluginError::RegistryFrozen(_))));

        let handler = DeviceHandler::builder("other").build().unwrap();
        assert!(matches!(
            registry.add_handler(handler),
            Err(PluginError::RegistryFrozen(_))
        ));
    }

    #[test]
    fn test_select_by_id_and_alias() {
        let mut registry = test_registry();
        let id = registry
            .add_device(Device::new("temperature", "temperature").with_alias("temp-1"))
            .unwrap();

        let devices = registry.select(&DeviceSelector::by_id(&id)).unwrap();
        assert_eq!(devices.len(), 1);

        let devices = registry.select(&DeviceSelector::by_id("temp-1")).unwrap();
        assert_eq!(devices[0].id(), id);

        let result = registry.select(&DeviceSelector::by_id("missing"));
        assert!(matches!(result, Err(PluginError::NoDeviceForSelector)));
    }

    #[test]
    fn test_select_empty_defaults_to_system_namespace() {
        let mut registry = test_registry();
        let id1 = registry
            .add_device(
                Device::new("temperature", "temperature").with_tag(Tag::parse("foo").unwrap()),
            )
            .unwrap();
        // Tagged into another namespace only: not part of the default
        // selection, even though its id tag lives in "system".
        let _id2 = registry
            .add_device(
                Device::new("temperature", "temperature")
                    .with_tag(Tag::parse("other/bar").unwrap())
                    .with_context([("zone".to_string(), "2".to_string())].into()),
            )
            .unwrap();
        // No tags at all: selectable by id, not by the empty selector.
        let _id3 = registry
            .add_device(
                Device::new("temperature", "temperature")
                    .with_context([("zone".to_string(), "3".to_string())].into()),
            )
            .unwrap();

        let devices = registry.select(&DeviceSelector::all()).unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec![id1]);
    }

    #[test]
    fn test_select_by_tag_intersection() {
        let mut registry = test_registry();
        let id1 = registry
            .add_device(
                Device::new("temperature", "temperature")
                    .with_tag(Tag::parse("site/rack:r1").unwrap())
                    .with_tag(Tag::parse("site/zone:z1").unwrap()),
            )
            .unwrap();
        let _id2 = registry
            .add_device(
                Device::new("temperature", "temperature")
                    .with_tag(Tag::parse("site/rack:r1").unwrap())
                    .with_tag(Tag::parse("site/zone:z2").unwrap())
                    .with_context([("n".to_string(), "2".to_string())].into()),
            )
            .unwrap();

        // One shared tag matches both.
        let devices = registry
            .select(&DeviceSelector::by_tags(vec![
                Tag::parse("site/rack:r1").unwrap()
            ]))
            .unwrap();
        assert_eq!(devices.len(), 2);

        // The intersection narrows to one.
        let devices = registry
            .select(&DeviceSelector::by_tags(vec![
                Tag::parse("site/rack:r1").unwrap(),
                Tag::parse("site/zone:z1").unwrap(),
            ]))
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), id1);
    }

    #[test]
    fn test_select_unknown_tag_is_empty_not_error() {
        let registry = test_registry();
        let devices = registry
            .select(&DeviceSelector::by_tags(vec![
                Tag::parse("nonexistent/tag").unwrap()
            ]))
            .unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_select_default_namespace_aliases_system() {
        let mut registry = test_registry();
        let id = registry
            .add_device(
                Device::new("temperature", "temperature").with_tag(Tag::parse("foo").unwrap()),
            )
            .unwrap();

        // The tag was written in the "default" namespace; selecting it via
        // either spelling matches.
        let devices = registry
            .select(&DeviceSelector::by_tags(vec![Tag::new(
                NAMESPACE_SYSTEM,
                "foo",
            )]))
            .unwrap();
        assert_eq!(devices[0].id(), id);

        let devices = registry
            .select(&DeviceSelector::by_tags(vec![Tag::parse("foo").unwrap()]))
            .unwrap();
        assert_eq!(devices[0].id(), id);
    }

    #[test]
    fn test_select_is_stable_after_freeze() {
        let mut registry = test_registry();
        for i in 0..5 {
            registry
                .add_device(
                    Device::new("temperature", "temperature")
                        .with_tag(Tag::parse("site/rack:r1").unwrap())
                        .with_context([("n".to_string(), i.to_string())].into()),
                )
                .unwrap();
        }
        registry.freeze();

        let selector = DeviceSelector::by_tags(vec![Tag::parse("site/rack:r1").unwrap()]);
        let first: Vec<_> = registry
            .select(&selector)
            .unwrap()
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        for _ in 0..10 {
            let again: Vec<_> = registry
                .select(&selector)
                .unwrap()
                .iter()
                .map(|d| d.id().to_string())
                .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_devices_for_handler_and_capability_queries() {
        let mut registry = test_registry();
        registry
            .add_handler(
                DeviceHandler::builder("led")
                    .write(|_, _| async { Ok(()) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .add_handler(
                DeviceHandler::builder("pressure")
                    .listen(|_, _| async { Ok(()) })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        registry
            .add_device(Device::new("temperature", "temperature"))
            .unwrap();
        registry.add_device(Device::new("led", "led")).unwrap();
        registry
            .add_device(Device::new("pressure", "pressure"))
            .unwrap();

        assert_eq!(registry.devices_for_handler("temperature").len(), 1);
        assert!(registry.has_writable_devices());
        assert_eq!(registry.listener_devices().len(), 1);

        // The listen-only handler is not driven by the read loop.
        let readable: Vec<_> = registry
            .readable_handlers()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(readable, vec!["temperature".to_string()]);
    }
}
