//! Label vocabulary for managed resources.
//!
//! Every container and volume created by the adapter carries labels from this
//! module, and every lookup and garbage-collection decision matches against
//! them. The key names are the durable state layout: reconciliation and
//! delete must agree on them exactly, so they live in one place.

use std::collections::BTreeMap;

/// Label key carrying the owning component name.
pub const COMPONENT: &str = "component";

/// Label key carrying the container unit alias within a component.
pub const ALIAS: &str = "alias";

/// Label key classifying a managed volume (`source`, `bootstrap` or `storage`).
pub const TYPE: &str = "type";

/// Label key carrying the devfile-declared volume name on storage volumes.
pub const STORAGE_NAME: &str = "storage-name";

/// `type` value for the source-sync volume.
pub const TYPE_SOURCE: &str = "source";

/// `type` value for the bootstrap (supervisor payload) volume.
pub const TYPE_BOOTSTRAP: &str = "bootstrap";

/// `type` value for declared persistent storage volumes.
pub const TYPE_STORAGE: &str = "storage";

/// Labels identifying any resource of a component.
pub fn component_labels(component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(COMPONENT.to_string(), component.to_string());
    labels
}

/// Labels identifying the container of one declared unit.
pub fn unit_labels(component: &str, alias: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(component);
    labels.insert(ALIAS.to_string(), alias.to_string());
    labels
}

/// Labels identifying a component's source-sync volume.
pub fn source_volume_labels(component: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(component);
    labels.insert(TYPE.to_string(), TYPE_SOURCE.to_string());
    labels
}

/// Labels identifying a component's bootstrap volume.
pub fn bootstrap_volume_labels(component: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(component);
    labels.insert(TYPE.to_string(), TYPE_BOOTSTRAP.to_string());
    labels
}

/// Labels identifying a declared persistent storage volume.
pub fn storage_volume_labels(component: &str, storage_name: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(component);
    labels.insert(TYPE.to_string(), TYPE_STORAGE.to_string());
    labels.insert(STORAGE_NAME.to_string(), storage_name.to_string());
    labels
}

/// True when `labels` contains every entry of `selector` with equal values.
pub fn matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|found| found == v))
}

/// The delete-path ownership predicate: a volume belongs to `component` only
/// if it carries the exact component label AND is either a system volume
/// (`type` of `source` or `bootstrap`) or a declared storage volume (any
/// non-blank `storage-name`). Near-miss keys or values never match, so
/// user-managed volumes that merely resemble the naming convention survive.
pub fn is_owned_volume(labels: &BTreeMap<String, String>, component: &str) -> bool {
    if labels.get(COMPONENT).map(String::as_str) != Some(component) {
        return false;
    }
    if labels
        .get(STORAGE_NAME)
        .is_some_and(|name| !name.trim().is_empty())
    {
        return true;
    }
    matches!(
        labels.get(TYPE).map(String::as_str),
        Some(TYPE_SOURCE) | Some(TYPE_BOOTSTRAP)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matching() {
        let labels = labels_of(&[(COMPONENT, "web"), (ALIAS, "runtime")]);
        assert!(matches(&labels, &component_labels("web")));
        assert!(matches(&labels, &unit_labels("web", "runtime")));
        assert!(!matches(&labels, &unit_labels("web", "db")));
        assert!(!matches(&labels, &component_labels("other")));
    }

    #[test]
    fn test_owned_volume_system_types() {
        assert!(is_owned_volume(&source_volume_labels("web"), "web"));
        assert!(is_owned_volume(&bootstrap_volume_labels("web"), "web"));
        assert!(is_owned_volume(&storage_volume_labels("web", "myvol"), "web"));
        assert!(!is_owned_volume(&source_volume_labels("web"), "other"));
    }

    #[test]
    fn test_owned_volume_rejects_near_miss_labels() {
        // A type value that only resembles the managed vocabulary.
        let near_type = labels_of(&[(COMPONENT, "web"), (TYPE, "source-but-not-really")]);
        assert!(!is_owned_volume(&near_type, "web"));

        // A key that only resembles the storage-name key.
        let near_key = labels_of(&[(COMPONENT, "web"), ("storage-name-but-not-really", "x")]);
        assert!(!is_owned_volume(&near_key, "web"));

        // A blank storage-name does not claim ownership.
        let blank = labels_of(&[(COMPONENT, "web"), (STORAGE_NAME, "  ")]);
        assert!(!is_owned_volume(&blank, "web"));
    }
}
