use kube::ResourceExt;
use std::fmt;

/// Identity of a managed certificate: the `namespace/name` of its `PkiSecret`.
///
/// Every per-resource structure (lifecycle records, dispatcher slots, backoff
/// state) is keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for any namespaced object; cluster-scoped objects land in `default`
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        Self::new(
            obj.namespace().unwrap_or_else(|| "default".to_string()),
            obj.name_any(),
        )
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_namespace_slash_name() {
        assert_eq!(ResourceKey::new("team-a", "web").to_string(), "team-a/web");
    }

    #[test]
    fn test_keys_with_same_name_in_other_namespace_differ() {
        assert_ne!(
            ResourceKey::new("team-a", "web"),
            ResourceKey::new("team-b", "web")
        );
    }
}
