//! Channel binding registry.
//!
//! The registry is assembled once at startup through [`RegistryBuilder`] and
//! is immutable afterwards. Components that need it hold an
//! `Arc<BindingRegistry>`.

use std::collections::HashMap;
use std::path::Path;

use chanq_proto::{BindingsDocument, ChannelBinding};

use crate::error::Error;

/// Immutable set of channel bindings, kept in declaration order.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    bindings: Vec<ChannelBinding>,
    by_entity: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl BindingRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build a registry from a sequence of bindings.
    pub fn from_bindings<I>(bindings: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = ChannelBinding>,
    {
        let mut builder = Self::builder();
        for binding in bindings {
            builder.register_binding(binding)?;
        }
        Ok(builder.build())
    }

    /// Build a registry from a parsed bindings document.
    pub fn from_document(document: &BindingsDocument) -> Result<Self, Error> {
        Self::from_bindings(document.channels.iter().cloned())
    }

    /// Read a JSON bindings document from disk and build a registry from it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let document = BindingsDocument::from_json(&text)?;
        Self::from_document(&document)
    }

    /// Find the binding for an entity type.
    pub fn resolve(&self, entity_type: &str) -> Result<&ChannelBinding, Error> {
        self.by_entity
            .get(entity_type)
            .map(|&idx| &self.bindings[idx])
            .ok_or_else(|| Error::UnknownEntity(entity_type.to_string()))
    }

    /// Find a binding by channel name.
    pub fn channel(&self, name: &str) -> Result<&ChannelBinding, Error> {
        self.by_name
            .get(name)
            .map(|&idx| &self.bindings[idx])
            .ok_or_else(|| Error::UnknownChannel(name.to_string()))
    }

    /// Iterate bindings in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelBinding> {
        self.bindings.iter()
    }

    /// Iterate bindings whose channel requires leases.
    pub fn locked_channels(&self) -> impl Iterator<Item = &ChannelBinding> {
        self.bindings.iter().filter(|b| b.lock_required)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the registry holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Export the bindings as a document.
    pub fn to_document(&self) -> BindingsDocument {
        BindingsDocument {
            channels: self.bindings.clone(),
        }
    }
}

/// Collects bindings and checks their invariants before freezing them.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: BindingRegistry,
}

impl RegistryBuilder {
    /// Register a binding.
    ///
    /// Registering an identical binding twice is accepted. A name reused for
    /// another entity type, an entity type bound under a second name, or a
    /// changed lock policy fails with [`Error::DuplicateBinding`].
    pub fn register(
        &mut self,
        name: &str,
        entity_type: &str,
        lock_required: bool,
    ) -> Result<&mut Self, Error> {
        self.register_binding(ChannelBinding {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            lock_required,
        })
    }

    /// Register an already constructed binding.
    pub fn register_binding(&mut self, binding: ChannelBinding) -> Result<&mut Self, Error> {
        validate_name(&binding.name)?;
        if binding.entity_type.trim().is_empty() {
            return Err(Error::InvalidBinding(format!(
                "channel {} has an empty entity type",
                binding.name
            )));
        }

        let conflict = {
            let registry = &self.registry;
            registry
                .by_name
                .get(&binding.name)
                .or_else(|| registry.by_entity.get(&binding.entity_type))
                .map(|&idx| &registry.bindings[idx])
                .map(|existing| (*existing == binding, describe(existing)))
        };

        if let Some((identical, existing)) = conflict {
            if identical {
                return Ok(self);
            }
            return Err(Error::DuplicateBinding {
                name: binding.name,
                entity_type: binding.entity_type,
                existing,
            });
        }

        let registry = &mut self.registry;
        let idx = registry.bindings.len();
        registry.by_name.insert(binding.name.clone(), idx);
        registry.by_entity.insert(binding.entity_type.clone(), idx);

        tracing::debug!(
            channel = %binding.name,
            entity_type = %binding.entity_type,
            lock_required = binding.lock_required,
            "channel binding registered"
        );

        registry.bindings.push(binding);
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> BindingRegistry {
        self.registry
    }
}

fn describe(binding: &ChannelBinding) -> String {
    format!(
        "{} -> {} ({})",
        binding.name,
        binding.entity_type,
        if binding.lock_required { "locked" } else { "unlocked" }
    )
}

/// Channel names become part of storage tree names.
fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidBinding("channel name is empty".to_string()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::InvalidBinding(format!(
            "channel name {name:?} contains {c:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nix_registry() -> BindingRegistry {
        let mut builder = BindingRegistry::builder();
        builder
            .register("nix_channel_channel", "NixChannel", false)
            .unwrap()
            .register("nix_evaluation_channel", "NixEvaluation", true)
            .unwrap()
            .register("nix_derivation_channel", "NixDerivation", false)
            .unwrap()
            .register("cve_record_channel", "CveRecord", true)
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_resolve_returns_registered_binding() {
        let registry = nix_registry();

        assert_eq!(registry.len(), 4);
        assert_eq!(
            registry.resolve("NixEvaluation").unwrap(),
            &ChannelBinding::locked("nix_evaluation_channel", "NixEvaluation")
        );
        assert_eq!(
            registry.resolve("NixChannel").unwrap(),
            &ChannelBinding::new("nix_channel_channel", "NixChannel")
        );
        assert_eq!(
            registry.channel("cve_record_channel").unwrap().entity_type,
            "CveRecord"
        );
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = nix_registry();
        assert!(matches!(registry.resolve("User"), Err(Error::UnknownEntity(e)) if e == "User"));
        assert!(matches!(registry.channel("nope"), Err(Error::UnknownChannel(_))));
    }

    #[test]
    fn test_same_entity_under_second_name_rejected() {
        let mut builder = BindingRegistry::builder();
        builder.register("cve_record_channel", "CveRecord", true).unwrap();

        let err = builder.register("cve_again", "CveRecord", true).unwrap_err();
        assert!(matches!(err, Error::DuplicateBinding { ref name, .. } if name == "cve_again"));
    }

    #[test]
    fn test_name_reused_for_other_entity_rejected() {
        let mut builder = BindingRegistry::builder();
        builder.register("cve_record_channel", "CveRecord", true).unwrap();

        let err = builder.register("cve_record_channel", "NixChannel", false).unwrap_err();
        assert!(matches!(err, Error::DuplicateBinding { .. }));
    }

    #[test]
    fn test_lock_policy_cannot_change() {
        let mut builder = BindingRegistry::builder();
        builder.register("cve_record_channel", "CveRecord", true).unwrap();

        assert!(builder.register("cve_record_channel", "CveRecord", false).is_err());
    }

    #[test]
    fn test_identical_registration_is_idempotent() {
        let mut builder = BindingRegistry::builder();
        builder
            .register("nix_channel_channel", "NixChannel", false)
            .unwrap()
            .register("nix_channel_channel", "NixChannel", false)
            .unwrap();

        assert_eq!(builder.build().len(), 1);
    }

    #[test]
    fn test_invalid_names() {
        let mut builder = BindingRegistry::builder();
        assert!(matches!(builder.register("", "A", false), Err(Error::InvalidBinding(_))));
        assert!(matches!(builder.register("a b", "A", false), Err(Error::InvalidBinding(_))));
        assert!(matches!(builder.register("a:b", "A", false), Err(Error::InvalidBinding(_))));
        assert!(matches!(builder.register("ok", " ", false), Err(Error::InvalidBinding(_))));
    }

    #[test]
    fn test_declaration_order_and_locked_filter() {
        let registry = nix_registry();
        let names: Vec<&str> = registry.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "nix_channel_channel",
                "nix_evaluation_channel",
                "nix_derivation_channel",
                "cve_record_channel"
            ]
        );

        let locked: Vec<&str> = registry.locked_channels().map(|b| b.entity_type.as_str()).collect();
        assert_eq!(locked, vec!["NixEvaluation", "CveRecord"]);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");
        std::fs::write(
            &path,
            r#"{"channels":[{"name":"cve_record_channel","entity_type":"CveRecord","lock_required":true}]}"#,
        )
        .unwrap();

        let registry = BindingRegistry::from_json_file(&path).unwrap();
        assert!(registry.resolve("CveRecord").unwrap().lock_required);

        let missing = BindingRegistry::from_json_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_document_with_conflict_fails() {
        let document = BindingsDocument {
            channels: vec![
                ChannelBinding::new("a", "Thing"),
                ChannelBinding::new("b", "Thing"),
            ],
        };
        assert!(matches!(
            BindingRegistry::from_document(&document),
            Err(Error::DuplicateBinding { .. })
        ));
    }
}
