//! Role registry: the immutable id → role store loaded once at startup.
//!
//! The source format is a JSON object keyed by role id, each value carrying
//! `role`, `instruction`, `style` and `input_template`. Duplicate ids in the
//! source are rejected rather than silently overwritten.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{PanelError, PanelResult};
use crate::render::{render, RenderPolicy, RenderRequest, RenderedPrompt};
use crate::roles::{CompiledRole, PersonaRole, RoleDefinition, SUMMARY_ROLE_ID};
use crate::site::SITE_FIELDS;

/// The persona set shipped with the crate.
const BUILTIN_ROLES: &str = include_str!("../assets/roles.json");

static GLOBAL: OnceLock<Arc<RoleRegistry>> = OnceLock::new();

/// Immutable store of compiled roles keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    roles: BTreeMap<String, CompiledRole>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and add a role.
    ///
    /// Fails with [`PanelError::DuplicateRole`] if `id` is taken, or
    /// [`PanelError::MalformedTemplate`] if the input template does not parse.
    pub fn register(&mut self, id: &str, definition: RoleDefinition) -> PanelResult<()> {
        if self.roles.contains_key(id) {
            return Err(PanelError::DuplicateRole {
                role_id: id.to_string(),
            });
        }
        let compiled = CompiledRole::compile(id, definition)?;
        debug!(role_id = %id, placeholders = compiled.placeholders().len(), "role registered");
        self.roles.insert(id.to_string(), compiled);
        Ok(())
    }

    /// Look up a role by id.
    pub fn get(&self, id: &str) -> PanelResult<&CompiledRole> {
        self.roles.get(id).ok_or_else(|| PanelError::UnknownRole {
            role_id: id.to_string(),
        })
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Build a registry from the JSON source format.
    pub fn from_json_str(source: &str) -> PanelResult<Self> {
        let RoleEntries(entries) = serde_json::from_str(source)?;
        let mut registry = Self::new();
        for (id, definition) in entries {
            registry.register(&id, definition)?;
        }
        Ok(registry)
    }

    /// Build a registry from a JSON file on disk.
    pub fn from_path(path: &Path) -> PanelResult<Self> {
        let source = std::fs::read_to_string(path)?;
        let registry = Self::from_json_str(&source)?;
        info!(path = %path.display(), roles = registry.len(), "role registry loaded");
        Ok(registry)
    }

    /// The bundled persona panel.
    pub fn builtin() -> PanelResult<Self> {
        Self::from_json_str(BUILTIN_ROLES)
    }

    /// Render a request against the role it names.
    pub fn render(&self, request: &RenderRequest, policy: RenderPolicy) -> PanelResult<RenderedPrompt> {
        render(self.get(&request.role_id)?, &request.fields, policy)
    }

    /// Check the registry can drive a full panel session.
    ///
    /// Every persona and the summary role must exist, persona templates may only
    /// reference site attribute fields, and the summary template must reference
    /// exactly the five opinion fields.
    pub fn validate_panel(&self) -> PanelResult<()> {
        for persona in PersonaRole::ALL {
            let role = self.get(persona.id())?;
            let unknown: Vec<&str> = role
                .placeholders()
                .iter()
                .map(String::as_str)
                .filter(|name| !SITE_FIELDS.contains(name))
                .collect();
            if !unknown.is_empty() {
                return Err(PanelError::MalformedTemplate {
                    role_id: persona.id().to_string(),
                    detail: format!("references non-site fields: {}", unknown.join(", ")),
                });
            }
        }

        let summary = self.get(SUMMARY_ROLE_ID)?;
        let expected = PersonaRole::opinion_fields();
        if summary.placeholders() != &expected {
            let actual: Vec<&str> = summary.placeholders().iter().map(String::as_str).collect();
            return Err(PanelError::MalformedTemplate {
                role_id: SUMMARY_ROLE_ID.to_string(),
                detail: format!(
                    "must reference exactly the opinion fields, found: {}",
                    actual.join(", ")
                ),
            });
        }
        Ok(())
    }

    /// SHA-256 hex digest of the canonical (id-sorted) registry JSON.
    pub fn fingerprint(&self) -> PanelResult<String> {
        let canonical: BTreeMap<&str, &RoleDefinition> = self
            .roles
            .iter()
            .map(|(id, role)| (id.as_str(), role.definition()))
            .collect();
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Install `registry` as the process-wide registry.
///
/// Call once at startup; a second call fails with
/// [`PanelError::RegistryAlreadyInstalled`] and leaves the first in place.
pub fn install_global(registry: RoleRegistry) -> PanelResult<Arc<RoleRegistry>> {
    let registry = Arc::new(registry);
    GLOBAL
        .set(Arc::clone(&registry))
        .map_err(|_| PanelError::RegistryAlreadyInstalled)?;
    Ok(registry)
}

/// The process-wide registry, if one has been installed.
pub fn global() -> Option<Arc<RoleRegistry>> {
    GLOBAL.get().cloned()
}

/// Map entries in source order, keeping duplicate keys visible.
struct RoleEntries(Vec<(String, RoleDefinition)>);

impl<'de> Deserialize<'de> for RoleEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RoleEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of role id to role definition")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, RoleDefinition>()? {
                    entries.push(entry);
                }
                Ok(RoleEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(template: &str) -> RoleDefinition {
        RoleDefinition {
            role: "role".to_string(),
            instruction: "instruction".to_string(),
            style: "style".to_string(),
            input_template: template.to_string(),
        }
    }

    #[test]
    fn test_builtin_registry_is_a_valid_panel() {
        let registry = RoleRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 6);
        registry.validate_panel().unwrap();
    }

    #[test]
    fn test_register_duplicate_id_fails() {
        let mut registry = RoleRegistry::new();
        registry.register("explorer", definition("{a}")).unwrap();
        let err = registry.register("explorer", definition("{b}")).unwrap_err();
        assert!(matches!(err, PanelError::DuplicateRole { ref role_id } if role_id == "explorer"));
        // First registration is untouched.
        let kept = registry.get("explorer").unwrap();
        assert!(kept.placeholders().contains("a"));
    }

    #[test]
    fn test_duplicate_key_in_source_is_rejected() {
        let source = r#"{
            "explorer": {"role": "a", "instruction": "b", "style": "c", "input_template": "{x}"},
            "explorer": {"role": "d", "instruction": "e", "style": "f", "input_template": "{y}"}
        }"#;
        let err = RoleRegistry::from_json_str(source).unwrap_err();
        assert!(matches!(err, PanelError::DuplicateRole { .. }));
    }

    #[test]
    fn test_get_unknown_role_fails() {
        let registry = RoleRegistry::new();
        let err = registry.get("oracle").unwrap_err();
        assert!(matches!(err, PanelError::UnknownRole { ref role_id } if role_id == "oracle"));
    }

    #[test]
    fn test_malformed_source_template_aborts_load() {
        let source = r#"{"explorer": {"role": "a", "instruction": "b", "style": "c", "input_template": "{{x}}"}}"#;
        let err = RoleRegistry::from_json_str(source).unwrap_err();
        assert!(matches!(err, PanelError::MalformedTemplate { .. }));
    }

    #[test]
    fn test_validate_panel_requires_every_persona() {
        let mut registry = RoleRegistry::new();
        registry.register("explorer", definition("{ndvi}")).unwrap();
        let err = registry.validate_panel().unwrap_err();
        assert!(matches!(err, PanelError::UnknownRole { ref role_id } if role_id == "engineer"));
    }

    #[test]
    fn test_validate_panel_rejects_partial_summary_template() {
        let mut registry = RoleRegistry::new();
        for persona in PersonaRole::ALL {
            registry.register(persona.id(), definition("{coordinates}")).unwrap();
        }
        registry
            .register(SUMMARY_ROLE_ID, definition("{explorer_opinion}"))
            .unwrap();
        let err = registry.validate_panel().unwrap_err();
        assert!(matches!(err, PanelError::MalformedTemplate { ref role_id, .. } if role_id == "summary"));
    }

    #[test]
    fn test_validate_panel_rejects_unknown_site_field() {
        let mut registry = RoleRegistry::builtin().unwrap();
        registry.roles.remove("ecologist");
        registry.register("ecologist", definition("{soil_carbon}")).unwrap();
        let err = registry.validate_panel().unwrap_err();
        assert!(err.to_string().contains("soil_carbon"));
    }

    #[test]
    fn test_render_request_for_unknown_role_fails() {
        let registry = RoleRegistry::builtin().unwrap();
        let request = RenderRequest::new("oracle", Default::default());
        let err = registry.render(&request, RenderPolicy::Lenient).unwrap_err();
        assert!(matches!(err, PanelError::UnknownRole { .. }));
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = RoleRegistry::builtin().unwrap();
        let b = RoleRegistry::builtin().unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);

        let mut c = RoleRegistry::new();
        c.register("explorer", definition("{ndvi}")).unwrap();
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }
}
