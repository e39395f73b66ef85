//! Core role vocabulary: `RoleDefinition`, `PersonaRole`, `CompiledRole`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{PanelError, PanelResult};
use crate::template::Template;

/// Registry id of the role that folds the persona opinions into one summary.
pub const SUMMARY_ROLE_ID: &str = "summary";

/// One persona definition as it appears in the registry source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Persona framing text.
    pub role: String,
    /// Task description.
    pub instruction: String,
    /// Tone guidance.
    #[serde(default)]
    pub style: String,
    /// Text with `{field_name}` placeholders.
    pub input_template: String,
}

/// The five reviewers that evaluate every site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaRole {
    Explorer,
    Engineer,
    Skeptic,
    Historian,
    Ecologist,
}

impl PersonaRole {
    /// Every persona, in panel order.
    pub const ALL: [PersonaRole; 5] = [
        PersonaRole::Explorer,
        PersonaRole::Engineer,
        PersonaRole::Skeptic,
        PersonaRole::Historian,
        PersonaRole::Ecologist,
    ];

    /// Registry id of this persona.
    pub fn id(self) -> &'static str {
        match self {
            PersonaRole::Explorer => "explorer",
            PersonaRole::Engineer => "engineer",
            PersonaRole::Skeptic => "skeptic",
            PersonaRole::Historian => "historian",
            PersonaRole::Ecologist => "ecologist",
        }
    }

    /// Summary template field that carries this persona's opinion.
    pub fn opinion_field(self) -> &'static str {
        match self {
            PersonaRole::Explorer => "explorer_opinion",
            PersonaRole::Engineer => "engineer_opinion",
            PersonaRole::Skeptic => "skeptic_opinion",
            PersonaRole::Historian => "historian_opinion",
            PersonaRole::Ecologist => "ecologist_opinion",
        }
    }

    /// Sampling temperature for this persona given the panel's base temperature.
    ///
    /// The explorer runs warmer and the skeptic colder (never below 0.1).
    pub fn temperature(self, base: f32) -> f32 {
        match self {
            PersonaRole::Explorer => base + 0.2,
            PersonaRole::Skeptic => (base - 0.3).max(0.1),
            _ => base,
        }
    }

    /// Look a persona up by registry id.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// The exact field set the summary template is filled from.
    pub fn opinion_fields() -> BTreeSet<String> {
        Self::ALL
            .iter()
            .map(|p| p.opinion_field().to_string())
            .collect()
    }
}

impl std::fmt::Display for PersonaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// A registered role: its id, definition and parsed template.
///
/// Immutable once built; the permitted field set is derived at compile time of
/// the role, not at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRole {
    id: String,
    definition: RoleDefinition,
    template: Template,
}

impl CompiledRole {
    /// Parse the definition's input template.
    ///
    /// Returns [`PanelError::MalformedTemplate`] naming `id` if it does not parse.
    pub fn compile(id: impl Into<String>, definition: RoleDefinition) -> PanelResult<Self> {
        let id = id.into();
        let template = Template::parse(&definition.input_template)
            .map_err(|e| PanelError::malformed(&id, e))?;
        Ok(Self {
            id,
            definition,
            template,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &RoleDefinition {
        &self.definition
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Field names the input template requires.
    pub fn placeholders(&self) -> &BTreeSet<String> {
        self.template.placeholders()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(template: &str) -> RoleDefinition {
        RoleDefinition {
            role: "r".to_string(),
            instruction: "i".to_string(),
            style: "s".to_string(),
            input_template: template.to_string(),
        }
    }

    #[test]
    fn test_persona_ids_round_trip() {
        for persona in PersonaRole::ALL {
            assert_eq!(PersonaRole::from_id(persona.id()), Some(persona));
            assert_eq!(persona.opinion_field(), format!("{}_opinion", persona.id()));
        }
        assert_eq!(PersonaRole::from_id(SUMMARY_ROLE_ID), None);
    }

    #[test]
    fn test_persona_temperatures() {
        assert!((PersonaRole::Explorer.temperature(0.7) - 0.9).abs() < 1e-6);
        assert!((PersonaRole::Skeptic.temperature(0.7) - 0.4).abs() < 1e-6);
        assert!((PersonaRole::Skeptic.temperature(0.2) - 0.1).abs() < 1e-6);
        assert!((PersonaRole::Historian.temperature(0.7) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_compile_rejects_malformed_template() {
        let err = CompiledRole::compile("broken", definition("{a")).unwrap_err();
        assert!(matches!(
            err,
            PanelError::MalformedTemplate { ref role_id, .. } if role_id == "broken"
        ));
    }

    #[test]
    fn test_style_defaults_to_empty() {
        let def: RoleDefinition = serde_json::from_str(
            r#"{"role": "r", "instruction": "i", "input_template": "{x}"}"#,
        )
        .unwrap();
        assert!(def.style.is_empty());
    }
}
