//! Template renderer: (role, fields) → [`RenderedPrompt`].
//!
//! Rendering is pure. The same role and fields always produce byte-identical
//! output, and concurrent calls with disjoint inputs need no coordination.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PanelError, PanelResult};
use crate::roles::CompiledRole;

/// Field name → text value supplied to a render call.
pub type Fields = BTreeMap<String, String>;

/// How fields the template never references are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPolicy {
    /// Extra fields are accepted and ignored.
    #[default]
    Lenient,
    /// Extra fields fail with [`PanelError::UnexpectedField`].
    Strict,
}

/// A role id plus the fields to fill its template with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub role_id: String,
    pub fields: Fields,
}

impl RenderRequest {
    pub fn new(role_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            role_id: role_id.into(),
            fields,
        }
    }

    /// A request for `role` carrying only the `available` fields its template uses.
    pub fn for_role(role: &CompiledRole, available: &Fields) -> Self {
        let fields = available
            .iter()
            .filter(|(name, _)| role.placeholders().contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self::new(role.id(), fields)
    }
}

/// A rendered prompt, sections in fixed order: role, instruction, style, input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub role_id: String,
    pub role: String,
    pub instruction: String,
    pub style: String,
    /// The filled input template.
    pub input: String,
}

impl RenderedPrompt {
    /// The four sections joined by newlines.
    pub fn text(&self) -> String {
        self.to_string()
    }

    /// System message for chat transports: role framing and tone.
    pub fn system_prompt(&self) -> String {
        format!("{}\n{}", self.role, self.style)
    }

    /// User message for chat transports: the task, a blank line, the input.
    pub fn user_prompt(&self) -> String {
        format!("{}\n\n{}", self.instruction, self.input)
    }
}

impl fmt::Display for RenderedPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\n{}\n{}",
            self.role, self.instruction, self.style, self.input
        )
    }
}

/// Render `role` against `fields`.
///
/// Every placeholder in the input template must be supplied, otherwise
/// [`PanelError::MissingField`] lists the absent names. Under
/// [`RenderPolicy::Strict`] unreferenced fields are rejected as well.
pub fn render(role: &CompiledRole, fields: &Fields, policy: RenderPolicy) -> PanelResult<RenderedPrompt> {
    let template = role.template();

    if policy == RenderPolicy::Strict {
        let extra = template.unused_in(fields);
        if !extra.is_empty() {
            return Err(PanelError::UnexpectedField {
                role_id: role.id().to_string(),
                fields: extra,
            });
        }
    }

    let input = template
        .fill(fields)
        .map_err(|missing| PanelError::MissingField {
            role_id: role.id().to_string(),
            fields: missing,
        })?;

    let definition = role.definition();
    Ok(RenderedPrompt {
        role_id: role.id().to_string(),
        role: definition.role.clone(),
        instruction: definition.instruction.clone(),
        style: definition.style.clone(),
        input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleDefinition;

    fn role(template: &str) -> CompiledRole {
        CompiledRole::compile(
            "tester",
            RoleDefinition {
                role: "ROLE".to_string(),
                instruction: "INSTRUCTION".to_string(),
                style: "STYLE".to_string(),
                input_template: template.to_string(),
            },
        )
        .unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_request_for_role_selects_referenced_fields() {
        let request = RenderRequest::for_role(
            &role("{x}"),
            &fields(&[("x", "1"), ("y", "2")]),
        );
        assert_eq!(request.role_id, "tester");
        assert_eq!(request.fields, fields(&[("x", "1")]));
    }

    #[test]
    fn test_sections_are_in_fixed_order() {
        let prompt = render(&role("x={x}"), &fields(&[("x", "1")]), RenderPolicy::Lenient).unwrap();
        assert_eq!(prompt.text(), "ROLE\nINSTRUCTION\nSTYLE\nx=1");
    }

    #[test]
    fn test_chat_split() {
        let prompt = render(&role("x={x}"), &fields(&[("x", "1")]), RenderPolicy::Lenient).unwrap();
        assert_eq!(prompt.system_prompt(), "ROLE\nSTYLE");
        assert_eq!(prompt.user_prompt(), "INSTRUCTION\n\nx=1");
    }

    #[test]
    fn test_lenient_ignores_extra_fields() {
        let prompt = render(
            &role("{x}"),
            &fields(&[("x", "1"), ("unused", "2")]),
            RenderPolicy::Lenient,
        )
        .unwrap();
        assert_eq!(prompt.input, "1");
    }

    #[test]
    fn test_strict_rejects_extra_fields() {
        let err = render(
            &role("{x}"),
            &fields(&[("x", "1"), ("unused", "2")]),
            RenderPolicy::Strict,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PanelError::UnexpectedField { ref fields, .. } if fields == &vec!["unused".to_string()]
        ));
    }

    #[test]
    fn test_missing_field_names_role_and_placeholder() {
        let err = render(&role("{x} {y}"), &fields(&[("x", "1")]), RenderPolicy::Lenient).unwrap_err();
        match err {
            PanelError::MissingField { role_id, fields } => {
                assert_eq!(role_id, "tester");
                assert_eq!(fields, vec!["y".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
