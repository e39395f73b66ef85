//! `{field_name}` placeholder templates.
//!
//! A template is parsed once into literal and field segments. Filling walks the
//! segments in a single pass, so substituted values are never re-scanned for
//! placeholders. There is no escape syntax: any `{` or `}` that is not part of a
//! well-formed `{name}` token makes the template malformed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is a valid regex")
    })
}

/// Why a template source could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unexpected '{brace}' at byte {offset} near `{snippet}`")]
    UnexpectedBrace {
        brace: char,
        offset: usize,
        snippet: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed input template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
}

impl Template {
    /// Parse `source`, rejecting nested, empty, unbalanced or illegal placeholders.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut placeholders = BTreeSet::new();
        let mut cursor = 0;

        for token in placeholder_pattern().find_iter(source) {
            push_literal(&mut segments, source, cursor, token.start())?;
            let name = &source[token.start() + 1..token.end() - 1];
            placeholders.insert(name.to_string());
            segments.push(Segment::Field(name.to_string()));
            cursor = token.end();
        }
        push_literal(&mut segments, source, cursor, source.len())?;

        Ok(Self {
            source: source.to_string(),
            segments,
            placeholders,
        })
    }

    /// The raw template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every field name the template references, sorted.
    pub fn placeholders(&self) -> &BTreeSet<String> {
        &self.placeholders
    }

    /// Placeholder names absent from `fields`, sorted.
    pub fn missing_from(&self, fields: &BTreeMap<String, String>) -> Vec<String> {
        self.placeholders
            .iter()
            .filter(|name| !fields.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Keys of `fields` the template never references, sorted.
    pub fn unused_in(&self, fields: &BTreeMap<String, String>) -> Vec<String> {
        fields
            .keys()
            .filter(|key| !self.placeholders.contains(*key))
            .cloned()
            .collect()
    }

    /// Substitute every placeholder. Returns the missing names on failure.
    pub fn fill(&self, fields: &BTreeMap<String, String>) -> Result<String, Vec<String>> {
        let missing = self.missing_from(fields);
        if !missing.is_empty() {
            return Err(missing);
        }

        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    if let Some(value) = fields.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn push_literal(
    segments: &mut Vec<Segment>,
    source: &str,
    start: usize,
    end: usize,
) -> Result<(), TemplateError> {
    let literal = &source[start..end];
    if let Some(pos) = literal.find(|c: char| c == '{' || c == '}') {
        let offset = start + pos;
        let snippet: String = source[offset..].chars().take(24).collect();
        let brace = if literal[pos..].starts_with('{') {
            '{'
        } else {
            '}'
        };
        return Err(TemplateError::UnexpectedBrace {
            brace,
            offset,
            snippet,
        });
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal.to_string()));
    }
    Ok(())
}
