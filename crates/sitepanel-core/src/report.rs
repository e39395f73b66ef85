//! Evaluation artifacts: per-site JSON, the failure ledger, and the Markdown
//! and CSV dialogue summaries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::render::Fields;
use crate::roles::PersonaRole;
use crate::site::validate_site_id;

/// File name of the ledger listing sites that failed evaluation.
pub const FAILURES_FILE: &str = "retry_failed.json";

/// Label written to the CSV `version` column when runs are not grouped.
pub const DEFAULT_VERSION_LABEL: &str = "all";

/// Site identity and the fields the personas were shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadata {
    pub site_id: String,
    pub session_id: Uuid,
    /// Digest of the role registry the prompts were rendered from.
    pub registry_fingerprint: String,
    #[serde(flatten)]
    pub fields: Fields,
}

/// The result of one completed session, persisted as `<site_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteEvaluation {
    pub site_metadata: SiteMetadata,
    /// Persona id → opinion.
    pub characters: BTreeMap<String, String>,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}

impl SiteEvaluation {
    pub fn site_id(&self) -> &str {
        &self.site_metadata.site_id
    }
}

/// A site whose session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSite {
    pub site_id: String,
    pub error: String,
}

/// Write `<dir>/<site_id>.json` in pretty JSON.
///
/// Fails for ids that would land outside `dir` or on the failure ledger.
pub fn write_evaluation_json(dir: &Path, evaluation: &SiteEvaluation) -> Result<PathBuf> {
    let file_name = format!("{}.json", evaluation.site_id());
    validate_site_id(evaluation.site_id())?;
    if file_name == FAILURES_FILE {
        bail!("site id {:?} collides with the failure ledger", evaluation.site_id());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let path = dir.join(file_name);
    let content =
        serde_json::to_string_pretty(evaluation).context("serialize site evaluation")?;
    std::fs::write(&path, content).with_context(|| format!("write {:?}", path))?;
    Ok(path)
}

/// Write `<dir>/retry_failed.json`.
pub fn write_failures_json(dir: &Path, failures: &[FailedSite]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let path = dir.join(FAILURES_FILE);
    let content = serde_json::to_string_pretty(failures).context("serialize failures")?;
    std::fs::write(&path, content).with_context(|| format!("write {:?}", path))?;
    Ok(path)
}

/// Read every evaluation JSON under `dir` (not recursive), sorted by site id.
///
/// The failure ledger is skipped.
pub fn load_evaluations(dir: &Path) -> Result<Vec<SiteEvaluation>> {
    let mut evaluations = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {:?}", dir))? {
        let path = entry?.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let is_ledger = path.file_name().is_some_and(|name| name == FAILURES_FILE);
        if !is_json || is_ledger {
            continue;
        }
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("read {:?}", path))?;
        let evaluation: SiteEvaluation =
            serde_json::from_str(&content).with_context(|| format!("parse {:?}", path))?;
        evaluations.push(evaluation);
    }
    evaluations.sort_by(|a, b| a.site_id().cmp(b.site_id()));
    Ok(evaluations)
}

/// Cut `text` to at most `max_len` characters, marking the cut with `…`.
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_len.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Render the Markdown dialogue summary.
///
/// One section per site: the summary, then one bullet per persona in panel
/// order with the opinion cut to `max_len` characters.
pub fn render_dialogue_summary_md(evaluations: &[SiteEvaluation], max_len: usize) -> String {
    let mut out = String::new();
    out.push_str("# Character Dialogue Summary\n");
    for evaluation in evaluations {
        out.push_str(&format!("\n### {}\n\n", evaluation.site_id()));
        out.push_str(&format!("**Summary**: {}\n\n", single_line(&evaluation.summary)));
        for persona in PersonaRole::ALL {
            if let Some(opinion) = evaluation.characters.get(persona.id()) {
                out.push_str(&format!(
                    "- **{}**: {}\n",
                    capitalize(persona.id()),
                    truncate(&single_line(opinion), max_len)
                ));
            }
        }
    }
    out
}

/// Write the Markdown dialogue summary to `path`.
pub fn write_dialogue_summary_md(
    path: &Path,
    evaluations: &[SiteEvaluation],
    max_len: usize,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let md = render_dialogue_summary_md(evaluations, max_len);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render the CSV dialogue table.
///
/// Columns: `version, site_id, summary`, then one per persona in panel order.
/// Every cell is a single line; opinions are cut to `max_len` characters.
pub fn render_dialogue_summary_csv(
    evaluations: &[SiteEvaluation],
    max_len: usize,
    version: &str,
) -> String {
    let mut header = vec!["version", "site_id", "summary"];
    header.extend(PersonaRole::ALL.iter().map(|p| p.id()));
    let mut out = csv_record(header);

    for evaluation in evaluations {
        let summary = single_line(&evaluation.summary);
        let opinions: Vec<String> = PersonaRole::ALL
            .iter()
            .map(|persona| {
                let opinion = evaluation
                    .characters
                    .get(persona.id())
                    .map(String::as_str)
                    .unwrap_or_default();
                truncate(&single_line(opinion), max_len)
            })
            .collect();
        let mut row = vec![version, evaluation.site_id(), summary.as_str()];
        row.extend(opinions.iter().map(String::as_str));
        out.push_str(&csv_record(row));
    }
    out
}

/// Write the CSV dialogue table to `path`.
pub fn write_dialogue_summary_csv(
    path: &Path,
    evaluations: &[SiteEvaluation],
    max_len: usize,
    version: &str,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let table = render_dialogue_summary_csv(evaluations, max_len, version);
    std::fs::write(path, table).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

fn csv_record<'a>(cells: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = cells
        .into_iter()
        .map(csv_field)
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

/// RFC 4180 quoting: wrap in quotes when needed, doubling inner quotes.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluation(site_id: &str) -> SiteEvaluation {
        let mut fields = Fields::new();
        fields.insert("ndvi".to_string(), "0.42".to_string());
        let characters = PersonaRole::ALL
            .iter()
            .map(|p| (p.id().to_string(), format!("{p} opinion\nsecond line")))
            .collect();
        SiteEvaluation {
            site_metadata: SiteMetadata {
                site_id: site_id.to_string(),
                session_id: Uuid::parse_str("11111111-1111-1111-1111-111111111111")
                    .expect("valid UUID"),
                registry_fingerprint: "abc".to_string(),
                fields,
            },
            characters,
            summary: "promising".to_string(),
            generated_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("parse RFC3339")
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_evaluation_json_shape() {
        let raw = serde_json::to_value(evaluation("site_001")).expect("serialize");
        let obj = raw.as_object().expect("object");
        assert!(obj.contains_key("site_metadata"));
        assert!(obj.contains_key("characters"));
        assert!(obj.contains_key("summary"));
        assert_eq!(raw["site_metadata"]["site_id"], json!("site_001"));
        // Site fields are flattened next to the id.
        assert_eq!(raw["site_metadata"]["ndvi"], json!("0.42"));
        assert_eq!(raw["characters"]["skeptic"], json!("skeptic opinion\nsecond line"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("遺跡の可能性が高い", 4), "遺跡の…");
    }

    #[test]
    fn test_markdown_lists_personas_in_panel_order() {
        let md = render_dialogue_summary_md(&[evaluation("site_001")], 120);
        assert!(md.starts_with("# Character Dialogue Summary\n"));
        assert!(md.contains("### site_001"));
        assert!(md.contains("**Summary**: promising"));
        let explorer = md.find("- **Explorer**").unwrap();
        let ecologist = md.find("- **Ecologist**").unwrap();
        assert!(explorer < ecologist);
        assert!(md.contains("explorer opinion second line"));
    }

    #[test]
    fn test_write_and_load_skip_failure_ledger() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_evaluation_json(dir.path(), &evaluation("site_002")).unwrap();
        write_evaluation_json(dir.path(), &evaluation("site_001")).unwrap();
        write_failures_json(
            dir.path(),
            &[FailedSite {
                site_id: "site_003".to_string(),
                error: "boom".to_string(),
            }],
        )
        .unwrap();

        let loaded = load_evaluations(dir.path()).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|e| e.site_id()).collect();
        assert_eq!(ids, vec!["site_001", "site_002"]);
        assert_eq!(loaded[0], evaluation("site_001"));
    }

    #[test]
    fn test_write_refuses_ids_outside_output_dir() {
        let root = tempfile::tempdir().expect("tempdir");
        let out = root.path().join("out");

        assert!(write_evaluation_json(&out, &evaluation("../escaped")).is_err());
        assert!(!root.path().join("escaped.json").exists());

        assert!(write_evaluation_json(&out, &evaluation("retry_failed")).is_err());
        assert!(!out.join(FAILURES_FILE).exists());
    }

    #[test]
    fn test_csv_table_quotes_and_flattens() {
        let mut quoted = evaluation("site_002");
        quoted.summary = "high, \"platform\"\nsurvey next".to_string();
        let csv = render_dialogue_summary_csv(&[evaluation("site_001"), quoted], 12, "all");
        let lines: Vec<&str> = csv.split("\r\n").collect();

        assert_eq!(
            lines[0],
            "version,site_id,summary,explorer,engineer,skeptic,historian,ecologist"
        );
        assert_eq!(
            lines[1],
            "all,site_001,promising,explorer op…,engineer op…,skeptic opi…,historian o…,ecologist o…"
        );
        assert!(lines[2].starts_with("all,site_002,\"high, \"\"platform\"\" survey next\","));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "");
    }

    #[test]
    fn test_write_csv_creates_parent_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report").join("summary.csv");
        write_dialogue_summary_csv(&path, &[evaluation("site_001")], 120, "v05").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("v05,site_001,promising,explorer opinion second line,"));
    }
}
