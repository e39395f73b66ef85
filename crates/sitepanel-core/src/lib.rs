//! Site Panel Core Library
//!
//! Persona prompts for reviewing candidate archaeological sites: a role
//! registry, a `{placeholder}` renderer, and a two-phase orchestrator that
//! fans a site out to five personas and folds their opinions into one summary.
//!
//! # Module layout
//!
//! - [`registry`] — `RoleRegistry`, process-wide `install_global` / `global`
//! - [`template`] / [`render`] — placeholder parsing and prompt rendering
//! - [`orchestrator`] / [`session`] — the session state machine and its driver
//! - [`dispatch`] — the `OpinionDispatcher` seam and retry decorator
//! - [`report`] — per-site JSON, failure ledger, Markdown and CSV summaries

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod registry;
pub mod render;
pub mod report;
pub mod roles;
pub mod session;
pub mod site;
pub mod telemetry;
pub mod template;

pub use config::{ChatSettings, PanelConfig};
pub use dispatch::{
    DispatchError, DispatchRequest, OpinionDispatcher, RetryPolicy, RetryingDispatcher,
};
pub use error::{PanelError, PanelResult};
pub use orchestrator::{BatchOutcome, Orchestrator, OrchestratorConfig};
pub use registry::{global, install_global, RoleRegistry};
pub use render::{render, Fields, RenderPolicy, RenderRequest, RenderedPrompt};
pub use report::{
    load_evaluations, render_dialogue_summary_csv, render_dialogue_summary_md,
    write_dialogue_summary_csv, write_dialogue_summary_md, write_evaluation_json,
    write_failures_json, FailedSite, SiteEvaluation, SiteMetadata,
};
pub use roles::{CompiledRole, PersonaRole, RoleDefinition, SUMMARY_ROLE_ID};
pub use session::{OrchestrationSession, SessionState};
pub use site::{
    load_sites, parse_sites, validate_site_id, validate_sites, SiteAttributes, SITE_FIELDS,
};
pub use telemetry::init_tracing;
pub use template::{Template, TemplateError};

/// Site Panel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
