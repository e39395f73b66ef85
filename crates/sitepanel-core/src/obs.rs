//! Structured observability hooks for the session lifecycle.
//!
//! Events are emitted with an `event` field so they can be filtered or shipped
//! as JSON (see [`crate::telemetry::init_tracing`]).

use tracing::{info, warn};
use uuid::Uuid;

use crate::session::SessionState;

/// Span tagging every log line of one evaluation with its session and site.
///
/// Attach it to the session future with `tracing::Instrument`; spawned persona
/// tasks inherit it through `in_current_span`.
pub fn session_span(session_id: &Uuid, site_id: &str) -> tracing::Span {
    tracing::info_span!("sitepanel.session", session_id = %session_id, site_id = %site_id)
}

pub fn emit_session_started(session_id: &Uuid, site_id: &str) {
    info!(event = "session.started", session_id = %session_id, site_id = %site_id);
}

pub fn emit_session_transition(session_id: &Uuid, from: SessionState, to: SessionState) {
    tracing::debug!(
        event = "session.transition",
        session_id = %session_id,
        from = %from,
        to = %to,
    );
}

pub fn emit_persona_dispatched(session_id: &Uuid, role_id: &str, temperature: f32) {
    info!(
        event = "persona.dispatched",
        session_id = %session_id,
        role_id = %role_id,
        temperature = temperature,
    );
}

pub fn emit_persona_collected(session_id: &Uuid, role_id: &str, chars: usize) {
    info!(
        event = "persona.collected",
        session_id = %session_id,
        role_id = %role_id,
        chars = chars,
    );
}

pub fn emit_session_finished(session_id: &Uuid, site_id: &str, duration_ms: u64) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        site_id = %site_id,
        duration_ms = duration_ms,
    );
}

/// Warning level; the session has moved to `Failed`.
pub fn emit_session_failed(session_id: &Uuid, site_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "session.failed",
        session_id = %session_id,
        site_id = %site_id,
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_span_enter() {
        let _entered = session_span(&Uuid::new_v4(), "site_000").entered();
        emit_session_started(&Uuid::new_v4(), "site_000");
    }
}
