//! Per-site orchestration session and its state machine.
//!
//! ```text
//! Init → PersonaRender → PersonaDispatch → AwaitingResponses
//!      → SummaryRender → SummaryDispatch → Done
//! ```
//!
//! `Failed` is reachable from every non-terminal state. `Done` and `Failed` are
//! terminal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PanelError, PanelResult};
use crate::render::Fields;
use crate::roles::PersonaRole;
use crate::site::SiteAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    PersonaRender,
    PersonaDispatch,
    AwaitingResponses,
    SummaryRender,
    SummaryDispatch,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// The single forward successor, if any.
    pub fn next(self) -> Option<SessionState> {
        match self {
            SessionState::Init => Some(SessionState::PersonaRender),
            SessionState::PersonaRender => Some(SessionState::PersonaDispatch),
            SessionState::PersonaDispatch => Some(SessionState::AwaitingResponses),
            SessionState::AwaitingResponses => Some(SessionState::SummaryRender),
            SessionState::SummaryRender => Some(SessionState::SummaryDispatch),
            SessionState::SummaryDispatch => Some(SessionState::Done),
            SessionState::Done | SessionState::Failed => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::PersonaRender => "persona_render",
            SessionState::PersonaDispatch => "persona_dispatch",
            SessionState::AwaitingResponses => "awaiting_responses",
            SessionState::SummaryRender => "summary_render",
            SessionState::SummaryDispatch => "summary_dispatch",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One end-to-end evaluation of a single site.
///
/// Mutated only by the orchestrator. Each persona slot in `opinions` is written at
/// most once, and the summary fields are read only after every slot is filled.
#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    session_id: Uuid,
    site: SiteAttributes,
    fields: Fields,
    state: SessionState,
    history: Vec<SessionState>,
    opinions: BTreeMap<PersonaRole, String>,
    failure: Option<String>,
}

impl OrchestrationSession {
    pub fn new(site: SiteAttributes) -> Self {
        let fields = site.to_fields();
        Self {
            session_id: Uuid::new_v4(),
            site,
            fields,
            state: SessionState::Init,
            history: vec![SessionState::Init],
            opinions: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn site(&self) -> &SiteAttributes {
        &self.site
    }

    /// Site fields every persona request is built from.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has entered, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn opinions(&self) -> &BTreeMap<PersonaRole, String> {
        &self.opinions
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Move to `next`, which must be the immediate forward successor.
    pub fn advance(&mut self, next: SessionState) -> PanelResult<()> {
        if self.state.next() != Some(next) {
            return Err(PanelError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.enter(next);
        Ok(())
    }

    /// Move to `Failed`, recording `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) -> PanelResult<()> {
        if self.state.is_terminal() {
            return Err(PanelError::InvalidTransition {
                from: self.state.to_string(),
                to: SessionState::Failed.to_string(),
            });
        }
        self.failure = Some(reason.into());
        self.enter(SessionState::Failed);
        Ok(())
    }

    fn enter(&mut self, next: SessionState) {
        crate::obs::emit_session_transition(&self.session_id, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Store `persona`'s opinion. Each slot takes exactly one write.
    pub fn record_opinion(&mut self, persona: PersonaRole, opinion: String) -> PanelResult<()> {
        if self.opinions.contains_key(&persona) {
            return Err(PanelError::DuplicateOpinion {
                role_id: persona.id().to_string(),
            });
        }
        self.opinions.insert(persona, opinion);
        Ok(())
    }

    /// Personas with no recorded opinion, in panel order.
    pub fn missing_personas(&self) -> Vec<PersonaRole> {
        PersonaRole::ALL
            .into_iter()
            .filter(|p| !self.opinions.contains_key(p))
            .collect()
    }

    /// The five opinion fields for the summary render.
    ///
    /// Fails with [`PanelError::IncompleteOpinionSet`] if any persona is missing.
    pub fn summary_fields(&self) -> PanelResult<Fields> {
        let missing = self.missing_personas();
        if !missing.is_empty() {
            return Err(PanelError::IncompleteOpinionSet {
                missing: missing.iter().map(|p| p.id().to_string()).collect(),
            });
        }
        Ok(self
            .opinions
            .iter()
            .map(|(persona, opinion)| (persona.opinion_field().to_string(), opinion.clone()))
            .collect())
    }
}
