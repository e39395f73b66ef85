//! Two-phase panel orchestration.
//!
//! Phase one renders a prompt per persona from the site fields and dispatches
//! them concurrently (bounded by a semaphore). Results are keyed by persona, never
//! by arrival order. Phase two starts only after the barrier has every opinion: it
//! renders the summary role from the five opinions and dispatches that.
//!
//! Failure is fail-fast. The first persona failure aborts the remaining tasks,
//! drains them and fails the session without touching the summary. A timeout or
//! cancel signal before the barrier releases does the same and reports the
//! personas that never answered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::dispatch::{DispatchError, DispatchRequest, OpinionDispatcher};
use crate::error::{PanelError, PanelResult};
use crate::obs;
use crate::registry::RoleRegistry;
use crate::render::{render, Fields, RenderPolicy, RenderRequest, RenderedPrompt};
use crate::report::{FailedSite, SiteEvaluation, SiteMetadata};
use crate::roles::{PersonaRole, SUMMARY_ROLE_ID};
use crate::session::{OrchestrationSession, SessionState};
use crate::site::{validate_site_id, SiteAttributes};

/// Orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum persona dispatches in flight for one session.
    pub max_concurrent: usize,
    /// Deadline for the persona barrier and for the summary dispatch.
    /// `None` waits indefinitely. It caps any retrying done by the dispatcher.
    pub persona_timeout_ms: Option<u64>,
    pub render_policy: RenderPolicy,
    /// Base sampling temperature; see [`PersonaRole::temperature`].
    pub base_temperature: f32,
    /// Maximum sessions in flight in [`Orchestrator::evaluate_batch`].
    pub max_concurrent_sites: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            persona_timeout_ms: Some(360_000),
            render_policy: RenderPolicy::Lenient,
            base_temperature: 0.7,
            max_concurrent_sites: 4,
        }
    }
}

impl OrchestratorConfig {
    fn timeout(&self) -> Option<Duration> {
        self.persona_timeout_ms.map(Duration::from_millis)
    }
}

/// Successful and failed sites of a batch, each sorted by site id.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub evaluations: Vec<SiteEvaluation>,
    pub failures: Vec<FailedSite>,
}

type PersonaOutcome = (PersonaRole, Result<String, DispatchError>);

enum Barrier {
    Released(PanelResult<()>),
    TimedOut,
    Cancelled,
}

/// Drives sessions against one registry and one dispatcher.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<RoleRegistry>,
    dispatcher: Arc<dyn OpinionDispatcher>,
    config: OrchestratorConfig,
    fingerprint: String,
}

impl Orchestrator {
    /// Build an orchestrator. The registry must hold a complete panel.
    pub fn new(
        registry: Arc<RoleRegistry>,
        dispatcher: Arc<dyn OpinionDispatcher>,
        config: OrchestratorConfig,
    ) -> PanelResult<Self> {
        registry.validate_panel()?;
        if config.max_concurrent == 0 || config.max_concurrent_sites == 0 {
            return Err(PanelError::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        let fingerprint = registry.fingerprint()?;
        Ok(Self {
            registry,
            dispatcher,
            config,
            fingerprint,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// Render every persona prompt from `fields`, in panel order.
    ///
    /// Each persona receives only the fields its template references.
    pub fn render_personas(&self, fields: &Fields) -> PanelResult<Vec<(PersonaRole, RenderedPrompt)>> {
        PersonaRole::ALL
            .into_iter()
            .map(|persona| {
                let role = self.registry.get(persona.id())?;
                let request = RenderRequest::for_role(role, fields);
                let prompt = render(role, &request.fields, self.config.render_policy)?;
                Ok((persona, prompt))
            })
            .collect()
    }

    /// Render the summary prompt from the session's collected opinions.
    pub fn render_summary(&self, session: &OrchestrationSession) -> PanelResult<RenderedPrompt> {
        let fields = session.summary_fields()?;
        let role = self.registry.get(SUMMARY_ROLE_ID)?;
        render(role, &fields, self.config.render_policy)
    }

    /// Evaluate one site end to end.
    pub async fn evaluate(&self, site: SiteAttributes) -> PanelResult<SiteEvaluation> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.evaluate_with_cancel(site, cancel_rx).await
    }

    /// Evaluate one site, aborting if `cancel` flips to `true` before the barrier.
    pub async fn evaluate_with_cancel(
        &self,
        site: SiteAttributes,
        cancel: watch::Receiver<bool>,
    ) -> PanelResult<SiteEvaluation> {
        let mut session = OrchestrationSession::new(site);
        self.evaluate_session(&mut session, cancel).await
    }

    /// Drive `session` from `Init` to `Done` or `Failed`.
    pub async fn evaluate_session(
        &self,
        session: &mut OrchestrationSession,
        cancel: watch::Receiver<bool>,
    ) -> PanelResult<SiteEvaluation> {
        let session_id = session.session_id();
        let site_id = session.site().site_id.clone();
        let started = Instant::now();
        obs::emit_session_started(&session_id, &site_id);

        let span = obs::session_span(&session_id, &site_id);
        match self.run_session(session, cancel).instrument(span).await {
            Ok(summary) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                obs::emit_session_finished(&session_id, &site_id, duration_ms);
                Ok(self.evaluation(session, summary))
            }
            Err(error) => {
                if !session.state().is_terminal() {
                    let _ = session.fail(error.to_string());
                }
                obs::emit_session_failed(&session_id, &site_id, &error);
                Err(error)
            }
        }
    }

    async fn run_session(
        &self,
        session: &mut OrchestrationSession,
        mut cancel: watch::Receiver<bool>,
    ) -> PanelResult<String> {
        session.advance(SessionState::PersonaRender)?;
        let prompts = self.render_personas(session.fields())?;

        session.advance(SessionState::PersonaDispatch)?;
        let mut join_set = self.spawn_personas(session.session_id(), prompts);

        session.advance(SessionState::AwaitingResponses)?;
        self.await_opinions(session, &mut join_set, &mut cancel).await?;

        session.advance(SessionState::SummaryRender)?;
        let prompt = self.render_summary(session)?;

        session.advance(SessionState::SummaryDispatch)?;
        let request = DispatchRequest {
            role_id: SUMMARY_ROLE_ID.to_string(),
            prompt,
            temperature: self.config.base_temperature,
        };
        obs::emit_persona_dispatched(&session.session_id(), SUMMARY_ROLE_ID, request.temperature);
        let summary = self.dispatch_summary(&request).await?;

        session.advance(SessionState::Done)?;
        Ok(summary)
    }

    fn spawn_personas(
        &self,
        session_id: Uuid,
        prompts: Vec<(PersonaRole, RenderedPrompt)>,
    ) -> JoinSet<PersonaOutcome> {
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut join_set = JoinSet::new();

        for (persona, prompt) in prompts {
            let dispatcher = Arc::clone(&self.dispatcher);
            let sem = Arc::clone(&sem);
            let request = DispatchRequest {
                role_id: persona.id().to_string(),
                prompt,
                temperature: persona.temperature(self.config.base_temperature),
            };

            join_set.spawn(
                async move {
                    let _permit = sem.acquire_owned().await.ok();
                    obs::emit_persona_dispatched(&session_id, &request.role_id, request.temperature);
                    let result = dispatcher.dispatch(&request).await;
                    (persona, result)
                }
                .in_current_span(),
            );
        }
        join_set
    }

    /// The barrier: returns once every persona has answered, or fails the session.
    async fn await_opinions(
        &self,
        session: &mut OrchestrationSession,
        join_set: &mut JoinSet<PersonaOutcome>,
        cancel: &mut watch::Receiver<bool>,
    ) -> PanelResult<()> {
        let limit = self.config.timeout();
        let deadline = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let barrier = tokio::select! {
            released = collect_opinions(session, join_set) => Barrier::Released(released),
            _ = deadline => Barrier::TimedOut,
            _ = cancelled(cancel) => Barrier::Cancelled,
        };

        let interrupted = match barrier {
            Barrier::Released(Ok(())) => return Ok(()),
            Barrier::Released(Err(error)) => error,
            Barrier::TimedOut => {
                tracing::warn!(timeout_ms = ?self.config.persona_timeout_ms, "persona barrier timed out");
                incomplete(session)
            }
            Barrier::Cancelled => {
                tracing::warn!("session cancelled before persona barrier");
                incomplete(session)
            }
        };

        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        Err(interrupted)
    }

    async fn dispatch_summary(&self, request: &DispatchRequest) -> PanelResult<String> {
        let dispatched = match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, self.dispatcher.dispatch(request))
                .await
                .unwrap_or(Err(DispatchError::Timeout {
                    after_ms: limit.as_millis() as u64,
                })),
            None => self.dispatcher.dispatch(request).await,
        };
        dispatched.map_err(|source| PanelError::Dispatch {
            role_id: SUMMARY_ROLE_ID.to_string(),
            source,
        })
    }

    fn evaluation(&self, session: &OrchestrationSession, summary: String) -> SiteEvaluation {
        SiteEvaluation {
            site_metadata: SiteMetadata {
                site_id: session.site().site_id.clone(),
                session_id: session.session_id(),
                registry_fingerprint: self.fingerprint.clone(),
                fields: session.fields().clone(),
            },
            characters: session
                .opinions()
                .iter()
                .map(|(persona, opinion)| (persona.id().to_string(), opinion.clone()))
                .collect(),
            summary,
            generated_at: Utc::now(),
        }
    }

    /// Evaluate many sites concurrently.
    ///
    /// A failed site is recorded in [`BatchOutcome::failures`] and does not stop
    /// the others.
    ///
    /// Sites with an unusable id, or an id already seen earlier in `sites`, are
    /// recorded as failures without being evaluated.
    pub async fn evaluate_batch(&self, sites: Vec<SiteAttributes>) -> BatchOutcome {
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent_sites));
        let mut join_set = JoinSet::new();
        let mut outcome = BatchOutcome::default();
        let mut seen = HashSet::new();

        for site in sites {
            let checked = validate_site_id(&site.site_id).and_then(|()| {
                if seen.insert(site.site_id.clone()) {
                    Ok(())
                } else {
                    Err(PanelError::DuplicateSite {
                        site_id: site.site_id.clone(),
                    })
                }
            });
            if let Err(error) = checked {
                tracing::warn!(site_id = %site.site_id, error = %error, "site rejected");
                outcome.failures.push(FailedSite {
                    site_id: site.site_id,
                    error: error.to_string(),
                });
                continue;
            }

            let this = self.clone();
            let sem = Arc::clone(&sem);
            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let site_id = site.site_id.clone();
                (site_id, this.evaluate(site).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(evaluation))) => outcome.evaluations.push(evaluation),
                Ok((site_id, Err(error))) => outcome.failures.push(FailedSite {
                    site_id,
                    error: error.to_string(),
                }),
                Err(join_error) => outcome.failures.push(FailedSite {
                    site_id: "unknown".to_string(),
                    error: format!("site task join error: {join_error}"),
                }),
            }
        }
        outcome
            .evaluations
            .sort_by(|a, b| a.site_id().cmp(b.site_id()));
        outcome.failures.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        outcome
    }
}

/// Record opinions as they arrive. The first dispatch failure ends collection.
async fn collect_opinions(
    session: &mut OrchestrationSession,
    join_set: &mut JoinSet<PersonaOutcome>,
) -> PanelResult<()> {
    while let Some(joined) = join_set.join_next().await {
        let (persona, result) = match joined {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::warn!(error = %join_error, "persona task did not complete");
                return Err(incomplete(session));
            }
        };

        match result {
            Ok(opinion) => {
                obs::emit_persona_collected(&session.session_id(), persona.id(), opinion.chars().count());
                session.record_opinion(persona, opinion)?;
            }
            Err(source) => {
                return Err(PanelError::Dispatch {
                    role_id: persona.id().to_string(),
                    source,
                });
            }
        }
    }
    Ok(())
}

fn incomplete(session: &OrchestrationSession) -> PanelError {
    PanelError::IncompleteOpinionSet {
        missing: session
            .missing_personas()
            .iter()
            .map(|p| p.id().to_string())
            .collect(),
    }
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
