//! In-memory fakes for the dispatch seam (testing only)
//!
//! `ScriptedDispatcher` answers every role with a canned opinion, fails or
//! stalls chosen roles, and records each request it receives along with how
//! many calls were in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::dispatch::{DispatchError, DispatchRequest, OpinionDispatcher};

/// Scripted [`OpinionDispatcher`].
///
/// Roles without a scripted opinion answer `"opinion from <role_id>"`.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    opinions: HashMap<String, String>,
    failures: HashMap<String, DispatchError>,
    delays: HashMap<String, Duration>,
    requests: Mutex<Vec<DispatchRequest>>,
    completed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts one call in flight until dropped, including when the task is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opinion(mut self, role_id: &str, opinion: &str) -> Self {
        self.opinions
            .insert(role_id.to_string(), opinion.to_string());
        self
    }

    pub fn with_failure(mut self, role_id: &str, error: DispatchError) -> Self {
        self.failures.insert(role_id.to_string(), error);
        self
    }

    /// Make `role_id` wait `delay` before answering.
    pub fn with_delay(mut self, role_id: &str, delay: Duration) -> Self {
        self.delays.insert(role_id.to_string(), delay);
        self
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Role ids of every request received so far, in call order.
    pub fn dispatched_roles(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.role_id.clone())
            .collect()
    }

    /// Role ids in the order their calls returned.
    pub fn completed_roles(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpinionDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.delays.get(&request.role_id) {
            tokio::time::sleep(*delay).await;
        }
        self.completed.lock().unwrap().push(request.role_id.clone());
        if let Some(error) = self.failures.get(&request.role_id) {
            return Err(error.clone());
        }
        Ok(self
            .opinions
            .get(&request.role_id)
            .cloned()
            .unwrap_or_else(|| format!("opinion from {}", request.role_id)))
    }
}
