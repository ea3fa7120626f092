use crate::config::SchedulerConfig;
use crate::events::{ChannelEventSink, SchedulerEvent};
use crate::scheduler::ConversationScheduler;
use async_trait::async_trait;
use parley_chat::{Conversation, Participant};
use parley_gen::{GenerationError, GenerationRequest, GenerationResponse, GenerationService};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

pub(crate) enum Step {
    Reply(GenerationResponse),
    Fail(String),
    /// Block until the request is cancelled.
    Hang,
}

/// Generation service that replays a fixed script and records every request.
/// Once the script runs out every further request hangs.
pub(crate) struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub(crate) fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> parley_gen::Result<GenerationResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or(Step::Hang);
        match step {
            Step::Reply(response) => Ok(response),
            Step::Fail(message) => Err(GenerationError::Http(message)),
            Step::Hang => {
                cancel.cancelled().await;
                Err(GenerationError::Cancelled)
            }
        }
    }
}

/// Deterministic timings: no jitter and no reaction rolls.
pub(crate) fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        turn_limit: 3,
        react_probability: 0.0,
        typing_jitter_ms: 0,
        ..SchedulerConfig::default()
    }
}

pub(crate) fn harness(
    steps: Vec<Step>,
) -> (
    ConversationScheduler,
    Arc<ScriptedGenerator>,
    UnboundedReceiver<SchedulerEvent>,
) {
    let generator = ScriptedGenerator::new(steps);
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = ConversationScheduler::new(
        test_config(),
        generator.clone(),
        Arc::new(ChannelEventSink::new(tx)),
    )
    .expect("scheduler");
    (scheduler, generator, rx)
}

pub(crate) fn group() -> Conversation {
    Conversation::new(
        "group",
        vec![Participant::new("Alice"), Participant::new("Bob")],
    )
}

pub(crate) fn solo() -> Conversation {
    Conversation::new("solo", vec![Participant::new("Alice")])
}

pub(crate) async fn next_event(rx: &mut UnboundedReceiver<SchedulerEvent>) -> SchedulerEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("event before timeout")
        .expect("event channel open")
}

/// Every event up to and including the next delivered message.
pub(crate) async fn collect_until_message(
    rx: &mut UnboundedReceiver<SchedulerEvent>,
) -> Vec<SchedulerEvent> {
    let mut out = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, SchedulerEvent::MessageGenerated { .. });
        out.push(event);
        if done {
            return out;
        }
    }
}

pub(crate) async fn assert_quiet(rx: &mut UnboundedReceiver<SchedulerEvent>, secs: u64) {
    if let Ok(event) = tokio::time::timeout(Duration::from_secs(secs), rx.recv()).await {
        panic!("expected no events, got {event:?}");
    }
}
