//! The conversation scheduler.
//!
//! A lane runs at most one worker. The worker drains the lane's queue and
//! handles each task as a chain of stages; before every visible effect it
//! re-locks the lane and drops the task if a newer version or a cancellation
//! superseded it.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::events::EventSink;
use crate::lane::{Lane, LaneState, LaneStatus, LaneStatusSnapshot, PendingDebounce};
use crate::task::{Task, TaskPriority};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_chat::{Conversation, ConversationId, Message, MessageUpdate};
use parley_gen::{GenerationRequest, GenerationService, ReactionProposal};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    /// Dequeued with the lane already at the turn limit.
    Skipped,
    Aborted,
    Failed,
}

#[derive(Clone)]
pub struct ConversationScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: SchedulerConfig,
    generator: Arc<dyn GenerationService>,
    events: Arc<dyn EventSink>,
    lanes: DashMap<ConversationId, Arc<Lane>>,
    active: RwLock<Option<ConversationId>>,
    shutdown: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ConversationScheduler {
    /// Build a scheduler and start its lane sweep. Must be called inside a
    /// tokio runtime.
    pub fn new(
        cfg: SchedulerConfig,
        generator: Arc<dyn GenerationService>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        cfg.validate()?;
        let shutdown = CancellationToken::new();
        let inner = Arc::new_cyclic(|weak: &Weak<SchedulerInner>| {
            let sweep = spawn_sweep_loop(
                weak.clone(),
                cfg.sweep_interval(),
                shutdown.child_token(),
            );
            SchedulerInner {
                cfg,
                generator,
                events,
                lanes: DashMap::new(),
                active: RwLock::new(None),
                shutdown,
                sweep_handle: Mutex::new(Some(sweep)),
                disposed: AtomicBool::new(false),
            }
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.cfg
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Supersede everything pending for the conversation and schedule a
    /// direct reply once the debounce window closes.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(conversation_id = %conversation.id, messages = conversation.messages.len())
    )]
    pub async fn enqueue_user_message(&self, conversation: Conversation) -> Result<()> {
        self.inner.ensure_live()?;
        let inner = &self.inner;
        let (lane, mut state) = inner.open_lane(&conversation.id).await?;
        inner.cancel_locked(&lane.id, &mut state);

        let debounce_id = Uuid::new_v4();
        let timer = inner.shutdown.child_token();
        let handle = tokio::spawn(run_debounce(
            Arc::clone(inner),
            Arc::clone(&lane),
            debounce_id,
            timer.clone(),
        ));
        state.debounce = Some(PendingDebounce {
            id: debounce_id,
            snapshot: conversation,
            timer,
            handle,
        });
        state.touch();
        tracing::debug!(debounce_ms = inner.cfg.debounce_ms, "user message debounce armed");
        Ok(())
    }

    /// Queue a simulated turn. Returns `false` when the conversation already
    /// sits at the turn limit and nothing was scheduled.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(conversation_id = %conversation.id, messages = conversation.messages.len())
    )]
    pub async fn enqueue_simulated_message(&self, conversation: Conversation) -> Result<bool> {
        self.inner.ensure_live()?;
        let inner = &self.inner;
        let limit = inner.cfg.turn_limit;
        let trailing = u32::try_from(conversation.trailing_generated_count()).unwrap_or(u32::MAX);

        let (lane, mut state) = inner.open_lane(&conversation.id).await?;
        state.consecutive_generated = state.consecutive_generated.max(trailing.min(limit));
        if state.next_turn(limit).is_none() {
            tracing::debug!(
                turn_limit = limit,
                consecutive = state.consecutive_generated,
                "turn limit reached; simulated message skipped"
            );
            return Ok(false);
        }

        let task = Task::new(
            conversation,
            TaskPriority::SimulatedReply,
            inner.shutdown.child_token(),
            state.version,
        );
        state.touch();
        inner.submit_locked(&lane, &mut state, task);
        Ok(true)
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
    pub async fn cancel_lane(&self, conversation_id: &ConversationId) {
        let Some(lane) = self.inner.existing_lane(conversation_id) else {
            return;
        };
        let mut state = lane.state.lock().await;
        self.inner.cancel_locked(&lane.id, &mut state);
    }

    pub async fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        let previous = {
            let mut active = self.inner.active.write().await;
            std::mem::replace(&mut *active, conversation_id.clone())
        };
        let Some(previous) = previous else {
            return;
        };
        if conversation_id.as_ref() == Some(&previous) {
            return;
        }
        let Some(lane) = self.inner.existing_lane(&previous) else {
            return;
        };
        let state = lane.state.lock().await;
        if state.status == LaneStatus::Processing {
            self.inner.events.on_typing_status_changed(None, None);
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.active.read().await.clone()
    }

    pub async fn lane_status(&self, conversation_id: &ConversationId) -> Option<LaneStatusSnapshot> {
        let lane = self.inner.existing_lane(conversation_id)?;
        let state = lane.state.lock().await;
        Some(state.snapshot(&lane.id))
    }

    /// Snapshot of every live lane, most recently active first.
    pub async fn status_snapshot(&self) -> Vec<LaneStatusSnapshot> {
        let lanes: Vec<Arc<Lane>> = self
            .inner
            .lanes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut out = Vec::with_capacity(lanes.len());
        for lane in lanes {
            let state = lane.state.lock().await;
            out.push(state.snapshot(&lane.id));
        }
        out.sort_by_key(|s| s.last_activity);
        out.reverse();
        out
    }

    /// Evict lanes idle for longer than the configured TTL as of `now`.
    pub async fn evict_expired_lanes(&self, now: DateTime<Utc>) -> usize {
        self.inner.evict_expired(now).await
    }

    /// Stop the sweep, cancel every lane and drop all lane state.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.shutdown.cancel();

        let mut handles = Vec::new();
        if let Some(handle) = inner.sweep_handle.lock().await.take() {
            handles.push(handle);
        }

        let lanes: Vec<Arc<Lane>> = inner
            .lanes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        inner.lanes.clear();
        for lane in lanes {
            let mut state = lane.state.lock().await;
            inner.cancel_locked(&lane.id, &mut state);
            state.evicted = true;
            if let Some(handle) = state.worker.take() {
                handles.push(handle);
            }
        }
        *inner.active.write().await = None;

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "scheduler background task join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for scheduler background task shutdown");
                }
            }
        }
        tracing::info!("conversation scheduler disposed");
    }
}

impl SchedulerInner {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Disposed);
        }
        Ok(())
    }

    fn existing_lane(&self, conversation_id: &ConversationId) -> Option<Arc<Lane>> {
        self.lanes
            .get(conversation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Lock the lane for `conversation_id`, creating it on first use.
    ///
    /// Fails with [`SchedulerError::Disposed`] when `dispose` ran while the
    /// caller was waiting; a lane inserted after the final clear is removed
    /// again before returning.
    async fn open_lane(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(Arc<Lane>, OwnedMutexGuard<LaneState>)> {
        loop {
            let lane = Arc::clone(
                self.lanes
                    .entry(conversation_id.clone())
                    .or_insert_with(|| Arc::new(Lane::new(conversation_id.clone())))
                    .value(),
            );
            let mut state = Arc::clone(&lane.state).lock_owned().await;
            if self.disposed.load(Ordering::SeqCst) {
                state.evicted = true;
                self.lanes
                    .remove_if(conversation_id, |_, current| Arc::ptr_eq(current, &lane));
                return Err(SchedulerError::Disposed);
            }
            // Lost a race with eviction; the map already holds a fresh lane.
            if !state.evicted {
                return Ok((lane, state));
            }
        }
    }

    fn cancel_locked(&self, conversation_id: &ConversationId, state: &mut LaneState) {
        // Dropping the handle detaches the timer task; it exits on its token.
        let had_debounce = state.cancel_debounce().is_some();
        let was_processing = state.cancel_all();
        if was_processing {
            self.events.on_typing_status_changed(None, None);
        }
        tracing::debug!(
            conversation_id = %conversation_id,
            was_processing,
            had_debounce,
            version = state.version,
            "lane cancelled"
        );
    }

    fn submit_locked(self: &Arc<Self>, lane: &Arc<Lane>, state: &mut LaneState, task: Task) {
        tracing::debug!(
            conversation_id = %lane.id,
            task_id = %task.id,
            priority = task.priority.weight(),
            version = task.version_snapshot,
            "task queued"
        );
        if state.push(task) {
            let epoch = state.worker_epoch;
            state.worker = Some(tokio::spawn(run_worker(
                Arc::clone(self),
                Arc::clone(lane),
                epoch,
            )));
        }
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.cfg.lane_ttl();
        let lanes: Vec<Arc<Lane>> = self
            .lanes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut evicted = 0usize;
        for lane in lanes {
            let mut state = lane.state.lock().await;
            if state.evicted || now.signed_duration_since(state.last_activity) <= ttl {
                continue;
            }
            self.cancel_locked(&lane.id, &mut state);
            state.evicted = true;
            self.lanes
                .remove_if(&lane.id, |_, current| Arc::ptr_eq(current, &lane));
            evicted += 1;
            tracing::debug!(conversation_id = %lane.id, "evicted idle lane");
        }
        evicted
    }

    /// Lock the lane if `task` is still current.
    async fn checkpoint<'a>(&self, lane: &'a Lane, task: &Task) -> Option<MutexGuard<'a, LaneState>> {
        let state = lane.state.lock().await;
        if state.is_stale(task) {
            tracing::debug!(
                conversation_id = %lane.id,
                task_id = %task.id,
                task_version = task.version_snapshot,
                lane_version = state.version,
                "task superseded"
            );
            return None;
        }
        Some(state)
    }

    fn typing_delay(&self, task: &Task) -> Duration {
        let base = if task.is_direct_reply() {
            self.cfg.direct_typing_base_ms
        } else {
            self.cfg.organic_typing_base_ms
        };
        Duration::from_millis(base.saturating_add(jitter_ms(self.cfg.typing_jitter_ms)))
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(conversation_id = %lane.id, task_id = %task.id, turn_index = tracing::field::Empty)
    )]
    async fn process(&self, lane: &Lane, task: &Task) -> TaskOutcome {
        let limit = self.cfg.turn_limit;

        // Request. The turn index comes from the lane counter at this point,
        // so tasks queued back to back still count as separate turns.
        let turn_index = {
            let Some(state) = self.checkpoint(lane, task).await else {
                return TaskOutcome::Aborted;
            };
            let Some(turn_index) = state.next_turn(limit) else {
                tracing::debug!(
                    turn_limit = limit,
                    "turn limit reached; queued simulated task skipped"
                );
                return TaskOutcome::Skipped;
            };
            turn_index
        };
        tracing::Span::current().record("turn_index", turn_index);
        let should_wrap_up = turn_index.saturating_add(1) >= limit;
        let request = GenerationRequest {
            recipients: task.responders(),
            message_history: task.conversation.messages.clone(),
            should_wrap_up,
            is_one_on_one: task.conversation.is_one_on_one(),
            should_react: roll_reaction(self.cfg.react_probability),
        };
        let result = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return TaskOutcome::Aborted,
            result = self.generator.generate(&request, &task.cancel) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_cancelled() => return TaskOutcome::Aborted,
            Err(source) => {
                if self.checkpoint(lane, task).await.is_none() {
                    return TaskOutcome::Aborted;
                }
                let err = SchedulerError::GenerationRequestFailed {
                    conversation_id: lane.id.clone(),
                    task_id: task.id,
                    source,
                };
                tracing::warn!(%err, "generation request failed");
                self.events.on_error(&err);
                return TaskOutcome::Failed;
            }
        };

        // Reaction.
        let mut conversation = task.conversation.clone();
        if let Some(proposal) = response.reaction.as_ref() {
            {
                let Some(mut state) = self.checkpoint(lane, task).await else {
                    return TaskOutcome::Aborted;
                };
                self.apply_reaction(&lane.id, &mut conversation, proposal);
                state.touch();
            }
            if !pause(&task.cancel, self.cfg.reaction_delay()).await {
                return TaskOutcome::Aborted;
            }
        }
        if !response.has_content() {
            if self.checkpoint(lane, task).await.is_none() {
                return TaskOutcome::Aborted;
            }
            tracing::debug!(sender = %response.sender, "reply carried no content");
            return TaskOutcome::Completed;
        }

        // Typing.
        {
            let Some(_state) = self.checkpoint(lane, task).await else {
                return TaskOutcome::Aborted;
            };
            self.events
                .on_typing_status_changed(Some(&lane.id), Some(&response.sender));
        }
        if !pause(&task.cancel, self.typing_delay(task)).await {
            return TaskOutcome::Aborted;
        }

        // Delivery.
        let message = Message::generated(response.sender.clone(), response.content.clone());
        {
            let Some(mut state) = self.checkpoint(lane, task).await else {
                return TaskOutcome::Aborted;
            };
            self.events.on_message_generated(&lane.id, &message);
            self.events.on_typing_status_changed(None, None);
            state.record_delivery(limit);
            state.touch();
            tracing::info!(
                sender = %message.sender,
                consecutive = state.consecutive_generated,
                "simulated message delivered"
            );
        }
        conversation.messages.push(message);

        // Continuation.
        if should_wrap_up {
            if !pause(&task.cancel, self.cfg.wrap_up_delay()).await {
                return TaskOutcome::Aborted;
            }
            let Some(mut state) = self.checkpoint(lane, task).await else {
                return TaskOutcome::Aborted;
            };
            let notice = Message::system(self.cfg.silenced_message.clone());
            self.events.on_message_generated(&lane.id, &notice);
            state.touch();
            tracing::info!(turn_limit = limit, "turn limit reached; conversation wrapped up");
            return TaskOutcome::Completed;
        }

        if !pause(&task.cancel, self.cfg.continuation_delay()).await {
            return TaskOutcome::Aborted;
        }
        let Some(mut state) = self.checkpoint(lane, task).await else {
            return TaskOutcome::Aborted;
        };
        if conversation.recipients.len() > 1 {
            let follow_up = Task::new(
                conversation,
                TaskPriority::SimulatedReply,
                self.shutdown.child_token(),
                task.version_snapshot,
            )
            .excluding(response.sender);
            tracing::debug!(task_id = %follow_up.id, "follow-up turn queued");
            // This worker is still running and drains the follow-up itself.
            state.push(follow_up);
        }
        TaskOutcome::Completed
    }

    fn apply_reaction(
        &self,
        conversation_id: &ConversationId,
        conversation: &mut Conversation,
        proposal: &ReactionProposal,
    ) {
        let target = proposal
            .target_message_id
            .clone()
            .or_else(|| conversation.reaction_target().cloned());
        let Some(target) = target else {
            tracing::warn!("reaction proposed for an empty conversation");
            return;
        };
        let Some(message) = conversation.message_mut(&target) else {
            tracing::warn!(message_id = %target, "reaction target not in conversation snapshot");
            return;
        };
        let reaction = proposal.to_reaction();
        message.reactions.push(reaction.clone());
        let update = MessageUpdate {
            reactions: Some(message.reactions.clone()),
        };
        self.events
            .on_message_updated(conversation_id, &target, &update);
        self.events.on_reaction_played(conversation_id, &reaction);
    }
}

async fn run_worker(inner: Arc<SchedulerInner>, lane: Arc<Lane>, epoch: u64) {
    loop {
        let task = {
            let mut state = lane.state.lock().await;
            if state.worker_epoch != epoch {
                return;
            }
            match state.next_task() {
                Some(task) => task,
                None => return,
            }
        };

        let outcome = inner.process(&lane, &task).await;

        let mut state = lane.state.lock().await;
        if state.worker_epoch != epoch {
            return;
        }
        state.current = None;
        if outcome == TaskOutcome::Aborted {
            inner.events.on_typing_status_changed(None, None);
        }
        tracing::debug!(
            conversation_id = %lane.id,
            task_id = %task.id,
            ?outcome,
            remaining = state.pending.len(),
            "task finished"
        );
    }
}

async fn run_debounce(
    inner: Arc<SchedulerInner>,
    lane: Arc<Lane>,
    debounce_id: Uuid,
    timer: CancellationToken,
) {
    tokio::select! {
        _ = timer.cancelled() => return,
        _ = tokio::time::sleep(inner.cfg.debounce()) => {}
    }

    let mut state = lane.state.lock().await;
    if timer.is_cancelled()
        || state.evicted
        || state.debounce.as_ref().map(|d| d.id) != Some(debounce_id)
    {
        return;
    }
    let Some(pending) = state.debounce.take() else {
        return;
    };

    // Anything queued during the window was built against the old version.
    inner.cancel_locked(&lane.id, &mut state);
    state.version = state.version.saturating_add(1);
    state.consecutive_generated = 0;
    let task = Task::new(
        pending.snapshot,
        TaskPriority::UserTriggered,
        inner.shutdown.child_token(),
        state.version,
    );
    state.touch();
    inner.submit_locked(&lane, &mut state, task);
}

fn spawn_sweep_loop(
    inner: Weak<SchedulerInner>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("lane sweep loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let evicted = inner.evict_expired(Utc::now()).await;
                    if evicted > 0 {
                        tracing::info!(evicted, "evicted idle conversation lanes");
                    }
                }
            }
        }
    })
}

/// Sleep unless the task is cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::rng().random_range(0..=max_ms)
}

fn roll_reaction(probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    rand::rng().random_bool(probability.min(1.0))
}
