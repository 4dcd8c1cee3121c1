//! The engine that owns emergency episodes and drives escalation.

use crate::common::{EpisodeId, UserId};
use crate::components::dispatch::{
    dispatch_order, DispatchOutcome, EmergencyContact, EpisodeContext, NotificationDispatcher,
};
use crate::components::episode::{
    EmergencyEpisode, EpisodeState, GeoPoint, Severity, TransitionError, TriggerKind,
};
use crate::components::policy::{decide, EscalationAction, UserIntent};
use crate::config::VitalWatchConfig;
use crate::events::{AlertEvent, EpisodeEvent};
use crate::time::{Countdown, CountdownHandle, CountdownSignal, TimerError};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Errors returned by engine operations.
///
/// Validation errors are returned synchronously and never retried; dispatch
/// failures are not an error variant because the engine handles them
/// internally (retry, then fail-open escalation with `dispatch_failed`).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested countdown falls outside the configured bounds.
    #[error("countdown of {requested}s is outside the allowed {min}..={max}s range")]
    CountdownOutOfRange { requested: u32, min: u32, max: u32 },
    /// The user already has an armed episode; the existing one is untouched.
    #[error("user {user} already has an armed episode")]
    EpisodeAlreadyArmed { user: UserId, existing: EpisodeId },
    /// The operation is not legal in the episode's current state.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    /// No episode exists under this id.
    #[error("unknown episode: {0:?}")]
    UnknownEpisode(EpisodeId),
    /// The timer primitive rejected the request.
    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// Optional knobs for a new episode.
///
/// `Default` gives the product's stock panic-button behavior: the
/// configured countdown budget, high severity, no location or message.
#[derive(Debug, Clone, Default)]
pub struct EpisodeOptions {
    /// Countdown budget override; the engine default applies when `None`.
    pub countdown_secs: Option<u32>,
    pub severity: Option<Severity>,
    pub location: Option<GeoPoint>,
    pub message: Option<String>,
}

/// Why a dispatch is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchCause {
    SendNow,
    CountdownExpired,
}

/// The escalation engine.
///
/// This struct is the central point of control. It holds the configuration,
/// the per-user contact registry, every live and archived episode, and the
/// countdown driving each armed episode. The engine is designed to be
/// cloned and shared across tasks, providing a handle to the running
/// instance.
///
/// Episode state lives behind a single write lock, so the mutation entry
/// points (countdown signals, `cancel`, `send_now`, `resolve`) are
/// serialized per engine: an intent that lands between two ticks is always
/// observed by the next tick. Events are published while the lock is held,
/// so subscribers observe transitions in mutation order.
#[derive(Clone)]
pub struct EscalationEngine {
    config: Arc<VitalWatchConfig>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    episodes: Arc<RwLock<SlotMap<EpisodeId, EmergencyEpisode>>>,
    armed_index: Arc<RwLock<HashMap<UserId, EpisodeId>>>,
    countdowns: Arc<RwLock<HashMap<EpisodeId, CountdownHandle>>>,
    contacts: Arc<RwLock<HashMap<UserId, Vec<EmergencyContact>>>>,
    episode_sender: broadcast::Sender<EpisodeEvent>,
    alert_sender: broadcast::Sender<AlertEvent>,
}

// Core implementation block for internal logic.
impl EscalationEngine {
    /// Creates a new `EscalationEngine` with the given configuration and
    /// notification transport.
    pub fn new(config: VitalWatchConfig, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        const CHANNEL_CAPACITY: usize = 256;
        let (episode_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (alert_sender, _) = broadcast::channel(64);

        Self {
            config: Arc::new(config),
            dispatcher,
            episodes: Arc::new(RwLock::new(SlotMap::with_key())),
            armed_index: Arc::new(RwLock::new(HashMap::new())),
            countdowns: Arc::new(RwLock::new(HashMap::new())),
            contacts: Arc::new(RwLock::new(HashMap::new())),
            episode_sender,
            alert_sender,
        }
    }

    /// Blocks until a Ctrl+C signal, then stops every live countdown.
    ///
    /// The engine needs no background loop of its own: each armed episode
    /// owns its countdown task. `run` exists for binaries that want the
    /// process to stay alive while episodes play out and to stop ticking
    /// cleanly on shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("EscalationEngine running. Press Ctrl+C to shut down.");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received. Stopping live countdowns...");
        self.shutdown().await;
        info!("EscalationEngine has shut down.");
        Ok(())
    }

    /// Cancels every running countdown without touching episode state.
    pub async fn shutdown(&self) {
        let mut countdowns = self.countdowns.write().await;
        for (id, handle) in countdowns.drain() {
            debug!(episode = ?id, "stopping countdown");
            handle.cancel();
        }
    }

    #[doc(hidden)]
    async fn handle_countdown_signal(&self, id: EpisodeId, signal: CountdownSignal) {
        if matches!(signal, CountdownSignal::Expired) {
            debug!(episode = ?id, "countdown expired");
        }
        if let Err(err) = self.advance_countdown(id).await {
            error!(episode = ?id, %err, "countdown handling failed");
        }
    }

    /// Applies one elapsed second to an armed episode and escalates once
    /// the policy says the budget is spent.
    #[doc(hidden)]
    async fn advance_countdown(&self, id: EpisodeId) -> Result<(), EngineError> {
        let escalate = {
            let mut episodes = self.episodes.write().await;
            let Some(episode) = episodes.get_mut(id) else {
                debug!(episode = ?id, "countdown signal for unknown episode ignored");
                return Ok(());
            };
            let Some(remaining) = episode.record_tick() else {
                debug!(episode = ?id, state = %episode.state, "countdown signal after stop ignored");
                return Ok(());
            };
            debug!(episode = ?id, remaining, "countdown tick");
            let snapshot = episode.clone();
            self.episode_sender
                .send(EpisodeEvent::CountdownTicked { episode: snapshot })
                .ok();
            decide(episode.state, remaining, None) == EscalationAction::Escalate
        };

        if escalate {
            match self
                .begin_escalation(id, DispatchCause::CountdownExpired)
                .await
            {
                Ok((targets, context)) => {
                    self.run_dispatch(id, targets, context).await?;
                }
                Err(EngineError::UnknownEpisode(_)) | Err(EngineError::InvalidTransition(_)) => {
                    // A cancel or send-now won the race between the final
                    // tick and the escalation; the intent takes precedence.
                    debug!(episode = ?id, "expiry superseded by a user intent");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// First half of escalation: moves the episode to `notifying` under the
    /// write lock, stops its countdown, and collects what dispatch needs.
    /// The lock must not be held across dispatch awaits, so the second half
    /// runs in `run_dispatch`.
    #[doc(hidden)]
    async fn begin_escalation(
        &self,
        id: EpisodeId,
        cause: DispatchCause,
    ) -> Result<(Vec<EmergencyContact>, EpisodeContext), EngineError> {
        let mut episodes = self.episodes.write().await;
        let episode = episodes
            .get_mut(id)
            .ok_or(EngineError::UnknownEpisode(id))?;

        let intent = match cause {
            DispatchCause::SendNow => Some(UserIntent::SendNowRequested),
            DispatchCause::CountdownExpired => None,
        };
        match decide(episode.state, episode.seconds_remaining, intent) {
            EscalationAction::Notify => {}
            EscalationAction::Escalate => episode.severity = Severity::Critical,
            EscalationAction::None | EscalationAction::Cancel => {
                return Err(TransitionError {
                    from: episode.state,
                    to: EpisodeState::Notifying,
                }
                .into());
            }
        }
        episode.transition(EpisodeState::Notifying)?;
        self.armed_index.write().await.remove(&episode.user_id);
        if let Some(handle) = self.countdowns.write().await.remove(&id) {
            handle.cancel();
        }

        let registry = self
            .contacts
            .read()
            .await
            .get(&episode.user_id)
            .cloned()
            .unwrap_or_default();
        let targets = dispatch_order(&registry);
        let context = EpisodeContext {
            episode_id: id,
            user_id: episode.user_id.clone(),
            trigger: episode.trigger,
            severity: episode.severity,
            location: episode.location.clone(),
            message: episode.message.clone(),
        };
        let snapshot = episode.clone();
        info!(
            episode = ?id,
            user = %snapshot.user_id,
            cause = ?cause,
            contacts = targets.len(),
            severity = %snapshot.severity,
            "dispatch started"
        );
        self.episode_sender
            .send(EpisodeEvent::DispatchStarted { episode: snapshot })
            .ok();
        Ok((targets, context))
    }

    /// Drives the dispatcher with bounded exponential backoff. Exhausting
    /// every attempt still escalates the episode, with delivery marked
    /// failed: a safety system must never fail silently.
    #[doc(hidden)]
    async fn run_dispatch(
        &self,
        id: EpisodeId,
        targets: Vec<EmergencyContact>,
        context: EpisodeContext,
    ) -> Result<EmergencyEpisode, EngineError> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.dispatcher.notify(&targets, &context).await {
                Ok(outcome) => {
                    debug!(
                        episode = ?id,
                        attempt,
                        delivered = outcome.succeeded.len(),
                        unreachable = outcome.failed.len(),
                        "dispatch attempt completed"
                    );
                    self.alert_sender
                        .send(AlertEvent::DispatchAttempted {
                            episode_id: id,
                            attempt,
                            succeeded: outcome.succeeded.clone(),
                            failed: outcome.failed.clone(),
                        })
                        .ok();
                    return self.finalize_escalation(id, Some(outcome)).await;
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        let backoff = self.config.retry.backoff_for(attempt);
                        warn!(
                            episode = ?id,
                            attempt,
                            max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %last_error,
                            "dispatch attempt failed, retrying"
                        );
                        self.alert_sender
                            .send(AlertEvent::DispatchRetrying {
                                episode_id: id,
                                attempt,
                                backoff,
                                error: last_error.clone(),
                            })
                            .ok();
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!(
            episode = ?id,
            attempts = max_attempts,
            error = %last_error,
            "dispatch exhausted, escalating with delivery marked failed"
        );
        self.alert_sender
            .send(AlertEvent::DeliveryExhausted {
                episode_id: id,
                attempts: max_attempts,
                error: last_error,
            })
            .ok();
        self.finalize_escalation(id, None).await
    }

    /// Second half of escalation: records the dispatch outcome and lands
    /// the episode on `escalated`.
    #[doc(hidden)]
    async fn finalize_escalation(
        &self,
        id: EpisodeId,
        outcome: Option<DispatchOutcome>,
    ) -> Result<EmergencyEpisode, EngineError> {
        let mut episodes = self.episodes.write().await;
        let episode = episodes
            .get_mut(id)
            .ok_or(EngineError::UnknownEpisode(id))?;
        match outcome {
            Some(outcome) => {
                episode.dispatch_failed = !outcome.any_delivered();
                episode.append_notified(outcome.succeeded);
            }
            None => episode.dispatch_failed = true,
        }
        episode.transition(EpisodeState::Escalated)?;
        let snapshot = episode.clone();
        info!(
            episode = ?id,
            user = %snapshot.user_id,
            notified = snapshot.contacts_notified.len(),
            dispatch_failed = snapshot.dispatch_failed,
            "episode escalated"
        );
        self.episode_sender
            .send(EpisodeEvent::Escalated {
                episode: snapshot.clone(),
            })
            .ok();
        Ok(snapshot)
    }
}

// Public API implementation block.
impl EscalationEngine {
    /// Creates an episode for `user` and arms its countdown.
    ///
    /// Fails with [`EngineError::EpisodeAlreadyArmed`] if the user already
    /// has an armed episode, and with [`EngineError::CountdownOutOfRange`]
    /// if the requested budget falls outside the configured bounds. Both
    /// are rejected before any state mutation.
    pub async fn start_episode(
        &self,
        user: UserId,
        trigger: TriggerKind,
        options: EpisodeOptions,
    ) -> Result<EmergencyEpisode, EngineError> {
        let countdown_secs = options
            .countdown_secs
            .unwrap_or(self.config.countdown.default_secs);
        let min = self.config.countdown.min_secs;
        let max = self.config.countdown.max_secs;
        if countdown_secs < min || countdown_secs > max {
            return Err(EngineError::CountdownOutOfRange {
                requested: countdown_secs,
                min,
                max,
            });
        }
        let countdown = Countdown::new(countdown_secs)?;

        let mut episodes = self.episodes.write().await;
        let mut armed = self.armed_index.write().await;
        if let Some(existing) = armed.get(&user) {
            return Err(EngineError::EpisodeAlreadyArmed {
                user,
                existing: *existing,
            });
        }
        let severity = options.severity.unwrap_or(Severity::High);
        let id = episodes.insert_with_key(|key| {
            EmergencyEpisode::new(
                key,
                user.clone(),
                trigger,
                severity,
                countdown_secs,
                options.location,
                options.message,
            )
        });
        armed.insert(user, id);

        let engine = self.clone();
        let handle = countdown.start(move |signal| {
            let engine = engine.clone();
            async move { engine.handle_countdown_signal(id, signal).await }
        });
        self.countdowns.write().await.insert(id, handle);

        let snapshot = episodes[id].clone();
        info!(
            episode = ?id,
            user = %snapshot.user_id,
            trigger = %snapshot.trigger,
            countdown_secs,
            "emergency episode armed"
        );
        self.episode_sender
            .send(EpisodeEvent::Armed {
                episode: snapshot.clone(),
            })
            .ok();
        Ok(snapshot)
    }

    /// Cancels an armed episode and synchronously stops its countdown: by
    /// the time this returns, no further tick can touch the episode.
    ///
    /// Valid only while `armed`; anything else is
    /// [`EngineError::InvalidTransition`].
    pub async fn cancel(&self, id: EpisodeId) -> Result<EmergencyEpisode, EngineError> {
        let mut episodes = self.episodes.write().await;
        let episode = episodes
            .get_mut(id)
            .ok_or(EngineError::UnknownEpisode(id))?;
        if decide(
            episode.state,
            episode.seconds_remaining,
            Some(UserIntent::CancelRequested),
        ) != EscalationAction::Cancel
        {
            return Err(TransitionError {
                from: episode.state,
                to: EpisodeState::Cancelled,
            }
            .into());
        }
        episode.transition(EpisodeState::Cancelled)?;
        self.armed_index.write().await.remove(&episode.user_id);
        if let Some(handle) = self.countdowns.write().await.remove(&id) {
            handle.cancel();
        }
        let snapshot = episode.clone();
        info!(
            episode = ?id,
            user = %snapshot.user_id,
            seconds_remaining = snapshot.seconds_remaining,
            "episode cancelled"
        );
        self.episode_sender
            .send(EpisodeEvent::Cancelled {
                episode: snapshot.clone(),
            })
            .ok();
        Ok(snapshot)
    }

    /// Skips the rest of the countdown and notifies contacts immediately.
    ///
    /// Valid only while `armed`. The remaining time is frozen at its
    /// current value and the returned episode reflects the completed
    /// dispatch (`escalated`, with `contacts_notified` and
    /// `dispatch_failed` filled in).
    pub async fn send_now(&self, id: EpisodeId) -> Result<EmergencyEpisode, EngineError> {
        let (targets, context) = self.begin_escalation(id, DispatchCause::SendNow).await?;
        self.run_dispatch(id, targets, context).await
    }

    /// Acknowledges an escalated episode as handled.
    ///
    /// The one sanctioned step out of `escalated`; countdown signals and
    /// user intents still treat `escalated` as final.
    pub async fn resolve(&self, id: EpisodeId) -> Result<EmergencyEpisode, EngineError> {
        let mut episodes = self.episodes.write().await;
        let episode = episodes
            .get_mut(id)
            .ok_or(EngineError::UnknownEpisode(id))?;
        episode.transition(EpisodeState::Resolved)?;
        let snapshot = episode.clone();
        info!(episode = ?id, user = %snapshot.user_id, "episode resolved");
        self.episode_sender
            .send(EpisodeEvent::Resolved {
                episode: snapshot.clone(),
            })
            .ok();
        Ok(snapshot)
    }

    /// Replaces the user's emergency-contact registry.
    pub async fn set_contacts(&self, user: UserId, contacts: Vec<EmergencyContact>) {
        debug!(user = %user, count = contacts.len(), "contact registry updated");
        self.contacts.write().await.insert(user, contacts);
    }

    /// The user's registered contacts, in registry order.
    pub async fn contacts_for(&self, user: &UserId) -> Vec<EmergencyContact> {
        self.contacts
            .read()
            .await
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// A point-in-time snapshot of one episode.
    pub async fn episode(&self, id: EpisodeId) -> Option<EmergencyEpisode> {
        self.episodes.read().await.get(id).cloned()
    }

    /// The user's currently armed episode, if any.
    pub async fn armed_episode_for(&self, user: &UserId) -> Option<EmergencyEpisode> {
        let episodes = self.episodes.read().await;
        let armed = self.armed_index.read().await;
        armed.get(user).and_then(|id| episodes.get(*id)).cloned()
    }

    /// Every episode the user has triggered, newest first. Terminal
    /// episodes are retained as immutable history.
    pub async fn history(&self, user: &UserId) -> Vec<EmergencyEpisode> {
        let episodes = self.episodes.read().await;
        let mut history: Vec<EmergencyEpisode> = episodes
            .values()
            .filter(|episode| &episode.user_id == user)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history
    }

    /// Subscribes to the `EpisodeEvent` stream.
    pub fn subscribe_episode_events(&self) -> broadcast::Receiver<EpisodeEvent> {
        self.episode_sender.subscribe()
    }

    /// Subscribes to the `AlertEvent` stream.
    pub fn subscribe_alert_events(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ContactId;
    use crate::components::dispatch::DispatchError;
    use crate::config::{CountdownConfig, RetryConfig};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Dispatcher that replays a scripted response per attempt and counts
    /// calls. With an empty script every contact is reported as reached.
    #[derive(Default)]
    struct ScriptedDispatcher {
        calls: AtomicU32,
        script: Mutex<VecDeque<Result<DispatchOutcome, DispatchError>>>,
    }

    impl ScriptedDispatcher {
        fn with_script(
            responses: impl IntoIterator<Item = Result<DispatchOutcome, DispatchError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(responses.into_iter().collect()),
            })
        }

        fn always_succeeds() -> Arc<Self> {
            Self::with_script([])
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NotificationDispatcher for ScriptedDispatcher {
        async fn notify(
            &self,
            contacts: &[EmergencyContact],
            _context: &EpisodeContext,
        ) -> Result<DispatchOutcome, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(response) => response,
                None => Ok(DispatchOutcome::all_succeeded(contacts)),
            }
        }
    }

    fn test_config() -> VitalWatchConfig {
        VitalWatchConfig {
            countdown: CountdownConfig {
                default_secs: 60,
                min_secs: 1,
                max_secs: 600,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
            },
        }
    }

    fn test_engine(dispatcher: Arc<ScriptedDispatcher>) -> EscalationEngine {
        EscalationEngine::new(test_config(), dispatcher)
    }

    fn user(name: &str) -> UserId {
        UserId(name.to_string())
    }

    async fn register_contacts(engine: &EscalationEngine, user: &UserId) {
        engine
            .set_contacts(
                user.clone(),
                vec![
                    EmergencyContact::new(ContactId(1), "Dana"),
                    EmergencyContact::new(ContactId(2), "Lee"),
                ],
            )
            .await;
    }

    async fn armed_episode(
        engine: &EscalationEngine,
        user: &UserId,
        countdown_secs: u32,
    ) -> EmergencyEpisode {
        engine
            .start_episode(
                user.clone(),
                TriggerKind::PanicButton,
                EpisodeOptions {
                    countdown_secs: Some(countdown_secs),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    fn drain_episode_events(rx: &mut broadcast::Receiver<EpisodeEvent>) -> Vec<EpisodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn drain_alert_events(rx: &mut broadcast::Receiver<AlertEvent>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn full_countdown_escalates_with_one_dispatch() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 180).await;
        for _ in 0..180 {
            engine.advance_countdown(episode.id).await.unwrap();
        }

        let after = engine.episode(episode.id).await.unwrap();
        assert_eq!(after.state, EpisodeState::Escalated);
        assert_eq!(after.seconds_remaining, 0);
        assert_eq!(after.severity, Severity::Critical);
        assert_eq!(after.contacts_notified, vec![ContactId(1), ContactId(2)]);
        assert!(!after.dispatch_failed);
        assert!(after.resolved_at.is_some());
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_countdown_never_dispatches() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 180).await;
        for _ in 0..5 {
            engine.advance_countdown(episode.id).await.unwrap();
        }
        let cancelled = engine.cancel(episode.id).await.unwrap();

        assert_eq!(cancelled.state, EpisodeState::Cancelled);
        assert_eq!(cancelled.seconds_remaining, 175);
        assert!(cancelled.resolved_at.is_some());
        assert!(cancelled.contacts_notified.is_empty());
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_after_cancel_leave_the_episode_untouched() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");

        let episode = armed_episode(&engine, &ada, 30).await;
        engine.cancel(episode.id).await.unwrap();

        for _ in 0..40 {
            engine.advance_countdown(episode.id).await.unwrap();
        }
        let after = engine.episode(episode.id).await.unwrap();
        assert_eq!(after.state, EpisodeState::Cancelled);
        assert_eq!(after.seconds_remaining, 30);
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_now_freezes_remaining_time() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 180).await;
        for _ in 0..100 {
            engine.advance_countdown(episode.id).await.unwrap();
        }
        let escalated = engine.send_now(episode.id).await.unwrap();

        assert_eq!(escalated.state, EpisodeState::Escalated);
        assert_eq!(escalated.seconds_remaining, 80);
        assert_eq!(escalated.severity, Severity::High, "send-now keeps severity");
        assert_eq!(
            escalated.contacts_notified,
            vec![ContactId(1), ContactId(2)]
        );
        assert_eq!(dispatcher.calls(), 1);

        let after = engine.episode(episode.id).await.unwrap();
        assert_eq!(after.seconds_remaining, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_raises_severity_to_critical() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 2).await;
        engine.advance_countdown(episode.id).await.unwrap();
        engine.advance_countdown(episode.id).await.unwrap();

        let after = engine.episode(episode.id).await.unwrap();
        assert_eq!(after.state, EpisodeState::Escalated);
        assert_eq!(after.severity, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_escalate_fail_open() {
        let dispatcher = ScriptedDispatcher::with_script([
            Err(DispatchError::Unavailable("gateway down".to_string())),
            Err(DispatchError::Timeout(500)),
            Err(DispatchError::Unavailable("gateway down".to_string())),
        ]);
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;
        let mut alert_rx = engine.subscribe_alert_events();

        let episode = armed_episode(&engine, &ada, 1).await;
        engine.advance_countdown(episode.id).await.unwrap();

        let after = engine.episode(episode.id).await.unwrap();
        assert_eq!(after.state, EpisodeState::Escalated);
        assert!(after.dispatch_failed);
        assert!(after.contacts_notified.is_empty());
        assert_eq!(dispatcher.calls(), 3);

        let alerts = drain_alert_events(&mut alert_rx);
        assert_eq!(alerts.len(), 3);
        assert!(matches!(
            alerts[0],
            AlertEvent::DispatchRetrying { attempt: 1, .. }
        ));
        assert!(matches!(
            alerts[1],
            AlertEvent::DispatchRetrying { attempt: 2, .. }
        ));
        assert!(matches!(
            alerts[2],
            AlertEvent::DeliveryExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_on_retry() {
        let dispatcher = ScriptedDispatcher::with_script([
            Err(DispatchError::Unavailable("gateway down".to_string())),
            Ok(DispatchOutcome {
                succeeded: vec![ContactId(1)],
                failed: vec![ContactId(2)],
            }),
        ]);
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 5).await;
        let escalated = engine.send_now(episode.id).await.unwrap();

        assert_eq!(escalated.state, EpisodeState::Escalated);
        assert_eq!(escalated.contacts_notified, vec![ContactId(1)]);
        assert!(!escalated.dispatch_failed, "partial delivery still counts");
        assert_eq!(dispatcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_contact_registry_marks_dispatch_failed() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");

        let episode = armed_episode(&engine, &ada, 5).await;
        let escalated = engine.send_now(episode.id).await.unwrap();

        assert_eq!(escalated.state, EpisodeState::Escalated);
        assert!(escalated.contacts_notified.is_empty());
        assert!(escalated.dispatch_failed, "nobody was reached");
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_while_armed_is_rejected() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");

        let first = armed_episode(&engine, &ada, 60).await;
        let err = engine
            .start_episode(ada.clone(), TriggerKind::Manual, EpisodeOptions::default())
            .await
            .unwrap_err();
        match err {
            EngineError::EpisodeAlreadyArmed { existing, .. } => {
                assert_eq!(existing, first.id);
            }
            other => panic!("expected EpisodeAlreadyArmed, got {other:?}"),
        }

        let untouched = engine.episode(first.id).await.unwrap();
        assert_eq!(untouched.state, EpisodeState::Armed);
        assert_eq!(untouched.seconds_remaining, 60);

        // A different user is unaffected by ada's armed episode.
        let bea = user("bea");
        assert!(engine
            .start_episode(bea, TriggerKind::PanicButton, EpisodeOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_frees_the_user_for_a_new_episode() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");

        let first = armed_episode(&engine, &ada, 60).await;
        assert!(engine.armed_episode_for(&ada).await.is_some());

        engine.cancel(first.id).await.unwrap();
        assert!(engine.armed_episode_for(&ada).await.is_none());

        let second = armed_episode(&engine, &ada, 60).await;
        assert_ne!(second.id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_bounds_are_enforced() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");

        let too_short = engine
            .start_episode(
                ada.clone(),
                TriggerKind::Manual,
                EpisodeOptions {
                    countdown_secs: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            too_short,
            EngineError::CountdownOutOfRange { requested: 0, .. }
        ));

        let too_long = engine
            .start_episode(
                ada.clone(),
                TriggerKind::Manual,
                EpisodeOptions {
                    countdown_secs: Some(601),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            too_long,
            EngineError::CountdownOutOfRange { requested: 601, .. }
        ));

        // Rejected triggers leave no episode behind.
        assert!(engine.armed_episode_for(&ada).await.is_none());
        assert!(engine.history(&ada).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn intents_against_terminal_states_are_strict_errors() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");

        let episode = armed_episode(&engine, &ada, 30).await;
        engine.cancel(episode.id).await.unwrap();

        assert!(matches!(
            engine.cancel(episode.id).await.unwrap_err(),
            EngineError::InvalidTransition(_)
        ));
        assert!(matches!(
            engine.send_now(episode.id).await.unwrap_err(),
            EngineError::InvalidTransition(_)
        ));
        assert!(matches!(
            engine.resolve(episode.id).await.unwrap_err(),
            EngineError::InvalidTransition(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_episode_ids_are_rejected() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher);

        assert!(matches!(
            engine.cancel(EpisodeId::default()).await.unwrap_err(),
            EngineError::UnknownEpisode(_)
        ));
        assert!(matches!(
            engine.send_now(EpisodeId::default()).await.unwrap_err(),
            EngineError::UnknownEpisode(_)
        ));
        assert!(engine.episode(EpisodeId::default()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_acknowledges_an_escalated_episode() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 5).await;
        let escalated = engine.send_now(episode.id).await.unwrap();
        let resolved = engine.resolve(episode.id).await.unwrap();

        assert_eq!(resolved.state, EpisodeState::Resolved);
        assert_eq!(
            resolved.resolved_at, escalated.resolved_at,
            "acknowledgement keeps the escalation timestamp"
        );
        assert!(matches!(
            engine.resolve(episode.id).await.unwrap_err(),
            EngineError::InvalidTransition(_)
        ));

        // Resolving never applies to armed episodes.
        let fresh = armed_episode(&engine, &ada, 30).await;
        assert!(matches!(
            engine.resolve(fresh.id).await.unwrap_err(),
            EngineError::InvalidTransition(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn events_follow_the_mutation_order() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;
        let mut episode_rx = engine.subscribe_episode_events();

        let episode = armed_episode(&engine, &ada, 3).await;
        for _ in 0..3 {
            engine.advance_countdown(episode.id).await.unwrap();
        }

        let kinds: Vec<&'static str> = drain_episode_events(&mut episode_rx)
            .iter()
            .map(|event| event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "armed",
                "countdown_ticked",
                "countdown_ticked",
                "countdown_ticked",
                "dispatch_started",
                "escalated",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn history_keeps_terminal_episodes_queryable() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let first = armed_episode(&engine, &ada, 30).await;
        engine.cancel(first.id).await.unwrap();
        let second = armed_episode(&engine, &ada, 30).await;
        engine.send_now(second.id).await.unwrap();

        let history = engine.history(&ada).await;
        assert_eq!(history.len(), 2);
        let states: Vec<EpisodeState> = history.iter().map(|e| e.state).collect();
        assert!(states.contains(&EpisodeState::Cancelled));
        assert!(states.contains(&EpisodeState::Escalated));

        // Another user's history stays empty.
        assert!(engine.history(&user("bea")).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_clears_the_armed_index_and_countdown() {
        let dispatcher = ScriptedDispatcher::always_succeeds();
        let engine = test_engine(dispatcher.clone());
        let ada = user("ada");
        register_contacts(&engine, &ada).await;

        let episode = armed_episode(&engine, &ada, 5).await;
        assert!(engine.countdowns.read().await.contains_key(&episode.id));

        engine.send_now(episode.id).await.unwrap();
        assert!(engine.armed_episode_for(&ada).await.is_none());
        assert!(!engine.countdowns.read().await.contains_key(&episode.id));
    }
}
