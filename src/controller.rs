//! Fleet controller.
//!
//! Owns the in-memory copy of the active session. Every provider call runs on
//! the blocking pool; state changes are applied under a short lock, persisted
//! once and published on a `watch` channel.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::attention::content::TAIL_LINES;
use crate::attention::{ContentMatcher, ContentSignal};
use crate::automation::{
    DisplayProvider, StaticDisplays, TerminalAutomation, WindowIdentity, WindowLaunch,
    WindowSnapshot,
};
use crate::error::{AutomationError, FleetError, Result, ValidationError};
use crate::event_bus::{route_events, EventTail};
use crate::events::EventEmitter;
use crate::helpers::{last_nonempty_lines, strip_ansi};
use crate::layout::{allocate, select_displays};
use crate::lifecycle::{self, Signal, Transition};
use crate::planner::{LaunchPlanner, WrapperInvocation};
use crate::protocol::{
    ActiveSession, AgentState, AgentWindow, LaunchRequest, TerminalTarget, EXTERNAL_TOOL_ID,
};
use crate::reconcile::{import_windows, reconcile};
use crate::store::SessionStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_500);
pub const DEFAULT_LAUNCH_DELAY: Duration = Duration::from_millis(400);

/// Cooperative cancellation shared between a launch and whoever started it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchProgress {
    Started {
        session_id: String,
        total: usize,
    },
    WindowOpened {
        index: usize,
        total: usize,
        agent_id: String,
        window_id: String,
        name: String,
    },
    Cancelled {
        opened: usize,
        total: usize,
    },
    Finished {
        opened: usize,
    },
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub session: ActiveSession,
    pub cancelled: bool,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub skipped: bool,
    pub events: usize,
    pub transitions: Vec<Transition>,
    pub removed: Vec<AgentWindow>,
    pub session_cleared: bool,
}

/// Everything a cycle changes, gathered before the session is touched.
enum Mutation {
    Signal { agent_id: String, signal: Signal },
    Content { agent_id: String, text: String },
    Reconcile(Vec<WindowSnapshot>),
}

struct ControllerState {
    session: Option<ActiveSession>,
    tail: EventTail,
    /// Prompt matchers for attached windows, which have no wrapper.
    matchers: HashMap<String, ContentMatcher>,
}

/// Deliver a progress event. A receiver that went away only loses progress.
async fn send_progress(progress: &Option<mpsc::Sender<LaunchProgress>>, event: LaunchProgress) {
    let Some(tx) = progress else {
        return;
    };
    if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
        tracing::debug!(target = "agent_fleet::controller", event = ?event, "progress receiver closed, dropping event");
    }
}

/// Resets a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Controller {
    store: Arc<dyn SessionStore>,
    automation: Arc<dyn TerminalAutomation>,
    displays: Arc<dyn DisplayProvider>,
    planner: LaunchPlanner,
    wrapper: WrapperInvocation,
    emitter: EventEmitter,
    launch_delay: Duration,
    state: Mutex<ControllerState>,
    cycle_running: AtomicBool,
    launching: AtomicBool,
    updates: watch::Sender<Option<ActiveSession>>,
}

impl Controller {
    /// Load the persisted session, if any, and resume tailing the event log
    /// where that session left off.
    pub fn new(
        store: Arc<dyn SessionStore>,
        automation: Arc<dyn TerminalAutomation>,
        displays: Arc<dyn DisplayProvider>,
        planner: LaunchPlanner,
        wrapper: WrapperInvocation,
    ) -> Result<Self> {
        let session = store.load()?;
        let mut tail = EventTail::new(wrapper.event_log.clone());
        if let Some(session) = &session {
            tail.resume_at(session.event_offset);
            tracing::debug!(
                target = "agent_fleet::controller",
                session_id = %session.session_id,
                offset = session.event_offset,
                "resuming event log"
            );
        }
        let (updates, _) = watch::channel(session.clone());
        Ok(Self {
            store,
            automation,
            displays,
            planner,
            wrapper,
            emitter: EventEmitter::new(false),
            launch_delay: DEFAULT_LAUNCH_DELAY,
            state: Mutex::new(ControllerState {
                session,
                tail,
                matchers: HashMap::new(),
            }),
            cycle_running: AtomicBool::new(false),
            launching: AtomicBool::new(false),
            updates,
        })
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn session(&self) -> Option<ActiveSession> {
        self.state.lock().session.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveSession>> {
        self.updates.subscribe()
    }

    async fn provider<T, F>(&self, call: F) -> std::result::Result<T, AutomationError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TerminalAutomation) -> std::result::Result<T, AutomationError>
            + Send
            + 'static,
    {
        let automation = Arc::clone(&self.automation);
        tokio::task::spawn_blocking(move || call(automation.as_ref()))
            .await
            .map_err(|e| AutomationError::Unavailable(format!("provider task failed: {e}")))?
    }

    /// Persist and publish the current session. An empty session is cleared.
    fn commit(&self, state: &mut ControllerState) -> Result<()> {
        if state.session.as_ref().is_some_and(ActiveSession::is_empty) {
            tracing::info!(target = "agent_fleet::controller", "last agent gone, clearing session");
            state.session = None;
        }
        let offset = state.tail.committed_offset();
        if let Some(session) = state.session.as_mut() {
            session.event_offset = offset;
        }
        let result = match &state.session {
            Some(session) => self.store.save(session),
            None => self.store.clear(),
        };
        self.updates.send_replace(state.session.clone());
        result.map_err(FleetError::from)
    }

    fn install_session(&self, session: ActiveSession) -> Result<()> {
        let mut state = self.state.lock();
        state.session = Some(session);
        self.commit(&mut state)
    }

    fn start_session(&self, session: &ActiveSession) {
        let mut state = self.state.lock();
        state.matchers.clear();
        if let Err(error) = state.tail.prime_to_end() {
            tracing::warn!(target = "agent_fleet::controller", error = %error, "failed to prime event log cursor");
        }
        tracing::info!(
            target = "agent_fleet::controller",
            session_id = %session.session_id,
            "starting session"
        );
    }

    async fn decorate(&self, agent: &AgentWindow) {
        let window_id = agent.window_id.clone();
        let identity = WindowIdentity {
            title: agent.title(),
            badge: agent.state.badge().to_string(),
            tone: agent.tone.clone(),
        };
        if let Err(error) = self
            .provider(move |p| p.apply_identity(&window_id, &identity))
            .await
        {
            tracing::warn!(
                target = "agent_fleet::controller",
                agent_id = %agent.agent_id,
                error = %error,
                "failed to update window decoration"
            );
        }
    }

    /// Validate, plan and open every window of `request`, replacing the
    /// current session.
    pub async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancelFlag,
        progress: Option<mpsc::Sender<LaunchProgress>>,
    ) -> Result<LaunchOutcome> {
        if request.target == TerminalTarget::External {
            return Err(ValidationError::ExternalTarget.into());
        }
        let plans = self.planner.plan(&request.items)?;
        let mut displays = select_displays(self.displays.displays(), &request.displays);
        if displays.is_empty() {
            tracing::warn!(target = "agent_fleet::controller", "display provider returned nothing, using default geometry");
            displays = StaticDisplays::default().displays();
        }
        let placements = allocate(plans.len(), request.layout, &displays);

        let Some(_launching) = FlagGuard::acquire(&self.launching) else {
            return Err(AutomationError::Unavailable("another launch is in progress".into()).into());
        };

        let total = plans.len();
        let mut session = ActiveSession::new(request, Utc::now());
        self.start_session(&session);
        send_progress(
            &progress,
            LaunchProgress::Started {
                session_id: session.session_id.clone(),
                total,
            },
        )
        .await;

        let mut cancelled = false;
        for (index, (plan, placement)) in plans.iter().zip(placements).enumerate() {
            if index > 0 && !self.launch_delay.is_zero() {
                tokio::time::sleep(self.launch_delay).await;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let launch = WindowLaunch {
                title: plan.name.clone(),
                directory: plan.directory.clone(),
                command: self.wrapper.command_for(plan, &session.session_id),
                display_id: placement.display_id.clone(),
                bounds: placement.bounds,
            };
            let window_id = match self.provider(move |p| p.launch_window(&launch)).await {
                Ok(id) => id,
                Err(source) => {
                    tracing::error!(
                        target = "agent_fleet::controller",
                        agent = %plan.name,
                        error = %source,
                        "window launch failed, abandoning remaining plan"
                    );
                    let opened = session.clone();
                    self.install_session(session)?;
                    return Err(FleetError::LaunchInterrupted {
                        session: Box::new(opened),
                        source,
                    });
                }
            };

            let agent = AgentWindow::from_plan(plan, window_id.clone(), Utc::now());
            let bounds_window = window_id.clone();
            let bounds = placement.bounds;
            if let Err(source) = self
                .provider(move |p| p.set_bounds(&bounds_window, bounds))
                .await
            {
                tracing::error!(
                    target = "agent_fleet::controller",
                    agent = %plan.name,
                    window_id = %window_id,
                    error = %source,
                    "window placement failed, abandoning remaining plan"
                );
                // The window exists, so the session keeps it.
                session.agents.push(agent);
                let opened = session.clone();
                self.install_session(session)?;
                return Err(FleetError::LaunchInterrupted {
                    session: Box::new(opened),
                    source,
                });
            }

            self.decorate(&agent).await;
            tracing::info!(
                target = "agent_fleet::controller",
                agent = %agent.name,
                agent_id = %agent.agent_id,
                window_id = %window_id,
                display = %placement.display_id,
                "agent window opened"
            );
            send_progress(
                &progress,
                LaunchProgress::WindowOpened {
                    index,
                    total,
                    agent_id: agent.agent_id.clone(),
                    window_id,
                    name: agent.name.clone(),
                },
            )
            .await;
            session.agents.push(agent);
        }

        let opened = session.agents.len();
        if cancelled {
            tracing::info!(target = "agent_fleet::controller", opened, total, "launch cancelled");
            send_progress(&progress, LaunchProgress::Cancelled { opened, total }).await;
        } else {
            send_progress(&progress, LaunchProgress::Finished { opened }).await;
        }
        self.emitter.emit(
            "session_launched",
            json!({
                "session_id": session.session_id,
                "agents": opened,
                "cancelled": cancelled,
            }),
        );

        let outcome = LaunchOutcome {
            session: session.clone(),
            cancelled,
        };
        self.install_session(session)?;
        Ok(outcome)
    }

    /// Provider-side inputs for one cycle.
    async fn gather(&self, session: &ActiveSession) -> Vec<Mutation> {
        let mut mutations = Vec::new();

        match self.provider(|p| p.list_window_snapshots()).await {
            Ok(snapshots) => mutations.push(Mutation::Reconcile(snapshots)),
            Err(error) => {
                tracing::warn!(target = "agent_fleet::controller", error = %error, "window snapshot failed, skipping reconciliation");
            }
        }

        let watchable = |agent: &&AgentWindow| {
            matches!(agent.state, AgentState::Running | AgentState::NeedsInput)
        };

        let candidates: Vec<String> = session
            .agents
            .iter()
            .filter(watchable)
            .filter(|a| a.tool_id != EXTERNAL_TOOL_ID)
            .map(|a| a.window_id.clone())
            .collect();
        if !candidates.is_empty() {
            let ids = candidates.clone();
            match self.provider(move |p| p.detect_idle_window_ids(&ids)).await {
                Ok(idle) => {
                    for agent in session.agents.iter().filter(|a| candidates.contains(&a.window_id)) {
                        let signal = if idle.contains(&agent.window_id) {
                            Signal::Idle
                        } else {
                            Signal::Busy
                        };
                        mutations.push(Mutation::Signal {
                            agent_id: agent.agent_id.clone(),
                            signal,
                        });
                    }
                }
                Err(error) => {
                    tracing::debug!(target = "agent_fleet::controller", error = %error, "idle census unavailable");
                }
            }
        }

        for agent in session
            .agents
            .iter()
            .filter(watchable)
            .filter(|a| a.tool_id == EXTERNAL_TOOL_ID)
        {
            let window_id = agent.window_id.clone();
            match self.provider(move |p| p.read_session_content(&window_id)).await {
                Ok(text) => mutations.push(Mutation::Content {
                    agent_id: agent.agent_id.clone(),
                    text,
                }),
                Err(error) => {
                    tracing::debug!(target = "agent_fleet::controller", agent_id = %agent.agent_id, error = %error, "failed to read window content");
                }
            }
        }

        mutations
    }

    /// One pass of event tailing, heuristics and reconciliation.
    pub async fn poll_cycle(&self) -> Result<CycleReport> {
        let Some(_running) = FlagGuard::acquire(&self.cycle_running) else {
            tracing::debug!(target = "agent_fleet::controller", "previous cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        };
        if self.launching.load(Ordering::Acquire) {
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        }
        let Some(snapshot) = self.session() else {
            return Ok(CycleReport::default());
        };

        let gathered = self.gather(&snapshot).await;
        let known_windows: HashSet<&str> =
            snapshot.agents.iter().map(|a| a.window_id.as_str()).collect();

        let mut report = CycleReport::default();
        let changed: Vec<AgentWindow> = {
            let mut state = self.state.lock();
            let ControllerState {
                session,
                tail,
                matchers,
            } = &mut *state;
            let Some(session) = session.as_mut() else {
                return Ok(report);
            };
            if session.session_id != snapshot.session_id {
                return Ok(report);
            }

            let consumed = tail.committed_offset();
            let events = tail.poll().unwrap_or_else(|error| {
                tracing::warn!(target = "agent_fleet::controller", error = %error, "failed to read event log");
                Vec::new()
            });
            report.events = events.len();
            let mut signals = route_events(events, session);
            let mut live_windows = None;
            let now = Instant::now();

            for mutation in gathered {
                match mutation {
                    Mutation::Signal { agent_id, signal } => signals.push((agent_id, signal)),
                    Mutation::Content { agent_id, text } => {
                        let Some(agent) = session.agent(&agent_id) else {
                            continue;
                        };
                        let matcher = matchers
                            .entry(agent_id.clone())
                            .or_insert_with(|| ContentMatcher::for_tool(&agent.tool_id));
                        let lines = last_nonempty_lines(&strip_ansi(&text), TAIL_LINES);
                        match matcher.evaluate(&lines, now) {
                            Some(ContentSignal::NeedsInput { .. }) => {
                                signals.push((agent_id, Signal::Idle))
                            }
                            Some(ContentSignal::Resumed { .. }) => {
                                signals.push((agent_id, Signal::Busy))
                            }
                            None => {}
                        }
                    }
                    Mutation::Reconcile(mut snapshots) => {
                        // Windows attached after the snapshot was taken stay.
                        for agent in &session.agents {
                            if !known_windows.contains(agent.window_id.as_str()) {
                                snapshots.push(WindowSnapshot {
                                    window_id: agent.window_id.clone(),
                                    title: agent.name.clone(),
                                    bounds: None,
                                });
                            }
                        }
                        live_windows = Some(snapshots);
                    }
                }
            }

            report.transitions = lifecycle::apply_cycle(session, signals);
            if let Some(snapshots) = live_windows {
                report.removed = reconcile(session, &snapshots);
                for agent in &report.removed {
                    matchers.remove(&agent.agent_id);
                    tracing::info!(
                        target = "agent_fleet::controller",
                        agent = %agent.name,
                        window_id = %agent.window_id,
                        "window gone, dropping agent"
                    );
                }
            }

            let changed = report
                .transitions
                .iter()
                .filter_map(|t| session.agent(&t.agent_id).cloned())
                .collect();
            let advanced = tail.committed_offset() != consumed;
            if advanced || !report.transitions.is_empty() || !report.removed.is_empty() {
                report.session_cleared = session.is_empty();
                self.commit(&mut state)?;
            }
            changed
        };

        for transition in &report.transitions {
            if let Some(agent) = changed.iter().find(|a| a.agent_id == transition.agent_id) {
                self.emitter.notify(agent, transition);
                tracing::debug!(
                    target = "agent_fleet::controller",
                    agent = %agent.name,
                    from = %transition.from,
                    to = %transition.to,
                    source = ?transition.source,
                    "state changed"
                );
            }
        }
        for agent in &changed {
            self.decorate(agent).await;
        }
        Ok(report)
    }

    /// Run poll cycles every `period` until `shutdown` resolves. Each tick
    /// runs on its own task; the single-flight guard drops overlapping ticks.
    pub async fn run_poll_loop<F>(self: Arc<Self>, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(error) = controller.poll_cycle().await {
                            tracing::warn!(target = "agent_fleet::controller", error = %error, "poll cycle failed");
                        }
                    });
                }
            }
        }
        tracing::debug!(target = "agent_fleet::controller", "poll loop stopped");
    }

    /// Operator override. Always applies and is mirrored to the window.
    pub async fn set_state(&self, agent_id: &str, target: AgentState) -> Result<Transition> {
        let (transition, agent) = {
            let mut state = self.state.lock();
            let session = state.session.as_mut().ok_or(FleetError::NoActiveSession)?;
            let transition = lifecycle::apply(session, agent_id, &Signal::Manual(target))
                .ok_or_else(|| FleetError::UnknownAgent(agent_id.to_string()))?;
            let agent = session.agent(agent_id).cloned();
            self.commit(&mut state)?;
            (transition, agent)
        };
        if let Some(agent) = agent {
            self.emitter.notify(&agent, &transition);
            self.decorate(&agent).await;
        }
        Ok(transition)
    }

    pub async fn focus_agent(&self, agent_id: &str) -> Result<()> {
        let window_id = {
            let state = self.state.lock();
            let session = state.session.as_ref().ok_or(FleetError::NoActiveSession)?;
            session
                .agent(agent_id)
                .map(|a| a.window_id.clone())
                .ok_or_else(|| FleetError::UnknownAgent(agent_id.to_string()))?
        };
        let target = window_id.clone();
        self.provider(move |p| p.focus_window(&target)).await?;

        let mut state = self.state.lock();
        if let Some(session) = state.session.as_mut() {
            session.record_focus(agent_id, Utc::now());
        }
        self.commit(&mut state)
    }

    /// Adopt existing provider windows. Starts an `external` session when no
    /// session is active.
    pub async fn attach(&self, window_ids: Vec<String>) -> Result<Vec<String>> {
        let snapshots = self.provider(|p| p.list_window_snapshots()).await?;
        if let Some(missing) = window_ids
            .iter()
            .find(|id| !snapshots.iter().any(|s| &s.window_id == *id))
        {
            return Err(AutomationError::UnknownWindow(missing.clone()).into());
        }

        let fresh = self.session().is_none();
        let mut new_session = None;
        if fresh {
            let session = ActiveSession::new(
                LaunchRequest {
                    target: TerminalTarget::External,
                    ..Default::default()
                },
                Utc::now(),
            );
            self.start_session(&session);
            new_session = Some(session);
        }

        let mut state = self.state.lock();
        if let Some(session) = new_session {
            state.session.get_or_insert(session);
        }
        let Some(session) = state.session.as_mut() else {
            return Err(FleetError::NoActiveSession);
        };
        let added = import_windows(session, &window_ids, &snapshots, Utc::now());
        tracing::info!(
            target = "agent_fleet::controller",
            session_id = %session.session_id,
            added = added.len(),
            "attached windows"
        );
        if !added.is_empty() || fresh {
            self.commit(&mut state)?;
        }
        Ok(added)
    }

    /// Close every window of the session.
    ///
    /// With `continue_on_error` false the first failure stops the pass and
    /// the remaining agents stay. Otherwise every window is attempted and the
    /// failures come back together. Closed windows are removed either way.
    pub async fn close_session(&self, continue_on_error: bool) -> Result<usize> {
        let agents = self
            .session()
            .ok_or(FleetError::NoActiveSession)?
            .agents;

        let mut closed: Vec<String> = Vec::new();
        let mut failures = Vec::new();
        for agent in &agents {
            let window_id = agent.window_id.clone();
            match self.provider(move |p| p.close_window(&window_id)).await {
                Ok(()) => closed.push(agent.agent_id.clone()),
                Err(error) => {
                    tracing::warn!(
                        target = "agent_fleet::controller",
                        agent = %agent.name,
                        error = %error,
                        "failed to close window"
                    );
                    failures.push(error);
                    if !continue_on_error {
                        break;
                    }
                }
            }
        }

        {
            let mut state = self.state.lock();
            if let Some(session) = state.session.as_mut() {
                session.agents.retain(|a| !closed.contains(&a.agent_id));
                session
                    .focus_history
                    .retain(|entry| !closed.contains(&entry.agent_id));
            }
            for agent_id in &closed {
                state.matchers.remove(agent_id);
            }
            self.commit(&mut state)?;
        }
        tracing::info!(
            target = "agent_fleet::controller",
            closed = closed.len(),
            failed = failures.len(),
            "close pass finished"
        );

        match failures.len() {
            0 => Ok(closed.len()),
            1 if !continue_on_error => Err(failures.remove(0).into()),
            _ => Err(FleetError::PartialClose { failures }),
        }
    }
}
