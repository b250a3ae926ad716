//! Per-server check session.
//!
//! Exactly one session exists per (server, check kind). The session owns its
//! buffers, step pointer and health counter exclusively; the ruleset it
//! references is a shared read-only handle. A periodic scheduler calls
//! [`CheckSession::run`] once per cycle; at most one run is in flight per
//! session.

use crate::config::{CheckConfig, CheckContext, CheckTimers};
use crate::engine::{CheckReport, CheckTransport, RunState, TcpCheckEngine};
use crate::hana::{HanaAggregator, HanaStatus, OnErrorAction};
use crate::health::{
    HealthCounter, OnMarkedDown, OnMarkedUp, ServerEvent, StateChangeCause, Transition,
};
use crate::rules::RulesetRef;
use crate::status::{CheckStatus, ChkResult};
use bytes::BytesMut;
use common::Result;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Kind of check a session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// Scripted probe driven by this side.
    Health,
    /// The remote agent reports its own state as a short string.
    Agent,
}

/// Administrative state of a session, as named flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckState {
    pub in_progress: bool,
    pub configured: bool,
    pub enabled: bool,
    pub paused: bool,
    pub port_missing: bool,
}

/// The per-server, per-kind check aggregate.
pub struct CheckSession {
    kind: CheckKind,
    ctx: CheckContext,
    timers: CheckTimers,
    state: CheckState,
    counter: HealthCounter,
    hana: Option<HanaAggregator>,
    rules: RulesetRef,
    /// Literal string sent to the agent instead of running the script.
    agent_send: Option<String>,
    run_state: RunState,

    last_result: ChkResult,
    last_status: CheckStatus,
    last_description: String,
    started_at: Option<Instant>,
    last_duration: Option<Duration>,

    /// HANA asked for the accelerated interval; cleared on the next
    /// transition.
    fastinter_forced: bool,
    on_marked_down: OnMarkedDown,
    on_marked_up: OnMarkedUp,
    events: mpsc::Sender<ServerEvent>,
}

impl CheckSession {
    pub fn new(
        kind: CheckKind,
        ctx: CheckContext,
        config: &CheckConfig,
        rules: RulesetRef,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let counter = match config.initial_health {
            Some(seed) => HealthCounter::with_seed(config.rise, config.fall, seed)?,
            None => HealthCounter::new(config.rise, config.fall)?,
        };
        Ok(Self {
            kind,
            ctx,
            timers: config.timers.clone(),
            state: CheckState { configured: true, enabled: true, ..Default::default() },
            counter,
            hana: None,
            rules,
            agent_send: None,
            run_state: RunState::default(),
            last_result: ChkResult::Unknown,
            last_status: CheckStatus::Init,
            last_description: String::new(),
            started_at: None,
            last_duration: None,
            fastinter_forced: false,
            on_marked_down: OnMarkedDown::default(),
            on_marked_up: OnMarkedUp::default(),
            events,
        })
    }

    /// Attach a passive health-analysis aggregator.
    pub fn with_hana(mut self, hana: HanaAggregator) -> Self {
        self.hana = Some(hana);
        self
    }

    /// Set the string sent to the agent on connect.
    pub fn with_agent_send(mut self, text: impl Into<String>) -> Self {
        self.agent_send = Some(text.into());
        self
    }

    pub fn with_marked_down_action(mut self, action: OnMarkedDown) -> Self {
        self.on_marked_down = action;
        self
    }

    pub fn with_marked_up_action(mut self, action: OnMarkedUp) -> Self {
        self.on_marked_up = action;
        self
    }

    pub fn kind(&self) -> CheckKind {
        self.kind
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.counter.is_up()
    }

    pub fn is_draining(&self) -> bool {
        self.counter.is_draining()
    }

    pub fn health(&self) -> u32 {
        self.counter.health()
    }

    pub fn last_result(&self) -> ChkResult {
        self.last_result
    }

    pub fn last_status(&self) -> CheckStatus {
        self.last_status
    }

    pub fn last_description(&self) -> &str {
        self.last_description.as_str()
    }

    pub fn last_duration(&self) -> Option<Duration> {
        self.last_duration
    }

    /// Administratively disable the session; an in-flight run is aborted
    /// and counted as neither pass nor fail.
    pub fn disable(&mut self) {
        self.state.enabled = false;
        self.abort_run();
    }

    pub fn enable(&mut self) {
        self.state.enabled = true;
    }

    /// Pause checks for maintenance.
    pub fn pause(&mut self) {
        self.state.paused = true;
        self.abort_run();
    }

    pub fn resume(&mut self) {
        self.state.paused = false;
    }

    /// No port can be resolved from the session or any connect rule; the
    /// run will fail at the first connect.
    fn port_missing(&self) -> bool {
        if self.ctx.check_port().is_some() {
            return false;
        }
        !self.rules.rules.rules().iter().any(|rule| match &rule.action {
            crate::rules::RuleAction::Connect(spec) => {
                spec.port.is_some() || spec.port_expr.is_some()
            }
            _ => false,
        })
    }

    fn abort_run(&mut self) {
        if self.state.in_progress {
            debug!(server = %self.ctx.server.name, "aborting in-flight check");
            self.state.in_progress = false;
            self.run_state.reset();
        }
    }

    /// Interval until the next cycle, honoring downinter while fully down
    /// and fastinter while the state is transitioning.
    pub fn effective_interval(&self) -> Duration {
        let inter = self.timers.inter;
        if !self.counter.is_up() && self.counter.health() == 0 {
            return self.timers.downinter.unwrap_or(inter);
        }
        if self.fastinter_forced || self.counter.is_transitioning() {
            return self.timers.fastinter.unwrap_or(inter);
        }
        inter
    }

    /// Run one check cycle. Returns the report, or `None` when the cycle
    /// was skipped (disabled, paused, or a run is still in flight).
    pub async fn run(&mut self, transport: &dyn CheckTransport) -> Option<CheckReport> {
        if !self.state.enabled || self.state.paused {
            debug!(server = %self.ctx.server.name, "check disabled or paused, skipping cycle");
            return None;
        }
        if self.state.in_progress {
            warn!(server = %self.ctx.server.name, "previous check still in flight, skipping cycle");
            return None;
        }
        if self.kind == CheckKind::Health && self.rules.rules.is_empty() {
            warn!(server = %self.ctx.server.name, "no check rules configured, skipping cycle");
            return None;
        }

        self.state.port_missing = self.port_missing();
        self.state.in_progress = true;
        self.run_state.reset();
        self.last_status = CheckStatus::Start;
        self.started_at = Some(Instant::now());

        let report = match self.kind {
            CheckKind::Health => {
                let rules = std::sync::Arc::clone(&self.rules.rules);
                TcpCheckEngine::new(
                    transport,
                    &rules,
                    &self.ctx,
                    &mut self.run_state,
                    self.timers.timeout,
                )
                .run()
                .await
            }
            CheckKind::Agent => self.agent_exchange(transport).await,
        };

        // The run may have been administratively aborted while suspended on
        // I/O; its outcome must not be counted.
        if !self.state.in_progress {
            debug!(server = %self.ctx.server.name, "check aborted, dropping outcome");
            return None;
        }

        let duration = self.started_at.map(|t| t.elapsed());
        self.last_duration = duration;
        self.state.in_progress = false;
        // The next cycle starts from the beginning of the script.
        self.run_state.current_step = 0;

        self.apply_report(&report).await;
        Some(report)
    }

    async fn apply_report(&mut self, report: &CheckReport) {
        self.last_result = report.result;
        self.last_status = report.status;
        self.last_description = report.description.clone();

        if report.result.is_success() {
            debug!(
                server = %self.ctx.server.name,
                status = %report.status,
                duration_ms = self.last_duration.unwrap_or_default().as_millis(),
                health = self.counter.health(),
                "check passed"
            );
        } else {
            warn!(
                server = %self.ctx.server.name,
                status = %report.status,
                description = %report.description,
                health = self.counter.health(),
                "check failed"
            );
        }

        let cause = match self.kind {
            CheckKind::Health => StateChangeCause::HealthCheck,
            CheckKind::Agent => StateChangeCause::AgentCheck,
        };
        let transition = self.counter.apply(report.result);
        self.emit_transition(transition, cause).await;
    }

    async fn emit_transition(&mut self, transition: Option<Transition>, cause: StateChangeCause) {
        let Some(transition) = transition else { return };
        self.fastinter_forced = false;

        let up = transition == Transition::Up;
        if up {
            info!(server = %self.ctx.server.name, cause = ?cause, "server marked up");
        } else {
            warn!(server = %self.ctx.server.name, cause = ?cause, "server marked down");
        }

        let event = ServerEvent {
            server: self.ctx.server.name.clone(),
            proxy: self.ctx.proxy.name.clone(),
            up,
            cause,
            result: self.last_result,
            status: self.last_status,
            description: self.last_description.clone(),
            duration: self.last_duration,
            on_marked_down: self.on_marked_down,
            on_marked_up: self.on_marked_up,
        };
        if let Err(e) = self.events.send(event).await {
            warn!(error = %e, "failed to deliver server state event");
        }
    }

    /// Feed one live-traffic observation through the HANA aggregator and
    /// apply any directive it issues. Independent of scripted runs; both
    /// paths drive the same counter and the stricter outcome wins.
    pub async fn observe(&mut self, status: HanaStatus) {
        let Some(directive) = self.hana.as_mut().and_then(|h| h.observe(status)) else {
            return;
        };
        match directive {
            OnErrorAction::Fastinter => {
                self.fastinter_forced = true;
            }
            OnErrorAction::FailCheck => {
                self.last_result = ChkResult::Failed;
                self.last_status = CheckStatus::Hana;
                self.last_description = status.entry().desc.to_string();
                let transition = self.counter.apply(ChkResult::Failed);
                self.emit_transition(transition, StateChangeCause::HealthAnalysis).await;
            }
            OnErrorAction::SuddenDeath => {
                self.counter.sudden_death();
            }
            OnErrorAction::MarkDown => {
                self.last_result = ChkResult::Failed;
                self.last_status = CheckStatus::Hana;
                self.last_description = status.entry().desc.to_string();
                let transition = self.counter.force_down();
                self.emit_transition(transition, StateChangeCause::HealthAnalysis).await;
            }
        }
    }

    /// Force the server down administratively.
    pub async fn force_down(&mut self) {
        self.last_result = ChkResult::Failed;
        let transition = self.counter.force_down();
        self.emit_transition(transition, StateChangeCause::Administrative).await;
    }

    /// Agent exchange: connect, optionally send the configured string, read
    /// the agent's one-line reply and classify it.
    async fn agent_exchange(&mut self, transport: &dyn CheckTransport) -> CheckReport {
        use crate::rules::{ConnectOptions, ConnectSpec, SendPayload};

        let mut builder = crate::rules::Ruleset::builder().connect(ConnectSpec {
            options: ConnectOptions { default_connect: true, ..Default::default() },
            ..Default::default()
        });
        if let Some(text) = &self.agent_send {
            builder = builder.send(SendPayload::String(text.clone()));
        }
        let rules = builder.build();

        let report = TcpCheckEngine::new(
            transport,
            &rules,
            &self.ctx,
            &mut self.run_state,
            self.timers.timeout,
        )
        .run()
        .await;
        if !report.result.is_success() {
            return report;
        }

        // Drain the reply the connect/send left unread.
        let mut reply = BytesMut::new();
        std::mem::swap(&mut reply, &mut self.run_state.input);
        let connect_report = report;
        match self.read_agent_reply(&mut reply).await {
            Ok(()) => classify_agent_reply(&reply, connect_report),
            Err(report) => report,
        }
    }

    async fn read_agent_reply(&mut self, reply: &mut BytesMut) -> std::result::Result<(), CheckReport> {
        // One line is enough; stop on newline or end-of-stream.
        while !reply.contains(&b'\n') {
            match tokio::time::timeout(
                self.timers.timeout,
                self.run_state.recv_into(reply),
            )
            .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(CheckReport::new(CheckStatus::SockErr, e.to_string()));
                }
                Err(_) => {
                    return Err(CheckReport::new(CheckStatus::L7Timeout, "agent reply timeout"));
                }
            }
        }
        Ok(())
    }
}

/// Classify the agent's reply line.
///
/// First word decides: `up`, `down`/`stopped`/`fail`, `drain`, or a weight
/// percentage. An empty reply degrades to the connect-level outcome.
fn classify_agent_reply(reply: &[u8], connect_report: CheckReport) -> CheckReport {
    let line = reply.split(|&b| b == b'\n').next().unwrap_or_default();
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return connect_report;
    }

    let mut words = trimmed.split_whitespace();
    let first = words.next().unwrap_or_default().to_ascii_lowercase();
    let rest = words.collect::<Vec<_>>().join(" ");

    match first.as_str() {
        "up" => CheckReport::new(CheckStatus::L7OkData, "agent reports up"),
        "down" | "stopped" | "fail" | "failed" => CheckReport::new(
            CheckStatus::L7Status,
            if rest.is_empty() { "agent reports down".to_string() } else { rest },
        ),
        "drain" => CheckReport::new(CheckStatus::L7OkCondData, "agent requests drain"),
        word if word.ends_with('%') && word[..word.len() - 1].parse::<u32>().is_ok() => {
            // Weight-only reply: valid but carries no up/down information.
            let mut report = CheckReport::new(CheckStatus::L7OkData, format!("agent weight {word}"));
            report.result = ChkResult::Neutral;
            report
        }
        _ => CheckReport::new(CheckStatus::L7Response, format!("unparsable agent reply: {trimmed}")),
    }
}
