//! Scripted check interpreter.
//!
//! Executes a ruleset against one connection attempt, starting from the
//! session's current step so a run suspended on I/O resumes without
//! re-executing completed rules. Exactly one terminal status comes out of
//! each run; any failure short-circuits the remaining rules.

use crate::config::CheckContext;
use crate::pattern::expand_captures;
use crate::rules::{
    ActionVerdict, ConnectOptions, ConnectSpec, ExpectSpec, RuleAction, Ruleset, SendPayload,
    TcpCheckRule,
};
use crate::status::{CheckStatus, ChkResult};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Fully resolved parameters for one connection attempt, handed to the
/// transport collaborator. TLS, SOCKS4 and PROXY-header mechanics live
/// behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub addr: IpAddr,
    pub port: u16,
    pub ssl: bool,
    pub sni: Option<String>,
    pub alpn: Option<String>,
    pub send_proxy: bool,
    pub socks4: bool,
    pub linger: bool,
}

/// Transport collaborator opening check connections.
#[async_trait]
pub trait CheckTransport: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> io::Result<Box<dyn CheckStream>>;
}

/// One established check connection.
///
/// `send` may write fewer bytes than offered; `recv` returns 0 at
/// end-of-stream.
#[async_trait]
pub trait CheckStream: Send {
    async fn send(&mut self, data: &[u8]) -> io::Result<usize>;
    async fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize>;
}

/// Terminal outcome of one script execution.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub status: CheckStatus,
    pub result: ChkResult,
    pub description: String,
    /// Rule the script stopped on, when it failed mid-script.
    pub rule_index: Option<usize>,
}

impl CheckReport {
    pub fn new(status: CheckStatus, description: impl Into<String>) -> Self {
        Self {
            status,
            result: status.result(),
            description: description.into(),
            rule_index: None,
        }
    }

    fn failed_at(status: CheckStatus, description: impl Into<String>, index: usize) -> Self {
        Self {
            status,
            result: status.result(),
            description: description.into(),
            rule_index: Some(index),
        }
    }
}

/// Mutable per-run state owned by the session and driven by the engine.
#[derive(Default)]
pub struct RunState {
    /// Input buffer accumulating response bytes.
    pub input: BytesMut,
    /// Index of the rule currently executing; advances monotonically within
    /// one cycle and resets only when a fresh cycle begins.
    pub current_step: usize,
    /// Bytes of the current send payload already written.
    pub send_offset: usize,
    /// Capture groups recorded by the last capturing expect rule.
    pub captures: Vec<String>,
    /// Most recent comment rule text, for diagnostics.
    pub last_comment: Option<String>,
    stream: Option<Box<dyn CheckStream>>,
    eof: bool,
    expect_ran: bool,
    ssl_connected: bool,
}

impl RunState {
    /// Read more response bytes from the open connection, for callers that
    /// consume the stream outside the script (agent replies). Returns 0 when
    /// no connection is open or the stream ended.
    pub async fn recv_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => {
                let n = stream.recv(buf).await?;
                if n == 0 {
                    self.eof = true;
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Reset for a fresh check cycle.
    pub fn reset(&mut self) {
        self.input.clear();
        self.current_step = 0;
        self.send_offset = 0;
        self.captures.clear();
        self.last_comment = None;
        self.stream = None;
        self.eof = false;
        self.expect_ran = false;
        self.ssl_connected = false;
    }
}

enum StepOutcome {
    Advance,
    Pass,
    Fail(CheckReport),
}

/// Interprets one ruleset against one connection attempt.
pub struct TcpCheckEngine<'a> {
    transport: &'a dyn CheckTransport,
    rules: &'a Ruleset,
    ctx: &'a CheckContext,
    run: &'a mut RunState,
    step_timeout: Duration,
}

impl<'a> TcpCheckEngine<'a> {
    pub fn new(
        transport: &'a dyn CheckTransport,
        rules: &'a Ruleset,
        ctx: &'a CheckContext,
        run: &'a mut RunState,
        step_timeout: Duration,
    ) -> Self {
        Self { transport, rules, ctx, run, step_timeout }
    }

    /// Execute rules in order from the current step to a terminal outcome.
    pub async fn run(mut self) -> CheckReport {
        while self.run.current_step < self.rules.len() {
            let index = self.run.current_step;
            let rule = &self.rules.rules()[index];
            trace!(index, action = ?rule.action, "executing check rule");

            let outcome = match &rule.action {
                RuleAction::Connect(spec) => self.do_connect(rule, spec).await,
                RuleAction::Send(payload) => self.do_send(rule, payload).await,
                RuleAction::Expect(spec) => self.do_expect(rule, spec).await,
                RuleAction::Comment => {
                    self.run.last_comment = rule.comment.clone();
                    StepOutcome::Advance
                }
                RuleAction::Custom(action) => {
                    match action.eval(self.ctx, &self.run.input) {
                        ActionVerdict::Continue => StepOutcome::Advance,
                        ActionVerdict::Pass => StepOutcome::Pass,
                        ActionVerdict::Fail(status) => StepOutcome::Fail(CheckReport::failed_at(
                            status,
                            rule.comment.clone().unwrap_or_else(|| {
                                format!("custom action {} failed", action.name())
                            }),
                            index,
                        )),
                    }
                }
            };

            match outcome {
                StepOutcome::Advance => {
                    self.run.current_step += 1;
                    self.run.send_offset = 0;
                }
                StepOutcome::Pass => break,
                StepOutcome::Fail(report) => {
                    debug!(
                        index,
                        status = %report.status,
                        description = %report.description,
                        "check script failed"
                    );
                    return report;
                }
            }
        }
        self.success_report()
    }

    /// Success status reflects the deepest layer the script reached.
    fn success_report(&self) -> CheckReport {
        let status = if self.run.expect_ran {
            CheckStatus::L7OkData
        } else if self.run.ssl_connected {
            CheckStatus::L6Ok
        } else {
            CheckStatus::L4Ok
        };
        let description = self
            .last_on_success()
            .map(|tpl| expand_captures(tpl, &self.run.captures))
            .or_else(|| self.run.last_comment.clone())
            .unwrap_or_else(|| status.entry().desc.to_string());
        CheckReport::new(status, description)
    }

    fn last_on_success(&self) -> Option<&str> {
        match &self.rules.rules().last()?.action {
            RuleAction::Expect(spec) => spec.on_success.as_deref(),
            _ => None,
        }
    }

    async fn do_connect(&mut self, rule: &TcpCheckRule, spec: &ConnectSpec) -> StepOutcome {
        let Some(port) = spec
            .port
            .or_else(|| spec.port_expr.as_ref().and_then(|expr| expr(self.ctx)))
            .or_else(|| self.ctx.check_port())
        else {
            return StepOutcome::Fail(CheckReport::failed_at(
                CheckStatus::SockErr,
                "no port to run the check on",
                rule.index,
            ));
        };

        let target = ConnectTarget {
            addr: spec.addr.unwrap_or_else(|| self.ctx.check_addr()),
            port,
            ssl: spec.options.ssl || (spec.options.default_connect && self.ctx.ssl_wanted()),
            sni: spec.sni.clone().or_else(|| self.ctx.sni.clone()),
            alpn: spec.alpn.clone().or_else(|| self.ctx.alpn.clone()),
            send_proxy: spec.options.send_proxy || self.ctx.send_proxy,
            socks4: spec.options.socks4 || self.ctx.via_socks4,
            linger: spec.options.linger,
        };

        match timeout(self.step_timeout, self.transport.connect(&target)).await {
            Ok(Ok(stream)) => {
                self.run.stream = Some(stream);
                self.run.eof = false;
                self.run.input.clear();
                self.run.ssl_connected |= target.ssl;
                StepOutcome::Advance
            }
            Ok(Err(e)) => {
                let status = connect_error_status(&e, target.ssl);
                StepOutcome::Fail(CheckReport::failed_at(status, e.to_string(), rule.index))
            }
            Err(_) => StepOutcome::Fail(CheckReport::failed_at(
                if target.ssl { CheckStatus::L6Timeout } else { CheckStatus::L4Timeout },
                "connect timeout",
                rule.index,
            )),
        }
    }

    async fn do_send(&mut self, rule: &TcpCheckRule, payload: &SendPayload) -> StepOutcome {
        let data = match payload {
            SendPayload::String(s) => s.clone().into_bytes(),
            SendPayload::Binary(b) => b.clone(),
            SendPayload::Template(t) => t.render(self.ctx).into_bytes(),
        };

        if let Some(fail) = self.ensure_stream(rule).await {
            return fail;
        }

        // A fresh send starts a new exchange; the previous response is no
        // longer relevant. A resumed send (offset > 0) keeps the buffer.
        if self.run.send_offset == 0 {
            self.run.input.clear();
            self.run.eof = false;
        }

        // Resume from the persisted offset; bytes already written must not
        // be sent again.
        while self.run.send_offset < data.len() {
            let stream = match self.run.stream.as_mut() {
                Some(s) => s,
                None => {
                    return StepOutcome::Fail(CheckReport::failed_at(
                        CheckStatus::SockErr,
                        "connection lost before send",
                        rule.index,
                    ));
                }
            };
            let chunk = &data[self.run.send_offset..];
            match timeout(self.step_timeout, stream.send(chunk)).await {
                Ok(Ok(0)) => {
                    return StepOutcome::Fail(CheckReport::failed_at(
                        CheckStatus::SockErr,
                        "connection closed during send",
                        rule.index,
                    ));
                }
                Ok(Ok(n)) => self.run.send_offset += n,
                Ok(Err(e)) => {
                    return StepOutcome::Fail(CheckReport::failed_at(
                        CheckStatus::SockErr,
                        e.to_string(),
                        rule.index,
                    ));
                }
                Err(_) => {
                    return StepOutcome::Fail(CheckReport::failed_at(
                        CheckStatus::L4Timeout,
                        "send timeout",
                        rule.index,
                    ));
                }
            }
        }
        StepOutcome::Advance
    }

    async fn do_expect(&mut self, rule: &TcpCheckRule, spec: &ExpectSpec) -> StepOutcome {
        if let Some(fail) = self.ensure_stream(rule).await {
            return fail;
        }
        let min_recv = spec.min_recv.unwrap_or(0);

        loop {
            // Never judge a response on a short read: wait for min_recv
            // bytes unless the stream already ended.
            if self.run.input.len() >= min_recv || self.run.eof {
                let outcome = spec.pattern.matches(&self.run.input, spec.with_capture);
                self.run.expect_ran = true;

                if spec.inverse {
                    // Presence or absence is decided as soon as the
                    // threshold is reached.
                    if outcome.matched {
                        return self.expect_failure(rule, spec);
                    }
                    return StepOutcome::Advance;
                }

                if outcome.matched {
                    if spec.with_capture {
                        self.run.captures = outcome.captures;
                    }
                    return StepOutcome::Advance;
                }
                if self.run.eof {
                    return self.expect_failure(rule, spec);
                }
                // No match yet; the pattern may still complete with more
                // data.
            }

            match self.read_more().await {
                ReadStep::Data => {}
                ReadStep::Eof => {}
                ReadStep::Timeout => {
                    return StepOutcome::Fail(CheckReport::failed_at(
                        spec.tout_status,
                        self.expect_description(spec, "timeout"),
                        rule.index,
                    ));
                }
                ReadStep::Error(e) => {
                    return StepOutcome::Fail(CheckReport::failed_at(
                        CheckStatus::SockErr,
                        e.to_string(),
                        rule.index,
                    ));
                }
            }
        }
    }

    fn expect_failure(&self, rule: &TcpCheckRule, spec: &ExpectSpec) -> StepOutcome {
        let status = spec
            .status_expr
            .as_ref()
            .and_then(|expr| expr(&self.run.input))
            .unwrap_or(spec.err_status);
        StepOutcome::Fail(CheckReport::failed_at(
            status,
            self.expect_description(spec, "pattern mismatch"),
            rule.index,
        ))
    }

    fn expect_description(&self, spec: &ExpectSpec, fallback: &str) -> String {
        spec.on_error
            .as_deref()
            .map(|tpl| expand_captures(tpl, &self.run.captures))
            .or_else(|| self.run.last_comment.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Implicit connect: a send/expect rule with no connection open connects
    /// with the session's default parameters.
    async fn ensure_stream(&mut self, rule: &TcpCheckRule) -> Option<StepOutcome> {
        if self.run.stream.is_some() {
            return None;
        }
        let spec = ConnectSpec {
            options: ConnectOptions { default_connect: true, implicit: true, ..Default::default() },
            ..Default::default()
        };
        match self.do_connect(rule, &spec).await {
            StepOutcome::Advance => None,
            fail => Some(fail),
        }
    }

    async fn read_more(&mut self) -> ReadStep {
        let stream = match self.run.stream.as_mut() {
            Some(s) => s,
            None => {
                self.run.eof = true;
                return ReadStep::Eof;
            }
        };
        match timeout(self.step_timeout, stream.recv(&mut self.run.input)).await {
            Ok(Ok(0)) => {
                self.run.eof = true;
                ReadStep::Eof
            }
            Ok(Ok(_)) => ReadStep::Data,
            Ok(Err(e)) => ReadStep::Error(e),
            Err(_) => ReadStep::Timeout,
        }
    }
}

enum ReadStep {
    Data,
    Eof,
    Timeout,
    Error(io::Error),
}

/// Map a connect error to the layer it failed at.
fn connect_error_status(e: &io::Error, ssl: bool) -> CheckStatus {
    use io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => CheckStatus::L4ConnErr,
        // The transport reports a handshake deadline itself.
        ErrorKind::TimedOut if ssl => CheckStatus::L6Timeout,
        ErrorKind::TimedOut => CheckStatus::L4Timeout,
        // Convention with the transport: a failed TLS exchange surfaces as
        // invalid data.
        ErrorKind::InvalidData if ssl => CheckStatus::L6Response,
        _ => CheckStatus::SockErr,
    }
}
