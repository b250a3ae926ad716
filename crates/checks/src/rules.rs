//! Scripted check rules and shared rulesets.
//!
//! A ruleset is an ordered list of connect/send/expect steps built by the
//! configuration collaborator. Rulesets are immutable once built and may be
//! attached to many sessions through a reference-counted handle.

use crate::config::CheckContext;
use crate::pattern::Pattern;
use crate::status::CheckStatus;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Runtime port computation for a connect rule.
pub type PortExpr = Arc<dyn Fn(&CheckContext) -> Option<u16> + Send + Sync>;

/// Runtime status override computed from the response content.
pub type StatusExpr = Arc<dyn Fn(&[u8]) -> Option<CheckStatus> + Send + Sync>;

/// Options applied when a connect rule opens a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Send a PROXY protocol header on connect.
    pub send_proxy: bool,
    /// Run a TLS handshake on this connection.
    pub ssl: bool,
    /// Close gracefully instead of resetting.
    pub linger: bool,
    /// Connect using the session's server parameters.
    pub default_connect: bool,
    /// Connect synthesized by the engine, not written in the script.
    pub implicit: bool,
    /// Connect through a SOCKS4 proxy.
    pub socks4: bool,
}

/// Connect rule parameters.
#[derive(Clone, Default)]
pub struct ConnectSpec {
    /// Address override; session address when unset.
    pub addr: Option<IpAddr>,
    /// Literal port override.
    pub port: Option<u16>,
    /// Port computed at run time; consulted after the literal port.
    pub port_expr: Option<PortExpr>,
    pub sni: Option<String>,
    pub alpn: Option<String>,
    pub options: ConnectOptions,
}

impl fmt::Debug for ConnectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectSpec")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("port_expr", &self.port_expr.is_some())
            .field("sni", &self.sni)
            .field("alpn", &self.alpn)
            .field("options", &self.options)
            .finish()
    }
}

/// Payload of a send rule.
#[derive(Debug, Clone)]
pub enum SendPayload {
    /// Literal text.
    String(String),
    /// Literal byte sequence, embedded NULs allowed.
    Binary(Vec<u8>),
    /// Text with `%{...}` placeholders rendered per session.
    Template(Template),
}

/// Minimal run-time template for send payloads.
///
/// Supported placeholders: `%{addr}`, `%{port}`, `%{server}`, `%{proxy}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Addr,
    Port,
    ServerName,
    ProxyName,
}

impl Template {
    pub fn parse(input: &str) -> common::Result<Self> {
        let mut parts = Vec::new();
        let mut rest = input;
        while let Some(start) = rest.find("%{") {
            if start > 0 {
                parts.push(TemplatePart::Literal(rest[..start].to_string()));
            }
            let tail = &rest[start + 2..];
            let end = tail
                .find('}')
                .ok_or_else(|| common::Error::config("unterminated template placeholder"))?;
            let part = match &tail[..end] {
                "addr" => TemplatePart::Addr,
                "port" => TemplatePart::Port,
                "server" => TemplatePart::ServerName,
                "proxy" => TemplatePart::ProxyName,
                other => {
                    return Err(common::Error::config(format!(
                        "unknown template placeholder: {other}"
                    )));
                }
            };
            parts.push(part);
            rest = &tail[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(&self, ctx: &CheckContext) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Addr => out.push_str(&ctx.check_addr().to_string()),
                TemplatePart::Port => {
                    if let Some(port) = ctx.check_port() {
                        out.push_str(&port.to_string());
                    }
                }
                TemplatePart::ServerName => out.push_str(&ctx.server.name),
                TemplatePart::ProxyName => out.push_str(&ctx.proxy.name),
            }
        }
        out
    }
}

/// Expect rule parameters.
#[derive(Clone)]
pub struct ExpectSpec {
    pub pattern: Pattern,
    /// Invert the match outcome.
    pub inverse: bool,
    /// Bytes required in the buffer before the pattern is evaluated.
    /// Evaluation happens at end-of-stream regardless.
    pub min_recv: Option<usize>,
    /// Record capture groups for use in annotations.
    pub with_capture: bool,
    /// Annotation template on failure, `$1`..`$9` expand captures.
    pub on_error: Option<String>,
    /// Annotation template when this is the last rule and the script passes.
    pub on_success: Option<String>,
    /// Status reported on mismatch.
    pub err_status: CheckStatus,
    /// Status reported on read timeout.
    pub tout_status: CheckStatus,
    /// Optional status override computed from the response.
    pub status_expr: Option<StatusExpr>,
}

impl ExpectSpec {
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            inverse: false,
            min_recv: None,
            with_capture: false,
            on_error: None,
            on_success: None,
            err_status: CheckStatus::L7Response,
            tout_status: CheckStatus::L7Timeout,
            status_expr: None,
        }
    }
}

impl fmt::Debug for ExpectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectSpec")
            .field("pattern", &self.pattern)
            .field("inverse", &self.inverse)
            .field("min_recv", &self.min_recv)
            .field("with_capture", &self.with_capture)
            .field("err_status", &self.err_status)
            .field("tout_status", &self.tout_status)
            .field("status_expr", &self.status_expr.is_some())
            .finish()
    }
}

/// Verdict returned by a custom action handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerdict {
    /// Advance to the next rule.
    Continue,
    /// Terminate the script successfully.
    Pass,
    /// Terminate the script with the given status.
    Fail(CheckStatus),
}

/// Externally registered handler backing a custom-action rule.
pub trait CustomAction: Send + Sync {
    fn name(&self) -> &str;
    fn eval(&self, ctx: &CheckContext, response: &[u8]) -> ActionVerdict;
}

/// One step of a scripted check.
pub enum RuleAction {
    Connect(ConnectSpec),
    Send(SendPayload),
    Expect(ExpectSpec),
    /// No I/O; the rule's comment is carried for diagnostics.
    Comment,
    Custom(Arc<dyn CustomAction>),
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Connect(spec) => f.debug_tuple("Connect").field(spec).finish(),
            RuleAction::Send(payload) => f.debug_tuple("Send").field(payload).finish(),
            RuleAction::Expect(spec) => f.debug_tuple("Expect").field(spec).finish(),
            RuleAction::Comment => f.write_str("Comment"),
            RuleAction::Custom(action) => f.debug_tuple("Custom").field(&action.name()).finish(),
        }
    }
}

/// A rule with its position and optional diagnostic comment.
#[derive(Debug)]
pub struct TcpCheckRule {
    /// Zero-based index within the ruleset.
    pub index: usize,
    pub comment: Option<String>,
    pub action: RuleAction,
}

/// Ownership kind of a ruleset handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesetKind {
    /// Built for one server only.
    Private,
    /// Named ruleset shared by many servers.
    SharedNamed,
    /// Inherited from a defaults section.
    DefaultInherited,
}

/// An immutable, ordered list of check rules.
#[derive(Debug, Default)]
pub struct Ruleset {
    name: Option<String>,
    rules: Vec<TcpCheckRule>,
}

impl Ruleset {
    pub fn builder() -> RulesetBuilder {
        RulesetBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rules(&self) -> &[TcpCheckRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared, read-only handle to a ruleset.
#[derive(Debug, Clone)]
pub struct RulesetRef {
    pub kind: RulesetKind,
    pub rules: Arc<Ruleset>,
}

impl RulesetRef {
    pub fn private(rules: Ruleset) -> Self {
        Self { kind: RulesetKind::Private, rules: Arc::new(rules) }
    }

    pub fn shared(rules: Arc<Ruleset>) -> Self {
        Self { kind: RulesetKind::SharedNamed, rules }
    }

    pub fn inherited(rules: Arc<Ruleset>) -> Self {
        Self { kind: RulesetKind::DefaultInherited, rules }
    }
}

/// Builder assigning rule indices in insertion order.
#[derive(Default)]
pub struct RulesetBuilder {
    name: Option<String>,
    rules: Vec<TcpCheckRule>,
}

impl RulesetBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn push(mut self, action: RuleAction, comment: Option<String>) -> Self {
        let index = self.rules.len();
        self.rules.push(TcpCheckRule { index, comment, action });
        self
    }

    pub fn connect(self, spec: ConnectSpec) -> Self {
        self.push(RuleAction::Connect(spec), None)
    }

    pub fn send(self, payload: SendPayload) -> Self {
        self.push(RuleAction::Send(payload), None)
    }

    pub fn send_string(self, text: impl Into<String>) -> Self {
        self.send(SendPayload::String(text.into()))
    }

    pub fn expect(self, spec: ExpectSpec) -> Self {
        self.push(RuleAction::Expect(spec), None)
    }

    pub fn expect_string(self, text: impl Into<String>) -> Self {
        self.expect(ExpectSpec::new(Pattern::String(text.into())))
    }

    pub fn comment(self, text: impl Into<String>) -> Self {
        self.push(RuleAction::Comment, Some(text.into()))
    }

    pub fn custom(self, action: Arc<dyn CustomAction>) -> Self {
        self.push(RuleAction::Custom(action), None)
    }

    /// Attach a comment to the most recently added rule.
    pub fn with_comment(mut self, text: impl Into<String>) -> Self {
        if let Some(rule) = self.rules.last_mut() {
            rule.comment = Some(text.into());
        }
        self
    }

    pub fn build(self) -> Ruleset {
        Ruleset { name: self.name, rules: self.rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckContext, ProxyIdent, ServerIdent};

    fn ctx() -> CheckContext {
        CheckContext::new(
            ProxyIdent { name: "be_app".into(), id: 1, addr: None, port: None },
            ServerIdent {
                name: "app1".into(),
                id: 2,
                addr: "10.0.0.5".parse().unwrap(),
                port: Some(6379),
                maxconn: 50,
            },
        )
    }

    #[test]
    fn test_builder_assigns_indices_in_order() {
        let ruleset = Ruleset::builder()
            .connect(ConnectSpec::default())
            .send_string("PING\r\n")
            .expect_string("PONG")
            .comment("redis ping")
            .build();

        let indices: Vec<usize> = ruleset.rules().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(matches!(ruleset.rules()[0].action, RuleAction::Connect(_)));
        assert!(matches!(ruleset.rules()[3].action, RuleAction::Comment));
        assert_eq!(ruleset.rules()[3].comment.as_deref(), Some("redis ping"));
    }

    #[test]
    fn test_template_render() {
        let t = Template::parse("HOST %{addr}:%{port} SRV %{server}\r\n").unwrap();
        assert_eq!(t.render(&ctx()), "HOST 10.0.0.5:6379 SRV app1\r\n");
    }

    #[test]
    fn test_template_rejects_unknown_placeholder() {
        assert!(Template::parse("%{bogus}").is_err());
        assert!(Template::parse("%{unterminated").is_err());
    }

    #[test]
    fn test_ruleset_ref_kinds() {
        let shared = Arc::new(Ruleset::builder().name("redis").expect_string("PONG").build());
        let a = RulesetRef::shared(shared.clone());
        let b = RulesetRef::inherited(shared);
        assert_eq!(a.kind, RulesetKind::SharedNamed);
        assert_eq!(b.kind, RulesetKind::DefaultInherited);
        // Both handles see the same underlying rules.
        assert!(Arc::ptr_eq(&a.rules, &b.rules));
    }
}
