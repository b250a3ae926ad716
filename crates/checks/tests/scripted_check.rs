//! End-to-end scripted check cycles against an in-memory transport.

use async_trait::async_trait;
use bytes::BytesMut;
use checks::config::{CheckConfig, CheckContext, CheckTimers, ProxyIdent, ServerIdent};
use checks::engine::{CheckStream, CheckTransport, ConnectTarget};
use checks::hana::{HanaAggregator, HanaStatus, ObserveLayer, OnErrorAction};
use checks::health::ServerEvent;
use checks::pattern::Pattern;
use checks::rules::{ConnectSpec, ExpectSpec, Ruleset, RulesetRef};
use checks::session::{CheckKind, CheckSession};
use checks::status::{CheckStatus, ChkResult};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory backend: each connect yields a stream replaying the configured
/// exchange, recording everything the checker wrote.
#[derive(Clone)]
struct FakeBackend {
    replies: Vec<Vec<u8>>,
    refuse: bool,
    written: Arc<Mutex<Vec<u8>>>,
}

impl FakeBackend {
    fn replying(replies: Vec<Vec<u8>>) -> Self {
        Self { replies, refuse: false, written: Arc::new(Mutex::new(Vec::new())) }
    }

    fn refusing() -> Self {
        Self { replies: Vec::new(), refuse: true, written: Arc::new(Mutex::new(Vec::new())) }
    }

    fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

struct FakeStream {
    replies: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl CheckTransport for FakeBackend {
    async fn connect(&self, _target: &ConnectTarget) -> io::Result<Box<dyn CheckStream>> {
        if self.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        Ok(Box::new(FakeStream {
            replies: self.replies.clone().into(),
            written: self.written.clone(),
        }))
    }
}

#[async_trait]
impl CheckStream for FakeStream {
    async fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self.replies.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }
}

fn ctx() -> CheckContext {
    CheckContext::new(
        ProxyIdent { name: "be_smtp".into(), id: 7, addr: None, port: None },
        ServerIdent {
            name: "smtp1".into(),
            id: 1,
            addr: "192.0.2.25".parse().unwrap(),
            port: Some(25),
            maxconn: 64,
        },
    )
}

fn config() -> CheckConfig {
    CheckConfig {
        rise: 2,
        fall: 2,
        initial_health: None,
        timers: CheckTimers {
            inter: Duration::from_secs(2),
            fastinter: Some(Duration::from_millis(100)),
            downinter: None,
            timeout: Duration::from_millis(200),
        },
    }
}

fn new_session(rules: Ruleset) -> (CheckSession, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(16);
    let session =
        CheckSession::new(CheckKind::Health, ctx(), &config(), RulesetRef::private(rules), tx)
            .unwrap();
    (session, rx)
}

/// A multi-step SMTP-style dialogue: greeting, EHLO, QUIT.
fn smtp_rules() -> Ruleset {
    let mut greeting = ExpectSpec::new(Pattern::regex(r"^220").unwrap());
    greeting.err_status = CheckStatus::L7Status;
    let mut ehlo_reply = ExpectSpec::new(Pattern::regex(r"^250[ -]([A-Za-z0-9.-]+)").unwrap());
    ehlo_reply.with_capture = true;
    ehlo_reply.on_success = Some("greeted by $1".to_string());
    ehlo_reply.on_error = Some("EHLO rejected".to_string());

    Ruleset::builder()
        .name("smtp")
        .connect(ConnectSpec::default())
        .comment("smtp banner")
        .expect(greeting)
        .send_string("EHLO relay.check\r\n")
        .expect(ehlo_reply)
        .build()
}

#[tokio::test]
async fn multi_step_dialogue_passes_and_captures() {
    let backend = FakeBackend::replying(vec![
        b"220 smtp1 ESMTP ready\r\n".to_vec(),
        b"250-mail.example.org\r\n250 STARTTLS\r\n".to_vec(),
    ]);
    let (mut session, mut rx) = new_session(smtp_rules());

    let report = session.run(&backend).await.expect("cycle should run");
    assert_eq!(report.result, ChkResult::Passed);
    assert_eq!(report.status, CheckStatus::L7OkData);
    assert_eq!(report.description, "greeted by mail.example.org");
    assert_eq!(backend.written(), b"EHLO relay.check\r\n");

    // No transition yet with rise=2.
    assert!(rx.try_recv().is_err());
    let report = session.run(&backend).await.unwrap();
    assert_eq!(report.result, ChkResult::Passed);
    let event = rx.try_recv().unwrap();
    assert!(event.up);
    assert_eq!(event.server, "smtp1");
    assert_eq!(event.proxy, "be_smtp");
}

#[tokio::test]
async fn wrong_banner_fails_with_rule_status() {
    let backend = FakeBackend::replying(vec![b"554 go away\r\n".to_vec()]);
    let (mut session, _rx) = new_session(smtp_rules());

    let report = session.run(&backend).await.unwrap();
    assert_eq!(report.result, ChkResult::Failed);
    assert_eq!(report.status, CheckStatus::L7Status);
    // The banner expect is rule index 2 (after connect and comment).
    assert_eq!(report.rule_index, Some(2));
    assert_eq!(session.last_description(), "smtp banner");
}

#[tokio::test]
async fn refused_backend_marks_down_after_fall() {
    let up = FakeBackend::replying(vec![
        b"220 smtp1 ESMTP ready\r\n".to_vec(),
        b"250 mail.example.org\r\n".to_vec(),
    ]);
    let dead = FakeBackend::refusing();
    let (mut session, mut rx) = new_session(smtp_rules());

    session.run(&up).await.unwrap();
    session.run(&up).await.unwrap();
    assert!(session.is_up());
    assert!(rx.try_recv().unwrap().up);

    session.run(&dead).await.unwrap();
    assert!(session.is_up());
    session.run(&dead).await.unwrap();
    assert!(!session.is_up());

    let event = rx.try_recv().unwrap();
    assert!(!event.up);
    assert_eq!(event.status, CheckStatus::L4ConnErr);
    assert_eq!(event.result, ChkResult::Failed);
    assert!(event.duration.is_some());
}

#[tokio::test]
async fn scripted_and_hana_outcomes_commute_to_down() {
    // Both the scripted check and the analysis path degrade the same
    // counter; the stricter outcome (down) wins regardless of order.
    let up = FakeBackend::replying(vec![
        b"220 smtp1 ESMTP ready\r\n".to_vec(),
        b"250 mail.example.org\r\n".to_vec(),
    ]);
    let dead = FakeBackend::refusing();

    let (session, _rx) = new_session(smtp_rules());
    let hana = HanaAggregator::new(ObserveLayer::Layer7, 1, OnErrorAction::FailCheck).unwrap();
    let mut session = session.with_hana(hana);

    session.run(&up).await.unwrap();
    session.run(&up).await.unwrap();
    session.run(&up).await.unwrap();
    assert!(session.is_up());
    assert_eq!(session.health(), 3);

    // One scripted failure and one synthetic analysis failure within the
    // same tick: fall=2 is exhausted, the server is down.
    session.run(&dead).await.unwrap();
    session.observe(HanaStatus::HttpBrokenPipe).await;
    assert!(!session.is_up());
}

#[tokio::test]
async fn binary_script_with_embedded_nul() {
    // A 4-byte magic handshake answered by a binary ack containing NULs.
    let backend = FakeBackend::replying(vec![vec![0x00, 0x42, 0x00, 0x99]]);
    let mut ack = ExpectSpec::new(Pattern::Binary(vec![0x42, 0x00, 0x99]));
    ack.min_recv = Some(4);
    let rules = Ruleset::builder()
        .connect(ConnectSpec::default())
        .send(checks::rules::SendPayload::Binary(vec![0xca, 0xfe, 0x00, 0x01]))
        .expect(ack)
        .build();

    let (mut session, _rx) = new_session(rules);
    let report = session.run(&backend).await.unwrap();
    assert_eq!(report.result, ChkResult::Passed);
    assert_eq!(backend.written(), vec![0xca, 0xfe, 0x00, 0x01]);
}
