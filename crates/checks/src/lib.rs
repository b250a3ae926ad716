//! Active and passive backend health verification for the Relay load balancer.
//!
//! This crate decides whether a backend server is fit to receive traffic:
//! - A scripted connect/send/expect interpreter probes servers at layers 4-7.
//! - A rise/fall automaton turns check outcomes into up/down transitions.
//! - A passive health-analysis path reacts to live traffic observations.
//! - Process-based checks get a fixed environment schema and a pid registry.
//!
//! Transport I/O, configuration parsing, process spawning and routing are
//! external collaborators; this crate only defines their seams.
//!
//! # Example
//!
//! ```no_run
//! use checks::config::{CheckConfig, CheckContext, ProxyIdent, ServerIdent};
//! use checks::rules::{ConnectSpec, Ruleset, RulesetRef};
//! use checks::session::{CheckKind, CheckSession};
//!
//! # async fn example(transport: &dyn checks::engine::CheckTransport)
//! # -> common::Result<()> {
//! let rules = RulesetRef::private(
//!     Ruleset::builder()
//!         .connect(ConnectSpec::default())
//!         .send_string("PING\r\n")
//!         .expect_string("PONG")
//!         .build(),
//! );
//!
//! let ctx = CheckContext::new(
//!     ProxyIdent { name: "be_redis".into(), id: 1, addr: None, port: None },
//!     ServerIdent {
//!         name: "redis1".into(),
//!         id: 1,
//!         addr: "192.0.2.10".parse().unwrap(),
//!         port: Some(6379),
//!         maxconn: 100,
//!     },
//! );
//!
//! let (events, _rx) = tokio::sync::mpsc::channel(64);
//! let mut session =
//!     CheckSession::new(CheckKind::Health, ctx, &CheckConfig::default(), rules, events)?;
//!
//! // Driven by the periodic scheduler:
//! let report = session.run(transport).await;
//! let next_cycle = session.effective_interval();
//! # let _ = (report, next_cycle);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod extcheck;
pub mod hana;
pub mod health;
pub mod pattern;
pub mod rules;
pub mod session;
pub mod status;

pub use config::{CheckConfig, CheckContext, CheckTimers, ProxyIdent, ServerIdent, UseSsl};
pub use engine::{CheckReport, CheckStream, CheckTransport, ConnectTarget, TcpCheckEngine};
pub use hana::{HanaAggregator, HanaStatus, ObserveLayer, OnErrorAction};
pub use health::{HealthCounter, ServerEvent, StateChangeCause};
pub use pattern::Pattern;
pub use rules::{ConnectSpec, ExpectSpec, RuleAction, Ruleset, RulesetRef, SendPayload};
pub use session::{CheckKind, CheckSession};
pub use status::{CheckStatus, ChkResult};
