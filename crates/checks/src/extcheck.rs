//! External process check support.
//!
//! The spawner itself lives outside this crate; here we build the fixed
//! environment schema handed to it, track running pids, and classify the
//! process outcome into the shared status vocabulary.

use crate::config::{ProxyIdent, ServerIdent};
use crate::status::{CheckStatus, ChkResult};
use common::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Value length for entries sized once at init time; such entries are not
/// updatable afterwards.
pub const SIZE_EVAL_INIT: usize = 0;
/// Max string length for an unsigned long value.
pub const SIZE_ULONG: usize = 20;
/// Max string length for an unsigned int value.
pub const SIZE_UINT: usize = 11;
/// Max string length for an address (IPv6 text form plus NUL).
pub const SIZE_ADDR: usize = 46;

/// Bound on the captured process output used as a result description.
pub const OUTPUT_CAPTURE_LEN: usize = 128;

/// The fixed, ordered environment schema. Entries with `SIZE_EVAL_INIT` get
/// their maximum from the value supplied at build time.
const ENV_SCHEMA: [(&str, usize); 11] = [
    ("PATH", SIZE_EVAL_INIT),
    ("RELAY_PROXY_NAME", SIZE_EVAL_INIT),
    ("RELAY_PROXY_ID", SIZE_EVAL_INIT),
    ("RELAY_PROXY_ADDR", SIZE_EVAL_INIT),
    ("RELAY_PROXY_PORT", SIZE_EVAL_INIT),
    ("RELAY_SERVER_NAME", SIZE_EVAL_INIT),
    ("RELAY_SERVER_ID", SIZE_EVAL_INIT),
    ("RELAY_SERVER_ADDR", SIZE_ADDR),
    ("RELAY_SERVER_PORT", SIZE_UINT),
    ("RELAY_SERVER_MAXCONN", SIZE_ULONG),
    ("RELAY_SERVER_CURCONN", SIZE_ULONG),
];

// Schema positions of the per-invocation entries.
const IDX_SERVER_ADDR: usize = 7;
const IDX_SERVER_PORT: usize = 8;
const IDX_SERVER_CURCONN: usize = 10;

/// One environment entry with its declared maximum value length.
#[derive(Debug, Clone)]
pub struct EnvEntry {
    pub name: &'static str,
    pub max_len: usize,
    value: String,
}

impl EnvEntry {
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Builds the environment for process-based checks.
///
/// Identity entries are computed once at construction and immutable
/// thereafter; address, port and connection-count entries are refreshed per
/// invocation but never beyond their declared maximum.
#[derive(Debug)]
pub struct ExternalCheckEnvBuilder {
    entries: Vec<EnvEntry>,
}

impl ExternalCheckEnvBuilder {
    pub fn new(path: &str, proxy: &ProxyIdent, server: &ServerIdent) -> Result<Self> {
        let values = [
            path.to_string(),
            proxy.name.clone(),
            proxy.id.to_string(),
            proxy.addr.map(|a| a.to_string()).unwrap_or_default(),
            proxy.port.map(|p| p.to_string()).unwrap_or_default(),
            server.name.clone(),
            server.id.to_string(),
            server.addr.to_string(),
            server.port.map(|p| p.to_string()).unwrap_or_default(),
            server.maxconn.to_string(),
            0u64.to_string(),
        ];

        let mut entries = Vec::with_capacity(ENV_SCHEMA.len());
        for ((name, declared), value) in ENV_SCHEMA.iter().zip(values) {
            let max_len = if *declared == SIZE_EVAL_INIT { value.len() } else { *declared };
            if value.len() > max_len {
                return Err(Error::config(format!(
                    "{name} value exceeds its declared maximum ({} > {max_len})",
                    value.len()
                )));
            }
            entries.push(EnvEntry { name, max_len, value });
        }
        Ok(Self { entries })
    }

    /// Refresh the per-invocation entries before a spawn.
    pub fn refresh(&mut self, addr: IpAddr, port: Option<u16>, curconn: u64) -> Result<()> {
        self.set(IDX_SERVER_ADDR, addr.to_string())?;
        self.set(IDX_SERVER_PORT, port.map(|p| p.to_string()).unwrap_or_default())?;
        self.set(IDX_SERVER_CURCONN, curconn.to_string())
    }

    fn set(&mut self, index: usize, value: String) -> Result<()> {
        let entry = &mut self.entries[index];
        if value.len() > entry.max_len {
            return Err(Error::check(format!(
                "{} value exceeds its declared maximum ({} > {})",
                entry.name,
                value.len(),
                entry.max_len
            )));
        }
        entry.value = value;
        Ok(())
    }

    /// The entries, in schema order.
    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    /// Name/value pairs ready to hand to the spawner.
    pub fn environ(&self) -> Vec<(String, String)> {
        self.entries.iter().map(|e| (e.name.to_string(), e.value.clone())).collect()
    }
}

/// Identifier of a (server, check-kind) pair in the pid registry.
pub type CheckId = u64;

/// Registry of running external-check processes.
///
/// The only cross-session shared mutable state in this subsystem; every
/// access goes through the inner lock.
#[derive(Debug, Default)]
pub struct PidRegistry {
    inner: Mutex<HashMap<CheckId, u32>>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CheckId, u32>> {
        // A panicking holder cannot leave the map inconsistent; recover.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record the pid for a check, returning the previous one if a process
    /// was still registered.
    pub fn insert(&self, id: CheckId, pid: u32) -> Option<u32> {
        self.lock().insert(id, pid)
    }

    pub fn remove(&self, id: CheckId) -> Option<u32> {
        self.lock().remove(&id)
    }

    pub fn lookup(&self, id: CheckId) -> Option<u32> {
        self.lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classified outcome of one external-check process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub status: CheckStatus,
    pub result: ChkResult,
    pub description: String,
}

/// Classify a finished (or timed-out) external check.
///
/// `exit_code` is `None` when the process was killed or failed to spawn.
/// The first line of captured output, truncated to [`OUTPUT_CAPTURE_LEN`],
/// becomes the description.
pub fn classify_outcome(exit_code: Option<i32>, output: &[u8], timed_out: bool) -> ProcessOutcome {
    let description = first_line(output);
    if timed_out {
        return ProcessOutcome {
            status: CheckStatus::ProcTimeout,
            result: ChkResult::Failed,
            description: if description.is_empty() {
                CheckStatus::ProcTimeout.entry().desc.to_string()
            } else {
                description
            },
        };
    }
    match exit_code {
        Some(0) => ProcessOutcome {
            status: CheckStatus::ProcOk,
            result: ChkResult::Passed,
            description,
        },
        Some(code) => ProcessOutcome {
            status: CheckStatus::ProcErr,
            result: ChkResult::Failed,
            description: if description.is_empty() {
                format!("exit code {code}")
            } else {
                description
            },
        },
        None => ProcessOutcome {
            status: CheckStatus::ProcErr,
            result: ChkResult::Failed,
            description: if description.is_empty() {
                "process terminated abnormally".to_string()
            } else {
                description
            },
        },
    }
}

fn first_line(output: &[u8]) -> String {
    let line = output.split(|&b| b == b'\n').next().unwrap_or_default();
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_end_matches('\r').trim();
    let mut out: String = trimmed.chars().take(OUTPUT_CAPTURE_LEN).collect();
    out.shrink_to_fit();
    out
}
