//! Check configuration and identity types.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Identity of the proxy (backend section) a check belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyIdent {
    pub name: String,
    pub id: u32,
    /// First bind address, if any.
    pub addr: Option<IpAddr>,
    /// First bind port, if any.
    pub port: Option<u16>,
}

/// Identity of the server a check probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdent {
    pub name: String,
    pub id: u32,
    pub addr: IpAddr,
    /// Server port; checks may override it per rule.
    pub port: Option<u16>,
    pub maxconn: u64,
}

/// Whether checks ride on TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseSsl {
    /// Never use TLS for checks.
    Disabled,
    /// Follow the server's own TLS setting.
    #[default]
    Inherit,
    /// Always use TLS for checks.
    Enabled,
}

/// Check scheduling timers.
///
/// `fastinter` and `downinter` fall back to `inter` when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTimers {
    /// Nominal interval between check cycles.
    #[serde(with = "humantime_serde")]
    pub inter: Duration,

    /// Accelerated interval while a server is transitioning.
    #[serde(default, with = "humantime_serde")]
    pub fastinter: Option<Duration>,

    /// Relaxed interval while a server is fully down.
    #[serde(default, with = "humantime_serde")]
    pub downinter: Option<Duration>,

    /// Per-connect and per-step timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CheckTimers {
    fn default() -> Self {
        Self {
            inter: Duration::from_secs(2),
            fastinter: None,
            downinter: None,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Connection parameters shared by every rule of a session.
///
/// Rules may override the address and port; everything else applies to any
/// connection the session opens.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub proxy: ProxyIdent,
    pub server: ServerIdent,
    /// Explicit check address, overriding the server address.
    pub addr: Option<IpAddr>,
    /// Explicit check port, overriding the server port.
    pub port: Option<u16>,
    pub sni: Option<String>,
    pub alpn: Option<String>,
    pub use_ssl: UseSsl,
    /// Whether the server itself speaks TLS; resolves `UseSsl::Inherit`.
    pub server_ssl: bool,
    pub send_proxy: bool,
    pub via_socks4: bool,
}

impl CheckContext {
    pub fn new(proxy: ProxyIdent, server: ServerIdent) -> Self {
        Self {
            proxy,
            server,
            addr: None,
            port: None,
            sni: None,
            alpn: None,
            use_ssl: UseSsl::default(),
            server_ssl: false,
            send_proxy: false,
            via_socks4: false,
        }
    }

    /// Address checks connect to unless a rule overrides it.
    pub fn check_addr(&self) -> IpAddr {
        self.addr.unwrap_or(self.server.addr)
    }

    /// Port checks connect to unless a rule overrides it, if any.
    pub fn check_port(&self) -> Option<u16> {
        self.port.or(self.server.port)
    }

    /// Whether a default connect should run a TLS handshake.
    pub fn ssl_wanted(&self) -> bool {
        match self.use_ssl {
            UseSsl::Disabled => false,
            UseSsl::Inherit => self.server_ssl,
            UseSsl::Enabled => true,
        }
    }
}

/// Per-check configuration, as handed over by the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Consecutive successes required to mark a server up.
    pub rise: u32,

    /// Consecutive failures required to mark a server down.
    pub fall: u32,

    /// Initial health seed; defaults to 0 (down) when unset.
    #[serde(default)]
    pub initial_health: Option<u32>,

    #[serde(flatten)]
    pub timers: CheckTimers,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            rise: 2,
            fall: 3,
            initial_health: None,
            timers: CheckTimers::default(),
        }
    }
}

impl CheckConfig {
    /// Validate threshold configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rise == 0 {
            return Err(Error::config("rise must be at least 1"));
        }
        if self.fall == 0 {
            return Err(Error::config("fall must be at least 1"));
        }
        if let Some(seed) = self.initial_health {
            if seed > self.rise + self.fall - 1 {
                return Err(Error::config(format!(
                    "initial health {seed} outside [0, {}]",
                    self.rise + self.fall - 1
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerIdent {
        ServerIdent {
            name: "web1".to_string(),
            id: 1,
            addr: "192.0.2.10".parse().unwrap(),
            port: Some(8080),
            maxconn: 100,
        }
    }

    fn proxy() -> ProxyIdent {
        ProxyIdent {
            name: "be_web".to_string(),
            id: 3,
            addr: None,
            port: None,
        }
    }

    #[test]
    fn test_check_addr_port_fallback() {
        let mut ctx = CheckContext::new(proxy(), server());
        assert_eq!(ctx.check_addr(), "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(ctx.check_port(), Some(8080));

        ctx.addr = Some("192.0.2.99".parse().unwrap());
        ctx.port = Some(9000);
        assert_eq!(ctx.check_addr(), "192.0.2.99".parse::<IpAddr>().unwrap());
        assert_eq!(ctx.check_port(), Some(9000));
    }

    #[test]
    fn test_ssl_tristate() {
        let mut ctx = CheckContext::new(proxy(), server());
        assert!(!ctx.ssl_wanted());
        ctx.server_ssl = true;
        assert!(ctx.ssl_wanted());
        ctx.use_ssl = UseSsl::Disabled;
        assert!(!ctx.ssl_wanted());
        ctx.use_ssl = UseSsl::Enabled;
        ctx.server_ssl = false;
        assert!(ctx.ssl_wanted());
    }

    #[test]
    fn test_config_validation() {
        assert!(CheckConfig::default().validate().is_ok());

        let bad = CheckConfig { rise: 0, ..Default::default() };
        assert!(bad.validate().is_err());

        let bad = CheckConfig { fall: 0, ..Default::default() };
        assert!(bad.validate().is_err());

        let bad = CheckConfig { initial_health: Some(10), ..Default::default() };
        assert!(bad.validate().is_err());

        let ok = CheckConfig { initial_health: Some(4), ..Default::default() };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_timers_deserialize_humantime() {
        let json = r#"{"rise":2,"fall":3,"inter":"2s","timeout":"500ms"}"#;
        let config: CheckConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timers.inter, Duration::from_secs(2));
        assert_eq!(config.timers.timeout, Duration::from_millis(500));
        assert!(config.timers.fastinter.is_none());
    }
}
