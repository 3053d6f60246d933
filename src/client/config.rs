//! Client configuration.
//!
//! Every scheduler endpoint lives on the same host at its own port. The
//! default port table matches a stock scheduler deployment; override it per
//! role when the scheduler is remapped.
//!
//! # Example Configuration File
//!
//! ```toml
//! scheduler_host = "10.0.0.5"
//! ip_address = "10.0.0.17"
//! call_timeout_ms = 10000
//!
//! [ports]
//! dag_call = 6005
//!
//! [poll]
//! max_wait_ms = 120000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::future::PollPolicy;
use crate::error::{Error, Result};
use crate::shared::Endpoint;

/// Logical scheduler endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Handshake returning the KVS address.
    Connect,
    /// Function registration.
    FunctionCreate,
    /// Single-function invocation.
    FunctionCall,
    /// Listing registered functions.
    List,
    /// DAG registration.
    DagCreate,
    /// DAG invocation.
    DagCall,
    /// DAG removal.
    DagDelete,
}

/// Port assigned to each [`EndpointRole`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPorts {
    /// Handshake port.
    pub connect: u16,
    /// Function registration port.
    pub function_create: u16,
    /// Function invocation port.
    pub function_call: u16,
    /// Listing port.
    pub list: u16,
    /// DAG registration port.
    pub dag_create: u16,
    /// DAG invocation port.
    pub dag_call: u16,
    /// DAG removal port.
    pub dag_delete: u16,
}

impl Default for EndpointPorts {
    fn default() -> Self {
        Self {
            connect: 5000,
            function_create: 5001,
            function_call: 5002,
            list: 5003,
            dag_create: 5004,
            dag_call: 5005,
            dag_delete: 5006,
        }
    }
}

impl EndpointPorts {
    /// Port for `role`.
    pub fn port(&self, role: EndpointRole) -> u16 {
        match role {
            EndpointRole::Connect => self.connect,
            EndpointRole::FunctionCreate => self.function_create,
            EndpointRole::FunctionCall => self.function_call,
            EndpointRole::List => self.list,
            EndpointRole::DagCreate => self.dag_create,
            EndpointRole::DagCall => self.dag_call,
            EndpointRole::DagDelete => self.dag_delete,
        }
    }
}

/// Configuration for a [`Client`](super::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host running the scheduler.
    pub scheduler_host: String,

    /// Address at which the scheduler can reach this client.
    #[serde(default = "default_ip_address")]
    pub ip_address: String,

    /// Local port the direct-response listener binds to.
    #[serde(default = "default_response_port")]
    pub response_port: u16,

    /// Whether to bind the direct-response listener at all.
    #[serde(default = "default_enable_direct_response")]
    pub enable_direct_response: bool,

    /// Forwarded to the KVS connector; selects a co-located store.
    #[serde(default)]
    pub local_mode: bool,

    /// Deadline for the connect handshake, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Deadline for a DAG call reply and for a pushed frame, in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Largest encoded call accepted before any I/O.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Largest frame accepted from the network.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Scheduler port table.
    #[serde(default)]
    pub ports: EndpointPorts,

    /// How futures poll the KVS.
    #[serde(default)]
    pub poll: PollPolicy,
}

fn default_ip_address() -> String {
    "127.0.0.1".to_string()
}

fn default_response_port() -> u16 {
    9010
}

fn default_enable_direct_response() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_call_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_max_request_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

impl ClientConfig {
    /// Configuration for a scheduler on `scheduler_host` with all defaults.
    pub fn new(scheduler_host: impl Into<String>) -> Self {
        Self {
            scheduler_host: scheduler_host.into(),
            ip_address: default_ip_address(),
            response_port: default_response_port(),
            enable_direct_response: default_enable_direct_response(),
            local_mode: false,
            handshake_timeout_ms: default_handshake_timeout(),
            call_timeout_ms: default_call_timeout(),
            max_request_bytes: default_max_request_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            ports: EndpointPorts::default(),
            poll: PollPolicy::default(),
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads configuration from the process environment.
    ///
    /// Recognised variables:
    /// - `CLOUDBURST_SCHEDULER` - scheduler host (required)
    /// - `CLOUDBURST_IP` - address the scheduler uses to reach this client
    /// - `CLOUDBURST_RESPONSE_PORT` - direct-response listener port
    /// - `CLOUDBURST_LOCAL` - `true`/`1` to enable local mode
    /// - `CLOUDBURST_HANDSHAKE_TIMEOUT_MS`, `CLOUDBURST_CALL_TIMEOUT_MS`
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds configuration from `CLOUDBURST_*` key/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut scheduler = None;
        let mut config = Self::new("");

        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix("CLOUDBURST_") else {
                continue;
            };
            let value: String = value.into();
            match name {
                "SCHEDULER" => scheduler = Some(value),
                "IP" => config.ip_address = value,
                "RESPONSE_PORT" => config.response_port = parse_var(name, &value)?,
                "LOCAL" => config.local_mode = matches!(value.as_str(), "1" | "true" | "TRUE"),
                "HANDSHAKE_TIMEOUT_MS" => config.handshake_timeout_ms = parse_var(name, &value)?,
                "CALL_TIMEOUT_MS" => config.call_timeout_ms = parse_var(name, &value)?,
                _ => {},
            }
        }

        config.scheduler_host = scheduler
            .ok_or_else(|| Error::Config("CLOUDBURST_SCHEDULER is not set".to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_host.trim().is_empty() {
            return Err(Error::Config("scheduler_host must not be empty".to_string()));
        }
        if self.handshake_timeout_ms == 0 || self.call_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be greater than zero".to_string()));
        }
        if self.max_request_bytes == 0 || self.max_frame_bytes == 0 {
            return Err(Error::Config("size limits must be greater than zero".to_string()));
        }
        if self.max_request_bytes > self.max_frame_bytes {
            return Err(Error::Config(format!(
                "max_request_bytes ({}) must not exceed max_frame_bytes ({})",
                self.max_request_bytes, self.max_frame_bytes
            )));
        }
        self.poll.validate()
    }

    /// Scheduler endpoint for `role`.
    pub fn endpoint(&self, role: EndpointRole) -> Endpoint {
        Endpoint::new(self.scheduler_host.clone(), self.ports.port(role))
    }

    /// Address advertised to the scheduler for pushed results.
    pub fn response_endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip_address.clone(), self.response_port)
    }

    /// Local address the direct-response listener binds to.
    pub fn response_bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.response_port)
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Sets the address the scheduler uses to reach this client.
    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self
    }

    /// Overrides the port table.
    pub fn with_ports(mut self, ports: EndpointPorts) -> Self {
        self.ports = ports;
        self
    }

    /// Sets the direct-response listener port.
    pub fn with_response_port(mut self, port: u16) -> Self {
        self.response_port = port;
        self
    }

    /// Enables or disables the direct-response listener.
    pub fn with_direct_response(mut self, enable: bool) -> Self {
        self.enable_direct_response = enable;
        self
    }

    /// Enables or disables local mode.
    pub fn with_local_mode(mut self, local_mode: bool) -> Self {
        self.local_mode = local_mode;
        self
    }

    /// Sets the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Sets the call deadline.
    pub fn with_call_timeout(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Sets the largest encoded call accepted.
    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    /// Sets the largest frame accepted from or sent to the network.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Largest encoded call that can actually be sent.
    pub fn request_limit(&self) -> usize {
        self.max_request_bytes.min(self.max_frame_bytes)
    }

    /// Sets the polling policy for futures.
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for CLOUDBURST_{}: {:?}", name, value)))
}
