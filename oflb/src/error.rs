use std::net::Ipv4Addr;

use oflb_common::ofp::CodecError;
use oflb_common::MacAddr;
use thiserror::Error;

/// Malformed or self-contradictory topology. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("topology has no backends")]
    NoBackends,
    #[error("topology has no client-facing ports")]
    NoClientPorts,
    #[error("backend id {0:?} is used more than once")]
    DuplicateBackendId(String),
    #[error("backend ip {0} is used more than once")]
    DuplicateBackendIp(Ipv4Addr),
    #[error("backend mac {0} is used more than once")]
    DuplicateBackendMac(MacAddr),
    #[error("switch port {0} is assigned to more than one backend")]
    DuplicateBackendPort(u32),
    #[error("client-facing port {0} is listed more than once")]
    DuplicateClientPort(u32),
    #[error("port {port} of backend {backend:?} is also listed as client-facing")]
    BackendPortIsClientPort { backend: String, port: u32 },
    #[error("vip {0} is also a backend address")]
    VipIsBackend(Ipv4Addr),
    #[error("lb mac {0} is also a backend mac")]
    LbMacIsBackend(MacAddr),
    #[error("lb mac {0} is not a unicast address")]
    LbMacNotUnicast(MacAddr),
    #[error("port {0} is not a valid physical switch port")]
    InvalidPort(u32),
    #[error("backend {0:?} has weight 0")]
    ZeroWeight(String),
    #[error("total bucket weight {total} exceeds the selection ring size {ring_size}")]
    WeightExceedsRing { total: u64, ring_size: u32 },
    #[error("controller setting {0} must be greater than zero")]
    ZeroSetting(&'static str),
}

/// Transport-level failure on the control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message from switch: {0}")]
    Codec(#[from] CodecError),
    #[error("switch closed the control channel")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),
    #[error("switch rejected {entity}: error type {err_type} code {code}")]
    Installation {
        entity: String,
        err_type: u16,
        code: u16,
    },
    #[error("installation timed out waiting for {0}")]
    InstallTimeout(&'static str),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl SessionError {
    /// Whether the failure is retried as a full resync on the same connection.
    pub fn is_installation(&self) -> bool {
        matches!(
            self,
            SessionError::Installation { .. } | SessionError::InstallTimeout(_)
        )
    }
}

/// Failures that end the controller process.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to load config: {0:#}")]
    LoadConfig(anyhow::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("switch protocol negotiation failed {attempts} times, last error: {last}")]
    NegotiationExhausted { attempts: u32, last: String },
    #[error("switch installation failed {attempts} times, last error: {last}")]
    SyncExhausted { attempts: u32, last: String },
    #[error("control channel failed {attempts} times, last error: {last}")]
    ChannelExhausted { attempts: u32, last: String },
    #[error("cannot open control channel on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ControllerError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ControllerError::LoadConfig(_) | ControllerError::Config(_) => 1,
            _ => 2,
        }
    }
}
