//! # Domain Model & Wire Protocol
//!
//! Plain data shared by every engine component: the configuration of a
//! monitored hypervisor host, the normalized resource snapshot produced by one
//! metrics fetch, and the JSON messages exchanged with dashboard clients.
//!
//! ## Wire Format
//!
//! Every message is a JSON object carrying a `type` discriminator with
//! camelCase field names, e.g.
//!
//! ```json
//! {"type":"subscribe","hostId":"pve-01"}
//! {"type":"data","hostId":"pve-01","fetchedAtMillis":1718000000000,"records":[...]}
//! {"type":"error","hostId":"pve-02","code":"TIMEOUT","message":"..."}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of one downstream connection for the life of the process.
pub type ConnectionId = u64;

/// # Host Configuration
///
/// One monitored hypervisor host. The token secret never leaves the engine:
/// it is excluded from `Debug` output and from every outbound message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Stable identifier used by clients to subscribe.
    pub host_id: String,
    /// Human-readable label shown on the dashboard.
    pub display_name: String,
    /// Absolute `http(s)` URL of the host management API.
    pub base_url: String,
    /// API token identifier, e.g. `root@pam!dashboard`.
    pub auth_token_id: String,
    /// API token secret.
    pub auth_token_secret: String,
}

impl HostConfig {
    /// The public view of this host, safe to send to clients.
    pub fn summary(&self) -> HostSummary {
        HostSummary {
            id: self.host_id.clone(),
            name: self.display_name.clone(),
            url: self.base_url.clone(),
        }
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("host_id", &self.host_id)
            .field("display_name", &self.display_name)
            .field("base_url", &self.base_url)
            .field("auth_token_id", &self.auth_token_id)
            .field("auth_token_secret", &"********")
            .finish()
    }
}

/// Client-visible description of a registered host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSummary {
    /// Host identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Management API base URL.
    pub url: String,
}

/// Category of a resource reported by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    /// Full virtual machine.
    Vm,
    /// System container.
    Container,
    /// Nodes, storage pools and anything else the host reports.
    Other,
}

/// Run state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    /// Resource is running.
    Running,
    /// Resource is stopped.
    Stopped,
    /// Upstream reported a status with no mapping, or none at all.
    Unknown,
}

/// # Resource Record
///
/// Normalized metrics for one resource. Byte counts are absolute; CPU is the
/// fraction of allotted cores in use (`0.0..=1.0` under normal load).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Upstream resource identifier, e.g. `qemu/100`.
    pub resource_id: String,
    /// Resource category.
    pub kind: ResourceKind,
    /// Display name (falls back to the resource id).
    pub name: String,
    /// Run state.
    pub status: ResourceStatus,
    /// CPU usage as a fraction of allotted cores.
    pub cpu_fraction: f64,
    /// Memory in use, bytes.
    pub mem_used_bytes: u64,
    /// Memory allotted, bytes.
    pub mem_total_bytes: u64,
    /// Disk in use, bytes.
    pub disk_used_bytes: u64,
    /// Disk allotted, bytes.
    pub disk_total_bytes: u64,
    /// Inbound network rate since the previous sample.
    pub network_in_bytes_per_sec: f64,
    /// Outbound network rate since the previous sample.
    pub network_out_bytes_per_sec: f64,
    /// Seconds since the resource started.
    pub uptime_seconds: u64,
}

/// # Resource Snapshot
///
/// The result of one successful fetch. Immutable once produced; shared
/// between the cache and outbound messages behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    /// Host the snapshot was taken from.
    pub host_id: String,
    /// Wall-clock completion time of the fetch, Unix milliseconds.
    pub fetched_at_millis: u64,
    /// Resource records, in upstream order.
    pub records: Vec<ResourceRecord>,
}

/// Machine-readable error category carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// TCP connection refused by the host.
    ConnectionRefused,
    /// No response within the fetch timeout.
    Timeout,
    /// TLS handshake or certificate failure.
    TlsError,
    /// Host rejected the API token.
    AuthFailure,
    /// Response body could not be understood.
    MalformedResponse,
    /// Any other transport failure.
    NetworkError,
    /// Client referenced a host that is not registered.
    HostNotFound,
    /// Client sent a frame that is not a valid message.
    InvalidMessage,
}

impl ErrorCode {
    /// The wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::TlsError => "TLS_ERROR",
            ErrorCode::AuthFailure => "AUTH_FAILURE",
            ErrorCode::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::HostNotFound => "HOST_NOT_FOUND",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Client Message
///
/// Frames accepted from a dashboard client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start receiving updates for a host.
    Subscribe {
        /// Host to subscribe to.
        host_id: String,
    },
    /// Stop receiving updates for a host.
    Unsubscribe {
        /// Host to unsubscribe from.
        host_id: String,
    },
    /// Liveness check; answered with `pong` echoing the timestamp.
    #[serde(alias = "heartbeat")]
    Ping {
        /// Opaque client timestamp, echoed verbatim.
        #[serde(default)]
        timestamp: serde_json::Value,
    },
}

/// # Server Message
///
/// Frames pushed to a dashboard client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// The registered hosts, sent once when a connection opens.
    Hosts {
        /// Known hosts.
        hosts: Vec<HostSummary>,
    },
    /// Subscription accepted; data for the host is on its way.
    Connecting {
        /// Host identifier.
        host_id: String,
        /// Host display name.
        host_name: String,
    },
    /// The host answered successfully.
    Connected {
        /// Host identifier.
        host_id: String,
        /// Host display name.
        host_name: String,
    },
    /// Acknowledges a subscribe request.
    Subscribed {
        /// Host identifier.
        host_id: String,
    },
    /// Acknowledges an unsubscribe request, or reports that the host was removed.
    Unsubscribed {
        /// Host identifier.
        host_id: String,
    },
    /// A resource snapshot.
    Data {
        /// Host identifier.
        host_id: String,
        /// Fetch completion time, Unix milliseconds.
        fetched_at_millis: u64,
        /// Resource records.
        records: Vec<ResourceRecord>,
    },
    /// A fetch failure or a rejected client request.
    Error {
        /// Host the error relates to, when there is one.
        #[serde(skip_serializing_if = "Option::is_none")]
        host_id: Option<String>,
        /// Error category.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// Reply to `ping`.
    Pong {
        /// The client's timestamp, unchanged.
        timestamp: serde_json::Value,
    },
}

impl ServerMessage {
    /// Builds a `data` message from a snapshot.
    pub fn data(snapshot: &ResourceSnapshot) -> Self {
        ServerMessage::Data {
            host_id: snapshot.host_id.clone(),
            fetched_at_millis: snapshot.fetched_at_millis,
            records: snapshot.records.clone(),
        }
    }

    /// Builds an `error` message.
    pub fn error(host_id: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            host_id: host_id.map(str::to_string),
            code,
            message: message.into(),
        }
    }

    /// The host this message concerns, if any.
    pub fn host_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Connecting { host_id, .. }
            | ServerMessage::Connected { host_id, .. }
            | ServerMessage::Subscribed { host_id }
            | ServerMessage::Unsubscribed { host_id }
            | ServerMessage::Data { host_id, .. } => Some(host_id),
            ServerMessage::Error { host_id, .. } => host_id.as_deref(),
            ServerMessage::Hosts { .. } | ServerMessage::Pong { .. } => None,
        }
    }

    /// Serializes the message for a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse_from_camel_case() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe","hostId":"pve-01"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { host_id: "pve-01".into() });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat","timestamp":42}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: json!(42) });

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot","hostId":"x"}"#).is_err());
    }

    #[test]
    fn test_error_message_wire_shape() {
        let msg = ServerMessage::error(Some("pve-02"), ErrorCode::Timeout, "no response");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type":"error","hostId":"pve-02","code":"TIMEOUT","message":"no response"})
        );

        let msg = ServerMessage::error(None, ErrorCode::InvalidMessage, "bad frame");
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("hostId").is_none());
    }

    #[test]
    fn test_data_message_carries_snapshot_fields() {
        let snapshot = ResourceSnapshot {
            host_id: "pve-01".into(),
            fetched_at_millis: 1_700_000_000_000,
            records: vec![ResourceRecord {
                resource_id: "qemu/100".into(),
                kind: ResourceKind::Vm,
                name: "web".into(),
                status: ResourceStatus::Running,
                cpu_fraction: 0.25,
                mem_used_bytes: 1024,
                mem_total_bytes: 2048,
                disk_used_bytes: 0,
                disk_total_bytes: 4096,
                network_in_bytes_per_sec: 0.0,
                network_out_bytes_per_sec: 0.0,
                uptime_seconds: 60,
            }],
        };
        let value = serde_json::to_value(ServerMessage::data(&snapshot)).unwrap();
        assert_eq!(value["type"], "data");
        assert_eq!(value["fetchedAtMillis"], 1_700_000_000_000u64);
        assert_eq!(value["records"][0]["kind"], "VM");
        assert_eq!(value["records"][0]["status"], "RUNNING");
        assert_eq!(value["records"][0]["cpuFraction"], 0.25);
    }

    #[test]
    fn test_host_config_debug_hides_secret() {
        let host = HostConfig {
            host_id: "pve-01".into(),
            display_name: "Rack A".into(),
            base_url: "https://10.0.0.1:8006".into(),
            auth_token_id: "root@pam!dash".into(),
            auth_token_secret: "s3cr3t".into(),
        };
        let rendered = format!("{:?}", host);
        assert!(!rendered.contains("s3cr3t"));
        assert_eq!(host.summary().name, "Rack A");
    }
}
