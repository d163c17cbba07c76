//! JSON-RPC 2.0 protocol types for the discovery registry.

use serde::{Deserialize, Serialize};

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Registry protocol version. Bumped on incompatible payload changes.
pub const DISCOVERY_PROTOCOL_VERSION: u16 = 1;

/// Method names.
pub mod method {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const UNREGISTER: &str = "unregister";
    pub const DISCOVER: &str = "discover";
    pub const NEGOTIATE: &str = "negotiate";
    pub const REPORT: &str = "report";
    /// Notification pushed by the registry to a registered server.
    pub const SESSION_OFFER: &str = "session_offer";
}

/// JSON-RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// JSON-RPC response (exactly one of `result` / `error` is set)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: u64,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

// Standard JSON-RPC error codes
impl JsonRpcError {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SERVER_NOT_FOUND: i32 = -32000;
    pub const NOT_REGISTERED: i32 = -32001;
    pub const VERSION_MISMATCH: i32 = -32002;

    fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_code(
            Self::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::with_code(Self::INVALID_PARAMS, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::with_code(Self::INTERNAL_ERROR, msg)
    }

    /// No live registration for this server id.
    pub fn server_not_found(server_id: &str) -> Self {
        Self::with_code(
            Self::SERVER_NOT_FOUND,
            format!("Server not found: {}", server_id),
        )
    }

    /// Method requires a prior `register` on this connection.
    pub fn not_registered() -> Self {
        Self::with_code(Self::NOT_REGISTERED, "Not registered")
    }

    pub fn version_mismatch(got: u16) -> Self {
        Self::with_code(
            Self::VERSION_MISMATCH,
            format!(
                "Unsupported protocol version: {} (expected {})",
                got, DISCOVERY_PROTOCOL_VERSION
            ),
        )
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

// ============================================================================
// Method-specific parameter and result types
// ============================================================================

/// A server as returned by `discover` and `negotiate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    /// WebTransport URL (`https://host:port/`).
    pub url: String,
    /// Hex SHA-256 of the server's leaf certificate, for pinning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_hash: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Active WebTransport sessions at last heartbeat.
    #[serde(default)]
    pub load: u32,
    /// Average registry<->server RTT in milliseconds.
    #[serde(default)]
    pub rtt_ms: u64,
    /// Consecutive failed connection reports from clients.
    #[serde(default)]
    pub failures: u32,
}

impl ServerRecord {
    /// True if this server advertises every capability in `wanted`.
    pub fn supports_all(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|cap| self.capabilities.contains(cap))
    }
}

/// Parameters for "register" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    pub version: u16,
    pub server_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_hash: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub load: u32,
}

/// Result for "register" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub lease_ttl_ms: u64,
    /// Suggested heartbeat period.
    pub heartbeat_ms: u64,
    /// URL as published (host may have been replaced with the observed address).
    pub url: String,
}

/// Parameters for "heartbeat" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub seq: u32,
    pub timestamp: u64,
    /// RTT measured by the server from its previous heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_rtt_us: Option<u64>,
    #[serde(default)]
    pub load: u32,
}

/// Result for "heartbeat" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub seq: u32,
    pub client_ts: u64,
    pub server_ts: u64,
    pub lease_ttl_ms: u64,
}

/// Result for "unregister" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterResult {
    pub removed: bool,
}

/// Parameters for "discover" method
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverParams {
    pub version: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Result for "discover" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResult {
    pub servers: Vec<ServerRecord>,
}

/// Parameters for "negotiate" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateParams {
    pub server_id: String,
}

/// Result for "negotiate" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateResult {
    pub server: ServerRecord,
    pub ticket: String,
    pub expires_in_ms: u64,
}

/// Parameters for "report" method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportParams {
    pub server_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parameters for "session_offer" notification (registry → server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOfferParams {
    pub ticket: String,
    pub expires_in_ms: u64,
}

// ============================================================================
// Helper constructors
// ============================================================================

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Deserialize `params` into a method-specific type.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, JsonRpcError> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    }
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: u64, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Serialize a handler result, mapping failures to an internal error.
pub fn to_result_value<T: Serialize>(value: &T) -> Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}
