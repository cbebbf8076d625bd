use serde::{Deserialize, Serialize};

pub const NOT_READY_MESSAGE: &str = "Internal backend service is not ready yet.";
pub const BAD_GATEWAY_MESSAGE: &str = "Bad Gateway: Failed to connect to internal backend.";

/// JSON body the gateway answers with when it cannot forward a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl GatewayErrorBody {
    /// Body of the `503` sent before the backend address is known
    pub fn not_ready() -> Self {
        Self {
            success: false,
            error: NOT_READY_MESSAGE.to_string(),
            status: Some("initializing".to_string()),
        }
    }

    /// Body of the `502` sent when the backend cannot be reached
    pub fn bad_gateway() -> Self {
        Self {
            success: false,
            error: BAD_GATEWAY_MESSAGE.to_string(),
            status: None,
        }
    }
}
