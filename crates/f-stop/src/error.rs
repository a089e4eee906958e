use axum::http::StatusCode;
use uuid::Uuid;

/// AssetError is the reason an admin operation or asset request failed.
/// It renders as an HTTP response having the status appropriate to the
/// failure. Server-side failures are logged, and are rendered without detail.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("admin token is not valid")]
    InvalidAdminToken,
    #[error("capability {0} is not known")]
    CapabilityIdUnknown(Uuid),
    #[error("asset {0} was not found")]
    AssetIdUnknown(Uuid),
    #[error("asset {0} is not of an allowed type")]
    AssetTypeWrong(Uuid),
    #[error("capability cannot currently serve the request")]
    QueueFilled,
    #[error("service is not correctly configured: {0}")]
    ConfigIncorrect(&'static str),
    #[error(transparent)]
    RangeFormatInvalid(byte_ranges::Error),
    #[error(transparent)]
    RangeUnsatisfiable(byte_ranges::Error),
    #[error("failed to fetch asset from the asset store")]
    Storage(#[source] anyhow::Error),
}

impl AssetError {
    pub fn status(&self) -> StatusCode {
        match self {
            AssetError::InvalidAdminToken | AssetError::AssetTypeWrong(_) => {
                StatusCode::BAD_REQUEST
            }
            AssetError::CapabilityIdUnknown(_)
            | AssetError::AssetIdUnknown(_)
            | AssetError::QueueFilled => StatusCode::NOT_FOUND,
            AssetError::RangeFormatInvalid(_) | AssetError::RangeUnsatisfiable(_) => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            AssetError::ConfigIncorrect(_) | AssetError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<byte_ranges::Error> for AssetError {
    fn from(err: byte_ranges::Error) -> Self {
        match err {
            byte_ranges::Error::Format(_) => AssetError::RangeFormatInvalid(err),
            byte_ranges::Error::Unsatisfiable(_) => AssetError::RangeUnsatisfiable(err),
        }
    }
}

impl axum::response::IntoResponse for AssetError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();

        let body = if status.is_server_error() {
            let error = anyhow::Error::new(self);
            tracing::error!(?error, "responding with server error");
            serde_json::json!({"error": "Server error."})
        } else {
            tracing::debug!(error = %self, %status, "responding with client error");
            serde_json::json!({"error": self.to_string()})
        };

        (status, axum::Json(body)).into_response()
    }
}
