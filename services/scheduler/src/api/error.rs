use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{ErrorCode, SchedulerError};

/// JSON body shared by every compose endpoint, success or failure.
#[derive(Debug, Serialize)]
pub struct OperationBody<T> {
    pub code: ErrorCode,
    pub kind: String,
    pub operation: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<T>,
}

impl<T> OperationBody<T> {
    pub fn ok(operation: &str, message: impl Into<String>, report: T) -> Self {
        Self {
            code: ErrorCode::Ok,
            kind: "ok".to_string(),
            operation: operation.to_string(),
            message: message.into(),
            report: Some(report),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Box<OperationBody<()>>,
}

impl ApiError {
    pub fn new(operation: &str, error: &SchedulerError) -> Self {
        Self {
            status: status_for(error),
            body: Box::new(OperationBody {
                code: error.code(),
                kind: error.kind().to_string(),
                operation: operation.to_string(),
                message: error.to_string(),
                report: None,
            }),
        }
    }
}

fn status_for(error: &SchedulerError) -> StatusCode {
    match error {
        SchedulerError::Compose(_) | SchedulerError::Label(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::StorePersist(_) | SchedulerError::StoreRead(_) | SchedulerError::Reconcile(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SchedulerError::Driver(_) | SchedulerError::Unspecified(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
