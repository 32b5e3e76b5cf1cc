use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidRequest,
    Unauthorized,
    ExperimentNotFound,
    NotFound,
    DuplicateLead,
    DuplicateSlug,
    InvalidStatusTransition,
    InternalError,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ExperimentNotFound => "EXPERIMENT_NOT_FOUND",
            Self::NotFound => "NOT_FOUND",
            Self::DuplicateLead => "DUPLICATE_LEAD",
            Self::DuplicateSlug => "DUPLICATE_SLUG",
            Self::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ExperimentNotFound => StatusCode::NOT_FOUND,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateLead => StatusCode::CONFLICT,
            Self::DuplicateSlug => StatusCode::CONFLICT,
            Self::InvalidStatusTransition => StatusCode::BAD_REQUEST,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub success: bool,
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiDataEnvelope<T> {
    pub success: bool,
    pub data: T,
}

pub fn ok_data<T: Serialize>(data: T) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    data_response(StatusCode::OK, data)
}

pub fn created_data<T: Serialize>(data: T) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    data_response(StatusCode::CREATED, data)
}

pub fn data_response<T: Serialize>(
    status: StatusCode,
    data: T,
) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    (
        status,
        Json(ApiDataEnvelope {
            success: true,
            data,
        }),
    )
}

pub fn error_response(
    code: ApiErrorCode,
    message: impl Into<String>,
    request_id: &str,
) -> ApiErrorTuple {
    error_response_with_details(code, message, None, request_id)
}

pub fn error_response_with_details(
    code: ApiErrorCode,
    message: impl Into<String>,
    details: Option<Value>,
    request_id: &str,
) -> ApiErrorTuple {
    (
        code.default_status(),
        Json(ApiErrorResponse {
            success: false,
            error: ApiErrorDetail {
                code: code.as_str(),
                message: message.into(),
                details,
                request_id: request_id.to_string(),
            },
        }),
    )
}

pub fn invalid_request_error(message: impl Into<String>, request_id: &str) -> ApiErrorTuple {
    error_response(ApiErrorCode::InvalidRequest, message, request_id)
}

pub fn unauthorized_error(message: impl Into<String>, request_id: &str) -> ApiErrorTuple {
    error_response(ApiErrorCode::Unauthorized, message, request_id)
}

pub fn not_found_error(message: impl Into<String>, request_id: &str) -> ApiErrorTuple {
    error_response(ApiErrorCode::NotFound, message, request_id)
}

pub fn internal_error(request_id: &str) -> ApiErrorTuple {
    error_response(
        ApiErrorCode::InternalError,
        "An internal error occurred.",
        request_id,
    )
}
