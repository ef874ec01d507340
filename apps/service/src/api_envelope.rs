use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// Machine-readable error codes shared by every protocol surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation
    InvalidRequest,
    EmptyUpdateBody,
    InvalidContentSchemaJson,
    ContentSchemaValidationFailed,
    InvalidCreatedAfter,
    InvalidCreatedBefore,
    // Reference
    ContentTypeNotFound,
    ContentItemNotFound,
    TargetVersionNotFound,
    WorkflowNotFound,
    WebhookNotFound,
    ApiKeyNotFound,
    PaymentNotFound,
    EntitlementNotFound,
    OfferNotFound,
    // Conflict
    ContentTypeSlugConflict,
    VersionConflict,
    WebhookReplay,
    ContentTypeInUse,
    // Authorization
    AuthMissingApiKey,
    AuthInvalidApiKey,
    AuthInsufficientScope,
    // Payment
    PaymentRequired,
    PaymentInvalidToken,
    PaymentExpired,
    PaymentFailed,
    EntitlementExhausted,
    // Rate
    RateLimitExceeded,
    // Server
    InternalError,
    DependencyUnavailable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::EmptyUpdateBody => "EMPTY_UPDATE_BODY",
            Self::InvalidContentSchemaJson => "INVALID_CONTENT_SCHEMA_JSON",
            Self::ContentSchemaValidationFailed => "CONTENT_SCHEMA_VALIDATION_FAILED",
            Self::InvalidCreatedAfter => "INVALID_CREATED_AFTER",
            Self::InvalidCreatedBefore => "INVALID_CREATED_BEFORE",
            Self::ContentTypeNotFound => "CONTENT_TYPE_NOT_FOUND",
            Self::ContentItemNotFound => "CONTENT_ITEM_NOT_FOUND",
            Self::TargetVersionNotFound => "TARGET_VERSION_NOT_FOUND",
            Self::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            Self::WebhookNotFound => "WEBHOOK_NOT_FOUND",
            Self::ApiKeyNotFound => "API_KEY_NOT_FOUND",
            Self::PaymentNotFound => "PAYMENT_NOT_FOUND",
            Self::EntitlementNotFound => "ENTITLEMENT_NOT_FOUND",
            Self::OfferNotFound => "OFFER_NOT_FOUND",
            Self::ContentTypeSlugConflict => "CONTENT_TYPE_SLUG_CONFLICT",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::WebhookReplay => "WEBHOOK_REPLAY",
            Self::ContentTypeInUse => "CONTENT_TYPE_IN_USE",
            Self::AuthMissingApiKey => "AUTH_MISSING_API_KEY",
            Self::AuthInvalidApiKey => "AUTH_INVALID_API_KEY",
            Self::AuthInsufficientScope => "AUTH_INSUFFICIENT_SCOPE",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::PaymentInvalidToken => "PAYMENT_INVALID_TOKEN",
            Self::PaymentExpired => "PAYMENT_EXPIRED",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::EntitlementExhausted => "ENTITLEMENT_EXHAUSTED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidRequest
            | Self::EmptyUpdateBody
            | Self::InvalidContentSchemaJson
            | Self::InvalidCreatedAfter
            | Self::InvalidCreatedBefore => StatusCode::BAD_REQUEST,
            Self::ContentSchemaValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ContentTypeNotFound
            | Self::ContentItemNotFound
            | Self::TargetVersionNotFound
            | Self::WorkflowNotFound
            | Self::WebhookNotFound
            | Self::ApiKeyNotFound
            | Self::PaymentNotFound
            | Self::EntitlementNotFound
            | Self::OfferNotFound => StatusCode::NOT_FOUND,
            Self::ContentTypeSlugConflict
            | Self::VersionConflict
            | Self::WebhookReplay
            | Self::ContentTypeInUse => StatusCode::CONFLICT,
            Self::AuthMissingApiKey | Self::AuthInvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::AuthInsufficientScope => StatusCode::FORBIDDEN,
            Self::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Self::PaymentInvalidToken | Self::PaymentExpired => StatusCode::PAYMENT_REQUIRED,
            Self::PaymentFailed | Self::EntitlementExhausted => StatusCode::PAYMENT_REQUIRED,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Default remediation hint surfaced to automated callers.
    pub const fn default_remediation(self) -> &'static str {
        match self {
            Self::InvalidRequest => "Fix the request payload and retry.",
            Self::EmptyUpdateBody => "Provide at least one field to update.",
            Self::InvalidContentSchemaJson => {
                "Supply a schema that parses as a JSON object before retrying."
            }
            Self::ContentSchemaValidationFailed => {
                "Correct the data fields listed in the violation details and retry."
            }
            Self::InvalidCreatedAfter | Self::InvalidCreatedBefore => {
                "Use an RFC 3339 timestamp for the date filter."
            }
            Self::ContentTypeNotFound
            | Self::ContentItemNotFound
            | Self::WorkflowNotFound
            | Self::WebhookNotFound
            | Self::ApiKeyNotFound
            | Self::PaymentNotFound
            | Self::EntitlementNotFound
            | Self::OfferNotFound => "Check the identifier and retry, or list resources first.",
            Self::TargetVersionNotFound => {
                "List the item's versions and pick an existing version number."
            }
            Self::ContentTypeSlugConflict => "Pick a slug not already used in this tenant.",
            Self::VersionConflict => "Re-read the item and retry the update against its head.",
            Self::WebhookReplay => "Event already processed; no action required.",
            Self::ContentTypeInUse => "Delete or reassign the items referencing this type first.",
            Self::AuthMissingApiKey => "Send an API key via the Authorization header.",
            Self::AuthInvalidApiKey => "Use a valid, unrevoked, unexpired API key.",
            Self::AuthInsufficientScope => "Use a key granted the scope for this operation.",
            Self::PaymentRequired => {
                "Pay the invoice, then retry with Authorization: L402 <token>:<preimage>."
            }
            Self::PaymentInvalidToken => "Request a fresh challenge and pay the new invoice.",
            Self::PaymentExpired => "The invoice expired; request a fresh challenge.",
            Self::PaymentFailed => "The payment failed; request a fresh challenge.",
            Self::EntitlementExhausted => "Purchase a new entitlement for this offer.",
            Self::RateLimitExceeded => "Slow down and retry after the window resets.",
            Self::InternalError => "Retry later; contact the operator if the error persists.",
            Self::DependencyUnavailable => "A backing dependency is down; retry later.",
        }
    }
}

/// Guidance block attached to envelopes so agent callers can plan their
/// next call without heuristics.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_next_action: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub available_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_priority: Option<String>,
}

impl EnvelopeMeta {
    pub fn next(action: impl Into<String>) -> Self {
        Self {
            recommended_next_action: Some(action.into()),
            ..Self::default()
        }
    }
}

/// Uniform API error. Carries everything needed to render the error
/// envelope; the request pipeline stamps `context.requestId` on the way out.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub remediation: String,
    pub details: Option<Value>,
    pub meta: Option<EnvelopeMeta>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.default_status(),
            code,
            message: message.into(),
            remediation: code.default_remediation().to_string(),
            details: None,
            meta: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = remediation.into();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_meta(mut self, meta: EnvelopeMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn body(&self, request_id: Option<&str>) -> Value {
        let mut body = serde_json::json!({
            "error": self.message,
            "code": self.code.as_str(),
            "remediation": self.remediation,
            "context": {},
        });
        if let Some(request_id) = request_id {
            body["context"]["requestId"] = Value::String(request_id.to_string());
        }
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        if let Some(meta) = &self.meta {
            if let Ok(meta) = serde_json::to_value(meta) {
                body["meta"] = meta;
            }
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = self.body(None);
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct DataEnvelope<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<EnvelopeMeta>,
}

pub fn ok_data<T: Serialize>(data: T) -> (StatusCode, Json<DataEnvelope<T>>) {
    (
        StatusCode::OK,
        Json(DataEnvelope { data, meta: None }),
    )
}

pub fn ok_with_meta<T: Serialize>(
    status: StatusCode,
    data: T,
    meta: EnvelopeMeta,
) -> (StatusCode, Json<DataEnvelope<T>>) {
    (
        status,
        Json(DataEnvelope {
            data,
            meta: Some(meta),
        }),
    )
}

pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<DataEnvelope<T>>) {
    (
        StatusCode::CREATED,
        Json(DataEnvelope { data, meta: None }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_carries_code_remediation_and_request_id() {
        let error = ApiError::new(ErrorCode::ContentTypeSlugConflict, "slug taken");
        let body = error.body(Some("req-123"));
        assert_eq!(body["code"], "CONTENT_TYPE_SLUG_CONFLICT");
        assert_eq!(body["error"], "slug taken");
        assert_eq!(body["context"]["requestId"], "req-123");
        assert!(body["remediation"].as_str().is_some_and(|r| !r.is_empty()));
    }

    #[test]
    fn default_statuses_follow_the_error_family() {
        assert_eq!(
            ErrorCode::ContentSchemaValidationFailed.default_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::VersionConflict.default_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::PaymentRequired.default_status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ErrorCode::RateLimitExceeded.default_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::ContentItemNotFound.default_status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn meta_serializes_in_camel_case_fields() {
        let meta = EnvelopeMeta {
            recommended_next_action: Some("POST /api/v1/content-items".to_string()),
            available_actions: vec!["GET /api/v1/content-types".to_string()],
            action_priority: Some("high".to_string()),
        };
        let value = serde_json::to_value(&meta).expect("serialize meta");
        assert_eq!(value["recommendedNextAction"], "POST /api/v1/content-items");
        assert_eq!(value["availableActions"][0], "GET /api/v1/content-types");
    }
}
