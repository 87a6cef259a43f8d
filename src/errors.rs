use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
///
/// The domain variants (`InsufficientFunds` through `Conflict`) are expected,
/// user-facing outcomes of ledger and marketplace operations. Callers match on
/// them; they are not logged as failures.
#[derive(Debug)]
pub enum AppError {
    /// Float balance does not cover the fee.
    InsufficientFunds,
    /// Daily request quota is used up.
    QuotaExhausted,
    /// The ticket request was claimed by someone else (or is already completed).
    AlreadyClaimed,
    /// The ticket request passed its deadline.
    RequestExpired,
    /// The agent is not approved (pending, suspended or rejected).
    AgentNotEligible,
    /// The bonus was already claimed.
    AlreadyClaimedBonus,
    /// The bonus passed its expiry.
    BonusExpired,
    /// The assignment response deadline elapsed.
    AssignmentExpired,
    /// The two agents are already linked by a referral.
    ReferralExists,
    /// A status change that the transition table forbids.
    InvalidTransition(String),
    /// Lost a compare-and-swap or serialization race at the store.
    Conflict(String),
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// Internal server error.
    InternalError(String),
    /// Unauthorized access error.
    Unauthorized(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Stable machine-readable code sent alongside the HTTP status.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InsufficientFunds => "insufficient_funds",
            AppError::QuotaExhausted => "quota_exhausted",
            AppError::AlreadyClaimed => "already_claimed",
            AppError::RequestExpired => "request_expired",
            AppError::AgentNotEligible => "agent_not_eligible",
            AppError::AlreadyClaimedBonus => "already_claimed_bonus",
            AppError::BonusExpired => "bonus_expired",
            AppError::AssignmentExpired => "assignment_expired",
            AppError::ReferralExists => "referral_exists",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::Conflict(_) => "conflict",
            AppError::DatabaseError(_) => "database_error",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::ExternalApiError(_) => "external_api_error",
            AppError::InternalError(_) => "internal_error",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::WithContext { source, .. } => source.code(),
        }
    }

    /// Strips any `WithContext` wrappers.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InsufficientFunds => write!(f, "Insufficient float balance"),
            AppError::QuotaExhausted => write!(f, "Daily request quota exhausted"),
            AppError::AlreadyClaimed => write!(f, "Ticket request already claimed"),
            AppError::RequestExpired => write!(f, "Ticket request expired"),
            AppError::AgentNotEligible => write!(f, "Agent is not approved"),
            AppError::AlreadyClaimedBonus => write!(f, "Bonus already claimed"),
            AppError::BonusExpired => write!(f, "Bonus expired"),
            AppError::AssignmentExpired => write!(f, "Assignment response deadline passed"),
            AppError::ReferralExists => write!(f, "Agents are already linked by a referral"),
            AppError::InvalidTransition(msg) => write!(f, "Invalid transition: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    /// Domain outcomes are logged at debug level only.
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_message) = match &self {
            AppError::InsufficientFunds => (StatusCode::PAYMENT_REQUIRED, self.to_string()),
            AppError::QuotaExhausted => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::AlreadyClaimed
            | AppError::RequestExpired
            | AppError::BonusExpired
            | AppError::AssignmentExpired => (StatusCode::GONE, self.to_string()),
            AppError::AgentNotEligible => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::AlreadyClaimedBonus | AppError::ReferralExists => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::InvalidTransition(msg) | AppError::Conflict(msg) => {
                tracing::debug!("Conflict response: {}", msg);
                (StatusCode::CONFLICT, msg.clone())
            }
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

// sqlx::Error is not Clone, so the WithContext variant needs a manual impl
impl Clone for AppError {
    /// Clones the error.
    ///
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` is simplified to
    /// `InternalError` carrying the rendered message.
    fn clone(&self) -> Self {
        match self {
            AppError::InsufficientFunds => AppError::InsufficientFunds,
            AppError::QuotaExhausted => AppError::QuotaExhausted,
            AppError::AlreadyClaimed => AppError::AlreadyClaimed,
            AppError::RequestExpired => AppError::RequestExpired,
            AppError::AgentNotEligible => AppError::AgentNotEligible,
            AppError::AlreadyClaimedBonus => AppError::AlreadyClaimedBonus,
            AppError::BonusExpired => AppError::BonusExpired,
            AppError::AssignmentExpired => AppError::AssignmentExpired,
            AppError::ReferralExists => AppError::ReferralExists,
            AppError::InvalidTransition(msg) => AppError::InvalidTransition(msg.clone()),
            AppError::Conflict(msg) => AppError::Conflict(msg.clone()),
            AppError::DatabaseError(e) => AppError::InternalError(format!("Database error: {}", e)),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::BadRequest(msg) => AppError::BadRequest(msg.clone()),
            AppError::ExternalApiError(msg) => AppError::ExternalApiError(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::Unauthorized(msg) => AppError::Unauthorized(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Converts a `sqlx::Error` into an `AppError`.
    ///
    /// Serialization failures and deadlocks become `Conflict` so the service
    /// layer can retry them once.
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if let Some(code) = db_err.code() {
                match code.as_ref() {
                    "40001" => return AppError::Conflict("serialization failure".to_string()),
                    "40P01" => return AppError::Conflict("deadlock detected".to_string()),
                    _ => {}
                }
            }
        }
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    /// Converts a `reqwest::Error` into an `AppError`.
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: f(),
        })
    }
}
