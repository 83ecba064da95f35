use axum::{
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Extension,
};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, Role};

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub name: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Serialize)]
struct AuthError {
    success: bool,
    message: String,
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(AuthError {
        success: false,
        message: message.to_string(),
    })).into_response()
}

/// Staff registration, rate changes and deletions are reserved for admins.
pub fn require_admin(caller: &CallerIdentity) -> Result<(), Response> {
    if caller.is_admin() {
        return Ok(());
    }
    tracing::warn!(caller = %caller.name, "Administrative request denied");
    Err(reject(StatusCode::FORBIDDEN, "Admin role required"))
}

pub async fn auth_middleware<B>(
    Extension(config): Extension<std::sync::Arc<AuthConfig>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !config.enabled {
        req.extensions_mut().insert(CallerIdentity {
            name: "anonymous".to_string(),
            role: Role::Admin,
        });
        return next.run(req).await;
    }

    let api_key = req.headers()
        .get("X-API-Key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    let Some(key) = api_key else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "Missing API key. Provide X-API-Key header or Authorization: Bearer <key>",
        );
    };

    match config.api_keys.iter().find(|entry| entry.key.as_bytes().ct_eq(key.as_bytes()).into()) {
        Some(entry) => {
            tracing::debug!(caller = %entry.name, role = ?entry.role, "Authenticated request");
            req.extensions_mut().insert(CallerIdentity {
                name: entry.name.clone(),
                role: entry.role,
            });
            next.run(req).await
        }
        None => {
            tracing::warn!("Invalid API key presented");
            reject(StatusCode::UNAUTHORIZED, "Invalid API key")
        }
    }
}
