//! Route guard middleware.
//!
//! Unauthenticated requests to protected pages are redirected to the sign-in page and
//! authenticated requests to the sign-in or sign-up pages are sent home. API, docs and
//! static image paths are never guarded.

use crate::auth::identity_from_headers;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    pub protected: Vec<String>,
    pub sign_in: String,
    pub sign_up: String,
    pub home: String,
    pub excluded: Vec<String>,
    pub excluded_extensions: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            protected: vec!["/".into(), "/new".into(), "/chat".into()],
            sign_in: "/login".into(),
            sign_up: "/signup".into(),
            home: "/".into(),
            excluded: vec!["/api".into(), "/swagger-ui".into(), "/api-docs".into()],
            excluded_extensions: vec![".png".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Redirect(String),
}

/// Whether `path` is `prefix` or lies below it. The root prefix only matches itself.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path == "/";
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

pub fn decide(config: &GuardConfig, path: &str, authenticated: bool) -> GuardDecision {
    let excluded = config.excluded.iter().any(|p| matches_prefix(path, p))
        || config
            .excluded_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()));
    if excluded {
        return GuardDecision::Allow;
    }

    let auth_page = path == config.sign_in || path == config.sign_up;
    if auth_page {
        return if authenticated {
            GuardDecision::Redirect(config.home.clone())
        } else {
            GuardDecision::Allow
        };
    }

    let protected = config.protected.iter().any(|p| matches_prefix(path, p));
    if protected && !authenticated {
        return GuardDecision::Redirect(config.sign_in.clone());
    }
    GuardDecision::Allow
}

pub async fn route_guard(
    State(config): State<Arc<GuardConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let authenticated = identity_from_headers(request.headers()).is_some();
    match decide(&config, request.uri().path(), authenticated) {
        GuardDecision::Allow => next.run(request).await,
        GuardDecision::Redirect(location) => {
            debug!(path = %request.uri().path(), %location, authenticated, "Redirecting guarded route");
            Redirect::temporary(&location).into_response()
        }
    }
}
