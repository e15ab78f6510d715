//! Request identity.
//!
//! Credentials are issued and verified upstream; the service only reads the user id
//! the identity provider forwards in the `x-user-id` header.

use axum::http::HeaderMap;
use parley_core::Identity;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated identity of a request, if any.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|user_id| !user_id.is_empty())
        .map(Identity::new)
}
