//! Axum router configuration.
//!
//! ```text
//! /{h}/csr                 PUT submit, GET list pending
//! /{h}/csr/{id}            GET request, DELETE reject
//! /{h}/crt/{id}            GET certificate, PUT sign
//! /{h}/crt/renew           PUT renew
//! /{h}/crt/revoke          PUT revoke
//! /{h}/crt/ca.crt.pem      GET active CA
//! /{h}/crt/ca.crt.json     GET trusted CA chain
//! /{h}/crl                 GET revocation list
//! ```
//!
//! `{h}` is `cas` (service) or `cau` (user).

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use caucase_ca::Authorities;

use crate::handlers;

/// Default request body limit.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    authorities: Authorities,
}

impl ApiState {
    /// State serving `authorities`.
    pub fn new(authorities: Authorities) -> Self {
        Self { authorities }
    }

    /// Both issuance authorities.
    pub fn authorities(&self) -> &Authorities {
        &self.authorities
    }
}

/// Builds the complete router.
///
/// Bodies over `max_body_bytes` are refused with 413.
pub fn build_router(state: ApiState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/{h}/csr", put(handlers::submit_csr).get(handlers::list_pending))
        .route("/{h}/csr/{id}", get(handlers::get_csr).delete(handlers::reject_csr))
        .route("/{h}/crt/renew", put(handlers::renew))
        .route("/{h}/crt/revoke", put(handlers::revoke))
        .route("/{h}/crt/ca.crt.pem", get(handlers::ca_certificate))
        .route("/{h}/crt/ca.crt.json", get(handlers::ca_chain))
        .route("/{h}/crt/{id}", get(handlers::get_certificate).put(handlers::sign_csr))
        .route("/{h}/crl", get(handlers::crl))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
