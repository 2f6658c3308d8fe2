//! Ingress HTTP API: request validation, response envelope, route wiring.
//! Thin by design — handlers call straight into [`Orchestrator`]; no
//! reconciliation logic lives here.

pub mod envelope;
mod handlers;

use std::convert::Infallible;
use std::sync::Arc;

use warp::{Filter, Rejection, Reply};

use crate::orchestrator::Orchestrator;
use crate::types::RequirementSpec;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub model_root: String,
}

#[must_use]
pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    healthz()
        .or(deploy(state.clone()))
        .or(update(state.clone()))
        .or(delete(state.clone()))
        .or(status(state.clone()))
        .or(list_models(state))
}

// GET /healthz
fn healthz() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::get().and(warp::path("healthz")).and(warp::path::end()).map(|| "OK")
}

// POST /api/v1/modserv/deploy
fn deploy(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::post()
        .and(base())
        .and(warp::path("deploy"))
        .and(warp::path::end())
        .and(json_body())
        .and(with_state(state))
        .and_then(handlers::deploy)
}

// PUT /api/v1/modserv/service/:serviceId
fn update(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::put()
        .and(base())
        .and(warp::path("service"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(json_body())
        .and(with_state(state))
        .and_then(handlers::update)
}

// DELETE /api/v1/modserv/:serviceId
fn delete(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::delete()
        .and(base())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_state(state))
        .and_then(handlers::delete)
}

// GET /api/v1/modserv/status/:serviceId
fn status(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::get()
        .and(base())
        .and(warp::path("status"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_state(state))
        .and_then(handlers::status)
}

// GET /api/v1/modserv/list
fn list_models(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::get()
        .and(base())
        .and(warp::path("list"))
        .and(warp::path::end())
        .and(with_state(state))
        .and_then(handlers::list_models)
}

fn base() -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::path("api").and(warp::path("v1")).and(warp::path("modserv"))
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body() -> impl Filter<Extract = (RequirementSpec,), Error = Rejection> + Clone {
    warp::body::content_length_limit(1024 * 1024).and(warp::body::json())
}
