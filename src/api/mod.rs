pub mod contacts;
pub mod health;

use crate::db::ContactStore;
use axum::{
    routing::{delete, get},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContactStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route(
            "/contacts",
            get(contacts::list_contacts).post(contacts::create_contact),
        )
        .route("/contacts/:id", delete(contacts::delete_contact))
        .layer(cors)
        .with_state(state)
}
