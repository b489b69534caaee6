use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::domain::Contact;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct CreateContactRequest {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct CreateContactResponse {
    pub id: i64,
}

pub async fn list_contacts(State(state): State<AppState>) -> Result<Json<Vec<Contact>>, AppError> {
    let contacts = state.store.list_contacts().await?;
    Ok(Json(contacts))
}

pub async fn create_contact(
    State(state): State<AppState>,
    payload: Result<Json<CreateContactRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateContactResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let id = state
        .store
        .create_contact(&request.name, &request.address)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateContactResponse { id })))
}

pub async fn delete_contact(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<StatusCode, AppError> {
    state.store.delete_contact(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
