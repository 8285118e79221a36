use axum::extract::State;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::submission::{ContactRequest, ContactResponse};
use crate::routes::ApiError;

/// POST /api/v1/contacts: Record where a user's job notifications go.
/// The first address stored for a user is kept.
pub async fn store_contact(
    State(state): State<AppState>,
    Json(request): Json<ContactRequest>,
) -> Result<Json<ContactResponse>, ApiError> {
    request.validate()?;
    let stored = state.contacts.store(&request.user_id, &request.email).await?;
    let message = if stored {
        "Contact stored"
    } else {
        "Contact already on file"
    };
    Ok(Json(ContactResponse {
        stored,
        message: message.to_string(),
    }))
}
