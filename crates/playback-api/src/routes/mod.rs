pub mod sessions;

use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    sessions::router()
}
