use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod health;
pub mod mobile;
pub mod thirdparty;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    let mobile_routes = Router::new()
        .route(
            "/device",
            post(mobile::register_device)
                .get(mobile::get_device)
                .patch(mobile::update_device),
        )
        .route("/user/code", get(mobile::get_user_code))
        .route("/user/password", patch(mobile::change_password))
        .route(
            "/messages",
            get(mobile::get_messages).patch(mobile::update_messages),
        )
        .route(
            "/webhooks",
            get(mobile::get_webhooks).post(mobile::create_webhook),
        )
        .route("/settings", get(mobile::get_settings))
        .route("/events", get(mobile::events_stream));

    let thirdparty_routes = Router::new()
        .route(
            "/messages",
            post(thirdparty::enqueue_message).get(thirdparty::list_messages),
        )
        .route("/messages/inbox/export", post(thirdparty::export_inbox))
        .route("/messages/:id", get(thirdparty::get_message))
        .route(
            "/webhooks",
            get(thirdparty::list_webhooks).post(thirdparty::register_webhook),
        )
        .route("/webhooks/:id", delete(thirdparty::delete_webhook))
        .route("/devices", get(thirdparty::list_devices))
        .route("/devices/:id", delete(thirdparty::delete_device))
        .route(
            "/settings",
            get(thirdparty::get_settings)
                .patch(thirdparty::patch_settings)
                .put(thirdparty::put_settings),
        )
        .route("/auth/token", post(thirdparty::issue_token))
        .route("/auth/token/refresh", post(thirdparty::refresh_token))
        .route("/auth/token/:jti", delete(thirdparty::revoke_token));

    let health_routes = Router::new()
        .route("/live", get(health::live))
        .route("/ready", get(health::ready))
        .route("/startup", get(health::startup));

    Router::new()
        .nest("/mobile/v1", mobile_routes)
        .nest("/3rdparty/v1", thirdparty_routes)
        .nest("/health", health_routes)
        .with_state(state)
        .layer(cors)
}
