use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::auth;
use crate::debrid::DebridError;
use crate::models::SettingsDocument;
use crate::state::AppState;
use crate::ui;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/change_password", post(change_password))
        .route("/", get(index_page))
        .route("/api/feeds", get(api_feeds_list).post(api_feeds_add))
        .route("/api/feeds/{index}", delete(api_feeds_remove))
        .route("/api/settings", get(api_settings_get).post(api_settings_save))
        .route("/api/refresh", post(api_refresh))
        .route("/api/user_info", get(api_user_info))
        .route("/api/unrestrict_link", post(api_unrestrict_link))
        .route("/api/traffic", get(api_traffic))
        .route("/api/traffic_details", get(api_traffic_details))
        .route("/api/get_streaming_links/{id}", get(api_get_streaming_links))
        .route("/api/media_infos/{id}", get(api_media_infos))
        .route("/api/downloads", get(api_downloads))
        .route("/api/delete_download/{id}", delete(api_delete_download))
        .route("/api/torrents", get(api_torrents))
        .route("/api/torrent_info/{id}", get(api_torrent_info))
        .route(
            "/api/instant_availability/{hash}",
            get(api_instant_availability),
        )
        .route("/api/active_count", get(api_active_count))
        .route("/api/available_hosts", get(api_available_hosts))
        .route("/api/add_magnet", post(api_add_magnet))
        .route("/api/select_files/{id}", post(api_select_files))
        .route("/api/delete_torrent/{id}", delete(api_delete_torrent))
        .route("/api/hosts", get(api_hosts))
        .route("/api/hosts_status", get(api_hosts_status))
        .route("/api/user_settings", get(api_user_settings))
        .route("/api/update_user_settings", post(api_update_user_settings))
        .route("/api/avatar", put(api_avatar_put).delete(api_avatar_delete))
        .route("/api/server_time", get(api_server_time))
        .route("/api/server_time_iso", get(api_server_time_iso))
        .route("/api/disable_token", get(api_disable_token))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn login_page(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    if current_user(&jar, &state).is_some() {
        return Ok(Redirect::to("/").into_response());
    }

    let page = ui::render_login_page(query.contains_key("error"));
    Ok(Html(page).into_response())
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login_submit(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, ApiError> {
    if state.auth.verify(&form.username, &form.password).await {
        let token = auth::sign_session_token(&form.username, &state.session.secret);
        let cookie = Cookie::build((auth::SESSION_COOKIE_NAME, token))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::seconds(state.session.max_age_seconds))
            .build();
        let jar = jar.add(cookie);
        return Ok((jar, Redirect::to("/")).into_response());
    }

    // Same redirect for unknown usernames and wrong passwords.
    Ok(Redirect::to("/login?error=1").into_response())
}

async fn logout(jar: CookieJar) -> Result<Response, ApiError> {
    let jar = jar.remove(
        Cookie::build((auth::SESSION_COOKIE_NAME, ""))
            .path("/")
            .max_age(CookieDuration::seconds(0))
            .build(),
    );
    Ok((jar, Redirect::to("/login")).into_response())
}

#[derive(Debug, Deserialize)]
struct ChangePasswordForm {
    new_password: String,
}

async fn change_password(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<ChangePasswordForm>,
) -> Result<Response, ApiError> {
    let Some(username) = current_user(&jar, &state) else {
        return Ok(Redirect::to("/login").into_response());
    };

    let new_password = form.new_password.trim();
    if new_password.is_empty() {
        return Err(ApiError::bad_request("password must not be empty"));
    }
    state.auth.set_password(&username, new_password).await?;
    Ok(Redirect::to("/?password_changed=1").into_response())
}

async fn index_page(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    if current_user(&jar, &state).is_none() {
        return Ok(Redirect::to("/login").into_response());
    }

    let snapshot = state.settings.snapshot().await;
    let seen_count = state.seen.len().await;
    let notice = if query.contains_key("saved") {
        Some("Settings saved.")
    } else if query.contains_key("password_changed") {
        Some("Password changed.")
    } else {
        None
    };
    let page = ui::render_index_page(
        &snapshot.feeds,
        &snapshot.rd_api_key,
        seen_count,
        state.config.poll_interval_seconds,
        notice,
    );
    Ok(Html(page).into_response())
}

#[derive(Debug, Deserialize)]
struct AddFeedRequest {
    url: String,
}

async fn api_feeds_list(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(json!({"feeds": state.settings.feeds().await})))
}

async fn api_feeds_add(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<AddFeedRequest>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;

    let url = request.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("feed url must not be empty"));
    }
    let added = state.settings.add_feed(&url).await?;
    if !added {
        debug!("feed {url} already configured, keeping the existing entry");
    }
    Ok(Json(json!({
        "status": "success",
        "added": added,
        "feeds": state.settings.feeds().await,
    })))
}

async fn api_feeds_remove(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(index): Path<usize>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;

    let removed = state.settings.remove_feed(index).await?;
    if removed.is_none() {
        debug!("remove for out-of-range feed index {index} ignored");
    }
    Ok(Json(json!({
        "status": "success",
        "removed": removed,
        "feeds": state.settings.feeds().await,
    })))
}

async fn api_settings_get(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<SettingsDocument>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(state.settings.snapshot().await))
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    rd_api_key: String,
}

async fn api_settings_save(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    state
        .settings
        .set_rd_api_key(request.rd_api_key.trim())
        .await?;
    Ok(Json(json!({"status": "success"})))
}

async fn api_refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    let summary = state.poller.poll_once().await;
    Ok(Json(json!({"status": "success", "summary": summary})))
}

async fn api_user_info(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.user().await?)))
}

#[derive(Debug, Deserialize)]
struct UnrestrictRequest {
    link: String,
}

async fn api_unrestrict_link(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<UnrestrictRequest>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    let value = state.debrid.unrestrict_link(request.link.trim()).await?;
    Ok(Json(passthrough_value(value)))
}

async fn api_traffic(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.traffic().await?)))
}

async fn api_traffic_details(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.traffic_details().await?,
    )))
}

async fn api_get_streaming_links(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.streaming_transcode(&id).await?,
    )))
}

async fn api_media_infos(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.streaming_media_infos(&id).await?,
    )))
}

async fn api_downloads(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.downloads().await?)))
}

async fn api_delete_download(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.delete_download(&id).await?,
    )))
}

async fn api_torrents(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.torrents().await?)))
}

async fn api_torrent_info(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.torrent_info(&id).await?,
    )))
}

async fn api_instant_availability(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.instant_availability(&hash).await?,
    )))
}

async fn api_active_count(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.active_count().await?)))
}

async fn api_available_hosts(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.available_hosts().await?,
    )))
}

#[derive(Debug, Deserialize)]
struct AddMagnetRequest {
    magnet: String,
}

async fn api_add_magnet(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<AddMagnetRequest>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;

    let magnet = request.magnet.trim();
    if magnet.is_empty() {
        return Err(ApiError::bad_request("magnet must not be empty"));
    }
    let added = state.debrid.add_magnet(magnet).await?;
    Ok(Json(json!({"id": added.id, "uri": added.uri})))
}

#[derive(Debug, Deserialize)]
struct SelectFilesRequest {
    files: Option<String>,
}

async fn api_select_files(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;

    // The body is optional; an empty one selects every file.
    let files = if body.is_empty() {
        "all".to_string()
    } else {
        serde_json::from_slice::<SelectFilesRequest>(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid body: {err}")))?
            .files
            .unwrap_or_else(|| "all".to_string())
    };
    let value = state.debrid.select_files(&id, &files).await?;
    Ok(Json(passthrough_value(value)))
}

async fn api_delete_torrent(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.delete_torrent(&id).await?,
    )))
}

async fn api_hosts(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.hosts().await?)))
}

async fn api_hosts_status(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.hosts_status().await?)))
}

async fn api_user_settings(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.user_settings().await?)))
}

#[derive(Debug, Deserialize)]
struct UpdateUserSettingRequest {
    setting_name: String,
    setting_value: String,
}

async fn api_update_user_settings(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<UpdateUserSettingRequest>,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    let value = state
        .debrid
        .update_user_settings(&request.setting_name, &request.setting_value)
        .await?;
    Ok(Json(passthrough_value(value)))
}

async fn api_avatar_put(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let value = state
        .debrid
        .avatar_upload(body.to_vec(), &content_type)
        .await?;
    Ok(Json(passthrough_value(value)))
}

async fn api_avatar_delete(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.avatar_delete().await?)))
}

async fn api_server_time(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(state.debrid.server_time().await?)))
}

async fn api_server_time_iso(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.server_time_iso().await?,
    )))
}

async fn api_disable_token(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<Json<Value>, ApiError> {
    require_session(&jar, &state)?;
    Ok(Json(passthrough_value(
        state.debrid.disable_access_token().await?,
    )))
}

fn current_user(jar: &CookieJar, state: &AppState) -> Option<String> {
    let token = jar.get(auth::SESSION_COOKIE_NAME)?.value().to_string();
    auth::verify_session_token(&token, &state.session.secret, state.session.max_age_seconds)
}

fn require_session(jar: &CookieJar, state: &AppState) -> Result<String, ApiError> {
    current_user(jar, state)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))
}

/// Upstream 204s surface as `null`; browsers get a small success body
/// instead.
fn passthrough_value(value: Value) -> Value {
    if value.is_null() {
        json!({"status": "success"})
    } else {
        value
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value)
    }
}

impl From<DebridError> for ApiError {
    fn from(err: DebridError) -> Self {
        match &err {
            DebridError::MissingApiKey => Self::bad_request(err.to_string()),
            DebridError::NotFound => Self::not_found(err.to_string()),
            DebridError::AuthExpired => Self::new(
                StatusCode::BAD_GATEWAY,
                "Real-Debrid rejected the access token, check the API key in settings",
            ),
            DebridError::Upstream { .. } => Self::bad_request(err.to_string()),
            DebridError::Unavailable { .. }
            | DebridError::Network(_)
            | DebridError::Decode(_)
            | DebridError::RetriesExhausted { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message.clone(),
            detail: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debrid_errors_map_to_http_statuses() {
        let cases = [
            (DebridError::MissingApiKey, StatusCode::BAD_REQUEST),
            (DebridError::NotFound, StatusCode::NOT_FOUND),
            (DebridError::AuthExpired, StatusCode::BAD_GATEWAY),
            (
                DebridError::Unavailable {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DebridError::Upstream {
                    status: StatusCode::FORBIDDEN,
                    detail: "denied".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            let api_error = ApiError::from(err);
            assert_eq!(api_error.status, expected);
        }
    }

    #[test]
    fn expired_token_errors_point_at_the_settings_page() {
        let api_error = ApiError::from(DebridError::AuthExpired);
        assert_eq!(api_error.status, StatusCode::BAD_GATEWAY);
        assert!(api_error.message.contains("check the API key"));
    }

    #[test]
    fn passthrough_null_becomes_a_success_body() {
        assert_eq!(passthrough_value(Value::Null), json!({"status": "success"}));
        let value = json!({"id": 7});
        assert_eq!(passthrough_value(value.clone()), value);
    }
}
