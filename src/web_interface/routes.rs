use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

use super::auth::{expired_cookie, session_cookie, with_token, with_user};
use super::types::*;
use super::AppState;
use crate::error_handling::types::{AuthError, SessionError};
use crate::session_management::orchestrator::BulkInitReport;
use crate::session_management::InitOutcome;
use crate::storage::types::{NewProfile, NewSettings, ProfileId, ProfileUpdate, SettingsUpdate, UserId};

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    reply::with_status(reply::json(body), status).into_response()
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    json_reply(
        &ApiError {
            message: message.into(),
        },
        status,
    )
}

fn message_reply(message: &str) -> Response {
    json_reply(
        &ApiMessage {
            message: message.to_string(),
        },
        StatusCode::OK,
    )
}

fn with_cookie(response: Response, cookie: String) -> Response {
    reply::with_header(response, "set-cookie", cookie).into_response()
}

pub fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Forbidden => StatusCode::FORBIDDEN,
        SessionError::ValidationError(_)
        | SessionError::NotConnected(_)
        | SessionError::RecipientUnregistered(_) => StatusCode::BAD_REQUEST,
        SessionError::SendFailed(_) | SessionError::InitFailed(_) => StatusCode::BAD_GATEWAY,
        SessionError::PersistenceError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn session_error_reply(err: SessionError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    error_reply(status, err.to_string())
}

fn auth_error_reply(err: AuthError) -> Response {
    let status = match err {
        AuthError::MissingFields | AuthError::UsernameTaken => StatusCode::BAD_REQUEST,
        AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        AuthError::HashingFailed(_) | AuthError::Storage(_) => {
            error!("Authentication failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_reply(status, err.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Rejects `label` when empty or already used by another of the user's
/// profiles.
fn check_label(
    state: &AppState,
    label: &str,
    user: UserId,
    except: Option<ProfileId>,
) -> Result<(), SessionError> {
    if label.is_empty() {
        return Err(SessionError::ValidationError("Label is required".to_string()));
    }
    match state.storage.get_profile_by_label(label, user)? {
        Some(existing) if Some(existing.id) != except => Err(SessionError::ValidationError(
            format!("A profile with label '{}' already exists", label),
        )),
        _ => Ok(()),
    }
}

/// POST /api/register
pub fn register_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "register")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |body: CredentialsRequest| {
            let state = state.clone();
            async move {
                let auth = state.auth.clone();
                let storage = state.storage.clone();
                let result = tokio::task::spawn_blocking(move || {
                    auth.register(storage.as_ref(), &body.username, &body.password)
                })
                .await
                .unwrap_or_else(|e| Err(AuthError::HashingFailed(e.to_string())));

                let res = match result {
                    Ok((user, token)) => with_cookie(
                        json_reply(&UserResponse::from(&user), StatusCode::CREATED),
                        session_cookie(&token),
                    ),
                    Err(e) => auth_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /api/login
pub fn login_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "login")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |body: CredentialsRequest| {
            let state = state.clone();
            async move {
                let auth = state.auth.clone();
                let storage = state.storage.clone();
                let result = tokio::task::spawn_blocking(move || {
                    auth.login(storage.as_ref(), &body.username, &body.password)
                })
                .await
                .unwrap_or_else(|e| Err(AuthError::HashingFailed(e.to_string())));

                let res = match result {
                    Ok((user, token)) => with_cookie(
                        json_reply(&UserResponse::from(&user), StatusCode::OK),
                        session_cookie(&token),
                    ),
                    Err(e) => auth_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /api/logout
pub fn logout_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "logout")
        .and(warp::post())
        .and(with_token())
        .and_then(move |token: Option<String>| {
            let state = state.clone();
            async move {
                if let Some(token) = token {
                    state.auth.logout(&token);
                }
                Ok::<_, Rejection>(with_cookie(message_reply("Logged out"), expired_cookie()))
            }
        })
}

/// GET /api/user
pub fn current_user_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "user")
        .and(warp::get())
        .and(with_user(state.auth.clone()))
        .and_then(move |user: UserId| {
            let state = state.clone();
            async move {
                let res = match state.storage.get_user(user) {
                    Ok(Some(user)) => json_reply(&UserResponse::from(&user), StatusCode::OK),
                    Ok(None) => error_reply(StatusCode::UNAUTHORIZED, "Authentication required"),
                    Err(e) => session_error_reply(e.into()),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// GET /api/profiles
pub fn list_profiles_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles")
        .and(warp::get())
        .and(with_user(state.auth.clone()))
        .and_then(move |user: UserId| {
            let state = state.clone();
            async move {
                let res = match state.storage.get_profiles(user) {
                    Ok(profiles) => {
                        let enriched: Vec<ProfileResponse> = profiles
                            .into_iter()
                            .map(|profile| ProfileResponse {
                                session_status: state
                                    .orchestrator
                                    .session(profile.id)
                                    .map_or_else(|| "unknown".to_string(), |s| s.status.to_string()),
                                profile,
                            })
                            .collect();
                        json_reply(&enriched, StatusCode::OK)
                    }
                    Err(e) => session_error_reply(e.into()),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /api/profiles
pub fn create_profile_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles")
        .and(warp::post())
        .and(with_user(state.auth.clone()))
        .and(warp::body::json())
        .and_then(move |user: UserId, body: CreateProfileRequest| {
            let state = state.clone();
            async move {
                let label = body.label.trim().to_string();
                let created = check_label(&state, &label, user, None).and_then(|_| {
                    state
                        .storage
                        .create_profile(NewProfile {
                            label,
                            phone: non_empty(body.phone),
                            user_id: user,
                        })
                        .map_err(SessionError::from)
                });
                let res = match created {
                    Ok(profile) => {
                        info!("User {} created profile {} ({})", user, profile.id, profile.label);
                        json_reply(&profile, StatusCode::CREATED)
                    }
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// PATCH /api/profiles/:id
pub fn update_profile_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles" / ProfileId)
        .and(warp::patch())
        .and(with_user(state.auth.clone()))
        .and(warp::body::json())
        .and_then(move |id: ProfileId, user: UserId, body: ProfileUpdate| {
            let state = state.clone();
            async move {
                let updated = state.orchestrator.authorize(user, id).and_then(|_| {
                    // status and credentials belong to the session engine
                    let update = ProfileUpdate {
                        label: body.label.map(|l| l.trim().to_string()),
                        phone: body.phone,
                        ..Default::default()
                    };
                    if let Some(label) = &update.label {
                        check_label(&state, label, user, Some(id))?;
                    }
                    Ok(state.storage.update_profile(id, update)?)
                });
                let res = match updated {
                    Ok(profile) => json_reply(&profile, StatusCode::OK),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// DELETE /api/profiles/:id
pub fn delete_profile_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles" / ProfileId)
        .and(warp::delete())
        .and(with_user(state.auth.clone()))
        .and_then(move |id: ProfileId, user: UserId| {
            let state = state.clone();
            async move {
                let result = match state.orchestrator.authorize(user, id) {
                    Ok(_) => state.orchestrator.delete_profile(id).await,
                    Err(e) => Err(e),
                };
                let res = match result {
                    Ok(()) => reply::with_status(warp::reply(), StatusCode::NO_CONTENT).into_response(),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /api/profiles/:id/connect
pub fn connect_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles" / ProfileId / "connect")
        .and(warp::post())
        .and(with_user(state.auth.clone()))
        .and_then(move |id: ProfileId, user: UserId| {
            let state = state.clone();
            async move {
                let result = match state.orchestrator.authorize(user, id) {
                    Ok(profile) => state.orchestrator.initialize(&profile).await,
                    Err(e) => Err(e),
                };
                let res = match result {
                    Ok(InitOutcome::AlreadyInProgress) => json_reply(
                        &InitResponse {
                            message: "WhatsApp client already running".to_string(),
                            qr_code: state.orchestrator.session(id).and_then(|s| s.qr_code),
                        },
                        StatusCode::OK,
                    ),
                    Ok(InitOutcome::Started { qr_code }) => json_reply(
                        &InitResponse {
                            message: "Initializing WhatsApp client".to_string(),
                            qr_code,
                        },
                        StatusCode::OK,
                    ),
                    Ok(InitOutcome::Superseded) => message_reply("Initializing WhatsApp client"),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /api/profiles/:id/reconnect
pub fn reconnect_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles" / ProfileId / "reconnect")
        .and(warp::post())
        .and(with_user(state.auth.clone()))
        .and_then(move |id: ProfileId, user: UserId| {
            let state = state.clone();
            async move {
                let result = match state.orchestrator.authorize(user, id) {
                    Ok(_) => state.orchestrator.reconnect(id).await,
                    Err(e) => Err(e),
                };
                let res = match result {
                    Ok(outcome) => json_reply(
                        &InitResponse {
                            message: "Reconnecting WhatsApp client".to_string(),
                            qr_code: match outcome {
                                InitOutcome::Started { qr_code } => qr_code,
                                _ => None,
                            },
                        },
                        StatusCode::OK,
                    ),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// POST /api/profiles/:id/send
pub fn send_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles" / ProfileId / "send")
        .and(warp::post())
        .and(with_user(state.auth.clone()))
        .and(warp::body::json())
        .and_then(move |id: ProfileId, user: UserId, body: SendRequest| {
            let state = state.clone();
            async move {
                if let Err(e) = state.orchestrator.authorize(user, id) {
                    return Ok::<_, Rejection>(session_error_reply(e));
                }
                let (Some(to), Some(message)) = (non_empty(body.to), non_empty(body.message)) else {
                    return Ok(error_reply(
                        StatusCode::BAD_REQUEST,
                        "Missing required fields: to, message",
                    ));
                };
                Ok(send_and_reply(&state, id, to, message).await)
            }
        })
}

async fn send_and_reply(state: &AppState, id: ProfileId, to: String, message: String) -> Response {
    match state.orchestrator.send_message(id, &to, &message).await {
        Ok(receipt) => json_reply(
            &SendResponse {
                success: true,
                message_id: receipt.message_id,
                to,
                message,
            },
            StatusCode::OK,
        ),
        Err(e) => session_error_reply(e),
    }
}

/// POST /api/send-message
pub fn send_by_label_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "send-message")
        .and(warp::post())
        .and(with_user(state.auth.clone()))
        .and(warp::body::json())
        .and_then(move |user: UserId, body: SendByLabelRequest| {
            let state = state.clone();
            async move {
                let (Some(label), Some(to), Some(message)) = (
                    non_empty(body.profile_label),
                    non_empty(body.to),
                    non_empty(body.message),
                ) else {
                    return Ok::<_, Rejection>(error_reply(
                        StatusCode::BAD_REQUEST,
                        "Missing required fields: profileLabel, to, message",
                    ));
                };
                let res = match state.storage.get_profile_by_label(label.trim(), user) {
                    Ok(Some(profile)) => send_and_reply(&state, profile.id, to, message).await,
                    Ok(None) => error_reply(StatusCode::NOT_FOUND, "Profile not found"),
                    Err(e) => session_error_reply(e.into()),
                };
                Ok(res)
            }
        })
}

/// POST /api/profiles/:id/send-bulk
pub fn send_bulk_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "profiles" / ProfileId / "send-bulk")
        .and(warp::post())
        .and(with_user(state.auth.clone()))
        .and(warp::body::json())
        .and_then(move |id: ProfileId, user: UserId, body: BulkSendRequest| {
            let state = state.clone();
            async move {
                let result = match state.orchestrator.authorize(user, id) {
                    Ok(_) => {
                        let delay = Duration::from_secs(body.delay_secs.unwrap_or(0));
                        state
                            .orchestrator
                            .send_bulk(id, &body.messages, body.template.as_deref(), delay)
                            .await
                    }
                    Err(e) => Err(e),
                };
                let res = match result {
                    Ok(report) => json_reply(&report, StatusCode::OK),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// GET /api/sessions
pub fn list_sessions_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions")
        .and(warp::get())
        .and(with_user(state.auth.clone()))
        .and_then(move |user: UserId| {
            let state = state.clone();
            async move {
                let res = match state.orchestrator.sessions_for(user) {
                    Ok(sessions) => json_reply(&sessions, StatusCode::OK),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// GET /api/settings
pub fn get_settings_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "settings")
        .and(warp::get())
        .and(with_user(state.auth.clone()))
        .and_then(move |user: UserId| {
            let state = state.clone();
            async move {
                let settings = match state.storage.get_settings(user) {
                    Ok(Some(settings)) => Ok(settings),
                    Ok(None) => {
                        info!("Creating default settings for user {}", user);
                        state.storage.create_settings(NewSettings::defaults_for(user))
                    }
                    Err(e) => Err(e),
                };
                let res = match settings {
                    Ok(settings) => json_reply(&SettingsResponse::from(settings), StatusCode::OK),
                    Err(e) => session_error_reply(e.into()),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

/// PATCH /api/settings/:id
pub fn update_settings_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "settings" / u64)
        .and(warp::patch())
        .and(with_user(state.auth.clone()))
        .and(warp::body::json())
        .and_then(move |id: u64, user: UserId, body: SettingsUpdate| {
            let state = state.clone();
            async move {
                let res = match state.storage.get_settings(user) {
                    Ok(Some(settings)) if settings.id == id => {
                        match state.storage.update_settings(id, body) {
                            Ok(updated) => json_reply(&SettingsResponse::from(updated), StatusCode::OK),
                            Err(e) => session_error_reply(e.into()),
                        }
                    }
                    Ok(_) => error_reply(StatusCode::NOT_FOUND, "Settings not found"),
                    Err(e) => session_error_reply(e.into()),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

#[derive(Serialize)]
struct InitAllResponse {
    message: String,
    #[serde(flatten)]
    report: BulkInitReport,
}

/// GET /api/initialize-all-profiles
pub fn initialize_all_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "initialize-all-profiles")
        .and(warp::get())
        .and(with_user(state.auth.clone()))
        .and_then(move |user: UserId| {
            let state = state.clone();
            async move {
                let res = match state.orchestrator.initialize_all_saved(user).await {
                    Ok(report) => json_reply(
                        &InitAllResponse {
                            message: "Initializing all saved profiles".to_string(),
                            report,
                        },
                        StatusCode::OK,
                    ),
                    Err(e) => session_error_reply(e),
                };
                Ok::<_, Rejection>(res)
            }
        })
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn html_page(status: StatusCode, title: &str, lines: &[String]) -> Response {
    let body: String = lines
        .iter()
        .map(|line| format!("<p>{}</p>", escape_html(line)))
        .collect();
    let html = format!(
        "<html><head><title>{title}</title></head><body><h1>{title}</h1>{body}</body></html>",
        title = escape_html(title),
        body = body
    );
    reply::with_status(reply::html(html), status).into_response()
}

/// Serves `/send` for the primary account: the first registered user, whose
/// settings hold the optional basic credentials.
async fn send_page(state: &AppState, query: SendQuery) -> Response {
    let (Some(from), Some(to), Some(message)) = (
        non_empty(query.from),
        non_empty(query.to),
        non_empty(query.message),
    ) else {
        return html_page(
            StatusCode::BAD_REQUEST,
            "Error: Missing Parameters",
            &[
                "Required parameters: from, to, message".to_string(),
                "Optional parameters: user, pass (if authentication is enabled)".to_string(),
            ],
        );
    };

    let owner = match state.storage.list_users() {
        Ok(users) => users.into_iter().next(),
        Err(e) => {
            error!("Cannot list users for /send: {}", e);
            return html_page(StatusCode::INTERNAL_SERVER_ERROR, "Error", &[e.to_string()]);
        }
    };
    let Some(owner) = owner else {
        return html_page(
            StatusCode::NOT_FOUND,
            "Profile Not Found",
            &[format!("No profile found with label: {}", from)],
        );
    };

    match state.storage.get_settings(owner.id) {
        Ok(Some(settings)) if settings.requires_credentials() => {
            let accepted = query.user.is_some()
                && query.pass.is_some()
                && query.user == settings.username
                && query.pass == settings.password;
            if !accepted {
                warn!("Rejected /send request with bad credentials");
                return html_page(
                    StatusCode::UNAUTHORIZED,
                    "Authentication Error",
                    &["Invalid username or password".to_string()],
                );
            }
        }
        Ok(_) => {}
        Err(e) => {
            return html_page(StatusCode::INTERNAL_SERVER_ERROR, "Error", &[e.to_string()]);
        }
    }

    let profile = match state.storage.get_profile_by_label(&from, owner.id) {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            return html_page(
                StatusCode::NOT_FOUND,
                "Profile Not Found",
                &[format!("No profile found with label: {}", from)],
            )
        }
        Err(e) => {
            return html_page(StatusCode::INTERNAL_SERVER_ERROR, "Error", &[e.to_string()]);
        }
    };

    match state.orchestrator.send_message(profile.id, &to, &message).await {
        Ok(receipt) => html_page(
            StatusCode::OK,
            "Message Sent Successfully",
            &[
                format!("From: {}", from),
                format!("To: {}", to),
                format!("Message ID: {}", receipt.message_id),
            ],
        ),
        Err(e) => html_page(status_for(&e), "Error Sending Message", &[e.to_string()]),
    }
}

/// GET /send?from&to&message&user&pass
pub fn send_page_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("send")
        .and(warp::get())
        .and(warp::query::<SendQuery>())
        .and_then(move |query: SendQuery| {
            let state = state.clone();
            async move { Ok::<_, Rejection>(send_page(&state, query).await) }
        })
}
