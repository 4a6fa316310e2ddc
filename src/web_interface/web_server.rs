use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use log::{error, info};
use warp::{http::StatusCode, reply, Filter, Rejection, Reply};

use super::auth::Unauthorized;
use super::live_channel::live_route;
use super::routes::*;
use super::types::ApiError;
use super::AppState;
use crate::error_handling::types::WebError;

/// Web server for the HTTP API and the live channel
pub struct WebServer {
    state: AppState,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Every route, with request logging and JSON error bodies.
    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        let state = self.state.clone();

        let account = register_route(state.clone())
            .or(login_route(state.clone()))
            .or(logout_route(state.clone()))
            .or(current_user_route(state.clone()));

        let profiles = list_profiles_route(state.clone())
            .or(create_profile_route(state.clone()))
            .or(update_profile_route(state.clone()))
            .or(delete_profile_route(state.clone()))
            .or(connect_route(state.clone()))
            .or(reconnect_route(state.clone()));

        let messages = send_route(state.clone())
            .or(send_bulk_route(state.clone()))
            .or(send_by_label_route(state.clone()))
            .or(send_page_route(state.clone()));

        let sessions = list_sessions_route(state.clone())
            .or(initialize_all_route(state.clone()))
            .or(get_settings_route(state.clone()))
            .or(update_settings_route(state.clone()))
            .or(live_route(state));

        account
            .or(profiles)
            .or(messages)
            .or(sessions)
            .recover(handle_rejection)
            .with(warp::log("multiwa::http"))
    }

    /// Binds `addr` and returns the bound address with the future serving it.
    pub fn start(
        &self,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), WebError> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_ephemeral(addr)
            .map_err(|e| {
                error!("Failed to bind web server on {}: {}", addr, e);
                WebError::BindFailed(e.to_string())
            })?;
        info!("Web server listening on http://{}", bound);
        Ok((bound, server))
    }
}

/// Turns unmatched or rejected requests into JSON errors.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "Authentication required".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported media type".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };
    Ok(reply::with_status(reply::json(&ApiError { message }), status))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use tempfile::TempDir;
    use warp::http::Response;
    use warp::hyper::body::Bytes;

    use super::*;
    use crate::client_management::mock_client::{wait_for_status, MockClientFactory};
    use crate::client_management::ClientEvent;
    use crate::session_management::{ConnectionOrchestrator, OrchestratorOptions, SessionStatus};
    use crate::storage::types::SettingsUpdate;
    use crate::storage::{FileStorage, Storage};
    use crate::web_interface::{AuthGate, SESSION_COOKIE};

    struct Fixture {
        _dir: TempDir,
        state: AppState,
        factory: MockClientFactory,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()).unwrap());
        let factory = MockClientFactory::new();
        let orchestrator = ConnectionOrchestrator::new(
            storage,
            Arc::new(factory.clone()),
            OrchestratorOptions::default(),
        );
        Fixture {
            _dir: dir,
            state: AppState::new(orchestrator, Arc::new(AuthGate::new())),
            factory,
        }
    }

    fn body(res: &Response<Bytes>) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    fn cookie_of(res: &Response<Bytes>) -> String {
        let header = res.headers()["set-cookie"].to_str().unwrap();
        header.split(';').next().unwrap().to_string()
    }

    async fn register(fx: &Fixture, username: &str) -> String {
        let res = warp::test::request()
            .method("POST")
            .path("/api/register")
            .json(&json!({"username": username, "password": "pw"}))
            .reply(&WebServer::new(fx.state.clone()).routes())
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        cookie_of(&res)
    }

    async fn call(fx: &Fixture, cookie: &str, method: &str, path: &str, body: Option<Value>) -> Response<Bytes> {
        let mut req = warp::test::request()
            .method(method)
            .path(path)
            .header("cookie", cookie);
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.reply(&WebServer::new(fx.state.clone()).routes()).await
    }

    async fn create_profile(fx: &Fixture, cookie: &str, label: &str) -> u64 {
        let res = call(fx, cookie, "POST", "/api/profiles", Some(json!({"label": label}))).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        body(&res)["id"].as_u64().unwrap()
    }

    async fn connect(fx: &Fixture, cookie: &str, id: u64) {
        let res = call(fx, cookie, "POST", &format!("/api/profiles/{}/connect", id), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        fx.factory.emit(id, ClientEvent::Authenticated);
        fx.factory.emit(id, ClientEvent::Ready);
        wait_for_status(&fx.state.orchestrator, id, SessionStatus::Connected).await;
    }

    #[tokio::test]
    async fn api_requires_login() {
        let fx = fixture();
        let routes = WebServer::new(fx.state.clone()).routes();

        let res = warp::test::request().path("/api/profiles").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res)["message"], "Authentication required");

        let res = warp::test::request().path("/api/nowhere").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_login_and_logout() {
        let fx = fixture();
        let cookie = register(&fx, "alice").await;
        assert!(cookie.starts_with(SESSION_COOKIE));

        let res = call(&fx, &cookie, "GET", "/api/user", None).await;
        assert_eq!(body(&res)["username"], "alice");
        assert!(body(&res).get("password").is_none());

        let routes = WebServer::new(fx.state.clone()).routes();
        let res = warp::test::request()
            .method("POST")
            .path("/api/register")
            .json(&json!({"username": "alice", "password": "x"}))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("POST")
            .path("/api/login")
            .json(&json!({"username": "alice", "password": "wrong"}))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        call(&fx, &cookie, "POST", "/api/logout", None).await;
        let res = call(&fx, &cookie, "GET", "/api/user", None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn profile_crud_is_scoped_to_owner() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        let bob = register(&fx, "bob").await;

        let id = create_profile(&fx, &alice, "Work").await;
        let res = call(&fx, &alice, "POST", "/api/profiles", Some(json!({"label": "Work"}))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let res = call(&fx, &alice, "POST", "/api/profiles", Some(json!({"label": "  "}))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        // labels are unique per user only
        create_profile(&fx, &bob, "Work").await;

        let res = call(&fx, &alice, "GET", "/api/profiles", None).await;
        let list = body(&res);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["sessionStatus"], "unknown");
        assert_eq!(list[0]["status"], "disconnected");

        let path = format!("/api/profiles/{}", id);
        let res = call(&fx, &bob, "PATCH", &path, Some(json!({"label": "Mine"}))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let res = call(
            &fx,
            &alice,
            "PATCH",
            &path,
            Some(json!({"label": "Office", "phone": "+49 1", "status": "connected"})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res)["label"], "Office");
        assert_eq!(body(&res)["status"], "disconnected");

        let res = call(&fx, &bob, "DELETE", &path, None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let res = call(&fx, &alice, "DELETE", &path, None).await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let res = call(&fx, &alice, "DELETE", &path, None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn connect_reports_running_client() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        let id = create_profile(&fx, &alice, "Work").await;
        let path = format!("/api/profiles/{}/connect", id);

        let res = call(&fx, &alice, "POST", &path, None).await;
        assert_eq!(body(&res)["message"], "Initializing WhatsApp client");
        fx.factory.emit(id, ClientEvent::Qr("qr-data".into()));
        wait_for_status(&fx.state.orchestrator, id, SessionStatus::QrReady).await;

        let res = call(&fx, &alice, "POST", &path, None).await;
        assert_eq!(body(&res)["message"], "WhatsApp client already running");
        assert_eq!(body(&res)["qrCode"], "qr-data");
        assert_eq!(fx.factory.created_count(), 1);

        let res = call(&fx, &alice, "GET", "/api/sessions", None).await;
        assert_eq!(body(&res)[0]["status"], "qr_ready");

        let res = call(&fx, &alice, "POST", &format!("/api/profiles/{}/reconnect", id), None).await;
        assert_eq!(body(&res)["message"], "Reconnecting WhatsApp client");
        assert_eq!(fx.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn send_validates_and_maps_errors() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        let id = create_profile(&fx, &alice, "Work").await;
        let path = format!("/api/profiles/{}/send", id);

        let res = call(&fx, &alice, "POST", &path, Some(json!({"to": "123"}))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res)["message"], "Missing required fields: to, message");

        let res = call(&fx, &alice, "POST", &path, Some(json!({"to": "123", "message": "hi"}))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        connect(&fx, &alice, id).await;
        let res = call(&fx, &alice, "POST", &path, Some(json!({"to": "+1 555", "message": "hi"}))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res)["success"], true);
        assert_eq!(body(&res)["to"], "+1 555");

        fx.factory.unregister("1999@c.us");
        let res = call(&fx, &alice, "POST", &path, Some(json!({"to": "1999", "message": "hi"}))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res)["message"], "The number 1999 is not registered on WhatsApp");

        fx.factory.fail_send("network down");
        let res = call(&fx, &alice, "POST", &path, Some(json!({"to": "1555", "message": "hi"}))).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

        let res = call(
            &fx,
            &alice,
            "POST",
            "/api/send-message",
            Some(json!({"profileLabel": "Nope", "to": "1", "message": "hi"})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bulk_send_reports_each_row() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        let id = create_profile(&fx, &alice, "Work").await;
        connect(&fx, &alice, id).await;
        fx.factory.unregister("2@c.us");

        let res = call(
            &fx,
            &alice,
            "POST",
            &format!("/api/profiles/{}/send-bulk", id),
            Some(json!({
                "template": "Hi {name}",
                "messages": [
                    {"to": "1", "variables": {"name": "Ann"}},
                    {"to": "2", "variables": {"name": "Bo"}}
                ]
            })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let report = body(&res);
        assert_eq!(report["sent"], 1);
        assert_eq!(report["failed"], 1);
        assert_eq!(fx.factory.sent()[0].2, "Hi Ann");
    }

    #[tokio::test]
    async fn settings_are_created_on_first_read() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        let bob = register(&fx, "bob").await;

        let res = call(&fx, &alice, "GET", "/api/settings", None).await;
        let settings = body(&res);
        assert_eq!(settings["port"], 85);
        assert_eq!(settings["hasPassword"], false);
        let id = settings["id"].as_u64().unwrap();

        let path = format!("/api/settings/{}", id);
        let res = call(&fx, &bob, "PATCH", &path, Some(json!({"port": 90}))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&res)["message"], "Settings not found");

        let res = call(&fx, &alice, "PATCH", &path, Some(json!({"password": "secret"}))).await;
        assert_eq!(body(&res)["hasPassword"], true);
        assert!(body(&res).get("password").is_none());
    }

    #[tokio::test]
    async fn send_page_checks_credentials_and_escapes() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        let id = create_profile(&fx, &alice, "Work").await;
        let routes = WebServer::new(fx.state.clone()).routes();

        let res = warp::test::request().path("/send?from=Work").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .path("/send?from=Work&to=1&message=hi")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        call(&fx, &alice, "GET", "/api/settings", None).await;
        let owner = fx.state.storage.get_user_by_username("alice").unwrap().unwrap();
        let settings = fx.state.storage.get_settings(owner.id).unwrap().unwrap();
        fx.state
            .storage
            .update_settings(
                settings.id,
                SettingsUpdate {
                    username: Some(Some("api".into())),
                    password: Some(Some("key".into())),
                    ..Default::default()
                },
            )
            .unwrap();

        let res = warp::test::request()
            .path("/send?from=Work&to=1&message=hi&user=api&pass=bad")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = warp::test::request()
            .path("/send?from=%3Cb%3E&to=1&message=hi&user=api&pass=key")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let html = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(html.contains("&lt;b&gt;"));
        assert!(!html.contains("<b>"));

        connect(&fx, &alice, id).await;
        let res = warp::test::request()
            .path("/send?from=Work&to=1&message=hi&user=api&pass=key")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(fx.factory.sent().len(), 1);
    }

    #[tokio::test]
    async fn initialize_all_reports_counts() {
        let fx = fixture();
        let alice = register(&fx, "alice").await;
        create_profile(&fx, &alice, "Work").await;

        let res = call(&fx, &alice, "GET", "/api/initialize-all-profiles", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res)["message"], "Initializing all saved profiles");
        assert_eq!(body(&res)["attempted"], 0);
        assert_eq!(body(&res)["skipped"], 1);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let fx = fixture();
        let server = WebServer::new(fx.state.clone());
        let (addr, _serve) = server.start(([127, 0, 0, 1], 0).into()).unwrap();
        assert_ne!(addr.port(), 0);
    }
}
