//! Live status channel over WebSocket.
//!
//! A connected observer first receives the sessions of its own profiles, then
//! one `session-update` per change. It may ask for a reconnect of one of its
//! profiles; anything else it sends is ignored.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use super::auth::{with_token, Unauthorized};
use super::types::{LiveCommand, LiveQuery};
use super::AppState;
use crate::session_management::event_broadcaster::ProfileFilter;
use crate::session_management::ConnectionOrchestrator;
use crate::storage::types::UserId;

/// GET /ws, authenticated by the login cookie, a bearer header or `?token=`.
pub fn live_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let auth = state.auth.clone();
    warp::path("ws")
        .and(warp::path::end())
        .and(with_token())
        .and(warp::query::<LiveQuery>())
        .and_then(move |token: Option<String>, query: LiveQuery| {
            let auth = auth.clone();
            async move {
                token
                    .or(query.token)
                    .and_then(|t| auth.user_for(&t))
                    .ok_or_else(|| warp::reject::custom(Unauthorized))
            }
        })
        .and(warp::ws())
        .map(move |user: UserId, ws: Ws| {
            let orchestrator = state.orchestrator.clone();
            ws.on_upgrade(move |socket| serve_observer(orchestrator, user, socket))
        })
}

async fn serve_observer(orchestrator: ConnectionOrchestrator, user: UserId, socket: WebSocket) {
    let (mut outgoing, mut incoming) = socket.split();

    let scope = orchestrator.clone();
    let filter: ProfileFilter = Arc::new(move |profile_id| scope.owns(user, profile_id));
    let (observer, mut updates) = orchestrator.subscribe(Some(filter));
    info!("Live observer {} connected for user {}", observer, user);

    let forward = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let text = match serde_json::to_string(&update) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not encode live update: {}", e);
                    continue;
                }
            };
            if outgoing.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = outgoing.close().await;
    });

    while let Some(frame) = incoming.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Live observer {} read error: {}", observer, e);
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        let Ok(text) = frame.to_str() else {
            continue;
        };
        match serde_json::from_str::<LiveCommand>(text) {
            Ok(LiveCommand::Reconnect { profile_id }) => {
                if !orchestrator.owns(user, profile_id) {
                    warn!(
                        "Observer {} asked to reconnect profile {} it does not own",
                        observer, profile_id
                    );
                    continue;
                }
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.reconnect(profile_id).await {
                        warn!("Live reconnect of profile {} failed: {}", profile_id, e);
                    }
                });
            }
            Err(e) => debug!("Ignoring live message from observer {}: {}", observer, e),
        }
    }

    orchestrator.unsubscribe(observer);
    forward.abort();
    info!("Live observer {} disconnected", observer);
}
