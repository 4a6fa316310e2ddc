//! Child-process automation client.
//!
//! Each profile gets its own bridge process (a small Node.js wrapper around the
//! WhatsApp Web automation library). The bridge speaks newline-delimited JSON:
//!
//! ```text
//! -> {"id":1,"op":"initialize"}
//! -> {"id":2,"op":"sendMessage","chatId":"15551234567@c.us","text":"hi"}
//! <- {"id":1,"ok":true}
//! <- {"id":2,"ok":false,"error":"Evaluation failed"}
//! <- {"event":"qr","data":"2@AbC..."}
//! ```
//!
//! Replies are matched to requests by id; anything carrying an `event` field is
//! forwarded on the client's event channel. If the process exits without
//! being asked to, a `disconnected` event is emitted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::client_management::types::{ClientEvent, ClientParts, ClientSpec};
use crate::client_management::whatsapp_client::{ClientFactory, WhatsAppClient};
use crate::error_handling::types::ClientError;
use crate::storage::types::ProfileId;

/// How bridge processes are launched.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Parent directory of every profile's credential store.
    pub sessions_dir: PathBuf,
    /// Used when the profile owner has no browser path of their own.
    pub browser_path: Option<String>,
    pub init_timeout: Duration,
    pub request_timeout: Duration,
}

pub struct BridgeFactory {
    config: BridgeConfig,
}

impl BridgeFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for BridgeFactory {
    fn create(&self, spec: ClientSpec) -> Result<ClientParts, ClientError> {
        BridgeClient::spawn(&self.config, spec)
    }
}

#[derive(Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    #[serde(flatten)]
    op: BridgeOp<'a>,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum BridgeOp<'a> {
    Initialize,
    IsRegisteredUser { chat_id: &'a str },
    SendMessage { chat_id: &'a str, text: &'a str },
    Destroy,
}

impl BridgeOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            BridgeOp::Initialize => "initialize",
            BridgeOp::IsRegisteredUser { .. } => "isRegisteredUser",
            BridgeOp::SendMessage { .. } => "sendMessage",
            BridgeOp::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeLine {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

fn parse_event(event: &str, data: Value) -> Option<ClientEvent> {
    let text = match data {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    };
    match event {
        "qr" => Some(ClientEvent::Qr(text)),
        "authenticated" => Some(ClientEvent::Authenticated),
        "ready" => Some(ClientEvent::Ready),
        "auth_failure" => Some(ClientEvent::AuthFailure(text)),
        "disconnected" => Some(ClientEvent::Disconnected(text)),
        _ => None,
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, ClientError>>>;

struct BridgeClient {
    profile_id: ProfileId,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    destroying: Arc<AtomicBool>,
    init_timeout: Duration,
    request_timeout: Duration,
}

fn lock_pending(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeClient {
    fn spawn(config: &BridgeConfig, spec: ClientSpec) -> Result<ClientParts, ClientError> {
        let profile_id = spec.profile_id;
        std::fs::create_dir_all(&config.sessions_dir).map_err(|e| {
            ClientError::SpawnFailed(format!(
                "cannot create sessions directory {}: {}",
                config.sessions_dir.display(),
                e
            ))
        })?;
        let session_dir = config.sessions_dir.join(&spec.session_key);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .env("WA_PROFILE_ID", profile_id.to_string())
            .env("WA_SESSION_DIR", &session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = spec.browser_path.as_ref().or(config.browser_path.as_ref()) {
            cmd.env("WA_BROWSER_PATH", path);
        }

        debug!(
            "Spawning bridge for profile {}: {} {:?}",
            profile_id, config.command, config.args
        );
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn bridge for profile {}: {}", profile_id, e);
            ClientError::SpawnFailed(format!("{}: {}", config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::SpawnFailed("bridge stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::SpawnFailed("bridge stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!("[bridge:{}][stderr] {}", profile_id, line);
                }
                debug!("stderr monitoring ended for bridge of profile {}", profile_id);
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let destroying = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_stdout(
            profile_id,
            stdout,
            Arc::clone(&pending),
            Arc::clone(&destroying),
            events_tx,
        ));

        info!(
            "Bridge for profile {} started (pid {:?})",
            profile_id,
            child.id()
        );

        let client = BridgeClient {
            profile_id,
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            destroying,
            init_timeout: config.init_timeout,
            request_timeout: config.request_timeout,
        };

        Ok(ClientParts {
            client: Arc::new(client),
            events: events_rx,
        })
    }

    async fn request(&self, op: BridgeOp<'_>, timeout: Duration) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = op.name();

        let mut line = serde_json::to_string(&BridgeRequest { id, op })
            .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock_pending(&self.pending).remove(&id);
            debug!(
                "Bridge of profile {} rejected {} request: {}",
                self.profile_id, name, e
            );
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(ClientError::Timeout(format!("{} after {:?}", name, timeout)))
            }
        }
    }
}

async fn read_stdout(
    profile_id: ProfileId,
    stdout: ChildStdout,
    pending: Arc<Mutex<PendingMap>>,
    destroying: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed reading bridge output of profile {}: {}", profile_id, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<BridgeLine>(&line) {
            Ok(BridgeLine::Reply {
                id,
                ok,
                result,
                error,
            }) => {
                let waiter = lock_pending(&pending).remove(&id);
                match waiter {
                    Some(waiter) => {
                        let reply = if ok {
                            Ok(result)
                        } else {
                            Err(ClientError::RequestFailed(
                                error.unwrap_or_else(|| "unknown bridge error".to_string()),
                            ))
                        };
                        let _ = waiter.send(reply);
                    }
                    None => debug!(
                        "Dropping late reply {} from bridge of profile {}",
                        id, profile_id
                    ),
                }
            }
            Ok(BridgeLine::Event { event, data }) => match parse_event(&event, data) {
                Some(event) => {
                    debug!("[bridge:{}] event {:?}", profile_id, event);
                    let _ = events.send(event);
                }
                None => warn!(
                    "Unknown event '{}' from bridge of profile {}",
                    event, profile_id
                ),
            },
            Err(_) => debug!("[bridge:{}][stdout] {}", profile_id, line),
        }
    }

    for (_, waiter) in lock_pending(&pending).drain() {
        let _ = waiter.send(Err(ClientError::Closed));
    }

    if destroying.load(Ordering::SeqCst) {
        debug!("Bridge of profile {} exited after destroy", profile_id);
    } else {
        warn!("Bridge of profile {} exited unexpectedly", profile_id);
        let _ = events.send(ClientEvent::Disconnected(
            "bridge process exited".to_string(),
        ));
    }
}

#[async_trait]
impl WhatsAppClient for BridgeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        self.request(BridgeOp::Initialize, self.init_timeout)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ClientError::RequestFailed(msg) => ClientError::InitFailed(msg),
                other => other,
            })
    }

    async fn is_registered_user(&self, chat_id: &str) -> Result<bool, ClientError> {
        let result = self
            .request(BridgeOp::IsRegisteredUser { chat_id }, self.request_timeout)
            .await?;
        result.as_bool().ok_or_else(|| {
            ClientError::RequestFailed(format!("unexpected isRegisteredUser reply: {}", result))
        })
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        let result = self
            .request(BridgeOp::SendMessage { chat_id, text }, self.request_timeout)
            .await?;
        match result {
            Value::String(id) => Ok(id),
            other => Err(ClientError::RequestFailed(format!(
                "unexpected sendMessage reply: {}",
                other
            ))),
        }
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroying.store(true, Ordering::SeqCst);
        let result = self
            .request(BridgeOp::Destroy, self.request_timeout)
            .await
            .map(|_| ());

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(
                    "Bridge of profile {} already gone on kill: {}",
                    self.profile_id, e
                );
            }
        }
        result
    }
}
