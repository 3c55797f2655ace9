//! Real Home Assistant transport: REST for state reads and service calls,
//! a WebSocket task for the event subscription, both behind the bounded
//! exponential-backoff reconnect policy of §4.7. Generalizes the teacher
//! repo's REST-only `ApiClient` to the full gateway interface.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::HagError;
use crate::gateway::{EntityState, PlatformGateway, StateChangeHandler, StateChangedEvent};

pub struct HomeAssistantGateway {
    client: Client,
    rest_url: Url,
    ws_url: String,
    token: String,
    max_retries: u32,
    retry_delay_ms: u64,
    connected: AtomicBool,
    subscription: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HomeAssistantGateway {
    pub fn new(
        rest_url: &str,
        ws_url: &str,
        token: String,
        max_retries: u32,
        retry_delay_ms: u64,
        timeout_ms: Option<u64>,
    ) -> Result<Self, HagError> {
        let rest_url = Url::parse(rest_url)
            .map_err(|e| HagError::Configuration(format!("invalid restUrl: {e}")))?;

        let mut builder = Client::builder();
        if let Some(ms) = timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder
            .build()
            .map_err(|e| HagError::Configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            rest_url,
            ws_url: ws_url.to_string(),
            token,
            max_retries,
            retry_delay_ms,
            connected: AtomicBool::new(false),
            subscription: Mutex::new(None),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Exponential backoff bounded by `max_retries`, per §4.7 reconnect policy.
    async fn with_backoff<T, F, Fut>(&self, mut op: F) -> Result<T, HagError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HagError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries => {
                    let delay = self.retry_delay_ms.saturating_mul(1 << attempt.min(10));
                    tracing::warn!(attempt, delay_ms = delay, error = %e, "retrying after gateway failure");
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl PlatformGateway for HomeAssistantGateway {
    async fn connect(&self) -> Result<(), HagError> {
        let url = self
            .rest_url
            .join("/api/")
            .map_err(|e| HagError::Connection(e.to_string()))?;

        self.with_backoff(|| async {
            self.client
                .get(url.clone())
                .header("Authorization", self.auth_header())
                .send()
                .await
                .map_err(|e| HagError::Connection(e.to_string()))
                .and_then(|resp| {
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        Err(HagError::Connection(format!("unexpected status {}", resp.status())))
                    }
                })
        })
        .await?;

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), HagError> {
        if let Some(handle) = self.subscription.lock().await.take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_state(&self, entity_id: &str) -> Result<EntityState, HagError> {
        let url = self
            .rest_url
            .join(&format!("/api/states/{entity_id}"))
            .map_err(|e| HagError::Connection(e.to_string()))?;

        let resp = self
            .client
            .get(url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| HagError::Connection(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(HagError::EntityNotFound(entity_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(HagError::Connection(format!("unexpected status {}", resp.status())));
        }

        let body: Value = resp.json().await.map_err(|e| HagError::Connection(e.to_string()))?;
        let state = body
            .get("state")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let attributes: HashMap<String, Value> = body
            .get("attributes")
            .and_then(|v| v.as_object())
            .map(|obj| obj.clone().into_iter().collect())
            .unwrap_or_default();

        Ok(EntityState { state, attributes })
    }

    async fn subscribe_state_changed(&self, handler: StateChangeHandler) -> Result<(), HagError> {
        let ws_url = self.ws_url.clone();
        let token = self.token.clone();
        let max_retries = self.max_retries;
        let retry_delay_ms = self.retry_delay_ms;

        let join = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match run_subscription(&ws_url, &token, &handler).await {
                    Ok(()) => break,
                    Err(e) => {
                        if attempt >= max_retries {
                            tracing::error!(error = %e, "giving up on Home Assistant event subscription");
                            break;
                        }
                        let delay = retry_delay_ms.saturating_mul(1 << attempt.min(10));
                        tracing::warn!(attempt, delay_ms = delay, error = %e, "reconnecting event subscription");
                        sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                    }
                }
            }
        });

        *self.subscription.lock().await = Some(join);
        Ok(())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HagError> {
        let url = self
            .rest_url
            .join(&format!("/api/services/{domain}/{service}"))
            .map_err(|e| HagError::Connection(e.to_string()))?;

        let resp = self
            .client
            .post(url)
            .header("Authorization", self.auth_header())
            .json(&data)
            .send()
            .await
            .map_err(|e| HagError::ServiceCall(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(HagError::ServiceCall(format!(
                "{domain}.{service} returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Runs one WebSocket connection's authenticate-and-subscribe handshake and
/// then forwards `state_changed` events to `handler` until the socket closes.
async fn run_subscription(
    ws_url: &str,
    token: &str,
    handler: &StateChangeHandler,
) -> Result<(), HagError> {
    let (ws_stream, _) = connect_async(ws_url)
        .await
        .map_err(|e| HagError::Connection(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    // Home Assistant's websocket API requires an auth message before anything
    // else will be accepted; subsequent reconnects must redeliver it.
    use futures_util::SinkExt;
    let auth = serde_json::json!({ "type": "auth", "access_token": token });
    write
        .send(Message::Text(auth.to_string().into()))
        .await
        .map_err(|e| HagError::Connection(e.to_string()))?;

    let subscribe = serde_json::json!({ "id": 1, "type": "subscribe_events", "event_type": "state_changed" });
    write
        .send(Message::Text(subscribe.to_string().into()))
        .await
        .map_err(|e| HagError::Connection(e.to_string()))?;

    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| HagError::Connection(e.to_string()))?;
        let Message::Text(text) = msg else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };

        if value.get("type").and_then(|v| v.as_str()) != Some("event") {
            continue;
        }
        let Some(data) = value.pointer("/event/data") else { continue };
        let Some(entity_id) = data.get("entity_id").and_then(|v| v.as_str()) else { continue };
        let new_state = data
            .pointer("/new_state/state")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let old_state = data
            .pointer("/old_state/state")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        handler(StateChangedEvent { entity_id: entity_id.to_string(), new_state, old_state });
    }

    Ok(())
}
