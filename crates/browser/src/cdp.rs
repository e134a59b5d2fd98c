//! Chrome DevTools Protocol client over WebSocket.
//!
//! One reader task dispatches command responses to their waiting callers and
//! fans events out to subscribers; one writer task owns the socket sink.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::driver::{DriverError, DriverResult};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Listeners = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    event_listeners: Listeners,
    command_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a page target's debugging WebSocket.
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> DriverResult<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            DriverError::Launch(format!("failed to connect to CDP endpoint {}: {}", ws_url, e))
        })?;
        let (mut ws_sink, mut ws_read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let event_listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        let pending_r = pending.clone();
        let listeners_r = event_listeners.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_r.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let mut listeners = listeners_r.lock().await;
                            if let Some(senders) = listeners.get_mut(method) {
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                senders.retain(|tx| !tx.is_closed());
                                for tx in senders.iter() {
                                    let _ = tx.send(params.clone());
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            command_timeout,
            reader_handle,
            writer_handle,
        })
    }

    /// Send a command and wait, bounded, for its result.
    pub async fn send_command(&self, method: &str, params: Value) -> DriverResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(DriverError::Closed);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(err) => Err(DriverError::Protocol(format!("{} failed: {}", method, err))),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(DriverError::Timeout {
                    what: format!("CDP command {}", method),
                    after: self.command_timeout,
                })
            }
        }
    }

    /// Subscribe to a CDP event; the receiver gets each event's params.
    /// Events queue until read, so a busy subscriber loses nothing.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> DriverResult<()> {
        self.send_command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    /// Start navigation. Fails when the browser reports a load error.
    pub async fn navigate(&self, url: &str) -> DriverResult<()> {
        let result = self.send_command("Page.navigate", json!({ "url": url })).await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(DriverError::Navigation(format!("{}: {}", url, err)));
        }
        Ok(())
    }

    /// Evaluate an expression in the page and return its JSON value.
    pub async fn evaluate(&self, expression: &str) -> DriverResult<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("script exception");
            return Err(DriverError::Protocol(text.to_string()));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    /// Insert text into the focused element, bypassing key events.
    pub async fn insert_text(&self, text: &str) -> DriverResult<()> {
        self.send_command("Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }

    pub async fn get_cookies(&self) -> DriverResult<Vec<Value>> {
        let result = self.send_command("Network.getCookies", json!({})).await?;
        Ok(result
            .get("cookies")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn set_cookies(&self, cookies: Vec<Value>) -> DriverResult<()> {
        self.send_command("Network.setCookies", json!({ "cookies": cookies })).await?;
        Ok(())
    }

    pub async fn close_browser(&self) -> DriverResult<()> {
        self.send_command("Browser.close", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn test_slow_subscriber_gets_every_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            go_rx.await.unwrap();
            for i in 0..300 {
                let event = json!({
                    "method": "Network.requestWillBeSent",
                    "params": { "request": { "url": format!("https://cdn.example/{}", i), "headers": {} } }
                });
                ws.send(Message::Text(event.to_string())).await.unwrap();
            }
            // Keep the socket open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let client = CdpClient::connect(&format!("ws://{}", addr), Duration::from_secs(5))
            .await
            .unwrap();
        let mut events = client.subscribe_event("Network.requestWillBeSent").await;
        go_tx.send(()).unwrap();

        // Busy subscriber: nothing is read while the burst arrives.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut received = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            received += 1;
            if received == 300 {
                break;
            }
        }
        assert_eq!(received, 300);

        drop(client);
        server.abort();
    }
}
