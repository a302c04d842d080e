//! Client-side request dispatcher.
//!
//! One [`RpcClient`] per transport. It allocates monotonically increasing
//! integer ids, registers a oneshot waiter per in-flight call, and runs a
//! single reader task that routes incoming frames: responses to their
//! waiter by id, notifications to the registered handler, peer-originated
//! requests to a method-not-found reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use tether_types::RpcError;

use crate::codec::{METHOD_NOT_FOUND, PARSE_ERROR, RpcErrorObject, RpcFrame, RpcId};
use crate::transport::Transport;

/// Default per-request deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Callback for server-originated notifications.
pub type NotificationHandler = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

type Waiter = oneshot::Sender<Result<Value, RpcError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;

/// JSON-RPC client over one transport.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a client and start its reader task.
    ///
    /// `on_notification` receives every notification the peer sends;
    /// pass `None` to log-and-drop them.
    pub fn new(transport: Arc<dyn Transport>, on_notification: Option<NotificationHandler>) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&transport),
            Arc::clone(&pending),
            on_notification,
        ));
        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Call `method` with the default 30 s deadline.
    ///
    /// # Errors
    ///
    /// See [`call_with_deadline`](Self::call_with_deadline).
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.call_with_deadline(method, params, DEFAULT_DEADLINE).await
    }

    /// Call `method` and await the correlated response.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] when the deadline elapses (the waiter is
    /// removed), [`RpcError::TransportClosed`] when the transport dies
    /// with the call in flight, [`RpcError::Remote`] when the peer
    /// answers with an error object.
    pub async fn call_with_deadline(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = RpcFrame::request(id, method, params);
        if let Err(err) = self.transport.send(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            // The reader task dropped the sender: transport closed.
            Ok(Err(_)) => Err(RpcError::TransportClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::debug!(method, id, ?deadline, "request timed out");
                Err(RpcError::Timeout(deadline))
            }
        }
    }

    /// Send a notification. No id is allocated and no response awaited.
    ///
    /// # Errors
    ///
    /// Returns transport write failures.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.transport.send(&RpcFrame::notification(method, params)).await
    }

    /// Number of requests currently awaiting responses.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Close the transport and stop the reader task. In-flight calls
    /// fail with [`RpcError::TransportClosed`].
    pub async fn close(&self) {
        self.transport.close().await;
        if let Some(reader) = self.reader.lock().await.take() {
            // The reader ends on its own once recv() observes EOF; abort
            // covers transports whose close does not produce one.
            reader.abort();
            let _ = reader.await;
        }
        fail_all_pending(&self.pending).await;
    }
}

async fn read_loop(
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    on_notification: Option<NotificationHandler>,
) {
    while let Some(received) = transport.recv().await {
        match received {
            Ok(RpcFrame::Response { id, result, error }) => {
                deliver(&pending, &id, result, error).await;
            }
            Ok(RpcFrame::Notification { method, params }) => match &on_notification {
                Some(handler) => handler(&method, params),
                None => tracing::debug!(method, "ignoring notification"),
            },
            Ok(RpcFrame::Request { id, method, .. }) => {
                // Peer-originated requests are not served in the client
                // role; answer so the peer is not left waiting.
                tracing::warn!(method, "peer request on client transport");
                let reply = RpcFrame::response_err(
                    id,
                    RpcErrorObject::new(METHOD_NOT_FOUND, format!("method not handled: {method}")),
                );
                if transport.send(&reply).await.is_err() {
                    break;
                }
            }
            Err(RpcError::Parse(reason)) => {
                tracing::warn!(%reason, "dropping unparseable frame");
                let reply = RpcFrame::response_err(
                    RpcId::Null,
                    RpcErrorObject::new(PARSE_ERROR, reason),
                );
                let _ = transport.send(&reply).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "transport receive error");
            }
        }
    }
    fail_all_pending(&pending).await;
}

async fn deliver(
    pending: &PendingMap,
    id: &RpcId,
    result: Option<Value>,
    error: Option<RpcErrorObject>,
) {
    let key = match id {
        RpcId::Number(n) if *n >= 0 => *n as u64,
        other => {
            tracing::warn!(id = ?other, "response with id this client never issued");
            return;
        }
    };
    let Some(waiter) = pending.lock().await.remove(&key) else {
        tracing::warn!(id = key, "response for unknown or completed request");
        return;
    };
    let outcome = match error {
        Some(err) => Err(RpcError::Remote { code: err.code, message: err.message, data: err.data }),
        None => Ok(result.unwrap_or(Value::Null)),
    };
    let _ = waiter.send(outcome);
}

async fn fail_all_pending(pending: &PendingMap) {
    let drained: Vec<Waiter> = {
        let mut map = pending.lock().await;
        map.drain().map(|(_, waiter)| waiter).collect()
    };
    for waiter in drained {
        let _ = waiter.send(Err(RpcError::TransportClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RpcId;
    use crate::transport::mock;
    use serde_json::json;

    /// Serve the peer end of a mock pair: answer every request by
    /// applying `reply` to (id, method, params).
    fn serve_peer<F>(peer: mock::MockTransport, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(RpcId, String, Option<Value>) -> Option<RpcFrame> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(Ok(frame)) = peer.recv().await {
                if let RpcFrame::Request { id, method, params } = frame
                    && let Some(response) = reply(id, method, params)
                {
                    let _ = peer.send(&response).await;
                }
            }
        })
    }

    #[tokio::test]
    async fn call_correlates_by_id() {
        let (ours, theirs) = mock::pair();
        let _server = serve_peer(theirs, |id, method, _| {
            Some(RpcFrame::response_ok(id, json!({ "method": method })))
        });

        let client = RpcClient::new(Arc::new(ours), None);
        let result = client.call("tools/list", None).await.unwrap();
        assert_eq!(result, json!({"method": "tools/list"}));
        assert_eq!(client.in_flight().await, 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_unique_ids_and_right_answers() {
        let (ours, theirs) = mock::pair();
        // Echo the id back in the result so the test can check routing.
        let _server = serve_peer(theirs, |id, _, _| {
            let echoed = match &id {
                RpcId::Number(n) => json!(n),
                _ => json!(null),
            };
            Some(RpcFrame::response_ok(id, echoed))
        });

        let client = Arc::new(RpcClient::new(Arc::new(ours), None));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move { client.call("m", None).await.unwrap() }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let value = handle.await.unwrap();
            assert!(seen.insert(value.as_i64().unwrap()), "duplicate id delivered");
        }
    }

    #[tokio::test]
    async fn remote_error_surfaces_as_remote() {
        let (ours, theirs) = mock::pair();
        let _server = serve_peer(theirs, |id, _, _| {
            Some(RpcFrame::response_err(id, RpcErrorObject::new(-32602, "bad params")))
        });
        let client = RpcClient::new(Arc::new(ours), None);
        let err = client.call("x", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: -32602, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_removes_waiter() {
        let (ours, theirs) = mock::pair();
        // Peer never answers.
        let _server = serve_peer(theirs, |_, _, _| None);
        let client = RpcClient::new(Arc::new(ours), None);
        let err = client
            .call_with_deadline("slow", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(client.in_flight().await, 0);
    }

    #[tokio::test]
    async fn transport_close_fails_in_flight_calls() {
        let (ours, theirs) = mock::pair();
        let client = Arc::new(RpcClient::new(Arc::new(ours), None));
        let pending_call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("never", None).await })
        };
        // Give the call a chance to register, then drop the peer.
        tokio::task::yield_now().await;
        theirs.close().await;
        drop(theirs);
        let err = pending_call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::TransportClosed));
    }

    #[tokio::test]
    async fn notifications_route_to_handler_and_are_never_answered() {
        let (ours, theirs) = mock::pair();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let handler: NotificationHandler = {
            let seen = Arc::clone(&seen);
            Arc::new(move |method, _| seen.lock().unwrap().push(method.to_string()))
        };
        let client = RpcClient::new(Arc::new(ours), Some(handler));

        theirs
            .send(&RpcFrame::notification("notifications/progress", Some(json!({"progress": 0.5}))))
            .await
            .unwrap();
        // A frame after the notification proves the reader kept going and
        // emitted nothing in response.
        theirs.send(&RpcFrame::notification("second", None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["notifications/progress", "second"]);
        client.close().await;
        // Nothing was written back for either notification.
        assert!(theirs.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_response_id_is_dropped() {
        let (ours, theirs) = mock::pair();
        let client = RpcClient::new(Arc::new(ours), None);
        theirs
            .send(&RpcFrame::response_ok(RpcId::Number(999), json!("stray")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Client is still usable.
        assert_eq!(client.in_flight().await, 0);
    }

    #[tokio::test]
    async fn peer_request_gets_method_not_found() {
        let (ours, theirs) = mock::pair();
        let _client = RpcClient::new(Arc::new(ours), None);
        theirs
            .send(&RpcFrame::request(5u64, "sampling/createMessage", None))
            .await
            .unwrap();
        let reply = theirs.recv().await.unwrap().unwrap();
        let RpcFrame::Response { id, error: Some(err), .. } = reply else {
            panic!("expected error response");
        };
        assert_eq!(id, RpcId::Number(5));
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }
}
