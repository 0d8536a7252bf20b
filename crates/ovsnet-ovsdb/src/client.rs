//! OVSDB JSON-RPC client over one persistent TCP or unix-socket connection.
//!
//! Requests are correlated by id, `update` notifications are forwarded to the
//! monitor subscriber, and server `echo` keepalives are answered.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use ovsnet_core::{Cancellation, OvsdbEndpoint, RetryError, RetryPolicy};

use crate::error::OvsdbError;
use crate::protocol::{Operation, OperationResult, TableUpdates};

const MONITOR_ID: &str = "ovsnet";

/// The remote database as the rest of the driver sees it.
#[async_trait]
pub trait OvsdbTransport: Send + Sync {
    /// Submit `operations` as one atomic transaction. Returns the raw per-operation
    /// results; validation is the caller's business (see [`crate::Transaction`]).
    async fn transact(
        &self,
        database: &str,
        operations: &[Operation],
    ) -> Result<Vec<OperationResult>, OvsdbError>;

    /// Monitor every table of `database`. Returns the initial snapshot; later
    /// changes are delivered, in order, on `updates`.
    async fn monitor_all(
        &self,
        database: &str,
        updates: mpsc::UnboundedSender<TableUpdates>,
    ) -> Result<TableUpdates, OvsdbError>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type UpdateSink = Arc<Mutex<Option<mpsc::UnboundedSender<TableUpdates>>>>;

struct PendingCall {
    method: String,
    respond_to: oneshot::Sender<Result<Value, OvsdbError>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// Direct OVSDB JSON-RPC client
pub struct OvsdbClient {
    endpoint: OvsdbEndpoint,
    writer: SharedWriter,
    pending: PendingMap,
    updates: UpdateSink,
    /// set by the reader task once the connection is gone
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl OvsdbClient {
    /// Open the connection and start the reader task.
    pub async fn connect(endpoint: &OvsdbEndpoint, timeout: Duration) -> Result<Self, OvsdbError> {
        let connect_err = |source| OvsdbError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };
        let (reader, writer): (BoxedReader, Box<dyn AsyncWrite + Send + Unpin>) = match endpoint
        {
            OvsdbEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            OvsdbEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_err)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        debug!("Connected to OVSDB at {}", endpoint);

        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let pending: PendingMap = Arc::default();
        let updates: UpdateSink = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            reader,
            writer.clone(),
            pending.clone(),
            updates.clone(),
            closed.clone(),
        ));

        Ok(Self {
            endpoint: endpoint.clone(),
            writer,
            pending,
            updates,
            closed,
            next_id: AtomicU64::new(1),
            timeout,
            reader,
        })
    }

    /// Connect with a bounded number of attempts.
    pub async fn connect_with_retry(
        endpoint: &OvsdbEndpoint,
        timeout: Duration,
        policy: &RetryPolicy,
        cancel: &Cancellation,
    ) -> Result<Self, RetryError<OvsdbError>> {
        policy
            .retry(cancel, "OVSDB connect", |attempt| async move {
                let result = Self::connect(endpoint, timeout).await;
                if let Err(e) = &result {
                    error!(
                        "Could not connect to openvswitch at {} (attempt {}): {}. Retrying in {:?}",
                        endpoint,
                        attempt + 1,
                        e,
                        policy.delay
                    );
                }
                result
            })
            .await
    }

    pub fn endpoint(&self) -> &OvsdbEndpoint {
        &self.endpoint
    }

    /// Send a JSON-RPC request and wait for its response
    async fn call(&self, method: &str, params: Value) -> Result<Value, OvsdbError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(OvsdbError::Closed);
            }
            pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    respond_to: tx,
                },
            );
        }

        let request = json!({
            "method": method,
            "params": params,
            "id": id
        });
        let bytes = serde_json::to_vec(&request)?;
        debug!("OVSDB request: {}", String::from_utf8_lossy(&bytes));

        if let Err(e) = write_message(&self.writer, &bytes).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OvsdbError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(OvsdbError::Timeout {
                    method: method.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// List all databases
    pub async fn list_dbs(&self) -> Result<Vec<String>, OvsdbError> {
        let result = self.call("list_dbs", json!([])).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Get schema for a database
    pub async fn get_schema(&self, database: &str) -> Result<Value, OvsdbError> {
        self.call("get_schema", json!([database])).await
    }
}

impl Drop for OvsdbClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl OvsdbTransport for OvsdbClient {
    async fn transact(
        &self,
        database: &str,
        operations: &[Operation],
    ) -> Result<Vec<OperationResult>, OvsdbError> {
        let mut params = vec![json!(database)];
        for op in operations {
            params.push(serde_json::to_value(op)?);
        }
        let result = self.call("transact", Value::Array(params)).await?;
        let results: Vec<Option<OperationResult>> = serde_json::from_value(result)?;
        Ok(results.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn monitor_all(
        &self,
        database: &str,
        updates: mpsc::UnboundedSender<TableUpdates>,
    ) -> Result<TableUpdates, OvsdbError> {
        let schema = self.get_schema(database).await?;
        let tables = schema
            .get("tables")
            .and_then(Value::as_object)
            .ok_or_else(|| OvsdbError::Malformed("schema has no tables".to_string()))?;

        // An empty monitor request selects every column and every change kind.
        let requests: serde_json::Map<String, Value> =
            tables.keys().map(|t| (t.clone(), json!({}))).collect();
        debug!("Monitoring {} OVSDB tables", requests.len());

        *self.updates.lock().await = Some(updates);
        let initial = self
            .call("monitor", json!([database, MONITOR_ID, requests]))
            .await?;
        Ok(serde_json::from_value(initial)?)
    }
}

async fn write_message(writer: &SharedWriter, bytes: &[u8]) -> Result<(), OvsdbError> {
    let mut w = writer.lock().await;
    w.write_all(bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_loop(
    mut reader: BoxedReader,
    writer: SharedWriter,
    pending: PendingMap,
    updates: UpdateSink,
    closed: Arc<AtomicBool>,
) {
    let mut framer = MessageFramer::default();
    let mut chunk = vec![0u8; 16 * 1024];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                warn!("OVSDB connection closed by server");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("Failed to read from OVSDB: {}", e);
                break;
            }
        };

        let messages = match framer.push(&chunk[..n]) {
            Ok(messages) => messages,
            Err(e) => {
                error!("Unparseable data on OVSDB connection: {}", e);
                break;
            }
        };
        for message in messages {
            dispatch(message, &writer, &pending, &updates).await;
        }
    }

    // dropping the sender ends the monitor subscriber's stream
    updates.lock().await.take();
    let mut pending = pending.lock().await;
    closed.store(true, Ordering::Release);
    for (_, call) in pending.drain() {
        let _ = call.respond_to.send(Err(OvsdbError::Closed));
    }
}

/// Splits the byte stream into the JSON objects the server sends back to back.
///
/// Brace depth and string state are tracked across reads, so every byte is
/// scanned once however many reads a large snapshot spans.
#[derive(Debug, Default)]
struct MessageFramer {
    buf: Vec<u8>,
    /// next byte to scan
    pos: usize,
    /// first byte of the message being scanned
    start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl MessageFramer {
    /// Append `data` and return every message it completes.
    fn push(&mut self, data: &[u8]) -> Result<Vec<Value>, OvsdbError> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.pos < self.buf.len() {
            let at = self.pos;
            let byte = self.buf[at];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'{' | b'[' => {
                    if self.depth == 0 {
                        self.start = at;
                    }
                    self.depth += 1;
                }
                b'}' | b']' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        messages.push(serde_json::from_slice(&self.buf[self.start..=at])?);
                        self.start = self.pos;
                    }
                }
                b'"' if self.depth > 0 => self.in_string = true,
                b if self.depth == 0 && b.is_ascii_whitespace() => self.start = self.pos,
                b if self.depth == 0 => {
                    return Err(OvsdbError::Malformed(format!(
                        "unexpected byte {:?} between messages",
                        char::from(b)
                    )));
                }
                _ => {}
            }
        }

        // keep only the unfinished message
        self.buf.drain(..self.start);
        self.pos -= self.start;
        self.start = 0;
        Ok(messages)
    }
}

async fn dispatch(message: Value, writer: &SharedWriter, pending: &PendingMap, updates: &UpdateSink) {
    let method = message.get("method").and_then(Value::as_str);
    match method {
        Some("update") => {
            let Some(table_updates) = message.get("params").and_then(|p| p.get(1)) else {
                warn!("OVSDB update notification without table updates");
                return;
            };
            match serde_json::from_value::<TableUpdates>(table_updates.clone()) {
                Ok(parsed) => {
                    if let Some(sink) = updates.lock().await.as_ref() {
                        if sink.send(parsed).is_err() {
                            debug!("OVSDB update dropped, subscriber is gone");
                        }
                    }
                }
                Err(e) => warn!("Invalid OVSDB update notification: {}", e),
            }
        }
        Some("echo") => {
            let reply = json!({
                "id": message.get("id").cloned().unwrap_or(Value::Null),
                "result": message.get("params").cloned().unwrap_or_else(|| json!([])),
                "error": null
            });
            match serde_json::to_vec(&reply) {
                Ok(bytes) => {
                    if let Err(e) = write_message(writer, &bytes).await {
                        warn!("Failed to answer OVSDB echo: {}", e);
                    }
                }
                Err(e) => warn!("Failed to encode OVSDB echo reply: {}", e),
            }
        }
        Some(other) => debug!("Ignoring OVSDB notification {}", other),
        None => {
            let Some(id) = message.get("id").and_then(Value::as_u64) else {
                debug!("OVSDB response without numeric id: {}", message);
                return;
            };
            let Some(call) = pending.lock().await.remove(&id) else {
                debug!("OVSDB response for unknown request {}", id);
                return;
            };
            let result = match message.get("error") {
                Some(error) if !error.is_null() => Err(OvsdbError::Rpc {
                    method: call.method,
                    error: error.clone(),
                }),
                _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = call.respond_to.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_framer_back_to_back() {
        let mut framer = MessageFramer::default();
        let messages = framer
            .push(br#"{"id":1,"result":[]}{"id":2,"result":{}} {"id":3,"res"#)
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["id"], 2);
        assert_eq!(framer.buf, br#"{"id":3,"res"#);

        let messages = framer.push(br#"ult":"}{"}"#).unwrap();
        assert_eq!(messages, vec![json!({"id": 3, "result": "}{"})]);
        assert!(framer.buf.is_empty());
    }

    #[test]
    fn test_framer_message_split_across_reads() {
        let message = json!({
            "id": 7,
            "result": {"Bridge": {"b1": {"new": {"name": "br\"0 {x}", "ports": ["set", []]}}}}
        });
        let bytes = message.to_string().into_bytes();
        let mut framer = MessageFramer::default();
        for byte in &bytes[..bytes.len() - 1] {
            assert!(framer.push(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        assert_eq!(framer.pos, bytes.len() - 1);
        assert_eq!(framer.push(&bytes[bytes.len() - 1..]).unwrap(), vec![message]);
    }

    #[test]
    fn test_framer_rejects_garbage() {
        assert!(MessageFramer::default().push(b"}{").is_err());
        assert!(MessageFramer::default().push(b"{\"id\":}").is_err());
    }

    /// Minimal ovsdb-server stand-in: answers list_dbs and transact, sends an echo
    /// and an update notification around the monitor reply.
    async fn fake_server(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut r, mut w) = stream.into_split();
        let mut framer = MessageFramer::default();
        let mut chunk = [0u8; 4096];
        loop {
            let n = r.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            for request in framer.push(&chunk[..n]).unwrap() {
                // the client's echo reply carries no method
                if request.get("method").is_some() {
                    respond(&mut w, request).await;
                }
            }
        }
    }

    async fn respond(w: &mut tokio::net::unix::OwnedWriteHalf, request: Value) {
        let id = request["id"].clone();
        let reply = match request["method"].as_str() {
            Some("list_dbs") => json!({"id": id, "result": ["Open_vSwitch"], "error": null}),
            Some("get_schema") => json!({"id": id, "result": {"tables": {"Bridge": {}, "Open_vSwitch": {}}}, "error": null}),
            Some("monitor") => {
                let echo = json!({"method": "echo", "params": [], "id": "echo"});
                w.write_all(echo.to_string().as_bytes()).await.unwrap();
                let snapshot = json!({"id": id, "result": {"Open_vSwitch": {"root": {"new": {"bridges": ["set", []]}}}}, "error": null});
                w.write_all(snapshot.to_string().as_bytes()).await.unwrap();
                json!({"method": "update", "params": ["ovsnet", {"Bridge": {"b1": {"new": {"name": "br0"}}}}], "id": null})
            }
            Some("transact") => json!({"id": id, "result": [{"error": "constraint violation"}, null], "error": null}),
            _ => json!({"id": id, "result": null, "error": {"error": "unknown method"}}),
        };
        w.write_all(reply.to_string().as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_against_fake_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_server(listener));

        let client = OvsdbClient::connect(&OvsdbEndpoint::Unix(path.clone()), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(client.list_dbs().await.unwrap(), vec!["Open_vSwitch".to_string()]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let initial = client.monitor_all("Open_vSwitch", tx).await.unwrap();
        assert_eq!(initial.table("Open_vSwitch").count(), 1);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.table("Bridge").next().unwrap().0, "b1");

        let ops = vec![Operation::select("Bridge", vec![])];
        let results = client.transact("Open_vSwitch", &ops).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error(), Some("constraint violation"));
        assert_eq!(results[1], OperationResult::default());

    }

    /// Answers get_schema and monitor, then hangs up.
    async fn hang_up_after_monitor(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut r, mut w) = stream.into_split();
        let mut framer = MessageFramer::default();
        let mut chunk = [0u8; 4096];
        loop {
            let n = r.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            for request in framer.push(&chunk[..n]).unwrap() {
                let id = request["id"].clone();
                let monitor = request["method"] == "monitor";
                let result = if monitor { json!({}) } else { json!({"tables": {"Bridge": {}}}) };
                let reply = json!({"id": id, "result": result, "error": null});
                w.write_all(reply.to_string().as_bytes()).await.unwrap();
                if monitor {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_update_stream_ends_when_connection_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(hang_up_after_monitor(listener));

        let client = OvsdbClient::connect(&OvsdbEndpoint::Unix(path), Duration::from_secs(5))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.monitor_all("Open_vSwitch", tx).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("update stream still open after the connection closed");
        assert!(next.is_none());
        assert!(matches!(client.list_dbs().await, Err(OvsdbError::Closed) | Err(OvsdbError::Io(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let endpoint = OvsdbEndpoint::Unix("/nonexistent/ovsnet/db.sock".into());
        let result = OvsdbClient::connect_with_retry(
            &endpoint,
            Duration::from_secs(1),
            &RetryPolicy::new(2, Duration::ZERO),
            &Cancellation::never(),
        )
        .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, OvsdbError::Connect { .. }));
            }
            _ => panic!("expected exhausted connect retries"),
        }
    }
}
