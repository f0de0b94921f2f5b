//! CDP Transport Layer
//!
//! Talks to the browser's DevTools WebSocket endpoint: typed request/response
//! correlation plus a per-method event subscription channel. Commands can be
//! routed to a specific session via the flattened `sessionId` field.
//!
//! The WebSocket layer is a minimal hand-rolled client (upgrade handshake,
//! frame codec, blocking reader thread) — the endpoint is always a local
//! browser, so none of the negotiation a general-purpose client needs
//! applies here.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};

/// Deadline applied to a command when the caller does not supply one
pub const DEFAULT_COMMAND_DEADLINE: Duration = Duration::from_secs(10);

/// Capacity of each event subscription channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A pending request waiting for a response
type PendingRequest = oneshot::Sender<Result<Value>>;

/// An event received from the browser
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Frame kinds the transport cares about (RFC 6455 §5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Text,
    Close,
    Ping,
    Pong,
    Other,
}

impl Opcode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0x1 => Opcode::Text,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => Opcode::Other,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Other => 0x0,
        }
    }
}

const FIN: u8 = 0x80;
const MASKED: u8 = 0x80;

/// Encode one client frame. Client frames must carry a fresh masking key.
fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(FIN | opcode.bits());

    match payload.len() {
        len if len < 126 => frame.push(MASKED | len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(MASKED | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(MASKED | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    let key: [u8; 4] = rand::random();
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

fn write_frame(stream: &mut TcpStream, opcode: Opcode, payload: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    stream.write_all(&encode_frame(opcode, payload))?;
    stream.flush()
}

/// Read one frame. Server frames arrive unmasked; a mask is honored anyway.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<(Opcode, Vec<u8>)> {
    use std::io::Read;

    let mut head = [0u8; 2];
    stream.read_exact(&mut head)?;
    let opcode = Opcode::from_bits(head[0]);

    let mut len = (head[1] & 0x7F) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        len = u64::from_be_bytes(ext);
    }

    let key = if head[1] & MASKED != 0 {
        let mut key = [0u8; 4];
        stream.read_exact(&mut key)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    if let Some(key) = key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok((opcode, payload))
}

/// HTTP upgrade to a WebSocket on an established TCP stream
fn upgrade_to_websocket(stream: &mut TcpStream, host: &str, path: &str) -> Result<()> {
    use std::io::{Read, Write};

    let nonce = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        rand::random::<[u8; 16]>(),
    );
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {nonce}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| Error::transport_io("Upgrade request write failed", e))?;

    // Read response headers up to the blank line.
    let mut response = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(Error::transport("Oversized upgrade response"));
        }
        let n = stream
            .read(&mut byte)
            .map_err(|e| Error::transport_io("Upgrade response read failed", e))?;
        if n == 0 {
            return Err(Error::transport("Connection closed during upgrade"));
        }
        response.push(byte[0]);
    }

    let status_line = response.split(|&b| b == b'\n').next().unwrap_or_default();
    let status = String::from_utf8_lossy(status_line);
    if !status.contains(" 101 ") {
        return Err(Error::transport(format!(
            "WebSocket upgrade refused: {}",
            status.trim()
        )));
    }
    Ok(())
}

/// CDP Transport - sends commands and routes responses/events via WebSocket
pub struct Transport {
    /// WebSocket stream for writing
    writer: Mutex<TcpStream>,
    /// Next message ID
    next_id: AtomicU64,
    /// Pending requests waiting for responses
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    /// Event subscribers, keyed by CDP method
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<CdpEvent>>>>>,
}

impl Transport {
    /// Connect to a DevTools WebSocket endpoint (`ws://host:port/devtools/...`)
    pub fn connect(ws_url: &str) -> Result<Self> {
        let trimmed = ws_url.trim_start_matches("ws://");
        let (host, path) = match trimmed.split_once('/') {
            Some((host, rest)) => (host, format!("/{}", rest)),
            None => (trimmed, "/".to_string()),
        };

        let mut stream = TcpStream::connect(host)
            .map_err(|e| Error::transport_io("Failed to connect to browser", e))?;
        upgrade_to_websocket(&mut stream, host, &path)?;

        tracing::debug!("WebSocket connected to {}", ws_url);

        // Clone stream for reader
        let reader_stream = stream
            .try_clone()
            .map_err(|e| Error::transport_io("Failed to clone stream", e))?;

        let pending: Arc<Mutex<HashMap<u64, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<CdpEvent>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Spawn reader thread
        let pending_clone = Arc::clone(&pending);
        let subscribers_clone = Arc::clone(&subscribers);
        std::thread::spawn(move || {
            Self::reader_loop(reader_stream, pending_clone, subscribers_clone);
        });

        Ok(Self {
            writer: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            pending,
            subscribers,
        })
    }

    /// Reader loop - runs in a separate thread to read from WebSocket
    fn reader_loop(
        mut stream: TcpStream,
        pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
        subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<CdpEvent>>>>>,
    ) {
        loop {
            let (opcode, payload) = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            };

            match opcode {
                Opcode::Text => {
                    let text = match String::from_utf8(payload) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };

                    let msg: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("Failed to parse CDP message: {} - {}", e, text);
                            continue;
                        }
                    };

                    // Check if response or event
                    if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
                        let result = if let Some(error) = msg.get("error") {
                            Err(Error::cdp(
                                msg.get("method")
                                    .and_then(|m| m.as_str())
                                    .unwrap_or("unknown"),
                                error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
                                error
                                    .get("message")
                                    .and_then(|m| m.as_str())
                                    .unwrap_or("unknown"),
                            ))
                        } else {
                            Ok(msg.get("result").cloned().unwrap_or(json!({})))
                        };

                        let mut pending_guard = pending.blocking_lock();
                        if let Some(sender) = pending_guard.remove(&id) {
                            let _ = sender.send(result);
                        } else {
                            tracing::trace!("Response for unknown id: {}", id);
                        }
                    } else if let Some(method) = msg.get("method").and_then(|m| m.as_str()) {
                        let params = msg.get("params").cloned().unwrap_or(json!({}));
                        let session_id = msg
                            .get("sessionId")
                            .and_then(|s| s.as_str())
                            .map(String::from);

                        Self::dispatch_event(
                            &subscribers,
                            CdpEvent {
                                method: method.to_string(),
                                params,
                                session_id,
                            },
                        );
                    }
                }
                Opcode::Ping => {
                    let _ = write_frame(&mut stream, Opcode::Pong, &[]);
                }
                Opcode::Close => {
                    tracing::debug!("WebSocket closed by server");
                    break;
                }
                _ => {}
            }
        }

        tracing::debug!("CDP reader loop ended");
    }

    /// Fan an event out to all subscribers of its method
    fn dispatch_event(
        subscribers: &Arc<Mutex<HashMap<String, Vec<mpsc::Sender<CdpEvent>>>>>,
        event: CdpEvent,
    ) {
        let mut guard = subscribers.blocking_lock();
        let Some(senders) = guard.get_mut(&event.method) else {
            return;
        };

        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            // Lossy on a saturated subscriber: a consumer that stopped
            // draining must not stall the reader thread.
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!("Dropping {} event: subscriber queue full", event.method);
            }
        }
        if senders.is_empty() {
            guard.remove(&event.method);
        }
    }

    /// Subscribe to a CDP event method.
    ///
    /// Events arrive in CDP order per session; no ordering is promised
    /// across sessions.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<CdpEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut guard = self.subscribers.lock().await;
        guard.entry(method.to_string()).or_default().push(tx);
        rx
    }

    /// Send a CDP command on the browser-level connection
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_impl(None, method, params, DEFAULT_COMMAND_DEADLINE)
            .await
    }

    /// Send a CDP command to a specific session
    pub async fn send_to_session<C, R>(
        &self,
        session_id: &str,
        method: &str,
        params: &C,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_impl(Some(session_id), method, params, DEFAULT_COMMAND_DEADLINE)
            .await
    }

    /// Send a CDP command to a session with a caller-supplied deadline
    pub async fn send_with_deadline<C, R>(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: &C,
        deadline: Duration,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_impl(session_id, method, params, deadline).await
    }

    async fn send_impl<C, R>(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: &C,
        deadline: Duration,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Create response channel
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        // Build and send message
        let mut msg = json!({
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?
        });
        if let Some(session) = session_id {
            msg["sessionId"] = json!(session);
        }

        let data = serde_json::to_string(&msg)?;

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut writer, Opcode::Text, data.as_bytes())
                .map_err(|e| Error::transport_io("WebSocket write failed", e))?;
        }

        tracing::trace!(
            "Sent CDP command: {} (id={}, session={:?})",
            method,
            id,
            session_id
        );

        // Wait for response, bounded by the deadline. On deadline, the call
        // is marked failed but no cancellation is issued to the browser.
        let result = match tokio::time::timeout(deadline, rx).await {
            Ok(received) => received.map_err(|_| Error::transport("Response channel closed"))??,
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                return Err(Error::Timeout(format!(
                    "{} did not respond within {:?}",
                    method, deadline
                )));
            }
        };

        // Deserialize result
        let response: R = serde_json::from_value(result)?;
        Ok(response)
    }

    /// Close the transport
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let _ = write_frame(&mut writer, Opcode::Close, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmask(frame: &[u8], header_len: usize) -> Vec<u8> {
        let key = &frame[header_len..header_len + 4];
        frame[header_len + 4..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect()
    }

    #[test]
    fn short_frames_use_the_compact_length() {
        let frame = encode_frame(Opcode::Text, b"hello");
        assert_eq!(frame[0], FIN | 0x1);
        assert_ne!(frame[1] & MASKED, 0);
        assert_eq!(frame[1] & 0x7F, 5);
        assert_eq!(unmask(&frame, 2), b"hello");
    }

    #[test]
    fn medium_frames_use_the_two_byte_length() {
        let payload = vec![0xAB; 300];
        let frame = encode_frame(Opcode::Text, &payload);
        assert_eq!(frame[1] & 0x7F, 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
        assert_eq!(unmask(&frame, 4), payload);
    }

    #[test]
    fn control_frames_carry_empty_payloads() {
        let frame = encode_frame(Opcode::Close, &[]);
        assert_eq!(frame[0], FIN | 0x8);
        assert_eq!(frame[1] & 0x7F, 0);
        assert_eq!(frame.len(), 6); // header + masking key, no payload
    }

    #[test]
    fn opcode_bits_round_trip() {
        for opcode in [Opcode::Text, Opcode::Close, Opcode::Ping, Opcode::Pong] {
            assert_eq!(Opcode::from_bits(FIN | opcode.bits()), opcode);
        }
        assert_eq!(Opcode::from_bits(0x2), Opcode::Other);
    }
}
