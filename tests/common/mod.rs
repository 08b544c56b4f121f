#![allow(dead_code)]

//! Shared fixtures: a scriptable socket seam, an in-process webhook
//! receiver and a recording push transport.

use async_trait::async_trait;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use wa_gateway::auth::MemoryAuthStore;
use wa_gateway::config::GatewayConfig;
use wa_gateway::hub::{PushTransport, RealtimeHub};
use wa_gateway::registry::InstanceRegistry;
use wa_gateway::repository::MemoryRepository;
use wa_gateway::socket::{
    AuthCreds, ChatModification, GroupRecord, MessageKey, Presence, SocketClient, SocketEvent,
    SocketFactory,
};
use wa_gateway::types::jid::Jid;

/// Scripted socket client. Defaults model a healthy connected session;
/// tests flip the knobs they care about.
pub struct MockSocket {
    pub relayed: Mutex<Vec<(String, Value, String)>>,
    pub presence_updates: Mutex<Vec<(String, Presence)>>,
    pub read_calls: Mutex<Vec<Vec<MessageKey>>>,
    pub logout_calls: AtomicUsize,
    pub end_calls: AtomicUsize,
    pub on_whatsapp_result: bool,
    pub relay_fails: bool,
    pub profile_picture: Option<String>,
    pub group: Option<GroupRecord>,
}

impl Default for MockSocket {
    fn default() -> Self {
        Self {
            relayed: Mutex::new(Vec::new()),
            presence_updates: Mutex::new(Vec::new()),
            read_calls: Mutex::new(Vec::new()),
            logout_calls: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
            on_whatsapp_result: true,
            relay_fails: false,
            profile_picture: None,
            group: None,
        }
    }
}

impl MockSocket {
    pub fn relayed(&self) -> Vec<(String, Value, String)> {
        self.relayed.lock().unwrap().clone()
    }

    pub fn presence_updates(&self) -> Vec<(String, Presence)> {
        self.presence_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketClient for MockSocket {
    async fn relay_message(
        &self,
        jid: &Jid,
        content: &Value,
        message_id: &str,
    ) -> anyhow::Result<String> {
        if self.relay_fails {
            anyhow::bail!("stream errored");
        }
        self.relayed
            .lock()
            .unwrap()
            .push((jid.to_string(), content.clone(), message_id.to_string()));
        Ok(message_id.to_string())
    }

    async fn send_presence_update(&self, jid: &Jid, presence: Presence) -> anyhow::Result<()> {
        self.presence_updates
            .lock()
            .unwrap()
            .push((jid.to_string(), presence));
        Ok(())
    }

    async fn presence_subscribe(&self, _jid: &Jid) -> anyhow::Result<()> {
        Ok(())
    }

    async fn profile_picture_url(&self, _jid: &Jid) -> anyhow::Result<Option<String>> {
        Ok(self.profile_picture.clone())
    }

    async fn on_whatsapp(&self, _jid: &Jid) -> anyhow::Result<bool> {
        Ok(self.on_whatsapp_result)
    }

    async fn group_metadata(&self, _jid: &Jid) -> anyhow::Result<GroupRecord> {
        self.group
            .clone()
            .ok_or_else(|| anyhow::anyhow!("item-not-found"))
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> anyhow::Result<()> {
        self.read_calls.lock().unwrap().push(keys.to_vec());
        Ok(())
    }

    async fn chat_modify(&self, _jid: &Jid, _modification: ChatModification) -> anyhow::Result<()> {
        Ok(())
    }

    async fn logout(&self) -> anyhow::Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(&self) {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands the same scripted socket to every session and keeps each session's
/// event sender alive so tests can drive the runtime.
pub struct MockSocketFactory {
    pub socket: Arc<MockSocket>,
    pub create_count: AtomicUsize,
    senders: Mutex<Vec<mpsc::Sender<SocketEvent>>>,
}

impl MockSocketFactory {
    pub fn new() -> Arc<Self> {
        Self::with_socket(MockSocket::default())
    }

    pub fn with_socket(socket: MockSocket) -> Arc<Self> {
        Arc::new(Self {
            socket: Arc::new(socket),
            create_count: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub fn creates(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Emits a protocol event on the most recent session's stream.
    pub async fn emit(&self, event: SocketEvent) {
        let sender = self
            .senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session created yet");
        sender.send(event).await.expect("event loop is gone");
    }
}

#[async_trait]
impl SocketFactory for MockSocketFactory {
    async fn create(
        &self,
        _instance: &str,
        _creds: Option<AuthCreds>,
    ) -> anyhow::Result<(Arc<dyn SocketClient>, mpsc::Receiver<SocketEvent>)> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().push(tx);
        Ok((self.socket.clone(), rx))
    }
}

pub struct TestGateway {
    pub registry: Arc<InstanceRegistry>,
    pub repository: Arc<MemoryRepository>,
    pub auth: Arc<MemoryAuthStore>,
    pub hub: Arc<RealtimeHub>,
    pub factory: Arc<MockSocketFactory>,
}

pub fn gateway(config: GatewayConfig, factory: Arc<MockSocketFactory>) -> TestGateway {
    let repository = Arc::new(MemoryRepository::new());
    let auth = Arc::new(MemoryAuthStore::new());
    let hub = Arc::new(RealtimeHub::new());
    let registry = InstanceRegistry::new(
        config,
        repository.clone(),
        auth.clone(),
        hub.clone(),
        factory.clone(),
    );
    TestGateway {
        registry,
        repository,
        auth,
        hub,
        factory,
    }
}

/// Lets spawned event loops and signal handlers run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
}

/// Inbound-looking message record, as the protocol adapter would emit it.
pub fn message_record(id: &str, jid: &str, text: &str) -> wa_gateway::socket::MessageRecord {
    use wa_gateway::socket::{DeviceTag, MessageRecord};
    MessageRecord {
        key: MessageKey {
            id: id.to_string(),
            remote_jid: jid.to_string(),
            from_me: false,
            participant: None,
        },
        push_name: Some("Tester".to_string()),
        message: serde_json::json!({ "conversation": text }),
        message_type: String::new(),
        message_timestamp: 1_700_000_000,
        source: DeviceTag::Android,
        quoted: None,
    }
}

/// Captures frames pushed through the realtime hub.
pub struct RecordingTransport {
    frames: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }
}

impl PushTransport for RecordingTransport {
    fn push(&self, frame: &str) -> anyhow::Result<()> {
        self.frames.lock().unwrap().push(frame.to_string());
        Ok(())
    }
}

/// Minimal blocking HTTP sink that answers 200 and records request bodies.
pub struct WebhookServer {
    pub url: String,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl WebhookServer {
    pub fn spawn() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind webhook sink");
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let sink = sink.clone();
                std::thread::spawn(move || {
                    let _ = serve_connection(stream, &sink);
                });
            }
        });
        Self { url, bodies }
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    /// Recorded envelopes carrying the given dotted event name.
    pub fn deliveries_of(&self, event: &str) -> Vec<Value> {
        self.bodies()
            .iter()
            .filter_map(|body| serde_json::from_str::<Value>(body).ok())
            .filter(|v| v["event"] == event)
            .collect()
    }
}

fn serve_connection(
    stream: std::net::TcpStream,
    bodies: &Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line)? == 0 {
            return Ok(());
        }
        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header)? == 0 {
                return Ok(());
            }
            let header = header.trim().to_ascii_lowercase();
            if header.is_empty() {
                break;
            }
            if let Some(value) = header.strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        bodies
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&body).into_owned());
        stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")?;
    }
}
