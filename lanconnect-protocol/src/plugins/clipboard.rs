//! Clipboard Plugin
//!
//! Bidirectional text clipboard sync with the peer.
//!
//! ## Packets
//!
//! - `kdeconnect.clipboard` `{"content": "..."}`: the sender's clipboard changed
//! - `kdeconnect.clipboard.connect` `{"content": "...", "timestamp": ms}`:
//!   sent once when the session starts; receiving it marks the peer ready
//!
//! ## Loop prevention
//!
//! Writing peer content into the local clipboard makes the local watcher
//! report that same change. A one-shot guard armed before every write
//! swallows the next reported change.
//!
//! ## Peer readiness
//!
//! Local changes are only forwarded after the peer's
//! `kdeconnect.clipboard.connect` has been received. Until then they update
//! local state and nothing else.
//!
//! The system clipboard itself is reached through a [`ClipboardBackend`];
//! [`CommandClipboard`] shells out to `wl-copy` / `wl-paste` by default.

use super::{OutboundSender, Plugin, PluginContext, PluginFactory};
use crate::packet::{current_timestamp, PacketBody};
use crate::packet::{PACKET_TYPE_CLIPBOARD, PACKET_TYPE_CLIPBOARD_CONNECT};
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read size for the watch process output
const WATCH_CHUNK_SIZE: usize = 64 * 1024;

/// Longest a clipboard write may take before the session gives up on it
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// `kdeconnect.clipboard` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardBody {
    pub content: String,
}

impl PacketBody for ClipboardBody {
    const TYPE: &'static str = PACKET_TYPE_CLIPBOARD;
}

/// `kdeconnect.clipboard.connect` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardConnectBody {
    #[serde(default)]
    pub content: String,
    /// UNIX millis of the last change, 0 when unknown
    #[serde(default)]
    pub timestamp: i64,
}

impl PacketBody for ClipboardConnectBody {
    const TYPE: &'static str = PACKET_TYPE_CLIPBOARD_CONNECT;
}

/// Clipboard content and the time it was last changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipboardState {
    pub content: String,
    pub timestamp: i64,
}

impl ClipboardState {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: current_timestamp(),
        }
    }

    pub fn is_newer_than(&self, other: &ClipboardState) -> bool {
        self.timestamp > other.timestamp
    }
}

/// Access to the host clipboard
#[async_trait]
pub trait ClipboardBackend: Send + Sync {
    /// Replace the clipboard text
    async fn set_text(&self, text: &str) -> Result<()>;

    /// Stream of clipboard changes until `cancel` fires
    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<String>>;
}

/// Clipboard backend running external commands
///
/// The copy command receives the text on stdin. The watch command must
/// print the clipboard content to stdout every time it changes.
#[derive(Debug, Clone)]
pub struct CommandClipboard {
    copy_command: Vec<String>,
    watch_command: Vec<String>,
}

impl Default for CommandClipboard {
    fn default() -> Self {
        Self::from_command_lines("wl-copy", "wl-paste -t text -w tee")
    }
}

impl CommandClipboard {
    pub fn new(copy_command: Vec<String>, watch_command: Vec<String>) -> Self {
        Self {
            copy_command,
            watch_command,
        }
    }

    /// Build from whitespace separated command lines
    pub fn from_command_lines(copy: &str, watch: &str) -> Self {
        let split = |line: &str| line.split_whitespace().map(str::to_string).collect();
        Self::new(split(copy), split(watch))
    }

    fn command(argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProtocolError::Plugin("Empty clipboard command".to_string()))?;
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl ClipboardBackend for CommandClipboard {
    async fn set_text(&self, text: &str) -> Result<()> {
        let mut child = Self::command(&self.copy_command)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            // Closing stdin lets the copy tool take ownership
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ProtocolError::Plugin(format!(
                "{} exited with {}",
                self.copy_command.join(" "),
                status
            )));
        }
        Ok(())
    }

    async fn watch(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<String>> {
        let mut child = Self::command(&self.watch_command)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProtocolError::Plugin("Watch command has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let command_line = self.watch_command.join(" ");

        tokio::spawn(async move {
            debug!("Clipboard watcher started: {}", command_line);
            let mut buf = vec![0u8; WATCH_CHUNK_SIZE];

            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = stdout.read(&mut buf) => read,
                };

                match read {
                    Ok(0) => {
                        warn!("Clipboard watcher {} exited", command_line);
                        break;
                    }
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read from clipboard watcher: {}", e);
                        break;
                    }
                }
            }

            if let Err(e) = child.kill().await {
                debug!("Clipboard watcher already gone: {}", e);
            }
            debug!("Clipboard watcher stopped");
        });

        Ok(rx)
    }
}

/// Session-scoped clipboard handler
pub struct ClipboardPlugin {
    device_id: String,
    backend: Arc<dyn ClipboardBackend>,
    outbound: OutboundSender,
    cancel: CancellationToken,
    write_timeout: Duration,
    state: Mutex<ClipboardState>,
    /// Swallow the next local change (we just wrote it)
    suppress_next: AtomicBool,
    /// Peer sent its clipboard.connect
    peer_ready: AtomicBool,
}

impl ClipboardPlugin {
    pub fn new(
        context: &PluginContext,
        backend: Arc<dyn ClipboardBackend>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            device_id: context.device_id.clone(),
            backend,
            outbound: context.outbound.clone(),
            cancel: context.cancel.clone(),
            write_timeout,
            state: Mutex::new(ClipboardState::default()),
            suppress_next: AtomicBool::new(false),
            peer_ready: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> ClipboardState {
        self.state.lock().await.clone()
    }

    pub fn is_peer_ready(&self) -> bool {
        self.peer_ready.load(Ordering::SeqCst)
    }

    pub async fn create_connect_packet(&self) -> Result<Packet> {
        let state = self.state.lock().await;
        Packet::from_body(&ClipboardConnectBody {
            content: state.content.clone(),
            timestamp: state.timestamp,
        })
    }

    /// Process a change reported by the local watcher
    ///
    /// Returns the packet to forward, if any.
    pub async fn local_change(&self, content: String) -> Result<Option<Packet>> {
        if self.suppress_next.swap(false, Ordering::SeqCst) {
            debug!("Ignoring clipboard change written for {}", self.device_id);
            return Ok(None);
        }

        {
            let mut state = self.state.lock().await;
            if state.content == content {
                return Ok(None);
            }
            *state = ClipboardState::new(content.clone());
        }

        if !self.is_peer_ready() {
            debug!(
                "Clipboard changed but {} has not connected its clipboard yet",
                self.device_id
            );
            return Ok(None);
        }

        Ok(Some(Packet::from_body(&ClipboardBody { content })?))
    }

    async fn apply_remote(&self, content: String, timestamp: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.content != content {
            self.suppress_next.store(true, Ordering::SeqCst);
            let written = tokio::time::timeout(self.write_timeout, self.backend.set_text(&content))
                .await
                .unwrap_or_else(|_| {
                    Err(ProtocolError::Plugin(format!(
                        "clipboard write took longer than {:?}",
                        self.write_timeout
                    )))
                });
            if let Err(e) = written {
                self.suppress_next.store(false, Ordering::SeqCst);
                return Err(e);
            }
            info!("Clipboard updated from {}", self.device_id);
        }
        *state = ClipboardState { content, timestamp };
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>, mut changes: mpsc::Receiver<String>) {
        let plugin = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let content = tokio::select! {
                    _ = plugin.cancel.cancelled() => break,
                    content = changes.recv() => match content {
                        Some(content) => content,
                        None => break,
                    },
                };

                match plugin.local_change(content).await {
                    Ok(Some(packet)) => {
                        if plugin.outbound.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to build clipboard packet: {}", e),
                }
            }
        });
    }

    async fn start_session(self: &Arc<Self>) -> Result<()> {
        match self.backend.watch(self.cancel.child_token()).await {
            Ok(changes) => self.spawn_watcher(changes),
            // Sync still works one way without a watcher
            Err(e) => warn!("Clipboard watcher unavailable: {}", e),
        }

        let packet = self.create_connect_packet().await?;
        self.outbound
            .send(packet)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Wraps the session handler so `start` can hand an `Arc` to the watcher task
struct ClipboardHandle(Arc<ClipboardPlugin>);

#[async_trait]
impl Plugin for ClipboardHandle {
    fn name(&self) -> &str {
        "clipboard"
    }

    async fn start(&self) -> Result<()> {
        self.0.start_session().await
    }

    async fn handle_packet(&self, packet: &Packet) -> Result<Option<Packet>> {
        let plugin = &self.0;

        if packet.is_type(PACKET_TYPE_CLIPBOARD_CONNECT) {
            let body = packet.body_as::<ClipboardConnectBody>()?;
            plugin.peer_ready.store(true, Ordering::SeqCst);
            debug!("{} connected its clipboard", plugin.device_id);

            let current = plugin.state().await;
            let remote = ClipboardState {
                content: body.content,
                timestamp: body.timestamp,
            };
            if remote.timestamp > 0 && !remote.content.is_empty() && remote.is_newer_than(&current)
            {
                plugin.apply_remote(remote.content, remote.timestamp).await?;
            }
            return Ok(None);
        }

        let body = packet.body_as::<ClipboardBody>()?;
        plugin.apply_remote(body.content, current_timestamp()).await?;
        Ok(None)
    }
}

/// Creates one [`ClipboardPlugin`] per session over a shared backend
pub struct ClipboardPluginFactory {
    backend: Arc<dyn ClipboardBackend>,
    write_timeout: Duration,
}

impl ClipboardPluginFactory {
    pub fn new(backend: Arc<dyn ClipboardBackend>) -> Self {
        Self {
            backend,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound on a single clipboard write
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Build the session handler, returning the concrete plugin as well
    pub fn create_plugin(&self, context: &PluginContext) -> (Arc<ClipboardPlugin>, Arc<dyn Plugin>) {
        let plugin = Arc::new(ClipboardPlugin::new(
            context,
            self.backend.clone(),
            self.write_timeout,
        ));
        let handle: Arc<dyn Plugin> = Arc::new(ClipboardHandle(plugin.clone()));
        (plugin, handle)
    }
}

impl PluginFactory for ClipboardPluginFactory {
    fn name(&self) -> &str {
        "clipboard"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![
            PACKET_TYPE_CLIPBOARD.to_string(),
            PACKET_TYPE_CLIPBOARD_CONNECT.to_string(),
        ]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        self.incoming_capabilities()
    }

    fn create(&self, context: &PluginContext) -> Result<Arc<dyn Plugin>> {
        Ok(self.create_plugin(context).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockClipboard {
        written: std::sync::Mutex<Vec<String>>,
        changes: std::sync::Mutex<Option<mpsc::Receiver<String>>>,
    }

    impl MockClipboard {
        fn with_changes() -> (Arc<Self>, mpsc::Sender<String>) {
            let (tx, rx) = mpsc::channel(8);
            let mock = Self {
                written: Default::default(),
                changes: std::sync::Mutex::new(Some(rx)),
            };
            (Arc::new(mock), tx)
        }

        fn written(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClipboardBackend for MockClipboard {
        async fn set_text(&self, text: &str) -> Result<()> {
            self.written.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn watch(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<String>> {
            self.changes
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ProtocolError::Plugin("no watcher".to_string()))
        }
    }

    fn context() -> (PluginContext, mpsc::Receiver<Packet>) {
        let (outbound, rx) = mpsc::channel(8);
        (
            PluginContext {
                device_id: "peer".to_string(),
                outbound,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn inbound(packet_type: &str, body: serde_json::Value) -> Packet {
        let raw = serde_json::json!({"id": 1, "type": packet_type, "body": body});
        Packet::from_bytes(raw.to_string().as_bytes()).unwrap()
    }

    async fn wait_for_content(plugin: &ClipboardPlugin, content: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while plugin.state().await.content != content {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_sends_connect() {
        let (backend, _changes) = MockClipboard::with_changes();
        let (ctx, mut outbound) = context();
        let factory = ClipboardPluginFactory::new(backend);
        let (_plugin, handler) = factory.create_plugin(&ctx);

        handler.start().await.unwrap();

        let packet = outbound.recv().await.unwrap();
        assert_eq!(packet.packet_type(), "kdeconnect.clipboard.connect");
        assert_eq!(
            packet.body_as::<ClipboardConnectBody>().unwrap(),
            ClipboardConnectBody::default()
        );
    }

    #[tokio::test]
    async fn test_inbound_content_written_once() {
        let (backend, _changes) = MockClipboard::with_changes();
        let (ctx, _outbound) = context();
        let factory = ClipboardPluginFactory::new(backend.clone());
        let (plugin, handler) = factory.create_plugin(&ctx);

        let packet = inbound("kdeconnect.clipboard", serde_json::json!({"content": "hello"}));
        assert!(handler.handle_packet(&packet).await.unwrap().is_none());
        assert!(handler.handle_packet(&packet).await.unwrap().is_none());

        assert_eq!(backend.written(), vec!["hello".to_string()]);
        assert_eq!(plugin.state().await.content, "hello");
    }

    #[tokio::test]
    async fn test_written_content_not_echoed() {
        let (backend, _changes) = MockClipboard::with_changes();
        let (ctx, _outbound) = context();
        let factory = ClipboardPluginFactory::new(backend);
        let (plugin, handler) = factory.create_plugin(&ctx);

        plugin.peer_ready.store(true, Ordering::SeqCst);
        handler
            .handle_packet(&inbound("kdeconnect.clipboard", serde_json::json!({"content": "remote"})))
            .await
            .unwrap();

        // The watcher reports our own write
        assert!(plugin.local_change("remote".to_string()).await.unwrap().is_none());

        // A genuine local change goes out
        let packet = plugin.local_change("local".to_string()).await.unwrap().unwrap();
        assert_eq!(
            packet.body_as::<ClipboardBody>().unwrap(),
            ClipboardBody {
                content: "local".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_no_outbound_before_connect() {
        let (backend, changes) = MockClipboard::with_changes();
        let (ctx, mut outbound) = context();
        let factory = ClipboardPluginFactory::new(backend.clone());
        let (plugin, handler) = factory.create_plugin(&ctx);

        handler.start().await.unwrap();
        let connect = outbound.recv().await.unwrap();
        assert!(connect.is_type("kdeconnect.clipboard.connect"));

        handler
            .handle_packet(&inbound("kdeconnect.clipboard", serde_json::json!({"content": "hello"})))
            .await
            .unwrap();
        assert_eq!(backend.written(), vec!["hello".to_string()]);

        // Echo of our own write, then a real change: neither is sent
        changes.send("hello".to_string()).await.unwrap();
        changes.send("world".to_string()).await.unwrap();
        wait_for_content(&plugin, "world").await;
        assert!(outbound.try_recv().is_err());

        handler
            .handle_packet(&inbound(
                "kdeconnect.clipboard.connect",
                serde_json::json!({"content": "", "timestamp": 0}),
            ))
            .await
            .unwrap();
        assert!(plugin.is_peer_ready());

        changes.send("again".to_string()).await.unwrap();
        let packet = outbound.recv().await.unwrap();
        assert_eq!(
            packet.body_as::<ClipboardBody>().unwrap(),
            ClipboardBody {
                content: "again".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_applies_newer_content() {
        let (backend, _changes) = MockClipboard::with_changes();
        let (ctx, _outbound) = context();
        let factory = ClipboardPluginFactory::new(backend.clone());
        let (plugin, handler) = factory.create_plugin(&ctx);

        let newer = current_timestamp() + 60_000;
        handler
            .handle_packet(&inbound(
                "kdeconnect.clipboard.connect",
                serde_json::json!({"content": "from peer", "timestamp": newer}),
            ))
            .await
            .unwrap();

        assert_eq!(backend.written(), vec!["from peer".to_string()]);
        assert_eq!(
            plugin.state().await,
            ClipboardState {
                content: "from peer".to_string(),
                timestamp: newer
            }
        );
    }

    #[tokio::test]
    async fn test_connect_ignores_older_content() {
        let (backend, _changes) = MockClipboard::with_changes();
        let (ctx, _outbound) = context();
        let factory = ClipboardPluginFactory::new(backend.clone());
        let (plugin, handler) = factory.create_plugin(&ctx);

        plugin.local_change("mine".to_string()).await.unwrap();
        handler
            .handle_packet(&inbound(
                "kdeconnect.clipboard.connect",
                serde_json::json!({"content": "stale", "timestamp": 1}),
            ))
            .await
            .unwrap();

        assert!(backend.written().is_empty());
        assert_eq!(plugin.state().await.content, "mine");
        assert!(plugin.is_peer_ready());
    }

    #[tokio::test]
    async fn test_start_without_watcher() {
        let backend = Arc::new(MockClipboard::default());
        let (ctx, mut outbound) = context();
        let factory = ClipboardPluginFactory::new(backend);
        let (_plugin, handler) = factory.create_plugin(&ctx);

        handler.start().await.unwrap();
        assert!(outbound.recv().await.unwrap().is_type("kdeconnect.clipboard.connect"));
    }

    /// A copy tool that never returns
    struct StuckClipboard;

    #[async_trait]
    impl ClipboardBackend for StuckClipboard {
        async fn set_text(&self, _text: &str) -> Result<()> {
            std::future::pending().await
        }

        async fn watch(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<String>> {
            Err(ProtocolError::Plugin("no watcher".to_string()))
        }
    }

    #[tokio::test]
    async fn test_stuck_write_times_out() {
        let (ctx, _outbound) = context();
        let factory = ClipboardPluginFactory::new(Arc::new(StuckClipboard))
            .with_write_timeout(Duration::from_millis(50));
        let (plugin, handler) = factory.create_plugin(&ctx);

        let packet = inbound("kdeconnect.clipboard", serde_json::json!({"content": "hello"}));
        let result = tokio::time::timeout(Duration::from_secs(5), handler.handle_packet(&packet))
            .await
            .expect("clipboard write was not bounded");

        assert!(matches!(result, Err(ProtocolError::Plugin(_))));
        assert!(plugin.state().await.content.is_empty());

        // The guard was released, so a real local change still goes through
        plugin.peer_ready.store(true, Ordering::SeqCst);
        assert!(plugin.local_change("mine".to_string()).await.unwrap().is_some());
    }

    #[test]
    fn test_command_lines() {
        let clipboard = CommandClipboard::from_command_lines("wl-copy", "wl-paste -t text -w tee");
        assert_eq!(clipboard.copy_command, vec!["wl-copy"]);
        assert_eq!(clipboard.watch_command, vec!["wl-paste", "-t", "text", "-w", "tee"]);
        assert!(CommandClipboard::command(&[]).is_err());
    }
}
