//! Stdio bridge provider: spawn a sidecar process that implements the
//! messaging protocol and exchange newline-delimited JSON frames with it.
//!
//! Host → bridge: `start`, `send`, `end`.
//! Bridge → host: `qr`, `open`, `close`, `creds`, `ack`, `error`, `log`.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, error, trace, warn},
};

use {
    chatgate_channels::{
        ChannelError, CloseReason, Credentials, Envelope, OpenedSession, Result, SendReceipt,
        SessionEvent, SessionHandle, SessionProvider,
    },
    chatgate_config::BridgeConfig,
};

/// How long `close()` waits for the bridge to exit before killing it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HostFrame<'a> {
    Start {
        credentials: &'a serde_json::Value,
    },
    Send {
        id: &'a str,
        to: &'a str,
        content: &'a Envelope,
    },
    End,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BridgeFrame {
    Qr {
        code: String,
    },
    Open,
    Close {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default, rename = "loggedOut")]
        logged_out: bool,
    },
    Creds {
        credentials: serde_json::Value,
    },
    Ack {
        id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        error: String,
    },
    Log {
        #[serde(default)]
        level: String,
        msg: String,
    },
}

type SendOutcome = std::result::Result<String, String>;
type PendingSends = Arc<Mutex<HashMap<String, oneshot::Sender<SendOutcome>>>>;

/// Provider that runs the protocol in a child process.
#[derive(Debug, Clone)]
pub struct BridgeProvider {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    send_timeout: Duration,
}

impl BridgeProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            send_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

#[async_trait]
impl SessionProvider for BridgeProvider {
    fn id(&self) -> &str {
        "bridge"
    }

    async fn open(&self, credentials: &Credentials) -> Result<OpenedSession> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChannelError::Spawn(format!("{}: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::Spawn("bridge stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Spawn("bridge stdout not captured".into()))?;

        write_frame(&mut stdin, &HostFrame::Start {
            credentials: &credentials.data,
        })
        .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_frames(stdout, events_tx, Arc::clone(&pending)));
        // Ends on its own once the process exits.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        debug!(command = %self.command, pid = ?child.id(), "bridge started");

        let handle = Arc::new(BridgeHandle {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            send_timeout: self.send_timeout,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        });

        Ok(OpenedSession {
            handle,
            events: events_rx,
        })
    }
}

/// One running bridge process.
pub struct BridgeHandle {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingSends,
    next_id: AtomicU64,
    send_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl SessionHandle for BridgeHandle {
    async fn send(&self, to: &str, envelope: &Envelope) -> Result<SendReceipt> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => {
                    write_frame(stdin, &HostFrame::Send {
                        id: &id,
                        to,
                        content: envelope,
                    })
                    .await
                },
                None => Err(ChannelError::Closed),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        trace!(id = %id, to = %to, "send frame written");

        let outcome = match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(ChannelError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ChannelError::Timeout(self.send_timeout));
            },
        };

        outcome
            .map(|message_id| SendReceipt { message_id })
            .map_err(ChannelError::Rejected)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = write_frame(&mut stdin, &HostFrame::End).await;
        }

        let mut child = self.child.lock().await;
        let exited = tokio::time::timeout(EXIT_GRACE, child.wait()).await;
        match exited {
            Ok(Ok(status)) => debug!(%status, "bridge exited"),
            Ok(Err(e)) => warn!(error = %e, "failed waiting for bridge exit"),
            Err(_) => {
                debug!("bridge did not exit in time, killing");
                let _ = child.kill().await;
            },
        }

        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &HostFrame<'_>) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            warn!(target: "chatgate::bridge", stderr = %line, "bridge stderr");
        }
    }
}

async fn read_frames(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<SessionEvent>,
    pending: PendingSends,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut closed = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error reading bridge stdout");
                break;
            },
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        trace!(raw = %trimmed, "bridge -> host");

        let frame = match serde_json::from_str::<BridgeFrame>(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable bridge frame");
                continue;
            },
        };

        if let Some(event) = apply_frame(frame, &pending).await {
            closed = matches!(event, SessionEvent::Closed(_));
            if events.send(event).is_err() || closed {
                break;
            }
        }
    }

    if !closed {
        let _ = events.send(SessionEvent::Closed(CloseReason::other("bridge exited")));
    }
    // Dropping the senders fails every in-flight send with `Closed`.
    pending.lock().await.clear();
}

/// Resolve send acknowledgements and translate lifecycle frames to events.
async fn apply_frame(frame: BridgeFrame, pending: &PendingSends) -> Option<SessionEvent> {
    match frame {
        BridgeFrame::Qr { code } => Some(SessionEvent::EnrollmentCode(code)),
        BridgeFrame::Open => Some(SessionEvent::Open),
        BridgeFrame::Close {
            status,
            reason,
            logged_out,
        } => Some(SessionEvent::Closed(CloseReason::classify(
            status,
            reason.unwrap_or_else(|| "connection closed".into()),
            logged_out,
        ))),
        BridgeFrame::Creds { credentials } => Some(SessionEvent::CredentialsUpdated(credentials)),
        BridgeFrame::Ack { id, message_id } => {
            resolve(pending, &id, Ok(message_id)).await;
            None
        },
        BridgeFrame::Error { id: Some(id), error } => {
            resolve(pending, &id, Err(error)).await;
            None
        },
        BridgeFrame::Error { id: None, error } => {
            warn!(error = %error, "bridge reported an error");
            None
        },
        BridgeFrame::Log { level, msg } => {
            match level.as_str() {
                "error" | "fatal" => error!(target: "chatgate::bridge", "{msg}"),
                "warn" => warn!(target: "chatgate::bridge", "{msg}"),
                // Protocol chatter.
                _ => {},
            }
            None
        },
    }
}

async fn resolve(pending: &PendingSends, id: &str, outcome: SendOutcome) {
    match pending.lock().await.remove(id) {
        Some(tx) => {
            let _ = tx.send(outcome);
        },
        None => warn!(id = %id, "bridge answered an unknown send id"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use {super::*, serde_json::json};

    fn script(body: &str) -> BridgeProvider {
        BridgeProvider::new("sh", vec!["-c".into(), body.into()])
    }

    #[test]
    fn host_frames_wire_shape() {
        let creds = json!({"me": "1"});
        let start = serde_json::to_value(HostFrame::Start {
            credentials: &creds,
        })
        .unwrap();
        assert_eq!(start, json!({"type": "start", "credentials": {"me": "1"}}));

        let envelope = Envelope::Text { text: "hi".into() };
        let send = serde_json::to_value(HostFrame::Send {
            id: "7",
            to: "1@s.whatsapp.net",
            content: &envelope,
        })
        .unwrap();
        assert_eq!(
            send,
            json!({"type": "send", "id": "7", "to": "1@s.whatsapp.net", "content": {"text": "hi"}})
        );
        assert_eq!(serde_json::to_value(HostFrame::End).unwrap(), json!({"type": "end"}));
    }

    #[tokio::test]
    async fn close_frame_classification() {
        let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));
        let frame: BridgeFrame =
            serde_json::from_str(r#"{"type":"close","status":401,"reason":"logged out"}"#).unwrap();
        match apply_frame(frame, &pending).await {
            Some(SessionEvent::Closed(reason)) => assert!(reason.is_logged_out()),
            other => panic!("unexpected: {other:?}"),
        }

        let frame: BridgeFrame =
            serde_json::from_str(r#"{"type":"close","status":408,"reason":"timed out"}"#).unwrap();
        match apply_frame(frame, &pending).await {
            Some(SessionEvent::Closed(reason)) => assert!(!reason.is_logged_out()),
            other => panic!("unexpected: {other:?}"),
        }

        let frame: BridgeFrame = serde_json::from_str(r#"{"type":"log","level":"info","msg":"chatter"}"#).unwrap();
        assert!(apply_frame(frame, &pending).await.is_none());
    }

    #[tokio::test]
    async fn lifecycle_frames_become_events() {
        let provider = script(
            r#"read start
echo '{"type":"qr","code":"2@abc"}'
echo '{"type":"creds","credentials":{"me":"42"}}'
echo '{"type":"open"}'
cat > /dev/null"#,
        );
        let mut opened = provider.open(&Credentials::empty()).await.unwrap();

        assert_eq!(
            opened.events.recv().await,
            Some(SessionEvent::EnrollmentCode("2@abc".into()))
        );
        assert_eq!(
            opened.events.recv().await,
            Some(SessionEvent::CredentialsUpdated(json!({"me": "42"})))
        );
        assert_eq!(opened.events.recv().await, Some(SessionEvent::Open));
        opened.handle.close().await;
    }

    #[tokio::test]
    async fn send_is_acknowledged() {
        let provider = script(
            r#"read start
echo '{"type":"open"}'
read send
echo '{"type":"ack","id":"1","messageId":"3EB0C767F26BEC"}'
cat > /dev/null"#,
        );
        let mut opened = provider.open(&Credentials::empty()).await.unwrap();
        assert_eq!(opened.events.recv().await, Some(SessionEvent::Open));

        let receipt = opened
            .handle
            .send("1@s.whatsapp.net", &Envelope::Text { text: "hi".into() })
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "3EB0C767F26BEC");
        opened.handle.close().await;
    }

    #[tokio::test]
    async fn send_error_is_rejected() {
        let provider = script(
            r#"read start
read send
echo '{"type":"error","id":"1","error":"not on whatsapp"}'
cat > /dev/null"#,
        );
        let opened = provider.open(&Credentials::empty()).await.unwrap();
        let err = opened
            .handle
            .send("1@s.whatsapp.net", &Envelope::Text { text: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(ref m) if m == "not on whatsapp"));
        opened.handle.close().await;
    }

    #[tokio::test]
    async fn exit_without_close_frame_is_not_terminal() {
        let provider = script("read start");
        let mut opened = provider.open(&Credentials::empty()).await.unwrap();
        match opened.events.recv().await {
            Some(SessionEvent::Closed(reason)) => {
                assert!(!reason.is_logged_out());
                assert_eq!(reason.detail, "bridge exited");
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let provider = script("read start; cat > /dev/null");
        let opened = provider.open(&Credentials::empty()).await.unwrap();
        opened.handle.close().await;
        opened.handle.close().await;
        let err = opened
            .handle
            .send("1", &Envelope::Text { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn spawn_failure() {
        let provider = BridgeProvider::new("nonexistent_bridge_xyz_42", Vec::new());
        let err = provider.open(&Credentials::empty()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Spawn(_)));
    }

    #[tokio::test]
    async fn stderr_output_does_not_disturb_frames() {
        let provider = script(
            r#"read start
echo 'warming up' >&2
echo '{"type":"open"}'
cat > /dev/null"#,
        );
        let mut opened = provider.open(&Credentials::empty()).await.unwrap();
        assert_eq!(opened.events.recv().await, Some(SessionEvent::Open));
        opened.handle.close().await;
    }

    #[tokio::test]
    async fn unanswered_send_times_out() {
        let provider = script("read start; cat > /dev/null")
            .with_send_timeout(Duration::from_millis(100));
        let opened = provider.open(&Credentials::empty()).await.unwrap();
        let err = opened
            .handle
            .send("1", &Envelope::Text { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(d) if d == Duration::from_millis(100)));
        opened.handle.close().await;
    }

    #[tokio::test]
    async fn send_timeout_surfaces_as_dispatch_failure() {
        use crate::{
            error::Error,
            manager::{ConnectionManager, ManagerOptions},
            outbound::{DEFAULT_DOMAIN, MessageGateway, OutboundMessage},
            store::MemoryCredentialStore,
        };

        let provider = script(
            r#"read start
echo '{"type":"open"}'
cat > /dev/null"#,
        )
        .with_send_timeout(Duration::from_millis(100));
        let manager = ConnectionManager::new(
            Arc::new(provider),
            Arc::new(MemoryCredentialStore::new()),
            ManagerOptions {
                retry_delay: Duration::from_secs(3),
                on_enrollment: Arc::new(|_: &str| {}),
            },
        );
        assert!(manager.connect().await);
        for _ in 0..200 {
            if manager.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_ready());

        let gateway = MessageGateway::new(manager.clone(), DEFAULT_DOMAIN);
        match gateway.dispatch(&OutboundMessage::new("1", "hi")).await {
            Err(Error::DispatchFailed(detail)) => assert!(detail.contains("did not answer")),
            other => panic!("unexpected: {other:?}"),
        }
        manager.disconnect().await;
    }
}
