//! Dynamic Authorization (RFC 5176): Disconnect and CoA requests to the NAS
//!
//! [`CoaClient`] performs one request/reply exchange. [`CoaDispatcher`] runs
//! exchanges in the background on a fixed worker pool fed by a bounded queue.
//! Nothing is retried: a failed or rejected job is logged and written to the
//! dead-letter file.

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::config::{CoaSettings, Config};
use async_trait::async_trait;
use chrono::Utc;
use radius_wire::{
    sign_request, verify_response_authenticator, Attribute, AttributeType, Code, Packet,
    PacketError,
};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Destination port for Disconnect and CoA requests
pub const COA_PORT: u16 = 3799;

#[derive(Debug, Error)]
pub enum CoaError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("No reply from NAS within {0:?}")]
    Timeout(Duration),

    #[error("NAS rejected request: {0:?}")]
    Nak(Code),

    #[error("Unexpected reply code: {0:?}")]
    UnexpectedCode(Code),

    #[error("Reply identifier {received} does not match request {expected}")]
    IdentifierMismatch { expected: u8, received: u8 },

    #[error("Invalid Response Authenticator")]
    InvalidResponseAuthenticator,
}

/// What to ask of the NAS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoaAction {
    Disconnect,
    ChangeAuthorization { down_kbps: u32, up_kbps: u32 },
}

/// One queued request against a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoaJob {
    pub nas_ip: IpAddr,
    pub username: String,
    pub session_id: String,
    #[serde(flatten)]
    pub action: CoaAction,
}

/// Performs a single job against a NAS
#[async_trait]
pub trait CoaSender: Send + Sync {
    async fn send(&self, job: &CoaJob) -> Result<(), CoaError>;
}

/// Stateless Disconnect/CoA client.
///
/// The shared secret for each request is the one configured for the NAS
/// address, falling back to the default secret.
pub struct CoaClient {
    config: Arc<Config>,
    timeout: Duration,
    message_authenticator: bool,
    port: u16,
}

impl CoaClient {
    pub fn new(config: Arc<Config>) -> Self {
        let timeout = config.coa.timeout();
        let message_authenticator = config.coa.message_authenticator;
        CoaClient {
            config,
            timeout,
            message_authenticator,
            port: COA_PORT,
        }
    }

    /// Override the destination port. Only test harnesses that cannot bind
    /// 3799 need this.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Send a Disconnect-Request; succeeds only on Disconnect-ACK
    pub async fn disconnect_user(
        &self,
        nas_ip: IpAddr,
        username: &str,
        session_id: &str,
    ) -> Result<(), CoaError> {
        let request = session_request(Code::DisconnectRequest, username, session_id)?;
        self.exchange(nas_ip, request, Code::DisconnectAck, Code::DisconnectNak)
            .await
    }

    /// Send a CoA-Request; succeeds only on CoA-ACK.
    ///
    /// Rate-limit attributes are vendor specific and not encoded; the request
    /// identifies the session only.
    pub async fn change_authorization(
        &self,
        nas_ip: IpAddr,
        username: &str,
        session_id: &str,
        down_kbps: u32,
        up_kbps: u32,
    ) -> Result<(), CoaError> {
        debug!(%nas_ip, username, session_id, down_kbps, up_kbps, "Building CoA-Request");
        let request = session_request(Code::CoaRequest, username, session_id)?;
        self.exchange(nas_ip, request, Code::CoaAck, Code::CoaNak)
            .await
    }

    async fn exchange(
        &self,
        nas_ip: IpAddr,
        mut request: Packet,
        ack: Code,
        nak: Code,
    ) -> Result<(), CoaError> {
        let secret = self.config.get_secret_for_client(nas_ip);
        let bytes = sign_request(&mut request, secret, self.message_authenticator)?;

        let local: SocketAddr = match nas_ip {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(SocketAddr::new(nas_ip, self.port)).await?;
        socket.send(&bytes).await?;

        let mut buf = vec![0u8; Packet::MAX_PACKET_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| CoaError::Timeout(self.timeout))??;

        let reply = Packet::decode(&buf[..len])?;
        if reply.identifier != request.identifier {
            return Err(CoaError::IdentifierMismatch {
                expected: request.identifier,
                received: reply.identifier,
            });
        }
        if !verify_response_authenticator(&reply, &request.authenticator, secret) {
            return Err(CoaError::InvalidResponseAuthenticator);
        }

        match reply.code {
            code if code == ack => Ok(()),
            code if code == nak => Err(CoaError::Nak(code)),
            code => Err(CoaError::UnexpectedCode(code)),
        }
    }
}

fn session_request(code: Code, username: &str, session_id: &str) -> Result<Packet, PacketError> {
    let mut request = Packet::new(code, rand::random::<u8>(), [0u8; 16]);
    if !username.is_empty() {
        request.add_attribute(Attribute::string(AttributeType::UserName as u8, username)?);
    }
    if !session_id.is_empty() {
        request.add_attribute(Attribute::string(
            AttributeType::AcctSessionId as u8,
            session_id,
        )?);
    }
    Ok(request)
}

#[async_trait]
impl CoaSender for CoaClient {
    async fn send(&self, job: &CoaJob) -> Result<(), CoaError> {
        match job.action {
            CoaAction::Disconnect => {
                self.disconnect_user(job.nas_ip, &job.username, &job.session_id)
                    .await
            }
            CoaAction::ChangeAuthorization { down_kbps, up_kbps } => {
                self.change_authorization(
                    job.nas_ip,
                    &job.username,
                    &job.session_id,
                    down_kbps,
                    up_kbps,
                )
                .await
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub timestamp_iso: String,
    #[serde(flatten)]
    pub job: CoaJob,
    pub error: String,
}

/// Append-only JSON-lines record of jobs that did not complete.
///
/// The file sits behind a std mutex because `submit` records overflow from
/// synchronous code; each write is a single short append.
pub struct DeadLetterLog {
    file: Option<std::sync::Mutex<std::fs::File>>,
}

impl DeadLetterLog {
    pub fn new(path: Option<&str>) -> io::Result<Self> {
        let file = match path {
            Some(path) => Some(std::sync::Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        Ok(DeadLetterLog { file })
    }

    pub fn record(&self, job: &CoaJob, reason: &str) {
        warn!(
            nas_ip = %job.nas_ip,
            username = %job.username,
            session_id = %job.session_id,
            action = ?job.action,
            reason,
            "CoA job dead-lettered"
        );

        let Some(file) = &self.file else {
            return;
        };
        let letter = DeadLetter {
            timestamp_iso: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            job: job.clone(),
            error: reason.to_string(),
        };
        match serde_json::to_string(&letter) {
            Ok(json) => {
                let mut f = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Err(e) = writeln!(f, "{}", json) {
                    error!("Failed to write dead letter: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize dead letter: {}", e),
        }
    }
}

/// Bounded background queue of CoA jobs
pub struct CoaDispatcher {
    tx: mpsc::Sender<CoaJob>,
    dead_letters: Arc<DeadLetterLog>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CoaDispatcher {
    /// Spawn `settings.workers` workers. Must be called inside a Tokio runtime.
    pub fn start(
        sender: Arc<dyn CoaSender>,
        settings: &CoaSettings,
        audit: Arc<AuditLogger>,
    ) -> io::Result<Self> {
        let dead_letters = Arc::new(DeadLetterLog::new(settings.dead_letter_path.as_deref())?);
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let workers = (0..settings.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    rx.clone(),
                    sender.clone(),
                    dead_letters.clone(),
                    audit.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        info!(
            workers = settings.workers,
            queue_capacity = settings.queue_capacity,
            "CoA dispatcher started"
        );

        Ok(CoaDispatcher {
            tx,
            dead_letters,
            cancel,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job without waiting. Returns false if it was dead-lettered instead.
    pub fn submit(&self, job: CoaJob) -> bool {
        if self.cancel.is_cancelled() {
            self.dead_letters.record(&job, "dispatcher shut down");
            return false;
        }
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.dead_letters.record(&job, "queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.dead_letters.record(&job, "dispatcher shut down");
                false
            }
        }
    }

    /// Stop accepting jobs, let workers finish what is queued, and wait for them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("CoA worker panicked: {}", e);
            }
        }
        debug!("CoA dispatcher drained");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<CoaJob>>>,
    sender: Arc<dyn CoaSender>,
    dead_letters: Arc<DeadLetterLog>,
    audit: Arc<AuditLogger>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => rx.try_recv().ok(),
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        match sender.send(&job).await {
            Ok(()) => {
                info!(
                    worker_id,
                    nas_ip = %job.nas_ip,
                    username = %job.username,
                    session_id = %job.session_id,
                    action = ?job.action,
                    "NAS acknowledged CoA job"
                );
                audit
                    .log(
                        AuditEntry::new(AuditEventType::CoaAck)
                            .with_username(job.username.clone())
                            .with_client_ip(job.nas_ip)
                            .with_session_id(job.session_id.clone()),
                    )
                    .await;
            }
            Err(e) => {
                let reason = e.to_string();
                dead_letters.record(&job, &reason);
                audit
                    .log(
                        AuditEntry::new(AuditEventType::CoaFailed)
                            .with_username(job.username.clone())
                            .with_client_ip(job.nas_ip)
                            .with_session_id(job.session_id.clone())
                            .with_details(reason),
                    )
                    .await;
            }
        }
    }
    debug!(worker_id, "CoA worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct CountingSender {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CoaSender for CountingSender {
        async fn send(&self, _job: &CoaJob) -> Result<(), CoaError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CoaError::Nak(Code::DisconnectNak))
            } else {
                Ok(())
            }
        }
    }

    /// Blocks every send until released
    struct GatedSender {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl CoaSender for GatedSender {
        async fn send(&self, _job: &CoaJob) -> Result<(), CoaError> {
            self.gate.notified().await;
            Ok(())
        }
    }

    fn job(session_id: &str) -> CoaJob {
        CoaJob {
            nas_ip: "127.0.0.1".parse().unwrap(),
            username: "alice".to_string(),
            session_id: session_id.to_string(),
            action: CoaAction::Disconnect,
        }
    }

    fn settings(workers: usize, queue_capacity: usize, dead_letter_path: Option<String>) -> CoaSettings {
        CoaSettings {
            workers,
            queue_capacity,
            dead_letter_path,
            ..CoaSettings::default()
        }
    }

    #[test]
    fn test_job_serialization() {
        let mut job = job("S1");
        job.action = CoaAction::ChangeAuthorization {
            down_kbps: 512,
            up_kbps: 256,
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"action\":\"change_authorization\""));
        assert!(json.contains("\"down_kbps\":512"));
        let parsed: CoaJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_session_request_skips_empty_attributes() {
        let request = session_request(Code::DisconnectRequest, "", "S1").unwrap();
        assert_eq!(request.attributes.len(), 1);
        assert_eq!(
            request.string_attribute(AttributeType::AcctSessionId).as_deref(),
            Some("S1")
        );
    }

    #[tokio::test]
    async fn test_dispatcher_drains_queue_on_shutdown() {
        let sender = Arc::new(CountingSender {
            sent: AtomicUsize::new(0),
            fail: false,
        });
        let dispatcher = CoaDispatcher::start(
            sender.clone(),
            &settings(2, 16, None),
            Arc::new(AuditLogger::disabled()),
        )
        .unwrap();

        for i in 0..10 {
            assert!(dispatcher.submit(job(&format!("S{}", i))));
        }
        dispatcher.shutdown().await;
        assert_eq!(sender.sent.load(Ordering::SeqCst), 10);

        // Closed dispatcher refuses new work
        assert!(!dispatcher.submit(job("late")));
    }

    #[tokio::test]
    async fn test_failed_jobs_are_dead_lettered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.log");
        let sender = Arc::new(CountingSender {
            sent: AtomicUsize::new(0),
            fail: true,
        });
        let dispatcher = CoaDispatcher::start(
            sender,
            &settings(1, 4, Some(path.to_string_lossy().into_owned())),
            Arc::new(AuditLogger::disabled()),
        )
        .unwrap();

        dispatcher.submit(job("S1"));
        dispatcher.shutdown().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let letter: DeadLetter = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(letter.job.session_id, "S1");
        assert!(letter.error.contains("rejected"));
    }

    #[tokio::test]
    async fn test_full_queue_dead_letters_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.log");
        let gate = Arc::new(Notify::new());
        let dispatcher = CoaDispatcher::start(
            Arc::new(GatedSender { gate: gate.clone() }),
            &settings(1, 1, Some(path.to_string_lossy().into_owned())),
            Arc::new(AuditLogger::disabled()),
        )
        .unwrap();

        // One job in flight on the worker, one queued, the rest overflow
        let accepted = (0..5).filter(|i| dispatcher.submit(job(&format!("S{}", i)))).count();
        assert!(accepted <= 2);
        assert!(accepted >= 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 5 - accepted);
        assert!(contents.contains("queue full"));

        // Release in-flight and queued jobs so shutdown can complete
        for _ in 0..accepted {
            gate.notify_one();
        }
        tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown())
            .await
            .unwrap();
    }

    /// How the fake NAS answers the single request it receives
    #[derive(Clone, Copy)]
    enum NasReply {
        Code(Code),
        WrongSecret(Code),
        WrongIdentifier(Code),
        Silent,
    }

    const NAS_SECRET: &[u8] = b"testing123";

    /// Bind a one-shot NAS on 127.0.0.1 and hand back its port and the
    /// request it saw.
    async fn fake_nas(reply: NasReply) -> (u16, tokio::sync::oneshot::Receiver<Packet>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = Packet::decode(&buf[..len]).unwrap();

            let (code, secret, identifier) = match reply {
                NasReply::Code(code) => (code, NAS_SECRET, request.identifier),
                NasReply::WrongSecret(code) => (code, b"not-the-secret".as_slice(), request.identifier),
                NasReply::WrongIdentifier(code) => {
                    (code, NAS_SECRET, request.identifier.wrapping_add(1))
                }
                NasReply::Silent => {
                    let _ = tx.send(request);
                    return;
                }
            };

            let mut response = request.reply(code);
            response.identifier = identifier;
            let bytes =
                radius_wire::sign_response(&mut response, &request.authenticator, secret).unwrap();
            socket.send_to(&bytes, from).await.unwrap();
            let _ = tx.send(request);
        });

        (port, rx)
    }

    fn client(port: u16) -> CoaClient {
        let mut config = Config::default();
        config.coa.timeout_ms = 300;
        CoaClient::new(Arc::new(config)).with_port(port)
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_ack() {
        let (port, seen) = fake_nas(NasReply::Code(Code::DisconnectAck)).await;
        client(port)
            .disconnect_user(localhost(), "alice", "S1")
            .await
            .unwrap();

        let request = seen.await.unwrap();
        assert_eq!(request.code, Code::DisconnectRequest);
        assert!(radius_wire::verify_accounting_request_authenticator(
            &request, NAS_SECRET
        ));
        assert_eq!(request.string_attribute(AttributeType::UserName).as_deref(), Some("alice"));
        assert_eq!(
            request.string_attribute(AttributeType::AcctSessionId).as_deref(),
            Some("S1")
        );
    }

    #[tokio::test]
    async fn test_change_authorization_ack() {
        let (port, seen) = fake_nas(NasReply::Code(Code::CoaAck)).await;
        client(port)
            .change_authorization(localhost(), "alice", "S2", 512, 256)
            .await
            .unwrap();

        let request = seen.await.unwrap();
        assert_eq!(request.code, Code::CoaRequest);
        assert_eq!(
            request.string_attribute(AttributeType::AcctSessionId).as_deref(),
            Some("S2")
        );
    }

    #[tokio::test]
    async fn test_disconnect_nak() {
        let (port, _seen) = fake_nas(NasReply::Code(Code::DisconnectNak)).await;
        let result = client(port).disconnect_user(localhost(), "alice", "S1").await;
        assert!(matches!(result, Err(CoaError::Nak(Code::DisconnectNak))));
    }

    #[tokio::test]
    async fn test_coa_nak() {
        let (port, _seen) = fake_nas(NasReply::Code(Code::CoaNak)).await;
        let result = client(port)
            .change_authorization(localhost(), "alice", "S1", 1, 1)
            .await;
        assert!(matches!(result, Err(CoaError::Nak(Code::CoaNak))));
    }

    #[tokio::test]
    async fn test_reply_with_other_code_fails() {
        // A CoA-ACK does not acknowledge a Disconnect-Request
        let (port, _seen) = fake_nas(NasReply::Code(Code::CoaAck)).await;
        let result = client(port).disconnect_user(localhost(), "alice", "S1").await;
        assert!(matches!(result, Err(CoaError::UnexpectedCode(Code::CoaAck))));
    }

    #[tokio::test]
    async fn test_reply_signed_with_wrong_secret_fails() {
        let (port, _seen) = fake_nas(NasReply::WrongSecret(Code::DisconnectAck)).await;
        let result = client(port).disconnect_user(localhost(), "alice", "S1").await;
        assert!(matches!(result, Err(CoaError::InvalidResponseAuthenticator)));
    }

    #[tokio::test]
    async fn test_reply_with_wrong_identifier_fails() {
        let (port, _seen) = fake_nas(NasReply::WrongIdentifier(Code::DisconnectAck)).await;
        let result = client(port).disconnect_user(localhost(), "alice", "S1").await;
        match result {
            Err(CoaError::IdentifierMismatch { expected, received }) => {
                assert_eq!(received, expected.wrapping_add(1));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_nas_times_out() {
        let (port, seen) = fake_nas(NasReply::Silent).await;
        let result = client(port).disconnect_user(localhost(), "alice", "S1").await;
        assert!(matches!(
            result,
            Err(CoaError::Timeout(d)) if d == Duration::from_millis(300)
        ));
        assert_eq!(seen.await.unwrap().code, Code::DisconnectRequest);
    }
}
