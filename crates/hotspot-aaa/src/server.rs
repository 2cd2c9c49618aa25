use crate::accounting::{AccountingOutcome, AccountingProcessor};
use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::authorize::{AccessCredentials, AccessDecision, Authorizer};
use crate::coa::{CoaClient, CoaDispatcher, CoaSender};
use crate::config::{Config, ConfigError};
use crate::fup::FupEvaluator;
use crate::ipam::IpamAllocator;
use crate::store::Stores;
use radius_wire::{
    sign_response, verify_accounting_request_authenticator, AccountingError, AccountingRequest,
    AttributeType, Code, Packet, PacketError,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid client")]
    InvalidClient,
    #[error("Invalid accounting request authenticator")]
    InvalidAuthenticator,
}

/// The two request kinds the server answers
#[derive(Debug)]
pub enum InboundRequest {
    Access(Packet),
    Accounting(Packet),
}

impl InboundRequest {
    /// Classify a decoded packet by code. Anything that is not an
    /// Access-Request or Accounting-Request yields `None`.
    pub fn classify(packet: Packet) -> Option<Self> {
        match packet.code {
            Code::AccessRequest => Some(InboundRequest::Access(packet)),
            Code::AccountingRequest => Some(InboundRequest::Accounting(packet)),
            _ => None,
        }
    }
}

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Clients, secrets and server settings
    pub config: Arc<Config>,
    pub authorizer: Arc<Authorizer>,
    pub accounting: Arc<AccountingProcessor>,
    /// Background Disconnect/CoA queue
    pub dispatcher: Arc<CoaDispatcher>,
    /// Audit logger
    pub audit_logger: Arc<AuditLogger>,
}

impl ServerConfig {
    /// Wire the engine together over `stores`, sending CoA requests with a
    /// [`CoaClient`]. Must be called inside a Tokio runtime.
    pub fn from_config(config: Config, stores: Stores) -> Result<Self, ServerError> {
        let config = Arc::new(config);
        let sender = Arc::new(CoaClient::new(config.clone()));
        Self::with_coa_sender(config, stores, sender)
    }

    /// Same as [`ServerConfig::from_config`] with a caller-supplied CoA transport
    pub fn with_coa_sender(
        config: Arc<Config>,
        stores: Stores,
        coa_sender: Arc<dyn CoaSender>,
    ) -> Result<Self, ServerError> {
        let bind_addr = config.socket_addr()?;
        let audit_logger = Arc::new(AuditLogger::new(config.audit_log_path.clone())?);

        let ipam = Arc::new(IpamAllocator::new(
            stores.ipam.clone(),
            config.lease_duration_secs,
        ));
        let fup = Arc::new(FupEvaluator::new(stores.fup.clone(), stores.sessions.clone()));
        let dispatcher = Arc::new(CoaDispatcher::start(
            coa_sender,
            &config.coa,
            audit_logger.clone(),
        )?);

        let authorizer = Arc::new(Authorizer::new(
            stores.subscribers.clone(),
            ipam,
            fup.clone(),
            config.default_pool_id,
        ));
        let accounting = Arc::new(AccountingProcessor::new(
            stores.sessions.clone(),
            stores.subscribers.clone(),
            fup,
            dispatcher.clone(),
        ));

        Ok(ServerConfig {
            bind_addr,
            config,
            authorizer,
            accounting,
            dispatcher,
            audit_logger,
        })
    }
}

/// RADIUS Server
pub struct RadiusServer {
    config: Arc<ServerConfig>,
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl RadiusServer {
    /// Create a new RADIUS server
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("RADIUS server listening on {}", socket.local_addr()?);

        Ok(RadiusServer {
            config: Arc::new(config),
            socket: Arc::new(socket),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Get the local address the server is listening on
    ///
    /// This is useful for testing when binding to port 0 (OS-assigned port)
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.socket.local_addr().map_err(ServerError::from)
    }

    /// Token that stops [`RadiusServer::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled, then drain in-flight
    /// handlers and the CoA queue.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; Packet::MAX_PACKET_SIZE];

        self.config
            .audit_logger
            .log(AuditEntry::new(AuditEventType::ServerStart))
            .await;

        let result = loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, addr) = match received {
                Ok(received) => received,
                Err(e) => break Err(ServerError::Io(e)),
            };
            let data = buf[..len].to_vec();

            let config = Arc::clone(&self.config);
            let socket = Arc::clone(&self.socket);

            self.tracker.spawn(async move {
                if let Err(e) = Self::handle_request(data, addr, config, socket).await {
                    debug!("Error handling request from {}: {}", addr, e);
                }
            });
        };

        self.tracker.close();
        self.tracker.wait().await;
        self.config.dispatcher.shutdown().await;

        self.config
            .audit_logger
            .log(AuditEntry::new(AuditEventType::ServerStop))
            .await;
        info!("RADIUS server stopped");

        result
    }

    /// Handle a single RADIUS request
    async fn handle_request(
        data: Vec<u8>,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        socket: Arc<UdpSocket>,
    ) -> Result<(), ServerError> {
        // RFC 2865 Section 3: Validate source IP address
        if !config.config.is_client_authorized(addr.ip()) {
            let request_id = if data.len() >= 2 { data[1] } else { 0 };
            warn!(
                client_ip = %addr.ip(),
                request_id = request_id,
                "Rejected request from unauthorized client"
            );

            config
                .audit_logger
                .log(
                    AuditEntry::new(AuditEventType::UnauthorizedClient)
                        .with_client_ip(addr.ip())
                        .with_request_id(request_id),
                )
                .await;

            return Err(ServerError::InvalidClient);
        }

        let packet = Packet::decode(&data)?;

        debug!(
            packet_type = ?packet.code,
            client_addr = %addr,
            request_id = packet.identifier,
            "Received RADIUS packet"
        );

        let Some(request) = InboundRequest::classify(packet) else {
            debug!(client_addr = %addr, "Ignoring unsupported packet type");
            return Ok(());
        };

        let secret = config.config.get_secret_for_client(addr.ip());

        let (mut response, request_authenticator) = match request {
            InboundRequest::Access(packet) => {
                let response = Self::handle_access_request(&packet, &config, addr.ip()).await?;
                (response, packet.authenticator)
            }
            InboundRequest::Accounting(packet) => {
                if !verify_accounting_request_authenticator(&packet, secret) {
                    warn!(
                        client_ip = %addr.ip(),
                        request_id = packet.identifier,
                        "Dropping Accounting-Request with invalid authenticator"
                    );
                    return Err(ServerError::InvalidAuthenticator);
                }
                let response = match AccountingRequest::from_packet(&packet) {
                    Ok(accounting) => {
                        Self::handle_accounting_request(&packet, &accounting, &config, addr.ip())
                            .await
                    }
                    Err(e) => {
                        Self::handle_unusable_accounting(&packet, &e, &config, addr.ip()).await
                    }
                };
                (response, packet.authenticator)
            }
        };

        let response_data = sign_response(&mut response, &request_authenticator, secret)?;
        socket.send_to(&response_data, addr).await?;

        debug!(
            response_type = ?response.code,
            client_addr = %addr,
            request_id = response.identifier,
            "Sent RADIUS response"
        );

        Ok(())
    }

    /// Handle Access-Request packet
    async fn handle_access_request(
        request: &Packet,
        config: &ServerConfig,
        source_ip: IpAddr,
    ) -> Result<Packet, ServerError> {
        let secret = config.config.get_secret_for_client(source_ip);
        let credentials = AccessCredentials::from_packet(request, secret);
        let username = credentials.primary().to_string();

        let decision = match config.authorizer.authorize(&credentials).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    username = %username,
                    client_ip = %source_ip,
                    request_id = request.identifier,
                    error = %e,
                    "Subscriber lookup failed, rejecting"
                );
                config
                    .audit_logger
                    .log(
                        AuditEntry::new(AuditEventType::AccessReject)
                            .with_username(&username)
                            .with_client_ip(source_ip)
                            .with_request_id(request.identifier)
                            .with_details("store error"),
                    )
                    .await;
                return Ok(request.reply(Code::AccessReject));
            }
        };

        match decision {
            AccessDecision::Accept(grant) => {
                info!(
                    username = %grant.username,
                    client_ip = %source_ip,
                    request_id = request.identifier,
                    framed_ip = ?grant.framed_ip,
                    session_timeout = grant.session_timeout,
                    voucher = grant.via_voucher(),
                    "Access accepted"
                );

                if let Some(speeds) = grant.throttle {
                    info!(
                        username = %grant.username,
                        down_kbps = speeds.down_kbps,
                        up_kbps = speeds.up_kbps,
                        "Subscriber over FUP limit"
                    );
                    config
                        .audit_logger
                        .log(
                            AuditEntry::new(AuditEventType::FupThrottled)
                                .with_username(&grant.username)
                                .with_client_ip(source_ip)
                                .with_details(format!(
                                    "down={}kbps up={}kbps",
                                    speeds.down_kbps, speeds.up_kbps
                                )),
                        )
                        .await;
                }

                let event = if grant.via_voucher() {
                    AuditEventType::VoucherAccept
                } else {
                    AuditEventType::AccessAccept
                };
                let mut entry = AuditEntry::new(event)
                    .with_username(&grant.username)
                    .with_client_ip(source_ip)
                    .with_request_id(request.identifier);
                if let Some(ip) = grant.framed_ip {
                    entry = entry.with_framed_ip(ip);
                }
                config.audit_logger.log(entry).await;

                let mut response = request.reply(Code::AccessAccept);
                grant.apply(&mut response)?;
                Ok(response)
            }
            AccessDecision::Reject(reason) => {
                warn!(
                    username = %username,
                    client_ip = %source_ip,
                    request_id = request.identifier,
                    reason = reason.as_str(),
                    "Access rejected"
                );

                config
                    .audit_logger
                    .log(
                        AuditEntry::new(AuditEventType::AccessReject)
                            .with_username(&username)
                            .with_client_ip(source_ip)
                            .with_request_id(request.identifier)
                            .with_details(reason.as_str()),
                    )
                    .await;

                Ok(request.reply(Code::AccessReject))
            }
        }
    }

    /// Handle Accounting-Request packet. Always yields an Accounting-Response.
    async fn handle_accounting_request(
        request: &Packet,
        accounting: &AccountingRequest,
        config: &ServerConfig,
        source_ip: IpAddr,
    ) -> Packet {
        let nas_ip = accounting.nas_ip.map(IpAddr::V4).unwrap_or(source_ip);

        let entry = match config.accounting.process(accounting, nas_ip).await {
            Ok(AccountingOutcome::Started(session)) => {
                let mut entry = AuditEntry::new(AuditEventType::AccountingStart);
                if let Some(ip) = session.framed_ip {
                    entry = entry.with_framed_ip(ip);
                }
                Some(entry)
            }
            Ok(AccountingOutcome::DuplicateStart) => Some(
                AuditEntry::new(AuditEventType::AccountingDropped).with_details("duplicate start"),
            ),
            Ok(AccountingOutcome::Updated {
                disconnect_queued, ..
            }) => Some(fup_details(
                AuditEntry::new(AuditEventType::AccountingUpdate),
                disconnect_queued,
            )),
            Ok(AccountingOutcome::Stopped {
                session,
                disconnect_queued,
            }) => {
                let mut entry = AuditEntry::new(AuditEventType::AccountingStop);
                if let Some(cause) = session.termination_cause {
                    entry = entry.with_details(cause);
                }
                Some(fup_details(entry, disconnect_queued))
            }
            Ok(AccountingOutcome::UnknownSession) => Some(
                AuditEntry::new(AuditEventType::AccountingDropped).with_details("no open session"),
            ),
            Ok(AccountingOutcome::NasStateChange) => None,
            Err(e) => {
                error!(
                    session_id = %accounting.session_id,
                    client_ip = %source_ip,
                    request_id = request.identifier,
                    error = %e,
                    "Accounting store error"
                );
                Some(AuditEntry::new(AuditEventType::AccountingDropped).with_details("store error"))
            }
        };

        if let Some(entry) = entry {
            config
                .audit_logger
                .log(
                    entry
                        .with_username(&accounting.username)
                        .with_session_id(&accounting.session_id)
                        .with_client_ip(source_ip)
                        .with_request_id(request.identifier),
                )
                .await;
        }

        request.reply(Code::AccountingResponse)
    }

    /// Acknowledge an authentic Accounting-Request that carries no usable
    /// session data, such as an unhandled Acct-Status-Type.
    async fn handle_unusable_accounting(
        request: &Packet,
        error: &AccountingError,
        config: &ServerConfig,
        source_ip: IpAddr,
    ) -> Packet {
        warn!(
            client_ip = %source_ip,
            request_id = request.identifier,
            error = %error,
            "Accounting-Request not recorded"
        );

        let mut entry = AuditEntry::new(AuditEventType::AccountingDropped)
            .with_client_ip(source_ip)
            .with_request_id(request.identifier)
            .with_details(error.to_string());
        if let Some(username) = request.string_attribute(AttributeType::UserName) {
            entry = entry.with_username(username);
        }
        if let Some(session_id) = request.string_attribute(AttributeType::AcctSessionId) {
            entry = entry.with_session_id(session_id);
        }
        config.audit_logger.log(entry).await;

        request.reply(Code::AccountingResponse)
    }
}

fn fup_details(entry: AuditEntry, disconnect_queued: bool) -> AuditEntry {
    if disconnect_queued {
        entry.with_details("fup exceeded, disconnect queued")
    } else {
        entry
    }
}
