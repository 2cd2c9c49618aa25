//! Accounting-Request processing and session records
//!
//! Start opens a session record. Interim-Update and Stop overwrite the
//! counters of the open record with the same Acct-Session-Id; Stop also
//! closes it. Updates for a session that is not open are dropped.
//! After an update the subscriber's FUP status is rechecked and an
//! over-limit session is queued for disconnect.

use crate::coa::{CoaAction, CoaDispatcher, CoaJob};
use crate::fup::FupEvaluator;
use crate::model::{NewSession, RadiusSession};
use crate::store::{SessionStore, StoreError, SubscriberStore};
use chrono::Utc;
use radius_wire::{AccountingRequest, AcctStatusType};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one Accounting-Request. Every variant is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingOutcome {
    Started(RadiusSession),
    /// Start for a session id that is already open
    DuplicateStart,
    Updated {
        session: RadiusSession,
        disconnect_queued: bool,
    },
    Stopped {
        session: RadiusSession,
        disconnect_queued: bool,
    },
    /// Interim-Update or Stop with no open session
    UnknownSession,
    /// Accounting-On or Accounting-Off
    NasStateChange,
}

pub struct AccountingProcessor {
    sessions: Arc<dyn SessionStore>,
    subscribers: Arc<dyn SubscriberStore>,
    fup: Arc<FupEvaluator>,
    dispatcher: Arc<CoaDispatcher>,
}

impl AccountingProcessor {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        subscribers: Arc<dyn SubscriberStore>,
        fup: Arc<FupEvaluator>,
        dispatcher: Arc<CoaDispatcher>,
    ) -> Self {
        AccountingProcessor {
            sessions,
            subscribers,
            fup,
            dispatcher,
        }
    }

    /// Apply one accounting request. `nas_ip` is the NAS-IP-Address or, when
    /// absent, the packet source; it is also the CoA destination.
    pub async fn process(
        &self,
        request: &AccountingRequest,
        nas_ip: IpAddr,
    ) -> Result<AccountingOutcome, StoreError> {
        match request.status {
            AcctStatusType::Start => self.start(request, nas_ip).await,
            AcctStatusType::InterimUpdate | AcctStatusType::Stop => {
                self.update(request, nas_ip).await
            }
            AcctStatusType::AccountingOn | AcctStatusType::AccountingOff => {
                info!(%nas_ip, status = ?request.status, "NAS accounting state change");
                Ok(AccountingOutcome::NasStateChange)
            }
        }
    }

    async fn start(
        &self,
        request: &AccountingRequest,
        nas_ip: IpAddr,
    ) -> Result<AccountingOutcome, StoreError> {
        if self
            .sessions
            .find_open_session(&request.session_id)
            .await?
            .is_some()
        {
            warn!(session_id = %request.session_id, username = %request.username, "Duplicate Start for open session");
            return Ok(AccountingOutcome::DuplicateStart);
        }

        let user_id = self
            .subscribers
            .find_subscriber_by_username(&request.username)
            .await?
            .map(|s| s.id);

        let created = self
            .sessions
            .create_session(NewSession {
                user_id,
                username: request.username.clone(),
                nas_ip: nas_ip.to_string(),
                framed_ip: request.framed_ip,
                session_id: request.session_id.clone(),
                start_time: Utc::now(),
            })
            .await;

        match created {
            Ok(session) => {
                info!(
                    session_id = %session.session_id,
                    username = %session.username,
                    %nas_ip,
                    "Accounting session started"
                );
                Ok(AccountingOutcome::Started(session))
            }
            // Lost a race with a concurrent Start for the same id
            Err(StoreError::Conflict(_)) => Ok(AccountingOutcome::DuplicateStart),
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        request: &AccountingRequest,
        nas_ip: IpAddr,
    ) -> Result<AccountingOutcome, StoreError> {
        let Some(mut session) = self.sessions.find_open_session(&request.session_id).await?
        else {
            debug!(
                session_id = %request.session_id,
                status = ?request.status,
                "No open session, dropping accounting update"
            );
            return Ok(AccountingOutcome::UnknownSession);
        };

        session.input_octets = request.input_octets;
        session.output_octets = request.output_octets;
        if session.framed_ip.is_none() {
            session.framed_ip = request.framed_ip;
        }
        let stopping = request.status == AcctStatusType::Stop;
        if stopping {
            session.stop_time = Some(Utc::now());
            session.termination_cause = request.terminate_cause_name();
        }
        self.sessions.update_session(&session).await?;

        debug!(
            session_id = %session.session_id,
            input_octets = session.input_octets,
            output_octets = session.output_octets,
            stopped = stopping,
            "Accounting session updated"
        );

        let disconnect_queued = self.enforce_fup(request, nas_ip).await;

        Ok(if stopping {
            AccountingOutcome::Stopped {
                session,
                disconnect_queued,
            }
        } else {
            AccountingOutcome::Updated {
                session,
                disconnect_queued,
            }
        })
    }

    /// Queue a disconnect if the subscriber is over its FUP limit.
    /// Lookup or evaluation failures are logged and treated as within limits.
    async fn enforce_fup(&self, request: &AccountingRequest, nas_ip: IpAddr) -> bool {
        let subscriber = match self
            .subscribers
            .find_subscriber_by_username(&request.username)
            .await
        {
            Ok(Some(subscriber)) => subscriber,
            Ok(None) => return false,
            Err(e) => {
                warn!(username = %request.username, error = %e, "Subscriber lookup failed during FUP check");
                return false;
            }
        };

        let package_id = subscriber.package_id.unwrap_or(0);
        match self.fup.check_fup_status(subscriber.id, package_id).await {
            Ok(true) => {
                info!(
                    username = %request.username,
                    session_id = %request.session_id,
                    %nas_ip,
                    "Subscriber exceeded FUP during session, disconnecting"
                );
                self.dispatcher.submit(CoaJob {
                    nas_ip,
                    username: request.username.clone(),
                    session_id: request.session_id.clone(),
                    action: CoaAction::Disconnect,
                })
            }
            Ok(false) => false,
            Err(e) => {
                warn!(username = %request.username, error = %e, "FUP check failed");
                false
            }
        }
    }
}
