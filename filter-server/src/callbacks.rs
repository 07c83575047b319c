//! Greylisting on top of the filter protocol.
//!
//! Senders are remembered per session from `tx-mail` reports and paired with
//! the recipient of the following `rcpt-to` filter request. The pair's
//! fingerprint is then checked against the greylist store.

use async_trait::async_trait;
use filter::{
    FilterCallbacks, FilterEvent, FilterRequest, Report, ReportEvent, Subscription, Verdict,
};
use tracing::{error, info, trace, warn};

use crate::{
    config::CfgFilter,
    fingerprint::Fingerprint,
    sessions::SessionRegistry,
    storage::{Decision, GreylistStore, StoreError},
};

const SMTP_IN: &str = "smtp-in";

pub struct Greylister {
    sessions: SessionRegistry,
    store: Box<dyn GreylistStore>,
    reject: Verdict,
}

impl Greylister {
    pub fn new(store: Box<dyn GreylistStore>, cfg: &CfgFilter) -> Self {
        Greylister {
            sessions: SessionRegistry::new(),
            store,
            reject: Verdict::reject(cfg.reject_code, cfg.reject_message.clone()),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    async fn on_rcpt_to(&mut self, session: &str, recipient: Option<&str>) -> Verdict {
        let Some(sender) = self.sessions.consume_sender(session) else {
            warn!("Sender missing, allowing filter input");
            return Verdict::Proceed;
        };
        trace!("GC-ed mail sender");

        let Some(recipient) = recipient else {
            warn!("Recipient missing, allowing filter input");
            return Verdict::Proceed;
        };

        let fingerprint = Fingerprint::new(&sender, recipient);
        match self.store.decide(&fingerprint).await {
            Ok(Decision::New) => {
                info!(%fingerprint, "Greylisted");
                self.reject.clone()
            }
            Ok(Decision::Pending) => {
                info!(%fingerprint, "Still greylisted");
                self.reject.clone()
            }
            Ok(Decision::Allow) => {
                info!(%fingerprint, "Allowing filter input");
                Verdict::Proceed
            }
            Err(e) => fail_open(self.store.name(), &e),
        }
    }
}

/// Store failures let the request through.
fn fail_open(store: &str, e: &StoreError) -> Verdict {
    error!(store, error = ?e, "Greylist store failed, allowing filter input");
    Verdict::Proceed
}

#[async_trait]
impl FilterCallbacks for Greylister {
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::report(SMTP_IN, "tx-mail"),
            Subscription::report(SMTP_IN, "link-disconnect"),
            Subscription::filter(SMTP_IN, "rcpt-to"),
        ]
    }

    async fn on_report(&mut self, report: &Report) -> bool {
        let session = &report.envelope.session;

        match &report.event {
            ReportEvent::TxMail(tx) if tx.result.is_ok() => {
                self.sessions.note_sender(session, &tx.address);
                trace!("Noted mail sender");
            }
            ReportEvent::TxMail(_) | ReportEvent::LinkDisconnect => {
                self.sessions.forget(session);
                trace!("GC-ed mail sender");
            }
            ReportEvent::Other => return false,
        }

        true
    }

    async fn on_filter(&mut self, request: &FilterRequest) -> Verdict {
        match &request.event {
            FilterEvent::RcptTo { recipient } => {
                self.on_rcpt_to(&request.envelope.session, recipient.as_deref())
                    .await
            }
            FilterEvent::Other => {
                warn!("Unexpected filter phase, allowing filter input");
                Verdict::Proceed
            }
        }
    }
}
