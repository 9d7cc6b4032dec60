use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    association::{AssociationState, JoinPlan, LinkStatus, ModemLink},
    config::RuntimeConfig,
    failure::Recovery,
    http::HttpSession,
    mailbox::{Mailbox, MailboxMessage, Recipient},
    messages::{ControlRequest, UplinkRequest},
    subjects::*,
    transport::SerialTransport,
};

/// The uplink task: owns the modem link and serves the uplink inbox.
pub struct Uplink {
    link: ModemLink,
    session: HttpSession,
    mailbox: Arc<Mailbox>,
    plan: JoinPlan,
}

impl Uplink {
    pub fn new(transport: SerialTransport, config: &RuntimeConfig, mailbox: Arc<Mailbox>) -> Self {
        let link = ModemLink::new(transport, config.timing.clone(), config.thresholds);
        let session = HttpSession::new(
            config.server.clone(),
            config.scheduler.ack_path.clone(),
            Arc::clone(&mailbox),
        );
        let plan = JoinPlan::new(&config.network, &config.server, &config.timing);
        Self {
            link,
            session,
            mailbox,
            plan,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    pub fn link(&self) -> &ModemLink {
        &self.link
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("uplink task started");
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once();
        }
        info!("uplink task stopped");
    }

    pub fn run_once(&mut self) {
        self.link.poll();

        // Mail posted while handling waits for the next pass.
        let pending = self.mailbox.count(Recipient::Uplink);
        for _ in 0..pending {
            let Some(line) = self.mailbox.get(Recipient::Uplink) else {
                break;
            };
            self.handle(&line);
        }

        self.check_for_errors();
        thread::sleep(self.link.timing().poll_period());
    }

    fn handle(&mut self, line: &str) {
        let request = match MailboxMessage::parse(line).and_then(|m| UplinkRequest::parse(&m)) {
            Ok(request) => request,
            Err(err) => {
                warn!("discarding uplink mail {line:?}: {err}");
                return;
            }
        };
        debug!("uplink handling {request:?}");

        match request {
            UplinkRequest::Post(content) => {
                if !self.ready_for_session("POST") {
                    return;
                }
                let retries = self.link.timing().retries;
                if let Err(err) = self.session.post(&mut self.link, &content, retries) {
                    debug!("POST {content:?}: {err}");
                }
                self.link.tracker_mut().reset_rejected();
            }
            UplinkRequest::Get(content) => {
                if !self.ready_for_session("GET") {
                    return;
                }
                let retries = self.link.timing().retries;
                if let Err(err) = self.session.get(&mut self.link, &content, retries) {
                    debug!("GET {content:?}: {err}");
                }
                self.link.tracker_mut().reset_rejected();
            }
            UplinkRequest::Control(ControlRequest::Associate) => self.associate(),
            UplinkRequest::Control(ControlRequest::Reset) => self.hard_recovery(),
            UplinkRequest::Debug(command) => {
                let reply = self.link.send_raw(&command);
                self.mailbox.post(Recipient::Main, SUBJECT_DEBUG, &reply);
            }
        }
    }

    fn ready_for_session(&mut self, kind: &str) -> bool {
        if self.link.state() == AssociationState::Associated {
            return true;
        }
        debug!("rejecting {kind} request while {}", self.link.state());
        self.link.tracker_mut().record_rejected();
        false
    }

    fn associate(&mut self) {
        if self.link.is_associated() {
            debug!("already associated");
            return;
        }
        // Start from a clean queue, boot banner included.
        self.link.poll();

        info!("association started");
        self.mailbox.post(Recipient::Main, SUBJECT_ONBOARD_LED, LED_ON);
        match self.link.associate(&self.plan) {
            Ok(()) => info!("association done"),
            Err(err) => warn!("{err}"),
        }
        self.mailbox.post(Recipient::Main, SUBJECT_ONBOARD_LED, LED_OFF);
    }

    fn check_for_errors(&mut self) {
        match self.link.tracker_mut().check() {
            Some(Recovery::Soft) => self.link.downgrade(),
            Some(Recovery::Hard) => self.hard_recovery(),
            None => {}
        }
    }

    fn hard_recovery(&mut self) {
        warn!("resetting uplink and requesting modem power cycle");
        self.link.restart();
        self.mailbox
            .post(Recipient::Main, SUBJECT_WIFI_MODULE, WIFI_RESET);
    }
}
