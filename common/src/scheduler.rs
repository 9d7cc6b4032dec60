use log::{debug, info, warn};

use crate::{
    config::SchedulerConfig,
    mailbox::{MailboxMessage, Recipient},
    messages::{AcCommand, ControlRequest, MainRequest, UplinkRequest},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainAction {
    /// Hold the modem power line low for `off_ms`, then release it.
    PowerCycleModem { off_ms: u64 },
    Mail(Recipient, MailboxMessage),
    SetAcTemp(i32),
    TurnAcOff,
    SetFanState(i32),
    Led(bool),
    Console(String),
}

/// Main-task side of the uplink: paces uploads and association attempts.
#[derive(Debug, Clone)]
pub struct MainTask {
    config: SchedulerConfig,
    association_deadline_ms: u64,
    association_attempts: u32,
    update_countdown: u32,
    get_countdown: u32,
    online_updates: bool,
}

impl MainTask {
    pub fn new(mut config: SchedulerConfig) -> Self {
        config.sanitize();
        Self {
            update_countdown: config.update_period_s,
            get_countdown: config.get_period_s,
            config,
            association_deadline_ms: 0,
            association_attempts: 0,
            online_updates: true,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn association_attempts(&self) -> u32 {
        self.association_attempts
    }

    pub fn online_updates(&self) -> bool {
        self.online_updates
    }

    pub fn set_online_updates(&mut self, enabled: bool) {
        info!("online updates {}", if enabled { "on" } else { "off" });
        self.online_updates = enabled;
    }

    pub fn boot(&mut self, now_ms: u64) -> Vec<MainAction> {
        self.reset_modem(now_ms)
    }

    /// Called once per second.
    pub fn tick(&mut self, now_ms: u64, associated: bool, temp_c: f32) -> Vec<MainAction> {
        let mut actions = Vec::new();
        if !self.online_updates {
            return actions;
        }

        if associated {
            self.association_attempts = 0;
            self.update_server(temp_c, &mut actions);
            return actions;
        }

        if now_ms >= self.association_deadline_ms {
            self.association_attempts += 1;
            if self.association_attempts > self.config.association_max_attempts {
                warn!(
                    "{} association attempts failed; resetting uplink",
                    self.association_attempts - 1
                );
                actions.push(uplink(UplinkRequest::Control(ControlRequest::Reset)));
                self.association_attempts = 0;
            }
            self.association_deadline_ms = now_ms + self.config.association_timeout_ms;
            actions.push(uplink(UplinkRequest::Control(ControlRequest::Associate)));
        }
        actions
    }

    /// Maps one main-inbox line to actions; unknown mail is dropped.
    pub fn handle_mail(&mut self, line: &str, now_ms: u64, temp_c: f32) -> Vec<MainAction> {
        let request = match MailboxMessage::parse(line).and_then(|m| MainRequest::parse(&m)) {
            Ok(request) => request,
            Err(err) => {
                warn!("discarding main mail {line:?}: {err}");
                return Vec::new();
            }
        };
        debug!("main handling {request:?}");

        match request {
            MainRequest::GetTemp => vec![uplink(UplinkRequest::Post(format!(
                "{} degC",
                format_temp(temp_c)
            )))],
            MainRequest::OnboardLed(on) => vec![MainAction::Led(on)],
            MainRequest::AcRemote(AcCommand::SetAcTemp(temp)) => vec![MainAction::SetAcTemp(temp)],
            MainRequest::AcRemote(AcCommand::TurnAcOff) => vec![MainAction::TurnAcOff],
            MainRequest::AcRemote(AcCommand::SetFanState(state)) => {
                vec![MainAction::SetFanState(state)]
            }
            MainRequest::ResetModem => self.reset_modem(now_ms),
            MainRequest::Debug(text) => vec![MainAction::Console(text)],
        }
    }

    fn reset_modem(&mut self, now_ms: u64) -> Vec<MainAction> {
        self.association_deadline_ms = now_ms + self.config.quick_association_ms;
        vec![MainAction::PowerCycleModem {
            off_ms: self.config.modem_reset_ms,
        }]
    }

    fn update_server(&mut self, temp_c: f32, actions: &mut Vec<MainAction>) {
        if self.update_countdown == 0 {
            let path = format!("{}/{}", self.config.post_path, format_temp(temp_c));
            actions.push(uplink(UplinkRequest::Post(path)));
            self.update_countdown = self.config.update_period_s;
        } else {
            self.update_countdown -= 1;
        }

        if self.get_countdown == 0 {
            actions.push(uplink(UplinkRequest::Get(self.config.get_path.clone())));
            self.get_countdown = self.config.get_period_s;
        } else {
            self.get_countdown -= 1;
        }
    }
}

fn uplink(request: UplinkRequest) -> MainAction {
    MainAction::Mail(Recipient::Uplink, request.to_message())
}

fn format_temp(temp_c: f32) -> String {
    format!("{temp_c:.1}")
}
