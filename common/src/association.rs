use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    channel::{CommandChannel, CommandSpec},
    config::{FailureThresholds, NetworkConfig, ServerConfig, UplinkTiming},
    error::{AssociationError, CommandError},
    failure::FailureTracker,
    frame::OK_TERMINATOR,
    http::parse_cid,
    transport::SerialTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssociationState {
    Unassociated,
    Associated,
    Connected,
}

impl AssociationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Associated,
            2 => Self::Connected,
            _ => Self::Unassociated,
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unassociated => "UnAssociated",
            Self::Associated => "Associated",
            Self::Connected => "Connected",
        };
        f.write_str(name)
    }
}

/// Read-only view of the link state for other tasks.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus(Arc<AtomicU8>);

impl LinkStatus {
    pub fn state(&self) -> AssociationState {
        AssociationState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_associated(&self) -> bool {
        self.state() >= AssociationState::Associated
    }

    fn set(&self, state: AssociationState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Modem-assigned handle of one open HTTP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Disassociated,
    SocketFailure,
    Disconnected,
    InvalidCid,
    /// Reply to an open the session already gave up on.
    LateOpen(Option<ConnectionId>),
    WarmBoot,
    Unrecognized,
}

impl LinkEvent {
    pub fn classify(text: &str) -> Self {
        if text.contains("DISASSOCIATED") {
            Self::Disassociated
        } else if text.contains("SOCKET FAILURE") {
            Self::SocketFailure
        } else if text.contains("DISCONNECT") {
            Self::Disconnected
        } else if text.contains("ERROR: INVALID CID") {
            Self::InvalidCid
        } else if text.contains("AT+HTTPOPEN") {
            Self::LateOpen(late_open_cid(text))
        } else if text.contains("UnExpected Warm Boot") {
            Self::WarmBoot
        } else {
            Self::Unrecognized
        }
    }
}

/// CID carried by an `AT+HTTPOPEN` echo that ended in `OK`; either form.
fn late_open_cid(text: &str) -> Option<ConnectionId> {
    let (_, after_echo) = text.split_once('\n')?;
    let payload = &after_echo[..after_echo.rfind(OK_TERMINATOR)?];
    parse_cid(payload.trim_start(), true).ok().map(|(cid, _)| cid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    Ping,
    Survey,
    ConnectionHeader,
    HostHeader,
    UserAgentHeader,
    StaticIp,
    InfrastructureMode,
    WpaSecurity,
    Passphrase,
    Associate,
    EnableDhcp,
}

/// Ordered modem configuration for joining the network.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    steps: Vec<(JoinStep, CommandSpec)>,
}

impl JoinPlan {
    pub fn new(network: &NetworkConfig, server: &ServerConfig, timing: &UplinkTiming) -> Self {
        let spec = |command: String| CommandSpec::new(command, timing);
        let mut steps = vec![
            (JoinStep::Ping, spec("AT".to_string())),
            (
                JoinStep::Survey,
                spec("AT+WS".to_string())
                    .expect(network.ssid.as_str())
                    .retries(timing.survey_retries),
            ),
            (
                JoinStep::ConnectionHeader,
                spec(format!("AT+HTTPCONF=3,{}", server.connection_header)),
            ),
            (
                JoinStep::HostHeader,
                spec(format!("AT+HTTPCONF=11,{}", server.host)),
            ),
            (
                JoinStep::UserAgentHeader,
                spec(format!("AT+HTTPCONF=20,{}", server.user_agent)),
            ),
            (
                JoinStep::StaticIp,
                spec(format!(
                    "AT+NSET={},{},{}",
                    network.static_ip, network.subnet_mask, network.gateway
                )),
            ),
            (JoinStep::InfrastructureMode, spec("AT+WM=0".to_string())),
            (JoinStep::WpaSecurity, spec("AT+WSEC=8".to_string())),
            (
                JoinStep::Passphrase,
                spec(format!("AT+WPAPSK={},{}", network.ssid, network.passphrase))
                    .retries(timing.passphrase_retries)
                    .timeout(timing.passphrase_timeout()),
            ),
            (
                JoinStep::Associate,
                spec(format!("AT+WA={},,", network.ssid)).retries(timing.associate_retries),
            ),
        ];
        if network.enable_dhcp {
            steps.push((JoinStep::EnableDhcp, spec("AT+NDHCP=1".to_string())));
        }
        Self { steps }
    }

    pub fn steps(&self) -> impl Iterator<Item = (JoinStep, &CommandSpec)> {
        self.steps.iter().map(|(step, spec)| (*step, spec))
    }
}

/// Owns the command channel and the association lifecycle of one modem.
pub struct ModemLink {
    channel: CommandChannel,
    state: AssociationState,
    status: LinkStatus,
    tracker: FailureTracker,
    cid: Option<ConnectionId>,
    timing: UplinkTiming,
}

impl ModemLink {
    pub fn new(
        transport: SerialTransport,
        timing: UplinkTiming,
        thresholds: FailureThresholds,
    ) -> Self {
        Self {
            channel: CommandChannel::new(transport),
            state: AssociationState::Unassociated,
            status: LinkStatus::default(),
            tracker: FailureTracker::new(thresholds),
            cid: None,
            timing,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    pub fn is_associated(&self) -> bool {
        self.state >= AssociationState::Associated
    }

    pub fn cid(&self) -> Option<&ConnectionId> {
        self.cid.as_ref()
    }

    pub fn timing(&self) -> &UplinkTiming {
        &self.timing
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut FailureTracker {
        &mut self.tracker
    }

    pub fn transport(&self) -> &SerialTransport {
        self.channel.transport()
    }

    pub fn transition(&mut self, next: AssociationState) {
        if self.state == next {
            return;
        }
        info!("wifi state {} -> {}", self.state, next);
        if self.state == AssociationState::Connected {
            self.cid = None;
        }
        self.state = next;
        self.status.set(next);
    }

    pub(crate) fn open_connection(&mut self, cid: ConnectionId) {
        self.cid = Some(cid);
        self.transition(AssociationState::Connected);
    }

    /// Parses buffered input and reacts to every frame nobody claimed.
    pub fn poll(&mut self) {
        self.channel.transport().parse();
        if !self.channel.transport().message_pending() {
            return;
        }
        let frames = match self.channel.transport().read_and_erase_all() {
            Ok(frames) => frames,
            Err(err) => {
                debug!("skipping idle drain: {err}");
                return;
            }
        };
        for frame in frames {
            let text = frame.text();
            match LinkEvent::classify(&text) {
                LinkEvent::Disassociated => {
                    warn!("modem reports DISASSOCIATED");
                    self.transition(AssociationState::Unassociated);
                }
                LinkEvent::SocketFailure | LinkEvent::Disconnected | LinkEvent::InvalidCid => {
                    debug!("connection {:?} dropped: {text:?}", self.cid);
                    self.downgrade();
                }
                LinkEvent::LateOpen(Some(cid)) => {
                    info!("late HTTPOPEN reply; closing connection {cid}");
                    self.cid = Some(cid);
                    self.close_connection();
                }
                LinkEvent::LateOpen(None) => {
                    debug!("late HTTPOPEN reply without a connection");
                }
                LinkEvent::WarmBoot => {
                    warn!("unexpected modem warm boot");
                    self.restart();
                }
                LinkEvent::Unrecognized => {
                    debug!("rejecting {text:?}");
                }
            }
        }
    }

    /// Connected -> Associated; other states are left alone.
    pub fn downgrade(&mut self) {
        if self.state == AssociationState::Connected {
            self.transition(AssociationState::Associated);
        }
    }

    /// Runs the join plan; any failed step leaves the link unassociated.
    pub fn associate(&mut self, plan: &JoinPlan) -> Result<(), AssociationError> {
        for (step, spec) in plan.steps() {
            debug!("join step {step:?}: {:?}", spec.command);
            if let Err(source) = self.channel.send_and_await(spec, &mut self.tracker) {
                warn!("association aborted at {step:?}: {source}");
                self.transition(AssociationState::Unassociated);
                return Err(AssociationError { step, source });
            }
        }
        self.transition(AssociationState::Associated);
        Ok(())
    }

    /// Waits two poll periods and reports whether the connection is gone.
    pub fn connection_dropped(&mut self) -> bool {
        thread::sleep(self.timing.poll_period() * 2);
        self.poll();
        let dropped = self.state != AssociationState::Connected;
        if dropped {
            debug!("connection closed by the server");
        }
        dropped
    }

    pub fn close_connection(&mut self) {
        if self.state == AssociationState::Connected && self.connection_dropped() {
            return;
        }
        let Some(cid) = self.cid.clone() else {
            self.downgrade();
            return;
        };
        let spec = CommandSpec::new(format!("AT+HTTPCLOSE={cid}"), &self.timing);
        match self.channel.send_and_await(&spec, &mut self.tracker) {
            Ok(_) => {
                info!("connection {cid} closed");
                self.cid = None;
                self.downgrade();
            }
            Err(err) => warn!("unable to close connection {cid}: {err}"),
        }
    }

    /// Forgets all link state and counters after a modem reset.
    pub fn restart(&mut self) {
        self.tracker.reset();
        self.cid = None;
        self.transition(AssociationState::Unassociated);
        self.channel.transport().restart();
    }

    pub fn send(&mut self, spec: &CommandSpec) -> Result<String, CommandError> {
        self.channel.send_and_await(spec, &mut self.tracker)
    }

    pub fn send_and_extract(&mut self, spec: &CommandSpec) -> Result<String, CommandError> {
        self.channel.send_and_extract(spec, &mut self.tracker)
    }

    pub fn send_raw(&mut self, command: &str) -> String {
        let spec = CommandSpec::new(command, &self.timing);
        self.channel.send_raw(&spec, &mut self.tracker)
    }
}
