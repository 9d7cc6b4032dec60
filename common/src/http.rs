//! Pseudo-HTTP exchanges driven through the modem's `AT+HTTP*` commands.
//!
//! One exchange opens a connection, sends `/<message>/<counter>` and expects
//! the server to close the connection itself once it has answered.

use std::{sync::Arc, thread};

use log::{debug, info, warn};

use crate::{
    association::{AssociationState, ConnectionId, ModemLink},
    channel::CommandSpec,
    config::ServerConfig,
    deadline::Deadline,
    error::{PayloadError, SessionError},
    mailbox::{Mailbox, Recipient},
    messages::AcCommand,
};

pub const HTTP_OK: &str = "200 OK\r\n";

const POST_LED_PIN: u8 = 31;
const GET_LED_PIN: u8 = 30;

/// Reads the connection id out of an `AT+HTTPOPEN` payload.
pub fn parse_cid(reply: &str, direct_numeric: bool) -> Result<(ConnectionId, u32), SessionError> {
    let malformed = || SessionError::MalformedCid(reply.to_string());
    let raw = if reply.starts_with("IP:") {
        reply
            .split(['\r', '\n'])
            .filter(|part| !part.is_empty())
            .nth(1)
    } else if direct_numeric {
        Some(reply)
    } else {
        None
    };
    let raw = raw.map(str::trim).ok_or_else(malformed)?;

    let value = u32::from_str_radix(raw, 16).map_err(|_| malformed())?;
    Ok((ConnectionId::new(raw), value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// Already delivered on an earlier poll.
    Recurrent,
    New(Vec<AcCommand>),
}

impl RemoteUpdate {
    /// Parses `isNew#Command#DestTemp#FanState`.
    pub fn parse(body: &str) -> Result<Self, PayloadError> {
        let fields: Vec<&str> = body.trim().split('#').collect();
        let [is_new, command, dest_temp, fan_state] = fields.as_slice() else {
            return Err(PayloadError::FieldCount(fields.len()));
        };
        let is_new: i16 = is_new
            .trim()
            .parse()
            .map_err(|_| PayloadError::BadFlag(is_new.to_string()))?;
        if is_new != 1 {
            return Ok(Self::Recurrent);
        }

        let number = |raw: &str| {
            raw.trim()
                .parse::<i32>()
                .map_err(|_| PayloadError::BadValue(raw.to_string()))
        };
        let commands = match *command {
            "ON" => vec![
                AcCommand::SetFanState(number(*fan_state)?),
                AcCommand::SetAcTemp(number(*dest_temp)?),
            ],
            "OFF" => vec![AcCommand::TurnAcOff],
            other => {
                debug!("ignoring remote command {other:?}");
                Vec::new()
            }
        };
        Ok(Self::New(commands))
    }
}

pub struct HttpSession {
    server: ServerConfig,
    ack_path: String,
    mailbox: Arc<Mailbox>,
    counter: u32,
}

impl HttpSession {
    pub fn new(server: ServerConfig, ack_path: impl Into<String>, mailbox: Arc<Mailbox>) -> Self {
        Self {
            server,
            ack_path: ack_path.into(),
            mailbox,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Uploads `message`; succeeds once the server answers with the ack text.
    pub fn post(
        &mut self,
        link: &mut ModemLink,
        message: &str,
        retries: u32,
    ) -> Result<(), SessionError> {
        self.clear_to_open(link)?;
        self.activity_led(link, POST_LED_PIN, true);
        info!("HTTP/POST {message:?} started");

        let mut outcome = Err(SessionError::RetriesExhausted(retries));
        for attempt in 1..=retries {
            match self.exchange(link, message) {
                Ok(body) if body.contains(self.server.post_ack.as_str()) => {
                    outcome = Ok(());
                    break;
                }
                Ok(body) => {
                    debug!("POST attempt {attempt}: unexpected body {body:?}");
                    outcome = Err(SessionError::UnexpectedAck(body));
                }
                Err(err) => {
                    debug!("POST attempt {attempt}: {err}");
                    outcome = Err(err);
                }
            }
            if attempt < retries {
                thread::sleep(link.timing().poll_period());
            }
        }

        match &outcome {
            Ok(()) => info!("HTTP/POST {message:?} done"),
            Err(err) => warn!("HTTP/POST {message:?} failed: {err}"),
        }
        self.activity_led(link, POST_LED_PIN, false);
        outcome
    }

    /// Fetches `message` and routes any new AC command to the main task.
    ///
    /// A body that does not parse is not actionable; the call still succeeds
    /// with `None`.
    pub fn get(
        &mut self,
        link: &mut ModemLink,
        message: &str,
        retries: u32,
    ) -> Result<Option<RemoteUpdate>, SessionError> {
        self.clear_to_open(link)?;
        self.activity_led(link, GET_LED_PIN, true);
        info!("HTTP/GET {message:?} started");

        let mut outcome = Err(SessionError::RetriesExhausted(retries));
        for attempt in 1..=retries {
            match self.exchange(link, message) {
                Ok(body) => {
                    let update = match RemoteUpdate::parse(&body) {
                        Ok(update) => Some(update),
                        Err(err) => {
                            warn!("cannot parse GET reply {body:?}: {err}");
                            None
                        }
                    };
                    if let Some(RemoteUpdate::New(commands)) = &update {
                        self.route(commands);
                        let ack_path = self.ack_path.clone();
                        let ack_retries = link.timing().retries;
                        if let Err(err) = self.post(link, &ack_path, ack_retries) {
                            warn!("GET ack not delivered: {err}");
                        }
                    }
                    outcome = Ok(update);
                    break;
                }
                Err(err) => {
                    debug!("GET attempt {attempt}: {err}");
                    outcome = Err(err);
                }
            }
            link.poll();
            if attempt < retries {
                thread::sleep(link.timing().poll_period());
            }
        }

        match &outcome {
            Ok(_) => info!("HTTP/GET {message:?} done"),
            Err(err) => warn!("HTTP/GET {message:?} failed: {err}"),
        }
        self.activity_led(link, GET_LED_PIN, false);
        outcome
    }

    /// One open/send/close round trip; returns the text after `200 OK`.
    pub fn exchange(&mut self, link: &mut ModemLink, message: &str) -> Result<String, SessionError> {
        let id = self.counter;
        self.counter = self.counter.wrapping_add(1);
        debug!("HTTP session #{id}");

        let timing = link.timing().clone();
        let open = CommandSpec::new(
            format!("AT+HTTPOPEN={},{},0", self.server.host, self.server.port),
            &timing,
        );
        let reply = link.send_and_extract(&open)?;

        let (cid, value) = match parse_cid(&reply, self.server.direct_numeric_cid) {
            Ok(parsed) => parsed,
            Err(err) => {
                link.tracker_mut().record_server_failure();
                return Err(err);
            }
        };
        if value > 0 {
            warn!("connection id {cid} is not zero; treating server as failed");
            link.tracker_mut().saturate_server_failures();
        }
        debug!("connected to server [{cid}]");
        link.open_connection(cid.clone());

        if link.connection_dropped() {
            return Err(SessionError::DroppedByServer);
        }

        let send = CommandSpec::new(format!("AT+HTTPSEND={cid},1,2,/{message}/{id}"), &timing)
            .retries(timing.http_send_retries)
            .timeout(timing.http_timeout());
        let reply = match link.send_and_extract(&send) {
            Ok(reply) => reply,
            Err(err) => {
                link.close_connection();
                link.tracker_mut().record_server_failure();
                return Err(err.into());
            }
        };

        let Some(index) = reply.find(HTTP_OK) else {
            link.tracker_mut().record_server_failure();
            return Err(SessionError::MissingHttpOk);
        };
        let body = reply[index + HTTP_OK.len()..].to_string();

        // The server acknowledges receipt by closing the connection.
        if link.connection_dropped() {
            link.tracker_mut().server_ok();
        } else {
            warn!("server kept connection {cid} open; possible server error");
            link.close_connection();
            link.tracker_mut().record_server_failure();
        }
        Ok(body)
    }

    fn clear_to_open(&self, link: &mut ModemLink) -> Result<(), SessionError> {
        let result = self.wait_for_idle_link(link);
        if result.is_err() {
            link.tracker_mut().record_server_failure();
        }
        result
    }

    fn wait_for_idle_link(&self, link: &mut ModemLink) -> Result<(), SessionError> {
        let deadline = Deadline::arm(link.timing().http_timeout());
        loop {
            match link.state() {
                AssociationState::Associated => return Ok(()),
                AssociationState::Unassociated => return Err(SessionError::NotAssociated),
                AssociationState::Connected if deadline.expired() => {
                    return Err(SessionError::LinkBusy)
                }
                AssociationState::Connected => {
                    link.poll();
                    thread::sleep(link.timing().poll_period());
                }
            }
        }
    }

    fn route(&self, commands: &[AcCommand]) {
        for command in commands {
            let message = command.to_message();
            info!("remote command {message}");
            self.mailbox.post_message(Recipient::Main, &message);
        }
    }

    fn activity_led(&self, link: &mut ModemLink, pin: u8, on: bool) {
        if !self.server.activity_leds {
            return;
        }
        let spec = CommandSpec::new(format!("AT+DGPIO={pin},{}", u8::from(on)), link.timing());
        if let Err(err) = link.send(&spec) {
            debug!("activity LED {pin}: {err}");
        }
    }
}
