//! Command/reply engine on top of [`SerialTransport`].
//!
//! Every call writes one AT command, then waits on the receive arena until a
//! new frame is decoded or the call's [`Deadline`] fires. Replies are matched
//! by their command echo; unrelated frames stay queued for the idle drain.

use std::{thread, time::Duration};

use log::{debug, trace};

use crate::{
    config::UplinkTiming,
    deadline::Deadline,
    error::CommandError,
    failure::FailureTracker,
    frame::OK_TERMINATOR,
    transport::SerialTransport,
};

/// Echo artifact between a command and its payload.
const ECHO_SUFFIX_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    /// Substring the accepted reply must carry besides `OK`.
    pub expect: Option<String>,
    pub retries: u32,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, timing: &UplinkTiming) -> Self {
        Self {
            command: command.into(),
            expect: None,
            retries: timing.retries,
            timeout: timing.reply_timeout(),
        }
    }

    pub fn expect(mut self, expect: impl Into<String>) -> Self {
        self.expect = Some(expect.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Text before the first `=`.
    pub fn head(&self) -> &str {
        command_head(&self.command)
    }
}

pub fn command_head(command: &str) -> &str {
    command.split('=').next().unwrap_or(command)
}

/// Payload between the echoed command and the final `OK` terminator.
pub fn extract_payload<'a>(reply: &'a str, command: &str) -> Option<&'a str> {
    let start = reply.find(command_head(command))? + command.len() + ECHO_SUFFIX_LEN;
    let end = reply.rfind(OK_TERMINATOR)?;
    reply.get(start..end)
}

pub struct CommandChannel {
    transport: SerialTransport,
}

impl CommandChannel {
    pub fn new(transport: SerialTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &SerialTransport {
        &self.transport
    }

    /// Sends `spec` until a reply echoes the command and carries `OK`.
    pub fn send_and_await(
        &mut self,
        spec: &CommandSpec,
        tracker: &mut FailureTracker,
    ) -> Result<String, CommandError> {
        debug_assert!(spec.command.starts_with("AT"), "not an AT command");

        let mut timed_out = false;
        for attempt in 1..=spec.retries {
            if !self.write_and_wait(spec)? {
                debug!("{:?} timed out (attempt {attempt}/{})", spec.command, spec.retries);
                tracker.record_comm_failure();
                timed_out = true;
                continue;
            }
            timed_out = false;

            match self.take_matching(|text| text.starts_with(spec.command.as_str())) {
                Some(reply) => {
                    let expected = spec
                        .expect
                        .as_deref()
                        .map_or(true, |needle| reply.contains(needle));
                    if expected && reply.contains(OK_TERMINATOR) {
                        trace!("accepted {reply:?}");
                        return Ok(reply);
                    }
                    debug!("{:?} rejected reply {reply:?}", spec.command);
                }
                None => debug!("no reply echoes {:?}", spec.command),
            }
            // Rejected or missing replies wait out the timeout before the resend.
            thread::sleep(spec.timeout);
        }

        let command = spec.command.clone();
        let attempts = spec.retries;
        Err(if timed_out {
            CommandError::Timeout { command, attempts }
        } else {
            CommandError::NoAcceptableReply { command, attempts }
        })
    }

    /// Sends `spec` and returns the reply payload. A timeout ends the call at
    /// once so a late reply is left to the idle drain.
    pub fn send_and_extract(
        &mut self,
        spec: &CommandSpec,
        tracker: &mut FailureTracker,
    ) -> Result<String, CommandError> {
        debug_assert!(spec.command.starts_with("AT"), "not an AT command");

        for attempt in 1..=spec.retries {
            if !self.write_and_wait(spec)? {
                debug!("{:?} timed out waiting for payload", spec.command);
                tracker.record_comm_failure();
                return Err(CommandError::Timeout {
                    command: spec.command.clone(),
                    attempts: attempt,
                });
            }

            let head = spec.head();
            match self.take_matching(|text| text.contains(head)) {
                Some(reply) if reply.contains(OK_TERMINATOR) => {
                    match extract_payload(&reply, &spec.command) {
                        Some(payload) => {
                            trace!("payload {payload:?}");
                            return Ok(payload.to_string());
                        }
                        None => debug!("cannot extract payload from {reply:?}"),
                    }
                }
                Some(reply) => debug!("{:?} reply without OK: {reply:?}", spec.command),
                None => debug!("no reply mentions {:?}", spec.command),
            }
            thread::sleep(spec.timeout);
        }

        Err(CommandError::NoAcceptableReply {
            command: spec.command.clone(),
            attempts: spec.retries,
        })
    }

    /// Writes `spec.command` untouched and returns whichever frame mentions
    /// its head, or an error text.
    pub fn send_raw(&mut self, spec: &CommandSpec, tracker: &mut FailureTracker) -> String {
        for attempt in 1..=spec.retries {
            match self.write_and_wait(spec) {
                Ok(true) => {}
                Ok(false) => {
                    tracker.record_comm_failure();
                    return "[ERROR: Reply timed out.]".to_string();
                }
                Err(err) => return format!("[ERROR: {err}]"),
            }

            let head = spec.head();
            if let Some(reply) = self.take_matching(|text| text.contains(head)) {
                return reply;
            }
            if attempt < spec.retries {
                thread::sleep(spec.timeout);
            }
        }
        "[ERROR: Could not get reply.]".to_string()
    }

    /// Returns `false` when the deadline fired before a new frame arrived.
    fn write_and_wait(&mut self, spec: &CommandSpec) -> Result<bool, CommandError> {
        // Settle whatever is already buffered so an old hint cannot pass for
        // the new reply.
        self.transport.parse();
        let baseline = self.transport.pending_count();

        let mut deadline = Deadline::arm(spec.timeout);
        self.transport
            .write(&spec.command)
            .map_err(|source| CommandError::Write {
                command: spec.command.clone(),
                source,
            })?;

        loop {
            self.transport.parse();
            if self.transport.pending_count() > baseline {
                deadline.cancel();
                return Ok(true);
            }
            match deadline.remaining() {
                Some(left) => {
                    self.transport.wait_for_frame(left);
                }
                None => return Ok(false),
            }
        }
    }

    fn take_matching(&self, matches: impl Fn(&str) -> bool) -> Option<String> {
        let pending = match self.transport.read_all() {
            Ok(pending) => pending,
            Err(err) => {
                debug!("cannot inspect replies: {err}");
                return None;
            }
        };
        match pending.position(|frame| matches(&frame.text())) {
            Some(index) => pending.take(index).map(|frame| frame.text().into_owned()),
            None => {
                pending.release();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FailureThresholds,
        testing::{echo_error, echo_ok, fast_timing, scripted_transport},
    };
    use std::time::Instant;

    fn tracker() -> FailureTracker {
        FailureTracker::new(FailureThresholds::default())
    }

    #[test]
    fn survey_reply_is_accepted_first_time() {
        let (transport, log) = scripted_transport(|command| {
            (command == "AT+WS=MySSID").then(|| b"AT+WS=MySSID\r\nOK\r\n".to_vec())
        });
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+WS=MySSID", &fast_timing());

        let reply = channel.send_and_await(&spec, &mut tracker).unwrap();
        assert_eq!(reply, "AT+WS=MySSID\r\nOK\r\n");
        assert_eq!(log.count("AT+WS"), 1);
        assert_eq!(tracker.comm_failures(), 0);
    }

    #[test]
    fn bare_error_stream_exhausts_retries() {
        let (transport, log) = scripted_transport(|_| Some(b"\r\nERROR\r\n".to_vec()));
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+WS=MySSID", &fast_timing());

        let err = channel.send_and_await(&spec, &mut tracker).unwrap_err();
        assert!(matches!(err, CommandError::Timeout { attempts: 3, .. }));
        assert_eq!(log.count("AT+WS"), 3);
        assert_eq!(tracker.comm_failures(), 3);
    }

    #[test]
    fn missing_expected_text_is_retried_then_rejected() {
        let (transport, log) = scripted_transport(|command| {
            Some(format!("{command}\r\r\nOtherNet\r\n\r\nOK\r\n").into_bytes())
        });
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+WS", &fast_timing())
            .expect("MySSID")
            .retries(2);

        let err = channel.send_and_await(&spec, &mut tracker).unwrap_err();
        assert!(matches!(err, CommandError::NoAcceptableReply { attempts: 2, .. }));
        assert_eq!(log.count("AT+WS"), 2);
        assert_eq!(tracker.comm_failures(), 0);
    }

    #[test]
    fn rejected_reply_waits_out_timeout_before_resend() {
        let (transport, log) = scripted_transport(|command| Some(echo_error(command)));
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+WPAPSK=a,b", &fast_timing())
            .timeout(Duration::from_millis(40))
            .retries(3);

        let started = Instant::now();
        let err = channel.send_and_await(&spec, &mut tracker).unwrap_err();
        assert!(matches!(err, CommandError::NoAcceptableReply { attempts: 3, .. }));
        assert_eq!(log.count("AT+WPAPSK"), 3);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn extract_waits_out_timeout_after_reply_without_ok() {
        let (transport, log) = scripted_transport(|command| Some(echo_error(command)));
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+HTTPOPEN=example.com,80,0", &fast_timing())
            .timeout(Duration::from_millis(40))
            .retries(2);

        let started = Instant::now();
        let err = channel.send_and_extract(&spec, &mut tracker).unwrap_err();
        assert!(matches!(err, CommandError::NoAcceptableReply { attempts: 2, .. }));
        assert_eq!(log.count("AT+HTTPOPEN"), 2);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn unrelated_frames_stay_queued() {
        let (transport, _log) = scripted_transport(|command| {
            let mut reply = b"UnExpected Warm Boot\r\n\r\nOK\r\n".to_vec();
            reply.extend(echo_ok(command));
            Some(reply)
        });
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();

        channel
            .send_and_await(&CommandSpec::new("AT", &fast_timing()), &mut tracker)
            .unwrap();
        assert_eq!(channel.transport().pending_count(), 1);
        assert!(!channel.transport().is_locked());
    }

    #[test]
    fn extracts_payload_between_echo_and_ok() {
        let (transport, _log) = scripted_transport(|command| {
            Some(format!("{command}\r\r\nIP:50.19.109.98\r\n0\r\n\r\nOK\r\n").into_bytes())
        });
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+HTTPOPEN=example.com,80,0", &fast_timing());

        let payload = channel.send_and_extract(&spec, &mut tracker).unwrap();
        assert_eq!(payload, "IP:50.19.109.98\r\n0\r\n");
    }

    #[test]
    fn extract_gives_up_on_first_timeout() {
        let (transport, log) = scripted_transport(|_| None);
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let spec = CommandSpec::new("AT+HTTPOPEN=example.com,80,0", &fast_timing());

        let err = channel.send_and_extract(&spec, &mut tracker).unwrap_err();
        assert!(matches!(err, CommandError::Timeout { attempts: 1, .. }));
        assert_eq!(log.count("AT+HTTPOPEN"), 1);
        assert_eq!(tracker.comm_failures(), 1);
    }

    #[test]
    fn payload_bounds_are_checked() {
        assert_eq!(extract_payload("AT+X\r\nOK\r\n", "AT+XYZLONG=foo"), None);
        assert_eq!(
            extract_payload("AT+NMAC=?\r\r\n00:1d:c9\r\n\r\nOK\r\n", "AT+NMAC=?"),
            Some("00:1d:c9\r\n")
        );
        assert_eq!(extract_payload("AT+NMAC=?\r\r\nno ok", "AT+NMAC=?"), None);
    }

    #[test]
    fn raw_command_returns_matching_frame_or_error_text() {
        let (transport, _log) = scripted_transport(|command| {
            (command == "AT+NSTAT=?").then(|| b"AT+NSTAT=?\r\r\nMAC=00\r\n\r\nOK\r\n".to_vec())
        });
        let mut channel = CommandChannel::new(transport);
        let mut tracker = tracker();
        let timing = fast_timing();

        let reply = channel.send_raw(&CommandSpec::new("AT+NSTAT=?", &timing), &mut tracker);
        assert_eq!(reply, "AT+NSTAT=?\r\r\nMAC=00\r\n\r\nOK\r\n");

        let reply = channel.send_raw(&CommandSpec::new("AT+VER=??", &timing), &mut tracker);
        assert_eq!(reply, "[ERROR: Reply timed out.]");
        assert_eq!(tracker.comm_failures(), 1);
    }
}
