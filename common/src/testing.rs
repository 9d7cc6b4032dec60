//! Scripted modem used by the unit tests.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{arena::ReceiveArena, config::UplinkTiming, transport::SerialTransport};

pub(crate) type Responder = Box<dyn FnMut(&str) -> Option<Vec<u8>> + Send>;

/// Records every command line and feeds the scripted reply straight into the
/// receive arena, standing in for the UART interrupt.
pub(crate) struct ScriptedModem {
    arena: Arc<ReceiveArena>,
    commands: Arc<Mutex<Vec<String>>>,
    responder: Responder,
    line: Vec<u8>,
}

impl Write for ScriptedModem {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte != b'\r' {
                self.line.push(byte);
                continue;
            }
            let command = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            self.commands.lock().unwrap().push(command.clone());
            if let Some(reply) = (self.responder)(&command) {
                self.arena.feed(&reply);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    pub(crate) fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    pub(crate) fn sent(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }
}

pub(crate) fn fast_timing() -> UplinkTiming {
    UplinkTiming {
        poll_period_ms: 2,
        reply_timeout_ms: 15,
        passphrase_timeout_ms: 15,
        http_timeout_ms: 30,
        write_settle_ms: 0,
        ..UplinkTiming::default()
    }
}

pub(crate) fn scripted_transport(
    responder: impl FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
) -> (SerialTransport, CommandLog) {
    let arena = Arc::new(ReceiveArena::new());
    let log = CommandLog::default();
    let modem = ScriptedModem {
        arena: Arc::clone(&arena),
        commands: Arc::clone(&log.0),
        responder: Box::new(responder),
        line: Vec::new(),
    };
    let transport = SerialTransport::new(arena, Box::new(modem), Duration::ZERO);
    (transport, log)
}

pub(crate) fn echo_ok(command: &str) -> Vec<u8> {
    format!("{command}\r\r\n\r\nOK\r\n").into_bytes()
}

pub(crate) fn echo_error(command: &str) -> Vec<u8> {
    format!("{command}\r\r\n\r\nERROR\r\n").into_bytes()
}
