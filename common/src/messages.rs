use crate::{error::MailboxError, mailbox::MailboxMessage, subjects::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Associate,
    Reset,
}

/// Requests understood by the uplink task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkRequest {
    Post(String),
    Get(String),
    Control(ControlRequest),
    Debug(String),
}

impl UplinkRequest {
    pub fn parse(message: &MailboxMessage) -> Result<Self, MailboxError> {
        let content = message.content.as_str();
        match message.subject.as_str() {
            SUBJECT_POST => Ok(Self::Post(content.to_string())),
            SUBJECT_GET => Ok(Self::Get(content.to_string())),
            SUBJECT_CONTROL => match content {
                CONTROL_ASSOCIATE => Ok(Self::Control(ControlRequest::Associate)),
                CONTROL_RESET => Ok(Self::Control(ControlRequest::Reset)),
                _ => Err(unknown_content(message)),
            },
            SUBJECT_DEBUG => Ok(Self::Debug(content.to_string())),
            other => Err(MailboxError::UnknownSubject(other.to_string())),
        }
    }

    pub fn to_message(&self) -> MailboxMessage {
        match self {
            Self::Post(content) => MailboxMessage::new(SUBJECT_POST, content.as_str()),
            Self::Get(content) => MailboxMessage::new(SUBJECT_GET, content.as_str()),
            Self::Control(ControlRequest::Associate) => {
                MailboxMessage::new(SUBJECT_CONTROL, CONTROL_ASSOCIATE)
            }
            Self::Control(ControlRequest::Reset) => {
                MailboxMessage::new(SUBJECT_CONTROL, CONTROL_RESET)
            }
            Self::Debug(content) => MailboxMessage::new(SUBJECT_DEBUG, content.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcCommand {
    SetAcTemp(i32),
    TurnAcOff,
    SetFanState(i32),
}

impl AcCommand {
    pub fn to_message(self) -> MailboxMessage {
        let content = match self {
            Self::SetAcTemp(temp) => format!("{AC_SET_TEMP}={temp}"),
            Self::TurnAcOff => AC_TURN_OFF.to_string(),
            Self::SetFanState(state) => format!("{AC_SET_FAN}={state}"),
        };
        MailboxMessage::new(SUBJECT_AC_REMOTE, content)
    }

    fn parse(message: &MailboxMessage) -> Result<Self, MailboxError> {
        let content = message.content.as_str();
        if content == AC_TURN_OFF {
            return Ok(Self::TurnAcOff);
        }
        let Some((name, value)) = content.split_once('=') else {
            return Err(unknown_content(message));
        };
        let value: i32 = value
            .trim()
            .parse()
            .map_err(|_| MailboxError::BadParameter(content.to_string()))?;
        match name {
            AC_SET_TEMP => Ok(Self::SetAcTemp(value)),
            AC_SET_FAN => Ok(Self::SetFanState(value)),
            _ => Err(unknown_content(message)),
        }
    }
}

/// Requests understood by the main task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainRequest {
    GetTemp,
    OnboardLed(bool),
    AcRemote(AcCommand),
    ResetModem,
    Debug(String),
}

impl MainRequest {
    pub fn parse(message: &MailboxMessage) -> Result<Self, MailboxError> {
        let content = message.content.as_str();
        match message.subject.as_str() {
            SUBJECT_TEMP_SENSOR if content == TEMP_GET => Ok(Self::GetTemp),
            SUBJECT_ONBOARD_LED if content == LED_ON => Ok(Self::OnboardLed(true)),
            SUBJECT_ONBOARD_LED if content == LED_OFF => Ok(Self::OnboardLed(false)),
            SUBJECT_AC_REMOTE => AcCommand::parse(message).map(Self::AcRemote),
            SUBJECT_WIFI_MODULE if content == WIFI_RESET => Ok(Self::ResetModem),
            SUBJECT_DEBUG => Ok(Self::Debug(content.to_string())),
            SUBJECT_TEMP_SENSOR | SUBJECT_ONBOARD_LED | SUBJECT_WIFI_MODULE => {
                Err(unknown_content(message))
            }
            other => Err(MailboxError::UnknownSubject(other.to_string())),
        }
    }
}

fn unknown_content(message: &MailboxMessage) -> MailboxError {
    MailboxError::UnknownContent {
        subject: message.subject.clone(),
        content: message.content.clone(),
    }
}
