// Uplink task subjects.
pub const SUBJECT_POST: &str = "Post";
pub const SUBJECT_GET: &str = "Get";
pub const SUBJECT_CONTROL: &str = "Control";
pub const SUBJECT_DEBUG: &str = "Debug";

pub const CONTROL_ASSOCIATE: &str = "Associate";
pub const CONTROL_RESET: &str = "Reset";

// Main task subjects.
pub const SUBJECT_TEMP_SENSOR: &str = "TempSensor";
pub const SUBJECT_ONBOARD_LED: &str = "OnboardLed";
pub const SUBJECT_AC_REMOTE: &str = "ACRemote";
pub const SUBJECT_WIFI_MODULE: &str = "WifiModule";

pub const TEMP_GET: &str = "GetTemp";
pub const LED_ON: &str = "TurnOn";
pub const LED_OFF: &str = "TurnOff";
pub const AC_SET_TEMP: &str = "SetAcTemp";
pub const AC_TURN_OFF: &str = "TurnAcOff";
pub const AC_SET_FAN: &str = "SetFanState";
pub const WIFI_RESET: &str = "Reset GainSpan";
