use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub passphrase: String,
    pub static_ip: String,
    pub subnet_mask: String,
    pub gateway: String,
    pub enable_dhcp: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: "MySSID".to_string(),
            passphrase: "KeyPhrase".to_string(),
            static_ip: "10.0.0.10".to_string(),
            subnet_mask: "255.255.255.0".to_string(),
            gateway: "10.0.0.138".to_string(),
            enable_dhcp: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connection_header: String,
    pub user_agent: String,
    /// Test servers answer `AT+HTTPOPEN` with the bare CID instead of `IP:...`.
    pub direct_numeric_cid: bool,
    pub post_ack: String,
    pub activity_leds: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "gitzi.pythonanywhere.com".to_string(),
            port: 80,
            connection_header: "close".to_string(),
            user_agent: "User-Agent: Mozilla/5.0 (Windows; U; Windows NT 5.1; en-US;rv:1.9.1.9) Gecko/20100315 Firefox/3.5.9".to_string(),
            direct_numeric_cid: false,
            post_ack: "Posted.".to_string(),
            activity_leds: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UplinkTiming {
    pub poll_period_ms: u64,
    pub reply_timeout_ms: u64,
    pub passphrase_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub write_settle_ms: u64,
    pub retries: u32,
    pub survey_retries: u32,
    pub passphrase_retries: u32,
    pub associate_retries: u32,
    pub http_send_retries: u32,
}

impl Default for UplinkTiming {
    fn default() -> Self {
        Self {
            poll_period_ms: 500,
            reply_timeout_ms: 5_000,
            passphrase_timeout_ms: 10_000,
            http_timeout_ms: 10_000,
            write_settle_ms: 50,
            retries: 3,
            survey_retries: 5,
            passphrase_retries: 3,
            associate_retries: 12,
            http_send_retries: 1,
        }
    }
}

impl UplinkTiming {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn passphrase_timeout(&self) -> Duration {
        Duration::from_millis(self.passphrase_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }

    pub fn sanitize(&mut self) {
        self.poll_period_ms = self.poll_period_ms.clamp(1, 10_000);
        self.reply_timeout_ms = self.reply_timeout_ms.clamp(1, 60_000);
        self.passphrase_timeout_ms = self.passphrase_timeout_ms.clamp(1, 120_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(1, 120_000);
        self.write_settle_ms = self.write_settle_ms.min(1_000);
        self.retries = self.retries.clamp(1, 20);
        self.survey_retries = self.survey_retries.clamp(1, 20);
        self.passphrase_retries = self.passphrase_retries.clamp(1, 20);
        self.associate_retries = self.associate_retries.clamp(1, 50);
        self.http_send_retries = self.http_send_retries.clamp(1, 20);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FailureThresholds {
    pub max_comm_failures: u32,
    pub max_server_failures: u32,
    pub max_rejected_attempts: u32,
}

impl Default for FailureThresholds {
    fn default() -> Self {
        Self {
            max_comm_failures: 3,
            max_server_failures: 3,
            max_rejected_attempts: 12,
        }
    }
}

impl FailureThresholds {
    pub fn sanitize(&mut self) {
        self.max_comm_failures = self.max_comm_failures.max(1);
        self.max_server_failures = self.max_server_failures.max(1);
        self.max_rejected_attempts = self.max_rejected_attempts.max(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub update_period_s: u32,
    pub get_period_s: u32,
    pub association_timeout_ms: u64,
    pub quick_association_ms: u64,
    pub association_max_attempts: u32,
    pub modem_reset_ms: u64,
    pub post_path: String,
    pub get_path: String,
    pub ack_path: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_period_s: 301,
            get_period_s: 22,
            association_timeout_ms: 60_000,
            quick_association_ms: 6_000,
            association_max_attempts: 7,
            modem_reset_ms: 1_000,
            post_path: "extpost".to_string(),
            get_path: "extget".to_string(),
            ack_path: "getack".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn sanitize(&mut self) {
        self.update_period_s = self.update_period_s.max(1);
        self.get_period_s = self.get_period_s.max(1);
        self.association_timeout_ms = self.association_timeout_ms.max(1_000);
        self.modem_reset_ms = self.modem_reset_ms.clamp(10, 10_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub server: ServerConfig,
    pub timing: UplinkTiming,
    pub thresholds: FailureThresholds,
    pub scheduler: SchedulerConfig,
    pub serial: SerialConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.timing.sanitize();
        self.thresholds.sanitize();
        self.scheduler.sanitize();
        if self.serial.baud_rate == 0 {
            self.serial.baud_rate = SerialConfig::default().baud_rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{"network":{"ssid":"HomeNet"},"timing":{"retries":0}}"#;
        let mut config: RuntimeConfig = serde_json::from_str(raw).unwrap();
        config.sanitize();

        assert_eq!(config.network.ssid, "HomeNet");
        assert_eq!(config.network.passphrase, "KeyPhrase");
        assert_eq!(config.timing.retries, 1);
        assert_eq!(config.timing.associate_retries, 12);
        assert_eq!(config.thresholds, FailureThresholds::default());
    }

    #[test]
    fn zero_baud_is_restored() {
        let mut config = RuntimeConfig::default();
        config.serial.baud_rate = 0;
        config.sanitize();
        assert_eq!(config.serial.baud_rate, 115_200);
    }
}
