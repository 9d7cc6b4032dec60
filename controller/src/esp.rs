use core::convert::TryInto;
use std::{
    io,
    sync::{atomic::AtomicBool, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use esp_idf_hal::{
    delay::{TickType, BLOCK},
    gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
    prelude::Peripherals,
    uart::{config::Config as UartConfig, UartDriver, UartRxDriver, UartTxDriver},
    units::Hertz,
};
use esp_idf_svc::{
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
};
use log::{debug, info, warn};

use acbridge_common::{
    MainAction, MainTask, Mailbox, ReceiveArena, Recipient, RuntimeConfig, SerialTransport, Uplink,
};

const NVS_NAMESPACE: &str = "acbridge";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const MODEM_POWER_PIN: i32 = 4;
const ONBOARD_LED_PIN: i32 = 2;
const RX_CHUNK_BYTES: usize = 64;
const RX_READ_TIMEOUT_MS: u64 = 100;
/// Reported until a temperature sensor is wired to the board.
const AMBIENT_FALLBACK_C: f32 = 21.0;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

struct ModemWriter(UartTxDriver<'static>);

impl io::Write for ModemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.wait_done(BLOCK).map_err(io::Error::other)
    }
}

struct OutputLine {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl OutputLine {
    fn set(&mut self, high: bool) {
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive GPIO: {err}");
        }
    }
}

struct Board {
    modem_power: Option<OutputLine>,
    onboard_led: Option<OutputLine>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    let nvs_store = NvsStore {
        partition: EspDefaultNvsPartition::take()?,
        lock: Arc::new(Mutex::new(())),
    };
    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, server=`{}:{}`, baud={}",
        runtime.network.ssid, runtime.server.host, runtime.server.port, runtime.serial.baud_rate,
    );

    let peripherals = Peripherals::take()?;
    let uart = UartDriver::new(
        peripherals.uart1,
        peripherals.pins.gpio17,
        peripherals.pins.gpio18,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::new().baudrate(Hertz(runtime.serial.baud_rate)),
    )?;
    let (tx, rx) = uart.into_split();

    let mut board = Board {
        modem_power: init_output(MODEM_POWER_PIN, true),
        onboard_led: init_output(ONBOARD_LED_PIN, false),
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let arena = Arc::new(ReceiveArena::new());
    spawn_receiver(rx, Arc::clone(&arena));

    let mailbox = Arc::new(Mailbox::new());
    let transport = SerialTransport::new(
        arena,
        Box::new(ModemWriter(tx)),
        runtime.timing.write_settle(),
    );
    let mut uplink = Uplink::new(transport, &runtime, Arc::clone(&mailbox));
    let link_status = uplink.status();

    thread::Builder::new()
        .name("uplink".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            // Never raised; the firmware runs until power-off.
            let shutdown = AtomicBool::new(false);
            uplink.run(&shutdown);
        })
        .expect("failed to spawn uplink thread");

    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register main task with watchdog: {err:#}");
    }

    let mut task = MainTask::new(runtime.scheduler.clone());
    execute_main_actions(task.boot(monotonic_ms()), &mailbox, &mut board);

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let pending = mailbox.count(Recipient::Main);
        for _ in 0..pending {
            let Some(line) = mailbox.get(Recipient::Main) else {
                break;
            };
            let actions = task.handle_mail(&line, now_ms, AMBIENT_FALLBACK_C);
            execute_main_actions(actions, &mailbox, &mut board);
        }

        let actions = task.tick(now_ms, link_status.is_associated(), AMBIENT_FALLBACK_C);
        execute_main_actions(actions, &mailbox, &mut board);

        thread::sleep(Duration::from_secs(1));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if let Some(ssid) = option_env!("ACBRIDGE_WIFI_SSID") {
        if runtime.network.ssid == acbridge_common::NetworkConfig::default().ssid {
            runtime.network.ssid = ssid.to_string();
        }
    }
    if let Some(pass) = option_env!("ACBRIDGE_WIFI_PASS") {
        if runtime.network.passphrase == acbridge_common::NetworkConfig::default().passphrase {
            runtime.network.passphrase = pass.to_string();
        }
    }
}

fn spawn_receiver(rx: UartRxDriver<'static>, arena: Arc<ReceiveArena>) {
    thread::Builder::new()
        .name("modem-rx".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let timeout = TickType::new_millis(RX_READ_TIMEOUT_MS).ticks();
            let mut buf = [0_u8; RX_CHUNK_BYTES];
            loop {
                match rx.read(&mut buf, timeout) {
                    Ok(0) => {}
                    Ok(n) => arena.feed(&buf[..n]),
                    Err(err) => {
                        warn!("modem rx error: {err}");
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
        })
        .expect("failed to spawn modem rx thread");
}

fn execute_main_actions(actions: Vec<MainAction>, mailbox: &Mailbox, board: &mut Board) {
    for action in actions {
        match action {
            MainAction::PowerCycleModem { off_ms } => {
                let Some(power) = board.modem_power.as_mut() else {
                    warn!("modem power line unavailable; skipping power cycle");
                    continue;
                };
                info!("power-cycling modem ({off_ms} ms)");
                power.set(false);
                thread::sleep(Duration::from_millis(off_ms));
                power.set(true);
            }
            MainAction::Mail(recipient, message) => mailbox.post_message(recipient, &message),
            MainAction::SetAcTemp(temp) => info!("AC remote: set temperature to {temp} degC"),
            MainAction::TurnAcOff => info!("AC remote: power off"),
            MainAction::SetFanState(state) => info!("AC remote: fan state {state}"),
            MainAction::Led(on) => {
                if let Some(led) = board.onboard_led.as_mut() {
                    led.set(on);
                }
            }
            MainAction::Console(text) => debug!("{text}"),
        }
    }
}

fn init_output(pin: i32, initial_high: bool) -> Option<OutputLine> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(pin) => {
            let mut line = OutputLine { pin };
            line.set(initial_high);
            Some(line)
        }
        Err(err) => {
            warn!("GPIO{pin} unavailable: {err}");
            None
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_sys::ESP_OK || rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_sys::ESP_OK || rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
