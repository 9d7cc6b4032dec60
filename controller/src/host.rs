use std::{
    io::{self, ErrorKind, Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use acbridge_common::{
    MainAction, MainTask, Mailbox, ReceiveArena, Recipient, RuntimeConfig, SerialTransport, Uplink,
};

const RX_CHUNK_BYTES: usize = 64;
const RX_READ_TIMEOUT_MS: u64 = 100;

#[derive(Clone)]
struct ConfigStore {
    runtime_path: Arc<PathBuf>,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("ACBRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.acbridge"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Write half of the modem UART handed to the transport.
struct ModemWriter(Box<dyn SerialPort>);

impl Write for ModemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// The modem power line is wired to DTR on the USB-UART adapter.
struct ModemPower(Box<dyn SerialPort>);

impl ModemPower {
    async fn pulse(&mut self, off_ms: u64) {
        info!("power-cycling modem ({off_ms} ms)");
        if let Err(err) = self.0.write_data_terminal_ready(false) {
            warn!("failed to drop modem power line: {err}");
            return;
        }
        tokio::time::sleep(Duration::from_millis(off_ms)).await;
        if let Err(err) = self.0.write_data_terminal_ready(true) {
            warn!("failed to restore modem power line: {err}");
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    info!(
        "runtime config loaded: ssid=`{}`, server=`{}:{}`, modem=`{}@{}`",
        runtime.network.ssid,
        runtime.server.host,
        runtime.server.port,
        runtime.serial.port,
        runtime.serial.baud_rate,
    );

    let port = serialport::new(runtime.serial.port.as_str(), runtime.serial.baud_rate)
        .timeout(Duration::from_millis(RX_READ_TIMEOUT_MS))
        .open()
        .with_context(|| format!("failed to open modem serial port {}", runtime.serial.port))?;
    let reader = port.try_clone().context("failed to clone serial port for rx")?;
    let control = port
        .try_clone()
        .context("failed to clone serial port for power control")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let arena = Arc::new(ReceiveArena::new());
    spawn_receiver(reader, Arc::clone(&arena), Arc::clone(&shutdown))?;

    let mailbox = Arc::new(Mailbox::new());
    let transport = SerialTransport::new(
        arena,
        Box::new(ModemWriter(port)),
        runtime.timing.write_settle(),
    );
    let mut uplink = Uplink::new(transport, &runtime, Arc::clone(&mailbox));
    let link_status = uplink.status();

    let uplink_shutdown = Arc::clone(&shutdown);
    let uplink_handle = thread::Builder::new()
        .name("uplink".into())
        .spawn(move || uplink.run(&uplink_shutdown))
        .context("failed to spawn uplink thread")?;

    let mut power = ModemPower(control);
    let mut task = MainTask::new(runtime.scheduler.clone());
    execute_main_actions(task.boot(monotonic_ms()), &mailbox, &mut power).await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    warn!("ctrl-c handler failed: {err}");
                }
                info!("shutdown requested");
                break;
            }
            _ = interval.tick() => {}
        }

        let now_ms = monotonic_ms();
        let temp_c = simulated_temp_c(tick);
        tick = tick.wrapping_add(1);

        let pending = mailbox.count(Recipient::Main);
        for _ in 0..pending {
            let Some(line) = mailbox.get(Recipient::Main) else {
                break;
            };
            let actions = task.handle_mail(&line, now_ms, temp_c);
            execute_main_actions(actions, &mailbox, &mut power).await;
        }

        let actions = task.tick(now_ms, link_status.is_associated(), temp_c);
        execute_main_actions(actions, &mailbox, &mut power).await;
    }

    shutdown.store(true, Ordering::Relaxed);
    match tokio::task::spawn_blocking(move || uplink_handle.join()).await {
        Ok(Ok(())) => info!("uplink stopped"),
        Ok(Err(_)) => warn!("uplink thread panicked"),
        Err(err) => warn!("failed to join uplink thread: {err}"),
    }
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(port) = std::env::var("ACBRIDGE_SERIAL_PORT") {
        runtime.serial.port = port;
    }
    if let Ok(raw) = std::env::var("ACBRIDGE_BAUD") {
        match raw.parse::<u32>() {
            Ok(baud) => runtime.serial.baud_rate = baud,
            Err(err) => warn!("ignoring ACBRIDGE_BAUD={raw:?}: {err}"),
        }
    }
}

/// Receive context: only appends to the arena.
fn spawn_receiver(
    mut reader: Box<dyn SerialPort>,
    arena: Arc<ReceiveArena>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("modem-rx".into())
        .spawn(move || {
            let mut buf = [0_u8; RX_CHUNK_BYTES];
            while !shutdown.load(Ordering::Relaxed) {
                match reader.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => arena.feed(&buf[..n]),
                    Err(err) if err.kind() == ErrorKind::TimedOut => {}
                    Err(err) => {
                        warn!("modem rx error: {err}");
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
        })
        .context("failed to spawn modem rx thread")?;
    Ok(())
}

async fn execute_main_actions(actions: Vec<MainAction>, mailbox: &Mailbox, power: &mut ModemPower) {
    for action in actions {
        match action {
            MainAction::PowerCycleModem { off_ms } => power.pulse(off_ms).await,
            MainAction::Mail(recipient, message) => mailbox.post_message(recipient, &message),
            MainAction::SetAcTemp(temp) => info!("AC remote: set temperature to {temp} degC"),
            MainAction::TurnAcOff => info!("AC remote: power off"),
            MainAction::SetFanState(state) => info!("AC remote: fan state {state}"),
            MainAction::Led(on) => debug!("onboard LED {}", if on { "on" } else { "off" }),
            MainAction::Console(text) => info!(target: "console", "{text}"),
        }
    }
}

fn simulated_temp_c(tick: u64) -> f32 {
    21.0 + ((tick % 8) as f32 * 0.2)
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
