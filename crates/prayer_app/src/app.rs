use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use prayer_domain::clock::{Clock, SystemClock};
use prayer_domain::config::EngineConfig;
use prayer_domain::store::JsonFileStore;
use prayer_domain::timetable::{StaticTimeTable, DEFAULT_FALLBACK_WINDOW_DAYS};
use prayer_domain::PrayerService;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::notifier::LogNotifier;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub(crate) time_table: PathBuf,
    pub(crate) state_file: PathBuf,
    pub(crate) tick: Duration,
    pub(crate) fallback_days: i64,
    pub(crate) engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("PRAYER_TIMETABLE") {
            config.time_table = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PRAYER_STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }
        if let Ok(millis) = std::env::var("PRAYER_TICK_MILLIS") {
            if let Ok(value) = millis.trim().parse::<u64>() {
                if value > 0 {
                    config.tick = Duration::from_millis(value);
                }
            }
        }
        if let Ok(days) = std::env::var("PRAYER_FALLBACK_DAYS") {
            if let Ok(value) = days.trim().parse::<i64>() {
                config.fallback_days = value.max(0);
            }
        }
        if let Ok(path) = std::env::var("PRAYER_ENGINE_CONFIG") {
            config.engine = load_engine_config(Path::new(&path))?;
        }
        Ok(config)
    }

    pub fn time_table(&self) -> &Path {
        &self.time_table
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            time_table: PathBuf::from("prayer_times"),
            state_file: PathBuf::from("prayer_state.json"),
            tick: Duration::from_secs(1),
            fallback_days: DEFAULT_FALLBACK_WINDOW_DAYS,
            engine: EngineConfig::default(),
        }
    }
}

fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read engine config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse engine config {}", path.display()))
}

pub fn load_time_table(path: &Path, fallback_days: i64) -> Result<StaticTimeTable> {
    let table = StaticTimeTable::load(path)
        .with_context(|| format!("failed to load prayer times from {}", path.display()))?
        .with_fallback_window(fallback_days);
    info!(path = %path.display(), days = table.len(), "prayer times loaded");
    Ok(table)
}

/// Lifecycle signals delivered to the host loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Resumed,
    Backgrounded,
    DayChanged,
    SettingsChanged,
    TimeTableChanged,
    Shutdown,
}

pub struct PrayerHost {
    service: PrayerService,
    notifier: Arc<LogNotifier>,
    clock: Arc<dyn Clock>,
    time_table: PathBuf,
    fallback_days: i64,
}

impl PrayerHost {
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let table = load_time_table(&config.time_table, config.fallback_days)?;
        let store = JsonFileStore::open(&config.state_file).with_context(|| {
            format!("failed to open state file {}", config.state_file.display())
        })?;
        let notifier = Arc::new(LogNotifier::new());
        let mut service = PrayerService::builder()
            .with_time_table(Arc::new(table))
            .with_notifier(notifier.clone())
            .with_store(Arc::new(store))
            .with_clock(clock.clone())
            .with_config(config.engine.clone())
            .build()?;
        service.subscribe(|event| match serde_json::to_string(event) {
            Ok(json) => info!(event = %json, "prayer event"),
            Err(err) => warn!(%err, "unable to encode prayer event"),
        });
        Ok(Self {
            service,
            notifier,
            clock,
            time_table: config.time_table.clone(),
            fallback_days: config.fallback_days,
        })
    }

    pub fn service(&self) -> &PrayerService {
        &self.service
    }

    pub fn notifier(&self) -> &LogNotifier {
        &self.notifier
    }

    pub fn tick(&mut self) {
        self.notifier.fire_due(self.clock.now());
        self.service.tick();
    }

    /// Applies one lifecycle event. Returns false once the host should stop.
    pub fn handle(&mut self, event: HostEvent) -> bool {
        debug!(?event, "host event");
        match event {
            HostEvent::Resumed => self.service.on_resumed(),
            HostEvent::Backgrounded => self.service.on_backgrounded(),
            HostEvent::DayChanged => self.service.on_day_changed(),
            HostEvent::SettingsChanged => self.service.on_settings_changed(),
            HostEvent::TimeTableChanged => {
                if let Err(err) = self.reload_time_table() {
                    warn!(err = %format!("{err:#}"), "keeping previous prayer times");
                }
            }
            HostEvent::Shutdown => return false,
        }
        true
    }

    fn reload_time_table(&mut self) -> Result<()> {
        let table = load_time_table(&self.time_table, self.fallback_days)?;
        self.service.replace_time_table(Arc::new(table));
        Ok(())
    }
}

/// Drives `host` on a fixed tick until a shutdown event arrives or every
/// sender is gone, then hands the host back.
pub async fn run_host(
    mut host: PrayerHost,
    tick: Duration,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
) -> PrayerHost {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => host.tick(),
            event = events.recv() => match event {
                Some(event) => {
                    if !host.handle(event) {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    info!("prayer host stopped");
    host
}

pub fn watch_time_table(
    path: &Path,
    events: mpsc::UnboundedSender<HostEvent>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() => {
                debug!(?event, "time table change detected");
                forward(&events, HostEvent::TimeTableChanged);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "time table watch error"),
        }
    })?;
    let mode = if path.is_file() {
        RecursiveMode::NonRecursive
    } else {
        RecursiveMode::Recursive
    };
    watcher.watch(path, mode)?;
    Ok(watcher)
}

/// Queues `event` for the host loop. Returns false once the loop is gone.
fn forward(events: &mpsc::UnboundedSender<HostEvent>, event: HostEvent) -> bool {
    if events.send(event).is_err() {
        debug!(?event, "host loop gone, dropping event");
        return false;
    }
    true
}

/// SIGHUP reloads settings and prayer times, SIGUSR1 and SIGUSR2 move the
/// host to the background and back, ctrl-c stops it.
fn spawn_signal_listener(events: mpsc::UnboundedSender<HostEvent>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        forward_signal(
            SignalKind::hangup(),
            "SIGHUP",
            &[HostEvent::SettingsChanged, HostEvent::TimeTableChanged],
            events.clone(),
        );
        forward_signal(
            SignalKind::user_defined1(),
            "SIGUSR1",
            &[HostEvent::Backgrounded],
            events.clone(),
        );
        forward_signal(
            SignalKind::user_defined2(),
            "SIGUSR2",
            &[HostEvent::Resumed],
            events.clone(),
        );
    }
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => warn!(%err, "unable to listen for interrupt"),
        }
        forward(&events, HostEvent::Shutdown);
    });
}

#[cfg(unix)]
fn forward_signal(
    kind: tokio::signal::unix::SignalKind,
    name: &'static str,
    forwarded: &'static [HostEvent],
    events: mpsc::UnboundedSender<HostEvent>,
) {
    tokio::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(kind) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, signal = name, "unable to listen for signal");
                return;
            }
        };
        while stream.recv().await.is_some() {
            info!(signal = name, events = ?forwarded, "signal received");
            for event in forwarded {
                if !forward(&events, *event) {
                    return;
                }
            }
        }
    });
}

pub fn run(config: AppConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(async move {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = PrayerHost::new(&config, Arc::new(SystemClock))?;
        let _watcher = match watch_time_table(&config.time_table, tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(%err, "time table changes will not be picked up");
                None
            }
        };
        spawn_signal_listener(tx.clone());
        info!(
            time_table = %config.time_table.display(),
            state = %config.state_file.display(),
            tick_ms = config.tick.as_millis() as u64,
            "prayer host running"
        );
        run_host(host, config.tick, rx).await;
        drop(tx);
        Ok::<(), anyhow::Error>(())
    })
}
