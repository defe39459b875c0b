//! Update coordinator: one polling task per target plus a result processor.

mod retention;

pub use retention::*;

use crate::alert::{AlertTracker, Notifier};
use crate::db::{HistoryRecord, IntegrationConfig, Store, Target};
use crate::entity::StateSnapshot;
use crate::mac::lookup_mac;
use crate::probe::{probe_target, ProbeResult, ProbeTimeouts, Resolver};

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Probes of one target allowed to run at the same time.
const MAX_OVERLAPPING_PROBES: usize = 2;
const HISTORY_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const HISTORY_FLUSH_ROWS: usize = 500;
/// Wait before retrying a MAC lookup that found nothing.
const MAC_RETRY_INTERVAL: Duration = Duration::from_secs(600);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings every probe loop follows live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub dns_server: Ipv4Addr,
}

impl From<&IntegrationConfig> for PollSettings {
    fn from(config: &IntegrationConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            dns_server: config.dns_server,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&IntegrationConfig::default())
    }
}

/// State shared between the coordinator and its result processor.
#[derive(Default)]
struct Shared {
    /// Currently configured targets by unique id.
    targets: RwLock<HashMap<String, Target>>,
    /// Latest result per unique id.
    results: RwLock<HashMap<String, ProbeResult>>,
    /// MAC address per device host.
    macs: RwLock<HashMap<String, String>>,
    /// Last MAC lookup started per device host.
    mac_attempts: Mutex<HashMap<String, Instant>>,
    alerts: Mutex<AlertTracker>,
}

/// Orchestrates polling of every configured target.
pub struct Coordinator {
    store: Arc<Store>,
    timeouts: ProbeTimeouts,
    settings_tx: watch::Sender<PollSettings>,
    stop_chans: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
    result_tx: mpsc::Sender<ProbeResult>,
    shared: Arc<Shared>,
    retention_manager: RetentionManager,
    processor_stop: broadcast::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, notifier: Notifier, timeouts: ProbeTimeouts, retention: Duration) -> Self {
        let (result_tx, result_rx) = mpsc::channel(1000);
        let (history_tx, history_rx) = mpsc::channel(1000);
        let (settings_tx, _) = watch::channel(PollSettings::default());
        let (processor_stop, _) = broadcast::channel(1);
        let shared = Arc::new(Shared::default());

        tokio::spawn(run_result_processor(
            result_rx,
            history_tx,
            shared.clone(),
            notifier,
            processor_stop.subscribe(),
        ));
        let writer = tokio::spawn(run_batch_writer(history_rx, store.clone()));

        Self {
            retention_manager: RetentionManager::new(store.clone(), retention),
            store,
            timeouts,
            settings_tx,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            result_tx,
            shared,
            processor_stop,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Start polling whatever the store holds and begin history retention.
    pub async fn start(&self) -> Result<(), crate::db::DbError> {
        match self.store.load_config()? {
            Some(config) => {
                tracing::info!(
                    "Starting coordinator with {} targets across {} devices",
                    config.targets.len(),
                    config.hosts().len()
                );
                self.apply(&config).await;
            }
            None => tracing::info!("No devices configured yet"),
        }

        self.retention_manager.start();
        Ok(())
    }

    /// Bring running tasks and settings in line with `config`.
    pub async fn apply(&self, config: &IntegrationConfig) {
        self.set_poll_settings(PollSettings::from(config));
        self.sync_targets(&config.targets).await;
    }

    /// Update interval and DNS server for every running loop.
    pub fn set_poll_settings(&self, settings: PollSettings) {
        let changed = self.settings_tx.send_if_modified(|current| {
            if *current == settings {
                return false;
            }
            *current = settings;
            true
        });

        if changed {
            tracing::info!(
                "Poll settings changed: interval {:?}, DNS server {}",
                settings.interval,
                settings.dns_server
            );
        }
    }

    /// Stop removed targets, start new ones and refresh metadata of the rest.
    pub async fn sync_targets(&self, targets: &[Target]) {
        let wanted: HashMap<String, &Target> = targets.iter().map(|t| (t.unique_id(), t)).collect();
        let wanted_hosts: HashSet<&str> = targets.iter().map(|t| t.host.as_str()).collect();

        let mut registry = self.shared.targets.write().await;

        let removed: Vec<String> = registry
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();

        if !removed.is_empty() {
            let mut results = self.shared.results.write().await;
            let mut stop_chans = self.stop_chans.write().await;
            for id in &removed {
                registry.remove(id);
                results.remove(id);
                if let Some(stop_tx) = stop_chans.remove(id) {
                    let _ = stop_tx.send(());
                }
                tracing::info!("Coordinator: Removed target {}", id);
            }
        }

        let mut added = Vec::new();
        for (id, target) in wanted {
            match registry.get_mut(&id) {
                Some(existing) => *existing = target.clone(),
                None => {
                    registry.insert(id, target.clone());
                    added.push(target.clone());
                }
            }
        }
        drop(registry);

        // Devices that disappeared entirely lose their alert and MAC state
        {
            let mut macs = self.shared.macs.write().await;
            macs.retain(|host, _| wanted_hosts.contains(host.as_str()));
        }
        {
            let mut attempts = self.shared.mac_attempts.lock().await;
            attempts.retain(|host, _| wanted_hosts.contains(host.as_str()));
        }
        {
            let mut alerts = self.shared.alerts.lock().await;
            let gone: Vec<String> = alerts
                .hosts()
                .filter(|h| !wanted_hosts.contains(h.as_str()))
                .cloned()
                .collect();
            for host in gone {
                alerts.forget(&host);
            }
        }

        for target in added {
            self.add_target(target).await;
        }
    }

    async fn add_target(&self, target: Target) {
        let unique_id = target.unique_id();
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&unique_id) {
            return; // Already running
        }

        let (stop_tx, _) = broadcast::channel(1);
        let stop_rx = stop_tx.subscribe();
        stop_chans.insert(unique_id.clone(), stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Coordinator: Adding target {}", unique_id);

        let result_tx = self.result_tx.clone();
        let settings_rx = self.settings_tx.subscribe();
        let timeouts = self.timeouts;
        let stop_chans = self.stop_chans.clone();

        tokio::spawn(async move {
            run_probe_loop(target, timeouts, settings_rx, result_tx, stop_rx).await;

            // Clean up unless a newer loop took the slot
            let mut chans = stop_chans.write().await;
            if chans.get(&unique_id).is_some_and(|tx| tx.same_channel(&stop_tx)) {
                chans.remove(&unique_id);
            }
        });
    }

    /// Copy of the current state for rendering.
    pub async fn snapshot(&self) -> StateSnapshot {
        let hosts: HashSet<String> = self
            .shared
            .targets
            .read()
            .await
            .values()
            .map(|t| t.host.clone())
            .collect();
        let results = self.shared.results.read().await.clone();
        let macs = self.shared.macs.read().await.clone();
        let alerts = self.shared.alerts.lock().await;
        let alerting = hosts.into_iter().filter(|h| alerts.is_alerting(h)).collect();

        StateSnapshot {
            results,
            macs,
            alerting,
        }
    }

    /// Stop every probe loop and the retention task, then flush pending history.
    pub async fn shutdown(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
        drop(stop_chans);

        self.retention_manager.stop().await;

        // The processor drains queued results and closes the history channel,
        // which makes the writer flush and exit.
        let _ = self.processor_stop.send(());
        if let Some(writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, writer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("History writer failed: {}", e),
                Err(_) => tracing::warn!("Timed out flushing probe history"),
            }
        }

        tracing::info!("Coordinator stopped");
    }
}

/// Poll one target until stopped. The first poll runs immediately.
async fn run_probe_loop(
    target: Target,
    timeouts: ProbeTimeouts,
    mut settings_rx: watch::Receiver<PollSettings>,
    tx: mpsc::Sender<ProbeResult>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let unique_id = target.unique_id();
    let target = Arc::new(target);

    let semaphore = Arc::new(Semaphore::new(MAX_OVERLAPPING_PROBES));

    let mut period = settings_rx.borrow_and_update().interval;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let new_period = settings_rx.borrow_and_update().interval;
                if new_period != period {
                    period = new_period;
                    interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    tracing::debug!("Rescheduled {} every {:?}", unique_id, period);
                }
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping probe for {} due to overlap limit", unique_id);
                        continue;
                    }
                };

                let resolver = Resolver::for_server(settings_rx.borrow().dns_server);
                let target = target.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done

                    let result = probe_target(&target, &resolver, &timeouts).await;
                    if tx.send(result).await.is_err() {
                        tracing::error!("Failed to send result for {}", target.unique_id());
                    }
                });
            }
        }
    }

    tracing::debug!("Probe loop for {} stopped", unique_id);
}

/// Keep the latest state per target, evaluate alerts and feed history.
async fn run_result_processor(
    mut rx: mpsc::Receiver<ProbeResult>,
    history_tx: mpsc::Sender<HistoryRecord>,
    shared: Arc<Shared>,
    notifier: Notifier,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                // Drain what is already queued, then close the history channel
                while let Ok(result) = rx.try_recv() {
                    process_result(result, &history_tx, &shared, &notifier).await;
                }
                break;
            }
            result = rx.recv() => {
                match result {
                    Some(r) => process_result(r, &history_tx, &shared, &notifier).await,
                    None => break,
                }
            }
        }
    }
}

async fn process_result(
    result: ProbeResult,
    history_tx: &mpsc::Sender<HistoryRecord>,
    shared: &Arc<Shared>,
    notifier: &Notifier,
) {
    let record = history_record(&result);

    let (target, device_reachable) = match record_result(shared, result.clone()).await {
        Recorded::Latest(target, device_reachable) => (target, device_reachable),
        Recorded::Stale => {
            // Still a real observation, just not the newest one
            tracing::debug!("Result for {} is older than the current state", result.unique_id);
            if history_tx.send(record).await.is_err() {
                tracing::error!("History writer stopped; dropping record for {}", result.unique_id);
            }
            return;
        }
        Recorded::Unknown => {
            tracing::debug!("Discarding result for removed target {}", result.unique_id);
            return;
        }
    };

    if history_tx.send(record).await.is_err() {
        tracing::error!("History writer stopped; dropping record for {}", result.unique_id);
    }

    let event = shared.alerts.lock().await.observe(
        &target.host,
        &target.device_name,
        device_reachable,
        ChronoDuration::minutes(i64::from(target.alert_delay)),
        result.timestamp,
    );
    if let Some(event) = event {
        let notifier = notifier.clone();
        let group = target.alert_group.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&event, group.as_deref()).await {
                tracing::error!("Failed to deliver alert for {}: {}", event.host, e);
            }
        });
    }

    if let Some(ip) = result.resolved_ip.filter(|ip| result.reachable && !ip.is_loopback()) {
        if begin_mac_lookup(shared, &target.host, Instant::now()).await {
            let shared = shared.clone();
            let host = target.host.clone();
            tokio::spawn(async move {
                match lookup_mac(ip).await {
                    Some(mac) => {
                        tracing::debug!("Found MAC {} for {}", mac, host);
                        shared.macs.write().await.insert(host, mac);
                    }
                    None => tracing::debug!("No MAC address found for {}", host),
                }
            });
        }
    }
}

/// Claim a MAC lookup for `host` unless one is known, running or recently failed.
async fn begin_mac_lookup(shared: &Shared, host: &str, now: Instant) -> bool {
    if shared.macs.read().await.contains_key(host) {
        return false;
    }

    let mut attempts = shared.mac_attempts.lock().await;
    match attempts.get(host) {
        Some(last) if now.saturating_duration_since(*last) < MAC_RETRY_INTERVAL => false,
        _ => {
            attempts.insert(host.to_string(), now);
            true
        }
    }
}

#[derive(Debug)]
enum Recorded {
    /// Stored as the newest result; carries whether the device is reachable.
    Latest(Target, bool),
    /// A newer result is already stored.
    Stale,
    /// The target is no longer configured.
    Unknown,
}

/// Store `result` as the latest for its target unless a newer one is held.
async fn record_result(shared: &Shared, result: ProbeResult) -> Recorded {
    let registry = shared.targets.read().await;
    let Some(target) = registry.get(&result.unique_id).cloned() else {
        return Recorded::Unknown;
    };

    let mut results = shared.results.write().await;
    if results
        .get(&result.unique_id)
        .is_some_and(|current| current.timestamp > result.timestamp)
    {
        return Recorded::Stale;
    }
    results.insert(result.unique_id.clone(), result);

    let device_reachable = registry
        .values()
        .filter(|t| t.host == target.host)
        .filter_map(|t| results.get(&t.unique_id()))
        .any(|r| r.reachable);

    Recorded::Latest(target, device_reachable)
}

fn history_record(result: &ProbeResult) -> HistoryRecord {
    HistoryRecord {
        time: result.timestamp,
        unique_id: result.unique_id.clone(),
        reachable: result.reachable,
        latency_ms: result.latency_ms,
        failure: result.failure.map(|f| f.as_str().to_string()),
        resolved_ip: result.resolved_ip.map(|ip| ip.to_string()),
    }
}

/// Run the batch writer that accumulates and flushes history rows.
async fn run_batch_writer(mut rx: mpsc::Receiver<HistoryRecord>, store: Arc<Store>) {
    let mut buffer: Vec<HistoryRecord> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(HISTORY_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= HISTORY_FLUSH_ROWS {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<HistoryRecord>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_history(buffer) {
        tracing::error!("Failed to flush probe history: {}", e);
    }

    buffer.clear();
}
