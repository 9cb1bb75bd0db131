//! Device session state machine
//!
//! One `DeviceSession` per connected device, wired or wireless. Parses the
//! inbound `key>value` grammar, tracks experiment/trial lifecycle, debounces
//! switch closures, runs the stimulus/trial timers, and emits UI tuples and
//! result records. Every state transition takes an explicit `now` instant;
//! the spawned driver loop supplies real instants, tests supply fabricated
//! ones.

use std::sync::Arc;

use chrono::{Datelike, Timelike, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::events::UiMessage;
use crate::protocol::{DeviceLine, NodeAddress};
use crate::radio::{Destination, RadioLink};
use crate::results::{ResultRecord, ResultsSink};
use crate::session::{Closure, DebouncedSwitch, DeviceConfig, DeviceProfile};

/// Inbox capacity per session
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Where a session's outbound lines go. One logical writer per physical
/// resource; serial writes are funneled through the owning writer task and
/// radio writes through the link's write lock.
#[derive(Clone)]
pub enum Outbound {
    /// Wired device: bytes handed to the port's writer task
    Serial(mpsc::UnboundedSender<Vec<u8>>),
    /// Wireless device: payload addressed to the remote node
    Radio {
        /// Shared dongle link
        link: Arc<RadioLink>,
        /// Remote node address
        address: NodeAddress,
    },
}

impl Outbound {
    async fn send_line(&self, line: &DeviceLine) {
        let wire = line.to_wire();
        match self {
            Outbound::Serial(tx) => {
                if tx.send(wire.into_bytes()).is_err() {
                    debug!("serial writer gone, dropping outbound line");
                }
            }
            Outbound::Radio { link, address } => {
                if let Err(e) = link
                    .transmit(Destination::Node(*address), wire.as_bytes())
                    .await
                {
                    warn!(error = %e, "radio transmit failed, dropping outbound line");
                }
            }
        }
    }
}

/// Work items accepted by a session
#[derive(Debug)]
pub enum SessionCommand {
    /// Command from the UI boundary
    Host {
        /// Command key
        key: String,
        /// Command value, possibly empty
        value: String,
    },
    /// Raw line received from the device transport
    DeviceLine(String),
}

/// Cheap handle to a spawned session. Dropping every handle shuts the
/// session down, ending any in-flight trial.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Deliver a UI command
    pub async fn host(&self, key: &str, value: &str) {
        let _ = self
            .tx
            .send(SessionCommand::Host {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await;
    }

    /// Deliver one raw device line
    pub async fn device_line(&self, raw: &str) {
        let _ = self.tx.send(SessionCommand::DeviceLine(raw.to_string())).await;
    }
}

/// GMT clock tuple for `set_rtc`: year,month,day,weekday,hour,minute,
/// second,subsecond
pub fn utc_clock_string() -> String {
    let now = Utc::now();
    format!(
        "{},{},{},{},{},{},{},0",
        now.year(),
        now.month(),
        now.day(),
        now.weekday().num_days_from_monday(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn host_utc_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Protocol state for one connected device
pub struct DeviceSession {
    profile: DeviceProfile,
    port_id: String,
    outbound: Outbound,
    ui: broadcast::Sender<UiMessage>,
    sink: Arc<dyn ResultsSink>,

    config: DeviceConfig,
    switch: DebouncedSwitch,
    epoch: Instant,

    condition_label: String,
    battery_percent: u8,
    rtc_echo: Option<String>,

    experiment_running: bool,
    trial_running: bool,
    trial_number: u32,
    trial_started: Option<Instant>,
    stim_off_at: Option<Instant>,
    trial_end_at: Option<Instant>,
    stim_on: bool,
    reaction_time_ms: i64,
}

impl DeviceSession {
    /// Fresh session for a newly seen device. Reconnects get a new session;
    /// no state is carried across disconnects.
    pub fn new(
        profile: DeviceProfile,
        port_id: impl Into<String>,
        outbound: Outbound,
        ui: broadcast::Sender<UiMessage>,
        sink: Arc<dyn ResultsSink>,
    ) -> Self {
        let mut config = DeviceConfig::new(profile);
        config.heal();
        let window = config.get_ms(profile.debounce_key());
        Self {
            profile,
            port_id: port_id.into(),
            outbound,
            ui,
            sink,
            config,
            switch: DebouncedSwitch::new(window),
            epoch: Instant::now(),
            condition_label: String::new(),
            battery_percent: 0,
            rtc_echo: None,
            experiment_running: false,
            trial_running: false,
            trial_number: 0,
            trial_started: None,
            stim_off_at: None,
            trial_end_at: None,
            stim_on: false,
            reaction_time_ms: -1,
        }
    }

    /// Spawn the session driver task and return its handle
    pub fn spawn(
        profile: DeviceProfile,
        port_id: impl Into<String>,
        outbound: Outbound,
        ui: broadcast::Sender<UiMessage>,
        sink: Arc<dyn ResultsSink>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let session = DeviceSession::new(profile, port_id, outbound, ui, sink);
        tokio::spawn(session.run(rx));
        SessionHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        loop {
            let stim_at = self.stim_off_at;
            let trial_at = self.trial_end_at;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(SessionCommand::Host { key, value }) => {
                        self.handle_host(Instant::now(), &key, &value).await;
                    }
                    Some(SessionCommand::DeviceLine(raw)) => {
                        self.handle_device_line(Instant::now(), &raw).await;
                    }
                    None => break,
                },
                _ = sleep_until_opt(stim_at), if stim_at.is_some() => {
                    self.on_stim_deadline(Instant::now()).await;
                }
                _ = sleep_until_opt(trial_at), if trial_at.is_some() => {
                    self.on_trial_deadline(Instant::now()).await;
                }
            }
        }
        // Disconnect: close out whatever is still running.
        self.end_experiment(Instant::now()).await;
    }

    // ---- UI command handling -------------------------------------------

    async fn handle_host(&mut self, now: Instant, key: &str, value: &str) {
        match key {
            "cfg" | "get_cfg" => self.announce_config(false).await,
            "set" | "set_cfg" => {
                self.config.update_from_str(value);
                self.sync_debounce();
                self.announce_config(true).await;
            }
            "rtc" | "set_rtc" => self.handle_rtc(value).await,
            "bat" | "get_bat" => {
                self.outbound.send_line(&DeviceLine::new("get_bat", "")).await;
            }
            "exp" => match value {
                "1" => {
                    self.begin_experiment(now);
                    self.begin_trial(now).await;
                }
                "0" => self.end_experiment(now).await,
                other => warn!(value = other, "ignoring exp with non-boolean value"),
            },
            "trl" => match value {
                "1" => self.begin_trial(now).await,
                "0" => self.end_trial(now).await,
                other => warn!(value = other, "ignoring trl with non-boolean value"),
            },
            // Record-start/stop lineage aliases.
            "start" => {
                self.begin_experiment(now);
                self.begin_trial(now).await;
            }
            "stop" => self.end_experiment(now).await,
            "stm" | "set_stm" => self.set_stimulus(value == "1").await,
            key if key.starts_with("cond") => {
                self.condition_label = value.split(':').next().unwrap_or("").to_string();
            }
            _ => {
                // Device-specific command; the session passes it through
                // verbatim so firmware variants keep working.
                debug!(key, "forwarding unrecognized command to device");
                self.outbound.send_line(&DeviceLine::new(key, value)).await;
            }
        }
    }

    async fn handle_rtc(&mut self, value: &str) {
        if value.is_empty() {
            let echo = self
                .rtc_echo
                .clone()
                .unwrap_or_else(utc_clock_string);
            self.emit_ui("rtc", &echo);
            return;
        }
        let fields: Vec<&str> = value.split(',').collect();
        if fields.len() != 8 || fields.iter().any(|f| f.trim().parse::<i64>().is_err()) {
            warn!(value, "ignoring malformed rtc payload");
            return;
        }
        self.rtc_echo = Some(value.to_string());
        self.outbound.send_line(&DeviceLine::new("set_rtc", value)).await;
        self.emit_ui("rtc", value);
    }

    async fn announce_config(&self, to_device: bool) {
        let line = self.config.to_line();
        if to_device {
            self.outbound.send_line(&DeviceLine::new("cfg", &line)).await;
        }
        self.emit_ui("cfg", &line);
    }

    fn sync_debounce(&mut self) {
        self.switch
            .set_window_ms(self.config.get_ms(self.profile.debounce_key()));
    }

    // ---- Device line handling ------------------------------------------

    async fn handle_device_line(&mut self, now: Instant, raw: &str) {
        let Some(line) = DeviceLine::parse(raw) else {
            if !raw.trim().is_empty() {
                warn!(raw, "ignoring unparseable device line");
            }
            return;
        };
        match line.key.as_str() {
            "btn" => self.on_switch_edge(now).await,
            "bty" => {
                match line.value.parse::<u8>() {
                    Ok(percent) => self.battery_percent = percent,
                    Err(_) => warn!(value = %line.value, "ignoring malformed battery report"),
                }
                self.emit_ui("bty", &line.value);
            }
            "rtc" => {
                self.rtc_echo = Some(line.value.clone());
                self.emit_ui("rtc", &line.value);
            }
            "dta" => self.ingest_remote_record(&line.value),
            // Anything else is surfaced upward untouched; device-specific
            // consumers decide what it means.
            _ => self.emit_ui(&line.key, &line.value),
        }
    }

    async fn on_switch_edge(&mut self, now: Instant) {
        let now_ms = now.duration_since(self.epoch).as_millis() as u64;
        match self.switch.on_falling_edge(now_ms) {
            Closure::Bounce => {}
            Closure::Genuine { first, count } => {
                self.emit_ui("clk", &count.to_string());
                if self.trial_running && first {
                    if let Some(started) = self.trial_started {
                        self.reaction_time_ms = now.duration_since(started).as_millis() as i64;
                    }
                    if self.stim_on {
                        self.set_stimulus(false).await;
                    }
                    self.emit_ui("rt", &self.reaction_time_ms.to_string());
                }
            }
        }
    }

    /// Completed-trial report from a wireless unit running its own
    /// firmware: `block_ms,trial,rt,responses,utc,battery`. The host
    /// timestamp is prepended on the way to the UI.
    fn ingest_remote_record(&mut self, value: &str) {
        let host_timestamp = host_utc_secs();
        self.emit_ui("dta", &format!("{host_timestamp:.3},{value}"));

        let fields: Vec<&str> = value.split(',').collect();
        let parsed = (|| {
            if fields.len() != 6 {
                return None;
            }
            Some(ResultRecord {
                device_id: self.device_id(),
                condition_label: self.condition_label.clone(),
                host_timestamp,
                trial_number: fields[1].trim().parse().ok()?,
                reaction_time_ms: fields[2].trim().parse().ok()?,
                response_count: fields[3].trim().parse().ok()?,
                battery_percent: fields[5].trim().parse().ok()?,
                device_timestamp: fields[4].trim().parse().ok()?,
            })
        })();
        match parsed {
            Some(record) => {
                self.battery_percent = record.battery_percent;
                self.append_record(&record);
            }
            None => warn!(value, "unrecognized dta payload, passed through only"),
        }
    }

    // ---- Trial engine ---------------------------------------------------

    fn begin_experiment(&mut self, _now: Instant) {
        if self.experiment_running {
            return;
        }
        self.experiment_running = true;
        self.trial_number = 0;
        self.emit_ui("exp", "1");
    }

    async fn begin_trial(&mut self, now: Instant) {
        // Trial is always nested inside an experiment.
        self.begin_experiment(now);
        if self.trial_running {
            return;
        }
        self.trial_running = true;
        self.trial_number += 1;
        self.switch.reset();
        self.reaction_time_ms = -1;
        self.trial_started = Some(now);
        self.trial_end_at = Some(now + Duration::from_millis(self.draw_trial_ms()));
        self.stim_off_at = Some(now + Duration::from_millis(self.stimulus_on_ms()));
        self.set_stimulus(true).await;
    }

    async fn end_trial(&mut self, now: Instant) {
        self.finish_trial(now).await;
    }

    async fn end_experiment(&mut self, now: Instant) {
        if self.trial_running {
            self.finish_trial(now).await;
        }
        if !self.experiment_running {
            return;
        }
        self.experiment_running = false;
        self.emit_ui("exp", "0");
    }

    async fn on_stim_deadline(&mut self, _now: Instant) {
        self.stim_off_at = None;
        if self.stim_on {
            self.set_stimulus(false).await;
        }
    }

    async fn on_trial_deadline(&mut self, now: Instant) {
        self.finish_trial(now).await;
        if self.experiment_running {
            self.begin_trial(now).await;
        }
    }

    async fn finish_trial(&mut self, _now: Instant) {
        if !self.trial_running {
            return;
        }
        self.trial_running = false;
        self.trial_end_at = None;
        self.stim_off_at = None;
        self.trial_started = None;
        if self.stim_on {
            self.set_stimulus(false).await;
        }

        let record = ResultRecord {
            device_id: self.device_id(),
            condition_label: self.condition_label.clone(),
            host_timestamp: host_utc_secs(),
            trial_number: self.trial_number,
            reaction_time_ms: self.reaction_time_ms,
            response_count: self.switch.count(),
            battery_percent: self.battery_percent,
            device_timestamp: Utc::now().timestamp().max(0) as u64,
        };
        self.emit_ui(
            "dta",
            &format!(
                "{:.3},{},{},{},{},{}",
                record.host_timestamp,
                record.trial_number,
                record.reaction_time_ms,
                record.response_count,
                record.battery_percent,
                record.device_timestamp
            ),
        );
        self.append_record(&record);
    }

    async fn set_stimulus(&mut self, on: bool) {
        self.stim_on = on;
        if !on {
            self.stim_off_at = None;
        }
        let state = if on { "1" } else { "0" };
        self.outbound.send_line(&DeviceLine::new("set_stm", state)).await;
        self.emit_ui("stm", state);
    }

    /// Trial length: DRT family draws uniformly from `[ISIL, ISIH)`; the
    /// VOG family cycles open + closed lens phases.
    fn draw_trial_ms(&self) -> u64 {
        if self.profile.is_vog() {
            return self.config.get_ms("opn") + self.config.get_ms("cls");
        }
        let low = self.config.get_ms("ISIL");
        let high = self.config.get_ms("ISIH");
        if high > low {
            rand::thread_rng().gen_range(low..high)
        } else {
            low
        }
    }

    fn stimulus_on_ms(&self) -> u64 {
        if self.profile.is_vog() {
            self.config.get_ms("opn")
        } else {
            self.config.get_ms("ONTM")
        }
    }

    // ---- Plumbing -------------------------------------------------------

    fn device_id(&self) -> String {
        format!("{}_{}", self.profile.label(), self.port_id)
    }

    fn append_record(&self, record: &ResultRecord) {
        if let Err(e) = self.sink.append(record) {
            warn!(error = %e, "failed to append result record");
        }
    }

    fn emit_ui(&self, key: &str, value: &str) {
        // Send never blocks; lagging UI consumers lose the oldest events.
        let _ = self
            .ui
            .send(UiMessage::new(self.profile.label(), &self.port_id, key, value));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
