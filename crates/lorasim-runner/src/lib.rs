//! # lorasim-runner library
//!
//! Event loop, statistics, trace recording and metrics export for lorasim.
//! The `lorasim` binary is a thin command line over this crate; integration
//! tests drive [`EventLoop`] directly.

pub mod metrics_export;
pub mod stats;

pub use lorasim_common::SimTime;
pub use lorasim_model::{build_simulation, load_scenario, load_scenario_from_str, BuiltSimulation, NodeInfo};
pub use stats::{NodeStats, SimulationMetrics, SimulationStats};

use lorasim_common::{
    EntityId, EntityRegistry, Event, EventId, EventPayload, Notification, NotificationRecord, Scheduler, SimContext,
};
use lorasim_metrics::metric_defs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] lorasim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] lorasim_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Format a duration with fixed width, e.g. ` 1h23m45s`.
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{:2}h{:02}m{:02}s", hours, minutes, seconds)
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current simulation time.
    pub sim_time: SimTime,
    /// End of the run.
    pub target_time: SimTime,
    /// Wall clock time since start.
    pub wall_elapsed: Duration,
    /// Events dispatched so far.
    pub events_processed: u64,
    /// Simulated seconds per wall-clock second since the last report.
    pub time_multiplier: f64,
    /// Estimated wall-clock time remaining.
    pub estimated_remaining: Duration,
    /// Progress, 0 to 100.
    pub progress_percent: f64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// One line of the JSON trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Name of the node the notification is about.
    pub origin: String,
    /// Its entity id.
    pub origin_id: u64,
    /// Simulated time in seconds.
    pub time_s: f64,
    /// The notification, flattened with its `event` tag.
    #[serde(flatten)]
    pub notification: Notification,
}

/// Collects trace entries and writes them as one JSON array.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a recorder. Without an output nothing is kept.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// Whether entries are being kept.
    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an entry.
    pub fn record(&mut self, entry: TraceEntry) {
        if self.is_enabled() {
            self.entries.push(entry);
        }
    }

    /// Entries recorded so far.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Write all entries to the output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    scheduler: Scheduler,
    entities: EntityRegistry,
    context: SimContext,
    node_infos: Vec<NodeInfo>,
    trace: TraceRecorder,
    metrics: SimulationMetrics,
    /// Entity id to (`node`, `node_type`) metric labels.
    entity_labels: BTreeMap<EntityId, (String, String)>,
}

impl EventLoop {
    /// Create an event loop over a built simulation.
    pub fn new(simulation: BuiltSimulation, trace_output: Option<Box<dyn Write>>) -> Self {
        let BuiltSimulation {
            entities,
            mut context,
            channel,
            network_server,
            node_infos,
        } = simulation;

        let mut entity_labels = BTreeMap::new();
        entity_labels.insert(channel, ("channel".to_string(), "channel".to_string()));
        entity_labels.insert(
            network_server,
            ("network_server".to_string(), "network_server".to_string()),
        );
        for info in &node_infos {
            entity_labels.insert(info.entity_id, (info.name.clone(), info.role.as_label().to_string()));
        }

        let mut scheduler = Scheduler::new();
        scheduler.absorb(&mut context);

        EventLoop {
            scheduler,
            entities,
            context,
            metrics: SimulationMetrics::new(&node_infos),
            node_infos,
            trace: TraceRecorder::new(trace_output),
            entity_labels,
        }
    }

    /// Dispatch an event to its targets, timing each step.
    fn dispatch_event_with_metrics(&mut self, event: &Event) -> Result<(), lorasim_common::SimError> {
        for target in &event.targets {
            let entity = self
                .entities
                .get_mut(*target)
                .ok_or(lorasim_common::SimError::EntityNotFound(*target))?;
            self.context.set_source(*target);

            let step_start = Instant::now();
            entity.handle_event(event, &mut self.context)?;
            let step_elapsed = step_start.elapsed();

            if let Some((name, node_type)) = self.entity_labels.get(target) {
                let labels = [("node", name.clone()), ("node_type", node_type.clone())];
                metrics::histogram!(metric_defs::SIMULATION_STEP_TIME.name, &labels)
                    .record(step_elapsed.as_micros() as f64);
            }
        }
        Ok(())
    }

    /// Hand pending notifications to the statistics and the trace.
    fn drain_notifications(&mut self) {
        for record in self.context.take_notifications() {
            self.observe(&record);
        }
    }

    fn observe(&mut self, record: &NotificationRecord) {
        self.metrics.observe(record);
        if self.trace.is_enabled() {
            let subject = record.notification.subject();
            let origin = self.metrics.node_name(subject).unwrap_or("unknown").to_string();
            self.trace.record(TraceEntry {
                origin,
                origin_id: subject.0,
                time_s: record.time.as_secs_f64(),
                notification: record.notification.clone(),
            });
        }
    }

    /// Run until `duration`.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        self.run_with_progress(duration, None, |_, _, _| {})
    }

    /// Run until `duration` or until `stop_flag` is raised, reporting
    /// progress every 5 s of wall-clock time or every 100 000 events.
    ///
    /// The callback's last argument is `true` for the final report.
    pub fn run_with_progress<F>(
        &mut self,
        duration: SimTime,
        stop_flag: Option<Arc<AtomicBool>>,
        mut on_progress: F,
    ) -> Result<SimulationStats, RunnerError>
    where
        F: FnMut(&Self, ProgressInfo, bool),
    {
        let start_time = Instant::now();
        let end_time = duration;
        let progress_interval = Duration::from_secs(5);
        let event_progress_interval = 100_000u64;
        let mut last_progress = Instant::now();
        let mut last_progress_sim_time = self.context.time();
        let mut last_progress_events = 0u64;
        let mut stopped = false;

        self.scheduler.absorb(&mut self.context);
        while let Some(time) = self.scheduler.peek_time() {
            if let Some(ref flag) = stop_flag {
                if flag.load(Ordering::Relaxed) {
                    info!(sim_time = %self.context.time(), "simulation stopped");
                    stopped = true;
                    break;
                }
            }
            if time > end_time {
                break;
            }
            let Some(event) = self.scheduler.pop_next() else {
                break;
            };

            self.context.set_time(event.time);
            self.dispatch_event_with_metrics(&event)?;
            self.scheduler.absorb(&mut self.context);
            self.drain_notifications();
            self.metrics.count_event();

            let total_events = self.metrics.stats().total_events;
            let should_report = last_progress.elapsed() >= progress_interval
                || total_events - last_progress_events >= event_progress_interval;
            if should_report {
                let sim_time = self.context.time();
                let sim_delta = sim_time.as_secs_f64() - last_progress_sim_time.as_secs_f64();
                let wall_delta = last_progress.elapsed().as_secs_f64();
                let time_multiplier = if wall_delta > 0.0 { sim_delta / wall_delta } else { 0.0 };
                let remaining_sim = end_time.as_secs_f64() - sim_time.as_secs_f64();
                let estimated_remaining = if time_multiplier > 0.0 {
                    Duration::from_secs_f64(remaining_sim / time_multiplier)
                } else {
                    Duration::ZERO
                };
                let progress = ProgressInfo {
                    sim_time,
                    target_time: end_time,
                    wall_elapsed: start_time.elapsed(),
                    events_processed: total_events,
                    time_multiplier,
                    estimated_remaining,
                    progress_percent: sim_time.as_secs_f64() / end_time.as_secs_f64() * 100.0,
                };
                on_progress(self, progress, false);

                last_progress = Instant::now();
                last_progress_sim_time = sim_time;
                last_progress_events = total_events;
            }
        }

        if !stopped && self.context.time() < end_time {
            self.context.set_time(end_time);
        }
        self.finish()?;

        let sim_time = self.context.time();
        let wall_elapsed = start_time.elapsed();
        let stats = self
            .metrics
            .finish(sim_time.as_micros(), wall_elapsed.as_millis() as u64);
        debug!(
            events = stats.total_events,
            wall_time_ms = stats.wall_time_ms,
            "simulation finished"
        );

        let wall_s = wall_elapsed.as_secs_f64();
        let progress = ProgressInfo {
            sim_time,
            target_time: end_time,
            wall_elapsed,
            events_processed: stats.total_events,
            time_multiplier: if wall_s > 0.0 { sim_time.as_secs_f64() / wall_s } else { 0.0 },
            estimated_remaining: Duration::ZERO,
            progress_percent: 100.0,
        };
        on_progress(self, progress, true);

        self.trace.flush()?;
        Ok(stats)
    }

    /// Deliver `SimulationEnd` to every node so that energy is settled, and
    /// collect the final per-device consumption.
    fn finish(&mut self) -> Result<(), RunnerError> {
        let targets: Vec<EntityId> = self.node_infos.iter().map(|n| n.entity_id).collect();
        let end = Event {
            id: EventId(u64::MAX),
            time: self.context.time(),
            source: EntityId::new(0),
            targets,
            payload: EventPayload::SimulationEnd,
        };
        self.dispatch_event_with_metrics(&end)?;
        // Whatever the nodes schedule now lies beyond the run.
        self.context.take_pending_events();
        self.context.take_cancelled();
        self.drain_notifications();

        for info in &self.node_infos {
            let energy = self
                .entities
                .get(info.entity_id)
                .and_then(|e| e.energy_consumption());
            if let Some(node) = self.metrics.node_mut(info.entity_id) {
                node.energy = energy;
            }
        }
        Ok(())
    }

    /// Every radio node.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.node_infos
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        self.metrics.stats()
    }

    /// Trace entries recorded so far.
    pub fn trace_entries(&self) -> &[TraceEntry] {
        self.trace.entries()
    }

    /// Current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }
}

/// Create an event loop without trace output.
pub fn create_event_loop(simulation: BuiltSimulation) -> EventLoop {
    EventLoop::new(simulation, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
simulation:
  duration_s: 600
  seed: 1
gateways:
  - name: gw
    placement: { type: point, x: 0, y: 0 }
end_devices:
  - name: ed
    count: 3
    placement: { type: disc, radius_m: 500 }
    mac:
      spreading_factor: 7
      confirmed: true
      traffic: { type: periodic, period_s: 60 }
"#;

    fn event_loop(yaml: &str) -> EventLoop {
        let scenario = load_scenario_from_str(yaml).unwrap();
        let seed = scenario.simulation.seed;
        create_event_loop(build_simulation(&scenario, seed).unwrap())
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5025)), " 1h23m45s");
        assert_eq!(format_duration(Duration::ZERO), " 0h00m00s");
    }

    #[test]
    fn test_run_collects_stats_and_energy() {
        let mut el = event_loop(SCENARIO);
        let stats = el.run(SimTime::from_secs(600.0)).unwrap();

        assert!(stats.total_events > 0);
        assert!(stats.uplinks_sent > 0);
        assert!(stats.packets_transmitted >= stats.uplinks_sent);
        assert_eq!(stats.simulation_time_us, 600_000_000);
        assert!(stats.delivery_ratio > 0.0 && stats.delivery_ratio <= 1.0);
        assert_eq!(stats.nodes.len(), 4);
        assert_eq!(stats.nodes["gw"].role, "gateway");
        let energy = stats.nodes["ed-0"].energy.unwrap();
        assert!(energy.total() > 0.0);
        assert!(stats.nodes["gw"].energy.is_none());
    }

    #[test]
    fn test_same_seed_same_stats() {
        let a = event_loop(SCENARIO).run(SimTime::from_secs(600.0)).unwrap();
        let b = event_loop(SCENARIO).run(SimTime::from_secs(600.0)).unwrap();
        assert_eq!(a.total_events, b.total_events);
        assert_eq!(a.packets_transmitted, b.packets_transmitted);
        assert_eq!(a.uplinks_received, b.uplinks_received);
        assert_eq!(a.packets_lost, b.packets_lost);
    }

    #[test]
    fn test_stop_flag_ends_run() {
        let mut el = event_loop(SCENARIO);
        let stop = Arc::new(AtomicBool::new(true));
        let mut finals = 0;
        let stats = el
            .run_with_progress(SimTime::from_secs(600.0), Some(stop), |_, _, is_final| {
                if is_final {
                    finals += 1;
                }
            })
            .unwrap();
        assert_eq!(stats.total_events, 0);
        assert_eq!(finals, 1);
        assert!(el.current_time() < SimTime::from_secs(600.0));
    }

    #[test]
    fn test_trace_entries_name_their_node() {
        let scenario = load_scenario_from_str(SCENARIO).unwrap();
        let sim = build_simulation(&scenario, 1).unwrap();
        let mut el = EventLoop::new(sim, Some(Box::new(std::io::sink())));
        el.run(SimTime::from_secs(300.0)).unwrap();

        let entries = el.trace_entries();
        assert!(!entries.is_empty());
        let first_tx = entries
            .iter()
            .find(|e| matches!(e.notification, Notification::StartSending { .. }))
            .unwrap();
        assert!(first_tx.origin.starts_with("ed-"));
        let json = serde_json::to_value(first_tx).unwrap();
        assert_eq!(json["event"], "start_sending");
        assert!(json["time_s"].as_f64().unwrap() <= 300.0);
    }
}
