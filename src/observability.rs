use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    /// The terminal handler, kept apart so no stage name can collide with it.
    pub endpoint: StageMetrics,
    pub dispatches: u64,
    pub fallbacks: u64,
    pub total_duration_ms: f64,
}

/// Durations are inclusive: a stage's time covers everything inside it.
#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub errors: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        self.start_timer(Some(stage_name.to_string()))
    }

    pub fn start_endpoint(&self) -> StageTimer {
        self.start_timer(None)
    }

    fn start_timer(&self, stage: Option<String>) -> StageTimer {
        StageTimer {
            stage,
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_stage_error(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.stages.entry(stage_name.to_string()).or_default().errors += 1;
        }
    }

    pub fn record_endpoint_error(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.endpoint.errors += 1;
        }
    }

    pub fn record_dispatch(&self, duration: Duration, fallback: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.dispatches += 1;
            if fallback {
                guard.fallbacks += 1;
            }
            guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records a call on drop. `stage: None` times the endpoint.
pub struct StageTimer {
    stage: Option<String>,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = match &self.stage {
                Some(stage) => guard.stages.entry(stage.clone()).or_default(),
                None => &mut guard.endpoint,
            };
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_deref().unwrap_or("<endpoint>"),
            duration_ms,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        dispatches = snapshot.dispatches,
        fallbacks = snapshot.fallbacks,
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            errors = metrics.errors,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
    info!(
        calls = snapshot.endpoint.calls,
        errors = snapshot.endpoint.errors,
        total_ms = snapshot.endpoint.total_duration_ms,
        max_ms = snapshot.endpoint.max_duration_ms,
        "Endpoint metrics"
    );
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP pipeline_dispatches_total Total number of dispatched requests\n");
        output.push_str("# TYPE pipeline_dispatches_total counter\n");
        output.push_str(&format!("pipeline_dispatches_total {}\n", self.dispatches));
        output.push_str(
            "# HELP pipeline_fallbacks_total Requests answered with the fallback response\n",
        );
        output.push_str("# TYPE pipeline_fallbacks_total counter\n");
        output.push_str(&format!("pipeline_fallbacks_total {}\n", self.fallbacks));
        output.push_str("# HELP pipeline_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE pipeline_stage_calls_total counter\n");
        output.push_str("# HELP pipeline_stage_errors_total Errors returned by a stage\n");
        output.push_str("# TYPE pipeline_stage_errors_total counter\n");
        output.push_str(
            "# HELP pipeline_stage_duration_seconds_total Accumulated inclusive stage duration in seconds\n",
        );
        output.push_str("# TYPE pipeline_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP pipeline_stage_duration_seconds_max Maximum inclusive stage duration in seconds\n",
        );
        output.push_str("# TYPE pipeline_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "pipeline_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "pipeline_stage_errors_total{{stage=\"{}\"}} {}\n",
                stage, metrics.errors
            ));
            output.push_str(&format!(
                "pipeline_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "pipeline_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP pipeline_endpoint_calls_total Terminal handler invocation count\n");
        output.push_str("# TYPE pipeline_endpoint_calls_total counter\n");
        output.push_str(&format!("pipeline_endpoint_calls_total {}\n", self.endpoint.calls));
        output.push_str("# HELP pipeline_endpoint_errors_total Errors returned by the terminal handler\n");
        output.push_str("# TYPE pipeline_endpoint_errors_total counter\n");
        output.push_str(&format!("pipeline_endpoint_errors_total {}\n", self.endpoint.errors));
        output.push_str("# HELP pipeline_endpoint_duration_seconds_total Accumulated terminal handler duration\n");
        output.push_str("# TYPE pipeline_endpoint_duration_seconds_total counter\n");
        output.push_str(&format!(
            "pipeline_endpoint_duration_seconds_total {:.6}\n",
            self.endpoint.total_duration_ms / 1_000.0
        ));
        output.push_str("# HELP pipeline_dispatch_duration_seconds_total Accumulated dispatch duration\n");
        output.push_str("# TYPE pipeline_dispatch_duration_seconds_total counter\n");
        output.push_str(&format!(
            "pipeline_dispatch_duration_seconds_total {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
