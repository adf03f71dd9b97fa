//! Per-tool resource usage
//!
//! Adapters run inside the harness process, so the numbers are process-wide:
//! tools running concurrently for the same stage share them.

use std::time::Instant;

use serde_json::{json, Map, Value};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

pub struct ResourceMeter {
    system: System,
    pid: Pid,
    started: Instant,
    rss_start: Option<u64>,
}

impl ResourceMeter {
    /// Take the starting sample
    pub fn start() -> Self {
        let mut meter = Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
            started: Instant::now(),
            rss_start: None,
        };
        meter.rss_start = meter.sample().map(|(rss, _)| rss);
        meter.started = Instant::now();
        meter
    }

    /// (resident bytes, cpu percent since the previous sample)
    fn sample(&mut self) -> Option<(u64, f32)> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );
        self.system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
    }

    /// Close the measurement window
    ///
    /// Keys: `wall_time_s`, `cpu_percent_avg`, `cpu_total_s`, `rss_kb_start`,
    /// `rss_kb`. Values the platform cannot report are left out.
    pub fn finish(mut self) -> Value {
        let wall = self.started.elapsed().as_secs_f64();
        let sampled = self.sample();

        let mut usage = Map::new();
        usage.insert("wall_time_s".to_string(), json!(round6(wall)));
        if let Some((rss, cpu)) = sampled {
            let cpu = f64::from(cpu);
            usage.insert("cpu_percent_avg".to_string(), json!(round6(cpu)));
            usage.insert("cpu_total_s".to_string(), json!(round6(cpu / 100.0 * wall)));
            usage.insert("rss_kb".to_string(), json!(rss / 1024));
        }
        if let Some(rss) = self.rss_start {
            usage.insert("rss_kb_start".to_string(), json!(rss / 1024));
        }
        Value::Object(usage)
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Attach `resources` to an adapter's meta payload
///
/// A non-object payload is kept under `adapter`.
pub fn with_resources(meta: Option<Value>, resources: Value) -> Value {
    let mut object = match meta {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("adapter".to_string(), other);
            map
        }
        None => Map::new(),
    };
    object.insert("resources".to_string(), resources);
    Value::Object(object)
}
