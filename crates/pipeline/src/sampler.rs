use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use humansize::{format_size, DECIMAL};
use log::{debug, info};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Periodic CPU/memory logger bound to one job. Stops when stopped or dropped.
pub struct ResourceSampler {
    label: String,
    samples: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl ResourceSampler {
    pub fn start(label: impl Into<String>, every: Duration) -> Self {
        let label = label.into();
        let samples = Arc::new(AtomicUsize::new(0));

        let task_label = label.clone();
        let counter = samples.clone();
        let task = tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sample(&mut system, &task_label);
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        Self {
            label,
            samples,
            task: Some(task),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::Relaxed)
    }

    /// Stop sampling; returns how many samples were taken
    pub fn stop(mut self) -> usize {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let taken = self.samples();
        debug!("Resource sampler for {} stopped after {} samples", self.label, taken);
        taken
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn sample(system: &mut System, label: &str) {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let per_core: Vec<String> = system
        .cpus()
        .iter()
        .map(|cpu| format!("{:.1}%", cpu.cpu_usage()))
        .collect();
    let average = if system.cpus().is_empty() {
        0.0
    } else {
        system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len() as f32
    };

    debug!("CPU usage per core [{}]: {}", label, per_core.join(", "));
    info!(
        "📊 [{}] Average CPU {:.1}% | memory {} / {}",
        label,
        average,
        format_size(system.used_memory(), DECIMAL),
        format_size(system.total_memory(), DECIMAL)
    );
}
