use std::collections::HashMap;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Splits an event into its category tag, free-text message and metrics.
#[derive(Default)]
pub struct DashboardVisitor {
    category: Option<String>,
    message: Option<String>,
    metrics: Vec<(&'static str, String)>,
}

impl DashboardVisitor {
    fn push(&mut self, field: &Field, value: String) {
        match field.name() {
            "category" => self.category = Some(value),
            "message" => self.message = Some(value),
            name => self.metrics.push((name, value)),
        }
    }
}

impl Visit for DashboardVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, format!("{value:.3}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    // Integers and bools land here through the trait's default methods.
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }
}

#[derive(Default, Clone)]
pub struct MetricRegistry {
    labels: HashMap<String, String>,
}

impl MetricRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("avg_reward", "Avg reward");
        registry.register("max_reward", "Max reward");
        registry.register("min_reward", "Min reward");
        registry.register("steps_collected", "Steps collected");
        registry.register("steps_per_second", "Steps per second");
        registry.register("learning_rate", "Learning rate");
        registry.register("elapsed_secs", "Used time (s)");
        registry.register("reward_std", "Reward std");
        registry
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("RUST_GRPO_METRIC_LABELS") {
            self.apply_overrides(&raw);
        }
        self
    }

    fn apply_overrides(&mut self, raw: &str) {
        for entry in raw.split(',') {
            let Some((key, label)) = entry.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let label = label.trim();
            if !key.is_empty() && !label.is_empty() {
                self.register(key, label);
            }
        }
    }

    pub fn register(&mut self, key: impl Into<String>, label: impl Into<String>) {
        self.labels.insert(key.into(), label.into());
    }

    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

pub struct DashboardFormatter {
    registry: MetricRegistry,
}

impl DashboardFormatter {
    pub fn new(registry: MetricRegistry) -> Self {
        Self { registry }
    }

    fn category_label(raw: Option<&str>) -> &'static str {
        match raw.unwrap_or("MISC").to_ascii_uppercase().as_str() {
            "TRAINER" | "TRAIN" => "TRAINER",
            "ACTOR" => "ACTOR",
            "CHECKPOINT" => "CHECKPOINT",
            _ => "MISC",
        }
    }

    fn style_category(label: &str, ansi: bool) -> String {
        if !ansi {
            return label.to_string();
        }
        let code = match label {
            "TRAINER" => "\x1b[1;35m",
            "ACTOR" => "\x1b[1;36m",
            "CHECKPOINT" => "\x1b[1;32m",
            _ => "\x1b[1;33m",
        };
        format!("{code}{label}\x1b[0m")
    }

    fn pretty_key(&self, key: &str) -> String {
        if let Some(label) = self.registry.resolve(key) {
            return label.to_string();
        }

        let mut chars = key.replace('_', " ").chars().collect::<Vec<_>>();
        if let Some(first) = chars.first_mut() {
            *first = first.to_ascii_uppercase();
        }
        chars.into_iter().collect()
    }
}

impl<S, N> FormatEvent<S, N> for DashboardFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = DashboardVisitor::default();
        event.record(&mut visitor);

        let label = Self::category_label(visitor.category.as_deref());
        let styled = Self::style_category(label, writer.has_ansi_escapes());
        write!(writer, "{styled} - ")?;

        if visitor.metrics.is_empty() {
            write!(writer, "{}", visitor.message.as_deref().unwrap_or("No metrics"))?;
        }
        for (i, (key, value)) in visitor.metrics.iter().enumerate() {
            if i > 0 {
                write!(writer, " | ")?;
            }
            write!(writer, "{}: {}", self.pretty_key(key), value)?;
        }

        writeln!(writer)
    }
}
