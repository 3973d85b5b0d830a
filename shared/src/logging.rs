//! Shared logging utilities for consistent tracing across station processes

use crate::types::ProcessId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Event, Subscriber, error, info};
use tracing_subscriber::layer::Context;

/// Remote collector that receives batched trace events
#[derive(Debug, Clone)]
pub struct TracingEndpoint {
    pub url: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl TracingEndpoint {
    pub fn new(url: String) -> Self {
        Self {
            url,
            batch_size: 5,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Structured trace event posted to the collector
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    pub process: String,
    pub fields: HashMap<String, serde_json::Value>,
}

/// Layer forwarding process-tagged events to a [`TracingEndpoint`]
pub struct HttpTracingLayer {
    sender: mpsc::UnboundedSender<TraceEvent>,
}

impl HttpTracingLayer {
    /// Spawns the batching task; must be called inside a tokio runtime
    pub fn new(endpoint: TracingEndpoint) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceEvent>();

        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut buffer = Vec::with_capacity(endpoint.batch_size);
            let mut flush_timer = tokio::time::interval(endpoint.flush_interval);

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            buffer.push(event);
                            if buffer.len() >= endpoint.batch_size {
                                Self::send_batch(&client, &endpoint.url, &mut buffer).await;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                Self::send_batch(&client, &endpoint.url, &mut buffer).await;
                            }
                            break;
                        }
                    },
                    _ = flush_timer.tick() => {
                        if !buffer.is_empty() {
                            Self::send_batch(&client, &endpoint.url, &mut buffer).await;
                        }
                    }
                }
            }
        });

        HttpTracingLayer { sender: tx }
    }

    async fn send_batch(client: &reqwest::Client, url: &str, buffer: &mut Vec<TraceEvent>) {
        let batch = std::mem::take(buffer);

        // Logging through tracing here would feed back into this layer
        match client.post(url).json(&batch).send().await {
            Ok(response) if !response.status().is_success() => {
                eprintln!("trace collector rejected batch: HTTP {}", response.status());
            }
            Ok(_) => {}
            Err(e) => eprintln!("trace collector unreachable: {e}"),
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for HttpTracingLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut fields = HashMap::new();
        let mut message = String::new();

        event.record(&mut TraceVisitor {
            message: &mut message,
            fields: &mut fields,
        });

        // Only events emitted through the process_* macros are forwarded
        if !fields.contains_key("process") {
            return;
        }

        let _ = self.sender.send(TraceEvent {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
            process: ProcessId::current().to_string(),
            fields,
        });
    }
}

struct TraceVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut HashMap<String, serde_json::Value>,
}

impl tracing::field::Visit for TraceVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.push_str(&format!("{value:?}"));
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Filter directives for the current process role
pub fn filter_directives(log_level: &str) -> String {
    match ProcessId::current() {
        ProcessId::Hypervisor => {
            format!("hypervisor={log_level},shared={log_level},tower_http=warn,hyper=warn,reqwest=warn")
        }
        ProcessId::Updater => format!("hypervisor={log_level},shared={log_level}"),
    }
}

/// Initialize tracing with an optional remote endpoint; `RUST_LOG` wins over `log_level`
pub fn init_tracing(log_level: Option<&str>, endpoint: Option<TracingEndpoint>) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let directives = filter_directives(log_level.unwrap_or("info"));
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    // try_init: a second initialization (tests, re-exec) is not fatal
    let _ = match endpoint {
        Some(endpoint) => registry.with(HttpTracingLayer::new(endpoint)).try_init(),
        None => registry.try_init(),
    };
}

/// Get formatted timestamp for consistent logging
pub fn format_timestamp() -> String {
    Utc::now().format("%H:%M:%S%.3f").to_string()
}

/// Macro for process-aware info logging
#[macro_export]
macro_rules! process_info {
    ($process_id:expr, $($arg:tt)*) => {
        tracing::info!(
            process = %$process_id,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for process-aware warning logging
#[macro_export]
macro_rules! process_warn {
    ($process_id:expr, $($arg:tt)*) => {
        tracing::warn!(
            process = %$process_id,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for process-aware error logging
#[macro_export]
macro_rules! process_error {
    ($process_id:expr, $($arg:tt)*) => {
        tracing::error!(
            process = %$process_id,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for process-aware debug logging
#[macro_export]
macro_rules! process_debug {
    ($process_id:expr, $($arg:tt)*) => {
        tracing::debug!(
            process = %$process_id,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Contextual logging helper for startup messages
pub fn log_startup(process_id: &ProcessId, details: &str) {
    info!(
        process = %process_id,
        timestamp = format_timestamp(),
        "🚀 Starting {}",
        details
    );
}

/// Contextual logging helper for shutdown messages
pub fn log_shutdown(process_id: &ProcessId, reason: &str) {
    info!(
        process = %process_id,
        timestamp = format_timestamp(),
        "🛑 Shutting down: {}",
        reason
    );
}

/// Contextual logging helper for error conditions
pub fn log_error(process_id: &ProcessId, context: &str, error: &dyn std::fmt::Display) {
    error!(
        process = %process_id,
        timestamp = format_timestamp(),
        error = %error,
        "❌ {} failed: {}",
        context,
        error
    );
}

/// Contextual logging helper for success conditions
pub fn log_success(process_id: &ProcessId, message: &str) {
    info!(
        process = %process_id,
        timestamp = format_timestamp(),
        "✅ {}",
        message
    );
}
