use crate::config::LogLevel;
use crate::error::{Result, ServiceError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Recent log lines kept for the host UI
static LOG_BUFFER: once_cell::sync::Lazy<Arc<Mutex<LogBuffer>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(LogBuffer::new(5000))));

/// Ring buffer of formatted log lines
pub struct LogBuffer {
    logs: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            logs: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, log: String) {
        if self.logs.len() >= self.max_size {
            self.logs.pop_front();
        }
        self.logs.push_back(log);
    }

    /// The newest `count` lines, oldest first. Zero means all of them.
    pub fn get_logs(&self, count: usize) -> Vec<String> {
        if count == 0 || count >= self.logs.len() {
            return self.logs.iter().cloned().collect();
        }
        let start = self.logs.len() - count;
        self.logs.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

pub fn get_recent_logs(count: usize) -> Vec<String> {
    if let Ok(buffer) = LOG_BUFFER.lock() {
        buffer.get_logs(count)
    } else {
        vec![]
    }
}

pub fn clear_logs() {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.clear();
    }
}

pub fn add_log(message: String) {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.push(message);
    }
}

/// Install the console and buffer subscribers once per process.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn tracing_level(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Silent => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warning => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
    }
}

fn directive(spec: &str) -> Result<tracing_subscriber::filter::Directive> {
    spec.parse()
        .map_err(|e| ServiceError::config(format!("Invalid log directive {}: {}", spec, e)))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let Some(tracing_level) = tracing_level(level) else {
        return Ok(());
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(directive(&format!("tunrelay_stack={}", tracing_level))?)
        .add_directive(directive(&format!("tunrelay_service={}", tracing_level))?)
        .add_directive(directive("tokio=warn")?)
        .add_directive(directive("mio=warn")?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    // try_init: the host may already have installed a subscriber
    let result = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BufferLayer { max_level: tracing_level })
        .try_init();

    if result.is_err() {
        add_log("[INFO] Tracing already initialized, using existing subscriber".to_string());
    } else {
        add_log(format!("[INFO] Logging initialized at level: {:?}", level));
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

/// Copies events into [`LOG_BUFFER`].
struct BufferLayer {
    max_level: Level,
}

impl<S> Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata.level();
        if *level > self.max_level {
            return;
        }
        let target = metadata.target();
        if target.starts_with("tokio") || target.starts_with("mio") {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        add_log(format!("[{}] [{}] {}", timestamp, level, visitor.finish()));
    }
}

/// Renders an event as its message followed by ` key=value` pairs.
#[derive(Default)]
struct LogVisitor {
    message: String,
    fields: String,
}

impl LogVisitor {
    fn finish(self) -> String {
        self.message + &self.fields
    }
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}
