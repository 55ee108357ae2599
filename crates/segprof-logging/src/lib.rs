//! Logging for segprof.
//!
//! Library crates log through `log`; [`init_logging`] bridges those records
//! into `tracing`, filters them with `RUST_LOG` / `SEGPROF_LOG`, and hands
//! every line to an optional host hook. Fields recorded on enclosing spans
//! (the dispatch span carries `session`, `backend` and `unit`) are attached
//! to each line so a host can group remote activity per session.

use once_cell::sync::{Lazy, OnceCell};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_log::LogTracer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// One log line as handed to the host hook.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Identifies this process's profiling run across all of its lines.
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    /// Event fields merged over the fields of every enclosing span.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    pub fn session(&self) -> Option<&str> {
        self.fields.get("session").and_then(Value::as_str)
    }

    pub fn backend(&self) -> Option<&str> {
        self.fields.get("backend").and_then(Value::as_str)
    }
}

/// Chrome trace-format event: `B`/`E` for span enter/exit, `i` for events.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: String,
    pub ph: char,
    pub ts: i64,
    pub pid: i64,
    pub span_id: Option<u64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

type LogHook = Arc<dyn Fn(&LogRecord) + Send + Sync>;
type TraceHook = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

static LOG_HOOK: OnceCell<LogHook> = OnceCell::new();
static TRACE_HOOK: OnceCell<TraceHook> = OnceCell::new();
static RUN_ID: Lazy<String> = Lazy::new(|| uuid::Uuid::new_v4().simple().to_string());

/// Keeps a thread-scoped subscriber installed when a global one already
/// existed.
pub struct LoggingGuard {
    _scoped: Option<DefaultGuard>,
}

#[derive(Clone, Debug)]
pub struct LoggingOptions {
    /// Directive used when neither `RUST_LOG` nor `SEGPROF_LOG` is set.
    pub default_directive: String,
    /// Emit span enter/exit events to the trace hook.
    pub enable_traces: bool,
    pub pid: i64,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            enable_traces: false,
            pid: std::process::id() as i64,
        }
    }
}

/// Only the first hook set in a process is kept.
pub fn set_log_hook<F>(hook: F)
where
    F: Fn(&LogRecord) + Send + Sync + 'static,
{
    let _ = LOG_HOOK.set(Arc::new(hook));
}

pub fn set_trace_hook<F>(hook: F)
where
    F: Fn(&TraceEvent) + Send + Sync + 'static,
{
    let _ = TRACE_HOOK.set(Arc::new(hook));
}

pub fn run_id() -> &'static str {
    &RUN_ID
}

pub fn init_logging(opts: LoggingOptions) -> LoggingGuard {
    let _ = LogTracer::init();

    let filter = || {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_from_env("SEGPROF_LOG"))
            .or_else(|_| EnvFilter::try_new(&opts.default_directive))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = || {
        tracing_subscriber::registry()
            .with(filter())
            .with(SpanFieldsLayer)
            .with(HookLayer {
                pid: opts.pid,
                traces: opts.enable_traces,
            })
    };

    let scoped = match tracing::subscriber::set_global_default(subscriber()) {
        Ok(()) => None,
        Err(_) => Some(tracing::subscriber::set_default(subscriber())),
    };
    LoggingGuard { _scoped: scoped }
}

/// Fields recorded on a span, kept in its extensions.
#[derive(Default)]
struct SpanFields(Map<String, Value>);

struct SpanFieldsLayer;

impl<S> Layer<S> for SpanFieldsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut collector = FieldCollector::default();
        attrs.record(&mut collector);
        span.extensions_mut().insert(SpanFields(collector.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut collector = FieldCollector::default();
        values.record(&mut collector);
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            fields.extend(collector.fields);
        }
    }
}

struct HookLayer {
    pid: i64,
    traces: bool,
}

impl HookLayer {
    fn emit_span(&self, id: &Id, name: &str, cat: &str, ph: char, args: Map<String, Value>) {
        if !self.traces {
            return;
        }
        if let Some(hook) = TRACE_HOOK.get() {
            hook(&TraceEvent {
                name: name.to_string(),
                cat: cat.to_string(),
                ph,
                ts: chrono::Utc::now().timestamp_micros(),
                pid: self.pid,
                span_id: Some(id.into_u64()),
                args,
            });
        }
    }
}

impl<S> Layer<S> for HookLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        // innermost span wins
        let mut fields = Map::new();
        let mut span_name = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(span_fields)) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.clone());
                }
                span_name = Some(span.name().to_string());
            }
        }
        fields.extend(collector.fields);
        let message = collector
            .message
            .unwrap_or_else(|| meta.name().to_string());

        if let Some(hook) = LOG_HOOK.get() {
            hook(&LogRecord {
                ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                level: meta.level().to_string(),
                target: meta.target().to_string(),
                message: message.clone(),
                run_id: run_id().to_string(),
                span: span_name,
                fields: fields.clone(),
            });
        }
        if self.traces {
            if let Some(hook) = TRACE_HOOK.get() {
                hook(&TraceEvent {
                    name: message,
                    cat: meta.target().to_string(),
                    ph: 'i',
                    ts: chrono::Utc::now().timestamp_micros(),
                    pid: self.pid,
                    span_id: ctx.current_span().id().map(Id::into_u64),
                    args: fields,
                });
            }
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let args = span
                .extensions()
                .get::<SpanFields>()
                .map(|f| f.0.clone())
                .unwrap_or_default();
            self.emit_span(id, span.name(), span.metadata().target(), 'B', args);
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            self.emit_span(id, span.name(), span.metadata().target(), 'E', Map::new());
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }
}
