//! ECS-style JSON log records for `tracing-subscriber`.
//!
//! Every event becomes one line of JSON with the flat, dotted field names
//! beats use (`@timestamp`, `log.level`, `log.logger`, `message`,
//! `ecs.version`, ...). Event fields other than `message` are copied in as
//! extra top-level keys.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tracing::field::{Field, Visit};
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const ECS_VERSION: &str = "1.6.0";

/// Event formatter producing one ECS JSON object per line.
#[derive(Debug, Clone)]
pub struct EcsFormat {
    service: String,
}

impl EcsFormat {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn render(&self, meta: &Metadata<'_>, fields: EventFields, now: DateTime<Utc>) -> String {
        let mut record = Map::new();
        record.insert(
            "@timestamp".into(),
            now.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
        );
        record.insert(
            "log.level".into(),
            meta.level().as_str().to_ascii_lowercase().into(),
        );
        record.insert("log.logger".into(), meta.target().into());
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            record.insert(
                "log.origin".into(),
                json!({ "file.name": file, "file.line": line }),
            );
        }
        record.insert(
            "message".into(),
            fields.message.unwrap_or_default().into(),
        );
        record.insert("service.name".into(), self.service.clone().into());
        record.insert("ecs.version".into(), ECS_VERSION.into());

        for (key, value) in fields.extra {
            record.entry(key).or_insert(value);
        }

        Value::Object(record).to_string()
    }
}

impl<S, N> FormatEvent<S, N> for EcsFormat
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
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let line = self.render(event.metadata(), fields, Utc::now());
        writeln!(writer, "{line}")
    }
}

/// Collects an event's fields, pulling `message` out separately.
#[derive(Debug, Default)]
struct EventFields {
    message: Option<String>,
    extra: Map<String, Value>,
}

impl EventFields {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.extra.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}").into());
    }
}
