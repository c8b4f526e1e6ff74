use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::dispatcher::Dispatcher;
use crate::record::{Extra, Level, Record, SourceLocation};

/// Events from this crate are never fed back into the pipeline.
const OWN_TARGET: &str = "log_pipeline";

/// `tracing_subscriber` layer that turns `tracing` events into
/// [`Record`]s and hands them to a [`Dispatcher`].
///
/// Fields of the enclosing spans form the bound extra layer (outer spans
/// first, inner spans shadow them); the event's own fields form the
/// per-call layer. The innermost span name stands in for the function.
pub struct DispatchLayer {
    dispatcher: Arc<Dispatcher>,
    /// Total events seen by the layer (before level filtering).
    pub total_events: Arc<AtomicU64>,
    /// Events whose delivery returned an error.
    pub failed_events: Arc<AtomicU64>,
}

impl DispatchLayer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            total_events: Arc::new(AtomicU64::new(0)),
            failed_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Fields recorded on a span, kept in its extensions.
struct SpanFields(BTreeMap<String, serde_json::Value>);

impl<S> Layer<S> for DispatchLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = BTreeMap::new();
        let mut message = None;
        attrs.record(&mut FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        });
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            let mut message = None;
            values.record(&mut FieldVisitor {
                fields,
                message: &mut message,
            });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if meta.target().starts_with(OWN_TARGET) {
            return;
        }
        let level = Level::from(meta.level());
        match self.dispatcher.min_level() {
            Some(floor) if level >= floor => {}
            _ => return,
        }

        let mut bound = BTreeMap::new();
        let mut function = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(fields)) = span.extensions().get::<SpanFields>() {
                    bound.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                function = Some(span.name());
            }
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;
        event.record(&mut FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        });

        let built = Record::builder(level, "{}")
            .arg(message.unwrap_or_default())
            .location(SourceLocation {
                name: meta.module_path().unwrap_or(meta.target()).to_string(),
                function: function.unwrap_or("<none>").to_string(),
                file: meta.file().unwrap_or("<unknown>").to_string(),
                line: meta.line().unwrap_or(0),
            })
            .extra(Extra::new().with_layer(bound).with_layer(fields))
            .build();

        let result = match built {
            Ok(record) => self.dispatcher.dispatch(record).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            self.failed_events.fetch_add(1, Ordering::Relaxed);
            eprintln!("log-pipeline: dropping tracing event: {e}");
        }
    }
}

/// Collects `tracing` fields as JSON values; `message` is kept apart.
pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, serde_json::Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> FieldVisitor<'a> {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // Format arguments of the event macro arrive here.
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.insert(field, serde_json::Value::String(format!("{:?}", value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Destination, HandlerConfig};
    use parking_lot::Mutex;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    #[test]
    fn events_carry_span_and_event_fields() {
        let dispatcher = Arc::new(Dispatcher::new());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        dispatcher
            .register(
                HandlerConfig::new(Destination::callable(move |m| {
                    sink.lock().push(m.text.to_string());
                    Ok(())
                }))
                .level("INFO")
                .format("{level}|{function}|{message}|{extra[user]}|{extra[code]}"),
            )
            .unwrap();

        let layer = DispatchLayer::new(dispatcher.clone());
        let total = layer.total_events.clone();
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!(target: "app", "request", user = "alice");
            let _entered = span.enter();
            tracing::warn!(target: "app", code = 7, "slow {}", "query");
            tracing::debug!(target: "app", code = 8, "below the floor");
            tracing::info!(target: "log_pipeline::handler", "internal");
        });

        assert_eq!(total.load(Ordering::Relaxed), 3);
        assert_eq!(*lines.lock(), vec!["WARNING|request|slow query|alice|7\n"]);
    }
}
