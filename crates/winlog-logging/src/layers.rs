//! Tracing layers for winlog agents

use std::sync::Arc;

use tracing::{Subscriber, span};
use tracing_subscriber::{
    fmt::{
        MakeWriter,
        format::{Format, Json, JsonFields},
    },
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::config::JsonlConfig;
use crate::context::{WatchContextData, WatchContextGuard};

/// Layer that tags new spans with the active watch context
///
/// Spans created while a [`WatchContextGuard`] is live carry a
/// [`WatchContextExtension`], so the channel survives into work that the
/// span is later entered on, including other threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct WatchContextLayer;

impl WatchContextLayer {
    pub fn new() -> Self {
        Self
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct WatchContextExtension {
    pub data: Arc<WatchContextData>,
}

impl<S> Layer<S> for WatchContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        if let Some(data) = WatchContextGuard::current() {
            span.extensions_mut().insert(WatchContextExtension {
                data: Arc::new(data),
            });
            return;
        }
        // No guard on this thread: inherit from the parent span.
        let inherited = span
            .parent()
            .and_then(|parent| parent.extensions().get::<WatchContextExtension>().cloned());
        if let Some(ext) = inherited {
            span.extensions_mut().insert(ext);
        }
    }
}

/// JSON-lines formatting layer
pub fn jsonl_file_layer<S, W>(
    writer: W,
    jsonl: &JsonlConfig,
) -> tracing_subscriber::fmt::Layer<S, JsonFields, Format<Json>, W>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(jsonl.spans)
        .with_span_list(jsonl.spans)
        .flatten_event(jsonl.flatten)
        .with_file(jsonl.source_location)
        .with_line_number(jsonl.source_location)
        .with_thread_ids(jsonl.thread)
        .with_thread_names(jsonl.thread)
        .with_ansi(false)
        .with_writer(writer)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing_subscriber::{Registry, layer::SubscriberExt};
    use uuid::Uuid;

    use super::*;

    #[derive(Clone, Default)]
    struct ChannelRecorder {
        seen: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl<S> Layer<S> for ChannelRecorder
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    {
        fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
            let channel = ctx.span(id).and_then(|span| {
                span.extensions()
                    .get::<WatchContextExtension>()
                    .map(|ext| ext.data.channel.clone())
            });
            self.seen.lock().unwrap().push(channel);
        }
    }

    #[test]
    fn test_spans_carry_watch_context() {
        let recorder = ChannelRecorder::default();
        let subscriber = Registry::default()
            .with(WatchContextLayer::new())
            .with(recorder.clone());

        tracing::subscriber::with_default(subscriber, || {
            let _bare = tracing::info_span!("bare").entered();
            let outer = {
                let _guard = WatchContextGuard::new("System", Uuid::new_v4(), Uuid::new_v4());
                tracing::info_span!("convert")
            };
            let _entered = outer.enter();
            let _child = tracing::info_span!("render").entered();
        });

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![None, Some("System".to_string()), Some("System".to_string())]
        );
    }
}
