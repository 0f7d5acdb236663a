//! Rendering against the simulated event log
//!
//! These exercise the full probe-and-fill path through the native seam,
//! including the sizing anomalies the simulated backend can inject.

use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use winlog_core::{
    EventLogSession, FormatMessageFlags, HandleError, HandleKind, MockEvent, MockEventLog,
    MockFault, MockPublisher, NotificationCallback, OwnedHandle, Status, SubscribeFlags,
    SubscribeOrigin, SubscribeRequest, VariantValue,
};
use winlog_render::{PublisherCache, RenderContext, RenderError, Renderer};

struct Fixture {
    mock: Arc<MockEventLog>,
    session: EventLogSession,
    renderer: Renderer,
    deliveries: mpsc::Receiver<u64>,
    _subscription: OwnedHandle,
}

impl Fixture {
    fn new() -> Self {
        let mock = Arc::new(MockEventLog::with_channels(&["System"]));
        mock.add_publisher(
            MockPublisher::new("Service Control Manager")
                .with_display_name("Service Control Manager Eventlog Provider")
                .with_message(7036, "The %1 service entered the %2 state.")
                .with_task(0, "None")
                .with_keyword(0x0000_0000_0000_0001, "Service"),
        );
        let session = EventLogSession::new(mock.clone());

        let (tx, deliveries) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: NotificationCallback = Arc::new(move |_action, payload| {
            let _ = tx.lock().unwrap().send(payload);
        });
        let request = SubscribeRequest {
            channel: "System",
            query: None,
            bookmark: None,
            flags: SubscribeFlags::new(SubscribeOrigin::ToFutureEvents),
        };
        let raw = session.api().subscribe(&request, callback).unwrap();
        let subscription = session.adopt(raw, HandleKind::Subscription);

        Self {
            renderer: Renderer::new(session.clone()),
            mock,
            session,
            deliveries,
            _subscription: subscription,
        }
    }

    fn deliver(&self, event: MockEvent) -> OwnedHandle {
        self.mock.append("System", event).unwrap();
        let raw = self.deliveries.recv_timeout(Duration::from_secs(5)).unwrap();
        self.session.adopt(winlog_core::RawHandle(raw), HandleKind::Event)
    }
}

fn service_event() -> MockEvent {
    MockEvent::new("Service Control Manager", 7036)
        .with_keywords(0x8080_0000_0000_0001)
        .with_data("param1", "Windows Update")
        .with_data("param2", "running")
}

#[test]
fn test_fill_buffer_matches_probe_exactly() {
    let fx = Fixture::new();
    let event = fx.deliver(service_event());
    let system = RenderContext::system(&fx.session).unwrap();
    fx.mock.clear_render_log();

    fx.renderer.render_values(&system, &event).unwrap();
    fx.renderer.render_xml(&event).unwrap();

    let log = fx.mock.render_log();
    assert_eq!(log.len(), 4);
    for pair in log.chunks(2) {
        assert_eq!(pair[0].buffer_len, 0);
        assert_eq!(pair[0].status, Status::INSUFFICIENT_BUFFER);
        assert_eq!(pair[1].buffer_len, pair[0].required);
        assert_eq!(pair[1].status, Status::SUCCESS);
    }
}

#[test]
fn test_system_fields_and_strings() {
    let fx = Fixture::new();
    let event = fx.deliver(service_event());
    let system = RenderContext::system(&fx.session).unwrap();

    let decoded = fx.renderer.render_system(&system, &event).unwrap();
    assert!(decoded.errors.is_empty());
    let fields = decoded.fields;
    assert_eq!(fields.event_id, Some(7036));
    assert_eq!(fields.channel.as_deref(), Some("System"));
    assert_eq!(fields.record_id, Some(1));
    assert_eq!(fields.computer.as_deref(), Some("mock-host"));

    let user = RenderContext::user(&fx.session).unwrap();
    let strings = fx.renderer.render_all_as_strings(&user, &event).unwrap();
    assert_eq!(strings, vec!["Windows Update".to_string(), "running".to_string()]);

    let all = fx.renderer.render_all_as_strings(&system, &event).unwrap();
    assert_eq!(all.len(), 18);
    assert_eq!(all[0], "Service Control Manager");
    assert_eq!(all[3], "");
}

#[test]
fn test_value_path_context() {
    let fx = Fixture::new();
    let event = fx.deliver(service_event());
    let ctx = RenderContext::values(
        &fx.session,
        &["Event/System/EventRecordID", "Event/EventData/Data[@Name='param2']"],
    )
    .unwrap();

    let values = fx.renderer.render_values(&ctx, &event)
        .unwrap()
        .to_values()
        .into_result()
        .unwrap();
    assert_eq!(
        values,
        vec![VariantValue::UInt64(1), VariantValue::String("running".into())]
    );
}

#[test]
fn test_empty_user_data_renders_empty_set() {
    let fx = Fixture::new();
    let event = fx.deliver(MockEvent::new("Service Control Manager", 7040));
    let user = RenderContext::user(&fx.session).unwrap();

    let set = fx.renderer.render_values(&user, &event).unwrap();
    assert!(set.is_empty());
}

#[test]
fn test_message_parts() {
    let fx = Fixture::new();
    let cache = PublisherCache::new(fx.session.clone());
    let event = fx.deliver(service_event());
    let publisher = cache.resolve("Service Control Manager").unwrap();

    let message = fx
        .renderer
        .format_message(Some(&publisher), &event, FormatMessageFlags::Event)
        .unwrap();
    assert_eq!(message, "The Windows Update service entered the running state.");

    let level = fx
        .renderer
        .format_message(Some(&publisher), &event, FormatMessageFlags::Level)
        .unwrap();
    assert_eq!(level, "Information");

    let provider = fx
        .renderer
        .format_message(Some(&publisher), &event, FormatMessageFlags::Provider)
        .unwrap();
    assert_eq!(provider, "Service Control Manager Eventlog Provider");

    let keywords = fx.renderer.format_keywords(Some(&publisher), &event).unwrap();
    assert_eq!(keywords, vec!["Classic".to_string(), "Service".to_string()]);

    let xml = fx
        .renderer
        .format_message(Some(&publisher), &event, FormatMessageFlags::Xml)
        .unwrap();
    assert!(xml.contains("<RenderingInfo"));
    assert!(xml.contains("<Level>Information</Level>"));
}

#[test]
fn test_missing_message_is_render_failure() {
    let fx = Fixture::new();
    let event = fx.deliver(MockEvent::new("Unregistered", 1));
    let err = fx
        .renderer
        .format_message(None, &event, FormatMessageFlags::Event)
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::EVT_MESSAGE_NOT_FOUND));
}

#[test]
fn test_injected_size_anomalies() {
    let fx = Fixture::new();
    let event = fx.deliver(service_event());

    fx.mock.inject_fault(MockFault::ZeroSizeProbe);
    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::UnexpectedSize { reported: 0, .. })
    ));

    fx.mock.inject_fault(MockFault::ProbeSucceeds(40));
    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::UnexpectedSize { reported: 40, .. })
    ));

    fx.mock.inject_fault(MockFault::ProbeStatus(Status::INVALID_PARAMETER));
    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::RenderFailure {
            status: Status::INVALID_PARAMETER,
            ..
        })
    ));

    fx.mock.inject_fault(MockFault::FillStatus(Status::NOT_ENOUGH_MEMORY));
    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::OutOfMemory { .. })
    ));

    fx.mock.inject_fault(MockFault::FillStatus(Status::INVALID_HANDLE));
    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::RenderFailure { .. })
    ));

    fx.mock.inject_fault(MockFault::GrowOnFill(8));
    fx.mock.clear_render_log();
    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::RenderFailure {
            status: Status::INSUFFICIENT_BUFFER,
            ..
        })
    ));
    assert_eq!(fx.mock.render_log().len(), 2);

    // Faults are one-shot; the next render is clean.
    assert!(fx.renderer.render_xml(&event).unwrap().starts_with("<Event"));
}

#[test]
fn test_closed_event_never_reaches_native_layer() {
    let fx = Fixture::new();
    let event = fx.deliver(service_event());
    event.close().unwrap();
    fx.mock.clear_render_log();

    assert!(matches!(
        fx.renderer.render_xml(&event),
        Err(RenderError::Handle(HandleError::AlreadyClosed { .. }))
    ));
    assert!(fx.mock.render_log().is_empty());
}

#[test]
fn test_bookmark_render_rejects_event_handle() {
    let fx = Fixture::new();
    let event = fx.deliver(service_event());
    assert!(matches!(
        fx.renderer.render_bookmark(&event),
        Err(RenderError::Handle(HandleError::WrongKind { .. }))
    ));
}
