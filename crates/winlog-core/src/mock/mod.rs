//! In-memory event log backend for testing
//!
//! [`MockEventLog`] implements [`EventLogApi`] without any operating system
//! support. Channels hold appended records, subscriptions receive
//! notifications on a dedicated dispatcher thread (never the caller's), and
//! render calls follow the native sizing protocol exactly, including the
//! anomalies tests need to provoke through [`MockFault`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use winlog_core::{EventLogSession, MockEvent, MockEventLog};
//!
//! let log = Arc::new(MockEventLog::new());
//! log.add_channel("Application");
//! let session = EventLogSession::new(log.clone());
//!
//! // subscribe through the session, then:
//! log.append("Application", MockEvent::new("Service Control Manager", 7036));
//! ```

mod event;
mod query;

pub use event::{MockEvent, MockPublisher};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use self::event::{MockRecord, RenderingInfo, ValuePath, standard_keywords, standard_level, standard_opcode};
use self::query::QueryFilter;
use crate::api::{EventLogApi, FillReport, NotificationCallback, SubscribeRequest};
use crate::bookmark_xml::BookmarkDocument;
use crate::error::Status;
use crate::flags::{FormatMessageFlags, NotifyAction, RenderContextFlags, RenderFlags, SubscribeOrigin};
use crate::handle::{HandleKind, RawHandle};
use crate::time::FileTime;
use crate::variant::{VariantValue, layout};

/// Smallest channel size the simulated log accepts, and its granularity
pub const MIN_CHANNEL_SIZE: u64 = 64 * 1024;

/// A deviation from the normal sizing protocol, consumed by the next sized call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// The size probe fails with this status
    ProbeStatus(Status),
    /// The size probe signals insufficient buffer but reports zero
    ZeroSizeProbe,
    /// The size probe succeeds without a buffer, reporting this many units used
    ProbeSucceeds(usize),
    /// The fill call fails with this status
    FillStatus(Status),
    /// The fill call asks for this many more units than the probe reported
    GrowOnFill(usize),
}

impl MockFault {
    fn applies_to_probe(self) -> bool {
        matches!(self, Self::ProbeStatus(_) | Self::ZeroSizeProbe | Self::ProbeSucceeds(_))
    }
}

/// One sized call as observed by the simulated backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderCall {
    pub op: &'static str,
    pub buffer_len: usize,
    pub required: usize,
    pub status: Status,
}

enum MockObject {
    Event(Arc<MockRecord>),
    Bookmark(BookmarkDocument),
    Subscription,
    RenderContext(ContextSpec),
    Publisher(Arc<MockPublisher>),
}

impl MockObject {
    fn kind(&self) -> HandleKind {
        match self {
            Self::Event(_) => HandleKind::Event,
            Self::Bookmark(_) => HandleKind::Bookmark,
            Self::Subscription => HandleKind::Subscription,
            Self::RenderContext(_) => HandleKind::RenderContext,
            Self::Publisher(_) => HandleKind::PublisherMetadata,
        }
    }
}

enum ContextSpec {
    System,
    User,
    Paths(Vec<ValuePath>),
}

struct MockChannel {
    name: String,
    records: VecDeque<Arc<MockRecord>>,
    next_record_id: u64,
    enabled: bool,
    max_size: u64,
}

struct MockSubscription {
    channel: String,
    filter: QueryFilter,
    callback: NotificationCallback,
    active: bool,
}

enum Dispatch {
    Notify {
        subscription: RawHandle,
        action: u32,
        payload: u64,
    },
    Barrier(Sender<()>),
}

struct MockState {
    next_handle: u64,
    objects: HashMap<RawHandle, MockObject>,
    channels: BTreeMap<String, MockChannel>,
    subscriptions: BTreeMap<RawHandle, MockSubscription>,
    publishers: HashMap<String, Arc<MockPublisher>>,
    privileged: bool,
    faults: VecDeque<MockFault>,
    render_log: Vec<RenderCall>,
}

enum Sized {
    Write,
    Return(FillReport),
}

impl MockState {
    fn alloc(&mut self, object: MockObject) -> RawHandle {
        self.next_handle += 1;
        let raw = RawHandle(self.next_handle * 4);
        self.objects.insert(raw, object);
        raw
    }

    fn channel_mut(&mut self, name: &str) -> Result<&mut MockChannel, Status> {
        self.channels
            .get_mut(&name.to_ascii_lowercase())
            .ok_or(Status::EVT_CHANNEL_NOT_FOUND)
    }

    fn record(&self, raw: RawHandle) -> Result<Arc<MockRecord>, Status> {
        match self.objects.get(&raw) {
            Some(MockObject::Event(record)) => Ok(record.clone()),
            _ => Err(Status::INVALID_HANDLE),
        }
    }

    /// Queue a deliver notification for every active subscription matching `record`
    fn fan_out(&mut self, record: &Arc<MockRecord>, tx: &Sender<Dispatch>) {
        let key = record.channel.to_ascii_lowercase();
        let targets: Vec<RawHandle> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.active && sub.channel == key && sub.filter.matches(record))
            .map(|(raw, _)| *raw)
            .collect();
        for subscription in targets {
            let event = self.alloc(MockObject::Event(record.clone()));
            let _ = tx.send(Dispatch::Notify {
                subscription,
                action: NotifyAction::Deliver as u32,
                payload: event.0,
            });
        }
    }

    /// Decide the outcome of a sized call before anything is written
    fn settle(&mut self, op: &'static str, buffer_len: usize, required: usize, count: u32) -> Sized {
        let probing = buffer_len == 0;
        let fault = match self.faults.front() {
            Some(f) if f.applies_to_probe() == probing => self.faults.pop_front(),
            _ => None,
        };
        let outcome = match fault {
            Some(MockFault::ProbeStatus(status)) | Some(MockFault::FillStatus(status)) => {
                Sized::Return(FillReport::failed(status))
            }
            Some(MockFault::ZeroSizeProbe) => Sized::Return(FillReport::needs(0)),
            Some(MockFault::ProbeSucceeds(used)) => Sized::Return(FillReport::filled(used, count)),
            Some(MockFault::GrowOnFill(extra)) => Sized::Return(FillReport::needs(required + extra)),
            None if buffer_len < required => Sized::Return(FillReport::needs(required)),
            None => Sized::Write,
        };
        let status = match &outcome {
            Sized::Write => Status::SUCCESS,
            Sized::Return(report) => report.status,
        };
        self.render_log.push(RenderCall {
            op,
            buffer_len,
            required,
            status,
        });
        outcome
    }
}

/// Simulated native event log
pub struct MockEventLog {
    state: Arc<Mutex<MockState>>,
    dispatch_tx: Sender<Dispatch>,
}

impl MockEventLog {
    pub fn new() -> Self {
        let (dispatch_tx, dispatch_rx) = channel::unbounded();
        let state = Arc::new(Mutex::new(MockState {
            next_handle: 0,
            objects: HashMap::new(),
            channels: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            publishers: HashMap::new(),
            privileged: true,
            faults: VecDeque::new(),
            render_log: Vec::new(),
        }));

        let dispatcher_state = state.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("mock-evt-dispatch".into())
            .spawn(move || dispatch_loop(dispatcher_state, dispatch_rx))
        {
            warn!(error = %e, "mock dispatcher thread failed to start");
        }

        Self { state, dispatch_tx }
    }

    /// Create a log with the given channels already registered
    pub fn with_channels(channels: &[&str]) -> Self {
        let log = Self::new();
        for channel in channels {
            log.add_channel(channel);
        }
        log
    }

    pub fn add_channel(&self, name: &str) {
        let mut state = self.state.lock();
        state
            .channels
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| MockChannel {
                name: name.to_string(),
                records: VecDeque::new(),
                next_record_id: 1,
                enabled: true,
                max_size: 20 * 1024 * 1024,
            });
    }

    pub fn add_publisher(&self, publisher: MockPublisher) {
        let key = publisher.name.to_ascii_lowercase();
        self.state.lock().publishers.insert(key, Arc::new(publisher));
    }

    /// Write an event; returns its record id, or `None` if the channel is
    /// unknown or disabled
    pub fn append(&self, channel: &str, event: MockEvent) -> Option<u64> {
        let mut state = self.state.lock();
        let target = state.channel_mut(channel).ok()?;
        if !target.enabled {
            return None;
        }
        let record_id = target.next_record_id;
        target.next_record_id += 1;
        let record = Arc::new(MockRecord {
            channel: target.name.clone(),
            record_id,
            time_created: event
                .time_created
                .unwrap_or_else(|| FileTime::from_datetime(Utc::now())),
            event,
        });
        target.records.push_back(record.clone());
        state.fan_out(&record, &self.dispatch_tx);
        trace!(channel, record_id, "appended mock record");
        Some(record_id)
    }

    /// Drop every record older than `record_id`, as log rotation would
    pub fn truncate_before(&self, channel: &str, record_id: u64) -> usize {
        let mut state = self.state.lock();
        let Ok(target) = state.channel_mut(channel) else {
            return 0;
        };
        let before = target.records.len();
        target.records.retain(|r| r.record_id >= record_id);
        before - target.records.len()
    }

    /// Drop every record in the channel; record ids keep increasing
    pub fn clear(&self, channel: &str) -> usize {
        let mut state = self.state.lock();
        match state.channel_mut(channel) {
            Ok(target) => {
                let removed = target.records.len();
                target.records.clear();
                removed
            }
            Err(_) => 0,
        }
    }

    pub fn record_ids(&self, channel: &str) -> Vec<u64> {
        let mut state = self.state.lock();
        state
            .channel_mut(channel)
            .map(|c| c.records.iter().map(|r| r.record_id).collect())
            .unwrap_or_default()
    }

    /// Send an error notification carrying `status` to the channel's subscribers
    pub fn inject_error(&self, channel: &str, status: Status) {
        self.inject_action(channel, NotifyAction::Error as u32, status.0 as u64);
    }

    /// Send an arbitrary raw notification to the channel's subscribers
    pub fn inject_action(&self, channel: &str, action: u32, payload: u64) {
        let state = self.state.lock();
        let key = channel.to_ascii_lowercase();
        for (raw, sub) in &state.subscriptions {
            if sub.active && sub.channel == key {
                let _ = self.dispatch_tx.send(Dispatch::Notify {
                    subscription: *raw,
                    action,
                    payload,
                });
            }
        }
    }

    /// Queue a sizing anomaly for the next matching render or format call
    pub fn inject_fault(&self, fault: MockFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Every sized render or format call made so far
    pub fn render_log(&self) -> Vec<RenderCall> {
        self.state.lock().render_log.clone()
    }

    pub fn clear_render_log(&self) {
        self.state.lock().render_log.clear();
    }

    /// Grant or revoke the privilege channel administration needs
    pub fn set_privileged(&self, privileged: bool) {
        self.state.lock().privileged = privileged;
    }

    pub fn channel_enabled(&self, channel: &str) -> Option<bool> {
        self.state.lock().channel_mut(channel).ok().map(|c| c.enabled)
    }

    pub fn channel_max_size(&self, channel: &str) -> Option<u64> {
        self.state.lock().channel_mut(channel).ok().map(|c| c.max_size)
    }

    /// Whether the backend still holds an object for `raw`
    pub fn is_open(&self, raw: RawHandle) -> bool {
        self.state.lock().objects.contains_key(&raw)
    }

    /// Number of open native objects of `kind`
    pub fn open_count(&self, kind: HandleKind) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .count()
    }

    /// Number of subscriptions still receiving notifications
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.active)
            .count()
    }

    /// Block until every notification queued so far has been dispatched
    pub fn flush(&self) {
        let (tx, rx) = channel::bounded(1);
        if self.dispatch_tx.send(Dispatch::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    fn admin_target(&self, channel: &str) -> Result<parking_lot::MappedMutexGuard<'_, MockChannel>, Status> {
        let state = self.state.lock();
        if !state.privileged {
            return Err(Status::ACCESS_DENIED);
        }
        let key = channel.to_ascii_lowercase();
        parking_lot::MutexGuard::try_map(state, |s| s.channels.get_mut(&key))
            .map_err(|_| Status::EVT_CHANNEL_NOT_FOUND)
    }

    fn format_text(
        &self,
        state: &MockState,
        publisher: Option<RawHandle>,
        event: RawHandle,
        flags: FormatMessageFlags,
    ) -> Result<Vec<u16>, Status> {
        let record = state.record(event)?;
        let publisher = match publisher {
            Some(raw) => match state.objects.get(&raw) {
                Some(MockObject::Publisher(p)) => Some(p.clone()),
                _ => return Err(Status::INVALID_HANDLE),
            },
            None => None,
        };
        let e = &record.event;
        let text = match flags {
            FormatMessageFlags::Event | FormatMessageFlags::Id => publisher
                .as_ref()
                .ok_or(Status::EVT_MESSAGE_NOT_FOUND)?
                .message(&record)?,
            FormatMessageFlags::Level => standard_level(e.level)?,
            FormatMessageFlags::Task => match &publisher {
                Some(p) => p.task(e.task)?,
                None if e.task == 0 => "None".to_string(),
                None => return Err(Status::EVT_MESSAGE_ID_NOT_FOUND),
            },
            FormatMessageFlags::Opcode => match &publisher {
                Some(p) => p.opcode(e.opcode)?,
                None => standard_opcode(e.opcode)?,
            },
            FormatMessageFlags::Keyword => {
                let names = match &publisher {
                    Some(p) => p.keyword_names(e.keywords),
                    None => standard_keywords(e.keywords),
                };
                return Ok(multi_string(&names));
            }
            FormatMessageFlags::Channel => record.channel.clone(),
            FormatMessageFlags::Provider => match &publisher {
                Some(p) => p.provider_text(),
                None => e.provider.clone(),
            },
            FormatMessageFlags::Xml => {
                let info = RenderingInfo {
                    message: publisher.as_ref().and_then(|p| p.message(&record).ok()),
                    level: standard_level(e.level).ok(),
                    task: publisher.as_ref().and_then(|p| p.task(e.task).ok()),
                    opcode: standard_opcode(e.opcode).ok(),
                    channel: Some(record.channel.clone()),
                    provider: publisher.as_ref().map(|p| p.provider_text()),
                    keywords: standard_keywords(e.keywords),
                };
                record.to_xml(Some(&info))
            }
        };
        Ok(terminated(&text))
    }
}

impl Default for MockEventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_loop(state: Arc<Mutex<MockState>>, rx: Receiver<Dispatch>) {
    while let Ok(dispatch) = rx.recv() {
        let (subscription, action, payload) = match dispatch {
            Dispatch::Notify {
                subscription,
                action,
                payload,
            } => (subscription, action, payload),
            Dispatch::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let callback = {
            let mut state = state.lock();
            match state.subscriptions.get(&subscription) {
                Some(sub) if sub.active => Some(sub.callback.clone()),
                _ => {
                    // Subscription went away while this was queued.
                    if action == NotifyAction::Deliver as u32 {
                        state.objects.remove(&RawHandle(payload));
                    }
                    None
                }
            }
        };
        if let Some(callback) = callback {
            callback(action, payload);
        }
    }
}

fn terminated(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn multi_string(items: &[String]) -> Vec<u16> {
    let mut units: Vec<u16> = items.iter().flat_map(|s| terminated(s)).collect();
    units.push(0);
    units
}

impl EventLogApi for MockEventLog {
    fn subscribe(
        &self,
        request: &SubscribeRequest<'_>,
        callback: NotificationCallback,
    ) -> Result<RawHandle, Status> {
        if request.channel.trim().is_empty() {
            return Err(Status::EVT_INVALID_CHANNEL_PATH);
        }
        let mut state = self.state.lock();
        let key = request.channel.to_ascii_lowercase();
        let filter = QueryFilter::parse(request.query)?;
        let records: Vec<Arc<MockRecord>> = state
            .channels
            .get(&key)
            .ok_or(Status::EVT_CHANNEL_NOT_FOUND)?
            .records
            .iter()
            .cloned()
            .collect();

        let replay: Vec<Arc<MockRecord>> = match request.flags.origin {
            SubscribeOrigin::ToFutureEvents => Vec::new(),
            SubscribeOrigin::StartAtOldestRecord => records,
            SubscribeOrigin::StartAfterBookmark => {
                let bookmark = request.bookmark.ok_or(Status::INVALID_PARAMETER)?;
                let position = match state.objects.get(&bookmark) {
                    Some(MockObject::Bookmark(doc)) => doc.position(request.channel),
                    _ => return Err(Status::INVALID_HANDLE),
                };
                match position {
                    Some(after) => {
                        if request.flags.strict && !records.iter().any(|r| r.record_id == after) {
                            return Err(Status::EVT_QUERY_RESULT_INVALID_POSITION);
                        }
                        records.into_iter().filter(|r| r.record_id > after).collect()
                    }
                    None => records,
                }
            }
        };

        let raw = state.alloc(MockObject::Subscription);
        state.subscriptions.insert(
            raw,
            MockSubscription {
                channel: key,
                filter: filter.clone(),
                callback,
                active: true,
            },
        );
        for record in replay.iter().filter(|r| filter.matches(r)) {
            let event = state.alloc(MockObject::Event(record.clone()));
            let _ = self.dispatch_tx.send(Dispatch::Notify {
                subscription: raw,
                action: NotifyAction::Deliver as u32,
                payload: event.0,
            });
        }
        debug!(channel = request.channel, handle = %raw, replayed = replay.len(), "mock subscription created");
        Ok(raw)
    }

    fn create_render_context(
        &self,
        value_paths: &[&str],
        flags: RenderContextFlags,
    ) -> Result<RawHandle, Status> {
        let spec = match flags {
            RenderContextFlags::System => ContextSpec::System,
            RenderContextFlags::User => ContextSpec::User,
            RenderContextFlags::Values => {
                if value_paths.is_empty() {
                    return Err(Status::INVALID_PARAMETER);
                }
                let paths = value_paths
                    .iter()
                    .map(|p| ValuePath::parse(p))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(Status::INVALID_PARAMETER)?;
                ContextSpec::Paths(paths)
            }
        };
        Ok(self.state.lock().alloc(MockObject::RenderContext(spec)))
    }

    fn render(
        &self,
        context: Option<RawHandle>,
        fragment: RawHandle,
        flags: RenderFlags,
        buffer: &mut [u8],
    ) -> FillReport {
        let mut state = self.state.lock();
        let values: Vec<VariantValue>;
        let text: Vec<u8>;
        let (required, count) = match flags {
            RenderFlags::Values => {
                let record = match state.record(fragment) {
                    Ok(record) => record,
                    Err(status) => return FillReport::failed(status),
                };
                values = match context.and_then(|c| state.objects.get(&c)) {
                    Some(MockObject::RenderContext(ContextSpec::System)) => record.system_values(),
                    Some(MockObject::RenderContext(ContextSpec::User)) => record.user_values(),
                    Some(MockObject::RenderContext(ContextSpec::Paths(paths))) => {
                        paths.iter().map(|p| p.select(&record)).collect()
                    }
                    _ => return FillReport::failed(Status::INVALID_PARAMETER),
                };
                text = Vec::new();
                (layout::encoded_len(&values), values.len() as u32)
            }
            RenderFlags::Xml => {
                let record = match state.record(fragment) {
                    Ok(record) => record,
                    Err(status) => return FillReport::failed(status),
                };
                values = Vec::new();
                text = wide_bytes(&record.to_xml(None));
                (text.len(), 0)
            }
            RenderFlags::Bookmark => {
                let xml = match state.objects.get(&fragment) {
                    Some(MockObject::Bookmark(doc)) => doc.to_xml(),
                    _ => return FillReport::failed(Status::INVALID_HANDLE),
                };
                values = Vec::new();
                text = wide_bytes(&xml);
                (text.len(), 0)
            }
        };

        match state.settle("render", buffer.len(), required, count) {
            Sized::Return(report) => report,
            Sized::Write => {
                let used = if flags == RenderFlags::Values {
                    layout::encode_into(&values, buffer).unwrap_or(0)
                } else {
                    buffer[..text.len()].copy_from_slice(&text);
                    text.len()
                };
                FillReport::filled(used, count)
            }
        }
    }

    fn format_message(
        &self,
        publisher: Option<RawHandle>,
        event: RawHandle,
        flags: FormatMessageFlags,
        buffer: &mut [u16],
    ) -> FillReport {
        let mut state = self.state.lock();
        let units = match self.format_text(&state, publisher, event, flags) {
            Ok(units) => units,
            Err(status) => return FillReport::failed(status),
        };
        match state.settle("format", buffer.len(), units.len(), 0) {
            Sized::Return(report) => report,
            Sized::Write => {
                buffer[..units.len()].copy_from_slice(&units);
                FillReport::filled(units.len(), 0)
            }
        }
    }

    fn open_publisher_metadata(&self, provider: &str) -> Result<RawHandle, Status> {
        let mut state = self.state.lock();
        let publisher = state
            .publishers
            .get(&provider.to_ascii_lowercase())
            .cloned()
            .ok_or(Status::EVT_PUBLISHER_METADATA_NOT_FOUND)?;
        Ok(state.alloc(MockObject::Publisher(publisher)))
    }

    fn create_bookmark(&self, xml: Option<&str>) -> Result<RawHandle, Status> {
        let doc = match xml {
            Some(xml) => BookmarkDocument::parse(xml).map_err(|_| Status::XML_PARSE_ERROR)?,
            None => BookmarkDocument::new(),
        };
        Ok(self.state.lock().alloc(MockObject::Bookmark(doc)))
    }

    fn update_bookmark(&self, bookmark: RawHandle, event: RawHandle) -> Result<(), Status> {
        let mut state = self.state.lock();
        let record = state.record(event)?;
        match state.objects.get_mut(&bookmark) {
            Some(MockObject::Bookmark(doc)) => {
                doc.set_position(&record.channel, record.record_id);
                Ok(())
            }
            _ => Err(Status::INVALID_HANDLE),
        }
    }

    fn cancel(&self, handle: RawHandle) -> Result<(), Status> {
        let mut state = self.state.lock();
        if !state.objects.contains_key(&handle) {
            return Err(Status::INVALID_HANDLE);
        }
        if let Some(sub) = state.subscriptions.get_mut(&handle) {
            sub.active = false;
        }
        Ok(())
    }

    fn close(&self, handle: RawHandle) -> Result<(), Status> {
        let removed = {
            let mut state = self.state.lock();
            state
                .objects
                .remove(&handle)
                .ok_or(Status::INVALID_HANDLE)?;
            state.subscriptions.remove(&handle)
        };
        // Drop the callback outside the lock; it may own the last session clone.
        drop(removed);
        Ok(())
    }

    fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<(), Status> {
        let mut target = self.admin_target(channel)?;
        target.enabled = enabled;
        Ok(())
    }

    fn set_channel_max_size(&self, channel: &str, max_bytes: u64) -> Result<(), Status> {
        if max_bytes < MIN_CHANNEL_SIZE || max_bytes % MIN_CHANNEL_SIZE != 0 {
            return Err(Status::INVALID_PARAMETER);
        }
        let mut target = self.admin_target(channel)?;
        target.max_size = max_bytes;
        Ok(())
    }
}

fn wide_bytes(text: &str) -> Vec<u8> {
    terminated(text).into_iter().flat_map(u16::to_ne_bytes).collect()
}
