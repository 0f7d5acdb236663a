//! The Windows event log backend
//!
//! Thin FFI over `wevtapi` through `windows-sys`. Subscriptions use the pull
//! model: the service signals an event object when results are pending and a
//! dedicated thread per subscription drains them with `EvtNext`, handing each
//! event handle to the [`NotificationCallback`]. Handles returned by
//! `EvtNext` belong to the caller, so the consumer closes them with
//! [`EventLogApi::close`] like any other handle and no native thread is ever
//! held while a delivery waits in the queue.

use std::ffi::c_void;
use std::thread::JoinHandle;

use dashmap::DashMap;
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{BOOL, CloseHandle, GetLastError, HANDLE, WAIT_OBJECT_0};
use windows_sys::Win32::System::EventLog::{
    EVT_HANDLE, EVT_VARIANT, EVT_VARIANT_0, EvtCancel, EvtChannelConfigEnabled,
    EvtChannelLoggingConfigMaxSize, EvtClose, EvtCreateBookmark, EvtCreateRenderContext,
    EvtFormatMessage, EvtNext, EvtOpenChannelConfig, EvtOpenPublisherMetadata, EvtRender,
    EvtSaveChannelConfig, EvtSetChannelConfigProperty, EvtSubscribe, EvtUpdateBookmark,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, INFINITE, ResetEvent, SetEvent, WaitForMultipleObjects,
};

use crate::api::{EventLogApi, FillReport, NotificationCallback, SubscribeRequest};
use crate::error::Status;
use crate::flags::{FormatMessageFlags, NotifyAction, RenderContextFlags, RenderFlags};
use crate::handle::RawHandle;
use crate::variant::VariantKind;

const LOCAL_SESSION: u64 = 0;

/// Event handles requested per `EvtNext` call
const PULL_BATCH: usize = 16;

/// A kernel event object, stored as an address so it can cross threads
#[derive(Clone, Copy)]
struct Signal(usize);

impl Signal {
    /// Auto-reset is off: the pull loop resets it once the result set is dry.
    fn create() -> Result<Self, Status> {
        // SAFETY: no security attributes and no name; the handle is owned here.
        let handle = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if handle.is_null() {
            return Err(last_status());
        }
        Ok(Self(handle as usize))
    }

    fn raw(self) -> HANDLE {
        self.0 as HANDLE
    }

    fn set(self) {
        // SAFETY: the handle stays open until `close`.
        if unsafe { SetEvent(self.raw()) } == 0 {
            warn!(status = %last_status(), "signalling pull thread failed");
        }
    }

    fn close(self) {
        // SAFETY: called once, after the pull thread has exited.
        unsafe { CloseHandle(self.raw()) };
    }
}

/// The thread draining one subscription
struct PullWorker {
    /// Set by the service when results are pending
    ready: Signal,
    /// Set by `close` to end the pull loop
    stop: Signal,
    thread: JoinHandle<()>,
}

impl PullWorker {
    fn shut_down(self) {
        self.stop.set();
        if self.thread.join().is_err() {
            warn!("subscription pull thread panicked");
        }
        self.ready.close();
        self.stop.close();
    }
}

/// Wait for results, then hand every pending event to the callback.
fn pull_loop(subscription: u64, ready: Signal, stop: Signal, callback: NotificationCallback) {
    let waits = [ready.raw(), stop.raw()];
    let mut batch: [EVT_HANDLE; PULL_BATCH] = [0 as EVT_HANDLE; PULL_BATCH];
    loop {
        // SAFETY: both handles stay open until this thread is joined.
        let woke = unsafe { WaitForMultipleObjects(2, waits.as_ptr(), 0, INFINITE) };
        if woke != WAIT_OBJECT_0 {
            break;
        }
        loop {
            let mut returned = 0u32;
            // SAFETY: `batch` holds PULL_BATCH writable handles.
            let ok = unsafe {
                EvtNext(
                    subscription as _,
                    PULL_BATCH as u32,
                    batch.as_mut_ptr(),
                    0,
                    0,
                    &mut returned,
                )
            };
            if ok == 0 {
                let status = last_status();
                if status != Status::NO_MORE_ITEMS {
                    callback(NotifyAction::Error as u32, u64::from(status.0));
                }
                // SAFETY: `ready` is open.
                unsafe { ResetEvent(ready.raw()) };
                break;
            }
            for event in &batch[..returned as usize] {
                callback(NotifyAction::Deliver as u32, *event as u64);
            }
        }
    }
    debug!(subscription, "pull thread exiting");
}

/// The local machine's event log
pub struct WindowsEventLog {
    /// Subscription handle to its pull thread
    workers: DashMap<u64, PullWorker>,
}

impl WindowsEventLog {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }
}

impl Default for WindowsEventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_status() -> Status {
    // SAFETY: reads thread-local error state only.
    Status(unsafe { GetLastError() })
}

fn handle_result(handle: EVT_HANDLE) -> Result<RawHandle, Status> {
    let raw = handle as u64;
    if raw == 0 {
        return Err(last_status());
    }
    Ok(RawHandle(raw))
}

fn bool_result(ok: BOOL) -> Result<(), Status> {
    if ok == 0 {
        return Err(last_status());
    }
    Ok(())
}

fn sized_report(ok: BOOL, used: u32, property_count: u32) -> FillReport {
    if ok != 0 {
        return FillReport::filled(used as usize, property_count);
    }
    match last_status() {
        Status::INSUFFICIENT_BUFFER => FillReport::needs(used as usize),
        status => FillReport::failed(status),
    }
}

impl EventLogApi for WindowsEventLog {
    fn subscribe(
        &self,
        request: &SubscribeRequest<'_>,
        callback: NotificationCallback,
    ) -> Result<RawHandle, Status> {
        let channel = wide(request.channel);
        let query = request.query.map(wide);
        let ready = Signal::create()?;
        let stop = match Signal::create() {
            Ok(stop) => stop,
            Err(status) => {
                ready.close();
                return Err(status);
            }
        };

        // SAFETY: all string pointers outlive the call; `ready` stays open
        // until the subscription is closed.
        let handle = unsafe {
            EvtSubscribe(
                LOCAL_SESSION as _,
                ready.raw(),
                channel.as_ptr(),
                query.as_ref().map_or(std::ptr::null(), |q| q.as_ptr()),
                request.bookmark.map_or(0, |b| b.0) as _,
                std::ptr::null(),
                None,
                request.flags.bits(),
            )
        };
        let raw = match handle_result(handle) {
            Ok(raw) => raw,
            Err(status) => {
                ready.close();
                stop.close();
                return Err(status);
            }
        };

        let subscription = raw.0;
        let spawned = std::thread::Builder::new()
            .name(format!("winlog-pull-{}", request.channel))
            .spawn(move || pull_loop(subscription, ready, stop, callback));
        match spawned {
            Ok(thread) => {
                self.workers.insert(raw.0, PullWorker { ready, stop, thread });
                debug!(channel = request.channel, handle = %raw, "native subscription created");
                Ok(raw)
            }
            Err(e) => {
                warn!(channel = request.channel, error = %e, "spawning pull thread failed");
                // SAFETY: the subscription is open and nothing else refers to it yet.
                unsafe { EvtClose(raw.0 as _) };
                ready.close();
                stop.close();
                Err(Status::NOT_ENOUGH_MEMORY)
            }
        }
    }

    fn create_render_context(
        &self,
        value_paths: &[&str],
        flags: RenderContextFlags,
    ) -> Result<RawHandle, Status> {
        let owned: Vec<Vec<u16>> = value_paths.iter().map(|p| wide(p)).collect();
        let pointers: Vec<*const u16> = owned.iter().map(|p| p.as_ptr()).collect();
        // SAFETY: `pointers` and the strings they reference outlive the call.
        let handle = unsafe {
            EvtCreateRenderContext(
                pointers.len() as u32,
                if pointers.is_empty() { std::ptr::null() } else { pointers.as_ptr() },
                flags as u32,
            )
        };
        handle_result(handle)
    }

    fn render(
        &self,
        context: Option<RawHandle>,
        fragment: RawHandle,
        flags: RenderFlags,
        buffer: &mut [u8],
    ) -> FillReport {
        let Ok(size) = u32::try_from(buffer.len()) else {
            return FillReport::failed(Status::INVALID_PARAMETER);
        };
        let mut used = 0u32;
        let mut property_count = 0u32;
        let ptr = if buffer.is_empty() {
            std::ptr::null_mut()
        } else {
            buffer.as_mut_ptr() as *mut c_void
        };
        // SAFETY: `ptr` covers exactly `size` writable bytes, or is null with size 0.
        let ok = unsafe {
            EvtRender(
                context.map_or(0, |c| c.0) as _,
                fragment.0 as _,
                flags as u32,
                size,
                ptr,
                &mut used,
                &mut property_count,
            )
        };
        sized_report(ok, used, property_count)
    }

    fn format_message(
        &self,
        publisher: Option<RawHandle>,
        event: RawHandle,
        flags: FormatMessageFlags,
        buffer: &mut [u16],
    ) -> FillReport {
        let Ok(size) = u32::try_from(buffer.len()) else {
            return FillReport::failed(Status::INVALID_PARAMETER);
        };
        let mut used = 0u32;
        let ptr = if buffer.is_empty() {
            std::ptr::null_mut()
        } else {
            buffer.as_mut_ptr()
        };
        // SAFETY: `ptr` covers exactly `size` writable UTF-16 units, or is null with size 0.
        let ok = unsafe {
            EvtFormatMessage(
                publisher.map_or(0, |p| p.0) as _,
                event.0 as _,
                0,
                0,
                std::ptr::null(),
                flags as u32,
                size,
                ptr,
                &mut used,
            )
        };
        sized_report(ok, used, 0)
    }

    fn open_publisher_metadata(&self, provider: &str) -> Result<RawHandle, Status> {
        let provider = wide(provider);
        // SAFETY: `provider` outlives the call.
        let handle = unsafe {
            EvtOpenPublisherMetadata(
                LOCAL_SESSION as _,
                provider.as_ptr(),
                std::ptr::null(),
                0,
                0,
            )
        };
        handle_result(handle)
    }

    fn create_bookmark(&self, xml: Option<&str>) -> Result<RawHandle, Status> {
        let xml = xml.map(wide);
        // SAFETY: `xml` outlives the call.
        let handle = unsafe {
            EvtCreateBookmark(xml.as_ref().map_or(std::ptr::null(), |x| x.as_ptr()))
        };
        handle_result(handle)
    }

    fn update_bookmark(&self, bookmark: RawHandle, event: RawHandle) -> Result<(), Status> {
        // SAFETY: plain handle arguments.
        bool_result(unsafe { EvtUpdateBookmark(bookmark.0 as _, event.0 as _) })
    }

    fn cancel(&self, handle: RawHandle) -> Result<(), Status> {
        // SAFETY: plain handle argument.
        bool_result(unsafe { EvtCancel(handle.0 as _) })
    }

    fn close(&self, handle: RawHandle) -> Result<(), Status> {
        // A subscription's pull thread is stopped before its handle goes away;
        // joining waits out a delivery already inside the callback.
        if let Some((_, worker)) = self.workers.remove(&handle.0) {
            worker.shut_down();
        }
        // SAFETY: plain handle argument.
        bool_result(unsafe { EvtClose(handle.0 as _) })
    }

    fn set_channel_enabled(&self, channel: &str, enabled: bool) -> Result<(), Status> {
        let value = EVT_VARIANT {
            Anonymous: EVT_VARIANT_0 {
                BooleanVal: BOOL::from(enabled),
            },
            Count: 0,
            Type: VariantKind::Boolean.code(),
        };
        self.write_channel_property(channel, EvtChannelConfigEnabled as _, &value)
    }

    fn set_channel_max_size(&self, channel: &str, max_bytes: u64) -> Result<(), Status> {
        let value = EVT_VARIANT {
            Anonymous: EVT_VARIANT_0 { UInt64Val: max_bytes },
            Count: 0,
            Type: VariantKind::UInt64.code(),
        };
        self.write_channel_property(channel, EvtChannelLoggingConfigMaxSize as _, &value)
    }
}

impl WindowsEventLog {
    fn write_channel_property(
        &self,
        channel: &str,
        property: i32,
        value: &EVT_VARIANT,
    ) -> Result<(), Status> {
        let path = wide(channel);
        // SAFETY: `path` outlives the call.
        let config = handle_result(unsafe { EvtOpenChannelConfig(LOCAL_SESSION as _, path.as_ptr(), 0) })?;

        // SAFETY: `config` is open and `value` outlives the calls.
        let result = bool_result(unsafe {
            EvtSetChannelConfigProperty(config.0 as _, property as _, 0, value)
        })
        .and_then(|()| bool_result(unsafe { EvtSaveChannelConfig(config.0 as _, 0) }));

        // SAFETY: `config` is open and owned here.
        if unsafe { EvtClose(config.0 as _) } == 0 {
            warn!(channel, status = %last_status(), "closing channel config failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam::channel;

    use super::*;
    use crate::flags::{SubscribeFlags, SubscribeOrigin};

    fn request(origin: SubscribeOrigin) -> SubscribeRequest<'static> {
        SubscribeRequest {
            channel: "Application",
            query: None,
            bookmark: None,
            flags: SubscribeFlags::new(origin),
        }
    }

    #[test]
    fn test_close_stops_pull_thread() {
        let log = WindowsEventLog::new();
        let handle = log
            .subscribe(&request(SubscribeOrigin::ToFutureEvents), Arc::new(|_, _| {}))
            .unwrap();
        assert_eq!(log.workers.len(), 1);

        log.close(handle).unwrap();
        assert!(log.workers.is_empty());
    }

    #[test]
    fn test_delivered_handles_are_caller_owned() {
        let log = WindowsEventLog::new();
        let (tx, rx) = channel::unbounded();
        let handle = log
            .subscribe(
                &request(SubscribeOrigin::StartAtOldestRecord),
                Arc::new(move |action, payload| {
                    let _ = tx.send((action, payload));
                }),
            )
            .unwrap();

        let (action, payload) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(action, NotifyAction::Deliver as u32);
        // The pull thread is still running; the handle outlives the callback.
        let mut buffer = vec![0u8; 64 * 1024];
        let report = log.render(None, RawHandle(payload), RenderFlags::Xml, &mut buffer);
        assert_eq!(report.status, Status::SUCCESS);
        log.close(RawHandle(payload)).unwrap();

        log.close(handle).unwrap();
        while let Ok((_, payload)) = rx.try_recv() {
            log.close(RawHandle(payload)).unwrap();
        }
    }
}
