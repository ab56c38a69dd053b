//! The capture duty cycle.
//!
//! One wake runs a linear sequence with early-exit aborts:
//!
//! ```text
//! Initialize → ReportHealth → NegotiateConfig → Capture
//!     → PublishHeader → AwaitHeaderAck → PublishImage → Done
//! ```
//!
//! Every abort still reaches a terminal sleep decision — the device is
//! never left awake and idle. Protocol timeouts and publish failures
//! end the cycle and retry next period; bring-up failures escalate
//! into the restart ladder. A cycle stopped from outside (button
//! press) publishes nothing: the stopper owns the next decision.
//!
//! Rendezvous timeouts are budgeted from what is left of the capture
//! period: `period − uptime − platform overhead`, floored at zero.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::app::ports::{ClockPort, ImagingPort, IndicatorPort, NetworkPort, SensorPort, StoragePort};
use crate::app::CancelToken;
use crate::config::{CaptureSchedule, ScheduleOutcome};
use crate::drivers::indicator::Pattern;
use crate::error::Error;
use crate::events::{Event, EventBroker};
use crate::link::{HandshakeClient, LinkError, Transport};
use crate::power;

const CAPTURE_TASK_PRIORITY: u8 = 5;
const CAPTURE_TASK_STACK_KB: usize = 8;

/// Settle delay between config promotion and re-resolution, giving the
/// transport callback time to finish its bookkeeping.
const CONFIG_SETTLE_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything one wake cycle consumes. Built in `main` (or a test)
/// and moved into the capture task.
pub struct CaptureContext {
    pub network: Box<dyn NetworkPort>,
    pub imaging: Box<dyn ImagingPort>,
    pub sensors: Box<dyn SensorPort>,
    pub clock: Arc<dyn ClockPort>,
    pub indicator: Arc<dyn IndicatorPort>,
    pub storage: Arc<Mutex<Box<dyn StoragePort>>>,
    pub schedule: Arc<Mutex<CaptureSchedule>>,
    pub link: Arc<HandshakeClient>,
    /// Deferred transport bring-up: the MQTT session can only start
    /// once the station is associated, so `Initialize` runs this.
    pub connect_transport:
        Option<Box<dyn FnOnce() -> Result<Arc<dyn Transport>, LinkError> + Send>>,
}

/// How a cycle concluded.
#[derive(Debug)]
pub enum CycleEnd {
    /// Completed or aborted; sleep one period and retry.
    NextPeriod,
    /// A sleep window is active; sleep until its end.
    NextWindow,
    /// Stopped from another task mid-cycle.
    Cancelled,
    /// Bring-up failure; escalate through the restart ladder.
    Fault(Error),
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct CaptureApp {
    broker: Arc<EventBroker>,
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureApp {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self {
            broker,
            cancel: CancelToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the capture task for this wake cycle.
    pub fn start(&self, ctx: CaptureContext) {
        let broker = self.broker.clone();
        let cancel = self.cancel.clone();

        let handle = crate::drivers::task_spawn::spawn(
            "capture\0",
            CAPTURE_TASK_PRIORITY,
            CAPTURE_TASK_STACK_KB,
            move || {
                let mut ctx = ctx;
                match Self::run_cycle(&mut ctx, &cancel) {
                    CycleEnd::NextPeriod => {
                        info!("Capture task finished");
                        broker.publish(Event::SleepUntilNextPeriod);
                    }
                    CycleEnd::NextWindow => {
                        broker.publish(Event::SleepUntilNextWindow);
                    }
                    CycleEnd::Cancelled => {
                        info!("Capture task stopped from outside");
                    }
                    CycleEnd::Fault(e) => {
                        error!("Capture cycle failed: {e}");
                        ctx.indicator.set_pattern(Pattern::ErrorBlink);
                        let action = {
                            let mut storage =
                                ctx.storage.lock().unwrap_or_else(|p| p.into_inner());
                            power::escalate(storage.as_mut())
                        };
                        power::apply_escalation(action);
                    }
                }
            },
        );
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Cancel the running cycle and wait for the task to observe it.
    /// Idempotent; a second call is a no-op.
    pub fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Capture task panicked before stop");
            }
            info!("Stopped capture task");
        }
    }

    // -----------------------------------------------------------------------
    // Cycle steps (pure against the ports; fully host-testable)
    // -----------------------------------------------------------------------

    /// Run one full wake cycle. Public for integration tests, which
    /// drive it directly instead of through the spawned task.
    pub fn run_cycle(ctx: &mut CaptureContext, cancel: &CancelToken) -> CycleEnd {
        match Self::initialize(ctx) {
            Ok(ScheduleOutcome::Sleeping) => return CycleEnd::NextWindow,
            Ok(ScheduleOutcome::Active) => {}
            Err(e) => return CycleEnd::Fault(e),
        }
        if cancel.is_cancelled() {
            return CycleEnd::Cancelled;
        }

        match Self::negotiate_config(ctx, cancel) {
            Ok(ScheduleOutcome::Sleeping) => return CycleEnd::NextWindow,
            Ok(ScheduleOutcome::Active) => {}
            Err(end) => return end,
        }
        if cancel.is_cancelled() {
            return CycleEnd::Cancelled;
        }

        Self::capture_and_send(ctx, cancel)
    }

    /// Bring up network, time, transport, sensors and the persisted
    /// schedule, then resolve the active window.
    fn initialize(ctx: &mut CaptureContext) -> Result<ScheduleOutcome, Error> {
        ctx.network.connect()?;
        ctx.network.sync_time()?;

        if let Some(connect) = ctx.connect_transport.take() {
            let transport = connect()?;
            ctx.link.attach_transport(transport);
        }

        ctx.sensors.init()?;

        {
            let storage = ctx.storage.lock().unwrap_or_else(|p| p.into_inner());
            let mut schedule = ctx.schedule.lock().unwrap_or_else(|p| p.into_inner());
            schedule.load_from_storage(&**storage);
        }

        ctx.indicator.set_pattern(Pattern::ConnectedBlink);

        // Wake banner on the log topic; remote logging is best-effort.
        let banner = format!("wake {} (uptime {} ms)", ctx.clock.utc_timestamp(), ctx.clock.uptime_ms());
        let log_topic = ctx.link.topics().log.clone();
        if ctx.link.publish(&log_topic, banner.as_bytes()).is_err() {
            warn!("Remote log publish failed");
        }

        let now = ctx
            .clock
            .time_of_day()
            .ok_or(Error::Init("wall clock not synced"))?;
        let outcome = ctx
            .schedule
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .set_active_window(now);
        Ok(outcome)
    }

    /// Publish the health report and wait for the configuration
    /// answer; on a promoted document, re-resolve the active window.
    fn negotiate_config(
        ctx: &mut CaptureContext,
        cancel: &CancelToken,
    ) -> Result<ScheduleOutcome, CycleEnd> {
        if let Err(e) = Self::send_health_report(ctx) {
            // An unreachable broker means no ack will ever arrive
            // either; retry next wake.
            error!("Failed to publish health report: {e}");
            return Err(CycleEnd::NextPeriod);
        }

        if !ctx
            .link
            .wait_for_config(Self::remaining_budget_ms(ctx), cancel)
        {
            if cancel.is_cancelled() {
                return Err(CycleEnd::Cancelled);
            }
            error!("No config or config-ok received in budget");
            return Err(CycleEnd::NextPeriod);
        }

        if ctx.link.new_config_received() {
            std::thread::sleep(Duration::from_millis(CONFIG_SETTLE_MS));
            let now = ctx
                .clock
                .time_of_day()
                .ok_or(CycleEnd::Fault(Error::Init("wall clock not synced")))?;
            return Ok(ctx
                .schedule
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .set_active_window(now));
        }
        Ok(ScheduleOutcome::Active)
    }

    /// Capture, announce, await the ack, transmit.
    fn capture_and_send(ctx: &mut CaptureContext, cancel: &CancelToken) -> CycleEnd {
        if let Err(e) = ctx.imaging.start() {
            return CycleEnd::Fault(e.into());
        }

        // Flush one stale frame: the driver may still hold the buffer
        // queued at the previous acquisition request.
        if let Err(e) = ctx.imaging.capture() {
            return CycleEnd::Fault(e.into());
        }
        ctx.imaging.release_frame();
        if let Err(e) = ctx.imaging.capture() {
            return CycleEnd::Fault(e.into());
        }

        let timestamp = ctx.clock.utc_timestamp();

        if let Err(e) = Self::send_image_header(ctx, &timestamp) {
            error!("Failed to publish image header: {e}");
            return CycleEnd::NextPeriod;
        }

        if !ctx
            .link
            .wait_for_header_ack(&timestamp, Self::remaining_budget_ms(ctx), cancel)
        {
            if cancel.is_cancelled() {
                return CycleEnd::Cancelled;
            }
            // Header went out but nobody is prepared to receive the
            // payload; withhold it.
            error!("No matching ack timestamp, skipping image publish");
            return CycleEnd::NextPeriod;
        }

        let image_topic = ctx.link.topics().image.clone();
        let publish_result = match ctx.imaging.frame() {
            Ok(frame) => ctx.link.publish(&image_topic, frame.bytes),
            Err(e) => return CycleEnd::Fault(e.into()),
        };
        ctx.imaging.release_frame();

        match publish_result {
            Ok(()) => {
                info!("Image published");
                CycleEnd::NextPeriod
            }
            Err(e) => {
                error!("Failed to publish image: {e}");
                CycleEnd::NextPeriod
            }
        }
    }

    /// `{timestamp, configurationId, period, <sensor readings>}` to
    /// the health topic.
    fn send_health_report(ctx: &mut CaptureContext) -> Result<(), LinkError> {
        let mut doc = Map::new();
        doc.insert(
            "timestamp".into(),
            Value::String(ctx.clock.utc_timestamp()),
        );
        {
            let schedule = ctx.schedule.lock().unwrap_or_else(|p| p.into_inner());
            doc.insert(
                "configurationId".into(),
                Value::String(schedule.uuid().to_string()),
            );
            doc.insert("period".into(), Value::from(schedule.period()));
        }
        ctx.sensors.read_all(&mut doc);

        let topic = ctx.link.topics().health_report.clone();
        Self::send_json(ctx, &topic, &Value::Object(doc))
    }

    /// `{timestamp, size, mode, width, height}` to the image topic.
    fn send_image_header(ctx: &mut CaptureContext, timestamp: &str) -> Result<(), LinkError> {
        let frame = ctx
            .imaging
            .frame()
            .map_err(|_| LinkError::PublishFailed)?;
        let mut doc = Map::new();
        doc.insert("timestamp".into(), Value::String(timestamp.to_string()));
        doc.insert("size".into(), Value::from(frame.bytes.len()));
        doc.insert("mode".into(), Value::String(frame.mode.to_string()));
        doc.insert("width".into(), Value::from(frame.width));
        doc.insert("height".into(), Value::from(frame.height));

        let topic = ctx.link.topics().image.clone();
        Self::send_json(ctx, &topic, &Value::Object(doc))
    }

    fn send_json(ctx: &CaptureContext, topic: &str, doc: &Value) -> Result<(), LinkError> {
        let payload = serde_json::to_vec(doc).map_err(|_| LinkError::PublishFailed)?;
        ctx.link.publish(topic, &payload)
    }

    /// Milliseconds left in this cycle's budget:
    /// `period − uptime − overhead`, floored at zero.
    fn remaining_budget_ms(ctx: &CaptureContext) -> u64 {
        let period_ms = ctx
            .schedule
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .period()
            .saturating_mul(1000);
        let elapsed_ms = ctx.clock.uptime_ms() as i64;
        let budget = period_ms - elapsed_ms - power::OVERHEAD_MS as i64;
        let budget = budget.max(0) as u64;
        info!("Max wait time: {budget} ms");
        budget
    }
}
