//! Admin surface and the staged shutdown sequence.
//!
//! The host process wires these into whatever admin channel it speaks
//! (DBus, a socket, a signal handler; not this crate's concern). The
//! surface is deliberately minimal: a halt latch, the grace controls, and
//! two purge hooks. There are no cache knobs here; cache tuning is
//! startup-config only.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

/// Idempotent shutdown latch: any number of callers may
/// [`halt`](HaltLatch::halt); the admin waiter runs teardown once.
pub struct HaltLatch {
    m: Mutex<bool>,
    cv: Condvar,
}

impl Default for HaltLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HaltLatch {
    /// A fresh, unhalted latch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            m: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Request shutdown. Safe to call from any thread, any number of
    /// times.
    pub fn halt(&self) {
        let mut halted = self.m.lock();
        if !*halted {
            *halted = true;
            self.cv.notify_all();
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn halted(&self) -> bool {
        *self.m.lock()
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        let mut halted = self.m.lock();
        while !*halted {
            self.cv.wait(&mut halted);
        }
    }
}

/// A parsed `start_grace` request.
///
/// The wire form is `"event:ip"`; a bare string with no colon is an
/// ip-takeover with the default event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraceStart {
    /// Another node's address is being taken over.
    TakeIp {
        /// The address moving to this node.
        ip: String,
    },
    /// Recovery on behalf of a failed node id.
    TakeNodeid {
        /// The failed node.
        nodeid: i64,
    },
    /// An event code this layer does not interpret.
    Other {
        /// Raw event code.
        event: i32,
        /// Accompanying address, if any.
        ip: String,
    },
}

/// Event code for ip takeover.
pub const EVENT_TAKE_IP: i32 = 2;
/// Event code for nodeid takeover.
pub const EVENT_TAKE_NODEID: i32 = 3;

/// A `start_grace` argument that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad grace argument {0:?}; expected \"event:ip\"")]
pub struct BadGraceArg(pub String);

impl FromStr for GraceStart {
    type Err = BadGraceArg;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((event, rest)) = s.split_once(':') else {
            // No event specified: plain ip takeover.
            return Ok(Self::TakeIp { ip: s.to_owned() });
        };
        let event: i32 = event.parse().map_err(|_| BadGraceArg(s.to_owned()))?;
        match event {
            EVENT_TAKE_IP => Ok(Self::TakeIp {
                ip: rest.to_owned(),
            }),
            EVENT_TAKE_NODEID => {
                let nodeid = rest.parse().map_err(|_| BadGraceArg(s.to_owned()))?;
                Ok(Self::TakeNodeid { nodeid })
            }
            event => Ok(Self::Other {
                event,
                ip: rest.to_owned(),
            }),
        }
    }
}

/// Grace-period state the admin channel reads and starts.
#[derive(Default)]
pub struct GraceControl {
    in_grace: AtomicBool,
}

impl GraceControl {
    /// Whether a grace period is in effect.
    #[must_use]
    pub fn get_grace(&self) -> bool {
        self.in_grace.load(Ordering::Acquire)
    }

    /// Enter a grace period for `event`.
    pub fn start_grace(&self, event: &GraceStart) {
        info!(?event, "starting grace period");
        self.in_grace.store(true, Ordering::Release);
    }

    /// Leave the grace period (driven by the host's recovery logic).
    pub fn finish_grace(&self) {
        self.in_grace.store(false, Ordering::Release);
    }
}

/// Why a shutdown stage did not complete cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StageError {
    /// The stage's bounded wait expired; threads were cancelled.
    #[error("stage timed out")]
    Timeout,
    /// The stage reported a failure code.
    #[error("stage failed with code {0}")]
    Failed(i32),
}

/// The host-supplied teardown surface, one method per stage, called in
/// order by [`run_shutdown`]. Methods that cannot fail return nothing;
/// the rest report [`StageError`], which flips the sequence to
/// disorderly but never aborts it.
pub trait ShutdownStages {
    /// Stage 1: stop accepting new requests.
    fn stop_frontends(&mut self);
    /// Stage 2: stop the delayed executor.
    fn stop_delayed_executor(&mut self);
    /// Stage 3: drain asynchronous state requests.
    fn drain_state_requests(&mut self) -> Result<(), StageError>;
    /// Stage 4: stop request listeners and decoders, waiting at most
    /// `timeout`; on expiry the implementation must cancel the threads
    /// and return [`StageError::Timeout`].
    fn stop_listeners(&mut self, timeout: Duration) -> Result<(), StageError>;
    /// Stage 5: stop the worker pool.
    fn stop_workers(&mut self) -> Result<(), StageError>;
    /// Stage 6: remove every export (mass unexport; the cache drains its
    /// association lists here).
    fn remove_exports(&mut self);
    /// Stage 7, orderly: destroy the backends.
    fn destroy_backends(&mut self);
    /// Stage 7, disorderly: release backend resources with no further
    /// locking.
    fn emergency_cleanup(&mut self);
}

/// Per-stage timeouts.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    /// Bound on stage 4 (request drain / listener stop).
    pub request_drain: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            request_drain: Duration::from_secs(120),
        }
    }
}

/// How teardown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// At least one stage timed out or failed; emergency cleanup ran
    /// instead of an orderly destroy.
    pub disorderly: bool,
}

/// Run the teardown sequence once, in order, logging each stage. Stage
/// failures flip the outcome to disorderly and the sequence continues;
/// a partial teardown is still a teardown.
pub fn run_shutdown(stages: &mut dyn ShutdownStages, timeouts: &StageTimeouts) -> ShutdownOutcome {
    let mut disorderly = false;

    info!("shutdown: stopping frontends");
    stages.stop_frontends();

    info!("shutdown: stopping delayed executor");
    stages.stop_delayed_executor();

    info!("shutdown: draining state requests");
    if let Err(e) = stages.drain_state_requests() {
        error!(error = %e, "state request drain failed");
        disorderly = true;
    }

    info!("shutdown: stopping request listeners");
    match stages.stop_listeners(timeouts.request_drain) {
        Ok(()) => {}
        Err(StageError::Timeout) => {
            error!("listener stop timed out; threads cancelled");
            disorderly = true;
        }
        Err(e) => {
            error!(error = %e, "listener stop failed");
            disorderly = true;
        }
    }

    info!("shutdown: stopping worker pool");
    if let Err(e) = stages.stop_workers() {
        error!(error = %e, "worker stop failed");
        disorderly = true;
    }

    info!("shutdown: removing all exports");
    stages.remove_exports();

    if disorderly {
        // Doing anything more careful risks hanging on locks whose
        // owners were cancelled.
        warn!("shutdown was disorderly; running emergency cleanup");
        stages.emergency_cleanup();
    } else {
        info!("shutdown: destroying backends");
        stages.destroy_backends();
    }

    ShutdownOutcome { disorderly }
}

/// Spawn the admin waiter: parks on the latch, then runs the teardown
/// sequence exactly once and returns its outcome.
pub fn spawn_admin_thread<S>(
    latch: Arc<HaltLatch>,
    mut stages: S,
    timeouts: StageTimeouts,
) -> JoinHandle<ShutdownOutcome>
where
    S: ShutdownStages + Send + 'static,
{
    std::thread::Builder::new()
        .name("mdc-admin".into())
        .spawn(move || {
            latch.wait();
            run_shutdown(&mut stages, &timeouts)
        })
        .unwrap_or_else(|e| panic!("failed to spawn admin thread: {e}"))
}

/// The minimal admin surface exposed over the host's admin channel.
pub struct AdminSurface {
    latch: Arc<HaltLatch>,
    grace: GraceControl,
    purge_gids: Option<Box<dyn Fn() + Send + Sync>>,
    purge_netgroups: Option<Box<dyn Fn() + Send + Sync>>,
}

impl AdminSurface {
    /// Build a surface over a shared halt latch. The purge hooks belong
    /// to the host's id-mapping caches and are invoked verbatim.
    #[must_use]
    pub fn new(
        latch: Arc<HaltLatch>,
        purge_gids: Option<Box<dyn Fn() + Send + Sync>>,
        purge_netgroups: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            latch,
            grace: GraceControl::default(),
            purge_gids,
            purge_netgroups,
        }
    }

    /// `get_grace` method: is a grace period in effect?
    #[must_use]
    pub fn get_grace(&self) -> bool {
        self.grace.get_grace()
    }

    /// `grace` method: parse `"event:ip"` and start a grace period.
    pub fn start_grace(&self, arg: &str) -> Result<(), BadGraceArg> {
        let event = arg.parse::<GraceStart>()?;
        self.grace.start_grace(&event);
        Ok(())
    }

    /// The grace state, for hosts that drive recovery directly.
    #[must_use]
    pub fn grace(&self) -> &GraceControl {
        &self.grace
    }

    /// `shutdown` method.
    pub fn shutdown(&self) {
        info!("admin shutdown requested");
        self.latch.halt();
    }

    /// `purge_gids` method.
    pub fn purge_gids(&self) {
        if let Some(f) = &self.purge_gids {
            f();
        }
    }

    /// `purge_netgroups` method.
    pub fn purge_netgroups(&self) {
        if let Some(f) = &self.purge_netgroups {
            f();
        }
    }
}
