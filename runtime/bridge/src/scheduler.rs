//! # Suspension Scheduler
//!
//! Turns the engine's blocking `poll_oneoff` into a cooperative
//! suspension using the asyncify unwind/rewind protocol.
//!
//! ## State Machine
//!
//! ```text
//!            poll: something ready
//!          +----------------------+
//!          v                      |
//!      [Normal] --poll: nothing ready--> [Unwinding]
//!          ^                                 |
//!          |                 entry returns, stop_unwind, park
//!          |                                 v
//!   stop_rewind inside poll  <-- start_rewind, re-enter --  (host waits)
//!      [Rewinding]
//! ```
//!
//! At most one wait is outstanding. Its descriptor table location, count,
//! and computed clock deadlines are remembered so the resumed poll can
//! answer the same request without restarting its timers.

use alloc::vec;
use alloc::vec::Vec;

use crate::channel::ByteChannel;
use crate::clock::Clock;
use crate::engine::{EngineControl, SuspendState, PAGE_SIZE};
use crate::wasi::{
    self, ClockId, Errno, Event, Subclockflags, Subscription, SubscriptionKind, STDIN_FD,
};
use crate::SchedulerError;

/// Bytes reserved past the stack when carving a region.
const CARVE_SLACK: usize = 64;

// =============================================================================
// Checkpoint Region
// =============================================================================

/// Memory the engine saves its call stack into while suspended.
///
/// The first two little-endian `u32` words at `data_ptr` hold the usable
/// stack bounds and are rewritten before every unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRegion {
    pub data_ptr: u32,
    pub stack_start: u32,
    pub stack_end: u32,
}

impl CheckpointRegion {
    pub fn new(data_ptr: u32, stack_start: u32, stack_end: u32) -> Self {
        Self {
            data_ptr,
            stack_start,
            stack_end,
        }
    }

    /// Grows memory and places a `stack_size` byte region at its end.
    ///
    /// The header sits 8 bytes below an 8-aligned stack start.
    pub fn carve(ctl: &mut dyn EngineControl, stack_size: usize) -> Result<Self, SchedulerError> {
        let extra = stack_size + CARVE_SLACK;
        let pages = extra.div_ceil(PAGE_SIZE);
        let pages = u32::try_from(pages).map_err(|_| SchedulerError::NotInitialized)?;
        if ctl.grow_memory(pages).is_none() {
            log::error!("checkpoint: failed to grow memory by {} pages", pages);
            return Err(SchedulerError::NotInitialized);
        }

        let end = u32::try_from(ctl.memory().len()).map_err(|_| SchedulerError::Fault(u32::MAX))?;
        let raw_start = (end as usize)
            .checked_sub(stack_size + 8)
            .ok_or(SchedulerError::Fault(end))?;
        let data_ptr = (raw_start as u32) & !0x7;
        let region = Self::new(data_ptr, data_ptr + 8, end);
        log::debug!(
            "checkpoint: carved region data={:#x} stack={:#x}..{:#x}",
            region.data_ptr,
            region.stack_start,
            region.stack_end
        );
        Ok(region)
    }

    /// Usable stack bytes.
    pub fn stack_len(&self) -> u32 {
        self.stack_end.saturating_sub(self.stack_start)
    }

    /// Rewrites the stack bounds header.
    pub fn reset(&self, memory: &mut [u8]) -> Result<(), SchedulerError> {
        let fault = |_| SchedulerError::Fault(self.data_ptr);
        wasi::write_u32(memory, self.data_ptr, self.stack_start).map_err(fault)?;
        wasi::write_u32(memory, self.data_ptr + 4, self.stack_end).map_err(fault)?;
        Ok(())
    }
}

// =============================================================================
// Waits
// =============================================================================

/// The single outstanding wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWait {
    /// Address of the subscription table
    pub in_ptr: u32,
    /// Number of subscriptions
    pub count: u32,
    /// Absolute deadline per subscription, `None` for non-clock entries
    pub deadlines: Vec<Option<u64>>,
}

/// What the host must wait for before stepping the engine again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    /// Monotonic deadline, already bounded by the maximum sleep slice
    pub deadline: Option<u64>,
    /// Wake early when stdin receives data or closes
    pub on_input: bool,
}

impl Wake {
    pub fn is_due(&self, now: u64, stdin: &ByteChannel) -> bool {
        self.deadline.is_some_and(|d| now >= d) || (self.on_input && stdin.is_readable())
    }

    /// Nanoseconds until the deadline, if there is one.
    pub fn remaining(&self, now: u64) -> Option<u64> {
        self.deadline.map(|d| d.saturating_sub(now))
    }
}

/// Arguments of one `poll_oneoff` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    pub in_ptr: u32,
    pub out_ptr: u32,
    pub nsubscriptions: u32,
    pub nevents_ptr: u32,
}

/// Outcome of an entry-point return, as seen by the drive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterEntry {
    /// The engine ran to completion
    Returned,
    /// The engine unwound; wait for this before stepping again
    Suspended(Wake),
    /// A rewind was never stopped; the entry point must be called again
    Reenter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Unwind started, entry point has not returned yet
    Armed(Wake),
    /// Unwound, waiting for the host to step again
    Parked(Wake),
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub polls: u64,
    pub unwinds: u64,
    pub rewinds: u64,
    /// Rewinds still active when the entry point returned
    pub stray_rewinds: u64,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Owns the checkpoint region and the single pending wait of one engine.
#[derive(Debug)]
pub struct SuspensionScheduler {
    region: Option<CheckpointRegion>,
    pending: Option<PendingWait>,
    phase: Phase,
    max_sleep_ns: u64,
    stats: SchedulerStats,
}

impl SuspensionScheduler {
    pub fn new(max_sleep_ns: u64) -> Self {
        Self {
            region: None,
            pending: None,
            phase: Phase::Running,
            max_sleep_ns,
            stats: SchedulerStats::default(),
        }
    }

    /// Installs the checkpoint region and writes its header.
    pub fn init_region(
        &mut self,
        ctl: &mut dyn EngineControl,
        region: CheckpointRegion,
    ) -> Result<(), SchedulerError> {
        region.reset(ctl.memory())?;
        self.region = Some(region);
        Ok(())
    }

    pub fn region(&self) -> Option<CheckpointRegion> {
        self.region
    }

    pub fn pending(&self) -> Option<&PendingWait> {
        self.pending.as_ref()
    }

    /// The wait the engine is parked on, if it is suspended.
    pub fn parked(&self) -> Option<Wake> {
        match self.phase {
            Phase::Parked(wake) => Some(wake),
            _ => None,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Serves `poll_oneoff`.
    ///
    /// WASI-level failures come back as `Ok(errno)`; `Err` is fatal.
    pub fn poll_oneoff(
        &mut self,
        ctl: &mut dyn EngineControl,
        req: PollRequest,
        clock: &dyn Clock,
        stdin: &ByteChannel,
    ) -> Result<Errno, SchedulerError> {
        self.stats.polls += 1;
        let state = ctl.state()?;
        if matches!(self.phase, Phase::Armed(_)) {
            log::error!("poll_oneoff: wait requested while another is outstanding");
            return Err(SchedulerError::OverlappingWait);
        }

        let resumed = match state {
            SuspendState::Unwinding => {
                log::error!("poll_oneoff: called while unwinding");
                return Err(SchedulerError::OverlappingWait);
            }
            SuspendState::Normal => {
                if self.pending.take().is_some() {
                    log::debug!("poll_oneoff: discarding stale pending wait");
                }
                None
            }
            SuspendState::Rewinding => {
                // Stop before anything else: the engine only expects rewind
                // semantics up to this import.
                let region = self.region.ok_or(SchedulerError::NotInitialized)?;
                ctl.stop_rewind();
                region.reset(ctl.memory())?;
                log::debug!("poll_oneoff: rewind stopped at {:#x}", req.in_ptr);
                match self.pending.take() {
                    Some(p) if p.in_ptr == req.in_ptr && p.count == req.nsubscriptions => Some(p),
                    Some(p) => {
                        log::warn!(
                            "poll_oneoff: resumed at {:#x}/{} but pending wait was {:#x}/{}",
                            req.in_ptr,
                            req.nsubscriptions,
                            p.in_ptr,
                            p.count
                        );
                        None
                    }
                    None => {
                        log::warn!("poll_oneoff: rewinding without a pending wait");
                        None
                    }
                }
            }
        };

        if req.nsubscriptions == 0 {
            return Ok(Errno::Inval);
        }

        let subs = match wasi::read_subscriptions(ctl.memory(), req.in_ptr, req.nsubscriptions) {
            Ok(subs) => subs,
            Err(errno) => return Ok(errno),
        };
        let eval = match evaluate(&subs, resumed.as_ref(), clock, stdin) {
            Ok(eval) => eval,
            Err(errno) => return Ok(errno),
        };

        #[cfg(feature = "debug")]
        log::trace!("poll_oneoff: subscriptions {:?}", subs);
        log::trace!(
            "poll_oneoff: {} subscriptions, {} ready, need_stdin={}, next={:?}",
            subs.len(),
            eval.ready.len(),
            eval.need_stdin,
            eval.next_delta
        );

        let memory = ctl.memory();
        if !eval.ready.is_empty() {
            let count = eval.ready.len().min(req.nsubscriptions as usize);
            if let Err(errno) = wasi::write_events(memory, req.out_ptr, &eval.ready[..count]) {
                return Ok(errno);
            }
            if let Err(errno) = wasi::write_u32(memory, req.nevents_ptr, count as u32) {
                return Ok(errno);
            }
            return Ok(Errno::Success);
        }

        if let Err(errno) = wasi::write_u32(memory, req.nevents_ptr, 0) {
            return Ok(errno);
        }

        let now = clock.monotonic_ns();
        let wake = Wake {
            deadline: eval
                .next_delta
                .map(|delta| now.saturating_add(delta.min(self.max_sleep_ns))),
            on_input: !stdin.is_closed() && stdin.is_empty(),
        };
        if wake.deadline.is_none() && !wake.on_input {
            // Nothing could ever wake this wait.
            return Ok(Errno::Success);
        }

        let region = self.region.ok_or(SchedulerError::NotInitialized)?;
        region.reset(memory)?;
        self.pending = Some(PendingWait {
            in_ptr: req.in_ptr,
            count: req.nsubscriptions,
            deadlines: eval.deadlines,
        });
        self.phase = Phase::Armed(wake);
        self.stats.unwinds += 1;
        log::debug!("poll_oneoff: unwinding, wake {:?}", wake);
        ctl.start_unwind(region.data_ptr);
        Ok(Errno::Success)
    }

    /// Handles the entry point returning normally.
    pub fn after_entry(&mut self, ctl: &mut dyn EngineControl) -> Result<AfterEntry, SchedulerError> {
        match ctl.state()? {
            SuspendState::Normal => {
                if let Phase::Armed(_) = self.phase {
                    log::warn!("entry returned without unwinding an armed wait");
                    self.phase = Phase::Running;
                }
                Ok(AfterEntry::Returned)
            }
            SuspendState::Rewinding => {
                log::warn!("entry returned while still rewinding, restarting");
                self.stats.stray_rewinds += 1;
                ctl.stop_rewind();
                if let Some(region) = self.region {
                    region.reset(ctl.memory())?;
                }
                Ok(AfterEntry::Reenter)
            }
            SuspendState::Unwinding => {
                ctl.stop_unwind();
                match self.phase {
                    Phase::Armed(wake) => {
                        self.phase = Phase::Parked(wake);
                        Ok(AfterEntry::Suspended(wake))
                    }
                    _ => {
                        log::error!("entry unwound with no pending wait");
                        Err(SchedulerError::MissingPendingWait)
                    }
                }
            }
        }
    }

    /// Starts the rewind for a parked engine. Returns false if the engine
    /// was not parked.
    pub fn begin_rewind(&mut self, ctl: &mut dyn EngineControl) -> Result<bool, SchedulerError> {
        if self.parked().is_none() {
            return Ok(false);
        }
        let region = self.region.ok_or(SchedulerError::NotInitialized)?;
        self.phase = Phase::Running;
        self.stats.rewinds += 1;
        log::debug!("rewinding into checkpoint {:#x}", region.data_ptr);
        ctl.start_rewind(region.data_ptr);
        Ok(true)
    }
}

struct Evaluation {
    ready: Vec<Event>,
    deadlines: Vec<Option<u64>>,
    next_delta: Option<u64>,
    need_stdin: bool,
}

fn evaluate(
    subs: &[Subscription],
    resumed: Option<&PendingWait>,
    clock: &dyn Clock,
    stdin: &ByteChannel,
) -> Result<Evaluation, Errno> {
    let mut eval = Evaluation {
        ready: Vec::new(),
        deadlines: vec![None; subs.len()],
        next_delta: None,
        need_stdin: false,
    };

    for (i, sub) in subs.iter().enumerate() {
        let ready = match sub.kind {
            SubscriptionKind::Write { .. } => true,
            SubscriptionKind::Read { fd: STDIN_FD } => {
                let readable = stdin.is_readable();
                eval.need_stdin |= !readable;
                readable
            }
            // Other descriptors have no readiness source; report them ready
            // so the engine's event loop does not stall on them.
            SubscriptionKind::Read { .. } => true,
            SubscriptionKind::Clock { id, timeout, flags, .. } => {
                let now = match ClockId::from_u32(id) {
                    Some(ClockId::Monotonic) => clock.monotonic_ns(),
                    Some(ClockId::Realtime) => clock.realtime_ns(),
                    _ => return Err(Errno::Inval),
                };
                let deadline = resumed
                    .and_then(|p| p.deadlines.get(i).copied().flatten())
                    .unwrap_or_else(|| {
                        if flags.contains(Subclockflags::ABSTIME) {
                            timeout
                        } else {
                            now.saturating_add(timeout)
                        }
                    });
                eval.deadlines[i] = Some(deadline);
                if deadline <= now {
                    true
                } else {
                    let delta = deadline - now;
                    eval.next_delta = Some(eval.next_delta.map_or(delta, |d| d.min(delta)));
                    false
                }
            }
        };
        if ready {
            eval.ready.push(Event {
                userdata: sub.userdata,
                error: Errno::Success,
                event_type: sub.event_type(),
            });
        }
    }
    Ok(eval)
}

// =============================================================================
// Tests
// =============================================================================
