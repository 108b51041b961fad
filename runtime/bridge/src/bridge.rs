//! # Bridge Facade
//!
//! Connects one engine instance to the host: serves its WASI imports,
//! turns its stdout into RPC messages, feeds host input into its stdin,
//! and drives its entry point through suspensions.
//!
//! ## Drive Loop
//!
//! ```ignore
//! let mut bridge = Bridge::new(BridgeConfig::default(), Box::new(clock), on_message);
//! loop {
//!     match bridge.step(&mut engine)? {
//!         Step::Waiting(wake) => host_wait_until(wake),
//!         Step::Exited(status) => break status,
//!     }
//! }
//! ```
//!
//! Each `step` either starts the engine or rewinds it through the same
//! entry point, then runs until the next suspension or exit.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ebb_wire::rpc::Message;
use ebb_wire::{Decoder, EncodeError, Value};

use crate::channel::{ByteChannel, ChannelError};
use crate::clock::Clock;
use crate::engine::{Engine, EngineControl, Trap};
use crate::scheduler::{AfterEntry, CheckpointRegion, PollRequest, SuspensionScheduler, Wake};
use crate::wasi::{self, ClockId, Errno, STDERR_FD, STDIN_FD, STDOUT_FD};
use crate::{BridgeConfig, SchedulerError};

/// Callback receiving each decoded message in stream order.
pub type MessageHandler = Box<dyn FnMut(Message) + Send>;

/// Result of driving the engine once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Suspended; step again once the wake condition holds
    Waiting(Wake),
    /// Finished for good
    Exited(ExitStatus),
}

/// How the engine finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Called `proc_exit`
    ProcExit,
    /// Entry point returned
    Returned,
    /// Trapped; carries the trap message
    Aborted(String),
}

/// Final status of an engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    pub reason: ExitReason,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A request sent to the engine and not yet answered.
#[derive(Debug, Clone)]
struct PendingRequest {
    method: String,
    deadline: u64,
}

/// Bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Input bytes accepted into stdin
    pub bytes_submitted: u64,
    /// Input bytes dropped because stdin was full
    pub bytes_dropped: u64,
    /// Decoders discarded after malformed output
    pub decoder_resets: u64,
    /// Messages handed to the message callback
    pub messages_delivered: u64,
    /// Decoded values that were not RPC messages
    pub values_dropped: u64,
    /// Entry point invocations
    pub entry_calls: u64,
    pub unwinds: u64,
    pub rewinds: u64,
    pub pending_requests: usize,
}

/// Host side of one engine instance.
pub struct Bridge {
    config: BridgeConfig,
    clock: Box<dyn Clock>,
    channel: Arc<ByteChannel>,
    scheduler: SuspensionScheduler,
    decoder: Decoder,
    on_message: MessageHandler,
    pending_requests: BTreeMap<u32, PendingRequest>,
    next_request_id: u32,
    stderr_tail: Vec<u8>,
    exit: Option<ExitStatus>,
    fault: Option<SchedulerError>,
    decoder_resets: u64,
    messages_delivered: u64,
    values_dropped: u64,
    entry_calls: u64,
}

impl Bridge {
    pub fn new<F>(config: BridgeConfig, clock: Box<dyn Clock>, on_message: F) -> Self
    where
        F: FnMut(Message) + Send + 'static,
    {
        Self {
            channel: Arc::new(ByteChannel::new(config.channel_capacity)),
            scheduler: SuspensionScheduler::new(config.max_sleep_ns),
            decoder: Decoder::with_max_depth(config.max_decode_depth),
            config,
            clock,
            on_message: Box::new(on_message),
            pending_requests: BTreeMap::new(),
            next_request_id: 1,
            stderr_tail: Vec::new(),
            exit: None,
            fault: None,
            decoder_resets: 0,
            messages_delivered: 0,
            values_dropped: 0,
            entry_calls: 0,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The engine's stdin, for producers that outlive a borrow of the bridge.
    pub fn channel(&self) -> Arc<ByteChannel> {
        self.channel.clone()
    }

    pub fn scheduler(&self) -> &SuspensionScheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit.as_ref()
    }

    /// The wait the engine is suspended on, if any.
    pub fn wake(&self) -> Option<Wake> {
        self.scheduler.parked()
    }

    // =========================================================================
    // Drive Loop
    // =========================================================================

    /// Runs the engine until it suspends or exits.
    ///
    /// A fatal scheduler error poisons the bridge: every later call
    /// returns the same error.
    pub fn step<E: Engine>(&mut self, engine: &mut E) -> Result<Step, SchedulerError> {
        if let Some(err) = self.fault {
            return Err(err);
        }
        if let Some(status) = &self.exit {
            return Ok(Step::Exited(status.clone()));
        }
        if let Err(err) = self.ensure_region(engine) {
            return Err(self.fail(err));
        }
        if let Err(err) = self.scheduler.begin_rewind(engine) {
            return Err(self.fail(err));
        }

        loop {
            self.entry_calls += 1;
            let result = engine.call_entry(self);
            if let Some(err) = self.fault {
                return Err(err);
            }

            let status = match result {
                Ok(()) => match self.scheduler.after_entry(engine) {
                    Ok(AfterEntry::Suspended(wake)) => return Ok(Step::Waiting(wake)),
                    Ok(AfterEntry::Reenter) => continue,
                    Ok(AfterEntry::Returned) => ExitStatus {
                        code: 0,
                        reason: ExitReason::Returned,
                    },
                    Err(err) => return Err(self.fail(err)),
                },
                Err(Trap::Exit(code)) => ExitStatus {
                    code,
                    reason: ExitReason::ProcExit,
                },
                Err(Trap::Host(err)) => return Err(self.fail(err)),
                Err(Trap::Abort(msg)) => {
                    log::error!("engine trapped: {}", msg);
                    ExitStatus {
                        code: 1,
                        reason: ExitReason::Aborted(msg),
                    }
                }
            };

            log::info!("engine exited with code {} ({:?})", status.code, status.reason);
            self.exit = Some(status.clone());
            return Ok(Step::Exited(status));
        }
    }

    fn ensure_region<E: Engine>(&mut self, engine: &mut E) -> Result<(), SchedulerError> {
        if self.scheduler.region().is_some() {
            return Ok(());
        }
        let region = match engine.reserved_checkpoint() {
            Some(region) => region,
            None => {
                log::warn!("engine has no reserved checkpoint region, carving one");
                CheckpointRegion::carve(engine, self.config.checkpoint_stack_size)?
            }
        };
        self.scheduler.init_region(engine, region)
    }

    fn fail(&mut self, err: SchedulerError) -> SchedulerError {
        log::error!("bridge aborted: {}", err);
        self.fault = Some(err);
        err
    }

    // =========================================================================
    // WASI Imports
    // =========================================================================

    /// `poll_oneoff(in, out, nsubscriptions, nevents)`.
    pub fn poll_oneoff(
        &mut self,
        ctl: &mut dyn EngineControl,
        in_ptr: u32,
        out_ptr: u32,
        nsubscriptions: u32,
        nevents_ptr: u32,
    ) -> Result<Errno, Trap> {
        let req = PollRequest {
            in_ptr,
            out_ptr,
            nsubscriptions,
            nevents_ptr,
        };
        match self
            .scheduler
            .poll_oneoff(ctl, req, self.clock.as_ref(), &self.channel)
        {
            Ok(errno) => Ok(errno),
            Err(err) => Err(Trap::Host(self.fail(err))),
        }
    }

    /// `fd_read` on stdin. Never blocks: an empty open channel is `Again`,
    /// a drained closed one reads 0 bytes.
    pub fn fd_read(
        &mut self,
        ctl: &mut dyn EngineControl,
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        nread_ptr: u32,
    ) -> Errno {
        if fd != STDIN_FD {
            return Errno::Badf;
        }
        let memory = ctl.memory();
        let iovecs = match wasi::read_iovecs(memory, iovs, iovs_len) {
            Ok(iovecs) => iovecs,
            Err(errno) => return errno,
        };

        let mut total = 0usize;
        for iov in iovecs {
            let buf = match wasi::slice_mut(memory, iov.buf, iov.buf_len as usize) {
                Ok(buf) => buf,
                Err(errno) => return errno,
            };
            if buf.is_empty() {
                continue;
            }
            match self.channel.read_into(buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(ChannelError::WouldBlock) if total == 0 => return Errno::Again,
                Err(ChannelError::WouldBlock) => break,
            }
        }

        match wasi::write_u32(memory, nread_ptr, total as u32) {
            Ok(()) => Errno::Success,
            Err(errno) => errno,
        }
    }

    /// `fd_write` on stdout (RPC stream) or stderr (diagnostic tail).
    pub fn fd_write(
        &mut self,
        ctl: &mut dyn EngineControl,
        fd: u32,
        iovs: u32,
        iovs_len: u32,
        nwritten_ptr: u32,
    ) -> Errno {
        if fd != STDOUT_FD && fd != STDERR_FD {
            return Errno::Badf;
        }
        let memory = ctl.memory();
        let data = match wasi::gather(memory, iovs, iovs_len) {
            Ok(data) => data,
            Err(errno) => return errno,
        };
        if let Err(errno) = wasi::write_u32(memory, nwritten_ptr, data.len() as u32) {
            return errno;
        }

        if fd == STDOUT_FD {
            self.handle_stdout(&data);
        } else {
            self.handle_stderr(&data);
        }
        Errno::Success
    }

    /// `proc_exit(code)`. The engine unwinds with the returned trap.
    pub fn proc_exit(&mut self, code: u32) -> Trap {
        log::debug!("proc_exit({})", code);
        Trap::Exit(code)
    }

    /// `clock_time_get(id, precision, time)`.
    ///
    /// CPU-time clocks report monotonic time; the engine is the only
    /// thing running on its thread.
    pub fn clock_time_get(
        &mut self,
        ctl: &mut dyn EngineControl,
        id: u32,
        _precision: u64,
        time_ptr: u32,
    ) -> Errno {
        let now = match ClockId::from_u32(id) {
            Some(ClockId::Realtime) => self.clock.realtime_ns(),
            Some(_) => self.clock.monotonic_ns(),
            None => return Errno::Inval,
        };
        match wasi::write_u64(ctl.memory(), time_ptr, now) {
            Ok(()) => Errno::Success,
            Err(errno) => errno,
        }
    }

    pub fn sched_yield(&mut self) -> Errno {
        Errno::Success
    }

    // =========================================================================
    // Engine Output
    // =========================================================================

    fn handle_stdout(&mut self, bytes: &[u8]) {
        let mut values = Vec::new();
        if let Err(err) = self.decoder.push(bytes, |value| values.push(value)) {
            log::warn!("stdout: {}, discarding decoder", err);
            self.decoder = Decoder::with_max_depth(self.config.max_decode_depth);
            self.decoder_resets += 1;
        }
        for value in values {
            self.dispatch(value);
        }
    }

    fn dispatch(&mut self, value: Value) {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("stdout: dropping non-rpc value: {}", err);
                self.values_dropped += 1;
                return;
            }
        };
        if let Message::Response { id, .. } = &message {
            if self.pending_requests.remove(id).is_none() {
                log::debug!("response for unknown request {}", id);
            }
        }
        self.messages_delivered += 1;
        (self.on_message)(message);
    }

    fn handle_stderr(&mut self, bytes: &[u8]) {
        let limit = self.config.stderr_tail_limit;
        if bytes.len() >= limit {
            self.stderr_tail.clear();
            self.stderr_tail.extend_from_slice(&bytes[bytes.len() - limit..]);
            return;
        }
        self.stderr_tail.extend_from_slice(bytes);
        if self.stderr_tail.len() > limit {
            let excess = self.stderr_tail.len() - limit;
            self.stderr_tail.drain(..excess);
        }
    }

    /// The last `stderr_tail_limit` bytes the engine wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr_tail).into_owned()
    }

    // =========================================================================
    // Engine Input
    // =========================================================================

    /// Queues raw bytes for the engine's stdin. Returns the bytes accepted.
    pub fn submit(&self, bytes: &[u8]) -> usize {
        self.channel.push(bytes)
    }

    /// Closes stdin. A pending read wait resolves with end of stream.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Encodes and queues one message.
    pub fn send(&self, message: &Message) -> Result<usize, EncodeError> {
        let bytes = message.encode()?;
        let accepted = self.submit(&bytes);
        if accepted < bytes.len() {
            log::warn!("send: message truncated, {} of {} bytes queued", accepted, bytes.len());
        }
        Ok(accepted)
    }

    /// Sends a request and tracks it until its response or timeout.
    pub fn request(&mut self, method: &str, params: Vec<Value>) -> Result<u32, EncodeError> {
        let id = self.next_request_id;
        self.send(&Message::request(id, method, params))?;
        self.next_request_id = id.wrapping_add(1);
        let deadline = self
            .clock
            .monotonic_ns()
            .saturating_add(self.config.request_timeout_ns);
        self.pending_requests.insert(
            id,
            PendingRequest {
                method: String::from(method),
                deadline,
            },
        );
        Ok(id)
    }

    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), EncodeError> {
        self.send(&Message::notification(method, params)).map(|_| ())
    }

    /// Answers a request the engine made.
    pub fn respond(&self, id: u32, error: Value, result: Value) -> Result<(), EncodeError> {
        self.send(&Message::response(id, error, result)).map(|_| ())
    }

    /// Removes and returns requests whose deadline is at or before `now`.
    pub fn expire_requests(&mut self, now: u64) -> Vec<(u32, String)> {
        let expired: Vec<u32> = self
            .pending_requests
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let req = self.pending_requests.remove(&id)?;
                log::warn!("request {} ({}) timed out", id, req.method);
                Some((id, req.method))
            })
            .collect()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests.len()
    }

    pub fn stats(&self) -> BridgeStats {
        let sched = self.scheduler.stats();
        BridgeStats {
            bytes_submitted: self.channel.bytes_written(),
            bytes_dropped: self.channel.bytes_dropped(),
            decoder_resets: self.decoder_resets,
            messages_delivered: self.messages_delivered,
            values_dropped: self.values_dropped,
            entry_calls: self.entry_calls,
            unwinds: sched.unwinds,
            rewinds: sched.rewinds,
            pending_requests: self.pending_requests.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
