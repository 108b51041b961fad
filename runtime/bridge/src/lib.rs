//! # EBB-BRIDGE: Cooperative Suspension Host
//!
//! EBB-BRIDGE runs a synchronous, single-threaded engine (an
//! asyncify-instrumented WebAssembly image) inside an event-driven host.
//! The engine blocks in exactly one place, `poll_oneoff`. When nothing it
//! waits for is ready, the bridge unwinds the engine into a checkpoint,
//! hands control back to the host, and later rewinds it through the same
//! entry point once input arrives or a deadline passes.
//!
//! ## Components
//!
//! - [`ByteChannel`]: bounded stdin ring fed by the host
//! - [`SuspensionScheduler`]: checkpoint region, pending wait, unwind/rewind
//! - [`Bridge`]: WASI imports, RPC decoding of stdout, drive loop
//! - [`Engine`] / [`EngineControl`]: what an engine instance must provide
//!
//! ## Data Flow
//!
//! ```text
//! host bytes --> ByteChannel --> fd_read --> engine
//! engine --> fd_write(stdout) --> Decoder --> rpc::Message --> on_message
//! ```
//!
//! ## Features
//!
//! - `std`: [`SystemClock`] and [`run_blocking`]
//! - `debug`: per-subscription trace logging

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bridge;
pub mod channel;
pub mod clock;
pub mod engine;
pub mod scheduler;
pub mod wasi;

#[cfg(feature = "std")]
pub mod blocking;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeStats, ExitReason, ExitStatus, Step};
pub use channel::{ByteChannel, ChannelError};
pub use clock::{Clock, ManualClock};
pub use engine::{Engine, EngineControl, SuspendState, Trap};
pub use scheduler::{CheckpointRegion, SuspensionScheduler, Wake};

#[cfg(feature = "std")]
pub use blocking::run_blocking;
#[cfg(feature = "std")]
pub use clock::SystemClock;

pub use ebb_wire::rpc::Message;
pub use ebb_wire::Value;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Stdin ring size in bytes
    pub channel_capacity: usize,
    /// Longest single sleep before the engine re-checks its wait
    pub max_sleep_ns: u64,
    /// Stack size for a checkpoint region carved from grown memory
    pub checkpoint_stack_size: usize,
    /// Bytes of stderr kept for diagnostics
    pub stderr_tail_limit: usize,
    /// How long a request may go unanswered
    pub request_timeout_ns: u64,
    /// Deepest value nesting accepted from stdout
    pub max_decode_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256 * 1024,
            max_sleep_ns: 50_000_000,
            checkpoint_stack_size: 64 * 1024 * 1024,
            stderr_tail_limit: 8192,
            request_timeout_ns: 8_000_000_000,
            max_decode_depth: ebb_wire::decode::DEFAULT_MAX_DEPTH,
        }
    }
}

/// Fatal scheduler errors. The bridge stops driving the engine after any
/// of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// A wait was requested while another was still outstanding
    OverlappingWait,
    /// No checkpoint region was set up before suspending
    NotInitialized,
    /// The engine unwound but no wait was armed
    MissingPendingWait,
    /// `asyncify_get_state` returned something other than 0, 1 or 2
    UnexpectedState(u32),
    /// Checkpoint header outside linear memory
    Fault(u32),
}

impl core::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedulerError::OverlappingWait => write!(f, "Overlapping async operation"),
            SchedulerError::NotInitialized => write!(f, "Checkpoint region not initialized"),
            SchedulerError::MissingPendingWait => write!(f, "Unwound without a pending wait"),
            SchedulerError::UnexpectedState(s) => write!(f, "Unexpected suspend state: {}", s),
            SchedulerError::Fault(addr) => write!(f, "Checkpoint region out of bounds at {:#x}", addr),
        }
    }
}
