//! # Engine ABI
//!
//! What the bridge needs from an asyncify-instrumented engine instance.
//!
//! The engine is a compiled, single-threaded program. It cannot block, so
//! when it asks for a wait the host cannot satisfy, the host makes it
//! unwind its call stack into a checkpoint region, returns to the event
//! loop, and later re-enters the same entry point with a rewind pending.
//! The engine re-executes down to the wait import, which then answers
//! normally.
//!
//! ## Exports
//!
//! | Export                  | Trait method               |
//! |-------------------------|----------------------------|
//! | `asyncify_start_unwind` | [`EngineControl::start_unwind`] |
//! | `asyncify_stop_unwind`  | [`EngineControl::stop_unwind`]  |
//! | `asyncify_start_rewind` | [`EngineControl::start_rewind`] |
//! | `asyncify_stop_rewind`  | [`EngineControl::stop_rewind`]  |
//! | `asyncify_get_state`    | [`EngineControl::suspend_state`] |
//! | `_start`                | [`Engine::call_entry`]     |

use alloc::string::String;

use crate::bridge::Bridge;
use crate::scheduler::CheckpointRegion;
use crate::SchedulerError;

/// WebAssembly page size in bytes.
pub const PAGE_SIZE: usize = 65536;

/// Value reported by `asyncify_get_state`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    /// Executing normally
    Normal = 0,
    /// Saving the call stack after `start_unwind`
    Unwinding = 1,
    /// Restoring the call stack after `start_rewind`
    Rewinding = 2,
}

impl SuspendState {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Normal),
            1 => Some(Self::Unwinding),
            2 => Some(Self::Rewinding),
            _ => None,
        }
    }
}

/// Linear memory and the asyncify control exports.
///
/// Host imports receive this while the engine is executing, so that they
/// can read arguments out of memory and steer suspension.
pub trait EngineControl {
    /// The engine's linear memory.
    fn memory(&mut self) -> &mut [u8];

    /// Grows memory by `pages`, returning the previous size in pages.
    fn grow_memory(&mut self, pages: u32) -> Option<u32>;

    /// Raw `asyncify_get_state` value.
    fn suspend_state(&mut self) -> u32;

    fn start_unwind(&mut self, data_ptr: u32);

    fn stop_unwind(&mut self);

    fn start_rewind(&mut self, data_ptr: u32);

    fn stop_rewind(&mut self);

    /// Decoded state; unknown values are reported as an error.
    fn state(&mut self) -> Result<SuspendState, SchedulerError> {
        let raw = self.suspend_state();
        SuspendState::from_u32(raw).ok_or(SchedulerError::UnexpectedState(raw))
    }
}

/// A runnable engine instance.
pub trait Engine: EngineControl {
    /// Invokes the entry point. Host imports are served by `host`.
    ///
    /// Returns `Ok(())` when the entry point returns, whether the engine
    /// finished or unwound. `Err` carries `proc_exit`, a fatal host error,
    /// or an engine trap.
    fn call_entry(&mut self, host: &mut Bridge) -> Result<(), Trap>;

    /// Checkpoint region compiled into the image, if it exports one.
    ///
    /// Images without one get a region carved out of freshly grown memory.
    fn reserved_checkpoint(&mut self) -> Option<CheckpointRegion> {
        None
    }
}

/// Abnormal end of an entry-point call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// `proc_exit` with this code
    Exit(u32),
    /// A host import hit a fatal scheduler error
    Host(SchedulerError),
    /// The engine trapped (unreachable, out of bounds access, ...)
    Abort(String),
}

impl core::fmt::Display for Trap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Trap::Exit(code) => write!(f, "Engine exited with code {}", code),
            Trap::Host(err) => write!(f, "Host error: {}", err),
            Trap::Abort(msg) => write!(f, "Engine trapped: {}", msg),
        }
    }
}

impl From<SchedulerError> for Trap {
    fn from(err: SchedulerError) -> Self {
        Trap::Host(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_state_values() {
        assert_eq!(SuspendState::from_u32(0), Some(SuspendState::Normal));
        assert_eq!(SuspendState::from_u32(1), Some(SuspendState::Unwinding));
        assert_eq!(SuspendState::from_u32(2), Some(SuspendState::Rewinding));
        assert_eq!(SuspendState::from_u32(3), None);
    }
}
