//! Blocking host loop for threaded hosts.
//!
//! Parks the calling thread between steps until the engine's wake
//! condition holds: stdin activity signals a condvar through the
//! channel's notify hook, deadlines bound the wait.

use alloc::boxed::Box;
use alloc::sync::Arc;

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::bridge::{Bridge, ExitStatus, Step};
use crate::engine::Engine;
use crate::scheduler::Wake;
use crate::SchedulerError;

type Signal = (Mutex<bool>, Condvar);

/// Drives `engine` to completion on this thread.
pub fn run_blocking<E: Engine>(bridge: &mut Bridge, engine: &mut E) -> Result<ExitStatus, SchedulerError> {
    let signal: Arc<Signal> = Arc::new((Mutex::new(false), Condvar::new()));
    let notify = signal.clone();
    let channel = bridge.channel();
    channel.set_notify(Box::new(move || {
        let (flag, cv) = &*notify;
        *lock(flag) = true;
        cv.notify_all();
    }));

    let result = drive(bridge, engine, &signal);
    channel.clear_notify();
    result
}

fn drive<E: Engine>(bridge: &mut Bridge, engine: &mut E, signal: &Signal) -> Result<ExitStatus, SchedulerError> {
    loop {
        match bridge.step(engine)? {
            Step::Exited(status) => return Ok(status),
            Step::Waiting(wake) => park(bridge, &wake, signal),
        }
    }
}

fn park(bridge: &Bridge, wake: &Wake, signal: &Signal) {
    let (flag, cv) = signal;
    let channel = bridge.channel();
    let mut signalled = lock(flag);
    loop {
        // Checked under the lock, so a push cannot slip in unnoticed.
        let now = bridge.clock().monotonic_ns();
        if wake.is_due(now, &channel) {
            return;
        }
        *signalled = false;
        signalled = match wake.remaining(now) {
            Some(ns) => match cv.wait_timeout(signalled, Duration::from_nanos(ns)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            },
            None => cv.wait(signalled).unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
    }
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
