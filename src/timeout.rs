//! Cycle counted software timers.
//!
//! Timers count synchronous interrupts rather than wall clock time.  They are
//! allocated from a fixed [`TimeoutPool`] because the targets have no heap;
//! the pool is owned by the orchestrator and lent to the channels that hold
//! [`TimeoutHandle`]s.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::TIMEOUT_MAX_INSTANCES;
use crate::{Error, Result};

/// State of a timeout instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Stopped,
    Running,
    Expired,
}

/// Handle to an instance in a [`TimeoutPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle(u8);

#[derive(Debug, Clone, Copy)]
struct Timeout {
    cycle_limit: u32,
    cycles: u32,
    state: TimeoutState,
}

/// Fixed pool of at most [`TIMEOUT_MAX_INSTANCES`] timers
#[derive(Debug)]
pub struct TimeoutPool {
    slots: [Option<Timeout>; TIMEOUT_MAX_INSTANCES],
}

impl Default for TimeoutPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutPool {
    pub const fn new() -> Self {
        Self {
            slots: [None; TIMEOUT_MAX_INSTANCES],
        }
    }

    /// Allocate a stopped timer expiring after `cycle_limit` cycles.
    ///
    /// Fails with [`Error::PoolExhausted`] once all instances are in use.
    pub fn create(&mut self, cycle_limit: u32) -> Result<TimeoutHandle> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::PoolExhausted)?;
        self.slots[index] = Some(Timeout {
            cycle_limit,
            cycles: 0,
            state: TimeoutState::Stopped,
        });
        debug!("Created timeout {index} limit {cycle_limit} cycles");
        Ok(TimeoutHandle(index as u8))
    }

    /// Return an instance to the pool
    pub fn destroy(&mut self, handle: TimeoutHandle) -> Result<()> {
        self.get_mut(handle)?;
        self.slots[handle.0 as usize] = None;
        Ok(())
    }

    /// Restart counting from zero.  A zero limit is expired at once.
    pub fn start(&mut self, handle: TimeoutHandle) -> Result<()> {
        let timeout = self.get_mut(handle)?;
        timeout.cycles = 0;
        timeout.state = if timeout.cycle_limit == 0 {
            TimeoutState::Expired
        } else {
            TimeoutState::Running
        };
        Ok(())
    }

    pub fn stop(&mut self, handle: TimeoutHandle) -> Result<()> {
        let timeout = self.get_mut(handle)?;
        timeout.cycles = 0;
        timeout.state = TimeoutState::Stopped;
        Ok(())
    }

    /// Count one synchronous cycle.  Called once per tick by the owning
    /// channel.
    pub fn increment(&mut self, handle: TimeoutHandle) -> Result<()> {
        let timeout = self.get_mut(handle)?;
        if timeout.state == TimeoutState::Running {
            timeout.cycles = timeout.cycles.saturating_add(1);
            if timeout.cycles >= timeout.cycle_limit {
                timeout.state = TimeoutState::Expired;
                trace!("Timeout {} expired", handle.0);
            }
        }
        Ok(())
    }

    pub fn check_expire(&self, handle: TimeoutHandle) -> Result<TimeoutState> {
        self.slots
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .map(|timeout| timeout.state)
            .ok_or(Error::InvalidHandle)
    }

    /// Number of instances still available
    pub fn available(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    fn get_mut(&mut self, handle: TimeoutHandle) -> Result<&mut Timeout> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidHandle)
    }
}
