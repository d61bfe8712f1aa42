//! Slot pool implementation: index-addressed slots behind one mutex.
//!
//! The lock only covers the O(N) scan/flip in `acquire` and the flip in
//! `release`; it is never held while a downstream call is in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::ChannelId;
use crate::downstream::{ConnectError, Connector, Downstream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Busy,
}

struct Slot {
    channel: ChannelId,
    downstream: Arc<dyn Downstream>,
}

struct PoolState {
    states: Vec<SlotState>,
    /// Administratively withdrawn slots are skipped by `acquire`.
    disabled: Vec<bool>,
    cursor: usize,
}

/// Fixed-size pool of payment channel slots with round-robin allocation.
pub struct SlotPool {
    slots: Vec<Slot>,
    state: Mutex<PoolState>,
}

impl SlotPool {
    /// Build a pool from ready downstream handles, in slot order.
    pub fn new(slots: Vec<(ChannelId, Arc<dyn Downstream>)>) -> Result<Self, ConnectError> {
        if slots.is_empty() {
            return Err(ConnectError::NoChannels);
        }

        let mut seen = HashSet::with_capacity(slots.len());
        for (channel, _) in &slots {
            if !seen.insert(*channel) {
                return Err(ConnectError::Duplicate(*channel));
            }
        }

        let n = slots.len();
        Ok(Self {
            slots: slots
                .into_iter()
                .map(|(channel, downstream)| Slot {
                    channel,
                    downstream,
                })
                .collect(),
            state: Mutex::new(PoolState {
                states: vec![SlotState::Free; n],
                disabled: vec![false; n],
                cursor: 0,
            }),
        })
    }

    /// Eagerly open one downstream handle per channel.
    pub fn connect(channels: &[ChannelId], connector: &dyn Connector) -> Result<Self, ConnectError> {
        let mut slots = Vec::with_capacity(channels.len());
        for &channel in channels {
            tracing::debug!(%channel, "Opening payment channel");
            slots.push((channel, connector.connect(channel)?));
        }
        let pool = Self::new(slots)?;
        tracing::info!(channels = ?pool.channels(), "Payment channels to be used");
        Ok(pool)
    }

    /// The lock never guards user code, so a poisoned lock still holds a
    /// consistent state.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Slot pool mutex poisoned - recovering state");
            poisoned.into_inner()
        })
    }

    /// Lease the next Free slot in round-robin order.
    ///
    /// Returns `None` when a full wrap finds no usable slot.
    pub fn acquire(self: &Arc<Self>) -> Option<SlotLease> {
        let mut state = self.lock_state();
        let n = self.slots.len();
        for offset in 0..n {
            let index = (state.cursor + offset) % n;
            if state.states[index] == SlotState::Free && !state.disabled[index] {
                state.states[index] = SlotState::Busy;
                state.cursor = (index + 1) % n;
                drop(state);

                let channel = self.slots[index].channel;
                tracing::debug!(%channel, "Slot acquired");
                return Some(SlotLease {
                    pool: Arc::clone(self),
                    index,
                    channel,
                    released: false,
                });
            }
        }
        None
    }

    fn release(&self, index: usize) {
        let mut state = self.lock_state();
        state.states[index] = SlotState::Free;
        drop(state);
        tracing::debug!(channel = %self.slots[index].channel, "Slot released");
    }

    fn index_of(&self, channel: ChannelId) -> Option<usize> {
        self.slots.iter().position(|s| s.channel == channel)
    }

    /// Withdraw a slot from allocation. A Busy slot finishes its current call.
    ///
    /// Returns `false` for an unknown channel.
    pub fn disable(&self, channel: ChannelId) -> bool {
        let Some(index) = self.index_of(channel) else {
            tracing::warn!(%channel, "Attempted to disable unknown payment channel");
            return false;
        };
        let mut state = self.lock_state();
        if !std::mem::replace(&mut state.disabled[index], true) {
            tracing::warn!(%channel, "Payment channel disabled - capacity reduced");
        }
        true
    }

    pub fn enable(&self, channel: ChannelId) -> bool {
        let Some(index) = self.index_of(channel) else {
            tracing::warn!(%channel, "Attempted to enable unknown payment channel");
            return false;
        };
        let mut state = self.lock_state();
        if std::mem::replace(&mut state.disabled[index], false) {
            tracing::info!(%channel, "Payment channel re-enabled");
        }
        true
    }

    pub fn is_disabled(&self, channel: ChannelId) -> bool {
        self.index_of(channel)
            .is_some_and(|index| self.lock_state().disabled[index])
    }

    pub fn state_of(&self, channel: ChannelId) -> Option<SlotState> {
        self.index_of(channel)
            .map(|index| self.lock_state().states[index])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.slots.iter().map(|s| s.channel).collect()
    }

    pub fn busy(&self) -> usize {
        self.lock_state()
            .states
            .iter()
            .filter(|s| **s == SlotState::Busy)
            .count()
    }

    /// Free slots that `acquire` could hand out right now.
    pub fn available(&self) -> usize {
        let state = self.lock_state();
        state
            .states
            .iter()
            .zip(&state.disabled)
            .filter(|(s, disabled)| **s == SlotState::Free && !**disabled)
            .count()
    }

    /// Close every downstream handle. Called once at process teardown.
    pub async fn close(&self) {
        for slot in &self.slots {
            slot.downstream.close().await;
            tracing::debug!(channel = %slot.channel, "Payment channel closed");
        }
    }
}

/// Exclusive use of one slot. Released exactly once: explicitly or on drop.
pub struct SlotLease {
    pool: Arc<SlotPool>,
    index: usize,
    channel: ChannelId,
    released: bool,
}

impl SlotLease {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn downstream(&self) -> &Arc<dyn Downstream> {
        &self.pool.slots[self.index].downstream
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.index);
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(channel = %self.channel, "Slot lease dropped before explicit release");
            self.release_once();
        }
    }
}
