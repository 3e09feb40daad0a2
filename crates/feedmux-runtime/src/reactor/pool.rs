//! Reactor-side channel pool
//!
//! Slots live in a vector and are addressed by index; a slot's generation
//! changes whenever it returns to the pool, so outdated [`ChannelId`]s never
//! resolve. Each slot belongs to exactly one [`ChannelQueue`] and every queue
//! is an index set, giving constant-time moves between queues.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use feedmux_core::{
    ChannelId, ChannelSetupState, Link, ReactorError, ReactorId, ReactorResult, SessionId,
    SetupPlan, StatisticsFlags, StatisticsRecorder,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::activity::LinkActivity;
use crate::callbacks::ChannelCallbacks;

/// Queue a channel slot currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelQueue {
    /// Free slot
    Pool,
    /// Waiting for the worker to bring the first link up
    Initializing,
    /// Link up; setup in progress or ready
    Active,
    /// Terminally down, waiting for the application to close it
    Inactive,
    /// Between links; the worker is reconnecting
    Reconnecting,
    /// Closed by the application, waiting for the worker's acknowledgment
    Closing,
}

const QUEUES: [ChannelQueue; 6] = [
    ChannelQueue::Pool,
    ChannelQueue::Initializing,
    ChannelQueue::Active,
    ChannelQueue::Inactive,
    ChannelQueue::Reconnecting,
    ChannelQueue::Closing,
];

fn queue_index(queue: ChannelQueue) -> usize {
    match queue {
        ChannelQueue::Pool => 0,
        ChannelQueue::Initializing => 1,
        ChannelQueue::Active => 2,
        ChannelQueue::Inactive => 3,
        ChannelQueue::Reconnecting => 4,
        ChannelQueue::Closing => 5,
    }
}

// ----------------------------------------------------------------------------
// Channel Slot
// ----------------------------------------------------------------------------

pub(crate) struct ChannelSlot {
    pub generation: u32,
    pub queue: ChannelQueue,
    pub setup_state: ChannelSetupState,
    pub plan: SetupPlan,
    pub callbacks: Option<Arc<dyn ChannelCallbacks>>,
    pub link: Option<Arc<dyn Link>>,
    pub activity: Option<Arc<LinkActivity>>,
    pub epoch: u64,
    pub connection_index: usize,
    pub session: Option<SessionId>,
    pub requested_flush: bool,
    pub write_again: Option<Vec<u8>>,
    pub stats: StatisticsRecorder,
    pub setup_deadline: Option<Instant>,
    pub last_requested_expire: Option<Instant>,
}

impl ChannelSlot {
    fn blank(generation: u32) -> Self {
        Self {
            generation,
            queue: ChannelQueue::Pool,
            setup_state: ChannelSetupState::Init,
            plan: SetupPlan::default(),
            callbacks: None,
            link: None,
            activity: None,
            epoch: 0,
            connection_index: 0,
            session: None,
            requested_flush: false,
            write_again: None,
            stats: StatisticsRecorder::default(),
            setup_deadline: None,
            last_requested_expire: None,
        }
    }

    /// Configure a freshly allocated slot
    pub fn open(
        &mut self,
        plan: SetupPlan,
        statistics: StatisticsFlags,
        callbacks: Arc<dyn ChannelCallbacks>,
        session: Option<SessionId>,
    ) {
        self.plan = plan;
        self.stats = StatisticsRecorder::new(statistics);
        self.callbacks = Some(callbacks);
        self.session = session;
    }

    /// Clear per-link state before the next attempt; returns the old link
    pub fn reset_link_state(&mut self) -> Option<Arc<dyn Link>> {
        self.requested_flush = false;
        self.write_again = None;
        self.setup_deadline = None;
        self.last_requested_expire = None;
        self.activity = None;
        self.link.take()
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }
}

/// Read-only view returned by `Reactor::channel_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: ChannelId,
    pub queue: ChannelQueue,
    pub setup_state: ChannelSetupState,
    pub connection_index: usize,
    pub session: Option<SessionId>,
    pub write_pending: bool,
    pub flush_requested: bool,
}

// ----------------------------------------------------------------------------
// Channel Pool
// ----------------------------------------------------------------------------

pub(crate) struct ChannelPool {
    reactor: ReactorId,
    slots: Vec<ChannelSlot>,
    free: VecDeque<u32>,
    queues: [HashSet<u32>; 6],
    max_channels: usize,
}

impl ChannelPool {
    pub fn new(reactor: ReactorId, initial: usize, max_channels: usize) -> Self {
        let mut pool = Self {
            reactor,
            slots: Vec::with_capacity(initial),
            free: VecDeque::with_capacity(initial),
            queues: Default::default(),
            max_channels,
        };
        for _ in 0..initial.min(max_channels) {
            pool.grow();
        }
        pool
    }

    fn grow(&mut self) -> u32 {
        let index = self.slots.len() as u32;
        self.slots.push(ChannelSlot::blank(0));
        self.free.push_back(index);
        self.queues[queue_index(ChannelQueue::Pool)].insert(index);
        index
    }

    fn id_for(&self, index: u32) -> ChannelId {
        ChannelId::new(self.reactor, index, self.slots[index as usize].generation)
    }

    /// Take a free slot (growing the pool up to its limit) into `Initializing`
    pub fn allocate(&mut self) -> ReactorResult<ChannelId> {
        let index = match self.free.pop_front() {
            Some(index) => index,
            None if self.slots.len() < self.max_channels => {
                let index = self.grow();
                self.free.pop_back();
                index
            }
            None => {
                return Err(ReactorError::PoolExhausted {
                    limit: self.max_channels,
                })
            }
        };
        let id = self.id_for(index);
        self.move_index(index, ChannelQueue::Initializing);
        Ok(id)
    }

    fn resolve(&self, id: ChannelId) -> ReactorResult<usize> {
        let index = id.index() as usize;
        match self.slots.get(index) {
            Some(slot)
                if id.reactor() == self.reactor
                    && slot.generation == id.generation()
                    && slot.queue != ChannelQueue::Pool =>
            {
                Ok(index)
            }
            _ => Err(ReactorError::UnknownChannel { channel: id }),
        }
    }

    pub fn get(&self, id: ChannelId) -> ReactorResult<&ChannelSlot> {
        let index = self.resolve(id)?;
        Ok(&self.slots[index])
    }

    pub fn get_mut(&mut self, id: ChannelId) -> ReactorResult<&mut ChannelSlot> {
        let index = self.resolve(id)?;
        Ok(&mut self.slots[index])
    }

    /// Live channel currently occupying `index`, if any
    pub fn id_at(&self, index: usize) -> Option<ChannelId> {
        let slot = self.slots.get(index)?;
        (slot.queue != ChannelQueue::Pool).then(|| self.id_for(index as u32))
    }

    fn move_index(&mut self, index: u32, queue: ChannelQueue) {
        let slot = &mut self.slots[index as usize];
        if slot.queue == queue {
            return;
        }
        self.queues[queue_index(slot.queue)].remove(&index);
        self.queues[queue_index(queue)].insert(index);
        slot.queue = queue;
    }

    pub fn move_to(&mut self, id: ChannelId, queue: ChannelQueue) -> ReactorResult<()> {
        let index = self.resolve(id)?;
        self.move_index(index as u32, queue);
        Ok(())
    }

    /// Return a slot to the pool with a new generation
    pub fn release(&mut self, id: ChannelId) -> ReactorResult<ChannelSlot> {
        let index = self.resolve(id)?;
        let generation = self.slots[index].generation.wrapping_add(1);
        self.move_index(index as u32, ChannelQueue::Pool);
        let mut old = std::mem::replace(&mut self.slots[index], ChannelSlot::blank(generation));
        old.queue = ChannelQueue::Pool;
        self.free.push_back(index as u32);
        Ok(old)
    }

    pub fn members(&self, queue: ChannelQueue) -> Vec<ChannelId> {
        let mut members: Vec<ChannelId> = self.queues[queue_index(queue)]
            .iter()
            .map(|index| self.id_for(*index))
            .collect();
        members.sort();
        members
    }

    pub fn count(&self, queue: ChannelQueue) -> usize {
        self.queues[queue_index(queue)].len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn info(&self, id: ChannelId) -> ReactorResult<ChannelInfo> {
        let slot = self.get(id)?;
        Ok(ChannelInfo {
            channel: id,
            queue: slot.queue,
            setup_state: slot.setup_state,
            connection_index: slot.connection_index,
            session: slot.session,
            write_pending: slot.write_again.is_some(),
            flush_requested: slot.requested_flush,
        })
    }

    /// Every live channel, for shutdown
    pub fn live_channels(&self) -> Vec<ChannelId> {
        QUEUES
            .iter()
            .filter(|queue| **queue != ChannelQueue::Pool)
            .flat_map(|queue| self.members(*queue))
            .collect()
    }
}
