use std::collections::HashMap;

use async_std::channel::Sender;
use satlink_codec::Value;
use satlink_utils::error_handle::ErrorUtils;

use crate::CmdError;

/// Which half of the id space a session allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Even ids.
    Host,
    /// Odd ids.
    Satellite,
}

impl Role {
    pub fn first_id(&self) -> u32 {
        match self {
            Role::Host => 2,
            Role::Satellite => 1,
        }
    }

    /// True if `id` belongs to this role's space.
    pub fn owns(&self, id: u32) -> bool {
        (id % 2 == 0) == (*self == Role::Host)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Satellite => "sat",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IterEvent {
    /// First reply with the accepted cadence.
    Started(u32),
    Item(u32, Value),
    /// The producer answered with a plain value instead of a stream.
    Single(Value),
    End,
    Error(CmdError),
}

pub(crate) enum Pending {
    Call(Sender<Result<Value, CmdError>>),
    Iter(Sender<IterEvent>),
}

/// Calls waiting for their reply, keyed by id.
pub(crate) struct PendingCalls {
    next_id: u32,
    slots: HashMap<u32, Pending>,
    closed: bool,
}

impl PendingCalls {
    pub fn new(role: Role) -> Self {
        Self {
            next_id: role.first_id(),
            slots: HashMap::new(),
            closed: false,
        }
    }

    /// Fails `ChannelClosed` once the table is closed. Ids still in use are skipped.
    pub fn alloc(&mut self, pending: Pending) -> Result<u32, CmdError> {
        if self.closed {
            return Err(CmdError::ChannelClosed);
        }
        let mut id = self.next_id;
        while self.slots.contains_key(&id) {
            id = id.wrapping_add(2);
        }
        self.next_id = id.wrapping_add(2);
        self.slots.insert(id, pending);
        Ok(id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Pending> {
        self.slots.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Pending> {
        self.slots.get(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Close the table and fail everything in it.
    pub fn fail_all(&mut self, err: CmdError) {
        self.closed = true;
        for (id, pending) in self.slots.drain() {
            log::debug!("[PendingCalls] fail {} with {}", id, err);
            match pending {
                Pending::Call(tx) => tx.try_send(Err(err.clone())).print_error("Should send call failure"),
                Pending::Iter(tx) => tx.try_send(IterEvent::Error(err.clone())).print_error("Should send iter failure"),
            }
        }
    }
}
