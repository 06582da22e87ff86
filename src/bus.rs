//! Last-value-cached message bus shared by all federates.
//!
//! Channels are registered once, before the run starts; federates then
//! resolve names into handles, so a misspelled channel fails at startup
//! instead of mid-run. Each channel has exactly one producer (claiming a
//! publication twice is a configuration error) and any number of subscribers.
//!
//! # Visibility rule
//!
//! Every publish is tagged with the publisher's granted time. A read at time
//! `now` returns the newest value published *strictly before* `now`; a value
//! published at the same granted instant becomes visible at the reader's next
//! grant. With one publish per producer per step, one slot of history is
//! enough to make this exact. The rule is what makes concurrent federates
//! deterministic: no matter how threads interleave inside a granted instant,
//! every reader observes the same one-step-old value.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::coordinator::SimTime;
use crate::error::ConfigError;
use crate::grid::phasor::VoltagePhasor;

/// Well-known channel names shared by the built-in federates.
pub mod channel {
    /// PV supply signal (kW).
    pub const PV_OUTPUT: &str = "pv_output";
    /// Storage command (kW; positive = discharge, negative = charge).
    pub const ESS_OUTPUT: &str = "ess_output";

    /// Voltage channel name for a monitored bus.
    pub fn bus_voltage(id: &str) -> String {
        format!("bus_{id}_voltage")
    }
}

/// A value carried on a bus channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Scalar real measurement (kW, pu, ...).
    Scalar(f32),
    /// Complex bus voltage.
    Phasor(VoltagePhasor),
}

impl Value {
    /// Returns the scalar reading; a phasor collapses to its magnitude.
    pub fn scalar(self) -> f32 {
        match self {
            Value::Scalar(v) => v,
            Value::Phasor(p) => p.magnitude(),
        }
    }

    /// Returns the phasor reading, if this value is one.
    pub fn phasor(self) -> Option<VoltagePhasor> {
        match self {
            Value::Scalar(_) => None,
            Value::Phasor(p) => Some(p),
        }
    }
}

/// Producer-side handle to a channel.
#[derive(Debug, Clone, Copy)]
pub struct Publication {
    channel: usize,
}

/// Subscriber-side handle to a channel, with a private update flag slot.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    channel: usize,
    slot: usize,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: Value,
    time: SimTime,
    seq: u64,
}

struct Channel {
    name: String,
    default: Value,
    curr: Option<Slot>,
    prev: Option<Slot>,
    seq: u64,
    claimed: bool,
    /// Per-subscriber last consumed sequence number.
    last_seen: Vec<u64>,
}

impl Channel {
    /// Newest slot published strictly before `now`.
    fn visible(&self, now: SimTime) -> Option<Slot> {
        match (self.curr, self.prev) {
            (Some(c), _) if c.time < now => Some(c),
            (_, Some(p)) if p.time < now => Some(p),
            _ => None,
        }
    }
}

struct Inner {
    channels: Vec<Channel>,
    index: HashMap<String, usize>,
}

/// The shared bus. One coarse lock; contention is one access per federate
/// per step.
pub struct Bus {
    inner: RwLock<Inner>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                channels: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Registers a channel with its default value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateChannel`] if the name is taken.
    pub fn register(&self, name: &str, default: Value) -> Result<(), ConfigError> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(name) {
            return Err(ConfigError::DuplicateChannel {
                name: name.to_string(),
            });
        }
        let idx = inner.channels.len();
        inner.channels.push(Channel {
            name: name.to_string(),
            default,
            curr: None,
            prev: None,
            seq: 0,
            claimed: false,
            last_seen: Vec::new(),
        });
        inner.index.insert(name.to_string(), idx);
        Ok(())
    }

    /// Claims the producer side of a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownChannel`] for an unregistered name and
    /// [`ConfigError::DuplicatePublisher`] if the channel already has a
    /// producer.
    pub fn publisher(&self, name: &str) -> Result<Publication, ConfigError> {
        let mut inner = self.inner.write();
        let idx = *inner
            .index
            .get(name)
            .ok_or_else(|| ConfigError::UnknownChannel {
                name: name.to_string(),
            })?;
        let ch = &mut inner.channels[idx];
        if ch.claimed {
            return Err(ConfigError::DuplicatePublisher {
                name: ch.name.clone(),
            });
        }
        ch.claimed = true;
        Ok(Publication { channel: idx })
    }

    /// Opens a subscription on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownChannel`] for an unregistered name.
    pub fn subscriber(&self, name: &str) -> Result<Subscription, ConfigError> {
        let mut inner = self.inner.write();
        let idx = *inner
            .index
            .get(name)
            .ok_or_else(|| ConfigError::UnknownChannel {
                name: name.to_string(),
            })?;
        let ch = &mut inner.channels[idx];
        ch.last_seen.push(0);
        Ok(Subscription {
            channel: idx,
            slot: ch.last_seen.len() - 1,
        })
    }

    /// Publishes `value` on the channel at granted time `time`, overwriting
    /// the current value. A republish at the same instant overwrites in
    /// place; publishing at a later instant rotates the old value into the
    /// history slot.
    pub fn publish(&self, p: Publication, time: SimTime, value: Value) {
        let mut inner = self.inner.write();
        let ch = &mut inner.channels[p.channel];
        ch.seq += 1;
        let slot = Slot {
            value,
            time,
            seq: ch.seq,
        };
        match ch.curr {
            Some(c) if c.time < time => {
                ch.prev = ch.curr;
                ch.curr = Some(slot);
            }
            _ => ch.curr = Some(slot),
        }
    }

    /// Returns the newest value visible at time `now`, or the channel
    /// default if nothing has been published before `now`. Pure: does not
    /// touch the subscriber's update flag.
    pub fn read(&self, s: Subscription, now: SimTime) -> Value {
        let inner = self.inner.read();
        let ch = &inner.channels[s.channel];
        ch.visible(now).map(|slot| slot.value).unwrap_or(ch.default)
    }

    /// Returns whether the visible value changed since this subscriber's
    /// last check, and clears the flag for this subscriber only.
    pub fn consume_updated(&self, s: Subscription, now: SimTime) -> bool {
        let mut inner = self.inner.write();
        let ch = &mut inner.channels[s.channel];
        let seq = ch.visible(now).map(|slot| slot.seq).unwrap_or(0);
        let seen = &mut ch.last_seen[s.slot];
        let updated = seq > *seen;
        *seen = seq;
        updated
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
