//! Message types and lease state for the queue.
//!
//! A message never carries an explicit status column. Its state is derived from
//! three fields, `deleted`, `ack` and `visible`, evaluated against "now":
//!
//! | state       | `deleted` | `ack` | `visible`  |
//! |-------------|-----------|-------|------------|
//! | `Done`      | set       | any   | any        |
//! | `Claimable` | unset     | any   | `<= now`   |
//! | `InFlight`  | unset     | set   | `> now`    |
//! | `Delayed`   | unset     | unset | `> now`    |
//!
//! An expired lease needs no cleanup. Once `visible` passes, the message is
//! claimable again and the next successful claim overwrites `ack`.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Derived lifecycle state of a [`Message`] at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageState {
    /// Live and visible; the next `get` may claim it
    Claimable,
    /// Live, never claimed, and not yet visible
    Delayed,
    /// Claimed under a lease that has not yet expired
    InFlight,
    /// Acknowledged; never claimable again
    Done,
}

/// One document in a queue collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Deduplication identity, unique within a collection
    pub key: String,
    /// Caller data, opaque to the queue
    pub payload: Value,
    /// Earliest instant at which the message may be claimed
    pub visible: DateTime<Utc>,
    /// Token of the current (or most recent) lease
    pub ack: Option<String>,
    /// Number of successful claims
    pub tries: u64,
    /// Completion instant; once set it is never cleared
    pub deleted: Option<DateTime<Utc>>,
}

impl Message {
    /// A fresh, never-claimed message.
    pub fn new(key: impl Into<String>, payload: Value, visible: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            payload,
            visible,
            ack: None,
            tries: 0,
            deleted: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.deleted.is_none() && self.visible <= now
    }

    pub fn is_in_flight(&self, now: DateTime<Utc>) -> bool {
        self.deleted.is_none() && self.ack.is_some() && self.visible > now
    }

    pub fn is_done(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn state(&self, now: DateTime<Utc>) -> MessageState {
        if self.is_done() {
            MessageState::Done
        } else if self.is_claimable(now) {
            MessageState::Claimable
        } else if self.is_in_flight(now) {
            MessageState::InFlight
        } else {
            MessageState::Delayed
        }
    }
}

/// When newly added messages become visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative to the moment of `add`
    After(TimeDelta),
    /// A fixed instant, used verbatim for every message
    Until(DateTime<Utc>),
}

impl Delay {
    /// Messages are visible as soon as they are added.
    pub fn none() -> Self {
        Self::After(TimeDelta::zero())
    }

    /// Fails with [`Error::InvalidArgument`] when the delay pushes past the
    /// representable range.
    pub fn visible_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        match self {
            Delay::After(delta) => now
                .checked_add_signed(*delta)
                .ok_or_else(|| Error::invalid_argument(format!("delay out of range: {delta}"))),
            Delay::Until(at) => Ok(*at),
        }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn states_are_mutually_exclusive() {
        let now = at(0);
        let mut msg = Message::new("a", Value::Null, now);
        assert_eq!(msg.state(now), MessageState::Claimable);
        assert!(!msg.is_in_flight(now));

        msg.ack = Some("token".to_owned());
        msg.visible = at(30);
        assert_eq!(msg.state(now), MessageState::InFlight);
        assert!(!msg.is_claimable(now));

        // Lease expiry: same record, later instant.
        assert_eq!(msg.state(at(30)), MessageState::Claimable);

        msg.deleted = Some(now);
        assert_eq!(msg.state(now), MessageState::Done);
        assert_eq!(msg.state(at(60)), MessageState::Done);
        assert!(!msg.is_claimable(at(60)));
    }

    #[test]
    fn delayed_message_is_neither_claimable_nor_in_flight() {
        let msg = Message::new("a", Value::Null, at(5));
        assert_eq!(msg.state(at(0)), MessageState::Delayed);
        assert!(!msg.is_claimable(at(0)));
        assert!(!msg.is_in_flight(at(0)));
        assert!(msg.is_claimable(at(5)));
    }

    #[test]
    fn delay_visibility() {
        let now = at(0);
        assert_eq!(Delay::none().visible_from(now).unwrap(), now);
        assert_eq!(
            Delay::After(TimeDelta::seconds(3)).visible_from(now).unwrap(),
            at(3)
        );
        assert_eq!(Delay::Until(at(99)).visible_from(now).unwrap(), at(99));
    }

    #[test]
    fn oversized_delay_is_an_error() {
        let delay = Delay::After(TimeDelta::try_seconds(9_000_000_000_000).unwrap());
        assert!(matches!(
            delay.visible_from(at(0)),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn state_display() {
        assert_eq!(MessageState::InFlight.to_string(), "in_flight");
    }
}
