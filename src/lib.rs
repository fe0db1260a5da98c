//! Discrete-event simulation engine for queueing models.
//!
//! The engine advances a simulated clock by repeatedly dequeuing the
//! earliest-scheduled event from the future-event list, handing it back to
//! the driving script, and mutating the server pool in response to the
//! script's `request`/`release`/`schedule_relative` calls. Service and
//! inter-arrival times come from a deterministic multiplicative
//! congruential generator with 15 reproducible streams.

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

mod clock;
pub use clock::{RunState, SimulationClock, Step, TraceHook, Transition};

mod queue;
pub use queue::{Event, EventQueue};

mod resource;
pub use resource::{ReleaseOutcome, RequestOutcome, ResourcePool, Server};

mod stream;
pub use stream::{ranf_step, RandomStream, NUM_STREAMS};

/// Entity ID: identifies the simulated actor (e.g. a customer) associated
/// with an event or a resource acquisition.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct EntityId(usize);

/// Server ID: identifies one unit of the homogeneous resource pool.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct ServerId(usize);

/// Errors raised by the engine. All of them indicate a violation of the
/// calling contract; none is transient or recoverable, so callers are
/// expected to propagate them immediately.
#[derive(Debug, Clone, Copy, PartialEq, ThisError)]
pub enum Error {
    /// Stream number outside of the valid `1..=15` range.
    #[error("illegal random number generator stream: {stream} (valid streams are 1-15)")]
    InvalidStream {
        /// The rejected stream number.
        stream: u32,
    },

    /// Extraction from an empty event queue. A correctly driven loop
    /// checks the run state first, so hitting this is a programming error.
    #[error("cannot extract an event from an empty event queue")]
    EmptyQueue,

    /// Release called for an entity that holds no server.
    #[error("no server is reserved for entity {entity}")]
    NoMatchingServer {
        /// The entity the release was attempted for.
        entity: EntityId,
    },

    /// Negative (or NaN) delay passed to event scheduling.
    #[error("cannot schedule an event {delay} time units in the past")]
    NegativeDelay {
        /// The rejected delay.
        delay: f64,
    },

    /// Non-positive mean passed to exponential sampling.
    #[error("the mean of an exponential distribution must be positive, got {mean}")]
    NonPositiveMean {
        /// The rejected mean.
        mean: f64,
    },

    /// Non-positive simulation horizon passed at construction.
    #[error("the simulation horizon must be positive, got {horizon}")]
    NonPositiveHorizon {
        /// The rejected horizon.
        horizon: f64,
    },
}

/// Decides what happens after a freed server is handed over to a
/// backlogged entity: the policy produces the event kind and the service
/// delay of the completion event that the pool schedules on the entity's
/// behalf.
///
/// The stock policy, [`ExponentialService`], draws a fresh exponential
/// service time the way `smpl`'s release path does. Alternate policies
/// substitute without touching the pool's internals.
pub trait ServicePolicy<K> {
    /// Returns the completion event kind and the service time drawn for
    /// `entity`, which has just been assigned a server.
    ///
    /// # Errors
    ///
    /// Propagates sampling errors, e.g. a misconfigured distribution.
    fn next_completion(
        &mut self,
        entity: EntityId,
        stream: &mut RandomStream,
    ) -> Result<(K, f64), Error>;
}

/// Service policy drawing completion times from an exponential
/// distribution with a fixed mean, tagging them with a fixed event kind.
pub struct ExponentialService<K> {
    kind: K,
    mean: f64,
}

impl<K: Copy> ExponentialService<K> {
    /// Creates a policy scheduling completions of the given `kind` with
    /// exponentially distributed delays of the given `mean`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonPositiveMean`] if `mean` is not positive.
    pub fn new(kind: K, mean: f64) -> Result<Self, Error> {
        if mean > 0.0 {
            Ok(Self { kind, mean })
        } else {
            Err(Error::NonPositiveMean { mean })
        }
    }
}

impl<K: Copy> ServicePolicy<K> for ExponentialService<K> {
    fn next_completion(
        &mut self,
        _entity: EntityId,
        stream: &mut RandomStream,
    ) -> Result<(K, f64), Error> {
        Ok((self.kind, stream.exponential(self.mean)?))
    }
}
