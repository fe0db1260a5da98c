use std::fmt;
use std::num::NonZeroUsize;

use delegate::delegate;

use crate::{
    EntityId, Error, Event, EventQueue, RandomStream, RequestOutcome, ResourcePool, ServerId,
    ServicePolicy,
};

/// The two states of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The clock has not passed the horizon and events are pending.
    Running,
    /// The clock passed the horizon, or no events are pending.
    Halted,
}

/// Result of one clock advance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step<K> {
    /// The earliest pending event; the clock now stands at its time.
    Event(Event<K>),
    /// The run is over; nothing was dequeued.
    Halted,
}

/// A notable transition reported to the trace hook.
///
/// The engine itself never writes trace output; the caller decides
/// formatting and destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition<K> {
    /// An event was dequeued and the clock advanced to its time.
    Caused {
        /// The dequeued event's kind.
        kind: K,
        /// The dequeued event's entity.
        entity: EntityId,
        /// The new clock time.
        time: f64,
    },
    /// A requesting entity was handed a free server.
    Acquired {
        /// The requesting entity.
        entity: EntityId,
        /// The server it acquired.
        server: ServerId,
        /// The clock time of the acquisition.
        time: f64,
    },
    /// A requesting entity found every server busy and joined the backlog.
    Enqueued {
        /// The blocked entity.
        entity: EntityId,
        /// Backlog length including the entity.
        backlog_len: usize,
        /// The clock time of the enqueue.
        time: f64,
    },
    /// A backlogged entity was dequeued onto a just-freed server.
    Reassigned {
        /// The dequeued entity.
        entity: EntityId,
        /// The server it was handed.
        server: ServerId,
        /// Backlog length after the dequeue.
        backlog_len: usize,
        /// The clock time of the reassignment.
        time: f64,
    },
    /// An entity released its server.
    Released {
        /// The releasing entity.
        entity: EntityId,
        /// The freed server.
        server: ServerId,
        /// The clock time of the release.
        time: f64,
    },
}

/// Callback invoked with every notable transition of the run.
pub type TraceHook<K> = Box<dyn FnMut(Transition<K>)>;

/// Owns the simulation time and drives the event loop over the
/// future-event list and the resource pool.
///
/// The clock does not interpret event kinds: the caller repeatedly invokes
/// [`advance`](Self::advance), receives the earliest event back, and
/// decides by its kind whether to call [`request`](Self::request),
/// [`release`](Self::release), or
/// [`schedule_relative`](Self::schedule_relative). This is the seam where
/// the model script plugs in.
pub struct SimulationClock<K, P> {
    now: f64,
    horizon: f64,
    fel: EventQueue<K>,
    pool: ResourcePool,
    stream: RandomStream,
    policy: P,
    releases: u64,
    queue_exits: u64,
    trace: Option<TraceHook<K>>,
}

impl<K, P> SimulationClock<K, P>
where
    K: Copy + fmt::Debug,
    P: ServicePolicy<K>,
{
    /// Creates a halted-at-zero clock over a fresh pool of `servers`
    /// servers, with the generator positioned at the start of `stream`.
    /// The run lasts until the clock passes `horizon` or runs out of
    /// events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonPositiveHorizon`] if `horizon <= 0` (metric
    /// ratios divide by it), and [`Error::InvalidStream`] unless
    /// `1 <= stream <= 15`.
    pub fn new(horizon: f64, servers: NonZeroUsize, stream: u32, policy: P) -> Result<Self, Error> {
        if horizon > 0.0 {
            Ok(Self {
                now: 0.0,
                horizon,
                fel: EventQueue::default(),
                pool: ResourcePool::new(servers),
                stream: RandomStream::new(stream)?,
                policy,
                releases: 0,
                queue_exits: 0,
                trace: None,
            })
        } else {
            Err(Error::NonPositiveHorizon { horizon })
        }
    }

    /// Registers a callback invoked with every notable transition:
    /// event dispatch, server acquisition, enqueue, dequeue, and release.
    pub fn trace_hook(mut self, hook: TraceHook<K>) -> Self {
        self.trace = Some(hook);
        self
    }

    /// The current simulation time. This value only changes when
    /// [`advance`](Self::advance) dequeues an event.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.now
    }

    /// The configured simulation horizon.
    #[must_use]
    pub fn horizon(&self) -> f64 {
        self.horizon
    }

    /// Whether the run is still going.
    #[must_use]
    pub fn state(&self) -> RunState {
        if self.now <= self.horizon && !self.fel.is_empty() {
            RunState::Running
        } else {
            RunState::Halted
        }
    }

    /// Dequeues the earliest pending event, advances the clock to its
    /// time, and returns it for interpretation by the caller.
    ///
    /// An event scheduled beyond the horizon is still delivered once (the
    /// clock jumps past the horizon); the advance after it halts. Once
    /// halted, every further call returns [`Step::Halted`].
    pub fn advance(&mut self) -> Step<K> {
        if self.state() == RunState::Halted {
            return Step::Halted;
        }
        let event = self
            .fel
            .extract_min()
            .expect("running state implies a non-empty queue");
        self.now = event.time;
        log::trace!(
            "caused {:?} for entity {} at {}",
            event.kind,
            event.entity,
            self.now
        );
        self.emit(Transition::Caused {
            kind: event.kind,
            entity: event.entity,
            time: event.time,
        });
        Step::Event(event)
    }

    /// Schedules an event of the given kind for `entity`, `delay` time
    /// units from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NegativeDelay`] if `delay` is negative or NaN.
    /// This is what keeps the event list ahead of the clock.
    pub fn schedule_relative(&mut self, kind: K, delay: f64, entity: EntityId) -> Result<(), Error> {
        if delay >= 0.0 {
            self.fel.insert(Event {
                kind,
                time: self.now + delay,
                entity,
            });
            Ok(())
        } else {
            Err(Error::NegativeDelay { delay })
        }
    }

    /// Requests a server for `entity`: either a free server is reserved,
    /// or the entity joins the backlog.
    pub fn request(&mut self, entity: EntityId) -> RequestOutcome {
        let outcome = self.pool.request(entity, self.now);
        match outcome {
            RequestOutcome::Acquired { server } => self.emit(Transition::Acquired {
                entity,
                server,
                time: self.now,
            }),
            RequestOutcome::Enqueued { backlog_len } => self.emit(Transition::Enqueued {
                entity,
                backlog_len,
                time: self.now,
            }),
        }
        outcome
    }

    /// Releases the server occupied by `entity`. If requests are blocked,
    /// the backlog head is handed the freed server and a completion event
    /// is scheduled for it through the service policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatchingServer`] if `entity` holds no server;
    /// sampling errors from the policy are propagated.
    pub fn release(&mut self, entity: EntityId) -> Result<(), Error> {
        let outcome = self.pool.release(
            entity,
            self.now,
            &mut self.fel,
            &mut self.stream,
            &mut self.policy,
        )?;
        self.releases += 1;
        self.emit(Transition::Released {
            entity,
            server: outcome.server,
            time: self.now,
        });
        if let Some(next) = outcome.reassigned {
            self.queue_exits += 1;
            let backlog_len = self.pool.backlog_len();
            self.emit(Transition::Reassigned {
                entity: next,
                server: outcome.server,
                backlog_len,
                time: self.now,
            });
        }
        Ok(())
    }

    /// The random stream the run draws from; the model script uses this
    /// for its own inter-arrival and service samples.
    pub fn stream_mut(&mut self) -> &mut RandomStream {
        &mut self.stream
    }

    /// Repositions the generator at the start of the given stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStream`] unless `1 <= stream <= 15`.
    pub fn select_stream(&mut self, stream: u32) -> Result<(), Error> {
        self.stream.select_stream(stream)
    }

    /// The pool underneath, for inspection.
    #[must_use]
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Fraction of the horizon the servers spent busy, summed over
    /// servers (so a fully loaded pool of two reports 2.0).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.pool.total_busy_time() / self.horizon
    }

    /// Mean completed busy duration per release, or 0 before the first
    /// release.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_busy_time(&self) -> f64 {
        if self.releases == 0 {
            0.0
        } else {
            self.pool.total_busy_time() / self.releases as f64
        }
    }

    /// Time-average backlog length over the horizon.
    #[must_use]
    pub fn average_queue_length(&self) -> f64 {
        self.pool.queue_length_integral() / self.horizon
    }

    /// Number of completed releases.
    #[must_use]
    pub fn release_count(&self) -> u64 {
        self.releases
    }

    /// Number of entities that left the backlog by being handed a freed
    /// server.
    #[must_use]
    pub fn queue_exit_count(&self) -> u64 {
        self.queue_exits
    }

    delegate! {
        to self.pool {
            /// Number of servers in the pool.
            #[must_use]
            pub fn server_count(&self) -> usize;
            /// Number of currently occupied servers.
            #[must_use]
            pub fn busy_servers(&self) -> usize;
            /// Number of entities waiting in the backlog.
            #[must_use]
            pub fn backlog_len(&self) -> usize;
        }
    }

    fn emit(&mut self, transition: Transition<K>) {
        if let Some(hook) = &mut self.trace {
            hook(transition);
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Schedules completions of kind `2` after a fixed delay.
    struct FixedService(f64);

    impl ServicePolicy<u8> for FixedService {
        fn next_completion(
            &mut self,
            _entity: EntityId,
            _stream: &mut RandomStream,
        ) -> Result<(u8, f64), Error> {
            Ok((2, self.0))
        }
    }

    fn clock(horizon: f64, servers: usize) -> SimulationClock<u8, FixedService> {
        SimulationClock::new(
            horizon,
            NonZeroUsize::new(servers).unwrap(),
            1,
            FixedService(1.0),
        )
        .unwrap()
    }

    fn entity(id: usize) -> EntityId {
        EntityId::from(id)
    }

    #[test]
    fn test_rejects_non_positive_horizon() {
        let result = SimulationClock::new(0.0, NonZeroUsize::new(1).unwrap(), 1, FixedService(1.0));
        assert_eq!(
            result.err(),
            Some(Error::NonPositiveHorizon { horizon: 0.0 })
        );
    }

    #[test]
    fn test_rejects_invalid_stream() {
        let result =
            SimulationClock::new(10.0, NonZeroUsize::new(1).unwrap(), 16, FixedService(1.0));
        assert_eq!(result.err(), Some(Error::InvalidStream { stream: 16 }));
    }

    #[test]
    fn test_starts_halted_with_empty_queue() {
        let mut clock = clock(10.0, 1);
        assert_eq!(clock.state(), RunState::Halted);
        assert_eq!(clock.advance(), Step::Halted);
    }

    #[test]
    fn test_advance_delivers_events_in_time_order() {
        let mut clock = clock(10.0, 1);
        clock.schedule_relative(1, 3.0, entity(1)).unwrap();
        clock.schedule_relative(2, 1.0, entity(2)).unwrap();

        let first = match clock.advance() {
            Step::Event(event) => event,
            Step::Halted => panic!("expected an event"),
        };
        assert_eq!((first.kind, first.time), (2, 1.0));
        assert_eq!(clock.now(), 1.0);

        let second = match clock.advance() {
            Step::Event(event) => event,
            Step::Halted => panic!("expected an event"),
        };
        assert_eq!((second.kind, second.time), (1, 3.0));
        assert_eq!(clock.now(), 3.0);
    }

    #[test]
    fn test_now_is_non_decreasing() {
        let mut clock = clock(100.0, 1);
        for i in 0..10 {
            clock.schedule_relative(0, f64::from(i), entity(1)).unwrap();
        }
        let mut last = clock.now();
        while let Step::Event(_) = clock.advance() {
            assert!(clock.now() >= last);
            last = clock.now();
        }
    }

    #[test]
    fn test_rejects_negative_and_nan_delays() {
        let mut clock = clock(10.0, 1);
        assert_eq!(
            clock.schedule_relative(0, -0.5, entity(1)).err(),
            Some(Error::NegativeDelay { delay: -0.5 })
        );
        assert!(matches!(
            clock.schedule_relative(0, f64::NAN, entity(1)),
            Err(Error::NegativeDelay { .. })
        ));
    }

    #[test]
    fn test_event_beyond_horizon_is_delivered_once_then_halts() {
        let mut clock = clock(10.0, 1);
        clock.schedule_relative(7, 15.0, entity(1)).unwrap();
        clock.schedule_relative(8, 20.0, entity(2)).unwrap();

        match clock.advance() {
            Step::Event(event) => assert_eq!(event.kind, 7),
            Step::Halted => panic!("the first event past the horizon is still delivered"),
        }
        assert!(clock.now() > clock.horizon());
        assert_eq!(clock.state(), RunState::Halted);
        assert_eq!(clock.advance(), Step::Halted);
    }

    #[test]
    fn test_release_updates_counters() {
        let mut clock = clock(10.0, 1);
        clock.request(entity(1));
        clock.request(entity(2));
        assert_eq!(clock.release_count(), 0);

        clock.release(entity(1)).unwrap();
        assert_eq!(clock.release_count(), 1);
        assert_eq!(clock.queue_exit_count(), 1);
        assert_eq!(clock.busy_servers(), 1);

        clock.release(entity(2)).unwrap();
        assert_eq!(clock.release_count(), 2);
        assert_eq!(clock.queue_exit_count(), 1);
        assert_eq!(clock.busy_servers(), 0);
    }

    #[test]
    fn test_mean_busy_time_is_zero_before_first_release() {
        let clock = clock(10.0, 1);
        assert_eq!(clock.mean_busy_time(), 0.0);
    }

    #[test]
    fn test_utilization_of_non_overlapping_occupancies() {
        let mut clock = clock(10.0, 1);
        // Request at 1, release at 3; request at 5, release at 9.
        clock.schedule_relative(0, 1.0, entity(1)).unwrap();
        clock.schedule_relative(1, 3.0, entity(1)).unwrap();
        clock.schedule_relative(0, 5.0, entity(2)).unwrap();
        clock.schedule_relative(1, 9.0, entity(2)).unwrap();

        while let Step::Event(event) = clock.advance() {
            match event.kind {
                0 => {
                    clock.request(event.entity);
                }
                _ => clock.release(event.entity).unwrap(),
            }
        }

        assert_eq!(clock.utilization(), 0.6);
        assert_eq!(clock.mean_busy_time(), 3.0);
        assert_eq!(clock.average_queue_length(), 0.0);
        assert_eq!(clock.release_count(), 2);
        assert_eq!(clock.queue_exit_count(), 0);
    }

    #[test]
    fn test_trace_hook_sees_every_transition() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut clock = SimulationClock::new(
            10.0,
            NonZeroUsize::new(1).unwrap(),
            1,
            FixedService(1.0),
        )
        .unwrap()
        .trace_hook(Box::new(move |transition| {
            sink.borrow_mut().push(transition);
        }));

        clock.schedule_relative(0, 2.0, entity(1)).unwrap();
        match clock.advance() {
            Step::Event(event) => {
                clock.request(event.entity);
            }
            Step::Halted => panic!("expected an event"),
        }
        clock.request(entity(2));
        clock.release(entity(1)).unwrap();

        let seen = seen.borrow();
        assert_eq!(
            *seen,
            vec![
                Transition::Caused {
                    kind: 0,
                    entity: entity(1),
                    time: 2.0
                },
                Transition::Acquired {
                    entity: entity(1),
                    server: ServerId::from(0),
                    time: 2.0
                },
                Transition::Enqueued {
                    entity: entity(2),
                    backlog_len: 1,
                    time: 2.0
                },
                Transition::Released {
                    entity: entity(1),
                    server: ServerId::from(0),
                    time: 2.0
                },
                Transition::Reassigned {
                    entity: entity(2),
                    server: ServerId::from(0),
                    backlog_len: 0,
                    time: 2.0
                },
            ]
        );
    }
}
