use std::collections::VecDeque;
use std::num::NonZeroUsize;

use crate::{EntityId, Error, Event, EventQueue, RandomStream, ServerId, ServicePolicy};

/// One unit of the homogeneous resource pool, serving one entity at a
/// time. Owned exclusively by [`ResourcePool`]; created once at pool
/// initialization and never destroyed.
#[derive(Debug)]
pub struct Server {
    id: ServerId,
    occupant: Option<EntityId>,
    busy_since: f64,
    total_busy: f64,
}

impl Server {
    fn new(id: ServerId) -> Self {
        Self {
            id,
            occupant: None,
            busy_since: 0.0,
            total_busy: 0.0,
        }
    }

    /// The server's ID.
    #[must_use]
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The entity currently occupying the server, if any.
    #[must_use]
    pub fn occupant(&self) -> Option<EntityId> {
        self.occupant
    }

    /// Whether the server is currently occupied.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.occupant.is_some()
    }

    /// Total time the server has spent on completed occupancies. The
    /// occupancy in progress, if any, is not included until released.
    #[must_use]
    pub fn total_busy_time(&self) -> f64 {
        self.total_busy
    }
}

/// Outcome of a resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A free server was reserved for the requesting entity.
    Acquired {
        /// The server that was reserved.
        server: ServerId,
    },
    /// All servers were busy; the request joined the backlog.
    Enqueued {
        /// Backlog length after the entity joined it.
        backlog_len: usize,
    },
}

/// Outcome of a successful release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// The server that was freed.
    pub server: ServerId,
    /// The backlog head that was handed the freed server, if the backlog
    /// was non-empty.
    pub reassigned: Option<EntityId>,
}

/// A fixed set of identical servers with a FIFO backlog of blocked
/// requests.
///
/// The pool keeps two invariants: the busy count always equals the number
/// of occupied servers, and the backlog is only ever non-empty while every
/// server is busy. It also integrates the backlog length over time, which
/// is what the average-queue-length metric is computed from.
pub struct ResourcePool {
    servers: Vec<Server>,
    backlog: VecDeque<EntityId>,
    busy: usize,
    queue_integral: f64,
    last_change: f64,
}

impl ResourcePool {
    /// Creates a pool of `servers` free servers with an empty backlog.
    #[must_use]
    pub fn new(servers: NonZeroUsize) -> Self {
        Self {
            servers: (0..servers.get())
                .map(|id| Server::new(ServerId::from(id)))
                .collect(),
            backlog: VecDeque::new(),
            busy: 0,
            queue_integral: 0.0,
            last_change: 0.0,
        }
    }

    /// Reserves a server for `entity`, or appends the entity to the
    /// backlog when every server is busy.
    ///
    /// Servers are scanned in ascending ID order and the first free one is
    /// taken, so the choice is deterministic.
    pub fn request(&mut self, entity: EntityId, now: f64) -> RequestOutcome {
        if self.busy < self.servers.len() {
            let server = self
                .servers
                .iter_mut()
                .find(|server| !server.is_busy())
                .expect("busy count is lower than the server count");
            server.occupant = Some(entity);
            server.busy_since = now;
            let id = server.id;
            self.busy += 1;
            log::debug!("entity {} acquired server {} at {}", entity, id, now);
            RequestOutcome::Acquired { server: id }
        } else {
            self.accumulate_queue_time(now);
            self.backlog.push_back(entity);
            log::debug!(
                "entity {} blocked at {} (inq = {})",
                entity,
                now,
                self.backlog.len()
            );
            RequestOutcome::Enqueued {
                backlog_len: self.backlog.len(),
            }
        }
    }

    /// Frees the server occupied by `entity` and accumulates its busy
    /// time. If the backlog is non-empty, the head entity is dequeued and
    /// handed the just-freed server, and a completion event is scheduled
    /// for it right away, with the kind and delay produced by `policy`
    /// drawing from `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatchingServer`] if no server is occupied by
    /// `entity`; sampling errors from `policy` are propagated.
    pub fn release<K, P>(
        &mut self,
        entity: EntityId,
        now: f64,
        fel: &mut EventQueue<K>,
        stream: &mut RandomStream,
        policy: &mut P,
    ) -> Result<ReleaseOutcome, Error>
    where
        P: ServicePolicy<K> + ?Sized,
    {
        let index = self
            .servers
            .iter()
            .position(|server| server.occupant == Some(entity))
            .ok_or(Error::NoMatchingServer { entity })?;
        {
            let server = &mut self.servers[index];
            server.occupant = None;
            server.total_busy += now - server.busy_since;
        }
        self.busy -= 1;
        let id = self.servers[index].id;
        log::debug!("entity {} released server {} at {}", entity, id, now);

        let reassigned = if self.backlog.is_empty() {
            None
        } else {
            let next = *self.backlog.front().expect("backlog is non-empty");
            let (kind, delay) = policy.next_completion(next, stream)?;
            fel.insert(Event {
                kind,
                time: now + delay,
                entity: next,
            });
            self.accumulate_queue_time(now);
            self.backlog.pop_front();
            let server = &mut self.servers[index];
            server.occupant = Some(next);
            server.busy_since = now;
            self.busy += 1;
            log::debug!(
                "entity {} dequeued onto server {} at {} (inq = {})",
                next,
                id,
                now,
                self.backlog.len()
            );
            Some(next)
        };
        Ok(ReleaseOutcome {
            server: id,
            reassigned,
        })
    }

    /// Number of servers in the pool.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Number of currently occupied servers.
    #[must_use]
    pub fn busy_servers(&self) -> usize {
        self.busy
    }

    /// Number of entities waiting in the backlog.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// The servers, in ID order.
    #[must_use]
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Sum of the completed busy durations over all servers.
    #[must_use]
    pub fn total_busy_time(&self) -> f64 {
        self.servers.iter().map(Server::total_busy_time).sum()
    }

    /// The backlog length integrated over time, up to the last backlog
    /// change.
    #[must_use]
    pub fn queue_length_integral(&self) -> f64 {
        self.queue_integral
    }

    /// Folds the span since the last backlog change into the queue-length
    /// integral. Must run with the pre-change length, right before the
    /// backlog grows or shrinks.
    #[allow(clippy::cast_precision_loss)]
    fn accumulate_queue_time(&mut self, now: f64) {
        self.queue_integral += self.backlog.len() as f64 * (now - self.last_change);
        self.last_change = now;
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod test {
    use super::*;

    /// Schedules completions of kind `9` after a fixed delay.
    struct FixedService(f64);

    impl ServicePolicy<u8> for FixedService {
        fn next_completion(
            &mut self,
            _entity: EntityId,
            _stream: &mut RandomStream,
        ) -> Result<(u8, f64), Error> {
            Ok((9, self.0))
        }
    }

    fn pool(servers: usize) -> ResourcePool {
        ResourcePool::new(NonZeroUsize::new(servers).unwrap())
    }

    #[test]
    fn test_acquires_servers_in_ascending_id_order() {
        let mut pool = pool(3);
        for entity in 0..3 {
            assert_eq!(
                pool.request(EntityId::from(entity), 0.0),
                RequestOutcome::Acquired {
                    server: ServerId::from(entity)
                }
            );
        }
        assert_eq!(pool.busy_servers(), 3);
    }

    #[test]
    fn test_enqueues_when_all_servers_busy() {
        let mut pool = pool(2);
        pool.request(EntityId::from(1), 0.0);
        pool.request(EntityId::from(2), 0.0);
        assert_eq!(
            pool.request(EntityId::from(3), 1.0),
            RequestOutcome::Enqueued { backlog_len: 1 }
        );
        // Backlog non-empty implies every server is busy.
        assert_eq!(pool.busy_servers(), pool.server_count());
        assert_eq!(pool.backlog_len(), 1);
    }

    #[test]
    fn test_release_frees_server_and_accumulates_busy_time() {
        let mut pool = pool(1);
        let mut fel = EventQueue::<u8>::default();
        let mut stream = RandomStream::new(1).unwrap();
        let mut policy = FixedService(1.0);

        pool.request(EntityId::from(1), 2.0);
        let outcome = pool
            .release(EntityId::from(1), 5.0, &mut fel, &mut stream, &mut policy)
            .unwrap();
        assert_eq!(outcome.server, ServerId::from(0));
        assert_eq!(outcome.reassigned, None);
        assert_eq!(pool.busy_servers(), 0);
        assert_eq!(pool.total_busy_time(), 3.0);
        assert!(fel.is_empty());
    }

    #[test]
    fn test_release_without_matching_server_fails() {
        let mut pool = pool(1);
        let mut fel = EventQueue::<u8>::default();
        let mut stream = RandomStream::new(1).unwrap();
        let mut policy = FixedService(1.0);

        assert_eq!(
            pool.release(EntityId::from(8), 0.0, &mut fel, &mut stream, &mut policy)
                .err(),
            Some(Error::NoMatchingServer {
                entity: EntityId::from(8)
            })
        );
    }

    #[test]
    fn test_double_release_fails() {
        let mut pool = pool(1);
        let mut fel = EventQueue::<u8>::default();
        let mut stream = RandomStream::new(1).unwrap();
        let mut policy = FixedService(1.0);

        pool.request(EntityId::from(1), 0.0);
        pool.release(EntityId::from(1), 1.0, &mut fel, &mut stream, &mut policy)
            .unwrap();
        assert_eq!(
            pool.release(EntityId::from(1), 2.0, &mut fel, &mut stream, &mut policy)
                .err(),
            Some(Error::NoMatchingServer {
                entity: EntityId::from(1)
            })
        );
    }

    #[test]
    fn test_release_reassigns_backlog_head_and_schedules_completion() {
        let mut pool = pool(1);
        let mut fel = EventQueue::<u8>::default();
        let mut stream = RandomStream::new(1).unwrap();
        let mut policy = FixedService(2.5);

        pool.request(EntityId::from(1), 0.0);
        pool.request(EntityId::from(2), 1.0);
        pool.request(EntityId::from(3), 1.0);

        let outcome = pool
            .release(EntityId::from(1), 4.0, &mut fel, &mut stream, &mut policy)
            .unwrap();
        assert_eq!(outcome.reassigned, Some(EntityId::from(2)));
        assert_eq!(pool.busy_servers(), 1);
        assert_eq!(pool.backlog_len(), 1);
        assert_eq!(pool.servers()[0].occupant(), Some(EntityId::from(2)));

        let completion = fel.extract_min().unwrap();
        assert_eq!(completion.kind, 9);
        assert_eq!(completion.time, 6.5);
        assert_eq!(completion.entity, EntityId::from(2));
    }

    #[test]
    fn test_queue_length_integral_tracks_backlog_changes() {
        let mut pool = pool(1);
        let mut fel = EventQueue::<u8>::default();
        let mut stream = RandomStream::new(1).unwrap();
        let mut policy = FixedService(1.0);

        pool.request(EntityId::from(1), 0.0);
        // Backlog grows to 1 at t=1 and to 2 at t=2; the integral picks up
        // the pre-change length each time.
        pool.request(EntityId::from(2), 1.0);
        assert_eq!(pool.queue_length_integral(), 0.0);
        pool.request(EntityId::from(3), 2.0);
        assert_eq!(pool.queue_length_integral(), 1.0);
        // Two waiting over [2, 4] adds 4 more.
        pool.release(EntityId::from(1), 4.0, &mut fel, &mut stream, &mut policy)
            .unwrap();
        assert_eq!(pool.queue_length_integral(), 5.0);
    }
}
