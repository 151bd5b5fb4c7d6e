//! Single-threaded, `mio`-backed reactor. Phases per iteration: timers →
//! pending I/O → poll → check → idle → closing. User callbacks fire only
//! in the timer and I/O phases; object frees happen only in the idle
//! phase, after the kernel has released the descriptor — mirroring the
//! original's libuv idle-handle deferred-deletion discipline.

use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use crate::dns::{PairId, RequestId};
use crate::flow::{CandidateId, FlowId};
use crate::pm::PmClient;

/// Which component a registered `Token` belongs to, so the central
/// dispatch loop can route a readiness event without every component
/// maintaining its own `Token` bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    ResolverPair(RequestId, PairId),
    Pm(u64),
    FlowCandidate(FlowId, CandidateId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ResolverT1(RequestId),
    ResolverT2(RequestId),
    ResolverLiteral(RequestId),
}

#[derive(Debug)]
pub enum ReactorEvent {
    Readable(Owner),
    Writable(Owner),
    TimerFired(TimerKind),
}

/// What to do once `run`/`run_once` returns control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Block until at least one event fires, repeat until stopped.
    Default,
    /// Process one pending batch of events then return, blocking if none
    /// are pending.
    Once,
    /// Process whatever is immediately available, never blocking.
    NoWait,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    next_token: usize,
    tokens: HashMap<Token, Owner>,
    timers: Vec<(Instant, TimerKind)>,
    to_delete: Vec<Box<dyn FnOnce()>>,
    stopped: bool,
    pm_clients: HashMap<u64, (Token, PmClient)>,
    next_pm_id: u64,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            next_token: 1,
            tokens: HashMap::new(),
            timers: Vec::new(),
            to_delete: Vec::new(),
            stopped: false,
            pm_clients: HashMap::new(),
            next_pm_id: 0,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers any `mio`-native I/O source, binding the resulting token
    /// to `owner` for dispatch.
    pub fn register(
        &mut self,
        source: &mut dyn mio::event::Source,
        interest: Interest,
        owner: Owner,
    ) -> io::Result<Token> {
        let token = self.alloc_token();
        self.poll.registry().register(source, token, interest)?;
        self.tokens.insert(token, owner);
        Ok(token)
    }

    pub fn deregister(&mut self, token: Token, source: &mut dyn mio::event::Source) {
        let _ = self.poll.registry().deregister(source);
        self.tokens.remove(&token);
    }

    /// Updates the owner bound to an already-registered token. Used when
    /// the identifying ids (e.g. a freshly-allocated `PairId`) aren't
    /// known until just after registration.
    pub fn rebind(&mut self, token: Token, owner: Owner) {
        self.tokens.insert(token, owner);
    }

    pub fn schedule_timer(&mut self, at: Instant, kind: TimerKind) {
        self.timers.push((at, kind));
    }

    /// Cancels every pending timer belonging to a given request (used when
    /// the `t1`→`t2` transition supersedes the overall deadline, and when a
    /// request completes early).
    pub fn cancel_timers_for_request(&mut self, id: RequestId) {
        self.timers.retain(|(_, kind)| {
            !matches!(
                kind,
                TimerKind::ResolverT1(r) | TimerKind::ResolverT2(r) | TimerKind::ResolverLiteral(r)
                    if *r == id
            )
        });
    }

    /// Places a cleanup closure on the deferred-delete list; it runs in
    /// the idle phase of a later iteration, never synchronously with the
    /// I/O callback that triggered it.
    pub fn defer_delete(&mut self, cleanup: impl FnOnce() + 'static) {
        self.to_delete.push(Box::new(cleanup));
    }

    pub fn register_pm(&mut self, client: PmClient) -> io::Result<u64> {
        let id = self.next_pm_id;
        self.next_pm_id += 1;
        let mut client = client;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(client.stream(), token, Interest::READABLE | Interest::WRITABLE)?;
        self.tokens.insert(token, Owner::Pm(id));
        self.pm_clients.insert(id, (token, client));
        Ok(id)
    }

    pub fn pm_client_mut(&mut self, id: u64) -> Option<&mut PmClient> {
        self.pm_clients.get_mut(&id).map(|(_, client)| client)
    }

    /// Deregisters the PM client's token immediately, then defers the
    /// actual socket close to the idle phase, matching the teardown
    /// discipline resolver pairs follow.
    pub fn remove_pm(&mut self, id: u64) {
        let Some((token, mut client)) = self.pm_clients.remove(&id) else {
            return;
        };
        let _ = self.poll.registry().deregister(client.stream());
        self.tokens.remove(&token);
        self.defer_delete(move || drop(client));
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(at, _)| *at).min()
    }

    fn pop_due_timers(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        self.timers.retain(|(at, kind)| {
            if *at <= now {
                due.push(*kind);
                false
            } else {
                true
            }
        });
        due
    }

    /// Runs one iteration: timers, pending I/O poll, idle cleanup. Returns
    /// the events collected so the caller (`Context`) can dispatch them.
    pub fn run_once(&mut self, mode: RunMode) -> io::Result<Vec<ReactorEvent>> {
        let mut out = Vec::new();
        let now = Instant::now();

        for kind in self.pop_due_timers(now) {
            out.push(ReactorEvent::TimerFired(kind));
        }

        let timeout = match mode {
            RunMode::NoWait => Some(Duration::from_secs(0)),
            RunMode::Once | RunMode::Default => self
                .next_timer_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now())),
        };

        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            let Some(&owner) = self.tokens.get(&event.token()) else {
                continue;
            };
            if event.is_readable() {
                out.push(ReactorEvent::Readable(owner));
            }
            if event.is_writable() {
                out.push(ReactorEvent::Writable(owner));
            }
        }

        // Idle phase: free everything whose kernel handle has already
        // been released by the deregister that queued it.
        for cleanup in self.to_delete.drain(..) {
            cleanup();
        }

        Ok(out)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
