//! Flow State Machine: `IDLE → RESOLVING → CONNECTING → OPEN → CLOSING →
//! CLOSED`, with happy-eyeballs-style concurrent candidate dialing.
//!
//! Wire-level transport protocols are an explicit Non-goal of this core;
//! dialing is abstracted behind [`TransportDialer`], a seam a caller fills
//! in with real TCP/SCTP/UDP/UDP-Lite connectors. Tests here use a fake
//! that resolves immediately.

use crate::dns::ResolvedAddr;
use crate::error::{Error, Result};
use crate::property::PropertyDocument;
use std::net::{IpAddr, SocketAddr};
use std::task::Poll;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandidateId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Tcp = 1,
    Sctp = 2,
    Udp = 3,
    UdpLite = 4,
    SctpUdp = 5,
}

impl Stack {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TCP" => Some(Stack::Tcp),
            "SCTP" => Some(Stack::Sctp),
            "UDP" => Some(Stack::Udp),
            "UDPLITE" => Some(Stack::UdpLite),
            "SCTP_UDP" => Some(Stack::SctpUdp),
            _ => None,
        }
    }
}

/// A `(source, destination, stack)` triple eligible for a parallel
/// connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: CandidateId,
    pub source: IpAddr,
    pub dest: SocketAddr,
    pub stack: Stack,
    pub internal: bool,
}

/// A connected transport-stack duplex. Real bindings wrap an actual
/// TCP/SCTP/UDP/UDP-Lite socket; `read`/`write` follow the same
/// `WouldBlock`-on-no-progress convention as `std::io::Read`/`Write`.
pub trait Duplex {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    /// Whether at least one byte is currently available to read.
    fn is_readable(&mut self) -> bool;
    /// Whether the send window currently has room for a write.
    fn is_writable(&mut self) -> bool;
}

/// Pluggable connector for one candidate. A real binding implements this
/// against an actual TCP/SCTP/UDP/UDP-Lite socket; this core only drives
/// the state machine around whatever the implementation reports.
pub trait TransportDialer {
    fn try_connect(&mut self, candidate: &Candidate) -> Poll<std::io::Result<Box<dyn Duplex>>>;
    fn abandon(&mut self, candidate: &Candidate);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Resolving,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

pub struct Callbacks {
    pub on_connected: Option<Box<dyn FnMut(Stack)>>,
    pub on_readable: Option<Box<dyn FnMut()>>,
    pub on_writable: Option<Box<dyn FnMut()>>,
    pub on_close: Option<Box<dyn FnMut()>>,
    pub on_error: Option<Box<dyn FnMut(&Error)>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connected: None,
            on_readable: None,
            on_writable: None,
            on_close: None,
            on_error: None,
        }
    }
}

pub struct Flow {
    pub id: FlowId,
    pub properties: PropertyDocument,
    pub state: FlowState,
    pub candidates: Vec<Candidate>,
    pub chosen: Option<Candidate>,
    pub conn: Option<Box<dyn Duplex>>,
    pub callbacks: Callbacks,
    next_candidate_id: u64,
    closed_emitted: bool,
    readable_notified: bool,
}

impl Flow {
    pub fn new(id: FlowId, properties: PropertyDocument) -> Self {
        Self {
            id,
            properties,
            state: FlowState::Idle,
            candidates: Vec::new(),
            chosen: None,
            conn: None,
            callbacks: Callbacks::default(),
            next_candidate_id: 0,
            closed_emitted: false,
            readable_notified: false,
        }
    }

    /// `open()`: IDLE → RESOLVING. The actual DNS request is issued by the
    /// caller (`Context::open`), which owns the resolver; this just
    /// records the transition.
    pub fn begin_resolving(&mut self) -> Result<()> {
        if self.state != FlowState::Idle {
            return Err(Error::Internal("open() called outside IDLE"));
        }
        self.state = FlowState::Resolving;
        Ok(())
    }

    /// Resolver failed (`Timeout`/`NoResults`/cascaded address loss):
    /// RESOLVING → ERROR → CLOSING → CLOSED, emitting `on_error` then
    /// `on_close`.
    pub fn resolve_failed(&mut self, err: Error) {
        self.state = FlowState::Error;
        if let Some(cb) = &mut self.callbacks.on_error {
            cb(&err);
        }
        self.state = FlowState::Closing;
        self.finish_close();
    }

    /// Resolver succeeded: joins every resolved destination with every
    /// enabled transport (bounded by `max_num_proto`), in enabled-order,
    /// and moves RESOLVING → CONNECTING.
    pub fn resolve_succeeded(&mut self, resolved: Vec<ResolvedAddr>, stacks: &[Stack]) -> Result<()> {
        if self.state != FlowState::Resolving {
            return Err(Error::Internal("resolve_succeeded() outside RESOLVING"));
        }

        for addr in &resolved {
            for stack in stacks {
                let id = CandidateId(self.next_candidate_id);
                self.next_candidate_id += 1;
                self.candidates.push(Candidate {
                    id,
                    source: addr.src_addr,
                    dest: SocketAddr::new(addr.dst_addr, addr.port),
                    stack: *stack,
                    internal: addr.internal,
                });
            }
        }

        if self.candidates.is_empty() {
            self.resolve_failed(Error::NoResults);
            return Ok(());
        }

        self.state = FlowState::Connecting;
        Ok(())
    }

    /// Drives every still-pending candidate through `dialer` once. The
    /// first to report `Ready(Ok(..))` becomes `chosen`; the rest are
    /// abandoned. Returns `true` once a winner has been chosen (or every
    /// candidate has failed).
    pub fn poll_candidates(&mut self, dialer: &mut dyn TransportDialer) -> bool {
        if self.state != FlowState::Connecting {
            return true;
        }

        let mut winner = None;
        let mut still_pending = Vec::new();

        for candidate in self.candidates.drain(..) {
            if winner.is_some() {
                dialer.abandon(&candidate);
                continue;
            }
            match dialer.try_connect(&candidate) {
                Poll::Ready(Ok(conn)) => winner = Some((candidate, conn)),
                Poll::Ready(Err(_)) => {}
                Poll::Pending => still_pending.push(candidate),
            }
        }

        match winner {
            Some((candidate, conn)) => {
                for c in still_pending {
                    dialer.abandon(&c);
                }
                self.chosen = Some(candidate);
                self.conn = Some(conn);
                self.state = FlowState::Open;
                if let Some(cb) = &mut self.callbacks.on_connected {
                    cb(candidate.stack);
                }
                true
            }
            None if still_pending.is_empty() => {
                self.resolve_failed(Error::NoResults);
                true
            }
            None => {
                self.candidates = still_pending;
                false
            }
        }
    }

    /// OPEN-state poll: `on_readable` is edge-fired, once per transition
    /// into "data available" (a subsequent `read()` draining the buffer
    /// re-arms it), while `on_writable` is level-fired every call the
    /// send window has room. Always runs after `on_connected`, since it
    /// only ever touches a flow already in OPEN.
    pub fn poll_open(&mut self) {
        if self.state != FlowState::Open {
            return;
        }
        let Some(conn) = self.conn.as_mut() else { return };

        let readable = conn.is_readable();
        if readable && !self.readable_notified {
            self.readable_notified = true;
            if let Some(cb) = &mut self.callbacks.on_readable {
                cb();
            }
        } else if !readable {
            self.readable_notified = false;
        }

        if conn.is_writable() {
            if let Some(cb) = &mut self.callbacks.on_writable {
                cb();
            }
        }
    }

    /// `close()`: idempotent; transitions to CLOSING then emits
    /// `on_close` and moves to CLOSED. All callback slots are cleared
    /// before `on_close` returns, per the terminal-callback invariant.
    pub fn close(&mut self) {
        if matches!(self.state, FlowState::Closed) {
            return;
        }
        self.state = FlowState::Closing;
        self.finish_close();
    }

    fn finish_close(&mut self) {
        if self.closed_emitted {
            self.state = FlowState::Closed;
            return;
        }
        self.closed_emitted = true;
        if let Some(cb) = &mut self.callbacks.on_close {
            cb();
        }
        self.state = FlowState::Closed;
        self.callbacks = Callbacks::default();
        self.conn = None;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, FlowState::Closed)
    }

    /// `read(ctx, flow, buf, ...)`: `WouldBlock` surfaces as an `Err`
    /// rather than a zero-length read, per the public API's `{OK,
    /// WouldBlock, Error}` result shape.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state != FlowState::Open {
            return Err(Error::Internal("read() called outside OPEN"));
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or(Error::Internal("flow has no open connection"))?;
        match conn.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(Error::IoError(e)),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.state != FlowState::Open {
            return Err(Error::Internal("write() called outside OPEN"));
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or(Error::Internal("flow has no open connection"))?;
        match conn.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(Error::IoError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDuplex {
        readable: bool,
        writable: bool,
    }

    impl Duplex for FakeDuplex {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn is_readable(&mut self) -> bool {
            self.readable
        }
        fn is_writable(&mut self) -> bool {
            self.writable
        }
    }

    struct FakeDialer {
        ready: std::collections::HashMap<CandidateId, bool>,
    }

    impl TransportDialer for FakeDialer {
        fn try_connect(&mut self, candidate: &Candidate) -> Poll<std::io::Result<Box<dyn Duplex>>> {
            match self.ready.get(&candidate.id) {
                Some(true) => Poll::Ready(Ok(Box::new(FakeDuplex { readable: true, writable: true }))),
                Some(false) => Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))),
                None => Poll::Pending,
            }
        }
        fn abandon(&mut self, _candidate: &Candidate) {}
    }

    fn resolved(addr: &str, port: u16) -> ResolvedAddr {
        ResolvedAddr {
            if_idx: 1,
            src_addr: "192.0.2.1".parse().unwrap(),
            dst_addr: addr.parse().unwrap(),
            port,
            internal: false,
        }
    }

    #[test]
    fn full_lifecycle_emits_connected_then_close() {
        let mut flow = Flow::new(FlowId(0), PropertyDocument::default());
        let connected = std::rc::Rc::new(std::cell::RefCell::new(None));
        let closed = std::rc::Rc::new(std::cell::RefCell::new(false));

        let connected2 = connected.clone();
        flow.callbacks.on_connected = Some(Box::new(move |stack| *connected2.borrow_mut() = Some(stack)));
        let closed2 = closed.clone();
        flow.callbacks.on_close = Some(Box::new(move || *closed2.borrow_mut() = true));

        flow.begin_resolving().unwrap();
        flow.resolve_succeeded(vec![resolved("203.0.113.9", 80)], &[Stack::Tcp])
            .unwrap();
        assert_eq!(flow.state, FlowState::Connecting);

        let id = flow.candidates[0].id;
        let mut dialer = FakeDialer {
            ready: [(id, true)].into_iter().collect(),
        };
        let done = flow.poll_candidates(&mut dialer);

        assert!(done);
        assert_eq!(flow.state, FlowState::Open);
        assert_eq!(*connected.borrow(), Some(Stack::Tcp));

        flow.close();
        assert_eq!(flow.state, FlowState::Closed);
        assert!(*closed.borrow());
    }

    #[test]
    fn close_is_idempotent() {
        let mut flow = Flow::new(FlowId(1), PropertyDocument::default());
        let count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let count2 = count.clone();
        flow.callbacks.on_close = Some(Box::new(move || *count2.borrow_mut() += 1));

        flow.close();
        flow.close();

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn poll_open_fires_readable_edge_once_and_writable_every_time() {
        let mut flow = Flow::new(FlowId(3), PropertyDocument::default());
        flow.begin_resolving().unwrap();
        flow.resolve_succeeded(vec![resolved("203.0.113.9", 80)], &[Stack::Tcp])
            .unwrap();

        let id = flow.candidates[0].id;
        let mut dialer = FakeDialer {
            ready: [(id, true)].into_iter().collect(),
        };
        flow.poll_candidates(&mut dialer);
        assert_eq!(flow.state, FlowState::Open);

        let readable_count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let writable_count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let rc2 = readable_count.clone();
        let wc2 = writable_count.clone();
        flow.callbacks.on_readable = Some(Box::new(move || *rc2.borrow_mut() += 1));
        flow.callbacks.on_writable = Some(Box::new(move || *wc2.borrow_mut() += 1));

        flow.poll_open();
        assert_eq!(*readable_count.borrow(), 1);
        assert_eq!(*writable_count.borrow(), 1);

        // Still readable on the next poll: edge-fired, so no repeat.
        // Writable is level-fired, so it fires again.
        flow.poll_open();
        assert_eq!(*readable_count.borrow(), 1);
        assert_eq!(*writable_count.borrow(), 2);
    }

    #[test]
    fn no_candidates_fails_with_no_results() {
        let mut flow = Flow::new(FlowId(2), PropertyDocument::default());
        let errored = std::rc::Rc::new(std::cell::RefCell::new(false));
        let errored2 = errored.clone();
        flow.callbacks.on_error = Some(Box::new(move |_| *errored2.borrow_mut() = true));

        flow.begin_resolving().unwrap();
        flow.resolve_succeeded(vec![], &[Stack::Tcp]).unwrap();

        assert!(*errored.borrow());
        assert_eq!(flow.state, FlowState::Closed);
    }
}
