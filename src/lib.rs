//! `neat`: a transport-agnostic API toolkit. An application opens a
//! [`Flow`] against a host/port and a [`PropertyDocument`] describing its
//! transport requirements; the core resolves candidate destinations,
//! consults the policy manager if asked, and dials candidates
//! concurrently, handing the winner to the application's callbacks.
//!
//! Wire-level transport protocols (TCP/SCTP/UDP/UDP-Lite) are an explicit
//! Non-goal of this crate — [`Context::run`] takes a [`TransportDialer`]
//! supplied by the embedding application as the seam where a real
//! connector plugs in.

pub mod address;
pub mod config;
pub mod dns;
pub mod error;
pub mod flow;
pub mod log;
pub mod pm;
pub mod property;
pub mod reactor;
pub mod stats;

pub use address::{Address, AddressEvent, AddressInventory, Family};
pub use config::Config;
pub use dns::{RequestId, ResolvedAddr};
pub use error::{Error, Result};
pub use flow::{Callbacks, Candidate, CandidateId, Duplex, Flow, FlowId, FlowState, Stack, TransportDialer};
pub use property::PropertyDocument;
pub use reactor::RunMode;

use dns::Resolver;
use pm::PmClient;
use reactor::{Owner, Reactor, ReactorEvent, TimerKind};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

enum PendingResolve {
    Ok(Vec<ResolvedAddr>, Vec<Stack>),
    Err(Error),
}

/// Owns every live component: the reactor, the address inventory, the
/// resolver, and the set of open flows. Not `Send`/`Sync` — the whole
/// point of the single-threaded reactor model is that nothing here runs
/// off the loop thread.
pub struct Context {
    reactor: Reactor,
    inventory: AddressInventory,
    resolver: Resolver,
    config: Config,
    log: Option<log::Handle>,
    flows: HashMap<u64, Flow>,
    next_flow_id: u64,
    pending: Rc<RefCell<HashMap<u64, PendingResolve>>>,
    pm_flows: HashMap<u64, FlowId>,
}

impl Context {
    /// `init_ctx`: builds a fresh context with the given config, or
    /// `Config::default()` if none is supplied.
    pub fn init(config: Option<Config>) -> Result<Self> {
        let config = config.unwrap_or_default();
        let reactor = Reactor::new().map_err(Error::IoError)?;
        let resolver = Resolver::new(&config);

        Ok(Self {
            reactor,
            inventory: AddressInventory::new(),
            resolver,
            config,
            log: None,
            flows: HashMap::new(),
            next_flow_id: 0,
            pending: Rc::new(RefCell::new(HashMap::new())),
            pm_flows: HashMap::new(),
        })
    }

    /// Attaches a [`log::Handle`] obtained from [`log::init`] so
    /// [`Context::log_level`] can adjust verbosity at runtime. Optional —
    /// a caller managing its own `tracing` subscriber has no need of this.
    pub fn attach_log_handle(&mut self, handle: log::Handle) {
        self.log = Some(handle);
    }

    pub fn log_level(&self, level: tracing::Level) -> Result<()> {
        match &self.log {
            Some(handle) => handle.set_level(level),
            None => Err(Error::Internal(
                "no log handle attached; call log::init() and attach_log_handle first",
            )),
        }
    }

    /// Feeds an observed address addition into the inventory. The
    /// platform-specific address-change listener is an external
    /// collaborator; this is its entry point.
    pub fn address_added(&mut self, addr: Address) {
        self.inventory.add(addr);
    }

    /// Feeds an observed address removal, cascading teardown of any
    /// resolver pair bound to it before the inventory forgets it.
    pub fn address_removed(&mut self, if_idx: u32, addr: IpAddr) {
        self.resolver.delete_pairs_for_address(if_idx, addr, &mut self.reactor);
        self.inventory.remove(if_idx, addr);
    }

    pub fn new_flow(&mut self) -> FlowId {
        let id = self.next_flow_id;
        self.next_flow_id += 1;
        self.flows.insert(id, Flow::new(FlowId(id), PropertyDocument::default()));
        FlowId(id)
    }

    pub fn set_property(&mut self, flow_id: FlowId, json_text: &str) -> Result<()> {
        let doc = PropertyDocument::parse(json_text)?;
        let flow = self.flow_mut(flow_id)?;
        flow.properties = doc;
        Ok(())
    }

    pub fn set_operations(&mut self, flow_id: FlowId, ops: Callbacks) -> Result<()> {
        self.flow_mut(flow_id)?.callbacks = ops;
        Ok(())
    }

    /// `open(ctx, flow, host, port, ...)`: IDLE → RESOLVING, then kicks off
    /// DNS resolution. Candidate generation and dialing continue across
    /// later `run`/`run_once` iterations once the resolve completes.
    pub fn open(&mut self, flow_id: FlowId, host: &str, port: u16) -> Result<()> {
        let stacks: Vec<Stack> = {
            let flow = self.flow_mut(flow_id)?;
            flow.begin_resolving()?;
            flow.properties
                .enabled_transports(self.config.max_num_proto)?
                .iter()
                .filter_map(|name| Stack::from_name(name))
                .collect()
        };

        let pending = self.pending.clone();
        let key = flow_id.0;

        let result = self.resolver.resolve(
            host,
            port,
            None,
            &self.inventory,
            &self.config,
            &mut self.reactor,
            Box::new(move |res| {
                let outcome = match res {
                    Ok(addrs) => PendingResolve::Ok(addrs, stacks),
                    Err(e) => PendingResolve::Err(e),
                };
                pending.borrow_mut().insert(key, outcome);
            }),
        );

        if let Err(e) = result {
            // No request was ever created; IDLE is still accurate.
            if let Some(flow) = self.flows.get_mut(&flow_id.0) {
                flow.state = FlowState::Idle;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sends the flow's current properties to the policy manager and
    /// merges its reply back in once the round trip completes. Optional —
    /// `open` does not require it.
    pub fn consult_pm(&mut self, flow_id: FlowId) -> Result<()> {
        let properties = self.flow_mut(flow_id)?.properties.clone();
        let client = PmClient::send(&properties)?;
        let pm_id = self.reactor.register_pm(client).map_err(Error::IoError)?;
        self.pm_flows.insert(pm_id, flow_id);
        Ok(())
    }

    pub fn read(&mut self, flow_id: FlowId, buf: &mut [u8]) -> Result<usize> {
        self.flow_mut(flow_id)?.read(buf)
    }

    pub fn write(&mut self, flow_id: FlowId, buf: &[u8]) -> Result<usize> {
        self.flow_mut(flow_id)?.write(buf)
    }

    pub fn close(&mut self, flow_id: FlowId) {
        if let Some(flow) = self.flows.get_mut(&flow_id.0) {
            flow.close();
        }
    }

    /// Raw `getaddrinfo`, independent of any flow.
    pub fn getaddrinfo(
        &mut self,
        family: Option<Family>,
        node: &str,
        port: u16,
        on_done: Box<dyn FnOnce(Result<Vec<ResolvedAddr>>)>,
    ) -> Result<RequestId> {
        self.resolver
            .resolve(node, port, family, &self.inventory, &self.config, &mut self.reactor, on_done)
    }

    pub fn stats_build_json(&self) -> serde_json::Value {
        stats::snapshot(self.flows.values())
    }

    pub fn stop(&mut self) {
        self.reactor.stop();
    }

    /// `start_event_loop`: drives timers, I/O, and candidate dialing.
    /// `RunMode::Default` loops until [`Context::stop`] is called;
    /// `Once`/`NoWait` each process a single batch and return.
    pub fn run(&mut self, mode: RunMode, dialer: &mut dyn TransportDialer) -> Result<()> {
        loop {
            self.resolver.poll_conf_watch();

            let events = self.reactor.run_once(mode).map_err(Error::IoError)?;
            for event in events {
                self.dispatch(event);
            }

            self.drain_resolves();
            self.poll_connecting(dialer);
            self.poll_open_flows();

            if mode != RunMode::Default || self.reactor.is_stopped() {
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::Readable(Owner::ResolverPair(request_id, pair_id)) => {
                self.resolver
                    .handle_pair_readable(request_id, pair_id, &self.config, &mut self.reactor);
            }
            ReactorEvent::Readable(Owner::Pm(id)) | ReactorEvent::Writable(Owner::Pm(id)) => {
                self.service_pm(id);
            }
            ReactorEvent::TimerFired(TimerKind::ResolverT1(id)) => {
                self.resolver.fire_t1(id, &mut self.reactor);
            }
            ReactorEvent::TimerFired(TimerKind::ResolverT2(id)) => {
                self.resolver.fire_t2(id, &mut self.reactor);
            }
            ReactorEvent::TimerFired(TimerKind::ResolverLiteral(id)) => {
                self.resolver.fire_literal(id, &self.inventory);
            }
            // A resolver pair is only ever registered READABLE, and
            // candidate dialing is driven by `poll_connecting` each
            // iteration rather than by reactor-registered tokens, since the
            // actual transport stack is supplied externally.
            ReactorEvent::Writable(Owner::ResolverPair(..)) | ReactorEvent::Readable(Owner::FlowCandidate(..)) | ReactorEvent::Writable(Owner::FlowCandidate(..)) => {}
        }
    }

    fn service_pm(&mut self, id: u64) {
        let outcome = match self.reactor.pm_client_mut(id) {
            Some(client) => client.handle_event(),
            None => return,
        };

        match outcome {
            Ok(None) => {}
            Ok(Some(reply)) => {
                self.reactor.remove_pm(id);
                if let Some(flow_id) = self.pm_flows.remove(&id) {
                    if let Some(flow) = self.flows.get_mut(&flow_id.0) {
                        flow.properties.merge_reply(reply);
                    }
                }
            }
            Err(e) => {
                self.reactor.remove_pm(id);
                if let Some(flow_id) = self.pm_flows.remove(&id) {
                    if let Some(flow) = self.flows.get_mut(&flow_id.0) {
                        if let Some(cb) = &mut flow.callbacks.on_error {
                            cb(&e);
                        }
                    }
                }
            }
        }
    }

    fn drain_resolves(&mut self) {
        let drained: Vec<(u64, PendingResolve)> = self.pending.borrow_mut().drain().collect();
        for (key, outcome) in drained {
            let Some(flow) = self.flows.get_mut(&key) else { continue };
            match outcome {
                PendingResolve::Ok(addrs, stacks) => {
                    if let Err(e) = flow.resolve_succeeded(addrs, &stacks) {
                        flow.resolve_failed(e);
                    }
                }
                PendingResolve::Err(e) => flow.resolve_failed(e),
            }
        }
    }

    fn poll_connecting(&mut self, dialer: &mut dyn TransportDialer) {
        for flow in self.flows.values_mut() {
            if flow.state == FlowState::Connecting {
                flow.poll_candidates(dialer);
            }
        }
    }

    /// Drives `on_readable`/`on_writable` dispatch for every flow already
    /// OPEN, after `poll_connecting` has had a chance to move a
    /// newly-chosen candidate into OPEN this same iteration.
    fn poll_open_flows(&mut self) {
        for flow in self.flows.values_mut() {
            flow.poll_open();
        }
    }

    fn flow_mut(&mut self, flow_id: FlowId) -> Result<&mut Flow> {
        self.flows
            .get_mut(&flow_id.0)
            .ok_or(Error::Internal("unknown flow id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;

    struct ImmediateDialer;

    impl TransportDialer for ImmediateDialer {
        fn try_connect(&mut self, _candidate: &Candidate) -> Poll<std::io::Result<Box<dyn Duplex>>> {
            Poll::Pending
        }
        fn abandon(&mut self, _candidate: &Candidate) {}
    }

    #[test]
    fn new_flow_starts_idle_and_close_is_idempotent() {
        let mut ctx = Context::init(None).unwrap();
        let flow = ctx.new_flow();
        assert_eq!(ctx.flows[&flow.0].state, FlowState::Idle);
        ctx.close(flow);
        ctx.close(flow);
        assert_eq!(ctx.flows[&flow.0].state, FlowState::Closed);
    }

    #[test]
    fn set_property_rejects_malformed_json() {
        let mut ctx = Context::init(None).unwrap();
        let flow = ctx.new_flow();
        assert!(matches!(
            ctx.set_property(flow, "not json"),
            Err(Error::InvalidProperty)
        ));
    }

    #[test]
    fn open_rejects_too_long_domain_and_reverts_to_idle() {
        let mut ctx = Context::init(None).unwrap();
        let flow = ctx.new_flow();
        let long_domain = "a".repeat(300);
        assert!(ctx.open(flow, &long_domain, 80).is_err());
        assert_eq!(ctx.flows[&flow.0].state, FlowState::Idle);
    }

    #[test]
    fn stats_snapshot_counts_live_flows() {
        let mut ctx = Context::init(None).unwrap();
        ctx.new_flow();
        ctx.new_flow();
        let snap = ctx.stats_build_json();
        assert_eq!(snap["flow_count"], 2);
    }

    #[test]
    fn run_once_nowait_does_not_block() {
        let mut ctx = Context::init(None).unwrap();
        let mut dialer = ImmediateDialer;
        ctx.run(RunMode::NoWait, &mut dialer).unwrap();
    }
}
