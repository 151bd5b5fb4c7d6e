//! DNS Resolver: per-(source, server) UDP query pairs, reply parsing,
//! dedup, and the two-phase timeout. Grounded throughout on the original
//! C resolver's algorithm (`original_source/neat_resolver.c`).

mod conf;
mod message;

pub use conf::DNS_PORT;

use crate::address::{Address, AddressInventory, Family};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reactor::{Owner, Reactor, TimerKind};
use domain::base::iana::Rtype;
use mio::Interest;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(pub u64);

#[derive(Debug, Clone)]
pub struct DnsServer {
    pub family: Family,
    pub addr: SocketAddr,
}

/// One `(source_addr, resolved_dst)` entry handed to the Flow State
/// Machine once a request completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAddr {
    pub if_idx: u32,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub port: u16,
    pub internal: bool,
}

/// RFC1918 (v4) / ULA `fc00::/7` (v6) check, used as a selection-policy
/// ordering hint rather than a correctness gate.
fn is_internal(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10 || (o[0] == 172 && (16..32).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
        }
        IpAddr::V6(v6) => (v6.octets()[0] & 0xfe) == 0xfc,
    }
}

struct ResolverPair {
    socket: mio::net::UdpSocket,
    token: mio::Token,
    if_idx: u32,
    src_addr: IpAddr,
    family: Family,
    query_id: u16,
    rtype: Rtype,
    resolved: SmallVec<[IpAddr; 4]>,
}

struct ResolverRequest {
    domain: String,
    port: u16,
    family: Option<Family>,
    pairs: HashMap<PairId, ResolverPair>,
    next_pair_id: u64,
    t2_armed: bool,
    on_done: Option<Box<dyn FnOnce(Result<Vec<ResolvedAddr>>)>>,
}

impl ResolverRequest {
    fn alloc_pair_id(&mut self) -> PairId {
        let id = PairId(self.next_pair_id);
        self.next_pair_id += 1;
        id
    }
}

pub struct Resolver {
    servers: Vec<DnsServer>,
    requests: HashMap<u64, ResolverRequest>,
    next_request_id: u64,
    conf_path: PathBuf,
    watch_rx: Option<std::sync::mpsc::Receiver<()>>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl Resolver {
    pub fn new(config: &Config) -> Self {
        let conf_path = PathBuf::from(&config.resolv_conf_path);
        let servers = conf::load(&conf_path)
            .into_iter()
            .map(|addr| DnsServer {
                family: Family::of(&addr),
                addr: SocketAddr::new(addr, DNS_PORT),
            })
            .collect();

        let (watcher, rx) = match conf::watch(&conf_path) {
            Ok((w, rx)) => (Some(w), Some(rx)),
            Err(e) => {
                tracing::warn!(error = %e, "could not watch resolver config for changes");
                (None, None)
            }
        };

        Self {
            servers,
            requests: HashMap::new(),
            next_request_id: 0,
            conf_path,
            watch_rx: rx,
            _watcher: watcher,
        }
    }

    /// Polled once per reactor iteration (the "pending I/O" phase): if the
    /// watcher fired, re-read and replace the server list in one
    /// assignment, so no reader ever observes a half-updated set.
    pub fn poll_conf_watch(&mut self) {
        let Some(rx) = &self.watch_rx else { return };
        if rx.try_recv().is_ok() {
            self.servers = conf::load(&self.conf_path)
                .into_iter()
                .map(|addr| DnsServer {
                    family: Family::of(&addr),
                    addr: SocketAddr::new(addr, DNS_PORT),
                })
                .collect();
        }
    }

    /// Starts resolving `domain`. `family` restricts the address family
    /// queried (`None` = unspecified, try both). Returns immediately;
    /// `on_done` fires once the request completes (`OK`, `Timeout`, or
    /// `NoResults`), from the timer or I/O phase that concludes it.
    pub fn resolve(
        &mut self,
        domain: &str,
        port: u16,
        mut family: Option<Family>,
        inventory: &AddressInventory,
        config: &Config,
        reactor: &mut Reactor,
        on_done: Box<dyn FnOnce(Result<Vec<ResolvedAddr>>)>,
    ) -> Result<RequestId> {
        if domain.len() + 1 > 256 {
            return Err(Error::Internal("domain name too long"));
        }

        let literal = check_for_literal(domain, &mut family)?;

        let id = self.next_request_id;
        self.next_request_id += 1;
        let request_id = RequestId(id);

        let mut request = ResolverRequest {
            domain: domain.to_string(),
            port,
            family,
            pairs: HashMap::new(),
            next_pair_id: 0,
            t2_armed: false,
            on_done: Some(on_done),
        };

        if let Some(addr) = literal {
            self.requests.insert(id, request);
            reactor.schedule_timer(
                Instant::now() + config.dns_literal_timeout,
                TimerKind::ResolverLiteral(request_id),
            );
            let _ = addr; // address itself is recomputed from `domain` at fire time.
            return Ok(request_id);
        }

        reactor.schedule_timer(Instant::now() + config.dns_t1, TimerKind::ResolverT1(request_id));

        if self.servers.is_empty() {
            tracing::warn!("no DNS servers configured; request will time out at t1");
        }

        for src in inventory.usable() {
            if let Some(fam) = family {
                if src.family != fam {
                    continue;
                }
            }
            for server in &self.servers {
                if server.family != src.family {
                    continue;
                }
                Self::create_pair(&mut request, request_id, src, server, domain, reactor);
            }
        }

        self.requests.insert(id, request);
        Ok(request_id)
    }

    fn create_pair(
        request: &mut ResolverRequest,
        request_id: RequestId,
        src: &Address,
        server: &DnsServer,
        domain: &str,
        reactor: &mut Reactor,
    ) {
        let bind_addr = SocketAddr::new(src.addr, 0);
        let mut socket = match mio::net::UdpSocket::bind(bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, src = %src.addr, "failed to bind resolver pair socket");
                return;
            }
        };

        bind_to_interface(&socket, src.if_idx);

        let pair_id = request.alloc_pair_id();
        let query_id: u16 = rand::random();
        let rtype = if server.family == Family::V4 {
            Rtype::A
        } else {
            Rtype::AAAA
        };

        let query = match message::build_query(domain, rtype, query_id) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!(error = %e, "failed to build DNS query");
                return;
            }
        };

        if let Err(e) = socket.send_to(&query, server.addr) {
            tracing::debug!(error = %e, "failed to send DNS query");
            return;
        }

        let token = match reactor.register(
            &mut socket,
            Interest::READABLE,
            Owner::ResolverPair(request_id, pair_id),
        ) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(error = %e, "failed to register resolver pair with reactor");
                return;
            }
        };

        request.pairs.insert(
            pair_id,
            ResolverPair {
                socket,
                token,
                if_idx: src.if_idx,
                src_addr: src.addr,
                family: src.family,
                query_id,
                rtype,
                resolved: SmallVec::new(),
            },
        );
    }

    /// Handles a readable resolver-pair socket: parse, dedup, append, and
    /// arm the `t2` grace timer on this request's first successful answer.
    pub fn handle_pair_readable(
        &mut self,
        request_id: RequestId,
        pair_id: PairId,
        config: &Config,
        reactor: &mut Reactor,
    ) {
        let Some(request) = self.requests.get_mut(&request_id.0) else {
            return;
        };

        let mut buf = [0u8; 512];
        let (n, query_id, rtype, if_idx, family) = {
            let Some(pair) = request.pairs.get_mut(&pair_id) else {
                return;
            };
            match pair.socket.recv(&mut buf) {
                Ok(n) => (n, pair.query_id, pair.rtype, pair.if_idx, pair.family),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::debug!(error = %e, "resolver pair recv failed");
                    return;
                }
            }
        };

        let addrs = match message::parse_addresses(&buf[..n], query_id, rtype) {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed DNS reply");
                return;
            }
        };

        let already: Vec<IpAddr> = request
            .pairs
            .values()
            .filter(|p| p.if_idx == if_idx && p.family == family)
            .flat_map(|p| p.resolved.iter().copied())
            .collect();

        let Some(pair) = request.pairs.get_mut(&pair_id) else {
            return;
        };

        let mut got_any = false;
        for addr in addrs {
            if pair.resolved.len() >= config.max_num_resolved {
                break;
            }
            if already.contains(&addr) || pair.resolved.contains(&addr) {
                continue;
            }
            pair.resolved.push(addr);
            got_any = true;
        }

        if got_any && !request.t2_armed {
            request.t2_armed = true;
            reactor.cancel_timers_for_request(request_id);
            reactor.schedule_timer(Instant::now() + config.dns_t2, TimerKind::ResolverT2(request_id));
        }
    }

    /// Deregisters and queues a deferred-delete for every pair still held
    /// by `request`, so a request's sockets never close synchronously
    /// from inside a timer/I/O callback.
    fn teardown_request(request: &mut ResolverRequest, reactor: &mut Reactor) {
        for (_, mut pair) in request.pairs.drain() {
            reactor.deregister(pair.token, &mut pair.socket);
            reactor.defer_delete(move || drop(pair.socket));
        }
    }

    /// `t1` fired with no answers at all: fail the request `Timeout`.
    pub fn fire_t1(&mut self, request_id: RequestId, reactor: &mut Reactor) {
        let Some(mut request) = self.requests.remove(&request_id.0) else {
            return;
        };
        Self::teardown_request(&mut request, reactor);
        if let Some(cb) = request.on_done.take() {
            cb(Err(Error::Timeout));
        }
    }

    /// `t2` (or the literal timer) fired: aggregate every pair's resolved
    /// addresses into the result list.
    pub fn fire_t2(&mut self, request_id: RequestId, reactor: &mut Reactor) {
        let Some(mut request) = self.requests.remove(&request_id.0) else {
            return;
        };

        let mut results = Vec::new();
        for pair in request.pairs.values() {
            for addr in &pair.resolved {
                results.push(ResolvedAddr {
                    if_idx: pair.if_idx,
                    src_addr: pair.src_addr,
                    dst_addr: *addr,
                    port: request.port,
                    internal: is_internal(addr),
                });
            }
        }

        Self::teardown_request(&mut request, reactor);

        if let Some(cb) = request.on_done.take() {
            if results.is_empty() {
                cb(Err(Error::NoResults));
            } else {
                cb(Ok(results));
            }
        }
    }

    /// Literal fast-path timer fired: pair the literal destination with
    /// every currently-usable source address of matching family.
    pub fn fire_literal(&mut self, request_id: RequestId, inventory: &AddressInventory) {
        let Some(mut request) = self.requests.remove(&request_id.0) else {
            return;
        };

        let Ok(dst) = IpAddr::from_str(&request.domain) else {
            if let Some(cb) = request.on_done.take() {
                cb(Err(Error::Internal("literal address failed to re-parse")));
            }
            return;
        };
        let family = Family::of(&dst);

        let mut results = Vec::new();
        for src in inventory.usable_of_family(family) {
            if let Some(fam) = request.family {
                if fam != family {
                    continue;
                }
            }
            results.push(ResolvedAddr {
                if_idx: src.if_idx,
                src_addr: src.addr,
                dst_addr: dst,
                port: request.port,
                internal: is_internal(&dst),
            });
        }

        if let Some(cb) = request.on_done.take() {
            if results.is_empty() {
                cb(Err(Error::NoResults));
            } else {
                cb(Ok(results));
            }
        }
    }

    /// Cascading teardown when a source address disappears mid-resolve:
    /// every pair referencing it is deregistered and its socket close
    /// deferred; if that empties a request's pair set and `t2` never
    /// armed, the request still completes normally when its timer fires
    /// (with whatever remains).
    pub fn delete_pairs_for_address(&mut self, if_idx: u32, addr: IpAddr, reactor: &mut Reactor) {
        for request in self.requests.values_mut() {
            let matching: Vec<PairId> = request
                .pairs
                .iter()
                .filter(|(_, pair)| pair.if_idx == if_idx && pair.src_addr == addr)
                .map(|(id, _)| *id)
                .collect();

            for id in matching {
                if let Some(mut pair) = request.pairs.remove(&id) {
                    reactor.deregister(pair.token, &mut pair.socket);
                    reactor.defer_delete(move || drop(pair.socket));
                }
            }
        }
    }
}

/// Checks whether `node` is already a literal address of the requested
/// family (or `None`/unspecified, matching either). Returns the parsed
/// literal on success; fails `InvalidProperty` if the literal's actual
/// family contradicts an explicitly requested one.
fn check_for_literal(node: &str, family: &mut Option<Family>) -> Result<Option<IpAddr>> {
    let Ok(addr) = IpAddr::from_str(node) else {
        return Ok(None);
    };
    let parsed_family = Family::of(&addr);

    match family {
        Some(f) if *f != parsed_family => Err(Error::InvalidProperty),
        None => {
            *family = Some(parsed_family);
            Ok(Some(addr))
        }
        Some(_) => Ok(Some(addr)),
    }
}

#[cfg(target_os = "linux")]
fn bind_to_interface(socket: &mio::net::UdpSocket, if_idx: u32) {
    let mut name_buf = [0u8; libc::IF_NAMESIZE];
    // SAFETY: `if_indextoname` writes at most `IF_NAMESIZE` bytes into a
    // buffer of that size; `if_idx` is a plain integer.
    let ok = unsafe { !libc::if_indextoname(if_idx, name_buf.as_mut_ptr() as *mut i8).is_null() };
    if !ok {
        return;
    }
    let len = name_buf.iter().position(|&b| b == 0).unwrap_or(0);

    // Binding to an interface typically requires elevated privileges;
    // failures are silently ignored and the socket is left unbound.
    let _ = socket2::SockRef::from(socket).bind_device(Some(&name_buf[..len]));
}

#[cfg(not(target_os = "linux"))]
fn bind_to_interface(_socket: &mio::net::UdpSocket, _if_idx: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_v4_is_detected() {
        let mut family = None;
        let addr = check_for_literal("192.0.2.5", &mut family).unwrap();
        assert_eq!(addr, Some("192.0.2.5".parse().unwrap()));
        assert_eq!(family, Some(Family::V4));
    }

    #[test]
    fn non_literal_returns_none() {
        let mut family = None;
        assert_eq!(check_for_literal("example.com", &mut family).unwrap(), None);
        assert_eq!(family, None);
    }

    #[test]
    fn mismatched_family_is_invalid_property() {
        let mut family = Some(Family::V6);
        assert!(matches!(
            check_for_literal("192.0.2.5", &mut family),
            Err(Error::InvalidProperty)
        ));
    }

    #[test]
    fn internal_flag_matches_rfc1918_and_ula() {
        assert!(is_internal(&"10.0.0.1".parse().unwrap()));
        assert!(is_internal(&"172.16.0.1".parse().unwrap()));
        assert!(!is_internal(&"172.32.0.1".parse().unwrap()));
        assert!(is_internal(&"192.168.1.1".parse().unwrap()));
        assert!(!is_internal(&"8.8.8.8".parse().unwrap()));
        assert!(is_internal(&"fc00::1".parse().unwrap()));
        assert!(!is_internal(&"2001:db8::1".parse().unwrap()));
    }
}
