//! Address Inventory: the live set of local addresses usable as DNS/flow
//! sources, keyed by `(if_idx, addr)`. The inventory does not itself watch
//! OS netlink/ioctl events — a platform-specific caller feeds it via
//! [`AddressInventory::add`]/[`AddressInventory::remove`], exactly the
//! abstract `ADDR_ADDED`/`ADDR_REMOVED` event source the core is specified
//! against.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// An interface-scoped local endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub family: Family,
    pub if_idx: u32,
    pub addr: IpAddr,
    /// Preferred lifetime in seconds, IPv6 only. `Some(0)` means deprecated;
    /// deprecated addresses are filtered out of candidate generation even
    /// though they remain assigned.
    pub preferred_lifetime: Option<u32>,
}

impl Address {
    pub fn new(if_idx: u32, addr: IpAddr) -> Self {
        Self {
            family: Family::of(&addr),
            if_idx,
            addr,
            preferred_lifetime: None,
        }
    }

    /// Whether this address is eligible as a candidate source: deprecated
    /// v6 addresses (preferred_lifetime == 0) never are.
    pub fn is_usable(&self) -> bool {
        !matches!(self.preferred_lifetime, Some(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEvent {
    Added,
    Removed,
}

/// The inventory itself, plus subscriber callbacks run synchronously from
/// `add`/`remove`. The resolver and flow state machine subscribe so they
/// can cascade teardown of anything referencing a removed address.
#[derive(Default)]
pub struct AddressInventory {
    addrs: Vec<Address>,
    subscribers: Vec<Box<dyn FnMut(&Address, AddressEvent)>>,
}

impl AddressInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, cb: Box<dyn FnMut(&Address, AddressEvent)>) {
        self.subscribers.push(cb);
    }

    /// Adds `addr` if not already present, notifying subscribers exactly
    /// once. Deprecated v6 addresses are still stored (so `remove` later
    /// finds them) but never delivered to candidate generation, per
    /// `is_usable`.
    pub fn add(&mut self, addr: Address) {
        if self
            .addrs
            .iter()
            .any(|a| a.if_idx == addr.if_idx && a.addr == addr.addr)
        {
            return;
        }
        for sub in &mut self.subscribers {
            sub(&addr, AddressEvent::Added);
        }
        self.addrs.push(addr);
    }

    /// Removes the address matching `(if_idx, addr)`, notifying
    /// subscribers exactly once so they can cascade teardown of any
    /// resolver pair or flow candidate referencing it.
    pub fn remove(&mut self, if_idx: u32, addr: IpAddr) {
        if let Some(pos) = self
            .addrs
            .iter()
            .position(|a| a.if_idx == if_idx && a.addr == addr)
        {
            let removed = self.addrs.remove(pos);
            for sub in &mut self.subscribers {
                sub(&removed, AddressEvent::Removed);
            }
        }
    }

    pub fn usable(&self) -> impl Iterator<Item = &Address> {
        self.addrs.iter().filter(|a| a.is_usable())
    }

    pub fn usable_of_family(&self, family: Family) -> impl Iterator<Item = &Address> {
        self.usable().filter(move |a| a.family == family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_notifies_once() {
        let mut inv = AddressInventory::new();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(0));
        let seen2 = seen.clone();
        inv.subscribe(Box::new(move |_, ev| {
            if ev == AddressEvent::Added {
                *seen2.borrow_mut() += 1;
            }
        }));

        let addr = Address::new(1, "192.0.2.1".parse().unwrap());
        inv.add(addr.clone());
        inv.add(addr);

        assert_eq!(*seen.borrow(), 1);
        assert_eq!(inv.usable().count(), 1);
    }

    #[test]
    fn deprecated_v6_is_filtered_from_usable_but_still_removable() {
        let mut inv = AddressInventory::new();
        let mut addr = Address::new(2, "2001:db8::1".parse().unwrap());
        addr.preferred_lifetime = Some(0);
        inv.add(addr);

        assert_eq!(inv.usable().count(), 0);

        inv.remove(2, "2001:db8::1".parse().unwrap());
        assert_eq!(inv.addrs.len(), 0);
    }

    #[test]
    fn remove_notifies_subscribers() {
        let mut inv = AddressInventory::new();
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let events2 = events.clone();
        inv.subscribe(Box::new(move |_, ev| events2.borrow_mut().push(ev)));

        let addr = Address::new(3, "203.0.113.1".parse().unwrap());
        inv.add(addr);
        inv.remove(3, "203.0.113.1".parse().unwrap());

        assert_eq!(
            *events.borrow(),
            vec![AddressEvent::Added, AddressEvent::Removed]
        );
    }
}
