//! The IPv4 routing table: a small fixed list of
//! `(destination, mask, gateway, interface)` entries, resolved by
//! longest-prefix match. This is a host's route table — it answers "which
//! interface (and, if not directly connected, which gateway) do I hand
//! this outbound datagram to", not a router's forwarding information
//! base; the stack never forwards a packet it isn't the destination of.

use log::debug;

use crate::config::IP_RTABLE_SIZE;
use crate::netif::NetifId;
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub dest: Ipv4Address,
    pub mask: Ipv4Address,
    pub gateway: Option<Ipv4Address>,
    pub netif: NetifId,
}

impl Route {
    fn prefix_len(&self) -> u32 {
        self.mask.to_u32().count_ones()
    }

    fn matches(&self, addr: Ipv4Address) -> bool {
        addr.mask_with(self.mask) == self.dest.mask_with(self.mask)
    }
}

pub struct Table {
    routes: heapless::Vec<Route, IP_RTABLE_SIZE>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            routes: heapless::Vec::new(),
        }
    }

    /// Installs a route. Entries are keyed by `(dest, mask)`: re-adding
    /// the same prefix replaces the old entry, which is how "set default
    /// last wins" works for the all-zeros default route. A full table
    /// silently drops the new route (and logs it).
    pub fn add(&mut self, route: Route) {
        if let Some(pos) = self
            .routes
            .iter()
            .position(|r| r.dest == route.dest && r.mask == route.mask)
        {
            self.routes[pos] = route;
            return;
        }
        if self.routes.push(route).is_err() {
            debug!(target: "net::route", "route table full, dropping {}/{}", route.dest, route.mask);
        }
    }

    /// Installs the default (all-zeros) route through `gateway` on
    /// `netif`, replacing any previous default.
    pub fn set_default(&mut self, netif: NetifId, gateway: Ipv4Address) {
        self.add(Route {
            dest: Ipv4Address::UNSPECIFIED,
            mask: Ipv4Address::UNSPECIFIED,
            gateway: Some(gateway),
            netif,
        });
    }

    /// Removes every route through `netif`, called on deactivation.
    pub fn remove_netif(&mut self, netif: NetifId) {
        let mut i = 0;
        while i < self.routes.len() {
            if self.routes[i].netif == netif {
                self.routes.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Finds the most specific matching route for `dest`.
    pub fn lookup(&self, dest: Ipv4Address) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.matches(dest))
            .max_by_key(|r| r.prefix_len())
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut table = Table::new();
        table.set_default(NetifId(0), Ipv4Address::new(192, 168, 1, 1));
        table.add(Route {
            dest: Ipv4Address::new(192, 168, 1, 0),
            mask: Ipv4Address::new(255, 255, 255, 0),
            gateway: None,
            netif: NetifId(0),
        });
        let r = table.lookup(Ipv4Address::new(192, 168, 1, 42)).unwrap();
        assert!(r.gateway.is_none());
        let r = table.lookup(Ipv4Address::new(8, 8, 8, 8)).unwrap();
        assert_eq!(r.gateway, Some(Ipv4Address::new(192, 168, 1, 1)));
    }

    #[test]
    fn no_match_returns_none() {
        let table = Table::new();
        assert!(table.lookup(Ipv4Address::new(1, 2, 3, 4)).is_none());
    }

    #[test]
    fn readding_a_prefix_replaces_it() {
        let mut table = Table::new();
        table.set_default(NetifId(0), Ipv4Address::new(192, 168, 74, 1));
        table.set_default(NetifId(1), Ipv4Address::new(10, 0, 2, 1));
        let r = table.lookup(Ipv4Address::new(8, 8, 8, 8)).unwrap();
        assert_eq!(r.netif, NetifId(1));
        assert_eq!(r.gateway, Some(Ipv4Address::new(10, 0, 2, 1)));
    }

    #[test]
    fn remove_netif_clears_its_routes() {
        let mut table = Table::new();
        table.add(Route {
            dest: Ipv4Address::new(10, 0, 0, 0),
            mask: Ipv4Address::new(255, 255, 255, 0),
            gateway: None,
            netif: NetifId(3),
        });
        table.remove_netif(NetifId(3));
        assert!(table.lookup(Ipv4Address::new(10, 0, 0, 5)).is_none());
    }
}
