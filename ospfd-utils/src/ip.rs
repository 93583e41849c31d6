use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

// Extension methods for Ipv4Addr.
pub trait Ipv4AddrExt {
    const LENGTH: usize;

    /// Returns whether the address is usable as an OSPF source or Router-ID.
    fn is_usable(&self) -> bool;
}

// Extension methods for Ipv4Network.
pub trait Ipv4NetworkExt {
    /// Returns a new prefix with the host bits zeroed out.
    fn apply_mask(&self) -> Ipv4Network;

    /// Returns whether the prefix contains the given other prefix.
    fn is_supernet_of(&self, other: Ipv4Network) -> bool;
}

// ===== impl Ipv4Addr =====

impl Ipv4AddrExt for Ipv4Addr {
    const LENGTH: usize = 4;

    fn is_usable(&self) -> bool {
        !self.is_loopback() && !self.is_broadcast() && !self.is_multicast()
            && !self.is_unspecified()
    }
}

// ===== impl Ipv4Network =====

impl Ipv4NetworkExt for Ipv4Network {
    fn apply_mask(&self) -> Ipv4Network {
        Ipv4Network::new(self.network(), self.prefix()).unwrap()
    }

    fn is_supernet_of(&self, other: Ipv4Network) -> bool {
        self.prefix() <= other.prefix() && self.contains(other.ip())
    }
}
