//! Authorization table: the only source of truth for which board addresses
//! a session may talk to.
//!
//! Built once when a session opens, from the job's `(x, y, hostname)`
//! triples, and never mutated again. Hostname resolution failures are
//! logged and the board is simply left out of the table rather than
//! failing the whole session — a job with one unreachable board should
//! still be able to use the others.

use std::net::{IpAddr, Ipv4Addr};

use ahash::{AHashMap, AHashSet};

/// A board's logical coordinate within a job's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoardCoordinate {
    pub x: u32,
    pub y: u32,
}

pub struct AuthorizationTable {
    boards: AHashMap<BoardCoordinate, Ipv4Addr>,
    authorized: AHashSet<Ipv4Addr>,
}

impl AuthorizationTable {
    /// Resolves `boards` (as given by the job allocator: coordinate plus
    /// Ethernet hostname) into an immutable address table.
    ///
    /// A hostname that fails to resolve, or resolves only to IPv6
    /// addresses, is skipped with a warning rather than aborting the
    /// session.
    pub async fn resolve(boards: &[(u32, u32, String)]) -> Self {
        let mut table = AHashMap::with_capacity(boards.len());
        let mut authorized = AHashSet::with_capacity(boards.len());

        for (x, y, hostname) in boards {
            match tokio::net::lookup_host((hostname.as_str(), 0)).await {
                Ok(addrs) => {
                    let ipv4 = addrs.map(|addr| addr.ip()).find_map(|ip| match ip {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    });

                    match ipv4 {
                        Some(addr) => {
                            table.insert(BoardCoordinate { x: *x, y: *y }, addr);
                            authorized.insert(addr);
                        }
                        None => log::warn!(
                            "board ({x}, {y}) hostname '{hostname}' resolved to no ipv4 address, skipping"
                        ),
                    }
                }
                Err(err) => log::warn!(
                    "board ({x}, {y}) hostname '{hostname}' failed to resolve: {err}, skipping"
                ),
            }
        }

        Self { boards: table, authorized }
    }

    /// Builds a table directly from already-resolved addresses, for tests
    /// and for callers that resolve hostnames themselves.
    pub fn from_resolved(boards: impl IntoIterator<Item = (u32, u32, Ipv4Addr)>) -> Self {
        let mut table = AHashMap::new();
        let mut authorized = AHashSet::new();

        for (x, y, addr) in boards {
            table.insert(BoardCoordinate { x, y }, addr);
            authorized.insert(addr);
        }

        Self { boards: table, authorized }
    }

    pub fn lookup(&self, x: u32, y: u32) -> Option<Ipv4Addr> {
        self.boards.get(&BoardCoordinate { x, y }).copied()
    }

    pub fn is_authorized(&self, addr: Ipv4Addr) -> bool {
        self.authorized.contains(&addr)
    }
}
