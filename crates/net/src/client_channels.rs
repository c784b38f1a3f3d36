//! Index of channel references by remote host identifier.
//!
//! The registry keys channels by socket address, but administrative
//! operations ("shut down everything host X holds", "how many connections
//! does host X keep open") act on the logical host id learned during
//! authentication, regardless of which addresses the host dialed from. This
//! index maintains that secondary view for the connecting (client) side.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use r66_core::HostId;

use crate::channel::{ChannelId, NetworkChannelReference};

/// Host-id keyed index over client-side channel references.
///
/// Invariant: a channel appears in at most one host's set at a time;
/// re-registering under a new host id moves it.
#[derive(Default)]
pub struct ClientNetworkChannels {
    by_host: DashMap<HostId, HashMap<ChannelId, Arc<NetworkChannelReference>>>,
}

impl ClientNetworkChannels {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_host: DashMap::new(),
        }
    }

    /// Registers `channel` under `host`, moving it out of any previous set,
    /// and records the host id on the channel.
    pub fn register(&self, host: HostId, channel: &Arc<NetworkChannelReference>) {
        if let Some(previous) = channel.host_id() {
            if previous != host {
                self.remove_from(&previous, channel.id());
            }
        }
        channel.set_host_id(host.clone());
        self.by_host
            .entry(host)
            .or_default()
            .insert(channel.id(), Arc::clone(channel));
    }

    /// Removes `channel` from its host set, dropping the set once empty.
    pub fn unregister(&self, channel: &NetworkChannelReference) {
        if let Some(host) = channel.host_id() {
            self.remove_from(&host, channel.id());
        }
    }

    /// Returns the number of client connections held by `host`.
    #[must_use]
    pub fn count_for(&self, host: &HostId) -> usize {
        self.by_host.get(host).map_or(0, |set| set.len())
    }

    /// Snapshots the channel references held by `host`.
    #[must_use]
    pub fn channels_for(&self, host: &HostId) -> Vec<Arc<NetworkChannelReference>> {
        self.by_host
            .get(host)
            .map_or_else(Vec::new, |set| set.values().cloned().collect())
    }

    /// Returns the number of hosts currently holding client connections.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.by_host.len()
    }

    fn remove_from(&self, host: &HostId, id: ChannelId) {
        if let Some(mut set) = self.by_host.get_mut(host) {
            set.remove(&id);
            let emptied = set.is_empty();
            drop(set);
            if emptied {
                self.by_host.remove_if(host, |_, set| set.is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::testing::MemoryConnection;
    use std::net::SocketAddr;

    fn channel(id: u64, port: u16) -> Arc<NetworkChannelReference> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Arc::new(NetworkChannelReference::new(
            ChannelId::new(id),
            Box::new(MemoryConnection::new(addr)),
        ))
    }

    #[test]
    fn register_counts_per_host() {
        let index = ClientNetworkChannels::new();
        let host = HostId::from("partner-a");

        index.register(host.clone(), &channel(1, 6666));
        index.register(host.clone(), &channel(2, 6667));

        assert_eq!(index.count_for(&host), 2);
        assert_eq!(index.host_count(), 1);
    }

    #[test]
    fn unregister_drops_empty_host_sets() {
        let index = ClientNetworkChannels::new();
        let host = HostId::from("partner-a");
        let first = channel(1, 6666);

        index.register(host.clone(), &first);
        index.unregister(&first);

        assert_eq!(index.count_for(&host), 0);
        assert_eq!(index.host_count(), 0);
    }

    #[test]
    fn reregistration_moves_between_hosts() {
        let index = ClientNetworkChannels::new();
        let old = HostId::from("partner-a");
        let new = HostId::from("partner-b");
        let shared = channel(1, 6666);

        index.register(old.clone(), &shared);
        index.register(new.clone(), &shared);

        assert_eq!(index.count_for(&old), 0);
        assert_eq!(index.count_for(&new), 1);
        assert_eq!(shared.host_id(), Some(new));
    }

    #[test]
    fn channels_for_returns_snapshot() {
        let index = ClientNetworkChannels::new();
        let host = HostId::from("partner-a");
        index.register(host.clone(), &channel(1, 6666));
        index.register(host.clone(), &channel(2, 6667));

        let snapshot = index.channels_for(&host);

        assert_eq!(snapshot.len(), 2);
    }
}
