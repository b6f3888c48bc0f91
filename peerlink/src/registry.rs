use std::sync::Arc;

use crate::channel::Channel;
use crate::transport::Transport;

/// Live channels of one client, keyed by peer id.
///
/// At most one live channel exists per peer. A channel that has been closed,
/// finished by the peer or cut off by link loss is replaced on the next
/// [`ChannelRegistry::get_or_open`].
#[derive(Default)]
pub struct ChannelRegistry {
    channels: scc::HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The live channel for `peer_id`, if any.
    pub fn get(&self, peer_id: &str) -> Option<Channel> {
        self.channels
            .read(peer_id, |_, channel| channel.clone())
            .filter(Channel::is_connected)
    }

    /// Return the live channel for `peer_id`, or open and register a new
    /// one. The flag is true when the channel was created by this call.
    pub fn get_or_open(
        self: &Arc<Self>,
        peer_id: &str,
        transport: &Arc<Transport>,
    ) -> (Channel, bool) {
        match self.channels.entry(peer_id.to_string()) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                if entry.get().is_connected() {
                    return (entry.get().clone(), false);
                }
                let channel =
                    Channel::open(peer_id.to_string(), transport.clone(), Arc::downgrade(self));
                *entry.get_mut() = channel.clone();
                (channel, true)
            }
            scc::hash_map::Entry::Vacant(entry) => {
                let channel =
                    Channel::open(peer_id.to_string(), transport.clone(), Arc::downgrade(self));
                entry.insert_entry(channel.clone());
                (channel, true)
            }
        }
    }

    /// Drop `channel` from the registry unless it has been replaced already.
    pub fn remove(&self, channel: &Channel) -> bool {
        self.channels
            .remove_if(channel.peer_id(), |current| current.same(channel))
            .is_some()
    }

    /// Peer ids with a live channel.
    pub fn peers(&self) -> Vec<String> {
        let mut peers = Vec::new();
        self.channels.scan(|peer_id, channel| {
            if channel.is_connected() {
                peers.push(peer_id.clone());
            }
        });
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Every registered channel, live or not.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = Vec::new();
        self.channels.scan(|_, channel| channels.push(channel.clone()));
        channels
    }

    /// Close and forget every channel.
    pub fn close_all(&self) {
        // close() removes from the map, so collect first
        for channel in self.channels() {
            channel.close();
        }
        self.channels.clear();
    }
}
