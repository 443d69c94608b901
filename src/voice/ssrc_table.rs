//! SSRCTable — §3: channel → (ssrc → user), guarded by a reader-writer
//! lock per §5 ("The SSRCTable is guarded by a reader-writer lock").

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{ChannelId, Ssrc, UserId};

#[derive(Default)]
pub struct SsrcTable {
    inner: RwLock<HashMap<ChannelId, HashMap<Ssrc, UserId>>>,
}

impl SsrcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert on a speaking-start signal (§3). Insertion order is
    /// irrelevant, so plain overwrite is correct.
    pub fn register(&self, channel: ChannelId, ssrc: Ssrc, user: UserId) {
        let mut map = self.inner.write().expect("ssrc table poisoned");
        map.entry(channel).or_default().insert(ssrc, user);
    }

    pub fn unregister(&self, channel: ChannelId, ssrc: Ssrc) {
        let mut map = self.inner.write().expect("ssrc table poisoned");
        if let Some(channel_map) = map.get_mut(&channel) {
            channel_map.remove(&ssrc);
        }
    }

    /// Removes every SSRC mapped to `user` under `channel`. Used on
    /// `ClientDisconnect`, which carries a user id but not an SSRC.
    pub fn unregister_user(&self, channel: ChannelId, user: UserId) {
        let mut map = self.inner.write().expect("ssrc table poisoned");
        if let Some(channel_map) = map.get_mut(&channel) {
            channel_map.retain(|_, &mut mapped_user| mapped_user != user);
        }
    }

    /// Look up a user under the given channel. Unknown SSRCs are
    /// always benign (§4.1 Failure semantics).
    pub fn lookup(&self, channel: ChannelId, ssrc: Ssrc) -> Option<UserId> {
        let map = self.inner.read().expect("ssrc table poisoned");
        map.get(&channel).and_then(|m| m.get(&ssrc)).copied()
    }

    /// Cleared on channel exit (§3). Preserves the structure for other
    /// channels (§4.3 Failure semantics: "preserve the process-wide
    /// SSRCTable structure, scoped per channel").
    pub fn clear_channel(&self, channel: ChannelId) {
        let mut map = self.inner.write().expect("ssrc table poisoned");
        if let Some(channel_map) = map.get_mut(&channel) {
            channel_map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let table = SsrcTable::new();
        table.register(1, 42, 999);
        assert_eq!(table.lookup(1, 42), Some(999));
    }

    #[test]
    fn unknown_ssrc_is_none() {
        let table = SsrcTable::new();
        assert_eq!(table.lookup(1, 42), None);
    }

    #[test]
    fn lookup_is_scoped_per_channel() {
        let table = SsrcTable::new();
        table.register(1, 42, 999);
        assert_eq!(table.lookup(2, 42), None);
    }

    #[test]
    fn unregister_user_removes_all_their_ssrcs() {
        let table = SsrcTable::new();
        table.register(1, 42, 999);
        table.register(1, 43, 999);
        table.register(1, 44, 111);
        table.unregister_user(1, 999);
        assert_eq!(table.lookup(1, 42), None);
        assert_eq!(table.lookup(1, 43), None);
        assert_eq!(table.lookup(1, 44), Some(111));
    }

    #[test]
    fn clear_channel_preserves_other_channels() {
        let table = SsrcTable::new();
        table.register(1, 42, 999);
        table.register(2, 7, 111);
        table.clear_channel(1);
        assert_eq!(table.lookup(1, 42), None);
        assert_eq!(table.lookup(2, 7), Some(111));
    }
}
