//! Unordered set of channel handles.
//!
//! Used by the endpoint table to remember queue pairs whose conversion to
//! local memory failed during hibernation. Carries no lock of its own; the
//! owner serializes access.

use qpair_proto::ChannelHandle;

/// Growable, unordered set of [`ChannelHandle`]s.
///
/// Removal swaps the last entry into the vacated slot, so iteration order is
/// unspecified and may change after any removal.
#[derive(Debug, Clone, Default)]
pub struct HandleSet {
    /// Members, unordered and unique.
    entries: Vec<ChannelHandle>,
}

impl HandleSet {
    /// Creates an empty set with room for `capacity` handles.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Adds `handle`. Returns `false` if it was already present.
    pub fn append(&mut self, handle: ChannelHandle) -> bool {
        if self.contains(handle) {
            return false;
        }
        self.entries.push(handle);
        true
    }

    /// Removes `handle`. Returns `false` if it was not present.
    pub fn remove(&mut self, handle: ChannelHandle) -> bool {
        match self.entries.iter().position(|h| *h == handle) {
            Some(i) => {
                self.entries.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Removes and returns an arbitrary handle.
    pub fn pop(&mut self) -> Option<ChannelHandle> {
        self.entries.pop()
    }

    /// Returns `true` if `handle` is in the set.
    pub fn contains(&self, handle: ChannelHandle) -> bool {
        self.entries.contains(&handle)
    }

    /// Number of handles in the set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the set holds no handles.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the handles in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = ChannelHandle> + '_ {
        self.entries.iter().copied()
    }

    /// Copies the current contents out.
    pub fn snapshot(&self) -> Vec<ChannelHandle> {
        self.entries.clone()
    }
}
