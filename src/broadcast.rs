//! Broadcast message handling: encode a [`Message`] once per room event and
//! fan the same encoded frame out to every recipient, instead of re-encoding
//! per connection.

use crate::codec::server::{Message, ServerCommand};
use bytes::Bytes;
use smallvec::SmallVec;
use std::sync::Arc;

/// Number of players to stack-allocate a recipient list for before
/// spilling to the heap; covers the common room size.
pub const TYPICAL_ROOM_SIZE: usize = 8;

/// A broadcast message wrapper that encodes once and shares the resulting
/// frame bytes across every recipient via `Arc`.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    inner: Arc<Message>,
    encoded: Option<Arc<Bytes>>,
}

impl BroadcastMessage {
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self { inner: Arc::new(message), encoded: None }
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.inner
    }

    /// Gets the wire-encoded `ServerCommand::Message` frame, encoding and
    /// caching it on first use.
    pub fn get_or_encode(&mut self) -> Arc<Bytes> {
        if let Some(bytes) = &self.encoded {
            return bytes.clone();
        }
        let cmd = ServerCommand::Message((*self.inner).clone());
        let bytes = Arc::new(Bytes::from(cmd.encode()));
        self.encoded = Some(bytes.clone());
        bytes
    }

    #[must_use]
    pub fn arc_clone(&self) -> Arc<Message> {
        self.inner.clone()
    }
}

impl From<Message> for BroadcastMessage {
    fn from(msg: Message) -> Self {
        Self::new(msg)
    }
}

impl AsRef<Message> for BroadcastMessage {
    fn as_ref(&self) -> &Message {
        &self.inner
    }
}

/// Recipient list optimized for typical room sizes: stack-allocated up to
/// [`TYPICAL_ROOM_SIZE`] users, heap-allocated beyond that.
pub type UserIdList = SmallVec<[i32; TYPICAL_ROOM_SIZE]>;

/// Broadcast target specification.
#[derive(Debug, Clone)]
pub enum BroadcastTarget {
    Room { users: UserIdList },
    RoomExcept { users: UserIdList, except: i32 },
    User(i32),
}

impl BroadcastTarget {
    #[must_use]
    pub fn room(users: impl IntoIterator<Item = i32>) -> Self {
        Self::Room { users: users.into_iter().collect() }
    }

    #[must_use]
    pub fn room_except(users: impl IntoIterator<Item = i32>, except: i32) -> Self {
        Self::RoomExcept { users: users.into_iter().collect(), except }
    }

    #[must_use]
    pub fn recipient_count(&self) -> usize {
        match self {
            Self::Room { users } => users.len(),
            Self::RoomExcept { users, .. } => users.len().saturating_sub(1),
            Self::User(_) => 1,
        }
    }

    pub fn recipients(&self) -> impl Iterator<Item = i32> + '_ {
        let (users, except) = match self {
            Self::Room { users } => (users.as_slice(), None),
            Self::RoomExcept { users, except } => (users.as_slice(), Some(*except)),
            Self::User(id) => return UserIdIterator::Single(Some(*id)),
        };
        UserIdIterator::Filtered { inner: users.iter().copied(), except }
    }
}

enum UserIdIterator<'a> {
    Single(Option<i32>),
    Filtered { inner: std::iter::Copied<std::slice::Iter<'a, i32>>, except: Option<i32> },
}

impl Iterator for UserIdIterator<'_> {
    type Item = i32;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Single(id) => id.take(),
            Self::Filtered { inner, except } => loop {
                let id = inner.next()?;
                if Some(id) != *except {
                    return Some(id);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message::Chat { user: 1, content: "hi".into() }
    }

    #[test]
    fn encodes_once_and_shares_arc() {
        let mut bm = BroadcastMessage::new(sample_message());
        let bytes1 = bm.get_or_encode();
        let bytes2 = bm.get_or_encode();
        assert!(Arc::ptr_eq(&bytes1, &bytes2));
    }

    #[test]
    fn room_except_excludes_target() {
        let target = BroadcastTarget::room_except([1, 2, 3, 4], 2);
        let recipients: Vec<_> = target.recipients().collect();
        assert_eq!(recipients, vec![1, 3, 4]);
        assert_eq!(target.recipient_count(), 3);
    }

    #[test]
    fn user_id_list_stack_allocated_up_to_typical_room_size() {
        let mut list: UserIdList = SmallVec::new();
        for i in 0..8 {
            list.push(i);
        }
        assert!(!list.spilled());
        list.push(8);
        assert!(list.spilled());
    }
}
