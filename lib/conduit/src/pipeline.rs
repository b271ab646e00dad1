//! Ordered, type-dispatched handler chains. Each channel carries one chain
//! per direction; handlers declare the payload type they act on and may
//! rewrite the in-flight object into a value of a different type, changing
//! what the rest of the chain gets matched against.

use crate::channel::Channel;
use lumen::shared::{NetworkError, NetworkResult};
use std::any::{Any, TypeId};

pub type Handler = Box<dyn FnMut(&mut Channel, &mut Item) -> NetworkResult<()>>;

/// The object travelling through a chain. Starts out as whatever was fed
/// into the dispatch (raw bytes on the receive path, an application frame on
/// the send path) and gets progressively rewritten by handlers.
pub struct Item {
    value: Option<Box<dyn Any>>,
}

impl Item {
    #[inline]
    pub fn new<T: Any>(value: T) -> Item {
        Item {
            value: Some(Box::new(value)),
        }
    }

    #[inline]
    pub fn empty() -> Item {
        Item { value: None }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Dynamic type of the carried value, if any.
    #[inline]
    pub fn type_id(&self) -> Option<TypeId> {
        self.value.as_ref().map(|value| value.as_ref().type_id())
    }

    #[inline]
    pub fn is<T: Any>(&self) -> bool {
        self.type_id() == Some(TypeId::of::<T>())
    }

    #[inline]
    pub fn get_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|value| value.downcast_ref())
    }

    #[inline]
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_mut().and_then(|value| value.downcast_mut())
    }

    /// Replace the carried value. The previous value is dropped, which is
    /// how intermediate objects no handler consumed get disposed.
    #[inline]
    pub fn put<T: Any>(&mut self, value: T) {
        self.value = Some(Box::new(value));
    }

    /// Remove and return the carried value if it has the requested type,
    /// leaving the item empty.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        if !self.is::<T>() {
            return None;
        }

        self.value
            .take()
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Identity of an installed handler, used for removal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HandlerId(u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Incoming = 0,
    Outgoing = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Position {
    First,
    Last,
}

struct Entry {
    id: HandlerId,
    type_id: TypeId,
    // Taken out while the handler executes so the chain can be mutated
    // underneath it.
    handler: Option<Handler>,
}

#[derive(Default)]
pub struct Chain {
    entries: Vec<Entry>,
}

impl Chain {
    fn insert(&mut self, position: Position, entry: Entry) {
        match position {
            Position::First => self.entries.insert(0, entry),
            Position::Last => self.entries.push(entry),
        }
    }

    fn remove(&mut self, id: HandlerId) {
        self.entries.retain(|entry| entry.id != id);
    }

    fn position_of(&self, id: HandlerId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Run the chain over `item`. Entries whose declared type does not match
    /// the current dynamic type of the item are skipped; mutations issued by
    /// a handler are visible to the entries after it in the same pass.
    pub(crate) fn dispatch(
        &mut self,
        channel: &mut Channel,
        direction: Direction,
        item: &mut Item,
    ) -> NetworkResult<()> {
        let mut index = 0;

        while index < self.entries.len() {
            if Some(self.entries[index].type_id) != Item::type_id(item) {
                index += 1;
                continue;
            }

            let id = self.entries[index].id;
            let mut handler = match self.entries[index].handler.take() {
                Some(handler) => handler,
                None => {
                    index += 1;
                    continue;
                }
            };

            let result = handler(channel, item);

            if let Some(position) = self.position_of(id) {
                self.entries[position].handler = Some(handler);
            }

            for op in channel.pipeline_pending(direction) {
                self.apply(op);
            }

            result?;

            // Continue after the entry that just ran; if it removed itself,
            // the next entry has shifted into its slot.
            index = match self.position_of(id) {
                Some(position) => position + 1,
                None => index,
            };
        }

        Ok(())
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Add { position, entry, .. } => self.insert(position, entry),
            Op::Remove { id, .. } => self.remove(id),
        }
    }
}

pub(crate) enum Op {
    Add {
        direction: Direction,
        position: Position,
        entry: Entry,
    },
    Remove {
        direction: Direction,
        id: HandlerId,
    },
}

impl Op {
    fn direction(&self) -> Direction {
        match self {
            Op::Add { direction, .. } => *direction,
            Op::Remove { direction, .. } => *direction,
        }
    }
}

/// The handler chains of one channel. Mutations requested while the matching
/// chain is mid-dispatch are queued and folded in between handler
/// invocations, so readers observe a live view of the list.
pub struct Pipeline {
    chains: [Chain; 2],
    dispatching: [bool; 2],
    pending: Vec<Op>,
    next_id: u64,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline {
            chains: [Chain::default(), Chain::default()],
            dispatching: [false, false],
            pending: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn add(
        &mut self,
        direction: Direction,
        position: Position,
        type_id: TypeId,
        handler: Handler,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let entry = Entry {
            id,
            type_id,
            handler: Some(handler),
        };

        if self.dispatching[direction as usize] {
            self.pending.push(Op::Add {
                direction,
                position,
                entry,
            });
        } else {
            self.chains[direction as usize].insert(position, entry);
        }

        id
    }

    pub(crate) fn remove(&mut self, direction: Direction, id: HandlerId) {
        if self.dispatching[direction as usize] {
            self.pending.push(Op::Remove { direction, id });
        } else {
            self.chains[direction as usize].remove(id);
        }
    }

    /// Take the chain out for dispatching. The chain slot is left empty so a
    /// nested dispatch in the same direction runs over nothing instead of
    /// re-entering handlers.
    pub(crate) fn begin_dispatch(&mut self, direction: Direction) -> Chain {
        self.dispatching[direction as usize] = true;
        std::mem::take(&mut self.chains[direction as usize])
    }

    /// Put the chain back and fold in any still-queued mutations.
    pub(crate) fn end_dispatch(&mut self, direction: Direction, mut chain: Chain) {
        self.dispatching[direction as usize] = false;

        for op in self.take_pending(direction) {
            chain.apply(op);
        }

        self.chains[direction as usize] = chain;
    }

    pub(crate) fn take_pending(&mut self, direction: Direction) -> Vec<Op> {
        let mut taken = Vec::new();
        let mut index = 0;

        while index < self.pending.len() {
            if self.pending[index].direction() == direction {
                taken.push(self.pending.remove(index));
            } else {
                index += 1;
            }
        }

        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChunkPool;
    use crate::channel::Channel;
    use crate::config::ChannelConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn test_channel() -> Channel {
        let pool = Arc::new(ChunkPool::new(256));
        Channel::new(&pool, ChannelConfig::default(), None)
    }

    #[test]
    fn test_typed_dispatch_skips_mismatches() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let trace = log.clone();
        channel.add_incoming_last::<String, _>(move |_, _| {
            trace.borrow_mut().push("string");
            Ok(())
        });

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("u32");
            Ok(())
        });

        let mut item = Item::new(42u32);
        channel.handle_incoming(&mut item).unwrap();

        assert_eq!(*log.borrow(), vec!["u32"]);
    }

    #[test]
    fn test_rewrite_redirects_subsequent_dispatch() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let trace = log.clone();
        channel.add_incoming_last::<String, _>(move |_, item| {
            trace.borrow_mut().push("string");
            let text = item.take::<String>().unwrap();
            item.put(text.len() as u32);
            Ok(())
        });

        let trace = log.clone();
        channel.add_incoming_last::<String, _>(move |_, _| {
            trace.borrow_mut().push("string-again");
            Ok(())
        });

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, item| {
            trace.borrow_mut().push("u32");
            assert_eq!(*item.get_ref::<u32>().unwrap(), 5);
            Ok(())
        });

        let mut item = Item::new("hello".to_string());
        channel.handle_incoming(&mut item).unwrap();

        // The second String handler is skipped because the object was
        // rewritten into a u32 before it was reached.
        assert_eq!(*log.borrow(), vec!["string", "u32"]);
    }

    #[test]
    fn test_first_last_ordering() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in &["a", "b"] {
            let trace = log.clone();
            let tag = *name;
            channel.add_incoming_last::<u32, _>(move |_, _| {
                trace.borrow_mut().push(tag);
                Ok(())
            });
        }

        let trace = log.clone();
        channel.add_incoming_first::<u32, _>(move |_, _| {
            trace.borrow_mut().push("front");
            Ok(())
        });

        let mut item = Item::new(1u32);
        channel.handle_incoming(&mut item).unwrap();

        assert_eq!(*log.borrow(), vec!["front", "a", "b"]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let trace = log.clone();
        let id = channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("doomed");
            Ok(())
        });

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("kept");
            Ok(())
        });

        channel.remove_incoming(id);

        let mut item = Item::new(1u32);
        channel.handle_incoming(&mut item).unwrap();

        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn test_mid_dispatch_add_runs_in_same_pass() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |chan, _| {
            trace.borrow_mut().push("installer");
            let inner = trace.clone();
            chan.add_incoming_last::<u32, _>(move |_, _| {
                inner.borrow_mut().push("installed");
                Ok(())
            });
            Ok(())
        });

        let mut item = Item::new(1u32);
        channel.handle_incoming(&mut item).unwrap();

        // The freshly-added entry is a subsequent entry of the same pass.
        assert_eq!(*log.borrow(), vec!["installer", "installed"]);

        // The installer keeps adding one more entry per pass; both run next
        // time around.
        log.borrow_mut().clear();
        let mut item = Item::new(2u32);
        channel.handle_incoming(&mut item).unwrap();

        assert_eq!(*log.borrow(), vec!["installer", "installed", "installed"]);
    }

    #[test]
    fn test_mid_dispatch_remove_self() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let slot: Rc<RefCell<Option<HandlerId>>> = Rc::new(RefCell::new(None));

        let trace = log.clone();
        let own_id = slot.clone();
        let id = channel.add_incoming_last::<u32, _>(move |chan, _| {
            trace.borrow_mut().push("once");
            let id = own_id.borrow().unwrap();
            chan.remove_incoming(id);
            Ok(())
        });
        *slot.borrow_mut() = Some(id);

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("after");
            Ok(())
        });

        let mut item = Item::new(1u32);
        channel.handle_incoming(&mut item).unwrap();
        let mut item = Item::new(2u32);
        channel.handle_incoming(&mut item).unwrap();

        // The self-removing handler ran exactly once; the entry after it ran
        // in both passes.
        assert_eq!(*log.borrow(), vec!["once", "after", "after"]);
    }

    #[test]
    fn test_incomplete_ends_pass_quietly() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("starved");
            Err(NetworkError::Incomplete)
        });

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("unreached");
            Ok(())
        });

        let mut item = Item::new(1u32);
        let result = channel.handle_incoming(&mut item);

        assert_eq!(result.unwrap_err(), NetworkError::Incomplete);
        assert_eq!(*log.borrow(), vec!["starved"]);
    }

    #[test]
    fn test_empty_item_matches_nothing() {
        let mut channel = test_channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let trace = log.clone();
        channel.add_incoming_last::<u32, _>(move |_, _| {
            trace.borrow_mut().push("typed");
            Ok(())
        });

        let mut item = Item::empty();
        channel.handle_incoming(&mut item).unwrap();

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_item_accessors() {
        let mut item = Item::new(7u32);

        assert!(item.is::<u32>());
        assert!(!item.is::<String>());
        assert_eq!(item.take::<String>(), None);
        assert_eq!(item.take::<u32>(), Some(7));
        assert!(item.is_empty());
    }
}
