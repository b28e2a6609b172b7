use std::{fmt, result};

/// Reserved slot for the shared sentinel, never latched, never mutated.
pub const NIL: usize = 0;
/// Reserved slot for the root position. Rotations and unlinks copy
/// payload into a fixed slot, hence the root never moves.
pub const ROOT: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

/// Rebalancing obligations attached to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Node and its parent are both red.
    UpIn,
    /// Every path through this node is one black short.
    UpOut,
    /// Leaf is logically deleted, but not yet unlinked.
    Removal,
}

impl Request {
    #[inline]
    fn to_bit(self) -> u8 {
        match self {
            Request::UpIn => 0x1,
            Request::UpOut => 0x2,
            Request::Removal => 0x4,
        }
    }
}

/// Set of pending [Request]s, duplicates are suppressed.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Requests(u8);

impl Requests {
    #[inline]
    pub fn insert(&mut self, req: Request) {
        self.0 |= req.to_bit()
    }

    /// Remove `req` from the set, return whether it was present.
    #[inline]
    pub fn remove(&mut self, req: Request) -> bool {
        let ok = self.contains(req);
        self.0 &= !req.to_bit();
        ok
    }

    #[inline]
    pub fn contains(&self, req: Request) -> bool {
        (self.0 & req.to_bit()) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0
    }

    /// Return the pending requests, in the order they shall be handled.
    pub fn to_vec(&self) -> Vec<Request> {
        [Request::UpOut, Request::UpIn, Request::Removal]
            .iter()
            .copied()
            .filter(|r| self.contains(*r))
            .collect()
    }
}

impl fmt::Debug for Requests {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{:?}", self.to_vec())
    }
}

/// Node payload, guarded by the latch of its slot.
///
/// A node does not own its children, it refers to them by their slot
/// index. Sentinel is referred to as [NIL].
pub struct Node<T> {
    pub value: Option<T>,
    pub color: Color,
    pub left: usize,
    pub right: usize,
    pub requests: Requests,
    /// Incremented every time the slot is retired.
    pub gen: u32,
    pub dead: bool,
}

impl<T> Default for Node<T> {
    fn default() -> Node<T> {
        Node {
            value: None,
            color: Color::Black,
            left: NIL,
            right: NIL,
            requests: Requests::default(),
            gen: 0,
            dead: false,
        }
    }
}

impl<T> Node<T> {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.left == NIL && self.right == NIL
    }

    #[inline]
    pub fn is_not_leaf(&self) -> bool {
        !self.is_leaf()
    }

    #[inline]
    pub fn is_red(&self) -> bool {
        self.color == Color::Red
    }

    #[inline]
    pub fn is_black(&self) -> bool {
        self.color == Color::Black
    }

    #[inline]
    pub fn set_red(&mut self) {
        self.color = Color::Red
    }

    #[inline]
    pub fn set_black(&mut self) {
        self.color = Color::Black
    }

    /// Leaf that holds a value and is not marked for removal.
    #[inline]
    pub fn is_live_leaf(&self) -> bool {
        self.is_leaf() && self.value.is_some() && !self.requests.contains(Request::Removal)
    }

    /// Return the other child of this node, if `child` is one of its child.
    pub fn sibling_of(&self, child: usize) -> Option<usize> {
        if self.left == child {
            Some(self.right)
        } else if self.right == child {
            Some(self.left)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_parent_of(&self, child: usize) -> bool {
        child != NIL && (self.left == child || self.right == child)
    }

    /// Move out the payload, leaving the node retired.
    pub fn take_payload(&mut self) -> Payload<T> {
        let payload = Payload {
            value: self.value.take(),
            color: self.color,
            left: self.left,
            right: self.right,
            requests: self.requests,
        };
        self.retire();
        payload
    }

    /// Overwrite the node's payload, node's generation is preserved.
    pub fn set_payload(&mut self, payload: Payload<T>) {
        self.value = payload.value;
        self.color = payload.color;
        self.left = payload.left;
        self.right = payload.right;
        self.requests = payload.requests;
        self.dead = false;
    }

    /// Swap in a new payload, return the old one. Unlike
    /// [Node::take_payload], node is not retired.
    pub fn replace_payload(&mut self, payload: Payload<T>) -> Payload<T> {
        let old = Payload {
            value: self.value.take(),
            color: self.color,
            left: self.left,
            right: self.right,
            requests: self.requests,
        };
        self.set_payload(payload);
        old
    }

    pub fn retire(&mut self) {
        self.value = None;
        self.left = NIL;
        self.right = NIL;
        self.requests.clear();
        self.gen = self.gen.wrapping_add(1);
        self.dead = true;
    }
}

/// Everything a node carries except its identity.
pub struct Payload<T> {
    pub value: Option<T>,
    pub color: Color,
    pub left: usize,
    pub right: usize,
    pub requests: Requests,
}

/// Reference to a node position, as queued with the balancer. If the
/// slot was retired after the handle was created, generation shall
/// mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    pub idx: usize,
    pub gen: u32,
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
