//! Module implement relaxed balanced red-black tree with concurrent
//! readers and writers.
//!
//! The tree is _leaf oriented_, values are held only in leaf nodes and
//! internal nodes carry a routing key. Every internal node has exactly
//! two children. Nodes are held in an arena of slots, each slot with
//! its own read-write latch, and referred to by their slot index.
//!
//! Writers latch nodes hand-over-hand from root to leaf, do a local edit
//! and return. Rebalancing is left to the balancer thread, which is
//! handed over one of the following requests on a node:
//!
//! * _up-in_, node and its parent are both red.
//! * _up-out_, node is short by one black, on every path through it.
//! * _removal_, leaf is logically removed but not yet unlinked.
//!
//! Rotations are done by copying payload between slots, so that a slot
//! continues to represent the same tree position after rotation.

mod arena;
mod balancer;
mod config;
mod index;
mod node;
mod stats;

pub use config::Config;
pub use index::Index;
pub use node::Color;
pub use stats::{Depth, Stats};
