//! Package implement a concurrent, relaxed balanced, red-black tree.
//!
//! Relaxed balancing decouples the update of a search-tree from the
//! re-balancing work that the update implies. Application threads
//! insert, remove and search values concurrently, taking per-node
//! reader-writer latches in a hand-over-hand fashion. When an update
//! leaves the tree only locally inconsistent, a _request_ is tagged on
//! the affected node and handed over to a single background thread, the
//! balancer, which does the actual recoloring and rotations.
//!
//! Strict red-black invariants are guaranteed only when the tree is
//! quiescent, that is, when no node has a pending request. Refer to
//! [relaxed::Index] for the API.
//!
//! Relaxed balancing is described in, _Relaxed Balanced Red-Black Trees_,
//! S. Hanke, T. Ottmann, E. Soisalon-Soininen.

#[macro_use]
mod error;
pub mod relaxed;
pub mod util;

pub use crate::error::{Error, Result};
