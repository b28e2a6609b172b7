//! Module `index` implement the foreground side of the tree.
//!
//! [Index] can be shared across threads. Writers latch nodes from root
//! to leaf in hand-over-hand fashion, blocking only in the top-down
//! direction. Latches acquired out of that order, the parent latch in
//! remove() and every latch taken by the balancer, are bounded by
//! [Config::lock_timeout].

use log::{debug, error, info, warn};

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use crate::{
    relaxed::{
        arena::Arena,
        balancer::{self, Msg},
        config::Config,
        node::{Color, Handle, Node, Payload, Request, Requests, NIL, ROOT},
        stats::{incr, Counters, Depth, Stats},
    },
    util::{
        spinlock::WriteGuard,
        thread::{Thread, Tx},
    },
    Error, Result,
};

/// Maximum depth of a quiescent tree, beyond which validate() fails.
pub const MAX_TREE_DEPTH: usize = 100;

pub(crate) type NodeW<'a, T> = WriteGuard<'a, Node<T>>;
pub(crate) type Queue = VecDeque<Handle>;

/// Concurrent, relaxed balanced, red-black tree of unique values.
///
/// Writers only do local edits and leave rebalancing requests with a
/// background balancer thread. Once the balancer has drained its
/// requests the tree is a valid red-black tree.
pub struct Index<T>
where
    T: 'static + Ord + Clone + Send + Sync,
{
    name: String,
    inner: Arc<Inner<T>>,
    balancer: Mutex<Option<Thread<Msg, bool, Result<()>>>>,
}

impl<T> Drop for Index<T>
where
    T: 'static + Ord + Clone + Send + Sync,
{
    fn drop(&mut self) {
        // abandon pending requests, but don't leave the thread dangling.
        self.inner.closed.store(true, SeqCst);
        self.inner.close_tx();
        let th = match self.balancer.lock() {
            Ok(mut th) => th.take(),
            Err(_) => None,
        };
        if let Some(th) = th {
            match th.join() {
                Ok(Ok(())) => (),
                Ok(Err(err)) => error!(target: "rrbt", "{:?}, balancer {}", self.name, err),
                Err(err) => error!(target: "rrbt", "{:?}, join {}", self.name, err),
            }
        }
    }
}

impl<T> Index<T>
where
    T: 'static + Ord + Clone + Send + Sync,
{
    /// Create a new tree instance, with default configuration.
    pub fn new(name: &str) -> Result<Index<T>> {
        Index::from_config(Config::new(name))
    }

    /// Create a new tree instance and start its balancer thread.
    pub fn from_config(config: Config) -> Result<Index<T>> {
        config.validate()?;

        let name = config.name.clone();
        let chan_size = config.chan_size;
        let inner = Arc::new(Inner::new(config)?);

        let thread_name = format!("{}-balancer", name);
        let th = {
            let inner = Arc::clone(&inner);
            let main_loop = move |rx| balancer::main_loop(inner, rx);
            match chan_size {
                Some(chan_size) => Thread::new_sync(&thread_name, chan_size, main_loop)?,
                None => Thread::new(&thread_name, main_loop)?,
            }
        };
        inner.set_tx(th.to_tx()?)?;

        info!(target: "rrbt", "{:?}, new tree {:?}", name, inner.config);

        Ok(Index {
            name,
            inner,
            balancer: Mutex::new(Some(th)),
        })
    }

    /// Insert `value` into the tree. Return true if value was added,
    /// false if an equal value was already present.
    pub fn insert(&self, value: T) -> Result<bool> {
        self.inner.check_poison()?;
        let res = self.inner.do_insert(value);
        self.inner.poison(res)
    }

    /// Remove `value` from the tree. Return true if value was present.
    pub fn remove(&self, value: &T) -> Result<bool> {
        self.inner.check_poison()?;
        let res = self.inner.do_remove(value);
        self.inner.poison(res)
    }

    /// Return whether `value` is present in the tree. Read-only, never
    /// blocks writers for longer than a single latch hop.
    pub fn find(&self, value: &T) -> Result<bool> {
        self.inner.check_poison()?;
        let res = self.inner.do_find(value);
        self.inner.poison(res)
    }

    /// Visit every live value in ascending order. Writers can run
    /// concurrently, in which case the walk is not a snapshot. Values
    /// pending removal are skipped.
    pub fn in_order_walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&T),
    {
        self.inner.check_poison()?;
        let res = self.inner.walk(|node, _| {
            if node.is_live_leaf() {
                if let Some(value) = node.value.as_ref() {
                    visit(value)
                }
            }
        });
        self.inner.poison(res)
    }

    /// Return the number of nodes on the longest root-to-leaf path, zero
    /// for an empty tree.
    pub fn height(&self) -> Result<usize> {
        self.inner.check_poison()?;
        let mut height = 0;
        let res = self.inner.walk(|node, depth| {
            if node.is_leaf() && node.value.is_some() {
                height = usize::max(height, depth)
            }
        });
        self.inner.poison(res)?;
        Ok(height)
    }

    /// Block until the balancer has drained every request submitted so
    /// far, or `timeout` elapses. Return false on timeout.
    pub fn wait_quiescent(&self, timeout: Duration) -> Result<bool> {
        self.inner.check_poison()?;
        match self.inner.to_tx()? {
            Some(tx) => Ok(tx.request_for(Msg::Sync, timeout)?.unwrap_or(false)),
            None => Ok(self.inner.drained.load(SeqCst)),
        }
    }

    /// Stop accepting rebalancing work and stop the balancer. Pending
    /// requests are drained for up to [Config::shutdown_timeout]. Return
    /// true if the balancer drained all its requests, in which case the
    /// tree is a valid red-black tree.
    ///
    /// Tree remains usable after shutdown, but writes shall no more be
    /// rebalanced. Calling shutdown more than once is a no-op.
    pub fn shutdown(&self) -> Result<bool> {
        let th = match self.balancer.lock() {
            Ok(mut th) => th.take(),
            Err(err) => err_at!(Fatal, msg: "balancer lock poisoned {}", err)?,
        };
        let th = match th {
            Some(th) => th,
            None => return Ok(self.inner.drained.load(SeqCst)),
        };

        let timeout = self.inner.config.shutdown_timeout;
        let drained = match self.inner.close_tx() {
            Some(tx) => match tx.request_for(Msg::Shutdown, timeout) {
                Ok(Some(drained)) => drained,
                Ok(None) => false,
                Err(err) => {
                    warn!(target: "rrbt", "{:?}, shutdown {}", self.name, err);
                    false
                }
            },
            None => false,
        };
        if !drained {
            self.inner.closed.store(true, SeqCst);
            warn!(
                target: "rrbt",
                "{:?}, balancer did not drain within {:?}", self.name, timeout
            );
        }
        self.inner.drained.store(drained, SeqCst);

        th.join()??;

        info!(target: "rrbt", "{:?}, shutdown drained:{}", self.name, drained);
        Ok(drained)
    }

    /// Return number of live values in the tree.
    pub fn len(&self) -> usize {
        self.inner.n_count.load(SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_name(&self) -> String {
        self.name.clone()
    }
}

impl<T> Index<T>
where
    T: 'static + Ord + Clone + Send + Sync + fmt::Debug,
{
    /// Validate the red-black invariants. Meaningful only when the tree
    /// is quiescent, that is, after [Index::wait_quiescent] or a
    /// draining [Index::shutdown], and with no concurrent writers.
    ///
    /// * Root is black, no red node has a red child.
    /// * Same number of blacks on every root-to-leaf path.
    /// * Every internal node has two children, routing keys bound their
    ///   sub-trees, leaves are strictly ascending.
    /// * Parent hints match the actual links.
    /// * No pending requests, number of leaves matches [Index::len].
    pub fn validate(&self) -> Result<()> {
        self.inner.check_poison()?;
        self.inner.validate().map(|_| ())
    }

    /// Return statistics for this tree. Black count is computed only when
    /// the tree validates.
    pub fn to_stats(&self) -> Result<Stats> {
        self.inner.check_poison()?;

        let inner = &self.inner;
        let mut stats = Stats::new(&self.name, &inner.counters);
        stats.n_count = self.len();
        let (n_slots, n_free) = inner.arena.to_counts();
        stats.n_slots = n_slots;
        stats.n_free = n_free;
        stats.latch_stats = inner.arena.to_latch_stats()?;

        let mut depths = Depth::default();
        inner.walk(|node, depth| {
            if node.is_live_leaf() {
                depths.sample(depth)
            }
        })?;
        stats.depths = Some(depths);

        stats.blacks = match inner.validate() {
            Ok(blacks) => Some(blacks),
            Err(err) => {
                debug!(target: "rrbt", "{:?}, to_stats {}", self.name, err);
                None
            }
        };

        Ok(stats)
    }
}

/// State shared between foreground operations and the balancer thread.
pub(crate) struct Inner<T> {
    pub name: String,
    pub config: Config,
    pub arena: Arena<T>,
    pub counters: Counters,
    /// Set when pending requests are to be abandoned.
    pub closed: AtomicBool,
    pub drained: AtomicBool,

    n_count: AtomicUsize,
    // read to post, write to install or take.
    tx: RwLock<Option<Tx<Msg, bool>>>,
    poisoned: Mutex<Option<Error>>,
}

impl<T> Inner<T> {
    pub fn new(config: Config) -> Result<Inner<T>> {
        Ok(Inner {
            name: config.name.clone(),
            arena: Arena::new(config.slab_size)?,
            config,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),

            n_count: AtomicUsize::new(0),
            tx: RwLock::new(None),
            poisoned: Mutex::new(None),
        })
    }

    pub fn set_tx(&self, tx: Tx<Msg, bool>) -> Result<()> {
        match self.tx.write() {
            Ok(mut val) => *val = Some(tx),
            Err(err) => err_at!(Fatal, msg: "tx lock poisoned {}", err)?,
        }
        Ok(())
    }

    fn to_tx(&self) -> Result<Option<Tx<Msg, bool>>> {
        match self.tx.read() {
            Ok(tx) => Ok(tx.as_ref().cloned()),
            Err(err) => err_at!(Fatal, msg: "tx lock poisoned {}", err),
        }
    }

    fn close_tx(&self) -> Option<Tx<Msg, bool>> {
        match self.tx.write() {
            Ok(mut tx) => tx.take(),
            Err(_) => None,
        }
    }

    /// Hand over a request to the balancer. Shall be called only after
    /// releasing the latch on the node.
    pub fn submit(&self, handle: Handle) {
        incr(&self.counters.submitted);
        let res = match self.tx.read() {
            Ok(tx) => match tx.as_ref() {
                Some(tx) => tx.post(Msg::Request(handle)),
                None => err_at!(IPCFail, msg: "balancer closed"),
            },
            Err(err) => err_at!(IPCFail, msg: "tx lock poisoned {}", err),
        };
        if let Err(err) = res {
            incr(&self.counters.dropped);
            debug!(target: "rrbt", "{:?}, dropped {:?} {}", self.name, handle, err);
        }
    }

    pub fn check_poison(&self) -> Result<()> {
        match self.poisoned.lock() {
            Ok(poisoned) => match poisoned.as_ref() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
            Err(err) => err_at!(Fatal, msg: "poison lock {}", err),
        }
    }

    /// Fatal errors poison the tree, every subsequent call shall fail.
    pub fn poison<X>(&self, res: Result<X>) -> Result<X> {
        if let Err(err @ Error::Fatal(_, _)) = &res {
            error!(target: "rrbt", "{:?}, poisoned {}", self.name, err);
            if let Ok(mut poisoned) = self.poisoned.lock() {
                poisoned.get_or_insert_with(|| err.clone());
            }
        }
        res
    }

    /// Latch `idx` for writing, give up after lock_timeout.
    pub fn try_write(&self, idx: usize) -> Result<Option<NodeW<T>>> {
        let slot = self.arena.slot(idx)?;
        Ok(slot.try_write_for(self.config.lock_timeout))
    }

    /// Latch the parent of `idx` for writing, with timeout. Return None if
    /// latch timed out or the parent hint is stale.
    pub fn lock_parent(&self, idx: usize) -> Result<Option<(usize, NodeW<T>)>> {
        let pidx = self.arena.slot(idx)?.to_parent();
        if pidx == NIL {
            err_at!(Fatal, msg: "node {} without parent", idx)?;
        }
        match self.try_write(pidx)? {
            Some(parent) if !parent.dead && parent.is_parent_of(idx) => Ok(Some((pidx, parent))),
            _ => Ok(None),
        }
    }

    #[inline]
    pub fn set_parent(&self, idx: usize, parent: usize) -> Result<()> {
        if idx != NIL {
            self.arena.slot(idx)?.set_parent(parent)
        }
        Ok(())
    }
}

impl<T> Inner<T>
where
    T: Ord + Clone,
{
    pub fn do_insert(&self, value: T) -> Result<bool> {
        let mut parent: Option<(usize, NodeW<T>)> = None;
        let (mut idx, mut node) = (ROOT, self.arena.slot(ROOT)?.write());

        while node.is_not_leaf() {
            let next = match node.value.as_ref() {
                Some(key) if value.le(key) => node.left,
                Some(_) => node.right,
                None => err_at!(Fatal, msg: "internal node {} without key", idx)?,
            };
            // release grandparent, keep parent latched until the edit.
            drop(parent.take());
            let child = self.arena.slot(next)?.write();
            parent = Some((idx, node));
            idx = next;
            node = child;
        }

        if node.dead {
            err_at!(Fatal, msg: "reached retired slot {}", idx)?;
        }

        if node.value.is_none() {
            if idx != ROOT {
                err_at!(Fatal, msg: "leaf {} without value", idx)?;
            }
            node.value = Some(value);
            node.set_black();
            self.n_count.fetch_add(1, SeqCst);
            return Ok(true);
        }

        if node.requests.remove(Request::Removal) {
            // leaf is pending removal, revive it with the new value.
            node.value = Some(value);
            incr(&self.counters.reuses);
            self.n_count.fetch_add(1, SeqCst);
            return Ok(true);
        }

        if node.value.as_ref() == Some(&value) {
            return Ok(false);
        }

        let key = match node.value.take() {
            Some(key) => key,
            None => err_at!(Fatal, msg: "leaf {} without value", idx)?,
        };
        let (lo, hi) = if value < key { (value, key) } else { (key, value) };

        let left = self.new_leaf(idx, lo.clone())?;
        let right = self.new_leaf(idx, hi)?;
        node.value = Some(lo);
        node.left = left;
        node.right = right;

        // a leaf that owes a black splits into a black node.
        let owed = node.requests.remove(Request::UpOut) && node.is_black();
        let red_parent = parent.as_ref().map_or(false, |(_, p)| p.is_red());
        let handle = if idx == ROOT || owed {
            node.set_black();
            None
        } else {
            node.set_red();
            if red_parent {
                node.requests.insert(Request::UpIn);
                Some(Handle { idx, gen: node.gen })
            } else {
                None
            }
        };
        self.n_count.fetch_add(1, SeqCst);

        drop(node);
        drop(parent);
        if let Some(handle) = handle {
            self.submit(handle);
        }
        Ok(true)
    }

    fn new_leaf(&self, parent: usize, value: T) -> Result<usize> {
        let idx = self.arena.alloc()?;
        let slot = self.arena.slot(idx)?;
        slot.write().set_payload(Payload {
            value: Some(value),
            color: Color::Black,
            left: NIL,
            right: NIL,
            requests: Requests::default(),
        });
        slot.set_parent(parent);
        Ok(idx)
    }

    pub fn do_find(&self, value: &T) -> Result<bool> {
        let (mut idx, mut node) = (ROOT, self.arena.slot(ROOT)?.read());
        while node.is_not_leaf() {
            let next = match node.value.as_ref() {
                Some(key) if value.le(key) => node.left,
                Some(_) => node.right,
                None => err_at!(Fatal, msg: "internal node {} without key", idx)?,
            };
            node = self.arena.slot(next)?.read();
            idx = next;
        }
        Ok(node.is_live_leaf() && node.value.as_ref() == Some(value))
    }

    // descend with write latches, return the leaf latched.
    fn descend_write(&self, value: &T) -> Result<(usize, NodeW<T>)> {
        let (mut idx, mut node) = (ROOT, self.arena.slot(ROOT)?.write());
        while node.is_not_leaf() {
            let next = match node.value.as_ref() {
                Some(key) if value.le(key) => node.left,
                Some(_) => node.right,
                None => err_at!(Fatal, msg: "internal node {} without key", idx)?,
            };
            node = self.arena.slot(next)?.write();
            idx = next;
        }
        Ok((idx, node))
    }

    pub fn do_remove(&self, value: &T) -> Result<bool> {
        let mut restarts = 0;
        loop {
            let (idx, mut node) = self.descend_write(value)?;
            if node.dead {
                err_at!(Fatal, msg: "reached retired slot {}", idx)?;
            }
            if !node.is_live_leaf() || node.value.as_ref() != Some(value) {
                return Ok(false);
            }

            if idx == ROOT {
                node.requests.clear();
                node.value = None;
                self.n_count.fetch_sub(1, SeqCst);
                return Ok(true);
            }

            if restarts >= self.config.remove_restarts {
                // stop contending for the parent, let the balancer unlink.
                node.requests.insert(Request::Removal);
                let handle = Handle { idx, gen: node.gen };
                self.n_count.fetch_sub(1, SeqCst);
                drop(node);

                incr(&self.counters.deferrals);
                debug!(target: "rrbt", "{:?}, deferred removal {:?}", self.name, handle);
                self.submit(handle);
                return Ok(true);
            }

            let (pidx, mut parent) = match self.lock_parent(idx)? {
                Some(res) => res,
                None => {
                    drop(node);
                    restarts += 1;
                    incr(&self.counters.restarts);
                    continue;
                }
            };

            let busy = !parent.requests.is_empty() || !node.requests.is_empty();
            if parent.is_black() || busy {
                node.requests.insert(Request::Removal);
                let handle = Handle { idx, gen: node.gen };
                self.n_count.fetch_sub(1, SeqCst);
                drop(node);
                drop(parent);

                self.submit(handle);
                return Ok(true);
            }

            let sidx = match parent.sibling_of(idx) {
                Some(NIL) | None => err_at!(Fatal, msg: "node {} has no sibling", idx)?,
                Some(sidx) => sidx,
            };
            let sibling = match self.try_write(sidx)? {
                Some(sibling) => sibling,
                None => {
                    drop(parent);
                    drop(node);
                    restarts += 1;
                    incr(&self.counters.restarts);
                    continue;
                }
            };

            let mut moved = Queue::new();
            self.remove_leaf_and_parent(idx, node, pidx, &mut parent, sidx, sibling, &mut moved)?;
            self.n_count.fetch_sub(1, SeqCst);
            drop(parent);

            moved.into_iter().for_each(|handle| self.submit(handle));
            return Ok(true);
        }
    }

    /// Depth first walk, visiting nodes in order with their depth. Holds
    /// a single read latch at a time, retired slots are skipped.
    pub fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Node<T>, usize),
    {
        let mut stack: Vec<(usize, usize, bool)> = vec![(ROOT, 1, false)];
        while let Some((idx, depth, visited)) = stack.pop() {
            let node = self.arena.slot(idx)?.read();
            if node.dead {
                continue;
            }
            if visited || node.is_leaf() {
                visit(&node, depth);
                continue;
            }
            stack.push((node.right, depth + 1, false));
            stack.push((idx, depth, true));
            stack.push((node.left, depth + 1, false));
        }
        Ok(())
    }
}

struct Check<T> {
    prev: Option<T>,
    n_leaves: usize,
}

impl<T> Inner<T>
where
    T: Ord + Clone + fmt::Debug,
{
    // return the number of blacks from root to leaf.
    pub fn validate(&self) -> Result<usize> {
        let (red, empty) = {
            let root = self.arena.slot(ROOT)?.read();
            (root.is_red(), root.value.is_none() && root.is_leaf())
        };
        if red {
            err_at!(Fatal, msg: "root node must be black")?;
        }

        let mut check = Check {
            prev: None,
            n_leaves: 0,
        };
        let blacks = if empty {
            0
        } else {
            self.validate_tree(ROOT, NIL, false, 0, 1, (None, None), &mut check)?
        };

        let n_count = self.n_count.load(SeqCst);
        if check.n_leaves != n_count {
            err_at!(Fatal, msg: "n_count {} != {}", check.n_leaves, n_count)?;
        }
        Ok(blacks)
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_tree(
        &self,
        idx: usize,
        parent: usize,
        fromred: bool,
        mut n_blacks: usize,
        depth: usize,
        bounds: (Option<T>, Option<T>),
        check: &mut Check<T>,
    ) -> Result<usize> {
        let slot = self.arena.slot(idx)?;
        if idx != ROOT && slot.to_parent() != parent {
            let hint = slot.to_parent();
            err_at!(Fatal, msg: "node {} parent hint {} != {}", idx, hint, parent)?;
        }

        let node = slot.read();
        if node.dead {
            err_at!(Fatal, msg: "retired slot {} linked into tree", idx)?;
        }
        if !node.requests.is_empty() {
            err_at!(Fatal, msg: "pending requests {:?} at {}", node.requests, idx)?;
        }
        let red = node.is_red();
        if fromred && red {
            err_at!(Fatal, msg: "tree has consecutive reds at {}", idx)?;
        }
        if !red {
            n_blacks += 1;
        }
        if depth > MAX_TREE_DEPTH {
            err_at!(Fatal, msg: "tree exceeds max_depth {}", depth)?;
        }

        let value = match node.value.clone() {
            Some(value) => value,
            None => err_at!(Fatal, msg: "node {} without value", idx)?,
        };
        // left sub-tree is <= key, right sub-tree is > key.
        let (lo, hi) = bounds;
        if let Some(lo) = lo.as_ref() {
            if value.le(lo) {
                err_at!(Fatal, msg: "node {} {:?} <= lower {:?}", idx, value, lo)?;
            }
        }
        if let Some(hi) = hi.as_ref() {
            if value.gt(hi) {
                err_at!(Fatal, msg: "node {} {:?} > upper {:?}", idx, value, hi)?;
            }
        }

        match (node.left, node.right) {
            (NIL, NIL) => {
                if let Some(prev) = check.prev.as_ref() {
                    if prev.ge(&value) {
                        err_at!(Fatal, msg: "leaves out of order {:?} {:?}", prev, value)?;
                    }
                }
                check.prev = Some(value);
                check.n_leaves += 1;
                Ok(n_blacks)
            }
            (NIL, _) | (_, NIL) => err_at!(Fatal, msg: "node {} with one child", idx),
            (left, right) => {
                drop(node);
                let lb = {
                    let bounds = (lo.clone(), Some(value.clone()));
                    self.validate_tree(left, idx, red, n_blacks, depth + 1, bounds, check)?
                };
                let rb = {
                    let bounds = (Some(value), hi);
                    self.validate_tree(right, idx, red, n_blacks, depth + 1, bounds, check)?
                };
                if lb != rb {
                    err_at!(Fatal, msg: "tree unbalanced blacks l:{}, r:{}", lb, rb)?;
                }
                Ok(lb)
            }
        }
    }
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;
