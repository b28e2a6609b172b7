//! Module `balancer` implement the background thread that repairs the
//! tree, one request at a time.
//!
//! Every handler latches the node named by the request, and then its
//! neighbourhood, using bounded try-locks. If any latch times out, or
//! the neighbourhood has changed underneath, the request is put back
//! in the queue and retried later. Handlers either fully apply a
//! transformation or leave the tree untouched.

use log::{debug, error, info};

use std::{
    mem,
    sync::{atomic::Ordering::SeqCst, mpsc, Arc},
};

use crate::{
    relaxed::{
        index::{Inner, NodeW, Queue},
        node::{Handle, Payload, Request, NIL, ROOT},
        stats::incr,
    },
    util::thread::Rx,
    Result,
};

/// Messages handled by the balancer thread.
pub(crate) enum Msg {
    /// Process the requests pending on the node.
    Request(Handle),
    /// Respond once the request queue is empty.
    Sync,
    /// Drain the request queue, respond, and exit.
    Shutdown,
}

pub(crate) fn main_loop<T>(inner: Arc<Inner<T>>, rx: Rx<Msg, bool>) -> impl FnOnce() -> Result<()>
where
    T: 'static + Ord + Clone + Send + Sync,
{
    move || {
        let mut balancer = Balancer {
            inner,
            queue: Queue::new(),
            syncs: vec![],
        };
        info!(target: "rrbt", "{:?}, balancer started", balancer.inner.name);

        let res = balancer.run(rx);

        let name = &balancer.inner.name;
        let n = balancer.queue.len();
        match &res {
            Ok(()) => info!(target: "rrbt", "{:?}, balancer stopped, {} pending", name, n),
            Err(err) => error!(target: "rrbt", "{:?}, balancer failed {}", name, err),
        }
        res
    }
}

struct Balancer<T> {
    inner: Arc<Inner<T>>,
    queue: Queue,
    syncs: Vec<mpsc::Sender<bool>>,
}

impl<T> Balancer<T>
where
    T: Ord + Clone,
{
    fn run(&mut self, rx: Rx<Msg, bool>) -> Result<()> {
        let mut shutdown: Option<Option<mpsc::Sender<bool>>> = None;

        loop {
            if self.inner.closed.load(SeqCst) {
                break Ok(());
            }

            if self.queue.is_empty() {
                for tx in mem::take(&mut self.syncs).into_iter() {
                    tx.send(true).ok();
                }
                if let Some(tx) = shutdown.take() {
                    if let Some(tx) = tx {
                        tx.send(true).ok();
                    }
                    break Ok(());
                }
                match rx.recv() {
                    Ok(msg) => self.handle_msg(msg, &mut shutdown),
                    Err(_) => break Ok(()),
                }
            }
            // gather whatever is pending on the channel.
            while let Ok(msg) = rx.try_recv() {
                self.handle_msg(msg, &mut shutdown);
            }

            if let Some(handle) = self.queue.pop_front() {
                if let Err(err) = self.process(handle) {
                    break self.inner.poison(Err(err));
                }
            }
        }
    }

    fn handle_msg(
        &mut self,
        msg: (Msg, Option<mpsc::Sender<bool>>),
        shutdown: &mut Option<Option<mpsc::Sender<bool>>>,
    ) {
        match msg {
            (Msg::Request(handle), _) => self.queue.push_back(handle),
            (Msg::Sync, Some(tx)) => self.syncs.push(tx),
            (Msg::Sync, None) => (),
            (Msg::Shutdown, tx) => *shutdown = Some(tx),
        }
    }

    fn process(&mut self, handle: Handle) -> Result<()> {
        let Balancer { inner, queue, .. } = self;
        incr(&inner.counters.processed);

        let slot = inner.arena.slot(handle.idx)?;
        let node = match slot.try_write_for(inner.config.lock_timeout) {
            Some(node) => node,
            None => {
                incr(&inner.counters.retried);
                queue.push_back(handle);
                return Ok(());
            }
        };
        if node.dead || node.gen != handle.gen {
            // slot was retired, requests if any have moved along with
            // the payload and re-submitted.
            return Ok(());
        }

        let requests = node.requests.to_vec();
        if requests.len() > 1 {
            queue.push_back(handle);
        }
        match requests.first() {
            Some(Request::UpOut) => inner.handle_up_out(handle, node, queue),
            Some(Request::UpIn) => inner.handle_up_in(handle, node, queue),
            Some(Request::Removal) => inner.handle_removal(handle, node, queue),
            None => Ok(()),
        }
    }
}

// Outcome of latching a child that can be the sentinel.
enum Child<'a, T> {
    Nil,
    Latched(NodeW<'a, T>),
    Busy,
}

impl<'a, T> Child<'a, T> {
    fn is_red(&self) -> bool {
        match self {
            Child::Latched(node) => node.is_red(),
            _ => false,
        }
    }

    fn owes_black(&self) -> bool {
        match self {
            Child::Latched(node) => node.requests.contains(Request::UpOut),
            _ => false,
        }
    }

    fn into_node(self, idx: usize) -> Result<NodeW<'a, T>> {
        match self {
            Child::Latched(node) => Ok(node),
            _ => err_at!(Fatal, msg: "expected child at {}", idx),
        }
    }
}

impl<T> Inner<T>
where
    T: Ord + Clone,
{
    fn latch_child(&self, idx: usize) -> Result<Child<T>> {
        match idx {
            NIL => Ok(Child::Nil),
            idx => match self.try_write(idx)? {
                Some(node) => Ok(Child::Latched(node)),
                None => Ok(Child::Busy),
            },
        }
    }

    // put `req` back on the node and queue it for later.
    fn requeue(&self, queue: &mut Queue, idx: usize, mut node: NodeW<T>, req: Request) -> Result<()> {
        node.requests.insert(req);
        incr(&self.counters.retried);
        queue.push_back(Handle { idx, gen: node.gen });
        Ok(())
    }

    // retry the requests pending on `h`, later.
    fn retry(&self, queue: &mut Queue, h: Handle) -> Result<()> {
        incr(&self.counters.retried);
        queue.push_back(h);
        Ok(())
    }

    // queue a fresh request, generated while repairing the tree.
    fn enqueue(&self, queue: &mut Queue, idx: usize, node: &mut NodeW<T>, req: Request) {
        node.requests.insert(req);
        incr(&self.counters.submitted);
        queue.push_back(Handle { idx, gen: node.gen });
    }

    // A red node owing a black is as good as a black node.
    fn settle(&self, node: &mut NodeW<T>) {
        if node.is_red() && node.requests.remove(Request::UpOut) {
            node.set_black();
            incr(&self.counters.recolors);
        }
    }

    /// Repair a red node with a red parent.
    pub fn handle_up_in<'a>(
        &'a self,
        h: Handle,
        mut n: NodeW<'a, T>,
        queue: &mut Queue,
    ) -> Result<()> {
        n.requests.remove(Request::UpIn);
        self.settle(&mut n);
        if h.idx == ROOT {
            if n.is_red() {
                n.set_black();
                incr(&self.counters.recolors);
            }
            return Ok(());
        } else if n.is_black() {
            return Ok(());
        }

        let (pidx, mut p) = match self.lock_parent(h.idx)? {
            Some(res) => res,
            None => return self.requeue(queue, h.idx, n, Request::UpIn),
        };
        self.settle(&mut p);
        if p.is_black() {
            return Ok(());
        } else if pidx == ROOT {
            p.set_black();
            incr(&self.counters.recolors);
            return Ok(());
        }

        let (gidx, mut g) = match self.lock_parent(pidx)? {
            Some(res) => res,
            None => {
                drop(p);
                return self.requeue(queue, h.idx, n, Request::UpIn);
            }
        };
        self.settle(&mut g);
        if g.is_red() {
            // parent and grandparent violate as well, fix them first.
            self.enqueue(queue, pidx, &mut p, Request::UpIn);
            drop(g);
            drop(p);
            return self.requeue(queue, h.idx, n, Request::UpIn);
        } else if g.requests.contains(Request::UpOut) {
            drop(g);
            drop(p);
            return self.requeue(queue, h.idx, n, Request::UpIn);
        }

        let uidx = match g.sibling_of(pidx) {
            Some(uidx) => uidx,
            None => err_at!(Fatal, msg: "{} not a child of {}", pidx, gidx)?,
        };
        let mut u = match self.latch_child(uidx)? {
            Child::Busy => {
                drop(g);
                drop(p);
                return self.requeue(queue, h.idx, n, Request::UpIn);
            }
            u => u,
        };
        if let Child::Latched(u) = &mut u {
            self.settle(u);
            if u.requests.contains(Request::UpOut) {
                drop(g);
                drop(p);
                return self.requeue(queue, h.idx, n, Request::UpIn);
            }
        }

        if u.is_red() {
            let mut u = u.into_node(uidx)?;
            p.set_black();
            u.set_black();
            if gidx != ROOT {
                g.set_red();
                self.enqueue(queue, gidx, &mut g, Request::UpIn);
            }
            incr(&self.counters.recolors);
            return Ok(());
        }
        drop(u);

        let (p_left, n_left) = (g.left == pidx, p.left == h.idx);
        let mut m = match (p_left, n_left) {
            (true, true) => self.right_rotate(gidx, &mut g, pidx, p, queue)?,
            (false, false) => self.left_rotate(gidx, &mut g, pidx, p, queue)?,
            (true, false) => {
                self.left_rotate(pidx, &mut p, h.idx, n, queue)?;
                self.right_rotate(gidx, &mut g, pidx, p, queue)?
            }
            (false, true) => {
                self.right_rotate(pidx, &mut p, h.idx, n, queue)?;
                self.left_rotate(gidx, &mut g, pidx, p, queue)?
            }
        };
        g.set_black();
        m.set_red();

        Ok(())
    }

    /// Repair a node that owes one black, to every path through it.
    pub fn handle_up_out<'a>(
        &'a self,
        h: Handle,
        mut n: NodeW<'a, T>,
        queue: &mut Queue,
    ) -> Result<()> {
        if h.idx == ROOT {
            n.requests.remove(Request::UpOut);
            return Ok(());
        } else if n.is_red() {
            self.settle(&mut n);
            return Ok(());
        } else if !n.requests.contains(Request::UpOut) {
            return Ok(());
        }

        let (pidx, mut p) = match self.lock_parent(h.idx)? {
            Some(res) => res,
            None => return self.retry(queue, h),
        };
        self.settle(&mut p);
        if p.requests.contains(Request::UpOut) {
            // parent owes a black as well, wait for it.
            drop(p);
            return self.retry(queue, h);
        }

        let widx = match p.sibling_of(h.idx) {
            Some(NIL) | None => err_at!(Fatal, msg: "node {} has no sibling", h.idx)?,
            Some(widx) => widx,
        };
        let mut w = match self.try_write(widx)? {
            Some(w) => w,
            None => {
                drop(p);
                return self.retry(queue, h);
            }
        };
        self.settle(&mut w);
        let n_left = p.left == h.idx;

        let (pidx, mut p, widx, mut w) = if w.is_red() {
            if p.is_red() {
                // sibling and parent violate, fix them first.
                self.enqueue(queue, widx, &mut w, Request::UpIn);
                drop(w);
                drop(p);
                return self.retry(queue, h);
            }
            // near child of the red sibling becomes the new sibling, latch
            // it before rotating.
            let near_idx = if n_left { w.left } else { w.right };
            if near_idx == NIL {
                err_at!(Fatal, msg: "red sibling {} without children", widx)?;
            }
            let near = match self.try_write(near_idx)? {
                Some(near) => near,
                None => {
                    drop(w);
                    drop(p);
                    return self.retry(queue, h);
                }
            };
            // turn the red sibling into the parent, n continues under a
            // red parent with a black sibling.
            let mut m = if n_left {
                self.left_rotate(pidx, &mut p, widx, w, queue)?
            } else {
                self.right_rotate(pidx, &mut p, widx, w, queue)?
            };
            p.set_black();
            m.set_red();
            let midx = if n_left { p.left } else { p.right };
            drop(p);
            (midx, m, near_idx, near)
        } else {
            (pidx, p, widx, w)
        };
        self.settle(&mut w);

        if w.requests.contains(Request::UpOut) {
            // both sides owe a black, parent shall pay for both.
            n.requests.remove(Request::UpOut);
            w.requests.remove(Request::UpOut);
            self.pay_black(queue, pidx, &mut p);
            return Ok(());
        }

        let (near_idx, far_idx) = if n_left {
            (w.left, w.right)
        } else {
            (w.right, w.left)
        };
        let mut near = match self.latch_child(near_idx)? {
            Child::Busy => {
                drop(w);
                drop(p);
                return self.retry(queue, h);
            }
            near => near,
        };
        let mut far = match self.latch_child(far_idx)? {
            Child::Busy => {
                drop(near);
                drop(w);
                drop(p);
                return self.retry(queue, h);
            }
            far => far,
        };
        if let Child::Latched(near) = &mut near {
            self.settle(near);
        }
        if let Child::Latched(far) = &mut far {
            self.settle(far);
        }
        if near.owes_black() || far.owes_black() {
            // nephews shall settle their own debt first.
            drop(far);
            drop(near);
            drop(w);
            drop(p);
            return self.retry(queue, h);
        }

        let mut far = match (near.is_red(), far.is_red()) {
            (false, false) => {
                n.requests.remove(Request::UpOut);
                w.set_red();
                incr(&self.counters.recolors);
                self.pay_black(queue, pidx, &mut p);
                return Ok(());
            }
            (true, false) => {
                // move the red to the far side.
                drop(far);
                let near = near.into_node(near_idx)?;
                let mut m = if n_left {
                    self.right_rotate(widx, &mut w, near_idx, near, queue)?
                } else {
                    self.left_rotate(widx, &mut w, near_idx, near, queue)?
                };
                w.set_black();
                m.set_red();
                m
            }
            (_, true) => {
                drop(near);
                far.into_node(far_idx)?
            }
        };

        n.requests.remove(Request::UpOut);
        let color = p.color;
        let mut m = if n_left {
            self.left_rotate(pidx, &mut p, widx, w, queue)?
        } else {
            self.right_rotate(pidx, &mut p, widx, w, queue)?
        };
        p.color = color;
        m.set_black();
        far.set_black();
        incr(&self.counters.recolors);
        Ok(())
    }

    // `p` absorbs one black on behalf of its sub-trees.
    fn pay_black(&self, queue: &mut Queue, pidx: usize, p: &mut NodeW<T>) {
        if p.is_red() {
            p.set_black();
            incr(&self.counters.recolors);
        } else if pidx != ROOT {
            self.enqueue(queue, pidx, p, Request::UpOut);
        }
    }

    /// Unlink a leaf that is pending removal, along with its parent.
    pub fn handle_removal<'a>(
        &'a self,
        h: Handle,
        n: NodeW<'a, T>,
        queue: &mut Queue,
    ) -> Result<()> {
        if n.is_not_leaf() || n.value.is_none() {
            err_at!(Fatal, msg: "removal on {}, not a valued leaf", h.idx)?;
        }

        if h.idx == ROOT {
            let mut n = n;
            n.requests.clear();
            n.value = None;
            return Ok(());
        }

        if n.requests.contains(Request::UpOut) {
            // removal request stays with the node.
            self.handle_up_out(h, n, queue)?;
            return self.retry(queue, h);
        }

        let (pidx, mut p) = match self.lock_parent(h.idx)? {
            Some(res) => res,
            None => return self.retry(queue, h),
        };
        self.settle(&mut p);
        if p.requests.contains(Request::UpOut) {
            let ph = Handle {
                idx: pidx,
                gen: p.gen,
            };
            self.handle_up_out(ph, p, queue)?;
            return self.retry(queue, h);
        }

        let sidx = match p.sibling_of(h.idx) {
            Some(NIL) | None => err_at!(Fatal, msg: "node {} has no sibling", h.idx)?,
            Some(sidx) => sidx,
        };
        let mut s = match self.try_write(sidx)? {
            Some(s) => s,
            None => {
                drop(p);
                return self.retry(queue, h);
            }
        };
        self.settle(&mut s);
        if s.requests.contains(Request::UpOut) {
            // sibling shall settle its debt first.
            drop(s);
            drop(p);
            return self.retry(queue, h);
        }

        let black = p.is_black();
        self.remove_leaf_and_parent(h.idx, n, pidx, &mut p, sidx, s, queue)?;
        if black {
            // a black is lost on this position.
            self.pay_black(queue, pidx, &mut p);
        }
        debug!(target: "rrbt", "{:?}, unlinked {:?}", self.name, h);

        Ok(())
    }

    /// Unlink leaf `x` and its parent `p`, sibling `s` takes over the
    /// parent's position by copying its payload into the parent's slot.
    /// Slots `x` and `s` are retired and freed. Return the freed sibling
    /// slot.
    ///
    /// Requests carried by the sibling move along with its payload and
    /// are queued under the parent's slot.
    #[allow(clippy::too_many_arguments)]
    pub fn remove_leaf_and_parent(
        &self,
        xidx: usize,
        mut x: NodeW<T>,
        pidx: usize,
        p: &mut NodeW<T>,
        sidx: usize,
        mut s: NodeW<T>,
        queue: &mut Queue,
    ) -> Result<usize> {
        if x.is_not_leaf() || p.sibling_of(xidx) != Some(sidx) || sidx == NIL {
            err_at!(Fatal, msg: "can't unlink {} from {} with {}", xidx, pidx, sidx)?;
        }

        // red-red obligation on the position stays with the position.
        let up_in = p.requests.contains(Request::UpIn);
        let payload = s.take_payload();
        let (left, right) = (payload.left, payload.right);
        p.set_payload(payload);
        if up_in {
            p.requests.insert(Request::UpIn);
        }
        x.retire();

        self.set_parent(left, pidx)?;
        self.set_parent(right, pidx)?;

        mem::drop(x);
        mem::drop(s);
        self.arena.free(xidx)?;
        self.arena.free(sidx)?;

        if !p.requests.is_empty() {
            queue.push_back(Handle {
                idx: pidx,
                gen: p.gen,
            });
        }
        Ok(sidx)
    }

    /// Rotate left at `x`, with `y` as its right child. Slot `x` keeps
    /// its position and takes `y`'s payload, a fresh slot takes `x`'s
    /// payload as the left child, and `y` is retired. Return the fresh
    /// slot, latched.
    pub fn left_rotate<'a>(
        &'a self,
        xidx: usize,
        x: &mut NodeW<'a, T>,
        yidx: usize,
        mut y: NodeW<'a, T>,
        queue: &mut Queue,
    ) -> Result<NodeW<'a, T>> {
        if yidx == NIL || x.right != yidx {
            err_at!(Fatal, msg: "left-rotate {} is not right of {}", yidx, xidx)?;
        }

        let nidx = self.arena.alloc()?;
        let mut n = self.arena.slot(nidx)?.write();

        let yp = y.take_payload();
        let (b, c) = (yp.left, yp.right);
        let xp = x.replace_payload(Payload {
            left: nidx,
            right: c,
            ..yp
        });
        let a = xp.left;
        n.set_payload(Payload { right: b, ..xp });

        self.set_parent(a, nidx)?;
        self.set_parent(b, nidx)?;
        self.set_parent(c, xidx)?;
        self.set_parent(nidx, xidx)?;

        mem::drop(y);
        self.arena.free(yidx)?;

        self.moved(queue, xidx, x);
        self.moved(queue, nidx, &n);
        incr(&self.counters.rotations);
        Ok(n)
    }

    /// Mirror of [Inner::left_rotate], `y` is the left child of `x`.
    pub fn right_rotate<'a>(
        &'a self,
        xidx: usize,
        x: &mut NodeW<'a, T>,
        yidx: usize,
        mut y: NodeW<'a, T>,
        queue: &mut Queue,
    ) -> Result<NodeW<'a, T>> {
        if yidx == NIL || x.left != yidx {
            err_at!(Fatal, msg: "right-rotate {} is not left of {}", yidx, xidx)?;
        }

        let nidx = self.arena.alloc()?;
        let mut n = self.arena.slot(nidx)?.write();

        let yp = y.take_payload();
        let (a, b) = (yp.left, yp.right);
        let xp = x.replace_payload(Payload {
            left: a,
            right: nidx,
            ..yp
        });
        let c = xp.right;
        n.set_payload(Payload { left: b, ..xp });

        self.set_parent(a, xidx)?;
        self.set_parent(b, nidx)?;
        self.set_parent(c, nidx)?;
        self.set_parent(nidx, xidx)?;

        mem::drop(y);
        self.arena.free(yidx)?;

        self.moved(queue, xidx, x);
        self.moved(queue, nidx, &n);
        incr(&self.counters.rotations);
        Ok(n)
    }

    // payload with pending requests landed on `idx`.
    fn moved(&self, queue: &mut Queue, idx: usize, node: &NodeW<T>) {
        if !node.requests.is_empty() {
            queue.push_back(Handle { idx, gen: node.gen })
        }
    }
}

#[cfg(test)]
#[path = "balancer_test.rs"]
mod balancer_test;
