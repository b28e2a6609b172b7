//! Module `thread` implement a generic multi-threading pattern.
//!
//! It is inspired from gen-server model from Erlang, where by, every thread is
//! expected to hold onto its own state, and handle all inter-thread communication
//! via channels and message queues.

use std::{
    mem,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use crate::Result;

/// Thread type, providing gen-server pattern to do multi-threading.
///
/// NOTE: When a thread value is dropped, it is made sure that there are no dangling
/// thread routines. To achieve this following requirements need to be satisfied:
///
/// * The thread's main loop should handle _disconnect_ signal on its [Rx] channel.
/// * Call `join()` on the [Thread] instance.
pub struct Thread<Q, R = (), T = ()> {
    name: String,
    inner: Option<Inner<Q, R, T>>,
}

struct Inner<Q, R, T> {
    handle: thread::JoinHandle<T>,
    tx: Option<Arc<Mutex<Tx<Q, R>>>>,
}

impl<Q, R, T> Inner<Q, R, T> {
    fn join(mut self) -> Result<T> {
        mem::drop(self.tx.take());

        match self.handle.join() {
            Ok(val) => Ok(val),
            Err(err) => err_at!(ThreadFail, msg: "fail {:?}", err),
        }
    }
}

impl<Q, R, T> Drop for Thread<Q, R, T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.join().ok();
        }
    }
}

impl<Q, R, T> Thread<Q, R, T> {
    /// Create a new Thread instance, using asynchronous channel with infinite buffer.
    /// `main_loop` shall be called with the rx side of the channel and shall return
    /// a function that can be spawned using thread::spawn.
    pub fn new<F, N>(name: &str, main_loop: F) -> Result<Thread<Q, R, T>>
    where
        F: 'static + FnOnce(Rx<Q, R>) -> N + Send,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, rx) = mpsc::channel();
        let handle = err_at!(
            ThreadFail,
            thread::Builder::new().name(name.to_string()).spawn(main_loop(rx))
        )?;

        let tx = Some(Arc::new(Mutex::new(Tx::N(tx))));

        Ok(Thread {
            name: name.to_string(),
            inner: Some(Inner { handle, tx }),
        })
    }

    /// Create a new Thread instance, using synchronous channel with finite buffer.
    pub fn new_sync<F, N>(name: &str, chan_size: usize, main_loop: F) -> Result<Thread<Q, R, T>>
    where
        F: 'static + FnOnce(Rx<Q, R>) -> N + Send,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, rx) = mpsc::sync_channel(chan_size);
        let handle = err_at!(
            ThreadFail,
            thread::Builder::new().name(name.to_string()).spawn(main_loop(rx))
        )?;

        let tx = Some(Arc::new(Mutex::new(Tx::S(tx))));

        Ok(Thread {
            name: name.to_string(),
            inner: Some(Inner { handle, tx }),
        })
    }

    /// Recommended way to exit/shutdown the thread. Note that all [Tx] clones of this
    /// thread must also be dropped for this call to return.
    ///
    /// Even otherwise, when Thread value goes out of scope its drop implementation
    /// shall call this method to exit the thread, except that any errors are ignored.
    pub fn join(mut self) -> Result<T> {
        match self.inner.take() {
            Some(inner) => inner.join(),
            None => err_at!(ThreadFail, msg: "thread {} already joined", self.name),
        }
    }

    /// Return name of this thread.
    pub fn to_name(&self) -> String {
        self.name.to_string()
    }

    /// Return a clone of tx channel.
    pub fn to_tx(&self) -> Result<Tx<Q, R>> {
        let tx = self.inner.as_ref().and_then(|inner| inner.tx.as_ref());
        match tx {
            Some(tx) => match tx.lock() {
                Ok(tx) => Ok(tx.clone()),
                Err(err) => err_at!(ThreadFail, msg: "tx lock poisoned {}", err),
            },
            None => err_at!(IPCFail, msg: "thread {} is closed", self.name),
        }
    }
}

/// IPC type, that enumerates as either [mpsc::Sender] or, [mpsc::SyncSender]
/// channel.
///
/// The clone behavior is similar to [mpsc::Sender] or, [mpsc::SyncSender].
pub enum Tx<Q, R = ()> {
    N(mpsc::Sender<(Q, Option<mpsc::Sender<R>>)>),
    S(mpsc::SyncSender<(Q, Option<mpsc::Sender<R>>)>),
}

impl<Q, R> Clone for Tx<Q, R> {
    fn clone(&self) -> Self {
        match self {
            Tx::N(tx) => Tx::N(tx.clone()),
            Tx::S(tx) => Tx::S(tx.clone()),
        }
    }
}

impl<Q, R> Tx<Q, R> {
    /// Post a message to thread and don't wait for response.
    pub fn post(&self, msg: Q) -> Result<()> {
        match self {
            Tx::N(tx) => err_at!(IPCFail, tx.send((msg, None)))?,
            Tx::S(tx) => err_at!(IPCFail, tx.send((msg, None)))?,
        };
        Ok(())
    }

    /// Send a request message to thread and wait for a response, upto `timeout`.
    /// Return None if thread did not respond within `timeout`.
    pub fn request_for(&self, request: Q, timeout: Duration) -> Result<Option<R>> {
        let (stx, srx) = mpsc::channel();
        match self {
            Tx::N(tx) => err_at!(IPCFail, tx.send((request, Some(stx))))?,
            Tx::S(tx) => err_at!(IPCFail, tx.send((request, Some(stx))))?,
        }
        match srx.recv_timeout(timeout) {
            Ok(resp) => Ok(Some(resp)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(err) => err_at!(IPCFail, msg: "{}", err),
        }
    }
}

/// IPC type, that shall be passed to the thread's main loop.
///
/// Refer to [Thread::new] for details.
pub type Rx<Q, R = ()> = mpsc::Receiver<(Q, Option<mpsc::Sender<R>>)>;

#[cfg(test)]
#[path = "thread_test.rs"]
mod thread_test;
