//! The local node: a table of mailboxes addressed by pid or registered name.
//!
//! Messages for pids on other nodes are handed to the gateway connection
//! that announced that node, see [`gateway`]. Delivery is fire-and-forget, as
//! in the runtime the driver lives in: a message for a pid that no longer
//! exists is dropped.

use crate::metrics::*;
use crate::term::{Pid, Term};

use async_channel::{unbounded, Receiver, Sender};
use ringlog::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod gateway;

/// What a mailbox can receive.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Message(Term),
    /// An exit signal. `from` is `None` when the node itself tore the mailbox
    /// down.
    Exit { from: Option<Pid>, reason: Term },
}

/// Traffic for a remote node, queued on its gateway connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Send { to: Pid, msg: Term },
    Exit { to: Pid, reason: Term },
}

impl Outbound {
    pub fn to_term(&self) -> Term {
        match self {
            Self::Send { to, msg } => {
                Term::tuple(vec![Term::atom("send"), Term::Pid(to.clone()), msg.clone()])
            }
            Self::Exit { to, reason } => {
                Term::tuple(vec![Term::atom("exit"), Term::Pid(to.clone()), reason.clone()])
            }
        }
    }
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    name: Arc<str>,
    creation: u32,
    next_id: AtomicU32,
    mailboxes: RwLock<HashMap<Pid, Sender<Signal>>>,
    registered: RwLock<HashMap<String, Pid>>,
    routes: RwLock<HashMap<String, Sender<Outbound>>>,
}

// A poisoned lock only means another task panicked mid-update of a plain
// map; the map itself is still usable.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Node {
    pub fn new(name: &str) -> Self {
        let creation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                creation,
                next_id: AtomicU32::new(1),
                mailboxes: RwLock::new(HashMap::new()),
                registered: RwLock::new(HashMap::new()),
                routes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create a mailbox with a fresh pid.
    pub fn create_mailbox(&self) -> Mailbox {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = Pid::new(self.inner.name.clone(), id, 0, self.inner.creation);
        let (tx, rx) = unbounded();

        write(&self.inner.mailboxes).insert(pid.clone(), tx);
        trace!("created mailbox {pid}");

        Mailbox {
            pid,
            node: self.clone(),
            rx,
        }
    }

    /// Create a mailbox and register it under `name`, replacing any previous
    /// registration of that name.
    pub fn create_named_mailbox(&self, name: &str) -> Mailbox {
        let mailbox = self.create_mailbox();
        write(&self.inner.registered).insert(name.to_owned(), mailbox.pid.clone());
        mailbox
    }

    pub fn whereis(&self, name: &str) -> Option<Pid> {
        read(&self.inner.registered).get(name).cloned()
    }

    pub fn is_alive(&self, pid: &Pid) -> bool {
        read(&self.inner.mailboxes).contains_key(pid)
    }

    pub fn mailbox_count(&self) -> usize {
        read(&self.inner.mailboxes).len()
    }

    /// Send `msg` to `to`, local or remote. Returns whether the message was
    /// queued somewhere.
    pub fn send(&self, to: &Pid, msg: Term) -> bool {
        if to.node() == self.name() {
            self.deliver(to, Signal::Message(msg))
        } else {
            self.route(
                to,
                Outbound::Send {
                    to: to.clone(),
                    msg,
                },
            )
        }
    }

    pub fn send_named(&self, name: &str, msg: Term) -> bool {
        match self.whereis(name) {
            Some(pid) => self.send(&pid, msg),
            None => {
                debug!("dropping message for unregistered name: {name}");
                false
            }
        }
    }

    /// Deliver an exit signal to `to`.
    pub fn exit(&self, to: &Pid, from: Option<Pid>, reason: Term) -> bool {
        if to.node() == self.name() {
            self.deliver(to, Signal::Exit { from, reason })
        } else {
            self.route(
                to,
                Outbound::Exit {
                    to: to.clone(),
                    reason,
                },
            )
        }
    }

    pub fn exit_named(&self, name: &str, reason: Term) -> bool {
        match self.whereis(name) {
            Some(pid) => self.exit(&pid, None, reason),
            None => false,
        }
    }

    /// Route traffic for pids on `node` to `sender`. Replaces an existing
    /// route for the same node.
    pub fn add_route(&self, node: &str, sender: Sender<Outbound>) {
        write(&self.inner.routes).insert(node.to_owned(), sender);
    }

    /// Remove the route for `node` if it still points at `sender`. A newer
    /// connection from the same node keeps its route.
    pub fn remove_route(&self, node: &str, sender: &Sender<Outbound>) {
        let mut routes = write(&self.inner.routes);
        if routes.get(node).is_some_and(|s| s.same_channel(sender)) {
            routes.remove(node);
        }
    }

    pub fn has_route(&self, node: &str) -> bool {
        read(&self.inner.routes).contains_key(node)
    }

    /// Drop every mailbox and route. Receivers observe an exit signal with
    /// reason `noconnection` on their next receive.
    pub fn shutdown(&self) {
        write(&self.inner.registered).clear();
        write(&self.inner.routes).clear();
        write(&self.inner.mailboxes).clear();
    }

    fn deliver(&self, to: &Pid, signal: Signal) -> bool {
        let sender = read(&self.inner.mailboxes).get(to).cloned();
        match sender {
            Some(tx) => tx.try_send(signal).is_ok(),
            None => {
                UNDELIVERABLE.increment();
                debug!("dropping signal for dead pid {to}");
                false
            }
        }
    }

    fn route(&self, to: &Pid, outbound: Outbound) -> bool {
        let sender = read(&self.inner.routes).get(to.node()).cloned();
        match sender {
            Some(tx) => tx.try_send(outbound).is_ok(),
            None => {
                UNDELIVERABLE.increment();
                debug!("no connection to node {} for {to}", to.node());
                false
            }
        }
    }

    fn remove(&self, pid: &Pid) {
        write(&self.inner.mailboxes).remove(pid);
        write(&self.inner.registered).retain(|_, p| p != pid);
    }
}

/// An actor's inbox. Dropping it unregisters the pid, so a mailbox owned by
/// a task is released however that task ends.
pub struct Mailbox {
    pid: Pid,
    node: Node,
    rx: Receiver<Signal>,
}

impl Mailbox {
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Wait for the next signal.
    pub async fn receive(&self) -> Signal {
        match self.rx.recv().await {
            Ok(signal) => signal,
            Err(_) => Signal::Exit {
                from: None,
                reason: Term::atom("noconnection"),
            },
        }
    }

    pub fn send(&self, to: &Pid, msg: Term) -> bool {
        self.node.send(to, msg)
    }

    /// Close the mailbox, recording why. The pid is invalid afterwards.
    pub fn exit(self, reason: &str) {
        debug!("mailbox {} exited: {reason}", self.pid);
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.node.remove(&self.pid);
    }
}
