use super::decode::envelope;
use super::executor::{execute, Request};
use super::reply::Reply;
use crate::config::DecodePolicy;
use crate::metrics::*;
use crate::node::{Mailbox, Signal};
use crate::store::StoreClient;
use crate::term::{Pid, Term};

use ringlog::{debug, error, warn};
use std::ops::ControlFlow;
use std::sync::Arc;

pub struct Worker {
    mailbox: Mailbox,
    client: Arc<dyn StoreClient>,
    policy: DecodePolicy,
}

// keeps the live worker gauge right however the task ends
struct Live;

impl Live {
    fn new() -> Self {
        WORKERS_CURR.increment();
        Self
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        WORKERS_CURR.decrement();
    }
}

impl Worker {
    pub fn new(mailbox: Mailbox, client: Arc<dyn StoreClient>, policy: DecodePolicy) -> Self {
        Self {
            mailbox,
            client,
            policy,
        }
    }

    pub fn pid(&self) -> &Pid {
        self.mailbox.pid()
    }

    pub async fn run(self) {
        let _live = Live::new();
        debug!("worker {} started", self.pid());

        let reason = loop {
            match self.mailbox.receive().await {
                Signal::Message(message) => {
                    REQUEST.increment();
                    if let ControlFlow::Break(reason) = self.handle(&message).await {
                        break reason;
                    }
                }
                Signal::Exit { from, reason } => {
                    debug!(
                        "worker {} received exit from {} ({reason})",
                        self.pid(),
                        from.map(|p| p.to_string()).unwrap_or_else(|| "node".into())
                    );
                    break "interrupted";
                }
            }
        };

        // the client handle goes with `self`
        self.mailbox.exit(reason);
    }

    async fn handle(&self, message: &Term) -> ControlFlow<&'static str> {
        let (from, payload) = match envelope(message) {
            Ok(parts) => parts,
            Err(e) => {
                REQUEST_DECODE_EX.increment();
                warn!("worker {} dropped {message}: {e}", self.pid());
                return self.on_decode_error();
            }
        };

        let reply = match Request::decode(payload) {
            Ok(request) => execute(self.client.as_ref(), &request).await,
            Err(e) => {
                REQUEST_DECODE_EX.increment();
                error!("worker {} can't decode {payload} from {from}: {e}", self.pid());
                if self.policy == DecodePolicy::Terminate {
                    return ControlFlow::Break("decode_error");
                }
                Reply::Error(e.to_string())
            }
        };

        let response = Term::tuple(vec![Term::Pid(self.pid().clone()), reply.to_term()]);
        self.mailbox.send(from, response);
        ControlFlow::Continue(())
    }

    fn on_decode_error(&self) -> ControlFlow<&'static str> {
        match self.policy {
            DecodePolicy::Reply => ControlFlow::Continue(()),
            DecodePolicy::Terminate => ControlFlow::Break("decode_error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn pair(name: &str, value: Term) -> Term {
        Term::tuple(vec![Term::atom(name), value])
    }

    fn request(from: &Pid, op: &str, args: Vec<Term>) -> Term {
        Term::tuple(vec![
            Term::Pid(from.clone()),
            Term::tuple(vec![Term::atom(op), Term::List(args)]),
        ])
    }

    fn start(node: &Node, policy: DecodePolicy) -> (Pid, JoinHandle<()>) {
        let worker = Worker::new(node.create_mailbox(), Arc::new(MemoryStore::default()), policy);
        let pid = worker.pid().clone();
        (pid, tokio::spawn(worker.run()))
    }

    async fn reply(mailbox: &Mailbox) -> Term {
        match timeout(Duration::from_secs(5), mailbox.receive()).await {
            Ok(Signal::Message(term)) => term,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let node = Node::new("shim@test");
        let driver = node.create_mailbox();
        let (worker, _task) = start(&node, DecodePolicy::Reply);

        let key = vec![pair("bucket", Term::binary(&b"b"[..])), pair("key", Term::binary(&b"k"[..]))];
        let mut put = key.clone();
        put.push(pair("value", Term::binary(&b"v"[..])));

        assert!(node.send(&worker, request(driver.pid(), "put", put)));
        assert!(node.send(&worker, request(driver.pid(), "get", key)));

        let first = Term::tuple(vec![Term::Pid(worker.clone()), Reply::Ok.to_term()]);
        let second = Term::tuple(vec![Term::Pid(worker.clone()), Reply::found(true).to_term()]);
        assert_eq!(reply(&driver).await, first);
        assert_eq!(reply(&driver).await, second);
    }

    #[tokio::test]
    async fn reply_policy_keeps_serving_after_bad_requests() {
        let node = Node::new("shim@test");
        let driver = node.create_mailbox();
        let (worker, _task) = start(&node, DecodePolicy::Reply);

        node.send(&worker, request(driver.pid(), "get", vec![pair("r", Term::atom("all"))]));
        node.send(&worker, request(driver.pid(), "list_keys", vec![]));
        node.send(&worker, request(driver.pid(), "get", vec![]));

        for expected in ["expected an integer, got all", "unknown operation list_keys"] {
            let term = reply(&driver).await;
            let reply = &term.as_tuple().expect("tuple")[1];
            assert_eq!(reply, &Reply::Error(expected.into()).to_term());
        }
        let term = reply(&driver).await;
        assert_eq!(term.as_tuple().expect("tuple")[1], Reply::found(false).to_term());
    }

    #[tokio::test]
    async fn terminate_policy_stops_without_replying() {
        let node = Node::new("shim@test");
        let driver = node.create_mailbox();
        let (worker, task) = start(&node, DecodePolicy::Terminate);

        node.send(&worker, request(driver.pid(), "list_keys", vec![]));
        timeout(Duration::from_secs(5), task)
            .await
            .expect("worker stopped")
            .expect("worker task");

        assert!(!node.is_alive(&worker));
        assert!(timeout(Duration::from_millis(50), driver.receive()).await.is_err());
    }

    #[tokio::test]
    async fn malformed_envelopes_are_dropped() {
        let node = Node::new("shim@test");
        let driver = node.create_mailbox();
        let (worker, _task) = start(&node, DecodePolicy::Reply);

        node.send(&worker, Term::atom("hello"));
        node.send(&worker, request(driver.pid(), "get", vec![]));

        let term = reply(&driver).await;
        assert_eq!(term.as_tuple().expect("tuple")[1], Reply::found(false).to_term());
    }

    #[tokio::test]
    async fn exit_signal_stops_the_worker() {
        let node = Node::new("shim@test");
        let (worker, task) = start(&node, DecodePolicy::Reply);

        assert!(node.exit(&worker, None, Term::atom("shutdown")));
        timeout(Duration::from_secs(5), task)
            .await
            .expect("worker stopped")
            .expect("worker task");

        assert!(!node.is_alive(&worker));
        assert!(!node.send(&worker, Term::atom("late")));
    }
}
