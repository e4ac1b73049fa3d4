use tokio::sync::{mpsc, oneshot};

use crate::cluster::{ClusterState, Node, NodeUpdate};

/// Input to the membership view: either a full snapshot (set semantics) or
/// a batch of incremental updates.
#[derive(Debug, Clone)]
pub enum ClusterIngest {
    Snapshot(Vec<Node>),
    Updates(Vec<NodeUpdate>),
}

/// Requests serialized through the view's single worker task. The closed
/// tag set replaces the untyped request channel the design notes call out.
enum ViewRequest {
    Members(oneshot::Sender<Vec<Node>>),
    Subscribe(oneshot::Sender<(u64, mpsc::UnboundedReceiver<Vec<NodeUpdate>>)>),
    Unsubscribe(u64),
}

/// Handle to the membership view. Cheap to clone; all operations are
/// serialized through the view task, so a subscriber's initial snapshot and
/// subsequent deltas are strictly ordered.
#[derive(Clone)]
pub struct ClusterView {
    req_tx: mpsc::Sender<ViewRequest>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Vec<NodeUpdate>>,
    req_tx: mpsc::Sender<ViewRequest>,
}

impl Subscription {
    /// Next batch of updates; `None` once the view shuts down.
    pub async fn recv(&mut self) -> Option<Vec<NodeUpdate>> {
        self.rx.recv().await
    }

    /// Non-blocking variant for draining inside a select loop.
    pub fn try_recv(&mut self) -> Option<Vec<NodeUpdate>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.req_tx.try_send(ViewRequest::Unsubscribe(self.id));
    }
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<NodeUpdate>>,
}

impl ClusterView {
    /// Spawn the view task over an initial membership. Returns the handle
    /// and the ingest channel; closing the ingest channel shuts the view
    /// down and closes every subscription.
    pub fn spawn(initial: Vec<Node>) -> (Self, mpsc::Sender<ClusterIngest>) {
        let (ingest_tx, ingest_rx) = mpsc::channel(64);
        let (req_tx, req_rx) = mpsc::channel(64);
        tokio::spawn(view_loop(ClusterState::new(initial), ingest_rx, req_rx));
        (Self { req_tx }, ingest_tx)
    }

    /// Current membership, lexicographic by node id.
    pub async fn members(&self) -> Vec<Node> {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(ViewRequest::Members(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Subscribe to membership deltas. The current membership arrives
    /// first as one batch of `Added` updates.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let (tx, rx) = oneshot::channel();
        self.req_tx.send(ViewRequest::Subscribe(tx)).await.ok()?;
        let (id, updates_rx) = rx.await.ok()?;
        Some(Subscription {
            id,
            rx: updates_rx,
            req_tx: self.req_tx.clone(),
        })
    }
}

async fn view_loop(
    mut state: ClusterState,
    mut ingest_rx: mpsc::Receiver<ClusterIngest>,
    mut req_rx: mpsc::Receiver<ViewRequest>,
) {
    let mut subs: Vec<SubscriberEntry> = Vec::new();
    let mut next_sub_id: u64 = 0;

    loop {
        tokio::select! {
            // Ingest drains before requests so replies always reflect
            // every previously delivered snapshot or update batch.
            biased;
            ingest = ingest_rx.recv() => {
                let Some(ingest) = ingest else {
                    break;
                };
                let delta = match ingest {
                    ClusterIngest::Snapshot(nodes) => state.set_and_diff(nodes),
                    ClusterIngest::Updates(updates) => state.apply_updates(updates),
                };
                if delta.is_empty() {
                    continue;
                }
                tracing::debug!(
                    changes = delta.len(),
                    members = state.len(),
                    "Cluster membership changed"
                );
                // Deliver in registration order; drop subscribers that went away.
                subs.retain(|sub| sub.tx.send(delta.clone()).is_ok());
            }
            req = req_rx.recv() => {
                let Some(req) = req else {
                    break;
                };
                match req {
                    ViewRequest::Members(reply) => {
                        let _ = reply.send(state.members());
                    }
                    ViewRequest::Subscribe(reply) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let snapshot: Vec<NodeUpdate> = state
                            .members()
                            .into_iter()
                            .map(NodeUpdate::Added)
                            .collect();
                        if !snapshot.is_empty() {
                            let _ = tx.send(snapshot);
                        }
                        let id = next_sub_id;
                        next_sub_id += 1;
                        subs.push(SubscriberEntry { id, tx });
                        let _ = reply.send((id, rx));
                    }
                    ViewRequest::Unsubscribe(id) => {
                        subs.retain(|sub| sub.id != id);
                    }
                }
            }
        }
    }
    // Close of input propagates: dropping the senders ends every
    // subscription stream.
    subs.clear();
}
