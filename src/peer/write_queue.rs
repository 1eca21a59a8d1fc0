//! Per-peer outbound buffering.
//!
//! The queue sits between everything that produces outbound traffic for a
//! peer (its own reader, the piece manager, the pool) and the single writer
//! task. It holds up to a configured number of items; once full it stops
//! reading its input, so producers wait on the control channel until the
//! writer catches up. Queued uploads can be withdrawn until the writer takes
//! them, and a `Choke` withdraws every upload queued ahead of it.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::command::{Internal, Outbound, PeerCommand};
use super::message::Message;
use super::piece::BlockRequest;

pub(crate) struct WriteQueue {
    input: mpsc::Receiver<PeerCommand>,
    cancels: mpsc::Receiver<BlockRequest>,
    output: mpsc::Sender<Outbound>,
    pending: VecDeque<Outbound>,
    depth: usize,
    shutdown: CancellationToken,
}

impl WriteQueue {
    pub(crate) fn new(
        input: mpsc::Receiver<PeerCommand>,
        cancels: mpsc::Receiver<BlockRequest>,
        output: mpsc::Sender<Outbound>,
        depth: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            input,
            cancels,
            output,
            pending: VecDeque::with_capacity(depth),
            depth,
            shutdown,
        }
    }

    /// Runs until the peer shuts down, the writer goes away, or every
    /// producer has dropped its sender.
    pub(crate) async fn run(self) {
        let Self {
            mut input,
            mut cancels,
            output,
            mut pending,
            depth,
            shutdown,
        } = self;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = input.recv(), if pending.len() < depth => match command {
                    Some(PeerCommand::Wire(item)) => enqueue(&mut pending, item),
                    Some(PeerCommand::Internal(Internal::Flush)) => flush(&mut pending),
                    None => break,
                },
                Some(request) = cancels.recv() => cancel(&mut pending, &request),
                permit = output.reserve(), if !pending.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(item) = pending.pop_front() {
                        permit.send(item);
                    }
                }
            }
        }
    }
}

fn enqueue(pending: &mut VecDeque<Outbound>, item: Outbound) {
    // Uploads promised before a choke are void; anything after it stands.
    if item == Outbound::Message(Message::Choke) {
        flush(pending);
    }
    pending.push_back(item);
}

fn cancel(pending: &mut VecDeque<Outbound>, request: &BlockRequest) {
    let before = pending.len();
    pending.retain(|item| !matches!(item, Outbound::Upload(queued) if queued == request));
    trace!(
        ?request,
        removed = before - pending.len(),
        "cancel applied to write queue"
    );
}

fn flush(pending: &mut VecDeque<Outbound>) {
    let before = pending.len();
    pending.retain(|item| !matches!(item, Outbound::Upload(_)));
    trace!(removed = before - pending.len(), "queued uploads flushed");
}
