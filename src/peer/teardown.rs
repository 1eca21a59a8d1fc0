use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::PeerError;
use super::events::{PeerClosed, PieceEvent, StatEvent};

/// Shutdown of one peer.
///
/// Collaborators hear about the shutdown exactly once, from whichever caller
/// gets there first. Cancelling the peer's token runs on every call.
pub(crate) struct Teardown {
    addr: SocketAddr,
    notified: AtomicBool,
    shutdown: CancellationToken,
    lifecycle: mpsc::Sender<PeerClosed>,
    pieces: mpsc::Sender<PieceEvent>,
    stats: mpsc::Sender<StatEvent>,
}

impl Teardown {
    pub(crate) fn new(
        addr: SocketAddr,
        shutdown: CancellationToken,
        lifecycle: mpsc::Sender<PeerClosed>,
        pieces: mpsc::Sender<PieceEvent>,
        stats: mpsc::Sender<StatEvent>,
    ) -> Self {
        Self {
            addr,
            notified: AtomicBool::new(false),
            shutdown,
            lifecycle,
            pieces,
            stats,
        }
    }

    /// Returns true for the first caller only.
    fn claim(&self) -> bool {
        !self.notified.swap(true, Ordering::AcqRel)
    }

    pub(crate) async fn run(&self, reason: Option<&PeerError>) {
        let addr = self.addr;

        if self.claim() {
            match reason {
                Some(err) if err.is_graceful() => debug!(%addr, %err, "peer finished"),
                Some(err) => debug!(%addr, %err, "peer failed"),
                None => debug!(%addr, "peer closed"),
            }

            // Receivers that are gone have nothing left to clean up.
            let _ = self.lifecycle.send(PeerClosed { addr }).await;
            let _ = self.pieces.send(PieceEvent::DiscardPeer { addr }).await;
            let _ = self.stats.send(StatEvent::closing(addr)).await;
        } else {
            trace!(%addr, "teardown already notified");
        }

        self.shutdown.cancel();
    }
}
