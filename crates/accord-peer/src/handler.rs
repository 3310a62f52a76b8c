//! Inbound message dispatch.
//!
//! Runs beside the propagator and never touches the local belief: beliefs
//! are queued for the propagator, everything else is answered from the store,
//! the transaction pool or the latest [`PeerSnapshot`].

use std::sync::Arc;

use accord_protocol::{ErrorCode, Message, MessageType};
use accord_store::{persist_shallow, Cell, Store};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::connections::ConnectionManager;
use crate::error::PeerError;
use crate::propagator::{BeliefQueue, PeerSnapshot};
use crate::transactions::TransactionQueue;

/// Handles every message a peer receives.
pub struct MessageHandler {
    store: Arc<dyn Store>,
    beliefs: BeliefQueue,
    transactions: Arc<TransactionQueue>,
    connections: Arc<ConnectionManager>,
    snapshot: watch::Receiver<Arc<PeerSnapshot>>,
}

impl MessageHandler {
    pub fn new(
        store: Arc<dyn Store>,
        beliefs: BeliefQueue,
        transactions: Arc<TransactionQueue>,
        connections: Arc<ConnectionManager>,
        snapshot: watch::Receiver<Arc<PeerSnapshot>>,
    ) -> Self {
        Self {
            store,
            beliefs,
            transactions,
            connections,
            snapshot,
        }
    }

    /// Receive messages until the channel closes or `shutdown` turns true.
    pub async fn run(self, mut inbound: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                message = inbound.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        debug!("message dispatcher stopped");
    }

    pub fn handle(&self, message: Message) {
        trace!(kind = %message.kind(), origin = %message.origin(), "inbound message");
        match message.kind() {
            MessageType::Belief => self.handle_belief(message),
            MessageType::MissingData => self.handle_missing_data(&message),
            MessageType::Data => self.handle_data(&message),
            MessageType::Result => self.handle_result(&message),
            MessageType::Status => self.handle_status(&message),
            MessageType::Transact => self.handle_transact(&message),
            MessageType::Goodbye => self.handle_goodbye(&message),
            MessageType::Challenge | MessageType::Response | MessageType::Query => {
                debug!(kind = %message.kind(), origin = %message.origin(), "unsupported message");
                reply_error(&message, ErrorCode::Unexpected, "unsupported message type");
            }
        }
    }

    fn handle_belief(&self, message: Message) {
        let reply_path = message.clone();
        match self.beliefs.queue_belief(message) {
            Ok(()) => {}
            Err(PeerError::QueueFull(capacity)) => {
                warn!(origin = %reply_path.origin(), capacity, "belief queue full");
                reply_error(&reply_path, ErrorCode::Load, "belief queue full");
            }
            Err(e) => debug!(error = %e, "belief not queued"),
        }
    }

    /// Serve a cell from the store, or say it is missing here too.
    fn handle_missing_data(&self, message: &Message) {
        let hash = match message.requested_hash() {
            Ok(hash) => hash,
            Err(e) => {
                reply_error(message, ErrorCode::Format, &e.to_string());
                return;
            }
        };
        let found = match self.store.get(&hash) {
            Ok(found) => found.filter(|r| r.is_direct()),
            Err(e) => {
                warn!(%hash, error = %e, "store lookup failed");
                None
            }
        };
        let result = match found {
            Some(cell) => {
                trace!(%hash, origin = %message.origin(), "serving missing data");
                message.send_data(vec![cell])
            }
            None => {
                debug!(%hash, origin = %message.origin(), "requested data not held");
                message.report_error(ErrorCode::Missing, Cell::Blob(hash.as_bytes().to_vec()))
            }
        };
        if let Err(e) = result {
            warn!(%hash, error = %e, "failed to answer missing data request");
        }
    }

    /// Store delivered cells shallowly; a parked belief picks them up on retry.
    fn handle_data(&self, message: &Message) {
        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(origin = %message.origin(), error = %e, "undecodable data message");
                reply_error(message, ErrorCode::Format, &e.to_string());
                return;
            }
        };
        let cells = std::iter::once(payload.root())
            .filter(|r| !r.is_embedded())
            .chain(payload.cells());
        let mut stored = 0usize;
        for cell in cells {
            if let Err(e) = persist_shallow(self.store.as_ref(), cell) {
                warn!(hash = %cell.hash(), error = %e, "could not store delivered cell");
                return;
            }
            stored += 1;
        }
        trace!(stored, origin = %message.origin(), "stored delivered data");
    }

    fn handle_result(&self, message: &Message) {
        match message.result_record() {
            Ok(record) => match record.error {
                Some(code) => debug!(id = ?record.id, %code, origin = %message.origin(), "error result"),
                None => trace!(id = ?record.id, origin = %message.origin(), "result"),
            },
            Err(e) => debug!(error = %e, "unreadable result"),
        }
    }

    fn handle_status(&self, message: &Message) {
        let snapshot = Arc::clone(&self.snapshot.borrow());
        let status = Cell::vector([
            Cell::Long(snapshot.consensus_point as i64),
            Cell::Long(snapshot.proposal_point as i64),
            Cell::Long(snapshot.order_length as i64),
            Cell::Blob(snapshot.state_hash.as_bytes().to_vec()),
        ]);
        if let Err(e) = message.report_result(status) {
            debug!(error = %e, "failed to answer status");
        }
    }

    /// `TRANSACT` carries `[id, transaction]`.
    fn handle_transact(&self, message: &Message) {
        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                reply_error(message, ErrorCode::Format, &e.to_string());
                return;
            }
        };
        for cell in payload.cells() {
            if let Err(e) = persist_shallow(self.store.as_ref(), cell) {
                warn!(error = %e, "could not store transaction cells");
            }
        }
        let transaction = match payload.value() {
            Cell::Vector(items) if items.len() == 2 => items[1]
                .value(self.store.as_ref())
                .ok()
                .and_then(|cell| cell.as_transaction().cloned()),
            _ => None,
        };
        let Some(transaction) = transaction else {
            reply_error(message, ErrorCode::Format, "expected [id, transaction]");
            return;
        };
        match self.transactions.submit(transaction) {
            Ok(tx) => {
                let hash = Cell::Blob(tx.hash().as_bytes().to_vec());
                if let Err(e) = message.report_result(hash) {
                    debug!(error = %e, "failed to acknowledge transaction");
                }
            }
            Err(e) => {
                warn!(origin = %message.origin(), error = %e, "transaction rejected");
                reply_error(message, ErrorCode::Load, &e.to_string());
            }
        }
    }

    fn handle_goodbye(&self, message: &Message) {
        let Some(key) = message.connection().and_then(|c| c.remote_key()) else {
            return;
        };
        if self.connections.remove(&key).is_some() {
            info!(peer = %key, "peer said goodbye");
        }
    }
}

fn reply_error(message: &Message, code: ErrorCode, detail: &str) {
    let detail = Cell::blob(detail.as_bytes()).unwrap_or(Cell::Nil);
    if let Err(e) = message.report_error(code, detail) {
        debug!(%code, error = %e, "could not report error");
    }
}
