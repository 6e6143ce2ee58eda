//! Client and server contracts
//!
//! [`Transport`] covers the lifecycle and subscription surface shared by all
//! components. [`Client`] adds point-to-point sending; [`Server`] adds peer
//! listing and broadcast.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::event::Listener;

/// Lifecycle and listener management common to clients and servers
pub trait Transport: Send + Sync {
    /// Open the socket and start the reception thread
    ///
    /// No-op if already running. After the loop has terminated (stop,
    /// connection loss, broken link) a new call recreates the socket.
    fn start(&self) -> Result<()>;

    /// Stop the reception thread and release the socket
    ///
    /// Idempotent. Returns once the reception thread has exited, unless
    /// called from that thread itself.
    fn stop(&self);

    /// Whether the reception thread exists and has not been told to stop
    fn is_running(&self) -> bool;

    /// Endpoint this component was built for
    fn endpoint(&self) -> &Endpoint;

    /// Subscribe a listener; `false` if it was already subscribed
    fn add_listener(&self, listener: Arc<dyn Listener>) -> bool;

    /// Unsubscribe a listener; `false` if it was not subscribed
    fn remove_listener(&self, listener: &Arc<dyn Listener>) -> bool;
}

/// One point-to-point connection
pub trait Client: Transport {
    /// Send one message to the peer, synchronously
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] - No open socket
    /// - [`TransportError::PayloadTooLarge`] - Payload exceeds the transport limit
    /// - [`TransportError::Io`] - Write failed
    fn send(&self, payload: &[u8]) -> Result<()>;
}

/// Endpoint serving many peers
pub trait Server: Transport {
    /// Snapshot of known peers, ordered by id
    fn clients(&self) -> Vec<Endpoint>;

    /// Send one message to every known peer
    ///
    /// A failure towards one peer never prevents delivery to the others;
    /// each outcome is reported in the returned [`DeliveryReport`].
    ///
    /// # Errors
    ///
    /// - [`TransportError::NoPeersConnected`] - The peer registry is empty
    fn send(&self, payload: &[u8]) -> Result<DeliveryReport>;
}

/// Per-peer outcome of a server broadcast
#[derive(Debug, Default)]
pub struct DeliveryReport {
    results: BTreeMap<Endpoint, Result<()>>,
}

impl DeliveryReport {
    pub(crate) fn record(&mut self, peer: Endpoint, result: Result<()>) {
        self.results.insert(peer, result);
    }

    /// Number of peers the broadcast was attempted to
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    /// Peers the message was written to
    pub fn delivered(&self) -> impl Iterator<Item = &Endpoint> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(peer, _)| peer)
    }

    /// Peers the write failed for, with the reason
    pub fn failures(&self) -> impl Iterator<Item = (&Endpoint, &TransportError)> {
        self.results
            .iter()
            .filter_map(|(peer, r)| r.as_ref().err().map(|e| (peer, e)))
    }

    /// Whether every peer received the message
    pub fn is_complete(&self) -> bool {
        self.results.values().all(|r| r.is_ok())
    }

    /// Outcome for one peer
    pub fn get(&self, peer: &Endpoint) -> Option<&Result<()>> {
        self.results.get(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_partial_failure() {
        let ok = Endpoint::localhost("ok", 1);
        let bad = Endpoint::localhost("bad", 2);

        let mut report = DeliveryReport::default();
        report.record(ok.clone(), Ok(()));
        report.record(bad.clone(), Err(TransportError::NotConnected));

        assert_eq!(report.attempted(), 2);
        assert!(!report.is_complete());
        assert_eq!(report.delivered().collect::<Vec<_>>(), vec![&ok]);

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, &bad);
        assert!(matches!(report.get(&bad), Some(Err(TransportError::NotConnected))));
    }
}
