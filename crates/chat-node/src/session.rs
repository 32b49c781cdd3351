//! Sender side of the chat protocol.
//!
//! Each [`ChatSession::send`] resolves the target, makes sure a connection
//! is open, writes one request frame and waits for the single response that
//! acknowledges it. Frames carry no message id, so a session never lets two
//! sends overlap.

use crate::error::{ChatError, Result};
use crate::frame::{RequestFrame, ResponseFrame};
use crate::resolver::PeerResolver;
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Connection and request capability of the overlay node.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Ensures a connection to `peer`, trying `addresses` in order. Returns
    /// immediately if one is already open.
    async fn dial(&self, peer: &PeerId, addresses: Vec<Multiaddr>) -> Result<()>;

    /// Sends one request over the open connection and waits for its response.
    async fn request(&self, peer: &PeerId, frame: RequestFrame) -> Result<ResponseFrame>;
}

pub struct ChatSession {
    resolver: PeerResolver,
    dialer: Arc<dyn Dialer>,
    in_flight: Mutex<()>,
}

impl ChatSession {
    pub fn new(resolver: PeerResolver, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            resolver,
            dialer,
            in_flight: Mutex::new(()),
        }
    }

    /// Delivers `payload` to `target` and returns once it is acknowledged.
    ///
    /// Concurrent callers queue on the session lock; callers that need a
    /// specific interleaving must await each send before issuing the next.
    pub async fn send(&self, target: &PeerId, payload: impl Into<Vec<u8>>) -> Result<ResponseFrame> {
        let _guard = self.in_flight.lock().await;

        let addresses = self.resolver.resolve(target).await?;
        self.dialer.dial(target, addresses).await?;

        let frame = RequestFrame::new(payload);
        debug!(peer_id = ?target, bytes = frame.content_length(), "sending message");
        let response = self.dialer.request(target, frame).await?;

        if !response.status().is_success() {
            return Err(ChatError::Rejected {
                peer: *target,
                status: response.status(),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Status;
    use crate::locator::PeerAddresses;
    use crate::testing::{
        DialOutcome, FixedAddressBook, FixedLocator, RequestOutcome, ScriptedDialer,
    };

    fn session_with(
        book: FixedAddressBook,
        locator: FixedLocator,
        dialer: Arc<ScriptedDialer>,
    ) -> ChatSession {
        let resolver = PeerResolver::new(Arc::new(book), Arc::new(locator));
        ChatSession::new(resolver, dialer)
    }

    #[tokio::test]
    async fn cached_peer_is_dialed_and_acked() {
        let peer = PeerId::random();
        let dialer = Arc::new(ScriptedDialer::acking());
        let session = session_with(
            FixedAddressBook::default().with(peer, &["/ip6/::1/tcp/4001"]),
            FixedLocator::default(),
            dialer.clone(),
        );

        let ack = session.send(&peer, "hello").await.unwrap();

        assert_eq!(ack.status(), Status::OK);
        assert_eq!(ack.content_length(), 0);
        let dials = dialer.dials();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].0, peer);
        assert_eq!(dials[0].1, vec!["/ip6/::1/tcp/4001".parse::<Multiaddr>().unwrap()]);
        assert_eq!(dialer.requests(), vec![RequestFrame::new("hello")]);
    }

    #[tokio::test]
    async fn unresolvable_peer_never_dials() {
        let peer = PeerId::random();
        let dialer = Arc::new(ScriptedDialer::acking());
        let session = session_with(
            FixedAddressBook::default(),
            FixedLocator::returning(vec![PeerAddresses::new(
                PeerId::random(),
                ["/ip4/198.51.100.1/tcp/4001"],
            )]),
            dialer.clone(),
        );

        let err = session.send(&peer, "hello").await.unwrap_err();

        assert!(matches!(err, ChatError::PeerNotFound(_)));
        assert!(dialer.dials().is_empty());
        assert!(dialer.requests().is_empty());
    }

    #[tokio::test]
    async fn dial_failure_skips_request() {
        let peer = PeerId::random();
        let dialer = Arc::new(ScriptedDialer::new(
            DialOutcome::Refused,
            RequestOutcome::Respond(ResponseFrame::ok()),
        ));
        let session = session_with(
            FixedAddressBook::default().with(peer, &["/ip4/127.0.0.1/tcp/1"]),
            FixedLocator::default(),
            dialer.clone(),
        );

        let err = session.send(&peer, "hello").await.unwrap_err();

        assert!(matches!(err, ChatError::Dial { .. }));
        assert!(dialer.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_ack_is_a_timeout() {
        let peer = PeerId::random();
        let dialer = Arc::new(ScriptedDialer::new(
            DialOutcome::Connected,
            RequestOutcome::TimedOut,
        ));
        let session = session_with(
            FixedAddressBook::default().with(peer, &["/ip4/127.0.0.1/tcp/4001"]),
            FixedLocator::default(),
            dialer,
        );

        let err = session.send(&peer, "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout(p) if p == peer));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let peer = PeerId::random();
        let dialer = Arc::new(ScriptedDialer::new(
            DialOutcome::Connected,
            RequestOutcome::Respond(ResponseFrame::with_status(Status::FORBIDDEN)),
        ));
        let session = session_with(
            FixedAddressBook::default().with(peer, &["/ip4/127.0.0.1/tcp/4001"]),
            FixedLocator::default(),
            dialer,
        );

        let err = session.send(&peer, "hello").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Rejected { status, .. } if status == Status::FORBIDDEN
        ));
    }

    #[tokio::test]
    async fn dht_resolution_feeds_the_dial() {
        let peer = PeerId::random();
        let dialer = Arc::new(ScriptedDialer::acking());
        let session = session_with(
            FixedAddressBook::default(),
            FixedLocator::returning(vec![PeerAddresses::new(peer, ["/ip4/203.0.113.5/tcp/4001"])]),
            dialer.clone(),
        );

        session.send(&peer, "hi").await.unwrap();

        assert_eq!(
            dialer.dials()[0].1,
            vec!["/ip4/203.0.113.5/tcp/4001".parse::<Multiaddr>().unwrap()]
        );
    }
}
