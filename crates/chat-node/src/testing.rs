//! Hand-rolled collaborators for unit tests.

use crate::address_book::AddressBook;
use crate::error::{ChatError, Result};
use crate::frame::{RequestFrame, ResponseFrame};
use crate::locator::{PeerAddresses, PeerLocator};
use crate::session::Dialer;
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FixedAddressBook {
    entries: HashMap<PeerId, Vec<Multiaddr>>,
}

impl FixedAddressBook {
    pub fn with(mut self, peer: PeerId, addrs: &[&str]) -> Self {
        let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.entries.insert(peer, addrs);
        self
    }
}

#[async_trait]
impl AddressBook for FixedAddressBook {
    async fn get(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.entries.get(peer).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
pub struct FixedLocator {
    results: Vec<PeerAddresses>,
    calls: AtomicUsize,
    last_k: AtomicUsize,
}

impl FixedLocator {
    pub fn returning(results: Vec<PeerAddresses>) -> Self {
        Self {
            results,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_k(&self) -> usize {
        self.last_k.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLocator for FixedLocator {
    async fn find_closest_peers(&self, _target: &PeerId, k: usize) -> Result<Vec<PeerAddresses>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_k.store(k, Ordering::SeqCst);
        Ok(self.results.clone())
    }
}

pub enum DialOutcome {
    Connected,
    Refused,
}

pub enum RequestOutcome {
    Respond(ResponseFrame),
    TimedOut,
}

pub struct ScriptedDialer {
    dial: DialOutcome,
    request: RequestOutcome,
    dials: Mutex<Vec<(PeerId, Vec<Multiaddr>)>>,
    requests: Mutex<Vec<RequestFrame>>,
}

impl ScriptedDialer {
    pub fn new(dial: DialOutcome, request: RequestOutcome) -> Self {
        Self {
            dial,
            request,
            dials: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn acking() -> Self {
        Self::new(
            DialOutcome::Connected,
            RequestOutcome::Respond(ResponseFrame::ok()),
        )
    }

    pub fn dials(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.dials.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<RequestFrame> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, peer: &PeerId, addresses: Vec<Multiaddr>) -> Result<()> {
        self.dials.lock().unwrap().push((*peer, addresses));
        match self.dial {
            DialOutcome::Connected => Ok(()),
            DialOutcome::Refused => Err(ChatError::Dial {
                peer: *peer,
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn request(&self, peer: &PeerId, frame: RequestFrame) -> Result<ResponseFrame> {
        self.requests.lock().unwrap().push(frame);
        match &self.request {
            RequestOutcome::Respond(response) => Ok(response.clone()),
            RequestOutcome::TimedOut => Err(ChatError::Timeout(*peer)),
        }
    }
}
