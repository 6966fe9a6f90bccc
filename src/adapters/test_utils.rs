//! Shared test utilities for dispatch-pipeline testing
//!
//! `ScriptedTransport` replays a queue of canned responses and records every
//! request it receives, so tests can assert on signing, retry counts and
//! parameter encoding without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::traits::Transport;
use crate::adapters::types::{SignedRequest, TransportResponse};

/// One scripted reply
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(TransportResponse),
    Fail(ExchangeError),
}

/// In-memory transport with a FIFO of replies
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<SignedRequest>>>,
    /// Simulated network latency per request
    pub latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response with a status and body
    pub fn respond(self, status: u16, body: &str) -> Self {
        self.push(Scripted::Respond(TransportResponse::new(status, body)))
    }

    pub fn respond_with(self, response: TransportResponse) -> Self {
        self.push(Scripted::Respond(response))
    }

    /// Queue a transport-level failure
    pub fn fail(self, error: ExchangeError) -> Self {
        self.push(Scripted::Fail(error))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push(self, reply: Scripted) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<SignedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: SignedRequest) -> ExchangeResult<TransportResponse> {
        self.requests.lock().push(request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            None => Err(ExchangeError::unavailable("scripted transport exhausted")),
        }
    }
}
