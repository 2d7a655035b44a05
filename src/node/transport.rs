//! In-process transport
//!
//! Every node registers a mailbox; a call encodes the request into a frame,
//! posts it with a oneshot reply channel and waits for the encoded response
//! up to a timeout. A node that has left (or crashed) has no mailbox, so
//! calls to it fail with `NodeUnreachable` instead of hanging.

use super::codec;
use super::messages::{Request, Response};
use crate::common::utils::{read, write};
use crate::common::{Error, NodeId, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const MAILBOX_CAPACITY: usize = 4096;

/// One inbound request
pub struct Envelope {
    pub from: NodeId,
    pub frame: Bytes,
    pub reply: oneshot::Sender<Bytes>,
}

pub struct Transport {
    peers: RwLock<HashMap<NodeId, mpsc::Sender<Envelope>>>,
    rpc_timeout: Duration,
}

impl Transport {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            rpc_timeout,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Open the mailbox of `node`, replacing any previous one
    pub fn register(&self, node: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        write(&self.peers).insert(node.to_string(), tx);
        rx
    }

    /// Close the mailbox of `node`; queued requests are dropped unanswered
    pub fn deregister(&self, node: &str) {
        write(&self.peers).remove(node);
    }

    pub fn is_registered(&self, node: &str) -> bool {
        read(&self.peers).contains_key(node)
    }

    pub async fn call(&self, from: &str, to: &str, request: &Request) -> Result<Response> {
        self.call_with_timeout(from, to, request, self.rpc_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        from: &str,
        to: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let frame = codec::encode(request)?;
        let mailbox = read(&self.peers)
            .get(to)
            .cloned()
            .ok_or_else(|| Error::NodeUnreachable(to.to_string()))?;

        let (reply, response) = oneshot::channel();
        let envelope = Envelope {
            from: from.to_string(),
            frame,
            reply,
        };

        let exchange = async {
            mailbox
                .send(envelope)
                .await
                .map_err(|_| Error::NodeUnreachable(to.to_string()))?;
            // A dropped reply sender means the node went away mid-request
            response
                .await
                .map_err(|_| Error::NodeUnreachable(to.to_string()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(bytes)) => codec::decode(&bytes),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::debug!("{} request {} -> {} timed out", request.name(), from, to);
                Err(Error::Timeout(format!(
                    "{} request from {} to {} after {:?}",
                    request.name(),
                    from,
                    to,
                    timeout
                )))
            }
        }
    }
}
