//! Node message loop
//!
//! A running node has four kinds of task:
//! - the mailbox loop, which decodes each inbound frame and handles it on its own task
//! - the topology follower, which applies every membership event to the partition maps
//! - the reaper, which rolls back participant transactions past their deadline
//! - one near-cache subscriber per cache that has a near cache

use super::codec;
use super::context::NodeContext;
use super::messages::{Rejection, Request, Response};
use super::transport::Envelope;
use crate::affinity::TopologyEvent;
use crate::common::utils::lock;
use crate::common::{Error, Result};
use crate::replication::handle_replicate;
use crate::tx::participant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct NodeServer {
    ctx: Arc<NodeContext>,
    isolated: Arc<AtomicBool>,
    /// Requests swallowed while isolated whose callers are still waiting;
    /// dropped on heal or stop
    parked: Arc<Mutex<Vec<Envelope>>>,
    applied: watch::Receiver<u64>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeServer {
    pub fn start(ctx: Arc<NodeContext>, topology: watch::Receiver<TopologyEvent>) -> Self {
        tracing::info!("Starting node {}", ctx.id);

        let mailbox = ctx.transport.register(&ctx.id);
        let isolated = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let (applied_tx, applied) = watch::channel(ctx.topology_version());

        let mut tasks = vec![
            tokio::spawn(serve(
                Arc::clone(&ctx),
                mailbox,
                Arc::clone(&isolated),
                Arc::clone(&parked),
            )),
            tokio::spawn(follow_topology(Arc::clone(&ctx), topology, applied_tx)),
            tokio::spawn(reap(Arc::clone(&ctx))),
        ];
        for cache in ctx.caches() {
            if let Some(near) = cache.near() {
                tasks.push(near.subscribe(ctx.commits.subscribe()));
            }
        }

        Self {
            ctx,
            isolated,
            parked,
            applied,
            tasks,
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Wait until this node has applied topology `version` or newer
    pub async fn wait_for_topology(&self, version: u64, timeout: Duration) -> Result<()> {
        let mut applied = self.applied.clone();
        let reached = tokio::time::timeout(timeout, async move {
            applied.wait_for(|v| *v >= version).await.map(|_| ())
        })
        .await;
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NodeUnreachable(self.ctx.id.clone())),
            Err(_) => Err(Error::Timeout(format!(
                "node {} did not apply topology v{} within {:?}",
                self.ctx.id, version, timeout
            ))),
        }
    }

    /// Stop answering requests without leaving the cluster
    pub fn isolate(&self) {
        tracing::warn!("Node {} isolated", self.ctx.id);
        self.isolated.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        tracing::info!("Node {} healed", self.ctx.id);
        self.isolated.store(false, Ordering::SeqCst);
        lock(&self.parked).clear();
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::SeqCst)
    }

    /// Swallowed requests currently held while isolated
    pub fn parked_requests(&self) -> usize {
        lock(&self.parked).len()
    }

    pub fn stop(self) {
        tracing::info!("Stopping node {}", self.ctx.id);
        self.ctx.stop();
        self.ctx.transport.deregister(&self.ctx.id);
        lock(&self.parked).clear();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve(
    ctx: Arc<NodeContext>,
    mut mailbox: mpsc::Receiver<Envelope>,
    isolated: Arc<AtomicBool>,
    parked: Arc<Mutex<Vec<Envelope>>>,
) {
    while let Some(envelope) = mailbox.recv().await {
        if isolated.load(Ordering::SeqCst) {
            let mut parked = lock(&parked);
            // Callers that timed out have dropped their receivers
            parked.retain(|held| !held.reply.is_closed());
            parked.push(envelope);
            continue;
        }
        let ctx = Arc::clone(&ctx);
        tokio::spawn(dispatch(ctx, envelope));
    }
    tracing::debug!("Mailbox of {} closed", ctx.id);
}

async fn dispatch(ctx: Arc<NodeContext>, envelope: Envelope) {
    let response = match codec::decode::<Request>(&envelope.frame) {
        Ok(request) => handle_request(&ctx, request).await,
        Err(e) => {
            tracing::warn!("Undecodable frame from {}: {}", envelope.from, e);
            Response::Rejected(Rejection::from(e))
        }
    };

    // A node that crashed mid-request never answers
    if ctx.is_stopped() {
        return;
    }
    match codec::encode(&response) {
        Ok(frame) => {
            let _ = envelope.reply.send(frame);
        }
        Err(e) => tracing::error!("Failed to encode reply to {}: {}", envelope.from, e),
    }
}

/// Route one request to the handler for its cache
pub async fn handle_request(ctx: &Arc<NodeContext>, request: Request) -> Response {
    let cache = match ctx.cache(request.cache()) {
        Ok(cache) => cache,
        Err(e) => return Response::Rejected(Rejection::from(e)),
    };

    match request {
        Request::Get(r) => participant::handle_get(ctx, &cache, r),
        Request::Lock(r) => participant::handle_lock(ctx, &cache, r).await,
        Request::Prepare(r) => participant::handle_prepare(ctx, &cache, r),
        Request::Commit(r) => participant::handle_commit(ctx, &cache, r).await,
        Request::Rollback(r) => participant::handle_rollback(ctx, &cache, r),
        Request::Replicate(r) => handle_replicate(ctx, &cache, r),
        Request::AtomicUpdate(r) => participant::handle_atomic_update(ctx, &cache, r).await,
    }
}

async fn follow_topology(
    ctx: Arc<NodeContext>,
    mut topology: watch::Receiver<TopologyEvent>,
    applied: watch::Sender<u64>,
) {
    loop {
        let event = topology.borrow_and_update().clone();
        ctx.apply_topology(&event);
        applied.send_replace(ctx.topology_version());
        if topology.changed().await.is_err() {
            break;
        }
    }
}

async fn reap(ctx: Arc<NodeContext>) {
    let grace = ctx.config.reaper_grace();
    let mut interval = tokio::time::interval(ctx.config.reaper_interval());
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let now = Instant::now();
        for cache in ctx.caches() {
            let reaped = participant::reap_expired(&ctx, cache, now, grace);
            if reaped > 0 {
                tracing::info!(
                    "Reaper on {} rolled back {} transactions in '{}'",
                    ctx.id,
                    reaped,
                    cache.name()
                );
            }
        }
    }
}
