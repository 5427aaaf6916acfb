use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use {
    bytes::Bytes,
    serde_json::json,
    tracing::{debug, info, warn},
};

use {
    switchyard_protocol::{ErrorShape, decode_chunk, encode_chunk, events},
    switchyard_storage::{PendingChunk, SizedSink, read_chunk},
};

use crate::{
    outbound::Delivery,
    state::GatewayState,
    transfer::{
        AcceptParams, DoneParams, Endpoint, MetaParams, TransferInfo, TransferState,
        TransferSummary, TransferWaiter, describe_peer_error,
    },
};

struct TransferRecord {
    id: u32,
    source: Endpoint,
    destination: Endpoint,
    state: TransferState,
    size: Option<u64>,
    mime: Option<String>,
    waiter: Option<TransferWaiter>,
    /// Open write when the destination is the object store.
    sink: Option<SizedSink>,
    bytes: u64,
    touched_at: Instant,
}

impl TransferRecord {
    fn touch(&mut self) {
        self.touched_at = Instant::now();
    }

    fn involves(&self, node_id: &str) -> bool {
        self.source.node_id() == Some(node_id) || self.destination.node_id() == Some(node_id)
    }

    fn info(&self) -> TransferInfo {
        TransferInfo {
            transfer_id: self.id,
            source: self.source.clone(),
            destination: self.destination.clone(),
            state: self.state,
            size: self.size,
            mime: self.mime.clone(),
            bytes: self.bytes,
        }
    }

    fn summary(&self, bytes_transferred: u64) -> TransferSummary {
        TransferSummary {
            source: self.source.clone(),
            destination: self.destination.clone(),
            bytes_transferred,
            mime: self.mime.clone(),
        }
    }

    /// Tear down a removed record: abort node endpoints, drop the partial
    /// write, and fail the waiter.
    fn into_failure(mut self, error: &ErrorShape) -> Vec<Delivery> {
        let mut out = Vec::new();
        for ep in [&self.source, &self.destination] {
            if let Some(node) = ep.node_id() {
                out.push(Delivery::event_to_node(
                    node,
                    events::TRANSFER_ABORT,
                    json!({ "transferId": self.id, "error": error.message }),
                ));
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
        if let Some(waiter) = self.waiter.take()
            && let Some(d) = waiter.settle(Err(error.clone()))
        {
            out.push(d);
        }
        out
    }

    fn into_success(mut self, bytes_transferred: u64) -> Option<Delivery> {
        let summary = self.summary(bytes_transferred);
        self.waiter.take().and_then(|w| w.settle(Ok(summary)))
    }
}

/// Table of live transfers.
///
/// The table lock is never held across an await; every step re-reads the
/// record after any suspension and acts only if the state it expects is
/// still current.
pub struct TransferCoordinator {
    next_id: AtomicU32,
    table: Mutex<HashMap<u32, TransferRecord>>,
}

impl Default for TransferCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunks a node destination may have queued before a stream waits for its
/// write loop.
pub(crate) const STREAM_WINDOW_CHUNKS: usize = 4;

/// Where an accepted chunk goes once the table lock is released.
enum ChunkRoute {
    Store(PendingChunk),
    Relay(String),
    Reject(ErrorShape),
}

enum CompleteStep {
    /// Tell the destination node the stream ended.
    Forward(String),
    /// Commit the store write.
    Finalize(Option<SizedSink>),
}

fn forbidden_sender(step: &str, side: &str) -> ErrorShape {
    ErrorShape::forbidden(format!("{step} must come from the {side} node"))
}

impl TransferCoordinator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u32, TransferRecord>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn state_of(&self, id: u32) -> Option<TransferState> {
        self.table().get(&id).map(|r| r.state)
    }

    /// Live transfers ordered by id.
    pub fn list(&self) -> Vec<TransferInfo> {
        let mut out: Vec<TransferInfo> = self.table().values().map(TransferRecord::info).collect();
        out.sort_by_key(|t| t.transfer_id);
        out
    }

    /// Create a transfer and kick off its first step.
    ///
    /// A node source is asked for metadata with `transfer.request`; a storage
    /// source is read locally and the transfer proceeds as if that metadata
    /// had arrived.
    pub async fn begin(
        &self,
        state: &GatewayState,
        source: Endpoint,
        destination: Endpoint,
        waiter: TransferWaiter,
    ) -> Result<u32, ErrorShape> {
        let source = source.normalized()?;
        let destination = destination.normalized()?;
        if source.is_storage() && destination.is_storage() {
            return Err(ErrorShape::bad_request(
                "storage-to-storage transfers are not supported",
            ));
        }
        {
            let inner = state.inner.read().await;
            for ep in [&source, &destination] {
                if let Some(node) = ep.node_id()
                    && !inner.connections.is_node_connected(node)
                {
                    return Err(ErrorShape::not_connected(format!(
                        "node not connected: {node}"
                    )));
                }
            }
        }
        let source_meta = if source.is_storage() {
            Some(state.objects.head(&source.path).await?)
        } else {
            None
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(transfer_id = id, source = %source, destination = %destination, "transfer started");
        let request = source.node_id().map(|node| {
            Delivery::event_to_node(
                node,
                events::TRANSFER_REQUEST,
                json!({ "transferId": id, "path": source.path }),
            )
        });
        self.table().insert(id, TransferRecord {
            id,
            source,
            destination,
            state: TransferState::MetaWait,
            size: None,
            mime: None,
            waiter: Some(waiter),
            sink: None,
            bytes: 0,
            touched_at: Instant::now(),
        });

        match (source_meta, request) {
            (Some(meta), _) => self.apply_meta(state, id, meta.size, meta.mime).await,
            (None, Some(request)) => {
                state.deliver(vec![request]).await;
            },
            (None, None) => {},
        }
        Ok(id)
    }

    /// Size and type are known: open the store write or offer the data to
    /// the destination node.
    async fn apply_meta(&self, state: &GatewayState, id: u32, size: u64, mime: Option<String>) {
        let (source, destination) = {
            let mut table = self.table();
            let Some(rec) = table.get_mut(&id) else {
                return;
            };
            if rec.state != TransferState::MetaWait || rec.size.is_some() {
                return;
            }
            rec.size = Some(size);
            rec.mime = mime.clone();
            rec.touch();
            (rec.source.clone(), rec.destination.clone())
        };

        let Some(dest_node) = destination.node_id() else {
            let opened = SizedSink::open(
                Arc::clone(&state.objects),
                &destination.path,
                size,
                mime.as_deref(),
            )
            .await;
            let sink = match opened {
                Ok(sink) => sink,
                Err(e) => {
                    self.fail(state, id, e.into()).await;
                    return;
                },
            };
            let started = {
                let mut table = self.table();
                match table.get_mut(&id) {
                    Some(rec) if rec.state == TransferState::MetaWait => {
                        rec.sink = Some(sink);
                        rec.state = TransferState::Streaming;
                        rec.touch();
                        true
                    },
                    _ => {
                        sink.abort();
                        false
                    },
                }
            };
            if started && let Some(src_node) = source.node_id() {
                debug!(transfer_id = id, size, "store sink open, starting source");
                state
                    .deliver(vec![Delivery::event_to_node(
                        src_node,
                        events::TRANSFER_START,
                        json!({ "transferId": id }),
                    )])
                    .await;
            }
            return;
        };

        let offered = {
            let mut table = self.table();
            match table.get_mut(&id) {
                Some(rec) if rec.state == TransferState::MetaWait => {
                    rec.state = TransferState::AcceptWait;
                    true
                },
                _ => false,
            }
        };
        if offered {
            state
                .deliver(vec![Delivery::event_to_node(
                    dest_node,
                    events::TRANSFER_RECEIVE,
                    json!({
                        "transferId": id,
                        "path": destination.path,
                        "size": size,
                        "mime": mime,
                        "source": source,
                    }),
                )])
                .await;
        }
    }

    // ── Control frames ───────────────────────────────────────────────────────

    /// `transfer.meta` from the source node.
    pub async fn on_meta(
        &self,
        state: &GatewayState,
        sender: &str,
        params: MetaParams,
    ) -> Result<(), ErrorShape> {
        let id = params.transfer_id;
        {
            let table = self.table();
            let Some(rec) = table.get(&id) else {
                debug!(transfer_id = id, "meta for unknown transfer ignored");
                return Ok(());
            };
            if rec.source.node_id() != Some(sender) {
                return Err(forbidden_sender("transfer.meta", "source"));
            }
            if rec.state != TransferState::MetaWait {
                return Ok(());
            }
        }
        if let Some(error) = params.error {
            let message = describe_peer_error(&error);
            self.fail(
                state,
                id,
                ErrorShape::internal(format!("source failed: {message}")),
            )
            .await;
            return Ok(());
        }
        let Some(size) = params.size else {
            let err = ErrorShape::bad_request("transfer.meta requires size");
            self.fail(state, id, err.clone()).await;
            return Err(err);
        };
        self.apply_meta(state, id, size, params.mime).await;
        Ok(())
    }

    /// `transfer.accept` from the destination node.
    pub async fn on_accept(
        &self,
        state: &Arc<GatewayState>,
        sender: &str,
        params: AcceptParams,
    ) -> Result<(), ErrorShape> {
        let id = params.transfer_id;
        {
            let table = self.table();
            let Some(rec) = table.get(&id) else {
                debug!(transfer_id = id, "accept for unknown transfer ignored");
                return Ok(());
            };
            if rec.destination.node_id() != Some(sender) {
                return Err(forbidden_sender("transfer.accept", "destination"));
            }
            if rec.state != TransferState::AcceptWait {
                return Ok(());
            }
        }
        if let Some(error) = params.error {
            let message = describe_peer_error(&error);
            self.fail(
                state,
                id,
                ErrorShape::internal(format!("destination refused: {message}")),
            )
            .await;
            return Ok(());
        }

        let source = {
            let mut table = self.table();
            match table.get_mut(&id) {
                Some(rec) if rec.state == TransferState::AcceptWait => {
                    rec.state = TransferState::Streaming;
                    rec.touch();
                    rec.source.clone()
                },
                _ => return Ok(()),
            }
        };
        match source.node_id() {
            Some(node) => {
                state
                    .deliver(vec![Delivery::event_to_node(
                        node,
                        events::TRANSFER_START,
                        json!({ "transferId": id }),
                    )])
                    .await;
            },
            None => {
                tokio::spawn(stream_from_storage(Arc::clone(state), id));
            },
        }
        Ok(())
    }

    /// A binary frame from a node. Bytes for a store destination go into the
    /// sink; bytes for a node destination are forwarded as-is.
    pub async fn on_chunk(&self, state: &GatewayState, sender: &str, frame: Bytes) {
        let chunk = match decode_chunk(frame.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(node_id = sender, error = %e, "invalid binary frame");
                return;
            },
        };
        let id = chunk.transfer_id;
        let len = chunk.data.len() as u64;

        let route = {
            let mut table = self.table();
            let Some(rec) = table.get_mut(&id) else {
                debug!(transfer_id = id, "chunk for unknown transfer dropped");
                return;
            };
            if rec.source.node_id() != Some(sender) {
                warn!(transfer_id = id, node_id = sender, "chunk from a node that is not the source");
                return;
            }
            if rec.state != TransferState::Streaming {
                debug!(transfer_id = id, state = ?rec.state, "chunk outside streaming dropped");
                return;
            }
            rec.bytes += len;
            rec.touch();
            match (rec.sink.as_mut(), rec.destination.node_id()) {
                (Some(sink), _) => match sink.accept(chunk.data) {
                    Ok(pending) => ChunkRoute::Store(pending),
                    Err(e) => ChunkRoute::Reject(ErrorShape::from(e)),
                },
                (None, Some(node)) => ChunkRoute::Relay(node.to_string()),
                (None, None) => ChunkRoute::Reject(ErrorShape::internal("store sink missing")),
            }
        };

        // Both waits below hold up this node's frame loop, which is what
        // pushes back on a source that sends faster than the far side takes.
        match route {
            ChunkRoute::Store(pending) => {
                if let Err(e) = pending.send().await {
                    self.fail(state, id, e.into()).await;
                }
            },
            ChunkRoute::Relay(node) => match pace_to_node(state, &node).await {
                Ok(()) => {
                    state
                        .deliver(vec![Delivery::binary_to_node(node, frame)])
                        .await;
                },
                Err(err) => self.fail(state, id, err).await,
            },
            ChunkRoute::Reject(err) => self.fail(state, id, err).await,
        }
    }

    /// `transfer.complete` from the source node.
    pub async fn on_complete(
        &self,
        state: &GatewayState,
        sender: &str,
        id: u32,
    ) -> Result<(), ErrorShape> {
        let step = {
            let mut table = self.table();
            let Some(rec) = table.get_mut(&id) else {
                debug!(transfer_id = id, "complete for unknown transfer ignored");
                return Ok(());
            };
            if rec.source.node_id() != Some(sender) {
                return Err(forbidden_sender("transfer.complete", "source"));
            }
            if rec.state != TransferState::Streaming {
                return Ok(());
            }
            rec.state = TransferState::Completing;
            rec.touch();
            match rec.destination.node_id() {
                Some(node) => CompleteStep::Forward(node.to_string()),
                None => CompleteStep::Finalize(rec.sink.take()),
            }
        };

        match step {
            CompleteStep::Forward(dest_node) => {
                state
                    .deliver(vec![Delivery::event_to_node(
                        dest_node,
                        events::TRANSFER_END,
                        json!({ "transferId": id }),
                    )])
                    .await;
            },
            CompleteStep::Finalize(None) => {
                self.fail(state, id, ErrorShape::internal("store sink missing"))
                    .await;
            },
            CompleteStep::Finalize(Some(sink)) => {
                let key = sink.key().to_string();
                let finished = sink.finish().await;
                let removed = self.table().remove(&id);
                let Some(rec) = removed else {
                    // Failed while the write was being finalised.
                    if finished.is_ok() && let Err(e) = state.objects.delete(&key).await {
                        warn!(transfer_id = id, key, error = %e, "failed to remove orphaned object");
                    }
                    return Ok(());
                };
                match finished {
                    Ok(meta) => {
                        info!(transfer_id = id, key, bytes = meta.size, "transfer stored");
                        if let Some(d) = rec.into_success(meta.size) {
                            state.deliver(vec![d]).await;
                        }
                    },
                    Err(e) => {
                        let err = ErrorShape::from(e);
                        warn!(transfer_id = id, error = %err.message, "transfer failed");
                        state.deliver(rec.into_failure(&err)).await;
                    },
                }
            },
        }
        Ok(())
    }

    /// `transfer.done` from the destination node.
    pub async fn on_done(
        &self,
        state: &GatewayState,
        sender: &str,
        params: DoneParams,
    ) -> Result<(), ErrorShape> {
        let id = params.transfer_id;
        let size = {
            let table = self.table();
            let Some(rec) = table.get(&id) else {
                debug!(transfer_id = id, "done for unknown transfer ignored");
                return Ok(());
            };
            if rec.destination.node_id() != Some(sender) {
                return Err(forbidden_sender("transfer.done", "destination"));
            }
            if rec.state != TransferState::Completing {
                return Ok(());
            }
            rec.size
        };
        if let Some(error) = params.error {
            let message = describe_peer_error(&error);
            self.fail(
                state,
                id,
                ErrorShape::internal(format!("destination failed: {message}")),
            )
            .await;
            return Ok(());
        }
        let written = params.bytes_written;
        if let (Some(expected), Some(written)) = (size, written)
            && expected != written
        {
            self.fail(
                state,
                id,
                ErrorShape::internal(format!(
                    "size mismatch: {expected} bytes declared, {written} written"
                )),
            )
            .await;
            return Ok(());
        }

        let removed = self.table().remove(&id);
        if let Some(rec) = removed {
            let bytes = written.unwrap_or(rec.bytes);
            info!(transfer_id = id, bytes, "transfer done");
            if let Some(d) = rec.into_success(bytes) {
                state.deliver(vec![d]).await;
            }
        }
        Ok(())
    }

    // ── Failure paths ────────────────────────────────────────────────────────

    /// Remove a transfer and notify everyone involved. No-op if it is
    /// already gone.
    pub async fn fail(&self, state: &GatewayState, id: u32, error: ErrorShape) {
        let removed = self.table().remove(&id);
        let Some(rec) = removed else {
            return;
        };
        warn!(transfer_id = id, code = error.code, error = %error.message, "transfer failed");
        state.deliver(rec.into_failure(&error)).await;
    }

    /// Fail every transfer with `node_id` as an endpoint.
    pub async fn fail_for_node(&self, state: &GatewayState, node_id: &str) {
        let ids: Vec<u32> = self
            .table()
            .values()
            .filter(|r| r.involves(node_id))
            .map(|r| r.id)
            .collect();
        for id in ids {
            self.fail(
                state,
                id,
                ErrorShape::not_connected(format!("node disconnected: {node_id}")),
            )
            .await;
        }
    }

    /// Fail transfers idle for at least `ttl`. Returns how many.
    pub async fn sweep(&self, state: &GatewayState, ttl: Duration, now: Instant) -> usize {
        let ids: Vec<u32> = self
            .table()
            .values()
            .filter(|r| now.saturating_duration_since(r.touched_at) >= ttl)
            .map(|r| r.id)
            .collect();
        let count = ids.len();
        for id in ids {
            self.fail(state, id, ErrorShape::unavailable("transfer timed out"))
                .await;
        }
        count
    }
}

/// Wait until `node_id`'s write loop has less than the streaming window
/// queued. Fails if the node is gone or stays stalled for a transfer TTL.
async fn pace_to_node(state: &GatewayState, node_id: &str) -> Result<(), ErrorShape> {
    let backlog = state
        .inner
        .read()
        .await
        .connections
        .node(node_id)
        .map(|c| c.backlog.clone());
    let gone = || ErrorShape::not_connected(format!("node disconnected: {node_id}"));
    let Some(backlog) = backlog else {
        return Err(gone());
    };
    let window = state
        .limits
        .chunk_size
        .max(1)
        .saturating_mul(STREAM_WINDOW_CHUNKS);
    let stall = Duration::from_secs(state.limits.transfer_ttl_secs.max(1));
    match tokio::time::timeout(stall, backlog.wait_below(window)).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(gone()),
        Err(_) => Err(ErrorShape::unavailable("transfer timed out")),
    }
}

/// Push a stored object to the destination node in `chunk_size` frames,
/// then signal end of stream. Stops as soon as the transfer leaves the
/// streaming state, and never runs more than the streaming window ahead of
/// the destination's write loop.
async fn stream_from_storage(state: Arc<GatewayState>, id: u32) {
    let coord = &state.transfers;
    let endpoints = coord
        .table()
        .get(&id)
        .map(|r| (r.source.path.clone(), r.destination.node.clone()));
    let Some((key, dest_node)) = endpoints else {
        return;
    };

    let mut reader = match state.objects.open(&key).await {
        Ok(r) => r,
        Err(e) => {
            coord.fail(&state, id, e.into()).await;
            return;
        },
    };

    loop {
        if let Err(err) = pace_to_node(&state, &dest_node).await {
            coord.fail(&state, id, err).await;
            return;
        }
        let chunk = match read_chunk(&mut reader, state.limits.chunk_size.max(1)).await {
            Ok(chunk) => chunk,
            Err(e) => {
                coord.fail(&state, id, e.into()).await;
                return;
            },
        };
        let live = {
            let mut table = coord.table();
            match table.get_mut(&id) {
                Some(rec) if rec.state == TransferState::Streaming => {
                    match &chunk {
                        Some(data) => rec.bytes += data.len() as u64,
                        None => rec.state = TransferState::Completing,
                    }
                    rec.touch();
                    true
                },
                _ => false,
            }
        };
        if !live {
            debug!(transfer_id = id, "storage stream stopped");
            return;
        }
        match chunk {
            Some(data) => {
                state
                    .deliver(vec![Delivery::binary_to_node(
                        dest_node.as_str(),
                        encode_chunk(id, &data),
                    )])
                    .await;
            },
            None => {
                state
                    .deliver(vec![Delivery::event_to_node(
                        dest_node.as_str(),
                        events::TRANSFER_END,
                        json!({ "transferId": id }),
                    )])
                    .await;
                return;
            },
        }
    }
}
