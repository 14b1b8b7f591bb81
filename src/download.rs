//! Download coordinator.
//!
//! A single logical task drives all scheduling: it supervises peer
//! sessions, assigns pieces (rarest-first with sequential fallback),
//! enforces per-piece deadlines, and replenishes the peer pool from the
//! trackers. Peer sessions run concurrently and feed one mpsc mailbox;
//! every piece of shared state is mutated only on this task.
use crate::bitfield::BitField;
use crate::peer::session::{self, PeerEvent, PeerHandle};
use crate::store::{PieceCompletion, PieceStore, StoreError};
use crate::torrent::TorrentMeta;
use crate::tracker::{self, Event, TransferStats};
use anyhow::{bail, Context};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Floor between two announces to the same swarm; keeps starving ticks
/// from hammering the trackers.
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the output file is created in.
    pub output_dir: PathBuf,
    /// Listen port advertised to trackers.
    pub port: u16,
    /// Peers dialed at startup.
    pub initial_peers: usize,
    /// Peers dialed per replenishment batch.
    pub dial_batch: usize,
    /// Hard cap on concurrent peer sessions.
    pub max_peers: usize,
    /// Below this many sessions the pool is replenished.
    pub min_peers: usize,
    /// In-flight pieces allowed per ready, unchoked peer.
    pub pipeline_depth: usize,
    /// Deadline from assignment to the piece's last block.
    pub piece_timeout: Duration,
    /// Cadence of the scheduling pass.
    pub tick_interval: Duration,
    /// Connect timeout for coordinator-initiated dials.
    pub dial_timeout: Duration,
    /// Consecutive empty tracker batches tolerated before aborting.
    pub max_empty_batches: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_dir: PathBuf::from("."),
            port: 6881,
            initial_peers: 30,
            dial_batch: 50,
            max_peers: 50,
            min_peers: 5,
            pipeline_depth: 3,
            piece_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(5),
            max_empty_batches: 5,
        }
    }
}

/// Coordinator-side view of one peer session.
struct PeerInfo {
    handle: PeerHandle,
    ready: bool,
    choked: bool,
    bytes_down: u64,
    connected_at: Instant,
}

impl PeerInfo {
    fn new(handle: PeerHandle) -> Self {
        PeerInfo {
            handle,
            ready: false,
            choked: true,
            bytes_down: 0,
            connected_at: Instant::now(),
        }
    }

    /// Bytes per second since the session became ready; the ordering key
    /// for assignment.
    fn throughput(&self) -> f64 {
        let secs = self.connected_at.elapsed().as_secs_f64().max(0.1);
        self.bytes_down as f64 / secs
    }
}

/// One outstanding piece assignment. At most one exists per piece index.
struct InFlight {
    addr: SocketAddr,
    deadline: Instant,
}

/**
Drives a whole download to completion.

Owns the piece store, the tracker client, and a handle per peer session.
`run` resolves once every piece is verified and persisted (success) or a
fatal condition aborts the download.
*/
pub struct Downloader {
    meta: Arc<TorrentMeta>,
    config: Config,
    tracker: tracker::Client,
    store: PieceStore,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    peers: HashMap<SocketAddr, PeerInfo>,
    failed: HashSet<SocketAddr>,
    bitfields: HashMap<SocketAddr, BitField>,
    in_flight: HashMap<u32, InFlight>,
    empty_batches: u32,
    last_announce: Instant,
}

impl Downloader {
    pub async fn new(meta: Arc<TorrentMeta>, config: Config) -> anyhow::Result<Self> {
        let store = PieceStore::new(&meta, &config.output_dir)
            .await
            .context("failed to initialise the output file")?;
        let tracker = tracker::Client::new(config.port)?;
        let (events_tx, events_rx) = mpsc::channel(256);
        Ok(Downloader {
            meta,
            config,
            tracker,
            store,
            events_tx,
            events_rx,
            peers: HashMap::new(),
            failed: HashSet::new(),
            bitfields: HashMap::new(),
            in_flight: HashMap::new(),
            empty_batches: 0,
            last_announce: Instant::now(),
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            name = %self.meta.file_name,
            pieces = self.meta.num_pieces(),
            bytes = self.meta.total_length,
            trackers = self.meta.announce_list.len(),
            "starting download"
        );

        match self
            .tracker
            .announce(&self.meta, Event::Started, self.transfer_stats())
            .await
        {
            Ok(peers) => {
                let limit = self.config.initial_peers;
                self.dial(peers, limit);
            }
            Err(error) => {
                // Not yet fatal; the replenishment path keeps retrying up
                // to the empty-batch limit.
                warn!(%error, "initial announce failed");
                self.empty_batches = 1;
            }
        }

        self.last_announce = Instant::now();

        let mut tick = tokio::time::interval_at(
            Instant::now() + self.config.tick_interval,
            self.config.tick_interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if self.store.is_complete() {
                break Ok(());
            }
            tokio::select! {
                event = self.events_rx.recv() => {
                    // recv cannot return None: the coordinator keeps a sender.
                    let Some(event) = event else { break Ok(()) };
                    if let Err(error) = self.on_event(event).await {
                        break Err(error);
                    }
                }
                _ = tick.tick() => {
                    if let Err(error) = self.tick().await {
                        break Err(error);
                    }
                }
            }
        };

        let success = result.is_ok();
        let finish = self.shutdown(success).await;
        result?;
        finish?;
        info!(path = %self.store.path().display(), "download complete and verified");
        Ok(())
    }

    /// One scheduling pass: reclaim overdue pieces, hand out assignments,
    /// and top up the peer pool when starving.
    async fn tick(&mut self) -> anyhow::Result<()> {
        self.expire_overdue();
        let assigned = self.assign_all();

        let (done, total) = self.store.progress();
        debug!(
            pieces = format!("{done}/{total}"),
            in_flight = self.in_flight.len(),
            peers = self.peers.len(),
            assigned,
            "scheduler tick"
        );

        let starving = self.peers.len() < self.config.min_peers
            || (assigned == 0 && self.in_flight.is_empty());
        if starving && !self.store.is_complete() {
            self.replenish().await?;
        }
        Ok(())
    }

    async fn on_event(&mut self, event: PeerEvent) -> anyhow::Result<()> {
        match event {
            PeerEvent::Ready { addr, peer_id } => {
                debug!(peer = %addr, id = %hex::encode(peer_id), "peer ready");
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.ready = true;
                    peer.connected_at = Instant::now();
                }
            }
            PeerEvent::Bitfield { addr, payload } => {
                match BitField::from_payload(payload, self.meta.num_pieces()) {
                    Some(bitfield) => {
                        self.bitfields.insert(addr, bitfield);
                        self.assign_to(addr);
                    }
                    None => {
                        warn!(peer = %addr, "undersized bitfield, dropping peer");
                        self.failed.insert(addr);
                        if let Some(peer) = self.peers.get(&addr) {
                            peer.handle.disconnect();
                        }
                    }
                }
            }
            PeerEvent::Have { addr, index } => {
                let num_pieces = self.meta.num_pieces();
                self.bitfields
                    .entry(addr)
                    .or_insert_with(|| BitField::new(num_pieces))
                    .set(index as usize);
            }
            PeerEvent::Choke { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked = true;
                }
            }
            PeerEvent::Unchoke { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked = false;
                }
                self.assign_to(addr);
            }
            PeerEvent::Block {
                addr,
                index,
                begin,
                data,
            } => self.on_block(addr, index, begin, data).await?,
            PeerEvent::Error { addr, error } => {
                warn!(peer = %addr, %error, "peer failed");
                self.failed.insert(addr);
            }
            PeerEvent::Disconnected { addr } => {
                debug!(peer = %addr, "peer disconnected");
                self.peers.remove(&addr);
                self.bitfields.remove(&addr);
                self.release_assignments(addr);
            }
        }
        Ok(())
    }

    async fn on_block(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.bytes_down += data.len() as u64;
        }

        match self.store.add_block(index, begin, data) {
            Ok(PieceCompletion::Incomplete) | Ok(PieceCompletion::AlreadyCompleted) => {}
            Ok(PieceCompletion::Completed(bytes)) => {
                self.store
                    .persist(index, &bytes)
                    .await
                    .context("failed to persist a verified piece")?;
                self.in_flight.remove(&index);
                let (done, total) = self.store.progress();
                info!(piece = index, peer = %addr, "piece verified ({done}/{total})");
                // The delivering peer just proved itself; keep it busy.
                self.assign_to(addr);
            }
            Ok(PieceCompletion::Failed) => {
                // The store already reset the piece; free the slot so it
                // can be retried, possibly via another peer.
                self.in_flight.remove(&index);
            }
            Err(StoreError::BlockOutOfRange { .. }) => {
                warn!(peer = %addr, piece = index, "block out of range, resetting piece");
                self.store.reset(index);
                self.in_flight.remove(&index);
            }
            Err(StoreError::UnknownPiece(_)) => {
                warn!(peer = %addr, piece = index, "block for unknown piece ignored");
            }
            Err(error) => return Err(error).context("piece store failure"),
        }
        Ok(())
    }

    /// Resets pieces whose deadline passed; they become assignable again
    /// in the same pass.
    fn expire_overdue(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(&index, _)| index)
            .collect();
        for index in expired {
            warn!(piece = index, "piece request timed out");
            self.store.reset(index);
            self.in_flight.remove(&index);
        }
    }

    /// Attempts assignments for every ready, unchoked peer, fastest first.
    fn assign_all(&mut self) -> usize {
        let mut order: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.ready && !peer.choked)
            .map(|(&addr, _)| addr)
            .collect();
        order.sort_by(|a, b| self.peers[b].throughput().total_cmp(&self.peers[a].throughput()));

        order.into_iter().map(|addr| self.assign_to(addr)).sum()
    }

    /// Assigns pieces to one peer up to the pipeline depth.
    fn assign_to(&mut self, addr: SocketAddr) -> usize {
        let Some(peer) = self.peers.get(&addr) else {
            return 0;
        };
        if !peer.ready || peer.choked {
            return 0;
        }

        let current = self
            .in_flight
            .values()
            .filter(|flight| flight.addr == addr)
            .count();
        let mut made = 0;
        while current + made < self.config.pipeline_depth {
            let Some((index, size)) = self.pick_piece(addr) else {
                break;
            };
            let assigned = self
                .peers
                .get(&addr)
                .is_some_and(|peer| peer.handle.download(index, size));
            if !assigned {
                self.store.reset(index);
                break;
            }
            debug!(peer = %addr, piece = index, size, "assigned piece");
            self.in_flight.insert(
                index,
                InFlight {
                    addr,
                    deadline: Instant::now() + self.config.piece_timeout,
                },
            );
            made += 1;
        }
        made
    }

    /// Picks a piece this peer can actually serve: rarest-first, then
    /// sequential. A candidate the peer does not advertise goes straight
    /// back to idle.
    fn pick_piece(&mut self, addr: SocketAddr) -> Option<(u32, u32)> {
        let bitfield = self.bitfields.get(&addr)?;

        if let Some((index, size)) = self.store.rarest(&self.bitfields) {
            if bitfield.has_piece(index as usize) {
                return Some((index, size));
            }
            self.store.reset(index);
        }
        if let Some((index, size)) = self.store.next_sequential() {
            if bitfield.has_piece(index as usize) {
                return Some((index, size));
            }
            self.store.reset(index);
        }
        None
    }

    /// Returns every piece assigned to a lost peer to the idle pool.
    fn release_assignments(&mut self, addr: SocketAddr) {
        let released: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.addr == addr)
            .map(|(&index, _)| index)
            .collect();
        for index in released {
            debug!(peer = %addr, piece = index, "releasing piece from lost peer");
            self.store.reset(index);
            self.in_flight.remove(&index);
        }
    }

    /// Asks the trackers for fresh peers and dials the new ones.
    ///
    /// Aborts the download after `max_empty_batches` consecutive cycles in
    /// which no tracker produced any peer.
    async fn replenish(&mut self) -> anyhow::Result<()> {
        if self.last_announce.elapsed() < MIN_ANNOUNCE_INTERVAL {
            return Ok(());
        }
        self.last_announce = Instant::now();

        let batch = match self
            .tracker
            .announce(&self.meta, Event::None, self.transfer_stats())
            .await
        {
            Ok(peers) => peers,
            Err(error) => {
                warn!(%error, "peer refresh failed");
                Vec::new()
            }
        };

        if batch.is_empty() {
            self.empty_batches += 1;
            if self.empty_batches >= self.config.max_empty_batches {
                bail!(
                    "no tracker returned peers for {} consecutive refresh cycles",
                    self.empty_batches
                );
            }
            return Ok(());
        }

        self.empty_batches = 0;
        let limit = self.config.dial_batch;
        self.dial(batch, limit);
        Ok(())
    }

    /// Spawns sessions for up to `limit` candidates, skipping peers that
    /// are already connected or previously failed.
    fn dial(&mut self, candidates: Vec<SocketAddr>, limit: usize) {
        let mut dialed = 0;
        for addr in candidates {
            if dialed >= limit || self.peers.len() >= self.config.max_peers {
                break;
            }
            if self.peers.contains_key(&addr) || self.failed.contains(&addr) {
                continue;
            }
            let handle = session::spawn(
                addr,
                self.meta.info_hash,
                self.tracker.peer_id(),
                self.config.dial_timeout,
                self.events_tx.clone(),
            );
            self.peers.insert(addr, PeerInfo::new(handle));
            dialed += 1;
        }
        if dialed > 0 {
            info!(dialed, active = self.peers.len(), "dialing peers");
        }
    }

    /// Drains the peer pool and reports the final state to the trackers.
    /// On success the output file is fsynced and fully re-verified first.
    async fn shutdown(&mut self, success: bool) -> anyhow::Result<()> {
        for peer in self.peers.values() {
            peer.handle.disconnect();
        }

        let finish = if success {
            let verified = async {
                self.store.finalize().await?;
                self.store.verify_file().await
            }
            .await;
            verified.context("final re-verification failed")
        } else {
            Ok(())
        };

        let event = if success && finish.is_ok() {
            Event::Completed
        } else {
            Event::Stopped
        };
        if let Err(error) = self
            .tracker
            .announce(&self.meta, event, self.transfer_stats())
            .await
        {
            debug!(%error, "final announce failed");
        }
        finish
    }

    fn transfer_stats(&self) -> TransferStats {
        let stats = self.store.stats();
        TransferStats {
            uploaded: 0,
            downloaded: stats.bytes_completed,
            left: stats.bytes_total - stats.bytes_completed,
        }
    }
}
