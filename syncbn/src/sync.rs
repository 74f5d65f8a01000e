use std::num::NonZeroUsize;

use log::debug;
use rendezvous::{MailboxReceiver, MailboxSender, mailbox};

use crate::{
    error::{Result, SyncBnErr},
    metrics::SyncMetrics,
    stats::{self, GlobalStats, GradPartials, GradTotals, PartialStats},
};

/// Which side of the rendezvous a device endpoint plays.
///
/// Assigned once at group construction and fixed for the lifetime of the
/// endpoint; never derived from a runtime device-index comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Coordinator,
    Worker,
}

/// The coordinator's side of one layer's rendezvous group.
///
/// Collects one partial per worker per round, combines them with its own,
/// and places an independent copy of the result into every worker mailbox
/// before returning. All partials for a round are fully collected before
/// any result is broadcast.
pub struct SyncCoordinator {
    workers: usize,
    stats_in: MailboxReceiver<PartialStats>,
    stats_out: Vec<MailboxSender<GlobalStats>>,
    grads_in: MailboxReceiver<GradPartials>,
    grads_out: Vec<MailboxSender<GradTotals>>,
    metrics: SyncMetrics,
}

/// A worker's side of one layer's rendezvous group.
///
/// One `send` into the coordinator mailbox, one blocking `recv` on its own
/// mailbox per round. A worker that never reaches its send deadlocks the
/// whole cohort; that precondition is the caller's to uphold.
pub struct SyncWorker {
    stats_out: MailboxSender<PartialStats>,
    stats_in: MailboxReceiver<GlobalStats>,
    grads_out: MailboxSender<GradPartials>,
    grads_in: MailboxReceiver<GradTotals>,
    metrics: SyncMetrics,
}

/// One device's handle into a layer's rendezvous group.
pub enum SyncEndpoint {
    Coordinator(SyncCoordinator),
    Worker(SyncWorker),
}

/// Builds the rendezvous group for one normalization layer.
///
/// Endpoint 0 is the coordinator (by convention the device holding the
/// first shard), the rest are workers. Groups are per-layer: mailboxes are
/// never shared between layers, so rounds of different layers can't be
/// confused. Returns an empty vec when `device_count <= 1`, where no
/// synchronization is needed.
pub fn sync_group(device_count: usize) -> Vec<SyncEndpoint> {
    let Some(master_cap) = NonZeroUsize::new(device_count.saturating_sub(1)) else {
        return Vec::new();
    };
    let workers = master_cap.get();

    // One shared multi-slot mailbox into the coordinator per direction.
    let (stats_tx, stats_in) = mailbox(master_cap);
    let (grads_tx, grads_in) = mailbox(master_cap);

    // One single-slot mailbox back out to each worker per direction.
    let mut stats_out = Vec::with_capacity(workers);
    let mut grads_out = Vec::with_capacity(workers);
    let mut worker_ends = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = mailbox(NonZeroUsize::MIN);
        stats_out.push(tx);
        let (gtx, grx) = mailbox(NonZeroUsize::MIN);
        grads_out.push(gtx);
        worker_ends.push((rx, grx));
    }

    let mut endpoints = Vec::with_capacity(workers + 1);
    endpoints.push(SyncEndpoint::Coordinator(SyncCoordinator {
        workers,
        stats_in,
        stats_out,
        grads_in,
        grads_out,
        metrics: SyncMetrics::default(),
    }));
    for (stats_in, grads_in) in worker_ends {
        endpoints.push(SyncEndpoint::Worker(SyncWorker {
            stats_out: stats_tx.clone(),
            stats_in,
            grads_out: grads_tx.clone(),
            grads_in,
            metrics: SyncMetrics::default(),
        }));
    }

    // The construction handles are dropped here, so a cohort whose workers
    // all hang up surfaces as a disconnect instead of a silent stall.
    endpoints
}

impl SyncCoordinator {
    /// Runs one forward reduction round from the coordinator seat.
    ///
    /// # Arguments
    /// * `local` - The coordinator's own shard statistics.
    ///
    /// # Returns
    /// The combined cohort statistics, already broadcast to every worker.
    /// A degenerate batch is still broadcast before the error is raised so
    /// the cohort fails the step in lockstep.
    pub fn reduce_stats(&mut self, local: PartialStats) -> Result<GlobalStats> {
        let mut partials = Vec::with_capacity(self.workers + 1);
        partials.push(local);
        for _ in 0..self.workers {
            let partial = self.stats_in.recv().map_err(|_| SyncBnErr::Disconnected)?;
            self.metrics.bump_recv();
            partials.push(partial);
        }

        let global = stats::combine(&partials);
        debug!(
            "combined stats round: devices = {}, elements = {}",
            partials.len(),
            global.count
        );

        for out in &self.stats_out {
            out.send(global.clone())
                .map_err(|_| SyncBnErr::Disconnected)?;
            self.metrics.bump_send();
        }
        self.metrics.bump_round();

        global.ensure_valid()?;
        Ok(global)
    }

    /// Runs one backward reduction round, identical rendezvous shape with
    /// gradient sums in place of raw data sums.
    pub fn reduce_grads(&mut self, local: GradPartials) -> Result<GradTotals> {
        let mut partials = Vec::with_capacity(self.workers + 1);
        partials.push(local);
        for _ in 0..self.workers {
            let partial = self.grads_in.recv().map_err(|_| SyncBnErr::Disconnected)?;
            self.metrics.bump_recv();
            partials.push(partial);
        }

        let totals = stats::combine_grads(&partials);
        for out in &self.grads_out {
            out.send(totals.clone())
                .map_err(|_| SyncBnErr::Disconnected)?;
            self.metrics.bump_send();
        }
        self.metrics.bump_round();

        Ok(totals)
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }
}

impl SyncWorker {
    /// Hands the local statistics to the coordinator and blocks until the
    /// combined result comes back.
    pub fn reduce_stats(&mut self, local: PartialStats) -> Result<GlobalStats> {
        self.stats_out
            .send(local)
            .map_err(|_| SyncBnErr::Disconnected)?;
        self.metrics.bump_send();

        let global = self.stats_in.recv().map_err(|_| SyncBnErr::Disconnected)?;
        self.metrics.bump_recv();
        self.metrics.bump_round();

        global.ensure_valid()?;
        Ok(global)
    }

    /// Backward counterpart of [`reduce_stats`](Self::reduce_stats).
    pub fn reduce_grads(&mut self, local: GradPartials) -> Result<GradTotals> {
        self.grads_out
            .send(local)
            .map_err(|_| SyncBnErr::Disconnected)?;
        self.metrics.bump_send();

        let totals = self.grads_in.recv().map_err(|_| SyncBnErr::Disconnected)?;
        self.metrics.bump_recv();
        self.metrics.bump_round();

        Ok(totals)
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }
}

impl SyncEndpoint {
    pub fn role(&self) -> DeviceRole {
        match self {
            SyncEndpoint::Coordinator(_) => DeviceRole::Coordinator,
            SyncEndpoint::Worker(_) => DeviceRole::Worker,
        }
    }

    pub fn reduce_stats(&mut self, local: PartialStats) -> Result<GlobalStats> {
        match self {
            SyncEndpoint::Coordinator(c) => c.reduce_stats(local),
            SyncEndpoint::Worker(w) => w.reduce_stats(local),
        }
    }

    pub fn reduce_grads(&mut self, local: GradPartials) -> Result<GradTotals> {
        match self {
            SyncEndpoint::Coordinator(c) => c.reduce_grads(local),
            SyncEndpoint::Worker(w) => w.reduce_grads(local),
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        match self {
            SyncEndpoint::Coordinator(c) => c.metrics(),
            SyncEndpoint::Worker(w) => w.metrics(),
        }
    }
}
