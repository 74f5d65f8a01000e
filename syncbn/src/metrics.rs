/// Per-endpoint counters over the rendezvous protocol.
///
/// For a cohort of `k` devices, one completed round leaves the coordinator
/// with `k - 1` receives and `k - 1` sends, and every worker with exactly
/// one send and one receive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncMetrics {
    pub sends: u64,
    pub recvs: u64,
    pub rounds: u64,
}

impl SyncMetrics {
    #[inline]
    pub fn bump_send(&mut self) {
        self.sends += 1;
    }

    #[inline]
    pub fn bump_recv(&mut self) {
        self.recvs += 1;
    }

    #[inline]
    pub fn bump_round(&mut self) {
        self.rounds += 1;
    }
}
