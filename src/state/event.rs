#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Channel (re)connected; a snapshot refetch is due.
    Connected,
    /// Local request to refetch the snapshot without a reconnect.
    RefreshRequested,
    SnapshotApplied,
    SnapshotFailed,
    Disconnected,
}
