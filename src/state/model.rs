/// Lifecycle of the session channel as seen by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel; inbound deltas cannot arrive.
    #[default]
    Offline,
    /// Channel is up but the authoritative snapshot has not been applied yet.
    Resyncing,
    Live,
}

impl ConnectionState {
    pub const fn accepts_deltas(self) -> bool {
        matches!(self, Self::Resyncing | Self::Live)
    }
}
