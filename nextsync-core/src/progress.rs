/// One progress report from a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Bytes moved since the previous report.
    pub rate: u64,
    pub transferred: u64,
    pub total: Option<u64>,
    pub name: String,
}

impl ProgressUpdate {
    /// Integer percent of the transfer, `None` while the total is unknown.
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(total) if total > 0 => {
                let percent = self.transferred.saturating_mul(100) / total;
                Some(percent.min(100) as u8)
            }
            _ => None,
        }
    }
}

/// Receives progress while a transfer runs. Called from the transferring task,
/// so implementations must not block.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: &ProgressUpdate) {
        self(update)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_progress(&self, _update: &ProgressUpdate) {}
}
