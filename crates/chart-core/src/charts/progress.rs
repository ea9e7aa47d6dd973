/// Receives download progress once per streamed chunk.
///
/// `total` is `None` when the server did not advertise a content length.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, transferred: u64, total: Option<u64>);
}

/// Emits progress as `tracing` debug events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn on_progress(&self, transferred: u64, total: Option<u64>) {
        match total {
            Some(total) if total > 0 => {
                let percent = transferred.saturating_mul(100) / total;
                tracing::debug!(transferred, total, percent, "download progress");
            }
            _ => tracing::debug!(transferred, "download progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_progress_accepts_unknown_totals() {
        let observer: &dyn ProgressObserver = &TracingProgress;
        observer.on_progress(10, None);
        observer.on_progress(10, Some(0));
        observer.on_progress(10, Some(40));
    }
}
