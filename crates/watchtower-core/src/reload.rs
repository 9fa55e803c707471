use tracing::info;

/// Called after a branch switch, a successful auto-pull, or a settled burst
/// of working-tree changes. The transport (SSE, websocket, nothing) lives
/// on the other side of this trait.
pub trait ReloadHook: Send + Sync {
    fn notify_clients(&self, reason: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReload;

impl ReloadHook for NoopReload {
    fn notify_clients(&self, _reason: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReload;

impl ReloadHook for LoggingReload {
    fn notify_clients(&self, reason: &str) {
        info!(reason, "reload_clients");
    }
}
