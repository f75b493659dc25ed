//! Logger seam injected into [`crate::AcpxRuntime`].
//!
//! The host decides where adapter diagnostics go. [`TracingLogger`] is the
//! default and forwards everything to `tracing` under the `acpx` target.

/// Minimal leveled logger accepted by the adapter.
pub trait RuntimeLogger: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    fn debug(&self, message: &str);
}

/// Forwards adapter messages to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl RuntimeLogger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "acpx", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "acpx", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "acpx", "{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "acpx", "{message}");
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl RuntimeLogger for NoopLogger {
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn debug(&self, _message: &str) {}
}

// Compile-time assertion: RuntimeLogger must be usable as `dyn RuntimeLogger`.
const _: () = {
    fn _assert_object_safe(_: &dyn RuntimeLogger) {}
};
