//! A small channel-sink abstraction so the supervisor can deliver state
//! change events without depending on any particular transport. Mirrors
//! the shape of `talpid_core::mpsc::Sender`: a trait object the daemon's
//! IPC layer implements, kept out of this crate's dependency graph.

/// Anything that can accept a value of type `T` without blocking the
/// supervisor's event loop.
pub trait Sender<T> {
    fn send(&self, value: T) -> Result<(), T>;
}

impl<T> Sender<T> for tokio::sync::mpsc::UnboundedSender<T> {
    fn send(&self, value: T) -> Result<(), T> {
        self.send(value).map_err(|e| e.0)
    }
}

impl<T> Sender<T> for futures::channel::mpsc::UnboundedSender<T> {
    fn send(&self, value: T) -> Result<(), T> {
        self.unbounded_send(value).map_err(|e| e.into_inner())
    }
}
