//! Log sink collaborator: produces a bundled log artifact on request.

use std::path::PathBuf;

pub trait LogSink: Send {
    /// Bundle the current logs and return the bundle's path, or `None` if nothing could be
    /// produced.
    fn produce_bundle(&mut self) -> Option<PathBuf>;
}

impl<F> LogSink for F
where
    F: FnMut() -> Option<PathBuf> + Send,
{
    fn produce_bundle(&mut self) -> Option<PathBuf> {
        self()
    }
}
