use crate::error::Error;

/// Notifications about an update session
///
/// Observers are called synchronously from within the session and only ever
/// receive values, so they cannot disturb the session they observe.
pub trait UpdateObserver {
    /// A session was opened
    fn on_start(&mut self) {}
    /// `progress` of `total` bytes have been staged
    fn on_progress(&mut self, _progress: u32, _total: u32) {}
    /// The session failed with `error` and is about to be torn down
    fn on_error(&mut self, _error: &Error) {}
    /// The session was torn down
    fn on_end(&mut self) {}
}

