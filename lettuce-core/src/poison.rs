//! RAII guard that marks a connection unusable when a write is cut short.
//!
//! A multipart write that is dropped half way (its send timeout elapsed, or
//! the loop is shutting down) leaves a partial frame on the stream. Nothing
//! sent after that can be parsed by the remote side, so the connection must
//! be discarded.
//!
//! ```rust
//! use lettuce_core::poison::PoisonGuard;
//!
//! let mut poisoned = false;
//! {
//!     let _guard = PoisonGuard::new(&mut poisoned);
//!     // write cancelled here: guard dropped without disarm
//! }
//! assert!(poisoned);
//!
//! let mut poisoned = false;
//! let guard = PoisonGuard::new(&mut poisoned);
//! guard.disarm();
//! assert!(!poisoned);
//! ```

/// Sets the flag on creation; only `disarm()` clears it again.
pub struct PoisonGuard<'a> {
    flag: &'a mut bool,
}

impl<'a> PoisonGuard<'a> {
    #[inline]
    pub fn new(flag: &'a mut bool) -> Self {
        *flag = true;
        Self { flag }
    }

    /// Call only after the whole write completed.
    #[inline]
    pub fn disarm(self) {
        *self.flag = false;
    }
}
