//! Error primitives shared by every Ignition crate.
//!
//! Library crates define their own typed errors (via `snafu`) for the failures callers are expected to match on, and
//! convert them into [`GenericError`] at the points where errors from unrelated sources need to flow through a single
//! signature, such as the `start` and `stop` operations of a runner.
#![deny(warnings)]
#![deny(missing_docs)]

use std::fmt::Display;

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (same rules as `std::format!`), or a single value that
/// implements both `Debug` and `Display`. When that value is itself an error, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension methods for attaching context to fallible results.
///
/// This mirrors `anyhow::Context`, but under names that do not collide with `snafu::ResultExt::context`, so both can
/// be imported in the same module.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with context that is only built if an error actually occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}
