//! Cause-chain inspection for `std::error::Error` values
//!
//! Failure classification throughout the retry engine works on the root
//! cause of an error rather than its outermost wrapper, so a transport
//! failure buried under two layers of domain errors still lands in the
//! transport failure class.

use std::error::Error;

/// The innermost error in `err`'s source chain (`err` itself if none).
pub fn root_cause<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current
}

/// The first error in the chain, outermost first, matching `predicate`.
pub fn first_cause<'a>(
    err: &'a (dyn Error + 'static),
    predicate: impl Fn(&(dyn Error + 'static)) -> bool,
) -> Option<&'a (dyn Error + 'static)> {
    let mut current = Some(err);
    while let Some(e) = current {
        if predicate(e) {
            return Some(e);
        }
        current = e.source();
    }
    None
}

/// Whether any error in the chain is a `T`.
pub fn has_cause<T: Error + 'static>(err: &(dyn Error + 'static)) -> bool {
    first_cause(err, |e| e.is::<T>()).is_some()
}

/// Whether the innermost error is a `T`.
pub fn is_root_cause<T: Error + 'static>(err: &(dyn Error + 'static)) -> bool {
    root_cause(err).is::<T>()
}
