//! Internal helper macros.

/// Early-returns with an error when a condition is not met; like
/// `assert!` but producing `Err` instead of panicking.
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
