//! Logging macros.
//!
//! `error!`/`warn!`/`info!`/`debug!`/`trace!` forward to the `log` crate when the `log` feature is
//! enabled, to `defmt` when the `defmt` feature is enabled instead, and become no-op
//! `format_args!`-checked expressions when neither is active, so call sites keep getting argument
//! type-checking even in builds that strip logging entirely. `log` takes priority if both features
//! are enabled at once.

#[cfg(feature = "log")]
macro_rules! error {
    ($($t:tt)*) => {{ log::error!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! warn {
    ($($t:tt)*) => {{ log::warn!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! info {
    ($($t:tt)*) => {{ log::info!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! debug {
    ($($t:tt)*) => {{ log::debug!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! trace {
    ($($t:tt)*) => {{ log::trace!($($t)*); }};
}

#[cfg(all(not(feature = "log"), feature = "defmt"))]
macro_rules! error {
    ($($t:tt)*) => {{ defmt::error!($($t)*); }};
}

#[cfg(all(not(feature = "log"), feature = "defmt"))]
macro_rules! warn {
    ($($t:tt)*) => {{ defmt::warn!($($t)*); }};
}

#[cfg(all(not(feature = "log"), feature = "defmt"))]
macro_rules! info {
    ($($t:tt)*) => {{ defmt::info!($($t)*); }};
}

#[cfg(all(not(feature = "log"), feature = "defmt"))]
macro_rules! debug {
    ($($t:tt)*) => {{ defmt::debug!($($t)*); }};
}

#[cfg(all(not(feature = "log"), feature = "defmt"))]
macro_rules! trace {
    ($($t:tt)*) => {{ defmt::trace!($($t)*); }};
}

#[cfg(not(any(feature = "log", feature = "defmt")))]
macro_rules! error {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(any(feature = "log", feature = "defmt")))]
macro_rules! warn {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(any(feature = "log", feature = "defmt")))]
macro_rules! info {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(any(feature = "log", feature = "defmt")))]
macro_rules! debug {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(any(feature = "log", feature = "defmt")))]
macro_rules! trace {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}
