// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel logging macros.
//!
//! `klog!` is for conditions an operator should see (exhaustion, refused
//! operations, unhandled interrupts); `ktrace!` is for chatty lifecycle
//! lines and is off by default. Hosted builds route both to stderr; a
//! hardware port replaces the sink by building without `klog-stderr` and
//! providing its own.

#[cfg(feature = "klog-stderr")]
macro_rules! klog {
    ($s:expr) => { std::eprintln!(concat!("kernel: ", $s)) };
    ($s:expr, $($tt:tt)*) => {
        std::eprintln!(concat!("kernel: ", $s), $($tt)*)
    };
}

#[cfg(not(feature = "klog-stderr"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(all(feature = "klog-stderr", feature = "klog-trace"))]
macro_rules! ktrace {
    ($s:expr) => { std::eprintln!(concat!("kernel: ", $s)) };
    ($s:expr, $($tt:tt)*) => {
        std::eprintln!(concat!("kernel: ", $s), $($tt)*)
    };
}

#[cfg(not(all(feature = "klog-stderr", feature = "klog-trace")))]
macro_rules! ktrace {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}
