// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each port must define the same set of names: the
//! `Machine` and `AddrSpace` handles, the `SavedState` register record, the
//! user-copy and direct-map accessors, and the interrupt/console/RTC/power
//! hooks. The hosted simulator port below is the one wired up in this
//! tree; a bare-metal port slots in beside it.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        compile_error!("no bare-metal port is wired up in this tree");
    } else {
        pub mod sim;
        pub use sim::*;
    }
}
