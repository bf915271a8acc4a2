// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Checked network domain types shared by every flywall crate.

pub mod flowkey;
pub mod interface;
pub mod mac;
pub mod port;

pub use flowkey::*;
pub use interface::*;
pub use mac::*;
pub use port::*;
