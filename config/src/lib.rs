// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The intermediate model (IM) and its validator.
//!
//! The declarative file syntax is a pluggable front-end; this crate ships a
//! YAML reader but any front-end producing a [`Model`] is equivalent. The
//! supervisor owns validated models and shares them read-only with the
//! compilers. The validator never touches the store.

pub mod catalog;
pub mod frontend;
pub mod model;
pub mod validate;

pub use frontend::{from_yaml_file, from_yaml_str};
pub use model::*;
pub use validate::{ValidModel, ValidationError, ValidationErrors, validate};
