// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One rejected field, with enough path context to point an operator at the
/// offending block, e.g. `policy[lan->wan].rule[allow-web].dest_port`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{path}: {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// The full set of problems found in one validation pass. The validator
/// never stops at the first error; operators fix a config in one round trip.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.0.push(ValidationError::new(path, reason));
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "config validation failed ({} errors)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}
