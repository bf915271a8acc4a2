// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The bundled YAML front-end. The core consumes [`Model`] only; an HCL-like
//! front-end living outside this repo produces the same structure.

use crate::model::Model;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
}

/// # Errors
///
/// Fails on unreadable files or documents that do not deserialize into the
/// model; field-level semantics are the validator's job, not the parser's.
pub fn from_yaml_str(text: &str) -> Result<Model, FrontendError> {
    Ok(serde_yaml_ng::from_str(text)?)
}

/// # Errors
///
/// See [`from_yaml_str`].
pub fn from_yaml_file(path: &Path) -> Result<Model, FrontendError> {
    let text = std::fs::read_to_string(path).map_err(|source| FrontendError::Read {
        path: path.display().to_string(),
        source,
    })?;
    from_yaml_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_parses() {
        let model = from_yaml_str(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
    addresses: [192.168.1.1/24]
",
        )
        .unwrap();
        assert_eq!(model.interfaces.len(), 1);
        assert_eq!(model.interfaces[0].effective_zone(), "lan");
    }

    #[test]
    fn empty_document_is_the_default_model() {
        let model = from_yaml_str("{}").unwrap();
        assert_eq!(model, Model::default());
    }

    #[test]
    fn unknown_protocol_is_a_parse_error() {
        let result = from_yaml_str(
            r"
policy:
  - from: lan
    to: wan
    rules:
      - name: weird
        action: accept
        proto: quic
",
        );
        assert!(result.is_err());
    }
}
