// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plugin registry: discovers the workflow descriptors published by
//! processing plugins and serves lookups for the HTTP layer and the job
//! runner.
//!
//! Plugins are discovered by scanning a directory for `*.workflow.yaml`
//! manifests — the Rust-native stand-in for the original system's
//! `pkg_resources` entry-point discovery. Each manifest describes one
//! [`tf_core::WorkflowDescriptor`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use tf_core::WorkflowDescriptor;
use tf_error::{ErrorCode, TfError};
use tracing::warn;

/// A loaded set of workflow descriptors, keyed by `WorkflowId`.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    workflows: BTreeMap<String, WorkflowDescriptor>,
}

impl Registry {
    /// Build a registry directly from an in-memory list, deduplicating by
    /// id and keeping the first occurrence (matching plugin-load order).
    ///
    /// A duplicate id is never a hard error: the original system logs a
    /// warning and keeps whichever descriptor loaded first, so that one
    /// malformed or colliding plugin doesn't take the whole registry down.
    pub fn from_descriptors(descriptors: Vec<WorkflowDescriptor>) -> Self {
        let mut workflows = BTreeMap::new();
        for descriptor in descriptors {
            if workflows.contains_key(&descriptor.id) {
                warn!(workflow_id = %descriptor.id, "duplicate workflow id, keeping first loaded");
                continue;
            }
            workflows.insert(descriptor.id.clone(), descriptor);
        }
        Self { workflows }
    }

    /// Discover workflow manifests under `dir` (recursively) and load them
    /// into a registry.
    pub fn discover(dir: &Path) -> Result<Self, TfError> {
        let mut descriptors = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with(".workflow.yaml")
            })
        {
            let content = std::fs::read_to_string(entry.path()).map_err(|e| {
                TfError::new(
                    ErrorCode::ConfigParseFailed,
                    format!("failed to read {}: {e}", entry.path().display()),
                )
            })?;

            match serde_yaml::from_str::<WorkflowDescriptor>(&content) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "skipping malformed workflow manifest"
                    );
                }
            }
        }

        Ok(Self::from_descriptors(descriptors))
    }

    /// All registered workflow descriptors.
    pub fn all(&self) -> Vec<&WorkflowDescriptor> {
        self.workflows.values().collect()
    }

    /// Look up a workflow by id.
    pub fn by_id(&self, id: &str) -> Option<&WorkflowDescriptor> {
        self.workflows.get(id)
    }

    /// Look up a workflow by id, as a [`TfError`]-bearing `Result` for
    /// request-handling call sites.
    pub fn require(&self, id: &str) -> Result<&WorkflowDescriptor, TfError> {
        self.by_id(id).ok_or_else(|| {
            TfError::new(ErrorCode::WorkflowNotFound, format!("unknown workflow id '{id}'"))
                .with_context("workflow_id", id.to_string())
        })
    }

    /// Workflows that accept the given input product type.
    pub fn filter_by_product_type<'a>(&'a self, input_product_type: &str) -> Vec<&'a WorkflowDescriptor> {
        self.workflows
            .values()
            .filter(|w| w.input_product_type == input_product_type)
            .collect()
    }

    /// Number of registered workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// `true` if no workflows are registered.
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tf_core::{OptionType, WorkflowOptionSpec};

    fn descriptor(id: &str, input_type: &str) -> WorkflowDescriptor {
        WorkflowDescriptor {
            id: id.into(),
            description: "test".into(),
            input_product_type: input_type.into(),
            output_product_type: "OUT".into(),
            workflow_version: "1.0".into(),
            options: vec![WorkflowOptionSpec {
                name: "opt".into(),
                description: String::new(),
                option_type: OptionType::Boolean,
                default: None,
                values: vec![],
            }],
            supports_traceability: true,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let registry = Registry::from_descriptors(vec![
            descriptor("wf", "IN1"),
            descriptor("wf", "IN2"),
        ]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_id("wf").unwrap().input_product_type, "IN1");
    }

    #[test]
    fn by_id_and_require() {
        let registry = Registry::from_descriptors(vec![descriptor("a", "IN")]);
        assert!(registry.by_id("a").is_some());
        assert!(registry.by_id("missing").is_none());
        assert!(registry.require("missing").is_err());
    }

    #[test]
    fn filter_by_product_type() {
        let registry = Registry::from_descriptors(vec![
            descriptor("a", "IN1"),
            descriptor("b", "IN2"),
            descriptor("c", "IN1"),
        ]);
        let matches = registry.filter_by_product_type("IN1");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn discover_reads_workflow_manifests_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sen2cor.workflow.yaml"),
            r#"
id: sen2cor_l1c_l2a
description: Sen2Cor
input_product_type: S2MSI1C
output_product_type: S2MSI2A
workflow_version: "2.11"
options: []
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("not-a-manifest.txt"), "ignored").unwrap();

        let registry = Registry::discover(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.by_id("sen2cor_l1c_l2a").is_some());
    }

    #[test]
    fn discover_skips_malformed_manifests_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.workflow.yaml"), "not: [valid").unwrap();
        let registry = Registry::discover(dir.path()).unwrap();
        assert!(registry.is_empty());
    }
}
