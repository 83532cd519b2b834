//! Namespace wire types for the coordinator admin API.
//!
//! Namespaces are created from the CRD's `NamespaceSpec`, either through a
//! retention preset or explicit options. Once created they are never
//! mutated; a changed spec surfaces as a `NamespaceImmutable` condition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::NamespaceSpec;

/// Retention preset covering short-lived, high-resolution metrics
pub const PRESET_TEN_SECONDS_TWO_DAYS: &str = "10s:2d";

/// Retention preset covering long-lived, minutely metrics
pub const PRESET_ONE_MINUTE_FORTY_DAYS: &str = "1m:40d";

/// Retention configuration on the wire
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionOptions {
    /// How long written data is retained
    pub retention_period: String,

    /// Data block size
    pub block_size: String,

    /// How far in the past out-of-order writes are accepted
    pub buffer_past: String,

    /// How far in the future writes are accepted
    pub buffer_future: String,
}

/// Index configuration on the wire
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptions {
    /// Whether writes are indexed for query
    pub enabled: bool,

    /// Index block size
    pub block_size: String,
}

/// Full namespace options on the wire
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOptions {
    /// Whether the namespace participates in bootstrap
    pub bootstrap_enabled: bool,

    /// Whether in-memory blocks are flushed to disk
    pub flush_enabled: bool,

    /// Whether writes go through the commit log
    pub writes_to_commit_log: bool,

    /// Whether expired blocks are cleaned up
    pub cleanup_enabled: bool,

    /// Whether snapshot files are taken
    pub snapshot_enabled: bool,

    /// Whether the repair process runs for this namespace
    pub repair_enabled: bool,

    /// Retention configuration
    pub retention_options: RetentionOptions,

    /// Index configuration
    pub index_options: IndexOptions,
}

/// Request body for POST namespace
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRequest {
    /// Namespace name
    pub name: String,

    /// Namespace options
    pub options: NamespaceOptions,
}

/// Registry of namespaces as returned by GET namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRegistry {
    /// Namespaces keyed by name
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceOptions>,
}

/// Response envelope for GET namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceListResponse {
    /// The namespace registry
    #[serde(default)]
    pub registry: NamespaceRegistry,
}

fn options_with_retention(retention: RetentionOptions, index: IndexOptions) -> NamespaceOptions {
    NamespaceOptions {
        bootstrap_enabled: true,
        flush_enabled: true,
        writes_to_commit_log: true,
        cleanup_enabled: true,
        snapshot_enabled: true,
        repair_enabled: false,
        retention_options: retention,
        index_options: index,
    }
}

/// Build the wire request for a desired namespace.
///
/// Presets map to canned retention options; explicit options are passed
/// through. An unknown preset is a validation error.
pub fn namespace_request(spec: &NamespaceSpec) -> Result<NamespaceRequest, crate::Error> {
    let options = match (&spec.preset, &spec.options) {
        (Some(preset), None) => match preset.as_str() {
            PRESET_TEN_SECONDS_TWO_DAYS => options_with_retention(
                RetentionOptions {
                    retention_period: "48h".to_string(),
                    block_size: "2h".to_string(),
                    buffer_past: "10m".to_string(),
                    buffer_future: "10m".to_string(),
                },
                IndexOptions {
                    enabled: true,
                    block_size: "2h".to_string(),
                },
            ),
            PRESET_ONE_MINUTE_FORTY_DAYS => options_with_retention(
                RetentionOptions {
                    retention_period: "960h".to_string(),
                    block_size: "24h".to_string(),
                    buffer_past: "20m".to_string(),
                    buffer_future: "20m".to_string(),
                },
                IndexOptions {
                    enabled: true,
                    block_size: "24h".to_string(),
                },
            ),
            other => {
                return Err(crate::Error::validation(format!(
                    "unknown namespace preset '{}' for namespace '{}'",
                    other, spec.name
                )))
            }
        },
        (None, Some(explicit)) => options_with_retention(
            RetentionOptions {
                retention_period: explicit.retention_period.clone(),
                block_size: explicit.block_size.clone(),
                buffer_past: explicit
                    .buffer_past
                    .clone()
                    .unwrap_or_else(|| "10m".to_string()),
                buffer_future: explicit
                    .buffer_future
                    .clone()
                    .unwrap_or_else(|| "10m".to_string()),
            },
            IndexOptions {
                enabled: explicit.index_enabled,
                block_size: explicit
                    .index_block_size
                    .clone()
                    .unwrap_or_else(|| explicit.block_size.clone()),
            },
        ),
        // validate() rejects these before a request is ever built
        _ => {
            return Err(crate::Error::validation(format!(
                "namespace '{}' must set exactly one of preset and options",
                spec.name
            )))
        }
    };

    Ok(NamespaceRequest {
        name: spec.name.clone(),
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NamespaceOptions as CrdOptions;

    #[test]
    fn preset_maps_to_canned_retention() {
        let req = namespace_request(&NamespaceSpec {
            name: "metrics-10s".to_string(),
            preset: Some(PRESET_TEN_SECONDS_TWO_DAYS.to_string()),
            options: None,
        })
        .unwrap();

        assert_eq!(req.name, "metrics-10s");
        assert_eq!(req.options.retention_options.retention_period, "48h");
        assert_eq!(req.options.retention_options.block_size, "2h");
        assert!(req.options.index_options.enabled);
    }

    #[test]
    fn unknown_preset_is_a_validation_error() {
        let err = namespace_request(&NamespaceSpec {
            name: "bad".to_string(),
            preset: Some("5s:1d".to_string()),
            options: None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("unknown namespace preset"));
    }

    #[test]
    fn explicit_options_pass_through_with_defaults() {
        let req = namespace_request(&NamespaceSpec {
            name: "custom".to_string(),
            preset: None,
            options: Some(CrdOptions {
                retention_period: "720h".to_string(),
                block_size: "12h".to_string(),
                index_block_size: None,
                buffer_past: None,
                buffer_future: Some("15m".to_string()),
                index_enabled: false,
            }),
        })
        .unwrap();

        assert_eq!(req.options.retention_options.retention_period, "720h");
        // index block size falls back to data block size
        assert_eq!(req.options.index_options.block_size, "12h");
        assert_eq!(req.options.retention_options.buffer_past, "10m");
        assert_eq!(req.options.retention_options.buffer_future, "15m");
        assert!(!req.options.index_options.enabled);
    }

    #[test]
    fn registry_decodes_coordinator_shape() {
        let body = r#"{
            "registry": {
                "namespaces": {
                    "metrics": {
                        "bootstrapEnabled": true,
                        "flushEnabled": true,
                        "writesToCommitLog": true,
                        "cleanupEnabled": true,
                        "snapshotEnabled": true,
                        "repairEnabled": false,
                        "retentionOptions": {
                            "retentionPeriod": "48h",
                            "blockSize": "2h",
                            "bufferPast": "10m",
                            "bufferFuture": "10m"
                        },
                        "indexOptions": {"enabled": true, "blockSize": "2h"}
                    }
                }
            }
        }"#;
        let resp: NamespaceListResponse = serde_json::from_str(body).unwrap();
        assert!(resp.registry.namespaces.contains_key("metrics"));
    }
}
