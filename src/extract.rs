//! Turns one container's labels and network addresses into endpoints.
//!
//! Extraction is the per-container failure boundary: a bad label or a
//! missing certificate skips that container only, and the batch driver
//! hands the reconciler a side list of skips to log.

use std::collections::HashMap;
use std::path::Path;

use crate::types::{Endpoint, PublishKey, Workload};

pub const LABEL_PUBLISH: &str = "lb.publish";
pub const LABEL_TARGET: &str = "lb.target";
pub const LABEL_BIND_ADDR: &str = "lb.dst_addr";
pub const LABEL_SSL: &str = "lb.ssl";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("label {label} not found")]
    MissingLabel { label: &'static str },

    #[error("label {label} not convertible to integer: {value}")]
    InvalidPort { label: &'static str, value: String },

    #[error("label lb.ssl pem file does not exist: {path}")]
    CertNotFound { path: String },
}

fn port_label(labels: &HashMap<String, String>, label: &'static str) -> Result<u16, ExtractError> {
    let value = labels
        .get(label)
        .ok_or(ExtractError::MissingLabel { label })?;
    value.parse().map_err(|_| ExtractError::InvalidPort {
        label,
        value: value.clone(),
    })
}

/// Parses one workload into its publish key and one endpoint per attached
/// network.  A workload with no attached networks yields an empty endpoint
/// list; the grouping stage then never materializes the key.
pub fn extract(workload: &Workload) -> Result<(PublishKey, Vec<Endpoint>), ExtractError> {
    let publish = port_label(&workload.labels, LABEL_PUBLISH)?;
    let target = port_label(&workload.labels, LABEL_TARGET)?;

    let bind_address = workload
        .labels
        .get(LABEL_BIND_ADDR)
        .cloned()
        .unwrap_or_default();

    let mut ssl_cert = String::new();
    if let Some(path) = workload.labels.get(LABEL_SSL) {
        if !path.is_empty() {
            if !Path::new(path).exists() {
                return Err(ExtractError::CertNotFound { path: path.clone() });
            }
            ssl_cert = path.clone();
        }
    }

    let key = PublishKey {
        port: publish,
        bind_address,
        ssl_cert,
    };

    let endpoints = workload
        .addresses
        .values()
        .map(|address| Endpoint {
            name: workload.name.clone(),
            address: address.clone(),
            port: target,
        })
        .collect();

    Ok((key, endpoints))
}

/// Extracts a whole batch, isolating failures per container.
///
/// Returns the successful extractions plus `(container name, error)` pairs
/// for every skipped container.
pub fn extract_all(
    workloads: &[Workload],
) -> (Vec<(PublishKey, Vec<Endpoint>)>, Vec<(String, ExtractError)>) {
    let mut extracted = Vec::new();
    let mut skipped = Vec::new();

    for workload in workloads {
        match extract(workload) {
            Ok(item) => extracted.push(item),
            Err(err) => skipped.push((workload.name.clone(), err)),
        }
    }

    (extracted, skipped)
}
