//! Data structures used throughout the controller.
//!
//! These types carry container metadata from the inventory query through
//! grouping and into template rendering.  Everything is rebuilt from
//! scratch on every poll cycle; no value here has cross-cycle identity.
//! The rendered side derives [`serde::Serialize`] so the template engine
//! can walk it directly.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

/// One container as reported by the inventory query.
///
/// This is the only shape the controller depends on; the Docker client
/// maps its own summary type into it.  `addresses` maps network name to
/// the container's IP on that network.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub addresses: BTreeMap<String, String>,
}

/// One reachable network target for one container on one attached network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// A single externally exposed listening socket and its TLS posture.
///
/// Structural equality makes this the grouping key for endpoints.  An
/// empty `ssl_cert` means plain traffic; an empty `bind_address` means
/// "any address".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PublishKey {
    pub port: u16,
    pub bind_address: String,
    pub ssl_cert: String,
}

/// One frontend+backend pair: a publish key and the endpoints behind it.
///
/// `backends` is sorted by endpoint name and non-empty by construction;
/// both guarantees come from the grouping engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfiguration {
    pub publish: PublishKey,
    pub backends: Vec<Endpoint>,
}

/// Everything the renderer needs for one configuration generation.
///
/// `services` is sorted by `(bind_address, port)`.  Together with the
/// backend ordering this is what makes fingerprinting meaningful: two
/// polls observing the same topology must render byte-identical text no
/// matter how the runtime enumerated the containers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WholeConfiguration {
    pub services: Vec<ServiceConfiguration>,
    /// Statistics listener port; zero or negative disables the block.
    pub stats_port: i32,
}

/// Rendered configuration text plus its content fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    /// Lowercase hex SHA-256 of `text`; the unit of change detection.
    pub fingerprint: String,
}
