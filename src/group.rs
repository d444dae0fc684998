//! Groups extracted endpoints into an ordered service list.
//!
//! The map only accumulates; the explicit sorts below are the actual
//! determinism guarantee.  Map iteration order never reaches the output.

use std::collections::HashMap;

use crate::types::{Endpoint, PublishKey, ServiceConfiguration};

/// Groups endpoints by publish key and orders everything deterministically:
/// backends by name ascending, services by `(bind_address, port)` ascending.
pub fn group_services(
    extracted: Vec<(PublishKey, Vec<Endpoint>)>,
) -> Vec<ServiceConfiguration> {
    let mut group: HashMap<PublishKey, Vec<Endpoint>> = HashMap::new();

    for (key, endpoints) in extracted {
        for endpoint in endpoints {
            group.entry(key.clone()).or_default().push(endpoint);
        }
    }

    let mut services: Vec<ServiceConfiguration> = group
        .into_iter()
        .map(|(publish, mut backends)| {
            backends.sort_by(|a, b| a.name.cmp(&b.name));
            ServiceConfiguration { publish, backends }
        })
        .collect();

    services.sort_by(|a, b| {
        (a.publish.bind_address.as_str(), a.publish.port)
            .cmp(&(b.publish.bind_address.as_str(), b.publish.port))
    });

    services
}
