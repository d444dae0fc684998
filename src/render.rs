//! Configuration synthesis.
//!
//! Renders a [`WholeConfiguration`] into HAProxy configuration text with
//! [tera](https://crates.io/crates/tera) and fingerprints the result.  The
//! renderer performs no sorting of its own; the grouping invariants are
//! what make the fingerprint meaningful.

use std::path::PathBuf;

use anyhow::Context as _;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tera::Tera;

use crate::config::Config;
use crate::types::{Rendered, ServiceConfiguration, WholeConfiguration};

const TEMPLATE_NAME: &str = "haproxy.cfg";

/// Built-in configuration shape.  An override file at `template_file`
/// replaces it verbatim, letting operators reshape the output without
/// recompiling.
const DEFAULT_TEMPLATE: &str = r#"global
    stats socket {{ sock_file }} mode 600 expose-fd listeners level user
    stats timeout 30s
    pidfile {{ pid_file }}
    log /dev/log local0 debug

defaults
    mode                    http
    log                     global
    option                  httplog
    option                  dontlognull
    option                  http-server-close
    option                  redispatch
    option                  forwardfor
    option                  originalto
    compression algo        gzip
    compression type        text/css text/html text/javascript application/javascript text/plain text/xml application/json
    retries                 3
    timeout http-request    10s
    timeout queue           1m
    timeout connect         10s
    timeout client          1m
    timeout server          1m
    timeout http-keep-alive 10s
    timeout check           10s
    maxconn                 3000
{% if stats_port > 0 %}
listen stats
    bind *:{{ stats_port }}
    stats enable
    stats hide-version
    stats refresh 5s
    stats show-node
    stats uri /
{% endif %}
{% for service in services %}
frontend port_{{ service.publish.bind_address }}_{{ service.publish.port }}
    bind {% if service.publish.bind_address %}{{ service.publish.bind_address }}{% else %}*{% endif %}:{{ service.publish.port }}{% if service.publish.ssl_cert %} ssl crt {{ service.publish.ssl_cert }}{% endif %}
    default_backend port_{{ service.publish.bind_address }}_{{ service.publish.port }}_backends
    http-response del-header ETag

backend port_{{ service.publish.bind_address }}_{{ service.publish.port }}_backends
    balance leastconn
    stick-table type ip size 200k expire 520m
    stick on src
{% for backend in service.backends %}    server {{ backend.name }} {{ backend.address }}:{{ backend.port }}
{% endfor %}{% endfor %}"#;

/// The value set handed to the template.
#[derive(Serialize)]
struct TemplateModel<'a> {
    services: &'a [ServiceConfiguration],
    stats_port: i32,
    pid_file: &'a PathBuf,
    sock_file: &'a PathBuf,
}

pub struct Renderer {
    tera: Tera,
    pid_file: PathBuf,
    sock_file: PathBuf,
}

impl Renderer {
    /// Loads the override template if one exists, otherwise the built-in
    /// one.  A template that fails to parse is a configuration error the
    /// controller must not run with.
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let content = if cfg.template_file.exists() {
            std::fs::read_to_string(&cfg.template_file).with_context(|| {
                format!("Failed to read template {}", cfg.template_file.display())
            })?
        } else {
            DEFAULT_TEMPLATE.to_string()
        };

        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, &content)
            .context("Failed to parse configuration template")?;

        Ok(Self {
            tera,
            pid_file: cfg.pid_file.clone(),
            sock_file: cfg.sock_file.clone(),
        })
    }

    pub fn render(&self, whole: &WholeConfiguration) -> anyhow::Result<Rendered> {
        let model = TemplateModel {
            services: &whole.services,
            stats_port: whole.stats_port,
            pid_file: &self.pid_file,
            sock_file: &self.sock_file,
        };

        let ctx = tera::Context::from_serialize(&model)
            .context("Failed to build template context")?;
        let text = self
            .tera
            .render(TEMPLATE_NAME, &ctx)
            .context("Failed to render configuration template")?;

        let fingerprint = hex::encode(Sha256::digest(text.as_bytes()));

        Ok(Rendered { text, fingerprint })
    }
}
