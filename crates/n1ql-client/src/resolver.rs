//! Endpoint discovery
//!
//! A data source is either a cluster node (the management port, usually
//! 8091) or a query node. For a cluster the node/service map is fetched and
//! every node running the query service contributes an endpoint. If the seed
//! does not answer as a cluster it is used directly as the one query endpoint.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ConnectionConfig, Credentials, ServiceKind, Topology};
use crate::error::{Error, Result};
use crate::executor::get_json;

const NODE_SERVICES_PATH: &str = "/pools/default/nodeServices";
const QUERY_NODES_PATH: &str = "/admin/clusters/default/nodes";
const EXTERNAL_NETWORK: &str = "external";

/// A parsed data-source string
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DataSource {
    /// Seed URL with user-info removed and no trailing slash
    pub base: String,
    pub host: String,
    pub secure: bool,
    /// Credentials found in the URL user-info
    pub credentials: Option<Credentials>,
}

impl DataSource {
    pub fn parse(data_source: &str) -> Result<Self> {
        let trimmed = data_source.trim();
        if trimmed.is_empty() {
            return Err(Error::config("empty data source"));
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        let mut url = Url::parse(&with_scheme)
            .map_err(|e| Error::config(format!("invalid data source {}: {}", with_scheme, e)))?;
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::config(format!("unsupported scheme '{}'", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("data source {} has no host", with_scheme)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let username = decode(url.username());
        let password = url.password().map(decode).unwrap_or_default();
        let credentials = if username.is_empty() && password.is_empty() {
            None
        } else {
            Some(Credentials::new(username, password))
        };
        // Infallible for http(s) URLs with a host
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            base: url.as_str().trim_end_matches('/').to_string(),
            host,
            secure,
            credentials,
        })
    }

    fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// The seed used directly as a query endpoint
    pub fn direct_endpoint(&self, service: ServiceKind) -> String {
        format!("{}{}", self.base, service.path())
    }
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// `host:port`, bracketing IPv6 literals
fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[derive(Debug, Deserialize)]
struct NodeServices {
    #[serde(rename = "nodesExt", default)]
    nodes: Vec<NodeExt>,
}

#[derive(Debug, Deserialize)]
struct NodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
    #[serde(rename = "alternateAddresses", default)]
    alternate_addresses: HashMap<String, AlternateAddress>,
}

#[derive(Debug, Deserialize)]
struct AlternateAddress {
    hostname: String,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct QueryNode {
    #[serde(rename = "queryEndpoint", default)]
    query_endpoint: Option<String>,
}

/// Result of endpoint discovery
#[derive(Debug)]
pub(crate) struct Resolution {
    pub endpoints: Vec<String>,
    /// Why the seed was not treated as a cluster, if it was not
    pub discovery_error: Option<String>,
}

/// Whether to use external alternate addresses for this cluster
fn use_external(topology: Topology, seed_host: &str, nodes: &[NodeExt]) -> bool {
    match topology {
        Topology::Default => false,
        Topology::External => true,
        Topology::Auto => nodes.iter().any(|node| {
            node.alternate_addresses
                .get(EXTERNAL_NETWORK)
                .is_some_and(|alt| alt.hostname.eq_ignore_ascii_case(seed_host))
        }),
    }
}

/// `(host, port)` of every node running the service
fn service_addresses(
    ds: &DataSource,
    service: ServiceKind,
    external: bool,
    nodes: &[NodeExt],
) -> Vec<(String, u16)> {
    let key = service.port_key(ds.secure);
    nodes
        .iter()
        .filter_map(|node| {
            let port = *node.services.get(key)?;
            if external {
                if let Some(alt) = node.alternate_addresses.get(EXTERNAL_NETWORK) {
                    let alt_port = alt.ports.get(key).copied().unwrap_or(port);
                    return Some((alt.hostname.clone(), alt_port));
                }
            }
            // An empty hostname is the node that answered the request
            let host = node
                .hostname
                .clone()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| ds.host.clone());
            Some((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
        })
        .collect()
}

/// Point loopback addresses reported by a query node at its real host
fn replace_loopback(endpoint: &str, host: &str) -> String {
    if host.contains(':') {
        endpoint.replace("[::1]", &format!("[{}]", host))
    } else {
        endpoint.replace("127.0.0.1", host)
    }
}

/// Turn a data source into the endpoint set of a connection
pub(crate) async fn resolve(
    http: &reqwest::Client,
    config: &ConnectionConfig,
    credentials: Option<&Credentials>,
    ds: &DataSource,
) -> Result<Resolution> {
    let url = format!("{}{}", ds.base, NODE_SERVICES_PATH);
    let services: NodeServices = match get_json(http, credentials, &url).await {
        Ok(services) => services,
        Err(e) => {
            debug!("{} is not a cluster endpoint: {}", ds.base, e);
            return Ok(Resolution {
                endpoints: vec![ds.direct_endpoint(config.service)],
                discovery_error: Some(format!(
                    "Unable to connect to cluster endpoint {}. Error {}",
                    ds.base, e
                )),
            });
        }
    };

    let external = use_external(config.topology, &ds.host, &services.nodes);
    let addresses = service_addresses(ds, config.service, external, &services.nodes);
    if addresses.is_empty() {
        return Err(Error::connection("No query service found on this cluster"));
    }
    info!(
        "Discovered {} {:?} node(s) ({} addressing)",
        addresses.len(),
        config.service,
        if external { "external" } else { "internal" }
    );

    let constructed: Vec<String> = addresses
        .iter()
        .map(|(host, port)| {
            format!("{}://{}{}", ds.scheme(), host_port(host, *port), config.service.path())
        })
        .collect();

    if external || ds.secure || config.service != ServiceKind::Query {
        return Ok(Resolution {
            endpoints: constructed,
            discovery_error: None,
        });
    }

    // The query service knows its peers; prefer its view of the cluster
    let (host, port) = &addresses[0];
    let admin = format!("http://{}{}", host_port(host, *port), QUERY_NODES_PATH);
    let endpoints = match get_json::<Vec<QueryNode>>(http, credentials, &admin).await {
        Ok(nodes) => nodes
            .into_iter()
            .filter_map(|n| n.query_endpoint)
            .filter(|e| !e.is_empty())
            .map(|e| replace_loopback(&e, host))
            .collect::<Vec<_>>(),
        Err(e) => {
            warn!("Query node list unavailable from {}: {}", admin, e);
            Vec::new()
        }
    };

    Ok(Resolution {
        endpoints: if endpoints.is_empty() { constructed } else { endpoints },
        discovery_error: None,
    })
}
