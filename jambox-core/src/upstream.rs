//! Upstream client shared by the proxy and by forwarded requests.
//!
//! Certificates are verified against the webpki roots, except for trusted
//! hosts (the `trust` list and every forward target), whose certificates are
//! accepted as presented so local self-signed servers can be reached.

use hudsucker::hyper::{client::HttpConnector, Client};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;
use url::Url;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>>;

pub struct TrustedHostsVerifier {
    trusted: HashSet<String>,
    webpki: WebPkiVerifier,
}

impl TrustedHostsVerifier {
    /// `trusted` entries are `host[:port]`; certificates are matched by host.
    pub fn new(trusted: &[String], roots: RootCertStore) -> Self {
        Self {
            trusted: trusted.iter().map(|entry| hostname_of(entry)).collect(),
            webpki: WebPkiVerifier::new(roots, None),
        }
    }

    fn is_trusted(&self, server_name: &ServerName) -> bool {
        let host = match server_name {
            ServerName::DnsName(name) => name.as_ref().to_ascii_lowercase(),
            ServerName::IpAddress(ip) => ip.to_string(),
            _ => return false,
        };
        self.trusted.contains(&host)
    }
}

impl ServerCertVerifier for TrustedHostsVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.is_trusted(server_name) {
            debug!("Accepting certificate of trusted host {:?}", server_name);
            return Ok(ServerCertVerified::assertion());
        }
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, scts, ocsp_response, now)
    }
}

/// Lowercased host of a `host[:port]` entry, IPv6 brackets removed.
fn hostname_of(entry: &str) -> String {
    Url::parse(&format!("http://{}", entry))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| entry.to_string())
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    roots
}

pub fn client_config(trusted: &[String]) -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(TrustedHostsVerifier::new(trusted, default_roots())))
        .with_no_client_auth()
}

/// HTTP/1 client over rustls, keeping header case like hudsucker's own client.
pub fn build_client(trusted: &[String]) -> UpstreamClient {
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(client_config(trusted))
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder()
        .http1_title_case_headers(true)
        .http1_preserve_header_case(true)
        .build(https)
}
