use crate::{
    admin::{start_admin_server, AdminState, Metrics},
    ca::CertificateAuthority,
    cache::Cache,
    config::{JamboxConfig, ProxyStartupConfig},
    engine::RuleEngine,
    error::JamboxError,
    events::Broadcaster,
    handlers::InterceptHandler,
    rules::compile,
    upstream::build_client,
    Result,
};
use hudsucker::{certificate_authority::RcgenAuthority, rustls, ProxyBuilder};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

pub struct ProxyServer {
    startup: ProxyStartupConfig,
    config: JamboxConfig,
    ca: CertificateAuthority,
    cache: Arc<Cache>,
    engine: Arc<RuleEngine>,
    broadcaster: Broadcaster,
    metrics: Arc<Metrics>,
}

impl ProxyServer {
    pub fn new(startup: ProxyStartupConfig, config: JamboxConfig, ca: CertificateAuthority) -> Self {
        let broadcaster = Broadcaster::new(startup.event_capacity);
        Self {
            startup,
            config,
            ca,
            cache: Arc::new(Cache::new()),
            engine: Arc::new(RuleEngine::new()),
            broadcaster,
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Start with the cache bypassed (nothing read or recorded).
    pub fn with_bypass(self, bypass: bool) -> Self {
        self.cache.set_bypass(bypass);
        self
    }

    pub fn cache(&self) -> Arc<Cache> {
        self.cache.clone()
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Compile the rules, then serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ip: IpAddr = self.startup.listen_address.parse().map_err(|e| {
            JamboxError::Configuration(format!(
                "Invalid listen address '{}': {}",
                self.startup.listen_address, e
            ))
        })?;
        let addr = SocketAddr::new(ip, self.startup.listen_port);

        compile(
            self.engine.as_ref(),
            self.cache.clone(),
            self.broadcaster.clone(),
            &self.config,
        )
        .await?;
        info!("Compiled {} rules", self.engine.rule_count().await);

        let trusted = self.engine.trusted_hosts().await;
        if !trusted.is_empty() {
            info!("Accepting any upstream certificate from: {}", trusted.join(", "));
        }
        let client = build_client(&trusted);

        let admin_port = self.startup.admin_port;
        let admin_state = AdminState {
            metrics: self.metrics.clone(),
            broadcaster: self.broadcaster.clone(),
            cache: self.cache.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(admin_port, admin_state).await {
                error!("Admin server failed: {}", e);
            }
        });

        // Hudsucker/Rustls expects DER, not PEM.
        let private_key = rustls::PrivateKey(self.ca.key_der());
        let ca_cert = rustls::Certificate(self.ca.cert_der()?);
        let authority = RcgenAuthority::new(private_key, ca_cert, 1000).map_err(|e| {
            JamboxError::Certificate(format!("Failed to create CA authority: {}", e))
        })?;

        let handler = InterceptHandler::new(
            self.engine.clone(),
            self.metrics.clone(),
            client.clone(),
            self.startup.body_timeout(),
        );

        info!("Starting proxy server on {}", addr);
        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_client(client)
            .with_ca(authority)
            .with_http_handler(handler)
            .build();

        proxy
            .start(shutdown)
            .await
            .map_err(|e| JamboxError::Network(format!("Proxy failed: {}", e)))?;

        info!("Proxy server stopped");
        Ok(())
    }
}
