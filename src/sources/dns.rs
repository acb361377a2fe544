//! Implementation of [Source] for DNS SRV records

use crate::endpoint::Endpoint;
use crate::poll::{self, Lookup};
use crate::source::{Error, Source, Updates};
use crate::target::{SrvTarget, Target};

use async_trait::async_trait;
use hickory_resolver::config::NameServerConfig;
use hickory_resolver::config::Protocol;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration options to tweak DNS resolution.
#[derive(Clone, Debug)]
pub struct DnsSourceConfig {
    /// Which DNS servers should be queried?
    ///
    /// If empty, the system configuration is used.
    ///
    /// Default: Empty
    pub name_servers: Vec<SocketAddr>,

    /// How long should we wait between lookups of a target?
    ///
    /// Cached answers are also never kept longer than this, so each lookup
    /// reflects DNS as of at most one period ago.
    ///
    /// Default: 1 second
    pub poll_period: Duration,

    /// After starting a lookup, how long until we timeout?
    ///
    /// Default: 10 seconds
    pub query_timeout: Duration,
}

impl Default for DnsSourceConfig {
    fn default() -> Self {
        Self {
            name_servers: vec![],
            poll_period: DEFAULT_POLL_PERIOD,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Finds the endpoints of a target by polling its DNS SRV records.
///
/// One resolver is shared by every target opened through this source.
pub struct DnsSource {
    resolver: TokioAsyncResolver,
    config: DnsSourceConfig,
}

impl DnsSource {
    pub fn new(config: DnsSourceConfig) -> Result<Self, Error> {
        let resolver = if config.name_servers.is_empty() {
            let (rc, mut opts) = hickory_resolver::system_conf::read_system_conf()?;
            Self::tune(&config, &mut opts);
            TokioAsyncResolver::tokio(rc, opts)
        } else {
            let mut rc = ResolverConfig::new();
            for address in &config.name_servers {
                rc.add_name_server(NameServerConfig {
                    socket_addr: *address,
                    protocol: Protocol::Udp,
                    tls_dns_name: None,
                    trust_negative_responses: false,
                    bind_addr: None,
                });
            }
            let mut opts = ResolverOpts::default();
            opts.use_hosts_file = false;
            Self::tune(&config, &mut opts);
            TokioAsyncResolver::tokio(rc, opts)
        };
        Ok(Self { resolver, config })
    }

    fn tune(config: &DnsSourceConfig, opts: &mut ResolverOpts) {
        opts.timeout = config.query_timeout;
        opts.positive_max_ttl = Some(config.poll_period);
        opts.negative_max_ttl = Some(config.poll_period);
        opts.edns0 = true;
    }
}

#[async_trait]
impl Source for DnsSource {
    #[instrument(skip(self, shutdown), name = "DnsSource::open")]
    async fn open(&self, target: &Target, shutdown: CancellationToken) -> Result<Updates, Error> {
        let lookup = match target {
            Target::Srv(srv) => SrvLookup::new(self.resolver.clone(), srv, self.config.query_timeout),
        };
        poll::start(lookup, self.config.poll_period, shutdown).await
    }
}

/// Resolves one SRV name.
struct SrvLookup {
    resolver: TokioAsyncResolver,
    name: String,
    query_timeout: Duration,
}

impl SrvLookup {
    fn new(resolver: TokioAsyncResolver, target: &SrvTarget, query_timeout: Duration) -> Self {
        Self {
            resolver,
            name: target.qualified_name(),
            query_timeout,
        }
    }
}

#[async_trait]
impl Lookup for SrvLookup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self) -> Result<Vec<Endpoint>, Error> {
        let srv = timeout(self.query_timeout, self.resolver.srv_lookup(self.name.as_str()))
            .await
            .map_err(|_| Error::Timeout(self.query_timeout))??;
        event!(Level::TRACE, ?srv, "Successfully looked up SRV record");

        // Priority is not reported to subscribers.
        Ok(srv
            .iter()
            .map(|record| Endpoint::new(record.target().to_utf8(), record.port(), record.weight()))
            .collect())
    }
}
