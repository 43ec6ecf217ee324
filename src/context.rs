//! Process-wide service context: service threads, virtual hosts, role registry and
//! the counters every connection reports to.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};

use crate::config::ServiceConfig;
use crate::connection::{Connection, Counters};
use crate::constants::DEFAULT_PROTOCOL;
use crate::error::{AdmissionError, BuildError, ConfigError};
use crate::metrics;
use crate::protocol::Reason;
use crate::role::{Role, RoleRegistry};
use crate::thread::{ServiceThread, pick_idlest};
use crate::vhost::VirtualHost;
use crate::worker::ServiceWorker;

pub struct Context {
    config: ServiceConfig,
    threads: Vec<Arc<ServiceThread>>,
    vhosts: Vec<Arc<VirtualHost>>,
    pub(crate) roles: RoleRegistry,
    pub(crate) counters: Arc<Counters>,
}

impl Context {
    pub fn builder(config: ServiceConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            vhosts: Vec::new(),
            roles: RoleRegistry::default(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn threads(&self) -> &[Arc<ServiceThread>] {
        &self.threads
    }

    pub fn thread(&self, index: usize) -> Option<&Arc<ServiceThread>> {
        self.threads.get(index)
    }

    pub fn vhosts(&self) -> &[Arc<VirtualHost>] {
        &self.vhosts
    }

    pub fn vhost(&self, name: &str) -> Option<&Arc<VirtualHost>> {
        self.vhosts.iter().find(|v| v.name() == name)
    }

    /// First configured vhost; used when the caller does not pick one.
    pub fn default_vhost(&self) -> &Arc<VirtualHost> {
        &self.vhosts[0]
    }

    /// Connection objects currently allocated, on any thread or in flight.
    pub fn live_connections(&self) -> usize {
        self.counters.live()
    }

    /// Protocol session-data blocks currently allocated.
    pub fn live_session_blocks(&self) -> usize {
        self.counters.sessions()
    }

    /// Allocate a connection bound to `vhost` on `preferred` thread, or on the
    /// least-loaded thread with room. Touches no poll table.
    pub fn create_connection(
        &self,
        vhost: &Arc<VirtualHost>,
        preferred: Option<usize>,
    ) -> Result<Connection, AdmissionError> {
        let tsi = match preferred {
            Some(n) if n < self.threads.len() => n,
            Some(n) => {
                error!(tsi = n, threads = self.threads.len(), "no such service thread");
                metrics::inc_no_capacity();
                return Err(AdmissionError::NoCapacity);
            }
            None => match pick_idlest(self.threads.iter().map(|t| (t.occupancy(), t.capacity()))) {
                Some(n) => n,
                None => {
                    error!("no space for new conn");
                    metrics::inc_no_capacity();
                    return Err(AdmissionError::NoCapacity);
                }
            },
        };

        let mut conn = Connection::new(vhost, &self.threads[tsi], &self.counters);
        debug!(conn = %conn.id(), vhost = vhost.name(), tsi, "new connection joining vhost");
        metrics::inc_connections_created();

        // No session data yet: no protocol has been selected.
        let _ = conn.notify(DEFAULT_PROTOCOL, Reason::ConnectionCreated, &[]);
        Ok(conn)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("vhosts", &self.vhosts)
            .field("roles", &self.roles)
            .field("live", &self.live_connections())
            .finish_non_exhaustive()
    }
}

pub struct ContextBuilder {
    config: ServiceConfig,
    vhosts: Vec<Arc<VirtualHost>>,
    roles: RoleRegistry,
}

impl ContextBuilder {
    pub fn vhost(mut self, vhost: Arc<VirtualHost>) -> Self {
        self.vhosts.push(vhost);
        self
    }

    /// Replace the built-in roles.
    pub fn roles(mut self, roles: RoleRegistry) -> Self {
        self.roles = roles;
        self
    }

    /// Add a role. It is consulted after the ones already registered.
    pub fn role(mut self, role: Arc<dyn Role>) -> Self {
        self.roles.register(role);
        self
    }

    /// Build the context and one worker per service thread. Workers are returned
    /// unstarted; spawn them or drive them with `run_once`.
    pub fn build(self) -> Result<(Arc<Context>, Vec<ServiceWorker>), BuildError> {
        self.config.validate()?;
        if self.vhosts.is_empty() {
            return Err(ConfigError::NoVhosts.into());
        }

        let mut threads = Vec::with_capacity(self.config.threads);
        let mut workers = Vec::with_capacity(self.config.threads);
        for index in 0..self.config.threads {
            let (thread, poller) = ServiceThread::new(index, &self.config)
                .map_err(|source| BuildError::Thread { index, source })?;
            workers.push(ServiceWorker::new(Arc::clone(&thread), poller));
            threads.push(thread);
        }

        let context = Arc::new(Context {
            config: self.config,
            threads,
            vhosts: self.vhosts,
            roles: self.roles,
            counters: Arc::new(Counters::default()),
        });
        Ok((context, workers))
    }
}
