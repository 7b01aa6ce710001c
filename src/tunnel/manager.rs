//! Tunnel registry.
//!
//! Maps tunnel ids to live [`TunnelClient`]s. Creation binds a fresh pool on an
//! ephemeral port, wraps it in a client and registers it; a reaper task per
//! tunnel removes the entry once the client closes, so the id becomes free
//! again. Ids are never displaced: registering a live id fails with
//! [`TunnelError::IdInUse`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, info_span, Instrument};

use super::agent::{AgentOptions, TunnelAgent};
use super::client::{ClientOptions, TunnelClient};
use crate::auth::{generate_password, Credentials};
use crate::config::Config;
use crate::error::TunnelError;

/// Settings applied to every tunnel the registry creates.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub bind_address: String,
    pub max_sockets: usize,
    pub socket_idle_timeout: Option<Duration>,
    pub client: ClientOptions,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_address: config.tunnel.bind_address.clone(),
            max_sockets: config.tunnel.max_sockets,
            socket_idle_timeout: config.tunnel.socket_idle_timeout(),
            client: ClientOptions {
                secure: config.server.secure,
                grace_period: config.tunnel.grace_period(),
                borrow_timeout: config.tunnel.borrow_timeout(),
                max_header_bytes: config.tunnel.max_header_bytes,
            },
        }
    }
}

/// Requested credentials for a new tunnel.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthOptions {
    /// A username turns auth on; a missing password is generated. A password
    /// without a username is ignored.
    fn resolve(self) -> Option<Credentials> {
        let username = self.username?;
        let password = self.password.unwrap_or_else(generate_password);
        Some(Credentials { username, password })
    }
}

/// What a remote client needs to attach to a new tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ManagerStats {
    pub tunnels: usize,
}

/// Registry of live tunnels, shared across handlers.
#[derive(Clone)]
pub struct ClientManager {
    clients: Arc<RwLock<HashMap<String, TunnelClient>>>,
    options: Arc<ManagerOptions>,
}

impl ClientManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            options: Arc::new(options),
        }
    }

    /// Create and register a tunnel under `id`.
    pub async fn new_client(&self, id: &str, auth: AuthOptions) -> Result<TunnelInfo, TunnelError> {
        // Cheap early rejection; the insert below re-checks under the write lock.
        if self.clients.read().await.contains_key(id) {
            return Err(TunnelError::IdInUse(id.to_string()));
        }

        let (agent, events) = TunnelAgent::listen(AgentOptions {
            id: id.to_string(),
            bind_address: self.options.bind_address.clone(),
            max_sockets: self.options.max_sockets,
            idle_timeout: self.options.socket_idle_timeout,
        })
        .await?;
        let port = agent.port();

        let credentials = auth.resolve();
        let client = TunnelClient::new(
            id.to_string(),
            agent,
            events,
            credentials.clone(),
            self.options.client.clone(),
        );

        {
            let mut clients = self.clients.write().await;
            if clients.contains_key(id) {
                drop(clients);
                client.close();
                return Err(TunnelError::IdInUse(id.to_string()));
            }
            clients.insert(id.to_string(), client.clone());
        }
        self.spawn_reaper(client);

        info!(
            id,
            port,
            auth = credentials.is_some(),
            "tunnel created"
        );

        let (username, password) = match credentials {
            Some(c) => (Some(c.username), Some(c.password)),
            None => (None, None),
        };
        Ok(TunnelInfo {
            id: id.to_string(),
            port,
            max_conn_count: self.options.max_sockets,
            username,
            password,
        })
    }

    /// Remove the registry entry once the client closes, unless the id has
    /// since been taken by a different client.
    fn spawn_reaper(&self, client: TunnelClient) {
        let clients = self.clients.clone();
        let span = info_span!("tunnel", id = %client.id());
        tokio::spawn(
            async move {
                client.closed().await;
                let mut clients = clients.write().await;
                if clients
                    .get(client.id())
                    .is_some_and(|current| current.same_as(&client))
                {
                    clients.remove(client.id());
                    info!(remaining = clients.len(), "tunnel removed");
                }
            }
            .instrument(span),
        );
    }

    pub async fn get_client(&self, id: &str) -> Option<TunnelClient> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn has_client(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Evict and close a tunnel. Returns whether it existed.
    pub async fn remove_client(&self, id: &str) -> bool {
        let removed = self.clients.write().await.remove(id);
        match removed {
            Some(client) => {
                client.close();
                true
            }
            None => false,
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            tunnels: self.clients.read().await.len(),
        }
    }

    /// Close every live tunnel. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<TunnelClient> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in &drained {
            client.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all tunnels");
        }
        drained.len()
    }
}
