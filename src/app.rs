use crate::cache::{DbCache, MemoryCache, RoutingCache};
use crate::config::{CacheConfig, Config};
use crate::routing::Dispatcher;
use crate::store::{PgStore, RoutingStore};
use crate::web::create_router;
use crate::yate::EngineClient;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct App {
    pub config: Config,
    pub web_only: bool,
    token: CancellationToken,
}

pub struct AppBuilder {
    config: Option<Config>,
    web_only: bool,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            web_only: false,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn web_only(mut self, web_only: bool) -> Self {
        self.web_only = web_only;
        self
    }

    pub fn build(self) -> Result<App> {
        let config = self.config.unwrap_or_default();
        Ok(App {
            config,
            web_only: self.web_only,
            token: CancellationToken::new(),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn run(self) -> Result<()> {
        let store: Arc<dyn RoutingStore> = Arc::new(
            PgStore::connect(&self.config.store.url, self.config.store.max_connections).await?,
        );
        let cache: Arc<dyn RoutingCache> = match &self.config.cache {
            CacheConfig::Memory => Arc::new(MemoryCache::new()),
            CacheConfig::Database { url } => Arc::new(DbCache::connect(url).await?),
        };
        let dispatcher = Arc::new(Dispatcher::new(store, cache, self.config.routing.clone()));

        if self.web_only {
            info!("starting in webserver-only mode");
        } else {
            let client = Arc::new(EngineClient::new(
                dispatcher.clone(),
                self.config.engine.clone(),
                self.token.clone(),
            ));
            tokio::spawn(client.run());
        }

        let router = create_router(dispatcher);
        let addr: SocketAddr = self.config.http_addr.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("diagnostic endpoint listening on {}", addr);

        let token = self.token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        Ok(())
    }
}
