//! Proxy registration and re-initialisation.

use topom_models::Proxy;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::error::{precondition, TopomError};
use crate::proxy_client::ProxyClient;
use crate::topom::Topom;

impl Topom {
    /// Registers the proxy whose admin endpoint listens on `addr`.
    ///
    /// The proxy is asked for its identity, checked against this
    /// product's xauth, stored under a fresh id and then sent the full
    /// slot table and told to start.
    pub async fn create_proxy(&self, addr: &str) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;

        let mut p = ProxyClient::new(self.http.clone(), addr, "")
            .model()
            .await
            .map_err(|e| {
                warn!("proxy@{addr} fetch model failed: {e}");
                TopomError::proxy(addr, e)
            })?;
        if p.product_name != self.config.product_name {
            return precondition!(
                "proxy@{addr} belongs to product '{}'",
                p.product_name
            );
        }
        let c = self.proxy_client(&p);
        c.xping().await.map_err(|e| {
            warn!("proxy@{addr} check xauth failed: {e}");
            TopomError::proxy(addr, e)
        })?;
        if ctx.proxies.contains_key(&p.token) {
            return precondition!("proxy-[{}] already exists", p.token);
        }
        p.id = ctx.max_proxy_id() + 1;
        if p.admin_addr.is_empty() {
            p.admin_addr = addr.to_owned();
        }

        cache.create_proxy(&p).await?;
        cache.dirty_proxy(&p);
        metrics::gauge!("topom_proxies").set((ctx.proxies.len() + 1) as f64);
        self.reinit_proxy_with(&ctx, &p, &c).await
    }

    /// Pushes the full slot table to proxy `token` and starts it.
    pub async fn reinit_proxy(&self, token: &str) -> Result<(), TopomError> {
        let (_cache, ctx) = self.begin_settled().await?;
        let p = ctx.proxy(token)?;
        let c = self.proxy_client(p);
        self.reinit_proxy_with(&ctx, p, &c).await
    }

    async fn reinit_proxy_with(&self, ctx: &Context, p: &Proxy, c: &ProxyClient) -> Result<(), TopomError> {
        info!(token = %p.token, "reinit proxy-[{}]", p.token);
        c.fill_slots(&ctx.all_slots()).await.map_err(|e| {
            error!(token = %p.token, "proxy-[{}] fillslots failed: {e}", p.token);
            TopomError::Broadcast(format!("proxy-[{}] fillslots failed", p.token))
        })?;
        if !ctx.sentinel.servers.is_empty() {
            c.set_sentinels(&ctx.sentinel).await.map_err(|e| {
                error!(token = %p.token, "proxy-[{}] set sentinels failed: {e}", p.token);
                TopomError::Broadcast(format!("proxy-[{}] set sentinels failed", p.token))
            })?;
        }
        c.start().await.map_err(|e| {
            error!(token = %p.token, "proxy-[{}] start failed: {e}", p.token);
            TopomError::Broadcast(format!("proxy-[{}] start failed", p.token))
        })
    }

    /// Shuts proxy `token` down and forgets it.
    ///
    /// A failed shutdown aborts unless `force` is set.
    pub async fn remove_proxy(&self, token: &str, force: bool) -> Result<(), TopomError> {
        let (mut cache, ctx) = self.begin_settled().await?;
        let p = ctx.proxy(token)?;
        if let Err(e) = self.proxy_client(p).shutdown().await {
            warn!(token, force, "proxy-[{token}] shutdown failed: {e}");
            if !force {
                return Err(TopomError::Broadcast(format!(
                    "proxy-[{token}] shutdown failed"
                )));
            }
        }
        cache.remove_proxy(p).await?;
        cache.dirty_proxy(p);
        metrics::gauge!("topom_proxies").set(ctx.proxies.len().saturating_sub(1) as f64);
        Ok(())
    }
}
