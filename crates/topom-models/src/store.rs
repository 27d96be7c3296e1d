//! Typed access to one product's subtree in the coordinator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::{Client, Signal};
use crate::codec::{decode, encode};
use crate::error::StoreError;
use crate::group::Group;
use crate::proxy::Proxy;
use crate::sentinel::Sentinel;
use crate::slot::{SlotMapping, MAX_SLOT_NUM};
use crate::topom::Topom;

/// Root of every product's subtree.
pub const CODIS_DIR: &str = "/codis3";

/// Product names become path segments, so they are restricted to
/// `[A-Za-z0-9_-]+`.
pub fn is_valid_product(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A coordinator client bound to one product.
#[derive(Debug, Clone)]
pub struct Store {
    client: Arc<dyn Client>,
    product: String,
}

impl Store {
    pub fn new(client: Arc<dyn Client>, product: impl Into<String>) -> Self {
        Store {
            client,
            product: product.into(),
        }
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn product_dir(&self) -> String {
        format!("{CODIS_DIR}/{}", self.product)
    }

    pub fn lock_path(&self) -> String {
        format!("{}/topom", self.product_dir())
    }

    pub fn slot_dir(&self) -> String {
        format!("{}/slots", self.product_dir())
    }

    pub fn slot_path(&self, sid: u16) -> String {
        format!("{}/slot-{sid:04}", self.slot_dir())
    }

    pub fn group_dir(&self) -> String {
        format!("{}/group", self.product_dir())
    }

    pub fn group_path(&self, gid: u16) -> String {
        format!("{}/group-{gid:04}", self.group_dir())
    }

    pub fn proxy_dir(&self) -> String {
        format!("{}/proxy", self.product_dir())
    }

    pub fn proxy_path(&self, id: u32) -> String {
        format!("{}/proxy-{id:04}", self.proxy_dir())
    }

    pub fn sentinel_path(&self) -> String {
        format!("{}/sentinel", self.product_dir())
    }

    /// Takes the leader lock by writing `topom` into the lock cell.
    ///
    /// Returns the signal that fires when the cell is lost. A held lock
    /// surfaces as `AlreadyExists`.
    pub async fn acquire(&self, topom: &Topom) -> Result<Signal, StoreError> {
        self.client
            .create_ephemeral(&self.lock_path(), &encode(topom))
            .await
    }

    /// Deletes the lock cell.
    pub async fn release(&self) -> Result<(), StoreError> {
        self.client.delete(&self.lock_path()).await
    }

    /// Deletes the lock cell regardless of who holds it. Used to recover
    /// after a controller crashed without releasing.
    pub async fn force_remove_lock(&self) -> Result<Option<Topom>, StoreError> {
        let holder = self.load_topom(false).await?;
        self.client.delete(&self.lock_path()).await?;
        Ok(holder)
    }

    pub async fn load_topom(&self, must: bool) -> Result<Option<Topom>, StoreError> {
        self.load(&self.lock_path(), must).await
    }

    /// Loads every slot mapping. Slots without a node come back as
    /// unassigned mappings, so the result always has `MAX_SLOT_NUM`
    /// entries indexed by slot id.
    pub async fn slot_mappings(&self) -> Result<Vec<SlotMapping>, StoreError> {
        let mut slots = Vec::with_capacity(MAX_SLOT_NUM);
        for sid in 0..MAX_SLOT_NUM as u16 {
            let m = self
                .load_slot_mapping(sid, false)
                .await?
                .unwrap_or_else(|| SlotMapping::empty(sid));
            slots.push(m);
        }
        Ok(slots)
    }

    pub async fn load_slot_mapping(
        &self,
        sid: u16,
        must: bool,
    ) -> Result<Option<SlotMapping>, StoreError> {
        let m: Option<SlotMapping> = self.load(&self.slot_path(sid), must).await?;
        Ok(m.map(|mut m| {
            m.id = sid;
            m
        }))
    }

    pub async fn update_slot_mapping(&self, m: &SlotMapping) -> Result<(), StoreError> {
        self.write_checked(&self.slot_path(m.id), m).await
    }

    /// Loads every group, keyed by id.
    pub async fn list_group(&self) -> Result<BTreeMap<u16, Group>, StoreError> {
        let mut groups = BTreeMap::new();
        for path in self.client.list(&self.group_dir(), false).await? {
            if let Some(g) = self.load::<Group>(&path, false).await? {
                groups.insert(g.id, g);
            }
        }
        Ok(groups)
    }

    pub async fn load_group(&self, gid: u16, must: bool) -> Result<Option<Group>, StoreError> {
        self.load(&self.group_path(gid), must).await
    }

    pub async fn update_group(&self, g: &Group) -> Result<(), StoreError> {
        self.write_checked(&self.group_path(g.id), g).await
    }

    pub async fn delete_group(&self, gid: u16) -> Result<(), StoreError> {
        self.client.delete(&self.group_path(gid)).await
    }

    /// Loads every proxy, keyed by token.
    pub async fn list_proxy(&self) -> Result<HashMap<String, Proxy>, StoreError> {
        let mut proxies = HashMap::new();
        for path in self.client.list(&self.proxy_dir(), false).await? {
            if let Some(p) = self.load::<Proxy>(&path, false).await? {
                proxies.insert(p.token.clone(), p);
            }
        }
        Ok(proxies)
    }

    pub async fn load_proxy(&self, id: u32, must: bool) -> Result<Option<Proxy>, StoreError> {
        self.load(&self.proxy_path(id), must).await
    }

    pub async fn update_proxy(&self, p: &Proxy) -> Result<(), StoreError> {
        self.write_checked(&self.proxy_path(p.id), p).await
    }

    pub async fn delete_proxy(&self, id: u32) -> Result<(), StoreError> {
        self.client.delete(&self.proxy_path(id)).await
    }

    pub async fn load_sentinel(&self, must: bool) -> Result<Option<Sentinel>, StoreError> {
        self.load(&self.sentinel_path(), must).await
    }

    pub async fn update_sentinel(&self, s: &Sentinel) -> Result<(), StoreError> {
        self.write_checked(&self.sentinel_path(), s).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.client.close().await
    }

    async fn load<T: DeserializeOwned>(&self, path: &str, must: bool) -> Result<Option<T>, StoreError> {
        match self.client.read(path, must).await? {
            Some(data) => decode(path, &data).map(Some),
            None => Ok(None),
        }
    }

    /// Writes `value` and reads it back, failing if the stored value is
    /// not the one just written.
    async fn write_checked<T>(&self, path: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + PartialEq,
    {
        self.client.update(path, &encode(value)).await?;
        match self.load::<T>(path, true).await? {
            Some(back) if back == *value => Ok(()),
            _ => Err(StoreError::Mismatch(path.to_owned())),
        }
    }
}
