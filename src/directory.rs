use crate::store::{DeviceDirectory, DeviceRecord, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-through cache in front of the device directory.
///
/// `list_devices` replaces the whole cache. Only found devices are cached,
/// so a device created after the last listing resolves on its first message.
#[derive(Clone)]
pub struct CachedDirectory {
    inner: Arc<dyn DeviceDirectory>,
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            inner,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn invalidate(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
    }

    #[cfg(test)]
    pub async fn cached_len(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[async_trait]
impl DeviceDirectory for CachedDirectory {
    async fn list_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        let devices = self.inner.list_devices().await?;
        let fresh = devices
            .iter()
            .map(|device| (device.device_id.clone(), device.clone()))
            .collect::<HashMap<_, _>>();
        *self.devices.write().await = fresh;
        Ok(devices)
    }

    async fn lookup_device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>> {
        if let Some(found) = self.devices.read().await.get(device_id) {
            return Ok(Some(found.clone()));
        }
        let found = self.inner.lookup_device(device_id).await?;
        if let Some(device) = &found {
            self.devices
                .write()
                .await
                .insert(device.device_id.clone(), device.clone());
        }
        Ok(found)
    }
}
