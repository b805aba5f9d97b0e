//! Device factories and the per-service device cache.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    tracing::{debug, info, warn},
};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Error, Result},
};

/// Transport factory for input devices.
#[async_trait]
pub trait InputDeviceManager: Send + Sync {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Build a new device for `name`. Callers cache the result; this may be
    /// called once per name per [`DeviceManager`].
    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>>;
}

/// Transport factory for output devices.
#[async_trait]
pub trait OutputDeviceManager: Send + Sync {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>>;
}

/// Lazily creates and caches one device per name.
///
/// Owned by a single service; access is sequential, so no locking is done
/// here. Cached devices live until [`DeviceManager::close_all`].
pub struct DeviceManager {
    input_manager: Option<Arc<dyn InputDeviceManager>>,
    output_manager: Option<Arc<dyn OutputDeviceManager>>,
    inputs: HashMap<String, Arc<dyn InputDevice>>,
    outputs: HashMap<String, Arc<dyn OutputDevice>>,
    connected: bool,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            input_manager: None,
            output_manager: None,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            connected: false,
        }
    }

    #[must_use]
    pub fn with_input_manager(mut self, manager: Arc<dyn InputDeviceManager>) -> Self {
        self.input_manager = Some(manager);
        self
    }

    #[must_use]
    pub fn with_output_manager(mut self, manager: Arc<dyn OutputDeviceManager>) -> Self {
        self.output_manager = Some(manager);
        self
    }

    pub fn has_output_manager(&self) -> bool {
        self.output_manager.is_some()
    }

    /// Connect the underlying factories. Errors are construction errors.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if let Some(m) = &self.input_manager {
            m.connect()
                .await
                .map_err(|e| Error::construction("input manager", e))?;
        }
        if let Some(m) = &self.output_manager {
            m.connect()
                .await
                .map_err(|e| Error::construction("output manager", e))?;
        }
        self.connected = true;
        debug!("device managers connected");
        Ok(())
    }

    /// Return the cached input device for `name`, creating it on first use.
    pub async fn get_input_device(&mut self, name: &str) -> Result<Arc<dyn InputDevice>> {
        if let Some(device) = self.inputs.get(name) {
            return Ok(Arc::clone(device));
        }
        self.connect().await?;
        let manager = self
            .input_manager
            .as_ref()
            .ok_or_else(|| Error::construction(name, "no input device manager configured"))?;
        let device = manager
            .create_input_device(name)
            .await
            .map_err(|e| as_construction(name, e))?;
        info!(device = name, "input device created");
        self.inputs.insert(name.to_string(), Arc::clone(&device));
        Ok(device)
    }

    /// Return the cached output device for `name`, creating it on first use.
    pub async fn get_output_device(&mut self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        if let Some(device) = self.outputs.get(name) {
            return Ok(Arc::clone(device));
        }
        self.connect().await?;
        let manager = self
            .output_manager
            .as_ref()
            .ok_or_else(|| Error::construction(name, "no output device manager configured"))?;
        let device = manager
            .create_output_device(name)
            .await
            .map_err(|e| as_construction(name, e))?;
        info!(device = name, "output device created");
        self.outputs.insert(name.to_string(), Arc::clone(&device));
        Ok(device)
    }

    pub fn input_device_names(&self) -> Vec<&str> {
        self.inputs.keys().map(String::as_str).collect()
    }

    pub fn output_device_names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }

    /// Close every cached device, then disconnect the factories.
    ///
    /// Every close is attempted; the first failure is returned.
    pub async fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (name, device) in self.inputs.drain() {
            if let Err(e) = device.close().await {
                warn!(device = %name, error = %e, "failed to close input device");
                first_err.get_or_insert(e);
            }
        }
        for (name, device) in self.outputs.drain() {
            if let Err(e) = device.close().await {
                warn!(device = %name, error = %e, "failed to close output device");
                first_err.get_or_insert(e);
            }
        }
        if self.connected {
            if let Some(m) = &self.input_manager
                && let Err(e) = m.disconnect().await
            {
                warn!(error = %e, "failed to disconnect input manager");
                first_err.get_or_insert(e);
            }
            if let Some(m) = &self.output_manager
                && let Err(e) = m.disconnect().await
            {
                warn!(error = %e, "failed to disconnect output manager");
                first_err.get_or_insert(e);
            }
            self.connected = false;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn as_construction(name: &str, err: Error) -> Error {
    match err {
        Error::Construction { .. } => err,
        other => Error::construction(name, other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use {
        super::*,
        crate::{message::MessageBundle, transaction::ReadResult},
    };

    struct Dummy(String, Arc<AtomicUsize>);

    #[async_trait]
    impl InputDevice for Dummy {
        fn name(&self) -> &str {
            &self.0
        }

        async fn read_message(&self, _timeout: Duration) -> Result<Option<ReadResult>> {
            Ok(None)
        }

        async fn close(&self) -> Result<()> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl OutputDevice for Dummy {
        fn name(&self) -> &str {
            &self.0
        }

        async fn send_message(&self, _bundle: &MessageBundle) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InputDeviceManager for CountingFactory {
        async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
            if name == "bad" {
                return Err(Error::transport(name, "no such queue"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Dummy(name.into(), Arc::clone(&self.closed))))
        }
    }

    #[tokio::test]
    async fn same_name_returns_the_cached_instance() {
        let factory = Arc::new(CountingFactory::default());
        let mut mgr = DeviceManager::new().with_input_manager(factory.clone());
        let a = mgr.get_input_device("q").await.unwrap();
        let b = mgr.get_input_device("q").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        mgr.get_input_device("other").await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn creation_failure_is_a_construction_error() {
        let mut mgr = DeviceManager::new().with_input_manager(Arc::new(CountingFactory::default()));
        let err = mgr.get_input_device("bad").await.err().unwrap();
        assert!(matches!(err, Error::Construction { ref device, .. } if device == "bad"));
    }

    #[tokio::test]
    async fn missing_factory_is_a_construction_error() {
        let mut mgr = DeviceManager::new();
        let err = mgr.get_output_device("out").await.err().unwrap();
        assert!(matches!(err, Error::Construction { .. }));
    }

    #[tokio::test]
    async fn close_all_closes_each_cached_device_once() {
        let factory = Arc::new(CountingFactory::default());
        let mut mgr = DeviceManager::new().with_input_manager(factory.clone());
        mgr.get_input_device("a").await.unwrap();
        mgr.get_input_device("b").await.unwrap();
        mgr.close_all().await.unwrap();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
        assert!(mgr.input_device_names().is_empty());
    }
}
