use std::collections::BTreeMap;
use std::sync::Arc;

use faas_common::{Sandbox, SandboxError, SandboxProvider, SandboxSpec, Virtualization};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Providers by virtualization technology, behind one host-wide pool of
/// execution slots.
pub struct ProviderRegistry {
    providers: BTreeMap<Virtualization, Arc<dyn SandboxProvider>>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl ProviderRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            providers: BTreeMap::new(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Registers `provider` for its technology, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn SandboxProvider>) {
        self.providers.insert(provider.virtualization(), provider);
    }

    pub fn provider(&self, virtualization: Virtualization) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.get(&virtualization).cloned()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Readiness of every known technology, registered or not.
    pub async fn availability(&self) -> BTreeMap<Virtualization, bool> {
        let mut status = BTreeMap::new();
        for virtualization in Virtualization::ALL {
            let ready = match self.providers.get(&virtualization) {
                Some(provider) => provider.available().await,
                None => false,
            };
            status.insert(virtualization, ready);
        }
        status
    }

    /// Takes a free slot and allocates a sandbox in it.
    ///
    /// Fails without waiting when the host is full. The slot stays taken
    /// until the returned lease is released.
    pub async fn lease(
        &self,
        virtualization: Virtualization,
        spec: &SandboxSpec,
    ) -> Result<SandboxLease, SandboxError> {
        let provider = self.provider(virtualization).ok_or_else(|| {
            SandboxError::Provider(format!("no provider registered for {virtualization}"))
        })?;

        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            SandboxError::Capacity(format!("all {} execution slots are busy", self.capacity))
        })?;

        let sandbox = provider.acquire(spec).await?;
        debug!(sandbox_id = %sandbox.id(), %virtualization, "Sandbox leased");

        Ok(SandboxLease {
            sandbox: Some(sandbox),
            permit: Some(permit),
        })
    }
}

/// A sandbox bound to the execution slot it occupies.
///
/// [`SandboxLease::release`] tears the sandbox down before freeing the slot.
/// A lease dropped without release schedules the same teardown on the
/// current runtime.
pub struct SandboxLease {
    sandbox: Option<Box<dyn Sandbox>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SandboxLease {
    pub fn sandbox(&self) -> &dyn Sandbox {
        match &self.sandbox {
            Some(sandbox) => sandbox.as_ref(),
            None => unreachable!("sandbox is only taken by release or drop"),
        }
    }

    pub fn sandbox_mut(&mut self) -> &mut dyn Sandbox {
        match &mut self.sandbox {
            Some(sandbox) => sandbox.as_mut(),
            None => unreachable!("sandbox is only taken by release or drop"),
        }
    }

    pub async fn release(mut self) -> Result<(), SandboxError> {
        let permit = self.permit.take();
        let result = match self.sandbox.take() {
            Some(sandbox) => sandbox.release().await,
            None => Ok(()),
        };
        drop(permit);
        result
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        let permit = self.permit.take();
        warn!(sandbox_id = %sandbox.id(), "Sandbox lease dropped without release, scheduling teardown");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sandbox.release().await {
                        warn!(error = %e, "Deferred sandbox teardown failed");
                    }
                    drop(permit);
                });
            }
            Err(_) => warn!("No runtime available, sandbox resources may leak"),
        }
    }
}
