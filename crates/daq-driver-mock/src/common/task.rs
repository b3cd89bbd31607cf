use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// Background task of a mock device, aborted on shutdown or drop.
#[derive(Debug, Default)]
pub(crate) struct DeviceTask {
    handle: Mutex<Option<AbortHandle>>,
}

impl DeviceTask {
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn stop(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for DeviceTask {
    fn drop(&mut self) {
        self.stop();
    }
}
