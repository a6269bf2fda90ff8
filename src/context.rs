//! ## Process-wide libusb context
//!
//! spec.md §9 "Process-wide library handle": the libusb context must be
//! initialised exactly once per process and torn down once the last handle
//! closes. Modeled as a reference-counted singleton guarded by a
//! library-wide mutex at init/teardown only (spec.md §5 "Shared
//! resources") — no locking on the hot path once a [`Device`](crate::Device)
//! holds its own `Arc`.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::{Error, Result};

static SHARED: OnceLock<Mutex<Weak<rusb::Context>>> = OnceLock::new();

/// Obtain the process-wide libusb context, creating it if this is the first
/// live reference and reusing the existing one (by upgrading the weak
/// handle) otherwise. Once the last `Arc` returned from here is dropped,
/// the next call re-initialises libusb from scratch.
pub fn shared() -> Result<Arc<rusb::Context>> {
    let cell = SHARED.get_or_init(|| Mutex::new(Weak::new()));
    let mut guard = cell.lock().unwrap();
    if let Some(context) = guard.upgrade() {
        return Ok(context);
    }
    let context = Arc::new(rusb::Context::new().map_err(Error::Transport)?);
    *guard = Arc::downgrade(&context);
    Ok(context)
}
