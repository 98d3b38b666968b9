//! C interface (`include/spf.h`).
//!
//! A process-wide [`InstanceManager`] and its multi-threaded runtime are
//! created on first use. Every call blocks the calling thread until the
//! operation completes, so these functions must not be called from inside a
//! tokio runtime. Failures return `-1` and latch a message that
//! `SPF_GetLastError` hands back to the caller.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_int, CStr, CString};
use std::fmt::Display;
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::config::ConfigLoader;
use crate::forward::{ForwardSettings, ForwardingConfig, InstanceId, LastError, Protocol};
use crate::logging::{init_logging, LoggingError};
use crate::manager::InstanceManager;

struct Engine {
    runtime: Runtime,
    manager: InstanceManager,
}

static ENGINE: OnceLock<Result<Engine, String>> = OnceLock::new();
static LAST_ERROR: OnceLock<Arc<LastError>> = OnceLock::new();

/// Shared with the manager so listeners that die on their own show up too.
fn error_slot() -> &'static Arc<LastError> {
    LAST_ERROR.get_or_init(|| Arc::new(LastError::new()))
}

fn engine() -> Result<&'static Engine, String> {
    ENGINE
        .get_or_init(|| {
            Builder::new_multi_thread()
                .thread_name("spf-worker")
                .enable_all()
                .build()
                .map(|runtime| Engine {
                    runtime,
                    manager: InstanceManager::new().with_error_sink(Arc::clone(error_slot())),
                })
                .map_err(|e| format!("failed to start runtime: {e}"))
        })
        .as_ref()
        .map_err(Clone::clone)
}

fn fail(call: &str, err: impl Display) -> c_int {
    debug!(call, error = %err, "C API call failed");
    error_slot().record(err);
    -1
}

/// Borrow a C string argument as UTF-8.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string valid for `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, String> {
    if ptr.is_null() {
        return Err(format!("{name} must not be null"));
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| format!("{name} is not valid UTF-8"))
}

fn instance_id(raw: c_int) -> Result<InstanceId, String> {
    u64::try_from(raw)
        .map(InstanceId::from_raw)
        .map_err(|_| format!("invalid instance id {raw}"))
}

fn register(
    engine: &Engine,
    config: ForwardingConfig,
    settings: ForwardSettings,
) -> Result<c_int, String> {
    let id = engine
        .manager
        .create_with_settings(config, settings)
        .map_err(|e| e.to_string())?;

    match c_int::try_from(id.get()) {
        Ok(raw) => Ok(raw),
        Err(_) => {
            let _ = engine.runtime.block_on(engine.manager.destroy(id));
            Err("instance ids exhausted".to_string())
        },
    }
}

fn create_from_file(path: &str) -> Result<c_int, String> {
    let config = ConfigLoader::standard()
        .load(path)
        .map_err(|e| e.to_string())?;

    match init_logging(&config.logging) {
        Ok(()) | Err(LoggingError::AlreadyInitialized) => {},
        Err(e) => return Err(e.to_string()),
    }

    let mut rules = config.forwarding_configs();
    if rules.len() != 1 {
        return Err(format!(
            "configuration must define exactly one enabled rule, found {}",
            rules.len()
        ));
    }
    let rule = rules.remove(0);

    register(engine()?, rule, config.engine)
}

/// Create a stopped instance from a TOML configuration file with exactly
/// one enabled rule.
///
/// Returns the instance id, or -1 on error.
///
/// # Safety
///
/// `configPath` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn SPF_Create(configPath: *const c_char) -> c_int {
    // SAFETY: forwarded caller contract.
    let result = unsafe { str_arg(configPath, "configPath") }.and_then(create_from_file);
    match result {
        Ok(id) => id,
        Err(e) => fail("SPF_Create", e),
    }
}

/// Create a stopped instance from explicit endpoints. `protocol` is "tcp" or "udp".
///
/// Returns the instance id, or -1 on error.
///
/// # Safety
///
/// Each argument must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn SPF_CreateRule(
    listen: *const c_char,
    target: *const c_char,
    protocol: *const c_char,
) -> c_int {
    let result = (|| {
        // SAFETY: forwarded caller contract.
        let listen = unsafe { str_arg(listen, "listen") }?;
        let target = unsafe { str_arg(target, "target") }?;
        let protocol: Protocol = unsafe { str_arg(protocol, "protocol") }?
            .parse()
            .map_err(|e: crate::forward::ForwardError| e.to_string())?;

        let engine = engine()?;
        let settings = engine.manager.settings().clone();
        register(engine, ForwardingConfig::new(listen, target, protocol), settings)
    })();

    match result {
        Ok(id) => id,
        Err(e) => fail("SPF_CreateRule", e),
    }
}

/// Start forwarding. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn SPF_Start(instanceID: c_int) -> c_int {
    let result = instance_id(instanceID).and_then(|id| {
        let engine = engine()?;
        engine
            .runtime
            .block_on(engine.manager.start(id))
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(_) => 0,
        Err(e) => fail("SPF_Start", e),
    }
}

/// Stop forwarding. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn SPF_Stop(instanceID: c_int) -> c_int {
    let result = instance_id(instanceID).and_then(|id| {
        let engine = engine()?;
        engine
            .runtime
            .block_on(engine.manager.stop(id))
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(()) => 0,
        Err(e) => fail("SPF_Stop", e),
    }
}

/// Destroy a stopped instance. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn SPF_Destroy(instanceID: c_int) -> c_int {
    let result = instance_id(instanceID).and_then(|id| {
        let engine = engine()?;
        engine
            .runtime
            .block_on(engine.manager.destroy(id))
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(()) => 0,
        Err(e) => fail("SPF_Destroy", e),
    }
}

/// Returns 1 if running, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn SPF_IsRunning(instanceID: c_int) -> c_int {
    let result = instance_id(instanceID).and_then(|id| {
        engine()?
            .manager
            .is_running(id)
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(running) => c_int::from(running),
        Err(e) => fail("SPF_IsRunning", e),
    }
}

/// Most recent error message, or an empty string.
///
/// The caller owns the returned string and must release it with
/// `SPF_FreeString`.
#[no_mangle]
pub extern "C" fn SPF_GetLastError() -> *mut c_char {
    let message = error_slot().get().unwrap_or_default().replace('\0', " ");
    CString::new(message).unwrap_or_default().into_raw()
}

/// Release a string returned by `SPF_GetLastError`.
///
/// # Safety
///
/// `s` must be null or a pointer obtained from `SPF_GetLastError` that has
/// not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn SPF_FreeString(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    // SAFETY: allocated by CString::into_raw in SPF_GetLastError.
    drop(unsafe { CString::from_raw(s) });
}
