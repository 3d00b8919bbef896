//! # Host Interface
//!
//! Functions handler modules import from the `host` namespace. Each call
//! works on the [`HostState`] of a single invocation: the request being
//! served, the response being built, the content stream offered to a
//! processor and the fault offered to an exception handler.
//!
//! Functions shaped `*_read(ptr, cap)` copy at most `cap` bytes into guest
//! memory at `ptr` and return the full length, so a module can retry with
//! a larger buffer.

use std::io::Read;

use wasmtime::{Caller, Engine, Linker, Memory};

use crate::handlers::{Fault, FaultCode, HandlerRequest, HandlerResponse};
use crate::snapshot::ContentStream;

/// Import namespace reserved for host functions
pub const HOST_MODULE: &str = "host";

/// Every function the host provides
pub const HOST_FUNCTIONS: &[&str] = &[
    "path_read",
    "method_read",
    "body_read",
    "header_read",
    "content_available",
    "content_read",
    "response_status",
    "response_header",
    "response_write",
    "fault_status",
    "fault_message_read",
    "raise",
    "log",
];

/// Fault details visible to an exception handler
#[derive(Debug, Clone)]
pub struct FaultView {
    pub status: u16,
    pub message: Option<String>,
}

impl From<&Fault> for FaultView {
    fn from(fault: &Fault) -> Self {
        Self {
            status: fault.status_code(),
            message: fault.message().map(str::to_string),
        }
    }
}

/// Per-invocation data behind every host call
pub struct HostState {
    /// Qualified name of the module being invoked
    pub module: String,
    pub path: String,
    pub request: HandlerRequest,
    pub response: HandlerResponse,
    pub content: Option<ContentStream>,
    pub fault: Option<FaultView>,
}

impl HostState {
    pub fn new(module: impl Into<String>, path: impl Into<String>, request: HandlerRequest) -> Self {
        Self {
            module: module.into(),
            path: path.into(),
            request,
            response: HandlerResponse::default(),
            content: None,
            fault: None,
        }
    }

    /// State for instantiating a module outside any request
    pub fn detached(module: impl Into<String>) -> Self {
        Self::new(module, "", HandlerRequest::default())
    }
}

fn guest_len(value: i32, what: &str) -> wasmtime::Result<usize> {
    usize::try_from(value).map_err(|_| wasmtime::Error::msg(format!("negative {}: {}", what, value)))
}

fn host_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("handler module does not export `memory`"))
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let offset = guest_len(ptr, "pointer")?;
    let len = guest_len(len, "length")?;
    let mut buf = vec![0u8; len];
    if len > 0 {
        let memory = memory(caller)?;
        memory.read(&*caller, offset, &mut buf)?;
    }
    Ok(buf)
}

fn read_guest_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    let bytes = read_guest(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Copy `data` (truncated to `cap`) to guest memory; returns the full length
fn copy_out(caller: &mut Caller<'_, HostState>, ptr: i32, cap: i32, data: &[u8]) -> wasmtime::Result<i32> {
    let offset = guest_len(ptr, "pointer")?;
    let cap = guest_len(cap, "capacity")?;
    let n = cap.min(data.len());
    if n > 0 {
        let memory = memory(caller)?;
        memory.write(&mut *caller, offset, &data[..n])?;
    }
    Ok(host_len(data.len()))
}

/// Build the linker every handler module is instantiated with
pub fn host_linker(engine: &Engine) -> wasmtime::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    linker.func_wrap(
        HOST_MODULE,
        "path_read",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let path = caller.data().path.clone();
            copy_out(&mut caller, ptr, cap, path.as_bytes())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "method_read",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let method = caller.data().request.method.clone();
            copy_out(&mut caller, ptr, cap, method.as_bytes())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "body_read",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let body = caller.data().request.body.clone();
            copy_out(&mut caller, ptr, cap, &body)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "header_read",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         ptr: i32,
         cap: i32|
         -> wasmtime::Result<i32> {
            let name = read_guest_string(&mut caller, name_ptr, name_len)?;
            let value = caller.data().request.header(&name).map(str::to_string);
            match value {
                Some(value) => copy_out(&mut caller, ptr, cap, value.as_bytes()),
                None => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "content_available",
        |caller: Caller<'_, HostState>| -> i32 { i32::from(caller.data().content.is_some()) },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "content_read",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let cap = guest_len(cap, "capacity")?;
            let mut chunk = vec![0u8; cap];
            let n = match caller.data_mut().content.as_mut() {
                Some(stream) => stream.read(&mut chunk)?,
                None => return Ok(-1),
            };
            if n > 0 {
                let offset = guest_len(ptr, "pointer")?;
                let memory = memory(&mut caller)?;
                memory.write(&mut caller, offset, &chunk[..n])?;
            }
            Ok(host_len(n))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "response_status",
        |mut caller: Caller<'_, HostState>, status: i32| -> wasmtime::Result<()> {
            let status = u16::try_from(status)
                .map_err(|_| wasmtime::Error::msg(format!("invalid status code: {}", status)))?;
            caller.data_mut().response.set_status(status);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "response_header",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> wasmtime::Result<()> {
            let name = read_guest_string(&mut caller, name_ptr, name_len)?;
            let value = read_guest_string(&mut caller, value_ptr, value_len)?;
            caller.data_mut().response.set_header(name, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "response_write",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().response.write_bytes(&bytes);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "fault_status",
        |caller: Caller<'_, HostState>| -> i32 {
            caller
                .data()
                .fault
                .as_ref()
                .map(|fault| i32::from(fault.status))
                .unwrap_or(0)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "fault_message_read",
        |mut caller: Caller<'_, HostState>, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let message = caller
                .data()
                .fault
                .as_ref()
                .and_then(|fault| fault.message.clone());
            match message {
                Some(message) => copy_out(&mut caller, ptr, cap, message.as_bytes()),
                None => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "raise",
        |mut caller: Caller<'_, HostState>, code: i32, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let message = if len > 0 {
                Some(read_guest_string(&mut caller, ptr, len)?)
            } else {
                None
            };
            let fault = match u16::try_from(code).ok().and_then(FaultCode::from_status) {
                Some(code) => match message {
                    Some(message) => Fault::with_message(code, message),
                    None => Fault::new(code),
                },
                None => Fault::with_message(
                    FaultCode::InternalError,
                    format!("handler raised unknown fault code {}", code),
                ),
            };
            Err(wasmtime::Error::new(fault))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let message = read_guest_string(&mut caller, ptr, len)?;
            let module = caller.data().module.as_str();
            match level {
                0 => tracing::trace!(module, "{}", message),
                1 => tracing::debug!(module, "{}", message),
                2 => tracing::info!(module, "{}", message),
                3 => tracing::warn!(module, "{}", message),
                _ => tracing::error!(module, "{}", message),
            }
            Ok(())
        },
    )?;

    Ok(linker)
}
