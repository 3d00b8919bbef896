//! # Request Dispatcher
//!
//! Per-request state machine:
//!
//! 1. resolve the configured reference and fetch the snapshot's handler set;
//! 2. locate the request path among the snapshot's entries;
//! 3. run the script bound to the path, if any;
//! 4. otherwise offer the request to every processor, then fall back to
//!    serving the file itself or to `NotFound`;
//! 5. escalate any fault to the exception handlers, then to the default
//!    error page.

use std::any::Any;
use std::borrow::Cow;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use uuid::Uuid;

use super::cache::{CompilationCache, SnapshotHandlerSet};
use super::error_page;
use super::exclude::ExcludeRules;
use crate::compiler::SourceCompiler;
use crate::handlers::{
    Fault, FaultCode, FaultResult, HandlerRegistry, HandlerRequest, HandlerResponse,
};
use crate::snapshot::{
    ContentStream, ReferenceResolver, SnapshotId, SnapshotProvider, SnapshotResult, TreeEntry,
};

/// Message of the fault raised when nothing can serve a path
pub const NOT_FOUND_MESSAGE: &str = "Request can't be processed. No file or processor found";

/// Strip the query string and a single leading `/`, then percent-decode
pub fn normalize_path(target: &str) -> Cow<'_, str> {
    let path = target.split(|c| c == '?' || c == '#').next().unwrap_or("");
    let path = path.strip_prefix('/').unwrap_or(path);
    percent_decode_str(path).decode_utf8_lossy()
}

/// First entry whose path equals `path`
fn locate(
    provider: &dyn SnapshotProvider,
    snapshot: &SnapshotId,
    path: &str,
) -> SnapshotResult<Option<TreeEntry>> {
    for entry in provider.entries(snapshot)? {
        let entry = entry?;
        if entry.path == path {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run handler code, turning a panic into an internal fault
fn guarded<T>(call: impl FnOnce() -> FaultResult<T>) -> FaultResult<T> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(Fault::with_message(
            FaultCode::InternalError,
            format!("handler panicked: {}", panic_message(payload.as_ref())),
        ))
    })
}

/// Dispatches requests against the snapshot the configured reference
/// currently points at
#[derive(Debug)]
pub struct RequestDispatcher {
    resolver: ReferenceResolver,
    cache: CompilationCache,
    exclude: ExcludeRules,
}

impl RequestDispatcher {
    pub fn new(
        resolver: ReferenceResolver,
        compiler: Arc<dyn SourceCompiler>,
        exclude: ExcludeRules,
        cache_capacity: NonZeroUsize,
    ) -> Self {
        Self {
            resolver,
            cache: CompilationCache::new(compiler, cache_capacity),
            exclude,
        }
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &CompilationCache {
        &self.cache
    }

    /// Resolve the reference and make sure its snapshot is compiled
    pub fn warm(&self) -> FaultResult<Arc<SnapshotHandlerSet>> {
        let snapshot = self.resolver.resolve().map_err(Fault::internal)?;
        self.cache.ensure(self.resolver.provider().as_ref(), &snapshot)
    }

    /// Serve one request
    pub fn dispatch(&self, request: &HandlerRequest) -> HandlerResponse {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "request",
            %request_id,
            method = %request.method,
            target = %request.target
        );
        let _entered = span.enter();

        let path = normalize_path(&request.target);
        let path: &str = &path;
        let mut response = HandlerResponse::new();

        let set = match self.warm() {
            Ok(set) => set,
            Err(fault) => {
                tracing::error!(peer = %request.peer(), "can't resolve a snapshot: {}", fault);
                error_page::render(&mut response, &fault);
                return response;
            }
        };
        tracing::info!(snapshot = %set.snapshot(), peer = %request.peer(), "handling request");

        if let Err(fault) = guarded(|| self.serve(&set, path, request, &mut response)) {
            self.escalate(set.registry(), path, request, &mut response, fault);
        }

        tracing::debug!(status = response.status, bytes = response.body.len(), "request done");
        response
    }

    fn serve(
        &self,
        set: &SnapshotHandlerSet,
        path: &str,
        request: &HandlerRequest,
        response: &mut HandlerResponse,
    ) -> FaultResult<()> {
        let provider = self.resolver.provider().as_ref();
        let registry = set.registry();
        let entry = locate(provider, set.snapshot(), path).map_err(Fault::internal)?;

        // Only a found, non-excluded file may be served as is
        let servable = match &entry {
            Some(_) if self.exclude.is_excluded(path) => {
                tracing::debug!(path, "file is excluded from serving");
                None
            }
            Some(entry) => Some(entry),
            None => {
                tracing::debug!(path, "no file; trying processors");
                None
            }
        };

        if entry.is_some() {
            if let Some(script) = registry.script_for(path) {
                tracing::info!(module = %script.descriptor.qualified_name, "executing script");
                return script.handler.execute(path, request, response);
            }
        }

        let mut content: Option<ContentStream> = match servable {
            Some(entry) => Some(provider.open_blob(&entry.blob).map_err(Fault::internal)?),
            None => None,
        };

        for processor in registry.processors() {
            if processor.handler.process(path, &mut content, request, response)? {
                tracing::info!(
                    module = %processor.descriptor.qualified_name,
                    "request handled by processor"
                );
                return Ok(());
            }
        }
        drop(content);

        match servable {
            Some(entry) => {
                let mut blob = provider.open_blob(&entry.blob).map_err(Fault::internal)?;
                io::copy(&mut blob, response).map_err(Fault::internal)?;
                response.set_status(200);
                tracing::info!(path, "served file directly");
                Ok(())
            }
            None => Err(Fault::not_found(NOT_FOUND_MESSAGE)),
        }
    }

    fn escalate(
        &self,
        registry: &HandlerRegistry,
        path: &str,
        request: &HandlerRequest,
        response: &mut HandlerResponse,
        fault: Fault,
    ) {
        if fault.code().is_client() {
            tracing::info!(code = fault.status_code(), "client fault: {}", fault);
        } else {
            match fault.cause() {
                Some(cause) => tracing::error!(code = fault.status_code(), "server fault: {} ({})", fault, cause),
                None => tracing::error!(code = fault.status_code(), "server fault: {}", fault),
            }
        }

        response.reset();
        for instance in registry.exception_handlers() {
            let module = &instance.descriptor.qualified_name;
            match guarded(|| instance.handler.handle(path, request, response, &fault)) {
                Ok(true) => {
                    tracing::info!(module = %module, "fault handled by exception handler");
                    return;
                }
                Ok(false) => {}
                Err(inner) => {
                    tracing::error!(module = %module, "exception handler failed: {}", inner);
                    error_page::render(response, &Fault::internal(inner));
                    return;
                }
            }
        }

        error_page::render(response, &fault);
    }
}
