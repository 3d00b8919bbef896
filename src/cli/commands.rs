//! CLI command implementations

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::compiler::{Diagnostic, SourceCompiler, WasmCompiler};
use crate::config::Config;
use crate::dispatch::cache::collect_sources;
use crate::dispatch::RequestDispatcher;
use crate::handlers::HandlerRegistry;
use crate::http_server::{HttpServer, HttpServerConfig};
use crate::snapshot::{GitCliProvider, ReferenceResolver, SnapshotProvider};
use crate::telemetry;

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config, port } => serve(&config, port),
        Command::Check { config, reference } => check(&config, reference.as_deref()),
    }
}

fn load_config(config_path: &Path) -> CliResult<Config> {
    let config = Config::load(config_path)?;
    telemetry::init(&config.log_filter).map_err(|e| CliError::boot_failed(e.to_string()))?;
    Ok(config)
}

/// Resolver for the configured reference and alternate reference
pub fn resolver(config: &Config, provider: Arc<dyn SnapshotProvider>) -> ReferenceResolver {
    let resolver = ReferenceResolver::new(provider, config.reference.as_str());
    match config.alternate_reference() {
        Some(alternate) => resolver.with_alternate(alternate),
        None => resolver,
    }
}

/// Dispatcher over the configured git repository
pub fn build_dispatcher(config: &Config) -> CliResult<RequestDispatcher> {
    let provider: Arc<dyn SnapshotProvider> = Arc::new(GitCliProvider::new(&config.repository));
    Ok(RequestDispatcher::new(
        resolver(config, provider),
        Arc::new(WasmCompiler::new()),
        config.exclude_rules()?,
        config.cache_capacity()?,
    ))
}

/// Start the HTTP server
///
/// The configured reference must resolve before the server binds; its
/// snapshot is compiled up front.
pub fn serve(config_path: &Path, port: Option<u16>) -> CliResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.port = port;
    }

    let dispatcher = Arc::new(build_dispatcher(&config)?);
    let set = dispatcher
        .warm()
        .map_err(|fault| CliError::snapshot_error(fault.to_string()))?;
    tracing::info!(
        repository = %config.repository.display(),
        reference = %config.reference,
        snapshot = %set.snapshot(),
        outcome = %set.outcome(),
        handlers = set.registry().len(),
        "snapshot ready"
    );

    let server = HttpServer::new(HttpServerConfig::from(&config), dispatcher);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        server
            .start()
            .await
            .map_err(|e| CliError::boot_failed(format!("HTTP server failed: {}", e)))
    })?;

    Ok(())
}

/// One handler in a check report
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HandlerSummary {
    pub module: String,
    pub path: String,
    pub capabilities: String,
}

/// Outcome of compiling one snapshot's handlers
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub snapshot: String,
    pub sources: usize,
    pub errors: usize,
    pub diagnostics: Vec<String>,
    pub handlers: Vec<HandlerSummary>,
}

impl CheckReport {
    pub fn failed(&self) -> bool {
        self.errors > 0
    }
}

/// Resolve, collect and compile one snapshot the way the server would
pub fn check_snapshot(
    resolver: &ReferenceResolver,
    compiler: &dyn SourceCompiler,
) -> CliResult<CheckReport> {
    let provider = resolver.provider().as_ref();
    let snapshot = resolver
        .resolve()
        .map_err(|e| CliError::snapshot_error(e.to_string()))?;
    let units = collect_sources(provider, &snapshot, compiler.suffix())
        .map_err(|e| CliError::snapshot_error(e.to_string()))?;

    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let handlers = if units.is_empty() {
        Vec::new()
    } else {
        match compiler.compile(&units, &mut diagnostics) {
            Ok(loader) => HandlerRegistry::build(loader.as_ref())
                .instances()
                .iter()
                .map(|instance| HandlerSummary {
                    module: instance.descriptor.qualified_name.clone(),
                    path: instance.descriptor.source_path.clone(),
                    capabilities: instance.capabilities.to_string(),
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    };

    Ok(CheckReport {
        snapshot: snapshot.to_string(),
        sources: units.len(),
        errors: diagnostics.iter().filter(|d| d.is_error()).count(),
        diagnostics: diagnostics.iter().map(Diagnostic::to_string).collect(),
        handlers,
    })
}

/// Compile the handlers of the configured (or given) reference and print
/// the report as JSON
pub fn check(config_path: &Path, reference: Option<&str>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let provider: Arc<dyn SnapshotProvider> = Arc::new(GitCliProvider::new(&config.repository));
    let resolver = match reference {
        Some(reference) => ReferenceResolver::new(provider, reference),
        None => resolver(&config, provider),
    };

    let report = check_snapshot(&resolver, &WasmCompiler::new())?;
    write_response(&mut io::stdout(), serde_json::to_value(&report)?)?;

    if report.failed() {
        return Err(CliError::compile_failed(report.errors));
    }
    Ok(())
}

/// Write a success response
pub fn write_response(out: &mut impl Write, data: Value) -> CliResult<()> {
    let response = json!({
        "status": "ok",
        "data": data
    });

    serde_json::to_writer(&mut *out, &response)?;
    writeln!(out)?;
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshots;

    const SCRIPT: &str = "(module (func (export \"execute\")))";

    fn memory_resolver(files: Vec<(&str, &str)>) -> ReferenceResolver {
        let store = Arc::new(MemorySnapshots::new());
        store.commit("HEAD", files);
        ReferenceResolver::new(store, "HEAD")
    }

    #[test]
    fn test_check_reports_handlers() {
        let resolver = memory_resolver(vec![("Hello.wat", SCRIPT), ("index.html", "")]);
        let report = check_snapshot(&resolver, &WasmCompiler::new()).unwrap();

        assert!(!report.failed());
        assert_eq!(report.sources, 1);
        assert_eq!(
            report.handlers,
            vec![HandlerSummary {
                module: "Hello".into(),
                path: "Hello.wat".into(),
                capabilities: "script".into(),
            }]
        );
    }

    #[test]
    fn test_check_reports_errors() {
        let resolver = memory_resolver(vec![("Broken.wat", "(module (func (export \"execute\") (i32.const 1)))")]);
        let report = check_snapshot(&resolver, &WasmCompiler::new()).unwrap();

        assert!(report.failed());
        assert!(report.handlers.is_empty());
        assert!(report.diagnostics.iter().any(|d| d.starts_with("Broken.wat")));
    }

    #[test]
    fn test_check_unknown_reference() {
        let store = Arc::new(MemorySnapshots::new());
        let resolver = ReferenceResolver::new(store, "HEAD");
        let err = check_snapshot(&resolver, &WasmCompiler::new()).unwrap_err();
        assert_eq!(err.code_str(), "TREESERVE_CLI_SNAPSHOT_ERROR");
    }

    #[test]
    fn test_resolver_honours_stash() {
        let store = Arc::new(MemorySnapshots::new());
        store.commit("HEAD", vec![("a.txt", "head")]);
        let stash = store.commit("refs/stash", vec![("a.txt", "stash")]);

        let mut config = Config::new("unused");
        config.allow_stash = true;
        assert_eq!(resolver(&config, store.clone()).resolve().unwrap(), stash);

        config.allow_stash = false;
        assert_ne!(resolver(&config, store).resolve().unwrap(), stash);
    }

    #[test]
    fn test_write_response() {
        let mut out = Vec::new();
        write_response(&mut out, json!({"sources": 2})).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"data\":{\"sources\":2},\"status\":\"ok\"}\n"
        );
    }
}
