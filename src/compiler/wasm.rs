//! # WebAssembly Compiler
//!
//! Compiles handler sources written in the WebAssembly text format with
//! wasmtime. All sources of a snapshot share one engine and are checked
//! together: a module may import another module's exports by its qualified
//! name, and a broken module fails the whole batch.
//!
//! A module's capabilities follow from its exports:
//!
//! | export    | signature  | capability       |
//! |-----------|------------|------------------|
//! | `execute` | `() -> ()` | script           |
//! | `process` | `() -> i32`| processor        |
//! | `handle`  | `() -> i32`| exception handler|

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use wasmtime::{Engine, ExternType, FuncType, Instance, Linker, Module, Store, ValType, WasmResults};

use super::diagnostics::{CountingSink, Diagnostic, DiagnosticSink};
use super::errors::{CompileError, CompileResult, InstantiationError};
use super::host::{host_linker, FaultView, HostState, HOST_FUNCTIONS, HOST_MODULE};
use super::split::{split_modules, ModuleSource};
use super::{nested_name, qualified_name, EmptyLoader, ModuleDescriptor, ModuleLoader, SourceCompiler, SourceUnit};
use crate::handlers::{
    Capabilities, Capability, Fault, FaultCode, FaultResult, Handler, HandlerRequest, HandlerResponse,
};
use crate::snapshot::ContentStream;

const EXECUTE_EXPORT: &str = "execute";
const PROCESS_EXPORT: &str = "process";
const HANDLE_EXPORT: &str = "handle";

/// Compiler for `.wat` handler sources
#[derive(Clone, Default)]
pub struct WasmCompiler {
    engine: Engine,
}

impl WasmCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing engine
    pub fn with_engine(engine: Engine) -> Self {
        Self { engine }
    }
}

/// A module that parsed and validated
struct CompiledModule {
    descriptor: ModuleDescriptor,
    module: Module,
}

fn position_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-->\s*[^\n]*?:(\d+):(\d+)").expect("static pattern"))
}

/// Turn a wasmtime parse/validation error into a positioned diagnostic
fn module_error(path: &str, source: &ModuleSource<'_>, error: &wasmtime::Error) -> Diagnostic {
    let text = format!("{:#}", error);
    let message = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("invalid module")
        .to_string();

    let diagnostic = Diagnostic::error(path, message);
    match position_pattern().captures(&text) {
        Some(caps) => {
            let line = caps[1].parse().unwrap_or(1);
            let column = caps[2].parse().unwrap_or(1);
            let (line, column) = source.remap(line, column);
            diagnostic.at(line, column)
        }
        None => diagnostic,
    }
}

fn signature_matches(func: &FuncType, returns_flag: bool) -> bool {
    if func.params().len() != 0 {
        return false;
    }
    let results: Vec<ValType> = func.results().collect();
    matches!(
        (returns_flag, results.as_slice()),
        (false, []) | (true, [ValType::I32])
    )
}

/// Capabilities from a module's exports; wrong signatures are warned about
fn analyze_exports(compiled: &CompiledModule, sink: &mut dyn DiagnosticSink) -> Capabilities {
    let path = &compiled.descriptor.source_path;
    let name = &compiled.descriptor.qualified_name;
    let mut capabilities = Capabilities::NONE;

    for export in compiled.module.exports() {
        let ExternType::Func(func) = export.ty() else {
            continue;
        };
        let (capability, returns_flag, expected) = match export.name() {
            EXECUTE_EXPORT => (Capability::Script, false, "() -> ()"),
            PROCESS_EXPORT => (Capability::Processor, true, "() -> i32"),
            HANDLE_EXPORT => (Capability::ExceptionHandler, true, "() -> i32"),
            _ => continue,
        };
        if signature_matches(&func, returns_flag) {
            capabilities = capabilities.with(capability);
        } else {
            sink.report(Diagnostic::warning(
                path.as_str(),
                format!(
                    "export `{}` of module {} must have signature {}; ignored",
                    export.name(),
                    name,
                    expected
                ),
            ));
        }
    }
    capabilities
}

/// Depth-first dependency order of `root`, excluding `root` itself.
/// Returns the offending chain when an import cycle is reached.
fn dependency_order(graph: &HashMap<String, Vec<String>>, root: &str) -> Result<Vec<String>, Vec<String>> {
    fn visit(
        name: &str,
        graph: &HashMap<String, Vec<String>>,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), Vec<String>> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = visiting.iter().position(|n| n == name) {
            let mut cycle = visiting[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(cycle);
        }

        visiting.push(name.to_string());
        for dependency in graph.get(name).map(Vec::as_slice).unwrap_or_default() {
            visit(dependency, graph, visiting, done, order)?;
        }
        visiting.pop();

        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    let mut order = Vec::new();
    visit(root, graph, &mut Vec::new(), &mut HashSet::new(), &mut order)?;
    order.pop();
    Ok(order)
}

impl SourceCompiler for WasmCompiler {
    fn compile(
        &self,
        units: &[SourceUnit],
        sink: &mut dyn DiagnosticSink,
    ) -> CompileResult<Box<dyn ModuleLoader>> {
        if units.is_empty() {
            return Ok(Box::new(EmptyLoader));
        }

        let mut sink = CountingSink::new(sink);
        let mut ordered: Vec<&SourceUnit> = units.iter().collect();
        ordered.sort_by(|a, b| a.path.cmp(&b.path));

        // 1. Parse and validate every module
        let mut compiled: Vec<CompiledModule> = Vec::new();
        let mut names: HashSet<String> = HashSet::new();
        for unit in ordered {
            tracing::debug!(path = %unit.path, "compiling handler source");
            for (index, source) in split_modules(&unit.text).iter().enumerate() {
                let name = if index == 0 {
                    qualified_name(&unit.path)
                } else {
                    nested_name(&unit.path, source.id.as_deref(), index + 1)
                };

                if name == HOST_MODULE {
                    sink.report(
                        Diagnostic::error(unit.path.as_str(), "module name `host` is reserved")
                            .at(source.line, source.column),
                    );
                    continue;
                }
                if !names.insert(name.clone()) {
                    sink.report(
                        Diagnostic::error(unit.path.as_str(), format!("duplicate module name {}", name))
                            .at(source.line, source.column),
                    );
                    continue;
                }

                match Module::new(&self.engine, source.text) {
                    Ok(module) => compiled.push(CompiledModule {
                        descriptor: ModuleDescriptor::new(unit.path.as_str(), name),
                        module,
                    }),
                    Err(e) => sink.report(module_error(&unit.path, source, &e)),
                }
            }
        }

        // 2. Resolve imports across the batch
        let by_name: HashMap<&str, &CompiledModule> = compiled
            .iter()
            .map(|c| (c.descriptor.qualified_name.as_str(), c))
            .collect();
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        let mut imported: HashSet<String> = HashSet::new();

        for module in &compiled {
            let path = module.descriptor.source_path.as_str();
            let name = module.descriptor.qualified_name.as_str();
            let mut dependencies: Vec<String> = Vec::new();

            for import in module.module.imports() {
                if import.module() == HOST_MODULE {
                    if !HOST_FUNCTIONS.contains(&import.name()) {
                        sink.report(Diagnostic::error(
                            path,
                            format!("module {} imports unknown host function `{}`", name, import.name()),
                        ));
                    }
                    continue;
                }

                match by_name.get(import.module()) {
                    None => sink.report(Diagnostic::error(
                        path,
                        format!("module {} imports from unknown module `{}`", name, import.module()),
                    )),
                    Some(target) if target.module.get_export(import.name()).is_none() => {
                        sink.report(Diagnostic::error(
                            path,
                            format!(
                                "module {} imports `{}` which module {} does not export",
                                name,
                                import.name(),
                                import.module()
                            ),
                        ))
                    }
                    Some(_) => {
                        imported.insert(import.module().to_string());
                        if !dependencies.iter().any(|d| d == import.module()) {
                            dependencies.push(import.module().to_string());
                        }
                    }
                }
            }
            graph.insert(name.to_string(), dependencies);
        }

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut reported_cycles: HashSet<String> = HashSet::new();
        for module in &compiled {
            let name = &module.descriptor.qualified_name;
            match dependency_order(&graph, name) {
                Ok(order) => {
                    dependencies.insert(name.clone(), order);
                }
                Err(cycle) => {
                    let chain = cycle.join(" -> ");
                    if reported_cycles.insert(chain.clone()) {
                        sink.report(Diagnostic::error(
                            module.descriptor.source_path.as_str(),
                            format!("import cycle: {}", chain),
                        ));
                    }
                }
            }
        }

        // 3. Classify
        let mut capabilities: HashMap<String, Capabilities> = HashMap::new();
        for module in &compiled {
            let name = &module.descriptor.qualified_name;
            let caps = analyze_exports(module, &mut sink);
            if caps.is_empty() && !imported.contains(name) {
                sink.report(Diagnostic::warning(
                    module.descriptor.source_path.as_str(),
                    format!("module {} exports no handler entry point", name),
                ));
            }
            sink.report(Diagnostic::note(
                module.descriptor.source_path.as_str(),
                format!("module {} compiled with capabilities: {}", name, caps),
            ));
            capabilities.insert(name.clone(), caps);
        }

        if sink.errors() > 0 {
            return Err(CompileError::Failed {
                errors: sink.errors(),
            });
        }

        let linker = host_linker(&self.engine).map_err(|e| CompileError::Engine(format!("{:#}", e)))?;
        let modules: HashMap<String, Module> = compiled
            .iter()
            .map(|c| (c.descriptor.qualified_name.clone(), c.module.clone()))
            .collect();

        Ok(Box::new(WasmModuleLoader {
            engine: self.engine.clone(),
            linker: Arc::new(linker),
            descriptors: compiled.iter().map(|c| c.descriptor.clone()).collect(),
            modules,
            dependencies,
            capabilities,
        }))
    }

    fn name(&self) -> &'static str {
        "wasm"
    }
}

/// Loader over a successfully compiled batch
pub struct WasmModuleLoader {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    descriptors: Vec<ModuleDescriptor>,
    modules: HashMap<String, Module>,
    dependencies: HashMap<String, Vec<String>>,
    capabilities: HashMap<String, Capabilities>,
}

impl ModuleLoader for WasmModuleLoader {
    fn descriptors(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    fn instantiate(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Arc<dyn Handler>, InstantiationError> {
        let name = &descriptor.qualified_name;
        let unknown = || InstantiationError::UnknownModule(name.clone());

        let module = self.modules.get(name).ok_or_else(unknown)?.clone();
        let mut chain = Vec::new();
        for dependency in self.dependencies.get(name).ok_or_else(unknown)? {
            let dependency_module = self.modules.get(dependency).ok_or_else(unknown)?;
            chain.push((dependency.clone(), dependency_module.clone()));
        }

        let handler = WasmHandler {
            name: name.clone(),
            engine: self.engine.clone(),
            linker: Arc::clone(&self.linker),
            module,
            dependencies: chain,
            capabilities: self.capabilities.get(name).copied().unwrap_or_default(),
        };

        // Trial construction: resolves imports and runs `start`
        let mut store = Store::new(&self.engine, HostState::detached(name.as_str()));
        handler
            .instantiate(&mut store)
            .map_err(|e| InstantiationError::Construction {
                module: name.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(Arc::new(handler))
    }
}

/// Handler backed by a compiled module; every call runs in a fresh store
pub struct WasmHandler {
    name: String,
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    module: Module,
    dependencies: Vec<(String, Module)>,
    capabilities: Capabilities,
}

impl WasmHandler {
    fn instantiate(&self, store: &mut Store<HostState>) -> wasmtime::Result<Instance> {
        if self.dependencies.is_empty() {
            return self.linker.instantiate(&mut *store, &self.module);
        }

        let mut linker = (*self.linker).clone();
        for (name, module) in &self.dependencies {
            let instance = linker.instantiate(&mut *store, module)?;
            linker.instance(&mut *store, name, instance)?;
        }
        linker.instantiate(&mut *store, &self.module)
    }

    fn invoke<R: WasmResults>(&self, entry: &str, state: HostState) -> (HostState, FaultResult<R>) {
        let mut store = Store::new(&self.engine, state);
        let outcome = self.instantiate(&mut store).and_then(|instance| {
            let func = instance.get_typed_func::<(), R>(&mut store, entry)?;
            func.call(&mut store, ())
        });
        let state = store.into_data();
        (state, outcome.map_err(|e| self.fault_from(e)))
    }

    fn fault_from(&self, error: wasmtime::Error) -> Fault {
        match error.downcast::<Fault>() {
            Ok(fault) => fault,
            Err(other) => Fault::with_message(
                FaultCode::InternalError,
                format!("handler {} failed: {:#}", self.name, other),
            ),
        }
    }
}

impl Handler for WasmHandler {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn execute(
        &self,
        path: &str,
        request: &HandlerRequest,
        response: &mut HandlerResponse,
    ) -> FaultResult<()> {
        let mut state = HostState::new(self.name.as_str(), path, request.clone());
        state.response = std::mem::take(response);

        let (state, outcome) = self.invoke::<()>(EXECUTE_EXPORT, state);
        *response = state.response;
        outcome
    }

    fn process(
        &self,
        path: &str,
        content: &mut Option<ContentStream>,
        request: &HandlerRequest,
        response: &mut HandlerResponse,
    ) -> FaultResult<bool> {
        let mut state = HostState::new(self.name.as_str(), path, request.clone());
        state.response = std::mem::take(response);
        state.content = content.take();

        let (mut state, outcome) = self.invoke::<i32>(PROCESS_EXPORT, state);
        *content = state.content.take();
        *response = state.response;
        outcome.map(|handled| handled != 0)
    }

    fn handle(
        &self,
        path: &str,
        request: &HandlerRequest,
        response: &mut HandlerResponse,
        fault: &Fault,
    ) -> FaultResult<bool> {
        let mut state = HostState::new(self.name.as_str(), path, request.clone());
        state.response = std::mem::take(response);
        state.fault = Some(FaultView::from(fault));

        let (state, outcome) = self.invoke::<i32>(HANDLE_EXPORT, state);
        *response = state.response;
        outcome.map(|handled| handled != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
(module
  (import "host" "response_write" (func $write (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "hello")
  (func (export "execute")
    (call $write (i32.const 0) (i32.const 5))))
"#;

    fn compile(units: &[SourceUnit]) -> (CompileResult<Box<dyn ModuleLoader>>, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let result = WasmCompiler::new().compile(units, &mut diagnostics);
        (result, diagnostics)
    }

    fn errors(diagnostics: &[Diagnostic]) -> Vec<&Diagnostic> {
        diagnostics.iter().filter(|d| d.is_error()).collect()
    }

    #[test]
    fn test_empty_batch() {
        let (result, diagnostics) = compile(&[]);
        assert!(result.unwrap().descriptors().is_empty());
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_script_capability() {
        let (result, _) = compile(&[SourceUnit::new("site/Hello.wat", SCRIPT)]);
        let loader = result.unwrap();

        assert_eq!(
            loader.descriptors(),
            &[ModuleDescriptor::new("site/Hello.wat", "site.Hello")]
        );
        let handler = loader.instantiate(&loader.descriptors()[0]).unwrap();
        assert!(handler.capabilities().script);
        assert!(!handler.capabilities().processor);

        let mut response = HandlerResponse::new();
        handler
            .execute("site/Hello.wat", &HandlerRequest::get("/site/Hello.wat"), &mut response)
            .unwrap();
        assert_eq!(response.body_text(), "hello");
    }

    #[test]
    fn test_syntax_error_has_position() {
        let source = "(module\n  (func (export \"execute\")\n    (call $missing)))";
        let (result, diagnostics) = compile(&[SourceUnit::new("Broken.wat", source)]);

        assert!(matches!(result, Err(CompileError::Failed { errors: 1 })));
        let errors = errors(&diagnostics);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source_path, "Broken.wat");
        assert_eq!(errors[0].line, Some(3));
    }

    #[test]
    fn test_one_bad_source_fails_the_batch() {
        let (result, diagnostics) = compile(&[
            SourceUnit::new("Good.wat", SCRIPT),
            SourceUnit::new("Bad.wat", "(module (func (export \"execute\") (i32.const 1)))"),
        ]);
        assert!(result.is_err());
        assert!(!errors(&diagnostics).is_empty());
    }

    #[test]
    fn test_wrong_signature_is_warning() {
        let source = "(module (func (export \"process\")))";
        let (result, diagnostics) = compile(&[SourceUnit::new("Odd.wat", source)]);

        let loader = result.unwrap();
        let handler = loader.instantiate(&loader.descriptors()[0]).unwrap();
        assert!(handler.capabilities().is_empty());
        assert!(diagnostics
            .iter()
            .any(|d| d.severity == super::super::Severity::Warning && d.message.contains("process")));
    }

    #[test]
    fn test_unknown_import_module() {
        let source = "(module (import \"lib.Missing\" \"f\" (func)))";
        let (result, diagnostics) = compile(&[SourceUnit::new("Uses.wat", source)]);
        assert!(result.is_err());
        assert!(errors(&diagnostics)[0].message.contains("lib.Missing"));
    }

    #[test]
    fn test_unknown_host_function() {
        let source = "(module (import \"host\" \"launch_missiles\" (func)))";
        let (result, diagnostics) = compile(&[SourceUnit::new("Uses.wat", source)]);
        assert!(result.is_err());
        assert!(errors(&diagnostics)[0].message.contains("launch_missiles"));
    }

    #[test]
    fn test_import_cycle() {
        let a = "(module (import \"B\" \"f\" (func)) (func (export \"f\")))";
        let b = "(module (import \"A\" \"f\" (func)) (func (export \"f\")))";
        let (result, diagnostics) = compile(&[SourceUnit::new("A.wat", a), SourceUnit::new("B.wat", b)]);

        assert!(result.is_err());
        assert!(errors(&diagnostics)
            .iter()
            .any(|d| d.message.starts_with("import cycle")));
    }

    #[test]
    fn test_cross_module_import() {
        let lib = r#"
(module
  (import "host" "response_write" (func $write (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "from lib")
  (func (export "greet")
    (call $write (i32.const 0) (i32.const 8))))
"#;
        let main = r#"
(module
  (import "lib.Greeter" "greet" (func $greet))
  (func (export "execute") (call $greet)))
"#;
        let (result, _) = compile(&[
            SourceUnit::new("Main.wat", main),
            SourceUnit::new("lib/Greeter.wat", lib),
        ]);
        let loader = result.unwrap();
        let main = loader
            .descriptors()
            .iter()
            .find(|d| d.qualified_name == "Main")
            .unwrap()
            .clone();
        let handler = loader.instantiate(&main).unwrap();

        let mut response = HandlerResponse::new();
        handler
            .execute("Main.wat", &HandlerRequest::get("/Main.wat"), &mut response)
            .unwrap();
        assert_eq!(response.body_text(), "from lib");
    }

    #[test]
    fn test_nested_modules() {
        let source = "(module $first (func (export \"execute\")))\n(module $second (func (export \"process\") (result i32) (i32.const 0)))";
        let (result, _) = compile(&[SourceUnit::new("pkg/Pair.wat", source)]);
        let loader = result.unwrap();

        let names: Vec<_> = loader
            .descriptors()
            .iter()
            .map(|d| d.qualified_name.as_str())
            .collect();
        assert_eq!(names, vec!["pkg.Pair", "pkg.Pair$second"]);
    }

    #[test]
    fn test_failing_start_skips_instance() {
        let source = "(module (func $boom unreachable) (start $boom) (func (export \"execute\")))";
        let (result, _) = compile(&[SourceUnit::new("Boom.wat", source)]);
        let loader = result.unwrap();

        let err = loader.instantiate(&loader.descriptors()[0]).err().unwrap();
        assert!(matches!(err, InstantiationError::Construction { .. }));
    }

    #[test]
    fn test_raise_becomes_fault() {
        let source = r#"
(module
  (import "host" "raise" (func $raise (param i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "nope")
  (func (export "process") (result i32)
    (call $raise (i32.const 403) (i32.const 0) (i32.const 4))
    (i32.const 1)))
"#;
        let (result, _) = compile(&[SourceUnit::new("Guard.wat", source)]);
        let loader = result.unwrap();
        let handler = loader.instantiate(&loader.descriptors()[0]).unwrap();

        let mut response = HandlerResponse::new();
        let fault = handler
            .process("x", &mut None, &HandlerRequest::get("/x"), &mut response)
            .unwrap_err();
        assert_eq!(fault.code(), FaultCode::Forbidden);
        assert_eq!(fault.message(), Some("nope"));
    }

    #[test]
    fn test_trap_becomes_internal_fault() {
        let source = "(module (func (export \"execute\") unreachable))";
        let (result, _) = compile(&[SourceUnit::new("Trap.wat", source)]);
        let loader = result.unwrap();
        let handler = loader.instantiate(&loader.descriptors()[0]).unwrap();

        let fault = handler
            .execute("Trap.wat", &HandlerRequest::get("/Trap.wat"), &mut HandlerResponse::new())
            .unwrap_err();
        assert_eq!(fault.status_code(), 500);
    }

    #[test]
    fn test_dependency_order() {
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec!["b".to_string(), "c".to_string()]);
        graph.insert("b".to_string(), vec!["c".to_string()]);
        graph.insert("c".to_string(), vec![]);

        assert_eq!(dependency_order(&graph, "a").unwrap(), vec!["c", "b"]);
        assert!(dependency_order(&graph, "c").unwrap().is_empty());

        graph.insert("c".to_string(), vec!["a".to_string()]);
        assert_eq!(dependency_order(&graph, "a").unwrap_err(), vec!["a", "b", "c", "a"]);
    }
}
