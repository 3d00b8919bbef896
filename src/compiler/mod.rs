//! # Handler Compiler
//!
//! Turns the handler sources of a snapshot into loadable modules in a
//! single pass. The pass either succeeds as a whole or fails as a whole;
//! individual modules that later refuse to instantiate are skipped by the
//! loader's caller.

pub mod diagnostics;
pub mod errors;
pub mod host;
pub mod split;
pub mod wasm;

use std::sync::Arc;

use crate::handlers::Handler;

pub use diagnostics::{CountingSink, Diagnostic, DiagnosticSink, LoggingSink, Severity};
pub use errors::{CompileError, CompileResult, InstantiationError};
pub use wasm::WasmCompiler;

/// Suffix of handler source files
pub const HANDLER_SUFFIX: &str = ".wat";

/// A handler source file taken from a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub path: String,
    pub text: String,
}

impl SourceUnit {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// A module produced by a compile pass
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleDescriptor {
    /// Snapshot path of the source that declared the module
    pub source_path: String,

    /// Name other modules import it by, e.g. `lib.Strings`
    pub qualified_name: String,
}

impl ModuleDescriptor {
    pub fn new(source_path: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            qualified_name: qualified_name.into(),
        }
    }
}

/// Qualified name of the primary module declared by `path`:
/// the path without its suffix, with `/` replaced by `.`
pub fn qualified_name(path: &str) -> String {
    let stem = path.strip_suffix(HANDLER_SUFFIX).unwrap_or(path);
    stem.trim_start_matches('/').replace('/', ".")
}

/// Qualified name of a secondary module declared in the same file
pub fn nested_name(path: &str, id: Option<&str>, position: usize) -> String {
    match id {
        Some(id) => format!("{}${}", qualified_name(path), id),
        None => format!("{}${}", qualified_name(path), position),
    }
}

/// Compiles a batch of handler sources
pub trait SourceCompiler: Send + Sync {
    /// Compile every unit together. Diagnostics go to `sink`; any error
    /// diagnostic fails the whole batch.
    fn compile(
        &self,
        units: &[SourceUnit],
        sink: &mut dyn DiagnosticSink,
    ) -> CompileResult<Box<dyn ModuleLoader>>;

    /// Suffix identifying handler sources among snapshot entries
    fn suffix(&self) -> &str {
        HANDLER_SUFFIX
    }

    /// Compiler name for logging
    fn name(&self) -> &'static str;
}

/// Result of a successful compile pass
pub trait ModuleLoader: Send + Sync {
    /// Every produced module, in deterministic order
    fn descriptors(&self) -> &[ModuleDescriptor];

    /// Construct the handler for one module
    fn instantiate(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Arc<dyn Handler>, InstantiationError>;
}

/// Loader of an empty batch
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyLoader;

impl ModuleLoader for EmptyLoader {
    fn descriptors(&self) -> &[ModuleDescriptor] {
        &[]
    }

    fn instantiate(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Arc<dyn Handler>, InstantiationError> {
        Err(InstantiationError::UnknownModule(
            descriptor.qualified_name.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        assert_eq!(qualified_name("CallMe.wat"), "CallMe");
        assert_eq!(qualified_name("site/lib/Strings.wat"), "site.lib.Strings");
        assert_eq!(qualified_name("/Lead.wat"), "Lead");
    }

    #[test]
    fn test_nested_name() {
        assert_eq!(nested_name("a/B.wat", Some("inner"), 2), "a.B$inner");
        assert_eq!(nested_name("a/B.wat", None, 3), "a.B$3");
    }

    #[test]
    fn test_empty_loader() {
        let loader = EmptyLoader;
        assert!(loader.descriptors().is_empty());
        assert!(loader
            .instantiate(&ModuleDescriptor::new("a.wat", "a"))
            .is_err());
    }
}
