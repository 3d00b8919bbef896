//! # Handler Registry
//!
//! Instantiated handlers of one snapshot, in registry order, together with
//! the map from source path to the module declared there.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::handler::{Capabilities, Capability, Handler};
use crate::compiler::{ModuleDescriptor, ModuleLoader};

/// A constructed handler and the capabilities computed for it at load time
#[derive(Clone)]
pub struct HandlerInstance {
    pub descriptor: ModuleDescriptor,
    pub capabilities: Capabilities,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for HandlerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerInstance")
            .field("module", &self.descriptor.qualified_name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Registry of the handlers of one snapshot
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    /// Instances in descriptor order
    instances: Vec<HandlerInstance>,

    /// Module declared by each source path (first module wins)
    by_path: HashMap<String, ModuleDescriptor>,

    /// Instance index by qualified name
    by_name: HashMap<String, usize>,
}

impl HandlerRegistry {
    /// Registry with no modules
    pub fn empty() -> Self {
        Self::default()
    }

    /// Instantiate and classify every module a loader produced.
    /// Modules that fail to instantiate are logged and skipped.
    pub fn build(loader: &dyn ModuleLoader) -> Self {
        let mut registry = Self::empty();

        for descriptor in loader.descriptors() {
            registry
                .by_path
                .entry(descriptor.source_path.clone())
                .or_insert_with(|| descriptor.clone());

            match loader.instantiate(descriptor) {
                Ok(handler) => {
                    registry.insert(HandlerInstance {
                        descriptor: descriptor.clone(),
                        capabilities: handler.capabilities(),
                        handler,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        module = %descriptor.qualified_name,
                        path = %descriptor.source_path,
                        "skipping handler module: {}",
                        e
                    );
                }
            }
        }

        registry
    }

    fn insert(&mut self, instance: HandlerInstance) {
        self.by_name
            .insert(instance.descriptor.qualified_name.clone(), self.instances.len());
        self.instances.push(instance);
    }

    /// Module declared by a source path, capable or not
    pub fn module_for(&self, path: &str) -> Option<&ModuleDescriptor> {
        self.by_path.get(path)
    }

    /// Instance of a module by qualified name
    pub fn instance(&self, qualified_name: &str) -> Option<&HandlerInstance> {
        self.by_name.get(qualified_name).map(|&i| &self.instances[i])
    }

    /// Script bound to a path
    pub fn script_for(&self, path: &str) -> Option<&HandlerInstance> {
        let descriptor = self.module_for(path)?;
        self.instance(&descriptor.qualified_name)
            .filter(|instance| instance.capabilities.contains(Capability::Script))
    }

    fn with_capability(&self, capability: Capability) -> impl Iterator<Item = &HandlerInstance> {
        self.instances
            .iter()
            .filter(move |instance| instance.capabilities.contains(capability))
    }

    /// Processors in registry order
    pub fn processors(&self) -> impl Iterator<Item = &HandlerInstance> {
        self.with_capability(Capability::Processor)
    }

    /// Exception handlers in registry order
    pub fn exception_handlers(&self) -> impl Iterator<Item = &HandlerInstance> {
        self.with_capability(Capability::ExceptionHandler)
    }

    /// All instances in registry order
    pub fn instances(&self) -> &[HandlerInstance] {
        &self.instances
    }

    /// Number of source paths that declared a module
    pub fn module_count(&self) -> usize {
        self.by_path.len()
    }

    /// Number of instantiated handlers
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::InstantiationError;

    struct Tagged(Capabilities);

    impl Handler for Tagged {
        fn capabilities(&self) -> Capabilities {
            self.0
        }
    }

    /// Loader over a fixed list; `None` capabilities fail to instantiate
    struct FixedLoader {
        descriptors: Vec<ModuleDescriptor>,
        capabilities: Vec<Option<Capabilities>>,
    }

    impl FixedLoader {
        fn new(modules: Vec<(&str, &str, Option<Capabilities>)>) -> Self {
            Self {
                descriptors: modules
                    .iter()
                    .map(|(path, name, _)| ModuleDescriptor::new(*path, *name))
                    .collect(),
                capabilities: modules.into_iter().map(|(_, _, caps)| caps).collect(),
            }
        }
    }

    impl ModuleLoader for FixedLoader {
        fn descriptors(&self) -> &[ModuleDescriptor] {
            &self.descriptors
        }

        fn instantiate(
            &self,
            descriptor: &ModuleDescriptor,
        ) -> Result<Arc<dyn Handler>, InstantiationError> {
            let index = self
                .descriptors
                .iter()
                .position(|d| d == descriptor)
                .ok_or_else(|| InstantiationError::UnknownModule(descriptor.qualified_name.clone()))?;
            match self.capabilities[index] {
                Some(caps) => Ok(Arc::new(Tagged(caps))),
                None => Err(InstantiationError::Construction {
                    module: descriptor.qualified_name.clone(),
                    reason: "start trapped".into(),
                }),
            }
        }
    }

    fn caps(list: &[Capability]) -> Option<Capabilities> {
        Some(list.iter().fold(Capabilities::NONE, |c, &cap| c.with(cap)))
    }

    #[test]
    fn test_classification_and_order() {
        let loader = FixedLoader::new(vec![
            ("A.wat", "A", caps(&[Capability::Processor, Capability::ExceptionHandler])),
            ("B.wat", "B", caps(&[Capability::Script])),
            ("C.wat", "C", caps(&[Capability::Processor])),
        ]);
        let registry = HandlerRegistry::build(&loader);

        assert_eq!(registry.len(), 3);
        let processors: Vec<_> = registry
            .processors()
            .map(|i| i.descriptor.qualified_name.as_str())
            .collect();
        assert_eq!(processors, vec!["A", "C"]);
        assert_eq!(registry.exception_handlers().count(), 1);
        assert!(registry.script_for("B.wat").is_some());
        assert!(registry.script_for("A.wat").is_none());
    }

    #[test]
    fn test_plain_module_is_mapped_but_not_a_script() {
        let loader = FixedLoader::new(vec![("Plain.wat", "Plain", caps(&[]))]);
        let registry = HandlerRegistry::build(&loader);

        assert_eq!(registry.module_for("Plain.wat").unwrap().qualified_name, "Plain");
        assert!(registry.script_for("Plain.wat").is_none());
        assert_eq!(registry.processors().count(), 0);
    }

    #[test]
    fn test_failed_instantiation_is_skipped() {
        let loader = FixedLoader::new(vec![
            ("Bad.wat", "Bad", None),
            ("Good.wat", "Good", caps(&[Capability::Processor])),
        ]);
        let registry = HandlerRegistry::build(&loader);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.module_count(), 2);
        assert!(registry.module_for("Bad.wat").is_some());
        assert!(registry.instance("Bad").is_none());
    }

    #[test]
    fn test_first_module_of_a_file_owns_its_path() {
        let loader = FixedLoader::new(vec![
            ("Pair.wat", "Pair", caps(&[Capability::Script])),
            ("Pair.wat", "Pair$helper", caps(&[Capability::Processor])),
        ]);
        let registry = HandlerRegistry::build(&loader);

        assert_eq!(registry.script_for("Pair.wat").unwrap().descriptor.qualified_name, "Pair");
        assert_eq!(registry.processors().count(), 1);
    }

    #[test]
    fn test_empty() {
        let registry = HandlerRegistry::empty();
        assert!(registry.is_empty());
        assert!(registry.script_for("x").is_none());
    }
}
