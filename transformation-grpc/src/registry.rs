//! Transformation registry: read-mostly name to transformation lookup.
//!
//! A [`TransformationRegistry`] is an immutable snapshot built once through
//! [`RegistryBuilder`]. [`SharedRegistry`] holds the current snapshot and
//! swaps it whole; requests that already took a snapshot keep it until they
//! finish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::RegistryError;
use crate::transformation::{conv_rate_transform, Transformation};

/// Immutable mapping from transformation name to executable definition.
pub struct TransformationRegistry {
    project: String,
    transformations: HashMap<String, Arc<dyn Transformation>>,
}

impl TransformationRegistry {
    pub fn builder(project: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder {
            project: project.into(),
            transformations: Vec::new(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Exact-match lookup.
    ///
    /// An empty `project` matches the registry's own project; any other
    /// project name must equal it.
    pub fn lookup(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Arc<dyn Transformation>, RegistryError> {
        let not_found = || RegistryError::NotFound {
            name: name.to_string(),
            project: if project.is_empty() {
                self.project.clone()
            } else {
                project.to_string()
            },
        };

        if !project.is_empty() && project != self.project {
            return Err(not_found());
        }

        self.transformations
            .get(name)
            .map(Arc::clone)
            .ok_or_else(not_found)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transformations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }
}

impl fmt::Debug for TransformationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationRegistry")
            .field("project", &self.project)
            .field("transformations", &self.names())
            .finish()
    }
}

/// Collects transformations and validates names before freezing them.
pub struct RegistryBuilder {
    project: String,
    transformations: Vec<Arc<dyn Transformation>>,
}

impl RegistryBuilder {
    pub fn register<T: Transformation + 'static>(mut self, transformation: T) -> Self {
        self.transformations.push(Arc::new(transformation));
        self
    }

    pub fn register_arc(mut self, transformation: Arc<dyn Transformation>) -> Self {
        self.transformations.push(transformation);
        self
    }

    pub fn build(self) -> Result<TransformationRegistry, RegistryError> {
        let mut transformations = HashMap::with_capacity(self.transformations.len());

        for transformation in self.transformations {
            let name = transformation.name().to_string();
            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if transformations.insert(name.clone(), transformation).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }

        Ok(TransformationRegistry {
            project: self.project,
            transformations,
        })
    }
}

/// Registry holding the built-in transformations.
pub fn builtin_registry(project: impl Into<String>) -> Result<TransformationRegistry, RegistryError> {
    TransformationRegistry::builder(project)
        .register(conv_rate_transform())
        .build()
}

/// Current registry snapshot, replaceable as a whole.
#[derive(Clone)]
pub struct SharedRegistry {
    current: Arc<RwLock<Arc<TransformationRegistry>>>,
}

impl SharedRegistry {
    pub fn new(registry: TransformationRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    /// The snapshot to use for one request.
    pub fn snapshot(&self) -> Arc<TransformationRegistry> {
        self.current.read().clone()
    }

    /// Swap in a new snapshot, returning the previous one.
    pub fn replace(&self, registry: TransformationRegistry) -> Arc<TransformationRegistry> {
        let next = Arc::new(registry);
        info!(
            project = next.project(),
            transformations = next.len(),
            "Registry snapshot replaced"
        );
        std::mem::replace(&mut *self.current.write(), next)
    }
}

impl From<TransformationRegistry> for SharedRegistry {
    fn from(registry: TransformationRegistry) -> Self {
        Self::new(registry)
    }
}
