//! Read-only catalogue of providers per task type
//!
//! Built once at startup through [`RegistryBuilder`] and shared behind an `Arc`.
//! Nothing mutates it afterwards, so reads need no locking.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::providers::Provider;
use crate::types::TaskType;

/// A registered backend
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    /// Lower runs first; ties keep registration order
    pub priority: u32,
    pub provider: Arc<dyn Provider>,
}

impl ProviderDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        priority: u32,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            priority,
            provider,
        }
    }
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Collects descriptors before freezing them into a [`ProviderRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<TaskType, Vec<ProviderDescriptor>>,
}

impl RegistryBuilder {
    pub fn register(mut self, task: TaskType, descriptor: ProviderDescriptor) -> Self {
        self.entries.entry(task).or_default().push(descriptor);
        self
    }

    pub fn build(mut self) -> ProviderRegistry {
        for (task, list) in self.entries.iter_mut() {
            // stable: equal priorities keep registration order
            list.sort_by_key(|d| d.priority);
            debug!(
                "Registered {} provider(s) for {}: {:?}",
                list.len(),
                task,
                list.iter().map(|d| d.id.as_str()).collect::<Vec<_>>()
            );
        }
        ProviderRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable per-task provider catalogue
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<TaskType, Vec<ProviderDescriptor>>,
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Fallback order for `task`. A registered `preferred` id moves to the
    /// front, the rest keep their order, and repeated ids are dropped.
    pub fn get_order(&self, task: TaskType, preferred: Option<&str>) -> Vec<&ProviderDescriptor> {
        let registered = self.providers(task);
        let front = preferred.and_then(|id| registered.iter().find(|d| d.id == id));

        let mut seen = HashSet::new();
        front
            .into_iter()
            .chain(registered.iter())
            .filter(|d| seen.insert(d.id.as_str()))
            .collect()
    }

    /// Providers for `task` in registered order, duplicates included
    pub fn providers(&self, task: TaskType) -> &[ProviderDescriptor] {
        self.entries.get(&task).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, task: TaskType, id: &str) -> bool {
        self.providers(task).iter().any(|d| d.id == id)
    }

    /// Number of distinct providers that can serve `task`
    pub fn len(&self, task: TaskType) -> usize {
        self.get_order(task, None).len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Task types with at least one provider, in stable order
    pub fn tasks(&self) -> Vec<TaskType> {
        self.entries
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(task, _)| *task)
            .collect()
    }
}
