use parking_lot::RwLock;
use shared::types::Instance;

/// All currently known instances of one service name.
///
/// Membership is an ordered list. Duplicate identities are kept out by
/// explicit checks, and every read hands out owned copies.
#[derive(Debug)]
pub struct Service {
    name: String,
    instances: RwLock<Vec<Instance>>,
}

impl Service {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.instances.read().clone()
    }

    pub fn get(&self, identity: &str) -> Option<Instance> {
        self.instances
            .read()
            .iter()
            .find(|instance| instance.identity() == identity)
            .cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.instances
            .read()
            .iter()
            .any(|instance| instance.identity() == identity)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Replace the instance with the same identity in place, or append it.
    /// Returns the replaced instance.
    pub(crate) fn upsert(&self, instance: Instance) -> Option<Instance> {
        let identity = instance.identity();
        let mut instances = self.instances.write();
        match instances.iter_mut().find(|existing| existing.identity() == identity) {
            Some(existing) => Some(std::mem::replace(existing, instance)),
            None => {
                instances.push(instance);
                None
            }
        }
    }

    pub(crate) fn remove(&self, identity: &str) -> Option<Instance> {
        let mut instances = self.instances.write();
        let pos = instances
            .iter()
            .position(|instance| instance.identity() == identity)?;
        Some(instances.remove(pos))
    }
}
