//! Stage registration and priority resolution.
//!
//! Each stage type enrolls a [`Registrar`] carrying a position key, a priority
//! and a factory. The [`Registry`] keeps the surviving registrars ordered by
//! (position key, creation order); that order is the pipeline order.
//!
//! # Resolution
//!
//! When a priority-resolved registrar with priority `p` enrolls:
//!
//! 1. `max` = highest priority among `p` and all surviving resolved registrars.
//! 2. Every surviving resolved registrar with priority `< p` is evicted.
//! 3. The new registrar is kept only if `p >= max`.
//!
//! So the highest-priority registrations win, ties all survive, and a late
//! lower-priority registration is ignored. Unconditional registrars take no
//! part in resolution and always survive.

use crate::pipeline::error::{ChainError, ChainResult};
use crate::pipeline::stage::Stage;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Where a new stage instance is placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Path of the owning chain; empty for the root chain.
    pub chain_path: String,
    pub position: String,
    /// Creation id of the registrar that produced the stage.
    pub instance: u64,
}

/// Creates one stage instance.
pub type StageFactory = Arc<dyn Fn(&Placement) -> Box<dyn Stage> + Send + Sync>;

/// Registration record of one stage type.
#[derive(Clone)]
pub struct Registrar {
    position: String,
    priority: i32,
    instance: u64,
    type_name: &'static str,
    /// Whether the registrar takes part in priority resolution.
    auto_evict: bool,
    factory: StageFactory,
}

impl Registrar {
    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn auto_evict(&self) -> bool {
        self.auto_evict
    }

    pub fn placement(&self, chain_path: &str) -> Placement {
        Placement {
            chain_path: chain_path.to_string(),
            position: self.position.clone(),
            instance: self.instance,
        }
    }

    /// Create a new stage at `placement`.
    pub fn create(&self, placement: &Placement) -> Box<dyn Stage> {
        (self.factory)(placement)
    }

    fn sort_key(&self) -> (&str, u64) {
        (&self.position, self.instance)
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("position", &self.position)
            .field("priority", &self.priority)
            .field("instance", &self.instance)
            .field("type_name", &self.type_name)
            .field("auto_evict", &self.auto_evict)
            .finish()
    }
}

/// Short name of a stage type: the last path segment, generics stripped.
pub fn short_type_name<S: ?Sized>() -> &'static str {
    let full = std::any::type_name::<S>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// The set of surviving registrars.
#[derive(Default)]
pub struct Registry {
    registrars: Vec<Registrar>,
    created: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a registrar. With `auto_evict`, the registrar takes part in
    /// priority resolution; otherwise it always survives.
    ///
    /// Returns the registrar's creation id.
    pub fn register(
        &mut self,
        position: impl Into<String>,
        priority: i32,
        type_name: &'static str,
        factory: StageFactory,
        auto_evict: bool,
    ) -> u64 {
        let instance = self.next_instance();
        let registrar = Registrar {
            position: position.into(),
            priority,
            instance,
            type_name,
            auto_evict,
            factory,
        };

        if auto_evict {
            let max_priority = self
                .registrars
                .iter()
                .filter(|r| r.auto_evict)
                .map(|r| r.priority)
                .fold(priority, i32::max);
            let before = self.registrars.len();
            self.registrars
                .retain(|r| !r.auto_evict || r.priority >= priority);
            let evicted = before - self.registrars.len();
            if evicted > 0 {
                tracing::debug!(
                    "Registrar {} at {} (priority {}) evicted {} registrar(s)",
                    type_name,
                    registrar.position,
                    priority,
                    evicted
                );
            }
            if priority < max_priority {
                tracing::debug!(
                    "Registrar {} at {} ignored: priority {} below {}",
                    type_name,
                    registrar.position,
                    priority,
                    max_priority
                );
                return instance;
            }
        }

        self.insert(registrar);
        instance
    }

    /// Enroll a stage type constructed through `Default`-like `make`.
    pub fn register_stage<S, F>(&mut self, position: &str, priority: i32, make: F) -> u64
    where
        S: Stage + 'static,
        F: Fn(&Placement) -> S + Send + Sync + 'static,
    {
        self.register(
            position,
            priority,
            short_type_name::<S>(),
            Arc::new(move |placement: &Placement| Box::new(make(placement)) as Box<dyn Stage>),
            true,
        )
    }

    /// Enroll a registrar that never takes part in priority resolution.
    /// Without a position, the key is the creation id in 8-digit hex.
    pub fn register_unconditional<S, F>(&mut self, position: Option<&str>, make: F) -> u64
    where
        S: Stage + 'static,
        F: Fn(&Placement) -> S + Send + Sync + 'static,
    {
        let position = match position {
            Some(p) => p.to_string(),
            None => format!("{:08x}", self.created),
        };
        self.register(
            position,
            0,
            short_type_name::<S>(),
            Arc::new(move |placement: &Placement| Box::new(make(placement)) as Box<dyn Stage>),
            false,
        )
    }

    fn next_instance(&mut self) -> u64 {
        let id = self.created;
        self.created += 1;
        id
    }

    fn insert(&mut self, registrar: Registrar) {
        let at = self
            .registrars
            .partition_point(|r| r.sort_key() < registrar.sort_key());
        self.registrars.insert(at, registrar);
    }

    /// Surviving registrars in pipeline order.
    pub fn resolved(&self) -> &[Registrar] {
        &self.registrars
    }

    pub fn len(&self) -> usize {
        self.registrars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrars.is_empty()
    }

    /// Number of registrars ever created, surviving or not.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Drop every registrar. Creation ids keep increasing.
    pub fn clear(&mut self) {
        self.registrars.clear();
    }

    /// Drop every registrar and restart creation ids at zero.
    pub fn reset(&mut self) {
        self.registrars.clear();
        self.created = 0;
    }

    /// Position key of the first stage, or "" when empty.
    pub fn first_position(&self) -> &str {
        self.registrars.first().map(|r| r.position()).unwrap_or("")
    }

    /// Position key of the last stage, or "" when empty.
    pub fn last_position(&self) -> &str {
        self.registrars.last().map(|r| r.position()).unwrap_or("")
    }

    /// Create another stage of the surviving type named `type_name`.
    pub fn new_instance_of(&self, type_name: &str, placement: &Placement) -> Option<Box<dyn Stage>> {
        self.registrars
            .iter()
            .find(|r| r.type_name == type_name)
            .map(|r| r.create(placement))
    }

    /// Pipeline order as (position, type name) pairs.
    pub fn info(&self) -> ChainInfo {
        ChainInfo(
            self.registrars
                .iter()
                .map(|r| ChainEntry {
                    position: r.position.clone(),
                    name: r.type_name.to_string(),
                })
                .collect(),
        )
    }

    /// The process-wide registry stage crates enroll into at startup.
    pub fn global() -> &'static Mutex<Registry> {
        static GLOBAL: OnceLock<Mutex<Registry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Mutex::new(Registry::new()))
    }

    /// Lock the process-wide registry.
    pub fn lock_global() -> ChainResult<MutexGuard<'static, Registry>> {
        Registry::global()
            .lock()
            .map_err(|e| ChainError::Registry(e.to_string()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("registrars", &self.registrars)
            .field("created", &self.created)
            .finish()
    }
}

/// Enroll a priority-resolved stage type into the process-wide registry.
pub fn register_global<S, F>(position: &str, priority: i32, make: F) -> ChainResult<u64>
where
    S: Stage + 'static,
    F: Fn(&Placement) -> S + Send + Sync + 'static,
{
    Ok(Registry::lock_global()?.register_stage(position, priority, make))
}

/// One entry of [`ChainInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub position: String,
    pub name: String,
}

/// Ordered list of (position, stage name) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainInfo(pub Vec<ChainEntry>);

impl ChainInfo {
    pub fn entries(&self) -> &[ChainEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.name.as_str())
    }
}

impl fmt::Display for ChainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.0 {
            write!(f, "{{ {} {} }} ", entry.position, entry.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StageResult;
    use crate::pipeline::signal::{SignalBuffer, SignalShape};
    use crate::pipeline::stage::{BlockContext, StageContext};

    struct Passthrough;

    impl Stage for Passthrough {
        fn validate(&self, input: &SignalShape, _ctx: &mut StageContext<'_>) -> StageResult<SignalShape> {
            Ok(input.clone())
        }

        fn execute(
            &mut self,
            input: &SignalBuffer,
            output: &mut SignalBuffer,
            _ctx: &mut BlockContext<'_>,
        ) -> StageResult<()> {
            output.assign_values(input);
            Ok(())
        }
    }

    fn add(registry: &mut Registry, name: &'static str, position: &str, priority: i32) -> u64 {
        registry.register(
            position,
            priority,
            name,
            Arc::new(|_: &Placement| Box::new(Passthrough) as Box<dyn Stage>),
            true,
        )
    }

    fn names(registry: &Registry) -> Vec<String> {
        registry.info().names().map(String::from).collect()
    }

    #[test]
    fn test_override_ties_survive() {
        let mut registry = Registry::new();
        add(&mut registry, "A", "2.Filter", 1);
        add(&mut registry, "B", "2.Filter", 2);
        add(&mut registry, "C", "2.Filter", 2);
        assert_eq!(names(&registry), ["B", "C"]);

        add(&mut registry, "D", "2.Filter", 0);
        assert_eq!(names(&registry), ["B", "C"]);

        add(&mut registry, "E", "2.Filter", 3);
        assert_eq!(names(&registry), ["E"]);
    }

    #[test]
    fn test_resolution_is_global_across_keys() {
        let mut registry = Registry::new();
        add(&mut registry, "Source", "1.Source", 0);
        add(&mut registry, "Filter", "2.Filter", 1);
        assert_eq!(names(&registry), ["Filter"]);
    }

    #[test]
    fn test_unconditional_survives_resolution() {
        let mut registry = Registry::new();
        registry.register_unconditional(None, |_| Passthrough);
        add(&mut registry, "Low", "2.Filter", 0);
        add(&mut registry, "High", "2.Filter", 5);
        let info = registry.info();
        assert_eq!(info.len(), 2);
        assert_eq!(info.entries()[0].position, "00000000");
        assert_eq!(info.entries()[0].name, "Passthrough");
        assert_eq!(info.entries()[1].name, "High");
    }

    #[test]
    fn test_order_by_position_then_creation() {
        let mut registry = Registry::new();
        add(&mut registry, "Late", "3.App", 0);
        add(&mut registry, "First", "1.Source", 0);
        add(&mut registry, "Second", "1.Source", 0);
        assert_eq!(names(&registry), ["First", "Second", "Late"]);
        assert_eq!(registry.first_position(), "1.Source");
        assert_eq!(registry.last_position(), "3.App");
    }

    #[test]
    fn test_clear_and_reset() {
        let mut registry = Registry::new();
        add(&mut registry, "A", "1", 0);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.first_position(), "");
        assert_eq!(add(&mut registry, "B", "1", 0), 1);
        registry.reset();
        assert_eq!(registry.created(), 0);
        assert_eq!(add(&mut registry, "C", "1", 0), 0);
    }

    #[test]
    fn test_new_instance_of() {
        let mut registry = Registry::new();
        registry.register_stage("2.Filter", 0, |_| Passthrough);
        let placement = registry.resolved()[0].placement("sub");
        assert_eq!(placement.chain_path, "sub");
        assert!(registry.new_instance_of("Passthrough", &placement).is_some());
        assert!(registry.new_instance_of("Missing", &placement).is_none());
    }

    #[test]
    fn test_chain_info_display() {
        let mut registry = Registry::new();
        add(&mut registry, "Gen", "1.Source", 0);
        add(&mut registry, "Lin", "2.Filter", 0);
        assert_eq!(registry.info().to_string(), "{ 1.Source Gen } { 2.Filter Lin } ");
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Passthrough>(), "Passthrough");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec");
    }
}
