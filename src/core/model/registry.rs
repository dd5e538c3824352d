use super::traits::{Backend, NativeContext, NativeModel};
use super::{ContextParams, ModelInfo, ModelParams};
use crate::core::{Error, Result};
use std::fmt;
use std::path::Path;

/// Maximum number of models the registry holds at once.
pub const CAPACITY: usize = 32;

const SLOT_BITS: u32 = 8;
const SLOT_MASK: i64 = (1 << SLOT_BITS) - 1;
const MAX_CAPACITY: usize = 1 << SLOT_BITS;

/// Registry handle: a slot index plus the slot's generation at load time.
///
/// The raw integer form is `generation << 8 | slot`, so a slot that has never
/// been reused hands out its own index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: usize,
    generation: u32,
}

impl Handle {
    pub fn from_raw(raw: i64) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        let generation = u32::try_from(raw >> SLOT_BITS).ok()?;
        Some(Self {
            slot: (raw & SLOT_MASK) as usize,
            generation,
        })
    }

    /// Like [`Handle::from_raw`], but as an `InvalidHandle` error.
    pub fn parse(raw: i64) -> Result<Self> {
        Self::from_raw(raw).ok_or(Error::InvalidHandle(raw))
    }

    pub fn raw(self) -> i64 {
        (i64::from(self.generation) << SLOT_BITS) | self.slot as i64
    }

    pub fn slot(self) -> usize {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// One loaded model and the context it executes in.
pub struct ModelEntry {
    handle: Handle,
    source_path: String,
    reference_count: u32,
    // Declared before `model`: the context must never outlive its weights.
    context: Box<dyn NativeContext>,
    model: Box<dyn NativeModel>,
}

impl ModelEntry {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    pub fn model(&self) -> &dyn NativeModel {
        self.model.as_ref()
    }

    pub fn context(&self) -> &dyn NativeContext {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> &mut dyn NativeContext {
        self.context.as_mut()
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            handle: self.handle.raw(),
            source_path: self.source_path.clone(),
            vocab_size: self.model.vocab_size(),
            context_length: self.context.context_length(),
            reference_count: self.reference_count,
        }
    }

    fn destroy(self) {
        let ModelEntry { context, model, .. } = self;
        drop(context);
        drop(model);
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<ModelEntry>,
}

/// Fixed-capacity table of loaded models.
///
/// Vacated slots go on a free list and are reused by later loads; the slot's
/// generation is bumped on every teardown so handles from before the reuse
/// stop resolving.
pub struct Registry {
    backend: Box<dyn Backend>,
    backend_ready: bool,
    slots: Vec<Slot>,
    free: Vec<usize>,
    capacity: usize,
    context_params: ContextParams,
}

impl Registry {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self::with_capacity(backend, CAPACITY)
    }

    pub fn with_capacity(backend: Box<dyn Backend>, capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Self {
            backend,
            backend_ready: false,
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            context_params: ContextParams::default(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|e| e.handle))
            .collect()
    }

    pub fn load(&mut self, source_path: &str, params: ModelParams) -> Result<Handle> {
        self.load_from(source_path, Path::new(source_path), params)
    }

    /// Loads the model stored at `location`, recording `source_path` as its
    /// origin. Nothing is stored unless both the model and its context come up.
    pub fn load_from(
        &mut self,
        source_path: &str,
        location: &Path,
        params: ModelParams,
    ) -> Result<Handle> {
        if source_path.is_empty() {
            return Err(Error::InvalidArgument("model path is empty"));
        }
        if self.len() >= self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        self.ensure_backend()
            .map_err(|e| as_load_failure(source_path, e))?;

        let model = self
            .backend
            .load_model(location, &params)
            .map_err(|e| as_load_failure(source_path, e))?;

        let context = match model.new_context(&self.context_params) {
            Ok(context) => context,
            Err(e) => {
                drop(model);
                return Err(as_load_failure(source_path, e));
            }
        };

        let slot = self.take_slot();
        let handle = Handle {
            slot,
            generation: self.slots[slot].generation,
        };
        self.slots[slot].entry = Some(ModelEntry {
            handle,
            source_path: source_path.to_string(),
            reference_count: 1,
            context,
            model,
        });

        tracing::info!(
            "Loaded model {} as handle {} (mmap={}, gpu_layers={})",
            source_path,
            handle,
            params.use_memory_map,
            params.gpu_layers
        );
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Result<&ModelEntry> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(Error::InvalidHandle(handle.raw()))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut ModelEntry> {
        self.slots
            .get_mut(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(Error::InvalidHandle(handle.raw()))
    }

    pub fn describe(&self, handle: Handle) -> Result<ModelInfo> {
        self.get(handle).map(ModelEntry::info)
    }

    /// Adds a reference to a loaded model. Returns the new count.
    pub fn retain(&mut self, handle: Handle) -> Result<u32> {
        let entry = self.get_mut(handle)?;
        entry.reference_count = entry.reference_count.saturating_add(1);
        Ok(entry.reference_count)
    }

    /// Drops one reference; the last one tears the model down and vacates the
    /// slot. Freeing a handle that no longer resolves is an error.
    pub fn free(&mut self, handle: Handle) -> Result<()> {
        let entry = self.get_mut(handle)?;
        entry.reference_count = entry.reference_count.saturating_sub(1);
        if entry.reference_count > 0 {
            tracing::debug!(
                "Handle {} still has {} references",
                handle,
                entry.reference_count
            );
            return Ok(());
        }

        self.vacate(handle.slot);
        tracing::info!("Freed model handle {}", handle);
        Ok(())
    }

    /// Tears down every loaded model regardless of its reference count, then
    /// the backend. A later load initializes the backend again.
    pub fn shutdown_all(&mut self) {
        let mut released = 0;
        for slot in 0..self.slots.len() {
            if self.vacate(slot) {
                released += 1;
            }
        }

        if self.backend_ready {
            self.backend.teardown();
            self.backend_ready = false;
            tracing::info!(
                "Backend {} shut down, released {} models",
                self.backend.name(),
                released
            );
        }
    }

    fn ensure_backend(&mut self) -> Result<()> {
        if !self.backend_ready {
            self.backend.init()?;
            self.backend_ready = true;
            tracing::debug!("Backend {} initialized", self.backend.name());
        }
        Ok(())
    }

    fn take_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        }
    }

    fn vacate(&mut self, slot: usize) -> bool {
        let Some(entry) = self.slots.get_mut(slot).and_then(|s| {
            let entry = s.entry.take()?;
            s.generation = s.generation.wrapping_add(1);
            Some(entry)
        }) else {
            return false;
        };

        self.free.push(slot);
        entry.destroy();
        true
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

fn as_load_failure(path: &str, err: Error) -> Error {
    match err {
        Error::LoadFailed { reason, .. } => Error::load_failed(path, reason),
        other => Error::load_failed(path, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::architectures::scripted::{Event, ScriptedBackend};

    fn backend() -> ScriptedBackend {
        ScriptedBackend::new(["<eos>", "a", "b"])
    }

    #[test]
    fn test_handle_raw_roundtrip() {
        let handle = Handle { slot: 5, generation: 0 };
        assert_eq!(handle.raw(), 5);

        let reused = Handle { slot: 5, generation: 2 };
        assert_eq!(reused.raw(), 2 * 256 + 5);
        assert_eq!(Handle::from_raw(reused.raw()), Some(reused));
        assert_eq!(Handle::from_raw(-1), None);
        assert_eq!(Handle::parse(-7), Err(Error::InvalidHandle(-7)));
    }

    #[test]
    fn test_load_sets_single_reference() {
        let mut registry = Registry::new(Box::new(backend()));
        let handle = registry.load("tiny.bin", ModelParams::default()).unwrap();

        assert_eq!(handle.raw(), 0);
        let info = registry.describe(handle).unwrap();
        assert_eq!(info.reference_count, 1);
        assert_eq!(info.source_path, "tiny.bin");
        assert_eq!(info.vocab_size, 3);
        assert_eq!(info.context_length, 2048);
    }

    #[test]
    fn test_backend_initialized_once() {
        let backend = backend();
        let journal = backend.journal();
        let mut registry = Registry::new(Box::new(backend));

        registry.load("one", ModelParams::default()).unwrap();
        registry.load("two", ModelParams::default()).unwrap();
        assert_eq!(journal.count(|e| *e == Event::Init), 1);
    }

    #[test]
    fn test_empty_path_rejected() {
        let mut registry = Registry::new(Box::new(backend()));
        assert!(matches!(
            registry.load("", ModelParams::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut registry = Registry::with_capacity(Box::new(backend()), 2);
        registry.load("a", ModelParams::default()).unwrap();
        registry.load("b", ModelParams::default()).unwrap();
        assert_eq!(
            registry.load("c", ModelParams::default()),
            Err(Error::CapacityExceeded { capacity: 2 })
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failed_context_drops_model() {
        let backend = backend().failing_context();
        let journal = backend.journal();
        let mut registry = Registry::new(Box::new(backend));

        let err = registry.load("broken", ModelParams::default()).unwrap_err();
        assert!(matches!(err, Error::LoadFailed { ref path, .. } if path == "broken"));
        assert!(registry.is_empty());
        assert_eq!(journal.count(|e| *e == Event::ModelDropped), 1);
    }

    #[test]
    fn test_free_reuses_slot_and_rejects_stale_handle() {
        let mut registry = Registry::new(Box::new(backend()));
        let first = registry.load("first", ModelParams::default()).unwrap();
        let second = registry.load("second", ModelParams::default()).unwrap();

        registry.free(first).unwrap();
        let third = registry.load("third", ModelParams::default()).unwrap();

        assert_eq!(third.slot(), first.slot());
        assert_ne!(third, first);
        assert_eq!(registry.describe(first), Err(Error::InvalidHandle(first.raw())));
        assert_eq!(registry.describe(third).unwrap().source_path, "third");
        assert_eq!(registry.describe(second).unwrap().source_path, "second");
    }

    #[test]
    fn test_free_twice_is_error() {
        let mut registry = Registry::new(Box::new(backend()));
        let handle = registry.load("model", ModelParams::default()).unwrap();

        registry.free(handle).unwrap();
        assert_eq!(registry.free(handle), Err(Error::InvalidHandle(0)));
    }

    #[test]
    fn test_retain_defers_teardown() {
        let mut registry = Registry::new(Box::new(backend()));
        let handle = registry.load("model", ModelParams::default()).unwrap();

        assert_eq!(registry.retain(handle).unwrap(), 2);
        registry.free(handle).unwrap();
        assert_eq!(registry.describe(handle).unwrap().reference_count, 1);
        registry.free(handle).unwrap();
        assert!(registry.describe(handle).is_err());
    }

    #[test]
    fn test_teardown_order() {
        let backend = backend();
        let journal = backend.journal();
        let mut registry = Registry::new(Box::new(backend));
        let handle = registry.load("model", ModelParams::default()).unwrap();

        registry.free(handle).unwrap();
        let drops: Vec<Event> = journal
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::ContextDropped | Event::ModelDropped))
            .collect();
        assert_eq!(drops, vec![Event::ContextDropped, Event::ModelDropped]);
    }

    #[test]
    fn test_shutdown_all_releases_everything() {
        let backend = backend();
        let journal = backend.journal();
        let mut registry = Registry::new(Box::new(backend));
        let a = registry.load("a", ModelParams::default()).unwrap();
        registry.load("b", ModelParams::default()).unwrap();
        registry.retain(a).unwrap();

        registry.shutdown_all();
        assert!(registry.is_empty());
        assert_eq!(journal.count(|e| *e == Event::ModelDropped), 2);
        assert_eq!(journal.count(|e| *e == Event::Teardown), 1);

        drop(registry);
        assert_eq!(journal.count(|e| *e == Event::Teardown), 1);
    }
}
