//! The typed data-source bus.
//!
//! A data source is a named, typed, priority-ordered event channel inside a
//! running gadget. Its schema is an ordered list of [`Field`]s backed by
//! binary record storage; subscribers attach with a signed priority (lower
//! runs first) and observe each other's mutations in strict priority order.
//!
//! Once a source has emitted its first record (or the gadget context has
//! started), the schema freezes: further `add_field` calls fail.

mod data;
mod field;

pub use data::Data;
pub use field::{Field, FieldAccessor, FieldKind, FieldValue};

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use field::NO_SLOT;

/// Records released back to a source are pooled up to this many.
const POOL_LIMIT: usize = 64;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Flavor of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSourceKind {
    /// A continuous stream of events.
    #[default]
    EventStream,
    /// Point-in-time state dumps.
    Snapshot,
}

impl DataSourceKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Snapshot,
            _ => Self::EventStream,
        }
    }
}

/// Subscriber callback: invoked synchronously for each emission.
pub type DataFunc = Arc<dyn Fn(&DataSource, &Data) -> Result<()> + Send + Sync>;

struct Subscriber {
    priority: i32,
    seq: u64,
    callback: DataFunc,
}

#[derive(Default)]
struct Schema {
    fields: Vec<Field>,
    /// Total fixed-storage size in bytes.
    layout_len: u32,
    /// Number of out-of-line string slots.
    string_slots: u32,
}

/// A named, typed event channel.
pub struct DataSource {
    name: String,
    kind: DataSourceKind,
    schema: RwLock<Schema>,
    frozen: AtomicBool,
    subscribers: RwLock<Vec<Subscriber>>,
    sub_seq: AtomicU64,
    /// Serializes emissions on this source. Distinct sources emit in parallel.
    emit_lock: Mutex<()>,
    /// Thread token of the current emitter; lets a subscriber re-emit on the
    /// same source without self-deadlock.
    emit_owner: AtomicU64,
    pool: Mutex<Vec<Data>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("frozen", &self.frozen.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DataSource {
    pub(crate) fn new(kind: DataSourceKind, name: impl Into<String>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            schema: RwLock::new(Schema::default()),
            frozen: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
            sub_seq: AtomicU64::new(0),
            emit_lock: Mutex::new(()),
            emit_owner: AtomicU64::new(0),
            pool: Mutex::new(Vec::new()),
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DataSourceKind {
        self.kind
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Freezes the schema. Called on the first emission and when the gadget
    /// context transitions to Started.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Adds a variable-length or fixed-width field, assigning the next offset.
    pub fn add_field(&self, name: &str, kind: FieldKind) -> Result<FieldAccessor> {
        self.add_field_inner(name, kind, kind.size() as u32)
    }

    /// Adds a string field with static inline storage of `size` bytes.
    ///
    /// Used for fields backed by fixed-size char arrays in kernel records.
    pub fn add_field_sized(&self, name: &str, kind: FieldKind, size: u32) -> Result<FieldAccessor> {
        if !kind.is_string() {
            return Err(Error::UnsupportedKind(kind));
        }
        self.add_field_inner(name, kind, size)
    }

    fn add_field_inner(&self, name: &str, kind: FieldKind, size: u32) -> Result<FieldAccessor> {
        if kind == FieldKind::Invalid {
            return Err(Error::UnsupportedKind(kind));
        }
        if self.is_frozen() {
            return Err(Error::SchemaFrozen(self.name.clone()));
        }
        let mut schema = self.schema.write().expect("schema lock poisoned");
        if schema.fields.iter().any(|f| &*f.name == name) {
            return Err(Error::DuplicateField {
                data_source: self.name.clone(),
                field: name.to_string(),
            });
        }

        let offset = schema.layout_len;
        let string_slot = if kind.is_string() && size == 0 {
            let slot = schema.string_slots;
            schema.string_slots += 1;
            // the fixed layout still grows by one handle slot
            schema.layout_len += 4;
            slot
        } else {
            schema.layout_len += size;
            NO_SLOT
        };

        let field = Field {
            name: Arc::from(name),
            kind,
            offset,
            size,
            string_slot,
        };
        let accessor = field.accessor();
        schema.fields.push(field);
        debug!(source = %self.name, field = name, ?kind, offset, "field added");
        Ok(accessor)
    }

    /// Looks up a field by name.
    pub fn get_field(&self, name: &str) -> Result<FieldAccessor> {
        let schema = self.schema.read().expect("schema lock poisoned");
        schema
            .fields
            .iter()
            .find(|f| &*f.name == name)
            .map(Field::accessor)
            .ok_or_else(|| Error::FieldNotFound {
                data_source: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Returns a snapshot of the schema fields in declaration order.
    pub fn fields(&self) -> Vec<Field> {
        self.schema.read().expect("schema lock poisoned").fields.clone()
    }

    fn layout(&self) -> (u32, u32) {
        let schema = self.schema.read().expect("schema lock poisoned");
        (schema.layout_len, schema.string_slots)
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Attaches a subscriber. Lower priority values are invoked first; ties
    /// are broken by registration order. Refused after cancellation.
    pub fn subscribe<F>(&self, callback: F, priority: i32) -> Result<()>
    where
        F: Fn(&DataSource, &Data) -> Result<()> + Send + Sync + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let seq = self.sub_seq.fetch_add(1, Ordering::Relaxed);
        let sub = Subscriber {
            priority,
            seq,
            callback: Arc::new(callback),
        };
        let mut subs = self.subscribers.write().expect("subscriber lock poisoned");
        let at = subs
            .partition_point(|s| (s.priority, s.seq) <= (priority, seq));
        subs.insert(at, sub);
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("subscriber lock poisoned").len()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Allocates a zero-initialized record sized to the current layout.
    pub fn new_data(&self) -> Data {
        let (len, slots) = self.layout();
        if let Some(data) = self.pool.lock().expect("pool lock poisoned").pop() {
            if data.len() != len as usize {
                data.reset(len as usize, slots as usize);
            }
            return data;
        }
        Data::alloc(len as usize, slots as usize)
    }

    /// Delivers `data` to all subscribers in priority order, then releases it.
    ///
    /// The first emission freezes the schema. Subscriber mutations are
    /// visible to later subscribers. A failing subscriber does not stop
    /// delivery; the first error is returned after the record is released.
    pub fn emit_and_release(&self, data: Data) -> Result<()> {
        self.freeze();

        // a subscriber may re-emit on its own source from the emitting
        // thread; taking the lock again would self-deadlock
        let token = thread_token();
        let serial = if self.emit_owner.load(Ordering::Acquire) == token {
            None
        } else {
            let guard = self.emit_lock.lock().expect("emit lock poisoned");
            self.emit_owner.store(token, Ordering::Release);
            Some(guard)
        };

        let callbacks: Vec<DataFunc> = {
            let subs = self.subscribers.read().expect("subscriber lock poisoned");
            subs.iter().map(|s| Arc::clone(&s.callback)).collect()
        };
        let mut first_err: Option<Error> = None;
        for callback in callbacks {
            if let Err(err) = callback(self, &data) {
                warn!(source = %self.name, error = %err, "subscriber failed");
                first_err.get_or_insert(err);
            }
        }

        if let Some(guard) = serial {
            self.emit_owner.store(0, Ordering::Release);
            drop(guard);
        }

        self.release(data);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Discards a record without delivery, returning it to the pool.
    pub fn release(&self, data: Data) {
        if !data.is_unique() {
            // a stale handle still references the record; let it drop instead
            return;
        }
        let (len, slots) = self.layout();
        data.reset(len as usize, slots as usize);
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        if pool.len() < POOL_LIMIT {
            pool.push(data);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_records(&self) -> usize {
        self.pool.lock().expect("pool lock poisoned").len()
    }
}

/// Registry of data sources within one gadget context.
#[derive(Default)]
pub(crate) struct DataSourceRegistry {
    sources: RwLock<HashMap<String, Arc<DataSource>>>,
}

impl DataSourceRegistry {
    pub fn register(
        &self,
        kind: DataSourceKind,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<Arc<DataSource>> {
        let mut sources = self.sources.write().expect("registry lock poisoned");
        if sources.contains_key(name) {
            return Err(Error::DataSourceExists(name.to_string()));
        }
        let source = DataSource::new(kind, name, cancel);
        sources.insert(name.to_string(), Arc::clone(&source));
        debug!(source = name, ?kind, "data source registered");
        Ok(source)
    }

    pub fn get(&self, name: &str) -> Option<Arc<DataSource>> {
        self.sources.read().expect("registry lock poisoned").get(name).cloned()
    }

    /// Snapshot of all registered sources.
    pub fn snapshot(&self) -> HashMap<String, Arc<DataSource>> {
        self.sources.read().expect("registry lock poisoned").clone()
    }

    pub fn freeze_all(&self) {
        for source in self.sources.read().expect("registry lock poisoned").values() {
            source.freeze();
        }
    }
}
