use crate::error::LiveQError;
use crate::event::LiveQueryChange;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// One segment of a query's ordering clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSegment {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// What a live query is over: an entity, an identity field, and an
/// ordering. Filtering happens broker-side; the reducer only needs enough
/// of the definition to keep the local result set consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub entity_key: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub order_by: Vec<SortSegment>,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl QueryDefinition {
    pub fn new(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            id_field: default_id_field(),
            order_by: Vec::new(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(SortSegment {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(SortSegment {
            field: field.into(),
            descending: true,
        });
        self
    }
}

/// A change hydrated into the query's result type.
#[derive(Debug, Clone)]
pub enum AppliedChange<T> {
    All(Vec<T>),
    Add(T),
    Replace { old_id: Value, item: T },
    Remove { id: Value },
}

/// What observers receive after a batch folds: the changes that produced
/// the new state, the state itself, and a pure replay for callers that hold
/// their own copy of the previous state (e.g. an external UI store).
#[derive(Clone)]
pub struct LiveQueryUpdate<T> {
    pub changes: Vec<AppliedChange<T>>,
    pub items: Vec<T>,
    definition: Arc<QueryDefinition>,
}

impl<T> LiveQueryUpdate<T>
where
    T: Serialize + Clone,
{
    /// Replay this update's changes onto a previous state. Pure: computes
    /// the next state without side effects, applying the same fold and
    /// re-sort rules the subscription itself uses.
    pub fn apply(&self, prev: &[T]) -> Vec<T> {
        let mut items = prev.to_vec();
        fold_changes(&mut items, &self.changes, &self.definition);
        items
    }
}

/// Observer of one live query. All listeners attached to a subscription see
/// every folded batch.
pub trait LiveQueryListener<T>: Send + Sync {
    fn next(&self, update: &LiveQueryUpdate<T>);
    fn error(&self, err: &LiveQError);
    fn complete(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// No snapshot received yet.
    Initializing,
    /// Holds a materialized result set.
    Live,
    /// Unsubscribed or errored. Terminal.
    Closed,
}

/// Client-side holder of one live query's materialized result set.
///
/// Folds incoming diff batches into the held state in arrival order and
/// notifies listeners once per batch. The id doubles as the private channel
/// name the broker routes this query's diffs to.
pub struct QuerySubscription<T> {
    id: String,
    definition: Arc<QueryDefinition>,
    phase: QueryPhase,
    items: Vec<T>,
    listeners: Vec<(u64, Arc<dyn LiveQueryListener<T>>)>,
    next_listener_id: u64,
}

impl<T> QuerySubscription<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(id: impl Into<String>, definition: QueryDefinition) -> Self {
        Self {
            id: id.into(),
            definition: Arc::new(definition),
            phase: QueryPhase::Initializing,
            items: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &QueryDefinition {
        &self.definition
    }

    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn add_listener(&mut self, listener: Arc<dyn LiveQueryListener<T>>) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns true when the last listener was removed.
    pub fn remove_listener(&mut self, listener_id: u64) -> bool {
        self.listeners.retain(|(id, _)| *id != listener_id);
        self.listeners.is_empty()
    }

    /// Hand a freshly attached listener the current state as a snapshot, so
    /// a late joiner sees a consistent baseline before any subsequent diff.
    /// Synchronous; no network round-trip.
    pub fn send_initial_state(&self, listener: &dyn LiveQueryListener<T>) {
        if self.phase != QueryPhase::Live {
            return;
        }
        let update = LiveQueryUpdate {
            changes: vec![AppliedChange::All(self.items.clone())],
            items: self.items.clone(),
            definition: self.definition.clone(),
        };
        listener.next(&update);
    }

    /// Fold a batch of changes into the held state and notify listeners.
    ///
    /// The batch is atomic with respect to observers: hydration runs first
    /// and any failure discards the whole batch (surfaced via
    /// `listener.error`), so a partially applied batch is never visible.
    pub fn handle(&mut self, batch: &[LiveQueryChange]) {
        if self.phase == QueryPhase::Closed || batch.is_empty() {
            return;
        }

        let changes = match self.hydrate(batch) {
            Ok(changes) => changes,
            Err(err) => {
                debug!("discarding batch for query {}: {}", self.id, err);
                self.fail(&err);
                return;
            }
        };

        if changes
            .iter()
            .any(|change| matches!(change, AppliedChange::All(_)))
        {
            self.phase = QueryPhase::Live;
        }
        fold_changes(&mut self.items, &changes, &self.definition);

        let update = LiveQueryUpdate {
            changes,
            items: self.items.clone(),
            definition: self.definition.clone(),
        };
        for (_, listener) in &self.listeners {
            listener.next(&update);
        }
    }

    /// Notify listeners of a data-level failure scoped to this query.
    pub fn fail(&self, err: &LiveQError) {
        for (_, listener) in &self.listeners {
            listener.error(err);
        }
    }

    pub fn close(&mut self) {
        if self.phase == QueryPhase::Closed {
            return;
        }
        self.phase = QueryPhase::Closed;
        for (_, listener) in self.listeners.drain(..) {
            listener.complete();
        }
    }

    fn hydrate(&self, batch: &[LiveQueryChange]) -> Result<Vec<AppliedChange<T>>, LiveQError> {
        let mut changes = Vec::with_capacity(batch.len());
        for change in batch {
            let hydrated = match change {
                LiveQueryChange::All { items } => {
                    let mut typed = Vec::with_capacity(items.len());
                    for item in items {
                        typed.push(self.hydrate_item(item)?);
                    }
                    AppliedChange::All(typed)
                }
                LiveQueryChange::Add { item } => AppliedChange::Add(self.hydrate_item(item)?),
                LiveQueryChange::Replace { old_id, item } => AppliedChange::Replace {
                    old_id: old_id.clone(),
                    item: self.hydrate_item(item)?,
                },
                LiveQueryChange::Remove { id } => AppliedChange::Remove { id: id.clone() },
            };
            changes.push(hydrated);
        }
        Ok(changes)
    }

    fn hydrate_item(&self, item: &Value) -> Result<T, LiveQError> {
        serde_json::from_value(item.clone()).map_err(|source| LiveQError::Hydration {
            query: self.id.clone(),
            source,
        })
    }
}

/// Apply hydrated changes in order, then re-sort when any add or replace
/// changed the set and the query carries an ordering.
fn fold_changes<T>(items: &mut Vec<T>, changes: &[AppliedChange<T>], definition: &QueryDefinition)
where
    T: Serialize + Clone,
{
    let mut resort = false;
    for change in changes {
        match change {
            AppliedChange::All(snapshot) => {
                *items = snapshot.clone();
            }
            AppliedChange::Add(item) => {
                // Duplicate delivery tolerance: drop any same-id element
                // before appending.
                let id = item_id(item, &definition.id_field);
                items.retain(|existing| item_id(existing, &definition.id_field) != id);
                items.push(item.clone());
                resort = true;
            }
            AppliedChange::Replace { old_id, item } => {
                // A row not in this query's visible window stays out: no
                // spurious insertion.
                for existing in items.iter_mut() {
                    if item_id(existing, &definition.id_field) == *old_id {
                        *existing = item.clone();
                    }
                }
                resort = true;
            }
            AppliedChange::Remove { id } => {
                items.retain(|existing| item_id(existing, &definition.id_field) != *id);
            }
        }
    }

    if resort && !definition.order_by.is_empty() {
        sort_items(items, definition);
    }
}

fn item_id<T: Serialize>(item: &T, id_field: &str) -> Value {
    serde_json::to_value(item)
        .ok()
        .and_then(|value| value.get(id_field).cloned())
        .unwrap_or(Value::Null)
}

fn sort_items<T: Serialize + Clone>(items: &mut Vec<T>, definition: &QueryDefinition) {
    let mut decorated: Vec<(Value, T)> = items
        .drain(..)
        .map(|item| {
            let value = serde_json::to_value(&item).unwrap_or(Value::Null);
            (value, item)
        })
        .collect();
    // sort_by is stable: equal keys keep their arrival order.
    decorated.sort_by(|(a, _), (b, _)| compare_by(a, b, &definition.order_by));
    items.extend(decorated.into_iter().map(|(_, item)| item));
}

fn compare_by(a: &Value, b: &Value, order_by: &[SortSegment]) -> Ordering {
    for segment in order_by {
        let left = a.get(&segment.field).unwrap_or(&Value::Null);
        let right = b.get(&segment.field).unwrap_or(&Value::Null);
        let mut ordering = compare_values(left, right);
        if segment.descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Total order over JSON scalars: null < bool < number < string, with
/// containers after scalars. Mixed types compare by rank.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}

fn value_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
