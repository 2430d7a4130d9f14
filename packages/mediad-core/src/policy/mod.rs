//! Routing-policy criterion store.
//!
//! Criteria are named integer states: *exclusive* criteria hold one value
//! (optionally named, optionally range-bound), *inclusive* criteria hold a
//! bitmask of named members. The rule engine consuming them is an external
//! collaborator behind [`PolicyObserver`]; this module owns the values, the
//! subscriber fan-out and the persistence contract.
//!
//! Criteria whose name starts with `persist.media.` reload their stored
//! value at startup and schedule a debounced save on every change.

mod persist;

pub use persist::{JsonFileStore, KvStore, MemoryStore, PersistScheduler};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::defs::PERSIST_PREFIX;
use crate::error::{MediaError, MediaResult};
use crate::events::{Notifier, NotifierRef};

/// Criterion flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    /// Holds exactly one value.
    Exclusive,
    /// Holds a set of members encoded as a bitmask.
    Inclusive,
}

/// Declarative criterion description from daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionSpec {
    pub name: String,
    pub kind: CriterionKind,
    /// Named states (exclusive) or members (inclusive). May be empty for
    /// free-integer exclusive criteria.
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub initial: i32,
    /// Range for free-integer exclusive criteria.
    #[serde(default)]
    pub min: Option<i32>,
    #[serde(default)]
    pub max: Option<i32>,
}

struct Criterion {
    kind: CriterionKind,
    values: Vec<String>,
    value: i32,
    min: i32,
    max: i32,
}

impl Criterion {
    fn from_spec(spec: &CriterionSpec) -> Self {
        let (min, max) = match spec.kind {
            CriterionKind::Exclusive if !spec.values.is_empty() => {
                (0, spec.values.len() as i32 - 1)
            }
            CriterionKind::Exclusive => (
                spec.min.unwrap_or(i32::MIN),
                spec.max.unwrap_or(i32::MAX),
            ),
            CriterionKind::Inclusive => (0, i32::MAX),
        };
        Self {
            kind: spec.kind,
            values: spec.values.clone(),
            value: spec.initial,
            min,
            max,
        }
    }

    fn literal(&self) -> String {
        match self.kind {
            CriterionKind::Exclusive => self
                .values
                .get(self.value as usize)
                .cloned()
                .unwrap_or_else(|| self.value.to_string()),
            CriterionKind::Inclusive => {
                let names: Vec<&str> = self
                    .values
                    .iter()
                    .enumerate()
                    .filter(|(bit, _)| self.value & (1 << bit) != 0)
                    .map(|(_, name)| name.as_str())
                    .collect();
                names.join("|")
            }
        }
    }

    fn member_bit(&self, member: &str) -> MediaResult<i32> {
        self.values
            .iter()
            .position(|v| v == member)
            .map(|bit| 1 << bit)
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown member '{member}'")))
    }
}

/// Consumer of criterion changes; the rule engine's narrow interface.
pub trait PolicyObserver: Send + Sync {
    fn criterion_changed(&self, name: &str, value: i32, literal: &str);
}

struct Subscriber {
    conn_id: u64,
    criterion: String,
    sink: NotifierRef,
}

/// Criterion store with subscriber fan-out and deferred persistence.
pub struct PolicyEngine {
    criteria: HashMap<String, Criterion>,
    subscribers: Vec<Subscriber>,
    observers: Vec<Arc<dyn PolicyObserver>>,
    dirty: BTreeSet<String>,
    persist: Option<Arc<PersistScheduler>>,
}

impl PolicyEngine {
    /// Builds the store, reloading persisted values before the first apply.
    pub fn new(specs: &[CriterionSpec], persist: Option<Arc<PersistScheduler>>) -> Self {
        let mut criteria = HashMap::new();
        for spec in specs {
            let mut criterion = Criterion::from_spec(spec);
            if spec.name.starts_with(PERSIST_PREFIX) {
                if let Some(scheduler) = &persist {
                    if let Some(stored) = scheduler.store().load(&spec.name) {
                        criterion.value = stored;
                    }
                }
            }
            criteria.insert(spec.name.clone(), criterion);
        }
        Self {
            criteria,
            subscribers: Vec::new(),
            observers: Vec::new(),
            dirty: BTreeSet::new(),
            persist,
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn PolicyObserver>) {
        self.observers.push(observer);
    }

    fn criterion(&self, name: &str) -> MediaResult<&Criterion> {
        self.criteria
            .get(name)
            .ok_or_else(|| MediaError::NotFound(format!("criterion '{name}'")))
    }

    fn mutate(&mut self, name: &str, value: i32) -> MediaResult<()> {
        let criterion = self
            .criteria
            .get_mut(name)
            .ok_or_else(|| MediaError::NotFound(format!("criterion '{name}'")))?;
        if value < criterion.min || value > criterion.max {
            return Err(MediaError::InvalidArgument(format!(
                "value {value} out of range for '{name}'"
            )));
        }
        if criterion.value != value {
            criterion.value = value;
            self.dirty.insert(name.to_string());
            if name.starts_with(PERSIST_PREFIX) {
                if let Some(scheduler) = &self.persist {
                    scheduler.schedule(name, value);
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Command surface
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_int(&mut self, name: &str, value: i32, apply: bool) -> MediaResult<()> {
        self.mutate(name, value)?;
        self.maybe_apply(apply);
        Ok(())
    }

    pub fn get_int(&self, name: &str) -> MediaResult<i32> {
        Ok(self.criterion(name)?.value)
    }

    pub fn set_string(&mut self, name: &str, literal: &str, apply: bool) -> MediaResult<()> {
        let criterion = self.criterion(name)?;
        if criterion.kind != CriterionKind::Exclusive {
            return Err(MediaError::InvalidArgument(format!(
                "'{name}' is not an exclusive criterion"
            )));
        }
        let value = criterion
            .values
            .iter()
            .position(|v| v == literal)
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown state '{literal}'")))?
            as i32;
        self.mutate(name, value)?;
        self.maybe_apply(apply);
        Ok(())
    }

    pub fn get_string(&self, name: &str) -> MediaResult<String> {
        Ok(self.criterion(name)?.literal())
    }

    pub fn include(&mut self, name: &str, member: &str, apply: bool) -> MediaResult<()> {
        let criterion = self.criterion(name)?;
        if criterion.kind != CriterionKind::Inclusive {
            return Err(MediaError::InvalidArgument(format!("'{name}' is not inclusive")));
        }
        let value = criterion.value | criterion.member_bit(member)?;
        self.mutate(name, value)?;
        self.maybe_apply(apply);
        Ok(())
    }

    pub fn exclude(&mut self, name: &str, member: &str, apply: bool) -> MediaResult<()> {
        let criterion = self.criterion(name)?;
        if criterion.kind != CriterionKind::Inclusive {
            return Err(MediaError::InvalidArgument(format!("'{name}' is not inclusive")));
        }
        let value = criterion.value & !criterion.member_bit(member)?;
        self.mutate(name, value)?;
        self.maybe_apply(apply);
        Ok(())
    }

    pub fn contain(&self, name: &str, member: &str) -> MediaResult<bool> {
        let criterion = self.criterion(name)?;
        if criterion.kind != CriterionKind::Inclusive {
            return Err(MediaError::InvalidArgument(format!("'{name}' is not inclusive")));
        }
        Ok(criterion.value & criterion.member_bit(member)? != 0)
    }

    pub fn increase(&mut self, name: &str, apply: bool) -> MediaResult<()> {
        self.step(name, 1, apply)
    }

    pub fn decrease(&mut self, name: &str, apply: bool) -> MediaResult<()> {
        self.step(name, -1, apply)
    }

    fn step(&mut self, name: &str, delta: i32, apply: bool) -> MediaResult<()> {
        let criterion = self.criterion(name)?;
        if criterion.kind != CriterionKind::Exclusive {
            return Err(MediaError::InvalidArgument(format!("'{name}' is not steppable")));
        }
        let value = criterion.value.saturating_add(delta);
        self.mutate(name, value)?;
        self.maybe_apply(apply);
        Ok(())
    }

    /// Subscribes a connection to a criterion's changes.
    pub fn subscribe(&mut self, name: &str, conn_id: u64, sink: NotifierRef) -> MediaResult<()> {
        self.criterion(name)?;
        self.subscribers.push(Subscriber {
            conn_id,
            criterion: name.to_string(),
            sink,
        });
        Ok(())
    }

    /// Drops every subscription held by `conn_id`.
    pub fn unsubscribe(&mut self, conn_id: u64) {
        self.subscribers.retain(|s| s.conn_id != conn_id);
    }

    /// Re-evaluates side effects for every criterion changed since the
    /// last apply: observers first, then subscriber notifications with
    /// `(event=0, result=value, extra=literal)`.
    pub fn apply(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for name in dirty {
            let (value, literal) = match self.criteria.get(&name) {
                Some(criterion) => (criterion.value, criterion.literal()),
                None => continue,
            };
            for observer in &self.observers {
                observer.criterion_changed(&name, value, &literal);
            }
            for subscriber in &self.subscribers {
                if subscriber.criterion == name {
                    subscriber.sink.notify(0, value, &literal);
                }
            }
        }
    }

    fn maybe_apply(&mut self, apply: bool) {
        if apply {
            self.apply();
        }
    }

    /// Human-readable criterion listing.
    pub fn dump(&self) -> String {
        let mut names: Vec<&String> = self.criteria.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let criterion = &self.criteria[name];
            out.push_str(&format!(
                "{name} ({:?}) = {} [{}]\n",
                criterion.kind,
                criterion.value,
                criterion.literal()
            ));
        }
        out
    }
}
