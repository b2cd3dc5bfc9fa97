use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use symex_expr::{Evaluator, Expr, VariableAssignments, VariableId, Width};

/// Outcome of a satisfiability query. Solver failures such as timeouts are reported as
/// [SatResult::Unknown] and must never be treated as satisfiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

/// A conjunction of path constraints plus an optional additional constraint.
#[derive(Debug, Clone, Copy)]
pub struct Query<'a> {
    pub constraints: &'a [Expr],
    pub extra: Option<&'a Expr>,
}

impl<'a> Query<'a> {
    pub fn new(constraints: &'a [Expr]) -> Self {
        Self {
            constraints,
            extra: None,
        }
    }

    pub fn with_extra(constraints: &'a [Expr], extra: &'a Expr) -> Self {
        Self {
            constraints,
            extra: Some(extra),
        }
    }

    pub fn exprs(self) -> impl Iterator<Item = &'a Expr> {
        self.constraints.iter().chain(self.extra)
    }

    /// Stable hash of the query used as a cache key. Hashing is deterministic across runs.
    pub fn cache_key(self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.constraints.hash(&mut hasher);
        self.extra.hash(&mut hasher);
        hasher.finish()
    }
}

/// The constraint solver collaborator.
pub trait Solver {
    fn check(&mut self, query: Query<'_>) -> SatResult;

    /// Produce an assignment satisfying the query. Returns `None` when the query is unsatisfiable
    /// or the solver could not decide.
    fn model(&mut self, query: Query<'_>) -> Option<VariableAssignments>;
}

impl<S: Solver + ?Sized> Solver for Box<S> {
    fn check(&mut self, query: Query<'_>) -> SatResult {
        (**self).check(query)
    }

    fn model(&mut self, query: Query<'_>) -> Option<VariableAssignments> {
        (**self).model(query)
    }
}

fn max_value(width: Width) -> u64 {
    if width >= u64::BITS {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

/// Reference solver that decides queries by enumerating every assignment of the referenced
/// variables. Queries over more than `max_bits` variable bits are answered with
/// [SatResult::Unknown].
#[derive(Debug, Clone)]
pub struct EnumeratingSolver {
    max_bits: u32,
}

impl Default for EnumeratingSolver {
    fn default() -> Self {
        Self::new(20)
    }
}

impl EnumeratingSolver {
    pub fn new(max_bits: u32) -> Self {
        Self { max_bits }
    }

    fn search(&self, query: Query<'_>) -> (SatResult, Option<VariableAssignments>) {
        let mut variables = BTreeMap::<VariableId, Width>::new();
        for expr in query.exprs() {
            if expr.is_false() {
                return (SatResult::Unsat, None);
            }
            variables.extend(expr.variables());
        }

        let total_bits: u32 = variables.values().sum();
        if total_bits > self.max_bits {
            return (SatResult::Unknown, None);
        }

        let variables = variables.into_iter().collect::<Vec<_>>();
        let mut values = vec![0u64; variables.len()];
        loop {
            let assignments = variables
                .iter()
                .zip(values.iter())
                .map(|(&(id, _), &value)| (id, value))
                .collect::<VariableAssignments>();
            let mut evaluator = Evaluator::new(assignments);
            if query
                .exprs()
                .all(|expr| evaluator.evaluate_bool(expr) == Some(true))
            {
                return (SatResult::Sat, Some(evaluator.assignments().clone()));
            }

            // Advance the mixed-radix counter
            let mut index = 0;
            loop {
                if index == variables.len() {
                    return (SatResult::Unsat, None);
                }

                if values[index] < max_value(variables[index].1) {
                    values[index] += 1;
                    break;
                }

                values[index] = 0;
                index += 1;
            }
        }
    }
}

impl Solver for EnumeratingSolver {
    fn check(&mut self, query: Query<'_>) -> SatResult {
        self.search(query).0
    }

    fn model(&mut self, query: Query<'_>) -> Option<VariableAssignments> {
        self.search(query).1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Caches solver results keyed on the hash of the query. Entries keep the query they answer so
/// hash collisions are treated as misses. Undecided results are not cached so they may be
/// retried.
#[derive(Debug)]
pub struct CachingSolver<S> {
    inner: S,
    capacity: usize,
    results: HashMap<u64, CacheEntry<SatResult>>,
    models: HashMap<u64, CacheEntry<Option<VariableAssignments>>>,
    stats: CacheStats,
}

#[derive(Debug)]
struct CacheEntry<V> {
    constraints: Vec<Expr>,
    extra: Option<Expr>,
    value: V,
}

impl<V> CacheEntry<V> {
    fn new(query: Query<'_>, value: V) -> Self {
        Self {
            constraints: query.constraints.to_vec(),
            extra: query.extra.cloned(),
            value,
        }
    }

    fn answers(&self, query: Query<'_>) -> bool {
        self.constraints == query.constraints && self.extra.as_ref() == query.extra
    }
}

impl<S: Solver> CachingSolver<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            results: Default::default(),
            models: Default::default(),
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn make_room<V>(capacity: usize, cache: &mut HashMap<u64, V>) {
        if cache.len() >= capacity {
            cache.clear();
        }
    }

    fn lookup<'a, V>(cache: &'a HashMap<u64, CacheEntry<V>>, key: u64, query: Query<'_>) -> Option<&'a V> {
        cache
            .get(&key)
            .filter(|entry| entry.answers(query))
            .map(|entry| &entry.value)
    }

    pub(crate) fn check_keyed(&mut self, key: u64, query: Query<'_>) -> SatResult {
        if let Some(result) = Self::lookup(&self.results, key, query) {
            self.stats.hits += 1;
            return *result;
        }

        self.stats.misses += 1;
        let result = self.inner.check(query);
        if result != SatResult::Unknown {
            Self::make_room(self.capacity, &mut self.results);
            self.results.insert(key, CacheEntry::new(query, result));
        }

        result
    }

    pub(crate) fn model_keyed(
        &mut self,
        key: u64,
        query: Query<'_>,
    ) -> Option<VariableAssignments> {
        if let Some(model) = Self::lookup(&self.models, key, query) {
            self.stats.hits += 1;
            return model.clone();
        }

        self.stats.misses += 1;
        let model = self.inner.model(query);

        // A missing model may be unsat or undecided; only cache it when unsat is confirmed
        let unsat = Self::lookup(&self.results, key, query) == Some(&SatResult::Unsat);
        if model.is_some() || unsat {
            Self::make_room(self.capacity, &mut self.models);
            self.models.insert(key, CacheEntry::new(query, model.clone()));
        }

        model
    }
}

impl<S: Solver> Solver for CachingSolver<S> {
    fn check(&mut self, query: Query<'_>) -> SatResult {
        if self.capacity == 0 {
            return self.inner.check(query);
        }

        self.check_keyed(query.cache_key(), query)
    }

    fn model(&mut self, query: Query<'_>) -> Option<VariableAssignments> {
        if self.capacity == 0 {
            return self.inner.model(query);
        }

        self.model_keyed(query.cache_key(), query)
    }
}
