use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    future::Future,
    hash::Hash,
    sync::Arc,
};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A map whose mutations are serialized per key.
///
/// Every mutating operation is an *action* on its key. A key runs at most one action at a time;
/// actions submitted while one is in flight are queued and run in submission order, and a failed
/// action does not skip the actions queued behind it. Keys are independent: actions for different
/// keys overlap freely.
///
/// Actions take their place in the key's queue when the operation is *called*; their effect is
/// applied when the returned future runs at its turn. Snapshot accessors ([`get`](Self::get),
/// [`len`](Self::len), [`keys`](Self::keys), ...) never wait: they observe the state as of the
/// most recent completed action and ignore everything still queued.
///
/// Clones share the same underlying map.
pub struct SerialMap<K, V> {
    state: Arc<Mutex<State<K, V>>>,
}

struct State<K, V> {
    current: IndexMap<K, V>,
    /// Keys with an action in flight. An empty queue means one action is running with none queued
    /// behind it; the entry is removed when the last action for the key completes.
    pending: HashMap<K, VecDeque<TurnWaiter>>,
    next_id: u64,
}

struct TurnWaiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

impl<K: Eq + Hash, V> State<K, V> {
    /// Hands the key's turn to the next queued action, dropping the key from `pending` when
    /// nothing is queued. Completing the oneshot defers the successor to the executor, so chained
    /// actions never run as nested calls.
    fn advance(&mut self, key: &K) {
        loop {
            let Some(queue) = self.pending.get_mut(key) else { return };
            match queue.pop_front() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                    // That action was abandoned while queued; hand the turn onwards.
                }
                None => {
                    self.pending.remove(key);
                    return;
                }
            }
        }
    }
}

/// One action's claim on its key. Armed from the moment the action is enqueued until it finishes;
/// dropping an armed token removes the action from the queue, or advances the chain when the turn
/// was already handed to it, so an abandoned caller can never wedge its key.
struct TurnToken<K: Eq + Hash, V> {
    state: Arc<Mutex<State<K, V>>>,
    key: K,
    id: u64,
    finished: bool,
}

impl<K: Eq + Hash, V> TurnToken<K, V> {
    /// A snapshot of the key's value, taken at this action's turn.
    fn current_value(&self) -> Option<V>
    where
        V: Clone,
    {
        self.state.lock().current.get(&self.key).cloned()
    }

    /// Applies `f` to the map and hands the turn to the next queued action, in one critical
    /// section.
    fn finish<R>(&mut self, f: impl FnOnce(&mut IndexMap<K, V>, &K) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state.current, &self.key);
        state.advance(&self.key);
        self.finished = true;
        result
    }
}

impl<K: Eq + Hash, V> Drop for TurnToken<K, V> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.state.lock();
        let removed = state.pending.get_mut(&self.key).is_some_and(|queue| {
            if let Some(pos) = queue.iter().position(|w| w.id == self.id) {
                queue.remove(pos);
                true
            } else {
                false
            }
        });
        if !removed {
            // The turn was already ours; pass it on.
            state.advance(&self.key);
        }
    }
}

impl<K, V> SerialMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State { current: IndexMap::new(), pending: HashMap::new(), next_id: 0 })) }
    }

    /// Claims a place in the key's action queue. Returns the token tracking the claim and, when
    /// another action is already in flight for the key, the completion signalling this action's
    /// turn.
    fn begin(&self, key: K) -> (TurnToken<K, V>, Option<oneshot::Receiver<()>>) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let rx = match state.pending.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                None
            }
            Entry::Occupied(mut slot) => {
                let (tx, rx) = oneshot::channel();
                slot.get_mut().push_back(TurnWaiter { id, tx });
                Some(rx)
            }
        };
        drop(state);
        (TurnToken { state: self.state.clone(), key, id, finished: false }, rx)
    }

    /// The backbone of every direct mutation: wait for the key's turn, apply `apply`, hand the
    /// turn onwards.
    fn mutate<F, R>(&self, key: K, apply: F) -> impl Future<Output = R>
    where
        F: FnOnce(&mut IndexMap<K, V>, &K) -> R,
    {
        let (mut token, rx) = self.begin(key);
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            token.finish(apply)
        }
    }

    // --- Snapshot accessors ---

    /// The number of entries, as of the most recent completed action.
    pub fn len(&self) -> usize {
        self.state.lock().current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().current.is_empty()
    }

    /// The key's value as of the most recent completed action. Never waits; queued actions are
    /// not reflected. See [`get_latest`](Self::get_latest) for a read that is.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.state.lock().current.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.state.lock().current.contains_key(key)
    }

    /// All keys, in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.state.lock().current.keys().cloned().collect()
    }

    /// All values, in key insertion order.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.state.lock().current.values().cloned().collect()
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.state.lock().current.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Calls `f` for every entry of a point-in-time snapshot, in insertion order.
    pub fn for_each<F>(&self, mut f: F)
    where
        V: Clone,
        F: FnMut(&K, &V),
    {
        for (key, value) in self.entries() {
            f(&key, &value);
        }
    }

    /// A point-in-time copy of the whole map.
    pub fn snapshot(&self) -> IndexMap<K, V>
    where
        V: Clone,
    {
        self.state.lock().current.clone()
    }

    // --- Direct mutations ---

    /// Queues a read of the key's value behind every action already queued for it, resolving with
    /// the value those actions leave behind.
    pub fn get_latest(&self, key: K) -> impl Future<Output = Option<V>>
    where
        V: Clone,
    {
        self.mutate(key, |current, key| current.get(key).cloned())
    }

    /// Sets the key's value, resolving with the previous value.
    pub fn insert(&self, key: K, value: V) -> impl Future<Output = Option<V>> {
        self.mutate(key, move |current, key| current.insert(key.clone(), value))
    }

    /// Removes the key, resolving with the removed value.
    pub fn remove(&self, key: K) -> impl Future<Output = Option<V>> {
        self.mutate(key, |current, key| current.shift_remove(key))
    }

    /// Removes the key only if its value equals `expected`, resolving with whether it did.
    pub fn remove_if_equals(&self, key: K, expected: V) -> impl Future<Output = bool>
    where
        V: PartialEq,
    {
        self.mutate(key, move |current, key| {
            if current.get(key).is_some_and(|v| *v == expected) {
                current.shift_remove(key);
                true
            } else {
                false
            }
        })
    }

    /// Sets the key's value only if the key has none, resolving with the already-present value if
    /// there was one.
    pub fn insert_if_absent(&self, key: K, value: V) -> impl Future<Output = Option<V>>
    where
        V: Clone,
    {
        self.mutate(key, move |current, key| match current.get(key) {
            Some(existing) => Some(existing.clone()),
            None => {
                current.insert(key.clone(), value);
                None
            }
        })
    }

    /// Sets the key's value only if the key already has one, resolving with the previous value.
    pub fn replace(&self, key: K, value: V) -> impl Future<Output = Option<V>> {
        self.mutate(key, move |current, key| {
            if current.contains_key(key) {
                current.insert(key.clone(), value)
            } else {
                None
            }
        })
    }

    /// Sets the key's value only if it currently equals `expected`, resolving with whether it did.
    pub fn replace_if_equals(&self, key: K, expected: V, value: V) -> impl Future<Output = bool>
    where
        V: PartialEq,
    {
        self.mutate(key, move |current, key| {
            if current.get(key).is_some_and(|v| *v == expected) {
                current.insert(key.clone(), value);
                true
            } else {
                false
            }
        })
    }

    /// Removes every current entry and resolves once the keys with in-flight actions have settled.
    ///
    /// The removal of the entries themselves is immediate: snapshot accessors see an empty map as
    /// soon as this returns, before the future is awaited. For each key with actions in flight a
    /// deletion is queued behind them, so whatever those actions publish is swept once they finish.
    /// Entries inserted after this call are kept.
    pub fn clear(&self) -> impl Future<Output = ()> {
        let tails = {
            let mut state = self.state.lock();
            let keys: Vec<K> = state.current.keys().cloned().collect();
            state.current.clear();
            let mut tails = Vec::new();
            for key in keys {
                if !state.pending.contains_key(&key) {
                    continue;
                }
                let id = state.next_id;
                state.next_id += 1;
                let (tx, rx) = oneshot::channel();
                if let Some(queue) = state.pending.get_mut(&key) {
                    queue.push_back(TurnWaiter { id, tx });
                }
                tails.push((TurnToken { state: self.state.clone(), key, id, finished: false }, rx));
            }
            tails
        };
        async move {
            for (mut token, rx) in tails {
                let _ = rx.await;
                token.finish(|current, key| {
                    current.shift_remove(key);
                });
            }
        }
    }

    // --- Asynchronous compute ---

    /// Computes a new value for the key from the present one. `f` runs at the key's turn with the
    /// value as of that moment; resolving to `Some` sets the value, to `None` removes the entry.
    /// Resolves with the newly computed value. If `f` fails the entry is left untouched and the
    /// error is propagated.
    pub fn compute<F, Fut, E>(&self, key: K, f: F) -> impl Future<Output = Result<Option<V>, E>>
    where
        V: Clone,
        F: FnOnce(&K, Option<V>) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let (mut token, rx) = self.begin(key);
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            let old = token.current_value();
            match f(&token.key, old).await {
                Ok(Some(value)) => {
                    token.finish(|current, key| current.insert(key.clone(), value.clone()));
                    Ok(Some(value))
                }
                Ok(None) => {
                    token.finish(|current, key| {
                        current.shift_remove(key);
                    });
                    Ok(None)
                }
                Err(e) => {
                    token.finish(|_, _| ());
                    Err(e)
                }
            }
        }
    }

    /// Computes a value for the key only when it has none; a present value is returned as is,
    /// without invoking `f`. Resolves with the value the key ends up with.
    pub fn compute_if_absent<F, Fut, E>(&self, key: K, f: F) -> impl Future<Output = Result<Option<V>, E>>
    where
        V: Clone,
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let (mut token, rx) = self.begin(key);
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            if let Some(existing) = token.current_value() {
                token.finish(|_, _| ());
                return Ok(Some(existing));
            }
            match f(&token.key).await {
                Ok(Some(value)) => {
                    token.finish(|current, key| current.insert(key.clone(), value.clone()));
                    Ok(Some(value))
                }
                Ok(None) => {
                    token.finish(|_, _| ());
                    Ok(None)
                }
                Err(e) => {
                    token.finish(|_, _| ());
                    Err(e)
                }
            }
        }
    }

    /// Computes a new value for the key only when it already has one; an absent key resolves to
    /// `None` without invoking `f`. Resolving to `None` removes the entry.
    pub fn compute_if_present<F, Fut, E>(&self, key: K, f: F) -> impl Future<Output = Result<Option<V>, E>>
    where
        V: Clone,
        F: FnOnce(&K, V) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let (mut token, rx) = self.begin(key);
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            let Some(old) = token.current_value() else {
                token.finish(|_, _| ());
                return Ok(None);
            };
            match f(&token.key, old).await {
                Ok(Some(value)) => {
                    token.finish(|current, key| current.insert(key.clone(), value.clone()));
                    Ok(Some(value))
                }
                Ok(None) => {
                    token.finish(|current, key| {
                        current.shift_remove(key);
                    });
                    Ok(None)
                }
                Err(e) => {
                    token.finish(|_, _| ());
                    Err(e)
                }
            }
        }
    }

    /// Stores `value` when the key is absent; otherwise combines the present value with `value`
    /// through `f` and applies the result, removing the entry when `f` resolves to `None`.
    pub fn merge<F, Fut, E>(&self, key: K, value: V, f: F) -> impl Future<Output = Result<Option<V>, E>>
    where
        V: Clone,
        F: FnOnce(V, V) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let (mut token, rx) = self.begin(key);
        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            match token.current_value() {
                None => {
                    token.finish(|current, key| current.insert(key.clone(), value.clone()));
                    Ok(Some(value))
                }
                Some(old) => match f(old, value).await {
                    Ok(Some(merged)) => {
                        token.finish(|current, key| current.insert(key.clone(), merged.clone()));
                        Ok(Some(merged))
                    }
                    Ok(None) => {
                        token.finish(|current, key| {
                            current.shift_remove(key);
                        });
                        Ok(None)
                    }
                    Err(e) => {
                        token.finish(|_, _| ());
                        Err(e)
                    }
                },
            }
        }
    }
}

impl<K: Eq + Hash + Clone, V> Default for SerialMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for SerialMap<K, V> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };
    use thiserror::Error;
    use tokio::time::{sleep, timeout};

    const BOUND: Duration = Duration::from_secs(2);

    #[derive(Error, Debug, PartialEq, Eq)]
    #[error("computation failed")]
    struct ComputeFailed;

    #[tokio::test]
    async fn test_insert_remove_get() {
        let map = SerialMap::new();
        assert!(map.is_empty());
        assert_eq!(map.insert(1, 10).await, None);
        assert_eq!(map.insert(1, 11).await, Some(10));
        assert_eq!(map.get(&1), Some(11));
        assert!(map.contains_key(&1));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(1).await, Some(11));
        assert_eq!(map.remove(1).await, None);
        assert!(map.is_empty());

        // Effects land when the returned future runs, not at the call
        let pending = map.insert(9, 9);
        assert!(!map.contains_key(&9));
        pending.await;
        assert!(map.contains_key(&9));
    }

    #[tokio::test]
    async fn test_insertion_order_is_preserved() {
        let map = SerialMap::new();
        map.insert("a", 1).await;
        map.insert("b", 2).await;
        map.insert("c", 3).await;
        assert_eq!(map.keys(), vec!["a", "b", "c"]);

        // Updating keeps the position, re-inserting after removal goes to the back
        map.insert("b", 20).await;
        assert_eq!(map.keys(), vec!["a", "b", "c"]);
        map.remove("b").await;
        map.insert("b", 21).await;
        assert_eq!(map.keys(), vec!["a", "c", "b"]);
        assert_eq!(map.values(), vec![1, 3, 21]);
        assert_eq!(map.entries(), vec![("a", 1), ("c", 3), ("b", 21)]);

        let mut seen = Vec::new();
        map.for_each(|k, v| seen.push((*k, *v)));
        assert_eq!(seen, vec![("a", 1), ("c", 3), ("b", 21)]);
        assert_eq!(map.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_conditional_updates() {
        let map = SerialMap::new();
        assert_eq!(map.insert_if_absent(1, 10).await, None);
        assert_eq!(map.insert_if_absent(1, 11).await, Some(10));
        assert_eq!(map.get(&1), Some(10));

        assert_eq!(map.replace(1, 12).await, Some(10));
        assert_eq!(map.replace(2, 1).await, None);
        assert!(!map.contains_key(&2));

        assert!(map.replace_if_equals(1, 12, 13).await);
        assert!(!map.replace_if_equals(1, 12, 14).await);
        assert_eq!(map.get(&1), Some(13));

        assert!(!map.remove_if_equals(1, 12).await);
        assert!(map.remove_if_equals(1, 13).await);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_compute_variants() {
        let map = SerialMap::new();

        let computed = map
            .compute(1, |key: &i32, old| {
                assert_eq!(old, None);
                let key = *key;
                async move { Ok::<_, ComputeFailed>(Some(key + 1)) }
            })
            .await;
        assert_eq!(computed, Ok(Some(2)));

        let computed = map
            .compute(1, |_key: &i32, old| async move {
                assert_eq!(old, Some(2));
                Ok::<_, ComputeFailed>(Some(5))
            })
            .await;
        assert_eq!(computed, Ok(Some(5)));

        // Computing no value removes the entry
        let computed = map.compute(1, |_key: &i32, _old| async move { Ok::<_, ComputeFailed>(None) }).await;
        assert_eq!(computed, Ok(None));
        assert!(!map.contains_key(&1));

        // An absent key does not invoke the compute_if_present function
        let calls = Arc::new(AtomicUsize::new(0));
        let result = map
            .compute_if_present(1, {
                let calls = calls.clone();
                move |_key: &i32, old: i32| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, ComputeFailed>(Some(old + 1)) }
                }
            })
            .await;
        assert_eq!(result, Ok(None));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        map.insert(1, 7).await;
        let result = map.compute_if_present(1, |_key: &i32, old: i32| async move { Ok::<_, ComputeFailed>(Some(old + 1)) }).await;
        assert_eq!(result, Ok(Some(8)));
        assert_eq!(map.get(&1), Some(8));
    }

    #[tokio::test]
    async fn test_compute_if_absent_single_flight() {
        let map = SerialMap::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = map.compute_if_absent(1, {
            let calls = calls.clone();
            move |key: &i32| {
                let key = *key;
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    sleep(Duration::from_millis(20)).await;
                    Ok::<_, ComputeFailed>(Some(key.to_string()))
                }
            }
        });
        let second = map.compute_if_absent(1, {
            let calls = calls.clone();
            move |key: &i32| {
                let key = *key;
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, ComputeFailed>(Some(format!("{}!", key))) }
            }
        });

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Ok(Some("1".to_string())));
        // The second call found the computed value and did not run its function
        assert_eq!(second, Ok(Some("1".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merge() {
        let map = SerialMap::new();
        let calls = Arc::new(AtomicUsize::new(0));

        // An absent key takes the given value without invoking the function
        let merged = map
            .merge(1, 5, {
                let calls = calls.clone();
                move |old: i32, new: i32| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, ComputeFailed>(Some(old + new)) }
                }
            })
            .await;
        assert_eq!(merged, Ok(Some(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let merged = map.merge(1, 3, |old: i32, new: i32| async move { Ok::<_, ComputeFailed>(Some(old + new)) }).await;
        assert_eq!(merged, Ok(Some(8)));

        // A merge resolving to no value removes the entry
        let merged = map.merge(1, 0, |_old: i32, _new: i32| async move { Ok::<_, ComputeFailed>(None) }).await;
        assert_eq!(merged, Ok(None));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reads_ignore_pending_computes() {
        let map = SerialMap::new();
        for k in 0..5 {
            map.insert(k, k * 2).await;
        }

        let mut tasks = Vec::new();
        for k in 0..5i32 {
            let fut = map.compute(k, move |key: &i32, _old| {
                let key = *key;
                async move {
                    sleep(Duration::from_millis(50)).await;
                    Ok::<_, ComputeFailed>(Some(key + 10))
                }
            });
            tasks.push(tokio::spawn(fut));
        }

        for k in 0..5 {
            assert_eq!(map.get(&k), Some(k * 2));
        }
        for joined in timeout(BOUND, join_all(tasks)).await.unwrap() {
            joined.unwrap().unwrap();
        }
        for k in 0..5 {
            assert_eq!(map.get(&k), Some(k + 10));
        }
        assert_eq!(map.len(), 5);
    }

    #[tokio::test]
    async fn test_same_key_actions_serialize() {
        let map = SerialMap::new();
        let start = Instant::now();
        let first = map.compute(1, |_key: &i32, _old| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<_, ComputeFailed>(Some(1))
        });
        let second = map.compute(1, |_key: &i32, old| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<_, ComputeFailed>(Some(old.unwrap() + 1))
        });
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Ok(Some(1)));
        assert_eq!(second, Ok(Some(2)));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_different_keys_overlap() {
        let map = SerialMap::new();
        let start = Instant::now();
        let first = map.compute(1, |_key: &i32, _old| async move {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, ComputeFailed>(Some(1))
        });
        let second = map.compute(2, |_key: &i32, _old| async move {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, ComputeFailed>(Some(2))
        });
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Ok(Some(1)));
        assert_eq!(second, Ok(Some(2)));
        assert!(start.elapsed() < Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_failed_action_does_not_skip_queue() {
        let map = SerialMap::new();
        map.insert(1, 1).await;

        let failing = map.compute(1, |_key: &i32, _old| async move { Err::<Option<i32>, _>(ComputeFailed) });
        let set = map.insert(1, 9);
        let latest = map.get_latest(1);

        let (failed, old, value) = tokio::join!(failing, set, latest);
        assert_eq!(failed, Err(ComputeFailed));
        // The failed compute left the value untouched, so the insert saw it
        assert_eq!(old, Some(1));
        assert_eq!(value, Some(9));
        assert_eq!(map.get(&1), Some(9));
    }

    #[tokio::test]
    async fn test_get_latest_waits_for_queued_actions() {
        let map = SerialMap::new();
        map.insert(1, 1).await;

        let update = map.compute(1, |_key: &i32, _old| async move {
            sleep(Duration::from_millis(30)).await;
            Ok::<_, ComputeFailed>(Some(2))
        });
        let latest = map.get_latest(1);
        assert_eq!(map.get(&1), Some(1));

        let (updated, value) = tokio::join!(update, latest);
        assert_eq!(updated, Ok(Some(2)));
        assert_eq!(value, Some(2));
    }

    #[tokio::test]
    async fn test_clear_idle_entries() {
        let map = SerialMap::new();
        map.insert(1, 1).await;
        map.insert(2, 2).await;

        let clear = map.clear();
        assert!(map.is_empty());
        timeout(BOUND, clear).await.unwrap();

        map.insert(3, 3).await;
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_with_pending_actions() {
        let map = SerialMap::new();
        for k in 0..5 {
            map.insert(k, k * 2).await;
        }

        let mut tasks = Vec::new();
        for k in 0..5i32 {
            let fut = map.compute(k, move |key: &i32, _old| {
                let key = *key;
                async move {
                    sleep(Duration::from_millis(50)).await;
                    Ok::<_, ComputeFailed>(Some(key + 10))
                }
            });
            tasks.push(tokio::spawn(fut));
        }

        let start = Instant::now();
        let clear = map.clear();
        // The entries are gone immediately; the completion waits for the in-flight computes
        assert_eq!(map.len(), 0);
        assert_eq!(map.get(&0), None);

        timeout(BOUND, clear).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        for joined in timeout(BOUND, join_all(tasks)).await.unwrap() {
            joined.unwrap().unwrap();
        }
        assert!(map.is_empty());
        for k in 0..5 {
            assert!(!map.contains_key(&k));
        }
        assert!(map.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_actions_do_not_wedge_the_key() {
        let map = SerialMap::new();

        // Abandoned before it ever ran
        drop(map.insert(1, 1));
        timeout(BOUND, map.insert(1, 2)).await.unwrap();
        assert_eq!(map.get(&1), Some(2));

        // Abandoned while queued behind a running action
        let running = map.compute(1, |_key: &i32, _old| async move {
            sleep(Duration::from_millis(30)).await;
            Ok::<_, ComputeFailed>(Some(3))
        });
        let abandoned = map.insert(1, 4);
        let surviving = map.insert(1, 5);
        drop(abandoned);

        let (computed, old) = tokio::join!(running, surviving);
        assert_eq!(computed, Ok(Some(3)));
        assert_eq!(old, Some(3));
        assert_eq!(map.get(&1), Some(5));
        assert!(map.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_shared_handles_observe_the_same_map() {
        let map = SerialMap::new();
        let other = map.clone();
        map.insert(1, 1).await;
        assert_eq!(other.get(&1), Some(1));
        other.remove(1).await;
        assert!(map.is_empty());
    }
}
