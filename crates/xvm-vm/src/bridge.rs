//! Contract bridge: the table of live call contexts.
//!
//! Guest code only ever sees an opaque numeric call-id. Host functions map
//! it back to the [`Context`] through [`ContextManager::lookup`].

use crate::reentrancy::SharedCallChain;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use xvm_storage::StateCache;
use xvm_types::{ContractEvent, Limits, Response};

/// Inputs for a new context.
#[derive(Clone)]
pub struct ContextParams {
    pub contract_name: String,
    pub method: String,
    pub args: BTreeMap<String, Vec<u8>>,
    pub initiator: String,
    pub auth_require: Vec<String>,
    pub limits: Limits,
    pub state: Arc<StateCache>,
    pub call_chain: SharedCallChain,
    pub parent: Option<u64>,
    pub can_initialize: bool,
}

/// Per-call state shared between the engine and host functions.
pub struct Context {
    pub id: u64,
    pub contract_name: String,
    pub method: String,
    pub args: BTreeMap<String, Vec<u8>>,
    pub initiator: String,
    pub auth_require: Vec<String>,
    pub limits: Limits,
    pub state: Arc<StateCache>,
    pub call_chain: SharedCallChain,
    pub parent: Option<u64>,
    pub can_initialize: bool,
    output: Mutex<ContextOutput>,
}

/// Everything a call produces besides its usage counters.
#[derive(Debug, Default, Clone)]
pub struct ContextOutput {
    pub response: Option<Response>,
    pub events: Vec<ContractEvent>,
    pub logs: Vec<String>,
    /// Usage rolled up from nested calls
    pub sub_usage: Limits,
}

impl Context {
    fn new(id: u64, params: ContextParams) -> Self {
        Self {
            id,
            contract_name: params.contract_name,
            method: params.method,
            args: params.args,
            initiator: params.initiator,
            auth_require: params.auth_require,
            limits: params.limits,
            state: params.state,
            call_chain: params.call_chain,
            parent: params.parent,
            can_initialize: params.can_initialize,
            output: Mutex::new(ContextOutput::default()),
        }
    }

    pub fn set_output(&self, response: Response) {
        self.output.lock().response = Some(response);
    }

    pub fn emit_event(&self, name: String, body: Vec<u8>) {
        self.output.lock().events.push(ContractEvent {
            contract: self.contract_name.clone(),
            name,
            body,
        });
    }

    pub fn post_log(&self, entry: String) {
        self.output.lock().logs.push(entry);
    }

    /// Fold a finished nested call into this context.
    pub fn absorb_child(&self, used: &Limits, events: Vec<ContractEvent>, logs: Vec<String>) {
        let mut out = self.output.lock();
        out.sub_usage.cpu = out.sub_usage.cpu.saturating_add(used.cpu);
        out.sub_usage.memory = out.sub_usage.memory.max(used.memory);
        out.events.extend(events);
        out.logs.extend(logs);
    }

    pub fn sub_usage(&self) -> Limits {
        self.output.lock().sub_usage
    }

    pub fn take_output(&self) -> ContextOutput {
        std::mem::take(&mut *self.output.lock())
    }
}

/// Owns the mapping from call-id to live context.
pub struct ContextManager {
    inner: Mutex<ContextTable>,
}

struct ContextTable {
    next_id: u64,
    contexts: HashMap<u64, Arc<Context>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ContextTable {
                // 0 is never handed out
                next_id: 1,
                contexts: HashMap::new(),
            }),
        }
    }

    /// Register a context under the next id.
    pub fn allocate(&self, params: ContextParams) -> Arc<Context> {
        let mut table = self.inner.lock();
        let id = table.next_id;
        table.next_id += 1;
        let ctx = Arc::new(Context::new(id, params));
        table.contexts.insert(id, ctx.clone());
        ctx
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Context>> {
        self.inner.lock().contexts.get(&id).cloned()
    }

    pub fn release(&self, id: u64) -> Option<Arc<Context>> {
        let released = self.inner.lock().contexts.remove(&id);
        if released.is_none() {
            tracing::warn!(ctxid = id, "release of unknown context");
        }
        released
    }

    /// Allocate a context that is released when the guard drops.
    pub fn scope(&self, params: ContextParams) -> ContextGuard<'_> {
        let ctx = self.allocate(params);
        ContextGuard { manager: self, ctx }
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ContextGuard<'a> {
    manager: &'a ContextManager,
    ctx: Arc<Context>,
}

impl ContextGuard<'_> {
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn id(&self) -> u64 {
        self.ctx.id
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.ctx.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reentrancy::ReentrancyGuard;
    use xvm_storage::MemoryStore;

    fn params(name: &str) -> ContextParams {
        ContextParams {
            contract_name: name.to_string(),
            method: "increase".to_string(),
            args: BTreeMap::new(),
            initiator: String::new(),
            auth_require: Vec::new(),
            limits: Limits::max(),
            state: Arc::new(StateCache::new(Arc::new(MemoryStore::new()))),
            call_chain: Arc::new(Mutex::new(ReentrancyGuard::new())),
            parent: None,
            can_initialize: false,
        }
    }

    #[test]
    fn test_allocate_lookup_release() {
        let manager = ContextManager::new();
        let ctx = manager.allocate(params("counter"));
        assert_eq!(manager.len(), 1);

        let found = manager.lookup(ctx.id).unwrap();
        assert_eq!(found.contract_name, "counter");

        assert!(manager.release(ctx.id).is_some());
        assert!(manager.lookup(ctx.id).is_none());
        assert!(manager.release(ctx.id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_ids_are_monotonic_and_not_reused() {
        let manager = ContextManager::new();
        let a = manager.allocate(params("aaaa")).id;
        manager.release(a);
        let b = manager.allocate(params("bbbb")).id;
        assert!(b > a);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = ContextManager::new();
        let id = {
            let guard = manager.scope(params("counter"));
            assert!(manager.lookup(guard.id()).is_some());
            guard.id()
        };
        assert!(manager.lookup(id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let manager = ContextManager::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = manager.scope(params("counter"));
            panic!("guest blew up");
        }));
        assert!(result.is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_output_collection() {
        let manager = ContextManager::new();
        let ctx = manager.allocate(params("counter"));
        ctx.set_output(Response::ok(b"1".to_vec()));
        ctx.emit_event("inc".into(), vec![1]);
        ctx.post_log("hello".into());
        ctx.absorb_child(&Limits::new(10, 100, 0), vec![], vec!["child".into()]);
        ctx.absorb_child(&Limits::new(5, 50, 0), vec![], vec![]);

        assert_eq!(ctx.sub_usage(), Limits::new(15, 100, 0));
        let out = ctx.take_output();
        assert_eq!(out.response.unwrap().body, b"1");
        assert_eq!(out.events[0].contract, "counter");
        assert_eq!(out.logs, vec!["hello", "child"]);
    }

    #[test]
    fn test_concurrent_allocation_unique_ids() {
        let manager = Arc::new(ContextManager::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let guard = m.scope(params("counter"));
                            guard.id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert!(manager.is_empty());
    }
}
