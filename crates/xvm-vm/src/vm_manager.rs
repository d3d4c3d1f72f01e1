//! VM manager: deploy, invoke and upgrade.
//!
//! [`VmCore`] owns the context table, the code cache and the state store.
//! Host functions reach it through the [`HostState`] of their instance, so
//! nested contract calls re-enter the same core.

use crate::bridge::{Context, ContextManager, ContextParams};
use crate::chain::{ChainReader, NullChain};
use crate::code_manager::{CacheStats, CodeManager, CodeProvider, CompiledArtifact};
use crate::compiler::{AotCompiler, Compiler, CompilerKind, InterpCompiler};
use crate::config::{Driver, VmConfig};
use crate::error::{TrapKind, VmError};
use crate::gas_metering::GasTracker;
use crate::host::HostState;
use crate::reentrancy::{CallScope, ReentrancyGuard, SharedCallChain};
use crate::resolver::default_resolver;
use crate::runtime;
use crate::syscall::ContractCallRequest;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use xvm_storage::{StateCache, StateStore};
use xvm_types::{
    validate_contract_name, ContractDescriptor, ContractEvent, Digest, Limits, Resource, Response,
};

/// Bucket holding contract descriptors and bytecode.
pub const CONTRACT_BUCKET: &str = "contract";

pub const INITIALIZE_METHOD: &str = "initialize";

pub fn descriptor_key(name: &str) -> Vec<u8> {
    format!("{}.desc", name).into_bytes()
}

pub fn code_key(name: &str) -> Vec<u8> {
    format!("{}.code", name).into_bytes()
}

/// Reads contracts out of a state cache.
pub struct StateProvider<'a> {
    state: &'a StateCache,
}

impl<'a> StateProvider<'a> {
    pub fn new(state: &'a StateCache) -> Self {
        Self { state }
    }
}

impl CodeProvider for StateProvider<'_> {
    fn get_descriptor(&self, name: &str) -> Result<ContractDescriptor, VmError> {
        let data = self
            .state
            .get(CONTRACT_BUCKET, &descriptor_key(name))?
            .ok_or_else(|| VmError::ContractNotFound(name.to_string()))?;
        Ok(ContractDescriptor::from_json(&data)?)
    }

    fn get_code(&self, name: &str) -> Result<Vec<u8>, VmError> {
        self.state
            .get(CONTRACT_BUCKET, &code_key(name))?
            .ok_or_else(|| VmError::ContractNotFound(name.to_string()))
    }
}

/// Serves code that is not in state yet.
struct DeployProvider<'a> {
    desc: &'a ContractDescriptor,
    code: &'a [u8],
}

impl CodeProvider for DeployProvider<'_> {
    fn get_descriptor(&self, name: &str) -> Result<ContractDescriptor, VmError> {
        if name != self.desc.contract_name {
            return Err(VmError::ContractNotFound(name.to_string()));
        }
        Ok(self.desc.clone())
    }

    fn get_code(&self, name: &str) -> Result<Vec<u8>, VmError> {
        if name != self.desc.contract_name {
            return Err(VmError::ContractNotFound(name.to_string()));
        }
        Ok(self.code.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub contract_name: String,
    pub code: Vec<u8>,
    /// Runtime tag and metadata. Name, digest and compiler version are
    /// filled in by the engine.
    pub descriptor: ContractDescriptor,
    pub init_args: BTreeMap<String, Vec<u8>>,
    pub initiator: String,
    pub auth_require: Vec<String>,
    pub limits: Limits,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub contract: String,
    pub method: String,
    pub args: BTreeMap<String, Vec<u8>>,
    pub initiator: String,
    pub auth_require: Vec<String>,
    pub limits: Limits,
}

#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub contract_name: String,
    pub code: Vec<u8>,
    pub limits: Limits,
}

/// Outcome of one top-level call. Usage is reported on every path.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Result<Response, VmError>,
    pub used: Limits,
    /// Events of a successful call
    pub events: Vec<ContractEvent>,
    pub logs: Vec<String>,
}

impl Execution {
    fn rejected(err: VmError) -> Self {
        Self {
            outcome: Err(err),
            used: Limits::default(),
            events: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn response(&self) -> Option<&Response> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&VmError> {
        self.outcome.as_ref().err()
    }
}

/// Shared engine state.
pub struct VmCore {
    config: VmConfig,
    contexts: ContextManager,
    codes: CodeManager,
    store: Arc<dyn StateStore>,
    chain: Arc<dyn ChainReader>,
}

impl VmCore {
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn codes(&self) -> &CodeManager {
        &self.codes
    }

    pub fn chain(&self) -> &dyn ChainReader {
        self.chain.as_ref()
    }

    fn new_call_chain(&self) -> SharedCallChain {
        Arc::new(Mutex::new(ReentrancyGuard::with_max_depth(
            self.config.max_call_depth,
        )))
    }

    fn gas_tracker(&self, limits: &Limits) -> GasTracker {
        GasTracker::new(limits.cpu, self.config.gas)
    }

    /// Instantiate without running anything, to prove the code links.
    fn validate(
        self: &Arc<Self>,
        artifact: &CompiledArtifact,
        limits: &Limits,
    ) -> Result<(), VmError> {
        // ctxid 0 is never allocated
        let host = HostState::new(0, self.clone(), self.gas_tracker(limits));
        artifact.code.instantiate(host, limits).map(drop)
    }

    /// Run one method in a fresh context.
    pub(crate) fn execute(
        self: &Arc<Self>,
        artifact: &CompiledArtifact,
        params: ContextParams,
    ) -> Execution {
        if params.method == INITIALIZE_METHOD && !params.can_initialize {
            return Execution::rejected(VmError::InitializeForbidden);
        }

        let limits = params.limits;
        let state = params.state.clone();
        let entry = artifact.desc.runtime.entry_point(&params.method);
        let guard = self.contexts.scope(params);
        let ctx = guard.context().clone();

        let host = HostState::new(ctx.id, self.clone(), self.gas_tracker(&limits));
        let mut gas_used = 0;
        let mut memory = 0;
        let runtime = artifact.desc.runtime;
        let result = artifact.code.instantiate(host, &limits).and_then(|mut instance| {
            let result = runtime::prepare(runtime, instance.as_mut())
                .and_then(|()| instance.exec(&entry));
            gas_used = instance.gas_used();
            memory = instance.memory_size();
            result
        });

        let output = ctx.take_output();
        drop(guard);

        // Nested calls were already billed to this instance's fuel
        let mut used = Limits {
            cpu: gas_used,
            memory: memory.max(output.sub_usage.memory),
            disk: state.disk_usage(),
        };
        if let Err(VmError::Trap(TrapKind::OutOfGas { used: trapped, .. })) = &result {
            used.cpu = used.cpu.max(*trapped);
        }

        let outcome = result
            .and_then(|()| check_usage(&used, &limits))
            .and_then(|()| {
                let response = output.response.unwrap_or_else(|| Response::ok(Vec::new()));
                if response.is_error() {
                    Err(VmError::Contract {
                        status: response.status,
                        message: response.message,
                    })
                } else {
                    Ok(response)
                }
            });

        tracing::debug!(
            contract = %ctx.contract_name,
            method = %ctx.method,
            ctxid = ctx.id,
            parent = ?ctx.parent,
            used = %used,
            ok = outcome.is_ok(),
            "call finished"
        );

        let events = if outcome.is_ok() { output.events } else { Vec::new() };
        Execution {
            outcome,
            used,
            events,
            logs: output.logs,
        }
    }

    /// Nested call made through the `ContractCall` syscall. A contract
    /// level failure of the callee is returned as its response.
    pub(crate) fn contract_call(
        self: &Arc<Self>,
        parent: &Context,
        budget: u64,
        req: ContractCallRequest,
    ) -> Result<Response, VmError> {
        if !req.module.is_empty() && req.module != "wasm" {
            return Err(VmError::ContractNotFound(format!(
                "{}/{}",
                req.module, req.contract
            )));
        }

        let scope = CallScope::enter(&parent.call_chain, &req.contract, &req.method)?;
        let provider = StateProvider::new(&parent.state);
        let desc = provider.get_descriptor(&req.contract)?;
        let artifact = self.codes.get_or_compile(&provider, &desc)?;

        let params = ContextParams {
            contract_name: req.contract,
            method: req.method,
            args: req.args.into_iter().map(|a| (a.key, a.value)).collect(),
            initiator: parent.initiator.clone(),
            auth_require: parent.auth_require.clone(),
            limits: Limits::new(budget, parent.limits.memory, parent.limits.disk),
            state: parent.state.clone(),
            call_chain: parent.call_chain.clone(),
            parent: Some(parent.id),
            can_initialize: false,
        };
        let exec = self.execute(&artifact, params);
        parent.absorb_child(&exec.used, exec.events, exec.logs);
        scope.exit()?;

        match exec.outcome {
            Ok(response) => Ok(response),
            Err(VmError::Contract { status, message }) => Ok(Response {
                status,
                message,
                body: Vec::new(),
            }),
            Err(e) => Err(e),
        }
    }
}

fn check_usage(used: &Limits, limits: &Limits) -> Result<(), VmError> {
    match used.exceeds(limits) {
        None => Ok(()),
        Some(Resource::Cpu) => Err(TrapKind::OutOfGas {
            used: used.cpu,
            limit: limits.cpu,
        }
        .into()),
        Some(Resource::Memory) => Err(TrapKind::MemoryLimitExceeded {
            size: used.memory,
            limit: limits.memory,
        }
        .into()),
        Some(Resource::Disk) => Err(TrapKind::DiskLimitExceeded {
            size: used.disk,
            limit: limits.disk,
        }
        .into()),
    }
}

fn build_compiler(config: &VmConfig) -> Result<Arc<dyn Compiler>, VmError> {
    match config.driver {
        Driver::Interp => Ok(Arc::new(InterpCompiler::new())),
        Driver::Aot => match AotCompiler::new(config) {
            Ok(compiler) => Ok(Arc::new(compiler)),
            Err(e) if config.fallback_to_interp => {
                tracing::warn!(
                    error = %e,
                    "native engine unavailable, falling back to interpreter"
                );
                Ok(Arc::new(InterpCompiler::new()))
            }
            Err(e) => Err(e),
        },
    }
}

/// The contract engine.
pub struct VmManager {
    core: Arc<VmCore>,
}

impl VmManager {
    pub fn new(config: VmConfig, store: Arc<dyn StateStore>) -> Result<Self, VmError> {
        Self::with_chain(config, store, Arc::new(NullChain))
    }

    pub fn with_chain(
        config: VmConfig,
        store: Arc<dyn StateStore>,
        chain: Arc<dyn ChainReader>,
    ) -> Result<Self, VmError> {
        config.validate()?;
        let compiler = build_compiler(&config)?;
        let codes = CodeManager::new(&config.basedir, compiler, Arc::new(default_resolver()))?;

        tracing::info!(
            driver = ?config.driver,
            compiler = codes.compiler_version(),
            basedir = %config.basedir.display(),
            "vm manager started"
        );

        Ok(Self {
            core: Arc::new(VmCore {
                config,
                contexts: ContextManager::new(),
                codes,
                store,
                chain,
            }),
        })
    }

    pub fn core(&self) -> &Arc<VmCore> {
        &self.core
    }

    pub fn config(&self) -> &VmConfig {
        &self.core.config
    }

    pub fn compiler_kind(&self) -> CompilerKind {
        self.core.codes.compiler().kind()
    }

    pub fn compiler_version(&self) -> &str {
        self.core.codes.compiler_version()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.codes.stats()
    }

    /// Number of contexts currently alive.
    pub fn live_contexts(&self) -> usize {
        self.core.contexts.len()
    }

    pub fn remove_cache(&self, name: &str) -> Result<bool, VmError> {
        self.core.codes.remove_cache(name)
    }

    /// Committed descriptor of `name`.
    pub fn descriptor(&self, name: &str) -> Result<Option<ContractDescriptor>, VmError> {
        let state = StateCache::new(self.core.store.clone());
        match StateProvider::new(&state).get_descriptor(name) {
            Ok(desc) => Ok(Some(desc)),
            Err(VmError::ContractNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn check_code_size(&self, code: &[u8]) -> Result<(), VmError> {
        let limit = self.core.config.max_code_size;
        if code.len() > limit {
            return Err(VmError::CodeSizeExceeded {
                size: code.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Deploy a new contract and run its `initialize` method. Nothing is
    /// committed unless `initialize` succeeds.
    pub fn deploy(&self, req: DeployRequest) -> Execution {
        let name = req.contract_name.as_str();
        if let Err(e) = validate_contract_name(name) {
            return Execution::rejected(e.into());
        }
        if let Err(e) = self.check_code_size(&req.code) {
            return Execution::rejected(e);
        }

        let state = Arc::new(StateCache::new(self.core.store.clone()));
        match state.get(CONTRACT_BUCKET, &descriptor_key(name)) {
            Ok(Some(_)) => return Execution::rejected(VmError::ContractExists(name.to_string())),
            Ok(None) => {}
            Err(e) => return Execution::rejected(e.into()),
        }

        let mut desc = req.descriptor.clone();
        desc.contract_name = name.to_string();
        let desc = desc
            .with_digest(Digest::of(&req.code))
            .with_compiler_version(self.compiler_version());

        let provider = DeployProvider {
            desc: &desc,
            code: &req.code,
        };
        let artifact = match self.core.codes.get_or_compile(&provider, &desc) {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::warn!(contract = %name, error = %e, "deploy compile failed");
                return Execution::rejected(e);
            }
        };
        if let Err(e) = self.core.validate(&artifact, &req.limits) {
            self.evict(name);
            return Execution::rejected(e);
        }

        let desc_json = match desc.to_json() {
            Ok(json) => json,
            Err(e) => return Execution::rejected(e.into()),
        };
        state.put(CONTRACT_BUCKET, &descriptor_key(name), &desc_json);
        state.put(CONTRACT_BUCKET, &code_key(name), &req.code);

        let chain = self.core.new_call_chain();
        let scope = match CallScope::enter(&chain, name, INITIALIZE_METHOD) {
            Ok(scope) => scope,
            Err(e) => return Execution::rejected(e),
        };
        let mut exec = self.core.execute(
            &artifact,
            ContextParams {
                contract_name: name.to_string(),
                method: INITIALIZE_METHOD.to_string(),
                args: req.init_args,
                initiator: req.initiator,
                auth_require: req.auth_require,
                limits: req.limits,
                state: state.clone(),
                call_chain: chain.clone(),
                parent: None,
                can_initialize: true,
            },
        );
        drop(scope);

        match &exec.outcome {
            Ok(_) => {
                if let Err(e) = state.commit() {
                    exec.outcome = Err(e.into());
                } else {
                    tracing::info!(
                        contract = %name,
                        digest = %desc.digest.short(),
                        used = %exec.used,
                        "contract deployed"
                    );
                }
            }
            Err(e) => {
                if !e.keeps_artifact() {
                    self.evict(name);
                }
                tracing::warn!(contract = %name, error = %e, "initialize failed");
                state.discard();
            }
        }
        exec
    }

    fn evict(&self, name: &str) {
        if let Err(e) = self.core.codes.remove_cache(name) {
            tracing::warn!(contract = %name, error = %e, "failed to evict cache");
        }
    }

    /// Invoke a method and commit its writes on success.
    pub fn invoke(&self, req: InvokeRequest) -> Execution {
        let state = Arc::new(StateCache::new(self.core.store.clone()));
        let mut exec = self.invoke_with_state(req, state.clone());
        if exec.is_ok() {
            if let Err(e) = state.commit() {
                exec.outcome = Err(e.into());
            }
        } else {
            state.discard();
        }
        exec
    }

    /// Invoke a method against a caller-owned state cache. Nothing is
    /// committed.
    pub fn invoke_with_state(&self, req: InvokeRequest, state: Arc<StateCache>) -> Execution {
        let provider = StateProvider::new(&state);
        let artifact = match provider
            .get_descriptor(&req.contract)
            .and_then(|desc| self.core.codes.get_or_compile(&provider, &desc))
        {
            Ok(artifact) => artifact,
            Err(e) => return Execution::rejected(e),
        };

        let chain = self.core.new_call_chain();
        let scope = match CallScope::enter(&chain, &req.contract, &req.method) {
            Ok(scope) => scope,
            Err(e) => return Execution::rejected(e),
        };
        let exec = self.core.execute(
            &artifact,
            ContextParams {
                contract_name: req.contract,
                method: req.method,
                args: req.args,
                initiator: req.initiator,
                auth_require: req.auth_require,
                limits: req.limits,
                state,
                call_chain: chain.clone(),
                parent: None,
                can_initialize: false,
            },
        );
        drop(scope);
        exec
    }

    /// Replace the code of an existing contract.
    pub fn upgrade(&self, req: UpgradeRequest) -> Execution {
        if !self.core.config.enable_upgrade {
            return Execution::rejected(VmError::UpgradeDisabled);
        }
        if let Err(e) = self.check_code_size(&req.code) {
            return Execution::rejected(e);
        }

        let name = req.contract_name.as_str();
        let state = StateCache::new(self.core.store.clone());
        let old = match StateProvider::new(&state).get_descriptor(name) {
            Ok(desc) => desc,
            Err(e) => return Execution::rejected(e),
        };
        let desc = old
            .with_digest(Digest::of(&req.code))
            .with_compiler_version(self.compiler_version());

        let provider = DeployProvider {
            desc: &desc,
            code: &req.code,
        };
        let artifact = match self.core.codes.get_or_compile(&provider, &desc) {
            Ok(artifact) => artifact,
            Err(e) => return Execution::rejected(e),
        };
        if let Err(e) = self.core.validate(&artifact, &req.limits) {
            self.evict(name);
            return Execution::rejected(e);
        }

        let desc_json = match desc.to_json() {
            Ok(json) => json,
            Err(e) => return Execution::rejected(e.into()),
        };
        state.put(CONTRACT_BUCKET, &descriptor_key(name), &desc_json);
        state.put(CONTRACT_BUCKET, &code_key(name), &req.code);

        let used = Limits {
            disk: state.disk_usage(),
            ..Limits::default()
        };
        let outcome = check_usage(&used, &req.limits).and_then(|()| {
            state.commit()?;
            tracing::info!(contract = %name, digest = %desc.digest.short(), "contract upgraded");
            Ok(Response {
                message: "upgrade success".to_string(),
                ..Response::ok(Vec::new())
            })
        });
        if outcome.is_err() {
            state.discard();
        }

        Execution {
            outcome,
            used,
            events: Vec::new(),
            logs: Vec::new(),
        }
    }
}
