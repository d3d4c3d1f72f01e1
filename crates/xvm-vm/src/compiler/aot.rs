//! Ahead-of-time strategy on wasmtime.
//!
//! Bytecode is precompiled to a native artifact that the code manager keeps
//! on disk. Every load reads a private copy of that artifact from the run
//! directory, so rewriting the cache file never touches a mapped module.

use super::{
    resolve_import, Code, Compiler, CompilerKind, GlobalKind, ImportShape, Instance, LoadSource,
    ResolvedImport,
};
use crate::config::VmConfig;
use crate::error::{TrapKind, VmError};
use crate::host::{GuestMemory, HostEnv, HostState};
use crate::resolver::{HostFunc, Resolver};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wasmtime::{
    Caller, Config, Engine, Extern, ExternType, FuncType, Global, GlobalType, Linker, Memory,
    Module, Mutability, OptLevel, Store, StoreLimits, StoreLimitsBuilder, Trap, Val, ValType,
};
use xvm_types::Limits;

pub const AOT_EXTENSION: &str = "cwasm";

pub struct AotCompiler {
    engine: Engine,
    version: String,
    run_dir: PathBuf,
}

impl AotCompiler {
    pub fn new(config: &VmConfig) -> Result<Self, VmError> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_bulk_memory(true);
        wasm_config.max_wasm_stack(config.max_wasm_stack);
        wasm_config.cranelift_opt_level(match super::opt_tier(config.opt_level) {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });

        let engine = Engine::new(&wasm_config).map_err(|e| VmError::Engine(e.to_string()))?;

        // Artifacts are only loadable by an engine with the same settings
        let mut hasher = DefaultHasher::new();
        engine.precompile_compatibility_hash().hash(&mut hasher);
        let version = format!(
            "xvm-aot/{}/{:016x}",
            env!("CARGO_PKG_VERSION"),
            hasher.finish()
        );

        let run_dir = config.run_dir();
        fs::create_dir_all(&run_dir)?;

        Ok(Self {
            engine,
            version,
            run_dir,
        })
    }

    fn link(
        &self,
        module: Module,
        resolver: &dyn Resolver,
        run_path: Option<PathBuf>,
    ) -> Result<Arc<dyn Code>, VmError> {
        let imports = module
            .imports()
            .map(|import| {
                let shape = match import.ty() {
                    ExternType::Func(ty) => ImportShape::Func {
                        params: ty.params().len(),
                        results: ty.results().len(),
                        all_i32: ty
                            .params()
                            .chain(ty.results())
                            .all(|t| matches!(t, ValType::I32)),
                    },
                    ExternType::Global(ty) => match (ty.mutability(), ty.content()) {
                        (Mutability::Var, _) => ImportShape::MutableGlobal,
                        (Mutability::Const, ValType::I32) => ImportShape::Global {
                            kind: GlobalKind::I32,
                        },
                        (Mutability::Const, ValType::I64) => ImportShape::Global {
                            kind: GlobalKind::I64,
                        },
                        (Mutability::Const, ValType::F64) => ImportShape::Global {
                            kind: GlobalKind::F64,
                        },
                        _ => ImportShape::Other("non-scalar global"),
                    },
                    ExternType::Memory(_) => ImportShape::Other("memory"),
                    ExternType::Table(_) => ImportShape::Other("table"),
                    #[allow(unreachable_patterns)]
                    _ => ImportShape::Other("unknown"),
                };
                resolve_import(resolver, import.module(), import.name(), shape)
            })
            .collect::<Result<Vec<_>, _>>();

        let imports = match imports {
            Ok(imports) => imports,
            Err(e) => {
                if let Some(path) = run_path {
                    let _ = fs::remove_file(path);
                }
                return Err(e);
            }
        };

        Ok(Arc::new(AotCode {
            engine: self.engine.clone(),
            module,
            imports,
            run_path,
        }))
    }
}

impl Compiler for AotCompiler {
    fn kind(&self) -> CompilerKind {
        CompilerKind::Aot
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn artifact_extension(&self) -> Option<&'static str> {
        Some(AOT_EXTENSION)
    }

    fn compile(&self, bytecode: &[u8]) -> Result<Vec<u8>, VmError> {
        self.engine
            .precompile_module(bytecode)
            .map_err(|e| VmError::Compilation(e.to_string()))
    }

    fn load(
        &self,
        source: LoadSource<'_>,
        resolver: &dyn Resolver,
    ) -> Result<Arc<dyn Code>, VmError> {
        match source {
            LoadSource::Bytecode(bytecode) => {
                let module = Module::new(&self.engine, bytecode)
                    .map_err(|e| VmError::Compilation(e.to_string()))?;
                self.link(module, resolver, None)
            }
            LoadSource::File(path) => {
                let run_path = self.run_copy(path)?;
                // SAFETY: the file was produced by `precompile_module` on an
                // engine with the same compatibility hash, checked through
                // the manifest's compiler version, and the private run copy
                // is never modified while mapped.
                let module = unsafe { Module::deserialize_file(&self.engine, &run_path) };
                match module {
                    Ok(module) => self.link(module, resolver, Some(run_path)),
                    Err(e) => {
                        let _ = fs::remove_file(&run_path);
                        Err(VmError::Engine(format!(
                            "load {}: {}",
                            path.display(),
                            e
                        )))
                    }
                }
            }
        }
    }
}

impl AotCompiler {
    fn run_copy(&self, path: &Path) -> Result<PathBuf, VmError> {
        let label = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .unwrap_or("code");
        let run_path = self
            .run_dir
            .join(format!("{}-{}.{}", label, uuid::Uuid::new_v4(), AOT_EXTENSION));
        fs::copy(path, &run_path)?;
        Ok(run_path)
    }
}

struct AotCode {
    engine: Engine,
    module: Module,
    imports: Vec<ResolvedImport>,
    run_path: Option<PathBuf>,
}

impl Drop for AotCode {
    fn drop(&mut self) {
        if let Some(path) = &self.run_path {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove run copy");
            }
        }
    }
}

struct AotState {
    host: HostState,
    limits: StoreLimits,
    fuel_limit: u64,
}

impl Code for AotCode {
    fn instantiate(&self, host: HostState, limits: &Limits) -> Result<Box<dyn Instance>, VmError> {
        let memory_limit = usize::try_from(limits.memory).unwrap_or(usize::MAX);
        let mut store = Store::new(
            &self.engine,
            AotState {
                host,
                limits: StoreLimitsBuilder::new().memory_size(memory_limit).build(),
                fuel_limit: limits.cpu,
            },
        );
        store.limiter(|s| &mut s.limits);
        store
            .set_fuel(limits.cpu)
            .map_err(|e| VmError::Engine(e.to_string()))?;

        let mut linker: Linker<AotState> = Linker::new(&self.engine);
        for import in &self.imports {
            match import {
                ResolvedImport::Func {
                    module,
                    name,
                    func,
                    results,
                } => {
                    let func = *func;
                    let ty = FuncType::new(
                        std::iter::repeat(ValType::I32).take(func.arity),
                        std::iter::repeat(ValType::I32).take(*results),
                    );
                    linker
                        .func_new(module, name, ty, move |mut caller, params, results| {
                            host_call(&mut caller, func, params, results)
                        })
                        .map_err(|e| VmError::Instantiation(e.to_string()))?;
                }
                ResolvedImport::Global {
                    module,
                    name,
                    value,
                    kind,
                } => {
                    let (ty, val) = match kind {
                        GlobalKind::I32 => (ValType::I32, Val::I32(*value as i32)),
                        GlobalKind::I64 => (ValType::I64, Val::I64(*value)),
                        GlobalKind::F64 => (ValType::F64, Val::F64(*value as u64)),
                    };
                    let ty = GlobalType::new(ty, Mutability::Const);
                    let global = Global::new(&mut store, ty, val)
                        .map_err(|e| VmError::Instantiation(e.to_string()))?;
                    linker
                        .define(&store, module, name, global)
                        .map_err(|e| VmError::Instantiation(e.to_string()))?;
                }
            }
        }

        let instance = match linker.instantiate(&mut store, &self.module) {
            Ok(instance) => instance,
            Err(err) => {
                // A start function may trap
                if let Some(trap) = store.data_mut().host.take_trap() {
                    return Err(VmError::Trap(trap));
                }
                if err.downcast_ref::<Trap>().is_some() {
                    return Err(classify(&mut store, err));
                }
                return Err(VmError::Instantiation(err.to_string()));
            }
        };
        let memory = instance.get_memory(&mut store, "memory");

        Ok(Box::new(AotInstance {
            store,
            instance,
            memory,
        }))
    }
}

fn host_call(
    caller: &mut Caller<'_, AotState>,
    func: HostFunc,
    params: &[Val],
    results: &mut [Val],
) -> wasmtime::Result<()> {
    let args: Vec<u32> = params
        .iter()
        .map(|v| v.i32().unwrap_or_default() as u32)
        .collect();
    let fuel_used = caller
        .get_fuel()
        .map(|left| caller.data().fuel_limit.saturating_sub(left))
        .unwrap_or(0);

    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => {
            let trap = TrapKind::Host("guest does not export memory".to_string());
            let msg = trap.to_string();
            caller.data_mut().host.record_trap(trap);
            return Err(wasmtime::Error::msg(msg));
        }
    };

    let (outcome, charged) = {
        let (data, state) = memory.data_and_store_mut(&mut *caller);
        let mut env = HostEnv {
            memory: GuestMemory::new(data),
            state: &mut state.host,
            fuel_used,
        };
        let outcome = (func.call)(&mut env, &args);
        (outcome, state.host.gas.take_pending())
    };

    // Host gas comes out of the same fuel the guest burns
    if charged > 0 {
        let left = caller.get_fuel()?;
        caller.set_fuel(left.saturating_sub(charged))?;
    }

    match outcome {
        Ok(value) => {
            if let Some(slot) = results.first_mut() {
                *slot = Val::I32(value as i32);
            }
            Ok(())
        }
        Err(trap) => {
            let msg = trap.to_string();
            caller.data_mut().host.record_trap(trap);
            Err(wasmtime::Error::msg(msg))
        }
    }
}

fn gas_used(store: &Store<AotState>) -> u64 {
    let left = store.get_fuel().unwrap_or(0);
    store.data().fuel_limit.saturating_sub(left)
}

fn classify(store: &mut Store<AotState>, err: wasmtime::Error) -> VmError {
    if let Some(trap) = store.data_mut().host.take_trap() {
        return VmError::Trap(trap);
    }
    let trap = match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            // The ceiling counts as fully consumed
            let limit = store.data().fuel_limit;
            TrapKind::OutOfGas {
                used: gas_used(store).max(limit),
                limit,
            }
        }
        Some(Trap::StackOverflow) => TrapKind::StackOverflow,
        Some(Trap::MemoryOutOfBounds) | Some(Trap::HeapMisaligned) => TrapKind::MemoryOutOfBounds,
        Some(Trap::IntegerOverflow) | Some(Trap::BadConversionToInteger) => {
            TrapKind::IntegerOverflow
        }
        Some(Trap::IntegerDivisionByZero) => TrapKind::DivideByZero,
        Some(Trap::UnreachableCodeReached) => TrapKind::Unreachable,
        Some(other) => TrapKind::Runtime(other.to_string()),
        None => TrapKind::Runtime(err.to_string()),
    };
    VmError::Trap(trap)
}

struct AotInstance {
    store: Store<AotState>,
    instance: wasmtime::Instance,
    memory: Option<Memory>,
}

impl Instance for AotInstance {
    fn exec(&mut self, entry: &str) -> Result<(), VmError> {
        let func = self
            .instance
            .get_func(&mut self.store, entry)
            .ok_or_else(|| VmError::MethodNotFound(entry.to_string()))?;
        let func = func.typed::<(), ()>(&self.store).map_err(|_| {
            VmError::Trap(TrapKind::SignatureMismatch(format!(
                "entry point {} must be () -> ()",
                entry
            )))
        })?;

        match func.call(&mut self.store, ()) {
            Ok(()) => Ok(()),
            Err(err) => Err(classify(&mut self.store, err)),
        }
    }

    fn gas_used(&self) -> u64 {
        gas_used(&self.store)
    }

    fn memory_size(&self) -> u64 {
        self.memory
            .map(|m| m.data_size(&self.store) as u64)
            .unwrap_or(0)
    }

    fn call_i32(&mut self, name: &str, arg: i32) -> Result<Option<i32>, VmError> {
        let Some(func) = self.instance.get_func(&mut self.store, name) else {
            return Ok(None);
        };
        let func = func
            .typed::<i32, i32>(&self.store)
            .map_err(|_| super::helper_mismatch(name))?;
        match func.call(&mut self.store, arg) {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(classify(&mut self.store, err)),
        }
    }

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), VmError> {
        let memory = self.memory.ok_or_else(super::no_memory)?;
        memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|_| VmError::Trap(TrapKind::MemoryOutOfBounds))
    }
}
