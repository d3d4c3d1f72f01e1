//! Interpreter strategy on wasmi. Bytecode is loaded directly and nothing
//! is kept on disk.

use super::{
    resolve_import, Code, Compiler, CompilerKind, GlobalKind, ImportShape, Instance, LoadSource,
    ResolvedImport,
};
use crate::error::{TrapKind, VmError};
use crate::host::{GuestMemory, HostEnv, HostState};
use crate::resolver::{HostFunc, Resolver};
use std::sync::Arc;
use wasmi::core::{Trap, TrapCode, ValueType, F64};
use wasmi::{
    Caller, Config, Engine, Extern, ExternType, Func, FuncType, Global, Linker, Memory, Module,
    Mutability, Store, Value,
};
use xvm_types::Limits;

pub struct InterpCompiler {
    engine: Engine,
    version: String,
}

impl InterpCompiler {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.consume_fuel(true);
        Self {
            engine: Engine::new(&config),
            version: format!("xvm-interp/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn parse(&self, bytecode: &[u8]) -> Result<Module, VmError> {
        Module::new(&self.engine, bytecode).map_err(|e| VmError::Compilation(e.to_string()))
    }
}

impl Default for InterpCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for InterpCompiler {
    fn kind(&self) -> CompilerKind {
        CompilerKind::Interp
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn artifact_extension(&self) -> Option<&'static str> {
        None
    }

    /// Validates the bytecode. The artifact is the bytecode itself.
    fn compile(&self, bytecode: &[u8]) -> Result<Vec<u8>, VmError> {
        self.parse(bytecode)?;
        Ok(bytecode.to_vec())
    }

    fn load(
        &self,
        source: LoadSource<'_>,
        resolver: &dyn Resolver,
    ) -> Result<Arc<dyn Code>, VmError> {
        let module = match source {
            LoadSource::Bytecode(bytecode) => self.parse(bytecode)?,
            LoadSource::File(path) => self.parse(&std::fs::read(path)?)?,
        };

        let imports = module
            .imports()
            .map(|import| {
                let shape = match import.ty() {
                    ExternType::Func(ty) => ImportShape::Func {
                        params: ty.params().len(),
                        results: ty.results().len(),
                        all_i32: ty
                            .params()
                            .iter()
                            .chain(ty.results())
                            .all(|t| *t == ValueType::I32),
                    },
                    ExternType::Global(ty) => match (ty.mutability(), ty.content()) {
                        (Mutability::Var, _) => ImportShape::MutableGlobal,
                        (Mutability::Const, ValueType::I32) => ImportShape::Global {
                            kind: GlobalKind::I32,
                        },
                        (Mutability::Const, ValueType::I64) => ImportShape::Global {
                            kind: GlobalKind::I64,
                        },
                        (Mutability::Const, ValueType::F64) => ImportShape::Global {
                            kind: GlobalKind::F64,
                        },
                        _ => ImportShape::Other("non-scalar global"),
                    },
                    ExternType::Memory(_) => ImportShape::Other("memory"),
                    ExternType::Table(_) => ImportShape::Other("table"),
                };
                resolve_import(resolver, import.module(), import.name(), shape)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Arc::new(InterpCode {
            engine: self.engine.clone(),
            module,
            imports,
        }))
    }
}

struct InterpCode {
    engine: Engine,
    module: Module,
    imports: Vec<ResolvedImport>,
}

struct InterpState {
    host: HostState,
    fuel_limit: u64,
}

impl Code for InterpCode {
    fn instantiate(&self, host: HostState, limits: &Limits) -> Result<Box<dyn Instance>, VmError> {
        let mut store = Store::new(
            &self.engine,
            InterpState {
                host,
                fuel_limit: limits.cpu,
            },
        );
        store
            .add_fuel(limits.cpu)
            .map_err(|e| VmError::Engine(e.to_string()))?;

        let mut linker: Linker<InterpState> = Linker::new(&self.engine);
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
                        vec![ValueType::I32; func.arity],
                        vec![ValueType::I32; *results],
                    );
                    let host_func = Func::new(&mut store, ty, move |mut caller, params, results| {
                        host_call(&mut caller, func, params, results)
                    });
                    linker
                        .define(module, name, host_func)
                        .map_err(|e| VmError::Instantiation(e.to_string()))?;
                }
                ResolvedImport::Global {
                    module,
                    name,
                    value,
                    kind,
                } => {
                    let val = match kind {
                        GlobalKind::I32 => Value::I32(*value as i32),
                        GlobalKind::I64 => Value::I64(*value),
                        GlobalKind::F64 => Value::F64(F64::from_bits(*value as u64)),
                    };
                    let global = Global::new(&mut store, val, Mutability::Const);
                    linker
                        .define(module, name, global)
                        .map_err(|e| VmError::Instantiation(e.to_string()))?;
                }
            }
        }

        let instance = linker
            .instantiate(&mut store, &self.module)
            .and_then(|pre| pre.start(&mut store));
        let instance = match instance {
            Ok(instance) => instance,
            Err(wasmi::Error::Trap(trap)) => return Err(classify(&mut store, &trap)),
            Err(err) => return Err(VmError::Instantiation(err.to_string())),
        };
        let memory = instance
            .get_export(&store, "memory")
            .and_then(Extern::into_memory);

        Ok(Box::new(InterpInstance {
            store,
            instance,
            memory,
        }))
    }
}

fn host_call(
    caller: &mut Caller<'_, InterpState>,
    func: HostFunc,
    params: &[Value],
    results: &mut [Value],
) -> Result<(), Trap> {
    let args: Vec<u32> = params
        .iter()
        .map(|v| v.i32().unwrap_or_default() as u32)
        .collect();
    let fuel_used = caller.fuel_consumed().unwrap_or(0);

    let memory = match caller.get_export("memory").and_then(Extern::into_memory) {
        Some(memory) => memory,
        None => {
            let trap = TrapKind::Host("guest does not export memory".to_string());
            let msg = trap.to_string();
            caller.data_mut().host.record_trap(trap);
            return Err(Trap::new(msg));
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
        let left = caller
            .data()
            .fuel_limit
            .saturating_sub(caller.fuel_consumed().unwrap_or(0));
        caller
            .consume_fuel(charged.min(left))
            .map_err(|e| Trap::new(e.to_string()))?;
    }

    match outcome {
        Ok(value) => {
            if let Some(slot) = results.first_mut() {
                *slot = Value::I32(value as i32);
            }
            Ok(())
        }
        Err(trap) => {
            let msg = trap.to_string();
            caller.data_mut().host.record_trap(trap);
            Err(Trap::new(msg))
        }
    }
}

fn gas_used(store: &Store<InterpState>) -> u64 {
    store.fuel_consumed().unwrap_or(0)
}

fn classify(store: &mut Store<InterpState>, trap: &Trap) -> VmError {
    if let Some(kind) = store.data_mut().host.take_trap() {
        return VmError::Trap(kind);
    }
    let kind = match trap.trap_code() {
        Some(TrapCode::OutOfFuel) => {
            // The ceiling counts as fully consumed
            let limit = store.data().fuel_limit;
            TrapKind::OutOfGas {
                used: gas_used(store).max(limit),
                limit,
            }
        }
        Some(TrapCode::StackOverflow) => TrapKind::StackOverflow,
        Some(TrapCode::MemoryOutOfBounds) => TrapKind::MemoryOutOfBounds,
        Some(TrapCode::IntegerOverflow) | Some(TrapCode::BadConversionToInteger) => {
            TrapKind::IntegerOverflow
        }
        Some(TrapCode::IntegerDivisionByZero) => TrapKind::DivideByZero,
        Some(TrapCode::UnreachableCodeReached) => TrapKind::Unreachable,
        _ => TrapKind::Runtime(trap.to_string()),
    };
    VmError::Trap(kind)
}

struct InterpInstance {
    store: Store<InterpState>,
    instance: wasmi::Instance,
    memory: Option<Memory>,
}

impl Instance for InterpInstance {
    fn exec(&mut self, entry: &str) -> Result<(), VmError> {
        let func = self
            .instance
            .get_func(&self.store, entry)
            .ok_or_else(|| VmError::MethodNotFound(entry.to_string()))?;
        let ty = func.ty(&self.store);
        if !ty.params().is_empty() || !ty.results().is_empty() {
            return Err(VmError::Trap(TrapKind::SignatureMismatch(format!(
                "entry point {} must be () -> ()",
                entry
            ))));
        }

        match func.call(&mut self.store, &[], &mut []) {
            Ok(()) => {}
            Err(wasmi::Error::Trap(trap)) => return Err(classify(&mut self.store, &trap)),
            Err(err) => {
                if let Some(kind) = self.store.data_mut().host.take_trap() {
                    return Err(VmError::Trap(kind));
                }
                return Err(VmError::Trap(TrapKind::Runtime(err.to_string())));
            }
        }

        // Fuel can run out exactly on the last instruction
        let used = gas_used(&self.store);
        let limit = self.store.data().fuel_limit;
        if used > limit {
            return Err(VmError::Trap(TrapKind::OutOfGas { used, limit }));
        }
        Ok(())
    }

    fn gas_used(&self) -> u64 {
        gas_used(&self.store)
    }

    fn memory_size(&self) -> u64 {
        self.memory
            .map(|m| m.data(&self.store).len() as u64)
            .unwrap_or(0)
    }

    fn call_i32(&mut self, name: &str, arg: i32) -> Result<Option<i32>, VmError> {
        let Some(func) = self.instance.get_func(&self.store, name) else {
            return Ok(None);
        };
        let func = func
            .typed::<i32, i32>(&self.store)
            .map_err(|_| super::helper_mismatch(name))?;
        match func.call(&mut self.store, arg) {
            Ok(value) => Ok(Some(value)),
            Err(trap) => Err(classify(&mut self.store, &trap)),
        }
    }

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), VmError> {
        let memory = self.memory.ok_or_else(super::no_memory)?;
        memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|_| VmError::Trap(TrapKind::MemoryOutOfBounds))
    }
}
