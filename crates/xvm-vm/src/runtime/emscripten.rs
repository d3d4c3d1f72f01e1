//! The `env` imports emscripten output expects from its JavaScript glue.

use crate::compiler::Instance;
use crate::error::{TrapKind, VmError};
use crate::host::HostEnv;
use crate::resolver::{HostFunc, MapResolver};

/// Static data begins here. The bytes below it are unused by the guest.
const GLOBALS_BASE: u32 = 1024;

/// Address of the heap pointer the guest's `sbrk` reads.
pub const DYNAMICTOP_PTR: u32 = GLOBALS_BASE - 100;

/// Stack reserved above the stack base, matching the contract toolchain.
pub const STACK_SIZE: u32 = 256 << 10;

const EBADF: i32 = 9;

pub fn resolver() -> MapResolver {
    MapResolver::new()
        .with_func("env", "___setErrNo", HostFunc::discardable(1, zero))
        .with_func("env", "abortOnCannotGrowMemory", HostFunc::discardable(1, cannot_grow))
        .with_func("env", "abortStackOverflow", HostFunc::discardable(1, stack_overflow))
        .with_func("env", "getTotalMemory", HostFunc::new(0, memory_size))
        .with_func("env", "_emscripten_get_heap_size", HostFunc::new(0, memory_size))
        .with_func("env", "enlargeMemory", HostFunc::new(0, zero))
        .with_func("env", "_emscripten_memcpy_big", HostFunc::new(3, memcpy_big))
        .with_func("env", "_emscripten_resize_heap", HostFunc::new(1, unsupported))
        .with_func("env", "abort", HostFunc::discardable(1, abort))
        .with_func("env", "_abort", HostFunc::discardable(0, abort))
        .with_func("env", "___cxa_allocate_exception", HostFunc::new(1, exception))
        .with_func("env", "___cxa_throw", HostFunc::discardable(3, exception))
        .with_func("env", "___cxa_pure_virtual", HostFunc::discardable(0, unsupported))
        .with_func("env", "___cxa_uncaught_exception", HostFunc::new(0, unsupported))
        .with_func("env", "___syscall6", HostFunc::new(2, unsupported))
        .with_func("env", "___syscall54", HostFunc::new(2, zero))
        .with_func("env", "___syscall91", HostFunc::new(2, unsupported))
        .with_func("env", "___syscall140", HostFunc::new(2, unsupported))
        .with_func("env", "___syscall145", HostFunc::new(2, unsupported))
        .with_func("env", "___syscall146", HostFunc::new(2, writev))
        .with_func("env", "___map_file", HostFunc::new(2, unsupported))
        .with_func("env", "___lock", HostFunc::discardable(1, zero))
        .with_func("env", "___unlock", HostFunc::discardable(1, zero))
        .with_func("env", "_pthread_equal", HostFunc::new(2, zero))
        .with_func("env", "_pthread_cond_wait", HostFunc::new(2, unsupported))
        .with_func("env", "_llvm_trap", HostFunc::discardable(0, llvm_trap))
        .with_func("env", "___assert_fail", HostFunc::discardable(4, assert_fail))
        .with_func("env", "_llvm_stacksave", HostFunc::new(0, zero))
        .with_func("env", "_llvm_stackrestore", HostFunc::discardable(1, zero))
        .with_func("env", "_getenv", HostFunc::new(1, zero))
        .with_func("env", "_strftime_l", HostFunc::new(5, unsupported))
        .with_global("env", "__table_base", 0)
        .with_global("env", "tableBase", 0)
        .with_global("env", "DYNAMICTOP_PTR", i64::from(DYNAMICTOP_PTR))
        .with_f64_global("global", "NaN", f64::NAN)
        .with_f64_global("global", "Infinity", f64::INFINITY)
}

/// Point the heap just past the guest's stack.
///
/// The stack base comes from the guest's own `stackAlloc`. Modules that do
/// not export it manage their heap themselves and are left untouched.
pub fn init(instance: &mut dyn Instance) -> Result<(), VmError> {
    let Some(stack_base) = instance.call_i32("stackAlloc", 0)? else {
        return Ok(());
    };
    if instance.memory_size() < u64::from(DYNAMICTOP_PTR) + 4 {
        return Err(VmError::Instantiation("bad memory size".to_string()));
    }

    let heap_base = (stack_base as u32).wrapping_add(STACK_SIZE);
    tracing::trace!(stack_base, heap_base, "emscripten heap initialized");
    instance.write_memory(DYNAMICTOP_PTR, &heap_base.to_le_bytes())
}

fn zero(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Ok(0)
}

fn memory_size(env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    u32::try_from(env.memory.size()).map_err(|_| TrapKind::MemoryOutOfBounds)
}

/// `_emscripten_memcpy_big(dest, src, len) -> dest`
fn memcpy_big(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    env.memory.copy_within(args[0], args[1], args[2])?;
    Ok(args[0])
}

/// `___syscall146(which, varargs)`, writev restricted to stdout and stderr.
fn writev(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let varargs = args[1];
    let fd = env.memory.read_u32(varargs)?;
    if fd != 1 && fd != 2 {
        return Ok((-EBADF) as u32);
    }
    let iov = env.memory.read_u32(varargs.wrapping_add(4))?;
    let iovcnt = env.memory.read_u32(varargs.wrapping_add(8))?;

    let mut total = 0u32;
    for i in 0..iovcnt {
        let entry = iov.wrapping_add(i.wrapping_mul(8));
        let base = env.memory.read_u32(entry)?;
        let len = env.memory.read_u32(entry.wrapping_add(4))?;
        let text = String::from_utf8_lossy(env.memory.read(base, len)?);
        tracing::debug!(target: "xvm::contract", ctxid = env.state.ctxid, fd, "{}", text);
        total = total.wrapping_add(len);
    }
    Ok(total)
}

fn host(msg: &str) -> TrapKind {
    TrapKind::Host(msg.to_string())
}

fn cannot_grow(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(host("cannot grow memory"))
}

fn stack_overflow(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(TrapKind::StackOverflow)
}

fn abort(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(host("abort"))
}

fn exception(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(host("c++ exceptions are not supported"))
}

fn llvm_trap(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(host("llvm trap called"))
}

fn assert_fail(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(host("assertion failed"))
}

fn unsupported(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(host("not implemented"))
}
