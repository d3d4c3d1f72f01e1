//! End-to-end tests running WAT contracts on both drivers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use borsh::BorshDeserialize;
use tempfile::TempDir;
use xvm_storage::{MemoryStore, StateStore};
use xvm_types::{ContractDescriptor, ContractEvent, Limits, RuntimeTag, STATUS_OK};
use xvm_vm::gas_metering::{GasSchedule, GasTracker};
use xvm_vm::host::HostState;
use xvm_vm::syscall::{self, QueryBlockResponse, QueryTxResponse, SyscallError};
use xvm_vm::{
    BlockInfo, DeployRequest, Driver, Execution, InvokeRequest, StaticChain, TrapKind, TxInfo,
    UpgradeRequest, VmConfig, VmError, VmManager,
};

/// Host imports, method names and helpers shared by every test contract.
///
/// Memory map: 0..256 method names, 256..1024 contract data, 1024 response
/// buffer, 2048 scratch key, 4096 request buffer, 8192 counter.
const PRELUDE: &str = r#"
    (import "env" "call_method" (func $call_method (param i32 i32 i32 i32) (result i32)))
    (import "env" "fetch_response" (func $fetch_response (param i32 i32) (result i32)))
    (memory (export "memory") 1)
    (global $resp_len (mut i32) (i32.const 0))
    (global $arg_ptr (mut i32) (i32.const 0))
    (global $arg_len (mut i32) (i32.const 0))
    (data (i32.const 0) "GetCallArgs")
    (data (i32.const 16) "PutObject")
    (data (i32.const 32) "GetObject")
    (data (i32.const 48) "SetOutput")
    (data (i32.const 64) "ContractCall")
    (data (i32.const 80) "EmitEvent")
    (data (i32.const 96) "PostLog")
    (data (i32.const 112) "creator")
    (data (i32.const 128) "NewIterator")
    (data (i32.const 144) "QueryBlock")
    (data (i32.const 160) "QueryTx")

    (func $copy (param $dst i32) (param $src i32) (param $len i32)
      (block $done
        (loop $next
          (br_if $done (i32.eqz (local.get $len)))
          (i32.store8 (local.get $dst) (i32.load8_u (local.get $src)))
          (local.set $dst (i32.add (local.get $dst) (i32.const 1)))
          (local.set $src (i32.add (local.get $src) (i32.const 1)))
          (local.set $len (i32.sub (local.get $len) (i32.const 1)))
          (br $next))))

    (func $syscall (param $m i32) (param $mlen i32) (param $req i32) (param $rlen i32) (result i32)
      (global.set $resp_len
        (call $call_method (local.get $m) (local.get $mlen) (local.get $req) (local.get $rlen)))
      (call $fetch_response (i32.const 1024) (global.get $resp_len)))

    (func $load_first_arg
      (local $p i32)
      (drop (call $syscall (i32.const 0) (i32.const 11) (i32.const 4096) (i32.const 0)))
      (local.set $p (i32.add (i32.const 1028) (i32.load (i32.const 1024))))
      (local.set $p (i32.add (local.get $p) (i32.const 4)))
      (local.set $p (i32.add (i32.add (local.get $p) (i32.const 4)) (i32.load (local.get $p))))
      (global.set $arg_len (i32.load (local.get $p)))
      (global.set $arg_ptr (i32.add (local.get $p) (i32.const 4))))

    (func $put (param $k i32) (param $klen i32) (param $v i32) (param $vlen i32) (result i32)
      (local $p i32)
      (i32.store (i32.const 4096) (local.get $klen))
      (call $copy (i32.const 4100) (local.get $k) (local.get $klen))
      (local.set $p (i32.add (i32.const 4100) (local.get $klen)))
      (i32.store (local.get $p) (local.get $vlen))
      (call $copy (i32.add (local.get $p) (i32.const 4)) (local.get $v) (local.get $vlen))
      (call $syscall (i32.const 16) (i32.const 9) (i32.const 4096)
        (i32.add (i32.add (local.get $klen) (local.get $vlen)) (i32.const 8))))

    (func $output (param $status i32) (param $body i32) (param $len i32)
      (i32.store (i32.const 4096) (local.get $status))
      (i32.store (i32.const 4100) (i32.const 0))
      (i32.store (i32.const 4104) (local.get $len))
      (call $copy (i32.const 4108) (local.get $body) (local.get $len))
      (drop (call $syscall (i32.const 48) (i32.const 9) (i32.const 4096)
        (i32.add (local.get $len) (i32.const 12)))))
"#;

const COUNTER: &str = r#"
    (func (export "_initialize")
      (call $load_first_arg)
      (drop (call $put (i32.const 112) (i32.const 7) (global.get $arg_ptr) (global.get $arg_len))))

    (func (export "_increase")
      (local $klen i32)
      (call $load_first_arg)
      (local.set $klen (global.get $arg_len))
      (call $copy (i32.const 2048) (global.get $arg_ptr) (local.get $klen))
      (i32.store (i32.const 4096) (local.get $klen))
      (call $copy (i32.const 4100) (i32.const 2048) (local.get $klen))
      (i64.store (i32.const 8192) (i64.const 0))
      (if (call $syscall (i32.const 32) (i32.const 9) (i32.const 4096)
            (i32.add (local.get $klen) (i32.const 4)))
        (then (i64.store (i32.const 8192) (i64.load (i32.const 1028)))))
      (i64.store (i32.const 8192) (i64.add (i64.load (i32.const 8192)) (i64.const 1)))
      (drop (call $put (i32.const 2048) (local.get $klen) (i32.const 8192) (i32.const 8)))
      (call $output (i32.const 200) (i32.const 8192) (i32.const 8)))

    (func (export "_ping"))

    (func (export "_fail")
      (call $output (i32.const 500) (i32.const 0) (i32.const 0)))

    (func (export "_boom") unreachable)

    (func (export "_spin") (loop $l (br $l)))

    (func (export "_chatty")
      (i32.store (i32.const 4096) (i32.const 10000))
      (drop (call $syscall (i32.const 96) (i32.const 7) (i32.const 4096) (i32.const 10004)))
      (loop $l (br $l)))

    (func (export "_announce")
      (drop (call $syscall (i32.const 80) (i32.const 9) (i32.const 256) (i32.const 12)))
      (drop (call $syscall (i32.const 96) (i32.const 7) (i32.const 288) (i32.const 9))))

    (data (i32.const 256) "\03\00\00\00inc\01\00\00\00x")
    (data (i32.const 288) "\05\00\00\00hello")
"#;

/// Calls `counter.increase(key=mycounter)` and returns the callee's body.
const RELAY: &str = r#"
    (func (export "_initialize"))

    (func (export "_run")
      (if (i32.eqz (call $syscall (i32.const 64) (i32.const 12) (i32.const 256) (i32.const 55)))
        (then unreachable))
      (call $output (i32.const 200) (i32.const 1036) (i32.load (i32.const 1032))))

    (data (i32.const 256) "\04\00\00\00wasm\07\00\00\00counter\08\00\00\00increase"
                          "\01\00\00\00\03\00\00\00key\09\00\00\00mycounter")
"#;

/// Calls itself and stores the error under `err`.
const SELFISH: &str = r#"
    (func (export "_initialize"))

    (func (export "_run")
      (if (i32.eqz (call $syscall (i32.const 64) (i32.const 12) (i32.const 256) (i32.const 30)))
        (then (drop (call $put (i32.const 320) (i32.const 3) (i32.const 1024)
                              (global.get $resp_len))))))

    (data (i32.const 256) "\04\00\00\00wasm\07\00\00\00selfish\03\00\00\00run\00\00\00\00")
    (data (i32.const 320) "err")
"#;

/// Calls `counter.spin`, then reports success.
const SPIN_RELAY: &str = r#"
    (func (export "_initialize"))

    (func (export "_run")
      (drop (call $syscall (i32.const 64) (i32.const 12) (i32.const 256) (i32.const 31)))
      (call $output (i32.const 200) (i32.const 0) (i32.const 0)))

    (data (i32.const 256) "\04\00\00\00wasm\07\00\00\00counter\04\00\00\00spin\00\00\00\00")
"#;

/// Stores three keys, then reports how many items a capped scan returns.
const SCANNER: &str = r#"
    (func (export "_initialize"))

    (func (export "_fill")
      (drop (call $put (i32.const 300) (i32.const 1) (i32.const 300) (i32.const 1)))
      (drop (call $put (i32.const 301) (i32.const 1) (i32.const 301) (i32.const 1)))
      (drop (call $put (i32.const 302) (i32.const 1) (i32.const 302) (i32.const 1))))

    (func $scan (param $req i32)
      (drop (call $syscall (i32.const 128) (i32.const 11) (local.get $req) (i32.const 12)))
      (call $output (i32.const 200) (i32.const 1024) (i32.const 4)))

    (func (export "_capped") (call $scan (i32.const 256)))

    (func (export "_uncapped") (call $scan (i32.const 272)))

    (data (i32.const 256) "\00\00\00\00\00\00\00\00\02\00\00\00")
    (data (i32.const 272) "\00\00\00\00\00\00\00\00\00\00\00\00")
    (data (i32.const 300) "abc")
"#;

/// Looks up the block or transaction named by the first argument.
const LEDGER: &str = r#"
    (func (export "_initialize"))

    (func $query (param $m i32) (param $mlen i32)
      (call $load_first_arg)
      (i32.store (i32.const 4096) (global.get $arg_len))
      (call $copy (i32.const 4100) (global.get $arg_ptr) (global.get $arg_len))
      (if (call $syscall (local.get $m) (local.get $mlen) (i32.const 4096)
            (i32.add (global.get $arg_len) (i32.const 4)))
        (then (call $output (i32.const 200) (i32.const 1024) (global.get $resp_len)))
        (else (call $output (i32.const 404) (i32.const 1024) (global.get $resp_len)))))

    (func (export "_block") (call $query (i32.const 144) (i32.const 10)))

    (func (export "_tx") (call $query (i32.const 160) (i32.const 7)))
"#;

/// Hands `call_method` a request past the end of its single page.
const WILD: &str = r#"
    (func (export "_initialize"))

    (func (export "_wild")
      (drop (call $call_method (i32.const 0) (i32.const 11) (i32.const 70000) (i32.const 8))))
"#;

const EMSCRIPTEN_IMPORTS: &str = r#"
    (import "env" "getTotalMemory" (func $total_memory (result i32)))
    (import "env" "___setErrNo" (func $set_errno (param i32)))
    (import "env" "DYNAMICTOP_PTR" (global $dynamic_top i32))
    (import "global" "Infinity" (global $infinity f64))
"#;

/// Reports the heap pointer the host set up and the memory size.
const EMSCRIPTEN: &str = r#"
    (func (export "stackAlloc") (param i32) (result i32) (i32.const 4096))

    (func (export "_initialize"))

    (func (export "_heap")
      (call $set_errno (i32.const 1))
      (if (f64.ne (global.get $infinity) (f64.const inf)) (then unreachable))
      (i32.store (i32.const 2048) (i32.load (global.get $dynamic_top)))
      (i32.store (i32.const 2052) (call $total_memory))
      (call $output (i32.const 200) (i32.const 2048) (i32.const 8)))
"#;

const GO_IMPORTS: &str = r#"
    (import "go" "runtime.getRandomData" (func $random (param i32)))
    (import "go" "runtime.nanotime1" (func $nanotime (param i32)))
    (import "go" "runtime.wasmExit" (func $exit (param i32)))
"#;

/// Go stack frames live at 6000.
const GO: &str = r#"
    (func (export "_initialize"))

    (func (export "_entropy")
      (i64.store (i32.const 8192) (i64.const -1))
      (i64.store (i32.const 6008) (i64.const 8192))
      (i64.store (i32.const 6016) (i64.const 4))
      (call $random (i32.const 6000))
      (i64.store (i32.const 6008) (i64.const 99))
      (call $nanotime (i32.const 6000))
      (i64.store (i32.const 8200) (i64.load (i32.const 6008)))
      (call $output (i32.const 200) (i32.const 8192) (i32.const 16)))

    (func (export "_quit")
      (i32.store (i32.const 6008) (i32.const 3))
      (call $exit (i32.const 6000)))
"#;

const CODEC_IMPORTS: &str = r#"
    (import "env" "xvm_encode" (func $encode (param i32 i32 i32 i32) (result i32)))
    (import "env" "xvm_decode" (func $decode (param i32 i32 i32 i32) (result i32)))
"#;

const CODEC: &str = r#"
    (func (export "_initialize"))

    (func (export "_hex")
      (local $n i32)
      (local.set $n (call $encode (i32.const 300) (i32.const 3) (i32.const 304) (i32.const 2)))
      (drop (call $fetch_response (i32.const 2048) (local.get $n)))
      (call $output (i32.const 200) (i32.const 2048) (local.get $n)))

    (func (export "_unhex")
      (local $n i32)
      (local.set $n (call $decode (i32.const 300) (i32.const 3) (i32.const 308) (i32.const 2)))
      (if (call $fetch_response (i32.const 2048) (local.get $n))
        (then (call $output (i32.const 200) (i32.const 2048) (local.get $n)))
        (else (call $output (i32.const 400) (i32.const 2048) (local.get $n)))))

    (data (i32.const 300) "hex")
    (data (i32.const 304) "\01\ab")
    (data (i32.const 308) "zz")
"#;

const REFUSE_INIT: &str = r#"
    (func (export "_initialize")
      (call $output (i32.const 403) (i32.const 0) (i32.const 0)))
"#;

fn which(n: u8) -> String {
    format!(
        r#"
        (func (export "_initialize"))
        (func (export "_which") (call $output (i32.const 200) (i32.const 256) (i32.const 1)))
        (data (i32.const 256) "\{:02x}")
        "#,
        n
    )
}

fn contract(body: &str) -> Vec<u8> {
    contract_with("", body)
}

/// Imports beyond the prelude's must come before it.
fn contract_with(imports: &str, body: &str) -> Vec<u8> {
    wat::parse_str(format!("(module {} {} {})", imports, PRELUDE, body)).unwrap()
}

struct Harness {
    _dir: TempDir,
    store: Arc<MemoryStore>,
    vm: VmManager,
}

fn open(driver: Driver, basedir: &Path, store: Arc<MemoryStore>, opt_level: u8) -> VmManager {
    let config = VmConfig {
        opt_level,
        enable_upgrade: true,
        ..VmConfig::new(driver, basedir)
    };
    VmManager::new(config, store).unwrap()
}

fn harness(driver: Driver) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let vm = open(driver, dir.path(), store.clone(), 0);
    Harness {
        _dir: dir,
        store,
        vm,
    }
}

fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}

fn deploy(
    vm: &VmManager,
    name: &str,
    code: Vec<u8>,
    init_args: BTreeMap<String, Vec<u8>>,
) -> Execution {
    vm.deploy(DeployRequest {
        contract_name: name.to_string(),
        code,
        descriptor: ContractDescriptor::new(name, RuntimeTag::C),
        init_args,
        initiator: "icexin".to_string(),
        auth_require: vec!["icexin".to_string()],
        limits: Limits::max(),
    })
}

fn invoke_with(
    vm: &VmManager,
    name: &str,
    method: &str,
    call_args: BTreeMap<String, Vec<u8>>,
    limits: Limits,
) -> Execution {
    vm.invoke(InvokeRequest {
        contract: name.to_string(),
        method: method.to_string(),
        args: call_args,
        initiator: "icexin".to_string(),
        auth_require: Vec::new(),
        limits,
    })
}

fn invoke(vm: &VmManager, name: &str, method: &str) -> Execution {
    invoke_with(vm, name, method, BTreeMap::new(), Limits::max())
}

fn deploy_counter(h: &Harness) {
    let exec = deploy(&h.vm, "counter", contract(COUNTER), args(&[("creator", "icexin")]));
    assert!(exec.is_ok(), "deploy failed: {:?}", exec.outcome);
}

fn check_counter(driver: Driver) {
    let h = harness(driver);
    deploy_counter(&h);
    assert_eq!(
        h.store.get("counter", b"creator").unwrap(),
        Some(b"icexin".to_vec())
    );

    for expected in 1u64..=2 {
        let exec = invoke_with(
            &h.vm,
            "counter",
            "increase",
            args(&[("key", "mycounter")]),
            Limits::max(),
        );
        let response = exec.outcome.unwrap();
        assert_eq!(response.status, STATUS_OK);
        assert_eq!(response.body, expected.to_le_bytes().to_vec());
        assert!(exec.used.cpu > 0);
        assert_eq!(exec.used.disk, 9 + 8);
    }
    assert_eq!(
        h.store.get("counter", b"mycounter").unwrap(),
        Some(2u64.to_le_bytes().to_vec())
    );
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_counter_aot() {
    check_counter(Driver::Aot);
}

#[test]
fn test_counter_interp() {
    check_counter(Driver::Interp);
}

fn check_out_of_gas(driver: Driver) {
    let h = harness(driver);
    deploy_counter(&h);

    let limits = Limits {
        cpu: 100_000,
        ..Limits::max()
    };
    let exec = invoke_with(&h.vm, "counter", "spin", BTreeMap::new(), limits);
    let err = exec.outcome.unwrap_err();
    assert!(err.is_out_of_gas(), "unexpected error: {}", err);
    assert!(exec.used.cpu >= limits.cpu);
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_out_of_gas_aot() {
    check_out_of_gas(Driver::Aot);
}

#[test]
fn test_out_of_gas_interp() {
    check_out_of_gas(Driver::Interp);
}

fn cpu_ceiling(cpu: u64) -> Limits {
    Limits {
        cpu,
        ..Limits::max()
    }
}

fn check_host_gas_burns_fuel(driver: Driver) {
    let h = harness(driver);
    deploy_counter(&h);

    // The log costs about 80k, well under the ceiling
    let limits = cpu_ceiling(100_000);
    let exec = invoke_with(&h.vm, "counter", "chatty", BTreeMap::new(), limits);
    assert_eq!(
        exec.outcome.unwrap_err(),
        VmError::Trap(TrapKind::OutOfGas {
            used: 100_000,
            limit: 100_000
        })
    );
    assert_eq!(exec.used.cpu, 100_000);

    // The log alone is over this ceiling and never lands
    let exec = invoke_with(&h.vm, "counter", "chatty", BTreeMap::new(), cpu_ceiling(50_000));
    assert!(exec.outcome.unwrap_err().is_out_of_gas());
    assert!(exec.used.cpu >= 50_000);
    assert!(exec.logs.is_empty());
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_host_gas_burns_fuel_aot() {
    check_host_gas_burns_fuel(Driver::Aot);
}

#[test]
fn test_host_gas_burns_fuel_interp() {
    check_host_gas_burns_fuel(Driver::Interp);
}

fn check_nested_call_shares_ceiling(driver: Driver) {
    let h = harness(driver);
    deploy_counter(&h);
    assert!(deploy(&h.vm, "spinner", contract(SPIN_RELAY), BTreeMap::new()).is_ok());

    let limits = cpu_ceiling(200_000);
    let exec = invoke_with(&h.vm, "spinner", "run", BTreeMap::new(), limits);
    assert!(exec.outcome.unwrap_err().is_out_of_gas());
    assert_eq!(exec.used.cpu, limits.cpu);
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_nested_call_shares_ceiling_aot() {
    check_nested_call_shares_ceiling(Driver::Aot);
}

#[test]
fn test_nested_call_shares_ceiling_interp() {
    check_nested_call_shares_ceiling(Driver::Interp);
}

fn check_iterator_cap(driver: Driver) {
    let h = harness(driver);
    assert!(deploy(&h.vm, "scanner", contract(SCANNER), BTreeMap::new()).is_ok());
    assert!(invoke(&h.vm, "scanner", "fill").is_ok());

    let capped = invoke(&h.vm, "scanner", "capped").outcome.unwrap();
    assert_eq!(capped.body, 2u32.to_le_bytes().to_vec());

    let uncapped = invoke(&h.vm, "scanner", "uncapped").outcome.unwrap();
    assert_eq!(uncapped.body, 3u32.to_le_bytes().to_vec());
}

#[test]
fn test_iterator_cap_aot() {
    check_iterator_cap(Driver::Aot);
}

#[test]
fn test_iterator_cap_interp() {
    check_iterator_cap(Driver::Interp);
}

fn check_ledger_queries(driver: Driver) {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(StaticChain::new());
    chain.add_block(BlockInfo {
        blockid: b"b1".to_vec(),
        proposer: b"miner".to_vec(),
        height: 42,
        tx_count: 1,
        ..Default::default()
    });
    chain.add_tx(TxInfo {
        txid: b"t1".to_vec(),
        blockid: b"b1".to_vec(),
        initiator: "icexin".to_string(),
        desc: b"transfer".to_vec(),
    });
    let vm = VmManager::with_chain(
        VmConfig::new(driver, dir.path()),
        Arc::new(MemoryStore::new()),
        chain,
    )
    .unwrap();
    assert!(deploy(&vm, "ledger", contract(LEDGER), BTreeMap::new()).is_ok());

    let exec = invoke_with(&vm, "ledger", "block", args(&[("id", "b1")]), Limits::max());
    let body = exec.outcome.unwrap().body;
    let block = QueryBlockResponse::try_from_slice(&body).unwrap().block;
    assert_eq!(block.height, 42);
    assert_eq!(block.proposer, b"miner".to_vec());

    let exec = invoke_with(&vm, "ledger", "tx", args(&[("id", "t1")]), Limits::max());
    let body = exec.outcome.unwrap().body;
    let tx = QueryTxResponse::try_from_slice(&body).unwrap().tx;
    assert_eq!(tx.blockid, b"b1".to_vec());
    assert_eq!(tx.initiator, "icexin");

    let exec = invoke_with(&vm, "ledger", "block", args(&[("id", "nope")]), Limits::max());
    assert!(matches!(
        exec.outcome,
        Err(VmError::Contract { status: 404, .. })
    ));
}

#[test]
fn test_ledger_queries_aot() {
    check_ledger_queries(Driver::Aot);
}

#[test]
fn test_ledger_queries_interp() {
    check_ledger_queries(Driver::Interp);
}

fn check_wild_pointer_traps(driver: Driver) {
    let h = harness(driver);
    assert!(deploy(&h.vm, "wild", contract(WILD), BTreeMap::new()).is_ok());

    let exec = invoke(&h.vm, "wild", "wild");
    assert_eq!(
        exec.outcome.unwrap_err(),
        VmError::Trap(TrapKind::MemoryOutOfBounds)
    );
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_wild_pointer_traps_aot() {
    check_wild_pointer_traps(Driver::Aot);
}

#[test]
fn test_wild_pointer_traps_interp() {
    check_wild_pointer_traps(Driver::Interp);
}

fn check_emscripten_runtime(driver: Driver) {
    let h = harness(driver);
    let code = contract_with(EMSCRIPTEN_IMPORTS, EMSCRIPTEN);
    assert!(deploy(&h.vm, "cpp", code, BTreeMap::new()).is_ok());

    let body = invoke(&h.vm, "cpp", "heap").outcome.unwrap().body;
    let heap_base = 4096u32 + (256 << 10);
    assert_eq!(&body[..4], &heap_base.to_le_bytes());
    assert_eq!(&body[4..], &65536u32.to_le_bytes());
}

#[test]
fn test_emscripten_runtime_aot() {
    check_emscripten_runtime(Driver::Aot);
}

#[test]
fn test_emscripten_runtime_interp() {
    check_emscripten_runtime(Driver::Interp);
}

fn check_go_runtime(driver: Driver) {
    let h = harness(driver);
    let code = contract_with(GO_IMPORTS, GO);
    assert!(deploy(&h.vm, "gopher", code, BTreeMap::new()).is_ok());

    let body = invoke(&h.vm, "gopher", "entropy").outcome.unwrap().body;
    assert_eq!(&body[..8], &[0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
    assert_eq!(&body[8..], &0u64.to_le_bytes());

    let exec = invoke(&h.vm, "gopher", "quit");
    assert_eq!(
        exec.outcome.unwrap_err(),
        VmError::Trap(TrapKind::Host("exit code 3".to_string()))
    );
}

#[test]
fn test_go_runtime_aot() {
    check_go_runtime(Driver::Aot);
}

#[test]
fn test_go_runtime_interp() {
    check_go_runtime(Driver::Interp);
}

fn check_codec_builtins(driver: Driver) {
    let h = harness(driver);
    let code = contract_with(CODEC_IMPORTS, CODEC);
    assert!(deploy(&h.vm, "codec", code, BTreeMap::new()).is_ok());

    let response = invoke(&h.vm, "codec", "hex").outcome.unwrap();
    assert_eq!(response.body, b"01ab".to_vec());

    let exec = invoke(&h.vm, "codec", "unhex");
    assert!(matches!(
        exec.outcome,
        Err(VmError::Contract { status: 400, .. })
    ));
}

#[test]
fn test_codec_builtins_aot() {
    check_codec_builtins(Driver::Aot);
}

#[test]
fn test_codec_builtins_interp() {
    check_codec_builtins(Driver::Interp);
}

fn check_error_kinds(driver: Driver) {
    let h = harness(driver);
    deploy_counter(&h);

    let exec = invoke(&h.vm, "counter", "fail");
    assert_eq!(
        exec.outcome.unwrap_err(),
        VmError::Contract {
            status: 500,
            message: String::new()
        }
    );
    assert!(exec.used.cpu > 0);

    let exec = invoke(&h.vm, "counter", "boom");
    assert_eq!(exec.outcome.unwrap_err(), VmError::Trap(TrapKind::Unreachable));

    // Runtime traps keep the artifact
    let compilations = h.vm.cache_stats().compilations;
    assert!(invoke(&h.vm, "counter", "ping").is_ok());
    assert_eq!(h.vm.cache_stats().compilations, compilations);
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_error_kinds_aot() {
    check_error_kinds(Driver::Aot);
}

#[test]
fn test_error_kinds_interp() {
    check_error_kinds(Driver::Interp);
}

fn check_corrupt_bytecode(driver: Driver) {
    let h = harness(driver);
    let exec = deploy(&h.vm, "broken", b"\0asm\x01\0\0\0garbage".to_vec(), BTreeMap::new());
    assert!(matches!(exec.outcome, Err(VmError::Compilation(_))));
    assert!(h.store.get("contract", b"broken.desc").unwrap().is_none());
    assert!(h.store.get("contract", b"broken.code").unwrap().is_none());
    assert!(h.vm.descriptor("broken").unwrap().is_none());
}

#[test]
fn test_corrupt_bytecode_aot() {
    check_corrupt_bytecode(Driver::Aot);
}

#[test]
fn test_corrupt_bytecode_interp() {
    check_corrupt_bytecode(Driver::Interp);
}

fn check_redeploy_runs_new_code(driver: Driver) {
    let dir = TempDir::new().unwrap();

    // Same cache directory, two chains
    let first = open(driver, dir.path(), Arc::new(MemoryStore::new()), 0);
    assert!(deploy(&first, "picker", contract(&which(1)), BTreeMap::new()).is_ok());
    assert_eq!(invoke(&first, "picker", "which").outcome.unwrap().body, vec![1]);
    drop(first);

    let second = open(driver, dir.path(), Arc::new(MemoryStore::new()), 0);
    assert!(deploy(&second, "picker", contract(&which(2)), BTreeMap::new()).is_ok());
    assert_eq!(invoke(&second, "picker", "which").outcome.unwrap().body, vec![2]);

    let exec = second.upgrade(UpgradeRequest {
        contract_name: "picker".to_string(),
        code: contract(&which(3)),
        limits: Limits::max(),
    });
    assert_eq!(exec.outcome.unwrap().message, "upgrade success");
    assert!(exec.used.disk > 0);
    assert_eq!(invoke(&second, "picker", "which").outcome.unwrap().body, vec![3]);
}

#[test]
fn test_redeploy_runs_new_code_aot() {
    check_redeploy_runs_new_code(Driver::Aot);
}

#[test]
fn test_redeploy_runs_new_code_interp() {
    check_redeploy_runs_new_code(Driver::Interp);
}

#[test]
fn test_upgrade_missing_contract() {
    let h = harness(Driver::Interp);
    let exec = h.vm.upgrade(UpgradeRequest {
        contract_name: "nobody".to_string(),
        code: contract(&which(1)),
        limits: Limits::max(),
    });
    assert!(matches!(exec.outcome, Err(VmError::ContractNotFound(_))));
}

fn check_concurrent_first_use(driver: Driver) {
    let store = Arc::new(MemoryStore::new());
    let deploy_dir = TempDir::new().unwrap();
    let h = Harness {
        vm: open(driver, deploy_dir.path(), store.clone(), 0),
        store: store.clone(),
        _dir: deploy_dir,
    };
    deploy_counter(&h);

    // A fresh cache has never compiled the contract
    let dir = TempDir::new().unwrap();
    let vm = open(driver, dir.path(), store, 0);
    let results: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| invoke(&vm, "counter", "ping").is_ok()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results, vec![true; 8]);
    assert_eq!(vm.cache_stats().compilations, 1);
    assert_eq!(vm.live_contexts(), 0);
}

#[test]
fn test_concurrent_first_use_aot() {
    check_concurrent_first_use(Driver::Aot);
}

#[test]
fn test_concurrent_first_use_interp() {
    check_concurrent_first_use(Driver::Interp);
}

#[test]
fn test_compiler_version_change_recompiles() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let old = open(Driver::Aot, dir.path(), store.clone(), 0);
    assert!(deploy(&old, "counter", contract(COUNTER), args(&[("creator", "icexin")])).is_ok());
    let old_version = old.compiler_version().to_string();
    drop(old);

    let same = open(Driver::Aot, dir.path(), store.clone(), 0);
    assert!(invoke(&same, "counter", "ping").is_ok());
    assert_eq!(same.cache_stats().disk_hits, 1);
    assert_eq!(same.cache_stats().compilations, 0);
    drop(same);

    let newer = open(Driver::Aot, dir.path(), store, 3);
    assert_ne!(newer.compiler_version(), old_version);
    assert!(invoke(&newer, "counter", "ping").is_ok());
    assert_eq!(newer.cache_stats().disk_hits, 0);
    assert_eq!(newer.cache_stats().compilations, 1);
}

fn check_nested_call(driver: Driver) {
    let h = harness(driver);
    deploy_counter(&h);
    assert!(deploy(&h.vm, "relay", contract(RELAY), BTreeMap::new()).is_ok());

    let direct = invoke_with(
        &h.vm,
        "counter",
        "increase",
        args(&[("key", "mycounter")]),
        Limits::max(),
    );
    assert!(direct.is_ok());

    let exec = invoke(&h.vm, "relay", "run");
    let response = exec.outcome.unwrap();
    assert_eq!(response.body, 2u64.to_le_bytes().to_vec());
    assert!(exec.used.cpu > direct.used.cpu);

    // The callee writes into its own bucket
    assert_eq!(
        h.store.get("counter", b"mycounter").unwrap(),
        Some(2u64.to_le_bytes().to_vec())
    );
    assert!(h.store.get("relay", b"mycounter").unwrap().is_none());
    assert_eq!(h.vm.live_contexts(), 0);
}

#[test]
fn test_nested_call_aot() {
    check_nested_call(Driver::Aot);
}

#[test]
fn test_nested_call_interp() {
    check_nested_call(Driver::Interp);
}

#[test]
fn test_reentrant_call_refused() {
    let h = harness(Driver::Interp);
    assert!(deploy(&h.vm, "selfish", contract(SELFISH), BTreeMap::new()).is_ok());

    let exec = invoke(&h.vm, "selfish", "run");
    assert!(exec.is_ok(), "{:?}", exec.outcome);
    let err = h.store.get("selfish", b"err").unwrap().unwrap();
    let err = String::from_utf8(err).unwrap();
    assert!(err.contains("already in call chain"), "{}", err);
}

#[test]
fn test_contract_error_in_initialize_keeps_cache() {
    let h = harness(Driver::Aot);
    let code = contract(REFUSE_INIT);

    let exec = deploy(&h.vm, "refuser", code.clone(), BTreeMap::new());
    assert!(matches!(exec.outcome, Err(VmError::Contract { status: 403, .. })));
    assert!(h.vm.descriptor("refuser").unwrap().is_none());
    assert_eq!(h.vm.cache_stats().compilations, 1);

    let exec = deploy(&h.vm, "refuser", code, BTreeMap::new());
    assert!(exec.outcome.is_err());
    assert_eq!(h.vm.cache_stats().compilations, 1);
    assert_eq!(h.vm.cache_stats().memory_hits, 1);
}

#[test]
fn test_trap_in_initialize_evicts_cache() {
    let h = harness(Driver::Aot);
    let code = contract(r#"(func (export "_initialize") unreachable)"#);

    let exec = deploy(&h.vm, "crasher", code.clone(), BTreeMap::new());
    assert_eq!(exec.outcome.unwrap_err(), VmError::Trap(TrapKind::Unreachable));

    deploy(&h.vm, "crasher", code, BTreeMap::new());
    assert_eq!(h.vm.cache_stats().compilations, 2);
}

#[test]
fn test_events_and_logs() {
    let h = harness(Driver::Interp);
    deploy_counter(&h);

    let exec = invoke(&h.vm, "counter", "announce");
    assert!(exec.is_ok());
    assert_eq!(
        exec.events,
        vec![ContractEvent {
            contract: "counter".to_string(),
            name: "inc".to_string(),
            body: b"x".to_vec(),
        }]
    );
    assert_eq!(exec.logs, vec!["hello".to_string()]);
}

#[test]
fn test_disk_limit() {
    let h = harness(Driver::Interp);
    deploy_counter(&h);

    let limits = Limits {
        disk: 4,
        ..Limits::max()
    };
    let exec = invoke_with(&h.vm, "counter", "increase", args(&[("key", "mycounter")]), limits);
    assert_eq!(
        exec.outcome.unwrap_err(),
        VmError::Trap(TrapKind::DiskLimitExceeded { size: 17, limit: 4 })
    );
    assert!(h.store.get("counter", b"mycounter").unwrap().is_none());
}

#[test]
fn test_stale_context_is_caller_error() {
    let h = harness(Driver::Interp);
    let gas = GasTracker::new(1_000_000, GasSchedule::default());
    let mut state = HostState::new(999, h.vm.core().clone(), gas);
    let err = syscall::call(&mut state, 0, "Ping", &[]).unwrap_err();
    assert_eq!(err, SyscallError::Failed("context 999 not found".to_string()));
}

#[test]
fn test_unresolved_import_rejected_at_deploy() {
    let h = harness(Driver::Interp);
    let code = wat::parse_str(
        r#"(module
            (import "env" "malloc" (func (param i32) (result i32)))
            (func (export "_initialize")))"#,
    )
    .unwrap();
    let exec = deploy(&h.vm, "needy", code, BTreeMap::new());
    assert!(matches!(
        exec.outcome,
        Err(VmError::Trap(TrapKind::UnresolvedImport { .. }))
    ));
    assert!(h.vm.descriptor("needy").unwrap().is_none());
}
