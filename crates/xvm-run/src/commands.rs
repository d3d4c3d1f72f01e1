//! Runner subcommands.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use xvm_storage::Database;
use xvm_types::{ContractDescriptor, Digest, Limits, RuntimeTag};
use xvm_vm::{
    AotCompiler, Compiler, DeployRequest, Driver, Execution, InterpCompiler, InvokeRequest,
    UpgradeRequest, VmManager,
};

use crate::config::RunConfig;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "xvm-run")]
#[command(about = "Deploy and invoke XVM contracts against a local state directory")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// State directory
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Artifact cache directory
    #[arg(long, global = true)]
    pub basedir: Option<PathBuf>,

    /// Compilation driver (aot|interp)
    #[arg(long, global = true)]
    pub driver: Option<Driver>,

    /// Log level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy a contract and run its initialize method
    Deploy {
        /// Contract name
        name: String,
        /// WebAssembly file
        wasm: PathBuf,
        /// Runtime tag (c|go|rust)
        #[arg(long, default_value = "c")]
        runtime: RuntimeTag,
        #[command(flatten)]
        call: CallOpts,
    },

    /// Invoke a contract method
    Invoke {
        /// Contract name
        name: String,
        /// Method name
        method: String,
        #[command(flatten)]
        call: CallOpts,
    },

    /// Replace the code of a deployed contract
    Upgrade {
        /// Contract name
        name: String,
        /// WebAssembly file
        wasm: PathBuf,
        #[command(flatten)]
        call: CallOpts,
    },

    /// Compile a WebAssembly file without deploying it
    Compile {
        /// WebAssembly file
        wasm: PathBuf,
        /// Write the artifact here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Options shared by every call.
#[derive(ClapArgs, Debug, Clone)]
pub struct CallOpts {
    /// Call argument as key=value, repeatable
    #[arg(short, long = "arg", value_parser = parse_key_value)]
    pub args: Vec<(String, String)>,

    /// Initiating account
    #[arg(long, default_value = "")]
    pub initiator: String,

    /// Required authorizer, repeatable
    #[arg(long = "auth")]
    pub auth_require: Vec<String>,

    /// Cpu ceiling
    #[arg(long)]
    pub cpu: Option<u64>,

    /// Memory ceiling in bytes
    #[arg(long)]
    pub memory: Option<u64>,

    /// Disk ceiling in bytes
    #[arg(long)]
    pub disk: Option<u64>,
}

impl CallOpts {
    fn arg_map(&self) -> BTreeMap<String, Vec<u8>> {
        self.args
            .iter()
            .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
            .collect()
    }

    fn limits(&self) -> Limits {
        let max = Limits::max();
        Limits {
            cpu: self.cpu.unwrap_or(max.cpu),
            memory: self.memory.unwrap_or(max.memory),
            disk: self.disk.unwrap_or(max.disk),
        }
    }
}

pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

/// Load the configuration file and apply command-line overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<RunConfig> {
    let mut config = match &cli.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };

    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(basedir) = &cli.basedir {
        config.vm.basedir = basedir.clone();
    }
    if let Some(driver) = cli.driver {
        config.vm.driver = driver;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn open_engine(config: &RunConfig) -> anyhow::Result<VmManager> {
    let store = Arc::new(Database::new(&config.state_dir)?);
    let vm = VmManager::new(config.vm.clone(), store)?;
    info!(
        state_dir = %config.state_dir.display(),
        compiler = vm.compiler_version(),
        "engine ready"
    );
    Ok(vm)
}

/// Execute a command.
pub fn execute(command: Commands, config: RunConfig) -> anyhow::Result<()> {
    let exec = match command {
        Commands::Compile { wasm, output } => {
            return compile(&config, &wasm, output.as_deref());
        }
        Commands::Deploy {
            name,
            wasm,
            runtime,
            call,
        } => {
            let code = std::fs::read(&wasm)?;
            open_engine(&config)?.deploy(DeployRequest {
                descriptor: ContractDescriptor::new(&name, runtime),
                contract_name: name,
                code,
                init_args: call.arg_map(),
                initiator: call.initiator.clone(),
                auth_require: call.auth_require.clone(),
                limits: call.limits(),
            })
        }
        Commands::Invoke { name, method, call } => open_engine(&config)?.invoke(InvokeRequest {
            contract: name,
            method,
            args: call.arg_map(),
            initiator: call.initiator.clone(),
            auth_require: call.auth_require.clone(),
            limits: call.limits(),
        }),
        Commands::Upgrade { name, wasm, call } => {
            let code = std::fs::read(&wasm)?;
            open_engine(&config)?.upgrade(UpgradeRequest {
                contract_name: name,
                code,
                limits: call.limits(),
            })
        }
    };

    report(exec)
}

fn report(exec: Execution) -> anyhow::Result<()> {
    println!("used: {}", exec.used);
    for log in &exec.logs {
        println!("log: {}", log);
    }
    for event in &exec.events {
        println!("event: {} {} {}", event.contract, event.name, hex::encode(&event.body));
    }

    let response = exec.outcome?;
    println!("status: {}", response.status);
    if !response.message.is_empty() {
        println!("message: {}", response.message);
    }
    match std::str::from_utf8(&response.body) {
        Ok(text) if !text.is_empty() => println!("body: {}", text),
        Ok(_) => {}
        Err(_) => println!("body: 0x{}", hex::encode(&response.body)),
    }
    Ok(())
}

fn compile(config: &RunConfig, wasm: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let bytecode = std::fs::read(wasm)?;
    let compiler: Box<dyn Compiler> = match config.vm.driver {
        Driver::Aot => Box::new(AotCompiler::new(&config.vm)?),
        Driver::Interp => Box::new(InterpCompiler::new()),
    };

    let artifact = compiler.compile(&bytecode)?;
    println!("compiler: {}", compiler.version());
    println!("digest: {}", Digest::of(&bytecode));
    println!("artifact: {} bytes", artifact.len());

    if let Some(path) = output {
        std::fs::write(path, &artifact)?;
        info!(path = %path.display(), "artifact written");
    }
    Ok(())
}
