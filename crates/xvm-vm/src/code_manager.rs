//! Two-tier cache of compiled contracts.
//!
//! The memory tier maps a contract name to its loaded [`Code`]. The disk
//! tier keeps native artifacts under `<basedir>/<name>/code.<ext>` with a
//! JSON manifest `<basedir>/<name>/code.desc` written last. A manifest only
//! counts as a hit when both the code digest and the compiler version match
//! the request.

use crate::compiler::{Code, Compiler, LoadSource};
use crate::error::VmError;
use crate::resolver::Resolver;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use xvm_types::{ContractDescriptor, Digest};

pub const MANIFEST_FILE: &str = "code.desc";

/// Source of contract descriptors and bytecode.
pub trait CodeProvider {
    fn get_descriptor(&self, name: &str) -> Result<ContractDescriptor, VmError>;

    fn get_code(&self, name: &str) -> Result<Vec<u8>, VmError>;
}

/// A loaded contract, shared by every call to it.
pub struct CompiledArtifact {
    /// Descriptor the code was built from, stamped with the compiler
    /// version
    pub desc: ContractDescriptor,
    pub code: Arc<dyn Code>,
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub compilations: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    compilations: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

type FlightResult = (Digest, Result<Arc<CompiledArtifact>, VmError>);

/// One in-progress fill for a name. Later callers wait on the cell.
type Flight = Arc<OnceCell<FlightResult>>;

pub struct CodeManager {
    basedir: PathBuf,
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn Resolver>,
    memory: Mutex<HashMap<String, Arc<CompiledArtifact>>>,
    flights: Mutex<HashMap<String, Flight>>,
    stats: Counters,
}

impl CodeManager {
    /// Open the cache rooted at `basedir`. Run copies left by an earlier
    /// process are removed.
    pub fn new(
        basedir: impl Into<PathBuf>,
        compiler: Arc<dyn Compiler>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self, VmError> {
        let basedir = basedir.into();
        fs::create_dir_all(&basedir)?;

        let run_dir = basedir.join("var").join("run");
        match fs::remove_dir_all(&run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&run_dir)?;

        tracing::info!(
            basedir = %basedir.display(),
            compiler = compiler.version(),
            "code manager ready"
        );

        Ok(Self {
            basedir,
            compiler,
            resolver,
            memory: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            stats: Counters::default(),
        })
    }

    pub fn compiler_version(&self) -> &str {
        self.compiler.version()
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        self.basedir.join(name)
    }

    fn memory_lookup(&self, name: &str, digest: &Digest) -> Option<Arc<CompiledArtifact>> {
        self.memory
            .lock()
            .get(name)
            .filter(|artifact| artifact.desc.digest == *digest)
            .cloned()
    }

    /// Return a loaded artifact for `desc`, compiling it at most once per
    /// digest no matter how many callers ask at the same time.
    pub fn get_or_compile(
        &self,
        provider: &dyn CodeProvider,
        desc: &ContractDescriptor,
    ) -> Result<Arc<CompiledArtifact>, VmError> {
        let name = &desc.contract_name;
        loop {
            if let Some(artifact) = self.memory_lookup(name, &desc.digest) {
                Counters::bump(&self.stats.memory_hits);
                return Ok(artifact);
            }

            let flight = self
                .flights
                .lock()
                .entry(name.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let (digest, result) = flight.get_or_init(|| (desc.digest, self.fill(provider, desc)));

            {
                let mut flights = self.flights.lock();
                if flights.get(name).map_or(false, |f| Arc::ptr_eq(f, &flight)) {
                    flights.remove(name);
                }
            }

            if *digest == desc.digest {
                return result.clone();
            }
            // The flight we joined was for another version of the code
        }
    }

    fn fill(
        &self,
        provider: &dyn CodeProvider,
        desc: &ContractDescriptor,
    ) -> Result<Arc<CompiledArtifact>, VmError> {
        let name = &desc.contract_name;
        if let Some(artifact) = self.memory_lookup(name, &desc.digest) {
            Counters::bump(&self.stats.memory_hits);
            return Ok(artifact);
        }

        // Release the stale module before the disk tier is touched
        let stale = self.memory.lock().remove(name);
        if let Some(stale) = stale {
            tracing::info!(
                contract = %name,
                old = %stale.desc.digest.short(),
                new = %desc.digest.short(),
                "evicting stale artifact"
            );
            Counters::bump(&self.stats.evictions);
            drop(stale);
        }

        let code = match self.compiler.artifact_extension() {
            None => {
                let bytecode = self.fetch_code(provider, desc)?;
                Counters::bump(&self.stats.compilations);
                self.compiler
                    .load(LoadSource::Bytecode(&bytecode), self.resolver.as_ref())?
            }
            Some(ext) => self.load_native(provider, desc, ext)?,
        };

        let artifact = Arc::new(CompiledArtifact {
            desc: desc
                .clone()
                .with_compiler_version(self.compiler.version()),
            code,
        });
        self.memory.lock().insert(name.clone(), artifact.clone());
        Ok(artifact)
    }

    fn fetch_code(
        &self,
        provider: &dyn CodeProvider,
        desc: &ContractDescriptor,
    ) -> Result<Vec<u8>, VmError> {
        let bytecode = provider.get_code(&desc.contract_name)?;
        let digest = Digest::of(&bytecode);
        if !desc.digest.is_zero() && digest != desc.digest {
            return Err(VmError::Storage(format!(
                "code digest mismatch for {}: expected {}, got {}",
                desc.contract_name,
                desc.digest.short(),
                digest.short()
            )));
        }
        Ok(bytecode)
    }

    fn load_native(
        &self,
        provider: &dyn CodeProvider,
        desc: &ContractDescriptor,
        ext: &str,
    ) -> Result<Arc<dyn Code>, VmError> {
        let name = &desc.contract_name;
        let dir = self.cache_dir(name);
        let manifest_path = dir.join(MANIFEST_FILE);
        let artifact_path = dir.join(format!("code.{}", ext));
        let version = self.compiler.version();

        let cached = match self.read_manifest(&manifest_path) {
            Ok(cached) => cached,
            Err(VmError::ManifestCorrupt(reason)) => {
                tracing::warn!(
                    contract = %name,
                    %reason,
                    "corrupt manifest, recompiling from source"
                );
                remove_dir_if_exists(&dir)?;
                None
            }
            Err(e) => return Err(e),
        };

        match cached {
            Some(cached) if cached.digest == desc.digest && cached.compiler_version == version => {
                if artifact_path.is_file() {
                    Counters::bump(&self.stats.disk_hits);
                    tracing::debug!(
                        contract = %name,
                        digest = %desc.digest.short(),
                        "disk cache hit"
                    );
                    return self
                        .compiler
                        .load(LoadSource::File(&artifact_path), self.resolver.as_ref());
                }
                tracing::warn!(contract = %name, "manifest without artifact, recompiling");
            }
            Some(cached) => {
                tracing::debug!(
                    contract = %name,
                    cached_digest = %cached.digest.short(),
                    cached_version = %cached.compiler_version,
                    "disk cache miss"
                );
            }
            None => {}
        }

        let bytecode = self.fetch_code(provider, desc)?;
        Counters::bump(&self.stats.compilations);
        let native = self.compiler.compile(&bytecode)?;
        tracing::info!(
            contract = %name,
            digest = %desc.digest.short(),
            bytes = native.len(),
            "compiled contract"
        );

        fs::create_dir_all(&dir)?;
        // Until the new manifest lands the directory must read as a miss
        remove_if_exists(&manifest_path)?;
        write_atomic(&artifact_path, &native)?;
        let record = desc.clone().with_compiler_version(version);
        write_atomic(&manifest_path, &record.to_json()?)?;

        self.compiler
            .load(LoadSource::File(&artifact_path), self.resolver.as_ref())
    }

    /// Read a manifest, `None` when there is none.
    fn read_manifest(&self, path: &Path) -> Result<Option<ContractDescriptor>, VmError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        ContractDescriptor::from_json(&data)
            .map(Some)
            .map_err(|e| VmError::ManifestCorrupt(format!("{}: {}", path.display(), e)))
    }

    /// Drop `name` from both tiers. Returns whether anything was cached.
    pub fn remove_cache(&self, name: &str) -> Result<bool, VmError> {
        let in_memory = self.memory.lock().remove(name).is_some();
        if in_memory {
            Counters::bump(&self.stats.evictions);
        }
        let on_disk = remove_dir_if_exists(&self.cache_dir(name))?;
        tracing::debug!(contract = %name, in_memory, on_disk, "removed cache");
        Ok(in_memory || on_disk)
    }

    /// Number of artifacts in the memory tier.
    pub fn cached(&self) -> usize {
        self.memory.lock().len()
    }
}

fn remove_if_exists(path: &Path) -> Result<(), VmError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<bool, VmError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file and rename, so readers never see a partial
/// file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), VmError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
