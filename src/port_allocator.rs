//! Process-wide allocator for host-network ports.
//!
//! A bitmap over the configured range records which ports are reserved by
//! some runtime. The state is not persisted on its own: on first use it is
//! rebuilt from the values ConfigMap of every live runtime.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterBackend, ClusterError};
use crate::port_parser::{VALUES_KEY, parse_ports_from_values, values_configmap_name};
use crate::settings::PortRange;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortAllocError {
    #[error("port range exhausted: requested {requested}, {available} available")]
    Exhausted { requested: usize, available: usize },
}

struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn get(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: usize) {
        self.words[i / 64] &= !(1 << (i % 64));
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

pub struct PortAllocator {
    range: PortRange,
    reserved: Mutex<Bitmap>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            reserved: Mutex::new(Bitmap::new(range.size as usize)),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bitmap> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve and return the `n` lowest free ports. Either all `n` are reserved or none.
    pub fn get_available_ports(&self, n: usize) -> Result<Vec<u16>, PortAllocError> {
        let mut bitmap = self.lock();
        let free: Vec<usize> = (0..bitmap.len).filter(|i| !bitmap.get(*i)).take(n).collect();
        if free.len() < n {
            return Err(PortAllocError::Exhausted {
                requested: n,
                available: free.len(),
            });
        }
        for i in &free {
            bitmap.set(*i);
        }
        let ports: Vec<u16> = free.iter().map(|i| self.range.base + *i as u16).collect();
        debug!(ports = ?ports, "reserved ports");
        Ok(ports)
    }

    /// Return ports to the pool. Unknown, free or out-of-range ports are ignored.
    pub fn release_reserved_ports(&self, ports: &[u16]) {
        let mut bitmap = self.lock();
        for port in ports {
            if self.range.contains(*port) {
                bitmap.clear((*port - self.range.base) as usize);
            }
        }
        debug!(ports = ?ports, "released ports");
    }

    /// Mark ports as taken without allocating them, e.g. when rebuilding state.
    pub fn reserve(&self, ports: &[u16]) {
        let mut bitmap = self.lock();
        for port in ports {
            if self.range.contains(*port) {
                bitmap.set((*port - self.range.base) as usize);
            }
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.range.contains(port) && self.lock().get((port - self.range.base) as usize)
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().count_ones()
    }

    /// Reserve every port recorded in the values ConfigMaps of existing runtimes.
    ///
    /// Host ports are shared by every namespace on a node, so runtimes are
    /// listed cluster-wide even when the controller watches one namespace.
    /// Unreadable values are logged and skipped. Returns the number of ports reserved.
    pub async fn rehydrate(
        &self,
        cluster: &dyn ClusterBackend,
        runtime_type: &str,
    ) -> Result<usize, ClusterError> {
        let mut total = 0;
        for runtime in cluster.list_runtimes(None).await? {
            let cm_name = values_configmap_name(runtime.name(), runtime_type);
            let Some(cm) = cluster.get_configmap(runtime.namespace(), &cm_name).await? else {
                continue;
            };
            let Some(values) = cm.data.as_ref().and_then(|d| d.get(VALUES_KEY)) else {
                continue;
            };
            match parse_ports_from_values(values) {
                Ok(ports) => {
                    self.reserve(&ports);
                    total += ports.len();
                }
                Err(e) => {
                    warn!(
                        namespace = %runtime.namespace(),
                        runtime = %runtime.name(),
                        error = %e,
                        "skipping unreadable values while rebuilding reserved ports"
                    );
                }
            }
        }
        info!(reserved = total, "rebuilt reserved port set");
        Ok(total)
    }
}

static GLOBAL: OnceCell<Arc<PortAllocator>> = OnceCell::const_new();

/// The process-wide allocator, built and rehydrated on first call.
///
/// Later calls return the same instance regardless of arguments.
pub async fn global(
    cluster: &dyn ClusterBackend,
    range: PortRange,
    runtime_type: &str,
) -> Result<Arc<PortAllocator>, ClusterError> {
    GLOBAL
        .get_or_try_init(|| async {
            let allocator = PortAllocator::new(range);
            allocator.rehydrate(cluster, runtime_type).await?;
            Ok(Arc::new(allocator))
        })
        .await
        .cloned()
}
