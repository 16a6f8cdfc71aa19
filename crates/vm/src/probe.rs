/// Process memory usage in bytes.
pub trait MemoryProbe: Send + Sync {
    fn current_bytes(&self) -> Option<i64>;
    fn peak_bytes(&self) -> Option<i64>;
}

/// Reads resident set sizes from `/proc/self/status`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct ProcfsProbe;

#[cfg(target_os = "linux")]
impl ProcfsProbe {
    fn status() -> Option<procfs::process::Status> {
        procfs::process::Process::myself().ok()?.status().ok()
    }
}

#[cfg(target_os = "linux")]
impl MemoryProbe for ProcfsProbe {
    fn current_bytes(&self) -> Option<i64> {
        Self::status()?.vmrss.map(|kb| kb as i64 * 1024)
    }

    fn peak_bytes(&self) -> Option<i64> {
        Self::status()?.vmhwm.map(|kb| kb as i64 * 1024)
    }
}

/// Knows nothing.
#[derive(Debug, Default)]
pub struct NullProbe;

impl MemoryProbe for NullProbe {
    fn current_bytes(&self) -> Option<i64> {
        None
    }

    fn peak_bytes(&self) -> Option<i64> {
        None
    }
}

pub fn default_probe() -> Box<dyn MemoryProbe> {
    #[cfg(target_os = "linux")]
    return Box::new(ProcfsProbe);
    #[cfg(not(target_os = "linux"))]
    return Box::new(NullProbe);
}

#[cfg(target_os = "linux")]
#[test]
fn procfs_probe() {
    let probe = ProcfsProbe;
    let current = probe.current_bytes().unwrap();
    let peak = probe.peak_bytes().unwrap();
    assert!(current > 0);
    assert!(peak >= current);
    assert!(NullProbe.current_bytes().is_none());
}
