use std::sync::{Mutex, PoisonError};
use sysinfo::{CpuExt, System, SystemExt};

/// Fuente del uso de CPU (0-100) que el load balancer publica.
pub trait CpuProbe: Send + Sync {
    fn utilization(&self) -> f64;
}

/// Muestreo real con sysinfo. El valor es el uso desde el refresco anterior.
pub struct SysinfoCpuProbe {
    sys: Mutex<System>,
}

impl SysinfoCpuProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            sys: Mutex::new(sys),
        }
    }
}

impl Default for SysinfoCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SysinfoCpuProbe {
    fn utilization(&self) -> f64 {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu();
        sys.global_cpu_info().cpu_usage() as f64
    }
}

/// Valor constante, para tests y clusters en un mismo proceso.
pub struct FixedCpuProbe(pub f64);

impl CpuProbe for FixedCpuProbe {
    fn utilization(&self) -> f64 {
        self.0
    }
}
