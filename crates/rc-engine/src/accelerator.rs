// Accelerator preflight

use std::process::Command;

/// Reports whether a GPU is usable before a run starts.
pub trait AcceleratorProbe: Send + Sync {
    /// `Err` carries the reason the accelerator is unavailable.
    fn check(&self) -> Result<(), String>;
}

/// Asks `nvidia-smi -L` for the device list.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvidiaSmiProbe;

impl AcceleratorProbe for NvidiaSmiProbe {
    fn check(&self) -> Result<(), String> {
        let output = Command::new("nvidia-smi")
            .arg("-L")
            .output()
            .map_err(|e| format!("nvidia-smi not available: {e}"))?;
        if !output.status.success() {
            return Err(format!("nvidia-smi exited with {}", output.status));
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        if listing.lines().any(|line| line.starts_with("GPU")) {
            Ok(())
        } else {
            Err("no GPU devices listed".to_string())
        }
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub Result<(), String>);

impl AcceleratorProbe for StaticProbe {
    fn check(&self) -> Result<(), String> {
        self.0.clone()
    }
}
