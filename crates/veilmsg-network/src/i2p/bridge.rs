//! Boundary to the native i2p daemon
//!
//! The daemon is reached through a narrow, synchronous C-style surface.
//! Every call may block briefly, so callers run them on the blocking pool.

use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

/// Result string returned by a successful [`DaemonBridge::start_daemon`]
pub const START_OK: &str = "ok";

/// Native daemon call surface
pub trait DaemonBridge: Send + Sync + 'static {
    fn set_data_dir(&self, path: &Path);

    /// Returns `"ok"` or an error description
    fn start_daemon(&self) -> String;

    fn stop_daemon(&self);

    /// True once the SAM bridge accepts connections
    fn get_sam_state(&self) -> bool;

    fn get_web_console_addr(&self) -> String;
}

/// Runs i2pd as a child process
pub struct I2pdProcessBridge {
    binary: Option<PathBuf>,
    sam_port: u16,
    web_console_port: u16,
    data_dir: Mutex<Option<PathBuf>>,
    process: Mutex<Option<Child>>,
}

impl I2pdProcessBridge {
    /// `binary` of `None` searches `PATH`
    pub fn new(binary: Option<PathBuf>, sam_port: u16, web_console_port: u16) -> Self {
        I2pdProcessBridge {
            binary,
            sam_port,
            web_console_port,
            data_dir: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    /// Find i2pd binary in system PATH
    fn find_i2pd_binary() -> Option<PathBuf> {
        for name in &["i2pd", "i2pd.exe"] {
            if let Ok(output) = Command::new("which").arg(name).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        return Some(PathBuf::from(path));
                    }
                }
            }
        }
        None
    }

    fn spawn(&self) -> Result<Child, String> {
        let data_dir = self
            .data_dir
            .lock()
            .map_err(|_| "data dir lock poisoned".to_string())?
            .clone()
            .ok_or_else(|| "data directory not set".to_string())?;

        let binary = match &self.binary {
            Some(path) => path.clone(),
            None => Self::find_i2pd_binary().ok_or_else(|| {
                "i2pd not found in PATH. Please install i2pd or provide binary path".to_string()
            })?,
        };

        fs::create_dir_all(&data_dir).map_err(|e| e.to_string())?;

        Command::new(&binary)
            .arg("--conf")
            .arg(data_dir.join("i2pd.conf"))
            .arg("--datadir")
            .arg(&data_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", binary.display(), e))
    }
}

impl DaemonBridge for I2pdProcessBridge {
    fn set_data_dir(&self, path: &Path) {
        if let Ok(mut dir) = self.data_dir.lock() {
            *dir = Some(path.to_path_buf());
        }
    }

    fn start_daemon(&self) -> String {
        let mut process = match self.process.lock() {
            Ok(p) => p,
            Err(_) => return "process lock poisoned".to_string(),
        };

        if let Some(child) = process.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return START_OK.to_string();
            }
        }

        match self.spawn() {
            Ok(child) => {
                log::info!("Started i2pd (pid {})", child.id());
                *process = Some(child);
                START_OK.to_string()
            }
            Err(e) => e,
        }
    }

    fn stop_daemon(&self) {
        let Ok(mut process) = self.process.lock() else {
            return;
        };
        if let Some(mut child) = process.take() {
            if let Err(e) = child.kill() {
                log::warn!("Failed to kill i2pd: {}", e);
            }
            let _ = child.wait();
        }
    }

    fn get_sam_state(&self) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.sam_port));
        TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok()
    }

    fn get_web_console_addr(&self) -> String {
        format!("http://127.0.0.1:{}", self.web_console_port)
    }
}

impl Drop for I2pdProcessBridge {
    fn drop(&mut self) {
        self.stop_daemon();
    }
}
