//! Per-device liveness pump
//!
//! One background thread per attached device polls the backend for the
//! device's continued presence. Losing the device mid-operation is fatal:
//! in-flight URBs, claimed interfaces, and driver state cannot be
//! consistently unwound, so the process terminates instead of limping on
//! with silently corrupted state.

use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// Interval between liveness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

pub struct LivenessPump {
    stop: Arc<AtomicBool>,
    signal: Arc<(Mutex<()>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessPump {
    pub fn spawn(handle: Arc<DeviceHandle<Context>>, label: String) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let signal = Arc::new((Mutex::new(()), Condvar::new()));

        let thread_stop = stop.clone();
        let thread_signal = signal.clone();
        let thread = std::thread::Builder::new()
            .name(format!("liveness-{}", label))
            .spawn(move || {
                loop {
                    {
                        let (mutex, condvar) = &*thread_signal;
                        let guard = mutex.lock().unwrap();
                        let _ = condvar.wait_timeout(guard, PROBE_INTERVAL).unwrap();
                    }
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match handle.active_configuration() {
                        Ok(_) => {}
                        Err(rusb::Error::NoDevice) => {
                            error!("device {} disappeared, terminating", label);
                            std::process::exit(1);
                        }
                        Err(other) => {
                            debug!("liveness probe on {} reported {}", label, other);
                        }
                    }
                }
                debug!("liveness pump for {} stopped", label);
            })
            .expect("spawn liveness pump");

        Self {
            stop,
            signal,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Stop the pump; used by an orderly detach.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.signal.1.notify_all();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LivenessPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.signal.1.notify_all();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}
