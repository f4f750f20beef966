use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Compute devices the engine can be pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cuda0,
    Cuda1,
}

/// Fixed rotation order
pub const ROTATION: [Device; 2] = [Device::Cuda0, Device::Cuda1];

impl Device {
    /// Value passed to the engine's `--device` flag
    pub fn as_arg(&self) -> &'static str {
        match self {
            Device::Cuda0 => "cuda:0",
            Device::Cuda1 => "cuda:1",
        }
    }

    /// One-based number shown to clients
    pub fn server_number(&self) -> u8 {
        match self {
            Device::Cuda0 => 1,
            Device::Cuda1 => 2,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Device picked for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAssignment {
    pub device: Device,
    /// Whether the engine should actually receive `--device`
    pub pinned: bool,
}

impl DeviceAssignment {
    pub fn server_number(&self) -> u8 {
        self.device.server_number()
    }

    /// The device flag value, only under the multi-device policy
    pub fn device_flag(&self) -> Option<Device> {
        self.pinned.then_some(self.device)
    }
}

/// Round-robin device scheduler shared by every job flow
///
/// The counter advances exactly once per accepted job, whatever the job's
/// outcome. There is no busy tracking: concurrency is bounded upstream.
#[derive(Debug)]
pub struct DeviceScheduler {
    next: AtomicU64,
    multi_device: bool,
}

impl DeviceScheduler {
    /// Create a scheduler; `multi_device` decides whether assignments are
    /// passed to the engine
    pub fn new(multi_device: bool) -> Self {
        Self {
            next: AtomicU64::new(0),
            multi_device,
        }
    }

    /// Get the next device using round-robin scheduling
    pub fn next_device(&self) -> Device {
        let index = self.next.fetch_add(1, Ordering::Relaxed) as usize % ROTATION.len();
        ROTATION[index]
    }

    /// Assign a device to a newly accepted job
    pub fn assign(&self) -> DeviceAssignment {
        let device = self.next_device();
        debug!(
            "Assigned {} (server {}, pinned: {})",
            device,
            device.server_number(),
            self.multi_device
        );
        DeviceAssignment {
            device,
            pinned: self.multi_device,
        }
    }

    pub fn multi_device(&self) -> bool {
        self.multi_device
    }

    /// Number of assignments handed out so far
    pub fn assigned_count(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for DeviceScheduler {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_strict_rotation() {
        let scheduler = DeviceScheduler::new(true);
        let numbers: Vec<u8> = (0..7).map(|_| scheduler.assign().server_number()).collect();
        let expected: Vec<u8> = (0..7).map(|i| (i % 2) as u8 + 1).collect();
        assert_eq!(numbers, expected);
        assert_eq!(scheduler.assigned_count(), 7);
    }

    #[test]
    fn test_flag_only_under_multi_device() {
        let single = DeviceScheduler::new(false);
        assert_eq!(single.assign().device_flag(), None);

        let multi = DeviceScheduler::new(true);
        assert_eq!(multi.assign().device_flag(), Some(Device::Cuda0));
        assert_eq!(multi.assign().device_flag(), Some(Device::Cuda1));
    }

    #[test]
    fn test_device_args() {
        assert_eq!(Device::Cuda0.as_arg(), "cuda:0");
        assert_eq!(Device::Cuda1.to_string(), "cuda:1");
    }

    #[tokio::test]
    async fn test_concurrent_assignments_stay_balanced() {
        let scheduler = Arc::new(DeviceScheduler::new(true));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                (0..25).map(|_| scheduler.assign().server_number()).collect::<Vec<_>>()
            }));
        }

        let mut ones = 0;
        let mut twos = 0;
        for handle in handles {
            for number in handle.await.unwrap() {
                if number == 1 {
                    ones += 1;
                } else {
                    twos += 1;
                }
            }
        }
        assert_eq!(ones, 100);
        assert_eq!(twos, 100);
    }
}
