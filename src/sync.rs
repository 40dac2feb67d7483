use core::ops::{Deref, DerefMut};

use spin::mutex::{SpinMutex, SpinMutexGuard};

use crate::block::BlockDevice;
use crate::volume::FatVolume;

/// A volume that can be shared between threads. The engine itself is not
/// reentrant, so every operation goes through one coarse lock.
#[derive(Debug)]
pub struct SharedVolume<D> {
    mutex: SpinMutex<FatVolume<D>>,
}

impl<D: BlockDevice> SharedVolume<D> {
    pub const fn new(volume: FatVolume<D>) -> Self {
        Self {
            mutex: SpinMutex::new(volume),
        }
    }

    pub fn lock(&self) -> SharedVolumeGuard<'_, D> {
        SharedVolumeGuard {
            guard: self.mutex.lock(),
        }
    }

    /// Runs `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut FatVolume<D>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn into_inner(self) -> FatVolume<D> {
        self.mutex.into_inner()
    }
}

/// Wrapper around `spin::mutex::SpinMutexGuard`, used with `SharedVolume`.
pub struct SharedVolumeGuard<'a, D> {
    guard: SpinMutexGuard<'a, FatVolume<D>>,
}

impl<'a, D> Deref for SharedVolumeGuard<'a, D> {
    type Target = FatVolume<D>;

    #[allow(clippy::explicit_deref_methods)]
    fn deref(&self) -> &FatVolume<D> {
        self.guard.deref()
    }
}

impl<'a, D> DerefMut for SharedVolumeGuard<'a, D> {
    #[allow(clippy::explicit_deref_methods)]
    fn deref_mut(&mut self) -> &mut FatVolume<D> {
        self.guard.deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    use crate::testing::{ImageBuilder, FAT16_SMALL};

    #[test]
    fn concurrent_writers_each_get_their_own_file() {
        let volume = FatVolume::initialize(ImageBuilder::new(FAT16_SMALL).build()).unwrap();
        let shared = Arc::new(SharedVolume::new(volume));

        let workers: Vec<_> = (0..4u8)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    shared.with(|volume| {
                        let name = format!("/t{i}.bin");
                        let file = volume.create(&name).unwrap();
                        volume.write(file, &[i; 700]).unwrap();
                        volume.update_entry(file).unwrap();
                        volume.close(file);
                    });
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut volume = Arc::try_unwrap(shared).ok().unwrap().into_inner();
        for i in 0..4u8 {
            let file = volume.open(&format!("t{i}.bin")).unwrap();
            let mut contents = vec![0; 1000];
            assert_eq!(volume.read(file, &mut contents), Ok(700));
            assert!(contents[..700].iter().all(|&b| b == i));
            volume.close(file);
        }
        assert_eq!(volume.open_handles(), 0);
    }
}
