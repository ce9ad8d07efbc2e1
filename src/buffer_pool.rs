pub struct BufferPool {
    classes: Vec<parking_lot::Mutex<Vec<bytes::BytesMut>>>,
    rented: std::sync::atomic::AtomicUsize,
    returned: std::sync::atomic::AtomicUsize,
    allocated: std::sync::atomic::AtomicUsize,
}

/// Idle regions kept per size class; anything beyond is freed on return.
const RETAINED_PER_CLASS: usize = 64;

const MIN_CLASS_SHIFT: u32 = 4;
const MAX_CLASS_SHIFT: u32 = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub rented: usize,
    pub returned: usize,
    pub allocated: usize,
}

impl BufferPool {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(BufferPool {
            classes: (MIN_CLASS_SHIFT..=MAX_CLASS_SHIFT).map(|_| Default::default()).collect(),
            rented: Default::default(),
            returned: Default::default(),
            allocated: Default::default(),
        })
    }

    /// The process-wide pool used by buffers that do not name one explicitly.
    pub fn shared() -> &'static std::sync::Arc<Self> {
        static SHARED: std::sync::OnceLock<std::sync::Arc<BufferPool>> = std::sync::OnceLock::new();
        SHARED.get_or_init(BufferPool::new)
    }

    /// Rents a zero-filled region of exactly `len` bytes. The region goes back to the pool when the guard drops.
    pub fn rent(self: &std::sync::Arc<Self>, len: usize) -> PooledMemory {
        self.rented.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let memory = match class_of(len) {
            Some(class) => {
                let recycled = self.classes[class].lock().pop();
                match recycled {
                    Some(mut memory) => {
                        memory[..len].fill(0);
                        memory
                    },
                    None => self.allocate(1 << (class as u32 + MIN_CLASS_SHIFT)),
                }
            },
            None => self.allocate(len),
        };

        PooledMemory {
            memory,
            len,
            pool: self.clone(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(std::sync::atomic::Ordering::Relaxed),
            returned: self.returned.load(std::sync::atomic::Ordering::Relaxed),
            allocated: self.allocated.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    fn allocate(&self, size: usize) -> bytes::BytesMut {
        self.allocated.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut memory = bytes::BytesMut::with_capacity(size);
        memory.resize(size, 0);
        memory
    }

    fn put_back(&self, memory: bytes::BytesMut) {
        self.returned.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // Only regions that came from a size class are recycled; oversized ones are simply freed.
        if let Some(class) = class_of(memory.len()).filter(|&class| memory.len() == 1 << (class as u32 + MIN_CLASS_SHIFT)) {
            let mut idle = self.classes[class].lock();
            if idle.len() < RETAINED_PER_CLASS {
                idle.push(memory);
            }
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn class_of(len: usize) -> Option<usize> {
    let size = len.max(1).checked_next_power_of_two()?;
    let shift = size.trailing_zeros().max(MIN_CLASS_SHIFT);
    if shift > MAX_CLASS_SHIFT {
        None
    }
    else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

/// A rented region. Derefs to exactly the requested length.
pub struct PooledMemory {
    memory: bytes::BytesMut,
    len: usize,
    pool: std::sync::Arc<BufferPool>,
}

impl PooledMemory {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn pool(&self) -> std::sync::Arc<BufferPool> {
        self.pool.clone()
    }
}

impl std::ops::Deref for PooledMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.memory[..self.len]
    }
}

impl std::ops::DerefMut for PooledMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.memory[..self.len]
    }
}

impl Drop for PooledMemory {
    fn drop(&mut self) {
        let memory = std::mem::take(&mut self.memory);
        self.pool.put_back(memory);
    }
}

impl std::fmt::Debug for PooledMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledMemory")
            .field("len", &self.len)
            .field("region", &self.memory.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_round_up_to_powers_of_two() {
        assert_eq!(class_of(0), Some(0));
        assert_eq!(class_of(16), Some(0));
        assert_eq!(class_of(17), Some(1));
        assert_eq!(class_of(128), Some(3));
        assert_eq!(class_of(1 << 20), Some(16));
        assert_eq!(class_of((1 << 20) + 1), None);
    }

    #[test]
    fn returned_regions_are_reused_and_zeroed() {
        let pool = BufferPool::new();

        let mut first = pool.rent(100);
        assert_eq!(first.len(), 100);
        first.fill(0xAB);
        drop(first);

        let second = pool.rent(120);
        assert!(second.iter().all(|&b| b == 0));

        let stats = pool.stats();
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.allocated, 1);
    }

    #[test]
    fn oversized_regions_are_not_retained() {
        let pool = BufferPool::new();
        drop(pool.rent((1 << 20) + 1));
        drop(pool.rent((1 << 20) + 1));
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.stats().returned, 2);
    }

    #[test]
    fn regions_can_be_returned_from_another_thread() {
        let pool = BufferPool::new();
        let memory = pool.rent(64);
        std::thread::spawn(move || drop(memory)).join().unwrap();
        assert_eq!(pool.stats().returned, 1);
    }
}
