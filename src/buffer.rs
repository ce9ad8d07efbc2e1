//! Fixed-capacity byte container with independent reader and writer cursors.
//!
//! Multi-byte integers are always encoded big-endian, regardless of host.

use bytes::{Buf, BufMut};

use crate::{BufferError, BufferPool, PooledMemory};

/// A pooled, cursor-addressed byte buffer.
///
/// `0 <= reader_index <= writer_index <= capacity` holds after every operation. A failed
/// read or write leaves both cursors untouched.
///
/// Every handle holds one reference to the backing region. [`retain`](Buffer::retain) hands out
/// another handle to the same region with its own cursors; [`release`](Buffer::release) gives this
/// handle's reference up, after which it fails every read or write with [`BufferError::Released`].
/// The region goes back to its pool when the last reference is released or dropped. While more
/// than one handle shares it, the region is read-only and writes fail with [`BufferError::Shared`].
pub struct Buffer {
    memory: Option<std::sync::Arc<PooledMemory>>,
    capacity: usize,
    reader_index: usize,
    writer_index: usize,
    marked_reader_index: usize,
    marked_writer_index: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Buffer::with_pool(BufferPool::shared(), capacity)
    }

    pub fn with_pool(pool: &std::sync::Arc<BufferPool>, capacity: usize) -> Self {
        Buffer::from_memory(pool.rent(capacity), 0)
    }

    fn from_memory(memory: PooledMemory, writer_index: usize) -> Self {
        Buffer {
            capacity: memory.len(),
            memory: Some(std::sync::Arc::new(memory)),
            reader_index: 0,
            writer_index,
            marked_reader_index: 0,
            marked_writer_index: 0,
        }
    }

    pub fn empty() -> Self {
        Buffer::new(0)
    }

    /// A buffer of exactly `src.len()` bytes holding a copy of `src`.
    pub fn copied(src: &[u8]) -> Self {
        Buffer::composite(&[src])
    }

    /// A buffer holding the concatenation of every part.
    pub fn composite(parts: &[&[u8]]) -> Self {
        let capacity = parts.iter().map(|part| part.len()).sum();
        let mut memory = BufferPool::shared().rent(capacity);
        let mut dst: &mut [u8] = &mut memory;
        for part in parts {
            dst.put_slice(part);
        }
        Buffer::from_memory(memory, capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn set_reader_index(&mut self, index: usize) -> Result<(), BufferError> {
        if index > self.writer_index {
            return Err(BufferError::InvalidIndex { index, lower: 0, upper: self.writer_index });
        }
        self.reader_index = index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, index: usize) -> Result<(), BufferError> {
        if index < self.reader_index || index > self.capacity {
            return Err(BufferError::InvalidIndex { index, lower: self.reader_index, upper: self.capacity });
        }
        self.writer_index = index;
        Ok(())
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity - self.writer_index
    }

    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable_bytes() > 0
    }

    /// Borrows the unread region without moving the reader index.
    pub fn readable(&self) -> Result<&[u8], BufferError> {
        let memory = self.memory()?;
        Ok(&memory[self.reader_index..self.writer_index])
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.writable(1)?.put_u8(value);
        self.writer_index += 1;
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), BufferError> {
        self.writable(2)?.put_i16(value);
        self.writer_index += 2;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BufferError> {
        self.writable(4)?.put_i32(value);
        self.writer_index += 4;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BufferError> {
        self.writable(8)?.put_i64(value);
        self.writer_index += 8;
        Ok(())
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), BufferError> {
        self.writable(src.len())?.copy_from_slice(src);
        self.writer_index += src.len();
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        let value = self.unread(1)?.get_u8();
        self.reader_index += 1;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> Result<i16, BufferError> {
        let value = self.unread(2)?.get_i16();
        self.reader_index += 2;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        let value = self.unread(4)?.get_i32();
        self.reader_index += 4;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> Result<i64, BufferError> {
        let value = self.unread(8)?.get_i64();
        self.reader_index += 8;
        Ok(value)
    }

    /// Fills `dst` entirely from the unread region.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        let len = dst.len();
        dst.copy_from_slice(self.unread(len)?);
        self.reader_index += len;
        Ok(())
    }

    pub fn mark_reader_index(&mut self) {
        self.marked_reader_index = self.reader_index;
    }

    pub fn reset_reader_index(&mut self) -> Result<(), BufferError> {
        self.set_reader_index(self.marked_reader_index)
    }

    pub fn mark_writer_index(&mut self) {
        self.marked_writer_index = self.writer_index;
    }

    pub fn reset_writer_index(&mut self) -> Result<(), BufferError> {
        self.set_writer_index(self.marked_writer_index)
    }

    /// Copies `length` bytes starting at absolute `index` into a new, independently owned buffer.
    pub fn slice(&self, index: usize, length: usize) -> Result<Buffer, BufferError> {
        let in_range = index.checked_add(length).is_some_and(|end| end <= self.writer_index);
        if length == 0 || !in_range {
            return Err(BufferError::InvalidSlice { index, length, writer_index: self.writer_index });
        }

        let memory = self.memory()?;
        let mut slice = Buffer::with_pool(&self.pool(), length);
        slice.write_bytes(&memory[index..index + length])?;
        Ok(slice)
    }

    /// Copies the written content and both cursors into a new buffer of equal capacity.
    pub fn duplicate(&self) -> Result<Buffer, BufferError> {
        let memory = self.memory()?;
        let mut duplicate = Buffer::with_pool(&self.pool(), self.capacity);
        duplicate.write_bytes(&memory[..self.writer_index])?;
        duplicate.reader_index = self.reader_index;
        duplicate.marked_reader_index = self.marked_reader_index;
        duplicate.marked_writer_index = self.marked_writer_index;
        Ok(duplicate)
    }

    pub fn clear(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
        self.marked_reader_index = 0;
        self.marked_writer_index = 0;
    }

    /// Copies the whole backing region, up to capacity, regardless of cursors.
    pub fn to_array(&self) -> Result<Vec<u8>, BufferError> {
        Ok(self.memory()?.to_vec())
    }

    /// Number of live handles sharing this buffer's region; zero once this handle is released.
    pub fn ref_count(&self) -> usize {
        self.memory.as_ref().map_or(0, std::sync::Arc::strong_count)
    }

    pub fn is_released(&self) -> bool {
        self.memory.is_none()
    }

    /// Takes another reference to the region. The returned handle starts with this one's cursors
    /// and marks, and keeps the region alive until it is released or dropped itself.
    pub fn retain(&self) -> Result<Buffer, BufferError> {
        let memory = self.memory.as_ref().ok_or(BufferError::Released)?;
        Ok(Buffer {
            memory: Some(memory.clone()),
            capacity: self.capacity,
            reader_index: self.reader_index,
            writer_index: self.writer_index,
            marked_reader_index: self.marked_reader_index,
            marked_writer_index: self.marked_writer_index,
        })
    }

    /// Gives up this handle's reference. Returns `true` when it was the last one and the region
    /// went back to the pool.
    pub fn release(&mut self) -> Result<bool, BufferError> {
        let memory = self.memory.take().ok_or(BufferError::ReleasedTooOften)?;
        Ok(std::sync::Arc::into_inner(memory).is_some())
    }

    fn memory(&self) -> Result<&PooledMemory, BufferError> {
        self.memory.as_deref().ok_or(BufferError::Released)
    }

    fn pool(&self) -> std::sync::Arc<BufferPool> {
        self.memory.as_deref().map_or_else(|| BufferPool::shared().clone(), PooledMemory::pool)
    }

    fn writable(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        let available = self.writable_bytes();
        let writer_index = self.writer_index;
        let memory = self.memory.as_mut().ok_or(BufferError::Released)?;
        if len > available {
            return Err(BufferError::OutOfBounds { requested: len, available });
        }
        let memory = std::sync::Arc::get_mut(memory).ok_or(BufferError::Shared)?;
        Ok(&mut memory[writer_index..writer_index + len])
    }

    fn unread(&self, len: usize) -> Result<&[u8], BufferError> {
        let memory = self.memory()?;
        let available = self.readable_bytes();
        if len > available {
            return Err(BufferError::OutOfBounds { requested: len, available });
        }
        Ok(&memory[self.reader_index..self.reader_index + len])
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity)
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("ref_count", &self.ref_count())
            .field("released", &self.is_released())
            .finish()
    }
}
