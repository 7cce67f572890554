use super::schema::{FieldKind, MemoryConf, MessageSchema};
use crate::error::{NodeError, NodeResult};
use std::fmt;

/// Fixed-capacity payload storage for one message, request or response.
///
/// `size` counts the valid bytes and never exceeds the capacity chosen at
/// creation. Every write is checked: content that does not fit is refused
/// and the buffer is left untouched. Only the first `size` bytes are ever
/// read back.
pub struct MessageBuffer {
    schema: &'static MessageSchema,
    data: Box<[u8]>,
    size: usize,
}

impl MessageBuffer {
    /// Buffer sized from a schema, outside any manager (agent side, tests)
    pub fn standalone(schema: &'static MessageSchema, conf: &MemoryConf) -> Self {
        Self {
            schema,
            data: vec![0u8; schema.capacity(conf)].into_boxed_slice(),
            size: 0,
        }
    }

    pub fn schema(&self) -> &'static MessageSchema {
        self.schema
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Valid bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Valid bytes as text, if they are UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Replace the contents with `bytes`
    pub fn write_bytes(&mut self, bytes: &[u8]) -> NodeResult<()> {
        if bytes.len() > self.capacity() {
            return Err(NodeError::BufferOverflow {
                needed: bytes.len(),
                capacity: self.capacity(),
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len();
        Ok(())
    }

    /// Replace the contents with formatted text; returns the new size.
    ///
    /// The text is measured before anything is copied, so a refused write
    /// keeps the previous contents intact.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> NodeResult<usize> {
        let capacity = self.capacity();
        let mut measure = LengthCounter(0);
        // Only a failing Display impl can make counting fail
        if fmt::write(&mut measure, args).is_err() || measure.0 > capacity {
            return Err(NodeError::BufferOverflow {
                needed: measure.0,
                capacity,
            });
        }
        let mut writer = BoundedWriter {
            buf: &mut self.data[..],
            len: 0,
        };
        if fmt::write(&mut writer, args).is_err() {
            return Err(NodeError::BufferOverflow {
                needed: measure.0,
                capacity,
            });
        }
        self.size = writer.len;
        Ok(self.size)
    }

    /// Read a field from the valid bytes; a field past `size` is absent.
    pub fn read_i16(&self, name: &str) -> NodeResult<i16> {
        let range = self.field_range(name, FieldKind::I16)?;
        if range.end > self.size {
            return Err(NodeError::FieldOutOfBounds {
                type_name: self.schema.type_name,
                field: name.to_string(),
            });
        }
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.data[range]);
        Ok(i16::from_le_bytes(raw))
    }

    /// Write a field; grows `size` to cover it if needed.
    pub fn write_i16(&mut self, name: &str, value: i16) -> NodeResult<()> {
        let range = self.field_range(name, FieldKind::I16)?;
        let end = range.end;
        self.data[range].copy_from_slice(&value.to_le_bytes());
        self.size = self.size.max(end);
        Ok(())
    }

    fn field_range(&self, name: &str, kind: FieldKind) -> NodeResult<std::ops::Range<usize>> {
        let out_of_bounds = || NodeError::FieldOutOfBounds {
            type_name: self.schema.type_name,
            field: name.to_string(),
        };
        let field = self
            .schema
            .field(name)
            .filter(|field| field.kind == kind)
            .ok_or_else(out_of_bounds)?;
        let end = field.offset + kind.width();
        if end > self.capacity() {
            return Err(out_of_bounds());
        }
        Ok(field.offset..end)
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("type_name", &self.schema.type_name)
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Byte length of formatted output, without storing it
struct LengthCounter(usize);

impl fmt::Write for LengthCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// `fmt::Write` over a fixed slice that fails instead of truncating.
struct BoundedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

/// Handle to a buffer owned by a [`BufferManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Owns every payload buffer of the node.
///
/// Buffers are created during bring-up and released during teardown. After
/// [`seal`](BufferManager::seal) no further buffers can be created.
#[derive(Debug)]
pub struct BufferManager {
    conf: MemoryConf,
    slots: Vec<Option<MessageBuffer>>,
    sealed: bool,
}

impl BufferManager {
    pub fn new(conf: MemoryConf) -> Self {
        Self {
            conf,
            slots: Vec::new(),
            sealed: false,
        }
    }

    pub fn memory_conf(&self) -> &MemoryConf {
        &self.conf
    }

    /// Allocate a zero-sized buffer for `schema`
    pub fn create(&mut self, schema: &'static MessageSchema) -> NodeResult<BufferId> {
        if self.sealed {
            return Err(NodeError::config(format!(
                "cannot allocate {} after initialization",
                schema.type_name
            )));
        }
        let buffer = MessageBuffer::standalone(schema, &self.conf);
        tracing::debug!(
            type_name = schema.type_name,
            capacity = buffer.capacity(),
            "allocated message buffer"
        );
        self.slots.push(Some(buffer));
        Ok(BufferId(self.slots.len() - 1))
    }

    /// Release one buffer. Releasing twice, or with the wrong schema, fails.
    pub fn destroy(&mut self, id: BufferId, schema: &'static MessageSchema) -> NodeResult<()> {
        let slot = self
            .slots
            .get_mut(id.0)
            .ok_or(NodeError::UnknownBuffer(id.0))?;
        match slot {
            Some(buffer) if !std::ptr::eq(buffer.schema, schema) => Err(NodeError::config(format!(
                "buffer {} holds {}, not {}",
                id.0, buffer.schema.type_name, schema.type_name
            ))),
            Some(_) => {
                *slot = None;
                Ok(())
            }
            None => Err(NodeError::UnknownBuffer(id.0)),
        }
    }

    /// Release every remaining buffer; returns how many were released.
    pub fn destroy_all(&mut self) -> usize {
        let released = self.slots.iter().filter(|slot| slot.is_some()).count();
        self.slots.clear();
        self.sealed = false;
        released
    }

    /// Forbid further allocation
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Number of buffers currently allocated
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn get(&self, id: BufferId) -> NodeResult<&MessageBuffer> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(NodeError::UnknownBuffer(id.0))
    }

    pub fn get_mut(&mut self, id: BufferId) -> NodeResult<&mut MessageBuffer> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(NodeError::UnknownBuffer(id.0))
    }

    /// Borrow one buffer for reading and another for writing at once
    pub fn pair_mut(
        &mut self,
        read: BufferId,
        write: BufferId,
    ) -> NodeResult<(&MessageBuffer, &mut MessageBuffer)> {
        if read == write {
            return Err(NodeError::config("request and response share a buffer"));
        }
        let high = read.0.max(write.0);
        if high >= self.slots.len() {
            return Err(NodeError::UnknownBuffer(high));
        }
        let (left, right) = self.slots.split_at_mut(high);
        let (read_slot, write_slot) = if read.0 < write.0 {
            (&left[read.0], &mut right[0])
        } else {
            (&right[0], &mut left[write.0])
        };
        let read_buf = read_slot.as_ref().ok_or(NodeError::UnknownBuffer(read.0))?;
        let write_buf = write_slot
            .as_mut()
            .ok_or(NodeError::UnknownBuffer(write.0))?;
        Ok((read_buf, write_buf))
    }
}
