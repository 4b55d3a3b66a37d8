//! Code buffer with near and far cursors.
//!
//! One fixed-capacity region, two monotonic write positions: *near* for the
//! hot straight-line code, *far* for cold trampolines, fixups, and literal
//! constants. Branches across the two are recorded as forward references
//! and resolved by `link` at the end of a compilation. The buffer never
//! reallocates, so pointers into it stay valid for its lifetime; making the
//! pages executable is the embedder's job.

use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodeBufferError {
    #[error("code buffer full (capacity {capacity} bytes)")]
    Full { capacity: usize },
}

/// A position that may not be bound yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Clone, Copy, Debug)]
struct Fixup {
    /// Position of the rel32 field to patch.
    at: usize,
    label: Label,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cursor {
    Near,
    Far,
}

pub struct CodeBuffer {
    bytes: Box<[u8]>,
    near: usize,
    far: usize,
    far_start: usize,
    cursor: Cursor,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    consts: FxHashMap<(u64, u64), usize>,
    exhausted: bool,
}

impl CodeBuffer {
    /// The far region takes the top quarter of the buffer.
    pub fn new(capacity: usize) -> Self {
        let far_start = capacity - capacity / 4;
        Self {
            bytes: vec![0xCC; capacity].into_boxed_slice(),
            near: 0,
            far: far_start,
            far_start,
            cursor: Cursor::Near,
            labels: Vec::new(),
            fixups: Vec::new(),
            consts: FxHashMap::default(),
            exhausted: false,
        }
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Current write position of the active cursor.
    pub fn pos(&self) -> usize {
        match self.cursor {
            Cursor::Near => self.near,
            Cursor::Far => self.far,
        }
    }

    /// Bytes left before the two cursors collide.
    pub fn space_remaining(&self) -> usize {
        (self.far_start - self.near) + (self.bytes.len() - self.far)
    }

    /// Whether any emission overran the region. Checked once per block.
    pub fn take_error(&mut self) -> Result<(), CodeBufferError> {
        if std::mem::take(&mut self.exhausted) {
            Err(CodeBufferError::Full {
                capacity: self.bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    pub fn switch_to_far(&mut self) {
        self.cursor = Cursor::Far;
    }

    pub fn switch_to_near(&mut self) {
        self.cursor = Cursor::Near;
    }

    pub fn push(&mut self, byte: u8) {
        match self.cursor {
            Cursor::Near => {
                if self.near >= self.far_start {
                    self.exhausted = true;
                    return;
                }
                self.bytes[self.near] = byte;
                self.near += 1;
            }
            Cursor::Far => {
                if self.far >= self.bytes.len() {
                    self.exhausted = true;
                    return;
                }
                self.bytes[self.far] = byte;
                self.far += 1;
            }
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position of the active cursor.
    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.pos());
    }

    /// Reserve a rel32 field at the current position, patched at link time
    /// relative to the byte after the field.
    pub fn emit_rel32(&mut self, label: Label) {
        let at = self.pos();
        self.extend(&[0, 0, 0, 0]);
        self.fixups.push(Fixup { at, label });
    }

    /// A 16-byte literal in the far region, deduplicated. Returns its
    /// buffer offset for rip-relative addressing.
    pub fn const128(&mut self, lo: u64, hi: u64) -> usize {
        if let Some(&off) = self.consts.get(&(lo, hi)) {
            return off;
        }
        let saved = self.cursor;
        self.cursor = Cursor::Far;
        while self.far % 16 != 0 {
            self.push(0xCC);
        }
        let off = self.far;
        self.extend(&lo.to_le_bytes());
        self.extend(&hi.to_le_bytes());
        self.cursor = saved;
        self.consts.insert((lo, hi), off);
        off
    }

    /// Resolve every pending reference. Called once per compilation.
    /// Constants are kept: they dedupe across the buffer's whole life.
    pub fn link(&mut self) {
        let fixups = std::mem::take(&mut self.fixups);
        if self.exhausted {
            // Positions recorded after the overrun are meaningless.
            self.labels.clear();
            return;
        }
        for fixup in fixups {
            let target = self.labels[fixup.label.0].expect("unbound label at link time");
            let rel = target as i64 - (fixup.at as i64 + 4);
            let rel = i32::try_from(rel).expect("rel32 overflow");
            self.bytes[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        self.labels.clear();
    }

    pub fn bytes_at(&self, start: usize, len: usize) -> &[u8] {
        &self.bytes[start..start + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursors_are_independent_and_monotonic() {
        let mut buf = CodeBuffer::new(4096);
        buf.push(0x90);
        assert_eq!(buf.pos(), 1);
        buf.switch_to_far();
        let far_start = buf.pos();
        assert_eq!(far_start, 3072);
        buf.push(0x90);
        assert_eq!(buf.pos(), far_start + 1);
        buf.switch_to_near();
        assert_eq!(buf.pos(), 1);
    }

    #[test]
    fn test_link_patches_rel32() {
        let mut buf = CodeBuffer::new(4096);
        let label = buf.new_label();
        // jmp rel32 to a label bound 11 bytes in.
        buf.push(0xE9);
        buf.emit_rel32(label);
        buf.extend(&[0x90; 6]);
        buf.bind_label(label);
        buf.link();
        // Field at offset 1, next instruction at 5, target at 11: rel = 6.
        assert_eq!(buf.bytes_at(1, 4), &6i32.to_le_bytes());
    }

    #[test]
    fn test_cross_cursor_link() {
        let mut buf = CodeBuffer::new(4096);
        let cold = buf.new_label();
        buf.push(0xE9);
        buf.emit_rel32(cold);
        buf.switch_to_far();
        buf.bind_label(cold);
        buf.push(0xC3);
        buf.switch_to_near();
        buf.link();
        let rel = i32::from_le_bytes(buf.bytes_at(1, 4).try_into().unwrap());
        assert_eq!(rel, 3072 - 5);
    }

    #[test]
    fn test_const128_dedup_and_alignment() {
        let mut buf = CodeBuffer::new(4096);
        buf.switch_to_far();
        buf.push(0x90);
        buf.switch_to_near();
        let a = buf.const128(1, 2);
        let b = buf.const128(1, 2);
        let c = buf.const128(3, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a % 16, 0);
        assert_eq!(c % 16, 0);
        // The emitting cursor is unchanged.
        assert_eq!(buf.pos(), 0);
    }

    #[test]
    fn test_exhaustion_is_sticky_until_taken() {
        let mut buf = CodeBuffer::new(64);
        for _ in 0..100 {
            buf.push(0x90);
        }
        assert!(buf.take_error().is_err());
        assert!(buf.take_error().is_ok());
    }
}
