//! Block-based stack memory for one context.
//!
//! The stack grows downward within a block. When a call does not fit below
//! the current stack pointer, the next block is used; block `n` holds
//! `base << n` words. Blocks are only ever appended, so a [`StackPtr`] stays
//! valid for as long as the allocator keeps its blocks.

use tracing::debug;

use super::error::RuntimeFault;

/// Position of a word: block index and word offset within the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StackPtr {
    pub block: u32,
    pub offset: u32,
}

impl StackPtr {
    /// The slot `delta` words away, if it stays within the block's index range.
    pub fn offset_by(self, delta: i64) -> Option<StackPtr> {
        let offset = u32::try_from(self.offset as i64 + delta).ok()?;
        Some(StackPtr {
            block: self.block,
            offset,
        })
    }
}

#[derive(Debug, Default)]
pub struct StackAllocator {
    blocks: Vec<Box<[u32]>>,
    base_size: u32,
    max_words: u32,
    current: usize,
}

impl StackAllocator {
    /// `max_words` is the ceiling on total stack memory; 0 means unlimited.
    pub fn new(max_words: u32) -> Self {
        Self {
            max_words,
            ..Self::default()
        }
    }

    /// Discards every block and allocates a fresh first block of `size`
    /// words. Only valid while no frame pointers are outstanding.
    pub fn reset(&mut self, size: u32) {
        self.blocks.clear();
        self.blocks.push(vec![0; size as usize].into_boxed_slice());
        self.base_size = size;
        self.current = 0;
        debug!(words = size, "stack reset");
    }

    /// Drops every block after the first, keeping its memory for reuse.
    pub fn keep_first_block(&mut self) {
        self.blocks.truncate(1);
        self.current = 0;
    }

    /// Frees all blocks.
    pub fn release(&mut self) {
        self.blocks.clear();
        self.base_size = 0;
        self.current = 0;
    }

    pub fn is_allocated(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Size of the first block.
    pub fn block_size(&self) -> u32 {
        self.base_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_len(&self, block: usize) -> u32 {
        self.blocks.get(block).map_or(0, |b| b.len() as u32)
    }

    pub fn allocated_words(&self) -> u64 {
        self.blocks.iter().map(|b| b.len() as u64).sum()
    }

    pub fn current_block(&self) -> usize {
        self.current
    }

    pub fn set_current_block(&mut self, block: usize) {
        self.current = block;
    }

    /// One past the last word of a block.
    pub fn top(&self, block: usize) -> StackPtr {
        StackPtr {
            block: block as u32,
            offset: self.block_len(block),
        }
    }

    /// Finds room for a call needing `needed` words below its arguments.
    ///
    /// If the words below `sp` are too few, moves to the next block (allocating
    /// it if needed) and returns the new stack pointer with `arg_words` words
    /// reserved at its top. The caller copies the arguments across.
    pub fn grow(&mut self, sp: StackPtr, needed: u32, arg_words: u32) -> Result<StackPtr, RuntimeFault> {
        let mut index = sp.block as usize;
        let mut new_sp = sp;
        while new_sp.offset < needed {
            index += 1;
            if index >= self.blocks.len() {
                if self.base_size == 0 {
                    return Err(RuntimeFault::StackOverflow);
                }
                let size = self
                    .base_size
                    .checked_shl(index as u32)
                    .filter(|&s| s >> index == self.base_size)
                    .ok_or(RuntimeFault::StackOverflow)?;
                if self.max_words != 0 {
                    let total = (self.base_size as u64) * ((1u64 << (index + 1)) - 1);
                    if total > self.max_words as u64 {
                        debug!(block = index, total, max = self.max_words, "stack ceiling reached");
                        return Err(RuntimeFault::StackOverflow);
                    }
                }
                debug!(block = index, words = size, "stack block allocated");
                self.blocks.push(vec![0; size as usize].into_boxed_slice());
            }
            new_sp = StackPtr {
                block: index as u32,
                offset: self.block_len(index).saturating_sub(arg_words),
            };
        }
        self.current = index;
        Ok(new_sp)
    }

    pub fn read(&self, ptr: StackPtr) -> Option<u32> {
        self.blocks
            .get(ptr.block as usize)?
            .get(ptr.offset as usize)
            .copied()
    }

    pub fn slot_mut(&mut self, ptr: StackPtr) -> Option<&mut u32> {
        self.blocks
            .get_mut(ptr.block as usize)?
            .get_mut(ptr.offset as usize)
    }

    pub fn write(&mut self, ptr: StackPtr, value: u32) -> Option<()> {
        *self.slot_mut(ptr)? = value;
        Some(())
    }

    /// Two words, low word first.
    pub fn read_u64(&self, ptr: StackPtr) -> Option<u64> {
        let lo = self.read(ptr)? as u64;
        let hi = self.read(ptr.offset_by(1)?)? as u64;
        Some(lo | (hi << 32))
    }

    pub fn write_u64(&mut self, ptr: StackPtr, value: u64) -> Option<()> {
        let hi = ptr.offset_by(1)?;
        self.read(hi)?;
        self.write(ptr, value as u32)?;
        self.write(hi, (value >> 32) as u32)
    }

    /// Zeroes `count` words starting at `ptr`.
    pub fn zero(&mut self, ptr: StackPtr, count: u32) -> Option<()> {
        let block = self.blocks.get_mut(ptr.block as usize)?;
        let start = ptr.offset as usize;
        let end = start.checked_add(count as usize)?;
        block.get_mut(start..end)?.fill(0);
        Some(())
    }

    /// Copies `count` words between possibly different blocks.
    pub fn copy_words(&mut self, from: StackPtr, to: StackPtr, count: u32) -> Option<()> {
        for i in 0..count as i64 {
            let value = self.read(from.offset_by(i)?)?;
            self.write(to.offset_by(i)?, value)?;
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_top() {
        let mut stack = StackAllocator::new(0);
        stack.reset(64);
        assert_eq!(stack.block_size(), 64);
        assert_eq!(stack.top(0), StackPtr { block: 0, offset: 64 });
        stack.release();
        assert!(!stack.is_allocated());
    }

    #[test]
    fn test_keep_first_block() {
        let mut stack = StackAllocator::new(0);
        stack.reset(8);
        stack.grow(StackPtr { block: 0, offset: 1 }, 6, 0).unwrap();
        assert_eq!(stack.block_count(), 2);
        stack.keep_first_block();
        assert_eq!(stack.block_count(), 1);
        assert_eq!(stack.current_block(), 0);
    }

    #[test]
    fn test_grow_doubles_blocks() {
        let mut stack = StackAllocator::new(0);
        stack.reset(16);
        let sp = StackPtr { block: 0, offset: 4 };
        let new_sp = stack.grow(sp, 10, 2).unwrap();
        assert_eq!(new_sp, StackPtr { block: 1, offset: 30 });
        assert_eq!(stack.block_len(1), 32);
        assert_eq!(stack.current_block(), 1);

        // Fits without growing.
        let same = stack.grow(new_sp, 10, 2).unwrap();
        assert_eq!(same, new_sp);
    }

    #[test]
    fn test_grow_skips_blocks_that_are_too_small() {
        let mut stack = StackAllocator::new(0);
        stack.reset(8);
        let new_sp = stack.grow(StackPtr { block: 0, offset: 0 }, 40, 0).unwrap();
        assert_eq!(new_sp.block, 3);
        assert_eq!(stack.block_count(), 4);
    }

    #[test]
    fn test_ceiling_raises_stack_overflow() {
        let mut stack = StackAllocator::new(40);
        stack.reset(16);
        let sp = StackPtr { block: 0, offset: 2 };
        assert_eq!(stack.grow(sp, 10, 0), Err(RuntimeFault::StackOverflow));
        assert_eq!(stack.block_count(), 1);
    }

    #[test]
    fn test_existing_blocks_never_move() {
        let mut stack = StackAllocator::new(0);
        stack.reset(8);
        let ptr = StackPtr { block: 0, offset: 3 };
        stack.write(ptr, 77).unwrap();
        stack.grow(StackPtr { block: 0, offset: 1 }, 6, 0).unwrap();
        assert_eq!(stack.read(ptr), Some(77));
    }

    #[test]
    fn test_word_access() {
        let mut stack = StackAllocator::new(0);
        stack.reset(4);
        let ptr = StackPtr { block: 0, offset: 2 };
        stack.write_u64(ptr, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(stack.read(ptr), Some(0x5566_7788));
        assert_eq!(stack.read_u64(ptr), Some(0x1122_3344_5566_7788));
        assert!(stack.write_u64(StackPtr { block: 0, offset: 3 }, 1).is_none());
        assert!(stack.read(StackPtr { block: 1, offset: 0 }).is_none());

        stack.zero(StackPtr { block: 0, offset: 0 }, 4).unwrap();
        assert_eq!(stack.read_u64(ptr), Some(0));
    }

    #[test]
    fn test_copy_words_across_blocks() {
        let mut stack = StackAllocator::new(0);
        stack.reset(4);
        stack.write(StackPtr { block: 0, offset: 0 }, 5).unwrap();
        stack.write(StackPtr { block: 0, offset: 1 }, 6).unwrap();
        let new_sp = stack.grow(StackPtr { block: 0, offset: 0 }, 4, 2).unwrap();
        stack
            .copy_words(StackPtr { block: 0, offset: 0 }, new_sp, 2)
            .unwrap();
        assert_eq!(stack.read(new_sp), Some(5));
        assert_eq!(stack.read(new_sp.offset_by(1).unwrap()), Some(6));
    }
}
