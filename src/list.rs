use std::{marker::PhantomData, ptr::NonNull};

use crate::block::{BLOCK_HEADER_SIZE, Block, Link};

/// The block ledger: an intrusive singly linked list of [`Block`] headers
/// living inside the heap itself.
///
/// ```text
///  head                                                      tail
///   |                                                          |
/// +-v------+---------+   +--------+-------+   +--------+-------v-+
/// | Header | Content |-->| Header | Free  |-->| Header | Content |--> None
/// +--------+---------+   +--------+-------+   +--------+---------+
/// ```
///
/// Nodes are always kept in address order: the only way to add a node is
/// appending past the current end of the heap or inserting the remainder of
/// a split right after the block it came from. The head is the heap base, so
/// it doubles as the head of the free list.
pub(crate) struct BlockList {
    head: Link,
    tail: Link,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Link,
    marker: PhantomData<&'a BlockList>,
}

impl BlockList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Link {
        self.tail
    }

    /// Forgets every node. The headers themselves are left in memory.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Writes a new header at `addr` and appends it to the list.
    ///
    /// Because we are the allocator this can't allocate a node itself, it has
    /// to be told where the header goes.
    ///
    /// **SAFETY**: `addr` must be valid for a header and lie past every other
    /// node of the list.
    pub unsafe fn push_back(
        &mut self,
        addr: NonNull<u8>,
        size: usize,
        is_free: bool,
    ) -> NonNull<Block> {
        unsafe {
            let node = Block::write(addr, size, is_free, None);

            if let Some(mut tail) = self.tail {
                tail.as_mut().next = Some(node);
            } else {
                self.head = Some(node);
            }

            self.tail = Some(node);
            self.len += 1;

            node
        }
    }

    /// Writes a new header at `addr` and splices it right after `prev`.
    ///
    /// **SAFETY**: `prev` must be a node of this list and `addr` must lie
    /// between the end of `prev`'s header and its successor.
    pub unsafe fn insert_after(
        &mut self,
        mut prev: NonNull<Block>,
        addr: NonNull<u8>,
        size: usize,
        is_free: bool,
    ) -> NonNull<Block> {
        unsafe {
            let node = Block::write(addr, size, is_free, prev.as_ref().next);
            prev.as_mut().next = Some(node);

            if self.tail == Some(prev) {
                self.tail = Some(node);
            }

            self.len += 1;

            node
        }
    }

    /// Merges the successor of `node` into it: `node` grows by the
    /// successor's header and content, and the successor leaves the list.
    ///
    /// **SAFETY**: `node` must be a node of this list with a successor that
    /// starts right where `node` ends.
    pub unsafe fn absorb_next(&mut self, mut node: NonNull<Block>) {
        unsafe {
            let Some(next) = node.as_ref().next else {
                return;
            };

            node.as_mut().size += BLOCK_HEADER_SIZE + next.as_ref().size;
            node.as_mut().next = next.as_ref().next;

            if self.tail == Some(next) {
                self.tail = Some(node);
            }
        }

        self.len -= 1;
    }

    /// Returns the node whose header lives exactly at `header`, if any.
    /// Only addresses are compared, so `header` may point anywhere.
    pub fn find(&self, header: *const Block) -> Link {
        self.iter().find(|node| node.as_ptr().cast_const() == header)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
        }

        Some(node)
    }
}

impl<'a> IntoIterator for &'a BlockList {
    type Item = NonNull<Block>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
