use crate::SpinLock;

/// Free-id stack laid out over raw region bytes:
///
/// ```text
/// { lock: u32, capacity: u32, count: u32, _pad: u32 } ids[capacity]: i32
/// ```
///
/// Ids are pushed in descending order at init so the first pop yields id 0.
/// All mutation happens under the embedded lock, so any process mapping the
/// region may push and pop.
pub struct IdStack {
    base: *mut u8,
}

unsafe impl Send for IdStack {}

const HEADER: usize = 16;

#[repr(C)]
struct Header {
    lock: SpinLock,
    capacity: u32,
    count: u32,
    _pad: u32,
}

impl IdStack {
    /// Bytes a stack of `capacity` ids occupies in the region.
    pub fn bytes_for(capacity: usize) -> usize {
        HEADER + capacity * std::mem::size_of::<i32>()
    }

    /// Wrap an already-initialized stack at `base`.
    ///
    /// # Safety
    /// `base` must be 4-aligned, point at a stack previously laid out by
    /// [`IdStack::init`], and stay mapped for the lifetime of the value.
    pub unsafe fn at(base: *mut u8) -> IdStack {
        IdStack { base }
    }

    /// Lay out and fill a fresh stack at `base` with ids `0..capacity`.
    ///
    /// # Safety
    /// `base` must be 4-aligned with [`Self::bytes_for`] writable bytes.
    pub unsafe fn init(base: *mut u8, capacity: usize) -> IdStack {
        let header = &mut *(base as *mut Header);
        header.capacity = capacity as u32;
        header.count = capacity as u32;

        let ids = base.add(HEADER) as *mut i32;
        for i in 0..capacity {
            // Descending, so pops come out ascending from zero.
            *ids.add(i) = (capacity - 1 - i) as i32;
        }

        IdStack { base }
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    fn header_ptr(&self) -> *mut Header {
        self.base as *mut Header
    }

    fn ids(&self) -> *mut i32 {
        unsafe { self.base.add(HEADER) as *mut i32 }
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Pop a free id, or `None` when every id is in use.
    pub fn pop(&self) -> Option<i32> {
        let header = self.header();
        let _guard = header.lock.lock();

        let count = unsafe { std::ptr::read_volatile(&header.count) };
        if count == 0 {
            return None;
        }
        let id = unsafe { std::ptr::read_volatile(self.ids().add(count as usize - 1)) };
        unsafe {
            std::ptr::write_volatile(
                std::ptr::addr_of_mut!((*self.header_ptr()).count),
                count - 1,
            );
        }
        Some(id)
    }

    /// Return an id to the free pool.
    pub fn push(&self, id: i32) {
        let header = self.header();
        let _guard = header.lock.lock();

        let count = unsafe { std::ptr::read_volatile(&header.count) };
        debug_assert!((count as usize) < self.capacity());
        unsafe {
            std::ptr::write_volatile(self.ids().add(count as usize), id);
            std::ptr::write_volatile(
                std::ptr::addr_of_mut!((*self.header_ptr()).count),
                count + 1,
            );
        }
    }

    pub fn free_count(&self) -> usize {
        let header = self.header();
        let _guard = header.lock.lock();
        unsafe { std::ptr::read_volatile(&header.count) as usize }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pops_ascend_from_zero_and_exhaust() {
        let mut backing = vec![0u8; IdStack::bytes_for(4)];
        let stack = unsafe { IdStack::init(backing.as_mut_ptr(), 4) };

        assert_eq!(stack.pop(), Some(0));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), None);

        stack.push(2);
        assert_eq!(stack.pop(), Some(2));
    }

    #[test]
    fn survives_rewrap() {
        let mut backing = vec![0u8; IdStack::bytes_for(8)];
        {
            let stack = unsafe { IdStack::init(backing.as_mut_ptr(), 8) };
            stack.pop();
            stack.pop();
        }
        // A second attacher wraps the same bytes and sees the state.
        let stack = unsafe { IdStack::at(backing.as_mut_ptr()) };
        assert_eq!(stack.free_count(), 6);
        assert_eq!(stack.pop(), Some(2));
    }
}
