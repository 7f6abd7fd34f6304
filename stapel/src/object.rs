use std::fmt;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const MARK = 1 << 0;
        const PIN = 1 << 1;
        const FORWARD = 1 << 2;
        const LARGE = 1 << 3;
    }
}

// [0..<16 flags]
// [32..<64 additional data]
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header(u64);

/// Minimal view of a heap object at this layer's boundary. The collector
/// and the interpreter agree on nothing beyond the header.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct HeapObject {
    pub header: Header,
}

impl Header {
    pub const FLAGS_SHIFT: u64 = 0;
    pub const FLAGS_MASK: u64 = 0xFFFF << Self::FLAGS_SHIFT;

    pub const DATA_SHIFT: u64 = 32;
    pub const DATA_MASK: u64 = 0xFFFF_FFFFu64 << Self::DATA_SHIFT;

    #[inline]
    #[must_use]
    pub fn encode(flags: HeaderFlags, data: u32) -> Header {
        let inner = ((flags.bits() as u64) << Self::FLAGS_SHIFT)
            | ((data as u64) << Self::DATA_SHIFT);
        Header(inner)
    }

    #[inline]
    #[must_use]
    pub fn zeroed() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(
            ((self.0 & Self::FLAGS_MASK) >> Self::FLAGS_SHIFT) as u8,
        )
    }

    #[inline]
    #[must_use]
    pub fn data(self) -> u32 {
        ((self.0 & Self::DATA_MASK) >> Self::DATA_SHIFT) as u32
    }

    #[inline]
    pub fn set_flags(&mut self, flags: HeaderFlags) -> &mut Self {
        let f = (flags.bits() as u64) << Self::FLAGS_SHIFT;
        self.0 = (self.0 & !Self::FLAGS_MASK) | f;
        self
    }
}

/// Which collector the frame layer is running under. A moving collector
/// may change object addresses between any two accesses, which forces the
/// shadow reference array to be the source of truth.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollectorKind {
    NonMoving,
    Moving,
}

/// Nullable, non-owning reference to a heap object.
///
/// The pointee is owned by the heap; holders rely on the collector's root
/// visitation to keep the address current.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ObjRef(*mut HeapObject);

// SAFETY: access discipline is single-writer per thread; cross-thread reads
// only happen while the owner is suspended.
unsafe impl Send for ObjRef {}
// SAFETY: see above
unsafe impl Sync for ObjRef {}

impl ObjRef {
    pub const ALIGNMENT: usize = 8;

    #[inline]
    #[must_use]
    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    #[inline]
    #[must_use]
    pub fn from_ptr(ptr: *mut HeapObject) -> Self {
        Self(ptr)
    }

    /// Rebuilds a reference from the low 32 bits of its address, the form
    /// compiled frames store in their 4-byte stack slots.
    #[inline]
    #[must_use]
    pub fn from_compressed(bits: u32) -> Self {
        Self(bits as usize as *mut HeapObject)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *mut HeapObject {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// Low 32 bits of the address, mirrored into the raw register cell
    /// alongside the full-width shadow slot.
    #[inline]
    #[must_use]
    pub fn compressed(self) -> u32 {
        self.addr() as u32
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Checks the to-space invariant on a reference about to be handed to
    /// a mutator: the address is object-aligned and, in debug builds, the
    /// pointee has not been evacuated (no forwarding mark).
    ///
    /// # Panics
    /// When the invariant does not hold.
    #[inline]
    pub fn assert_to_space(self) {
        if self.is_null() {
            return;
        }
        assert!(
            self.addr() % Self::ALIGNMENT == 0,
            "reference {:p} is not object-aligned",
            self.0
        );
        #[cfg(debug_assertions)]
        {
            // SAFETY: non-null references handed to this check point at a
            // live header by the single-writer/suspension discipline.
            let header = unsafe { (*self.0).header };
            assert!(
                !header.flags().contains(HeaderFlags::FORWARD),
                "reference {:p} points at an evacuated object",
                self.0
            );
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.0)
    }
}

impl Default for ObjRef {
    fn default() -> Self {
        Self::null()
    }
}
