use core::{fmt, ops::Range};
use std::sync::Arc;

/// An immutable, reference-counted run of serialized elements.
///
/// A [`Buffer`] is a view into a heap allocation shared via [`Arc`]: cloning
/// is cheap and the bytes are released when the last holder (a chain element
/// or an in-flight frame) is dropped. Once sealed by
/// [`BufferBuilder::detach`] the bytes never change.
///
/// Besides its byte range, a buffer records how many serialized elements
/// *end* inside it. Counting element ends (rather than starts) keeps the
/// chain's cumulative counts meaningful even when a single element's encoding
/// straddles a buffer boundary: the straddling element is only counted once
/// its final byte is present.
///
/// # Examples
///
/// ```
/// use braid::BufferBuilder;
///
/// let mut builder = BufferBuilder::new();
/// builder.put_slice(b"foo");
/// builder.record_element();
///
/// let buffer = builder.detach();
/// assert_eq!(buffer.as_slice(), b"foo");
/// assert_eq!(buffer.elements(), 1);
/// assert!(builder.is_empty());
/// ```
#[derive(Clone)]
pub struct Buffer {
    data: Arc<Vec<u8>>,
    start: usize,
    end: usize,
    elements: usize,
}

impl Buffer {
    /// Wraps an owned byte vector carrying `elements` element ends.
    pub fn from_vec(bytes: Vec<u8>, elements: usize) -> Self {
        let end = bytes.len();
        Self {
            data: Arc::new(bytes),
            start: 0,
            end,
            elements,
        }
    }

    /// Returns the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of serialized elements ending in this buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Returns a byte slice view of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Creates a zero-copy sub-buffer covering `range` of this buffer's
    /// bytes, carrying `elements` element ends.
    ///
    /// Returns `None` if the range is out of bounds. The scatter path uses
    /// this to ship element ranges without copying their bytes.
    pub fn view(&self, range: Range<usize>, elements: usize) -> Option<Buffer> {
        (range.start <= range.end && range.end <= self.len()).then(|| Buffer {
            data: Arc::clone(&self.data),
            start: self.start + range.start,
            end: self.start + range.end,
            elements,
        })
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Buffer {{ len: {}, elements: {}, bytes: {:02x?} }}",
            self.len(),
            self.elements,
            self.as_slice()
        )
    }
}

/// A growable byte region collecting serialized elements.
///
/// The builder owns its allocation exclusively while mutable; sealing it with
/// [`detach`](BufferBuilder::detach) transfers the allocation into an
/// immutable [`Buffer`] and resets the builder, so builder and buffer never
/// share mutable storage. Growth doubles capacity through [`Vec`]; callers
/// that know their sizes ahead can [`reserve`](BufferBuilder::reserve).
#[derive(Debug, Default)]
pub struct BufferBuilder {
    bytes: Vec<u8>,
    elements: usize,
}

impl BufferBuilder {
    /// Creates an empty builder.
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            elements: 0,
        }
    }

    /// Creates an empty builder with at least `capacity` bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            elements: 0,
        }
    }

    /// Reserves room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Appends a run of raw bytes.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Records that one more element's encoding has been completed.
    pub fn record_element(&mut self) {
        self.elements += 1;
    }

    /// Returns the current byte length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if no bytes have been written since the last detach.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the number of elements recorded since the last detach.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Seals the written bytes into an immutable [`Buffer`] and resets the
    /// builder.
    ///
    /// Ownership of the allocation moves to the buffer; afterwards the
    /// builder is empty and holds none of the detached bytes.
    pub fn detach(&mut self) -> Buffer {
        let bytes = core::mem::take(&mut self.bytes);
        let elements = core::mem::take(&mut self.elements);
        Buffer::from_vec(bytes, elements)
    }
}
