use std::collections::TryReserveError;

/// A reusable byte buffer whose capacity only ever grows.
///
/// The capacity watermark is the number of addressable bytes. Shrinking is
/// never attempted, so a connection whose payload size jitters between
/// frames settles on its peak size and stops reallocating.
#[derive(Debug, Default)]
pub struct GrowBuffer {
    buf: Vec<u8>,
}

impl GrowBuffer {
    /// Create a buffer with `capacity` addressable bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
        }
    }

    /// Make at least `required` bytes addressable.
    ///
    /// Returns `Ok(true)` if the buffer grew. Requests at or below the current
    /// watermark are no-ops.
    pub fn ensure(&mut self, required: usize) -> Result<bool, TryReserveError> {
        if required <= self.buf.len() {
            return Ok(false);
        }
        self.buf.try_reserve_exact(required - self.buf.len())?;
        self.buf.resize(required, 0);
        Ok(true)
    }

    /// Current capacity watermark.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The first `len` bytes.
    pub fn slice(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    /// The first `len` bytes, mutably.
    pub fn slice_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[..len]
    }

    /// The whole addressable region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn grows_on_demand() {
        let mut buf = GrowBuffer::with_capacity(16);
        assert_eq!(buf.ensure(8), Ok(false));
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.ensure(64), Ok(true));
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.slice(64).len(), 64);
    }

    #[test]
    fn never_shrinks() {
        let mut buf = GrowBuffer::with_capacity(0);
        buf.ensure(4096).unwrap();
        buf.ensure(10).unwrap();
        assert_eq!(buf.capacity(), 4096);
    }

    proptest! {
        #[test]
        fn capacity_is_monotonic(requests in proptest::collection::vec(0usize..100_000, 1..64)) {
            let mut buf = GrowBuffer::default();
            let mut previous = buf.capacity();
            for request in requests {
                buf.ensure(request).unwrap();
                prop_assert!(buf.capacity() >= previous);
                prop_assert!(buf.capacity() >= request);
                previous = buf.capacity();
            }
        }
    }
}
