//! Fixed capacity FIFO of fixed-size elements.
//!
//! Holds payload snapshots awaiting (re)transmission.  Inserting into a full
//! FIFO fails instead of overwriting - retransmission depends on no element
//! ever being lost.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::{Deque, Vec};

use crate::{Error, Result};

/// FIFO of up to `N` elements of `element_size` bytes, `element_size <= E`.
pub struct Fifo<const N: usize, const E: usize> {
    element_size: usize,
    elements: Deque<Vec<u8, E>, N>,
}

impl<const N: usize, const E: usize> Fifo<N, E> {
    /// Create an empty FIFO.  The element size is fixed for its lifetime.
    pub fn new(element_size: usize) -> Result<Self> {
        if element_size == 0 || element_size > E {
            return Err(Error::BufferTooSmall);
        }
        Ok(Self {
            element_size,
            elements: Deque::new(),
        })
    }

    /// Append a copy of `element`, which must be exactly the element size.
    pub fn insert_element(&mut self, element: &[u8]) -> Result<()> {
        if element.len() != self.element_size {
            return Err(Error::PayloadTooLarge);
        }
        if self.elements.is_full() {
            return Err(Error::FifoFull);
        }
        let copy = Vec::from_slice(element).map_err(|_| Error::PayloadTooLarge)?;
        self.elements
            .push_back(copy)
            .map_err(|_| Error::FifoFull)
    }

    /// Remove the oldest element, copying it into `out`.
    pub fn get_element(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() < self.element_size {
            return Err(Error::BufferTooSmall);
        }
        let element = self.elements.pop_front().ok_or(Error::FifoEmpty)?;
        out[..element.len()].copy_from_slice(&element);
        Ok(())
    }

    /// Oldest element, left in place
    pub fn peek(&self) -> Option<&[u8]> {
        self.elements.front().map(|element| element.as_slice())
    }

    /// Drop the oldest element
    pub fn discard(&mut self) -> Result<()> {
        self.elements.pop_front().map(|_| ()).ok_or(Error::FifoEmpty)
    }

    /// Drop all elements
    pub fn flush(&mut self) {
        self.elements.clear();
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.elements.is_full()
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut fifo: Fifo<3, 4> = Fifo::new(4).unwrap();
        fifo.insert_element(&[1, 1, 1, 1]).unwrap();
        fifo.insert_element(&[2, 2, 2, 2]).unwrap();
        fifo.insert_element(&[3, 3, 3, 3]).unwrap();

        let mut out = [0u8; 4];
        for expected in 1..=3u8 {
            fifo.get_element(&mut out).unwrap();
            assert_eq!(out, [expected; 4]);
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn full_insert_fails_without_mutation() {
        let mut fifo: Fifo<2, 2> = Fifo::new(2).unwrap();
        fifo.insert_element(&[1, 2]).unwrap();
        fifo.insert_element(&[3, 4]).unwrap();
        assert_eq!(fifo.insert_element(&[5, 6]), Err(Error::FifoFull));
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.peek(), Some(&[1u8, 2][..]));

        let mut out = [0u8; 2];
        fifo.get_element(&mut out).unwrap();
        assert_eq!(out, [1, 2]);
        fifo.get_element(&mut out).unwrap();
        assert_eq!(out, [3, 4]);
    }

    #[test]
    fn empty_get_fails_without_mutation() {
        let mut fifo: Fifo<2, 2> = Fifo::new(2).unwrap();
        let mut out = [9u8; 2];
        assert_eq!(fifo.get_element(&mut out), Err(Error::FifoEmpty));
        assert_eq!(out, [9, 9]);
        assert_eq!(fifo.discard(), Err(Error::FifoEmpty));
    }

    #[test]
    fn element_size_is_fixed() {
        let mut fifo: Fifo<2, 8> = Fifo::new(4).unwrap();
        assert_eq!(fifo.insert_element(&[1, 2, 3]), Err(Error::PayloadTooLarge));
        assert!(Fifo::<2, 8>::new(9).is_err());
        fifo.insert_element(&[1, 2, 3, 4]).unwrap();
        fifo.flush();
        assert!(fifo.is_empty());
    }
}
