use bitvec::{order::Msb0, view::BitView};
use std::fmt;

use crate::*;

/// Operations a binary descriptor type must provide to be clustered into a
/// [`Vocabulary`](crate::Vocabulary).
///
/// Implementors are zero-sized marker types; the vocabulary and database are
/// generic over them.
pub trait DescriptorOps: Send + Sync + 'static {
    /// Concrete descriptor value.
    type Descriptor: Clone + PartialEq + Eq + std::hash::Hash + Send + Sync + fmt::Debug;

    /// Width of the serialized form in bytes.
    const BYTES: usize;

    /// Distance between two descriptors.
    fn distance(a: &Self::Descriptor, b: &Self::Descriptor) -> u32;

    /// Centroid of a non-empty set of descriptors.
    fn mean_value(descriptors: &[&Self::Descriptor]) -> BowResult<Self::Descriptor>;

    /// Fixed-width serialized form, exactly [`Self::BYTES`] long.
    fn to_binary(d: &Self::Descriptor) -> Vec<u8>;

    /// Inverse of [`to_binary`](Self::to_binary).
    fn from_binary(bytes: &[u8]) -> BowResult<Self::Descriptor>;
}

/// 256-bit binary descriptors as produced by ORB or BRIEF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Orb;

impl DescriptorOps for Orb {
    type Descriptor = Desc;

    const BYTES: usize = std::mem::size_of::<Desc>();

    #[inline]
    fn distance(a: &Desc, b: &Desc) -> u32 {
        hamming(a, b)
    }

    fn mean_value(descriptors: &[&Desc]) -> BowResult<Desc> {
        match descriptors {
            [] => Err(BowErr::InvalidInput(
                "mean of an empty descriptor set".to_string(),
            )),
            [single] => Ok(**single),
            _ => Ok(majority(descriptors)),
        }
    }

    fn to_binary(d: &Desc) -> Vec<u8> {
        d.to_vec()
    }

    fn from_binary(bytes: &[u8]) -> BowResult<Desc> {
        desc_from_slice(bytes)
    }
}

/// Hamming distance between two binary arrays (descriptors).
#[inline]
pub fn hamming(x: &Desc, y: &Desc) -> u32 {
    x.iter()
        .zip(y)
        .fold(0, |a, (b, c)| a + (*b ^ *c).count_ones())
}

/// Hamming distance between two raw byte slices, which must both hold one
/// full descriptor.
pub fn hamming_slices(x: &[u8], y: &[u8]) -> BowResult<u32> {
    Ok(hamming(&desc_from_slice(x)?, &desc_from_slice(y)?))
}

/// Copy a byte slice of exactly descriptor width into a [`Desc`].
pub fn desc_from_slice(bytes: &[u8]) -> BowResult<Desc> {
    bytes.try_into().map_err(|_| {
        BowErr::InvalidInput(format!(
            "descriptor must be {} bytes, got {}",
            std::mem::size_of::<Desc>(),
            bytes.len()
        ))
    })
}

/// Bitwise majority vote. A bit is set when at least half of the inputs
/// (rounded up) have it set.
fn majority(descriptors: &[&Desc]) -> Desc {
    let n = descriptors.len();
    let threshold = n / 2 + n % 2;
    let mut counts = [0usize; std::mem::size_of::<Desc>() * 8];
    for d in descriptors {
        for (i, b) in d.view_bits::<Msb0>().iter().enumerate() {
            if *b {
                counts[i] += 1;
            }
        }
    }

    let mut result: Desc = [0; std::mem::size_of::<Desc>()];
    let result_bits = result.view_bits_mut::<Msb0>();
    for (i, &c) in counts.iter().enumerate() {
        if c >= threshold {
            result_bits.set(i, true);
        }
    }
    result
}
