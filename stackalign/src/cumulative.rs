//! Folds pairwise affines into one global frame.

use serde::{Deserialize, Serialize};

use crate::affine::AffineMatrix;

/// One section's place in the alignment chain at a single scale level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub index: usize,
    pub reference: Option<usize>,
    pub include: bool,
    pub pairwise: AffineMatrix,
    pub cumulative: AffineMatrix,
}

impl ChainLink {
    pub fn new(index: usize, reference: Option<usize>, include: bool, pairwise: AffineMatrix) -> Self {
        Self {
            index,
            reference,
            include,
            pairwise,
            cumulative: AffineMatrix::identity(),
        }
    }
}

/// `cumulative[i] = compose(pairwise[i], cumulative[reference(i)])`, in index order.
///
/// Excluded links get an identity pairwise affine and inherit their reference's
/// cumulative affine unchanged. Links without a reference start from identity.
///
/// `links[i].index` must equal `i` and every reference must point backwards.
pub fn compose_chain(links: &mut [ChainLink]) {
    for i in 0..links.len() {
        debug_assert_eq!(links[i].index, i);
        let base = match links[i].reference {
            Some(r) => {
                debug_assert!(r < i, "reference {r} of section {i} must precede it");
                links[r].cumulative
            }
            None => AffineMatrix::identity(),
        };

        let link = &mut links[i];
        if link.include {
            link.cumulative = AffineMatrix::compose(&link.pairwise, &base);
        } else {
            link.pairwise = AffineMatrix::identity();
            link.cumulative = base;
        }
    }
}
