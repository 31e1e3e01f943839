//! Chunk and block geometry for ND evaluation
//!
//! An array of `shape` is split into chunks of `chunkshape`, and each chunk into
//! blocks of `blockshape`. Chunks and blocks are addressed by C-order linear
//! indices. Evaluation works one block at a time over a buffer of
//! `product(blockshape)` items laid out row-major over the block; items that fall
//! outside the chunk or the array are padding.
//!
//! For shape `[5]`, chunkshape `[4]` and blockshape `[2]`:
//! - chunks per dim: `[2]`, blocks per chunk: `[2]`
//! - chunk 1, block 0 starts at coordinate 4 and holds 1 valid item

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult, EvalError, EvalResult};

/// Shape, chunkshape and blockshape of an ND array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    shape: Vec<u64>,
    chunkshape: Vec<u64>,
    blockshape: Vec<u64>,
}

impl ChunkGeometry {
    pub fn new(shape: &[u64], chunkshape: &[u64], blockshape: &[u64]) -> CompileResult<Self> {
        if shape.is_empty() {
            return Err(CompileError::invalid_arg("ND geometry needs at least one dimension"));
        }
        if chunkshape.len() != shape.len() || blockshape.len() != shape.len() {
            return Err(CompileError::invalid_arg(format!(
                "shape, chunkshape and blockshape ranks differ ({}, {}, {})",
                shape.len(),
                chunkshape.len(),
                blockshape.len()
            )));
        }
        if shape.iter().chain(chunkshape).chain(blockshape).any(|&d| d == 0) {
            return Err(CompileError::invalid_arg("ND extents must be positive"));
        }
        Ok(Self {
            shape: shape.to_vec(),
            chunkshape: chunkshape.to_vec(),
            blockshape: blockshape.to_vec(),
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunkshape(&self) -> &[u64] {
        &self.chunkshape
    }

    pub fn blockshape(&self) -> &[u64] {
        &self.blockshape
    }

    /// `ceil(shape / chunkshape)` per dimension
    pub fn chunks_per_dim(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunkshape)
            .map(|(s, c)| s.div_ceil(*c))
            .collect()
    }

    /// `ceil(chunkshape / blockshape)` per dimension
    pub fn blocks_per_chunk(&self) -> Vec<u64> {
        self.chunkshape
            .iter()
            .zip(&self.blockshape)
            .map(|(c, b)| c.div_ceil(*b))
            .collect()
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks_per_dim().iter().product()
    }

    pub fn block_count(&self) -> u64 {
        self.blocks_per_chunk().iter().product()
    }

    /// Items in one padded block
    pub fn block_items(&self) -> usize {
        self.blockshape.iter().product::<u64>() as usize
    }

    /// Resolve a (chunk, block) pair to the region of the array it covers
    pub fn locate(&self, chunk: u64, block: u64) -> EvalResult<BlockRegion> {
        let chunk_count = self.chunk_count();
        if chunk >= chunk_count {
            return Err(EvalError::ChunkOutOfRange { index: chunk, count: chunk_count });
        }
        let block_count = self.block_count();
        if block >= block_count {
            return Err(EvalError::BlockOutOfRange { index: block, count: block_count });
        }

        let chunk_coords = unravel(chunk, &self.chunks_per_dim());
        let block_coords = unravel(block, &self.blocks_per_chunk());

        let ndim = self.ndim();
        let mut origin = Vec::with_capacity(ndim);
        let mut valid = Vec::with_capacity(ndim);
        for d in 0..ndim {
            let chunk_start = chunk_coords[d] * self.chunkshape[d];
            let chunk_end = (chunk_start + self.chunkshape[d]).min(self.shape[d]);
            let start = chunk_start + block_coords[d] * self.blockshape[d];
            let end = (start + self.blockshape[d]).min(chunk_end);
            origin.push(start);
            valid.push(end.saturating_sub(start));
        }

        Ok(BlockRegion {
            strides: strides(&self.blockshape),
            blockshape: self.blockshape.clone(),
            shape: self.shape.clone(),
            origin,
            valid,
        })
    }

    /// Real (non-padding) items of a block
    pub fn valid_item_count(&self, chunk: u64, block: u64) -> EvalResult<usize> {
        Ok(self.locate(chunk, block)?.valid_items())
    }
}

/// One block placed in the array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRegion {
    blockshape: Vec<u64>,
    strides: Vec<u64>,
    shape: Vec<u64>,
    /// Absolute coordinate of the first block item
    origin: Vec<u64>,
    /// Valid extent along each dimension, starting at `origin`
    valid: Vec<u64>,
}

impl BlockRegion {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn items(&self) -> usize {
        self.blockshape.iter().product::<u64>() as usize
    }

    pub fn valid_items(&self) -> usize {
        self.valid.iter().product::<u64>() as usize
    }

    fn local(&self, item: usize, dim: usize) -> u64 {
        (item as u64 / self.strides[dim]) % self.blockshape[dim]
    }

    /// Whether block item `item` holds real data
    pub fn contains(&self, item: usize) -> bool {
        (0..self.ndim()).all(|d| self.local(item, d) < self.valid[d])
    }

    /// Absolute coordinate of block item `item` along `dim`
    pub fn coord(&self, item: usize, dim: usize) -> u64 {
        self.origin[dim] + self.local(item, dim)
    }

    pub fn extent(&self, dim: usize) -> u64 {
        self.shape[dim]
    }

    pub fn origin(&self) -> &[u64] {
        &self.origin
    }
}

/// Row-major strides of `dims`
fn strides(dims: &[u64]) -> Vec<u64> {
    let mut out = vec![1; dims.len()];
    for d in (0..dims.len().saturating_sub(1)).rev() {
        out[d] = out[d + 1] * dims[d + 1];
    }
    out
}

/// C-order coordinates of `linear` within `dims`
fn unravel(mut linear: u64, dims: &[u64]) -> Vec<u64> {
    let mut coords = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        coords[d] = linear % dims[d];
        linear /= dims[d];
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counts() {
        let geometry = ChunkGeometry::new(&[10, 7], &[4, 7], &[3, 2]).unwrap();
        assert_eq!(geometry.chunks_per_dim(), vec![3, 1]);
        assert_eq!(geometry.blocks_per_chunk(), vec![2, 4]);
        assert_eq!(geometry.chunk_count(), 3);
        assert_eq!(geometry.block_count(), 8);
        assert_eq!(geometry.block_items(), 6);
    }

    #[test]
    fn test_edge_block() {
        let geometry = ChunkGeometry::new(&[5], &[4], &[2]).unwrap();
        let region = geometry.locate(1, 0).unwrap();
        assert_eq!(region.origin(), &[4]);
        assert_eq!(region.valid_items(), 1);
        assert!(region.contains(0));
        assert!(!region.contains(1));
        assert_eq!(geometry.valid_item_count(1, 1).unwrap(), 0);
        assert_eq!(geometry.valid_item_count(0, 1).unwrap(), 2);
    }

    #[test]
    fn test_two_dimensional_coords() {
        // Chunk (1, 0) of a 5x5 array in 3x3 chunks, block (0, 1) of 2x2 blocks
        let geometry = ChunkGeometry::new(&[5, 5], &[3, 3], &[2, 2]).unwrap();
        let region = geometry.locate(2, 1).unwrap();
        assert_eq!(region.origin(), &[3, 2]);
        assert_eq!(region.valid_items(), 2);
        let coords: Vec<_> = (0..4).map(|i| (region.coord(i, 0), region.coord(i, 1))).collect();
        assert_eq!(coords, vec![(3, 2), (3, 3), (4, 2), (4, 3)]);
        let valid: Vec<_> = (0..4).map(|i| region.contains(i)).collect();
        assert_eq!(valid, vec![true, false, true, false]);
    }

    #[test]
    fn test_out_of_range() {
        let geometry = ChunkGeometry::new(&[5], &[4], &[2]).unwrap();
        assert_eq!(
            geometry.locate(2, 0).unwrap_err(),
            EvalError::ChunkOutOfRange { index: 2, count: 2 }
        );
        assert_eq!(
            geometry.locate(0, 2).unwrap_err(),
            EvalError::BlockOutOfRange { index: 2, count: 2 }
        );
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(ChunkGeometry::new(&[], &[], &[]).is_err());
        assert!(ChunkGeometry::new(&[4, 4], &[2], &[1, 1]).is_err());
        assert!(ChunkGeometry::new(&[4], &[0], &[1]).is_err());
    }
}
