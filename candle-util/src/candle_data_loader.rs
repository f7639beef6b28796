use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::prelude::SliceRandom;
use rayon::prelude::*;
use std::ops::Range;

///
/// A helper `struct` for creating bag-aware minibatch indexes. Each
/// bag is a contiguous range of samples; bags are cut into pieces of
/// `stride` samples and full pieces are packed `bags_per_batch` at a
/// time. Pieces shorter than `stride` each form their own minibatch,
/// placed after all the full ones.
///
pub struct BagMinibatches {
    bags: Vec<Range<usize>>,
    pub chunks: Vec<Vec<usize>>,
}

impl BagMinibatches {
    pub fn new(bags: Vec<Range<usize>>) -> Self {
        Self {
            bags,
            chunks: vec![],
        }
    }

    /// shuffle samples within each bag and the order of full pieces
    pub fn shuffle_minibatch(&mut self, stride: usize, bags_per_batch: usize) {
        let mut rng = rand::rng();

        let mut pieces = vec![];
        let mut irregular = vec![];

        for bag in self.bags.iter() {
            let mut samples: Vec<usize> = bag.clone().collect();
            samples.shuffle(&mut rng);
            for piece in samples.chunks(stride.max(1)) {
                if piece.len() == stride {
                    pieces.push(piece.to_vec());
                } else {
                    irregular.push(piece.to_vec());
                }
            }
        }

        pieces.shuffle(&mut rng);
        self.chunks = pack_pieces(pieces, irregular, bags_per_batch);
    }

    /// keep the sample order as it is
    pub fn sequential_minibatch(&mut self, stride: usize, bags_per_batch: usize) {
        let mut pieces = vec![];
        let mut irregular = vec![];

        for bag in self.bags.iter() {
            let samples: Vec<usize> = bag.clone().collect();
            for piece in samples.chunks(stride.max(1)) {
                if piece.len() == stride {
                    pieces.push(piece.to_vec());
                } else {
                    irregular.push(piece.to_vec());
                }
            }
        }

        self.chunks = pack_pieces(pieces, irregular, bags_per_batch);
    }

    pub fn num_bags(&self) -> usize {
        self.bags.len()
    }

    pub fn size(&self) -> usize {
        self.bags.iter().map(|b| b.len()).sum()
    }
}

fn pack_pieces(
    pieces: Vec<Vec<usize>>,
    irregular: Vec<Vec<usize>>,
    bags_per_batch: usize,
) -> Vec<Vec<usize>> {
    let mut chunks: Vec<Vec<usize>> = pieces
        .chunks(bags_per_batch.max(1))
        .map(|group| group.concat())
        .collect();
    chunks.extend(irregular);
    chunks
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                Tensor::from_iter(row.iter().copied(), &Device::Cpu)?
                    .reshape((1, row.len()))
                    .map(|v| (i, v))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        idx_data.sort_by_key(|(i, _)| *i);
        Ok(idx_data.into_iter().map(|(_, t)| t).collect())
    }
}

/// Concatenate the selected row tensors and move them to the device
pub fn take_rows(
    samples: &[usize],
    data_vec: &[Tensor],
    target_device: &Device,
) -> anyhow::Result<Tensor> {
    if let Some(&bad) = samples.iter().find(|&&i| i >= data_vec.len()) {
        return Err(anyhow::anyhow!(
            "invalid index = {} vs. total # = {}",
            bad,
            data_vec.len()
        ));
    }
    let chunk: Vec<Tensor> = samples.iter().map(|&i| data_vec[i].clone()).collect();
    Ok(Tensor::cat(&chunk, 0)?.to_device(target_device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_pieces_are_packed_before_irregular() {
        // bag 0: 5 samples, bag 1: 4 samples, bag 2: 4 samples
        let mut mb = BagMinibatches::new(vec![0..5, 5..9, 9..13]);
        mb.sequential_minibatch(4, 2);

        assert_eq!(mb.chunks.len(), 3);
        assert_eq!(mb.chunks[0], vec![0, 1, 2, 3, 5, 6, 7, 8]);
        assert_eq!(mb.chunks[1], vec![9, 10, 11, 12]);
        assert_eq!(mb.chunks[2], vec![4]);
        assert_eq!(mb.size(), 13);
    }

    #[test]
    fn shuffled_pieces_stay_within_bags() {
        let bags = vec![0..6, 6..12, 12..18];
        let mut mb = BagMinibatches::new(bags.clone());
        mb.shuffle_minibatch(3, 1);

        assert_eq!(mb.chunks.len(), 6);
        for chunk in mb.chunks.iter() {
            assert_eq!(chunk.len(), 3);
            let owner = bags.iter().position(|b| b.contains(&chunk[0])).unwrap();
            assert!(chunk.iter().all(|i| bags[owner].contains(i)));
        }
        let mut all: Vec<usize> = mb.chunks.concat();
        all.sort();
        assert_eq!(all, (0..18).collect::<Vec<_>>());
    }

    #[test]
    fn rows_round_trip() -> anyhow::Result<()> {
        let mat = DMatrix::<f32>::from_row_slice(3, 2, &[1., 2., 3., 4., 5., 6.]);
        let rows = mat.rows_to_tensor_vec()?;
        let x = take_rows(&[2, 0], &rows, &Device::Cpu)?;
        assert_eq!(x.to_vec2::<f32>()?, vec![vec![5., 6.], vec![1., 2.]]);
        assert!(take_rows(&[3], &rows, &Device::Cpu).is_err());
        Ok(())
    }
}
