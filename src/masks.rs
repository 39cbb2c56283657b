use std::ops::Range;

use candle_core::{Device, Error, Result, Tensor};

use crate::assignment::GroundTruthWithGridPosition;
use crate::decoder::GridPosition;

/// Shape of an output grid split per anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    /// Cells per side.
    pub num_cells: usize,
    /// Prediction slots per cell.
    pub num_anchors: usize,
    /// Values per slot.
    pub box_encoding_size: usize,
}

impl GridShape {
    /// `[num_cells, num_cells, num_anchors, box_encoding_size]`.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (
            self.num_cells,
            self.num_cells,
            self.num_anchors,
            self.box_encoding_size,
        )
    }

    /// Number of values of the grid.
    pub fn elem_count(&self) -> usize {
        self.num_cells * self.num_cells * self.num_anchors * self.box_encoding_size
    }

    /// Flat index of value `i` of the slot at `(row, col, anchor)`.
    pub fn index(&self, row: usize, col: usize, anchor: usize, i: usize) -> usize {
        ((row * self.num_cells + col) * self.num_anchors + anchor) * self.box_encoding_size + i
    }
}

/// The disjoint masks selecting which raw outputs every loss term looks at.
///
/// All masks have the shape `[num_cells, num_cells, num_anchors, box_encoding_size]`
/// and hold ones and zeros.
#[derive(Debug, Clone)]
pub struct LossMasks {
    /// Objectness of slots without an assigned box.
    pub no_object: Tensor,
    /// Objectness of slots with an assigned box.
    pub object: Tensor,
    /// Center offsets (`dx`, `dy`) of assigned slots.
    pub coord_box_offset: Tensor,
    /// Sizes (`dw`, `dh`) of assigned slots.
    pub coord_box_size: Tensor,
    /// Class scores of assigned slots.
    pub ground_truth_class_scores: Tensor,
}

impl LossMasks {
    /// Build the masks for the given assigned boxes.
    pub fn new(
        ground_truth: &[GroundTruthWithGridPosition],
        shape: GridShape,
        device: &Device,
    ) -> Result<Self> {
        let ground_truth_mask = ground_truth_mask(ground_truth, shape, device)?;
        let coord_offset_mask = slot_mask(shape, 0..2, device)?;
        let coord_size_mask = slot_mask(shape, 2..4, device)?;
        let score_mask = slot_mask(shape, 4..5, device)?;
        let class_mask = coord_offset_mask
            .add(&coord_size_mask)?
            .add(&score_mask)?
            .affine(-1., 1.)?;

        Ok(Self {
            no_object: score_mask.mul(&ground_truth_mask.affine(-1., 1.)?)?,
            object: score_mask.mul(&ground_truth_mask)?,
            coord_box_offset: coord_offset_mask.mul(&ground_truth_mask)?,
            coord_box_size: coord_size_mask.mul(&ground_truth_mask)?,
            ground_truth_class_scores: class_mask.mul(&ground_truth_mask)?,
        })
    }
}

/// Ones at every value of the slots an assigned box lives in.
fn ground_truth_mask(
    ground_truth: &[GroundTruthWithGridPosition],
    shape: GridShape,
    device: &Device,
) -> Result<Tensor> {
    let mut mask = vec![0f32; shape.elem_count()];
    for gt in ground_truth {
        let GridPosition { row, col, anchor } = gt.position;
        if row >= shape.num_cells || col >= shape.num_cells || anchor >= shape.num_anchors {
            return Err(Error::Msg(format!(
                "grid position out of range: row {row}, col {col}, anchor {anchor} for {shape:?}"
            )));
        }
        let start = shape.index(row, col, anchor, 0);
        mask[start..start + shape.box_encoding_size].fill(1.);
    }
    Tensor::from_vec(mask, shape.dims(), device)
}

/// Ones at the encoding indices in `range` of every slot.
fn slot_mask(shape: GridShape, range: Range<usize>, device: &Device) -> Result<Tensor> {
    let pattern: Vec<f32> = (0..shape.box_encoding_size)
        .map(|i| if range.contains(&i) { 1. } else { 0. })
        .collect();
    Tensor::from_vec(pattern, (1, 1, 1, shape.box_encoding_size), device)?
        .broadcast_as(shape.dims())?
        .contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;

    fn assigned(row: usize, col: usize, anchor: usize) -> GroundTruthWithGridPosition {
        GroundTruthWithGridPosition {
            bbox: BoundingBox::new(0., 0., 0.25, 0.5),
            label: 0,
            position: GridPosition { row, col, anchor },
        }
    }

    fn values(t: &Tensor) -> Result<Vec<f32>> {
        t.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn test_masks_without_ground_truth() -> Result<()> {
        let shape = GridShape {
            num_cells: 13,
            num_anchors: 1,
            box_encoding_size: 7,
        };
        let masks = LossMasks::new(&[], shape, &Device::Cpu)?;

        for mask in [
            &masks.object,
            &masks.coord_box_offset,
            &masks.coord_box_size,
            &masks.ground_truth_class_scores,
        ] {
            assert_eq!(mask.dims4()?, (13, 13, 1, 7));
            assert_eq!(mask.sum_all()?.to_scalar::<f32>()?, 0.);
        }

        let no_object = values(&masks.no_object)?;
        for (idx, v) in no_object.iter().enumerate() {
            assert_eq!(*v, if idx % 7 == 4 { 1. } else { 0. });
        }
        Ok(())
    }

    #[test]
    fn test_masks_single_anchor() -> Result<()> {
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 1,
            box_encoding_size: 7,
        };
        let masks = LossMasks::new(&[assigned(0, 0, 0)], shape, &Device::Cpu)?;

        let no_object = values(&masks.no_object)?;
        let object = values(&masks.object)?;
        let offset = values(&masks.coord_box_offset)?;
        let size = values(&masks.coord_box_size)?;
        let class = values(&masks.ground_truth_class_scores)?;

        for row in 0..2 {
            for col in 0..2 {
                for i in 0..7 {
                    let idx = shape.index(row, col, 0, i);
                    let is_gt = row == 0 && col == 0;
                    let expect = |hit: bool| if hit { 1. } else { 0. };
                    assert_eq!(no_object[idx], expect(i == 4 && !is_gt));
                    assert_eq!(object[idx], expect(i == 4 && is_gt));
                    assert_eq!(offset[idx], expect(i < 2 && is_gt));
                    assert_eq!(size[idx], expect((i == 2 || i == 3) && is_gt));
                    assert_eq!(class[idx], expect(i >= 5 && is_gt));
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_masks_multiple_anchors() -> Result<()> {
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 3,
            box_encoding_size: 7,
        };
        let masks = LossMasks::new(&[assigned(0, 0, 1)], shape, &Device::Cpu)?;

        let no_object = values(&masks.no_object)?;
        for row in 0..2 {
            for col in 0..2 {
                for anchor in 0..3 {
                    for i in 0..7 {
                        let is_gt = row == 0 && col == 0 && anchor == 1;
                        let expected = if i == 4 && !is_gt { 1. } else { 0. };
                        assert_eq!(no_object[shape.index(row, col, anchor, i)], expected);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_masks_collision() -> Result<()> {
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 1,
            box_encoding_size: 5,
        };
        let masks = LossMasks::new(&[assigned(1, 1, 0), assigned(1, 1, 0)], shape, &Device::Cpu)?;
        assert_eq!(masks.object.sum_all()?.to_scalar::<f32>()?, 1.);
        assert_eq!(masks.ground_truth_class_scores.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }

    #[test]
    fn test_masks_position_out_of_range() {
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 1,
            box_encoding_size: 5,
        };
        for position in [assigned(5, 5, 0), assigned(0, 2, 0), assigned(0, 0, 1)] {
            assert!(LossMasks::new(&[position], shape, &Device::Cpu).is_err());
        }
    }
}
